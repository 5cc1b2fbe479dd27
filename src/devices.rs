use std::collections::{HashMap,BTreeMap};
use std::fs::File;
use std::path::PathBuf;

use crate::config::Config;
use crate::event::{Kind,N_KINDS};
use crate::iostat::Stats;
use crate::latency::AvgsInfo;
use crate::node_pool::{Handle,IoPool};
use crate::regions::RegionInfo;
use crate::seek::SeekInfo;

// Device ids pack the major number into the 12 high bits and the minor into
// the 20 low bits, matching the event format produced by the kernel tracer.
pub const MINOR_BITS: u32 = 20;
pub const MINOR_MASK: u32 = (1 << MINOR_BITS) - 1;

pub fn major(device: u32) -> u32 {
    device >> MINOR_BITS
}

pub fn minor(device: u32) -> u32 {
    device & MINOR_MASK
}

pub fn devno_string(device: u32) -> String {
    format!("{},{}", major(device), minor(device))
}

pub fn parse_devno(text: &str) -> Option<u32> {
    let mut parts = text.splitn(2, |c| c == ',' || c == ':');
    let major: u32 = parts.next()?.trim().parse().ok()?;
    let minor: u32 = parts.next()?.trim().parse().ok()?;
    if major >= (1 << 12) || minor > MINOR_MASK {
        return None;
    }
    Some((major << MINOR_BITS) | minor)
}

pub struct DeviceRecord {
    pub device: u32,
    // One in-flight index per event kind, keyed by starting sector. The
    // indices hold handles; the node pool owns the nodes.
    pub heads: Vec<BTreeMap<u64, Handle>>,
    pub avgs: AvgsInfo,
    pub stats: Stats,
    pub all_stats: Stats,
    pub regions: RegionInfo,
    pub last_q: Option<u64>,
    pub n_ds: u64,
    pub seek: SeekInfo,
    pub q2c_ofp: Option<File>,
    pub d2c_ofp: Option<File>,
}

fn open_latency_sink(prefix: &PathBuf, device: u32, which: &str) -> Result<File, String> {
    let path = format!("{}_{}_{}.dat", prefix.display(), devno_string(device), which);
    match File::create(&path) {
        Ok(file) => Ok(file),
        Err(_) => Err(format!("Could not create latency output file '{}'", path)),
    }
}

impl DeviceRecord {
    fn new(device: u32, now: u64, config: &Config) -> Result<Self, String> {
        let (q2c_ofp, d2c_ofp) = match (&config.output, config.dump_level >= 2) {
            (Some(prefix), true) => (
                Some(open_latency_sink(prefix, device, "q2c")?),
                Some(open_latency_sink(prefix, device, "d2c")?),
            ),
            _ => (None, None),
        };
        Ok(DeviceRecord {
            device,
            heads: vec![BTreeMap::new(); N_KINDS],
            avgs: AvgsInfo::default(),
            stats: Stats::new(now),
            all_stats: Stats::new(now),
            regions: RegionInfo::default(),
            last_q: None,
            n_ds: 0,
            seek: SeekInfo::default(),
            q2c_ofp,
            d2c_ofp,
        })
    }

    pub fn insert(&mut self, kind: Kind, sector: u64, handle: Handle) -> Option<Handle> {
        self.heads[kind.index()].insert(sector, handle)
    }

    // Remove the index reference, but only if it still points at this node.
    pub fn erase(&mut self, kind: Kind, sector: u64, handle: Handle) {
        let head = &mut self.heads[kind.index()];
        if head.get(&sector) == Some(&handle) {
            head.remove(&sector);
        }
    }

    pub fn find_exact(&self, kind: Kind, sector: u64) -> Option<Handle> {
        self.heads[kind.index()].get(&sector).cloned()
    }

    // The in-flight node whose range fully contains [start, end), oldest
    // timestamp first among several candidates.
    pub fn find_containing(&self, kind: Kind, start: u64, end: u64, pool: &IoPool) -> Option<Handle> {
        let mut best: Option<Handle> = None;
        for (_, &handle) in self.heads[kind.index()].range(..=start) {
            let node = pool.node(handle);
            if node.end_sector() < end {
                continue;
            }
            match best {
                Some(so_far) if pool.node(so_far).time <= node.time => {},
                _ => {
                    best = Some(handle);
                },
            }
        }
        best
    }

    // The in-flight node whose range ends exactly at `sector`.
    pub fn find_ending_at(&self, kind: Kind, sector: u64, pool: &IoPool) -> Option<Handle> {
        for (_, &handle) in self.heads[kind.index()].range(..sector).rev() {
            if pool.node(handle).end_sector() == sector {
                return Some(handle);
            }
        }
        None
    }

    pub fn in_flight(&self) -> usize {
        self.heads.iter().map(|head| head.len()).sum()
    }

    // Window and cumulative stats move together.
    pub fn stat_queue(&mut self, delta: i64, now: u64) {
        self.stats.queue_change(delta, now);
        self.all_stats.queue_change(delta, now);
    }

    pub fn stat_merge(&mut self, rw: usize, now: u64) {
        self.stats.rqm[rw] += 1;
        self.all_stats.rqm[rw] += 1;
        self.stat_queue(-1, now);
    }

    pub fn stat_issue(&mut self, rw: usize, blocks: u64, now: u64) {
        self.stats.ios[rw] += 1;
        self.stats.sec[rw] += blocks;
        self.all_stats.ios[rw] += 1;
        self.all_stats.sec[rw] += blocks;
        self.stats.queue_change(-1, now);
        self.all_stats.queue_change(-1, now);
        self.stats.device_change(1, now);
        self.all_stats.device_change(1, now);
    }

    pub fn stat_unissue(&mut self, rw: usize, blocks: u64, now: u64) {
        self.stats.ios[rw] = self.stats.ios[rw].saturating_sub(1);
        self.stats.sec[rw] = self.stats.sec[rw].saturating_sub(blocks);
        self.all_stats.ios[rw] = self.all_stats.ios[rw].saturating_sub(1);
        self.all_stats.sec[rw] = self.all_stats.sec[rw].saturating_sub(blocks);
        self.stats.queue_change(1, now);
        self.all_stats.queue_change(1, now);
        self.stats.device_change(-1, now);
        self.all_stats.device_change(-1, now);
    }

    pub fn stat_complete(&mut self, wait: u64, svctm: u64, now: u64) {
        self.stats.wait += wait;
        self.stats.svctm += svctm;
        self.all_stats.wait += wait;
        self.all_stats.svctm += svctm;
        self.stats.device_change(-1, now);
        self.all_stats.device_change(-1, now);
    }
}

pub struct DeviceRegistry {
    devices: Vec<DeviceRecord>,
    by_id: HashMap<u32, usize>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        DeviceRegistry {
            devices: Vec::new(),
            by_id: HashMap::new(),
        }
    }

    // Lookup-or-create; creation opens the per-device latency sinks.
    pub fn device_for(&mut self, device: u32, now: u64, config: &Config) -> Result<usize, String> {
        if let Some(&index) = self.by_id.get(&device) {
            return Ok(index);
        }
        let record = DeviceRecord::new(device, now, config)?;
        self.devices.push(record);
        let index = self.devices.len() - 1;
        self.by_id.insert(device, index);
        Ok(index)
    }

    pub fn find(&self, device: u32) -> Option<usize> {
        self.by_id.get(&device).cloned()
    }

    pub fn get(&self, index: usize) -> &DeviceRecord {
        &self.devices[index]
    }

    pub fn get_mut(&mut self, index: usize) -> &mut DeviceRecord {
        &mut self.devices[index]
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    // Insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &DeviceRecord> {
        self.devices.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut DeviceRecord> {
        self.devices.iter_mut()
    }
}
