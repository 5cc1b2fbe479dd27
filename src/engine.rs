use std::fs::File;
use std::io::Write;
use std::path::PathBuf;

use log::debug;

use crate::config::Config;
use crate::devices::DeviceRegistry;
use crate::event::{Kind,Record};
use crate::latency::{AvgInfo,AvgsInfo};
use crate::node_pool::{Handle,IoPool};
use crate::processes::ProcessRegistry;
use crate::regions::RegionInfo;

// Correlation errors are never fatal: orphan events are routine in real
// streams, so everything below the decoder reports through counters.
#[derive(Default)]
pub struct Counters {
    pub unknown_actions: u64,
    pub skipped_device: u64,
    pub skipped_exe: u64,
    pub links: u64,
    pub remaps: u64,
    pub self_remaps: u64,
    pub remaps_unmatched: u64,
    pub splits: u64,
    pub splits_unmatched: u64,
    pub merges: u64,
    pub merges_unmatched: u64,
    pub inserts_unmatched: u64,
    pub issues_unmatched: u64,
    pub requeues: u64,
    pub requeues_unmatched: u64,
    pub retries_held: u64,
    pub retries_matched: u64,
    pub retries_abandoned: u64,
    pub index_collisions: u64,
    pub stale_released: u64,
    pub negative_deltas: u64,
    pub overcompletions: u64,
    pub completed: u64,
    pub unresolved: u64,
}

// Latency segments of a graph, named by their endpoints.
#[derive(Copy,Clone)]
pub enum Seg {
    Q2A,
    Q2I,
    I2D,
    D2C,
    Q2C,
    Blks,
}

fn pick(avgs: &mut AvgsInfo, seg: Seg) -> &mut AvgInfo {
    match seg {
        Seg::Q2A => &mut avgs.q2a,
        Seg::Q2I => &mut avgs.q2i,
        Seg::I2D => &mut avgs.i2d,
        Seg::D2C => &mut avgs.d2c,
        Seg::Q2C => &mut avgs.q2c,
        Seg::Blks => &mut avgs.blks,
    }
}

// Timestamp difference, clamped at zero. Streams occasionally deliver a
// child stamped earlier than its parent.
pub(crate) fn delta(counters: &mut Counters, from: u64, to: u64) -> u64 {
    if to < from {
        counters.negative_deltas += 1;
        0
    } else {
        to - from
    }
}

pub struct Engine<'c> {
    pub config: &'c Config,
    pub pool: IoPool,
    pub devs: DeviceRegistry,
    pub procs: ProcessRegistry,
    pub retries: Vec<Handle>,
    pub all_avgs: AvgsInfo,
    pub all_regions: RegionInfo,
    pub counters: Counters,
    pub n_traces: u64,
    pub genesis: Option<u64>,
    pub last_stamp: u64,
    pub last_q: Option<u64>,
    pub iostat_last_stamp: u64,
    pub device_filter: Option<Vec<u32>>,
    pub iostat_ofp: Option<Box<dyn Write>>,
    pub per_io_ofp: Option<Box<dyn Write>>,
}

fn open_text_sink(prefix: &Option<PathBuf>, which: &str) -> Result<Box<dyn Write>, String> {
    match prefix {
        Some(prefix) => {
            let path = format!("{}.{}", prefix.display(), which);
            match File::create(&path) {
                Ok(file) => Ok(Box::new(file)),
                Err(_) => Err(format!("Could not create output file '{}'", path)),
            }
        },
        None => Ok(Box::new(std::io::stdout())),
    }
}

impl<'c> Engine<'c> {
    pub fn new(config: &'c Config) -> Result<Self, String> {
        let device_filter = match &config.devices {
            Some(list) => {
                let mut ids = Vec::new();
                for text in list {
                    match crate::devices::parse_devno(text) {
                        Some(id) => ids.push(id),
                        None => {
                            return Err(format!("Invalid device filter entry '{}'", text));
                        },
                    }
                }
                Some(ids)
            },
            None => None,
        };
        let iostat_ofp = if config.iostat_interval > 0 {
            Some(open_text_sink(&config.output, "iostat")?)
        } else {
            None
        };
        let per_io_ofp = if config.verbose {
            Some(open_text_sink(&config.output, "per_io")?)
        } else {
            None
        };
        Ok(Engine {
            config,
            pool: IoPool::new(),
            devs: DeviceRegistry::new(),
            procs: ProcessRegistry::new(),
            retries: Vec::new(),
            all_avgs: AvgsInfo::default(),
            all_regions: RegionInfo::default(),
            counters: Counters::default(),
            n_traces: 0,
            genesis: None,
            last_stamp: 0,
            last_q: None,
            iostat_last_stamp: 0,
            device_filter,
            iostat_ofp,
            per_io_ofp,
        })
    }

    // Every observable side-effect of one record completes before the next
    // record is ingested; the stream's order is trusted.
    pub fn add_trace(&mut self, record: Record) -> Result<(), String> {
        let kind = match record.kind() {
            Some(kind) => kind,
            None => {
                self.counters.unknown_actions += 1;
                return Ok(());
            },
        };
        if self.genesis.is_none() {
            self.genesis = Some(record.time);
            self.iostat_last_stamp = record.time;
        }
        self.n_traces += 1;
        self.last_stamp = record.time;
        if let Some(filter) = &self.device_filter {
            if !filter.contains(&record.device) {
                self.counters.skipped_device += 1;
                return Ok(());
            }
        }
        self.iostat_check_time(record.time);
        match kind {
            Kind::Q => self.trace_queue(&record)?,
            Kind::X => self.trace_split(&record),
            Kind::A => self.trace_remap(&record),
            Kind::L => self.counters.links += 1,
            Kind::M => self.trace_merge(&record),
            Kind::I => self.trace_insert(&record),
            Kind::D => self.trace_issue(&record),
            Kind::C => self.trace_complete(&record)?,
            Kind::R => self.trace_requeue(&record),
        }
        Ok(())
    }

    // Q: a fresh root.
    fn trace_queue(&mut self, record: &Record) -> Result<(), String> {
        if let Some(exes) = &self.config.exes {
            if !exes.iter().any(|name| name == &record.comm) {
                self.counters.skipped_exe += 1;
                return Ok(());
            }
        }
        let dev_index = self.devs.device_for(record.device, record.time, self.config)?;
        if let Some(last) = self.last_q {
            let value = delta(&mut self.counters, last, record.time);
            self.all_avgs.q2q.add(value);
        }
        self.last_q = Some(record.time);
        {
            let dip = self.devs.get_mut(dev_index);
            if let Some(last) = dip.last_q {
                let value = delta(&mut self.counters, last, record.time);
                dip.avgs.q2q.add(value);
            }
            dip.last_q = Some(record.time);
            dip.regions.update_queue(record.time, self.config.range_delta);
            dip.stat_queue(1, record.time);
        }
        let proc_index = self.procs.process_for(record.pid, &record.comm);
        {
            let pip = self.procs.get_mut(proc_index);
            if let Some(last) = pip.last_q {
                let value = delta(&mut self.counters, last, record.time);
                pip.avgs.q2q.add(value);
            }
            pip.last_q = Some(record.time);
            pip.regions.update_queue(record.time, self.config.range_delta);
        }
        self.all_regions.update_queue(record.time, self.config.range_delta);
        let handle = self.pool.acquire(Kind::Q, record);
        self.install(dev_index, Kind::Q, record.sector, handle);
        Ok(())
    }

    // A: source-side linkage is best-effort. The target-side Q arrives as
    // its own record and is always an independent root.
    fn trace_remap(&mut self, record: &Record) {
        let dev_index = match self.devs.find(record.device) {
            Some(index) => index,
            None => {
                self.counters.remaps_unmatched += 1;
                return;
            },
        };
        let q = match self.devs.get(dev_index).find_exact(Kind::Q, record.sector) {
            Some(q) => q,
            None => {
                self.counters.remaps_unmatched += 1;
                debug!("remap at {}:{} has no source queue", record.device, record.sector);
                return;
            },
        };
        let (q_time, q_pid) = {
            let node = self.pool.node(q);
            (node.time, node.pid)
        };
        let value = delta(&mut self.counters, q_time, record.time);
        self.add_segment(dev_index, q_pid, Seg::Q2A, value);
        self.counters.remaps += 1;
        let a = self.pool.acquire(Kind::A, record);
        if let Some((target_device, _)) = record.remap_target() {
            if target_device == record.device {
                self.pool.node_mut(a).self_remap = true;
                self.counters.self_remaps += 1;
            }
        }
        self.attach(q, a);
        self.install(dev_index, Kind::A, record.sector, a);
        self.release_graph(q);
    }

    // X: the record's sector is the split point inside the original Q. The
    // two half Qs arrive as fresh roots.
    fn trace_split(&mut self, record: &Record) {
        let dev_index = match self.devs.find(record.device) {
            Some(index) => index,
            None => {
                self.counters.splits_unmatched += 1;
                return;
            },
        };
        let q = {
            let dip = self.devs.get(dev_index);
            dip.find_exact(Kind::Q, record.sector)
                .or_else(|| dip.find_containing(Kind::Q, record.sector, record.sector + 1, &self.pool))
        };
        let q = match q {
            Some(q) => q,
            None => {
                self.counters.splits_unmatched += 1;
                return;
            },
        };
        let (q_time, q_pid) = {
            let node = self.pool.node(q);
            (node.time, node.pid)
        };
        let value = delta(&mut self.counters, q_time, record.time);
        self.add_segment(dev_index, q_pid, Seg::Q2A, value);
        self.counters.splits += 1;
        let x = self.pool.acquire(Kind::X, record);
        self.attach(q, x);
        self.install(dev_index, Kind::X, record.sector, x);
        self.release_graph(q);
    }

    // M: this record's own Q merges into an adjacent request and inherits
    // its pipeline position. The surviving root absorbs the bytes.
    fn trace_merge(&mut self, record: &Record) {
        let dev_index = match self.devs.find(record.device) {
            Some(index) => index,
            None => {
                self.counters.merges_unmatched += 1;
                return;
            },
        };
        let q_m = match self.devs.get(dev_index).find_exact(Kind::Q, record.sector) {
            Some(q_m) => q_m,
            None => {
                self.counters.merges_unmatched += 1;
                return;
            },
        };
        let (m_start, m_end, rw) = {
            let node = self.pool.node(q_m);
            (node.sector, node.end_sector(), node.write as usize)
        };
        let target = {
            let dip = self.devs.get(dev_index);
            dip.find_ending_at(Kind::I, m_start, &self.pool)
                .or_else(|| dip.find_ending_at(Kind::Q, m_start, &self.pool))
                .or_else(|| dip.find_exact(Kind::I, m_end))
                .or_else(|| dip.find_exact(Kind::Q, m_end))
        };
        let target = match target {
            Some(target) if target != q_m => target,
            _ => {
                self.counters.merges_unmatched += 1;
                return;
            },
        };
        self.counters.merges += 1;
        self.devs.get_mut(dev_index).stat_merge(rw, record.time);
        self.devs.get_mut(dev_index).erase(Kind::Q, m_start, q_m);
        self.pool.node_mut(q_m).linked = false;
        let m = self.pool.acquire(Kind::M, record);
        self.attach(target, q_m);
        self.attach(q_m, m);
        self.install(dev_index, Kind::M, record.sector, m);
        let root = self.root_of(target);
        let q_bytes = self.pool.node(q_m).bytes;
        let root_node = self.pool.node_mut(root);
        root_node.bytes_left += q_bytes;
        root_node.bytes_total += q_bytes;
    }

    fn trace_insert(&mut self, record: &Record) {
        let dev_index = match self.devs.find(record.device) {
            Some(index) => index,
            None => {
                self.counters.inserts_unmatched += 1;
                return;
            },
        };
        let q = match self.devs.get(dev_index).find_exact(Kind::Q, record.sector) {
            Some(q) => q,
            None => {
                self.counters.inserts_unmatched += 1;
                debug!("insert at {}:{} has no queue", record.device, record.sector);
                return;
            },
        };
        let i = self.pool.acquire(Kind::I, record);
        self.attach(q, i);
        self.install(dev_index, Kind::I, record.sector, i);
    }

    fn trace_issue(&mut self, record: &Record) {
        let dev_index = match self.devs.find(record.device) {
            Some(index) => index,
            None => {
                self.counters.issues_unmatched += 1;
                return;
            },
        };
        let i = match self.devs.get(dev_index).find_exact(Kind::I, record.sector) {
            Some(i) => i,
            None => {
                self.counters.issues_unmatched += 1;
                return;
            },
        };
        let d = self.pool.acquire(Kind::D, record);
        self.attach(i, d);
        self.install(dev_index, Kind::D, record.sector, d);
        {
            let dip = self.devs.get_mut(dev_index);
            dip.n_ds += 1;
            dip.stat_issue(record.is_write() as usize, record.blocks(), record.time);
        }
        // A newly issued request may satisfy held completions.
        self.drain_retries();
    }

    // R: the issue is taken back; the next D re-attaches to the insert.
    fn trace_requeue(&mut self, record: &Record) {
        let dev_index = match self.devs.find(record.device) {
            Some(index) => index,
            None => {
                self.counters.requeues_unmatched += 1;
                return;
            },
        };
        let d = match self.devs.get(dev_index).find_exact(Kind::D, record.sector) {
            Some(d) => d,
            None => {
                self.counters.requeues_unmatched += 1;
                return;
            },
        };
        self.counters.requeues += 1;
        if let Some(i) = self.pool.node(d).up {
            self.pool.node_mut(i).down.retain(|&child| child != d);
            self.pool.node_mut(d).up = None;
        }
        let (rw, blocks) = {
            let node = self.pool.node(d);
            (node.write as usize, node.blocks())
        };
        self.devs.get_mut(dev_index).stat_unissue(rw, blocks, record.time);
        self.release_graph(d);
    }

    pub(crate) fn attach(&mut self, parent: Handle, child: Handle) {
        self.pool.node_mut(child).up = Some(parent);
        self.pool.node_mut(parent).down.push(child);
    }

    // Install a node in its device's kind index. At most one node may hold
    // a (kind, sector) slot; a displaced incumbent stays owned by its graph
    // unless it was a childless root, which is released as stale.
    fn install(&mut self, dev_index: usize, kind: Kind, sector: u64, handle: Handle) {
        let displaced = self.devs.get_mut(dev_index).insert(kind, sector, handle);
        self.pool.node_mut(handle).linked = true;
        if let Some(old) = displaced {
            self.counters.index_collisions += 1;
            self.pool.node_mut(old).linked = false;
            let stale = {
                let node = self.pool.node(old);
                node.up.is_none() && node.down.is_empty()
            };
            if stale {
                self.counters.stale_released += 1;
                self.pool.release(old);
            }
        }
    }

    pub(crate) fn root_of(&self, handle: Handle) -> Handle {
        let mut current = handle;
        while let Some(up) = self.pool.node(current).up {
            current = up;
        }
        current
    }

    pub(crate) fn collect_graph(&self, top: Handle) -> Vec<Handle> {
        let mut nodes = Vec::new();
        let mut stack = vec![top];
        while let Some(handle) = stack.pop() {
            nodes.push(handle);
            stack.extend(self.pool.node(handle).down.iter().cloned());
        }
        nodes
    }

    pub(crate) fn add_segment(&mut self, dev_index: usize, pid: u32, seg: Seg, value: u64) {
        pick(&mut self.all_avgs, seg).add(value);
        pick(&mut self.devs.get_mut(dev_index).avgs, seg).add(value);
        if let Some(proc_index) = self.procs.find(pid) {
            pick(&mut self.procs.get_mut(proc_index).avgs, seg).add(value);
        }
    }

    // The interval sampler is a check on every ingest: emit a window for
    // each whole interval the stream time has stepped over.
    fn iostat_check_time(&mut self, stamp: u64) {
        if self.config.iostat_interval == 0 || self.iostat_ofp.is_none() {
            return;
        }
        while stamp >= self.iostat_last_stamp + self.config.iostat_interval {
            let boundary = self.iostat_last_stamp + self.config.iostat_interval;
            self.iostat_dump(boundary, false);
            self.iostat_last_stamp = boundary;
        }
    }

    pub(crate) fn iostat_dump(&mut self, stamp: u64, all: bool) {
        let interval_ns = if all {
            stamp.saturating_sub(self.genesis.unwrap_or(stamp))
        } else {
            self.config.iostat_interval
        };
        if interval_ns == 0 {
            return;
        }
        let genesis = self.genesis.unwrap_or(0);
        let ofp = match self.iostat_ofp.as_mut() {
            Some(ofp) => ofp,
            None => return,
        };
        crate::iostat::dump_header(ofp, stamp.saturating_sub(genesis) as f64 / 1e9, all);
        for dip in self.devs.iter_mut() {
            let name = crate::devices::devno_string(dip.device);
            if all {
                dip.all_stats.close_window(stamp);
                crate::iostat::dump_line(ofp, &name, &dip.all_stats, interval_ns);
            } else {
                dip.stats.close_window(stamp);
                crate::iostat::dump_line(ofp, &name, &dip.stats, interval_ns);
                dip.stats.reset_window(stamp);
            }
        }
    }
}
