use std::collections::HashMap;

use crate::latency::AvgsInfo;
use crate::regions::RegionInfo;

pub struct ProcessRecord {
    pub pid: u32,
    pub name: String,
    pub avgs: AvgsInfo,
    pub last_q: Option<u64>,
    pub regions: RegionInfo,
}

pub struct ProcessRegistry {
    procs: Vec<ProcessRecord>,
    by_pid: HashMap<u32, usize>,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        ProcessRegistry {
            procs: Vec::new(),
            by_pid: HashMap::new(),
        }
    }

    // Lookup-or-create. The first name seen for a pid sticks.
    pub fn process_for(&mut self, pid: u32, name: &str) -> usize {
        if let Some(&index) = self.by_pid.get(&pid) {
            return index;
        }
        self.procs.push(ProcessRecord {
            pid,
            name: String::from(name),
            avgs: AvgsInfo::default(),
            last_q: None,
            regions: RegionInfo::default(),
        });
        let index = self.procs.len() - 1;
        self.by_pid.insert(pid, index);
        index
    }

    pub fn find(&self, pid: u32) -> Option<usize> {
        self.by_pid.get(&pid).cloned()
    }

    pub fn get(&self, index: usize) -> &ProcessRecord {
        &self.procs[index]
    }

    pub fn get_mut(&mut self, index: usize) -> &mut ProcessRecord {
        &mut self.procs[index]
    }

    pub fn iter(&self) -> impl Iterator<Item = &ProcessRecord> {
        self.procs.iter()
    }
}
