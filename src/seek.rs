use std::collections::HashMap;

// Per-device seek observer: signed distance from the end of the previous
// issued request to the start of the next one.
#[derive(Default)]
pub struct SeekInfo {
    last_end: Option<u64>,
    seeks: Vec<i64>,
}

impl SeekInfo {
    pub fn add(&mut self, sector: u64, blocks: u64) {
        if let Some(last_end) = self.last_end {
            self.seeks.push(sector as i64 - last_end as i64);
        }
        self.last_end = Some(sector + blocks);
    }

    pub fn nseeks(&self) -> u64 {
        self.seeks.len() as u64
    }

    pub fn mean(&self) -> f64 {
        if self.seeks.is_empty() {
            return 0.0;
        }
        let total: u64 = self.seeks.iter().map(|s| s.abs() as u64).sum();
        total as f64 / self.seeks.len() as f64
    }

    pub fn median(&self) -> i64 {
        if self.seeks.is_empty() {
            return 0;
        }
        let mut sorted = self.seeks.clone();
        sorted.sort();
        sorted[sorted.len() / 2]
    }

    // Most frequent distance(s) and how often they occurred.
    pub fn modes(&self) -> (Vec<i64>, u64) {
        let mut counts: HashMap<i64, u64> = HashMap::new();
        for seek in &self.seeks {
            *counts.entry(*seek).or_insert(0) += 1;
        }
        let best = counts.values().cloned().max().unwrap_or(0);
        let mut modes: Vec<i64> = counts
            .into_iter()
            .filter(|(_, n)| *n == best)
            .map(|(seek, _)| seek)
            .collect();
        modes.sort();
        (modes, best)
    }
}
