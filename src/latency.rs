use std::fs::File;
use std::io::Write;

use crate::WarnIfErr;

// Running min/max/total over nanosecond samples.
#[derive(Default,Clone)]
pub struct AvgInfo {
    pub min: u64,
    pub max: u64,
    pub total: u64,
    pub n: u64,
}

impl AvgInfo {
    pub fn add(&mut self, value: u64) {
        if self.n == 0 || value < self.min {
            self.min = value;
        }
        if value > self.max {
            self.max = value;
        }
        self.total += value;
        self.n += 1;
    }

    pub fn avg(&self) -> f64 {
        if self.n == 0 {
            0.0
        } else {
            self.total as f64 / self.n as f64
        }
    }
}

#[derive(Default,Clone)]
pub struct AvgsInfo {
    pub q2q: AvgInfo,
    pub q2a: AvgInfo, /* Q to (A or X) */
    pub q2i: AvgInfo, /* Q to (I or M) */
    pub i2d: AvgInfo,
    pub d2c: AvgInfo,
    pub q2c: AvgInfo,
    pub blks: AvgInfo, /* blocks transferred per graph */
}

// One line per sample on the per-device latency streams.
pub fn write_latency(ofp: &mut File, time_ns: u64, latency_ns: u64) {
    writeln!(ofp, "{:.9} {:.9}", time_ns as f64 / 1e9, latency_ns as f64 / 1e9).warn_if_err();
}
