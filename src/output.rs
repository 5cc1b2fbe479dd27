use std::fs::File;
use std::io::Write;
use std::path::PathBuf;

use chrono::Local;

use crate::devices;
use crate::devmap::DevMap;
use crate::engine::{Counters,Engine};
use crate::latency::{AvgInfo,AvgsInfo};
use crate::regions::RegionInfo;

fn to_sec(ns: f64) -> f64 {
    ns / 1e9
}

fn write_report(prefix: &Option<PathBuf>, which: &str, text: &str) -> Result<(), String> {
    match prefix {
        Some(prefix) => {
            let path = format!("{}.{}", prefix.display(), which);
            let mut file = match File::create(&path) {
                Ok(file) => file,
                Err(_) => {
                    return Err(format!("Could not create report file '{}'", path));
                },
            };
            if let Err(_) = file.write_all(text.as_bytes()) {
                return Err(format!("Could not write report file '{}'", path));
            }
            Ok(())
        },
        None => {
            print!("{}", text);
            Ok(())
        },
    }
}

fn avg_row(text: &mut String, label: &str, info: &AvgInfo) {
    if info.n == 0 {
        text.push_str(&format!("{:>7}: n={}\n", label, 0));
        return;
    }
    text.push_str(&format!(
        "{:>7}: n={:<9} avg={:<13.9} min={:<13.9} max={:<13.9}\n",
        label,
        info.n,
        to_sec(info.avg()),
        to_sec(info.min as f64),
        to_sec(info.max as f64)
    ));
}

fn blks_row(text: &mut String, info: &AvgInfo) {
    if info.n == 0 {
        return;
    }
    text.push_str(&format!(
        "{:>7}: n={:<9} avg={:<13.1} min={:<13} max={:<13} total={}\n",
        "Blocks", info.n, info.avg(), info.min, info.max, info.total
    ));
}

fn avgs_section(text: &mut String, title: &str, avgs: &AvgsInfo) {
    text.push_str(&format!("\n==================== {} ====================\n", title));
    avg_row(text, "Q2Q", &avgs.q2q);
    avg_row(text, "Q2A", &avgs.q2a);
    avg_row(text, "Q2I", &avgs.q2i);
    avg_row(text, "I2D", &avgs.i2d);
    avg_row(text, "D2C", &avgs.d2c);
    avg_row(text, "Q2C", &avgs.q2c);
    blks_row(text, &avgs.blks);
}

fn counters_section(text: &mut String, counters: &Counters) {
    text.push_str("\n==================== Diagnostics ====================\n");
    let rows: [(&str, u64); 24] = [
        ("unknown actions", counters.unknown_actions),
        ("skipped (device filter)", counters.skipped_device),
        ("skipped (exe filter)", counters.skipped_exe),
        ("link markers", counters.links),
        ("remaps", counters.remaps),
        ("self remaps", counters.self_remaps),
        ("remaps without a queue", counters.remaps_unmatched),
        ("splits", counters.splits),
        ("splits without a queue", counters.splits_unmatched),
        ("merges", counters.merges),
        ("merges without a target", counters.merges_unmatched),
        ("inserts without a queue", counters.inserts_unmatched),
        ("issues without an insert", counters.issues_unmatched),
        ("requeues", counters.requeues),
        ("requeues without an issue", counters.requeues_unmatched),
        ("completions held for retry", counters.retries_held),
        ("retries matched", counters.retries_matched),
        ("retries abandoned", counters.retries_abandoned),
        ("index collisions", counters.index_collisions),
        ("stale queues released", counters.stale_released),
        ("negative deltas clamped", counters.negative_deltas),
        ("overwide completions", counters.overcompletions),
        ("completed graphs", counters.completed),
        ("unresolved graphs", counters.unresolved),
    ];
    for (label, value) in rows.iter() {
        if *value > 0 {
            text.push_str(&format!("{:>28}: {}\n", label, value));
        }
    }
}

pub fn device_header(device: u32, devmap: Option<&DevMap>) -> String {
    let devno = devices::devno_string(device);
    match devmap.and_then(|map| map.find(device)) {
        Some(name) => format!("{} ({})", devno, name),
        None => devno,
    }
}

pub fn output_avgs(engine: &Engine, devmap: Option<&DevMap>) -> Result<(), String> {
    let mut text = String::new();
    text.push_str(&format!(
        "{} v{} ({} traces, generated {})\n",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION"),
        engine.n_traces,
        Local::now().format("%Y-%m-%d %H:%M:%S")
    ));
    avgs_section(&mut text, "All Devices", &engine.all_avgs);
    for dip in engine.devs.iter() {
        avgs_section(
            &mut text,
            &format!("Device {}", device_header(dip.device, devmap)),
            &dip.avgs,
        );
    }
    for pip in engine.procs.iter() {
        avgs_section(&mut text, &format!("Process {} ({})", pip.pid, pip.name), &pip.avgs);
    }
    counters_section(&mut text, &engine.counters);
    write_report(&engine.config.output, "avg", &text)
}

fn ranges_section(text: &mut String, title: &str, regions: &RegionInfo, genesis: u64) {
    if regions.qranges.is_empty() && regions.cranges.is_empty() {
        return;
    }
    text.push_str(&format!("\n{}\n", title));
    for &(label, list) in [("queued", &regions.qranges), ("completed", &regions.cranges)].iter() {
        for range in list.iter() {
            text.push_str(&format!(
                "  {:>9} {:15.9} {:15.9}\n",
                label,
                to_sec(range.start.saturating_sub(genesis) as f64),
                to_sec(range.end.saturating_sub(genesis) as f64)
            ));
        }
    }
}

pub fn output_ranges(engine: &Engine, devmap: Option<&DevMap>) -> Result<(), String> {
    let genesis = engine.genesis.unwrap_or(0);
    let mut text = String::new();
    text.push_str("# Active ranges (seconds from the first trace)\n");
    ranges_section(&mut text, "All Devices", &engine.all_regions, genesis);
    for dip in engine.devs.iter() {
        ranges_section(
            &mut text,
            &format!("Device {}", device_header(dip.device, devmap)),
            &dip.regions,
            genesis,
        );
    }
    for pip in engine.procs.iter() {
        ranges_section(
            &mut text,
            &format!("Process {} ({})", pip.pid, pip.name),
            &pip.regions,
            genesis,
        );
    }
    write_report(&engine.config.output, "ranges", &text)
}

pub fn output_seek(engine: &Engine, devmap: Option<&DevMap>) -> Result<(), String> {
    let mut text = String::new();
    text.push_str(&format!(
        "{:<24} {:>10} {:>14} {:>12} {:>10} {:>8}\n",
        "Device", "seeks", "mean", "median", "mode", "count"
    ));
    for dip in engine.devs.iter() {
        let (modes, mode_count) = dip.seek.modes();
        let mode = match modes.first() {
            Some(mode) => format!("{}", mode),
            None => String::from("-"),
        };
        text.push_str(&format!(
            "{:<24} {:>10} {:>14.2} {:>12} {:>10} {:>8}\n",
            device_header(dip.device, devmap),
            dip.seek.nseeks(),
            dip.seek.mean(),
            dip.seek.median(),
            mode,
            mode_count
        ));
    }
    write_report(&engine.config.output, "seek", &text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::latency::AvgsInfo;

    #[test]
    fn test_avgs_section_renders_seconds() {
        let mut avgs = AvgsInfo::default();
        avgs.q2c.add(400);
        avgs.q2c.add(600);
        let mut text = String::new();
        avgs_section(&mut text, "All Devices", &avgs);
        assert!(text.contains("All Devices"));
        assert!(text.contains("Q2C"));
        // 500ns mean
        assert!(text.contains("0.000000500"));
        // empty rows still appear
        assert!(text.contains("Q2Q"));
    }

    #[test]
    fn test_counters_section_skips_zeroes() {
        let mut counters = Counters::default();
        counters.completed = 3;
        let mut text = String::new();
        counters_section(&mut text, &counters);
        assert!(text.contains("completed graphs"));
        assert!(!text.contains("unknown actions"));
    }

    #[test]
    fn test_ranges_section_is_relative_to_genesis() {
        let mut regions = RegionInfo::default();
        regions.update_queue(1_000_000_100, 50);
        regions.update_queue(1_000_000_200, 50);
        let mut text = String::new();
        ranges_section(&mut text, "Device 8,0", &regions, 1_000_000_000);
        assert!(text.contains("queued"));
        assert!(text.contains("0.000000100"));
        assert!(text.contains("0.000000200"));
    }
}
