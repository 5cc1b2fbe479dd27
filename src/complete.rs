use std::io::Write;

use log::warn;

use crate::WarnIfErr;
use crate::engine::{delta,Engine,Seg};
use crate::event::{Kind,Record};
use crate::latency;
use crate::node_pool::Handle;

impl<'c> Engine<'c> {
    // C: attach to the issue whose range contains it, or hold it until one
    // arrives.
    pub(crate) fn trace_complete(&mut self, record: &Record) -> Result<(), String> {
        let dev_index = self.devs.device_for(record.device, record.time, self.config)?;
        let c = self.pool.acquire(Kind::C, record);
        if !self.try_complete(c, dev_index) {
            self.pool.node_mut(c).in_retry = true;
            self.retries.push(c);
            self.counters.retries_held += 1;
        }
        Ok(())
    }

    fn try_complete(&mut self, c: Handle, dev_index: usize) -> bool {
        let (c_start, c_end, c_time, c_bytes) = {
            let node = self.pool.node(c);
            (node.sector, node.end_sector(), node.time, node.bytes)
        };
        let d = match self.devs.get(dev_index).find_containing(Kind::D, c_start, c_end, &self.pool) {
            Some(d) => d,
            None => return false,
        };
        self.attach(d, c);
        let root = self.root_of(d);
        // The decrement is bounded by the graph's remaining need, so a
        // completion wider than the request cannot double-count.
        let overlap = c_bytes.min(self.pool.node(root).bytes_left);
        if overlap < c_bytes {
            self.counters.overcompletions += 1;
        }
        self.pool.node_mut(root).bytes_left -= overlap;
        let root_time = self.pool.node(root).time;
        let d_time = self.pool.node(d).time;
        let wait = delta(&mut self.counters, root_time, c_time);
        let svctm = delta(&mut self.counters, d_time, c_time);
        self.devs.get_mut(dev_index).stat_complete(wait, svctm, c_time);
        if self.pool.node(root).bytes_left == 0 && self.all_issues_complete(root) {
            self.run_ready(root);
        }
        true
    }

    fn all_issues_complete(&self, root: Handle) -> bool {
        let mut stack = vec![root];
        while let Some(handle) = stack.pop() {
            let node = self.pool.node(handle);
            if node.kind == Kind::D
                && !node.down.iter().any(|&child| self.pool.node(child).kind == Kind::C)
            {
                return false;
            }
            stack.extend(node.down.iter().cloned());
        }
        true
    }

    // The graph is done: emit its latency decomposition, feed the seek and
    // region observers, then release every node.
    fn run_ready(&mut self, root: Handle) {
        let (device, pid, root_time, bytes_total) = {
            let node = self.pool.node(root);
            (node.device, node.pid, node.time, node.bytes_total)
        };
        let dev_index = match self.devs.find(device) {
            Some(index) => index,
            None => return,
        };
        let genesis = self.genesis.unwrap_or(0);
        let nodes = self.collect_graph(root);
        let mut latest_c = root_time;
        for &handle in &nodes {
            let (kind, time, up, sector, blocks) = {
                let node = self.pool.node(handle);
                (node.kind, node.time, node.up, node.sector, node.blocks())
            };
            let parent_time = up.map(|parent| self.pool.node(parent).time);
            match kind {
                Kind::I | Kind::M => {
                    if let Some(parent_time) = parent_time {
                        let value = delta(&mut self.counters, parent_time, time);
                        self.add_segment(dev_index, pid, Seg::Q2I, value);
                    }
                },
                Kind::D => {
                    if let Some(parent_time) = parent_time {
                        let value = delta(&mut self.counters, parent_time, time);
                        self.add_segment(dev_index, pid, Seg::I2D, value);
                    }
                    self.devs.get_mut(dev_index).seek.add(sector, blocks);
                },
                Kind::C => {
                    if time > latest_c {
                        latest_c = time;
                    }
                    if let Some(parent_time) = parent_time {
                        let value = delta(&mut self.counters, parent_time, time);
                        self.add_segment(dev_index, pid, Seg::D2C, value);
                        let dip = self.devs.get_mut(dev_index);
                        if let Some(ofp) = dip.d2c_ofp.as_mut() {
                            latency::write_latency(ofp, time.saturating_sub(genesis), value);
                        }
                    }
                },
                _ => {},
            }
        }
        let q2c = delta(&mut self.counters, root_time, latest_c);
        self.add_segment(dev_index, pid, Seg::Q2C, q2c);
        self.add_segment(dev_index, pid, Seg::Blks, bytes_total >> 9);
        {
            let dip = self.devs.get_mut(dev_index);
            if let Some(ofp) = dip.q2c_ofp.as_mut() {
                latency::write_latency(ofp, latest_c.saturating_sub(genesis), q2c);
            }
            dip.regions.update_complete(latest_c, self.config.range_delta);
        }
        if let Some(proc_index) = self.procs.find(pid) {
            self.procs.get_mut(proc_index).regions.update_complete(latest_c, self.config.range_delta);
        }
        self.all_regions.update_complete(latest_c, self.config.range_delta);
        self.counters.completed += 1;
        if self.per_io_ofp.is_some() {
            self.dump_per_io(root);
        }
        self.release_graph(root);
    }

    // Release a subtree: drop index and retry membership first, then hand
    // every node back to the pool.
    pub(crate) fn release_graph(&mut self, top: Handle) {
        if let Some(up) = self.pool.node(top).up {
            self.pool.node_mut(up).down.retain(|&child| child != top);
        }
        let nodes = self.collect_graph(top);
        for &handle in &nodes {
            let (kind, device, sector, linked, in_retry) = {
                let node = self.pool.node(handle);
                (node.kind, node.device, node.sector, node.linked, node.in_retry)
            };
            if linked {
                if let Some(dev_index) = self.devs.find(device) {
                    self.devs.get_mut(dev_index).erase(kind, sector, handle);
                }
            }
            if in_retry {
                self.retries.retain(|&held| held != handle);
            }
            self.pool.release(handle);
        }
    }

    // Re-attempt every held completion, preserving arrival order. Runs on
    // every successful issue and at stream end.
    pub(crate) fn drain_retries(&mut self) {
        let held = std::mem::replace(&mut self.retries, Vec::new());
        for c in held {
            if !self.pool.is_live(c) {
                continue;
            }
            let device = self.pool.node(c).device;
            let dev_index = match self.devs.find(device) {
                Some(index) => index,
                None => {
                    self.retries.push(c);
                    continue;
                },
            };
            self.pool.node_mut(c).in_retry = false;
            if self.try_complete(c, dev_index) {
                self.counters.retries_matched += 1;
            } else {
                self.pool.node_mut(c).in_retry = true;
                self.retries.push(c);
            }
        }
    }

    // Teardown on end of stream or interruption. Partial graphs are
    // discarded and counted.
    pub fn finish(&mut self) {
        self.drain_retries();
        let abandoned = std::mem::replace(&mut self.retries, Vec::new());
        if !abandoned.is_empty() {
            warn!("{} completions never matched an issue", abandoned.len());
        }
        self.counters.retries_abandoned += abandoned.len() as u64;
        for c in abandoned {
            self.pool.node_mut(c).in_retry = false;
            self.pool.release(c);
        }
        let mut unresolved: u64 = 0;
        for dip in self.devs.iter() {
            for (_, &handle) in &dip.heads[Kind::Q.index()] {
                if self.pool.node(handle).up.is_none() {
                    unresolved += 1;
                }
            }
        }
        self.counters.unresolved += unresolved;
        if self.iostat_ofp.is_some() {
            self.iostat_dump(self.last_stamp, true);
        }
        for handle in self.pool.live_handles() {
            self.pool.release(handle);
        }
        for dip in self.devs.iter_mut() {
            for head in dip.heads.iter_mut() {
                head.clear();
            }
        }
        if let Some(ofp) = self.iostat_ofp.as_mut() {
            ofp.flush().warn_if_err();
        }
        if let Some(ofp) = self.per_io_ofp.as_mut() {
            ofp.flush().warn_if_err();
        }
    }

    // One line per node, indented by graph depth.
    fn dump_per_io(&mut self, root: Handle) {
        let genesis = self.genesis.unwrap_or(0);
        let ofp = match self.per_io_ofp.as_mut() {
            Some(ofp) => ofp,
            None => return,
        };
        let mut stack = vec![(root, 0usize)];
        while let Some((handle, depth)) = stack.pop() {
            let node = self.pool.node(handle);
            writeln!(
                ofp,
                "{:indent$}{} {} {}+{} {:.9}",
                "",
                crate::devices::devno_string(node.device),
                node.kind.tag(),
                node.sector,
                node.blocks(),
                node.time.saturating_sub(genesis) as f64 / 1e9,
                indent = depth * 2
            )
            .warn_if_err();
            for &child in node.down.iter().rev() {
                stack.push((child, depth + 1));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use byteorder::{ByteOrder,NativeEndian};

    use crate::config::Config;
    use crate::engine::Engine;
    use crate::engine::tests::{feed,record,DEV};
    use crate::event::Kind;

    fn remap_payload(device: u32, sector: u64) -> Vec<u8> {
        let mut payload = vec![0u8; 12];
        NativeEndian::write_u32(&mut payload[0..4], device);
        NativeEndian::write_u64(&mut payload[4..12], sector);
        payload
    }

    #[test]
    fn test_s1_single_io() {
        let config = Config::default();
        let mut engine = Engine::new(&config).unwrap();
        feed(&mut engine, vec![
            record(Kind::Q, DEV, 0, 4096, 100, 1),
            record(Kind::I, DEV, 0, 4096, 200, 1),
            record(Kind::D, DEV, 0, 4096, 300, 1),
            record(Kind::C, DEV, 0, 4096, 500, 1),
        ]);
        assert_eq!(engine.counters.completed, 1);
        assert_eq!(engine.all_avgs.q2c.n, 1);
        assert_eq!(engine.all_avgs.q2c.total, 400);
        assert_eq!(engine.all_avgs.q2i.total, 100);
        assert_eq!(engine.all_avgs.i2d.total, 100);
        assert_eq!(engine.all_avgs.d2c.total, 200);
        assert_eq!(engine.all_avgs.blks.total, 8);
        assert_eq!(engine.pool.live_count(), 0);
        let dip = engine.devs.get(engine.devs.find(DEV).unwrap());
        assert_eq!(dip.in_flight(), 0);
        assert_eq!(dip.avgs.q2c.total, 400);
        let pip = engine.procs.get(engine.procs.find(1).unwrap());
        assert_eq!(pip.avgs.q2c.total, 400);
    }

    #[test]
    fn test_s2_merge() {
        let config = Config::default();
        let mut engine = Engine::new(&config).unwrap();
        feed(&mut engine, vec![
            record(Kind::Q, DEV, 0, 4096, 100, 1),
            record(Kind::Q, DEV, 8, 4096, 110, 1),
            record(Kind::M, DEV, 8, 4096, 120, 1),
            record(Kind::I, DEV, 0, 8192, 130, 1),
            record(Kind::D, DEV, 0, 8192, 200, 1),
            record(Kind::C, DEV, 0, 8192, 400, 1),
        ]);
        assert_eq!(engine.counters.merges, 1);
        assert_eq!(engine.counters.completed, 1);
        // Q2C is measured from the earliest Q
        assert_eq!(engine.all_avgs.q2c.n, 1);
        assert_eq!(engine.all_avgs.q2c.total, 300);
        // one Q2I per queued request: I-root and M-merged
        assert_eq!(engine.all_avgs.q2i.n, 2);
        assert_eq!(engine.all_avgs.q2i.total, 30 + 10);
        assert_eq!(engine.all_avgs.blks.total, 16);
        assert_eq!(engine.pool.live_count(), 0);
    }

    #[test]
    fn test_s3_split() {
        let config = Config::default();
        let mut engine = Engine::new(&config).unwrap();
        feed(&mut engine, vec![
            record(Kind::Q, DEV, 0, 8192, 100, 1),
            record(Kind::X, DEV, 8, 0, 110, 1),
            record(Kind::Q, DEV, 0, 4096, 120, 1),
            record(Kind::Q, DEV, 8, 4096, 121, 1),
            record(Kind::I, DEV, 0, 4096, 130, 1),
            record(Kind::I, DEV, 8, 4096, 131, 1),
            record(Kind::D, DEV, 0, 4096, 140, 1),
            record(Kind::D, DEV, 8, 4096, 141, 1),
            record(Kind::C, DEV, 0, 4096, 150, 1),
            record(Kind::C, DEV, 8, 4096, 151, 1),
        ]);
        assert_eq!(engine.counters.splits, 1);
        assert_eq!(engine.all_avgs.q2a.n, 1);
        assert_eq!(engine.all_avgs.q2a.total, 10);
        assert_eq!(engine.counters.completed, 2);
        assert_eq!(engine.all_avgs.q2c.n, 2);
        assert_eq!(engine.all_avgs.q2c.total, 30 + 30);
        // the halves sum to the parent's length
        assert_eq!(engine.all_avgs.blks.total, 16);
        assert_eq!(engine.pool.live_count(), 0);
    }

    #[test]
    fn test_s4_remap() {
        const SRC: u32 = 252 << 20;
        let config = Config::default();
        let mut engine = Engine::new(&config).unwrap();
        let mut remap = record(Kind::A, SRC, 0, 4096, 110, 1);
        remap.payload = remap_payload(DEV, 0);
        feed(&mut engine, vec![
            record(Kind::Q, SRC, 0, 4096, 100, 1),
            remap,
            record(Kind::Q, DEV, 0, 4096, 111, 1),
            record(Kind::I, DEV, 0, 4096, 120, 1),
            record(Kind::D, DEV, 0, 4096, 130, 1),
            record(Kind::C, DEV, 0, 4096, 140, 1),
        ]);
        assert_eq!(engine.counters.remaps, 1);
        assert_eq!(engine.counters.self_remaps, 0);
        assert_eq!(engine.all_avgs.q2a.total, 10);
        // one ready graph, rooted on the target device
        assert_eq!(engine.counters.completed, 1);
        assert_eq!(engine.all_avgs.q2c.n, 1);
        assert_eq!(engine.all_avgs.q2c.total, 29);
        let src = engine.devs.get(engine.devs.find(SRC).unwrap());
        assert_eq!(src.in_flight(), 0);
        assert_eq!(engine.pool.live_count(), 0);
    }

    #[test]
    fn test_s5_completion_before_issue() {
        let config = Config::default();
        let mut engine = Engine::new(&config).unwrap();
        feed(&mut engine, vec![
            record(Kind::Q, DEV, 0, 4096, 100, 1),
            record(Kind::I, DEV, 0, 4096, 200, 1),
            record(Kind::C, DEV, 0, 4096, 250, 1),
        ]);
        assert_eq!(engine.counters.retries_held, 1);
        assert_eq!(engine.retries.len(), 1);
        assert_eq!(engine.counters.completed, 0);

        engine.add_trace(record(Kind::D, DEV, 0, 4096, 300, 1)).unwrap();
        assert_eq!(engine.counters.retries_matched, 1);
        assert!(engine.retries.is_empty());
        assert_eq!(engine.counters.completed, 1);
        assert_eq!(engine.all_avgs.q2c.total, 150);
        // the issue was stamped after its completion
        assert_eq!(engine.all_avgs.d2c.total, 0);
        assert!(engine.counters.negative_deltas > 0);
        assert_eq!(engine.pool.live_count(), 0);
    }

    #[test]
    fn test_s6_requeue_then_reissue() {
        let config = Config::default();
        let mut engine = Engine::new(&config).unwrap();
        feed(&mut engine, vec![
            record(Kind::Q, DEV, 0, 4096, 100, 1),
            record(Kind::I, DEV, 0, 4096, 110, 1),
            record(Kind::D, DEV, 0, 4096, 120, 1),
            record(Kind::R, DEV, 0, 4096, 130, 1),
            record(Kind::D, DEV, 0, 4096, 140, 1),
            record(Kind::C, DEV, 0, 4096, 200, 1),
        ]);
        assert_eq!(engine.counters.requeues, 1);
        assert_eq!(engine.counters.completed, 1);
        // measured from the second issue
        assert_eq!(engine.all_avgs.d2c.total, 60);
        assert_eq!(engine.all_avgs.i2d.n, 1);
        assert_eq!(engine.all_avgs.i2d.total, 30);
        assert_eq!(engine.all_avgs.q2c.total, 100);
        assert_eq!(engine.pool.live_count(), 0);
    }

    #[test]
    fn test_partial_completions_accumulate() {
        let config = Config::default();
        let mut engine = Engine::new(&config).unwrap();
        feed(&mut engine, vec![
            record(Kind::Q, DEV, 0, 8192, 100, 1),
            record(Kind::I, DEV, 0, 8192, 110, 1),
            record(Kind::D, DEV, 0, 8192, 120, 1),
            record(Kind::C, DEV, 0, 4096, 150, 1),
        ]);
        assert_eq!(engine.counters.completed, 0);
        assert_eq!(engine.pool.live_count(), 4);

        engine.add_trace(record(Kind::C, DEV, 8, 4096, 160, 1)).unwrap();
        assert_eq!(engine.counters.completed, 1);
        assert_eq!(engine.all_avgs.d2c.n, 2);
        assert_eq!(engine.all_avgs.q2c.total, 60);
        assert_eq!(engine.pool.live_count(), 0);
    }

    #[test]
    fn test_overwide_completion_cannot_double_count() {
        let config = Config::default();
        let mut engine = Engine::new(&config).unwrap();
        feed(&mut engine, vec![
            record(Kind::Q, DEV, 0, 4096, 100, 1),
            record(Kind::I, DEV, 0, 4096, 110, 1),
            record(Kind::D, DEV, 0, 8192, 120, 1),
            record(Kind::C, DEV, 0, 8192, 150, 1),
        ]);
        assert_eq!(engine.counters.overcompletions, 1);
        assert_eq!(engine.counters.completed, 1);
        assert_eq!(engine.all_avgs.blks.total, 8);
        assert_eq!(engine.pool.live_count(), 0);
    }

    #[test]
    fn test_retry_drain_is_idempotent() {
        let config = Config::default();
        let mut engine = Engine::new(&config).unwrap();
        feed(&mut engine, vec![
            record(Kind::Q, DEV, 0, 4096, 100, 1),
            record(Kind::C, DEV, 64, 4096, 150, 1),
        ]);
        assert_eq!(engine.retries.len(), 1);
        engine.drain_retries();
        engine.drain_retries();
        assert_eq!(engine.retries.len(), 1);
        assert_eq!(engine.counters.retries_matched, 0);
    }

    #[test]
    fn test_finish_discards_partial_graphs() {
        let config = Config::default();
        let mut engine = Engine::new(&config).unwrap();
        feed(&mut engine, vec![
            record(Kind::Q, DEV, 0, 4096, 100, 1),
            record(Kind::I, DEV, 0, 4096, 110, 1),
            record(Kind::Q, DEV, 64, 4096, 120, 1),
            record(Kind::C, DEV, 128, 4096, 130, 1),
        ]);
        engine.finish();
        assert_eq!(engine.counters.unresolved, 2);
        assert_eq!(engine.counters.retries_abandoned, 1);
        assert_eq!(engine.pool.live_count(), 0);
        let dip = engine.devs.get(engine.devs.find(DEV).unwrap());
        assert_eq!(dip.in_flight(), 0);
    }

    #[test]
    fn test_in_flight_matches_unready_queues() {
        let config = Config::default();
        let mut engine = Engine::new(&config).unwrap();
        feed(&mut engine, vec![
            record(Kind::Q, DEV, 0, 4096, 100, 1),
            record(Kind::I, DEV, 0, 4096, 110, 1),
            record(Kind::D, DEV, 0, 4096, 120, 1),
            record(Kind::C, DEV, 0, 4096, 130, 1),
            record(Kind::Q, DEV, 64, 4096, 140, 1),
        ]);
        let dip = engine.devs.get(engine.devs.find(DEV).unwrap());
        // queued - ready graphs = still in flight
        assert_eq!(dip.heads[Kind::Q.index()].len(), 2 - 1);
        assert_eq!(engine.pool.live_count(), 1);
    }
}
