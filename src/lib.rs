extern crate byteorder;
extern crate chrono;
extern crate clap;
extern crate libc;
extern crate log;
extern crate nix;
extern crate serde;
extern crate serde_yaml;

pub mod cli;
pub mod config;
mod complete;
mod devices;
mod devmap;
mod engine;
mod event;
mod iostat;
mod latency;
mod node_pool;
mod output;
mod processes;
mod regions;
mod seek;

use std::fs::File;
use std::io::{BufReader,Read};
use std::sync::atomic::{AtomicBool,Ordering};

use log::warn;

pub(crate) trait WarnIfErr {
    fn warn_if_err(&self);
}
impl<T, E: std::fmt::Debug> WarnIfErr for Result<T, E> {
    fn warn_if_err(&self) {
        if let Err(e) = self {
            warn!("{:?}", e);
        }
    }
}

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_sigint(_: libc::c_int) {
    INTERRUPTED.store(true, Ordering::Relaxed);
}

fn install_sigint_handler() {
    let action = nix::sys::signal::SigAction::new(
        nix::sys::signal::SigHandler::Handler(handle_sigint),
        nix::sys::signal::SaFlags::empty(),
        nix::sys::signal::SigSet::empty(),
    );
    unsafe {
        nix::sys::signal::sigaction(nix::sys::signal::Signal::SIGINT, &action)
            .expect("Could not install SIGINT handler");
    }
}

// Single-threaded, pull-driven: the reader consumes the decoder and drives
// the linker synchronously, so the stream's total order is honored.
pub fn run(config: &config::Config) -> Result<(), String> {
    install_sigint_handler();
    let mut reader: Box<dyn Read> = match &config.input {
        Some(path) => match File::open(path) {
            Ok(file) => Box::new(BufReader::new(file)),
            Err(_) => {
                return Err(format!("Could not open trace input '{}'", path.display()));
            },
        },
        None => Box::new(BufReader::new(std::io::stdin())),
    };
    let devmap = match &config.devmap {
        Some(path) => Some(devmap::DevMap::load(path)?),
        None => None,
    };
    let mut engine = engine::Engine::new(config)?;
    loop {
        if INTERRUPTED.load(Ordering::Relaxed) {
            warn!("Interrupted - discarding partial graphs");
            break;
        }
        match event::next_event(&mut reader) {
            Ok(Some(record)) => engine.add_trace(record)?,
            Ok(None) => break,
            Err(e) => {
                if INTERRUPTED.load(Ordering::Relaxed) {
                    break;
                }
                return Err(e);
            },
        }
    }
    engine.finish();
    output::output_avgs(&engine, devmap.as_ref())?;
    if config.dump_level >= 1 {
        output::output_ranges(&engine, devmap.as_ref())?;
        output::output_seek(&engine, devmap.as_ref())?;
    }
    Ok(())
}
