extern crate blklife;
extern crate clap;
extern crate env_logger;

use std::path::{Path,PathBuf};
use std::process;

use blklife::config::Config;

fn parse_number(text: &str, what: &str) -> Result<u64, String> {
    match text.parse() {
        Ok(value) => Ok(value),
        Err(_) => Err(format!("Invalid value '{}' for {}", text, what)),
    }
}

fn build_config(matches: &clap::ArgMatches) -> Result<Config, String> {
    let mut config = match matches.value_of("config") {
        Some(path) => Config::from_yaml_file(Path::new(path))?,
        None => Config::default(),
    };
    if let Some(path) = matches.value_of("input") {
        config.input = Some(PathBuf::from(path));
    }
    if let Some(path) = matches.value_of("output") {
        config.output = Some(PathBuf::from(path));
    }
    if let Some(devices) = matches.values_of("devices") {
        config.devices = Some(devices.map(String::from).collect());
    }
    if let Some(exes) = matches.values_of("exes") {
        config.exes = Some(exes.map(String::from).collect());
    }
    if let Some(path) = matches.value_of("dev-map") {
        config.devmap = Some(PathBuf::from(path));
    }
    if let Some(interval) = matches.value_of("iostat-interval") {
        config.iostat_interval = parse_number(interval, "iostat-interval")?;
    }
    if let Some(range_delta) = matches.value_of("range-delta") {
        config.range_delta = parse_number(range_delta, "range-delta")?;
    }
    if matches.is_present("verbose") {
        config.verbose = true;
    }
    if let Some(level) = matches.value_of("dump-level") {
        config.dump_level = parse_number(level, "dump-level")? as u32;
    }
    Ok(config)
}

fn main() {
    env_logger::init();
    let matches = blklife::cli::get_app().get_matches();
    let config = match build_config(&matches) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}", e);
            process::exit(1);
        },
    };
    if let Err(e) = blklife::run(&config) {
        eprintln!("{}", e);
        process::exit(1);
    }
}
