use std::fs;
use std::path::{Path,PathBuf};
use serde::{Serialize,Deserialize};

#[derive(Clone,Serialize,Deserialize)]
#[serde(default)]
pub struct Config {
    // Trace stream to read; stdin when absent.
    pub input: Option<PathBuf>,
    // Prefix for every output file; stdout reports when absent.
    pub output: Option<PathBuf>,
    // Restrict analysis to these "maj,min" device ids.
    pub devices: Option<Vec<String>>,
    // Restrict analysis to I/O queued by these command names.
    pub exes: Option<Vec<String>>,
    pub devmap: Option<PathBuf>,
    // Nanoseconds between iostat snapshots; 0 disables them.
    pub iostat_interval: u64,
    // Nanosecond gap that separates active ranges.
    pub range_delta: u64,
    // Dump every I/O node at graph release.
    pub verbose: bool,
    // 0 averages only, 1 adds ranges and seeks, 2 adds latency streams.
    pub dump_level: u32,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            input: None,
            output: None,
            devices: None,
            exes: None,
            devmap: None,
            iostat_interval: 0,
            range_delta: 100_000_000,
            verbose: false,
            dump_level: 1,
        }
    }
}

impl Config {
    pub fn from_yaml_file(path: &Path) -> Result<Config, String> {
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(_) => {
                return Err(format!("Could not read config file '{}'", path.display()));
            },
        };
        match serde_yaml::from_str(&text) {
            Ok(config) => Ok(config),
            Err(e) => Err(format!("Could not parse config file '{}': {}", path.display(), e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_yaml_round_trip() {
        let mut config = Config::default();
        config.input = Some(PathBuf::from("/tmp/trace.bin"));
        config.devices = Some(vec![String::from("8,0"), String::from("8,16")]);
        config.iostat_interval = 1_000_000_000;
        config.dump_level = 2;
        let text = serde_yaml::to_string(&config).unwrap();
        let back: Config = serde_yaml::from_str(&text).unwrap();
        assert_eq!(back.input, config.input);
        assert_eq!(back.devices, config.devices);
        assert_eq!(back.iostat_interval, 1_000_000_000);
        assert_eq!(back.range_delta, 100_000_000);
        assert_eq!(back.dump_level, 2);
        assert!(!back.verbose);
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let config: Config = serde_yaml::from_str("iostat_interval: 500\n").unwrap();
        assert_eq!(config.iostat_interval, 500);
        assert_eq!(config.range_delta, 100_000_000);
        assert!(config.input.is_none());
    }
}
