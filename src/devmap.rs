use std::collections::HashMap;
use std::fs;
use std::path::Path;

use crate::devices;

// Static device map: one line per device, "maj,min" followed by a display
// name. Blank lines and '#' comments are skipped.
pub struct DevMap {
    entries: HashMap<String, String>,
}

impl DevMap {
    pub fn load(path: &Path) -> Result<Self, String> {
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(_) => {
                return Err(format!("Could not read device map file '{}'", path.display()));
            },
        };
        Self::parse(&text).map_err(|devno| {
            format!("Bad device id '{}' in device map file '{}'", devno, path.display())
        })
    }

    // Err carries the offending device id field.
    fn parse(text: &str) -> Result<Self, String> {
        let mut entries = HashMap::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut fields = line.splitn(2, char::is_whitespace);
            let devno = match fields.next() {
                Some(devno) => devno,
                None => continue,
            };
            if devices::parse_devno(devno).is_none() {
                return Err(String::from(devno));
            }
            let name = fields.next().unwrap_or("").trim();
            entries.insert(String::from(devno), String::from(name));
        }
        Ok(DevMap {
            entries,
        })
    }

    pub fn find(&self, device: u32) -> Option<&str> {
        self.entries.get(&devices::devno_string(device)).map(|name| name.as_str())
    }
}
