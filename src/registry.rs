//! The read-only sensor/device registry consumed by the core, and a thin
//! loader for the on-disk YAML config. Schema parsing is out of the core's
//! scope (§4.9); the core only ever sees `SensorRegistry` / `DeviceRegistry`.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Sensor parameters as captured into a block header at first-sample time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorConfig {
    pub id: String,
    pub rid: u32,
    #[serde(default)]
    pub unit: String,
    pub data_type: String,
}

/// `sid -> params`, filtered to enabled sensors with `tmpo` absent or 1.
pub type SensorRegistry = HashMap<String, SensorConfig>;

/// `device serial -> sensor index -> sid`, used only to decode uplinks.
#[derive(Debug, Clone, Default)]
pub struct DeviceRegistry {
    devices: HashMap<String, HashMap<u32, String>>,
}

impl DeviceRegistry {
    pub fn contains(&self, serial: &str) -> bool {
        self.devices.contains_key(serial)
    }

    pub fn sid_for(&self, serial: &str, idx: u32) -> Option<&str> {
        self.devices.get(serial)?.get(&idx).map(String::as_str)
    }
}

fn default_enable() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct RawSensorEntry {
    id: String,
    rid: u32,
    #[serde(default)]
    unit: String,
    data_type: String,
    #[serde(default = "default_enable")]
    enable: bool,
    tmpo: Option<u8>,
}

type RawConfig = HashMap<String, HashMap<u32, RawSensorEntry>>;

/// Parses `device[serial] -> sensor[idx] -> {id, rid, unit, data_type, enable, tmpo}`
/// into the two maps the core consumes.
pub fn load(path: &Path) -> Result<(SensorRegistry, DeviceRegistry)> {
    let text = std::fs::read_to_string(path)?;
    load_str(&text)
}

pub fn load_str(text: &str) -> Result<(SensorRegistry, DeviceRegistry)> {
    let raw: RawConfig = serde_yaml::from_str(text).map_err(|e| Error::Config(e.to_string()))?;

    let mut sensors = SensorRegistry::new();
    let mut devices = DeviceRegistry::default();

    for (serial, slots) in raw {
        let mut dev_slots = HashMap::new();
        for (idx, entry) in slots {
            if !entry.enable || entry.tmpo.unwrap_or(1) != 1 {
                continue;
            }
            dev_slots.insert(idx, entry.id.clone());
            sensors.insert(
                entry.id.clone(),
                SensorConfig {
                    id: entry.id,
                    rid: entry.rid,
                    unit: entry.unit,
                    data_type: entry.data_type,
                },
            );
        }
        devices.devices.insert(serial, dev_slots);
    }

    Ok((sensors, devices))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filters_disabled_sensors() {
        let yaml = r#"
11223344556677889900aabbccddeeff:
  1:
    id: "fa010203"
    rid: 0
    unit: "kWh"
    data_type: "gauge"
    enable: true
    tmpo: 1
  2:
    id: "fa040506"
    rid: 0
    unit: "kWh"
    data_type: "gauge"
    enable: false
"#;
        let (sensors, devices) = load_str(yaml).unwrap();
        assert_eq!(sensors.len(), 1);
        assert!(sensors.contains_key("fa010203"));
        assert!(!sensors.contains_key("fa040506"));
        assert_eq!(
            devices.sid_for("11223344556677889900aabbccddeeff", 1),
            Some("fa010203")
        );
        assert_eq!(
            devices.sid_for("11223344556677889900aabbccddeeff", 2),
            None
        );
    }

    #[test]
    fn tmpo_zero_is_filtered() {
        let yaml = r#"
dev:
  1:
    id: "aa"
    rid: 0
    data_type: "gauge"
    tmpo: 0
"#;
        let (sensors, _) = load_str(yaml).unwrap();
        assert!(sensors.is_empty());
    }
}
