//! Decodes the MQTT sensor uplink payload (§6, §4.8): base64 counters to
//! `push8` calls against the ingest buffer.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use byteorder::{BigEndian, ReadBytesExt};
use chrono::DateTime;
use log::warn;
use serde::Deserialize;

use crate::ingest::IngestBuffer;
use crate::registry::{DeviceRegistry, SensorRegistry};

/// Fixed mapping from counter position in `payload_raw` to sensor index.
const SENSOR_INDICES: [u32; 9] = [1, 2, 13, 14, 25, 26, 37, 38, 39];

#[derive(Debug, Deserialize)]
struct UplinkMetadata {
    time: String,
}

#[derive(Debug, Deserialize)]
struct UplinkEnvelope {
    dev_id: String,
    metadata: UplinkMetadata,
    payload_raw: String,
}

/// Decodes one uplink JSON payload and feeds every non-zero counter into
/// `buffer`. Drops the whole uplink (logged, not an error) if the device is
/// unknown, the time is unparseable, or the payload doesn't decode to
/// exactly 9 u32 counters.
pub fn handle_uplink(
    payload: &str,
    sensors: &SensorRegistry,
    devices: &DeviceRegistry,
    buffer: &mut IngestBuffer,
) {
    let envelope: UplinkEnvelope = match serde_json::from_str(payload) {
        Ok(e) => e,
        Err(e) => {
            warn!("uplink: malformed envelope: {e}");
            return;
        }
    };

    if !devices.contains(&envelope.dev_id) {
        warn!("uplink: unknown device {}", envelope.dev_id);
        return;
    }

    let t = match DateTime::parse_from_rfc3339(&envelope.metadata.time) {
        Ok(dt) => dt.timestamp(),
        Err(e) => {
            warn!("uplink: unparseable time {}: {e}", envelope.metadata.time);
            return;
        }
    };

    let raw = match BASE64.decode(envelope.payload_raw.as_bytes()) {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!("uplink: invalid base64: {e}");
            return;
        }
    };

    let mut cursor = std::io::Cursor::new(&raw);
    let mut counters = [0u32; 9];
    for counter in &mut counters {
        *counter = match cursor.read_u32::<BigEndian>() {
            Ok(v) => v,
            Err(e) => {
                warn!("uplink: short payload_raw: {e}");
                return;
            }
        };
    }

    for (counter, idx) in counters.into_iter().zip(SENSOR_INDICES) {
        if counter == 0 {
            continue;
        }
        let Some(sid) = devices.sid_for(&envelope.dev_id, idx) else {
            continue;
        };
        let unit = sensors.get(sid).map(|c| c.unit.as_str()).unwrap_or("");
        buffer.push8(sensors, sid, t, counter as f64, unit);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::load_str;

    fn yaml() -> &'static str {
        r#"
11223344556677889900aabbccddeeff:
  1:
    id: "aa"
    rid: 0
    unit: "kWh"
    data_type: "gauge"
  2:
    id: "bb"
    rid: 0
    unit: "kWh"
    data_type: "gauge"
"#
    }

    fn payload_raw(counters: [u32; 9]) -> String {
        let mut bytes = Vec::new();
        for c in counters {
            bytes.extend_from_slice(&c.to_be_bytes());
        }
        base64::engine::general_purpose::STANDARD.encode(bytes)
    }

    #[test]
    fn decodes_nonzero_counters_and_skips_zero() {
        let (sensors, devices) = load_str(yaml()).unwrap();
        let mut counters = [0u32; 9];
        counters[0] = 5; // idx 1 -> "aa"
        counters[1] = 0; // idx 2 -> skipped
        let payload = format!(
            r#"{{"dev_id":"11223344556677889900aabbccddeeff","metadata":{{"time":"2023-11-14T22:13:20Z"}},"payload_raw":"{}"}}"#,
            payload_raw(counters)
        );
        let mut buffer = IngestBuffer::new();
        handle_uplink(&payload, &sensors, &devices, &mut buffer);

        let bid = crate::block::Level::L8.align(1_700_000_000);
        assert!(buffer.get("aa", 0, bid).is_some());
        assert!(buffer.get("bb", 0, bid).is_none());
    }

    #[test]
    fn unknown_device_drops_whole_uplink() {
        let (sensors, devices) = load_str(yaml()).unwrap();
        let payload = format!(
            r#"{{"dev_id":"deadbeef","metadata":{{"time":"2023-11-14T22:13:20Z"}},"payload_raw":"{}"}}"#,
            payload_raw([1; 9])
        );
        let mut buffer = IngestBuffer::new();
        handle_uplink(&payload, &sensors, &devices, &mut buffer);
        assert!(buffer.due_before(u32::MAX).is_empty());
    }
}
