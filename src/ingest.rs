//! In-memory accumulator of the current level-8 blocks (§4.2).

use std::collections::BTreeMap;

use crate::block::{Bid, Block, Level, Rid, Sid, TIMESTAMP_MIN};
use crate::registry::SensorRegistry;

/// `block8[sid][rid][bid] -> Block`, holding only blocks whose
/// `bid >= close8`. Owned exclusively by the ingest buffer; the Flusher
/// drains it, nothing else mutates it.
#[derive(Default)]
pub struct IngestBuffer {
    blocks: BTreeMap<(Sid, Rid), BTreeMap<Bid, Block>>,
}

impl IngestBuffer {
    pub fn new() -> IngestBuffer {
        IngestBuffer::default()
    }

    /// Pushes one sample. Silently no-ops on an unsynced clock (§3); drops
    /// non-monotonic samples via `Block::push`.
    pub fn push8(&mut self, registry: &SensorRegistry, sid: &str, t: i64, v: f64, unit: &str) {
        if t < TIMESTAMP_MIN {
            return;
        }
        let rid = registry.get(sid).map(|c| c.rid).unwrap_or(0);
        let bid = Level::L8.align(t);

        let per_rid = self
            .blocks
            .entry((sid.to_string(), rid))
            .or_insert_with(BTreeMap::new);

        if let Some(block) = per_rid.get_mut(&bid) {
            block.push(t, v);
            return;
        }

        let cfg = registry
            .get(sid)
            .cloned()
            .unwrap_or_else(|| crate::registry::SensorConfig {
                id: sid.to_string(),
                rid,
                unit: unit.to_string(),
                data_type: String::new(),
            });
        per_rid.insert(bid, Block::open(t, v, cfg, unit));
    }

    /// All buffered `(sid, rid, bid)` triples whose `bid < close8`, oldest
    /// first, for the Flusher to drain.
    pub fn due_before(&self, close8: Bid) -> Vec<(Sid, Rid, Bid)> {
        let mut due = Vec::new();
        for ((sid, rid), per_bid) in &self.blocks {
            for &bid in per_bid.keys() {
                if bid < close8 {
                    due.push((sid.clone(), *rid, bid));
                }
            }
        }
        due
    }

    pub fn take(&mut self, sid: &str, rid: Rid, bid: Bid) -> Option<Block> {
        let per_rid = self.blocks.get_mut(&(sid.to_string(), rid))?;
        let block = per_rid.remove(&bid);
        if per_rid.is_empty() {
            self.blocks.remove(&(sid.to_string(), rid));
        }
        block
    }

    #[cfg(test)]
    pub fn get(&self, sid: &str, rid: Rid, bid: Bid) -> Option<&Block> {
        self.blocks.get(&(sid.to_string(), rid))?.get(&bid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::SensorConfig;

    fn registry() -> SensorRegistry {
        let mut r = SensorRegistry::new();
        r.insert(
            "ab".to_string(),
            SensorConfig {
                id: "ab".into(),
                rid: 0,
                unit: "kWh".into(),
                data_type: "gauge".into(),
            },
        );
        r
    }

    #[test]
    fn steady_flow_splits_across_the_boundary() {
        let mut buf = IngestBuffer::new();
        let registry = registry();
        buf.push8(&registry, "ab", 1_700_000_000, 100.0, "kWh");
        buf.push8(&registry, "ab", 1_700_000_010, 110.0, "kWh");
        buf.push8(&registry, "ab", 1_700_000_300, 140.0, "kWh");

        let first_bid = Level::L8.align(1_700_000_000);
        assert_eq!(first_bid, 1_700_000_000);
        let first = buf.get("ab", 0, first_bid).unwrap();
        assert_eq!(first.h.head, (1_700_000_000, 100.0));
        assert_eq!(first.h.tail, (1_700_000_010, 110.0));

        let second_bid = Level::L8.align(1_700_000_300);
        let second = buf.get("ab", 0, second_bid).unwrap();
        assert_eq!(second.h.head, (1_700_000_300, 140.0));
    }

    #[test]
    fn clock_unsynced_is_a_silent_noop() {
        let mut buf = IngestBuffer::new();
        let registry = registry();
        buf.push8(&registry, "ab", 1000, 1.0, "kWh");
        assert!(buf.due_before(u32::MAX).is_empty());
    }

    #[test]
    fn unknown_sensor_defaults_to_rid_zero() {
        let mut buf = IngestBuffer::new();
        let registry = SensorRegistry::new();
        buf.push8(&registry, "zz", 1_700_000_000, 1.0, "W");
        let bid = Level::L8.align(1_700_000_000);
        assert!(buf.get("zz", 0, bid).is_some());
    }
}
