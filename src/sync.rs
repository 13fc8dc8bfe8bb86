//! Back-fill on demand: accepts a remote "last-known-block" list and
//! republishes every local block newer than each watermark (§4.6).

use serde::{Deserialize, Serialize};

use crate::block::Level;
use crate::broker::Broker;
use crate::error::Result;
use crate::store::BlockStore;

/// One remote watermark: "I already have everything up through this block."
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Watermark {
    pub sid: String,
    pub rid: u32,
    pub lvl: u8,
    pub bid: u32,
}

/// Coarsest-first publish order, so a remote gets a quick overview before
/// the fine detail arrives.
const SYNC_LEVELS: [Level; 4] = [Level::L20, Level::L16, Level::L12, Level::L8];

/// Single-slot watermark list. `sync1` overwrites any previous unhandled
/// list (last-request-wins, intentional per the design notes).
#[derive(Default)]
pub struct SyncEngine {
    pending: Option<Vec<Watermark>>,
}

impl SyncEngine {
    pub fn new() -> SyncEngine {
        SyncEngine::default()
    }

    pub fn sync1(&mut self, list: Vec<Watermark>) {
        self.pending = Some(list);
    }

    pub fn sync1_json(&mut self, payload: &str) -> Result<()> {
        let list: Vec<Watermark> = serde_json::from_str(payload)?;
        self.sync1(list);
        Ok(())
    }

    /// Republishes every block newer than each pending watermark, coarsest
    /// level first. No-ops if nothing is pending.
    pub fn sync2(&mut self, store: &BlockStore, broker: &mut dyn Broker) -> Result<()> {
        let Some(watermarks) = self.pending.take() else {
            return Ok(());
        };

        for watermark in watermarks {
            let watermark_tail = watermark.bid as i64 + (1i64 << watermark.lvl) - 1;

            for rid in store.rids(&watermark.sid)? {
                if rid < watermark.rid {
                    continue;
                }
                for level in SYNC_LEVELS {
                    for bid in store.bids(&watermark.sid, rid, level)? {
                        let tail = bid as i64 + level.span() - 1;
                        if tail > watermark_tail {
                            let payload = store.read_raw(&watermark.sid, rid, level, bid)?;
                            let topic =
                                format!("/sensor/{}/tmpo/{}/{}/{}/gz", watermark.sid, rid, level.0, bid);
                            broker.publish(&topic, payload, 0, false)?;
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::Block;
    use crate::broker::FakeBroker;
    use crate::registry::SensorConfig;
    use tempfile::TempDir;

    fn cfg() -> SensorConfig {
        SensorConfig {
            id: "ef".into(),
            rid: 0,
            unit: "kWh".into(),
            data_type: "gauge".into(),
        }
    }

    #[test]
    fn republishes_coarsest_level_first() {
        let dir = TempDir::new().unwrap();
        let store = BlockStore::new(dir.path());
        let block = Block::open(1_700_000_000, 1.0, cfg(), "kWh");

        store.write_block("ef", 0, Level::L20, Level::L20.align(1_700_000_000), &block).unwrap();
        store.write_block("ef", 0, Level::L16, Level::L16.align(1_700_000_000), &block).unwrap();
        store.write_block("ef", 0, Level::L12, Level::L12.align(1_700_000_000), &block).unwrap();
        store.write_block("ef", 0, Level::L8, Level::L8.align(1_700_000_000), &block).unwrap();

        let mut engine = SyncEngine::new();
        engine.sync1(vec![Watermark {
            sid: "ef".into(),
            rid: 0,
            lvl: 8,
            bid: 1_400_000_000,
        }]);

        let mut broker = FakeBroker::new();
        engine.sync2(&store, &mut broker).unwrap();

        let levels: Vec<u8> = broker
            .published
            .iter()
            .map(|(topic, ..)| {
                let parts: Vec<&str> = topic.split('/').collect();
                parts[4].parse().unwrap()
            })
            .collect();
        assert_eq!(levels, vec![20, 16, 12, 8]);
    }

    #[test]
    fn no_pending_list_is_a_noop() {
        let dir = TempDir::new().unwrap();
        let store = BlockStore::new(dir.path());
        let mut engine = SyncEngine::new();
        let mut broker = FakeBroker::new();
        engine.sync2(&store, &mut broker).unwrap();
        assert!(broker.published.is_empty());
    }
}
