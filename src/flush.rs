//! Clock-driven closure of level-8 blocks (§4.3).

use log::debug;

use crate::block::{Bid, Level, FLUSH_GRACE_SECS, TIMESTAMP_MIN};
use crate::broker::Broker;
use crate::error::Result;
use crate::ingest::IngestBuffer;
use crate::store::BlockStore;

pub struct Flusher {
    /// Next scheduled level-8 closure boundary. `None` until the first call.
    close8: Option<Bid>,
}

impl Flusher {
    pub fn new() -> Flusher {
        Flusher { close8: None }
    }

    pub fn close8(&self) -> Option<Bid> {
        self.close8
    }

    /// Bumps the scheduled closure boundary forward to at least `bid`,
    /// never backward. The compactor calls this with its own advancing
    /// `close8` (§4.4 step 6) so the next `flush8` does not reopen a
    /// level-8 window the compactor has already started folding into a
    /// coarser block.
    pub fn advance_close8_at_least(&mut self, bid: Bid) {
        self.close8 = Some(match self.close8 {
            Some(current) => current.max(bid),
            None => bid,
        });
    }

    /// Closes every buffered level-8 block whose window has fully elapsed
    /// (plus the grace window), writes and publishes it, and advances
    /// `close8`. Returns whether any clock advancement happened at all
    /// (true exactly when the tick loop should consider starting a fresh
    /// compactor).
    pub fn flush8(
        &mut self,
        store: &BlockStore,
        buffer: &mut IngestBuffer,
        broker: &mut dyn Broker,
        now: i64,
        force: bool,
    ) -> Result<bool> {
        if now < TIMESTAMP_MIN {
            return Ok(false);
        }

        // `force` advances the comparison clock used throughout this call
        // by one span plus the grace window, so a forced flush behaves as
        // if that much wall-clock time had already elapsed.
        let compare_now = if force {
            now + Level::L8.span() + FLUSH_GRACE_SECS
        } else {
            now
        };

        let close8 = *self
            .close8
            .get_or_insert_with(|| Level::L8.align(compare_now) as Bid);

        if compare_now < close8 as i64 + FLUSH_GRACE_SECS {
            return Ok(false);
        }

        for (sid, rid, bid) in buffer.due_before(close8) {
            if let Some(block) = buffer.take(&sid, rid, bid) {
                store.write_block(&sid, rid, Level::L8, bid, &block)?;
                let topic = format!("/sensor/{sid}/tmpo/{rid}/8/{bid}/gz");
                let payload = store.read_raw(&sid, rid, Level::L8, bid)?;
                broker.publish(&topic, payload, 0, false)?;
                debug!("flush8: closed {sid}/{rid}/8/{bid}");
            }
        }

        self.close8 = Some(Level::L8.align(compare_now));
        Ok(true)
    }
}

impl Default for Flusher {
    fn default() -> Flusher {
        Flusher::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::FakeBroker;
    use crate::registry::{SensorConfig, SensorRegistry};
    use tempfile::TempDir;

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
    fn force_flush_closes_and_publishes() {
        let dir = TempDir::new().unwrap();
        let store = BlockStore::new(dir.path());
        let mut buffer = IngestBuffer::new();
        let registry = registry();
        buffer.push8(&registry, "ab", 1_700_000_000, 100.0, "kWh");
        buffer.push8(&registry, "ab", 1_700_000_010, 110.0, "kWh");
        buffer.push8(&registry, "ab", 1_700_000_300, 140.0, "kWh");

        let mut flusher = Flusher::new();
        let mut broker = FakeBroker::new();
        let did_work = flusher
            .flush8(&store, &mut buffer, &mut broker, 1_700_000_300, true)
            .unwrap();
        assert!(did_work);

        let first_bid = Level::L8.align(1_700_000_000);
        assert!(store.exists("ab", 0, Level::L8, first_bid));
        assert!(broker
            .published
            .iter()
            .any(|(topic, ..)| topic == &format!("/sensor/ab/tmpo/0/8/{first_bid}/gz")));
    }

    #[test]
    fn advance_close8_at_least_never_moves_backward() {
        let mut flusher = Flusher::new();
        flusher.advance_close8_at_least(1_700_000_256);
        assert_eq!(flusher.close8(), Some(1_700_000_256));
        flusher.advance_close8_at_least(1_700_000_000);
        assert_eq!(flusher.close8(), Some(1_700_000_256));
        flusher.advance_close8_at_least(1_700_000_512);
        assert_eq!(flusher.close8(), Some(1_700_000_512));
    }

    #[test]
    fn grace_window_defers_flush() {
        let dir = TempDir::new().unwrap();
        let store = BlockStore::new(dir.path());
        let mut buffer = IngestBuffer::new();
        let registry = registry();
        buffer.push8(&registry, "ab", 1_700_000_000, 100.0, "kWh");

        let mut flusher = Flusher::new();
        let mut broker = FakeBroker::new();
        // First call establishes close8; immediately after, we're well
        // inside the grace window so nothing should flush yet.
        let did_work = flusher
            .flush8(&store, &mut buffer, &mut broker, 1_700_000_000, false)
            .unwrap();
        assert!(!did_work);
    }
}
