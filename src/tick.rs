//! Single-threaded event dispatcher bound to the broker's heartbeat (§4.7).

use log::{debug, warn};

use crate::broker::{Broker, BrokerEvent};
use crate::compact::{Compactor, Step};
use crate::error::Result;
use crate::flush::Flusher;
use crate::gc;
use crate::ingest::IngestBuffer;
use crate::registry::{DeviceRegistry, SensorRegistry};
use crate::store::BlockStore;
use crate::sync::SyncEngine;
use crate::uplink;

/// Owns every core component and drives them from broker events. This is
/// the daemon's only mutable state; there is no background thread.
pub struct Daemon {
    store: BlockStore,
    buffer: IngestBuffer,
    flusher: Flusher,
    compactor: Option<Compactor>,
    sync: SyncEngine,
    sensors: SensorRegistry,
    devices: DeviceRegistry,
}

impl Daemon {
    pub fn new(store: BlockStore, sensors: SensorRegistry, devices: DeviceRegistry) -> Daemon {
        Daemon {
            store,
            buffer: IngestBuffer::new(),
            flusher: Flusher::new(),
            compactor: None,
            sync: SyncEngine::new(),
            sensors,
            devices,
        }
    }

    /// Runs the startup integrity scrub (§4.1). Call once before the first
    /// tick.
    pub fn startup(&self) -> Result<()> {
        self.store.startup_scrub()
    }

    /// Dispatches one `BrokerEvent`. The broker is passed in separately
    /// since it both feeds events and receives publishes.
    pub fn handle(&mut self, event: BrokerEvent, broker: &mut dyn Broker, now: i64) -> Result<()> {
        match event {
            BrokerEvent::Tick => self.tick(broker, now),
            BrokerEvent::Sync(payload) => {
                if let Err(e) = self.sync.sync1_json(&payload) {
                    warn!("sync: malformed watermark list: {e}");
                }
                Ok(())
            }
            BrokerEvent::Uplink(payload) => {
                uplink::handle_uplink(&payload, &self.sensors, &self.devices, &mut self.buffer);
                Ok(())
            }
        }
    }

    /// §4.7 item 1: `sync2` → `gc20` → `flush8(false)` → maybe advance the
    /// compactor by one step.
    fn tick(&mut self, broker: &mut dyn Broker, now: i64) -> Result<()> {
        self.sync.sync2(&self.store, broker)?;
        gc::gc20(&self.store)?;

        let advanced = self
            .flusher
            .flush8(&self.store, &mut self.buffer, broker, now, false)?;

        if self.compactor.is_none() && advanced {
            let close8 = self.flusher.close8().unwrap_or(0);
            self.compactor = Some(Compactor::new(&self.store, now, close8)?);
        }

        if let Some(compactor) = self.compactor.as_mut() {
            match compactor.step(&self.store, broker, now)? {
                Step::Done => {
                    debug!("tick: compactor finished its pass");
                    self.compactor = None;
                }
                Step::Progressed | Step::Paced => {
                    self.flusher.advance_close8_at_least(compactor.close8);
                }
            }
        }

        Ok(())
    }
}
