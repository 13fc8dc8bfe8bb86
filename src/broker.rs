//! The MQTT transport boundary (§1, §4.10, §6). The core only ever talks to
//! the `Broker` trait; the production adapter and the tick loop's use of it
//! live in the `tmpod` binary and in tests respectively.

use crate::error::Result;

/// An inbound message the tick loop reacts to, already routed by topic.
#[derive(Debug, Clone, PartialEq)]
pub enum BrokerEvent {
    /// The 1 Hz `$SYS/broker/uptime` heartbeat.
    Tick,
    /// `/d/device/<DEVICE>/tmpo/sync` payload.
    Sync(String),
    /// `tmpo/devices/+/up` payload.
    Uplink(String),
}

/// Publish/subscribe boundary standing in for the MQTT client collaborator.
pub trait Broker {
    /// Publishes `payload` on `topic` with the given QoS and retain flag.
    fn publish(&mut self, topic: &str, payload: Vec<u8>, qos: u8, retain: bool) -> Result<()>;
}

/// An in-memory test double: records every publish, never touches a network.
#[derive(Default)]
pub struct FakeBroker {
    pub published: Vec<(String, Vec<u8>, u8, bool)>,
}

impl FakeBroker {
    pub fn new() -> FakeBroker {
        FakeBroker::default()
    }

    pub fn topics(&self) -> Vec<&str> {
        self.published.iter().map(|(t, ..)| t.as_str()).collect()
    }
}

impl Broker for FakeBroker {
    fn publish(&mut self, topic: &str, payload: Vec<u8>, qos: u8, retain: bool) -> Result<()> {
        self.published.push((topic.to_string(), payload, qos, retain));
        Ok(())
    }
}
