use std::path::PathBuf;
use std::process::exit;
use std::time::Duration;

use clap::Parser;
use log::{debug, error, info, warn};
use rumqttc::{Client, Event, MqttOptions, Packet, QoS};
use stderrlog::Timestamp;

use tmpod::{Broker, BrokerEvent, Daemon, Result};

/// Timeseries logging daemon for a fleet of metering sensors.
#[derive(Parser)]
#[command(name = env!("CARGO_PKG_NAME"), version, author, about)]
struct Args {
    /// Root directory for the block store.
    #[arg(long, default_value = "/var/lib/tmpo/sensor")]
    root: PathBuf,

    /// Path to the YAML sensor/device registry.
    #[arg(long, default_value = "/etc/tmpo/config.yml")]
    config: PathBuf,

    /// This device's id, used to scope the inbound sync topic.
    #[arg(long, default_value = "000000000000000000000000000000")]
    device_id: String,

    /// `host:port` of the MQTT broker.
    #[arg(long, default_value = "127.0.0.1:1883")]
    broker: String,

    /// Increase logging verbosity (can be repeated).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Decrease logging verbosity (can be repeated).
    #[arg(short, long, action = clap::ArgAction::Count)]
    quiet: u8,
}

/// Adapts `rumqttc`'s blocking client/connection pair onto `Broker`.
struct MqttBroker {
    client: Client,
}

impl Broker for MqttBroker {
    fn publish(&mut self, topic: &str, payload: Vec<u8>, qos: u8, retain: bool) -> Result<()> {
        let qos = match qos {
            1 => QoS::AtLeastOnce,
            2 => QoS::ExactlyOnce,
            _ => QoS::AtMostOnce,
        };
        self.client
            .publish(topic, qos, retain, payload)
            .map_err(|e| tmpod::Error::Broker(e.to_string()))
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    let verbosity = (2 + args.verbose as usize).saturating_sub(args.quiet as usize);
    stderrlog::new()
        .module(module_path!())
        .module("tmpod")
        .timestamp(Timestamp::Second)
        .verbosity(verbosity)
        .init()
        .unwrap();

    info!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));

    let (sensors, devices) = tmpod::registry::load(&args.config).unwrap_or_else(|e| {
        error!("failed to load registry from {}: {e}", args.config.display());
        exit(1);
    });
    info!("loaded {} sensors", sensors.len());

    let store = tmpod::BlockStore::new(&args.root);
    let mut daemon = Daemon::new(store, sensors, devices);
    daemon.startup()?;

    let sync_topic = format!("/d/device/{}/tmpo/sync", args.device_id);

    let mut mqttoptions = MqttOptions::new("tmpod", host_of(&args.broker), port_of(&args.broker));
    mqttoptions.set_keep_alive(Duration::from_secs(5));
    let (client, mut connection) = Client::new(mqttoptions, 64);

    client
        .subscribe("$SYS/broker/uptime", QoS::AtMostOnce)
        .map_err(|e| tmpod::Error::Broker(e.to_string()))?;
    client
        .subscribe(&sync_topic, QoS::AtMostOnce)
        .map_err(|e| tmpod::Error::Broker(e.to_string()))?;
    client
        .subscribe("tmpo/devices/+/up", QoS::AtMostOnce)
        .map_err(|e| tmpod::Error::Broker(e.to_string()))?;

    let mut broker = MqttBroker { client };

    for notification in connection.iter() {
        let publish = match notification {
            Ok(Event::Incoming(Packet::Publish(p))) => p,
            Ok(_) => continue,
            Err(e) => {
                warn!("mqtt connection error: {e}, backing off");
                std::thread::sleep(Duration::from_secs(1));
                continue;
            }
        };

        if publish.retain {
            debug!("ignoring retained message on {}", publish.topic);
            continue;
        }

        let now = chrono::Utc::now().timestamp();
        let payload = String::from_utf8_lossy(&publish.payload).into_owned();

        let event = if publish.topic == "$SYS/broker/uptime" {
            BrokerEvent::Tick
        } else if publish.topic == sync_topic {
            BrokerEvent::Sync(payload)
        } else {
            BrokerEvent::Uplink(payload)
        };

        if let Err(e) = daemon.handle(event, &mut broker, now) {
            error!("tick error: {e}");
        }
    }

    Ok(())
}

fn host_of(addr: &str) -> String {
    addr.rsplit_once(':').map(|(h, _)| h.to_string()).unwrap_or_else(|| addr.to_string())
}

fn port_of(addr: &str) -> u16 {
    addr.rsplit_once(':')
        .and_then(|(_, p)| p.parse().ok())
        .unwrap_or(1883)
}

use assert_cmd::prelude::*;
use predicates::str::contains;
use std::process::Command;
use tempfile::TempDir;

// `tmpod -V` should print the version.
#[test]
fn cli_version() {
    Command::cargo_bin("tmpod")
        .unwrap()
        .args(["-V"])
        .assert()
        .stdout(contains(env!("CARGO_PKG_VERSION")));
}

// `tmpod --help` should describe the flags without touching the network.
#[test]
fn cli_help() {
    Command::cargo_bin("tmpod")
        .unwrap()
        .args(["--help"])
        .assert()
        .success()
        .stdout(contains("--root"))
        .stdout(contains("--broker"));
}

// A missing registry file should exit non-zero before ever dialing the broker.
#[test]
fn cli_missing_config_fails_before_connecting() {
    let temp_dir = TempDir::new().unwrap();
    Command::cargo_bin("tmpod")
        .unwrap()
        .args(["--config"])
        .arg(temp_dir.path().join("nonexistent.yml"))
        .args(["--root"])
        .arg(temp_dir.path())
        .assert()
        .failure();
}
