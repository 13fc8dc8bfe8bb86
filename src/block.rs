//! The block data model: levels, block ids, delta-encoded JSON blocks.

use serde::{Deserialize, Serialize};

use crate::registry::SensorConfig;

/// Timestamps below this indicate an unsynced system clock (Feb 2009).
pub const TIMESTAMP_MIN: i64 = 1_234_567_890;

/// Grace window added to `close8` before a level-8 bucket is flushed.
pub const FLUSH_GRACE_SECS: i64 = 64;

pub type Bid = u32;
pub type Sid = String;
pub type Rid = u32;

/// log2 of a block's span in seconds. The pyramid is {8, 12, 16, 20}.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Level(pub u8);

impl Level {
    pub const L8: Level = Level(8);
    pub const L12: Level = Level(12);
    pub const L16: Level = Level(16);
    pub const L20: Level = Level(20);

    /// The four legal levels, finest first.
    pub const ALL: [Level; 4] = [Level::L8, Level::L12, Level::L16, Level::L20];

    pub fn span(self) -> i64 {
        1i64 << self.0
    }

    /// The next coarser level this one compacts into, or `None` at the top.
    pub fn coarser(self) -> Option<Level> {
        match self.0 {
            8 | 12 | 16 => Some(Level(self.0 + 4)),
            _ => None,
        }
    }

    /// Aligns a UNIX timestamp down to this level's window start.
    pub fn align(self, t: i64) -> Bid {
        (t.div_euclid(self.span()) * self.span()) as Bid
    }
}

/// `round(x) = floor(x + 5e-4, step = 1e-3)`: fractional deltas are rounded
/// to three decimals; integer deltas pass through unchanged.
pub fn round_delta(x: f64) -> f64 {
    let steps = ((x + 5e-4) / 1e-3).floor();
    // Re-quantize through an integer to avoid re-accumulating float noise.
    (steps as i64) as f64 / 1e3
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Header {
    pub vsn: u32,
    pub head: (i64, f64),
    pub tail: (i64, f64),
    pub cfg: SensorConfig,
}

/// A delta-encoded block: `{"h": H, "t": T, "v": V}` on disk, gzip-compressed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    #[serde(rename = "h")]
    pub h: Header,
    #[serde(rename = "t")]
    pub t: Vec<i64>,
    #[serde(rename = "v")]
    pub v: Vec<f64>,
}

impl Block {
    /// Opens a fresh block at a single sample.
    pub fn open(t: i64, v: f64, mut cfg: SensorConfig, unit: &str) -> Block {
        cfg.unit = unit.to_string();
        Block {
            h: Header {
                vsn: 1,
                head: (t, v),
                tail: (t, v),
                cfg,
            },
            t: vec![0],
            v: vec![0.0],
        }
    }

    /// Appends a sample if it is strictly newer than the current tail.
    /// Returns `false` (and drops the sample) on a monotonicity violation.
    pub fn push(&mut self, t: i64, v: f64) -> bool {
        if t <= self.h.tail.0 {
            return false;
        }
        let dt = t - self.h.tail.0;
        let dv = round_delta(v - self.h.tail.1);
        self.t.push(dt);
        self.v.push(dv);
        self.h.tail = (t, v);
        true
    }

    pub fn sum_t(&self) -> i64 {
        self.t.iter().sum()
    }

    pub fn sum_v(&self) -> f64 {
        self.v.iter().sum()
    }

    pub fn bid(&self, level: Level) -> Bid {
        level.align(self.h.head.0)
    }
}
