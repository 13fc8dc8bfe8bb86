//! Fleet-wide eviction of the oldest level-20 block when free space runs low
//! (§4.5).

use log::info;

use crate::block::Level;
use crate::error::Result;
use crate::store::BlockStore;

/// Fraction of total space in use above which `gc20` starts evicting.
const FILL_THRESHOLD: f64 = 0.75;

/// Runs one GC pass. Returns whether anything was unlinked.
pub fn gc20(store: &BlockStore) -> Result<bool> {
    let free = store.free_blocks()? as f64;
    let total = store.total_blocks()? as f64;
    if total == 0.0 {
        return Ok(false);
    }
    let fill = 1.0 - free / total;
    if fill < FILL_THRESHOLD {
        return Ok(false);
    }

    let mut all = Vec::new();
    for sid in store.sensors()? {
        for rid in store.rids(&sid)? {
            for bid in store.bids(&sid, rid, Level::L20)? {
                all.push((sid.clone(), rid, bid));
            }
        }
    }

    let oldest = match all.iter().map(|(_, _, bid)| *bid).min() {
        Some(bid) => bid,
        None => return Ok(false),
    };

    let mut evicted = false;
    for (sid, rid, bid) in all {
        if bid == oldest {
            store.unlink(&sid, rid, Level::L20, bid);
            evicted = true;
        }
    }
    if evicted {
        info!("gc20: evicted level-20 blocks at bid={oldest} (fill={fill:.2})");
    }
    Ok(evicted)
}
