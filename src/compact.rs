//! The streaming merge of N sibling blocks at level `L` into one block at
//! level `L+4`, paced as an explicit state machine so the tick loop stays
//! responsive to ingest traffic (§4.4, §9).

use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::path::PathBuf;

use flate2::read::GzDecoder;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::block::{round_delta, Bid, Header, Level, Rid, Sid};
use crate::broker::Broker;
use crate::error::{Error, Result};
use crate::store::BlockStore;

const CHUNK_SIZE: usize = 4096;
const HEADER_ANCHOR: &[u8] = b",\"t\":[0";
const TV_ANCHOR: &[u8] = b"],\"v\":[0";
const TAIL_ANCHOR: &[u8] = b"]}";
const HEADER_PREFIX: &[u8] = b"{\"h\":";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Segment {
    Header,
    Time,
    Value,
}

/// One parse event out of a block's gzip stream: a chunk of raw bytes
/// belonging to `segment`, and whether it is the last chunk of that segment.
pub struct BlockEvent {
    pub segment: Segment,
    pub chunk: Vec<u8>,
    pub last: bool,
}

/// Scans a gzip-compressed block for its three segments without ever
/// holding the whole decompressed document in memory: reads in 4 KiB
/// chunks, searches for the literal anchors that separate `h`/`t`/`v`, and
/// tolerates an anchor falling across a chunk boundary.
pub struct BlockStream<R: Read> {
    path: PathBuf,
    reader: BufReader<GzDecoder<R>>,
    buf: Vec<u8>,
    segment: Segment,
    done: bool,
}

impl<R: Read> BlockStream<R> {
    pub fn open(path: PathBuf, inner: R) -> Result<BlockStream<R>> {
        let mut stream = BlockStream {
            path,
            reader: BufReader::new(GzDecoder::new(inner)),
            buf: Vec::new(),
            segment: Segment::Header,
            done: false,
        };
        stream.skip_prefix(HEADER_PREFIX)?;
        Ok(stream)
    }

    fn fill(&mut self) -> Result<usize> {
        let mut tmp = [0u8; CHUNK_SIZE];
        let n = self
            .reader
            .read(&mut tmp)
            .map_err(|_| Error::CorruptBlock {
                path: self.path.clone(),
            })?;
        self.buf.extend_from_slice(&tmp[..n]);
        Ok(n)
    }

    fn skip_prefix(&mut self, prefix: &[u8]) -> Result<()> {
        while self.buf.len() < prefix.len() {
            if self.fill()? == 0 {
                return Err(Error::Malformed {
                    path: self.path.clone(),
                    reason: "truncated before header prefix".into(),
                });
            }
        }
        if &self.buf[..prefix.len()] != prefix {
            return Err(Error::Malformed {
                path: self.path.clone(),
                reason: "missing {\"h\": prefix".into(),
            });
        }
        self.buf.drain(..prefix.len());
        Ok(())
    }

    fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
        haystack
            .windows(needle.len())
            .position(|window| window == needle)
    }

    /// Returns the next chunk for the current segment, or `None` once the
    /// stream is exhausted.
    pub fn next_event(&mut self) -> Result<Option<BlockEvent>> {
        if self.done {
            return Ok(None);
        }
        let anchor: &[u8] = match self.segment {
            Segment::Header => HEADER_ANCHOR,
            Segment::Time => TV_ANCHOR,
            Segment::Value => TAIL_ANCHOR,
        };
        loop {
            if let Some(pos) = Self::find(&self.buf, anchor) {
                let chunk = self.buf[..pos].to_vec();
                self.buf.drain(..pos + anchor.len());
                let segment = self.segment;
                self.segment = match segment {
                    Segment::Header => Segment::Time,
                    Segment::Time => Segment::Value,
                    Segment::Value => {
                        self.done = true;
                        segment
                    }
                };
                return Ok(Some(BlockEvent {
                    segment,
                    chunk,
                    last: true,
                }));
            }

            // Bound memory: once we're holding several chunks with no
            // anchor in sight, flush everything except a tail long enough
            // that a split anchor can still be found on the next fill.
            if self.buf.len() > CHUNK_SIZE * 4 {
                let keep = anchor.len().saturating_sub(1);
                let flush_len = self.buf.len() - keep;
                let chunk = self.buf[..flush_len].to_vec();
                self.buf.drain(..flush_len);
                return Ok(Some(BlockEvent {
                    segment: self.segment,
                    chunk,
                    last: false,
                }));
            }

            if self.fill()? == 0 {
                return Err(Error::Malformed {
                    path: self.path.clone(),
                    reason: format!("missing anchor for segment {:?}", self.segment),
                });
            }
        }
    }

    /// Reads the whole header segment (small, never chunked in practice)
    /// and parses it.
    pub fn read_header(&mut self) -> Result<Header> {
        let mut bytes = Vec::new();
        loop {
            match self.next_event()? {
                Some(ev) if ev.segment == Segment::Header => {
                    bytes.extend_from_slice(&ev.chunk);
                    if ev.last {
                        break;
                    }
                }
                _ => {
                    return Err(Error::Malformed {
                        path: self.path.clone(),
                        reason: "expected header segment".into(),
                    })
                }
            }
        }
        serde_json::from_slice(&bytes).map_err(|e| Error::Malformed {
            path: self.path.clone(),
            reason: e.to_string(),
        })
    }
}

/// Cursor over the sensor/rid/level traversal the compactor walks.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Cursor {
    sid_idx: usize,
    rid_idx: usize,
    level_idx: usize,
}

const COMPACT_LEVELS: [Level; 3] = [Level::L8, Level::L12, Level::L16];

/// Outcome of a single `step()` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// One compaction group was fully processed (or skipped as already
    /// compacted).
    Progressed,
    /// Waiting out the pacing budget after the last completed group.
    Paced,
    /// Traversal exhausted; the caller should drop this state machine.
    Done,
}

/// The compactor's cooperative generator, reimplemented as an explicit state
/// machine: each `step()` call performs at most one group merge, then the
/// caller keeps calling `step()` — receiving `Paced` — until the pacing
/// deadline passes.
pub struct Compactor {
    sids: Vec<Sid>,
    cursor: Cursor,
    costart: i64,
    costop: Option<i64>,
    /// The compactor's own advancing view of the next level-8 closure
    /// boundary (§4.4 step 6). The tick loop feeds this into
    /// `Flusher::advance_close8_at_least` after every step so the flusher
    /// never reopens a window the compactor has already started folding
    /// into a coarser block.
    pub close8: Bid,
}

impl Compactor {
    /// Starts a fresh traversal over the sensors currently on disk.
    pub fn new(store: &BlockStore, now: i64, close8: Bid) -> Result<Compactor> {
        let mut sids = store.sensors()?;
        sids.sort();
        Ok(Compactor {
            sids,
            cursor: Cursor {
                sid_idx: 0,
                rid_idx: 0,
                level_idx: 0,
            },
            costart: now,
            costop: None,
            close8,
        })
    }

    fn rids_for(&self, store: &BlockStore, sid: &str) -> Result<Vec<Rid>> {
        let mut rids = store.rids(sid)?;
        rids.sort();
        Ok(rids)
    }

    /// Advances the traversal cursor to the next `(sid, rid, level)` triple.
    fn advance_cursor(&mut self, store: &BlockStore) -> Result<bool> {
        loop {
            if self.cursor.sid_idx >= self.sids.len() {
                return Ok(false);
            }
            let sid = self.sids[self.cursor.sid_idx].clone();
            let rids = self.rids_for(store, &sid)?;

            if self.cursor.rid_idx >= rids.len() {
                self.cursor.sid_idx += 1;
                self.cursor.rid_idx = 0;
                self.cursor.level_idx = 0;
                continue;
            }
            if self.cursor.level_idx >= COMPACT_LEVELS.len() {
                self.cursor.rid_idx += 1;
                self.cursor.level_idx = 0;
                continue;
            }
            return Ok(true);
        }
    }

    /// `ceil(now/256 + 0.5) * 256`, computed over integers.
    fn next_close8(now: i64) -> Bid {
        let span = Level::L8.span();
        let shifted = now + span / 2;
        (shifted.div_euclid(span) + if shifted.rem_euclid(span) != 0 { 1 } else { 0 }) as Bid * span as Bid
    }

    /// Runs one step of the traversal. `now` drives both group selection
    /// (§4.4 step 1) and pacing (§4.4 step 6). Loops internally over
    /// `(sid, rid, level)` triples with no eligible group rather than
    /// making the caller drive empty steps one at a time.
    pub fn step(&mut self, store: &BlockStore, broker: &mut dyn Broker, now: i64) -> Result<Step> {
        if let Some(costop) = self.costop {
            let deadline = costop + 1 + (costop - self.costart) / 2;
            self.close8 = Self::next_close8(now);
            if now < deadline {
                return Ok(Step::Paced);
            }
            self.costart = now;
            self.costop = None;
        }

        loop {
            if !self.advance_cursor(store)? {
                return Ok(Step::Done);
            }

            let sid = self.sids[self.cursor.sid_idx].clone();
            let rids = self.rids_for(store, &sid)?;
            let rid = rids[self.cursor.rid_idx];
            let level = COMPACT_LEVELS[self.cursor.level_idx];
            self.cursor.level_idx += 1;

            if self.try_compact_group(store, broker, &sid, rid, level, now)?.is_some() {
                self.costop = Some(now);
                return Ok(Step::Progressed);
            }
        }
    }

    /// Attempts one compaction group at `(sid, rid, level)`. Returns
    /// `Some(())` if a group was selected (merged or skipped as
    /// already-compacted), `None` if no group is eligible yet.
    fn try_compact_group(
        &self,
        store: &BlockStore,
        broker: &mut dyn Broker,
        sid: &str,
        rid: Rid,
        level: Level,
        now: i64,
    ) -> Result<Option<()>> {
        let coarse = level.coarser().expect("compact levels always have a coarser level");
        let bids = store.bids(sid, rid, level)?;
        let Some(&first) = bids.first() else {
            return Ok(None);
        };

        let coarse_window_of = |bid: Bid| (bid as i64).div_euclid(coarse.span());
        let current_coarse_window = now.div_euclid(coarse.span());
        if coarse_window_of(first) >= current_coarse_window {
            return Ok(None);
        }

        let group_window = coarse_window_of(first);
        let group: Vec<Bid> = bids
            .into_iter()
            .take_while(|&bid| coarse_window_of(bid) == group_window)
            .collect();

        let cid = coarse.align(first as i64);
        if store.exists(sid, rid, coarse, cid) {
            info!("compact: {sid}/{rid}/{}/{cid} already exists, unlinking inputs", coarse.0);
            for bid in &group {
                store.unlink(sid, rid, level, *bid);
            }
            return Ok(Some(()));
        }

        match self.merge_group(store, sid, rid, level, coarse, cid, &group) {
            Ok(()) => {
                for bid in &group {
                    store.unlink(sid, rid, level, *bid);
                }
                let topic = format!("/sensor/{sid}/tmpo/{rid}/{}/{cid}/gz", coarse.0);
                let payload = store.read_raw(sid, rid, coarse, cid)?;
                broker.publish(&topic, payload, 0, false)?;
                info!(
                    "compact: merged {} inputs into {sid}/{rid}/{}/{cid}",
                    group.len(),
                    coarse.0
                );
                Ok(Some(()))
            }
            Err(e) => {
                warn!("compact: group {sid}/{rid}/{}/{cid} aborted: {e}", coarse.0);
                Ok(Some(()))
            }
        }
    }

    fn merge_group(
        &self,
        store: &BlockStore,
        sid: &str,
        rid: Rid,
        level: Level,
        coarse: Level,
        cid: Bid,
        group: &[Bid],
    ) -> Result<()> {
        debug!("compact: merging {} blocks at {sid}/{rid}/{}/{cid}", group.len(), coarse.0);

        let mut streams: Vec<BlockStream<File>> = group
            .iter()
            .map(|&bid| store.open_block_stream(sid, rid, level, bid))
            .collect::<Result<_>>()?;
        let mut headers: Vec<Header> = streams
            .iter_mut()
            .map(|s| s.read_header())
            .collect::<Result<_>>()?;

        let merged_header = Header {
            vsn: 1,
            head: headers[0].head,
            tail: headers[headers.len() - 1].tail.clone(),
            cfg: headers[headers.len() - 1].cfg.clone(),
        };

        let mut sink = store.write_raw(sid, rid, coarse, cid)?;
        sink.write_all(b"{\"h\":")?;
        sink.write_all(&serde_json::to_vec(&merged_header)?)?;
        sink.write_all(b",\"t\":[0")?;
        for (i, stream) in streams.iter_mut().enumerate() {
            if i > 0 {
                let stitch = headers[i].head.0 - headers[i - 1].tail.0;
                sink.write_all(format!(",{stitch}").as_bytes())?;
            }
            Self::forward_segment(stream, Segment::Time, &mut sink)?;
        }
        sink.write_all(b"],\"v\":[0")?;
        for (i, stream) in streams.iter_mut().enumerate() {
            if i > 0 {
                let stitch = round_delta(headers[i].head.1 - headers[i - 1].tail.1);
                sink.write_all(format!(",{stitch}").as_bytes())?;
            }
            Self::forward_segment(stream, Segment::Value, &mut sink)?;
        }
        sink.write_all(b"]}")?;
        sink.finish()?;

        // Drop the input readers/writers before returning so memory used by
        // this group is released ahead of the next one (§5 memory pacing).
        drop(streams);
        headers.clear();
        Ok(())
    }

    fn forward_segment(
        stream: &mut BlockStream<File>,
        expect: Segment,
        sink: &mut crate::store::RawBlockSink,
    ) -> Result<()> {
        loop {
            let ev = stream.next_event()?.ok_or_else(|| Error::Malformed {
                path: PathBuf::new(),
                reason: "stream ended mid-segment".into(),
            })?;
            if ev.segment != expect {
                return Err(Error::Malformed {
                    path: PathBuf::new(),
                    reason: format!("expected segment {expect:?}, got {:?}", ev.segment),
                });
            }
            sink.write_all(&ev.chunk)?;
            if ev.last {
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::FakeBroker;
    use crate::registry::SensorConfig;
    use tempfile::TempDir;

    fn cfg() -> SensorConfig {
        SensorConfig {
            id: "cd".into(),
            rid: 3,
            unit: "kWh".into(),
            data_type: "gauge".into(),
        }
    }

    fn seed_blocks(store: &BlockStore, base: i64, n: u32) -> Vec<crate::block::Block> {
        let mut blocks = Vec::new();
        for i in 0..n {
            let t0 = base + (i as i64) * 256;
            let mut b = crate::block::Block::open(t0, i as f64, cfg(), "kWh");
            b.push(t0 + 100, i as f64 + 1.0);
            store.write_block("cd", 3, Level::L8, Level::L8.align(t0), &b).unwrap();
            blocks.push(b);
        }
        blocks
    }

    #[test]
    fn compacts_sixteen_level8_blocks_into_one_level12() {
        let dir = TempDir::new().unwrap();
        let store = BlockStore::new(dir.path());
        let base = Level::L12.align(1_700_000_000);
        let blocks = seed_blocks(&store, base, 16);

        let now = base + Level::L12.span() + 10;
        let mut broker = FakeBroker::new();
        let mut compactor = Compactor::new(&store, now, 0).unwrap();
        loop {
            match compactor.step(&store, &mut broker, now).unwrap() {
                Step::Done => break,
                Step::Paced => panic!("should not pace with a single group"),
                Step::Progressed => {}
            }
        }

        let cid = Level::L12.align(base);
        assert!(store.exists("cd", 3, Level::L12, cid));
        for b in &blocks {
            assert!(!store.exists("cd", 3, Level::L8, b.bid(Level::L8)));
        }

        let merged = store.read_block("cd", 3, Level::L12, cid).unwrap();
        assert_eq!(merged.h.head, blocks[0].h.head);
        assert_eq!(merged.h.tail, blocks[15].h.tail);
        assert_eq!(merged.h.cfg, blocks[15].h.cfg);
        assert_eq!(merged.sum_t(), merged.h.tail.0 - merged.h.head.0);
        assert!((merged.sum_v() - (merged.h.tail.1 - merged.h.head.1)).abs() < 1e-3);

        let topic = format!("/sensor/cd/tmpo/3/12/{cid}/gz");
        assert!(broker.published.iter().any(|(t, ..)| t == &topic));
    }

    #[test]
    fn compaction_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let store = BlockStore::new(dir.path());
        let base = Level::L12.align(1_700_000_000);
        seed_blocks(&store, base, 16);
        let now = base + Level::L12.span() + 10;
        let mut broker = FakeBroker::new();

        for _ in 0..2 {
            let mut compactor = Compactor::new(&store, now, 0).unwrap();
            while compactor.step(&store, &mut broker, now).unwrap() != Step::Done {}
        }

        let cid = Level::L12.align(base);
        assert!(store.exists("cd", 3, Level::L12, cid));
    }

    #[test]
    fn partial_group_merges_fewer_than_sixteen() {
        let dir = TempDir::new().unwrap();
        let store = BlockStore::new(dir.path());
        let base = Level::L12.align(1_700_000_000);
        let blocks = seed_blocks(&store, base, 5);
        let now = base + Level::L12.span() + 10;
        let mut broker = FakeBroker::new();

        let mut compactor = Compactor::new(&store, now, 0).unwrap();
        while compactor.step(&store, &mut broker, now).unwrap() != Step::Done {}

        let cid = Level::L12.align(base);
        let merged = store.read_block("cd", 3, Level::L12, cid).unwrap();
        assert_eq!(merged.h.head, blocks[0].h.head);
        assert_eq!(merged.h.tail, blocks[4].h.tail);
    }
}
