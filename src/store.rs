//! Filesystem layout, gzip read/write, integrity scrub, and the streaming
//! block reader the compactor consumes.

use std::cell::Cell;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use log::{debug, warn};

use crate::block::{Bid, Block, Level, Rid, Sid};
use crate::error::{Error, Result};

/// One gzip file per block, laid out `<root>/sensor/<sid>/<rid>/<lvl>/<bid>`.
pub struct BlockStore {
    root: PathBuf,
    /// Test seam: pins `free_blocks()`/`total_blocks()` to fixed values
    /// instead of statting the real filesystem, so `gc20`'s eviction branch
    /// can be exercised without actually filling a tempdir to the threshold.
    space_override: Cell<Option<(u64, u64)>>,
}

impl BlockStore {
    pub fn new(root: impl Into<PathBuf>) -> BlockStore {
        BlockStore {
            root: root.into(),
            space_override: Cell::new(None),
        }
    }

    #[cfg(test)]
    pub fn set_space_for_test(&self, free: u64, total: u64) {
        self.space_override.set(Some((free, total)));
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path(&self, sid: &str, rid: Rid, level: Level, bid: Bid) -> PathBuf {
        self.root
            .join("sensor")
            .join(sid)
            .join(rid.to_string())
            .join(level.0.to_string())
            .join(bid.to_string())
    }

    fn level_dir(&self, sid: &str, rid: Rid, level: Level) -> PathBuf {
        self.root
            .join("sensor")
            .join(sid)
            .join(rid.to_string())
            .join(level.0.to_string())
    }

    /// Writes a block. Never overwrites an existing file: the caller is
    /// expected to unlink the source group instead of calling this twice.
    pub fn write_block(
        &self,
        sid: &str,
        rid: Rid,
        level: Level,
        bid: Bid,
        block: &Block,
    ) -> Result<()> {
        let path = self.path(sid, rid, level, bid);
        if path.exists() {
            return Ok(());
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?;
        let mut encoder = GzEncoder::new(BufWriter::new(file), Compression::new(9));
        encoder.write_all(&serde_json::to_vec(block)?)?;
        let buffered = encoder.finish()?;
        let file = buffered.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
        Ok(())
    }

    /// Writes a raw, already-assembled gzip payload (used by the compactor,
    /// which streams the merged block directly rather than building a
    /// `Block` value in memory).
    pub fn write_raw(&self, sid: &str, rid: Rid, level: Level, bid: Bid) -> Result<RawBlockSink> {
        let path = self.path(sid, rid, level, bid);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?;
        Ok(RawBlockSink {
            path,
            encoder: GzEncoder::new(BufWriter::new(file), Compression::new(9)),
        })
    }

    pub fn read_block(&self, sid: &str, rid: Rid, level: Level, bid: Bid) -> Result<Block> {
        let path = self.path(sid, rid, level, bid);
        let bytes = self.read_decompressed(&path)?;
        serde_json::from_slice(&bytes).map_err(|e| Error::Malformed {
            path,
            reason: e.to_string(),
        })
    }

    fn read_decompressed(&self, path: &Path) -> Result<Vec<u8>> {
        let file = File::open(path)?;
        let mut reader = BufReader::new(GzDecoder::new(file));
        let mut out = Vec::new();
        reader.read_to_end(&mut out).map_err(|_| Error::CorruptBlock {
            path: path.to_path_buf(),
        })?;
        Ok(out)
    }

    /// Opens a streaming reader over the block's `h`/`t`/`v` segments,
    /// suitable for the compactor to forward without buffering the whole
    /// block in memory.
    pub fn open_block_stream(
        &self,
        sid: &str,
        rid: Rid,
        level: Level,
        bid: Bid,
    ) -> Result<super::compact::BlockStream<File>> {
        let path = self.path(sid, rid, level, bid);
        let file = File::open(&path)?;
        super::compact::BlockStream::open(path, file)
    }

    /// Hands the raw gzip bytes of a block to the broker for publishing.
    pub fn read_raw(&self, sid: &str, rid: Rid, level: Level, bid: Bid) -> Result<Vec<u8>> {
        let path = self.path(sid, rid, level, bid);
        Ok(fs::read(&path)?)
    }

    pub fn unlink(&self, sid: &str, rid: Rid, level: Level, bid: Bid) {
        let path = self.path(sid, rid, level, bid);
        if let Err(e) = fs::remove_file(&path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("unlink {}: {e}", path.display());
            }
        }
    }

    pub fn exists(&self, sid: &str, rid: Rid, level: Level, bid: Bid) -> bool {
        self.path(sid, rid, level, bid).exists()
    }

    /// Ordered directory listing: entries that parse as integers sort
    /// numerically ascending, others sort lexicographically after.
    pub fn list(&self, path: &Path) -> Result<Vec<String>> {
        let mut entries: Vec<String> = match fs::read_dir(path) {
            Ok(rd) => rd
                .filter_map(|e| e.ok())
                .filter_map(|e| e.file_name().into_string().ok())
                .collect(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        entries.sort_by(|a, b| match (a.parse::<u64>(), b.parse::<u64>()) {
            (Ok(x), Ok(y)) => x.cmp(&y),
            (Ok(_), Err(_)) => std::cmp::Ordering::Less,
            (Err(_), Ok(_)) => std::cmp::Ordering::Greater,
            (Err(_), Err(_)) => a.cmp(b),
        });
        Ok(entries)
    }

    /// Every sensor id currently present under `<root>/sensor`.
    pub fn sensors(&self) -> Result<Vec<Sid>> {
        self.list(&self.root.join("sensor"))
    }

    /// Every rid present for a sensor.
    pub fn rids(&self, sid: &str) -> Result<Vec<Rid>> {
        Ok(self
            .list(&self.root.join("sensor").join(sid))?
            .iter()
            .filter_map(|s| s.parse().ok())
            .collect())
    }

    /// Every bid present at `(sid, rid, level)`, ascending.
    pub fn bids(&self, sid: &str, rid: Rid, level: Level) -> Result<Vec<Bid>> {
        Ok(self
            .list(&self.level_dir(sid, rid, level))?
            .iter()
            .filter_map(|s| s.parse().ok())
            .collect())
    }

    /// Free space in 4 KiB units.
    pub fn free_blocks(&self) -> Result<u64> {
        if let Some((free, _)) = self.space_override.get() {
            return Ok(free);
        }
        let stat = nix::sys::statvfs::statvfs(&self.root)?;
        Ok(stat.blocks_available() * stat.fragment_size() / 4096)
    }

    /// Total space in 4 KiB units.
    pub fn total_blocks(&self) -> Result<u64> {
        if let Some((_, total)) = self.space_override.get() {
            return Ok(total);
        }
        let stat = nix::sys::statvfs::statvfs(&self.root)?;
        Ok(stat.blocks() * stat.fragment_size() / 4096)
    }

    /// (sid, rid, bid) of every block at `level`, across the whole store.
    fn all_blocks_at_level(&self, level: Level) -> Result<Vec<(Sid, Rid, Bid)>> {
        let mut out = Vec::new();
        for sid in self.sensors()? {
            for rid in self.rids(&sid)? {
                for bid in self.bids(&sid, rid, level)? {
                    out.push((sid.clone(), rid, bid));
                }
            }
        }
        Ok(out)
    }

    /// Startup integrity scrub (§4.1): checks the newest block at each level
    /// for gzip corruption from a torn write, then cleans up any finer block
    /// whose coarse compaction already completed.
    pub fn startup_scrub(&self) -> Result<()> {
        for level in [Level::L20, Level::L16, Level::L12, Level::L8] {
            if let Some((sid, rid, bid)) = self
                .all_blocks_at_level(level)?
                .into_iter()
                .max_by_key(|(_, _, bid)| *bid)
            {
                let path = self.path(&sid, rid, level, bid);
                if self.read_decompressed(&path).is_err() {
                    warn!("startup scrub: corrupt {}", path.display());
                    let _ = fs::remove_file(&path);
                }
            }
        }

        for level in [Level::L8, Level::L12, Level::L16] {
            let coarse = level.coarser().expect("L8/L12/L16 always have a coarser level");
            for (sid, rid, bid) in self.all_blocks_at_level(level)? {
                let cid = coarse.align(bid as i64);
                if self.exists(&sid, rid, coarse, cid) {
                    debug!(
                        "startup scrub: {sid}/{rid}/{}/{bid} superseded by {}/{cid}",
                        level.0, coarse.0
                    );
                    self.unlink(&sid, rid, level, bid);
                }
            }
        }

        Ok(())
    }
}

/// A gzip sink for a block being assembled incrementally (the compactor's
/// merged output). Exposed as plain `Write` plus an explicit `finish` that
/// fsyncs the path.
pub struct RawBlockSink {
    path: PathBuf,
    encoder: GzEncoder<BufWriter<File>>,
}

impl RawBlockSink {
    pub fn finish(self) -> Result<()> {
        let buffered = self.encoder.finish()?;
        let file = buffered.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
        Ok(())
    }
}

impl Write for RawBlockSink {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.encoder.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.encoder.flush()
    }
}
