//! store/zone — append-only zone file.
//!
//! Layout: [germ slot 0][germ slot 1][chunk]... with every chunk starting on
//! a BLOCK_SIZE boundary. Zones are created through tmp + rename so a zone
//! file on disk always carries a valid germ.

use anyhow::{anyhow, Context, Result};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::consts::{BLOCK_SIZE, CHUNK_HDR_SIZE, GERM_SIZE, ZONE_EXT, ZONE_HEAD_SIZE, ZONE_PREFIX};
use crate::error::TreeError;
use crate::store::chunk::{Chunk, ChunkHeader};
use crate::store::germ::{self, Germ};

pub fn zone_file_name(id: u32) -> String {
    format!("{}{:06}.{}", ZONE_PREFIX, id, ZONE_EXT)
}

/// Zone id encoded in a file name, if it is a zone file.
pub fn parse_zone_file_name(name: &str) -> Option<u32> {
    let stem = name.strip_prefix(ZONE_PREFIX)?;
    let digits = stem.strip_suffix(ZONE_EXT)?.strip_suffix('.')?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

#[cfg(unix)]
pub(crate) fn fsync_dir(dir: &Path) -> std::io::Result<()> {
    File::open(dir)?.sync_all()
}

#[cfg(not(unix))]
pub(crate) fn fsync_dir(_dir: &Path) -> std::io::Result<()> {
    Ok(())
}

#[inline]
fn align_up(n: u64) -> u64 {
    n.div_ceil(BLOCK_SIZE) * BLOCK_SIZE
}

#[derive(Debug)]
pub struct Zone {
    id: u32,
    path: PathBuf,
    file: Mutex<File>,
    /// End of the last durable chunk.
    len: AtomicU64,
}

impl Zone {
    /// Create zone `id` in `dir`, already carrying `germ` in both slots.
    pub fn create(dir: &Path, id: u32, germ: &Germ, fsync: bool) -> Result<Zone> {
        let path = dir.join(zone_file_name(id));
        if path.exists() {
            return Err(anyhow!("zone file already exists: {}", path.display()));
        }
        let tmp = path.with_extension(format!("{}.tmp", ZONE_EXT));
        let slot = germ.encode()?;
        {
            let mut f = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp)
                .with_context(|| format!("create {}", tmp.display()))?;
            f.write_all(&slot)?;
            f.write_all(&slot)?;
            if fsync {
                f.sync_all()?;
            }
        }
        fs::rename(&tmp, &path)
            .with_context(|| format!("rename {} -> {}", tmp.display(), path.display()))?;
        if fsync {
            let _ = fsync_dir(dir);
        }
        Self::open_path(id, path)
    }

    /// Open an existing zone file.
    pub fn open(dir: &Path, id: u32) -> Result<Zone> {
        Self::open_path(id, dir.join(zone_file_name(id)))
    }

    fn open_path(id: u32, path: PathBuf) -> Result<Zone> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .with_context(|| format!("open zone {}", path.display()))?;
        let len = file.metadata()?.len();
        if len < ZONE_HEAD_SIZE {
            return Err(TreeError::CorruptGerm {
                zone: id,
                reason: format!("zone file too short ({} bytes)", len),
            }
            .into());
        }
        Ok(Zone {
            id,
            path,
            file: Mutex::new(file),
            len: AtomicU64::new(len),
        })
    }

    #[inline]
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bytes in use (germ slots plus chunks).
    #[inline]
    pub fn size(&self) -> u64 {
        self.len.load(Ordering::Acquire)
    }

    /// Where the next chunk header will be written.
    pub fn next_chunk_offset(&self) -> u64 {
        align_up(self.size())
    }

    fn with_file<T>(&self, f: impl FnOnce(&mut File) -> std::io::Result<T>) -> Result<T> {
        let mut file = self
            .file
            .lock()
            .map_err(|_| anyhow!("zone {} file handle poisoned", self.id))?;
        f(&mut file).map_err(|e| TreeError::Io(e).into())
    }

    pub fn read_at(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        if offset + len as u64 > self.size() {
            return Err(TreeError::CorruptBlock {
                zone: self.id,
                offset,
                reason: format!("read of {} bytes past zone end {}", len, self.size()),
            }
            .into());
        }
        let mut buf = vec![0u8; len];
        self.with_file(|f| {
            f.seek(SeekFrom::Start(offset))?;
            f.read_exact(&mut buf)
        })
        .with_context(|| format!("read zone {} at {}", self.id, offset))?;
        Ok(buf)
    }

    /// Write a finished chunk at `offset` (from `next_chunk_offset`). The
    /// zone length only moves once the write (and fsync) succeeded.
    pub fn write_chunk(&self, offset: u64, bytes: &[u8], fsync: bool) -> Result<()> {
        if offset != self.next_chunk_offset() {
            return Err(anyhow!(
                "zone {}: chunk offset {} is not the append position {}",
                self.id,
                offset,
                self.next_chunk_offset()
            ));
        }
        self.with_file(|f| {
            f.seek(SeekFrom::Start(offset))?;
            f.write_all(bytes)?;
            if fsync {
                f.sync_data()?;
            }
            Ok(())
        })
        .with_context(|| format!("append chunk to zone {}", self.id))?;
        self.len.store(offset + bytes.len() as u64, Ordering::Release);
        Ok(())
    }

    /// Write one germ slot.
    pub(crate) fn write_germ_slot(&self, slot: u64, image: &[u8], fsync: bool) -> Result<()> {
        self.with_file(|f| {
            f.seek(SeekFrom::Start(slot * GERM_SIZE))?;
            f.write_all(image)?;
            if fsync {
                f.sync_data()?;
            }
            Ok(())
        })
        .with_context(|| format!("write germ slot {} of zone {}", slot, self.id))
    }

    /// Write the germ to slot 0, then slot 1, each made durable before the next.
    pub fn write_germ(&self, germ: &Germ, fsync: bool) -> Result<()> {
        let image = germ.encode()?;
        self.write_germ_slot(0, &image, fsync)?;
        self.write_germ_slot(1, &image, fsync)
    }

    pub fn read_germ(&self) -> Result<Germ> {
        let slot0 = self.read_at(0, GERM_SIZE as usize)?;
        let slot1 = self.read_at(GERM_SIZE, GERM_SIZE as usize)?;
        germ::recover(self.id, &slot0, &slot1)
    }

    /// Walk the chunks of the zone, stopping at the first one that does not
    /// validate (an unlinked tail left by a failed commit).
    pub fn scan_chunks(&self) -> Result<Vec<Chunk>> {
        let mut out = Vec::new();
        let end = self.size();
        let mut at = ZONE_HEAD_SIZE;
        while at + CHUNK_HDR_SIZE as u64 <= end {
            let head = self.read_at(at, CHUNK_HDR_SIZE)?;
            let h = match ChunkHeader::decode(&head) {
                Ok(h) => h,
                Err(_) => break,
            };
            let body_at = at + CHUNK_HDR_SIZE as u64;
            if body_at + h.body_len > end {
                break;
            }
            let body = self.read_at(body_at, h.body_len as usize)?;
            if crc32c::crc32c(&body) != h.crc32c {
                log::warn!("zone {}: chunk at {} fails crc, stopping scan", self.id, at);
                break;
            }
            let size = CHUNK_HDR_SIZE as u64 + h.body_len;
            out.push(Chunk {
                version: h.version,
                zone: self.id,
                offset: at,
                size,
                page_count: h.page_count,
            });
            at = align_up(at + size);
        }
        Ok(out)
    }

    /// Remove the zone file. The handle must not be used afterwards. A file
    /// that is already gone is not an error.
    pub(crate) fn remove_file(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            r => r.with_context(|| format!("remove zone {}", self.path.display())),
        }
    }
}

/// Ids of the zone files present in `dir`, ascending.
pub fn list_zone_ids(dir: &Path) -> Result<Vec<u32>> {
    let mut ids = Vec::new();
    for e in fs::read_dir(dir).with_context(|| format!("read dir {}", dir.display()))? {
        let e = e?;
        if let Some(id) = e.file_name().to_str().and_then(parse_zone_file_name) {
            ids.push(id);
        }
    }
    ids.sort_unstable();
    Ok(ids)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::block::PageCodec;
    use crate::store::chunk::ChunkWriter;

    fn unique_dir(prefix: &str) -> PathBuf {
        let mut p = std::env::temp_dir();
        let t = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        p.push(format!("canopy-zone-{}-{}-{}", prefix, std::process::id(), t));
        fs::create_dir_all(&p).unwrap();
        p
    }

    #[test]
    fn file_names_roundtrip() {
        assert_eq!(zone_file_name(12), "zone-000012.czone");
        assert_eq!(parse_zone_file_name("zone-000012.czone"), Some(12));
        assert_eq!(parse_zone_file_name("zone-000012.czone.tmp"), None);
        assert_eq!(parse_zone_file_name("zone-.czone"), None);
        assert_eq!(parse_zone_file_name("LOCK"), None);
    }

    #[test]
    fn chunks_append_aligned_and_scan() -> Result<()> {
        let dir = unique_dir("scan");
        let zone = Zone::create(&dir, 0, &Germ::fresh(1), false)?;
        assert_eq!(zone.size(), ZONE_HEAD_SIZE);
        assert_eq!(list_zone_ids(&dir)?, vec![0]);

        for v in 1..=3u64 {
            let at = zone.next_chunk_offset();
            assert_eq!(at % BLOCK_SIZE, 0);
            let w = ChunkWriter::new(0, at, PageCodec::None, 0);
            let (bytes, _) = w.finish(v);
            zone.write_chunk(at, &bytes, false)?;
        }
        let chunks = zone.scan_chunks()?;
        assert_eq!(chunks.iter().map(|c| c.version).collect::<Vec<_>>(), vec![1, 2, 3]);
        assert!(zone.write_chunk(ZONE_HEAD_SIZE, b"x", false).is_err());

        let reopened = Zone::open(&dir, 0)?;
        assert_eq!(reopened.read_germ()?.store_id, 1);
        assert_eq!(reopened.scan_chunks()?.len(), 3);
        fs::remove_dir_all(&dir)?;
        Ok(())
    }
}
