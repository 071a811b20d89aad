//! store/germ — durable commit header, stored twice at the head of a zone.
//!
//! Slot layout (LE), GERM_SIZE bytes, zero padded:
//!   [magic8 "CZGERM01"][format u32][payload_len u32][payload ...][crc32c u32]
//! crc32c covers magic..payload.
//!
//! Payload:
//!   [store_id u64][version u64][created_ms u64][updated_ms u64]
//!   [next_stem u32][seed_count u32] { seed } * seed_count
//!
//! A commit writes slot 0, syncs, then writes slot 1. Recovery takes the valid
//! slot with the higher version, so a torn write of either slot falls back to
//! the other one.

use anyhow::{anyhow, Result};
use byteorder::{ByteOrder, LittleEndian, ReadBytesExt, WriteBytesExt};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::consts::{GERM_FORMAT, GERM_MAGIC, GERM_SIZE};
use crate::error::TreeError;
use crate::tree::TreeSeed;

const GERM_FIXED: usize = 8 + 4 + 4;
/// Slot bytes used by everything except the seeds.
pub(crate) const GERM_OVERHEAD: usize = GERM_FIXED + 8 * 4 + 4 + 4 + 4;

#[derive(Debug, Clone)]
pub struct Germ {
    pub store_id: u64,
    /// Version of the last durable commit (0 for a fresh store).
    pub version: u64,
    pub created_ms: u64,
    pub updated_ms: u64,
    pub next_stem: u32,
    pub seeds: Vec<TreeSeed>,
}

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

impl Germ {
    pub fn fresh(store_id: u64) -> Self {
        let now = now_ms();
        Self {
            store_id,
            version: 0,
            created_ms: now,
            updated_ms: now,
            next_stem: 1,
            seeds: Vec::new(),
        }
    }

    /// Full GERM_SIZE slot image.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut payload = Vec::with_capacity(256);
        payload.write_u64::<LittleEndian>(self.store_id)?;
        payload.write_u64::<LittleEndian>(self.version)?;
        payload.write_u64::<LittleEndian>(self.created_ms)?;
        payload.write_u64::<LittleEndian>(self.updated_ms)?;
        payload.write_u32::<LittleEndian>(self.next_stem)?;
        payload.write_u32::<LittleEndian>(self.seeds.len() as u32)?;
        for s in &self.seeds {
            s.write(&mut payload)?;
        }

        let total = GERM_FIXED + payload.len() + 4;
        debug_assert_eq!(
            total,
            GERM_OVERHEAD + self.seeds.iter().map(|s| TreeSeed::encoded_len(&s.name, s.root.kind())).sum::<usize>()
        );
        if total > GERM_SIZE as usize {
            return Err(anyhow!(
                "germ too large: {} bytes for {} trees (slot is {} bytes)",
                total,
                self.seeds.len(),
                GERM_SIZE
            ));
        }

        let mut slot = vec![0u8; GERM_SIZE as usize];
        slot[0..8].copy_from_slice(GERM_MAGIC);
        LittleEndian::write_u32(&mut slot[8..12], GERM_FORMAT);
        LittleEndian::write_u32(&mut slot[12..16], payload.len() as u32);
        slot[GERM_FIXED..GERM_FIXED + payload.len()].copy_from_slice(&payload);
        let end = GERM_FIXED + payload.len();
        let crc = crc32c::crc32c(&slot[..end]);
        LittleEndian::write_u32(&mut slot[end..end + 4], crc);
        Ok(slot)
    }

    pub fn decode(slot: &[u8]) -> Result<Germ> {
        if slot.len() < GERM_FIXED + 4 {
            return Err(anyhow!("short germ slot ({} bytes)", slot.len()));
        }
        if &slot[0..8] != GERM_MAGIC {
            return Err(anyhow!("bad germ magic"));
        }
        let format = LittleEndian::read_u32(&slot[8..12]);
        if format != GERM_FORMAT {
            return Err(anyhow!("unsupported germ format {}", format));
        }
        let len = LittleEndian::read_u32(&slot[12..16]) as usize;
        let end = GERM_FIXED + len;
        if end + 4 > slot.len() {
            return Err(anyhow!("germ payload length {} exceeds slot", len));
        }
        let stored = LittleEndian::read_u32(&slot[end..end + 4]);
        let actual = crc32c::crc32c(&slot[..end]);
        if stored != actual {
            return Err(anyhow!("germ crc mismatch (stored {:08x}, actual {:08x})", stored, actual));
        }

        let mut r = &slot[GERM_FIXED..end];
        let store_id = r.read_u64::<LittleEndian>()?;
        let version = r.read_u64::<LittleEndian>()?;
        let created_ms = r.read_u64::<LittleEndian>()?;
        let updated_ms = r.read_u64::<LittleEndian>()?;
        let next_stem = r.read_u32::<LittleEndian>()?;
        let n = r.read_u32::<LittleEndian>()? as usize;
        let mut seeds = Vec::with_capacity(n.min(4096));
        for _ in 0..n {
            seeds.push(TreeSeed::read(&mut r)?);
        }
        if !r.is_empty() {
            return Err(anyhow!("{} trailing bytes after germ seeds", r.len()));
        }
        Ok(Germ {
            store_id,
            version,
            created_ms,
            updated_ms,
            next_stem,
            seeds,
        })
    }

    pub fn seed(&self, name: &str) -> Option<&TreeSeed> {
        self.seeds.iter().find(|s| s.name == name)
    }
}

/// Pick the valid slot with the higher version.
pub fn recover(zone: u32, slot0: &[u8], slot1: &[u8]) -> Result<Germ> {
    match (Germ::decode(slot0), Germ::decode(slot1)) {
        (Ok(a), Ok(b)) => Ok(if b.version > a.version { b } else { a }),
        (Ok(a), Err(e)) => {
            log::warn!("zone {}: germ slot 1 invalid ({}), using slot 0", zone, e);
            Ok(a)
        }
        (Err(e), Ok(b)) => {
            log::warn!("zone {}: germ slot 0 invalid ({}), using slot 1", zone, e);
            Ok(b)
        }
        (Err(e0), Err(e1)) => Err(TreeError::CorruptGerm {
            zone,
            reason: format!("slot 0: {}; slot 1: {}", e0, e1),
        }
        .into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::{TreeKind, TreeRoot};

    fn germ(version: u64) -> Germ {
        let mut g = Germ::fresh(42);
        g.version = version;
        g.next_stem = 3;
        g
    }

    #[test]
    fn encode_decode_keeps_fields() -> Result<()> {
        let g = germ(7);
        let slot = g.encode()?;
        assert_eq!(slot.len(), GERM_SIZE as usize);
        let d = Germ::decode(&slot)?;
        assert_eq!((d.store_id, d.version, d.next_stem), (42, 7, 3));
        assert_eq!(d.created_ms, g.created_ms);
        assert!(d.seeds.is_empty());
        Ok(())
    }

    #[test]
    fn dirty_seed_roots_cannot_be_encoded() {
        let mut g = germ(1);
        g.seeds.push(TreeSeed {
            name: "t".into(),
            stem: 1,
            root: TreeRoot::empty(TreeKind::BTree, 1),
        });
        assert!(g.encode().is_err());
    }

    #[test]
    fn recovery_prefers_higher_valid_version() -> Result<()> {
        let old = germ(4).encode()?;
        let new = germ(5).encode()?;
        assert_eq!(recover(0, &new, &old)?.version, 5);
        assert_eq!(recover(0, &old, &new)?.version, 5);

        let mut torn = new.clone();
        torn[20] ^= 0xff;
        assert_eq!(recover(0, &torn, &old)?.version, 4);

        let err = recover(9, &torn, &[0u8; 64]).unwrap_err();
        match err.downcast_ref::<TreeError>() {
            Some(TreeError::CorruptGerm { zone, .. }) => assert_eq!(*zone, 9),
            other => panic!("unexpected error {:?}", other),
        }
        Ok(())
    }
}
