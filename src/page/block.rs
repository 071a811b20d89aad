//! page/block — binary page block.
//!
//! Layout (LE):
//!   [tag u8][codec u8][flags u16][stem u32][version u64]
//!   [body_len u32][raw_len u32][crc32c u32]              = BLOCK_HDR_SIZE
//!   [body ...]                                            (body_len bytes)
//!
//! - codec = CODEC_ZSTD: body is zstd(raw), raw_len is the decoded size.
//!   The writer falls back to CODEC_NONE when compression does not help.
//! - crc32c covers the header (crc field zeroed) and the stored body.

use anyhow::{anyhow, Result};
use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};

use super::{decode_cached, CachedPage, TreePage};
use crate::consts::{BLOCK_HDR_SIZE, CODEC_NONE, CODEC_ZSTD, MAX_BLOCK_BODY};
use crate::error::TreeError;

/// Body compression of written page blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PageCodec {
    None,
    Zstd,
}

impl PageCodec {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" | "off" | "0" => Some(PageCodec::None),
            "zstd" | "1" => Some(PageCodec::Zstd),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    pub tag: u8,
    pub codec: u8,
    pub flags: u16,
    pub stem: u32,
    pub version: u64,
    pub body_len: u32,
    pub raw_len: u32,
    pub crc32c: u32,
}

impl BlockHeader {
    fn write(&self, buf: &mut [u8]) {
        buf[0] = self.tag;
        buf[1] = self.codec;
        LittleEndian::write_u16(&mut buf[2..4], self.flags);
        LittleEndian::write_u32(&mut buf[4..8], self.stem);
        LittleEndian::write_u64(&mut buf[8..16], self.version);
        LittleEndian::write_u32(&mut buf[16..20], self.body_len);
        LittleEndian::write_u32(&mut buf[20..24], self.raw_len);
        LittleEndian::write_u32(&mut buf[24..28], self.crc32c);
    }

    fn read(buf: &[u8]) -> Self {
        Self {
            tag: buf[0],
            codec: buf[1],
            flags: LittleEndian::read_u16(&buf[2..4]),
            stem: LittleEndian::read_u32(&buf[4..8]),
            version: LittleEndian::read_u64(&buf[8..16]),
            body_len: LittleEndian::read_u32(&buf[16..20]),
            raw_len: LittleEndian::read_u32(&buf[20..24]),
            crc32c: LittleEndian::read_u32(&buf[24..28]),
        }
    }
}

fn block_crc(block: &[u8]) -> u32 {
    let crc = crc32c::crc32c(&block[..24]);
    let crc = crc32c::crc32c_append(crc, &[0u8; 4]);
    crc32c::crc32c_append(crc, &block[BLOCK_HDR_SIZE..])
}

/// Encode `page` as a block appended to `out`. Returns the block length.
pub fn encode_block<P: TreePage>(
    page: &P,
    stem: u32,
    codec: PageCodec,
    zstd_level: i32,
    out: &mut Vec<u8>,
) -> Result<usize> {
    let mut raw = Vec::with_capacity(page.estimated_size());
    page.encode_body(&mut raw)?;
    if raw.len() > MAX_BLOCK_BODY {
        return Err(anyhow!("page body too large: {} bytes", raw.len()));
    }

    let (codec_id, body) = match codec {
        PageCodec::Zstd => match zstd::bulk::compress(&raw, zstd_level) {
            Ok(comp) if comp.len() < raw.len() => (CODEC_ZSTD, comp),
            _ => (CODEC_NONE, raw.clone()),
        },
        PageCodec::None => (CODEC_NONE, raw.clone()),
    };

    let start = out.len();
    out.resize(start + BLOCK_HDR_SIZE, 0);
    out.extend_from_slice(&body);

    let mut h = BlockHeader {
        tag: page.tag(),
        codec: codec_id,
        flags: 0,
        stem,
        version: page.version(),
        body_len: body.len() as u32,
        raw_len: raw.len() as u32,
        crc32c: 0,
    };
    h.write(&mut out[start..start + BLOCK_HDR_SIZE]);
    h.crc32c = block_crc(&out[start..]);
    h.write(&mut out[start..start + BLOCK_HDR_SIZE]);
    Ok(out.len() - start)
}

/// Validate and decode one block. `zone`/`offset` only label errors.
pub fn decode_block(zone: u32, offset: u64, block: &[u8]) -> Result<CachedPage> {
    let corrupt = |reason: String| TreeError::CorruptBlock {
        zone,
        offset,
        reason,
    };
    if block.len() < BLOCK_HDR_SIZE {
        return Err(corrupt(format!("short block ({} bytes)", block.len())).into());
    }
    let h = BlockHeader::read(&block[..BLOCK_HDR_SIZE]);
    let body_len = h.body_len as usize;
    if BLOCK_HDR_SIZE + body_len != block.len() {
        return Err(corrupt(format!(
            "length mismatch: header says {}, block has {}",
            body_len,
            block.len() - BLOCK_HDR_SIZE
        ))
        .into());
    }
    let calc = block_crc(block);
    if calc != h.crc32c {
        return Err(corrupt(format!(
            "crc mismatch (stored={:#010x}, calc={:#010x})",
            h.crc32c, calc
        ))
        .into());
    }

    let body = &block[BLOCK_HDR_SIZE..];
    let raw_len = h.raw_len as usize;
    if raw_len > MAX_BLOCK_BODY {
        return Err(corrupt(format!("raw length {} exceeds limit", raw_len)).into());
    }
    let page = match h.codec {
        CODEC_NONE => decode_cached(&h, body),
        CODEC_ZSTD => {
            let raw = zstd::bulk::decompress(body, raw_len)
                .map_err(|e| corrupt(format!("zstd decode: {}", e)))?;
            if raw.len() != raw_len {
                return Err(corrupt(format!(
                    "zstd decoded {} bytes, expected {}",
                    raw.len(),
                    raw_len
                ))
                .into());
            }
            decode_cached(&h, &raw)
        }
        other => return Err(corrupt(format!("unknown codec {}", other)).into()),
    };
    page.map_err(|e| corrupt(format!("decode: {:#}", e)).into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::BTreePage;
    use crate::codec::bytes;

    fn sample_leaf() -> BTreePage {
        let keys = (0..64u32)
            .map(|i| (bytes(&i.to_be_bytes()), bytes(b"some repetitive value payload")))
            .collect();
        BTreePage::leaf(keys, 3)
    }

    #[test]
    fn block_roundtrip_plain_and_zstd() -> Result<()> {
        let leaf = sample_leaf();
        for codec in [PageCodec::None, PageCodec::Zstd] {
            let mut buf = Vec::new();
            let n = encode_block(&leaf, 9, codec, 0, &mut buf)?;
            assert_eq!(n, buf.len());
            match decode_block(0, 0, &buf)? {
                CachedPage::BTree(p) => {
                    assert_eq!(p.version(), 3);
                    assert_eq!(p.slots().len(), 64);
                }
                other => panic!("unexpected page {:?}", other),
            }
        }
        Ok(())
    }

    #[test]
    fn zstd_block_is_smaller() -> Result<()> {
        let leaf = sample_leaf();
        let mut plain = Vec::new();
        let mut comp = Vec::new();
        encode_block(&leaf, 1, PageCodec::None, 0, &mut plain)?;
        encode_block(&leaf, 1, PageCodec::Zstd, 0, &mut comp)?;
        assert!(comp.len() < plain.len());
        assert_eq!(comp[1], CODEC_ZSTD);
        Ok(())
    }

    #[test]
    fn flipped_byte_is_detected() -> Result<()> {
        let mut buf = Vec::new();
        encode_block(&sample_leaf(), 1, PageCodec::None, 0, &mut buf)?;
        let last = buf.len() - 1;
        buf[last] ^= 0x55;
        let err = decode_block(4, 8192, &buf).unwrap_err();
        match err.downcast_ref::<TreeError>() {
            Some(TreeError::CorruptBlock { zone, offset, .. }) => {
                assert_eq!((*zone, *offset), (4, 8192));
            }
            other => panic!("unexpected error {:?}", other),
        }
        Ok(())
    }
}
