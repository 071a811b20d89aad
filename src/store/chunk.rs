//! store/chunk — one commit's page blocks.
//!
//! Layout (LE), starting on a BLOCK_SIZE boundary of the zone:
//!   [magic4 "CZCK"][pad u32][version u64][page_count u32][body_len u64][crc32c u32]
//!   [block ...]  (body_len bytes, CRC32C over the whole body)
//!
//! Blocks are addressed absolutely (zone, offset) while the chunk is built,
//! so child references inside later blocks can point at earlier ones.

use anyhow::{anyhow, Result};
use byteorder::{ByteOrder, LittleEndian};
use serde::Serialize;
use std::sync::Arc;

use crate::consts::{CHUNK_HDR_SIZE, CHUNK_MAGIC};
use crate::page::block::{encode_block, PageCodec};
use crate::page::{CachedPage, PageAddr, TreePage};

/// Summary of a durable commit, handed back to callers and delegates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Chunk {
    pub version: u64,
    pub zone: u32,
    /// Offset of the chunk header inside the zone.
    pub offset: u64,
    /// Header plus body bytes.
    pub size: u64,
    pub page_count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkHeader {
    pub version: u64,
    pub page_count: u32,
    pub body_len: u64,
    pub crc32c: u32,
}

impl ChunkHeader {
    pub fn encode(&self) -> [u8; CHUNK_HDR_SIZE] {
        let mut buf = [0u8; CHUNK_HDR_SIZE];
        buf[0..4].copy_from_slice(CHUNK_MAGIC);
        LittleEndian::write_u64(&mut buf[8..16], self.version);
        LittleEndian::write_u32(&mut buf[16..20], self.page_count);
        LittleEndian::write_u64(&mut buf[20..28], self.body_len);
        LittleEndian::write_u32(&mut buf[28..32], self.crc32c);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < CHUNK_HDR_SIZE {
            return Err(anyhow!("short chunk header ({} bytes)", buf.len()));
        }
        if &buf[0..4] != CHUNK_MAGIC {
            return Err(anyhow!("bad chunk magic"));
        }
        Ok(Self {
            version: LittleEndian::read_u64(&buf[8..16]),
            page_count: LittleEndian::read_u32(&buf[16..20]),
            body_len: LittleEndian::read_u64(&buf[20..28]),
            crc32c: LittleEndian::read_u32(&buf[28..32]),
        })
    }
}

/// Accumulates page blocks of one commit.
pub struct ChunkWriter {
    zone: u32,
    /// Zone offset of the first body byte.
    base: u64,
    codec: PageCodec,
    zstd_level: i32,
    body: Vec<u8>,
    pages: Vec<(PageAddr, CachedPage)>,
}

impl ChunkWriter {
    /// Writer for a chunk whose header will land at `offset` in `zone`.
    pub fn new(zone: u32, offset: u64, codec: PageCodec, zstd_level: i32) -> Self {
        Self {
            zone,
            base: offset + CHUNK_HDR_SIZE as u64,
            codec,
            zstd_level,
            body: Vec::new(),
            pages: Vec::new(),
        }
    }

    pub fn append<P: TreePage>(&mut self, page: &Arc<P>, stem: u32) -> Result<PageAddr> {
        let offset = self.base + self.body.len() as u64;
        let size = encode_block(&**page, stem, self.codec, self.zstd_level, &mut self.body)?;
        let addr = PageAddr {
            zone: self.zone,
            offset,
            size: size as u32,
        };
        self.pages.push((addr, P::into_cached(page.clone())));
        Ok(addr)
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    pub fn zone(&self) -> u32 {
        self.zone
    }

    /// Header + body, ready to be appended, and the written pages for the cache.
    pub fn finish(self, version: u64) -> (Vec<u8>, Vec<(PageAddr, CachedPage)>) {
        let header = ChunkHeader {
            version,
            page_count: self.pages.len() as u32,
            body_len: self.body.len() as u64,
            crc32c: crc32c::crc32c(&self.body),
        };
        let mut out = Vec::with_capacity(CHUNK_HDR_SIZE + self.body.len());
        out.extend_from_slice(&header.encode());
        out.extend_from_slice(&self.body);
        (out, self.pages)
    }
}
