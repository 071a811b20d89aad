//! Shared on-disk format constants (zones, germs, chunks, page blocks).

// -------- Zones --------
pub const ZONE_PREFIX: &str = "zone-";
pub const ZONE_EXT: &str = "czone";
pub const LOCK_FILE: &str = "LOCK";

/// Chunks start on BLOCK_SIZE boundaries inside a zone.
pub const BLOCK_SIZE: u64 = 4096;

// -------- Germ --------
// Zone head: [germ slot 0][germ slot 1], each GERM_SIZE bytes.
// Slot layout: [magic8][format u32][len u32][payload ...][crc32c u32 over magic..payload]
pub const GERM_MAGIC: &[u8; 8] = b"CZGERM01";
pub const GERM_FORMAT: u32 = 1;
pub const GERM_SIZE: u64 = 64 * 1024;
pub const GERM_SLOTS: u64 = 2;
pub const ZONE_HEAD_SIZE: u64 = GERM_SIZE * GERM_SLOTS;

// -------- Chunk --------
// [magic4][pad u32][version u64][page_count u32][body_len u64][body crc32c u32] = 32 bytes
pub const CHUNK_MAGIC: &[u8; 4] = b"CZCK";
pub const CHUNK_HDR_SIZE: usize = 32;

// -------- Page blocks --------
// [tag u8][codec u8][flags u16][stem u32][version u64][body_len u32][raw_len u32][crc32c u32] = 28 bytes
pub const BLOCK_HDR_SIZE: usize = 28;

pub const PAGE_TAG_BTREE_LEAF: u8 = 1;
pub const PAGE_TAG_BTREE_NODE: u8 = 2;
pub const PAGE_TAG_QTREE_LEAF: u8 = 3;
pub const PAGE_TAG_QTREE_NODE: u8 = 4;
pub const PAGE_TAG_STREE_LEAF: u8 = 5;
pub const PAGE_TAG_STREE_NODE: u8 = 6;
pub const PAGE_TAG_UTREE_LEAF: u8 = 7;

pub const CODEC_NONE: u8 = 0;
pub const CODEC_ZSTD: u8 = 1;

/// Upper bound for a decoded block body (guards against corrupt length fields).
pub const MAX_BLOCK_BODY: usize = 256 * 1024 * 1024;

/// Longest tree name accepted by the database.
pub const MAX_TREE_NAME: usize = 1024;

// -------- Database --------
/// A tree cell balances its pending pages after this many mutations, so
/// pages touched between commits stay near their split arity.
pub const AUTO_BALANCE_INTERVAL: usize = 128;
