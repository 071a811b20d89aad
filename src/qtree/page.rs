//! qtree/page — spatial page.
//!
//! Leaf body: [count u32] { entry } * count
//! Node body: [children u32] { child ref + hint(x u64, y u64) } * children
//!            [lifted u32]   { entry } * lifted
//! Entry:     [klen u32][key][x u64][y u64][vlen u32][value]
//!
//! A page's covering tiles are not stored; they are recomputed from the
//! contents on decode, so they are always the tight union.

use anyhow::{anyhow, Result};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::cmp::Ordering;
use std::sync::Arc;

use super::tile::Tile;
use crate::codec::Bytes;
use crate::consts::{PAGE_TAG_QTREE_LEAF, PAGE_TAG_QTREE_NODE};
use crate::page::{get_bytes, get_count, put_bytes, CachedPage, PageRef, TreePage, PAGE_REF_SIZE};
use crate::policy::PageStats;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QTreeEntry {
    pub key: Bytes,
    pub x: Tile,
    pub y: Tile,
    pub value: Bytes,
}

impl QTreeEntry {
    pub fn new(key: Bytes, x: Tile, y: Tile, value: Bytes) -> Self {
        Self { key, x, y, value }
    }

    /// Identity order inside a page: key bytes, then tiles.
    #[inline]
    pub(crate) fn cmp_id(&self, key: &[u8], x: Tile, y: Tile) -> Ordering {
        (&self.key[..], self.x, self.y).cmp(&(key, x, y))
    }

    #[inline]
    pub fn hint(&self) -> QTreeHint {
        QTreeHint { x: self.x, y: self.y }
    }

    #[inline]
    pub fn within(&self, x0: u64, y0: u64, x1: u64, y1: u64) -> bool {
        self.x.overlaps(x0, x1) && self.y.overlaps(y0, y1)
    }

    fn write(&self, out: &mut Vec<u8>) -> Result<()> {
        put_bytes(out, &self.key)?;
        out.write_u64::<LittleEndian>(self.x.raw())?;
        out.write_u64::<LittleEndian>(self.y.raw())?;
        put_bytes(out, &self.value)?;
        Ok(())
    }

    fn read(r: &mut &[u8]) -> Result<Self> {
        let key = get_bytes(r)?;
        let x = Tile::from_raw(r.read_u64::<LittleEndian>()?)?;
        let y = Tile::from_raw(r.read_u64::<LittleEndian>()?)?;
        let value = get_bytes(r)?;
        Ok(Self { key, x, y, value })
    }

    fn encoded_len(&self) -> usize {
        24 + self.key.len() + self.value.len()
    }
}

/// Covering tiles a parent keeps for each child.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QTreeHint {
    pub x: Tile,
    pub y: Tile,
}

impl QTreeHint {
    #[inline]
    pub fn contains(&self, other: &QTreeHint) -> bool {
        self.x.contains(other.x) && self.y.contains(other.y)
    }

    /// Both axes intersect.
    #[inline]
    pub fn intersects(&self, other: &QTreeHint) -> bool {
        self.x.intersects(other.x) && self.y.intersects(other.y)
    }

    #[inline]
    pub fn overlaps(&self, x0: u64, y0: u64, x1: u64, y1: u64) -> bool {
        self.x.overlaps(x0, x1) && self.y.overlaps(y0, y1)
    }

    #[inline]
    pub fn union(&self, other: &QTreeHint) -> QTreeHint {
        QTreeHint {
            x: self.x.union(other.x),
            y: self.y.union(other.y),
        }
    }
}

#[derive(Debug, Clone)]
enum Body {
    Leaf(Vec<QTreeEntry>),
    Node {
        children: Vec<PageRef<QTreePage>>,
        slots: Vec<QTreeEntry>,
    },
}

#[derive(Debug, Clone)]
pub struct QTreePage {
    version: u64,
    span: u64,
    cover: Option<QTreeHint>,
    body: Body,
}

const REF_SIZE: usize = PAGE_REF_SIZE + 16;

/// Tight union of entries and non-empty children.
fn cover_of(children: &[PageRef<QTreePage>], slots: &[QTreeEntry]) -> Option<QTreeHint> {
    let from_children = children.iter().filter(|c| c.span() > 0).map(|c| c.hint());
    let from_slots = slots.iter().map(|e| e.hint());
    from_children
        .chain(from_slots)
        .reduce(|a, b| a.union(&b))
}

impl QTreePage {
    /// Leaf; `slots` must be sorted by identity.
    pub(crate) fn leaf(slots: Vec<QTreeEntry>, version: u64) -> Self {
        Self {
            version,
            span: slots.len() as u64,
            cover: cover_of(&[], &slots),
            body: Body::Leaf(slots),
        }
    }

    /// Node; `slots` (lifted entries) must be sorted by identity.
    pub(crate) fn node(children: Vec<PageRef<QTreePage>>, slots: Vec<QTreeEntry>, version: u64) -> Self {
        let span = children.iter().map(|c| c.span()).sum::<u64>() + slots.len() as u64;
        Self {
            version,
            span,
            cover: cover_of(&children, &slots),
            body: Body::Node { children, slots },
        }
    }

    pub(crate) fn empty(version: u64) -> Self {
        Self::leaf(Vec::new(), version)
    }

    /// Entries stored directly in this page (leaf slots or lifted slots).
    pub fn slots(&self) -> &[QTreeEntry] {
        match &self.body {
            Body::Leaf(slots) => slots,
            Body::Node { slots, .. } => slots,
        }
    }

    /// Covering tiles; None for an empty page.
    #[inline]
    pub fn cover(&self) -> Option<QTreeHint> {
        self.cover
    }

    pub(crate) fn find_slot(&self, key: &[u8], x: Tile, y: Tile) -> Result<usize, usize> {
        self.slots().binary_search_by(|e| e.cmp_id(key, x, y))
    }

    /// The child whose tiles contain `hint`, if any. Children are disjoint,
    /// so at most one qualifies.
    pub(crate) fn child_containing(&self, hint: &QTreeHint) -> Option<usize> {
        self.child_refs()
            .iter()
            .position(|c| c.span() > 0 && c.hint().contains(hint))
    }
}

/// Insert or replace `entry` in a sorted slot list.
pub(crate) fn slots_with(slots: &[QTreeEntry], entry: QTreeEntry) -> Vec<QTreeEntry> {
    let mut out = Vec::with_capacity(slots.len() + 1);
    match slots.binary_search_by(|e| e.cmp_id(&entry.key, entry.x, entry.y)) {
        Ok(i) => {
            out.extend_from_slice(slots);
            out[i] = entry;
        }
        Err(i) => {
            out.extend_from_slice(&slots[..i]);
            out.push(entry);
            out.extend_from_slice(&slots[i..]);
        }
    }
    out
}

pub(crate) fn sort_slots(slots: &mut [QTreeEntry]) {
    slots.sort_by(|a, b| a.cmp_id(&b.key, b.x, b.y));
}

impl PageStats for QTreePage {
    fn arity(&self) -> usize {
        match &self.body {
            Body::Leaf(slots) => slots.len(),
            Body::Node { children, slots } => children.len() + slots.len(),
        }
    }
    fn span(&self) -> u64 {
        self.span
    }
    fn is_leaf(&self) -> bool {
        matches!(self.body, Body::Leaf(_))
    }
}

impl TreePage for QTreePage {
    type Hint = QTreeHint;

    fn version(&self) -> u64 {
        self.version
    }

    fn hint(&self) -> QTreeHint {
        self.cover.unwrap_or_default()
    }

    fn tag(&self) -> u8 {
        if self.is_leaf() {
            PAGE_TAG_QTREE_LEAF
        } else {
            PAGE_TAG_QTREE_NODE
        }
    }

    fn child_refs(&self) -> &[PageRef<Self>] {
        match &self.body {
            Body::Leaf(_) => &[],
            Body::Node { children, .. } => children,
        }
    }

    fn rebuilt(&self, children: Vec<PageRef<Self>>, version: u64) -> Self {
        match &self.body {
            Body::Leaf(slots) => Self::leaf(slots.clone(), version),
            Body::Node { slots, .. } => Self::node(children, slots.clone(), version),
        }
    }

    fn estimated_size(&self) -> usize {
        let slots: usize = self.slots().iter().map(|e| e.encoded_len()).sum();
        8 + slots + self.child_refs().len() * REF_SIZE
    }

    fn encode_body(&self, out: &mut Vec<u8>) -> Result<()> {
        match &self.body {
            Body::Leaf(slots) => {
                out.write_u32::<LittleEndian>(slots.len() as u32)?;
                for e in slots {
                    e.write(out)?;
                }
            }
            Body::Node { children, slots } => {
                out.write_u32::<LittleEndian>(children.len() as u32)?;
                for c in children {
                    c.write_to(out)?;
                }
                out.write_u32::<LittleEndian>(slots.len() as u32)?;
                for e in slots {
                    e.write(out)?;
                }
            }
        }
        Ok(())
    }

    fn decode_body(tag: u8, version: u64, body: &[u8]) -> Result<Self> {
        let mut r = body;
        match tag {
            PAGE_TAG_QTREE_LEAF => {
                let n = get_count(&mut r, "qtree slot")?;
                let mut slots = Vec::with_capacity(n);
                for _ in 0..n {
                    slots.push(QTreeEntry::read(&mut r)?);
                }
                Ok(Self::leaf(slots, version))
            }
            PAGE_TAG_QTREE_NODE => {
                let n = get_count(&mut r, "qtree child")?;
                let mut children = Vec::with_capacity(n);
                for _ in 0..n {
                    children.push(PageRef::read_from(&mut r)?);
                }
                let m = get_count(&mut r, "qtree lifted slot")?;
                let mut slots = Vec::with_capacity(m);
                for _ in 0..m {
                    slots.push(QTreeEntry::read(&mut r)?);
                }
                Ok(Self::node(children, slots, version))
            }
            other => Err(anyhow!("not a qtree page tag: {}", other)),
        }
    }

    fn write_hint(hint: &QTreeHint, out: &mut Vec<u8>) {
        out.extend_from_slice(&hint.x.raw().to_le_bytes());
        out.extend_from_slice(&hint.y.raw().to_le_bytes());
    }

    fn read_hint(r: &mut &[u8]) -> Result<QTreeHint> {
        let x = Tile::from_raw(r.read_u64::<LittleEndian>()?)?;
        let y = Tile::from_raw(r.read_u64::<LittleEndian>()?)?;
        Ok(QTreeHint { x, y })
    }

    fn into_cached(page: Arc<Self>) -> CachedPage {
        CachedPage::QTree(page)
    }

    fn from_cached(cached: &CachedPage) -> Option<Arc<Self>> {
        match cached {
            CachedPage::QTree(p) => Some(p.clone()),
            _ => None,
        }
    }
}
