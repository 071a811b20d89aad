//! btree/page — ordered-map page.
//!
//! Leaf body: [count u32] { [klen u32][key][vlen u32][value] } * count
//! Node body: [count u32] { child ref } * count { [klen u32][knot] } * (count - 1)
//!
//! Knot `i` is the lower bound of child `i + 1`: a key descends into the
//! child whose index equals the number of knots `<=` the key.

use anyhow::{anyhow, Result};
use byteorder::{LittleEndian, WriteBytesExt};
use std::borrow::Cow;
use std::sync::Arc;

use crate::codec::Bytes;
use crate::consts::{PAGE_TAG_BTREE_LEAF, PAGE_TAG_BTREE_NODE};
use crate::page::seq::Sequenced;
use crate::page::{get_bytes, get_count, put_bytes, CachedPage, PageRef, TreeContext, TreePage, PAGE_REF_SIZE};
use crate::policy::PageStats;

pub type BTreeSlot = (Bytes, Bytes);

#[derive(Debug, Clone)]
enum Body {
    Leaf(Vec<BTreeSlot>),
    Node {
        children: Vec<PageRef<BTreePage>>,
        knots: Vec<Bytes>,
    },
}

#[derive(Debug, Clone)]
pub struct BTreePage {
    version: u64,
    span: u64,
    body: Body,
}

const REF_SIZE: usize = PAGE_REF_SIZE;

impl BTreePage {
    pub fn leaf(slots: Vec<BTreeSlot>, version: u64) -> Self {
        Self {
            version,
            span: slots.len() as u64,
            body: Body::Leaf(slots),
        }
    }

    pub fn node(children: Vec<PageRef<BTreePage>>, knots: Vec<Bytes>, version: u64) -> Self {
        debug_assert_eq!(knots.len() + 1, children.len().max(1));
        let span = children.iter().map(|c| c.span()).sum();
        Self {
            version,
            span,
            body: Body::Node { children, knots },
        }
    }

    /// Leaf slots; empty for nodes.
    pub fn slots(&self) -> &[BTreeSlot] {
        match &self.body {
            Body::Leaf(slots) => slots,
            Body::Node { .. } => &[],
        }
    }

    pub fn knots(&self) -> &[Bytes] {
        match &self.body {
            Body::Leaf(_) => &[],
            Body::Node { knots, .. } => knots,
        }
    }

    /// Index of the child that covers `key`.
    pub(crate) fn child_index(&self, cx: &TreeContext, key: &[u8]) -> Result<usize> {
        Ok(match search(self.knots(), cx, key, |k| &k[..])? {
            Ok(j) => j + 1,
            Err(j) => j,
        })
    }

    /// Position of `key` among the leaf slots.
    pub(crate) fn slot_search(&self, cx: &TreeContext, key: &[u8]) -> Result<Result<usize, usize>> {
        search(self.slots(), cx, key, |s| &s.0[..])
    }
}

/// Binary search through the fallible comparator.
pub(crate) fn search<T, F>(items: &[T], cx: &TreeContext, key: &[u8], project: F) -> Result<Result<usize, usize>>
where
    F: Fn(&T) -> &[u8],
{
    let (mut lo, mut hi) = (0usize, items.len());
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        match cx.compare(project(&items[mid]), key)? {
            std::cmp::Ordering::Less => lo = mid + 1,
            std::cmp::Ordering::Greater => hi = mid,
            std::cmp::Ordering::Equal => return Ok(Ok(mid)),
        }
    }
    Ok(Err(lo))
}

impl PageStats for BTreePage {
    fn arity(&self) -> usize {
        match &self.body {
            Body::Leaf(slots) => slots.len(),
            Body::Node { children, .. } => children.len(),
        }
    }
    fn span(&self) -> u64 {
        self.span
    }
    fn is_leaf(&self) -> bool {
        matches!(self.body, Body::Leaf(_))
    }
}

impl TreePage for BTreePage {
    type Hint = ();

    fn version(&self) -> u64 {
        self.version
    }

    fn hint(&self) {}

    fn tag(&self) -> u8 {
        if self.is_leaf() {
            PAGE_TAG_BTREE_LEAF
        } else {
            PAGE_TAG_BTREE_NODE
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
            Body::Node { knots, .. } => Self::node(children, knots.clone(), version),
        }
    }

    fn estimated_size(&self) -> usize {
        match &self.body {
            Body::Leaf(slots) => 4 + slots.iter().map(|(k, v)| 8 + k.len() + v.len()).sum::<usize>(),
            Body::Node { children, knots } => {
                4 + children.len() * REF_SIZE + knots.iter().map(|k| 4 + k.len()).sum::<usize>()
            }
        }
    }

    fn encode_body(&self, out: &mut Vec<u8>) -> Result<()> {
        match &self.body {
            Body::Leaf(slots) => {
                out.write_u32::<LittleEndian>(slots.len() as u32)?;
                for (k, v) in slots {
                    put_bytes(out, k)?;
                    put_bytes(out, v)?;
                }
            }
            Body::Node { children, knots } => {
                out.write_u32::<LittleEndian>(children.len() as u32)?;
                for c in children {
                    c.write_to(out)?;
                }
                for k in knots {
                    put_bytes(out, k)?;
                }
            }
        }
        Ok(())
    }

    fn decode_body(tag: u8, version: u64, body: &[u8]) -> Result<Self> {
        let mut r = body;
        match tag {
            PAGE_TAG_BTREE_LEAF => {
                let n = get_count(&mut r, "btree slot")?;
                let mut slots = Vec::with_capacity(n);
                for _ in 0..n {
                    let k = get_bytes(&mut r)?;
                    let v = get_bytes(&mut r)?;
                    slots.push((k, v));
                }
                Ok(Self::leaf(slots, version))
            }
            PAGE_TAG_BTREE_NODE => {
                let n = get_count(&mut r, "btree child")?;
                if n == 0 {
                    return Err(anyhow!("btree node without children"));
                }
                let mut children = Vec::with_capacity(n);
                for _ in 0..n {
                    children.push(PageRef::read_from(&mut r)?);
                }
                let mut knots = Vec::with_capacity(n - 1);
                for _ in 1..n {
                    knots.push(get_bytes(&mut r)?);
                }
                Ok(Self::node(children, knots, version))
            }
            other => Err(anyhow!("not a btree page tag: {}", other)),
        }
    }

    fn write_hint(_hint: &(), _out: &mut Vec<u8>) {}

    fn read_hint(_r: &mut &[u8]) -> Result<()> {
        Ok(())
    }

    fn into_cached(page: Arc<Self>) -> CachedPage {
        CachedPage::BTree(page)
    }

    fn from_cached(cached: &CachedPage) -> Option<Arc<Self>> {
        match cached {
            CachedPage::BTree(p) => Some(p.clone()),
            _ => None,
        }
    }
}

impl Sequenced for BTreePage {
    type Slot = BTreeSlot;
    type Sep = Bytes;

    fn leaf_slots(&self) -> &[BTreeSlot] {
        self.slots()
    }

    fn node_seps(&self) -> Cow<'_, [Bytes]> {
        Cow::Borrowed(self.knots())
    }

    fn make_leaf(slots: Vec<BTreeSlot>, version: u64) -> Self {
        Self::leaf(slots, version)
    }

    fn make_node(children: Vec<PageRef<Self>>, seps: Vec<Bytes>, version: u64) -> Self {
        Self::node(children, seps, version)
    }

    fn leaf_sep(first: &BTreeSlot) -> Bytes {
        first.0.clone()
    }
}
