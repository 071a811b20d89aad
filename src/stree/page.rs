//! stree/page — sequence page.
//!
//! Leaf body: [count u32] { [klen u32][key id][vlen u32][value] } * count
//! Node body: [count u32] { child ref } * count
//!
//! Positions are implicit: a child's first index is the sum of the spans of
//! its left siblings.

use anyhow::{anyhow, Result};
use byteorder::{LittleEndian, WriteBytesExt};
use std::borrow::Cow;
use std::sync::Arc;

use crate::codec::Bytes;
use crate::consts::{PAGE_TAG_STREE_LEAF, PAGE_TAG_STREE_NODE};
use crate::page::seq::Sequenced;
use crate::page::{get_bytes, get_count, put_bytes, CachedPage, PageRef, TreePage, PAGE_REF_SIZE};
use crate::policy::PageStats;

/// (key id, value)
pub type STreeSlot = (Bytes, Bytes);

#[derive(Debug, Clone)]
enum Body {
    Leaf(Vec<STreeSlot>),
    Node(Vec<PageRef<STreePage>>),
}

#[derive(Debug, Clone)]
pub struct STreePage {
    version: u64,
    span: u64,
    body: Body,
}

impl STreePage {
    pub fn leaf(slots: Vec<STreeSlot>, version: u64) -> Self {
        Self {
            version,
            span: slots.len() as u64,
            body: Body::Leaf(slots),
        }
    }

    pub fn node(children: Vec<PageRef<STreePage>>, version: u64) -> Self {
        Self {
            version,
            span: children.iter().map(|c| c.span()).sum(),
            body: Body::Node(children),
        }
    }

    pub fn slots(&self) -> &[STreeSlot] {
        match &self.body {
            Body::Leaf(slots) => slots,
            Body::Node(_) => &[],
        }
    }
}

impl PageStats for STreePage {
    fn arity(&self) -> usize {
        match &self.body {
            Body::Leaf(slots) => slots.len(),
            Body::Node(children) => children.len(),
        }
    }
    fn span(&self) -> u64 {
        self.span
    }
    fn is_leaf(&self) -> bool {
        matches!(self.body, Body::Leaf(_))
    }
}

impl TreePage for STreePage {
    type Hint = ();

    fn version(&self) -> u64 {
        self.version
    }

    fn hint(&self) {}

    fn tag(&self) -> u8 {
        match self.body {
            Body::Leaf(_) => PAGE_TAG_STREE_LEAF,
            Body::Node(_) => PAGE_TAG_STREE_NODE,
        }
    }

    fn child_refs(&self) -> &[PageRef<Self>] {
        match &self.body {
            Body::Leaf(_) => &[],
            Body::Node(children) => children,
        }
    }

    fn rebuilt(&self, children: Vec<PageRef<Self>>, version: u64) -> Self {
        match &self.body {
            Body::Leaf(slots) => Self::leaf(slots.clone(), version),
            Body::Node(_) => Self::node(children, version),
        }
    }

    fn estimated_size(&self) -> usize {
        match &self.body {
            Body::Leaf(slots) => 4 + slots.iter().map(|(k, v)| 8 + k.len() + v.len()).sum::<usize>(),
            Body::Node(children) => 4 + children.len() * PAGE_REF_SIZE,
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
            Body::Node(children) => {
                out.write_u32::<LittleEndian>(children.len() as u32)?;
                for c in children {
                    c.write_to(out)?;
                }
            }
        }
        Ok(())
    }

    fn decode_body(tag: u8, version: u64, body: &[u8]) -> Result<Self> {
        let mut r = body;
        match tag {
            PAGE_TAG_STREE_LEAF => {
                let n = get_count(&mut r, "stree slot")?;
                let mut slots = Vec::with_capacity(n);
                for _ in 0..n {
                    let k = get_bytes(&mut r)?;
                    let v = get_bytes(&mut r)?;
                    slots.push((k, v));
                }
                Ok(Self::leaf(slots, version))
            }
            PAGE_TAG_STREE_NODE => {
                let n = get_count(&mut r, "stree child")?;
                let mut children = Vec::with_capacity(n);
                for _ in 0..n {
                    children.push(PageRef::read_from(&mut r)?);
                }
                Ok(Self::node(children, version))
            }
            other => Err(anyhow!("not a stree page tag: {}", other)),
        }
    }

    fn write_hint(_hint: &(), _out: &mut Vec<u8>) {}

    fn read_hint(_r: &mut &[u8]) -> Result<()> {
        Ok(())
    }

    fn into_cached(page: Arc<Self>) -> CachedPage {
        CachedPage::STree(page)
    }

    fn from_cached(cached: &CachedPage) -> Option<Arc<Self>> {
        match cached {
            CachedPage::STree(p) => Some(p.clone()),
            _ => None,
        }
    }
}

impl Sequenced for STreePage {
    type Slot = STreeSlot;
    type Sep = ();

    fn leaf_slots(&self) -> &[STreeSlot] {
        self.slots()
    }

    fn node_seps(&self) -> Cow<'_, [()]> {
        Cow::Owned(vec![(); self.child_refs().len().saturating_sub(1)])
    }

    fn make_leaf(slots: Vec<STreeSlot>, version: u64) -> Self {
        Self::leaf(slots, version)
    }

    fn make_node(children: Vec<PageRef<Self>>, _seps: Vec<()>, version: u64) -> Self {
        Self::node(children, version)
    }

    fn leaf_sep(_first: &STreeSlot) {}
}
