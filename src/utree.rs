//! utree — single-value cell.
//!
//! One page holding one opaque value, persisted as a regular page block so
//! the germ can point at it like at any tree root.

use anyhow::{anyhow, Result};
use std::sync::Arc;

use crate::codec::Bytes;
use crate::consts::PAGE_TAG_UTREE_LEAF;
use crate::page::{get_bytes, put_bytes, CachedPage, PageRef, TreeContext, TreePage};
use crate::policy::PageStats;

#[derive(Debug, Clone)]
pub struct UTreePage {
    version: u64,
    value: Bytes,
}

impl UTreePage {
    pub fn new(value: Bytes, version: u64) -> Self {
        Self { version, value }
    }

    pub fn value(&self) -> &Bytes {
        &self.value
    }
}

impl PageStats for UTreePage {
    fn arity(&self) -> usize {
        1
    }
    fn span(&self) -> u64 {
        1
    }
    fn is_leaf(&self) -> bool {
        true
    }
}

impl TreePage for UTreePage {
    type Hint = ();

    fn version(&self) -> u64 {
        self.version
    }

    fn hint(&self) {}

    fn tag(&self) -> u8 {
        PAGE_TAG_UTREE_LEAF
    }

    fn child_refs(&self) -> &[PageRef<Self>] {
        &[]
    }

    fn rebuilt(&self, _children: Vec<PageRef<Self>>, version: u64) -> Self {
        Self::new(self.value.clone(), version)
    }

    fn estimated_size(&self) -> usize {
        4 + self.value.len()
    }

    fn encode_body(&self, out: &mut Vec<u8>) -> Result<()> {
        put_bytes(out, &self.value)
    }

    fn decode_body(tag: u8, version: u64, body: &[u8]) -> Result<Self> {
        if tag != PAGE_TAG_UTREE_LEAF {
            return Err(anyhow!("not a utree page tag: {}", tag));
        }
        let mut r = body;
        Ok(Self::new(get_bytes(&mut r)?, version))
    }

    fn write_hint(_hint: &(), _out: &mut Vec<u8>) {}

    fn read_hint(_r: &mut &[u8]) -> Result<()> {
        Ok(())
    }

    fn into_cached(page: Arc<Self>) -> CachedPage {
        CachedPage::UTree(page)
    }

    fn from_cached(cached: &CachedPage) -> Option<Arc<Self>> {
        match cached {
            CachedPage::UTree(p) => Some(p.clone()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct UTree {
    root: PageRef<UTreePage>,
}

impl UTree {
    /// Cell holding the empty value.
    pub fn empty(version: u64) -> Self {
        Self::from_value(Arc::from(&b""[..]), version)
    }

    fn from_value(value: Bytes, version: u64) -> Self {
        Self {
            root: PageRef::resident(Arc::new(UTreePage::new(value, version))),
        }
    }

    pub fn from_root(root: PageRef<UTreePage>) -> Self {
        Self { root }
    }

    #[inline]
    pub fn root(&self) -> &PageRef<UTreePage> {
        &self.root
    }

    pub fn same_root(&self, other: &UTree) -> bool {
        self.root.same_page(&other.root)
    }

    pub fn get(&self, cx: &TreeContext) -> Result<Bytes> {
        Ok(self.root.page(cx)?.value.clone())
    }

    /// New cell value. An equal value returns the same cell.
    pub fn updated(&self, cx: &TreeContext, value: Bytes, version: u64) -> Result<UTree> {
        if self.root.page(cx)?.value[..] == value[..] {
            return Ok(self.clone());
        }
        Ok(Self::from_value(value, version))
    }
}
