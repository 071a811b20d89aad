//! stree — persistent positional sequence.
//!
//! Entries carry an opaque key id next to the value so callers can find an
//! entry's current position (`index_of`) after other inserts moved it.

mod page;

pub use page::{STreePage, STreeSlot};

use anyhow::{anyhow, Result};
use std::sync::Arc;

use crate::codec::Bytes;
use crate::page::seq;
use crate::page::{PageRef, TreeContext, TreePage};
use crate::policy::PageStats;

#[derive(Debug, Clone)]
pub struct STree {
    root: PageRef<STreePage>,
}

fn leaf_ref(slots: Vec<STreeSlot>, version: u64) -> PageRef<STreePage> {
    PageRef::resident(Arc::new(STreePage::leaf(slots, version)))
}

fn node_ref(children: Vec<PageRef<STreePage>>, version: u64) -> PageRef<STreePage> {
    PageRef::resident(Arc::new(STreePage::node(children, version)))
}

impl STree {
    pub fn empty(version: u64) -> Self {
        Self {
            root: leaf_ref(Vec::new(), version),
        }
    }

    pub fn from_root(root: PageRef<STreePage>) -> Self {
        Self { root }
    }

    #[inline]
    pub fn root(&self) -> &PageRef<STreePage> {
        &self.root
    }

    #[inline]
    pub fn len(&self) -> u64 {
        self.root.span()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.root.span() == 0
    }

    pub fn same_root(&self, other: &STree) -> bool {
        self.root.same_page(&other.root)
    }

    pub fn get(&self, cx: &TreeContext, index: u64) -> Result<Option<Bytes>> {
        Ok(self.get_entry(cx, index)?.map(|(_, v)| v))
    }

    pub fn get_entry(&self, cx: &TreeContext, index: u64) -> Result<Option<STreeSlot>> {
        seq::get_index(&self.root, cx, index)
    }

    /// Insert before position `index`; `index == len` appends.
    pub fn inserted(&self, cx: &TreeContext, index: u64, key: Bytes, value: Bytes, version: u64) -> Result<STree> {
        if index > self.len() {
            return Err(anyhow!("insert index {} out of bounds (len {})", index, self.len()));
        }
        Ok(STree {
            root: inserted_ref(&self.root, cx, index, (key, value), version)?,
        })
    }

    pub fn appended(&self, cx: &TreeContext, key: Bytes, value: Bytes, version: u64) -> Result<STree> {
        self.inserted(cx, self.len(), key, value, version)
    }

    pub fn prepended(&self, cx: &TreeContext, key: Bytes, value: Bytes, version: u64) -> Result<STree> {
        self.inserted(cx, 0, key, value, version)
    }

    /// Replace the value at `index`, keeping its key id. An equal value
    /// returns the same tree.
    pub fn updated(&self, cx: &TreeContext, index: u64, value: Bytes, version: u64) -> Result<STree> {
        if index >= self.len() {
            return Err(anyhow!("update index {} out of bounds (len {})", index, self.len()));
        }
        match updated_ref(&self.root, cx, index, &value, version)? {
            Some(root) => Ok(STree { root }),
            None => Ok(self.clone()),
        }
    }

    /// Remove the entry at `index`. Out of range returns the same tree.
    pub fn removed(&self, cx: &TreeContext, index: u64, version: u64) -> Result<STree> {
        if index >= self.len() {
            return Ok(self.clone());
        }
        Ok(STree {
            root: removed_ref(&self.root, cx, index, version)?,
        })
    }

    /// Remove the first `n` entries.
    pub fn drop(&self, cx: &TreeContext, n: u64, version: u64) -> Result<STree> {
        Ok(STree {
            root: seq::drop_prefix(&self.root, cx, n, version)?,
        })
    }

    /// Keep the first `n` entries.
    pub fn take(&self, cx: &TreeContext, n: u64, version: u64) -> Result<STree> {
        Ok(STree {
            root: seq::take_prefix(&self.root, cx, n, version)?,
        })
    }

    pub fn balanced(&self, cx: &TreeContext, version: u64) -> Result<STree> {
        Ok(STree {
            root: seq::balanced(&self.root, cx, version)?,
        })
    }

    /// Current position of the entry with key id `key`.
    pub fn index_of(&self, cx: &TreeContext, key: &[u8]) -> Result<Option<u64>> {
        index_of_ref(&self.root, cx, key, 0)
    }

    pub fn entries(&self, cx: &TreeContext) -> Result<Vec<STreeSlot>> {
        let mut out = Vec::with_capacity(self.len() as usize);
        seq::for_each_slot(&self.root, cx, &mut |s: &STreeSlot| {
            out.push(s.clone());
            Ok(())
        })?;
        Ok(out)
    }

    pub fn values(&self, cx: &TreeContext) -> Result<Vec<Bytes>> {
        Ok(self.entries(cx)?.into_iter().map(|(_, v)| v).collect())
    }
}

fn inserted_ref(
    r: &PageRef<STreePage>,
    cx: &TreeContext,
    index: u64,
    slot: STreeSlot,
    version: u64,
) -> Result<PageRef<STreePage>> {
    let page = r.page(cx)?;
    if page.is_leaf() {
        let mut slots = Vec::with_capacity(page.slots().len() + 1);
        slots.extend_from_slice(page.slots());
        slots.insert(index as usize, slot);
        return Ok(leaf_ref(slots, version));
    }
    let (ci, off) = seq::locate(&*page, index);
    let mut children = page.child_refs().to_vec();
    children[ci] = inserted_ref(&children[ci], cx, off, slot, version)?;
    Ok(node_ref(children, version))
}

fn updated_ref(
    r: &PageRef<STreePage>,
    cx: &TreeContext,
    index: u64,
    value: &Bytes,
    version: u64,
) -> Result<Option<PageRef<STreePage>>> {
    let page = r.page(cx)?;
    if page.is_leaf() {
        let i = index as usize;
        if page.slots()[i].1[..] == value[..] {
            return Ok(None);
        }
        let mut slots = page.slots().to_vec();
        slots[i].1 = value.clone();
        return Ok(Some(leaf_ref(slots, version)));
    }
    let (ci, off) = seq::locate(&*page, index);
    Ok(match updated_ref(&page.child_refs()[ci], cx, off, value, version)? {
        None => None,
        Some(child) => {
            let mut children = page.child_refs().to_vec();
            children[ci] = child;
            Some(node_ref(children, version))
        }
    })
}

fn removed_ref(
    r: &PageRef<STreePage>,
    cx: &TreeContext,
    index: u64,
    version: u64,
) -> Result<PageRef<STreePage>> {
    let page = r.page(cx)?;
    if page.is_leaf() {
        let mut slots = page.slots().to_vec();
        slots.remove(index as usize);
        return Ok(leaf_ref(slots, version));
    }
    let (ci, off) = seq::locate(&*page, index);
    let mut children = page.child_refs().to_vec();
    children[ci] = removed_ref(&children[ci], cx, off, version)?;
    Ok(node_ref(children, version))
}

fn index_of_ref(r: &PageRef<STreePage>, cx: &TreeContext, key: &[u8], base: u64) -> Result<Option<u64>> {
    if r.span() == 0 {
        return Ok(None);
    }
    let page = r.page(cx)?;
    if page.is_leaf() {
        return Ok(page
            .slots()
            .iter()
            .position(|(k, _)| k[..] == key[..])
            .map(|i| base + i as u64));
    }
    let mut offset = base;
    for c in page.child_refs() {
        if let Some(i) = index_of_ref(c, cx, key, offset)? {
            return Ok(Some(i));
        }
        offset += c.span();
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::bytes;
    use crate::policy::{ArityPolicy, PagePolicy, PageStats};

    fn cx() -> TreeContext {
        TreeContext::new(3, Arc::new(ArityPolicy::new(4)))
    }

    fn k(i: u32) -> Bytes {
        bytes(&i.to_be_bytes())
    }

    /// Splits anything with two or more entries.
    #[derive(Debug)]
    struct SplitEverything;

    impl PagePolicy for SplitEverything {
        fn should_split(&self, page: &dyn PageStats) -> bool {
            page.arity() > 1
        }

        fn should_merge(&self, _page: &dyn PageStats) -> bool {
            false
        }
    }

    #[test]
    fn eager_split_policy_still_settles() -> Result<()> {
        let cx = TreeContext::new(3, Arc::new(SplitEverything));
        let mut t = STree::empty(1);
        for i in 0..12u32 {
            t = t.appended(&cx, k(i), k(i), 1)?;
        }
        t = t.balanced(&cx, 1)?;
        t = t.inserted(&cx, 3, k(99), k(99), 2)?.balanced(&cx, 2)?;
        assert_eq!(t.len(), 13);
        assert_eq!(t.get(&cx, 3)?, Some(k(99)));
        assert_eq!(t.get(&cx, 12)?, Some(k(11)));
        let keys: Vec<Bytes> = t.entries(&cx)?.into_iter().map(|(key, _)| key).collect();
        assert_eq!(keys.len(), 13);
        assert_eq!(keys[0], k(0));
        Ok(())
    }

    #[test]
    fn positional_edits_track_spans() -> Result<()> {
        let cx = cx();
        let mut t = STree::empty(1);
        for i in 0..40u32 {
            t = t.appended(&cx, k(i), k(i), 1)?.balanced(&cx, 1)?;
        }
        t = t.prepended(&cx, k(100), k(100), 2)?;
        t = t.inserted(&cx, 20, k(200), k(200), 2)?;
        t = t.removed(&cx, 5, 2)?.balanced(&cx, 2)?;
        assert_eq!(t.len(), 41);
        assert_eq!(t.get(&cx, 0)?, Some(k(100)));
        assert_eq!(t.get(&cx, 19)?, Some(k(200)));
        assert_eq!(t.get(&cx, 5)?, Some(k(5)));
        assert_eq!(t.index_of(&cx, &k(200))?, Some(19));
        assert_eq!(t.index_of(&cx, &k(4))?, None);
        assert_eq!(t.get(&cx, 41)?, None);
        Ok(())
    }

    #[test]
    fn update_keeps_key_and_equal_value_is_noop() -> Result<()> {
        let cx = cx();
        let t = STree::empty(1)
            .appended(&cx, k(1), bytes(b"a"), 1)?
            .appended(&cx, k(2), bytes(b"b"), 1)?;
        let same = t.updated(&cx, 1, bytes(b"b"), 2)?;
        assert!(same.same_root(&t));
        let t2 = t.updated(&cx, 1, bytes(b"c"), 2)?;
        assert_eq!(t2.get_entry(&cx, 1)?, Some((k(2), bytes(b"c"))));
        assert!(t.updated(&cx, 2, bytes(b"x"), 2).is_err());
        Ok(())
    }
}
