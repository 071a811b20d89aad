//! btree — persistent ordered map over opaque keys.
//!
//! `BTree` is an immutable value: every mutation returns a new tree that
//! shares all untouched pages with the old one. New pages are stamped with
//! the caller's version and left unbalanced until `balanced(version)`.

mod page;

pub use page::{BTreePage, BTreeSlot};

use anyhow::Result;
use std::sync::Arc;

use crate::codec::Bytes;
use crate::page::seq;
use crate::page::{PageRef, TreeContext, TreePage};
use crate::policy::PageStats;

#[derive(Debug, Clone)]
pub struct BTree {
    root: PageRef<BTreePage>,
}

impl BTree {
    pub fn empty(version: u64) -> Self {
        Self {
            root: PageRef::resident(Arc::new(BTreePage::leaf(Vec::new(), version))),
        }
    }

    pub fn from_root(root: PageRef<BTreePage>) -> Self {
        Self { root }
    }

    #[inline]
    pub fn root(&self) -> &PageRef<BTreePage> {
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

    /// Same root page (no mutation happened in between).
    pub fn same_root(&self, other: &BTree) -> bool {
        self.root.same_page(&other.root)
    }

    pub fn get(&self, cx: &TreeContext, key: &[u8]) -> Result<Option<Bytes>> {
        let mut page = self.root.page(cx)?;
        loop {
            if page.is_leaf() {
                return Ok(match page.slot_search(cx, key)? {
                    Ok(i) => Some(page.slots()[i].1.clone()),
                    Err(_) => None,
                });
            }
            let idx = page.child_index(cx, key)?;
            page = page.child_refs()[idx].page(cx)?;
        }
    }

    pub fn contains_key(&self, cx: &TreeContext, key: &[u8]) -> Result<bool> {
        Ok(self.get(cx, key)?.is_some())
    }

    /// Insert or replace. An equal value returns the same tree.
    pub fn updated(&self, cx: &TreeContext, key: &[u8], value: Bytes, version: u64) -> Result<BTree> {
        match updated_ref(&self.root, cx, key, &value, version)? {
            Some(root) => Ok(BTree { root }),
            None => Ok(self.clone()),
        }
    }

    /// Remove `key`. An absent key returns the same tree.
    pub fn removed(&self, cx: &TreeContext, key: &[u8], version: u64) -> Result<BTree> {
        match removed_ref(&self.root, cx, key, version)? {
            Some(root) => Ok(BTree { root }),
            None => Ok(self.clone()),
        }
    }

    pub fn get_index(&self, cx: &TreeContext, index: u64) -> Result<Option<BTreeSlot>> {
        seq::get_index(&self.root, cx, index)
    }

    /// Remove the `n` smallest entries.
    pub fn drop(&self, cx: &TreeContext, n: u64, version: u64) -> Result<BTree> {
        Ok(BTree {
            root: seq::drop_prefix(&self.root, cx, n, version)?,
        })
    }

    /// Keep the `n` smallest entries.
    pub fn take(&self, cx: &TreeContext, n: u64, version: u64) -> Result<BTree> {
        Ok(BTree {
            root: seq::take_prefix(&self.root, cx, n, version)?,
        })
    }

    pub fn balanced(&self, cx: &TreeContext, version: u64) -> Result<BTree> {
        Ok(BTree {
            root: seq::balanced(&self.root, cx, version)?,
        })
    }

    /// Split the root in two regardless of policy. Small roots stay as is.
    pub fn split(&self, cx: &TreeContext, version: u64) -> Result<BTree> {
        let page = self.root.page(cx)?;
        let min = if page.is_leaf() { 2 } else { 3 };
        if page.arity() < min {
            return Ok(self.clone());
        }
        let (mut children, mut knots) = (Vec::with_capacity(2), Vec::with_capacity(1));
        if page.is_leaf() {
            let slots = page.slots();
            let m = slots.len() / 2;
            knots.push(slots[m].0.clone());
            children.push(leaf_ref(slots[..m].to_vec(), version));
            children.push(leaf_ref(slots[m..].to_vec(), version));
        } else {
            let refs = page.child_refs();
            let ks = page.knots();
            let m = refs.len() / 2;
            knots.push(ks[m - 1].clone());
            children.push(node_ref(refs[..m].to_vec(), ks[..m - 1].to_vec(), version));
            children.push(node_ref(refs[m..].to_vec(), ks[m..].to_vec(), version));
        }
        Ok(BTree {
            root: node_ref(children, knots, version),
        })
    }

    pub fn cursor(&self, cx: &TreeContext) -> BTreeCursor {
        BTreeCursor::new(self.root.clone(), cx.clone(), None)
    }

    /// Entries with key `>= start`, in order.
    pub fn cursor_from(&self, cx: &TreeContext, start: &[u8]) -> BTreeCursor {
        BTreeCursor::new(self.root.clone(), cx.clone(), Some(Arc::from(start)))
    }

    pub fn entries(&self, cx: &TreeContext) -> Result<Vec<BTreeSlot>> {
        let mut out = Vec::with_capacity(self.len() as usize);
        seq::for_each_slot(&self.root, cx, &mut |s: &BTreeSlot| {
            out.push(s.clone());
            Ok(())
        })?;
        Ok(out)
    }
}

fn leaf_ref(slots: Vec<BTreeSlot>, version: u64) -> PageRef<BTreePage> {
    PageRef::resident(Arc::new(BTreePage::leaf(slots, version)))
}

fn node_ref(children: Vec<PageRef<BTreePage>>, knots: Vec<Bytes>, version: u64) -> PageRef<BTreePage> {
    PageRef::resident(Arc::new(BTreePage::node(children, knots, version)))
}

// ---------------- path rewrite ----------------

fn updated_ref(
    r: &PageRef<BTreePage>,
    cx: &TreeContext,
    key: &[u8],
    value: &Bytes,
    version: u64,
) -> Result<Option<PageRef<BTreePage>>> {
    let page = r.page(cx)?;
    if page.is_leaf() {
        let slots = page.slots();
        let mut next = Vec::with_capacity(slots.len() + 1);
        match page.slot_search(cx, key)? {
            Ok(i) => {
                if slots[i].1[..] == value[..] {
                    return Ok(None);
                }
                next.extend_from_slice(slots);
                next[i].1 = value.clone();
            }
            Err(i) => {
                next.extend_from_slice(&slots[..i]);
                next.push((Arc::from(key), value.clone()));
                next.extend_from_slice(&slots[i..]);
            }
        }
        return Ok(Some(leaf_ref(next, version)));
    }
    let idx = page.child_index(cx, key)?;
    let refs = page.child_refs();
    match updated_ref(&refs[idx], cx, key, value, version)? {
        None => Ok(None),
        Some(child) => {
            let mut children = refs.to_vec();
            children[idx] = child;
            Ok(Some(node_ref(children, page.knots().to_vec(), version)))
        }
    }
}

fn removed_ref(
    r: &PageRef<BTreePage>,
    cx: &TreeContext,
    key: &[u8],
    version: u64,
) -> Result<Option<PageRef<BTreePage>>> {
    let page = r.page(cx)?;
    if page.is_leaf() {
        return Ok(match page.slot_search(cx, key)? {
            Ok(i) => {
                let mut next = page.slots().to_vec();
                next.remove(i);
                Some(leaf_ref(next, version))
            }
            Err(_) => None,
        });
    }
    let idx = page.child_index(cx, key)?;
    let refs = page.child_refs();
    match removed_ref(&refs[idx], cx, key, version)? {
        None => Ok(None),
        Some(child) => {
            let mut children = refs.to_vec();
            children[idx] = child;
            Ok(Some(node_ref(children, page.knots().to_vec(), version)))
        }
    }
}

// ---------------- cursor ----------------

/// Lazy in-order iterator; pages are loaded as the walk reaches them.
pub struct BTreeCursor {
    cx: TreeContext,
    stack: Vec<(Arc<BTreePage>, usize)>,
    pending: Option<(PageRef<BTreePage>, Option<Bytes>)>,
}

impl BTreeCursor {
    fn new(root: PageRef<BTreePage>, cx: TreeContext, start: Option<Bytes>) -> Self {
        Self {
            cx,
            stack: Vec::new(),
            pending: Some((root, start)),
        }
    }

    /// Descend from `root` to the first slot `>= start`.
    fn seek(&mut self, root: PageRef<BTreePage>, start: Option<Bytes>) -> Result<()> {
        let mut page = root.page(&self.cx)?;
        loop {
            if page.is_leaf() {
                let pos = match &start {
                    Some(k) => match page.slot_search(&self.cx, k)? {
                        Ok(i) | Err(i) => i,
                    },
                    None => 0,
                };
                self.stack.push((page, pos));
                return Ok(());
            }
            let idx = match &start {
                Some(k) => page.child_index(&self.cx, k)?,
                None => 0,
            };
            let child = page.child_refs()[idx].page(&self.cx)?;
            self.stack.push((page, idx + 1));
            page = child;
        }
    }

    fn advance(&mut self) -> Result<Option<BTreeSlot>> {
        if let Some((root, start)) = self.pending.take() {
            self.seek(root, start)?;
        }
        loop {
            let step = match self.stack.last_mut() {
                None => return Ok(None),
                Some((page, pos)) => {
                    let step = if page.is_leaf() {
                        page.slots().get(*pos).cloned().map(Step::Yield)
                    } else {
                        page.child_refs().get(*pos).cloned().map(Step::Descend)
                    };
                    if step.is_some() {
                        *pos += 1;
                    }
                    step
                }
            };
            match step {
                Some(Step::Yield(slot)) => return Ok(Some(slot)),
                Some(Step::Descend(child)) => self.seek(child, None)?,
                None => {
                    self.stack.pop();
                }
            }
        }
    }
}

enum Step {
    Yield(BTreeSlot),
    Descend(PageRef<BTreePage>),
}

impl Iterator for BTreeCursor {
    type Item = Result<BTreeSlot>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.advance() {
            Ok(Some(slot)) => Some(Ok(slot)),
            Ok(None) => None,
            Err(e) => {
                self.stack.clear();
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::bytes;
    use crate::policy::ArityPolicy;

    fn cx(split: usize) -> TreeContext {
        TreeContext::new(1, Arc::new(ArityPolicy::new(split)))
    }

    fn key(i: u32) -> Bytes {
        bytes(&i.to_be_bytes())
    }

    #[test]
    fn equal_update_and_absent_remove_share_root() -> Result<()> {
        let cx = cx(4);
        let t = BTree::empty(1).updated(&cx, b"a", bytes(b"1"), 1)?;
        let same = t.updated(&cx, b"a", bytes(b"1"), 2)?;
        assert!(same.same_root(&t));
        let same = t.removed(&cx, b"zzz", 2)?;
        assert!(same.same_root(&t));
        Ok(())
    }

    #[test]
    fn cursor_from_skips_smaller_keys() -> Result<()> {
        let cx = cx(4);
        let mut t = BTree::empty(1);
        for i in 0..50u32 {
            t = t.updated(&cx, &key(i * 2), key(i), 1)?;
            t = t.balanced(&cx, 1)?;
        }
        let got: Vec<_> = t.cursor_from(&cx, &key(31)).collect::<Result<_>>()?;
        assert_eq!(got.len(), 34);
        assert_eq!(got[0].0, key(32));
        assert_eq!(got.last().map(|s| s.0.clone()), Some(key(98)));
        Ok(())
    }

    #[test]
    fn forced_split_keeps_entries() -> Result<()> {
        let cx = cx(1024);
        let mut t = BTree::empty(1);
        for i in 0..10u32 {
            t = t.updated(&cx, &key(i), key(i), 1)?;
        }
        let s = t.split(&cx, 2)?;
        assert!(!s.root().is_leaf());
        assert_eq!(s.len(), 10);
        for i in 0..10u32 {
            assert_eq!(s.get(&cx, &key(i))?, Some(key(i)));
        }
        Ok(())
    }
}
