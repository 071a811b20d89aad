//! qtree — persistent spatial map keyed by (key, x-tile, y-tile).
//!
//! Entries descend into the child whose cover contains both of their tiles;
//! anything that fits no child is lifted into the node's own slots and the
//! node's cover grows to include it. Child covers are pairwise disjoint, so
//! the containing child is unique.

mod cursor;
mod page;
mod projection;
mod split;
pub mod tile;

pub use cursor::QTreeCursor;
pub use page::{QTreeEntry, QTreeHint, QTreePage};
pub use projection::{Bounds, GridProjection, IdentityProjection, Projection};
pub use tile::Tile;

use anyhow::Result;
use std::sync::Arc;

use crate::codec::Bytes;
use crate::error::TreeError;
use crate::page::{PageRef, TreeContext, TreePage};
use crate::policy::PageStats;
use page::slots_with;
use tile::COORD_LIMIT;

#[derive(Debug, Clone)]
pub struct QTree {
    root: PageRef<QTreePage>,
}

impl QTree {
    pub fn empty(version: u64) -> Self {
        Self {
            root: PageRef::resident(Arc::new(QTreePage::empty(version))),
        }
    }

    pub fn from_root(root: PageRef<QTreePage>) -> Self {
        Self { root }
    }

    #[inline]
    pub fn root(&self) -> &PageRef<QTreePage> {
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

    pub fn same_root(&self, other: &QTree) -> bool {
        self.root.same_page(&other.root)
    }

    pub fn get(&self, cx: &TreeContext, key: &[u8], x: Tile, y: Tile) -> Result<Option<Bytes>> {
        let hint = QTreeHint { x, y };
        let mut r = self.root.clone();
        loop {
            if r.span() == 0 {
                return Ok(None);
            }
            let page = r.page(cx)?;
            if let Ok(i) = page.find_slot(key, x, y) {
                return Ok(Some(page.slots()[i].value.clone()));
            }
            match page.child_containing(&hint) {
                Some(ci) => r = page.child_refs()[ci].clone(),
                None => return Ok(None),
            }
        }
    }

    pub fn contains_key(&self, cx: &TreeContext, key: &[u8], x: Tile, y: Tile) -> Result<bool> {
        Ok(self.get(cx, key, x, y)?.is_some())
    }

    /// Insert or replace. An equal value returns the same tree.
    pub fn updated(
        &self,
        cx: &TreeContext,
        key: &[u8],
        x: Tile,
        y: Tile,
        value: Bytes,
        version: u64,
    ) -> Result<QTree> {
        let entry = QTreeEntry::new(Arc::from(key), x, y, value);
        match updated_ref(&self.root, cx, entry, version)? {
            Some(root) => Ok(QTree { root }),
            None => Ok(self.clone()),
        }
    }

    /// Remove. An absent entry returns the same tree.
    pub fn removed(&self, cx: &TreeContext, key: &[u8], x: Tile, y: Tile, version: u64) -> Result<QTree> {
        match removed_ref(&self.root, cx, key, &QTreeHint { x, y }, version)? {
            Some(root) => Ok(QTree { root }),
            None => Ok(self.clone()),
        }
    }

    /// Forced split of the root page. Unsplittable roots stay as they are.
    pub fn split(&self, cx: &TreeContext, version: u64) -> Result<QTree> {
        Ok(QTree {
            root: split::split_ref(&self.root, cx, version)?,
        })
    }

    pub fn balanced(&self, cx: &TreeContext, version: u64) -> Result<QTree> {
        Ok(QTree {
            root: split::balanced_ref(&self.root, cx, version)?,
        })
    }

    /// Entries whose tiles overlap the inclusive box, loaded lazily.
    pub fn cursor(&self, cx: &TreeContext, x0: u64, y0: u64, x1: u64, y1: u64) -> Result<QTreeCursor> {
        check_box(x0, y0, x1, y1)?;
        Ok(QTreeCursor::new(self.root.clone(), cx.clone(), (x0, y0, x1, y1)))
    }

    /// Entries whose tiles cover the point.
    pub fn cursor_at(&self, cx: &TreeContext, x: u64, y: u64) -> Result<QTreeCursor> {
        self.cursor(cx, x, y, x, y)
    }

    pub fn get_all(&self, cx: &TreeContext, x0: u64, y0: u64, x1: u64, y1: u64) -> Result<Vec<QTreeEntry>> {
        self.cursor(cx, x0, y0, x1, y1)?.collect()
    }

    /// Every entry, in no particular order.
    pub fn entries(&self, cx: &TreeContext) -> Result<Vec<QTreeEntry>> {
        self.get_all(cx, 0, 0, COORD_LIMIT - 1, COORD_LIMIT - 1)
    }
}

fn check_box(x0: u64, y0: u64, x1: u64, y1: u64) -> Result<()> {
    if x0 > x1 || y0 > y1 {
        return Err(TreeError::dimension(format!(
            "inverted box ({}, {})..({}, {})",
            x0, y0, x1, y1
        ))
        .into());
    }
    if x1 >= COORD_LIMIT || y1 >= COORD_LIMIT {
        return Err(TreeError::dimension(format!(
            "box ({}, {})..({}, {}) exceeds the tile space",
            x0, y0, x1, y1
        ))
        .into());
    }
    Ok(())
}

fn rebuild(page: &QTreePage, children: Vec<PageRef<QTreePage>>, slots: Vec<QTreeEntry>, version: u64) -> PageRef<QTreePage> {
    let p = if page.is_leaf() {
        QTreePage::leaf(slots, version)
    } else {
        QTreePage::node(children, slots, version)
    };
    PageRef::resident(Arc::new(p))
}

fn updated_ref(
    r: &PageRef<QTreePage>,
    cx: &TreeContext,
    entry: QTreeEntry,
    version: u64,
) -> Result<Option<PageRef<QTreePage>>> {
    let page = r.page(cx)?;
    let children = page.child_refs();
    if let Ok(i) = page.find_slot(&entry.key, entry.x, entry.y) {
        if page.slots()[i].value[..] == entry.value[..] {
            return Ok(None);
        }
        let slots = slots_with(page.slots(), entry);
        return Ok(Some(rebuild(&page, children.to_vec(), slots, version)));
    }
    if !page.is_leaf() {
        if let Some(ci) = page.child_containing(&entry.hint()) {
            return Ok(match updated_ref(&children[ci], cx, entry, version)? {
                None => None,
                Some(child) => {
                    let mut next = children.to_vec();
                    next[ci] = child;
                    Some(rebuild(&page, next, page.slots().to_vec(), version))
                }
            });
        }
    }
    // Leaf insert, or lift into this node; the cover grows as needed.
    let slots = slots_with(page.slots(), entry);
    Ok(Some(rebuild(&page, children.to_vec(), slots, version)))
}

fn removed_ref(
    r: &PageRef<QTreePage>,
    cx: &TreeContext,
    key: &[u8],
    hint: &QTreeHint,
    version: u64,
) -> Result<Option<PageRef<QTreePage>>> {
    if r.span() == 0 {
        return Ok(None);
    }
    let page = r.page(cx)?;
    let children = page.child_refs();
    if let Ok(i) = page.find_slot(key, hint.x, hint.y) {
        let mut slots = page.slots().to_vec();
        slots.remove(i);
        return Ok(Some(rebuild(&page, children.to_vec(), slots, version)));
    }
    let ci = match page.child_containing(hint) {
        Some(ci) => ci,
        None => return Ok(None),
    };
    Ok(match removed_ref(&children[ci], cx, key, hint, version)? {
        None => None,
        Some(child) => {
            let mut next = children.to_vec();
            next[ci] = child;
            Some(rebuild(&page, next, page.slots().to_vec(), version))
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::bytes;
    use crate::policy::ArityPolicy;

    fn pt(v: u64) -> Tile {
        Tile::point(v).unwrap()
    }

    #[test]
    fn lifted_entry_is_found_and_removed() -> Result<()> {
        let cx = TreeContext::new(1, Arc::new(ArityPolicy::new(2)));
        let mut t = QTree::empty(1);
        for (i, (x, y)) in [(1, 1), (1, 9), (9, 1), (9, 9)].iter().enumerate() {
            t = t.updated(&cx, format!("p{}", i).as_bytes(), pt(*x), pt(*y), bytes(b"v"), 1)?;
        }
        t = t.split(&cx, 1)?;
        assert!(!t.root().is_leaf());

        // Straddles every quadrant of the root cover.
        let wide = Tile::new(4, 0)?;
        t = t.updated(&cx, b"wide", wide, wide, bytes(b"w"), 2)?;
        assert_eq!(t.get(&cx, b"wide", wide, wide)?, Some(bytes(b"w")));
        let root = t.root().page(&cx)?;
        assert_eq!(root.slots().len(), 1);

        let hits = t.get_all(&cx, 8, 8, 8, 8)?;
        assert_eq!(hits.len(), 1);
        assert_eq!(&hits[0].key[..], b"wide");

        let t2 = t.removed(&cx, b"wide", wide, wide, 3)?;
        assert_eq!(t2.len(), 4);
        assert!(t2.get(&cx, b"wide", wide, wide)?.is_none());
        let same = t2.removed(&cx, b"wide", wide, wide, 4)?;
        assert!(same.same_root(&t2));
        Ok(())
    }

    #[test]
    fn bad_box_is_dimension_mismatch() {
        let cx = TreeContext::new(1, Arc::new(ArityPolicy::default()));
        let t = QTree::empty(1);
        let err = t.get_all(&cx, 5, 0, 1, 0).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<TreeError>(),
            Some(TreeError::DimensionMismatch(_))
        ));
        assert!(t.cursor(&cx, 0, 0, COORD_LIMIT, 1).is_err());
    }
}
