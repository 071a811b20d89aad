//! db/handles — typed handles over the database's tree cells.
//!
//! Mutations go through the cell (pending version, auto-balance, delegate);
//! reads take a snapshot of the root and run without locks.

use anyhow::Result;
use std::sync::Arc;

use crate::btree::{BTree, BTreeCursor, BTreeSlot};
use crate::codec::{Bytes, Codec};
use crate::db::core::{Database, TreeCell};
use crate::error::TreeError;
use crate::page::TreeContext;
use crate::qtree::{Bounds, Projection, QTree, QTreeCursor, QTreeEntry, Tile};
use crate::stree::{STree, STreeSlot};
use crate::tree::{TreeKind, TreeRoot};
use crate::utree::UTree;

fn mismatch(cell: &TreeCell, want: TreeKind) -> anyhow::Error {
    TreeError::State(format!("tree {} is a {}, not a {}", cell.name, cell.kind, want)).into()
}

macro_rules! typed_root {
    ($fn:ident, $variant:ident, $ty:ty, $kind:expr) => {
        fn $fn<'a>(cell: &TreeCell, root: &'a TreeRoot) -> Result<&'a $ty> {
            match root {
                TreeRoot::$variant(t) => Ok(t),
                _ => Err(mismatch(cell, $kind)),
            }
        }
    };
}

typed_root!(as_btree, BTree, BTree, TreeKind::BTree);
typed_root!(as_qtree, QTree, QTree, TreeKind::QTree);
typed_root!(as_stree, STree, STree, TreeKind::STree);
typed_root!(as_utree, UTree, UTree, TreeKind::UTree);

// ---------------- ordered map ----------------

/// Ordered map from opaque keys to opaque values.
#[derive(Clone)]
pub struct BTreeMapHandle {
    db: Database,
    cell: Arc<TreeCell>,
}

impl BTreeMapHandle {
    pub(crate) fn new(db: Database, cell: Arc<TreeCell>) -> Self {
        Self { db, cell }
    }

    pub fn name(&self) -> &str {
        &self.cell.name
    }

    pub fn stem(&self) -> u32 {
        self.cell.stem
    }

    /// Snapshot of the current tree and a context to read it with.
    pub fn snapshot(&self) -> Result<(BTree, TreeContext)> {
        let (root, cx) = self.cell.read(&self.db)?;
        Ok((as_btree(&self.cell, &root)?.clone(), cx))
    }

    pub fn len(&self) -> Result<u64> {
        Ok(self.snapshot()?.0.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Bytes>> {
        let (t, cx) = self.snapshot()?;
        t.get(&cx, key)
    }

    pub fn contains_key(&self, key: &[u8]) -> Result<bool> {
        let (t, cx) = self.snapshot()?;
        t.contains_key(&cx, key)
    }

    /// Entry at position `index` in key order.
    pub fn get_index(&self, index: u64) -> Result<Option<BTreeSlot>> {
        let (t, cx) = self.snapshot()?;
        t.get_index(&cx, index)
    }

    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let value: Bytes = Arc::from(value);
        self.cell.mutate(&self.db, |root, cx, v| {
            Ok(TreeRoot::BTree(as_btree(&self.cell, root)?.updated(cx, key, value, v)?))
        })?;
        Ok(())
    }

    /// True when the key was present.
    pub fn remove(&self, key: &[u8]) -> Result<bool> {
        self.cell.mutate(&self.db, |root, cx, v| {
            Ok(TreeRoot::BTree(as_btree(&self.cell, root)?.removed(cx, key, v)?))
        })
    }

    /// Remove the first `n` entries in key order.
    pub fn drop_front(&self, n: u64) -> Result<()> {
        self.cell.mutate(&self.db, |root, cx, v| {
            Ok(TreeRoot::BTree(as_btree(&self.cell, root)?.drop(cx, n, v)?))
        })?;
        Ok(())
    }

    /// Keep only the first `n` entries in key order.
    pub fn take_front(&self, n: u64) -> Result<()> {
        self.cell.mutate(&self.db, |root, cx, v| {
            Ok(TreeRoot::BTree(as_btree(&self.cell, root)?.take(cx, n, v)?))
        })?;
        Ok(())
    }

    /// Balance the pages touched since the last commit.
    pub fn balance(&self) -> Result<()> {
        self.cell.mutate(&self.db, |root, cx, v| root.balanced(cx, v))?;
        Ok(())
    }

    pub fn cursor(&self) -> Result<BTreeCursor> {
        let (t, cx) = self.snapshot()?;
        Ok(t.cursor(&cx))
    }

    /// Entries with keys `>= start`, in order.
    pub fn cursor_from(&self, start: &[u8]) -> Result<BTreeCursor> {
        let (t, cx) = self.snapshot()?;
        Ok(t.cursor_from(&cx, start))
    }

    pub fn entries(&self) -> Result<Vec<BTreeSlot>> {
        let (t, cx) = self.snapshot()?;
        t.entries(&cx)
    }

    pub fn put_with<V, C: Codec<V>>(&self, key: &[u8], value: &V, codec: &C) -> Result<()> {
        self.put(key, &codec.encode(value))
    }

    pub fn get_with<V, C: Codec<V>>(&self, key: &[u8], codec: &C) -> Result<Option<V>> {
        match self.get(key)? {
            Some(b) => Ok(Some(codec.decode(&b)?)),
            None => Ok(None),
        }
    }
}

// ---------------- spatial map ----------------

/// Spatial map keyed by (key, x tile, y tile).
#[derive(Clone)]
pub struct QTreeMapHandle {
    db: Database,
    cell: Arc<TreeCell>,
    projection: Arc<dyn Projection>,
}

impl QTreeMapHandle {
    pub(crate) fn new(db: Database, cell: Arc<TreeCell>, projection: Arc<dyn Projection>) -> Self {
        Self { db, cell, projection }
    }

    pub fn name(&self) -> &str {
        &self.cell.name
    }

    pub fn projection(&self) -> &Arc<dyn Projection> {
        &self.projection
    }

    pub fn snapshot(&self) -> Result<(QTree, TreeContext)> {
        let (root, cx) = self.cell.read(&self.db)?;
        Ok((as_qtree(&self.cell, &root)?.clone(), cx))
    }

    pub fn len(&self) -> Result<u64> {
        Ok(self.snapshot()?.0.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    pub fn get(&self, key: &[u8], x: Tile, y: Tile) -> Result<Option<Bytes>> {
        let (t, cx) = self.snapshot()?;
        t.get(&cx, key, x, y)
    }

    pub fn contains_key(&self, key: &[u8], x: Tile, y: Tile) -> Result<bool> {
        let (t, cx) = self.snapshot()?;
        t.contains_key(&cx, key, x, y)
    }

    pub fn put(&self, key: &[u8], x: Tile, y: Tile, value: &[u8]) -> Result<()> {
        let value: Bytes = Arc::from(value);
        self.cell.mutate(&self.db, |root, cx, v| {
            Ok(TreeRoot::QTree(as_qtree(&self.cell, root)?.updated(cx, key, x, y, value, v)?))
        })?;
        Ok(())
    }

    pub fn remove(&self, key: &[u8], x: Tile, y: Tile) -> Result<bool> {
        self.cell.mutate(&self.db, |root, cx, v| {
            Ok(TreeRoot::QTree(as_qtree(&self.cell, root)?.removed(cx, key, x, y, v)?))
        })
    }

    /// Move the entry `key` from `from` to `to`, keeping its value. False if
    /// there was no entry at `from`.
    pub fn moved(&self, key: &[u8], from: (Tile, Tile), to: (Tile, Tile)) -> Result<bool> {
        let mut found = false;
        self.cell.mutate(&self.db, |root, cx, v| {
            let t = as_qtree(&self.cell, root)?;
            match t.get(cx, key, from.0, from.1)? {
                None => Ok(root.clone()),
                Some(value) => {
                    found = true;
                    let t = t.removed(cx, key, from.0, from.1, v)?;
                    Ok(TreeRoot::QTree(t.updated(cx, key, to.0, to.1, value, v)?))
                }
            }
        })?;
        Ok(found)
    }

    // ----- projected coordinates -----

    pub fn put_at(&self, key: &[u8], at: &Bounds, value: &[u8]) -> Result<()> {
        let (x, y) = self.projection.tiles(at)?;
        self.put(key, x, y, value)
    }

    pub fn get_at(&self, key: &[u8], at: &Bounds) -> Result<Option<Bytes>> {
        let (x, y) = self.projection.tiles(at)?;
        self.get(key, x, y)
    }

    pub fn remove_at(&self, key: &[u8], at: &Bounds) -> Result<bool> {
        let (x, y) = self.projection.tiles(at)?;
        self.remove(key, x, y)
    }

    /// Entries whose tiles intersect the projected box.
    pub fn query(&self, area: &Bounds) -> Result<Vec<QTreeEntry>> {
        let (x0, y0, x1, y1) = self.projection.project(area)?;
        self.get_all(x0, y0, x1, y1)
    }

    // ----- tile space -----

    pub fn get_all(&self, x0: u64, y0: u64, x1: u64, y1: u64) -> Result<Vec<QTreeEntry>> {
        let (t, cx) = self.snapshot()?;
        t.get_all(&cx, x0, y0, x1, y1)
    }

    pub fn cursor(&self, x0: u64, y0: u64, x1: u64, y1: u64) -> Result<QTreeCursor> {
        let (t, cx) = self.snapshot()?;
        t.cursor(&cx, x0, y0, x1, y1)
    }

    pub fn cursor_at(&self, x: u64, y: u64) -> Result<QTreeCursor> {
        let (t, cx) = self.snapshot()?;
        t.cursor_at(&cx, x, y)
    }

    pub fn entries(&self) -> Result<Vec<QTreeEntry>> {
        let (t, cx) = self.snapshot()?;
        t.entries(&cx)
    }

    /// Forced split of the root page.
    pub fn split(&self) -> Result<()> {
        self.cell.mutate(&self.db, |root, cx, v| {
            Ok(TreeRoot::QTree(as_qtree(&self.cell, root)?.split(cx, v)?))
        })?;
        Ok(())
    }

    pub fn balance(&self) -> Result<()> {
        self.cell.mutate(&self.db, |root, cx, v| root.balanced(cx, v))?;
        Ok(())
    }
}

// ---------------- sequence ----------------

/// Positional list of (key id, value) entries.
#[derive(Clone)]
pub struct STreeListHandle {
    db: Database,
    cell: Arc<TreeCell>,
}

impl STreeListHandle {
    pub(crate) fn new(db: Database, cell: Arc<TreeCell>) -> Self {
        Self { db, cell }
    }

    pub fn name(&self) -> &str {
        &self.cell.name
    }

    pub fn snapshot(&self) -> Result<(STree, TreeContext)> {
        let (root, cx) = self.cell.read(&self.db)?;
        Ok((as_stree(&self.cell, &root)?.clone(), cx))
    }

    pub fn len(&self) -> Result<u64> {
        Ok(self.snapshot()?.0.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    pub fn get(&self, index: u64) -> Result<Option<Bytes>> {
        let (t, cx) = self.snapshot()?;
        t.get(&cx, index)
    }

    pub fn get_entry(&self, index: u64) -> Result<Option<STreeSlot>> {
        let (t, cx) = self.snapshot()?;
        t.get_entry(&cx, index)
    }

    pub fn index_of(&self, key: &[u8]) -> Result<Option<u64>> {
        let (t, cx) = self.snapshot()?;
        t.index_of(&cx, key)
    }

    pub fn append(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let (key, value): (Bytes, Bytes) = (Arc::from(key), Arc::from(value));
        self.cell.mutate(&self.db, |root, cx, v| {
            Ok(TreeRoot::STree(as_stree(&self.cell, root)?.appended(cx, key, value, v)?))
        })?;
        Ok(())
    }

    pub fn prepend(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let (key, value): (Bytes, Bytes) = (Arc::from(key), Arc::from(value));
        self.cell.mutate(&self.db, |root, cx, v| {
            Ok(TreeRoot::STree(as_stree(&self.cell, root)?.prepended(cx, key, value, v)?))
        })?;
        Ok(())
    }

    /// Insert before `index`; `index == len` appends.
    pub fn insert(&self, index: u64, key: &[u8], value: &[u8]) -> Result<()> {
        let (key, value): (Bytes, Bytes) = (Arc::from(key), Arc::from(value));
        self.cell.mutate(&self.db, |root, cx, v| {
            Ok(TreeRoot::STree(as_stree(&self.cell, root)?.inserted(cx, index, key, value, v)?))
        })?;
        Ok(())
    }

    /// Replace the value at `index`. False when the value was already equal.
    pub fn update(&self, index: u64, value: &[u8]) -> Result<bool> {
        let value: Bytes = Arc::from(value);
        self.cell.mutate(&self.db, |root, cx, v| {
            Ok(TreeRoot::STree(as_stree(&self.cell, root)?.updated(cx, index, value, v)?))
        })
    }

    /// False when `index` was out of range.
    pub fn remove(&self, index: u64) -> Result<bool> {
        self.cell.mutate(&self.db, |root, cx, v| {
            Ok(TreeRoot::STree(as_stree(&self.cell, root)?.removed(cx, index, v)?))
        })
    }

    pub fn drop_front(&self, n: u64) -> Result<()> {
        self.cell.mutate(&self.db, |root, cx, v| {
            Ok(TreeRoot::STree(as_stree(&self.cell, root)?.drop(cx, n, v)?))
        })?;
        Ok(())
    }

    pub fn take_front(&self, n: u64) -> Result<()> {
        self.cell.mutate(&self.db, |root, cx, v| {
            Ok(TreeRoot::STree(as_stree(&self.cell, root)?.take(cx, n, v)?))
        })?;
        Ok(())
    }

    pub fn entries(&self) -> Result<Vec<STreeSlot>> {
        let (t, cx) = self.snapshot()?;
        t.entries(&cx)
    }

    pub fn values(&self) -> Result<Vec<Bytes>> {
        let (t, cx) = self.snapshot()?;
        t.values(&cx)
    }

    pub fn balance(&self) -> Result<()> {
        self.cell.mutate(&self.db, |root, cx, v| root.balanced(cx, v))?;
        Ok(())
    }
}

// ---------------- value cell ----------------

/// A single persisted value.
#[derive(Clone)]
pub struct UTreeValueHandle {
    db: Database,
    cell: Arc<TreeCell>,
}

impl UTreeValueHandle {
    pub(crate) fn new(db: Database, cell: Arc<TreeCell>) -> Self {
        Self { db, cell }
    }

    pub fn name(&self) -> &str {
        &self.cell.name
    }

    /// Current value (empty for a fresh cell).
    pub fn get(&self) -> Result<Bytes> {
        let (root, cx) = self.cell.read(&self.db)?;
        as_utree(&self.cell, &root)?.get(&cx)
    }

    /// False when the value was already equal.
    pub fn set(&self, value: &[u8]) -> Result<bool> {
        let value: Bytes = Arc::from(value);
        self.cell.mutate(&self.db, |root, cx, v| {
            Ok(TreeRoot::UTree(as_utree(&self.cell, root)?.updated(cx, value, v)?))
        })
    }

    pub fn get_with<V, C: Codec<V>>(&self, codec: &C) -> Result<V> {
        codec.decode(&self.get()?)
    }

    pub fn set_with<V, C: Codec<V>>(&self, value: &V, codec: &C) -> Result<bool> {
        self.set(&codec.encode(value))
    }
}
