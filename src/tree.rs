//! tree — tagged union over the four tree kinds.
//!
//! The database stores every tree root as a `TreeRoot` and drives commit,
//! rebase and compaction through it; the per-kind work is done by generic
//! walks over `PageRef<P>`.

use anyhow::{anyhow, Result};
use byteorder::{ReadBytesExt, WriteBytesExt};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use crate::btree::{BTree, BTreePage};
use crate::consts::BLOCK_HDR_SIZE;
use crate::page::{PageRef, TreeContext, TreePage, PAGE_REF_SIZE};
use crate::qtree::{QTree, QTreePage};
use crate::store::chunk::ChunkWriter;
use crate::stree::{STree, STreePage};
use crate::utree::{UTree, UTreePage};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TreeKind {
    BTree,
    QTree,
    STree,
    UTree,
}

impl TreeKind {
    pub fn code(self) -> u8 {
        match self {
            TreeKind::BTree => 1,
            TreeKind::QTree => 2,
            TreeKind::STree => 3,
            TreeKind::UTree => 4,
        }
    }

    pub fn from_code(code: u8) -> Result<Self> {
        Ok(match code {
            1 => TreeKind::BTree,
            2 => TreeKind::QTree,
            3 => TreeKind::STree,
            4 => TreeKind::UTree,
            other => return Err(anyhow!("unknown tree kind {}", other)),
        })
    }

    /// Bytes a page reference of this kind spends on its hint.
    pub(crate) fn hint_len(self) -> usize {
        match self {
            TreeKind::QTree => 16,
            _ => 0,
        }
    }
}

impl fmt::Display for TreeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TreeKind::BTree => "btree",
            TreeKind::QTree => "qtree",
            TreeKind::STree => "stree",
            TreeKind::UTree => "utree",
        };
        f.pad(s)
    }
}

#[derive(Debug, Clone)]
pub enum TreeRoot {
    BTree(BTree),
    QTree(QTree),
    STree(STree),
    UTree(UTree),
}

/// Pages written by one commit, keyed by the identity of the dirty page they
/// replace.
pub(crate) enum Written {
    BTree(HashMap<usize, PageRef<BTreePage>>),
    QTree(HashMap<usize, PageRef<QTreePage>>),
    STree(HashMap<usize, PageRef<STreePage>>),
    UTree(HashMap<usize, PageRef<UTreePage>>),
}

macro_rules! each_root {
    ($root:expr, $r:ident => $body:expr) => {
        match $root {
            TreeRoot::BTree(t) => {
                let $r = t.root();
                $body
            }
            TreeRoot::QTree(t) => {
                let $r = t.root();
                $body
            }
            TreeRoot::STree(t) => {
                let $r = t.root();
                $body
            }
            TreeRoot::UTree(t) => {
                let $r = t.root();
                $body
            }
        }
    };
}

impl TreeRoot {
    pub fn empty(kind: TreeKind, version: u64) -> Self {
        match kind {
            TreeKind::BTree => TreeRoot::BTree(BTree::empty(version)),
            TreeKind::QTree => TreeRoot::QTree(QTree::empty(version)),
            TreeKind::STree => TreeRoot::STree(STree::empty(version)),
            TreeKind::UTree => TreeRoot::UTree(UTree::empty(version)),
        }
    }

    pub fn kind(&self) -> TreeKind {
        match self {
            TreeRoot::BTree(_) => TreeKind::BTree,
            TreeRoot::QTree(_) => TreeKind::QTree,
            TreeRoot::STree(_) => TreeKind::STree,
            TreeRoot::UTree(_) => TreeKind::UTree,
        }
    }

    pub fn version(&self) -> u64 {
        each_root!(self, r => r.version())
    }

    /// Entry count (1 for a value cell).
    pub fn span(&self) -> u64 {
        each_root!(self, r => r.span())
    }

    /// Bytes of persisted pages reachable from the root.
    pub fn tree_size(&self) -> u64 {
        each_root!(self, r => r.tree_size())
    }

    pub fn is_dirty(&self) -> bool {
        each_root!(self, r => r.is_dirty())
    }

    pub fn same_root(&self, other: &TreeRoot) -> bool {
        match (self, other) {
            (TreeRoot::BTree(a), TreeRoot::BTree(b)) => a.same_root(b),
            (TreeRoot::QTree(a), TreeRoot::QTree(b)) => a.same_root(b),
            (TreeRoot::STree(a), TreeRoot::STree(b)) => a.same_root(b),
            (TreeRoot::UTree(a), TreeRoot::UTree(b)) => a.same_root(b),
            _ => false,
        }
    }

    pub fn balanced(&self, cx: &TreeContext, version: u64) -> Result<TreeRoot> {
        Ok(match self {
            TreeRoot::BTree(t) => TreeRoot::BTree(t.balanced(cx, version)?),
            TreeRoot::QTree(t) => TreeRoot::QTree(t.balanced(cx, version)?),
            TreeRoot::STree(t) => TreeRoot::STree(t.balanced(cx, version)?),
            TreeRoot::UTree(_) => self.clone(),
        })
    }

    /// Estimated encoded bytes of the dirty pages.
    pub fn diff_size(&self) -> u64 {
        each_root!(self, r => dirty_size(r) as u64)
    }

    /// Write every dirty page into `w`, children before parents. Returns the
    /// persisted root and the written-page map used by `rebase`.
    pub(crate) fn write_dirty(&self, stem: u32, w: &mut ChunkWriter) -> Result<(TreeRoot, Written)> {
        Ok(match self {
            TreeRoot::BTree(t) => {
                let mut m = HashMap::new();
                let r = write_dirty(t.root(), stem, w, &mut m)?;
                (TreeRoot::BTree(BTree::from_root(r)), Written::BTree(m))
            }
            TreeRoot::QTree(t) => {
                let mut m = HashMap::new();
                let r = write_dirty(t.root(), stem, w, &mut m)?;
                (TreeRoot::QTree(QTree::from_root(r)), Written::QTree(m))
            }
            TreeRoot::STree(t) => {
                let mut m = HashMap::new();
                let r = write_dirty(t.root(), stem, w, &mut m)?;
                (TreeRoot::STree(STree::from_root(r)), Written::STree(m))
            }
            TreeRoot::UTree(t) => {
                let mut m = HashMap::new();
                let r = write_dirty(t.root(), stem, w, &mut m)?;
                (TreeRoot::UTree(UTree::from_root(r)), Written::UTree(m))
            }
        })
    }

    /// Replace dirty pages that `written` persisted with stored references.
    /// Pages created after the snapshot stay dirty.
    pub(crate) fn rebase(&self, written: &Written) -> TreeRoot {
        match (self, written) {
            (TreeRoot::BTree(t), Written::BTree(m)) => TreeRoot::BTree(BTree::from_root(rebase(t.root(), m))),
            (TreeRoot::QTree(t), Written::QTree(m)) => TreeRoot::QTree(QTree::from_root(rebase(t.root(), m))),
            (TreeRoot::STree(t), Written::STree(m)) => TreeRoot::STree(STree::from_root(rebase(t.root(), m))),
            (TreeRoot::UTree(t), Written::UTree(m)) => TreeRoot::UTree(UTree::from_root(rebase(t.root(), m))),
            _ => self.clone(),
        }
    }

    /// Copy every persisted page older than `floor` (and its ancestors) into
    /// fresh dirty pages stamped `version`. Returns the new root and the
    /// number of pages rewritten.
    pub(crate) fn rewrite_below(&self, cx: &TreeContext, floor: u64, version: u64) -> Result<(TreeRoot, usize)> {
        let mut n = 0;
        let root = match self {
            TreeRoot::BTree(t) => TreeRoot::BTree(BTree::from_root(rewrite_below(t.root(), cx, floor, version, &mut n)?)),
            TreeRoot::QTree(t) => TreeRoot::QTree(QTree::from_root(rewrite_below(t.root(), cx, floor, version, &mut n)?)),
            TreeRoot::STree(t) => TreeRoot::STree(STree::from_root(rewrite_below(t.root(), cx, floor, version, &mut n)?)),
            TreeRoot::UTree(t) => TreeRoot::UTree(UTree::from_root(rewrite_below(t.root(), cx, floor, version, &mut n)?)),
        };
        Ok((root, n))
    }

    /// Zones below `below` holding at least one page reachable from this
    /// root. Subtrees living entirely at or above `below` are not loaded.
    pub(crate) fn collect_zones(&self, cx: &TreeContext, below: u32, out: &mut BTreeSet<u32>) -> Result<()> {
        each_root!(self, r => collect_zones(r, cx, below, out))
    }

    /// Serialized stored root reference (germ seed payload).
    pub(crate) fn write_ref(&self, out: &mut Vec<u8>) -> Result<()> {
        each_root!(self, r => r.write_to(out))
    }

    pub(crate) fn read_ref(kind: TreeKind, r: &mut &[u8]) -> Result<TreeRoot> {
        Ok(match kind {
            TreeKind::BTree => TreeRoot::BTree(BTree::from_root(PageRef::read_from(r)?)),
            TreeKind::QTree => TreeRoot::QTree(QTree::from_root(PageRef::read_from(r)?)),
            TreeKind::STree => TreeRoot::STree(STree::from_root(PageRef::read_from(r)?)),
            TreeKind::UTree => TreeRoot::UTree(UTree::from_root(PageRef::read_from(r)?)),
        })
    }
}

/// Germ entry describing one tree.
#[derive(Debug, Clone)]
pub struct TreeSeed {
    pub name: String,
    pub stem: u32,
    pub root: TreeRoot,
}

impl TreeSeed {
    /// Encoded size of a seed for tree `name` of `kind`.
    pub(crate) fn encoded_len(name: &str, kind: TreeKind) -> usize {
        // name (u32 len + bytes), kind, stem, root ref
        4 + name.len() + 1 + 4 + PAGE_REF_SIZE + kind.hint_len()
    }

    pub(crate) fn write(&self, out: &mut Vec<u8>) -> Result<()> {
        crate::page::put_bytes(out, self.name.as_bytes())?;
        out.write_u8(self.root.kind().code())?;
        out.write_u32::<byteorder::LittleEndian>(self.stem)?;
        self.root.write_ref(out)
    }

    pub(crate) fn read(r: &mut &[u8]) -> Result<Self> {
        let name = crate::page::get_bytes(r)?;
        let name = String::from_utf8(name.to_vec()).map_err(|e| anyhow!("tree name is not utf-8: {}", e))?;
        let kind = TreeKind::from_code(r.read_u8()?)?;
        let stem = r.read_u32::<byteorder::LittleEndian>()?;
        let root = TreeRoot::read_ref(kind, r)?;
        Ok(Self { name, stem, root })
    }
}

// ---------------- generic walks ----------------

fn dirty_size<P: TreePage>(r: &PageRef<P>) -> usize {
    match r.resident_page() {
        Some(p) if r.is_dirty() => {
            BLOCK_HDR_SIZE + p.estimated_size() + p.child_refs().iter().map(dirty_size).sum::<usize>()
        }
        _ => 0,
    }
}

fn write_dirty<P: TreePage>(
    r: &PageRef<P>,
    stem: u32,
    w: &mut ChunkWriter,
    written: &mut HashMap<usize, PageRef<P>>,
) -> Result<PageRef<P>> {
    let (page, key) = match (r.is_dirty(), r.resident_page(), r.page_ptr()) {
        (true, Some(p), Some(key)) => (p.clone(), key),
        _ => return Ok(r.clone()),
    };
    if let Some(done) = written.get(&key) {
        return Ok(done.clone());
    }
    let mut changed = false;
    let mut children = Vec::with_capacity(page.child_refs().len());
    for c in page.child_refs() {
        changed |= c.is_dirty();
        children.push(write_dirty(c, stem, w, written)?);
    }
    let persisted = if changed {
        Arc::new(page.rebuilt(children, page.version()))
    } else {
        page.clone()
    };
    let addr = w.append(&persisted, stem)?;
    let kids = persisted.child_refs();
    let tree_size = kids.iter().map(|c| c.tree_size()).sum::<u64>() + addr.size as u64;
    let oldest = kids.iter().map(|c| c.oldest()).fold(page.version(), u64::min);
    let low_zone = kids.iter().map(|c| c.low_zone()).fold(addr.zone, u32::min);
    let stored = PageRef::stored(
        addr,
        page.version(),
        page.span(),
        tree_size,
        oldest,
        low_zone,
        page.is_leaf(),
        page.hint(),
    );
    written.insert(key, stored.clone());
    Ok(stored)
}

fn rebase<P: TreePage>(r: &PageRef<P>, written: &HashMap<usize, PageRef<P>>) -> PageRef<P> {
    let (page, key) = match (r.is_dirty(), r.resident_page(), r.page_ptr()) {
        (true, Some(p), Some(key)) => (p.clone(), key),
        _ => return r.clone(),
    };
    if let Some(stored) = written.get(&key) {
        return stored.clone();
    }
    let mut changed = false;
    let children: Vec<PageRef<P>> = page
        .child_refs()
        .iter()
        .map(|c| {
            let n = rebase(c, written);
            changed |= !n.same_page(c);
            n
        })
        .collect();
    if !changed {
        return r.clone();
    }
    PageRef::resident(Arc::new(page.rebuilt(children, page.version())))
}

fn rewrite_below<P: TreePage>(
    r: &PageRef<P>,
    cx: &TreeContext,
    floor: u64,
    version: u64,
    count: &mut usize,
) -> Result<PageRef<P>> {
    if r.oldest() >= floor {
        return Ok(r.clone());
    }
    let page = r.page(cx)?;
    let mut changed = false;
    let mut children = Vec::with_capacity(page.child_refs().len());
    for c in page.child_refs() {
        let n = rewrite_below(c, cx, floor, version, count)?;
        changed |= !n.same_page(c);
        children.push(n);
    }
    if r.is_dirty() {
        if !changed {
            return Ok(r.clone());
        }
        return Ok(PageRef::resident(Arc::new(page.rebuilt(children, page.version()))));
    }
    if changed || r.version() < floor {
        *count += 1;
        return Ok(PageRef::resident(Arc::new(page.rebuilt(children, version))));
    }
    Ok(r.clone())
}

fn collect_zones<P: TreePage>(r: &PageRef<P>, cx: &TreeContext, below: u32, out: &mut BTreeSet<u32>) -> Result<()> {
    if r.low_zone() >= below {
        return Ok(());
    }
    if let Some(addr) = r.addr() {
        if addr.zone < below {
            out.insert(addr.zone);
        }
    }
    if r.is_leaf() {
        return Ok(());
    }
    let page = r.page(cx)?;
    for c in page.child_refs() {
        collect_zones(c, cx, below, out)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::bytes;
    use crate::page::block::PageCodec;
    use crate::page::{CachedPage, PageAddr, PageLoader};
    use crate::policy::ArityPolicy;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn key(i: u32) -> Vec<u8> {
        i.to_be_bytes().to_vec()
    }

    /// Pages of finished chunks, counting every load.
    #[derive(Default)]
    struct MemLoader {
        pages: Mutex<HashMap<(u32, u64), CachedPage>>,
        loads: AtomicUsize,
    }

    impl MemLoader {
        fn loads(&self) -> usize {
            self.loads.load(Ordering::SeqCst)
        }
    }

    impl PageLoader for MemLoader {
        fn load_page(&self, addr: &PageAddr) -> Result<CachedPage> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            self.pages
                .lock()
                .unwrap()
                .get(&(addr.zone, addr.offset))
                .cloned()
                .ok_or_else(|| anyhow!("no page at zone {} offset {}", addr.zone, addr.offset))
        }
    }

    fn persist(root: &TreeRoot, zone: u32, version: u64, loader: &MemLoader) -> Result<TreeRoot> {
        let mut w = ChunkWriter::new(zone, 131072, PageCodec::None, 0);
        let (stored, _) = root.write_dirty(1, &mut w)?;
        let (_, pages) = w.finish(version);
        let mut m = loader.pages.lock().unwrap();
        for (addr, page) in pages {
            m.insert((addr.zone, addr.offset), page);
        }
        Ok(stored)
    }

    fn zone_list(root: &TreeRoot, cx: &TreeContext, below: u32) -> Result<Vec<u32>> {
        let mut out = BTreeSet::new();
        root.collect_zones(cx, below, &mut out)?;
        Ok(out.into_iter().collect())
    }

    #[test]
    fn compaction_walks_skip_settled_subtrees() -> Result<()> {
        let loader = Arc::new(MemLoader::default());
        let cx = TreeContext::new(1, Arc::new(ArityPolicy::new(4))).with_loader(loader.clone());
        let mut t = BTree::empty(1);
        for i in 0..64 {
            t = t.updated(&cx, &key(i), bytes(b"a"), 1)?;
        }
        let v1 = persist(&TreeRoot::BTree(t.balanced(&cx, 1)?), 0, 1, &loader)?;
        assert_eq!(zone_list(&v1, &cx, 1)?, vec![0]);
        let (same, n) = v1.rewrite_below(&cx, 1, 2)?;
        assert_eq!(n, 0);
        assert!(same.same_root(&v1));

        // Move every page to zone 1, then put one fresh path on top in zone 2.
        let (moved, n) = v1.rewrite_below(&cx, 2, 2)?;
        assert!(n > 1, "rewrote {}", n);
        let v2 = persist(&moved, 1, 2, &loader)?;
        let v3 = match &v2 {
            TreeRoot::BTree(t) => TreeRoot::BTree(t.updated(&cx, &key(7), bytes(b"b"), 3)?.balanced(&cx, 3)?),
            _ => unreachable!(),
        };
        let v3 = persist(&v3, 2, 3, &loader)?;

        let before = loader.loads();
        assert!(zone_list(&v3, &cx, 1)?.is_empty());
        let (same, n) = v3.rewrite_below(&cx, 2, 4)?;
        assert_eq!(n, 0);
        assert!(same.same_root(&v3));
        assert_eq!(loader.loads(), before);

        // Untouched leaves still point into zone 1.
        assert_eq!(zone_list(&v3, &cx, 2)?, vec![1]);
        assert!(loader.loads() > before);
        Ok(())
    }

    #[test]
    fn rebase_keeps_mutations_made_after_snapshot() -> Result<()> {
        let cx = TreeContext::new(1, Arc::new(ArityPolicy::new(4)));
        let mut t = BTree::empty(1);
        for i in 0..20 {
            t = t.updated(&cx, &key(i), bytes(b"a"), 1)?;
        }
        let snapshot = TreeRoot::BTree(t.balanced(&cx, 1)?);
        let mut w = ChunkWriter::new(0, 131072, PageCodec::None, 0);
        let (stored, written) = snapshot.write_dirty(1, &mut w)?;
        assert!(!stored.is_dirty());
        assert!(w.page_count() > 1);

        // Mutation on top of the snapshot, made while the chunk was in flight.
        let live = match &snapshot {
            TreeRoot::BTree(t) => TreeRoot::BTree(t.updated(&cx, &key(100), bytes(b"b"), 2)?),
            _ => unreachable!(),
        };
        let rebased = live.rebase(&written);
        assert!(rebased.is_dirty());
        assert_eq!(rebased.version(), 2);
        assert_eq!(rebased.span(), 21);
        match &rebased {
            TreeRoot::BTree(t) => {
                let root = t.root().resident_page().cloned().unwrap();
                let dirty = root.child_refs().iter().filter(|c| c.is_dirty()).count();
                assert_eq!(dirty, 1);
            }
            _ => unreachable!(),
        }

        // Untouched root maps straight to its stored ref.
        let again = snapshot.rebase(&written);
        assert!(!again.is_dirty());
        assert!(again.tree_size() > 0);
        Ok(())
    }

    #[test]
    fn kind_codes_roundtrip() -> Result<()> {
        for k in [TreeKind::BTree, TreeKind::QTree, TreeKind::STree, TreeKind::UTree] {
            assert_eq!(TreeKind::from_code(k.code())?, k);
        }
        assert!(TreeKind::from_code(9).is_err());
        Ok(())
    }
}
