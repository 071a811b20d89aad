//! db/core — the Database: named trees of four kinds sharing one version
//! counter.
//!
//! Every tree lives in a `TreeCell` holding its current root under a short
//! mutex. Handles mutate through the cell; readers clone the root and read
//! without holding any lock. The version counter is the last committed
//! version; mutations are stamped with the pending version (counter + 1).

use anyhow::{anyhow, Result};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::codec::{KeyOrder, LexicographicOrder};
use crate::consts::{AUTO_BALANCE_INTERVAL, GERM_SIZE, MAX_TREE_NAME};
use crate::db::delegate::{Notice, StoreDelegate};
use crate::db::handles::{BTreeMapHandle, QTreeMapHandle, STreeListHandle, UTreeValueHandle};
use crate::error::TreeError;
use crate::metrics::MetricsSnapshot;
use crate::page::{PageLoader, TreeContext};
use crate::policy::PagePolicy;
use crate::qtree::Projection;
use crate::store::chunk::Chunk;
use crate::store::context::StoreContext;
use crate::store::germ::GERM_OVERHEAD;
use crate::store::stage::Stage;
use crate::tree::{TreeKind, TreeRoot, TreeSeed};

// ---------------- descriptors ----------------

/// Commit request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Commit {
    /// Write a chunk and refresh the germ even when nothing is dirty.
    pub forced: bool,
    /// Start a new zone before writing.
    pub shifted: bool,
}

impl Commit {
    pub fn best_effort() -> Self {
        Self::default()
    }

    pub fn forced() -> Self {
        Self {
            forced: true,
            shifted: false,
        }
    }

    pub fn with_shift(mut self) -> Self {
        self.shifted = true;
        self
    }
}

/// Compaction request.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Compact {
    /// Skip (unless forced) when live bytes / zone bytes is at least this.
    pub min_tree_fill: f64,
    /// Persisted pages older than this version are rewritten.
    pub version_floor: u64,
    pub forced: bool,
    /// Start a new zone before rewriting, so older zones can be retired.
    pub shifted: bool,
}

impl Compact {
    pub fn new(min_tree_fill: f64, version_floor: u64) -> Self {
        Self {
            min_tree_fill,
            version_floor,
            forced: false,
            shifted: false,
        }
    }

    /// Rewrite everything below `version_floor` regardless of fill.
    pub fn forced(version_floor: u64) -> Self {
        Self {
            forced: true,
            ..Self::new(1.0, version_floor)
        }
    }

    pub fn with_shift(mut self) -> Self {
        self.shifted = true;
        self
    }
}

/// Outcome of a compaction.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompactReport {
    /// Fill was above the threshold and the compaction was not forced.
    pub skipped: bool,
    /// Live tree bytes / zone chunk bytes before compaction.
    pub fill: f64,
    /// Floor actually used (clamped to the next version).
    pub version_floor: u64,
    pub pages_rewritten: usize,
    pub chunk: Option<Chunk>,
    pub zones_retired: Vec<u32>,
}

/// Summary of one tree, for status output.
#[derive(Debug, Clone, Serialize)]
pub struct TreeInfo {
    pub name: String,
    pub stem: u32,
    pub kind: TreeKind,
    pub len: u64,
    pub version: u64,
    pub tree_size: u64,
    pub diff_size: u64,
}

// ---------------- tree cells ----------------

pub(crate) struct CellState {
    pub(crate) root: TreeRoot,
    pub(crate) order: Arc<dyn KeyOrder>,
    /// Mutations since the last balance.
    pub(crate) mutations: usize,
}

pub(crate) struct TreeCell {
    pub(crate) name: String,
    pub(crate) stem: u32,
    pub(crate) kind: TreeKind,
    state: Mutex<CellState>,
}

impl TreeCell {
    fn new(name: String, stem: u32, root: TreeRoot) -> Self {
        Self {
            name,
            stem,
            kind: root.kind(),
            state: Mutex::new(CellState {
                root,
                order: Arc::new(LexicographicOrder),
                mutations: 0,
            }),
        }
    }

    pub(crate) fn lock(&self) -> Result<MutexGuard<'_, CellState>> {
        self.state
            .lock()
            .map_err(|_| anyhow!("tree {} state poisoned", self.name))
    }

    /// Current root and a context to read it with.
    pub(crate) fn read(&self, db: &Database) -> Result<(TreeRoot, TreeContext)> {
        let st = self.lock()?;
        Ok((st.root.clone(), db.context_for(self.stem, st.order.clone())))
    }

    /// Replace the root with `f(root)`. Returns false when `f` returned the
    /// same root. Every AUTO_BALANCE_INTERVAL changes the pending version's
    /// pages are balanced in place.
    pub(crate) fn mutate<F>(&self, db: &Database, f: F) -> Result<bool>
    where
        F: FnOnce(&TreeRoot, &TreeContext, u64) -> Result<TreeRoot>,
    {
        let (old, new) = {
            let mut st = self.lock()?;
            let cx = db.context_for(self.stem, st.order.clone());
            let version = db.pending_version();
            let old = st.root.clone();
            let mut new = f(&old, &cx, version)?;
            if new.same_root(&old) {
                return Ok(false);
            }
            st.mutations += 1;
            if st.mutations >= AUTO_BALANCE_INTERVAL {
                new = new.balanced(&cx, version)?;
                st.mutations = 0;
            }
            st.root = new.clone();
            (old, new)
        };
        db.inner.delegate.tree_did_change(&self.name, &new, &old);
        Ok(true)
    }
}

// ---------------- database ----------------

pub(crate) struct Registry {
    pub(crate) trees: BTreeMap<String, Arc<TreeCell>>,
    pub(crate) next_stem: u32,
}

pub(crate) struct DatabaseInner {
    pub(crate) store: Arc<StoreContext>,
    pub(crate) delegate: Arc<dyn StoreDelegate>,
    pub(crate) policy: Arc<dyn PagePolicy>,
    pub(crate) store_id: u64,
    pub(crate) created_ms: u64,
    /// Last committed version.
    pub(crate) version: AtomicU64,
    pub(crate) registry: Mutex<Registry>,
    /// Serializes commits, compactions and zone shifts.
    pub(crate) commit_lock: Mutex<()>,
    /// Delegate notices waiting for the commit lock to be released.
    pub(crate) notices: Mutex<Vec<Notice>>,
    pub(crate) stage: Stage,
    pub(crate) open: AtomicBool,
}

/// Handle to the trees of an open store. Cheap to clone.
#[derive(Clone)]
pub struct Database {
    pub(crate) inner: Arc<DatabaseInner>,
}

impl fmt::Debug for Database {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Database")
            .field("store_id", &format_args!("{:016x}", self.inner.store_id))
            .field("version", &self.version())
            .field("trees", &self.tree_names())
            .finish()
    }
}

impl Database {
    /// Restore the trees named by the store's durable germ.
    pub(crate) fn open(store: Arc<StoreContext>, delegate: Arc<dyn StoreDelegate>) -> Result<Database> {
        let germ = store.germ()?;
        let policy: Arc<dyn PagePolicy> = Arc::new(store.config().policy());
        let mut trees = BTreeMap::new();
        let mut next_stem = germ.next_stem;
        for seed in germ.seeds {
            next_stem = next_stem.max(seed.stem + 1);
            let cell = TreeCell::new(seed.name.clone(), seed.stem, seed.root);
            trees.insert(seed.name, Arc::new(cell));
        }
        let stage = Stage::start(&format!("canopy-stage-{:08x}", germ.store_id as u32))?;
        Ok(Database {
            inner: Arc::new(DatabaseInner {
                store,
                delegate,
                policy,
                store_id: germ.store_id,
                created_ms: germ.created_ms,
                version: AtomicU64::new(germ.version),
                registry: Mutex::new(Registry { trees, next_stem }),
                commit_lock: Mutex::new(()),
                notices: Mutex::new(Vec::new()),
                stage,
                open: AtomicBool::new(true),
            }),
        })
    }

    /// Last committed version.
    #[inline]
    pub fn version(&self) -> u64 {
        self.inner.version.load(Ordering::Acquire)
    }

    /// Version mutations are currently stamped with.
    #[inline]
    pub fn pending_version(&self) -> u64 {
        self.version() + 1
    }

    pub fn store_id(&self) -> u64 {
        self.inner.store_id
    }

    pub(crate) fn context_for(&self, stem: u32, order: Arc<dyn KeyOrder>) -> TreeContext {
        let loader: Arc<dyn PageLoader> = self.inner.store.clone();
        TreeContext::new(stem, self.inner.policy.clone())
            .with_order(order)
            .with_loader(loader)
    }

    pub(crate) fn registry(&self) -> Result<MutexGuard<'_, Registry>> {
        self.inner
            .registry
            .lock()
            .map_err(|_| anyhow!("tree registry poisoned"))
    }

    /// All tree cells, in name order.
    pub(crate) fn cells(&self) -> Result<Vec<Arc<TreeCell>>> {
        Ok(self.registry()?.trees.values().cloned().collect())
    }

    pub(crate) fn ensure_open(&self) -> Result<()> {
        if !self.inner.open.load(Ordering::Acquire) {
            return Err(TreeError::State("database is closed".into()).into());
        }
        Ok(())
    }

    /// Stop the stage; later commits fail with a state error.
    pub(crate) fn shutdown(&self) {
        self.inner.open.store(false, Ordering::Release);
        self.inner.stage.shutdown();
    }

    fn open_tree(&self, name: &str, kind: TreeKind, order: Option<Arc<dyn KeyOrder>>) -> Result<Arc<TreeCell>> {
        if name.is_empty() || name.len() > MAX_TREE_NAME {
            return Err(anyhow!("tree name must be 1..={} bytes, got {}", MAX_TREE_NAME, name.len()));
        }
        let cell = {
            let mut reg = self.registry()?;
            match reg.trees.get(name) {
                Some(cell) => {
                    if cell.kind != kind {
                        return Err(TreeError::State(format!(
                            "tree {} is a {}, not a {}",
                            name, cell.kind, kind
                        ))
                        .into());
                    }
                    cell.clone()
                }
                None => {
                    let needed = GERM_OVERHEAD
                        + reg
                            .trees
                            .values()
                            .map(|c| TreeSeed::encoded_len(&c.name, c.kind))
                            .sum::<usize>()
                        + TreeSeed::encoded_len(name, kind);
                    if needed > GERM_SIZE as usize {
                        return Err(TreeError::GermFull {
                            needed,
                            trees: reg.trees.len() + 1,
                            limit: GERM_SIZE as usize,
                        }
                        .into());
                    }
                    let stem = reg.next_stem;
                    reg.next_stem += 1;
                    let root = TreeRoot::empty(kind, self.pending_version());
                    let cell = Arc::new(TreeCell::new(name.to_string(), stem, root));
                    reg.trees.insert(name.to_string(), cell.clone());
                    log::debug!("created {} tree {} (stem {})", kind, name, stem);
                    cell
                }
            }
        };
        if let Some(order) = order {
            cell.lock()?.order = order;
        }
        Ok(cell)
    }

    /// Ordered map with byte-wise key order.
    pub fn open_btree_map(&self, name: &str) -> Result<BTreeMapHandle> {
        Ok(BTreeMapHandle::new(self.clone(), self.open_tree(name, TreeKind::BTree, None)?))
    }

    /// Ordered map with a caller-supplied key order. The order is not
    /// persisted; reopen the map with the same order.
    pub fn open_btree_map_with_order(&self, name: &str, order: Arc<dyn KeyOrder>) -> Result<BTreeMapHandle> {
        Ok(BTreeMapHandle::new(
            self.clone(),
            self.open_tree(name, TreeKind::BTree, Some(order))?,
        ))
    }

    pub fn open_qtree_map(&self, name: &str, projection: Arc<dyn Projection>) -> Result<QTreeMapHandle> {
        Ok(QTreeMapHandle::new(
            self.clone(),
            self.open_tree(name, TreeKind::QTree, None)?,
            projection,
        ))
    }

    pub fn open_stree_list(&self, name: &str) -> Result<STreeListHandle> {
        Ok(STreeListHandle::new(self.clone(), self.open_tree(name, TreeKind::STree, None)?))
    }

    pub fn open_utree_value(&self, name: &str) -> Result<UTreeValueHandle> {
        Ok(UTreeValueHandle::new(self.clone(), self.open_tree(name, TreeKind::UTree, None)?))
    }

    pub fn tree_names(&self) -> Vec<String> {
        match self.registry() {
            Ok(reg) => reg.trees.keys().cloned().collect(),
            Err(_) => Vec::new(),
        }
    }

    pub fn tree_kind(&self, name: &str) -> Option<TreeKind> {
        self.registry().ok()?.trees.get(name).map(|c| c.kind)
    }

    pub fn trees(&self) -> Result<Vec<TreeInfo>> {
        let mut out = Vec::new();
        for cell in self.cells()? {
            let st = cell.lock()?;
            out.push(TreeInfo {
                name: cell.name.clone(),
                stem: cell.stem,
                kind: cell.kind,
                len: st.root.span(),
                version: st.root.version(),
                tree_size: st.root.tree_size(),
                diff_size: st.root.diff_size(),
            });
        }
        Ok(out)
    }

    /// Estimated bytes of uncommitted pages across all trees.
    pub fn diff_size(&self) -> Result<u64> {
        let mut total = 0;
        for cell in self.cells()? {
            total += cell.lock()?.root.diff_size();
        }
        Ok(total)
    }

    /// Bytes of persisted pages reachable from the current roots.
    pub fn tree_size(&self) -> Result<u64> {
        let mut total = 0;
        for cell in self.cells()? {
            total += cell.lock()?.root.tree_size();
        }
        Ok(total)
    }

    /// Live tree bytes over zone chunk bytes (1.0 for an empty store).
    pub fn fill(&self) -> Result<f64> {
        let zone_bytes = self.inner.store.zone_bytes()?;
        if zone_bytes == 0 {
            return Ok(1.0);
        }
        Ok(self.tree_size()? as f64 / zone_bytes as f64)
    }

    pub fn hit_ratio(&self) -> f64 {
        self.inner.store.hit_ratio()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.store.metrics().snapshot()
    }

    /// Creation time of the store (ms since the epoch).
    pub fn created_ms(&self) -> u64 {
        self.inner.created_ms
    }
}
