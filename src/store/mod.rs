//! store — lifecycle of an on-disk CanopyDB store.
//!
//! Submodules:
//! - zone.rs    — append-only zone files (germ slots + aligned chunks)
//! - germ.rs    — duplicated commit header and its recovery
//! - chunk.rs   — chunk header and the per-commit block writer
//! - cache.rs   — LRU cache of decoded pages keyed by (zone, offset)
//! - context.rs — zone set, cache, metrics; the trees' page loader
//! - stage.rs   — single worker thread and `Pending` results
//!
//! Lifecycle: Closed -> Opening -> Open -> Closing -> Closed. `delete()` is
//! only valid once Closed.

pub mod chunk;
pub mod germ;
pub mod stage;
pub mod zone;

pub(crate) mod cache;
pub(crate) mod context;

pub use chunk::Chunk;
pub use germ::Germ;
pub use stage::Pending;
pub use zone::Zone;

use anyhow::{anyhow, Context, Result};
use log::{info, warn};
use serde::Serialize;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::config::{StoreBuilder, StoreConfig};
use crate::consts::{LOCK_FILE, ZONE_EXT};
use crate::db::{Commit, Compact, CompactReport, Database, NoopDelegate, StoreDelegate, TreeInfo};
use crate::error::TreeError;
use crate::lock::{try_acquire_exclusive_lock, LockGuard};
use crate::metrics::MetricsSnapshot;
use context::StoreContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreState {
    Closed,
    Opening,
    Open,
    Closing,
}

impl fmt::Display for StoreState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StoreState::Closed => "closed",
            StoreState::Opening => "opening",
            StoreState::Open => "open",
            StoreState::Closing => "closing",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ZoneStatus {
    pub id: u32,
    pub size: u64,
    pub active: bool,
}

/// Point-in-time view of an open store.
#[derive(Debug, Clone, Serialize)]
pub struct StoreStatus {
    pub dir: PathBuf,
    pub state: StoreState,
    pub store_id: String,
    pub version: u64,
    pub zones: Vec<ZoneStatus>,
    pub trees: Vec<TreeInfo>,
    pub tree_size: u64,
    pub diff_size: u64,
    pub zone_bytes: u64,
    pub fill: f64,
    pub cached_pages: usize,
    pub metrics: MetricsSnapshot,
    pub config: StoreConfig,
}

struct Live {
    ctx: Arc<StoreContext>,
    db: Database,
    _lock: LockGuard,
}

struct StoreInner {
    dir: PathBuf,
    config: StoreConfig,
    delegate: Arc<dyn StoreDelegate>,
    state: Mutex<StoreState>,
    live: Mutex<Option<Live>>,
}

/// Handle to a store directory. Cheap to clone.
#[derive(Clone)]
pub struct Store {
    inner: Arc<StoreInner>,
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store")
            .field("dir", &self.inner.dir)
            .field("state", &self.state())
            .finish()
    }
}

impl Store {
    /// Closed store over `dir`; nothing touches the disk until `open()`.
    pub fn new<P: AsRef<Path>>(dir: P, config: StoreConfig) -> Store {
        Self::with_delegate(dir, config, Arc::new(NoopDelegate))
    }

    pub fn with_delegate<P: AsRef<Path>>(dir: P, config: StoreConfig, delegate: Arc<dyn StoreDelegate>) -> Store {
        Store {
            inner: Arc::new(StoreInner {
                dir: dir.as_ref().to_path_buf(),
                config,
                delegate,
                state: Mutex::new(StoreState::Closed),
                live: Mutex::new(None),
            }),
        }
    }

    /// Config builder (starts from CANOPY_* env).
    pub fn builder() -> StoreBuilder {
        StoreBuilder::new()
    }

    /// `new` + `open`.
    pub fn open_at<P: AsRef<Path>>(dir: P, config: StoreConfig) -> Result<(Store, Database)> {
        let store = Self::new(dir, config);
        let db = store.open()?;
        Ok((store, db))
    }

    pub fn dir(&self) -> &Path {
        &self.inner.dir
    }

    pub fn config(&self) -> &StoreConfig {
        &self.inner.config
    }

    pub fn state(&self) -> StoreState {
        self.inner
            .state
            .lock()
            .map(|s| *s)
            .unwrap_or(StoreState::Closed)
    }

    fn state_guard(&self) -> Result<MutexGuard<'_, StoreState>> {
        self.inner.state.lock().map_err(|_| anyhow!("store state poisoned"))
    }

    fn transition(&self, from: StoreState, to: StoreState) -> Result<()> {
        let mut st = self.state_guard()?;
        if *st != from {
            return Err(TreeError::State(format!("store is {}, expected {}", *st, from)).into());
        }
        *st = to;
        Ok(())
    }

    fn set_state(&self, to: StoreState) {
        if let Ok(mut st) = self.inner.state.lock() {
            *st = to;
        }
    }

    /// Lock the directory, recover the newest germ and restore the trees.
    pub fn open(&self) -> Result<Database> {
        self.transition(StoreState::Closed, StoreState::Opening)?;
        match self.open_live() {
            Ok(live) => {
                let db = live.db.clone();
                match self.inner.live.lock() {
                    Ok(mut slot) => *slot = Some(live),
                    Err(_) => {
                        self.set_state(StoreState::Closed);
                        return Err(anyhow!("store handle poisoned"));
                    }
                }
                self.set_state(StoreState::Open);
                Ok(db)
            }
            Err(e) => {
                self.set_state(StoreState::Closed);
                Err(e)
            }
        }
    }

    fn open_live(&self) -> Result<Live> {
        let dir = &self.inner.dir;
        fs::create_dir_all(dir).with_context(|| format!("create store dir {}", dir.display()))?;
        let lock = try_acquire_exclusive_lock(dir)?;
        let ctx = StoreContext::open(dir, self.inner.config.clone())?;
        let db = Database::open(ctx.clone(), self.inner.delegate.clone())?;
        Ok(Live { ctx, db, _lock: lock })
    }

    /// Final best-effort commit, stop the stage, release the lock.
    pub fn close(&self) -> Result<()> {
        self.transition(StoreState::Open, StoreState::Closing)?;
        let live = self
            .inner
            .live
            .lock()
            .map_err(|_| anyhow!("store handle poisoned"))?
            .take();
        let result = match live {
            Some(live) => {
                let r = match live.db.commit_async(Commit::best_effort()).wait_timeout(self.inner.config.commit_timeout()) {
                    Some(r) => r.map(|_| ()),
                    None => Err(TreeError::State(format!(
                        "final commit did not finish within {} ms",
                        self.inner.config.commit_timeout_ms
                    ))
                    .into()),
                };
                live.db.shutdown();
                if let Err(e) = &r {
                    warn!("closing {}: {:#}", self.inner.dir.display(), e);
                }
                r
            }
            None => Ok(()),
        };
        self.set_state(StoreState::Closed);
        info!("closed store {}", self.inner.dir.display());
        result
    }

    /// Remove the store's files. Only valid while Closed; waits out the
    /// configured delete delay first.
    pub fn delete(&self) -> Result<()> {
        if self.state() != StoreState::Closed {
            return Err(TreeError::State(format!("cannot delete a store that is {}", self.state())).into());
        }
        let delay = self.inner.config.delete_delay();
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        let dir = &self.inner.dir;
        if !dir.exists() {
            return Ok(());
        }
        for id in zone::list_zone_ids(dir)? {
            let p = dir.join(zone::zone_file_name(id));
            fs::remove_file(&p).with_context(|| format!("remove {}", p.display()))?;
        }
        for e in fs::read_dir(dir)? {
            let p = e?.path();
            let is_tmp = p
                .file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.ends_with(&format!(".{}.tmp", ZONE_EXT)))
                .unwrap_or(false);
            if is_tmp {
                fs::remove_file(&p).with_context(|| format!("remove {}", p.display()))?;
            }
        }
        let lock = dir.join(LOCK_FILE);
        if lock.exists() {
            fs::remove_file(&lock).with_context(|| format!("remove {}", lock.display()))?;
        }
        if let Err(e) = fs::remove_dir(dir) {
            warn!("store dir {} left in place: {}", dir.display(), e);
        }
        info!("deleted store {}", dir.display());
        Ok(())
    }

    fn with_live<T>(&self, f: impl FnOnce(&Live) -> Result<T>) -> Result<T> {
        let live = self.inner.live.lock().map_err(|_| anyhow!("store handle poisoned"))?;
        match live.as_ref() {
            Some(l) => f(l),
            None => Err(TreeError::State(format!("store is {}", self.state())).into()),
        }
    }

    pub fn database(&self) -> Result<Database> {
        self.with_live(|l| Ok(l.db.clone()))
    }

    /// Active zone.
    pub fn zone(&self) -> Result<Arc<Zone>> {
        self.with_live(|l| l.ctx.active_zone())
    }

    pub fn zone_by_id(&self, id: u32) -> Result<Option<Arc<Zone>>> {
        self.with_live(|l| l.ctx.zone_by_id(id))
    }

    pub fn zones(&self) -> Result<Vec<Arc<Zone>>> {
        self.with_live(|l| l.ctx.zones())
    }

    /// Retired zones still readable until the delete delay passes.
    pub fn retiring_zones(&self) -> Result<Vec<u32>> {
        self.with_live(|l| Ok(l.ctx.retiring_zones()))
    }

    /// Register an existing zone file of this directory.
    pub fn open_zone(&self, id: u32) -> Result<Arc<Zone>> {
        self.with_live(|l| l.ctx.open_zone(id))
    }

    pub fn shift_zone(&self) -> Result<Arc<Zone>> {
        self.database()?.shift_zone()
    }

    /// Last durable germ.
    pub fn germ(&self) -> Result<Germ> {
        self.with_live(|l| l.ctx.germ())
    }

    /// Commit on the stage and wait up to the commit timeout.
    pub fn commit(&self, commit: Commit) -> Result<Option<Chunk>> {
        let timeout = self.inner.config.commit_timeout();
        match self.commit_async(commit).wait_timeout(timeout) {
            Some(r) => r,
            None => Err(TreeError::State(format!(
                "commit did not finish within {} ms",
                self.inner.config.commit_timeout_ms
            ))
            .into()),
        }
    }

    pub fn commit_async(&self, commit: Commit) -> Pending<Option<Chunk>> {
        match self.database() {
            Ok(db) => db.commit_async(commit),
            Err(e) => Pending::ready(Err(e)),
        }
    }

    pub fn compact(&self, compact: Compact) -> Result<CompactReport> {
        self.compact_async(compact).wait()
    }

    pub fn compact_async(&self, compact: Compact) -> Pending<CompactReport> {
        match self.database() {
            Ok(db) => db.compact_async(compact),
            Err(e) => Pending::ready(Err(e)),
        }
    }

    /// Page cache hits / lookups (0 when closed or unused).
    pub fn hit_ratio(&self) -> f64 {
        self.with_live(|l| Ok(l.ctx.hit_ratio())).unwrap_or(0.0)
    }

    pub fn metrics(&self) -> Result<MetricsSnapshot> {
        self.with_live(|l| Ok(l.ctx.metrics().snapshot()))
    }

    /// Drop every cached page (the next reads go to the zone files).
    pub fn clear_cache(&self) -> Result<()> {
        self.with_live(|l| {
            l.ctx.clear_cache();
            Ok(())
        })
    }

    pub fn status(&self) -> Result<StoreStatus> {
        let (ctx, db) = self.with_live(|l| Ok((l.ctx.clone(), l.db.clone())))?;
        let active = ctx.active_zone()?.id();
        let zones = ctx
            .zones()?
            .iter()
            .map(|z| ZoneStatus {
                id: z.id(),
                size: z.size(),
                active: z.id() == active,
            })
            .collect();
        Ok(StoreStatus {
            dir: ctx.dir().to_path_buf(),
            state: self.state(),
            store_id: format!("{:016x}", db.store_id()),
            version: db.version(),
            zones,
            trees: db.trees()?,
            tree_size: db.tree_size()?,
            diff_size: db.diff_size()?,
            zone_bytes: ctx.zone_bytes()?,
            fill: db.fill()?,
            cached_pages: ctx.cached_pages(),
            metrics: ctx.metrics().snapshot(),
            config: self.inner.config.clone(),
        })
    }
}

impl Drop for StoreInner {
    fn drop(&mut self) {
        let live = match self.live.get_mut() {
            Ok(l) => l.take(),
            Err(_) => None,
        };
        if let Some(live) = live {
            if let Err(e) = live.db.commit(Commit::best_effort()) {
                warn!("final commit of {} failed: {:#}", self.dir.display(), e);
            }
            live.db.shutdown();
        }
    }
}
