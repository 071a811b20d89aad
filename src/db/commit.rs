//! db/commit — balance, serialize and durably append all dirty pages.
//!
//! Protocol (one commit at a time, under the commit lock):
//! 0) before the lock, the delegate may upgrade the request;
//! 1) shift zones when asked or when the active zone is over
//!    `zone_max_size`;
//! 2) lock every tree cell in name order, balance pages touched at the
//!    pending version, snapshot the roots, advance the version counter;
//! 3) write dirty pages children-first into one chunk with absolute
//!    addresses, append it to the active zone;
//! 4) write the germ to slot 0 then slot 1;
//! 5) rebase live roots onto the written pages and warm the page cache.
//!
//! A failure before step 5 leaves every root as it was (still dirty) and the
//! durable germ at the previous commit.

use anyhow::{anyhow, Result};
use log::{debug, warn};
use std::sync::{Arc, MutexGuard};

use crate::db::core::{Commit, Database, TreeCell};
use crate::db::delegate::{CommitInfo, Notice};
use crate::store::chunk::{Chunk, ChunkWriter};
use crate::store::germ::{now_ms, Germ};
use crate::store::stage::Pending;
use crate::store::zone::Zone;
use crate::tree::{TreeRoot, TreeSeed};

impl Database {
    /// Run a commit on the calling thread. Returns `None` when a best-effort
    /// commit found nothing to write.
    pub fn commit(&self, commit: Commit) -> Result<Option<Chunk>> {
        self.ensure_open()?;
        let commit = self.will_commit(commit)?;
        let r = {
            let _guard = self.commit_guard()?;
            self.commit_locked(commit)
        };
        self.deliver_notices();
        r
    }

    /// Queue a commit on the store's stage. Results arrive in submission
    /// order.
    pub fn commit_async(&self, commit: Commit) -> Pending<Option<Chunk>> {
        let db = self.clone();
        self.inner.stage.submit(move || db.commit(commit))
    }

    /// Start a new zone now. Later chunks go there.
    pub fn shift_zone(&self) -> Result<Arc<Zone>> {
        self.ensure_open()?;
        let r = {
            let _guard = self.commit_guard()?;
            self.shift_locked()
        };
        self.deliver_notices();
        r
    }

    fn will_commit(&self, commit: Commit) -> Result<Commit> {
        let active = self.inner.store.active_zone()?;
        let info = CommitInfo {
            version: self.pending_version(),
            diff_size: self.diff_size()?,
            zone: active.id(),
            zone_size: active.size(),
        };
        Ok(self.inner.delegate.database_will_commit(commit, &info))
    }

    fn notice(&self, n: Notice) {
        if let Ok(mut q) = self.inner.notices.lock() {
            q.push(n);
        }
    }

    /// Hand queued notices to the delegate. Call without the commit lock.
    pub(crate) fn deliver_notices(&self) {
        let queued = match self.inner.notices.lock() {
            Ok(mut q) => std::mem::take(&mut *q),
            Err(_) => return,
        };
        let delegate = &self.inner.delegate;
        for n in queued {
            match n {
                Notice::Committed(chunk) => delegate.database_did_commit(&chunk),
                Notice::Shifted(zone) => delegate.database_did_shift_zone(zone),
            }
        }
    }

    pub(crate) fn commit_guard(&self) -> Result<MutexGuard<'_, ()>> {
        self.inner
            .commit_lock
            .lock()
            .map_err(|_| anyhow!("commit lock poisoned"))
    }

    pub(crate) fn shift_locked(&self) -> Result<Arc<Zone>> {
        let zone = self.inner.store.shift_zone()?;
        self.notice(Notice::Shifted(zone.id()));
        Ok(zone)
    }

    pub(crate) fn commit_locked(&self, commit: Commit) -> Result<Option<Chunk>> {
        match self.run_commit(commit) {
            Ok(chunk) => Ok(chunk),
            Err(e) => {
                self.inner.store.metrics().record_commit_failure();
                warn!("commit failed: {:#}", e);
                Err(e)
            }
        }
    }

    fn run_commit(&self, commit: Commit) -> Result<Option<Chunk>> {
        let store = &self.inner.store;
        let cfg = store.config();

        // 1) zone shift
        let active = store.active_zone()?;
        if commit.shifted || active.size() > cfg.zone_max_size {
            self.shift_locked()?;
        }

        // 2) balance + snapshot
        let cells = self.cells()?;
        let version = self.pending_version();
        let snapshot = {
            let mut guards = Vec::with_capacity(cells.len());
            for cell in &cells {
                guards.push(cell.lock()?);
            }
            for (cell, st) in cells.iter().zip(guards.iter_mut()) {
                let cx = self.context_for(cell.stem, st.order.clone());
                st.root = st.root.balanced(&cx, version)?;
                st.mutations = 0;
            }
            if !commit.forced && !guards.iter().any(|st| st.root.is_dirty()) {
                return Ok(None);
            }
            let snapshot: Vec<TreeRoot> = guards.iter().map(|st| st.root.clone()).collect();
            self.inner
                .version
                .store(version, std::sync::atomic::Ordering::Release);
            snapshot
        };

        // 3) serialize + append
        let zone = store.active_zone()?;
        let offset = zone.next_chunk_offset();
        let mut writer = ChunkWriter::new(zone.id(), offset, cfg.page_codec, cfg.zstd_level);
        let mut seeds = Vec::with_capacity(cells.len());
        let mut written = Vec::with_capacity(cells.len());
        for (cell, root) in cells.iter().zip(snapshot.iter()) {
            let (stored, w) = root.write_dirty(cell.stem, &mut writer)?;
            seeds.push(TreeSeed {
                name: cell.name.clone(),
                stem: cell.stem,
                root: stored,
            });
            written.push(w);
        }
        let page_count = writer.page_count();
        let (bytes, pages) = writer.finish(version);

        let prev = store.germ()?;
        let germ = Germ {
            store_id: prev.store_id,
            version,
            created_ms: prev.created_ms,
            updated_ms: now_ms(),
            next_stem: self.registry()?.next_stem,
            seeds,
        };
        // Encoding checks the seed size limit before anything hits the disk.
        germ.encode()?;
        zone.write_chunk(offset, &bytes, cfg.data_fsync)?;

        // 4) germ, twice
        store.publish_germ(&zone, germ)?;

        // 5) rebase + warm
        store.warm(pages);
        rebase_cells(&cells, &written)?;
        drop(snapshot);

        let chunk = Chunk {
            version,
            zone: zone.id(),
            offset,
            size: bytes.len() as u64,
            page_count: page_count as u32,
        };
        store.metrics().record_commit(page_count as u64, chunk.size);
        debug!(
            "commit v{}: {} page(s), {} bytes at zone {} offset {}",
            version, page_count, chunk.size, chunk.zone, chunk.offset
        );
        self.notice(Notice::Committed(chunk));
        Ok(Some(chunk))
    }
}

fn rebase_cells(cells: &[Arc<TreeCell>], written: &[crate::tree::Written]) -> Result<()> {
    for (cell, w) in cells.iter().zip(written.iter()) {
        let mut st = cell.lock()?;
        st.root = st.root.rebase(w);
    }
    Ok(())
}
