//! db/compact — rewrite old pages and retire zones nobody references.
//!
//! 1) skip unless forced or fill (live tree bytes / zone chunk bytes) is
//!    below `min_tree_fill`;
//! 2) optionally shift to a fresh zone;
//! 3) copy every persisted page older than the floor (clamped to the next
//!    version) into dirty pages and commit them through the normal path;
//! 4) retire every non-active zone no live page points into.
//!
//! Page refs carry the oldest version and lowest zone of their subtree, so
//! both walks skip subtrees that cannot contain anything to rewrite or keep.
//!
//! Running it twice with the same floor finds nothing to rewrite the second
//! time.

use anyhow::Result;
use log::info;
use std::collections::BTreeSet;
use std::sync::Arc;

use crate::codec::LexicographicOrder;
use crate::db::core::{Commit, Compact, CompactReport, Database};
use crate::store::stage::Pending;

impl Database {
    pub fn compact(&self, compact: Compact) -> Result<CompactReport> {
        self.ensure_open()?;
        let report = {
            let _guard = self.commit_guard()?;
            self.compact_locked(compact)
        };
        self.deliver_notices();
        let report = report?;
        self.inner.delegate.database_did_compact(&report);
        Ok(report)
    }

    pub fn compact_async(&self, compact: Compact) -> Pending<CompactReport> {
        let db = self.clone();
        self.inner.stage.submit(move || db.compact(compact))
    }

    fn compact_locked(&self, compact: Compact) -> Result<CompactReport> {
        let store = &self.inner.store;
        let fill = self.fill()?;
        let floor = compact.version_floor.min(self.pending_version());

        if !compact.forced && fill >= compact.min_tree_fill {
            store.metrics().record_compaction_skipped();
            return Ok(CompactReport {
                skipped: true,
                fill,
                version_floor: floor,
                pages_rewritten: 0,
                chunk: None,
                zones_retired: Vec::new(),
            });
        }

        if compact.shifted {
            self.shift_locked()?;
        }

        // Rewrite below the floor.
        let version = self.pending_version();
        let mut rewritten = 0;
        for cell in self.cells()? {
            let mut st = cell.lock()?;
            let cx = self.context_for(cell.stem, st.order.clone());
            let (root, n) = st.root.rewrite_below(&cx, floor, version)?;
            if n > 0 {
                st.root = root;
                rewritten += n;
            }
        }

        let chunk = if rewritten > 0 {
            self.commit_locked(Commit::best_effort())?
        } else {
            None
        };

        let zones_retired = self.retire_unreferenced()?;
        store.metrics().record_compaction(rewritten as u64);
        info!(
            "compaction: fill {:.3}, floor v{}, {} page(s) rewritten, {} zone(s) retired",
            fill,
            floor,
            rewritten,
            zones_retired.len()
        );
        Ok(CompactReport {
            skipped: false,
            fill,
            version_floor: floor,
            pages_rewritten: rewritten,
            chunk,
            zones_retired,
        })
    }

    /// Retire every zone except the active one that neither a current root
    /// nor the durable germ reaches.
    fn retire_unreferenced(&self) -> Result<Vec<u32>> {
        let store = &self.inner.store;
        let active = store.active_zone()?.id();
        let mut referenced = BTreeSet::new();
        for cell in self.cells()? {
            let (root, cx) = cell.read(self)?;
            root.collect_zones(&cx, active, &mut referenced)?;
        }
        for seed in store.germ()?.seeds {
            let cx = self.context_for(seed.stem, Arc::new(LexicographicOrder));
            seed.root.collect_zones(&cx, active, &mut referenced)?;
        }
        let mut retired = Vec::new();
        for zone in store.zones()? {
            let id = zone.id();
            if id != active && !referenced.contains(&id) {
                store.retire_zone(id)?;
                retired.push(id);
            }
        }
        Ok(retired)
    }
}
