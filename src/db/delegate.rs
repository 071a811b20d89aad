//! db/delegate — hooks the hosting runtime can plug into the database.
//!
//! All methods default to no-ops. None of them runs under the commit lock, so
//! a delegate may call back into the database (e.g. submit a commit from
//! `tree_did_change` once `diff_size` grows large). Commit, shift and
//! compaction notices are queued while the lock is held and delivered, in
//! order, once it is released.

use serde::Serialize;

use crate::db::{Commit, CompactReport};
use crate::store::chunk::Chunk;
use crate::tree::TreeRoot;

/// What a commit is about to work on, handed to `database_will_commit`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CommitInfo {
    /// Version the commit will be stamped with.
    pub version: u64,
    pub diff_size: u64,
    pub zone: u32,
    pub zone_size: u64,
}

pub trait StoreDelegate: Send + Sync {
    /// A tree handle replaced its root.
    fn tree_did_change(&self, _tree: &str, _new_root: &TreeRoot, _old_root: &TreeRoot) {}

    /// Inspect (and possibly upgrade) a commit before it takes the commit
    /// lock. `info` is advisory: another commit may land in between.
    fn database_will_commit(&self, commit: Commit, _info: &CommitInfo) -> Commit {
        commit
    }

    fn database_did_commit(&self, _chunk: &Chunk) {}

    fn database_did_compact(&self, _report: &CompactReport) {}

    fn database_did_shift_zone(&self, _zone: u32) {}
}

/// Delegate callback held back until the commit lock is released.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Notice {
    Committed(Chunk),
    Shifted(u32),
}

/// Delegate that does nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopDelegate;

impl StoreDelegate for NoopDelegate {}
