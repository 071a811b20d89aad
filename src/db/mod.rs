//! db — registry of named trees over one store.
//!
//! Submodules:
//! - core.rs     — Database, tree cells, Commit/Compact descriptors
//! - handles.rs  — typed handles (ordered map, spatial map, list, value)
//! - commit.rs   — commit pipeline (sync and on the stage) and zone shifts
//! - compact.rs  — compaction and zone retirement
//! - delegate.rs — hooks for the hosting runtime

pub mod commit;
pub mod compact;
pub mod core;
pub mod delegate;
pub mod handles;

pub use self::core::{Commit, Compact, CompactReport, Database, TreeInfo};
pub use delegate::{CommitInfo, NoopDelegate, StoreDelegate};
pub use handles::{BTreeMapHandle, QTreeMapHandle, STreeListHandle, UTreeValueHandle};
