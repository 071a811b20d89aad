#![allow(non_snake_case)]

// Format + shared plumbing
pub mod consts;
pub mod error;
pub mod codec;
pub mod policy;
pub mod config;
pub mod metrics;
pub mod lock;

// Pages and the four tree kinds
pub mod page;   // src/page/{mod,block,seq}.rs
pub mod btree;  // src/btree/{mod,page}.rs
pub mod qtree;  // src/qtree/{mod,tile,page,split,cursor,projection}.rs
pub mod stree;  // src/stree/{mod,page}.rs
pub mod utree;
pub mod tree;

// Durable side: zones, germs, chunks, stage, lifecycle
pub mod store;  // src/store/{mod,zone,germ,chunk,cache,context,stage}.rs

// Named trees over a store: handles, commit, compaction
pub mod db;     // src/db/{mod,core,handles,commit,compact,delegate}.rs

// Convenience re-exports
pub use codec::{bytes, Bytes, Codec, I64Codec, I64Order, KeyOrder, LexicographicOrder, RawCodec, Utf8Codec};
pub use config::{StoreBuilder, StoreConfig};
pub use db::{
    BTreeMapHandle, Commit, CommitInfo, Compact, CompactReport, Database, NoopDelegate, QTreeMapHandle,
    STreeListHandle, StoreDelegate, TreeInfo, UTreeValueHandle,
};
pub use error::TreeError;
pub use metrics::MetricsSnapshot;
pub use page::PageCodec;
pub use policy::{ArityPolicy, PagePolicy, PageStats};
pub use qtree::{Bounds, GridProjection, IdentityProjection, Projection, QTreeEntry, Tile};
pub use store::{Chunk, Germ, Pending, Store, StoreState, StoreStatus, Zone};
pub use tree::{TreeKind, TreeRoot};
