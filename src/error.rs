//! Typed error kinds of the engine.
//!
//! Public APIs return `anyhow::Result`; the kinds below travel inside the
//! anyhow chain and can be recovered with `err.downcast_ref::<TreeError>()`.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TreeError {
    /// The external key comparator rejected a key. The tree is unchanged.
    #[error("key ordering failed: {0}")]
    KeyOrdering(String),

    /// Spatial tile/rank inconsistency; rejects the offending mutation or query.
    #[error("dimension mismatch: {0}")]
    DimensionMismatch(String),

    /// Zone file read/write failure.
    #[error("zone i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Both germ copies of the newest zone are invalid.
    #[error("corrupt germ in zone {zone}: {reason}")]
    CorruptGerm { zone: u32, reason: String },

    /// A page block or chunk failed validation on read.
    #[error("corrupt block at zone {zone} offset {offset}: {reason}")]
    CorruptBlock { zone: u32, offset: u64, reason: String },

    /// Opening another tree would overflow the germ slot. Nothing was
    /// registered.
    #[error("germ slot full: {needed} bytes needed for {trees} trees, slot holds {limit}")]
    GermFull { needed: usize, trees: usize, limit: usize },

    /// Operation not valid in the current store state.
    #[error("invalid store state: {0}")]
    State(String),
}

impl TreeError {
    pub fn dimension<S: Into<String>>(msg: S) -> Self {
        TreeError::DimensionMismatch(msg.into())
    }

    pub fn ordering<S: Into<String>>(msg: S) -> Self {
        TreeError::KeyOrdering(msg.into())
    }
}
