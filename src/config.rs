//! Centralized configuration and builder for a CanopyDB store.
//!
//! - StoreConfig::default() gives conservative defaults.
//! - StoreConfig::from_env() overlays CANOPY_* environment variables.
//! - StoreBuilder starts from env (or defaults) and applies overrides.
//!
//! Env:
//! - CANOPY_DELETE_DELAY_MS    (default 0)
//! - CANOPY_COMMIT_TIMEOUT_MS  (default 30000)
//! - CANOPY_MIN_TREE_FILL      (default 0.5)
//! - CANOPY_LEAF_SPLIT_ARITY   (default 512)
//! - CANOPY_NODE_SPLIT_ARITY   (default 64)
//! - CANOPY_MERGE_RATIO        (default 0.5)
//! - CANOPY_ZONE_MAX_SIZE      (default 32 MiB)
//! - CANOPY_PAGE_CACHE_PAGES   (default 4096, 0 disables)
//! - CANOPY_DATA_FSYNC         (default true; "0|false|off|no" => false)
//! - CANOPY_PAGE_CODEC         (none|zstd, default none)
//! - CANOPY_ZSTD_LEVEL         (default 0 = zstd default)

use serde::Serialize;
use std::fmt;
use std::time::Duration;

use crate::page::block::PageCodec;
use crate::policy::ArityPolicy;

#[derive(Clone, Debug, Serialize)]
pub struct StoreConfig {
    /// Delay before retired zone files (and a deleted store) are removed.
    pub delete_delay_ms: u64,

    /// Upper bound a synchronous commit waits on the stage.
    pub commit_timeout_ms: u64,

    /// Compaction runs (unless forced) only when live bytes / zone bytes is
    /// below this ratio.
    pub min_tree_fill: f64,

    /// Leaves split above this many entries.
    pub leaf_split_arity: usize,

    /// Internal pages split above this many children.
    pub node_split_arity: usize,

    /// Pages merge below split_arity * merge_ratio.
    pub merge_ratio: f64,

    /// A commit shifts to a new zone once the active one is larger.
    pub zone_max_size: u64,

    /// Decoded pages kept in the LRU page cache (0 disables).
    pub page_cache_pages: usize,

    /// fsync zone data after each chunk and germ write.
    pub data_fsync: bool,

    /// Body compression for written page blocks.
    pub page_codec: PageCodec,

    pub zstd_level: i32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            delete_delay_ms: 0,
            commit_timeout_ms: 30_000,
            min_tree_fill: 0.5,
            leaf_split_arity: 512,
            node_split_arity: 64,
            merge_ratio: 0.5,
            zone_max_size: 32 * 1024 * 1024,
            page_cache_pages: 4096,
            data_fsync: true,
            page_codec: PageCodec::None,
            zstd_level: 0,
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.trim().parse::<T>().ok())
}

fn env_flag(name: &str) -> Option<bool> {
    let v = std::env::var(name).ok()?;
    let s = v.trim().to_ascii_lowercase();
    Some(s == "1" || s == "true" || s == "on" || s == "yes")
}

impl StoreConfig {
    /// Defaults overlaid with CANOPY_* environment variables.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Some(n) = env_parse("CANOPY_DELETE_DELAY_MS") {
            cfg.delete_delay_ms = n;
        }
        if let Some(n) = env_parse("CANOPY_COMMIT_TIMEOUT_MS") {
            cfg.commit_timeout_ms = n;
        }
        if let Some(f) = env_parse("CANOPY_MIN_TREE_FILL") {
            cfg.min_tree_fill = f;
        }
        if let Some(n) = env_parse("CANOPY_LEAF_SPLIT_ARITY") {
            cfg.leaf_split_arity = n;
        }
        if let Some(n) = env_parse("CANOPY_NODE_SPLIT_ARITY") {
            cfg.node_split_arity = n;
        }
        if let Some(f) = env_parse("CANOPY_MERGE_RATIO") {
            cfg.merge_ratio = f;
        }
        if let Some(n) = env_parse("CANOPY_ZONE_MAX_SIZE") {
            cfg.zone_max_size = n;
        }
        if let Some(n) = env_parse("CANOPY_PAGE_CACHE_PAGES") {
            cfg.page_cache_pages = n;
        }
        if let Some(on) = env_flag("CANOPY_DATA_FSYNC") {
            cfg.data_fsync = on;
        }
        if let Ok(v) = std::env::var("CANOPY_PAGE_CODEC") {
            if let Some(c) = PageCodec::parse(&v) {
                cfg.page_codec = c;
            }
        }
        if let Some(n) = env_parse("CANOPY_ZSTD_LEVEL") {
            cfg.zstd_level = n;
        }

        cfg
    }

    pub fn with_delete_delay_ms(mut self, ms: u64) -> Self {
        self.delete_delay_ms = ms;
        self
    }

    pub fn with_commit_timeout_ms(mut self, ms: u64) -> Self {
        self.commit_timeout_ms = ms;
        self
    }

    pub fn with_min_tree_fill(mut self, fill: f64) -> Self {
        self.min_tree_fill = fill;
        self
    }

    pub fn with_split_arity(mut self, leaf: usize, node: usize) -> Self {
        self.leaf_split_arity = leaf;
        self.node_split_arity = node;
        self
    }

    pub fn with_merge_ratio(mut self, ratio: f64) -> Self {
        self.merge_ratio = ratio;
        self
    }

    pub fn with_zone_max_size(mut self, bytes: u64) -> Self {
        self.zone_max_size = bytes;
        self
    }

    pub fn with_page_cache_pages(mut self, pages: usize) -> Self {
        self.page_cache_pages = pages;
        self
    }

    pub fn with_data_fsync(mut self, on: bool) -> Self {
        self.data_fsync = on;
        self
    }

    pub fn with_page_codec(mut self, codec: PageCodec, zstd_level: i32) -> Self {
        self.page_codec = codec;
        self.zstd_level = zstd_level;
        self
    }

    /// Split/merge policy shared by every tree of the store.
    pub fn policy(&self) -> ArityPolicy {
        let ratio = self.merge_ratio.clamp(0.0, 1.0);
        let p = ArityPolicy::with_arities(self.leaf_split_arity, self.node_split_arity);
        let leaf_merge = (p.leaf_split_arity as f64 * ratio) as usize;
        let node_merge = (p.node_split_arity as f64 * ratio) as usize;
        p.with_merge_arity(leaf_merge, node_merge)
    }

    pub fn delete_delay(&self) -> Duration {
        Duration::from_millis(self.delete_delay_ms)
    }

    pub fn commit_timeout(&self) -> Duration {
        Duration::from_millis(self.commit_timeout_ms)
    }
}

impl fmt::Display for StoreConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "StoreConfig {{ \
             delete_delay_ms: {}, \
             commit_timeout_ms: {}, \
             min_tree_fill: {}, \
             split_arity: {}/{}, \
             merge_ratio: {}, \
             zone_max_size: {}, \
             page_cache_pages: {}, \
             data_fsync: {}, \
             page_codec: {:?}, \
             zstd_level: {} \
             }}",
            self.delete_delay_ms,
            self.commit_timeout_ms,
            self.min_tree_fill,
            self.leaf_split_arity,
            self.node_split_arity,
            self.merge_ratio,
            self.zone_max_size,
            self.page_cache_pages,
            self.data_fsync,
            self.page_codec,
            self.zstd_level,
        )
    }
}

/// Fluent builder producing a StoreConfig; `Store::builder()` returns one.
#[derive(Clone, Debug)]
pub struct StoreBuilder {
    cfg: StoreConfig,
}

impl Default for StoreBuilder {
    fn default() -> Self {
        Self {
            cfg: StoreConfig::from_env(),
        }
    }
}

impl StoreBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from a clean default (without reading env).
    pub fn from_default() -> Self {
        Self {
            cfg: StoreConfig::default(),
        }
    }

    pub fn delete_delay_ms(mut self, ms: u64) -> Self {
        self.cfg.delete_delay_ms = ms;
        self
    }

    pub fn commit_timeout_ms(mut self, ms: u64) -> Self {
        self.cfg.commit_timeout_ms = ms;
        self
    }

    pub fn min_tree_fill(mut self, fill: f64) -> Self {
        self.cfg.min_tree_fill = fill;
        self
    }

    pub fn split_arity(mut self, leaf: usize, node: usize) -> Self {
        self.cfg.leaf_split_arity = leaf;
        self.cfg.node_split_arity = node;
        self
    }

    pub fn merge_ratio(mut self, ratio: f64) -> Self {
        self.cfg.merge_ratio = ratio;
        self
    }

    pub fn zone_max_size(mut self, bytes: u64) -> Self {
        self.cfg.zone_max_size = bytes;
        self
    }

    pub fn page_cache_pages(mut self, pages: usize) -> Self {
        self.cfg.page_cache_pages = pages;
        self
    }

    pub fn data_fsync(mut self, on: bool) -> Self {
        self.cfg.data_fsync = on;
        self
    }

    pub fn page_codec(mut self, codec: PageCodec) -> Self {
        self.cfg.page_codec = codec;
        self
    }

    pub fn zstd_level(mut self, level: i32) -> Self {
        self.cfg.zstd_level = level;
        self
    }

    pub fn build(self) -> StoreConfig {
        self.cfg
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{PagePolicy, ProjectedStats};

    #[test]
    fn policy_follows_merge_ratio() {
        let cfg = StoreBuilder::from_default()
            .split_arity(100, 10)
            .merge_ratio(0.25)
            .build();
        let p = cfg.policy();
        assert_eq!((p.leaf_merge_arity, p.node_merge_arity), (25, 2));
        let leaf = |n| ProjectedStats { arity: n, span: n as u64, is_leaf: true };
        assert!(p.should_split(&leaf(101)));
        assert!(p.should_merge(&leaf(24)));
        assert!(!p.should_merge(&leaf(25)));
    }

    #[test]
    fn display_names_every_tunable() {
        let s = StoreConfig::default().to_string();
        for field in ["delete_delay_ms", "min_tree_fill", "zone_max_size", "page_codec"] {
            assert!(s.contains(field), "missing {} in {}", field, s);
        }
    }
}
