//! Page policy: when to split and when to merge.
//!
//! Pages never hard-code their thresholds; balancing asks the policy held by
//! the tree's `TreeContext`.

use std::fmt::Debug;

/// Read-only statistics a policy decides on.
pub trait PageStats {
    fn arity(&self) -> usize;
    fn span(&self) -> u64;
    fn is_leaf(&self) -> bool;
}

pub trait PagePolicy: Send + Sync + Debug {
    fn should_split(&self, page: &dyn PageStats) -> bool;
    fn should_merge(&self, page: &dyn PageStats) -> bool;
}

/// Arity thresholds: split above `*_split_arity`, merge below
/// `*_merge_arity` (half of the split arity unless set explicitly).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArityPolicy {
    pub leaf_split_arity: usize,
    pub leaf_merge_arity: usize,
    pub node_split_arity: usize,
    pub node_merge_arity: usize,
}

impl ArityPolicy {
    /// Same thresholds for leaves and nodes.
    pub fn new(split_arity: usize) -> Self {
        Self::with_arities(split_arity, split_arity)
    }

    pub fn with_arities(leaf_split_arity: usize, node_split_arity: usize) -> Self {
        let leaf = leaf_split_arity.max(2);
        let node = node_split_arity.max(2);
        Self {
            leaf_split_arity: leaf,
            leaf_merge_arity: leaf / 2,
            node_split_arity: node,
            node_merge_arity: node / 2,
        }
    }

    /// Override both merge thresholds.
    pub fn with_merge_arity(mut self, leaf: usize, node: usize) -> Self {
        self.leaf_merge_arity = leaf;
        self.node_merge_arity = node;
        self
    }
}

impl Default for ArityPolicy {
    fn default() -> Self {
        Self::with_arities(512, 64)
    }
}

impl PagePolicy for ArityPolicy {
    fn should_split(&self, page: &dyn PageStats) -> bool {
        let max = if page.is_leaf() {
            self.leaf_split_arity
        } else {
            self.node_split_arity
        };
        page.arity() > max
    }

    fn should_merge(&self, page: &dyn PageStats) -> bool {
        let min = if page.is_leaf() {
            self.leaf_merge_arity
        } else {
            self.node_merge_arity
        };
        page.arity() < min
    }
}

/// Statistics of a page that does not exist yet (e.g. a candidate merge).
#[derive(Debug, Clone, Copy)]
pub struct ProjectedStats {
    pub arity: usize,
    pub span: u64,
    pub is_leaf: bool,
}

impl PageStats for ProjectedStats {
    fn arity(&self) -> usize {
        self.arity
    }
    fn span(&self) -> u64 {
        self.span
    }
    fn is_leaf(&self) -> bool {
        self.is_leaf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arity_thresholds() {
        let p = ArityPolicy::new(1024);
        let leaf = |n| ProjectedStats { arity: n, span: n as u64, is_leaf: true };
        assert!(!p.should_split(&leaf(1024)));
        assert!(p.should_split(&leaf(1025)));
        assert!(p.should_merge(&leaf(511)));
        assert!(!p.should_merge(&leaf(512)));
    }
}
