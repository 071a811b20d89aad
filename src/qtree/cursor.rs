//! qtree/cursor — lazy box query.

use anyhow::Result;
use std::collections::VecDeque;

use super::page::{QTreeEntry, QTreePage};
use crate::page::{PageRef, TreeContext, TreePage};

/// Yields every entry whose tiles overlap the inclusive box. Children whose
/// cover misses the box are never loaded; lifted slots are tested at every
/// visited page.
pub struct QTreeCursor {
    cx: TreeContext,
    bounds: (u64, u64, u64, u64),
    stack: Vec<PageRef<QTreePage>>,
    pending: VecDeque<QTreeEntry>,
}

impl QTreeCursor {
    pub(crate) fn new(root: PageRef<QTreePage>, cx: TreeContext, bounds: (u64, u64, u64, u64)) -> Self {
        let (x0, y0, x1, y1) = bounds;
        let mut stack = Vec::new();
        if root.span() > 0 && root.hint().overlaps(x0, y0, x1, y1) {
            stack.push(root);
        }
        Self {
            cx,
            bounds,
            stack,
            pending: VecDeque::new(),
        }
    }

    fn fill(&mut self) -> Result<bool> {
        let (x0, y0, x1, y1) = self.bounds;
        while self.pending.is_empty() {
            let r = match self.stack.pop() {
                Some(r) => r,
                None => return Ok(false),
            };
            let page = r.page(&self.cx)?;
            self.pending.extend(
                page.slots()
                    .iter()
                    .filter(|e| e.within(x0, y0, x1, y1))
                    .cloned(),
            );
            for c in page.child_refs().iter().rev() {
                if c.span() > 0 && c.hint().overlaps(x0, y0, x1, y1) {
                    self.stack.push(c.clone());
                }
            }
        }
        Ok(true)
    }
}

impl Iterator for QTreeCursor {
    type Item = Result<QTreeEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.fill() {
            Ok(true) => self.pending.pop_front().map(Ok),
            Ok(false) => None,
            Err(e) => {
                self.stack.clear();
                Some(Err(e))
            }
        }
    }
}
