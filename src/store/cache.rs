//! store/cache — O(1) LRU cache of decoded pages.
//!
//! Design:
//! - HashMap<(zone, offset), Entry> holds the page and doubly-linked
//!   pointers (prev/next by key).
//! - head = MRU, tail = LRU.
//! - get() moves the entry to head and hands out a clone of the `Arc`.
//! - put() updates existing (move to head) or inserts a new head, evicting
//!   the tail if over capacity.
//! - Capacity=0 disables the cache (no-op).
//!
//! Entries are immutable pages; the cache never hands out mutable access.

use std::collections::HashMap;

use crate::page::CachedPage;

pub(crate) type PageKey = (u32, u64);

pub(crate) struct PageCache {
    cap: usize,
    map: HashMap<PageKey, Entry>,
    head: Option<PageKey>, // Most-recently used
    tail: Option<PageKey>, // Least-recently used
}

struct Entry {
    page: CachedPage,
    prev: Option<PageKey>,
    next: Option<PageKey>,
}

impl PageCache {
    pub(crate) fn new(cap: usize) -> Self {
        Self {
            cap,
            map: HashMap::with_capacity(cap.min(1 << 16).max(1)),
            head: None,
            tail: None,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.map.len()
    }

    pub(crate) fn capacity(&self) -> usize {
        self.cap
    }

    /// Page at `key` if present; moves it to MRU.
    pub(crate) fn get(&mut self, key: PageKey) -> Option<CachedPage> {
        if self.cap == 0 || !self.map.contains_key(&key) {
            return None;
        }
        self.detach(key);
        self.attach_front(key);
        self.map.get(&key).map(|e| e.page.clone())
    }

    /// Insert or refresh `key`, evicting the LRU entry when full.
    pub(crate) fn put(&mut self, key: PageKey, page: CachedPage) {
        if self.cap == 0 {
            return;
        }

        if let Some(e) = self.map.get_mut(&key) {
            e.page = page;
            self.detach(key);
            self.attach_front(key);
            return;
        }

        if self.map.len() >= self.cap {
            if let Some(victim) = self.tail {
                self.detach(victim);
                self.map.remove(&victim);
            }
        }

        self.map.insert(
            key,
            Entry {
                page,
                prev: None,
                next: None,
            },
        );
        self.attach_front(key);
    }

    /// Drop every entry of `zone`. Returns how many were evicted.
    pub(crate) fn evict_zone(&mut self, zone: u32) -> usize {
        let victims: Vec<PageKey> = self.map.keys().filter(|k| k.0 == zone).copied().collect();
        for k in &victims {
            self.detach(*k);
            self.map.remove(k);
        }
        victims.len()
    }

    pub(crate) fn clear(&mut self) {
        self.map.clear();
        self.head = None;
        self.tail = None;
    }

    // ---------------- internal helpers ----------------

    fn detach(&mut self, key: PageKey) {
        let (prev, next) = match self.map.get(&key) {
            Some(e) => (e.prev, e.next),
            None => return,
        };

        if self.head == Some(key) {
            self.head = next;
        }
        if self.tail == Some(key) {
            self.tail = prev;
        }

        if let Some(p) = prev {
            if let Some(pe) = self.map.get_mut(&p) {
                pe.next = next;
            }
        }
        if let Some(n) = next {
            if let Some(ne) = self.map.get_mut(&n) {
                ne.prev = prev;
            }
        }

        if let Some(e) = self.map.get_mut(&key) {
            e.prev = None;
            e.next = None;
        }
    }

    fn attach_front(&mut self, key: PageKey) {
        if self.head == Some(key) {
            return;
        }

        if let Some(e) = self.map.get_mut(&key) {
            e.prev = None;
            e.next = self.head;
        }

        if let Some(old_head) = self.head {
            if let Some(he) = self.map.get_mut(&old_head) {
                he.prev = Some(key);
            }
        }

        self.head = Some(key);

        if self.tail.is_none() {
            self.tail = Some(key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::bytes;
    use crate::utree::UTreePage;
    use std::sync::Arc;

    fn page(v: u64) -> CachedPage {
        CachedPage::UTree(Arc::new(UTreePage::new(bytes(b"x"), v)))
    }

    #[test]
    fn evicts_least_recently_used() {
        let mut c = PageCache::new(2);
        c.put((0, 1), page(1));
        c.put((0, 2), page(2));
        assert!(c.get((0, 1)).is_some()); // 1 becomes MRU
        c.put((0, 3), page(3)); // evicts 2
        assert!(c.get((0, 2)).is_none());
        assert_eq!(c.get((0, 1)).map(|p| p.version()), Some(1));
        assert_eq!(c.get((0, 3)).map(|p| p.version()), Some(3));
        assert_eq!(c.len(), 2);
    }

    #[test]
    fn evict_zone_keeps_links_consistent() {
        let mut c = PageCache::new(8);
        for i in 0..6u64 {
            c.put(((i % 2) as u32, i), page(i));
        }
        assert_eq!(c.evict_zone(1), 3);
        assert_eq!(c.len(), 3);
        // Fill past capacity; eviction must walk a consistent list.
        for i in 10..20u64 {
            c.put((2, i), page(i));
        }
        assert_eq!(c.len(), 8);
        assert!(c.get((0, 0)).is_none());
        assert!(c.get((2, 19)).is_some());
    }

    #[test]
    fn zero_capacity_is_disabled() {
        let mut c = PageCache::new(0);
        c.put((0, 1), page(1));
        assert!(c.get((0, 1)).is_none());
        assert_eq!(c.len(), 0);
    }
}
