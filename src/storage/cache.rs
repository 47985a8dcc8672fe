//! # LRU Page Cache
//!
//! A bounded least-recently-used cache of page copies keyed by page number.
//!
//! ## Structure
//!
//! Entries live in a slab (`Vec<Slot>`) and are threaded onto an intrusive
//! doubly linked list by slab index, most recently used at the head. A
//! `hashbrown::HashMap` maps page numbers to slab indices, so lookup,
//! promotion and eviction are all O(1):
//!
//! ```text
//! index: { 7 -> 2, 3 -> 0, 9 -> 1 }
//!
//! head                        tail
//!  [2: page 7] <-> [0: page 3] <-> [1: page 9]   <- evicted next
//! ```
//!
//! Freed slab slots go on a free stack and are reused before the slab grows.
//!
//! ## Locking
//!
//! One `parking_lot::RwLock` guards the whole structure. A hit promotes the
//! entry, so `get` takes the write lock; only `contains` and `len` read.
//! Hit and miss counters are atomics outside the lock.
//!
//! ## Ownership
//!
//! The cache stores owned `Page` copies and hands out clones. A caller
//! mutating its copy must write it back through the page manager, which
//! refreshes the cached entry.

use std::sync::atomic::{AtomicU64, Ordering};

use hashbrown::HashMap;
use parking_lot::RwLock;

use super::page::Page;

const NIL: usize = usize::MAX;

struct Slot {
    page: Page,
    prev: usize,
    next: usize,
}

struct LruList {
    slots: Vec<Slot>,
    free: Vec<usize>,
    index: HashMap<u32, usize>,
    head: usize,
    tail: usize,
}

impl LruList {
    fn new(capacity: usize) -> Self {
        Self {
            slots: Vec::with_capacity(capacity),
            free: Vec::new(),
            index: HashMap::with_capacity(capacity),
            head: NIL,
            tail: NIL,
        }
    }

    fn unlink(&mut self, idx: usize) {
        let (prev, next) = (self.slots[idx].prev, self.slots[idx].next);

        if prev == NIL {
            self.head = next;
        } else {
            self.slots[prev].next = next;
        }

        if next == NIL {
            self.tail = prev;
        } else {
            self.slots[next].prev = prev;
        }

        self.slots[idx].prev = NIL;
        self.slots[idx].next = NIL;
    }

    fn push_front(&mut self, idx: usize) {
        self.slots[idx].prev = NIL;
        self.slots[idx].next = self.head;

        if self.head != NIL {
            self.slots[self.head].prev = idx;
        }
        self.head = idx;

        if self.tail == NIL {
            self.tail = idx;
        }
    }

    fn promote(&mut self, idx: usize) {
        if self.head != idx {
            self.unlink(idx);
            self.push_front(idx);
        }
    }

    fn remove(&mut self, page_no: u32) -> Option<usize> {
        let idx = self.index.remove(&page_no)?;
        self.unlink(idx);
        self.free.push(idx);
        Some(idx)
    }

    fn insert(&mut self, page: Page) {
        let page_no = page.number();
        let slot = Slot {
            page,
            prev: NIL,
            next: NIL,
        };

        let idx = match self.free.pop() {
            Some(idx) => {
                self.slots[idx] = slot;
                idx
            }
            None => {
                self.slots.push(slot);
                self.slots.len() - 1
            }
        };

        self.index.insert(page_no, idx);
        self.push_front(idx);
    }

    fn evict_lru(&mut self) -> Option<u32> {
        if self.tail == NIL {
            return None;
        }

        let page_no = self.slots[self.tail].page.number();
        self.remove(page_no);
        Some(page_no)
    }

    fn clear(&mut self) {
        self.slots.clear();
        self.free.clear();
        self.index.clear();
        self.head = NIL;
        self.tail = NIL;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
}

impl CacheStats {
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

pub struct PageCache {
    list: RwLock<LruList>,
    capacity: usize,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl PageCache {
    /// A cache holding at most `capacity` pages. A capacity of zero caches
    /// nothing.
    pub fn new(capacity: usize) -> Self {
        Self {
            list: RwLock::new(LruList::new(capacity)),
            capacity,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Returns a copy of the cached page and marks it most recently used.
    pub fn get(&self, page_no: u32) -> Option<Page> {
        let mut list = self.list.write();

        match list.index.get(&page_no).copied() {
            Some(idx) => {
                list.promote(idx);
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(list.slots[idx].page.clone())
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Inserts or replaces a page, evicting the least recently used entry
    /// when full. Returns the evicted page number.
    pub fn put(&self, page: Page) -> Option<u32> {
        if self.capacity == 0 {
            return None;
        }

        let mut list = self.list.write();

        if let Some(idx) = list.index.get(&page.number()).copied() {
            list.slots[idx].page = page;
            list.promote(idx);
            return None;
        }

        let evicted = if list.index.len() >= self.capacity {
            list.evict_lru()
        } else {
            None
        };

        list.insert(page);
        evicted
    }

    pub fn contains(&self, page_no: u32) -> bool {
        self.list.read().index.contains_key(&page_no)
    }

    pub fn invalidate(&self, page_no: u32) -> bool {
        self.list.write().remove(page_no).is_some()
    }

    pub fn clear(&self) {
        self.list.write().clear();
    }

    pub fn len(&self) -> usize {
        self.list.read().index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for PageCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageCache")
            .field("len", &self.len())
            .field("capacity", &self.capacity)
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page(n: u32, tag: u8) -> Page {
        let mut p = Page::zeroed(n, 512);
        p.data_mut()[0] = tag;
        p
    }

    #[test]
    fn get_returns_copy_and_counts_hits() {
        let cache = PageCache::new(4);
        cache.put(page(3, 7));

        let hit = cache.get(3).unwrap();
        assert_eq!(hit.data()[0], 7);
        assert!(cache.get(4).is_none());

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert!((stats.hit_ratio() - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn evicts_least_recently_used() {
        let cache = PageCache::new(3);
        cache.put(page(1, 1));
        cache.put(page(2, 2));
        cache.put(page(3, 3));

        cache.get(1);
        let evicted = cache.put(page(4, 4));

        assert_eq!(evicted, Some(2));
        assert!(cache.contains(1));
        assert!(!cache.contains(2));
        assert_eq!(cache.len(), 3);
    }

    #[test]
    fn put_replaces_existing_entry() {
        let cache = PageCache::new(2);
        cache.put(page(5, 1));
        cache.put(page(5, 9));

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(5).unwrap().data()[0], 9);
    }

    #[test]
    fn invalidate_and_reuse_slots() {
        let cache = PageCache::new(2);
        cache.put(page(1, 1));
        cache.put(page(2, 2));

        assert!(cache.invalidate(1));
        assert!(!cache.invalidate(1));

        cache.put(page(3, 3));
        assert_eq!(cache.len(), 2);
        assert!(cache.contains(2));
        assert!(cache.contains(3));
    }

    #[test]
    fn eviction_order_after_many_promotions() {
        let cache = PageCache::new(3);
        for n in 1..=3 {
            cache.put(page(n, n as u8));
        }
        cache.get(1);
        cache.get(2);
        cache.get(1);

        assert_eq!(cache.put(page(4, 4)), Some(3));
        assert_eq!(cache.put(page(5, 5)), Some(2));
        assert_eq!(cache.put(page(6, 6)), Some(1));
    }

    #[test]
    fn zero_capacity_caches_nothing() {
        let cache = PageCache::new(0);
        cache.put(page(1, 1));

        assert!(cache.is_empty());
        assert!(cache.get(1).is_none());
    }

    #[test]
    fn clear_empties_cache() {
        let cache = PageCache::new(4);
        cache.put(page(1, 1));
        cache.put(page(2, 2));
        cache.clear();

        assert!(cache.is_empty());
        cache.put(page(7, 7));
        assert_eq!(cache.get(7).unwrap().number(), 7);
    }
}
