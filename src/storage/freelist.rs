//! # Freelist Management
//!
//! Free pages are tracked on disk as a linked list of trunk pages, each
//! holding an array of free "leaf" page numbers. The head of the list and
//! the total number of free pages (trunks included) live in the database
//! header.
//!
//! ## Trunk Page Layout
//!
//! ```text
//! Offset  Size  Description
//! ------  ----  ----------------------------------------
//! 0       4     next_trunk: page number of next trunk (0 = last)
//! 4       4     leaf_count: number of leaf entries
//! 8       4*N   leaf page numbers, big-endian
//! ```
//!
//! A trunk holds at most `(page_size - 8) / 4` leaves: 1022 for 4KB pages.
//!
//! ## Allocation
//!
//! 1. If the head trunk has leaves, pop the last one
//! 2. Otherwise recycle the head trunk itself: zero it and advance the
//!    head to its `next_trunk`
//! 3. An empty list yields `None` and the caller grows the file
//!
//! ## Release
//!
//! A freed page is appended to the head trunk when it has room; otherwise
//! the freed page becomes a new head trunk pointing at the old one.
//!
//! ## Compaction
//!
//! A trunk with zero leaves that is not the last trunk carries no free page
//! numbers besides itself. `compact` splices such trunks out of the chain
//! and returns them; they are no longer counted as free, and the caller
//! decides what to do with them.
//!
//! ## Corruption Guard
//!
//! Every walk is bounded by `min(MAX_CHAIN_PAGES, page_count)` trunks, so a
//! cyclic chain fails with `Corrupt` instead of looping.

use eyre::{bail, Result};
use tracing::trace;

use super::page::{Page, PageKind};
use super::pager::PageManager;
use crate::config::{FREELIST_LEAF_ENTRY_SIZE, FREELIST_TRUNK_HEADER_SIZE, MAX_CHAIN_PAGES};
use crate::error::StorageError;

pub struct FreelistManager<'a> {
    pager: &'a PageManager,
}

impl<'a> FreelistManager<'a> {
    pub fn new(pager: &'a PageManager) -> Self {
        Self { pager }
    }

    /// Leaf entries that fit in one trunk page.
    pub fn max_leaves_per_trunk(&self) -> usize {
        (self.pager.usable_size() - FREELIST_TRUNK_HEADER_SIZE) / FREELIST_LEAF_ENTRY_SIZE
    }

    fn chain_cap(&self) -> usize {
        MAX_CHAIN_PAGES.min(self.pager.num_pages() as usize)
    }

    fn read_trunk(&self, page_no: u32) -> Result<(Page, u32, usize)> {
        let mut page = self.pager.read_page(page_no)?;
        page.set_kind(PageKind::Freelist);

        let next = page.read_u32(0);
        let leaves = page.read_u32(4) as usize;
        if leaves > self.max_leaves_per_trunk() {
            bail!(StorageError::Corrupt(format!(
                "freelist trunk {} claims {} leaves (max {})",
                page_no,
                leaves,
                self.max_leaves_per_trunk()
            )));
        }
        Ok((page, next, leaves))
    }

    fn leaf_offset(index: usize) -> usize {
        FREELIST_TRUNK_HEADER_SIZE + index * FREELIST_LEAF_ENTRY_SIZE
    }

    /// Pops a free page, or `None` when the freelist is empty.
    pub fn allocate_page(&self) -> Result<Option<u32>> {
        let head = self.pager.header().first_freelist_trunk();
        if head == 0 {
            return Ok(None);
        }

        let (mut trunk, next, leaves) = self.read_trunk(head)?;

        if leaves > 0 {
            let leaf = trunk.read_u32(Self::leaf_offset(leaves - 1));
            trunk.write_u32(Self::leaf_offset(leaves - 1), 0);
            trunk.write_u32(4, (leaves - 1) as u32);
            self.pager.write_page(&mut trunk)?;
            self.pager
                .update_header(|h| h.set_freelist_count(h.freelist_count().saturating_sub(1)))?;

            trace!(page_no = leaf, trunk = head, "popped freelist leaf");
            return Ok(Some(leaf));
        }

        trunk.data_mut().fill(0);
        trunk.set_kind(PageKind::Unformatted);
        self.pager.write_page(&mut trunk)?;
        self.pager.update_header(|h| {
            h.set_first_freelist_trunk(next);
            h.set_freelist_count(h.freelist_count().saturating_sub(1));
        })?;

        trace!(page_no = head, next, "recycled freelist trunk");
        Ok(Some(head))
    }

    pub fn free_page(&self, page_no: u32) -> Result<()> {
        let head = self.pager.header().first_freelist_trunk();

        if head != 0 {
            let (mut trunk, _, leaves) = self.read_trunk(head)?;
            if leaves < self.max_leaves_per_trunk() {
                trunk.write_u32(Self::leaf_offset(leaves), page_no);
                trunk.write_u32(4, (leaves + 1) as u32);
                self.pager.write_page(&mut trunk)?;
                self.pager
                    .update_header(|h| h.set_freelist_count(h.freelist_count() + 1))?;

                trace!(page_no, trunk = head, "added freelist leaf");
                return Ok(());
            }
        }

        let mut trunk = Page::zeroed(page_no, self.pager.page_size());
        trunk.set_kind(PageKind::Freelist);
        trunk.write_u32(0, head);
        self.pager.write_page(&mut trunk)?;
        self.pager.update_header(|h| {
            h.set_first_freelist_trunk(page_no);
            h.set_freelist_count(h.freelist_count() + 1);
        })?;

        trace!(page_no, next = head, "created freelist trunk");
        Ok(())
    }

    /// Visits trunks in chain order as `(page_no, next_trunk, leaf_count)`.
    fn walk<F>(&self, mut visit: F) -> Result<()>
    where
        F: FnMut(u32, u32, usize) -> Result<()>,
    {
        let cap = self.chain_cap();
        let mut current = self.pager.header().first_freelist_trunk();
        let mut visited = 0usize;

        while current != 0 {
            visited += 1;
            if visited > cap {
                bail!(StorageError::Corrupt(format!(
                    "freelist trunk chain exceeds {} pages",
                    cap
                )));
            }

            let (_, next, leaves) = self.read_trunk(current)?;
            visit(current, next, leaves)?;
            current = next;
        }
        Ok(())
    }

    /// Trunks plus their leaves across the whole chain.
    pub fn count_free_pages(&self) -> Result<u32> {
        let mut total = 0u32;
        self.walk(|_, _, leaves| {
            total += 1 + leaves as u32;
            Ok(())
        })?;
        Ok(total)
    }

    /// Trunk page numbers in traversal order.
    pub fn trunk_pages(&self) -> Result<Vec<u32>> {
        let mut trunks = Vec::new();
        self.walk(|page_no, _, _| {
            trunks.push(page_no);
            Ok(())
        })?;
        Ok(trunks)
    }

    /// Splices leafless, non-final trunks out of the chain and returns them.
    pub fn compact(&self) -> Result<Vec<u32>> {
        let mut chain = Vec::new();
        self.walk(|page_no, next, leaves| {
            chain.push((page_no, next, leaves));
            Ok(())
        })?;

        let mut removed = Vec::new();
        let mut prev: Option<u32> = None;

        for &(page_no, next, leaves) in &chain {
            if leaves > 0 || next == 0 {
                prev = Some(page_no);
                continue;
            }

            match prev {
                None => self.pager.update_header(|h| h.set_first_freelist_trunk(next))?,
                Some(prev_no) => {
                    let (mut prev_page, _, _) = self.read_trunk(prev_no)?;
                    prev_page.write_u32(0, next);
                    self.pager.write_page(&mut prev_page)?;
                }
            }
            removed.push(page_no);
        }

        if !removed.is_empty() {
            let count = removed.len() as u32;
            self.pager
                .update_header(|h| h.set_freelist_count(h.freelist_count().saturating_sub(count)))?;
            trace!(removed = count, "compacted freelist");
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::PagerBuilder;
    use hashbrown::HashSet;

    fn pager() -> PageManager {
        PagerBuilder::new().page_size(512).open_in_memory().unwrap()
    }

    fn grow(pager: &PageManager, n: usize) -> Vec<u32> {
        (0..n).map(|_| pager.allocate_page().unwrap()).collect()
    }

    #[test]
    fn empty_freelist_allocates_nothing() {
        let pager = pager();
        let freelist = FreelistManager::new(&pager);

        assert_eq!(freelist.allocate_page().unwrap(), None);
        assert_eq!(freelist.count_free_pages().unwrap(), 0);
    }

    #[test]
    fn first_free_page_becomes_trunk() {
        let pager = pager();
        let pages = grow(&pager, 3);
        let freelist = FreelistManager::new(&pager);

        freelist.free_page(pages[0]).unwrap();
        freelist.free_page(pages[1]).unwrap();

        assert_eq!(pager.header().first_freelist_trunk(), pages[0]);
        assert_eq!(freelist.trunk_pages().unwrap(), vec![pages[0]]);
        assert_eq!(freelist.count_free_pages().unwrap(), 2);
        assert_eq!(pager.header().freelist_count(), 2);
    }

    #[test]
    fn allocate_pops_leaves_then_recycles_trunk() {
        let pager = pager();
        let pages = grow(&pager, 3);
        let freelist = FreelistManager::new(&pager);
        for &p in &pages {
            freelist.free_page(p).unwrap();
        }

        assert_eq!(freelist.allocate_page().unwrap(), Some(pages[2]));
        assert_eq!(freelist.allocate_page().unwrap(), Some(pages[1]));
        assert_eq!(freelist.allocate_page().unwrap(), Some(pages[0]));
        assert_eq!(freelist.allocate_page().unwrap(), None);
        assert_eq!(pager.header().first_freelist_trunk(), 0);

        let recycled = pager.read_page(pages[0]).unwrap();
        assert!(recycled.data().iter().all(|&b| b == 0));
    }

    #[test]
    fn full_trunk_starts_new_trunk() {
        let pager = pager();
        let freelist = FreelistManager::new(&pager);
        let max = freelist.max_leaves_per_trunk();
        assert_eq!(max, (512 - 8) / 4);

        let pages = grow(&pager, max + 2);
        for &p in &pages {
            freelist.free_page(p).unwrap();
        }

        let last = *pages.last().unwrap();
        assert_eq!(freelist.trunk_pages().unwrap(), vec![last, pages[0]]);
        assert_eq!(freelist.count_free_pages().unwrap(), pages.len() as u32);
    }

    #[test]
    fn conservation_over_mixed_operations() {
        let pager = pager();
        let freelist = FreelistManager::new(&pager);
        let mut live: HashSet<u32> = grow(&pager, 40).into_iter().collect();
        let mut free: HashSet<u32> = HashSet::new();

        for (i, p) in live.clone().into_iter().enumerate() {
            if i % 3 != 0 {
                freelist.free_page(p).unwrap();
                live.remove(&p);
                free.insert(p);
            }
        }

        for _ in 0..10 {
            let p = freelist.allocate_page().unwrap().unwrap();
            assert!(free.remove(&p), "page {} handed out twice", p);
            assert!(live.insert(p));
        }

        assert_eq!(freelist.count_free_pages().unwrap(), free.len() as u32);
        assert_eq!(pager.header().freelist_count(), free.len() as u32);
    }

    #[test]
    fn compact_splices_empty_trunks() {
        let pager = pager();
        let freelist = FreelistManager::new(&pager);
        let max = freelist.max_leaves_per_trunk();
        let pages = grow(&pager, max + 2);
        for &p in &pages {
            freelist.free_page(p).unwrap();
        }

        let head = *pages.last().unwrap();
        let tail = pages[0];
        assert_eq!(freelist.trunk_pages().unwrap(), vec![head, tail]);
        let before = freelist.count_free_pages().unwrap();

        let removed = freelist.compact().unwrap();

        assert_eq!(removed, vec![head]);
        assert_eq!(freelist.trunk_pages().unwrap(), vec![tail]);
        assert_eq!(freelist.count_free_pages().unwrap(), before - 1);
        assert_eq!(pager.header().freelist_count(), before - 1);
    }

    #[test]
    fn compact_keeps_last_trunk() {
        let pager = pager();
        let pages = grow(&pager, 1);
        let freelist = FreelistManager::new(&pager);
        freelist.free_page(pages[0]).unwrap();

        assert!(freelist.compact().unwrap().is_empty());
        assert_eq!(freelist.trunk_pages().unwrap(), vec![pages[0]]);
    }

    #[test]
    fn cyclic_chain_is_corruption() {
        let pager = pager();
        let pages = grow(&pager, 1);
        let freelist = FreelistManager::new(&pager);
        freelist.free_page(pages[0]).unwrap();

        let mut trunk = pager.read_page(pages[0]).unwrap();
        trunk.write_u32(0, pages[0]);
        pager.write_page(&mut trunk).unwrap();

        let err = freelist.count_free_pages().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<StorageError>(),
            Some(StorageError::Corrupt(_))
        ));
    }
}
