//! # Overflow Chains
//!
//! Payload bytes that do not fit in a cell's local area are stored in a
//! singly linked chain of overflow pages.
//!
//! ## Overflow Page Layout
//!
//! ```text
//! Offset  Size          Description
//! ------  ------------  ----------------------------------
//! 0       4             next overflow page (0 = last)
//! 4       usable - 4    payload bytes
//! ```
//!
//! A payload of K bytes occupies `ceil(K / (usable - 4))` pages. The last
//! page is zero-padded; the reader stops once it has collected the declared
//! total, and a chain that ends before that total is reported as
//! corruption rather than returned short.
//!
//! ## Corruption Guard
//!
//! Walks are bounded by `min(MAX_CHAIN_PAGES, page_count)` pages so a cyclic
//! chain fails with `Corrupt` instead of looping.

use eyre::{bail, Result};
use tracing::trace;

use super::page::{Page, PageKind};
use super::pager::PageManager;
use crate::config::{MAX_CHAIN_PAGES, OVERFLOW_HEADER_SIZE};
use crate::error::StorageError;

pub struct OverflowManager<'a> {
    pager: &'a PageManager,
}

impl<'a> OverflowManager<'a> {
    pub fn new(pager: &'a PageManager) -> Self {
        Self { pager }
    }

    /// Payload bytes carried by one overflow page.
    pub fn chunk_size(&self) -> usize {
        self.pager.usable_size() - OVERFLOW_HEADER_SIZE
    }

    fn chain_cap(&self) -> usize {
        MAX_CHAIN_PAGES.min(self.pager.num_pages() as usize)
    }

    fn too_long(&self, first_page: u32) -> StorageError {
        StorageError::Corrupt(format!(
            "overflow chain starting at page {} exceeds {} pages",
            first_page,
            self.chain_cap()
        ))
    }

    /// Writes `payload` across a new chain and returns its first page, or 0
    /// for an empty payload.
    pub fn write_overflow_chain(&self, payload: &[u8]) -> Result<u32> {
        if payload.is_empty() {
            return Ok(0);
        }

        let chunks: Vec<&[u8]> = payload.chunks(self.chunk_size()).collect();
        let mut pages = Vec::with_capacity(chunks.len());
        for _ in 0..chunks.len() {
            pages.push(self.pager.allocate_page()?);
        }

        for (i, chunk) in chunks.iter().enumerate() {
            let next = pages.get(i + 1).copied().unwrap_or(0);
            let mut page = Page::zeroed(pages[i], self.pager.page_size());
            page.set_kind(PageKind::Overflow);
            page.write_u32(0, next);
            page.data_mut()[OVERFLOW_HEADER_SIZE..OVERFLOW_HEADER_SIZE + chunk.len()]
                .copy_from_slice(chunk);
            self.pager.write_page(&mut page)?;
        }

        trace!(
            first_page = pages[0],
            pages = pages.len(),
            bytes = payload.len(),
            "wrote overflow chain"
        );
        Ok(pages[0])
    }

    /// Reads exactly `total_size` bytes from the chain at `first_page`.
    pub fn read_overflow_chain(&self, first_page: u32, total_size: usize) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(total_size);
        self.read_overflow_into(first_page, total_size, &mut out)?;
        Ok(out)
    }

    /// Appends exactly `total_size` chain bytes to `out`.
    pub fn read_overflow_into(
        &self,
        first_page: u32,
        total_size: usize,
        out: &mut Vec<u8>,
    ) -> Result<()> {
        let cap = self.chain_cap();
        let chunk = self.chunk_size();
        let mut remaining = total_size;
        let mut current = first_page;
        let mut visited = 0usize;

        while remaining > 0 {
            if current == 0 {
                bail!(StorageError::Corrupt(format!(
                    "overflow chain starting at page {} ended with {} of {} bytes missing",
                    first_page, remaining, total_size
                )));
            }
            visited += 1;
            if visited > cap {
                bail!(self.too_long(first_page));
            }

            let page = self.pager.read_page(current)?;
            let take = remaining.min(chunk);
            out.extend_from_slice(&page.data()[OVERFLOW_HEADER_SIZE..OVERFLOW_HEADER_SIZE + take]);
            remaining -= take;
            current = page.read_u32(0);
        }
        Ok(())
    }

    /// Returns every page of the chain to the page manager.
    pub fn free_overflow_chain(&self, first_page: u32) -> Result<usize> {
        let pages = self.chain_pages(first_page)?;
        for &page_no in &pages {
            self.pager.free_page(page_no)?;
        }

        trace!(first_page, pages = pages.len(), "freed overflow chain");
        Ok(pages.len())
    }

    pub fn overflow_chain_length(&self, first_page: u32) -> Result<usize> {
        Ok(self.chain_pages(first_page)?.len())
    }

    fn chain_pages(&self, first_page: u32) -> Result<Vec<u32>> {
        let cap = self.chain_cap();
        let mut pages = Vec::new();
        let mut current = first_page;

        while current != 0 {
            if pages.len() >= cap {
                bail!(self.too_long(first_page));
            }
            pages.push(current);
            current = self.pager.read_page(current)?.read_u32(0);
        }
        Ok(pages)
    }
}
