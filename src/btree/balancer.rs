//! # Page Balancer
//!
//! Keeps B-tree leaves inside their fill band. Classification reads only the
//! page header (cell count and content start), so the check on the insert
//! path is O(1):
//!
//! ```text
//! used = header + 2 * cell_count + (page_size - content_start)
//!
//! overfull:  used > 90% of page_size   -> split
//! underfull: used < 33% of page_size   -> merge or redistribute
//! ```
//!
//! ## Operations
//!
//! - `split_leaf_page` moves the upper half of the cells to a new right
//!   sibling and returns the right page's first key as the divider.
//! - `redistribute_cells` evens out the cell counts of two siblings.
//! - `merge_pages` folds the right sibling into the left when the combined
//!   content fits, and frees the right page.
//!
//! The balancer never touches parent pages; updating dividers is the tree's
//! job.

use std::cmp::Ordering;

use eyre::{bail, ensure, Result};
use tracing::debug;

use super::key::Key;
use super::node::{collect_cells, key_at, write_cells};
use crate::config::{CELL_POINTER_SIZE, MERGE_RESERVED_BYTES, OVERFULL_PERCENT, UNDERFULL_PERCENT};
use crate::error::StorageError;
use crate::storage::{Page, PageManager};

/// Byte-lexicographic key order; a strict prefix sorts first.
pub fn compare_keys(a: &[u8], b: &[u8]) -> Ordering {
    a.cmp(b)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveDirection {
    /// Move the last cells of the source to the front of the destination.
    LeftToRight,
    /// Move the first cells of the source to the end of the destination.
    RightToLeft,
}

pub struct PageBalancer<'a> {
    pager: &'a PageManager,
}

impl<'a> PageBalancer<'a> {
    pub fn new(pager: &'a PageManager) -> Self {
        Self { pager }
    }

    pub fn page_fill(&self, page: &Page) -> usize {
        page.used_bytes()
    }

    pub fn is_page_overfull(&self, page: &Page) -> bool {
        page.used_bytes() * 100 > page.size() * OVERFULL_PERCENT
    }

    pub fn is_page_underfull(&self, page: &Page) -> bool {
        page.used_bytes() * 100 < page.size() * UNDERFULL_PERCENT
    }

    fn read_leaf(&self, page_no: u32) -> Result<Page> {
        let page = self.pager.read_page(page_no)?;
        ensure!(
            page.kind().is_leaf(),
            "page {} is not a B-tree leaf ({:?})",
            page_no,
            page.kind()
        );
        Ok(page)
    }

    fn read_siblings(&self, left_no: u32, right_no: u32) -> Result<(Page, Page)> {
        let left = self.read_leaf(left_no)?;
        let right = self.read_leaf(right_no)?;
        ensure!(
            left.kind() == right.kind(),
            "pages {} and {} are different leaf kinds",
            left_no,
            right_no
        );
        Ok((left, right))
    }

    /// Moves the upper half of a leaf's cells to a new right sibling.
    /// Returns the new page and the divider for the parent.
    pub fn split_leaf_page(&self, page_no: u32) -> Result<(u32, Key)> {
        let usable = self.pager.usable_size();
        let mut left = self.read_leaf(page_no)?;
        let count = left.cell_count();
        ensure!(
            count >= 2,
            "cannot split page {} holding {} cells",
            page_no,
            count
        );

        let cells = collect_cells(&left, usable)?;
        let mid = count / 2;

        let kind = left.kind();
        let right_no = self.pager.allocate_page()?;
        let mut right = Page::zeroed(right_no, self.pager.page_size());
        write_cells(&mut right, kind, &cells[mid..], None, usable)?;
        write_cells(&mut left, kind, &cells[..mid], None, usable)?;

        let divider = key_at(self.pager, &right, 0)?;
        self.pager.write_page(&mut right)?;
        self.pager.write_page(&mut left)?;

        debug!(
            left = page_no,
            right = right_no,
            left_cells = mid,
            right_cells = count - mid,
            "split leaf page"
        );
        Ok((right_no, divider))
    }

    /// Evens out the cell counts of two leaf siblings. Returns the number of
    /// cells moved.
    pub fn redistribute_cells(&self, left_no: u32, right_no: u32) -> Result<usize> {
        let (mut left, mut right) = self.read_siblings(left_no, right_no)?;
        let (l, r) = (left.cell_count(), right.cell_count());
        let moved = l.abs_diff(r) / 2;
        if moved == 0 {
            return Ok(0);
        }

        if l > r {
            self.move_cells(&mut left, &mut right, moved, MoveDirection::LeftToRight)?;
        } else {
            self.move_cells(&mut right, &mut left, moved, MoveDirection::RightToLeft)?;
        }

        self.pager.write_page(&mut left)?;
        self.pager.write_page(&mut right)?;
        debug!(left = left_no, right = right_no, moved, "redistributed cells");
        Ok(moved)
    }

    /// Folds `right_no` into `left_no` when everything fits on one page.
    /// Returns `false`, leaving both pages untouched, when it does not.
    pub fn merge_pages(&self, left_no: u32, right_no: u32) -> Result<bool> {
        let usable = self.pager.usable_size();
        let (mut left, right) = self.read_siblings(left_no, right_no)?;

        let combined = left.header_size()
            + CELL_POINTER_SIZE * (left.cell_count() + right.cell_count())
            + left.content_bytes()
            + right.content_bytes();
        if combined > self.pager.page_size() - MERGE_RESERVED_BYTES || combined > usable {
            return Ok(false);
        }

        let mut cells = collect_cells(&left, usable)?;
        cells.extend(collect_cells(&right, usable)?);
        let kind = left.kind();
        write_cells(&mut left, kind, &cells, None, usable)?;
        self.pager.write_page(&mut left)?;
        self.pager.free_page(right_no)?;

        debug!(left = left_no, right = right_no, cells = cells.len(), "merged pages");
        Ok(true)
    }

    /// Relocates `count` whole cells from `src` to `dst`. Both pages are
    /// validated before either is modified.
    pub fn move_cells(
        &self,
        src: &mut Page,
        dst: &mut Page,
        count: usize,
        direction: MoveDirection,
    ) -> Result<()> {
        let usable = self.pager.usable_size();
        ensure!(
            src.kind() == dst.kind() && src.kind().is_btree(),
            "cannot move cells from {:?} page {} to {:?} page {}",
            src.kind(),
            src.number(),
            dst.kind(),
            dst.number()
        );

        let available = src.cell_count();
        if count > available {
            bail!(StorageError::CellCount {
                requested: count,
                available,
            });
        }

        let range = match direction {
            MoveDirection::LeftToRight => available - count..available,
            MoveDirection::RightToLeft => 0..count,
        };
        let mut moving = Vec::with_capacity(count);
        for i in range.clone() {
            moving.push(src.cell_bytes(i, usable)?.to_vec());
        }

        let needed: usize = moving.iter().map(|c| c.len() + CELL_POINTER_SIZE).sum();
        let free = dst.free_space();
        if needed > free {
            bail!(StorageError::PageFull {
                page_no: dst.number(),
                needed,
                available: free,
            });
        }

        let at = match direction {
            MoveDirection::LeftToRight => 0,
            MoveDirection::RightToLeft => dst.cell_count(),
        };
        for (i, cell) in moving.iter().enumerate() {
            dst.insert_cell(at + i, cell)?;
        }
        for i in range.rev() {
            src.delete_cell(i, usable)?;
        }
        Ok(())
    }
}
