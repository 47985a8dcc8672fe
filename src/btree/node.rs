//! Cell-level helpers shared by the tree, the cursor and the balancer.
//!
//! Keys and payloads may continue on overflow pages, so anything that needs
//! the full key of a cell goes through the pager here rather than reading the
//! local slice directly.

use std::cmp::Ordering;

use eyre::{bail, ensure, Result};

use super::key::Key;
use crate::config::CELL_POINTER_SIZE;
use crate::encoding::Cell;
use crate::error::StorageError;
use crate::storage::{OverflowManager, Page, PageKind, PageManager};

const CHILD_POINTER_SIZE: usize = 4;

/// Full payload of a cell, following its overflow chain if present.
pub(crate) fn cell_payload(pager: &PageManager, cell: &Cell<'_>) -> Result<Vec<u8>> {
    let Some((total, local, overflow)) = cell.payload() else {
        return Ok(Vec::new());
    };

    let total = total as usize;
    let mut out = Vec::with_capacity(total);
    out.extend_from_slice(local);
    if let Some(first) = overflow {
        OverflowManager::new(pager).read_overflow_into(first, total - local.len(), &mut out)?;
    }
    Ok(out)
}

pub(crate) fn cell_key(pager: &PageManager, cell: &Cell<'_>) -> Result<Key> {
    match cell.rowid() {
        Some(rowid) => Ok(Key::RowId(rowid)),
        None => Ok(Key::Bytes(cell_payload(pager, cell)?)),
    }
}

pub(crate) fn key_at(pager: &PageManager, page: &Page, index: usize) -> Result<Key> {
    let cell = page.cell(index, pager.usable_size())?;
    cell_key(pager, &cell)
}

/// Orders `key` against the key of cell `index` without materialising
/// overflow bytes for the common all-local case.
fn compare_at(pager: &PageManager, page: &Page, index: usize, key: &Key) -> Result<Ordering> {
    let cell = page.cell(index, pager.usable_size())?;
    if let (Key::RowId(k), Some(r)) = (key, cell.rowid()) {
        return Ok(k.cmp(&r));
    }
    if let (Key::Bytes(k), Some((total, local, None))) = (key, cell.payload()) {
        if total as usize == local.len() {
            return Ok(super::compare_keys(k, local));
        }
    }
    Ok(key.cmp(&cell_key(pager, &cell)?))
}

/// Index of the first cell whose key is `>= key`, and whether it is equal.
pub(crate) fn lower_bound(pager: &PageManager, page: &Page, key: &Key) -> Result<(usize, bool)> {
    let (mut lo, mut hi) = (0, page.cell_count());
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        match compare_at(pager, page, mid, key)? {
            Ordering::Greater => lo = mid + 1,
            Ordering::Equal => return Ok((mid, true)),
            Ordering::Less => hi = mid,
        }
    }
    Ok((lo, false))
}

/// Index of the first cell whose key is strictly greater than `key`. On an
/// interior page this is the child slot to descend into.
pub(crate) fn upper_bound(pager: &PageManager, page: &Page, key: &Key) -> Result<usize> {
    let (mut lo, mut hi) = (0, page.cell_count());
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        if compare_at(pager, page, mid, key)? == Ordering::Less {
            hi = mid;
        } else {
            lo = mid + 1;
        }
    }
    Ok(lo)
}

/// Child page behind slot `index` of an interior page; slot `cell_count` is
/// the rightmost child.
pub(crate) fn child_at(page: &Page, index: usize, usable_size: usize) -> Result<u32> {
    let child = if index < page.cell_count() {
        page.cell(index, usable_size)?.left_child()
    } else {
        page.rightmost_child()
    };

    match child {
        Some(0) | None => bail!(StorageError::Corrupt(format!(
            "interior page {} has no child at slot {}",
            page.number(),
            index
        ))),
        Some(child) => Ok(child),
    }
}

/// Returns the overflow chain of `cell`, if any, to the free list.
pub(crate) fn free_cell_overflow(pager: &PageManager, cell: &Cell<'_>) -> Result<()> {
    if let Some((_, _, Some(first))) = cell.payload() {
        OverflowManager::new(pager).free_overflow_chain(first)?;
    }
    Ok(())
}

/// Overwrites the left-child pointer leading an interior cell.
pub(crate) fn set_left_child(cell: &mut [u8], child: u32) {
    cell[..CHILD_POINTER_SIZE].copy_from_slice(&child.to_be_bytes());
}

pub(crate) fn left_child_of(cell: &[u8]) -> Result<u32> {
    ensure!(
        cell.len() >= CHILD_POINTER_SIZE,
        StorageError::InvalidCell("interior cell shorter than its child pointer")
    );
    Ok(u32::from_be_bytes([cell[0], cell[1], cell[2], cell[3]]))
}

/// Bytes a set of cells occupies on a page including pointers.
pub(crate) fn cells_footprint<C: AsRef<[u8]>>(cells: &[C]) -> usize {
    cells
        .iter()
        .map(|c| c.as_ref().len() + CELL_POINTER_SIZE)
        .sum()
}

pub(crate) fn cells_fit<C: AsRef<[u8]>>(kind: PageKind, cells: &[C], usable_size: usize) -> bool {
    kind.header_size() + cells_footprint(cells) <= usable_size
}

pub(crate) fn collect_cells(page: &Page, usable_size: usize) -> Result<Vec<Vec<u8>>> {
    (0..page.cell_count())
        .map(|i| Ok(page.cell_bytes(i, usable_size)?.to_vec()))
        .collect()
}

/// Reformats `page` as `kind` and fills it with `cells` in order.
pub(crate) fn write_cells<C: AsRef<[u8]>>(
    page: &mut Page,
    kind: PageKind,
    cells: &[C],
    rightmost: Option<u32>,
    usable_size: usize,
) -> Result<()> {
    page.init_btree(kind, usable_size)?;
    if let Some(child) = rightmost {
        page.set_rightmost_child(child)?;
    }
    for (i, cell) in cells.iter().enumerate() {
        page.insert_cell(i, cell.as_ref())?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::{encode_table_interior_cell, TableInteriorCell};
    use crate::error::storage_error;
    use crate::storage::PagerBuilder;

    fn interior(pager: &PageManager, dividers: &[(u32, i64)], rightmost: u32) -> Page {
        let page_no = pager.allocate_page().unwrap();
        let mut page = Page::zeroed(page_no, pager.page_size());
        let cells: Vec<Vec<u8>> = dividers
            .iter()
            .map(|&(left_child, rowid)| {
                let mut out = Vec::new();
                encode_table_interior_cell(&TableInteriorCell { left_child, rowid }, &mut out);
                out
            })
            .collect();
        write_cells(
            &mut page,
            PageKind::TableInterior,
            &cells,
            Some(rightmost),
            pager.usable_size(),
        )
        .unwrap();
        page
    }

    #[test]
    fn bounds_on_interior_page() {
        let pager = PagerBuilder::new().page_size(512).open_in_memory().unwrap();
        let page = interior(&pager, &[(10, 100), (11, 200), (12, 300)], 13);

        assert_eq!(lower_bound(&pager, &page, &Key::RowId(200)).unwrap(), (1, true));
        assert_eq!(lower_bound(&pager, &page, &Key::RowId(250)).unwrap(), (2, false));
        assert_eq!(upper_bound(&pager, &page, &Key::RowId(200)).unwrap(), 2);
        assert_eq!(upper_bound(&pager, &page, &Key::RowId(5)).unwrap(), 0);
        assert_eq!(upper_bound(&pager, &page, &Key::RowId(999)).unwrap(), 3);

        let usable = pager.usable_size();
        assert_eq!(child_at(&page, 0, usable).unwrap(), 10);
        assert_eq!(child_at(&page, 3, usable).unwrap(), 13);
    }

    #[test]
    fn left_child_patch() {
        let mut cell = Vec::new();
        encode_table_interior_cell(
            &TableInteriorCell {
                left_child: 4,
                rowid: 9,
            },
            &mut cell,
        );
        set_left_child(&mut cell, 77);
        assert_eq!(left_child_of(&cell).unwrap(), 77);
    }

    #[test]
    fn truncated_interior_cell_has_no_left_child() {
        let err = left_child_of(&[0, 0, 7]).unwrap_err();
        assert!(matches!(
            storage_error(&err),
            Some(StorageError::InvalidCell(_))
        ));
    }
}
