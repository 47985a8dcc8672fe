//! # B-Tree
//!
//! Table trees (rowid keys, payload values) and index trees (byte keys, no
//! values) over the slotted pages of the page manager.
//!
//! ## Descent
//!
//! Each interior cell's left child holds keys strictly below the cell key;
//! keys greater than or equal to the last cell key live under the rightmost
//! child. A search binary-searches each interior page for the first cell key
//! greater than the search key and follows that slot.
//!
//! ## Node Splitting
//!
//! ```text
//! leaf split (count based):        interior split (promote middle):
//!
//!   [1 2 3 4 5 6]                     [10 20 30 40 50]
//!        │                                  │
//!   [1 2 3] [4 5 6]  divider 4         [10 20] 30 [40 50]
//!   (4 stays in the right leaf)        (30 moves up, leaves both halves)
//! ```
//!
//! An insert lands in the leaf first. A leaf that crosses the overfull mark
//! is split by the balancer. A cell that does not physically fit splits the
//! leaf at the insertion point instead, into as many pages as the bytes need
//! (at most three). The resulting `(divider, page)` pairs are pushed into the
//! parent; a parent that overflows splits in turn, and a split that passes
//! the root grows the tree by one level under a brand-new root page.
//!
//! ## Deletion
//!
//! Removing a cell may leave its leaf underfull. The leaf is then merged with
//! a sibling under the same parent, or cells are redistributed and the
//! parent's divider rewritten. An interior root left with no cells collapses
//! onto its only child.
//!
//! ## Memory Efficiency
//!
//! Split paths stage cells in a per-operation `bumpalo` arena. Cell encoding
//! on the hot path goes through the tree's `CellBufferPool`, so steady-state
//! inserts do not allocate for the cell buffer. The descent path lives in a
//! `SmallVec` sized to `MAX_TREE_DEPTH`.
//!
//! ## Thread Safety
//!
//! The tree does no locking of its own. Mutations must be serialised by the
//! caller's transaction lock.

use bumpalo::collections::Vec as BumpVec;
use bumpalo::Bump;
use eyre::{bail, ensure, Result};
use smallvec::SmallVec;
use tracing::{debug, instrument, Level};

use super::balancer::PageBalancer;
use super::cursor::BTreeCursor;
use super::key::Key;
use super::node::{
    cell_key, cell_payload, cells_fit, child_at, free_cell_overflow, key_at, left_child_of,
    lower_bound, set_left_child, upper_bound, write_cells,
};
use crate::config::{CELL_POINTER_SIZE, DEFAULT_CELL_POOL_SIZE, MAX_TREE_DEPTH};
use crate::encoding::{
    calculate_local_payload_size, decode_cell, encode_index_interior_cell,
    encode_index_leaf_cell, encode_table_interior_cell, encode_table_leaf_cell,
    IndexInteriorCell, IndexLeafCell, TableInteriorCell, TableLeafCell,
};
use crate::error::StorageError;
use crate::memory::CellBufferPool;
use crate::storage::{OverflowManager, Page, PageKind, PageManager};

/// `(interior page, child slot taken)` from the root down to a leaf's parent.
pub(crate) type PathStack = SmallVec<[(u32, usize); MAX_TREE_DEPTH]>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TreeKind {
    Table,
    Index,
}

pub struct BTree<'a> {
    pager: &'a PageManager,
    root: u32,
    kind: TreeKind,
    pool: CellBufferPool,
}

impl<'a> BTree<'a> {
    /// An empty tree; the root leaf is allocated by the first insert.
    pub fn new(pager: &'a PageManager, kind: TreeKind) -> Self {
        Self {
            pager,
            root: 0,
            kind,
            pool: CellBufferPool::new(DEFAULT_CELL_POOL_SIZE),
        }
    }

    /// A tree with its root leaf allocated up front.
    pub fn create(pager: &'a PageManager, kind: TreeKind) -> Result<Self> {
        let mut tree = Self::new(pager, kind);
        tree.root = tree.new_root_leaf()?;
        Ok(tree)
    }

    /// Opens an existing tree rooted at `root` (0 for an empty tree).
    pub fn open(pager: &'a PageManager, root: u32, kind: TreeKind) -> Result<Self> {
        let tree = Self {
            root,
            ..Self::new(pager, kind)
        };
        if root != 0 {
            tree.check_page(&pager.read_page(root)?)?;
        }
        Ok(tree)
    }

    /// Shares an existing buffer pool instead of the tree's own.
    pub fn with_pool(mut self, pool: CellBufferPool) -> Self {
        self.pool = pool;
        self
    }

    pub fn root_page(&self) -> u32 {
        self.root
    }

    pub fn kind(&self) -> TreeKind {
        self.kind
    }

    pub fn is_table(&self) -> bool {
        self.kind == TreeKind::Table
    }

    pub fn pager(&self) -> &'a PageManager {
        self.pager
    }

    /// Levels from the root to the leaves; 0 for an empty tree.
    pub fn depth(&self) -> Result<usize> {
        if self.root == 0 {
            return Ok(0);
        }
        let mut path = PathStack::new();
        self.descend_leftmost(self.root, &mut path)?;
        Ok(path.len() + 1)
    }

    pub fn new_cursor(&self) -> BTreeCursor<'_> {
        BTreeCursor::new(self)
    }

    /// Returns the payload stored under `key` (for an index tree, the key
    /// itself), or `None` when the key is absent.
    pub fn search(&self, key: &Key) -> Result<Option<Vec<u8>>> {
        self.check_key(key)?;
        if self.root == 0 {
            return Ok(None);
        }

        let usable = self.pager.usable_size();
        let leaf = self.descend(key, &mut PathStack::new())?;
        let (index, found) = lower_bound(self.pager, &leaf, key)?;
        if !found {
            return Ok(None);
        }
        let cell = leaf.cell(index, usable)?;
        Ok(Some(cell_payload(self.pager, &cell)?))
    }

    /// Inserts `key`, replacing any existing entry with the same key.
    #[instrument(skip_all, level = Level::DEBUG, fields(root = self.root))]
    pub fn insert(&mut self, key: &Key, value: &[u8]) -> Result<()> {
        self.check_key(key)?;
        ensure!(
            self.is_table() || value.is_empty(),
            "index trees store keys only, got a {} byte value",
            value.len()
        );

        if self.root == 0 {
            self.root = self.new_root_leaf()?;
        }

        let usable = self.pager.usable_size();
        let mut cell = self.pool.acquire();
        self.encode_leaf_cell(key, value, &mut cell)?;

        let mut path = PathStack::new();
        let mut leaf = self.descend(key, &mut path)?;
        let (index, found) = lower_bound(self.pager, &leaf, key)?;
        if found {
            free_cell_overflow(self.pager, &leaf.cell(index, usable)?)?;
            leaf.delete_cell(index, usable)?;
        }

        if cell.len() + CELL_POINTER_SIZE <= leaf.free_space() {
            leaf.insert_cell(index, &cell)?;
            self.pager.write_page(&mut leaf)?;

            let balancer = PageBalancer::new(self.pager);
            if balancer.is_page_overfull(&leaf) && leaf.cell_count() >= 2 {
                let (right, divider) = balancer.split_leaf_page(leaf.number())?;
                self.propagate_split(&mut path, leaf.number(), vec![(divider, right)])?;
            }
            return Ok(());
        }

        let arena = Bump::new();
        let mut cells: BumpVec<&[u8]> = BumpVec::with_capacity_in(leaf.cell_count() + 1, &arena);
        for i in 0..leaf.cell_count() {
            cells.push(arena.alloc_slice_copy(leaf.cell_bytes(i, usable)?));
        }
        cells.insert(index, arena.alloc_slice_copy(cell.as_slice()));

        self.split_leaf(leaf, &cells, &mut path)
    }

    /// Removes `key`. Returns whether it was present.
    #[instrument(skip_all, level = Level::DEBUG, fields(root = self.root))]
    pub fn delete(&mut self, key: &Key) -> Result<bool> {
        self.check_key(key)?;
        if self.root == 0 {
            return Ok(false);
        }

        let usable = self.pager.usable_size();
        let mut path = PathStack::new();
        let mut leaf = self.descend(key, &mut path)?;
        let (index, found) = lower_bound(self.pager, &leaf, key)?;
        if !found {
            return Ok(false);
        }

        free_cell_overflow(self.pager, &leaf.cell(index, usable)?)?;
        leaf.delete_cell(index, usable)?;
        self.pager.write_page(&mut leaf)?;

        if PageBalancer::new(self.pager).is_page_underfull(&leaf) {
            self.rebalance_leaf(&mut path)?;
        }
        Ok(true)
    }

    pub(crate) fn check_key(&self, key: &Key) -> Result<()> {
        ensure!(
            key.is_rowid() == self.is_table(),
            "{:?} tree cannot take key {:?}",
            self.kind,
            key
        );
        Ok(())
    }

    fn check_page(&self, page: &Page) -> Result<()> {
        let kind = page.kind();
        if !kind.is_btree() || kind.is_table() != self.is_table() {
            bail!(StorageError::Corrupt(format!(
                "page {} is {:?}, expected a {:?} tree page",
                page.number(),
                kind,
                self.kind
            )));
        }
        Ok(())
    }

    /// Walks from the root to the leaf that owns `key`.
    pub(crate) fn descend(&self, key: &Key, path: &mut PathStack) -> Result<Page> {
        let usable = self.pager.usable_size();
        let mut page_no = self.root;
        loop {
            let page = self.pager.read_page(page_no)?;
            self.check_page(&page)?;
            if page.kind().is_leaf() {
                return Ok(page);
            }
            self.check_depth(path)?;

            let slot = upper_bound(self.pager, &page, key)?;
            path.push((page_no, slot));
            page_no = child_at(&page, slot, usable)?;
        }
    }

    /// Walks leftmost children from `page_no` down to a leaf.
    pub(crate) fn descend_leftmost(&self, mut page_no: u32, path: &mut PathStack) -> Result<Page> {
        let usable = self.pager.usable_size();
        loop {
            let page = self.pager.read_page(page_no)?;
            self.check_page(&page)?;
            if page.kind().is_leaf() {
                return Ok(page);
            }
            self.check_depth(path)?;

            path.push((page_no, 0));
            page_no = child_at(&page, 0, usable)?;
        }
    }

    fn check_depth(&self, path: &PathStack) -> Result<()> {
        if path.len() >= MAX_TREE_DEPTH {
            bail!(StorageError::Corrupt(format!(
                "tree rooted at page {} is deeper than {} levels",
                self.root, MAX_TREE_DEPTH
            )));
        }
        Ok(())
    }

    fn leaf_kind(&self) -> PageKind {
        PageKind::leaf(self.is_table())
    }

    fn interior_kind(&self) -> PageKind {
        PageKind::interior(self.is_table())
    }

    fn new_root_leaf(&self) -> Result<u32> {
        let page_no = self.pager.allocate_page()?;
        let mut page = Page::zeroed(page_no, self.pager.page_size());
        page.init_btree(self.leaf_kind(), self.pager.usable_size())?;
        self.pager.write_page(&mut page)?;
        debug!(root = page_no, kind = ?self.kind, "created root leaf");
        Ok(page_no)
    }

    fn spill(&self, rest: &[u8]) -> Result<Option<u32>> {
        if rest.is_empty() {
            Ok(None)
        } else {
            Ok(Some(OverflowManager::new(self.pager).write_overflow_chain(rest)?))
        }
    }

    fn encode_leaf_cell(&self, key: &Key, value: &[u8], out: &mut Vec<u8>) -> Result<()> {
        let usable = self.pager.usable_size();
        match key {
            Key::RowId(rowid) => {
                let local = calculate_local_payload_size(usable, value.len(), true);
                let overflow_page = self.spill(&value[local..])?;
                let cell = TableLeafCell {
                    rowid: *rowid,
                    payload_size: value.len() as u64,
                    local: &value[..local],
                    overflow_page,
                };
                encode_table_leaf_cell(&cell, usable, out)?;
            }
            Key::Bytes(bytes) => {
                let local = calculate_local_payload_size(usable, bytes.len(), true);
                let overflow_page = self.spill(&bytes[local..])?;
                let cell = IndexLeafCell {
                    payload_size: bytes.len() as u64,
                    local: &bytes[..local],
                    overflow_page,
                };
                encode_index_leaf_cell(&cell, usable, out)?;
            }
        }
        Ok(())
    }

    fn encode_interior_cell(&self, left_child: u32, key: &Key, out: &mut Vec<u8>) -> Result<()> {
        let usable = self.pager.usable_size();
        match key {
            Key::RowId(rowid) => {
                let cell = TableInteriorCell {
                    left_child,
                    rowid: *rowid,
                };
                encode_table_interior_cell(&cell, out);
            }
            Key::Bytes(bytes) => {
                let local = calculate_local_payload_size(usable, bytes.len(), false);
                let overflow_page = self.spill(&bytes[local..])?;
                let cell = IndexInteriorCell {
                    left_child,
                    payload_size: bytes.len() as u64,
                    local: &bytes[..local],
                    overflow_page,
                };
                encode_index_interior_cell(&cell, usable, out)?;
            }
        }
        Ok(())
    }

    /// Key of an interior cell being promoted out of its page. The cell is
    /// discarded, so its overflow chain is released here.
    fn take_promoted_key(&self, cell: &[u8]) -> Result<Key> {
        let usable = self.pager.usable_size();
        let kind = self.interior_kind().cell_kind();
        let Some(kind) = kind else {
            bail!("{:?} pages carry no cells", self.interior_kind());
        };
        let (decoded, _) = decode_cell(kind, cell, usable)?;
        let key = cell_key(self.pager, &decoded)?;
        free_cell_overflow(self.pager, &decoded)?;
        Ok(key)
    }

    /// Spreads `cells` (the leaf's cells plus the one being inserted) over
    /// the leaf and as many new right siblings as the bytes require.
    fn split_leaf(&mut self, mut leaf: Page, cells: &[&[u8]], path: &mut PathStack) -> Result<()> {
        let usable = self.pager.usable_size();
        let kind = leaf.kind();
        let cuts = plan_split(cells, usable - kind.header_size(), false);

        let mut pending = Vec::with_capacity(cuts.len());
        for (g, &start) in cuts.iter().enumerate() {
            let end = cuts.get(g + 1).copied().unwrap_or(cells.len());
            let page_no = self.pager.allocate_page()?;
            let mut page = Page::zeroed(page_no, self.pager.page_size());
            write_cells(&mut page, kind, &cells[start..end], None, usable)?;
            let divider = key_at(self.pager, &page, 0)?;
            self.pager.write_page(&mut page)?;
            pending.push((divider, page_no));
        }

        let first_end = cuts.first().copied().unwrap_or(cells.len());
        write_cells(&mut leaf, kind, &cells[..first_end], None, usable)?;
        self.pager.write_page(&mut leaf)?;

        debug!(
            page = leaf.number(),
            pages = cuts.len() + 1,
            "split leaf at insertion point"
        );
        self.propagate_split(path, leaf.number(), pending)
    }

    /// Writes an interior page's full cell list, splitting it when the cells
    /// no longer fit. The middle cell of each split is promoted.
    fn store_interior(
        &mut self,
        mut page: Page,
        cells: &[&[u8]],
        rightmost: u32,
        path: &mut PathStack,
    ) -> Result<()> {
        let usable = self.pager.usable_size();
        let kind = self.interior_kind();
        if cells_fit(kind, cells, usable) {
            write_cells(&mut page, kind, cells, Some(rightmost), usable)?;
            return self.pager.write_page(&mut page);
        }

        let promoted = plan_split(cells, usable - kind.header_size(), true);
        let mut pending = Vec::with_capacity(promoted.len());
        for (g, &at) in promoted.iter().enumerate() {
            let (end, right_child) = match promoted.get(g + 1) {
                Some(&next) => (next, left_child_of(cells[next])?),
                None => (cells.len(), rightmost),
            };
            let page_no = self.pager.allocate_page()?;
            let mut sibling = Page::zeroed(page_no, self.pager.page_size());
            write_cells(&mut sibling, kind, &cells[at + 1..end], Some(right_child), usable)?;
            self.pager.write_page(&mut sibling)?;
            pending.push((self.take_promoted_key(cells[at])?, page_no));
        }

        let Some(&first) = promoted.first() else {
            bail!("interior page {} cannot be split", page.number());
        };
        write_cells(&mut page, kind, &cells[..first], Some(left_child_of(cells[first])?), usable)?;
        self.pager.write_page(&mut page)?;

        debug!(
            page = page.number(),
            pages = promoted.len() + 1,
            "split interior page"
        );
        self.propagate_split(path, page.number(), pending)
    }

    /// Inserts the dividers produced by splitting `child` into its parent.
    /// `pending` holds `(divider, new page)` pairs in key order; the parent
    /// slot that pointed at `child` ends up pointing at the last new page.
    fn propagate_split(
        &mut self,
        path: &mut PathStack,
        child: u32,
        pending: Vec<(Key, u32)>,
    ) -> Result<()> {
        if pending.is_empty() {
            return Ok(());
        }
        let Some((parent_no, slot)) = path.pop() else {
            return self.create_new_root(child, pending);
        };

        let usable = self.pager.usable_size();
        let parent = self.pager.read_page(parent_no)?;
        let count = parent.cell_count();
        let Some(mut rightmost) = parent.rightmost_child() else {
            bail!(StorageError::Corrupt(format!(
                "parent page {} of page {} is not an interior page",
                parent_no, child
            )));
        };

        let arena = Bump::new();
        let mut cells: BumpVec<&[u8]> = BumpVec::with_capacity_in(count + pending.len(), &arena);
        for i in 0..count {
            cells.push(arena.alloc_slice_copy(parent.cell_bytes(i, usable)?));
        }

        let mut left = child;
        for (j, (divider, page_no)) in pending.iter().enumerate() {
            let mut buf = self.pool.acquire();
            self.encode_interior_cell(left, divider, &mut buf)?;
            cells.insert(slot + j, arena.alloc_slice_copy(buf.as_slice()));
            left = *page_no;
        }

        if slot < count {
            let at = slot + pending.len();
            let patched = arena.alloc_slice_copy(cells[at]);
            set_left_child(patched, left);
            cells[at] = &*patched;
        } else {
            rightmost = left;
        }

        self.store_interior(parent, &cells, rightmost, path)
    }

    /// Grows the tree by one level above `child`.
    fn create_new_root(&mut self, child: u32, pending: Vec<(Key, u32)>) -> Result<()> {
        let root_no = self.pager.allocate_page()?;
        let root = Page::zeroed(root_no, self.pager.page_size());

        let mut cells = Vec::with_capacity(pending.len());
        let mut left = child;
        for (divider, page_no) in &pending {
            let mut buf = Vec::new();
            self.encode_interior_cell(left, divider, &mut buf)?;
            cells.push(buf);
            left = *page_no;
        }
        let refs: Vec<&[u8]> = cells.iter().map(Vec::as_slice).collect();

        debug!(old_root = self.root, new_root = root_no, "created new root");
        self.root = root_no;
        self.store_interior(root, &refs, left, &mut PathStack::new())
    }

    /// Merges or rebalances the underfull leaf at the end of `path`.
    fn rebalance_leaf(&mut self, path: &mut PathStack) -> Result<()> {
        let Some((parent_no, slot)) = path.pop() else {
            return Ok(());
        };
        let usable = self.pager.usable_size();
        let parent = self.pager.read_page(parent_no)?;
        let count = parent.cell_count();
        if count == 0 {
            return Ok(());
        }

        let divider = slot.min(count - 1);
        let left = child_at(&parent, divider, usable)?;
        let right = child_at(&parent, divider + 1, usable)?;

        let balancer = PageBalancer::new(self.pager);
        if balancer.merge_pages(left, right)? {
            self.remove_divider(parent, divider, left)
        } else if balancer.redistribute_cells(left, right)? > 0 {
            let first = key_at(self.pager, &self.pager.read_page(right)?, 0)?;
            self.replace_divider(parent, divider, &first, path)
        } else {
            Ok(())
        }
    }

    /// Drops divider `index` after its right child was merged into `left`.
    fn remove_divider(&mut self, mut parent: Page, index: usize, left: u32) -> Result<()> {
        let usable = self.pager.usable_size();
        free_cell_overflow(self.pager, &parent.cell(index, usable)?)?;
        parent.delete_cell(index, usable)?;

        if index < parent.cell_count() {
            let offset = parent.cell_pointer(index);
            parent.write_u32(offset, left);
        } else {
            parent.set_rightmost_child(left)?;
        }
        self.pager.write_page(&mut parent)?;

        if parent.number() == self.root && parent.cell_count() == 0 {
            let old_root = self.root;
            self.root = left;
            self.pager.free_page(old_root)?;
            debug!(old_root, new_root = left, "collapsed root");
        }
        Ok(())
    }

    /// Rewrites divider `index` to `key`, keeping its left child.
    fn replace_divider(
        &mut self,
        parent: Page,
        index: usize,
        key: &Key,
        path: &mut PathStack,
    ) -> Result<()> {
        let usable = self.pager.usable_size();
        let Some(rightmost) = parent.rightmost_child() else {
            bail!(StorageError::Corrupt(format!(
                "page {} is not an interior page",
                parent.number()
            )));
        };

        let arena = Bump::new();
        let mut cells: BumpVec<&[u8]> = BumpVec::with_capacity_in(parent.cell_count(), &arena);
        for i in 0..parent.cell_count() {
            cells.push(arena.alloc_slice_copy(parent.cell_bytes(i, usable)?));
        }

        let old = parent.cell(index, usable)?;
        let left_child = left_child_of(cells[index])?;
        free_cell_overflow(self.pager, &old)?;

        let mut buf = self.pool.acquire();
        self.encode_interior_cell(left_child, key, &mut buf)?;
        cells[index] = &*arena.alloc_slice_copy(buf.as_slice());

        self.store_interior(parent, &cells, rightmost, path)
    }
}

impl std::fmt::Debug for BTree<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BTree")
            .field("root", &self.root)
            .field("kind", &self.kind)
            .finish()
    }
}

/// Chooses where to cut an ordered cell list so every piece fits in
/// `capacity` bytes. With `promote`, each cut index names a cell that moves
/// up to the parent and belongs to neither side. A balanced two-way cut is
/// preferred; otherwise pieces are packed greedily.
fn plan_split(cells: &[&[u8]], capacity: usize, promote: bool) -> Vec<usize> {
    let sizes: Vec<usize> = cells.iter().map(|c| c.len() + CELL_POINTER_SIZE).collect();
    let total: usize = sizes.iter().sum();
    let skip = usize::from(promote);

    let mut best: Option<(usize, usize)> = None;
    let mut left = 0usize;
    for cut in 1..sizes.len().saturating_sub(skip) {
        left += sizes[cut - 1];
        let right = total - left - if promote { sizes[cut] } else { 0 };
        if left <= capacity && right <= capacity {
            let imbalance = left.abs_diff(right);
            if best.map_or(true, |(_, b)| imbalance < b) {
                best = Some((cut, imbalance));
            }
        }
    }
    if let Some((cut, _)) = best {
        return vec![cut];
    }

    let mut cuts = Vec::new();
    let mut used = 0usize;
    let mut i = 0;
    while i < sizes.len() {
        if used > 0 && used + sizes[i] > capacity {
            cuts.push(i);
            used = 0;
            if promote {
                i += 1;
                continue;
            }
        }
        used += sizes[i];
        i += 1;
    }
    cuts
}
