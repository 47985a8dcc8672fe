//! Ordered traversal over a B-tree.
//!
//! The cursor keeps the descent path as a stack of `(interior page, child
//! slot)` pairs plus a copy of the current leaf. When the leaf is exhausted,
//! `next` pops levels until one still has a child to the right, steps into
//! that slot and re-descends along leftmost children.

use eyre::Result;

use super::key::Key;
use super::node::{cell_key, cell_payload, child_at, lower_bound};
use super::tree::{BTree, PathStack};
use crate::storage::Page;

pub struct BTreeCursor<'t> {
    tree: &'t BTree<'t>,
    stack: PathStack,
    leaf: Option<Page>,
    index: usize,
}

impl<'t> BTreeCursor<'t> {
    pub(crate) fn new(tree: &'t BTree<'t>) -> Self {
        Self {
            tree,
            stack: PathStack::new(),
            leaf: None,
            index: 0,
        }
    }

    pub fn valid(&self) -> bool {
        self.leaf
            .as_ref()
            .is_some_and(|leaf| self.index < leaf.cell_count())
    }

    fn reset(&mut self) {
        self.stack.clear();
        self.leaf = None;
        self.index = 0;
    }

    /// Positions on the smallest key. Returns `false` for an empty tree.
    pub fn first(&mut self) -> Result<bool> {
        self.reset();
        let root = self.tree.root_page();
        if root == 0 {
            return Ok(false);
        }

        self.leaf = Some(self.tree.descend_leftmost(root, &mut self.stack)?);
        self.settle()
    }

    /// Advances to the next key in order. Returns `false` once past the end.
    pub fn next(&mut self) -> Result<bool> {
        if !self.valid() {
            return Ok(false);
        }
        self.index += 1;
        self.settle()
    }

    /// Positions on the first key `>= key`. Returns whether that key is an
    /// exact match.
    pub fn seek(&mut self, key: &Key) -> Result<bool> {
        self.tree.check_key(key)?;
        self.reset();
        if self.tree.root_page() == 0 {
            return Ok(false);
        }

        let leaf = self.tree.descend(key, &mut self.stack)?;
        let (index, found) = lower_bound(self.tree.pager(), &leaf, key)?;
        self.leaf = Some(leaf);
        self.index = index;
        Ok(self.settle()? && found)
    }

    pub fn key(&self) -> Result<Option<Key>> {
        match self.current() {
            Some((leaf, index)) => {
                let cell = leaf.cell(index, self.tree.pager().usable_size())?;
                Ok(Some(cell_key(self.tree.pager(), &cell)?))
            }
            None => Ok(None),
        }
    }

    /// Payload of the current entry; for an index tree, the key bytes.
    pub fn value(&self) -> Result<Option<Vec<u8>>> {
        match self.current() {
            Some((leaf, index)) => {
                let cell = leaf.cell(index, self.tree.pager().usable_size())?;
                Ok(Some(cell_payload(self.tree.pager(), &cell)?))
            }
            None => Ok(None),
        }
    }

    fn current(&self) -> Option<(&Page, usize)> {
        if self.valid() {
            self.leaf.as_ref().map(|leaf| (leaf, self.index))
        } else {
            None
        }
    }

    /// Moves past exhausted (or empty) leaves until a cell is under the
    /// cursor or the tree is done.
    fn settle(&mut self) -> Result<bool> {
        while !self.valid() {
            if !self.next_leaf()? {
                self.leaf = None;
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn next_leaf(&mut self) -> Result<bool> {
        let pager = self.tree.pager();
        while let Some((page_no, slot)) = self.stack.pop() {
            let page = pager.read_page(page_no)?;
            if slot < page.cell_count() {
                self.stack.push((page_no, slot + 1));
                let child = child_at(&page, slot + 1, pager.usable_size())?;
                self.leaf = Some(self.tree.descend_leftmost(child, &mut self.stack)?);
                self.index = 0;
                return Ok(true);
            }
        }
        Ok(false)
    }
}
