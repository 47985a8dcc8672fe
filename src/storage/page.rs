//! # Page Types and B-Tree Page Layout
//!
//! A page is a fixed-size byte buffer plus a kind tag and a dirty flag. It is
//! the unit of I/O: the page manager reads and writes whole pages, and the
//! cache stores page copies.
//!
//! ## Page Kinds
//!
//! B-tree pages carry their type in byte 0:
//!
//! ```text
//! 0x0d  TableLeaf        0x05  TableInterior
//! 0x02  IndexLeaf        0x0a  IndexInterior
//! 0xfe  Freelist         0xfd  PointerMap       0xff  LockByte
//! ```
//!
//! Overflow and freelist trunk pages start with a 4-byte next pointer, so
//! their kind cannot be recovered from byte 0. The kind of a freshly loaded
//! page is taken from the type byte when it names a B-tree page and is
//! `Unformatted` otherwise; the overflow and freelist managers retag the
//! pages they own. Page 1 is always `Header`.
//!
//! ## B-Tree Page Header
//!
//! ```text
//! Offset  Size  Field
//! ------  ----  ------------------------------------------------
//! 0       1     page type
//! 1       2     first freeblock (always 0: pages are kept compact)
//! 3       2     cell count
//! 5       2     content area start (0 means 65536)
//! 7       1     fragmented free bytes
//! 8       4     rightmost child (interior pages only)
//! ```
//!
//! ## Cell Layout
//!
//! ```text
//! +-------------------------+
//! | Header (8 or 12 bytes)  |
//! +-------------------------+
//! | Cell pointers (2 each)  |  <- key order, grows toward the end
//! +-------------------------+
//! | Free space              |
//! +-------------------------+
//! | Cell content            |  <- grows toward the header
//! +-------------------------+
//! ```
//!
//! Deleting a cell compacts the content area immediately, so the free space
//! is always the single gap between the pointer array and `content_start`,
//! and the fill of a page can be read from its header in O(1).

use eyre::{bail, ensure, Result};
use zerocopy::big_endian::U16;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::config::{BTREE_INTERIOR_HEADER_SIZE, BTREE_LEAF_HEADER_SIZE, CELL_POINTER_SIZE};
use crate::encoding::{decode_cell, Cell, CellKind};
use crate::error::StorageError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageKind {
    TableLeaf,
    TableInterior,
    IndexLeaf,
    IndexInterior,
    Freelist,
    Overflow,
    PointerMap,
    LockByte,
    Header,
    Unformatted,
}

impl PageKind {
    pub fn from_type_byte(b: u8) -> Self {
        match b {
            0x0d => PageKind::TableLeaf,
            0x05 => PageKind::TableInterior,
            0x02 => PageKind::IndexLeaf,
            0x0a => PageKind::IndexInterior,
            0xfe => PageKind::Freelist,
            0xfd => PageKind::PointerMap,
            0xff => PageKind::LockByte,
            _ => PageKind::Unformatted,
        }
    }

    pub fn type_byte(self) -> Option<u8> {
        match self {
            PageKind::TableLeaf => Some(0x0d),
            PageKind::TableInterior => Some(0x05),
            PageKind::IndexLeaf => Some(0x02),
            PageKind::IndexInterior => Some(0x0a),
            PageKind::Freelist => Some(0xfe),
            PageKind::PointerMap => Some(0xfd),
            PageKind::LockByte => Some(0xff),
            PageKind::Overflow | PageKind::Header | PageKind::Unformatted => None,
        }
    }

    pub fn is_btree(self) -> bool {
        self.cell_kind().is_some()
    }

    pub fn is_leaf(self) -> bool {
        matches!(self, PageKind::TableLeaf | PageKind::IndexLeaf)
    }

    pub fn is_table(self) -> bool {
        matches!(self, PageKind::TableLeaf | PageKind::TableInterior)
    }

    /// Size of the B-tree page header; 0 for non-B-tree pages.
    pub fn header_size(self) -> usize {
        match self {
            PageKind::TableLeaf | PageKind::IndexLeaf => BTREE_LEAF_HEADER_SIZE,
            PageKind::TableInterior | PageKind::IndexInterior => BTREE_INTERIOR_HEADER_SIZE,
            _ => 0,
        }
    }

    pub fn cell_kind(self) -> Option<CellKind> {
        match self {
            PageKind::TableLeaf => Some(CellKind::TableLeaf),
            PageKind::TableInterior => Some(CellKind::TableInterior),
            PageKind::IndexLeaf => Some(CellKind::IndexLeaf),
            PageKind::IndexInterior => Some(CellKind::IndexInterior),
            _ => None,
        }
    }

    pub fn leaf(is_table: bool) -> Self {
        if is_table {
            PageKind::TableLeaf
        } else {
            PageKind::IndexLeaf
        }
    }

    pub fn interior(is_table: bool) -> Self {
        if is_table {
            PageKind::TableInterior
        } else {
            PageKind::IndexInterior
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct BTreePageHeader {
    page_type: u8,
    first_freeblock: U16,
    cell_count: U16,
    content_start: U16,
    fragmented_bytes: u8,
}

const _: () = assert!(std::mem::size_of::<BTreePageHeader>() == BTREE_LEAF_HEADER_SIZE);

impl BTreePageHeader {
    pub fn from_bytes(data: &[u8]) -> Result<&Self> {
        ensure!(
            data.len() >= size_of::<Self>(),
            "buffer too small for BTreePageHeader: {} < {}",
            data.len(),
            size_of::<Self>()
        );

        Self::ref_from_bytes(&data[..size_of::<Self>()])
            .map_err(|e| eyre::eyre!("failed to read BTreePageHeader: {:?}", e))
    }

    pub fn from_bytes_mut(data: &mut [u8]) -> Result<&mut Self> {
        ensure!(
            data.len() >= size_of::<Self>(),
            "buffer too small for BTreePageHeader: {} < {}",
            data.len(),
            size_of::<Self>()
        );

        Self::mut_from_bytes(&mut data[..size_of::<Self>()])
            .map_err(|e| eyre::eyre!("failed to read BTreePageHeader: {:?}", e))
    }

    pub fn kind(&self) -> PageKind {
        PageKind::from_type_byte(self.page_type)
    }

    /// Start of the cell content area; the stored 0 stands for 65536.
    pub fn content_start(&self) -> usize {
        match self.content_start.get() {
            0 => 65536,
            n => n as usize,
        }
    }

    pub fn set_content_start(&mut self, offset: usize) {
        self.content_start = U16::new(offset as u16);
    }

    be_accessors! {
        first_freeblock: u16,
        cell_count: u16,
        fragmented_bytes: u8,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page {
    number: u32,
    data: Box<[u8]>,
    kind: PageKind,
    dirty: bool,
}

impl Page {
    /// Wraps raw page bytes, inferring the kind from the type byte.
    pub fn from_bytes(number: u32, data: Box<[u8]>) -> Self {
        let kind = if number == 1 {
            PageKind::Header
        } else {
            data.first()
                .map(|&b| PageKind::from_type_byte(b))
                .filter(|k| k.is_btree())
                .unwrap_or(PageKind::Unformatted)
        };

        Self {
            number,
            data,
            kind,
            dirty: false,
        }
    }

    pub fn zeroed(number: u32, page_size: usize) -> Self {
        Self::from_bytes(number, vec![0u8; page_size].into_boxed_slice())
    }

    pub fn number(&self) -> u32 {
        self.number
    }

    pub fn kind(&self) -> PageKind {
        self.kind
    }

    pub fn set_kind(&mut self, kind: PageKind) {
        self.kind = kind;
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub(crate) fn clear_dirty(&mut self) {
        self.dirty = false;
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        self.dirty = true;
        &mut self.data
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn read_u32(&self, offset: usize) -> u32 {
        let b = &self.data[offset..offset + 4];
        u32::from_be_bytes([b[0], b[1], b[2], b[3]])
    }

    pub fn write_u32(&mut self, offset: usize, value: u32) {
        self.data_mut()[offset..offset + 4].copy_from_slice(&value.to_be_bytes());
    }

    fn read_u16(&self, offset: usize) -> usize {
        u16::from_be_bytes([self.data[offset], self.data[offset + 1]]) as usize
    }

    fn write_u16(&mut self, offset: usize, value: usize) {
        self.data_mut()[offset..offset + 2].copy_from_slice(&(value as u16).to_be_bytes());
    }

    /// Zeroes the page and writes an empty B-tree header whose content area
    /// starts at `usable_size`.
    pub fn init_btree(&mut self, kind: PageKind, usable_size: usize) -> Result<()> {
        let Some(type_byte) = kind.type_byte().filter(|_| kind.is_btree()) else {
            bail!("cannot format page {} as {:?}", self.number, kind);
        };
        ensure!(
            self.number != 1,
            "page 1 holds the database header and cannot be a B-tree page"
        );

        self.data_mut().fill(0);
        self.data[0] = type_byte;
        let header = BTreePageHeader::from_bytes_mut(&mut self.data)?;
        header.set_content_start(usable_size);
        self.kind = kind;
        Ok(())
    }

    fn ensure_btree(&self) -> Result<CellKind> {
        match self.kind.cell_kind() {
            Some(kind) => Ok(kind),
            None => bail!("page {} is not a B-tree page ({:?})", self.number, self.kind),
        }
    }

    pub fn header_size(&self) -> usize {
        self.kind.header_size()
    }

    pub fn cell_count(&self) -> usize {
        self.read_u16(3)
    }

    fn set_cell_count(&mut self, count: usize) {
        self.write_u16(3, count);
    }

    pub fn content_start(&self) -> usize {
        match self.read_u16(5) {
            0 => 65536,
            n => n,
        }
    }

    fn set_content_start(&mut self, offset: usize) {
        self.write_u16(5, offset);
    }

    pub fn rightmost_child(&self) -> Option<u32> {
        if self.kind.is_btree() && !self.kind.is_leaf() {
            Some(self.read_u32(8))
        } else {
            None
        }
    }

    pub fn set_rightmost_child(&mut self, page_no: u32) -> Result<()> {
        ensure!(
            self.kind.is_btree() && !self.kind.is_leaf(),
            "page {} has no rightmost child ({:?})",
            self.number,
            self.kind
        );
        self.write_u32(8, page_no);
        Ok(())
    }

    pub fn cell_pointer(&self, index: usize) -> usize {
        self.read_u16(self.header_size() + index * CELL_POINTER_SIZE)
    }

    fn set_cell_pointer(&mut self, index: usize, offset: usize) {
        let at = self.header_size() + index * CELL_POINTER_SIZE;
        self.write_u16(at, offset);
    }

    fn pointer_array_end(&self) -> usize {
        self.header_size() + self.cell_count() * CELL_POINTER_SIZE
    }

    /// Bytes available for one more cell including its pointer.
    pub fn free_space(&self) -> usize {
        self.content_start().saturating_sub(self.pointer_array_end())
    }

    /// Header plus pointer array plus cell content.
    pub fn used_bytes(&self) -> usize {
        self.pointer_array_end() + self.size().saturating_sub(self.content_start())
    }

    /// Bytes held by cell content alone.
    pub fn content_bytes(&self) -> usize {
        self.size().saturating_sub(self.content_start())
    }

    pub fn cell(&self, index: usize, usable_size: usize) -> Result<Cell<'_>> {
        let kind = self.ensure_btree()?;
        let offset = self.checked_pointer(index)?;
        let content = self.usable_content(offset, usable_size)?;
        let (cell, _) = decode_cell(kind, content, usable_size)?;
        Ok(cell)
    }

    /// Encoded bytes of the cell at `index`.
    pub fn cell_bytes(&self, index: usize, usable_size: usize) -> Result<&[u8]> {
        let kind = self.ensure_btree()?;
        let offset = self.checked_pointer(index)?;
        let content = self.usable_content(offset, usable_size)?;
        let (_, len) = decode_cell(kind, content, usable_size)?;
        ensure!(
            len <= content.len(),
            StorageError::InvalidCell("cell runs past the usable area")
        );
        Ok(&content[..len])
    }

    fn usable_content(&self, offset: usize, usable_size: usize) -> Result<&[u8]> {
        let end = usable_size.min(self.data.len());
        if offset >= end {
            bail!(StorageError::Corrupt(format!(
                "cell pointer {} on page {} lies beyond the usable size {}",
                offset, self.number, usable_size
            )));
        }
        Ok(&self.data[offset..end])
    }

    fn checked_pointer(&self, index: usize) -> Result<usize> {
        let count = self.cell_count();
        ensure!(
            index < count,
            "cell index {} out of range on page {} ({} cells)",
            index,
            self.number,
            count
        );

        let offset = self.cell_pointer(index);
        if offset < self.pointer_array_end() || offset >= self.size() {
            bail!(StorageError::Corrupt(format!(
                "cell pointer {} on page {} points outside the content area",
                offset, self.number
            )));
        }
        Ok(offset)
    }

    /// Inserts encoded cell bytes so that they become cell `index`.
    pub fn insert_cell(&mut self, index: usize, cell: &[u8]) -> Result<()> {
        self.ensure_btree()?;
        let count = self.cell_count();
        ensure!(
            index <= count,
            "cell index {} out of range on page {} ({} cells)",
            index,
            self.number,
            count
        );

        let needed = cell.len() + CELL_POINTER_SIZE;
        let available = self.free_space();
        if needed > available {
            bail!(StorageError::PageFull {
                page_no: self.number,
                needed,
                available,
            });
        }

        let start = self.content_start() - cell.len();
        self.data_mut()[start..start + cell.len()].copy_from_slice(cell);
        self.set_content_start(start);

        let ptr_at = self.header_size() + index * CELL_POINTER_SIZE;
        let ptr_end = self.pointer_array_end();
        self.data.copy_within(ptr_at..ptr_end, ptr_at + CELL_POINTER_SIZE);
        self.set_cell_count(count + 1);
        self.set_cell_pointer(index, start);
        Ok(())
    }

    /// Removes cell `index` and compacts the content area.
    pub fn delete_cell(&mut self, index: usize, usable_size: usize) -> Result<()> {
        self.checked_pointer(index)?;
        let count = self.cell_count();

        let ptr_at = self.header_size() + index * CELL_POINTER_SIZE;
        let ptr_end = self.pointer_array_end();
        self.data_mut()
            .copy_within(ptr_at + CELL_POINTER_SIZE..ptr_end, ptr_at);
        self.set_cell_count(count - 1);

        self.defragment(usable_size)
    }

    /// Rewrites all cells contiguously at the end of the usable area, in
    /// pointer order.
    pub fn defragment(&mut self, usable_size: usize) -> Result<()> {
        let count = self.cell_count();
        let mut cells = Vec::with_capacity(count);
        for i in 0..count {
            cells.push(self.cell_bytes(i, usable_size)?.to_vec());
        }

        let mut end = usable_size;
        let floor = self.pointer_array_end();
        self.data_mut()[floor..usable_size].fill(0);
        for (i, cell) in cells.iter().enumerate() {
            end -= cell.len();
            self.data[end..end + cell.len()].copy_from_slice(cell);
            self.set_cell_pointer(i, end);
        }

        self.set_content_start(end);
        let header = BTreePageHeader::from_bytes_mut(&mut self.data)?;
        header.set_first_freeblock(0);
        header.set_fragmented_bytes(0);
        Ok(())
    }

    /// Removes every cell, keeping the kind and rightmost child.
    pub fn clear_cells(&mut self, usable_size: usize) -> Result<()> {
        self.ensure_btree()?;
        let floor = self.header_size();
        self.data_mut()[floor..usable_size].fill(0);
        self.set_cell_count(0);
        self.set_content_start(usable_size);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::storage_error;
    use crate::encoding::{encode_table_interior_cell, encode_table_leaf_cell, TableInteriorCell, TableLeafCell};

    const PS: usize = 1024;

    fn leaf_cell(rowid: i64, payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        encode_table_leaf_cell(
            &TableLeafCell {
                rowid,
                payload_size: payload.len() as u64,
                local: payload,
                overflow_page: None,
            },
            PS,
            &mut out,
        )
        .unwrap();
        out
    }

    fn leaf_page() -> Page {
        let mut page = Page::zeroed(2, PS);
        page.init_btree(PageKind::TableLeaf, PS).unwrap();
        page
    }

    #[test]
    fn page_kind_type_bytes() {
        for (kind, byte) in [
            (PageKind::TableLeaf, 0x0d),
            (PageKind::TableInterior, 0x05),
            (PageKind::IndexLeaf, 0x02),
            (PageKind::IndexInterior, 0x0a),
            (PageKind::Freelist, 0xfe),
            (PageKind::PointerMap, 0xfd),
            (PageKind::LockByte, 0xff),
        ] {
            assert_eq!(kind.type_byte(), Some(byte));
            assert_eq!(PageKind::from_type_byte(byte), kind);
        }
        assert_eq!(PageKind::from_type_byte(0x00), PageKind::Unformatted);
        assert_eq!(PageKind::Overflow.type_byte(), None);
    }

    #[test]
    fn header_sizes() {
        assert_eq!(PageKind::TableLeaf.header_size(), 8);
        assert_eq!(PageKind::IndexInterior.header_size(), 12);
        assert_eq!(PageKind::Overflow.header_size(), 0);
    }

    #[test]
    fn init_writes_empty_header() {
        let page = leaf_page();

        assert_eq!(page.data()[0], 0x0d);
        assert_eq!(page.cell_count(), 0);
        assert_eq!(page.content_start(), PS);
        assert_eq!(page.free_space(), PS - 8);
        assert_eq!(page.used_bytes(), 8);
        assert!(page.rightmost_child().is_none());
    }

    #[test]
    fn content_start_zero_means_65536() {
        let mut page = Page::zeroed(2, 65536);
        page.init_btree(PageKind::TableLeaf, 65536).unwrap();

        assert_eq!(&page.data()[5..7], &[0, 0]);
        assert_eq!(page.content_start(), 65536);
    }

    #[test]
    fn page_one_is_header_and_cannot_hold_btree() {
        let mut page = Page::zeroed(1, PS);
        assert_eq!(page.kind(), PageKind::Header);
        assert!(page.init_btree(PageKind::TableLeaf, PS).is_err());
    }

    #[test]
    fn insert_keeps_pointer_order() {
        let mut page = leaf_page();
        page.insert_cell(0, &leaf_cell(10, b"ten")).unwrap();
        page.insert_cell(0, &leaf_cell(5, b"five")).unwrap();
        page.insert_cell(1, &leaf_cell(7, b"seven")).unwrap();

        let rowids: Vec<i64> = (0..3)
            .map(|i| page.cell(i, PS).unwrap().rowid().unwrap())
            .collect();
        assert_eq!(rowids, vec![5, 7, 10]);
        assert!(page.is_dirty());
    }

    #[test]
    fn insert_into_full_page_is_page_full() {
        let mut page = leaf_page();
        let big = vec![1u8; 500];
        page.insert_cell(0, &leaf_cell(1, &big)).unwrap();

        let err = page.insert_cell(1, &leaf_cell(2, &big)).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<StorageError>(),
            Some(StorageError::PageFull { page_no: 2, .. })
        ));
        assert_eq!(page.cell_count(), 1);
    }

    #[test]
    fn delete_compacts_content() {
        let mut page = leaf_page();
        for i in 0..4 {
            page.insert_cell(i, &leaf_cell(i as i64, &[i as u8; 40])).unwrap();
        }
        let before = page.used_bytes();
        let cell_len = page.cell_bytes(1, PS).unwrap().len();

        page.delete_cell(1, PS).unwrap();

        assert_eq!(page.cell_count(), 3);
        assert_eq!(page.used_bytes(), before - cell_len - CELL_POINTER_SIZE);
        let rowids: Vec<i64> = (0..3)
            .map(|i| page.cell(i, PS).unwrap().rowid().unwrap())
            .collect();
        assert_eq!(rowids, vec![0, 2, 3]);
    }

    #[test]
    fn interior_rightmost_child() {
        let mut page = Page::zeroed(3, PS);
        page.init_btree(PageKind::TableInterior, PS).unwrap();
        page.set_rightmost_child(99).unwrap();

        let mut cell = Vec::new();
        encode_table_interior_cell(&TableInteriorCell { left_child: 4, rowid: 50 }, &mut cell);
        page.insert_cell(0, &cell).unwrap();

        assert_eq!(page.rightmost_child(), Some(99));
        assert_eq!(page.cell(0, PS).unwrap().left_child(), Some(4));
        assert_eq!(page.cell_pointer(0), PS - cell.len());
    }

    #[test]
    fn corrupt_pointer_is_detected() {
        let mut page = leaf_page();
        page.insert_cell(0, &leaf_cell(1, b"x")).unwrap();
        page.data_mut()[8] = 0;
        page.data_mut()[9] = 2;

        let err = page.cell(0, PS).unwrap_err();
        assert!(err.to_string().contains("database corruption"));
    }

    #[test]
    fn pointer_into_reserved_tail_is_corrupt() {
        let mut page = leaf_page();
        page.insert_cell(0, &leaf_cell(1, b"x")).unwrap();
        let reserved_start = (PS - 32) as u16;
        page.data_mut()[8..10].copy_from_slice(&reserved_start.to_be_bytes());

        let usable = PS - 32;
        let err = page.cell(0, usable).unwrap_err();
        assert!(matches!(storage_error(&err), Some(StorageError::Corrupt(_))));
        assert!(page.cell_bytes(0, usable).is_err());
    }

    #[test]
    fn btree_header_view() {
        let page = leaf_page();
        let header = BTreePageHeader::from_bytes(page.data()).unwrap();

        assert_eq!(header.kind(), PageKind::TableLeaf);
        assert_eq!(header.cell_count(), 0);
        assert_eq!(header.content_start(), PS);
    }

    #[test]
    fn btree_header_too_small() {
        let result = BTreePageHeader::from_bytes(&[0u8; 4]);
        assert!(result.unwrap_err().to_string().contains("buffer too small"));
    }
}
