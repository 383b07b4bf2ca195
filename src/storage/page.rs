// Slotted page layout.
//
// Bytes 0..3 magic "PHMS"; 4..7 page kind; 8..15 page-LSN; 16..17 slot
// count; 18..19 free-space offset; 20..23 checksum. Leaf pages store the
// right-sibling page id in bytes 24..31. The slot directory grows upward
// from the end of the header; cells grow downward from the end of the page.

use crate::common::{Lsn, PageId};
use crate::error::{DbError, Result};
use crate::storage::checksum::page_checksum;

/// On-disk magic, ASCII "PHMS".
pub const PAGE_MAGIC: [u8; 4] = *b"PHMS";

/// Sentinel for "no sibling" / "no page".
pub const INVALID_PAGE_ID: PageId = u64::MAX;

const OFF_KIND: usize = 4;
const OFF_LSN: usize = 8;
const OFF_SLOT_COUNT: usize = 16;
const OFF_FREE_SPACE: usize = 18;
const OFF_CHECKSUM: usize = 20;
const OFF_RIGHT_SIBLING: usize = 24;

const HEADER_SIZE: usize = 24;
const LEAF_HEADER_SIZE: usize = 32;

/// Page kinds stored in the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum PageKind {
    TreeInternal = 1,
    TreeLeaf = 2,
    Overflow = 3,
    Free = 4,
    Meta = 5,
}

impl PageKind {
    pub fn from_u32(v: u32) -> Option<PageKind> {
        match v {
            1 => Some(PageKind::TreeInternal),
            2 => Some(PageKind::TreeLeaf),
            3 => Some(PageKind::Overflow),
            4 => Some(PageKind::Free),
            5 => Some(PageKind::Meta),
            _ => None,
        }
    }
}

/// An in-memory page image with slotted-cell accessors.
#[derive(Clone)]
pub struct PageBuf {
    data: Vec<u8>,
}

impl PageBuf {
    /// Create a freshly formatted page of the given kind.
    pub fn new(kind: PageKind, page_size: usize) -> Self {
        let mut data = vec![0u8; page_size];
        data[..4].copy_from_slice(&PAGE_MAGIC);
        data[OFF_KIND..OFF_KIND + 4].copy_from_slice(&(kind as u32).to_le_bytes());
        data[OFF_FREE_SPACE..OFF_FREE_SPACE + 2]
            .copy_from_slice(&(page_size as u16).to_le_bytes());
        if kind == PageKind::TreeLeaf {
            data[OFF_RIGHT_SIBLING..OFF_RIGHT_SIBLING + 8]
                .copy_from_slice(&INVALID_PAGE_ID.to_le_bytes());
        }
        Self { data }
    }

    /// Wrap raw bytes read from disk; validates magic and kind.
    pub fn from_bytes(page: PageId, data: Vec<u8>) -> Result<Self> {
        if data[..4] != PAGE_MAGIC {
            return Err(DbError::CorruptPage {
                page_id: page,
                reason: "bad magic".into(),
            });
        }
        let kind = u32::from_le_bytes(data[OFF_KIND..OFF_KIND + 4].try_into().unwrap());
        if PageKind::from_u32(kind).is_none() {
            return Err(DbError::CorruptPage {
                page_id: page,
                reason: format!("unknown page kind {}", kind),
            });
        }
        Ok(Self { data })
    }

    #[inline(always)]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    #[inline(always)]
    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    #[inline(always)]
    pub fn page_size(&self) -> usize {
        self.data.len()
    }

    pub fn kind(&self) -> PageKind {
        let raw = u32::from_le_bytes(self.data[OFF_KIND..OFF_KIND + 4].try_into().unwrap());
        PageKind::from_u32(raw).expect("validated at construction")
    }

    pub fn set_kind(&mut self, kind: PageKind) {
        self.data[OFF_KIND..OFF_KIND + 4].copy_from_slice(&(kind as u32).to_le_bytes());
    }

    pub fn lsn(&self) -> Lsn {
        u64::from_le_bytes(self.data[OFF_LSN..OFF_LSN + 8].try_into().unwrap())
    }

    /// Page-LSN is monotonic; writes of an older LSN are ignored.
    pub fn set_lsn(&mut self, lsn: Lsn) {
        if lsn > self.lsn() {
            self.data[OFF_LSN..OFF_LSN + 8].copy_from_slice(&lsn.to_le_bytes());
        }
    }

    pub fn slot_count(&self) -> usize {
        u16::from_le_bytes(
            self.data[OFF_SLOT_COUNT..OFF_SLOT_COUNT + 2]
                .try_into()
                .unwrap(),
        ) as usize
    }

    fn set_slot_count(&mut self, n: usize) {
        self.data[OFF_SLOT_COUNT..OFF_SLOT_COUNT + 2]
            .copy_from_slice(&(n as u16).to_le_bytes());
    }

    fn free_space_offset(&self) -> usize {
        u16::from_le_bytes(
            self.data[OFF_FREE_SPACE..OFF_FREE_SPACE + 2]
                .try_into()
                .unwrap(),
        ) as usize
    }

    fn set_free_space_offset(&mut self, off: usize) {
        self.data[OFF_FREE_SPACE..OFF_FREE_SPACE + 2]
            .copy_from_slice(&(off as u16).to_le_bytes());
    }

    pub fn right_sibling(&self) -> PageId {
        debug_assert_eq!(self.kind(), PageKind::TreeLeaf);
        u64::from_le_bytes(
            self.data[OFF_RIGHT_SIBLING..OFF_RIGHT_SIBLING + 8]
                .try_into()
                .unwrap(),
        )
    }

    pub fn set_right_sibling(&mut self, sibling: PageId) {
        debug_assert_eq!(self.kind(), PageKind::TreeLeaf);
        self.data[OFF_RIGHT_SIBLING..OFF_RIGHT_SIBLING + 8]
            .copy_from_slice(&sibling.to_le_bytes());
    }

    fn slot_dir_start(&self) -> usize {
        match self.kind() {
            PageKind::TreeLeaf => LEAF_HEADER_SIZE,
            _ => HEADER_SIZE,
        }
    }

    fn slot_offset(&self, slot: usize) -> usize {
        let pos = self.slot_dir_start() + slot * 2;
        u16::from_le_bytes(self.data[pos..pos + 2].try_into().unwrap()) as usize
    }

    fn set_slot_offset(&mut self, slot: usize, off: usize) {
        let pos = self.slot_dir_start() + slot * 2;
        self.data[pos..pos + 2].copy_from_slice(&(off as u16).to_le_bytes());
    }

    /// Contiguous free bytes between the slot directory and the cell heap.
    pub fn free_space(&self) -> usize {
        let dir_end = self.slot_dir_start() + self.slot_count() * 2;
        self.free_space_offset().saturating_sub(dir_end)
    }

    /// Free bytes available after compaction (contiguous + garbage cells).
    pub fn reusable_space(&self) -> usize {
        let mut live = 0usize;
        for i in 0..self.slot_count() {
            live += self.cell(i).len() + 2;
        }
        self.page_size() - self.slot_dir_start() - self.slot_count() * 2 - live
    }

    /// Read a cell; cells are length-prefixed with a u16.
    pub fn cell(&self, slot: usize) -> &[u8] {
        debug_assert!(slot < self.slot_count());
        let off = self.slot_offset(slot);
        let len = u16::from_le_bytes(self.data[off..off + 2].try_into().unwrap()) as usize;
        &self.data[off + 2..off + 2 + len]
    }

    /// Insert a cell at `slot`, shifting later slots right.
    /// Compacts the cell heap first when the hole is fragmentation, and
    /// returns `false` when the cell genuinely does not fit.
    pub fn insert_cell(&mut self, slot: usize, cell: &[u8]) -> bool {
        debug_assert!(slot <= self.slot_count());
        let need = cell.len() + 2;
        if self.free_space() < need + 2 {
            self.compact();
            if self.free_space() < need + 2 {
                return false;
            }
        }
        let new_off = self.free_space_offset() - need;
        self.data[new_off..new_off + 2].copy_from_slice(&(cell.len() as u16).to_le_bytes());
        self.data[new_off + 2..new_off + 2 + cell.len()].copy_from_slice(cell);
        self.set_free_space_offset(new_off);

        let count = self.slot_count();
        for i in (slot..count).rev() {
            let off = self.slot_offset(i);
            let pos = self.slot_dir_start() + (i + 1) * 2;
            self.data[pos..pos + 2].copy_from_slice(&(off as u16).to_le_bytes());
        }
        self.set_slot_count(count + 1);
        self.set_slot_offset(slot, new_off);
        true
    }

    /// Replace the cell at `slot`. Returns false if the replacement cannot fit.
    pub fn replace_cell(&mut self, slot: usize, cell: &[u8]) -> bool {
        debug_assert!(slot < self.slot_count());
        let off = self.slot_offset(slot);
        let old_len =
            u16::from_le_bytes(self.data[off..off + 2].try_into().unwrap()) as usize;
        if cell.len() <= old_len {
            self.data[off..off + 2].copy_from_slice(&(cell.len() as u16).to_le_bytes());
            self.data[off + 2..off + 2 + cell.len()].copy_from_slice(cell);
            return true;
        }
        let old = self.cell(slot).to_vec();
        self.remove_cell(slot);
        if !self.insert_cell(slot, cell) {
            // restore the original so a failed replace leaves the page intact
            let restored = self.insert_cell(slot, &old);
            debug_assert!(restored);
            return false;
        }
        true
    }

    /// Remove the slot; the cell bytes become garbage reclaimed by compact().
    pub fn remove_cell(&mut self, slot: usize) {
        let count = self.slot_count();
        debug_assert!(slot < count);
        for i in slot + 1..count {
            let off = self.slot_offset(i);
            self.set_slot_offset(i - 1, off);
        }
        self.set_slot_count(count - 1);
    }

    /// Rewrite the cell heap tightly packed against the end of the page.
    pub fn compact(&mut self) {
        let count = self.slot_count();
        let mut cells: Vec<Vec<u8>> = Vec::with_capacity(count);
        for i in 0..count {
            cells.push(self.cell(i).to_vec());
        }
        let mut off = self.page_size();
        for (i, cell) in cells.iter().enumerate() {
            let need = cell.len() + 2;
            off -= need;
            self.data[off..off + 2].copy_from_slice(&(cell.len() as u16).to_le_bytes());
            self.data[off + 2..off + 2 + cell.len()].copy_from_slice(cell);
            self.set_slot_offset(i, off);
        }
        self.set_free_space_offset(off);
    }

    /// Recompute and store the header checksum; call before writing out.
    pub fn seal(&mut self) {
        let sum = page_checksum(&self.data);
        self.data[OFF_CHECKSUM..OFF_CHECKSUM + 4].copy_from_slice(&sum.to_le_bytes());
    }

    /// Verify the stored checksum against the page contents.
    pub fn verify(&self, page: PageId) -> Result<()> {
        let stored = u32::from_le_bytes(
            self.data[OFF_CHECKSUM..OFF_CHECKSUM + 4].try_into().unwrap(),
        );
        let actual = page_checksum(&self.data);
        if stored != actual {
            return Err(DbError::CorruptPage {
                page_id: page,
                reason: format!("checksum mismatch: stored {:#x}, actual {:#x}", stored, actual),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_page_layout() {
        let page = PageBuf::new(PageKind::TreeLeaf, 4096);
        assert_eq!(&page.data()[..4], b"PHMS");
        assert_eq!(page.kind(), PageKind::TreeLeaf);
        assert_eq!(page.slot_count(), 0);
        assert_eq!(page.right_sibling(), INVALID_PAGE_ID);
    }

    #[test]
    fn test_cell_insert_and_read() {
        let mut page = PageBuf::new(PageKind::TreeLeaf, 4096);
        assert!(page.insert_cell(0, b"bravo"));
        assert!(page.insert_cell(0, b"alpha"));
        assert!(page.insert_cell(2, b"charlie"));
        assert_eq!(page.cell(0), b"alpha");
        assert_eq!(page.cell(1), b"bravo");
        assert_eq!(page.cell(2), b"charlie");
    }

    #[test]
    fn test_remove_and_compact() {
        let mut page = PageBuf::new(PageKind::TreeLeaf, 4096);
        for i in 0..10 {
            assert!(page.insert_cell(i, format!("cell-{}", i).as_bytes()));
        }
        page.remove_cell(4);
        assert_eq!(page.slot_count(), 9);
        assert_eq!(page.cell(4), b"cell-5");
        let before = page.free_space();
        page.compact();
        assert!(page.free_space() >= before);
        assert_eq!(page.cell(0), b"cell-0");
        assert_eq!(page.cell(8), b"cell-9");
    }

    #[test]
    fn test_page_fills_up() {
        let mut page = PageBuf::new(PageKind::TreeLeaf, 4096);
        let cell = vec![0xAB; 128];
        let mut n = 0;
        while page.insert_cell(n, &cell) {
            n += 1;
        }
        assert!(n > 20);
        assert!(page.free_space() < cell.len() + 4);
    }

    #[test]
    fn test_seal_and_verify() {
        let mut page = PageBuf::new(PageKind::Meta, 4096);
        page.insert_cell(0, b"meta");
        page.seal();
        assert!(page.verify(1).is_ok());
        page.data_mut()[100] ^= 0xFF;
        assert!(page.verify(1).is_err());
    }

    #[test]
    fn test_lsn_monotonic() {
        let mut page = PageBuf::new(PageKind::TreeLeaf, 4096);
        page.set_lsn(10);
        page.set_lsn(5);
        assert_eq!(page.lsn(), 10);
        page.set_lsn(11);
        assert_eq!(page.lsn(), 11);
    }
}
