// Buffer frames.
//
// A frame owns one in-memory page image plus its bookkeeping. Pin counts
// and flags are atomics so the hit path never takes the pool lock; the
// page image sits behind a RwLock that doubles as the page latch.

use crate::common::{Lsn, PageId};
use crate::storage::page::{PageBuf, PageKind};
use parking_lot::{ArcRwLockReadGuard, ArcRwLockWriteGuard, RawRwLock, RwLock};
use parking_lot::{RwLockReadGuard, RwLockWriteGuard};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

pub type FrameId = u32;

/// Owned shared page latch (storable across stack frames).
pub type PageReadGuard = ArcRwLockReadGuard<RawRwLock, PageBuf>;

/// Owned exclusive page latch.
pub type PageWriteGuard = ArcRwLockWriteGuard<RawRwLock, PageBuf>;

/// Sentinel for an empty frame.
pub const INVALID_PAGE: PageId = u64::MAX;

pub struct BufferFrame {
    frame_id: FrameId,

    // Page currently held (INVALID_PAGE if empty)
    page_id: AtomicU64,

    // 0 = evictable, >0 = in use
    pin_count: AtomicU32,

    dirty: AtomicBool,

    // Reference bit for the clock sweep
    ref_bit: AtomicBool,

    // Eviction handshake: set while a victim is being swapped out. A
    // racing pin either lands before the flag (the evictor sees the pin
    // and backs off) or observes the flag and retries through the miss
    // path; the atomics order one of the two.
    evicting: AtomicBool,

    // LSN of the most recent WAL record describing this page
    page_lsn: AtomicU64,

    // LSN of the record that first dirtied the page since its last flush;
    // feeds the dirty-page table in fuzzy checkpoints
    rec_lsn: AtomicU64,

    // Page image; the RwLock is the page latch. Arc so latch crabbing can
    // hold owned guards down a descent path.
    data: Arc<RwLock<PageBuf>>,
}

impl BufferFrame {
    pub fn new(frame_id: FrameId, page_size: usize) -> Self {
        Self {
            frame_id,
            page_id: AtomicU64::new(INVALID_PAGE),
            pin_count: AtomicU32::new(0),
            dirty: AtomicBool::new(false),
            ref_bit: AtomicBool::new(false),
            evicting: AtomicBool::new(false),
            page_lsn: AtomicU64::new(0),
            rec_lsn: AtomicU64::new(0),
            data: Arc::new(RwLock::new(PageBuf::new(PageKind::Free, page_size))),
        }
    }

    /// Claim the frame for eviction; fails if another eviction is running.
    pub fn begin_evict(&self) -> bool {
        self.evicting
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn end_evict(&self) {
        self.evicting.store(false, Ordering::Release);
    }

    #[inline(always)]
    pub fn is_evicting(&self) -> bool {
        self.evicting.load(Ordering::SeqCst)
    }

    #[inline(always)]
    pub fn frame_id(&self) -> FrameId {
        self.frame_id
    }

    #[inline(always)]
    pub fn page_id(&self) -> PageId {
        self.page_id.load(Ordering::Acquire)
    }

    pub fn set_page_id(&self, page_id: PageId) {
        self.page_id.store(page_id, Ordering::Release);
    }

    #[inline(always)]
    pub fn pin_count(&self) -> u32 {
        self.pin_count.load(Ordering::SeqCst)
    }

    #[inline(always)]
    pub fn is_pinned(&self) -> bool {
        self.pin_count() > 0
    }

    #[inline(always)]
    pub fn pin(&self) {
        // SeqCst pairs with the eviction handshake: a racing pin and a
        // begin_evict must observe each other in some total order
        self.pin_count.fetch_add(1, Ordering::SeqCst);
        self.ref_bit.store(true, Ordering::Release);
    }

    #[inline(always)]
    pub fn unpin(&self) {
        let old = self.pin_count.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(old > 0, "unpin of unpinned frame");
    }

    #[inline(always)]
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    /// Record a WAL-logged change: bump the page-LSN, remember the first
    /// dirtying LSN for checkpoints.
    pub fn mark_dirty(&self, lsn: Lsn) {
        if self
            .dirty
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.rec_lsn.store(lsn, Ordering::Release);
        }
        self.page_lsn.store(lsn, Ordering::Release);
    }

    pub fn clear_dirty(&self) {
        self.dirty.store(false, Ordering::Release);
        self.rec_lsn.store(0, Ordering::Release);
    }

    #[inline(always)]
    pub fn page_lsn(&self) -> Lsn {
        self.page_lsn.load(Ordering::Acquire)
    }

    #[inline(always)]
    pub fn rec_lsn(&self) -> Lsn {
        self.rec_lsn.load(Ordering::Acquire)
    }

    pub fn set_page_lsn(&self, lsn: Lsn) {
        self.page_lsn.store(lsn, Ordering::Release);
    }

    /// Clear the reference bit, returning its old value (clock sweep).
    #[inline(always)]
    pub fn clear_ref_bit(&self) -> bool {
        self.ref_bit.swap(false, Ordering::AcqRel)
    }

    #[inline]
    pub fn read_data(&self) -> RwLockReadGuard<'_, PageBuf> {
        self.data.read()
    }

    #[inline]
    pub fn write_data(&self) -> RwLockWriteGuard<'_, PageBuf> {
        self.data.write()
    }

    /// Owned shared latch for crabbing descents.
    #[inline]
    pub fn read_owned(&self) -> PageReadGuard {
        RwLock::read_arc(&self.data)
    }

    /// Owned exclusive latch for crabbing descents.
    #[inline]
    pub fn write_owned(&self) -> PageWriteGuard {
        RwLock::write_arc(&self.data)
    }

    pub fn reset(&self, page_size: usize) {
        self.page_id.store(INVALID_PAGE, Ordering::Release);
        self.dirty.store(false, Ordering::Release);
        self.ref_bit.store(false, Ordering::Release);
        self.evicting.store(false, Ordering::Release);
        self.page_lsn.store(0, Ordering::Release);
        self.rec_lsn.store(0, Ordering::Release);
        *self.data.write() = PageBuf::new(PageKind::Free, page_size);
    }
}

/// RAII pin over a frame. Latch acquisition happens through the guard so a
/// caller can hold the pin across short unlatched sections but never leak
/// the pin itself.
pub struct FrameGuard {
    frame: Arc<BufferFrame>,
}

impl FrameGuard {
    pub fn new(frame: Arc<BufferFrame>) -> Self {
        frame.pin();
        Self { frame }
    }

    #[inline]
    pub fn frame(&self) -> &BufferFrame {
        &self.frame
    }

    #[inline]
    pub fn page_id(&self) -> PageId {
        self.frame.page_id()
    }

    /// Shared page latch.
    #[inline]
    pub fn read(&self) -> RwLockReadGuard<'_, PageBuf> {
        self.frame.read_data()
    }

    /// Exclusive page latch. The caller is responsible for logging the
    /// change and calling `mark_dirty` with the record's LSN.
    #[inline]
    pub fn write(&self) -> RwLockWriteGuard<'_, PageBuf> {
        self.frame.write_data()
    }

    #[inline]
    pub fn mark_dirty(&self, lsn: Lsn) {
        self.frame.mark_dirty(lsn);
    }
}

impl Clone for FrameGuard {
    fn clone(&self) -> Self {
        Self::new(Arc::clone(&self.frame))
    }
}

impl Drop for FrameGuard {
    #[inline(always)]
    fn drop(&mut self) {
        self.frame.unpin();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pin_unpin() {
        let frame = Arc::new(BufferFrame::new(0, 4096));
        assert!(!frame.is_pinned());
        {
            let g1 = FrameGuard::new(Arc::clone(&frame));
            let _g2 = g1.clone();
            assert_eq!(frame.pin_count(), 2);
        }
        assert_eq!(frame.pin_count(), 0);
    }

    #[test]
    fn test_mark_dirty_tracks_rec_lsn() {
        let frame = BufferFrame::new(0, 4096);
        frame.mark_dirty(10);
        frame.mark_dirty(20);
        assert_eq!(frame.rec_lsn(), 10);
        assert_eq!(frame.page_lsn(), 20);
        frame.clear_dirty();
        frame.mark_dirty(30);
        assert_eq!(frame.rec_lsn(), 30);
    }
}
