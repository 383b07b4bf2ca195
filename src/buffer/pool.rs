// Buffer pool.
//
// Fixed set of frames over the page store with clock-sweep eviction. The
// WAL-before-data fence lives here: a dirty frame is never written back
// before the log is durable through its page-LSN.

use crate::buffer::frame::{BufferFrame, FrameGuard, FrameId, INVALID_PAGE};
use crate::common::{page_file, page_no, Lsn, PageId, TxId};
use crate::error::{DbError, Result};
use crate::storage::page::{PageBuf, PageKind};
use crate::storage::PageStore;
use crate::wal::{Payload, WalManager};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, Default)]
pub struct BufferPoolStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub dirty_writebacks: u64,
}

pub struct BufferPool {
    frames: Vec<Arc<BufferFrame>>,
    page_table: DashMap<PageId, FrameId>,
    store: Arc<PageStore>,
    wal: Arc<WalManager>,
    // serializes the miss/eviction path; hits stay lock-free
    replace_lock: Mutex<usize>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    writebacks: AtomicU64,
}

impl BufferPool {
    pub fn new(capacity: usize, store: Arc<PageStore>, wal: Arc<WalManager>) -> Self {
        let page_size = store.page_size();
        let frames = (0..capacity)
            .map(|i| Arc::new(BufferFrame::new(i as FrameId, page_size)))
            .collect();
        Self {
            frames,
            page_table: DashMap::new(),
            store,
            wal,
            replace_lock: Mutex::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            writebacks: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.frames.len()
    }

    /// Pin a page, reading it from disk on a miss.
    pub fn pin(&self, page_id: PageId) -> Result<FrameGuard> {
        if let Some(entry) = self.page_table.get(&page_id) {
            let frame = Arc::clone(&self.frames[*entry as usize]);
            // pin first, then validate: either this pin lands before the
            // evictor's pin check (it backs off) or the eviction flag is
            // visible here and we fall through to the miss path
            let guard = FrameGuard::new(frame);
            if guard.frame().page_id() == page_id && !guard.frame().is_evicting() {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(guard);
            }
            drop(guard);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        self.load_page(page_id)
    }

    fn load_page(&self, page_id: PageId) -> Result<FrameGuard> {
        let mut hand = self.replace_lock.lock();

        // re-check: another thread may have loaded it while we waited
        if let Some(entry) = self.page_table.get(&page_id) {
            let frame = Arc::clone(&self.frames[*entry as usize]);
            let guard = FrameGuard::new(frame);
            if guard.frame().page_id() == page_id {
                return Ok(guard);
            }
        }

        let frame = self.claim_victim(&mut hand)?;

        let dm = self.store.file(page_file(page_id))?;
        let page = match dm.read_page(page_no(page_id), page_id) {
            Ok(page) => page,
            Err(e) => {
                frame.end_evict();
                return Err(e);
            }
        };
        let lsn = page.lsn();
        *frame.write_data() = page;
        frame.set_page_id(page_id);
        frame.set_page_lsn(lsn);
        frame.clear_dirty();
        self.page_table.insert(page_id, frame.frame_id());
        let guard = FrameGuard::new(frame);
        guard.frame().end_evict();
        Ok(guard)
    }

    /// Format a brand-new page in a frame. The caller has already logged
    /// the allocation; `lsn` is that record's LSN.
    pub fn install_new_page(
        &self,
        page_id: PageId,
        kind: PageKind,
        lsn: Lsn,
    ) -> Result<FrameGuard> {
        let mut hand = self.replace_lock.lock();
        let frame = self.claim_victim(&mut hand)?;

        let mut page = PageBuf::new(kind, self.store.page_size());
        page.set_lsn(lsn);
        *frame.write_data() = page;
        frame.set_page_id(page_id);
        frame.set_page_lsn(lsn);
        frame.mark_dirty(lsn);
        self.page_table.insert(page_id, frame.frame_id());
        let guard = FrameGuard::new(frame);
        guard.frame().end_evict();
        Ok(guard)
    }

    /// Clock sweep: two passes over the frames looking for an unpinned
    /// frame whose reference bit has gone cold.
    fn find_victim(&self, hand: &mut usize) -> Result<Arc<BufferFrame>> {
        let n = self.frames.len();
        for _ in 0..2 * n {
            let frame = &self.frames[*hand % n];
            *hand = (*hand + 1) % n;
            if frame.is_pinned() || frame.is_evicting() {
                continue;
            }
            if frame.clear_ref_bit() {
                continue;
            }
            return Ok(Arc::clone(frame));
        }
        Err(DbError::OutOfMemory(
            "buffer pool exhausted: all frames pinned".into(),
        ))
    }

    /// Write back a dirty victim, honoring the WAL fence (WAL1). Returns
    /// false when a racing pin claimed the frame after victim selection;
    /// the flag stays raised through the caller's page swap.
    fn evict_frame(&self, frame: &Arc<BufferFrame>) -> Result<bool> {
        if !frame.begin_evict() {
            return Ok(false);
        }
        // a pin that landed before the flag went up wins the frame
        if frame.is_pinned() {
            frame.end_evict();
            return Ok(false);
        }
        let old_page = frame.page_id();
        if old_page == INVALID_PAGE {
            return Ok(true);
        }
        if frame.is_dirty() {
            if let Err(e) = self
                .wal
                .flush_through(frame.page_lsn())
                .and_then(|_| self.write_back(frame))
            {
                frame.end_evict();
                return Err(e);
            }
        }
        self.page_table.remove(&old_page);
        self.evictions.fetch_add(1, Ordering::Relaxed);
        debug!(page_id = old_page, "evicted page");
        Ok(true)
    }

    /// Victim selection + eviction handshake as one step.
    fn claim_victim(&self, hand: &mut usize) -> Result<Arc<BufferFrame>> {
        loop {
            let frame = self.find_victim(hand)?;
            if self.evict_frame(&frame)? {
                return Ok(frame);
            }
        }
    }

    fn write_back(&self, frame: &Arc<BufferFrame>) -> Result<()> {
        let page_id = frame.page_id();
        let dm = self.store.file(page_file(page_id))?;
        {
            let mut data = frame.write_data();
            data.seal();
            dm.write_page(page_no(page_id), &data)?;
        }
        frame.clear_dirty();
        self.writebacks.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Flush every dirty frame (clean shutdown, checkpoint tail).
    pub fn flush_all(&self) -> Result<()> {
        self.wal.flush_all()?;
        for frame in &self.frames {
            if frame.page_id() != INVALID_PAGE && frame.is_dirty() {
                self.write_back(frame)?;
            }
        }
        self.store.sync_all()?;
        Ok(())
    }

    /// Drop a dropped tree's pages without writing them back.
    pub fn discard_file(&self, file: u32) {
        for frame in &self.frames {
            let pid = frame.page_id();
            if pid != INVALID_PAGE && page_file(pid) == file && !frame.is_pinned() {
                self.page_table.remove(&pid);
                frame.reset(self.store.page_size());
            }
        }
    }

    /// Fuzzy checkpoint: log the active-transaction list and the dirty-page
    /// table (with each page's earliest recovery LSN), then force the log.
    pub fn checkpoint(&self, active_txs: Vec<(TxId, Lsn)>) -> Result<Lsn> {
        let mut dirty_pages = Vec::new();
        for frame in &self.frames {
            if frame.page_id() != INVALID_PAGE && frame.is_dirty() {
                dirty_pages.push((frame.page_id(), frame.rec_lsn()));
            }
        }
        let lsn = self.wal.append(
            0,
            crate::wal::NO_LSN,
            Payload::Checkpoint {
                active_txs,
                dirty_pages,
            },
        )?;
        self.wal.flush_through(lsn)?;
        Ok(lsn)
    }

    pub fn stats(&self) -> BufferPoolStats {
        BufferPoolStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            dirty_writebacks: self.writebacks.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::WalSyncMode;

    fn setup(capacity: usize) -> (tempfile::TempDir, Arc<PageStore>, Arc<BufferPool>) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(PageStore::new(4096));
        store.register(0, &dir.path().join("t.db")).unwrap();
        let wal = Arc::new(
            WalManager::open(
                &dir.path().join("wal"),
                1,
                1 << 20,
                WalSyncMode::FsyncOnCommit,
            )
            .unwrap(),
        );
        let pool = Arc::new(BufferPool::new(capacity, Arc::clone(&store), wal));
        (dir, store, pool)
    }

    #[test]
    fn test_new_page_and_pin_roundtrip() {
        let (_dir, store, pool) = setup(8);
        let dm = store.file(0).unwrap();
        let no = dm.extend().unwrap();
        let pid = crate::common::page_id(0, no);
        {
            let guard = pool
                .install_new_page(pid, PageKind::TreeLeaf, 1)
                .unwrap();
            guard.write().insert_cell(0, b"x");
            guard.mark_dirty(1);
        }
        pool.flush_all().unwrap();

        let guard = pool.pin(pid).unwrap();
        assert_eq!(guard.read().cell(0), b"x");
    }

    #[test]
    fn test_eviction_under_pressure() {
        let (_dir, store, pool) = setup(8);
        let dm = store.file(0).unwrap();
        // create more pages than frames
        for _ in 0..32 {
            let no = dm.extend().unwrap();
            let pid = crate::common::page_id(0, no);
            let guard = pool
                .install_new_page(pid, PageKind::TreeLeaf, 1)
                .unwrap();
            guard.mark_dirty(1);
        }
        let stats = pool.stats();
        assert!(stats.evictions > 0);
        // every page still readable after being cycled through the pool
        for no in 0..32 {
            let pid = crate::common::page_id(0, no);
            assert!(pool.pin(pid).is_ok());
        }
    }

    #[test]
    fn test_all_pinned_exhausts_pool() {
        let (_dir, store, pool) = setup(8);
        let dm = store.file(0).unwrap();
        let mut guards = Vec::new();
        for _ in 0..8 {
            let no = dm.extend().unwrap();
            let pid = crate::common::page_id(0, no);
            guards.push(pool.install_new_page(pid, PageKind::TreeLeaf, 1).unwrap());
        }
        let no = dm.extend().unwrap();
        let pid = crate::common::page_id(0, no);
        assert!(matches!(
            pool.install_new_page(pid, PageKind::TreeLeaf, 1),
            Err(DbError::OutOfMemory(_))
        ));
    }
}
