// Write-ahead log manager.
//
// Append-only segments under `wal/`, rotated at a configured size and never
// modified in place. Commits are made durable either one fsync per commit
// or batched inside a group-commit window where the first waiter to time
// out flushes for the whole group.

use crate::common::{Lsn, TxId};
use crate::error::{DbError, Result};
#[cfg_attr(not(test), allow(unused_imports))]
use crate::wal::record::{Payload, WalRecord, NO_LSN};
use crate::WalSyncMode;
use parking_lot::{Condvar, Mutex};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

fn segment_name(no: u64) -> String {
    format!("{:08}.log", no)
}

struct WalInner {
    writer: BufWriter<File>,
    segment_no: u64,
    segment_bytes: u64,
    /// highest LSN sitting in the OS buffer, not yet fsynced
    written_lsn: Lsn,
    flushing: bool,
}

pub struct WalManager {
    dir: PathBuf,
    segment_limit: u64,
    sync_mode: WalSyncMode,
    next_lsn: AtomicU64,
    flushed_lsn: AtomicU64,
    inner: Mutex<WalInner>,
    flushed: Condvar,
    stats: Mutex<WalStats>,
}

#[derive(Debug, Clone, Default)]
pub struct WalStats {
    pub records: u64,
    pub bytes: u64,
    pub fsyncs: u64,
    pub group_commits: u64,
    pub segments_rotated: u64,
}

impl WalManager {
    /// Open the log directory, continuing after the highest existing
    /// segment. `start_lsn` is one past the last LSN recovery observed.
    pub fn open(
        dir: &Path,
        start_lsn: Lsn,
        segment_limit: u64,
        sync_mode: WalSyncMode,
    ) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let mut last_segment = 0u64;
        for entry in std::fs::read_dir(dir)? {
            let name = entry?.file_name();
            if let Some(no) = name
                .to_str()
                .and_then(|s| s.strip_suffix(".log"))
                .and_then(|s| s.parse::<u64>().ok())
            {
                last_segment = last_segment.max(no);
            }
        }
        let path = dir.join(segment_name(last_segment));
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let segment_bytes = file.metadata()?.len();
        Ok(Self {
            dir: dir.to_path_buf(),
            segment_limit,
            sync_mode,
            next_lsn: AtomicU64::new(start_lsn.max(1)),
            flushed_lsn: AtomicU64::new(start_lsn.saturating_sub(1)),
            inner: Mutex::new(WalInner {
                writer: BufWriter::new(file),
                segment_no: last_segment,
                segment_bytes,
                written_lsn: start_lsn.saturating_sub(1),
                flushing: false,
            }),
            flushed: Condvar::new(),
            stats: Mutex::new(WalStats::default()),
        })
    }

    /// Append a record; returns its LSN. The record is in the log buffer on
    /// return, durable only after `flush_through`.
    pub fn append(&self, txid: TxId, prev_lsn: Lsn, payload: Payload) -> Result<Lsn> {
        let lsn = self.next_lsn.fetch_add(1, Ordering::SeqCst);
        let record = WalRecord {
            lsn,
            prev_lsn,
            txid,
            payload,
        };
        let bytes = record.encode()?;

        let mut inner = self.inner.lock();
        inner.writer.write_all(&bytes)?;
        inner.segment_bytes += bytes.len() as u64;
        inner.written_lsn = lsn;
        if inner.segment_bytes >= self.segment_limit {
            self.rotate_locked(&mut inner)?;
        }
        drop(inner);

        let mut stats = self.stats.lock();
        stats.records += 1;
        stats.bytes += bytes.len() as u64;
        Ok(lsn)
    }

    fn rotate_locked(&self, inner: &mut WalInner) -> Result<()> {
        inner.writer.flush()?;
        inner.writer.get_ref().sync_all()?;
        self.flushed_lsn.store(inner.written_lsn, Ordering::SeqCst);
        inner.segment_no += 1;
        let path = self.dir.join(segment_name(inner.segment_no));
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        inner.writer = BufWriter::new(file);
        inner.segment_bytes = 0;
        self.stats.lock().segments_rotated += 1;
        Ok(())
    }

    #[inline]
    pub fn flushed_lsn(&self) -> Lsn {
        self.flushed_lsn.load(Ordering::SeqCst)
    }

    #[inline]
    pub fn current_lsn(&self) -> Lsn {
        self.next_lsn.load(Ordering::SeqCst).saturating_sub(1)
    }

    /// Block until the log is durable through `lsn` (WAL2). Under group
    /// commit one thread fsyncs on behalf of every waiter in the window.
    pub fn flush_through(&self, lsn: Lsn) -> Result<()> {
        if self.flushed_lsn() >= lsn {
            return Ok(());
        }
        let window = match self.sync_mode {
            WalSyncMode::FsyncOnCommit => Duration::ZERO,
            WalSyncMode::GroupCommitMs(ms) => Duration::from_millis(ms),
        };

        let mut inner = self.inner.lock();
        loop {
            if self.flushed_lsn() >= lsn {
                return Ok(());
            }
            if inner.flushing {
                // somebody else holds the fsync; wait for their result
                self.flushed.wait_for(&mut inner, Duration::from_millis(50));
                continue;
            }
            if !window.is_zero() {
                // sit in the window so later commits can join this group
                let timed_out = self
                    .flushed
                    .wait_for(&mut inner, window)
                    .timed_out();
                if self.flushed_lsn() >= lsn {
                    return Ok(());
                }
                if !timed_out {
                    continue;
                }
            }
            inner.flushing = true;
            let result = self.do_flush(&mut inner);
            inner.flushing = false;
            self.flushed.notify_all();
            result?;
        }
    }

    fn do_flush(&self, inner: &mut WalInner) -> Result<()> {
        inner.writer.flush()?;
        inner.writer.get_ref().sync_all()?;
        self.flushed_lsn.store(inner.written_lsn, Ordering::SeqCst);
        let mut stats = self.stats.lock();
        stats.fsyncs += 1;
        if matches!(self.sync_mode, WalSyncMode::GroupCommitMs(_)) {
            stats.group_commits += 1;
        }
        Ok(())
    }

    /// Flush everything written so far.
    pub fn flush_all(&self) -> Result<()> {
        let lsn = self.current_lsn();
        if lsn == 0 {
            return Ok(());
        }
        self.flush_through(lsn)
    }

    pub fn stats(&self) -> WalStats {
        self.stats.lock().clone()
    }

    /// Read every record across all segments in LSN order.
    ///
    /// A torn tail on the *last* segment is truncated silently; anything
    /// short or unreadable before that refuses to open (`CorruptLog`).
    pub fn read_all(dir: &Path) -> Result<Vec<WalRecord>> {
        let mut segments: Vec<(u64, PathBuf)> = Vec::new();
        if !dir.exists() {
            return Ok(Vec::new());
        }
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            if let Some(no) = entry
                .file_name()
                .to_str()
                .and_then(|s| s.strip_suffix(".log"))
                .and_then(|s| s.parse::<u64>().ok())
            {
                segments.push((no, entry.path()));
            }
        }
        segments.sort_by_key(|(no, _)| *no);
        for (i, (no, _)) in segments.iter().enumerate() {
            if *no != segments[0].0 + i as u64 {
                return Err(DbError::CorruptLog(format!(
                    "missing WAL segment {}",
                    segments[0].0 + i as u64
                )));
            }
        }

        let mut records = Vec::new();
        let last_idx = segments.len().saturating_sub(1);
        for (i, (_, path)) in segments.iter().enumerate() {
            let buf = std::fs::read(path)?;
            let mut pos = 0;
            while pos < buf.len() {
                match WalRecord::decode(&buf[pos..])? {
                    Some((rec, consumed)) => {
                        records.push(rec);
                        pos += consumed;
                    }
                    None => {
                        if i != last_idx {
                            return Err(DbError::CorruptLog(format!(
                                "segment {} ends mid-record",
                                path.display()
                            )));
                        }
                        // torn tail: the crash interrupted the final append
                        break;
                    }
                }
            }
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wal::record::PageDelta;

    fn update(page: u64) -> Payload {
        Payload::PageUpdate {
            deltas: vec![PageDelta {
                page_id: page,
                before: vec![0],
                after: vec![1],
            }],
            undo: None,
        }
    }

    #[test]
    fn test_append_flush_read() {
        let dir = tempfile::tempdir().unwrap();
        let wal = WalManager::open(dir.path(), 1, 1 << 20, WalSyncMode::FsyncOnCommit).unwrap();
        let l1 = wal.append(1, NO_LSN, Payload::Begin).unwrap();
        let l2 = wal.append(1, l1, update(5)).unwrap();
        let l3 = wal.append(1, l2, Payload::Commit).unwrap();
        wal.flush_through(l3).unwrap();
        assert!(wal.flushed_lsn() >= l3);

        let records = WalManager::read_all(dir.path()).unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].lsn, l1);
        assert_eq!(records[2].lsn, l3);
        assert_eq!(records[1].prev_lsn, l1);
    }

    #[test]
    fn test_segment_rotation() {
        let dir = tempfile::tempdir().unwrap();
        // tiny segment limit forces rotation almost every record
        let wal = WalManager::open(dir.path(), 1, 64, WalSyncMode::FsyncOnCommit).unwrap();
        let mut prev = NO_LSN;
        for _ in 0..10 {
            prev = wal.append(1, prev, update(9)).unwrap();
        }
        wal.flush_all().unwrap();
        let segs = std::fs::read_dir(dir.path()).unwrap().count();
        assert!(segs > 1);
        let records = WalManager::read_all(dir.path()).unwrap();
        assert_eq!(records.len(), 10);
    }

    #[test]
    fn test_torn_tail_truncated() {
        let dir = tempfile::tempdir().unwrap();
        {
            let wal =
                WalManager::open(dir.path(), 1, 1 << 20, WalSyncMode::FsyncOnCommit).unwrap();
            let l1 = wal.append(1, NO_LSN, update(1)).unwrap();
            wal.append(1, l1, update(2)).unwrap();
            wal.flush_all().unwrap();
        }
        // chop bytes off the single segment's end
        let seg = dir.path().join(segment_name(0));
        let bytes = std::fs::read(&seg).unwrap();
        std::fs::write(&seg, &bytes[..bytes.len() - 5]).unwrap();

        let records = WalManager::read_all(dir.path()).unwrap();
        assert_eq!(records.len(), 1);
    }

    #[test]
    fn test_reopen_continues_lsns() {
        let dir = tempfile::tempdir().unwrap();
        let last = {
            let wal =
                WalManager::open(dir.path(), 1, 1 << 20, WalSyncMode::FsyncOnCommit).unwrap();
            let l = wal.append(1, NO_LSN, Payload::Begin).unwrap();
            wal.flush_all().unwrap();
            l
        };
        let wal =
            WalManager::open(dir.path(), last + 1, 1 << 20, WalSyncMode::FsyncOnCommit).unwrap();
        let next = wal.append(2, NO_LSN, Payload::Begin).unwrap();
        assert!(next > last);
    }
}
