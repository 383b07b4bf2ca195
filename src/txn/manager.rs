// Transaction lifecycle.
//
// Transactions chain their WAL records through prev-LSN, carry an in-memory
// undo list for fast rollback (crash rollback replays the same inverses
// from the log), and hold row locks until end of transaction.

use crate::common::{Lsn, TxId};
use crate::error::{DbError, Result};
use crate::txn::locks::LockManager;
use crate::wal::{Payload, TreeUndo, WalManager, NO_LSN};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnState {
    Active,
    Committing,
    Committed,
    Aborted,
}

pub struct Txn {
    id: TxId,
    state: Mutex<TxnState>,
    first_lsn: Mutex<Lsn>,
    last_lsn: Mutex<Lsn>,
    undo: Mutex<Vec<TreeUndo>>,
}

impl Txn {
    #[inline]
    pub fn id(&self) -> TxId {
        self.id
    }

    pub fn state(&self) -> TxnState {
        *self.state.lock()
    }

    #[inline]
    pub fn last_lsn(&self) -> Lsn {
        *self.last_lsn.lock()
    }

    pub fn first_lsn(&self) -> Lsn {
        *self.first_lsn.lock()
    }

    /// Record a newly appended WAL record in this transaction's chain.
    pub fn chain(&self, lsn: Lsn) {
        let mut first = self.first_lsn.lock();
        if *first == NO_LSN {
            *first = lsn;
        }
        *self.last_lsn.lock() = lsn;
    }

    /// Remember the logical inverse for in-process rollback.
    pub fn push_undo(&self, undo: TreeUndo) {
        self.undo.lock().push(undo);
    }

    fn take_undo(&self) -> Vec<TreeUndo> {
        std::mem::take(&mut self.undo.lock())
    }
}

/// Applies a logical inverse through the owning tree; implemented by the
/// engine, which owns the tree registry.
pub trait UndoTarget {
    fn apply_undo(&self, txn: &Txn, undo: &TreeUndo) -> Result<()>;
}

pub struct TxnManager {
    next_txid: AtomicU64,
    active: DashMap<TxId, Arc<Txn>>,
    wal: Arc<WalManager>,
    pub locks: LockManager,
}

impl TxnManager {
    pub fn new(wal: Arc<WalManager>, first_txid: TxId) -> Self {
        Self {
            next_txid: AtomicU64::new(first_txid.max(1)),
            active: DashMap::new(),
            wal,
            locks: LockManager::new(),
        }
    }

    /// Begin a transaction; the Begin record anchors its WAL chain.
    pub fn begin(&self) -> Result<Arc<Txn>> {
        let id = self.next_txid.fetch_add(1, Ordering::SeqCst);
        let lsn = self.wal.append(id, NO_LSN, Payload::Begin)?;
        let txn = Arc::new(Txn {
            id,
            state: Mutex::new(TxnState::Active),
            first_lsn: Mutex::new(lsn),
            last_lsn: Mutex::new(lsn),
            undo: Mutex::new(Vec::new()),
        });
        self.active.insert(id, Arc::clone(&txn));
        debug!(txid = id, "begin");
        Ok(txn)
    }

    /// Commit: the commit record must be durable before we return (WAL2),
    /// then locks drop and the transaction leaves the active table.
    pub fn commit(&self, txn: &Arc<Txn>) -> Result<Lsn> {
        {
            let mut state = txn.state.lock();
            if *state != TxnState::Active {
                return Err(DbError::Transaction(format!(
                    "commit of {:?} transaction {}",
                    *state, txn.id
                )));
            }
            *state = TxnState::Committing;
        }
        let lsn = self.wal.append(txn.id, txn.last_lsn(), Payload::Commit)?;
        txn.chain(lsn);
        self.wal.flush_through(lsn)?;
        *txn.state.lock() = TxnState::Committed;
        txn.undo.lock().clear();
        self.locks.release_all(txn.id);
        self.active.remove(&txn.id);
        debug!(txid = txn.id, lsn, "commit durable");
        Ok(lsn)
    }

    /// Roll back by applying the in-memory undo list in reverse, then log
    /// the abort. The compensations the trees log during this walk carry no
    /// undo hints, so crash recovery never un-does an undo.
    pub fn rollback(&self, txn: &Arc<Txn>, target: &dyn UndoTarget) -> Result<()> {
        {
            let mut state = txn.state.lock();
            if *state == TxnState::Committed {
                return Err(DbError::Transaction(format!(
                    "rollback of committed transaction {}",
                    txn.id
                )));
            }
            *state = TxnState::Aborted;
        }
        let undos = txn.take_undo();
        for undo in undos.iter().rev() {
            target.apply_undo(txn, undo)?;
        }
        let lsn = self.wal.append(txn.id, txn.last_lsn(), Payload::Abort)?;
        txn.chain(lsn);
        self.wal.flush_through(lsn)?;
        self.locks.release_all(txn.id);
        self.active.remove(&txn.id);
        debug!(txid = txn.id, "rolled back");
        Ok(())
    }

    /// Register a recovered loser so its undo can run through the trees
    /// with a live transaction chain, then abort it.
    pub fn adopt_loser(&self, txid: TxId, last_lsn: Lsn) -> Arc<Txn> {
        let txn = Arc::new(Txn {
            id: txid,
            state: Mutex::new(TxnState::Active),
            first_lsn: Mutex::new(last_lsn),
            last_lsn: Mutex::new(last_lsn),
            undo: Mutex::new(Vec::new()),
        });
        self.active.insert(txid, Arc::clone(&txn));
        self.next_txid.fetch_max(txid + 1, Ordering::SeqCst);
        txn
    }

    /// Snapshot of active transactions for a fuzzy checkpoint.
    pub fn active_snapshot(&self) -> Vec<(TxId, Lsn)> {
        self.active
            .iter()
            .map(|e| (e.value().id, e.value().last_lsn()))
            .collect()
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::WalSyncMode;

    fn manager() -> (tempfile::TempDir, TxnManager) {
        let dir = tempfile::tempdir().unwrap();
        let wal = Arc::new(
            WalManager::open(
                &dir.path().join("wal"),
                1,
                1 << 20,
                WalSyncMode::FsyncOnCommit,
            )
            .unwrap(),
        );
        (dir, TxnManager::new(wal, 1))
    }

    struct NoopTarget;
    impl UndoTarget for NoopTarget {
        fn apply_undo(&self, _txn: &Txn, _undo: &TreeUndo) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_begin_commit_lifecycle() {
        let (_dir, mgr) = manager();
        let txn = mgr.begin().unwrap();
        assert_eq!(txn.state(), TxnState::Active);
        assert_eq!(mgr.active_count(), 1);
        mgr.commit(&txn).unwrap();
        assert_eq!(txn.state(), TxnState::Committed);
        assert_eq!(mgr.active_count(), 0);
    }

    #[test]
    fn test_double_commit_rejected() {
        let (_dir, mgr) = manager();
        let txn = mgr.begin().unwrap();
        mgr.commit(&txn).unwrap();
        assert!(mgr.commit(&txn).is_err());
    }

    #[test]
    fn test_rollback_applies_undo_in_reverse() {
        use std::sync::Mutex as StdMutex;
        struct Recorder(StdMutex<Vec<Vec<u8>>>);
        impl UndoTarget for Recorder {
            fn apply_undo(&self, _txn: &Txn, undo: &TreeUndo) -> Result<()> {
                if let TreeUndo::Insert { key, .. } = undo {
                    self.0.lock().unwrap().push(key.clone());
                }
                Ok(())
            }
        }

        let (_dir, mgr) = manager();
        let txn = mgr.begin().unwrap();
        for k in [vec![1], vec![2], vec![3]] {
            txn.push_undo(TreeUndo::Insert {
                file: 0,
                key: k,
                old_value: None,
            });
        }
        let recorder = Recorder(StdMutex::new(Vec::new()));
        mgr.rollback(&txn, &recorder).unwrap();
        assert_eq!(
            *recorder.0.lock().unwrap(),
            vec![vec![3], vec![2], vec![1]]
        );
    }

    #[test]
    fn test_txids_monotonic() {
        let (_dir, mgr) = manager();
        let a = mgr.begin().unwrap();
        let b = mgr.begin().unwrap();
        assert!(b.id() > a.id());
    }
}
