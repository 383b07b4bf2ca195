// Row lock manager.
//
// Two-phase row locks keyed by (table, encoded primary key). Deadlocks are
// avoided with wait-die: an older transaction waits for a younger holder, a
// younger requester is aborted immediately. Transaction ids are assigned
// monotonically, so a smaller id means older.

use crate::common::{TableId, TxId};
use crate::error::{DbError, Result};
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

type LockKey = (TableId, Vec<u8>);

#[derive(Default)]
struct LockEntry {
    holders: Vec<(TxId, LockMode)>,
}

impl LockEntry {
    fn compatible(&self, txid: TxId, mode: LockMode) -> bool {
        match mode {
            LockMode::Shared => self
                .holders
                .iter()
                .all(|(t, m)| *t == txid || *m == LockMode::Shared),
            LockMode::Exclusive => self.holders.iter().all(|(t, _)| *t == txid),
        }
    }

    fn add(&mut self, txid: TxId, mode: LockMode) {
        if let Some(entry) = self.holders.iter_mut().find(|(t, _)| *t == txid) {
            // lock upgrade keeps the strongest mode
            if mode == LockMode::Exclusive {
                entry.1 = LockMode::Exclusive;
            }
        } else {
            self.holders.push((txid, mode));
        }
    }
}

pub struct LockManager {
    table: Mutex<HashMap<LockKey, LockEntry>>,
    released: Condvar,
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new()
    }
}

impl LockManager {
    pub fn new() -> Self {
        Self {
            table: Mutex::new(HashMap::new()),
            released: Condvar::new(),
        }
    }

    /// Acquire a row lock, blocking under wait-die. `deadline_ms` bounds the
    /// wait; exceeding it surfaces as `Timeout`.
    pub fn acquire(
        &self,
        txid: TxId,
        table: TableId,
        key: Vec<u8>,
        mode: LockMode,
        deadline_ms: u64,
    ) -> Result<()> {
        let lock_key = (table, key);
        let mut guard = self.table.lock();
        let deadline = std::time::Instant::now() + Duration::from_millis(deadline_ms);
        loop {
            let entry = guard.entry(lock_key.clone()).or_default();
            if entry.compatible(txid, mode) {
                entry.add(txid, mode);
                return Ok(());
            }
            // wait-die: waiting is allowed only when the requester is older
            // than every conflicting holder
            let oldest_holder = entry
                .holders
                .iter()
                .map(|(t, _)| *t)
                .min()
                .unwrap_or(TxId::MAX);
            if txid > oldest_holder {
                return Err(DbError::ConstraintDeadlockAborted(txid));
            }
            let timed_out = self
                .released
                .wait_until(&mut guard, deadline)
                .timed_out();
            if timed_out {
                return Err(DbError::Timeout);
            }
        }
    }

    /// Release every lock held by a transaction (end of two-phase locking).
    pub fn release_all(&self, txid: TxId) {
        let mut guard = self.table.lock();
        guard.retain(|_, entry| {
            entry.holders.retain(|(t, _)| *t != txid);
            !entry.holders.is_empty()
        });
        drop(guard);
        self.released.notify_all();
    }

    #[cfg(test)]
    fn held(&self, txid: TxId) -> usize {
        self.table
            .lock()
            .values()
            .filter(|e| e.holders.iter().any(|(t, _)| *t == txid))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shared_locks_coexist() {
        let lm = LockManager::new();
        lm.acquire(1, 0, b"k".to_vec(), LockMode::Shared, 100).unwrap();
        lm.acquire(2, 0, b"k".to_vec(), LockMode::Shared, 100).unwrap();
        assert_eq!(lm.held(1), 1);
        assert_eq!(lm.held(2), 1);
    }

    #[test]
    fn test_younger_writer_dies() {
        let lm = LockManager::new();
        lm.acquire(1, 0, b"k".to_vec(), LockMode::Exclusive, 100).unwrap();
        // txid 2 is younger than holder 1 -> die, not wait
        assert!(matches!(
            lm.acquire(2, 0, b"k".to_vec(), LockMode::Exclusive, 100),
            Err(DbError::ConstraintDeadlockAborted(2))
        ));
    }

    #[test]
    fn test_older_waits_then_acquires() {
        use std::sync::Arc;
        let lm = Arc::new(LockManager::new());
        lm.acquire(5, 0, b"k".to_vec(), LockMode::Exclusive, 100).unwrap();

        let lm2 = Arc::clone(&lm);
        let waiter = std::thread::spawn(move || {
            // txid 3 is older than holder 5, so it waits
            lm2.acquire(3, 0, b"k".to_vec(), LockMode::Exclusive, 5_000)
        });
        std::thread::sleep(Duration::from_millis(50));
        lm.release_all(5);
        assert!(waiter.join().unwrap().is_ok());
    }

    #[test]
    fn test_lock_upgrade() {
        let lm = LockManager::new();
        lm.acquire(1, 0, b"k".to_vec(), LockMode::Shared, 100).unwrap();
        lm.acquire(1, 0, b"k".to_vec(), LockMode::Exclusive, 100).unwrap();
        // another reader now conflicts
        assert!(lm.acquire(2, 0, b"k".to_vec(), LockMode::Shared, 10).is_err());
    }

    #[test]
    fn test_release_wakes_waiters() {
        let lm = LockManager::new();
        lm.acquire(2, 0, b"a".to_vec(), LockMode::Exclusive, 100).unwrap();
        lm.release_all(2);
        lm.acquire(9, 0, b"a".to_vec(), LockMode::Exclusive, 100).unwrap();
        assert_eq!(lm.held(9), 1);
    }
}
