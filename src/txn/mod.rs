// Transactions: row locks with wait-die, WAL chains, rollback.

pub mod locks;
pub mod manager;

pub use locks::{LockManager, LockMode};
pub use manager::{Txn, TxnManager, TxnState, UndoTarget};
