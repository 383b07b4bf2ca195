// Write-ahead log: record framing, segmented writer with group commit,
// and crash recovery (analysis / redo / logical undo).

pub mod record;
pub mod recovery;
pub mod writer;

pub use record::{PageDelta, Payload, RecordKind, TreeUndo, WalRecord, NO_LSN};
pub use recovery::{LoserTx, Recovery, RecoveryReport};
pub use writer::{WalManager, WalStats};
