// HMSSQL Core - storage, optimization, and execution engine
// Core library module

pub mod ast;
pub mod btree;
pub mod buffer;
pub mod catalog;
pub mod common;
pub mod engine;
pub mod error;
pub mod execution;
pub mod index;
pub mod optimizer;
pub mod stats;
pub mod storage;
pub mod txn;
pub mod wal;

pub use engine::Engine;
pub use error::{DbError, Result};

/// Install a process-wide stderr subscriber for the tracing events the
/// engine emits (recovery passes, checkpoints, optimizer warnings).
/// Repeat calls are no-ops, so test binaries can call it per test.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .with_test_writer()
        .try_init();
}

/// WAL durability policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalSyncMode {
    /// fsync before every commit returns
    FsyncOnCommit,
    /// batch commits inside a window, one fsync per group
    GroupCommitMs(u64),
}

/// Optimizer aggressiveness tiers (ordered).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum OptimizerLevel {
    /// access-path selection only, no join reordering
    Basic,
    /// transformations + left-deep Selinger enumeration
    Standard,
    /// bushy join shapes and bitmap-OR access paths
    Aggressive,
    /// everything, including speculative rules
    Experimental,
}

/// Statement isolation level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    ReadCommitted,
    RepeatableRead,
}

/// Engine configuration; one value owns every tunable.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// 4096 or 8192
    pub page_size_bytes: usize,
    /// page-cache capacity in frames
    pub buffer_pool_pages: usize,
    pub wal_sync_mode: WalSyncMode,
    /// B+ tree fan-out, validated >= 2
    pub tree_order: usize,
    pub sort_memory_bytes: usize,
    pub hash_memory_bytes: usize,
    pub optimizer_level: OptimizerLevel,
    pub plan_cache_entries: usize,
    /// row-count drift fraction that marks a statistics snapshot stale
    pub stats_stale_ratio: f64,
    pub isolation: IsolationLevel,
    pub query_timeout_ms: u64,
    /// join-enumeration time budget before falling back to greedy
    pub optimizer_budget_ms: u64,
    /// rows per operator batch
    pub batch_size: usize,
    /// WAL segment rotation size
    pub wal_segment_bytes: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            page_size_bytes: 4096,
            buffer_pool_pages: 1024,
            wal_sync_mode: WalSyncMode::FsyncOnCommit,
            tree_order: 50,
            sort_memory_bytes: 64 * 1024 * 1024,
            hash_memory_bytes: 64 * 1024 * 1024,
            optimizer_level: OptimizerLevel::Standard,
            plan_cache_entries: 256,
            stats_stale_ratio: 0.2,
            isolation: IsolationLevel::ReadCommitted,
            query_timeout_ms: 30_000,
            optimizer_budget_ms: 5_000,
            batch_size: 1024,
            wal_segment_bytes: 16 * 1024 * 1024,
        }
    }
}

impl EngineConfig {
    /// Validate tunables that have hard constraints.
    pub fn validate(&self) -> Result<()> {
        if self.page_size_bytes != 4096 && self.page_size_bytes != 8192 {
            return Err(DbError::InvalidArgument(format!(
                "page_size_bytes must be 4096 or 8192, got {}",
                self.page_size_bytes
            )));
        }
        if self.tree_order < 2 {
            return Err(DbError::InvalidArgument(format!(
                "tree_order must be >= 2, got {}",
                self.tree_order
            )));
        }
        if self.buffer_pool_pages < 8 {
            return Err(DbError::InvalidArgument(
                "buffer_pool_pages must be at least 8".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.stats_stale_ratio) {
            return Err(DbError::InvalidArgument(
                "stats_stale_ratio must be in [0, 1]".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(EngineConfig::default().validate().is_ok());
    }

    #[test]
    fn test_bad_page_size_rejected() {
        let cfg = EngineConfig {
            page_size_bytes: 1234,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_tree_order_floor() {
        let cfg = EngineConfig {
            tree_order: 1,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }
}
