// Engine facade.
//
// One `Engine` value owns every long-lived resource; there are no hidden
// globals. The engine hosts databases as subdirectories of its root, each
// with its own catalog, WAL, buffer pool, trees, statistics, and caches.
// Lifecycle is open(dir, config) / close(). Sessions submit parsed
// statements and get rows or a status back.

use crate::ast::{Expr, Select, Statement};
use crate::btree::{BTree, KeyCodec, RangeCursor};
use crate::buffer::BufferPool;
use crate::catalog::{Catalog, Column, IndexDescriptor, TableDescriptor, ViewDescriptor};
use crate::common::{decode_row, encode_row, FileId, Row, Value};
use crate::error::{DbError, Result};
use crate::execution::expressions::{evaluate, truthy, Schema};
use crate::execution::{ExecContext, Executor, TreeProvider};
use crate::index::IndexManager;
use crate::optimizer::{
    ExecutionMetrics, Optimizer, PhysNode, PhysicalPlan, PlannerContext, ResultCache,
};
use crate::stats::{StatsCollector, DEFAULT_SAMPLE_SIZE};
use crate::storage::PageStore;
use crate::txn::{LockMode, Txn, TxnManager, UndoTarget};
use crate::wal::{Recovery, TreeUndo, WalManager};
use crate::{EngineConfig, IsolationLevel};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

pub const DEFAULT_DATABASE: &str = "default";

/// Result of one statement.
#[derive(Debug)]
pub struct StatementResult {
    pub schema: Schema,
    pub rows: Vec<Row>,
    pub stats: StatementStats,
}

#[derive(Debug, Clone, Default)]
pub struct StatementStats {
    pub rows: u64,
    pub ms: f64,
    pub plan_cache_hit: bool,
}

impl StatementResult {
    fn status(affected: u64, ms: f64) -> StatementResult {
        StatementResult {
            schema: Schema::default(),
            rows: Vec::new(),
            stats: StatementStats {
                rows: affected,
                ms,
                plan_cache_hit: false,
            },
        }
    }
}

/// Counters surfaced by `Database::stats`.
#[derive(Debug, Clone)]
pub struct DatabaseStats {
    pub wal: crate::wal::WalStats,
    pub buffer_pool: crate::buffer::BufferPoolStats,
    pub plan_cache_entries: usize,
    pub plan_cache_hits: u64,
    pub plan_cache_misses: u64,
    pub active_transactions: usize,
}

/// A client session: current database plus the open transaction, if any.
pub struct Session {
    pub id: u64,
    database: Mutex<String>,
    txn: Mutex<Option<Arc<Txn>>>,
}

// ----------------------------------------------------------------------
// worker pool
// ----------------------------------------------------------------------

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Fixed pool sized to the CPU count; carries background maintenance
/// (statistics refresh, checkpoints). Statements run on the submitting
/// thread; operators use rayon helpers for intra-operator parallelism.
struct WorkerPool {
    sender: Option<crossbeam::channel::Sender<Job>>,
    handles: Vec<std::thread::JoinHandle<()>>,
}

impl WorkerPool {
    fn new(workers: usize) -> WorkerPool {
        let (sender, receiver) = crossbeam::channel::unbounded::<Job>();
        let handles = (0..workers.max(1))
            .map(|i| {
                let rx = receiver.clone();
                std::thread::Builder::new()
                    .name(format!("hms-worker-{}", i))
                    .spawn(move || {
                        while let Ok(job) = rx.recv() {
                            job();
                        }
                    })
                    .expect("spawn worker")
            })
            .collect();
        WorkerPool {
            sender: Some(sender),
            handles,
        }
    }

    fn submit(&self, job: Job) {
        if let Some(sender) = &self.sender {
            let _ = sender.send(job);
        }
    }

    fn shutdown(&mut self) {
        self.sender = None;
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

// ----------------------------------------------------------------------
// per-database stack
// ----------------------------------------------------------------------

pub struct Database {
    name: String,
    dir: PathBuf,
    config: EngineConfig,
    store: Arc<PageStore>,
    wal: Arc<WalManager>,
    pool: Arc<BufferPool>,
    catalog: Arc<Catalog>,
    txns: Arc<TxnManager>,
    trees: DashMap<FileId, Arc<BTree>>,
    indexes: Arc<IndexManager>,
    stats: Arc<StatsCollector>,
    optimizer: Arc<Optimizer>,
    result_cache: Arc<ResultCache>,
    next_row_id: DashMap<String, Arc<AtomicU64>>,
    /// set on checksum corruption; refuses writes until repair
    poisoned: AtomicBool,
}

impl Database {
    fn table_path(dir: &Path, table: &str) -> PathBuf {
        dir.join("data").join(format!("{}.db", table))
    }

    fn index_path(dir: &Path, table: &str, index: &str) -> PathBuf {
        dir.join("data").join(format!("{}.{}.db", table, index))
    }

    pub fn open(name: &str, dir: &Path, config: &EngineConfig) -> Result<Arc<Database>> {
        std::fs::create_dir_all(dir.join("data"))?;
        std::fs::create_dir_all(dir.join("stats"))?;
        // stale spill files from an unclean exit are reclaimed here
        let tmp = dir.join("tmp");
        let _ = std::fs::remove_dir_all(&tmp);
        std::fs::create_dir_all(&tmp)?;

        let catalog = Arc::new(Catalog::open(dir)?);
        let store = Arc::new(PageStore::new(config.page_size_bytes));
        for table in catalog.tables() {
            store.register(table.file_id, &Self::table_path(dir, &table.name))?;
            for index in &table.indexes {
                store.register(index.file_id, &Self::index_path(dir, &table.name, &index.name))?;
            }
        }

        // recovery before anything touches pages through the pool
        let records = WalManager::read_all(&dir.join("wal"))?;
        let max_txid = records.iter().map(|r| r.txid).max().unwrap_or(0);
        let report = Recovery::new(&store, records).run()?;

        let wal = Arc::new(WalManager::open(
            &dir.join("wal"),
            report.last_lsn + 1,
            config.wal_segment_bytes,
            config.wal_sync_mode,
        )?);
        let pool = Arc::new(BufferPool::new(
            config.buffer_pool_pages,
            Arc::clone(&store),
            Arc::clone(&wal),
        ));
        let txns = Arc::new(TxnManager::new(Arc::clone(&wal), max_txid + 1));

        let db = Arc::new(Database {
            name: name.to_string(),
            dir: dir.to_path_buf(),
            config: config.clone(),
            store,
            wal,
            pool,
            catalog,
            txns,
            trees: DashMap::new(),
            indexes: Arc::new(IndexManager::new()),
            stats: Arc::new(StatsCollector::open(
                &dir.join("stats"),
                DEFAULT_SAMPLE_SIZE,
            )?),
            optimizer: Arc::new(Optimizer::new(
                config.optimizer_level,
                config.optimizer_budget_ms,
                config.plan_cache_entries,
            )),
            result_cache: Arc::new(ResultCache::new(256, 10_000)),
            next_row_id: DashMap::new(),
            poisoned: AtomicBool::new(false),
        });

        db.mount_trees()?;
        db.undo_losers(report.losers)?;
        info!(database = name, "database open");
        Ok(db)
    }

    fn mount_trees(&self) -> Result<()> {
        for table in self.catalog.tables() {
            let tree = BTree::open(
                &table.name,
                table.file_id,
                table.primary_key_epsilon(),
                Arc::clone(&self.pool),
                Arc::clone(&self.wal),
                Arc::clone(&self.store),
            )?;
            let tree = Arc::new(tree);
            // row-id keyed tables seed their counter from the largest key
            if table.primary_key_columns().is_empty() {
                let next = match tree.last_key()? {
                    Some(key) => match tree.codec().decode(&key)?.first() {
                        Some(Value::Integer(i)) => *i as u64 + 1,
                        _ => 1,
                    },
                    None => 1,
                };
                self.next_row_id
                    .insert(table.name.clone(), Arc::new(AtomicU64::new(next)));
            }
            self.trees.insert(table.file_id, tree);
            for index in &table.indexes {
                let itree = BTree::open(
                    &index.name,
                    index.file_id,
                    None,
                    Arc::clone(&self.pool),
                    Arc::clone(&self.wal),
                    Arc::clone(&self.store),
                )?;
                self.trees.insert(index.file_id, Arc::new(itree));
            }
        }
        Ok(())
    }

    /// Logical undo of loser transactions found by recovery; their inverse
    /// operations run through the normal tree code and end with an Abort.
    fn undo_losers(&self, losers: Vec<crate::wal::LoserTx>) -> Result<()> {
        struct Noop;
        impl UndoTarget for Noop {
            fn apply_undo(&self, _txn: &Txn, _undo: &TreeUndo) -> Result<()> {
                Ok(())
            }
        }
        for loser in losers {
            let txn = self.txns.adopt_loser(loser.txid, 0);
            for undo in &loser.undo_chain {
                self.apply_undo(&txn, undo)?;
            }
            // the in-memory undo list is empty; this just logs the abort
            self.txns.rollback(&txn, &Noop)?;
            info!(txid = loser.txid, "loser transaction rolled back");
        }
        self.pool.flush_all()?;
        Ok(())
    }

    fn tree(&self, file: FileId) -> Result<Arc<BTree>> {
        self.trees
            .get(&file)
            .map(|t| Arc::clone(&t))
            .ok_or_else(|| DbError::Internal(format!("no tree mounted for file {}", file)))
    }

    fn check_writable(&self) -> Result<()> {
        if self.poisoned.load(Ordering::Acquire) {
            return Err(DbError::Storage(format!(
                "database {} refuses writes until repair",
                self.name
            )));
        }
        Ok(())
    }

    fn poison_on_corruption(&self, err: &DbError) {
        if matches!(err, DbError::CorruptPage { .. } | DbError::CorruptLog(_)) {
            warn!(database = %self.name, %err, "corruption detected; refusing further writes");
            self.poisoned.store(true, Ordering::Release);
        }
    }

    // ------------------------------------------------------------------
    // planner context
    // ------------------------------------------------------------------

    fn planner_context(&self) -> PlannerContext {
        let mut snapshots = HashMap::new();
        let mut live_rows = HashMap::new();
        let mut tables = HashMap::new();
        let mut clustering = HashMap::new();
        for table in self.catalog.tables() {
            if let Some(id) = table.stats_snapshot {
                if let Some(snapshot) = self.stats.get(id) {
                    snapshots.insert(table.name.clone(), snapshot);
                }
            }
            if let Ok(tree) = self.tree(table.file_id) {
                live_rows.insert(table.name.clone(), tree.entry_count());
            }
            for index in &table.indexes {
                clustering.insert(index.name.clone(), self.indexes.clustering_factor(index.id));
            }
            tables.insert(table.name.clone(), table);
        }
        PlannerContext {
            snapshots,
            live_rows,
            tables,
            clustering,
            row_hints: HashMap::new(),
            page_size: self.config.page_size_bytes,
            sort_memory_bytes: self.config.sort_memory_bytes,
            hash_memory_bytes: self.config.hash_memory_bytes,
        }
    }

    // ------------------------------------------------------------------
    // SELECT
    // ------------------------------------------------------------------

    /// Optimize without executing; returns the physical plan the next
    /// execution of this statement would run.
    pub fn explain(&self, select: &Select) -> Result<Arc<PhysicalPlan>> {
        let optimized =
            self.optimizer
                .optimize(select, &self.catalog, self.planner_context())?;
        Ok(optimized.plan)
    }

    fn run_select(&self, select: &Select) -> Result<StatementResult> {
        let started = Instant::now();
        let optimized =
            self.optimizer
                .optimize(select, &self.catalog, self.planner_context())?;
        let result_key = optimized.cache_key.identity();

        if let Some(cached) = self.result_cache.get(result_key) {
            return Ok(StatementResult {
                schema: cached.schema.clone(),
                rows: cached.rows.clone(),
                stats: StatementStats {
                    rows: cached.rows.len() as u64,
                    ms: started.elapsed().as_secs_f64() * 1000.0,
                    plan_cache_hit: true,
                },
            });
        }

        let snapshot_lsn = match self.config.isolation {
            IsolationLevel::RepeatableRead => Some(self.wal.current_lsn()),
            IsolationLevel::ReadCommitted => None,
        };
        let ctx = ExecContext {
            catalog: &self.catalog,
            trees: self,
            batch_size: self.config.batch_size,
            deadline: started + Duration::from_millis(self.config.query_timeout_ms),
            snapshot_lsn,
            tmp_dir: self.dir.join("tmp"),
            sort_memory_bytes: self.config.sort_memory_bytes,
            hash_memory_bytes: self.config.hash_memory_bytes,
            spill_partitions: 16,
            cancelled: None,
        };
        let output = Executor::run(&optimized.plan, &ctx)?;
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;

        // adaptive feedback: repeated 10x mis-estimates poison the plan
        let metrics = ExecutionMetrics {
            plan_key: result_key,
            operators: output.operator_rows.clone(),
            elapsed_ms,
        };
        if self.optimizer.adaptive.record(&metrics) {
            self.optimizer.plan_cache.invalidate(&optimized.cache_key);
        }

        // results from a badly mis-estimated plan stay uncached so the
        // feedback loop keeps observing real executions
        let suspicious = output
            .operator_rows
            .first()
            .map(|(_, est, actual)| {
                let est = est.max(1.0);
                let actual = (*actual as f64).max(1.0);
                est / actual > 10.0 || actual / est > 10.0
            })
            .unwrap_or(false);
        if !suspicious {
            let tables = plan_tables(&optimized.plan);
            self.result_cache
                .insert(result_key, output.schema.clone(), output.rows.clone(), &tables);
        }

        Ok(StatementResult {
            stats: StatementStats {
                rows: output.rows.len() as u64,
                ms: elapsed_ms,
                plan_cache_hit: optimized.cache_hit,
            },
            schema: output.schema,
            rows: output.rows,
        })
    }

    // ------------------------------------------------------------------
    // DML
    // ------------------------------------------------------------------

    fn pk_values(&self, desc: &TableDescriptor, row: &Row, table: &str) -> Result<Vec<Value>> {
        let pk_cols = desc.primary_key_columns();
        if pk_cols.is_empty() {
            let counter = self
                .next_row_id
                .entry(table.to_string())
                .or_insert_with(|| Arc::new(AtomicU64::new(1)));
            let id = counter.fetch_add(1, Ordering::SeqCst);
            return Ok(vec![Value::Integer(id as i64)]);
        }
        Ok(pk_cols.iter().map(|i| row[*i].clone()).collect())
    }

    fn validate_row(&self, desc: &TableDescriptor, row: &Row) -> Result<()> {
        for (col, value) in desc.columns.iter().zip(row) {
            if value.is_null() && !col.nullable {
                return Err(DbError::NotNullViolation(col.name.clone()));
            }
            if !col.data_type.accepts(value) {
                return Err(DbError::TypeMismatch(format!(
                    "column {} expects {:?}, got {}",
                    col.name,
                    col.data_type,
                    value.type_name()
                )));
            }
        }
        Ok(())
    }

    fn insert_rows(
        &self,
        txn: &Arc<Txn>,
        table: &str,
        columns: &[String],
        value_rows: &[Vec<Expr>],
    ) -> Result<u64> {
        self.check_writable()?;
        let desc = self.catalog.table(table)?;
        let tree = self.tree(desc.file_id)?;
        let empty = Schema::default();

        // target positions: explicit column list or declaration order
        let positions: Vec<usize> = if columns.is_empty() {
            (0..desc.columns.len()).collect()
        } else {
            columns
                .iter()
                .map(|c| {
                    desc.column(c)
                        .map(|(i, _)| i)
                        .ok_or_else(|| DbError::NotFound(format!("column {}", c)))
                })
                .collect::<Result<_>>()?
        };

        let mut staged: Vec<(Vec<u8>, Vec<Value>, Row)> = Vec::with_capacity(value_rows.len());
        for exprs in value_rows {
            if exprs.len() != positions.len() {
                return Err(DbError::SchemaMismatch(format!(
                    "{} values for {} columns",
                    exprs.len(),
                    positions.len()
                )));
            }
            let mut row: Row = desc
                .columns
                .iter()
                .map(|c| c.default.clone().unwrap_or(Value::Null))
                .collect();
            for (pos, expr) in positions.iter().zip(exprs) {
                row[*pos] = evaluate(expr, &empty, &Vec::new())?;
            }
            self.validate_row(&desc, &row)?;
            let pk = self.pk_values(&desc, &row, table)?;
            let key = tree.codec().encode(&pk)?;
            staged.push((key, pk, row));
        }

        // row locks in primary-key order
        staged.sort_by(|a, b| a.0.cmp(&b.0));
        for (key, _, _) in &staged {
            self.txns.locks.acquire(
                txn.id(),
                desc.id,
                key.clone(),
                LockMode::Exclusive,
                self.config.query_timeout_ms,
            )?;
        }

        let index_codecs = self.index_codecs(&desc)?;
        for (key, pk, row) in &staged {
            if tree.get_encoded(key)?.is_some() {
                return Err(DbError::UniquenessViolation {
                    index: format!("{}.primary", table),
                    key: pk
                        .iter()
                        .map(|v| v.to_string())
                        .collect::<Vec<_>>()
                        .join(","),
                });
            }
            for (index, codec, itree) in &index_codecs {
                self.indexes.check_unique(index, codec, itree, &desc, row)?;
            }
            tree.insert_encoded(txn, key, &encode_row(row)?)?;
            for (index, codec, itree) in &index_codecs {
                self.indexes
                    .maintain(txn, &desc, index, codec, itree, None, Some((row, pk)))?;
            }
        }
        Ok(staged.len() as u64)
    }

    fn index_codecs(
        &self,
        desc: &TableDescriptor,
    ) -> Result<Vec<(IndexDescriptor, KeyCodec, Arc<BTree>)>> {
        desc.indexes
            .iter()
            .map(|index| {
                let codec = IndexManager::index_codec(desc, index)?;
                let tree = self.tree(index.file_id)?;
                Ok((index.clone(), codec, tree))
            })
            .collect()
    }

    /// Matching (pk bytes, pk values, row) set for an UPDATE/DELETE scan.
    fn collect_matches(
        &self,
        desc: &TableDescriptor,
        tree: &BTree,
        where_clause: Option<&Expr>,
    ) -> Result<Vec<(Vec<u8>, Vec<Value>, Row)>> {
        let schema = Schema::new(
            desc.columns
                .iter()
                .map(|c| format!("{}.{}", desc.name, c.name))
                .collect(),
        );
        let pk_cols = desc.primary_key_columns();
        let mut out = Vec::new();
        let mut cursor = RangeCursor::new(tree, None, None);
        while let Some((key, bytes)) = cursor.next()? {
            let row = decode_row(&bytes)?;
            let keep = match where_clause {
                Some(pred) => truthy(&evaluate(pred, &schema, &row)?),
                None => true,
            };
            if keep {
                let pk_values = if pk_cols.is_empty() {
                    tree.codec().decode(&key)?
                } else {
                    pk_cols.iter().map(|i| row[*i].clone()).collect()
                };
                out.push((key, pk_values, row));
            }
        }
        // lock acquisition happens in primary-key order
        out.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(out)
    }

    fn update_rows(
        &self,
        txn: &Arc<Txn>,
        table: &str,
        assignments: &[(String, Expr)],
        where_clause: Option<&Expr>,
    ) -> Result<u64> {
        self.check_writable()?;
        let desc = self.catalog.table(table)?;
        let tree = self.tree(desc.file_id)?;
        let schema = Schema::new(
            desc.columns
                .iter()
                .map(|c| format!("{}.{}", desc.name, c.name))
                .collect(),
        );

        let targets: Vec<(usize, &Expr)> = assignments
            .iter()
            .map(|(name, expr)| {
                desc.column(name)
                    .map(|(i, _)| (i, expr))
                    .ok_or_else(|| DbError::NotFound(format!("column {}", name)))
            })
            .collect::<Result<_>>()?;

        let matches = self.collect_matches(&desc, &tree, where_clause)?;
        for (key, _, _) in &matches {
            self.txns.locks.acquire(
                txn.id(),
                desc.id,
                key.clone(),
                LockMode::Exclusive,
                self.config.query_timeout_ms,
            )?;
        }

        let index_codecs = self.index_codecs(&desc)?;
        let pk_cols = desc.primary_key_columns();
        let mut affected = 0u64;
        for (old_key, old_pk, old_row) in &matches {
            let mut new_row = old_row.clone();
            for (i, expr) in &targets {
                new_row[*i] = evaluate(expr, &schema, old_row)?;
            }
            self.validate_row(&desc, &new_row)?;

            let new_pk: Vec<Value> = if pk_cols.is_empty() {
                old_pk.clone()
            } else {
                pk_cols.iter().map(|i| new_row[*i].clone()).collect()
            };
            let new_key = tree.codec().encode(&new_pk)?;

            if new_key != *old_key {
                if tree.get_encoded(&new_key)?.is_some() {
                    return Err(DbError::UniquenessViolation {
                        index: format!("{}.primary", table),
                        key: new_pk
                            .iter()
                            .map(|v| v.to_string())
                            .collect::<Vec<_>>()
                            .join(","),
                    });
                }
                self.txns.locks.acquire(
                    txn.id(),
                    desc.id,
                    new_key.clone(),
                    LockMode::Exclusive,
                    self.config.query_timeout_ms,
                )?;
                tree.delete_encoded(txn, old_key)?;
                tree.insert_encoded(txn, &new_key, &encode_row(&new_row)?)?;
            } else {
                tree.insert_encoded(txn, old_key, &encode_row(&new_row)?)?;
            }

            for (index, codec, itree) in &index_codecs {
                // only a changed indexed value can introduce a conflict;
                // an unchanged one would collide with the row's own entry
                let old_cols = IndexManager::index_columns(&desc, index, old_row)?;
                let new_cols = IndexManager::index_columns(&desc, index, &new_row)?;
                if old_cols != new_cols {
                    self.indexes
                        .check_unique(index, codec, itree, &desc, &new_row)?;
                }
                self.indexes.maintain(
                    txn,
                    &desc,
                    index,
                    codec,
                    itree,
                    Some((old_row, old_pk)),
                    Some((&new_row, &new_pk)),
                )?;
            }
            affected += 1;
        }
        Ok(affected)
    }

    fn delete_rows(
        &self,
        txn: &Arc<Txn>,
        table: &str,
        where_clause: Option<&Expr>,
    ) -> Result<u64> {
        self.check_writable()?;
        let desc = self.catalog.table(table)?;
        let tree = self.tree(desc.file_id)?;
        let matches = self.collect_matches(&desc, &tree, where_clause)?;
        for (key, _, _) in &matches {
            self.txns.locks.acquire(
                txn.id(),
                desc.id,
                key.clone(),
                LockMode::Exclusive,
                self.config.query_timeout_ms,
            )?;
        }
        let index_codecs = self.index_codecs(&desc)?;
        for (key, pk, row) in &matches {
            tree.delete_encoded(txn, key)?;
            for (index, codec, itree) in &index_codecs {
                self.indexes
                    .maintain(txn, &desc, index, codec, itree, Some((row, pk)), None)?;
            }
        }
        Ok(matches.len() as u64)
    }

    // ------------------------------------------------------------------
    // DDL
    // ------------------------------------------------------------------

    fn create_table(&self, txn: &Arc<Txn>, name: &str, columns: &[Column]) -> Result<()> {
        self.check_writable()?;
        if columns.is_empty() {
            return Err(DbError::InvalidArgument("table needs columns".into()));
        }
        let mut seen = std::collections::HashSet::new();
        for c in columns {
            if !seen.insert(&c.name) {
                return Err(DbError::InvalidArgument(format!(
                    "duplicate column {}",
                    c.name
                )));
            }
        }
        let file_id = self.catalog.allocate_file_id();
        let desc = TableDescriptor {
            id: 0,
            name: name.to_string(),
            columns: columns.to_vec(),
            file_id,
            indexes: Vec::new(),
            stats_snapshot: None,
        };
        let path = Self::table_path(&self.dir, name);
        if path.exists() {
            // orphan from a crash between tree create and catalog commit
            std::fs::remove_file(&path)?;
        }
        self.store.register(file_id, &path)?;
        let codec = match desc.primary_key_epsilon() {
            Some(eps) => KeyCodec::with_epsilon(desc.primary_key_type(), eps),
            None => KeyCodec::new(desc.primary_key_type()),
        };
        let tree = BTree::create(
            name,
            file_id,
            self.config.tree_order,
            codec,
            Arc::clone(&self.pool),
            Arc::clone(&self.wal),
            Arc::clone(&self.store),
            txn,
        )?;
        if desc.primary_key_columns().is_empty() {
            self.next_row_id
                .insert(name.to_string(), Arc::new(AtomicU64::new(1)));
        }
        self.trees.insert(file_id, Arc::new(tree));
        self.catalog.create_table(desc)?;
        // the catalog write is the linearization point
        self.catalog.save()?;
        self.optimizer.plan_cache.clear();
        Ok(())
    }

    fn drop_table(&self, name: &str) -> Result<()> {
        self.check_writable()?;
        let desc = self.catalog.drop_table(name)?;
        self.catalog.save()?;
        // dropped trees' pages are reclaimed once no reader holds them;
        // the Arc in `trees` is the reference count
        self.pool.discard_file(desc.file_id);
        self.store.unregister(desc.file_id);
        self.trees.remove(&desc.file_id);
        let _ = std::fs::remove_file(Self::table_path(&self.dir, name));
        for index in &desc.indexes {
            self.pool.discard_file(index.file_id);
            self.store.unregister(index.file_id);
            self.trees.remove(&index.file_id);
            self.indexes.drop_index_state(index.id);
            let _ = std::fs::remove_file(Self::index_path(&self.dir, name, &index.name));
        }
        self.next_row_id.remove(name);
        self.optimizer.plan_cache.clear();
        self.result_cache.bump(name);
        Ok(())
    }

    fn create_index(
        &self,
        txn: &Arc<Txn>,
        name: &str,
        table: &str,
        columns: &[String],
        unique: bool,
    ) -> Result<u64> {
        self.check_writable()?;
        let desc = self.catalog.table(table)?;
        if desc.index(name).is_some() {
            // idempotent: the finished index is already online
            return Ok(0);
        }
        for c in columns {
            if desc.column(c).is_none() {
                return Err(DbError::NotFound(format!("column {}", c)));
            }
        }
        let file_id = self.catalog.allocate_file_id();
        let index = IndexDescriptor {
            id: 0,
            name: name.to_string(),
            table: table.to_string(),
            columns: columns.to_vec(),
            unique,
            file_id,
        };
        let codec = IndexManager::index_codec(&desc, &index)?;
        let path = Self::index_path(&self.dir, table, name);
        if path.exists() {
            std::fs::remove_file(&path)?;
        }
        self.store.register(file_id, &path)?;
        let itree = BTree::create(
            name,
            file_id,
            self.config.tree_order,
            codec.clone(),
            Arc::clone(&self.pool),
            Arc::clone(&self.wal),
            Arc::clone(&self.store),
            txn,
        )?;
        let primary = self.tree(desc.file_id)?;
        let entries = self
            .indexes
            .build(txn, &desc, &index, &codec, &primary, &itree)?;
        self.trees.insert(file_id, Arc::new(itree));
        let registered = self.catalog.add_index(table, index)?;
        self.catalog.save()?;
        // the build tracked clustering under the placeholder id
        self.indexes.rekey(0, registered.id);
        self.optimizer.plan_cache.clear();
        Ok(entries)
    }

    fn drop_index(&self, table: &str, name: &str) -> Result<()> {
        self.check_writable()?;
        let removed = self.catalog.drop_index(table, name)?;
        self.catalog.save()?;
        self.pool.discard_file(removed.file_id);
        self.store.unregister(removed.file_id);
        self.trees.remove(&removed.file_id);
        self.indexes.drop_index_state(removed.id);
        let _ = std::fs::remove_file(Self::index_path(&self.dir, table, name));
        self.optimizer.plan_cache.clear();
        Ok(())
    }

    // ------------------------------------------------------------------
    // statistics
    // ------------------------------------------------------------------

    /// Collect and publish a fresh snapshot for one table.
    pub fn analyze(&self, table: &str) -> Result<()> {
        let desc = self.catalog.table(table)?;
        let tree = self.tree(desc.file_id)?;
        let index_trees: Vec<(String, Arc<BTree>)> = desc
            .indexes
            .iter()
            .map(|i| Ok((i.name.clone(), self.tree(i.file_id)?)))
            .collect::<Result<_>>()?;
        let index_refs: Vec<(String, &BTree)> = index_trees
            .iter()
            .map(|(n, t)| (n.clone(), t.as_ref()))
            .collect();
        // correlations for every numeric pair on narrow tables
        let numeric: Vec<usize> = desc
            .columns
            .iter()
            .enumerate()
            .filter(|(_, c)| {
                matches!(
                    c.data_type,
                    crate::catalog::DataType::Integer
                        | crate::catalog::DataType::Double
                        | crate::catalog::DataType::Decimal
                )
            })
            .map(|(i, _)| i)
            .collect();
        let mut pairs = Vec::new();
        if numeric.len() <= 8 {
            for (i, a) in numeric.iter().enumerate() {
                for b in &numeric[i + 1..] {
                    pairs.push((*a, *b));
                }
            }
        }
        let snapshot_id = self.catalog.next_snapshot_id();
        let snapshot = self
            .stats
            .collect(&desc, &tree, &index_refs, &pairs, snapshot_id)?;
        self.stats.publish(&self.catalog, snapshot)?;
        // snapshot replacement invalidates dependent plans by key mismatch
        Ok(())
    }

    fn maybe_refresh_stats(db: &Arc<Database>, table: &str, pool: &WorkerPool) {
        let Ok(desc) = db.catalog.table(table) else {
            return;
        };
        let Some(snapshot_id) = desc.stats_snapshot else {
            return;
        };
        let Some(snapshot) = db.stats.get(snapshot_id) else {
            return;
        };
        let Ok(tree) = db.tree(desc.file_id) else {
            return;
        };
        if StatsCollector::is_stale(&snapshot, tree.entry_count(), db.config.stats_stale_ratio) {
            let db = Arc::clone(db);
            let table = table.to_string();
            pool.submit(Box::new(move || {
                if let Err(e) = db.analyze(&table) {
                    warn!(table = %table, %e, "background statistics refresh failed");
                }
            }));
        }
    }

    // ------------------------------------------------------------------
    // lifecycle
    // ------------------------------------------------------------------

    pub fn checkpoint(&self) -> Result<()> {
        let active = self.txns.active_snapshot();
        let lsn = self.pool.checkpoint(active)?;
        info!(database = %self.name, lsn, "fuzzy checkpoint");
        Ok(())
    }

    /// Subsystem counters for monitoring hooks.
    pub fn stats(&self) -> DatabaseStats {
        let (plan_hits, plan_misses) = self.optimizer.plan_cache.hit_rate();
        DatabaseStats {
            wal: self.wal.stats(),
            buffer_pool: self.pool.stats(),
            plan_cache_entries: self.optimizer.plan_cache.len(),
            plan_cache_hits: plan_hits,
            plan_cache_misses: plan_misses,
            active_transactions: self.txns.active_count(),
        }
    }

    fn close(&self) -> Result<()> {
        self.pool.flush_all()?;
        self.checkpoint()?;
        self.catalog.save()?;
        let _ = std::fs::remove_dir_all(self.dir.join("tmp"));
        Ok(())
    }
}

impl TreeProvider for Database {
    fn primary(&self, table: &str) -> Result<Arc<BTree>> {
        let desc = self.catalog.table(table)?;
        self.tree(desc.file_id)
    }

    fn index(&self, table: &str, index: &str) -> Result<Arc<BTree>> {
        let desc = self.catalog.table(table)?;
        let idx = desc
            .index(index)
            .ok_or_else(|| DbError::NotFound(format!("index {}", index)))?;
        self.tree(idx.file_id)
    }
}

impl UndoTarget for Database {
    fn apply_undo(&self, txn: &Txn, undo: &TreeUndo) -> Result<()> {
        match undo {
            TreeUndo::Insert {
                file,
                key,
                old_value,
            } => {
                let tree = self.tree(*file)?;
                match old_value {
                    Some(v) => {
                        tree.insert_with_undo(txn, key, v, false)?;
                    }
                    None => {
                        tree.delete_with_undo(txn, key, false)?;
                    }
                }
            }
            TreeUndo::Delete {
                file,
                key,
                old_value,
            } => {
                let tree = self.tree(*file)?;
                tree.insert_with_undo(txn, key, old_value, false)?;
            }
        }
        Ok(())
    }
}

fn plan_tables(plan: &PhysicalPlan) -> Vec<String> {
    fn walk(plan: &PhysicalPlan, out: &mut Vec<String>) {
        match &plan.node {
            PhysNode::SeqScan { table, .. }
            | PhysNode::IndexScan { table, .. }
            | PhysNode::IndexOnlyScan { table, .. }
            | PhysNode::BitmapOrScan { table, .. }
            | PhysNode::IndexNestedLoopJoin { table, .. } => {
                if !out.contains(table) {
                    out.push(table.clone());
                }
            }
            _ => {}
        }
        for child in plan.children() {
            walk(child, out);
        }
    }
    let mut out = Vec::new();
    walk(plan, &mut out);
    out
}

// ----------------------------------------------------------------------
// engine
// ----------------------------------------------------------------------

pub struct Engine {
    root: PathBuf,
    config: EngineConfig,
    databases: DashMap<String, Arc<Database>>,
    workers: Mutex<WorkerPool>,
    next_session: AtomicU64,
}

impl Engine {
    /// Open the engine rooted at `dir`; the default database is created on
    /// first open.
    pub fn open(dir: &Path, config: EngineConfig) -> Result<Engine> {
        config.validate()?;
        std::fs::create_dir_all(dir)?;
        let engine = Engine {
            root: dir.to_path_buf(),
            config,
            databases: DashMap::new(),
            workers: Mutex::new(WorkerPool::new(num_cpus::get())),
            next_session: AtomicU64::new(1),
        };
        engine.open_database(DEFAULT_DATABASE)?;
        // mount any other database directories present
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    if name != DEFAULT_DATABASE && !engine.databases.contains_key(name) {
                        engine.open_database(name)?;
                    }
                }
            }
        }
        Ok(engine)
    }

    fn open_database(&self, name: &str) -> Result<Arc<Database>> {
        let db = Database::open(name, &self.root.join(name), &self.config)?;
        self.databases.insert(name.to_string(), Arc::clone(&db));
        Ok(db)
    }

    pub fn database(&self, name: &str) -> Result<Arc<Database>> {
        self.databases
            .get(name)
            .map(|d| Arc::clone(&d))
            .ok_or_else(|| DbError::NotFound(format!("database {}", name)))
    }

    pub fn create_session(&self) -> Session {
        Session {
            id: self.next_session.fetch_add(1, Ordering::SeqCst),
            database: Mutex::new(DEFAULT_DATABASE.to_string()),
            txn: Mutex::new(None),
        }
    }

    /// Execute one parsed statement for a session.
    pub fn execute(&self, session: &Session, stmt: &Statement) -> Result<StatementResult> {
        let started = Instant::now();
        let db = self.database(&session.database.lock().clone())?;

        let result = self.dispatch(session, &db, stmt, started);
        if let Err(e) = &result {
            db.poison_on_corruption(e);
            // statement-level failures roll back the implicit transaction;
            // explicit transactions are the session's to roll back
            if e.is_statement_level() {
                if let Some(txn) = session.txn.lock().take() {
                    let _ = db.txns.rollback(&txn, db.as_ref());
                }
            }
        }
        result
    }

    fn dispatch(
        &self,
        session: &Session,
        db: &Arc<Database>,
        stmt: &Statement,
        started: Instant,
    ) -> Result<StatementResult> {
        let ms = |s: Instant| s.elapsed().as_secs_f64() * 1000.0;
        match stmt {
            Statement::Begin => {
                let mut txn = session.txn.lock();
                if txn.is_some() {
                    return Err(DbError::Transaction("transaction already open".into()));
                }
                *txn = Some(db.txns.begin()?);
                Ok(StatementResult::status(0, ms(started)))
            }
            Statement::Commit => {
                let Some(txn) = session.txn.lock().take() else {
                    return Err(DbError::Transaction("no open transaction".into()));
                };
                db.txns.commit(&txn)?;
                Ok(StatementResult::status(0, ms(started)))
            }
            Statement::Rollback => {
                let Some(txn) = session.txn.lock().take() else {
                    return Err(DbError::Transaction("no open transaction".into()));
                };
                db.txns.rollback(&txn, db.as_ref())?;
                Ok(StatementResult::status(0, ms(started)))
            }
            Statement::Select(select) => db.run_select(select),
            Statement::Insert {
                table,
                columns,
                rows,
            } => self.write_statement(session, db, table, |txn| {
                db.insert_rows(txn, table, columns, rows)
            }),
            Statement::Update {
                table,
                assignments,
                where_clause,
            } => self.write_statement(session, db, table, |txn| {
                db.update_rows(txn, table, assignments, where_clause.as_ref())
            }),
            Statement::Delete {
                table,
                where_clause,
            } => self.write_statement(session, db, table, |txn| {
                db.delete_rows(txn, table, where_clause.as_ref())
            }),
            Statement::CreateTable { name, columns } => {
                self.ddl_statement(session, db, |txn| {
                    db.create_table(txn, name, columns)?;
                    Ok(0)
                })
            }
            Statement::DropTable { name } => {
                db.drop_table(name)?;
                Ok(StatementResult::status(0, ms(started)))
            }
            Statement::CreateIndex {
                name,
                table,
                columns,
                unique,
            } => self.ddl_statement(session, db, |txn| {
                db.create_index(txn, name, table, columns, *unique)
            }),
            Statement::DropIndex { name, table } => {
                db.drop_index(table, name)?;
                Ok(StatementResult::status(0, ms(started)))
            }
            Statement::CreateView { name, query } => {
                db.catalog.create_view(ViewDescriptor {
                    name: name.clone(),
                    query: Statement::Select(query.clone()),
                })?;
                db.catalog.save()?;
                db.optimizer.plan_cache.clear();
                Ok(StatementResult::status(0, ms(started)))
            }
            Statement::DropView { name } => {
                db.catalog.drop_view(name)?;
                db.catalog.save()?;
                db.optimizer.plan_cache.clear();
                Ok(StatementResult::status(0, ms(started)))
            }
            Statement::ShowTables => {
                let rows: Vec<Row> = db
                    .catalog
                    .tables()
                    .into_iter()
                    .map(|t| vec![Value::String(t.name)])
                    .collect();
                Ok(StatementResult {
                    schema: Schema::new(vec!["table".into()]),
                    stats: StatementStats {
                        rows: rows.len() as u64,
                        ms: ms(started),
                        plan_cache_hit: false,
                    },
                    rows,
                })
            }
            Statement::ShowIndexes { table } => {
                let mut rows: Vec<Row> = Vec::new();
                for t in db.catalog.tables() {
                    if table.as_deref().map(|n| n == t.name).unwrap_or(true) {
                        for i in &t.indexes {
                            rows.push(vec![
                                Value::String(t.name.clone()),
                                Value::String(i.name.clone()),
                                Value::String(i.columns.join(",")),
                                Value::Boolean(i.unique),
                            ]);
                        }
                    }
                }
                Ok(StatementResult {
                    schema: Schema::new(vec![
                        "table".into(),
                        "index".into(),
                        "columns".into(),
                        "unique".into(),
                    ]),
                    stats: StatementStats {
                        rows: rows.len() as u64,
                        ms: ms(started),
                        plan_cache_hit: false,
                    },
                    rows,
                })
            }
            Statement::Use { database } => {
                self.database(database)?; // must exist
                *session.database.lock() = database.clone();
                Ok(StatementResult::status(0, ms(started)))
            }
            Statement::CreateDatabase { name } => {
                if self.databases.contains_key(name) {
                    return Err(DbError::Catalog(format!("database {} exists", name)));
                }
                self.open_database(name)?;
                Ok(StatementResult::status(0, ms(started)))
            }
            Statement::DropDatabase { name } => {
                if name == DEFAULT_DATABASE {
                    return Err(DbError::InvalidArgument(
                        "the default database cannot be dropped".into(),
                    ));
                }
                let (_, dropped) = self
                    .databases
                    .remove(name)
                    .ok_or_else(|| DbError::NotFound(format!("database {}", name)))?;
                dropped.close()?;
                drop(dropped);
                std::fs::remove_dir_all(self.root.join(name))?;
                Ok(StatementResult::status(0, ms(started)))
            }
        }
    }

    /// DML wrapper: explicit transactions enlist, otherwise an implicit
    /// transaction commits (durably) before returning.
    fn write_statement(
        &self,
        session: &Session,
        db: &Arc<Database>,
        table: &str,
        f: impl FnOnce(&Arc<Txn>) -> Result<u64>,
    ) -> Result<StatementResult> {
        let started = Instant::now();
        let explicit = session.txn.lock().clone();
        let txn = match &explicit {
            Some(t) => Arc::clone(t),
            None => db.txns.begin()?,
        };
        match f(&txn) {
            Ok(affected) => {
                if explicit.is_none() {
                    db.txns.commit(&txn)?;
                }
                db.result_cache.bump(table);
                Database::maybe_refresh_stats(db, table, &self.workers.lock());
                Ok(StatementResult::status(
                    affected,
                    started.elapsed().as_secs_f64() * 1000.0,
                ))
            }
            Err(e) => {
                if explicit.is_none() {
                    let _ = db.txns.rollback(&txn, db.as_ref());
                }
                Err(e)
            }
        }
    }

    fn ddl_statement(
        &self,
        session: &Session,
        db: &Arc<Database>,
        f: impl FnOnce(&Arc<Txn>) -> Result<u64>,
    ) -> Result<StatementResult> {
        let started = Instant::now();
        // DDL always runs in its own transaction
        let _ = session;
        let txn = db.txns.begin()?;
        match f(&txn) {
            Ok(affected) => {
                db.txns.commit(&txn)?;
                Ok(StatementResult::status(
                    affected,
                    started.elapsed().as_secs_f64() * 1000.0,
                ))
            }
            Err(e) => {
                let _ = db.txns.rollback(&txn, db.as_ref());
                Err(e)
            }
        }
    }

    /// Flush everything and stop the workers.
    pub fn close(&self) -> Result<()> {
        for db in self.databases.iter() {
            db.close()?;
        }
        self.workers.lock().shutdown();
        info!("engine closed");
        Ok(())
    }
}
