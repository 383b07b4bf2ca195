// Crash recovery: analysis, redo, undo.
//
// Runs at engine open, before the buffer pool touches any page. Redo is
// physical and page-LSN guarded, applied straight to the page store. Undo
// is logical: the engine replays each loser transaction's inverse tree
// operations (collected here in reverse prev-LSN order) through the normal
// tree code once the trees are mounted, then appends an Abort record.

use crate::common::{page_file, page_no, Lsn, PageId, TxId};
use crate::error::{DbError, Result};
use crate::storage::page::{PageBuf, PageKind};
use crate::storage::PageStore;
use crate::wal::record::{Payload, RecordKind, TreeUndo, WalRecord, NO_LSN};
use std::collections::HashMap;
use tracing::{debug, info, warn};

/// Outcome of the analysis + redo passes.
#[derive(Debug, Default)]
pub struct RecoveryReport {
    pub last_lsn: Lsn,
    pub redone: usize,
    pub checkpoint_lsn: Lsn,
    /// Loser transactions with their inverse operations, innermost last
    /// write first; the engine drains these through the trees.
    pub losers: Vec<LoserTx>,
}

/// A transaction that never reached its commit record.
#[derive(Debug)]
pub struct LoserTx {
    pub txid: TxId,
    /// Inverse operations in reverse prev-LSN order.
    pub undo_chain: Vec<TreeUndo>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxState {
    Active,
    Committed,
    Aborted,
}

struct TxEntry {
    state: TxState,
    last_lsn: Lsn,
}

pub struct Recovery<'a> {
    store: &'a PageStore,
    records: Vec<WalRecord>,
}

impl<'a> Recovery<'a> {
    pub fn new(store: &'a PageStore, records: Vec<WalRecord>) -> Self {
        Self { store, records }
    }

    /// Run analysis and redo; returns the losers for the engine's logical
    /// undo pass.
    pub fn run(self) -> Result<RecoveryReport> {
        if self.records.is_empty() {
            return Ok(RecoveryReport::default());
        }
        let mut report = RecoveryReport {
            last_lsn: self.records.last().map(|r| r.lsn).unwrap_or(0),
            ..Default::default()
        };

        let (att, dpt, checkpoint_lsn) = self.analysis();
        report.checkpoint_lsn = checkpoint_lsn;
        info!(
            active = att.values().filter(|e| e.state == TxState::Active).count(),
            dirty_pages = dpt.len(),
            checkpoint_lsn,
            "recovery analysis complete"
        );

        report.redone = self.redo(&dpt)?;
        report.losers = self.collect_losers(&att);
        self.store.sync_all()?;
        info!(
            redone = report.redone,
            losers = report.losers.len(),
            "redo complete"
        );
        Ok(report)
    }

    /// Rebuild the transaction table and dirty-page table from the last
    /// checkpoint forward.
    fn analysis(&self) -> (HashMap<TxId, TxEntry>, HashMap<PageId, Lsn>, Lsn) {
        let mut checkpoint_idx = 0usize;
        let mut checkpoint_lsn = NO_LSN;
        for (i, rec) in self.records.iter().enumerate() {
            if rec.payload.kind() == RecordKind::Checkpoint {
                checkpoint_idx = i;
                checkpoint_lsn = rec.lsn;
            }
        }

        let mut att: HashMap<TxId, TxEntry> = HashMap::new();
        let mut dpt: HashMap<PageId, Lsn> = HashMap::new();

        if let Some(rec) = self.records.get(checkpoint_idx) {
            if let Payload::Checkpoint {
                active_txs,
                dirty_pages,
            } = &rec.payload
            {
                for (txid, last_lsn) in active_txs {
                    att.insert(
                        *txid,
                        TxEntry {
                            state: TxState::Active,
                            last_lsn: *last_lsn,
                        },
                    );
                }
                for (page, rec_lsn) in dirty_pages {
                    dpt.insert(*page, *rec_lsn);
                }
            }
        }

        for rec in &self.records[checkpoint_idx..] {
            match &rec.payload {
                Payload::Begin => {
                    att.insert(
                        rec.txid,
                        TxEntry {
                            state: TxState::Active,
                            last_lsn: rec.lsn,
                        },
                    );
                }
                Payload::Commit => {
                    if let Some(e) = att.get_mut(&rec.txid) {
                        e.state = TxState::Committed;
                        e.last_lsn = rec.lsn;
                    }
                }
                Payload::Abort => {
                    if let Some(e) = att.get_mut(&rec.txid) {
                        e.state = TxState::Aborted;
                        e.last_lsn = rec.lsn;
                    }
                }
                Payload::PageUpdate { deltas, .. } => {
                    if let Some(e) = att.get_mut(&rec.txid) {
                        e.last_lsn = rec.lsn;
                    }
                    for d in deltas {
                        dpt.entry(d.page_id).or_insert(rec.lsn);
                    }
                }
                Payload::AllocPage { file, page_no, .. } => {
                    let id = crate::common::page_id(*file, *page_no);
                    dpt.entry(id).or_insert(rec.lsn);
                }
                Payload::FreePage { page_id } => {
                    dpt.entry(*page_id).or_insert(rec.lsn);
                }
                Payload::Checkpoint { .. } => {}
            }
        }
        (att, dpt, checkpoint_lsn)
    }

    /// Reapply every change with LSN >= the recovery LSN whose page is
    /// either missing, torn, or carries an older page-LSN.
    fn redo(&self, dpt: &HashMap<PageId, Lsn>) -> Result<usize> {
        let recovery_lsn = dpt.values().copied().min().unwrap_or(NO_LSN);
        let mut applied = 0usize;
        for rec in &self.records {
            if rec.lsn < recovery_lsn {
                continue;
            }
            match &rec.payload {
                Payload::AllocPage { file, page_no, kind } => {
                    if self.redo_alloc(*file, *page_no, *kind, rec.lsn)? {
                        applied += 1;
                    }
                }
                Payload::FreePage { page_id } => {
                    if self.redo_free(*page_id, rec.lsn)? {
                        applied += 1;
                    }
                }
                Payload::PageUpdate { deltas, .. } => {
                    for d in deltas {
                        if self.redo_image(d.page_id, &d.after, rec.lsn)? {
                            applied += 1;
                        }
                    }
                }
                _ => {}
            }
        }
        Ok(applied)
    }

    fn redo_alloc(&self, file: u32, no: u32, kind: u32, lsn: Lsn) -> Result<bool> {
        if !self.store.contains(file) {
            // tree file dropped after this record; nothing to redo
            return Ok(false);
        }
        let dm = self.store.file(file)?;
        while dm.page_count() <= no {
            dm.extend()?;
        }
        let id = crate::common::page_id(file, no);
        match dm.read_page(no, id) {
            Ok(page) if page.lsn() >= lsn => Ok(false),
            _ => {
                let kind = PageKind::from_u32(kind)
                    .ok_or_else(|| DbError::CorruptLog(format!("alloc with bad kind {}", kind)))?;
                let mut page = PageBuf::new(kind, dm.page_size());
                page.set_lsn(lsn);
                page.seal();
                dm.write_page(no, &page)?;
                Ok(true)
            }
        }
    }

    fn redo_free(&self, page_id: PageId, lsn: Lsn) -> Result<bool> {
        let file = page_file(page_id);
        if !self.store.contains(file) {
            return Ok(false);
        }
        let dm = self.store.file(file)?;
        let no = page_no(page_id);
        if dm.page_count() <= no {
            return Ok(false);
        }
        match dm.read_page(no, page_id) {
            Ok(page) if page.lsn() >= lsn => Ok(false),
            _ => {
                let mut page = PageBuf::new(PageKind::Free, dm.page_size());
                page.set_lsn(lsn);
                page.seal();
                dm.write_page(no, &page)?;
                Ok(true)
            }
        }
    }

    fn redo_image(&self, page_id: PageId, after: &[u8], lsn: Lsn) -> Result<bool> {
        let file = page_file(page_id);
        if !self.store.contains(file) {
            return Ok(false);
        }
        let dm = self.store.file(file)?;
        let no = page_no(page_id);
        while dm.page_count() <= no {
            dm.extend()?;
        }
        let apply = match dm.read_page(no, page_id) {
            Ok(page) => page.lsn() < lsn,
            Err(DbError::CorruptPage { .. }) => {
                // torn page: the full after-image reconstructs it
                warn!(page_id, "torn page rebuilt from WAL");
                true
            }
            Err(e) => return Err(e),
        };
        if !apply {
            return Ok(false);
        }
        let mut page = PageBuf::from_bytes(page_id, after.to_vec())?;
        page.set_lsn(lsn);
        page.seal();
        dm.write_page(no, &page)?;
        debug!(page_id, lsn, "redo applied");
        Ok(true)
    }

    /// Walk each loser's prev-LSN chain backwards collecting inverse
    /// operations. Compensation records (no undo hint) are skipped, which
    /// keeps a crash-during-undo re-run idempotent.
    fn collect_losers(&self, att: &HashMap<TxId, TxEntry>) -> Vec<LoserTx> {
        let by_lsn: HashMap<Lsn, &WalRecord> =
            self.records.iter().map(|r| (r.lsn, r)).collect();
        let mut losers = Vec::new();
        for (txid, entry) in att {
            if entry.state != TxState::Active {
                continue;
            }
            let mut chain = Vec::new();
            let mut cursor = entry.last_lsn;
            while cursor != NO_LSN {
                let Some(rec) = by_lsn.get(&cursor) else {
                    break;
                };
                if let Payload::PageUpdate {
                    undo: Some(undo), ..
                } = &rec.payload
                {
                    chain.push(undo.clone());
                }
                cursor = rec.prev_lsn;
            }
            debug!(txid, ops = chain.len(), "loser transaction queued for undo");
            losers.push(LoserTx {
                txid: *txid,
                undo_chain: chain,
            });
        }
        losers.sort_by_key(|l| l.txid);
        losers
    }
}
