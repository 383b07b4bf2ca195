// Scan operators: sequential, index, index-only, bitmap OR.
//
// Scans resume through a saved key instead of holding a cursor (and its
// page pins) across batches. Under repeatable read a snapshot LSN is
// captured at open; tuples from leaves stamped past it are skipped.

use crate::ast::Expr;
use crate::btree::{prefix_successor, BTree, KeyCodec, KeyType, RangeCursor};
use crate::common::{decode_row, Lsn, Row, Value};
use crate::error::Result;
use crate::execution::expressions::{evaluate, truthy, Schema};
use crate::execution::{ExecContext, Operator};
use crate::optimizer::IndexBounds;
use std::collections::BTreeSet;
use std::sync::Arc;

/// Byte-range bounds for a tree scan.
type ByteBound = Option<(Vec<u8>, bool)>;

fn filter_row(
    filter: &Option<Expr>,
    schema: &Schema,
    row: &Row,
) -> Result<bool> {
    match filter {
        Some(f) => Ok(truthy(&evaluate(f, schema, row)?)),
        None => Ok(true),
    }
}

// ----------------------------------------------------------------------
// SeqScan
// ----------------------------------------------------------------------

pub struct SeqScan {
    table: String,
    #[allow(dead_code)]
    alias: String,
    filter: Option<Expr>,
    schema: Schema,
    tree: Option<Arc<BTree>>,
    resume: ByteBound,
    snapshot: Option<Lsn>,
    done: bool,
}

impl SeqScan {
    pub fn new(table: String, alias: String, filter: Option<Expr>, schema: Schema) -> Self {
        Self {
            table,
            alias,
            filter,
            schema,
            tree: None,
            resume: None,
            snapshot: None,
            done: false,
        }
    }
}

impl Operator for SeqScan {
    fn open(&mut self, ctx: &ExecContext<'_>) -> Result<()> {
        self.tree = Some(ctx.trees.primary(&self.table)?);
        self.snapshot = ctx.snapshot_lsn;
        self.resume = None;
        self.done = false;
        Ok(())
    }

    fn next_batch(&mut self, ctx: &ExecContext<'_>) -> Result<Option<Vec<Row>>> {
        if self.done {
            return Ok(None);
        }
        ctx.check_deadline()?;
        let tree = self.tree.as_ref().expect("open not called");
        let mut cursor =
            RangeCursor::new(tree, self.resume.clone(), None).with_snapshot(self.snapshot);
        let raw = cursor.next_batch(ctx.batch_size)?;
        if raw.is_empty() {
            self.done = true;
            return Ok(None);
        }
        self.resume = raw.last().map(|(k, _)| (k.clone(), false));
        let mut out = Vec::with_capacity(raw.len());
        for (_, bytes) in raw {
            let row = decode_row(&bytes)?;
            if filter_row(&self.filter, &self.schema, &row)? {
                out.push(row);
            }
        }
        Ok(Some(out))
    }

    fn close(&mut self, _ctx: &ExecContext<'_>) -> Result<()> {
        self.tree = None;
        Ok(())
    }

    fn schema(&self) -> &Schema {
        &self.schema
    }
}

// ----------------------------------------------------------------------
// IndexScan / IndexOnlyScan
// ----------------------------------------------------------------------

pub struct IndexScan {
    table: String,
    #[allow(dead_code)]
    alias: String,
    index: String,
    bounds: IndexBounds,
    filter: Option<Expr>,
    schema: Schema,
    covered: bool,
    index_tree: Option<Arc<BTree>>,
    primary: Option<Arc<BTree>>,
    lo: ByteBound,
    hi: ByteBound,
    snapshot: Option<Lsn>,
    done: bool,
}

impl IndexScan {
    pub fn new(
        table: String,
        alias: String,
        index: String,
        bounds: IndexBounds,
        filter: Option<Expr>,
        schema: Schema,
        covered: bool,
    ) -> Self {
        Self {
            table,
            alias,
            index,
            bounds,
            filter,
            schema,
            covered,
            index_tree: None,
            primary: None,
            lo: None,
            hi: None,
            snapshot: None,
            done: false,
        }
    }
}

/// Translate typed bounds into encoded byte bounds for the index tree.
pub fn encode_bounds(codec: &KeyCodec, bounds: &IndexBounds) -> Result<(ByteBound, ByteBound)> {
    let arity = codec.key_type.arity();
    let n_eq = bounds.eq_prefix.len();

    if let KeyType::Composite(_) = codec.key_type {
        let prefix = codec.encode_prefix(&bounds.eq_prefix, n_eq)?;
        let mut lo = (prefix.clone(), true);
        let mut hi = match prefix_successor(&prefix) {
            Some(s) => Some((s, false)),
            None => None,
        };
        if bounds.lo.is_some() || bounds.hi.is_some() {
            if let Some((v, inclusive)) = &bounds.lo {
                let mut vals = bounds.eq_prefix.clone();
                vals.push(v.clone());
                lo = (codec.encode_prefix(&vals, n_eq + 1)?, *inclusive);
            }
            if let Some((v, inclusive)) = &bounds.hi {
                let mut vals = bounds.eq_prefix.clone();
                vals.push(v.clone());
                let bytes = codec.encode_prefix(&vals, n_eq + 1)?;
                hi = Some(if *inclusive {
                    // include every full key extending the bounded prefix
                    match prefix_successor(&bytes) {
                        Some(s) => (s, false),
                        None => (bytes, true),
                    }
                } else {
                    (bytes, false)
                });
            }
        }
        if n_eq == 0 && bounds.lo.is_none() && bounds.hi.is_none() {
            return Ok((None, None));
        }
        return Ok((Some(lo), hi));
    }

    // single-column key
    debug_assert_eq!(arity, 1);
    if n_eq == 1 {
        let key = codec.encode(&bounds.eq_prefix)?;
        return Ok((Some((key.clone(), true)), Some((key, true))));
    }
    let lo = match &bounds.lo {
        Some((v, inclusive)) => Some((codec.encode(std::slice::from_ref(v))?, *inclusive)),
        None => None,
    };
    let hi = match &bounds.hi {
        Some((v, inclusive)) => Some((codec.encode(std::slice::from_ref(v))?, *inclusive)),
        None => None,
    };
    Ok((lo, hi))
}

impl Operator for IndexScan {
    fn open(&mut self, ctx: &ExecContext<'_>) -> Result<()> {
        let index_tree = ctx.trees.index(&self.table, &self.index)?;
        let (lo, hi) = encode_bounds(index_tree.codec(), &self.bounds)?;
        self.lo = lo;
        self.hi = hi;
        self.index_tree = Some(index_tree);
        if !self.covered {
            self.primary = Some(ctx.trees.primary(&self.table)?);
        }
        self.snapshot = ctx.snapshot_lsn;
        self.done = false;
        Ok(())
    }

    fn next_batch(&mut self, ctx: &ExecContext<'_>) -> Result<Option<Vec<Row>>> {
        if self.done {
            return Ok(None);
        }
        ctx.check_deadline()?;
        let index_tree = self.index_tree.as_ref().expect("open not called");
        let mut cursor = RangeCursor::new(index_tree, self.lo.clone(), self.hi.clone())
            .with_snapshot(self.snapshot);
        let entries = cursor.next_batch(ctx.batch_size)?;
        if entries.is_empty() {
            self.done = true;
            return Ok(None);
        }
        self.lo = entries.last().map(|(k, _)| (k.clone(), false));

        let mut out = Vec::with_capacity(entries.len());
        if self.covered {
            for (key, _) in entries {
                let decoded = index_tree.codec().decode(&key)?;
                let row: Row = decoded
                    .into_iter()
                    .take(self.schema.columns.len())
                    .collect();
                if filter_row(&self.filter, &self.schema, &row)? {
                    out.push(row);
                }
            }
        } else {
            let primary = self.primary.as_ref().expect("open not called");
            for (_, pk_bytes) in entries {
                let Some(row_bytes) = primary.get_encoded(&pk_bytes)? else {
                    // entry pointing at a row deleted by a concurrent
                    // statement; skip
                    continue;
                };
                let row = decode_row(&row_bytes)?;
                if filter_row(&self.filter, &self.schema, &row)? {
                    out.push(row);
                }
            }
        }
        Ok(Some(out))
    }

    fn close(&mut self, _ctx: &ExecContext<'_>) -> Result<()> {
        self.index_tree = None;
        self.primary = None;
        Ok(())
    }

    fn schema(&self) -> &Schema {
        &self.schema
    }
}

// ----------------------------------------------------------------------
// BitmapOrScan
// ----------------------------------------------------------------------

/// Runs each index probe, ORs the matching primary keys, then fetches the
/// rows in primary-key order (one ordered pass over the heap).
pub struct BitmapOrScan {
    table: String,
    #[allow(dead_code)]
    alias: String,
    probes: Vec<(String, IndexBounds)>,
    filter: Option<Expr>,
    schema: Schema,
    matches: Vec<Vec<u8>>,
    position: usize,
    primary: Option<Arc<BTree>>,
}

impl BitmapOrScan {
    pub fn new(
        table: String,
        alias: String,
        probes: Vec<(String, IndexBounds)>,
        filter: Option<Expr>,
        schema: Schema,
    ) -> Self {
        Self {
            table,
            alias,
            probes,
            filter,
            schema,
            matches: Vec::new(),
            position: 0,
            primary: None,
        }
    }
}

impl Operator for BitmapOrScan {
    fn open(&mut self, ctx: &ExecContext<'_>) -> Result<()> {
        let mut set: BTreeSet<Vec<u8>> = BTreeSet::new();
        for (index, bounds) in &self.probes {
            ctx.check_deadline()?;
            let tree = ctx.trees.index(&self.table, index)?;
            let (lo, hi) = encode_bounds(tree.codec(), bounds)?;
            let mut cursor = RangeCursor::new(&tree, lo, hi);
            while let Some((_, pk)) = cursor.next()? {
                set.insert(pk);
            }
        }
        self.matches = set.into_iter().collect();
        self.position = 0;
        self.primary = Some(ctx.trees.primary(&self.table)?);
        Ok(())
    }

    fn next_batch(&mut self, ctx: &ExecContext<'_>) -> Result<Option<Vec<Row>>> {
        if self.position >= self.matches.len() {
            return Ok(None);
        }
        ctx.check_deadline()?;
        let primary = self.primary.as_ref().expect("open not called");
        let end = (self.position + ctx.batch_size).min(self.matches.len());
        let mut out = Vec::with_capacity(end - self.position);
        for pk in &self.matches[self.position..end] {
            if let Some(bytes) = primary.get_encoded(pk)? {
                let row = decode_row(&bytes)?;
                if filter_row(&self.filter, &self.schema, &row)? {
                    out.push(row);
                }
            }
        }
        self.position = end;
        Ok(Some(out))
    }

    fn close(&mut self, _ctx: &ExecContext<'_>) -> Result<()> {
        self.matches.clear();
        self.primary = None;
        Ok(())
    }

    fn schema(&self) -> &Schema {
        &self.schema
    }
}

/// Point probe used by index nested-loop joins.
pub fn index_point_lookup(
    index_tree: &BTree,
    primary: &BTree,
    key: &Value,
) -> Result<Vec<Row>> {
    let bounds = IndexBounds {
        eq_prefix: vec![key.clone()],
        lo: None,
        hi: None,
    };
    let (lo, hi) = encode_bounds(index_tree.codec(), &bounds)?;
    let mut cursor = RangeCursor::new(index_tree, lo, hi);
    let mut rows = Vec::new();
    while let Some((_, pk)) = cursor.next()? {
        if let Some(bytes) = primary.get_encoded(&pk)? {
            rows.push(decode_row(&bytes)?);
        }
    }
    Ok(rows)
}
