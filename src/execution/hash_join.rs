// Hash join.
//
// Builds an in-memory table on the right child (the optimizer orients the
// smaller side there). When the build side overflows the memory budget the
// operator switches to a Grace hash join: both sides partition to temp
// files by key hash and each partition pair joins independently. Null join
// keys never match. Supports inner, left, semi, and anti kinds; semi and
// anti emit only left-side columns.

use crate::ast::Expr;
use crate::common::{Row, Value};
use crate::error::{DbError, Result};
use crate::execution::expressions::{evaluate, truthy, Schema};
use crate::execution::{ExecContext, Operator};
use crate::optimizer::LogicalJoinKind;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::fs::File;
use std::hash::{Hash, Hasher};
use std::io::{BufReader, BufWriter, Write};
use std::path::PathBuf;
use tracing::debug;

pub struct HashJoin {
    left: Box<dyn Operator>,
    right: Box<dyn Operator>,
    left_keys: Vec<Expr>,
    right_keys: Vec<Expr>,
    kind: LogicalJoinKind,
    residual: Option<Expr>,
    schema: Schema,
    combined: Schema,
    right_width: usize,
    state: State,
    spill_files: Vec<PathBuf>,
}

enum State {
    Closed,
    /// in-memory table built, streaming probes
    InMemory {
        table: HashMap<Vec<Value>, Vec<Row>>,
    },
    /// Grace: partition pairs on disk, joined one pair at a time
    Spilled {
        build_parts: Vec<PathBuf>,
        probe_parts: Vec<PathBuf>,
        current: usize,
        table: HashMap<Vec<Value>, Vec<Row>>,
        probe_rows: std::vec::IntoIter<Row>,
    },
    Done,
}

impl HashJoin {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        left: Box<dyn Operator>,
        right: Box<dyn Operator>,
        left_keys: Vec<Expr>,
        right_keys: Vec<Expr>,
        kind: LogicalJoinKind,
        residual: Option<Expr>,
        schema: Schema,
    ) -> Self {
        let combined = left.schema().join(right.schema());
        let right_width = right.schema().columns.len();
        Self {
            left,
            right,
            left_keys,
            right_keys,
            kind,
            residual,
            schema,
            combined,
            right_width,
            state: State::Closed,
            spill_files: Vec::new(),
        }
    }

    fn key_of(row: &Row, keys: &[Expr], schema: &Schema) -> Result<Option<Vec<Value>>> {
        let mut out = Vec::with_capacity(keys.len());
        for k in keys {
            let v = evaluate(k, schema, row)?;
            if v.is_null() {
                // null keys never match
                return Ok(None);
            }
            out.push(v);
        }
        Ok(Some(out))
    }

    fn emit(&self, left_row: &Row, right_row: Option<&Row>, out: &mut Vec<Row>) -> Result<()> {
        match self.kind {
            LogicalJoinKind::Semi | LogicalJoinKind::Anti => {
                out.push(left_row.clone());
            }
            _ => {
                let mut row = left_row.clone();
                match right_row {
                    Some(r) => row.extend(r.iter().cloned()),
                    None => row.extend(std::iter::repeat(Value::Null).take(self.right_width)),
                }
                out.push(row);
            }
        }
        Ok(())
    }

    fn residual_passes(&self, left_row: &Row, right_row: &Row) -> Result<bool> {
        let Some(residual) = &self.residual else {
            return Ok(true);
        };
        let mut combined = left_row.clone();
        combined.extend(right_row.iter().cloned());
        Ok(truthy(&evaluate(residual, &self.combined, &combined)?))
    }

    fn probe_one(
        &self,
        table: &HashMap<Vec<Value>, Vec<Row>>,
        row: &Row,
        out: &mut Vec<Row>,
    ) -> Result<()> {
        let left_schema = self.left.schema();
        let key = Self::key_of(row, &self.left_keys, left_schema)?;
        let matches: Vec<&Row> = match &key {
            Some(k) => table
                .get(k)
                .map(|rows| rows.iter().collect())
                .unwrap_or_default(),
            None => Vec::new(),
        };
        let mut matched = false;
        for m in matches {
            if self.residual_passes(row, m)? {
                matched = true;
                match self.kind {
                    LogicalJoinKind::Semi => {
                        self.emit(row, Some(m), out)?;
                        break;
                    }
                    LogicalJoinKind::Anti => break,
                    _ => self.emit(row, Some(m), out)?,
                }
            }
        }
        if !matched {
            match self.kind {
                LogicalJoinKind::Left => self.emit(row, None, out)?,
                LogicalJoinKind::Anti => self.emit(row, None, out)?,
                _ => {}
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // spill plumbing
    // ------------------------------------------------------------------

    fn partition_path(ctx: &ExecContext<'_>, tag: &str, part: usize) -> PathBuf {
        ctx.tmp_dir.join(format!(
            "hj-{}-{}-{}.part",
            std::process::id(),
            tag,
            part
        ))
    }

    fn write_partitions(
        &mut self,
        ctx: &ExecContext<'_>,
        rows: Vec<Row>,
        side: Side,
    ) -> Result<Vec<PathBuf>> {
        let n = ctx.spill_partitions.max(2);
        let tag = match side {
            Side::Build => "build",
            Side::Probe => "probe",
        };
        let paths: Vec<PathBuf> = (0..n)
            .map(|i| Self::partition_path(ctx, tag, i))
            .collect();
        let mut writers: Vec<BufWriter<File>> = paths
            .iter()
            .map(|p| Ok(BufWriter::new(File::create(p)?)))
            .collect::<Result<_>>()?;
        let (keys, schema) = match side {
            Side::Build => (&self.right_keys, self.right.schema()),
            Side::Probe => (&self.left_keys, self.left.schema()),
        };
        for row in rows {
            let Some(key) = Self::key_of(&row, keys, schema)? else {
                // null-keyed rows can never match; probe-side outer rows
                // still surface, so route them to partition 0
                if matches!(side, Side::Probe)
                    && matches!(self.kind, LogicalJoinKind::Left | LogicalJoinKind::Anti)
                {
                    write_row(&mut writers[0], &row)?;
                }
                continue;
            };
            let mut h = DefaultHasher::new();
            key.hash(&mut h);
            let part = (h.finish() as usize) % n;
            write_row(&mut writers[part], &row)?;
        }
        for w in writers.iter_mut() {
            w.flush()?;
        }
        self.spill_files.extend(paths.iter().cloned());
        Ok(paths)
    }

    fn drain(op: &mut Box<dyn Operator>, ctx: &ExecContext<'_>) -> Result<Vec<Row>> {
        let mut rows = Vec::new();
        while let Some(batch) = op.next_batch(ctx)? {
            ctx.check_deadline()?;
            rows.extend(batch);
        }
        Ok(rows)
    }

    fn build_table(
        &self,
        rows: Vec<Row>,
    ) -> Result<HashMap<Vec<Value>, Vec<Row>>> {
        let mut table: HashMap<Vec<Value>, Vec<Row>> = HashMap::new();
        let schema = self.right.schema();
        for row in rows {
            if let Some(key) = Self::key_of(&row, &self.right_keys, schema)? {
                table.entry(key).or_default().push(row);
            }
        }
        Ok(table)
    }
}

#[derive(Clone, Copy)]
enum Side {
    Build,
    Probe,
}

fn write_row(w: &mut BufWriter<File>, row: &Row) -> Result<()> {
    let bytes = crate::common::encode_row(row)?;
    w.write_all(&(bytes.len() as u32).to_le_bytes())?;
    w.write_all(&bytes)?;
    Ok(())
}

fn read_rows(path: &PathBuf) -> Result<Vec<Row>> {
    use std::io::Read;
    let mut reader = BufReader::new(File::open(path)?);
    let mut rows = Vec::new();
    loop {
        let mut len_bytes = [0u8; 4];
        match reader.read_exact(&mut len_bytes) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e.into()),
        }
        let len = u32::from_le_bytes(len_bytes) as usize;
        let mut buf = vec![0u8; len];
        reader.read_exact(&mut buf)?;
        rows.push(crate::common::decode_row(&buf)?);
    }
    Ok(rows)
}

fn estimate_bytes(rows: &[Row]) -> usize {
    rows.len() * 64 + rows.iter().take(64).map(row_bytes).sum::<usize>() / 64.max(1) * rows.len()
}

fn row_bytes(row: &Row) -> usize {
    row.iter()
        .map(|v| match v {
            Value::String(s) => s.len() + 8,
            Value::Bytes(b) => b.len() + 8,
            _ => 16,
        })
        .sum()
}

impl Operator for HashJoin {
    fn open(&mut self, ctx: &ExecContext<'_>) -> Result<()> {
        self.left.open(ctx)?;
        self.right.open(ctx)?;

        let build_rows = Self::drain(&mut self.right, ctx)?;
        if estimate_bytes(&build_rows) <= ctx.hash_memory_bytes {
            let table = self.build_table(build_rows)?;
            self.state = State::InMemory { table };
            return Ok(());
        }

        // Grace: both sides go to disk partitioned by key hash
        debug!(rows = build_rows.len(), "hash join build side spilling");
        std::fs::create_dir_all(&ctx.tmp_dir)?;
        let build_parts = self.write_partitions(ctx, build_rows, Side::Build)?;
        let probe_rows = Self::drain(&mut self.left, ctx)?;
        let probe_parts = self.write_partitions(ctx, probe_rows, Side::Probe)?;
        self.state = State::Spilled {
            build_parts,
            probe_parts,
            current: 0,
            table: HashMap::new(),
            probe_rows: Vec::new().into_iter(),
        };
        Ok(())
    }

    fn next_batch(&mut self, ctx: &ExecContext<'_>) -> Result<Option<Vec<Row>>> {
        ctx.check_deadline()?;
        let state = std::mem::replace(&mut self.state, State::Done);
        match state {
            State::Closed => Err(DbError::Internal("hash join not opened".into())),
            State::Done => Ok(None),
            State::InMemory { table } => match self.left.next_batch(ctx)? {
                Some(batch) => {
                    let mut out = Vec::with_capacity(batch.len());
                    for row in &batch {
                        self.probe_one(&table, row, &mut out)?;
                    }
                    self.state = State::InMemory { table };
                    Ok(Some(out))
                }
                None => Ok(None),
            },
            State::Spilled {
                build_parts,
                probe_parts,
                mut current,
                mut table,
                mut probe_rows,
            } => {
                loop {
                    let pending: Vec<Row> = probe_rows.by_ref().take(ctx.batch_size).collect();
                    if !pending.is_empty() {
                        let mut out = Vec::with_capacity(pending.len());
                        for row in &pending {
                            self.probe_one(&table, row, &mut out)?;
                        }
                        self.state = State::Spilled {
                            build_parts,
                            probe_parts,
                            current,
                            table,
                            probe_rows,
                        };
                        return Ok(Some(out));
                    }

                    // advance to the next partition pair
                    if current >= build_parts.len() {
                        return Ok(None);
                    }
                    ctx.check_deadline()?;
                    let build = read_rows(&build_parts[current])?;
                    let probe = read_rows(&probe_parts[current])?;
                    current += 1;
                    table = self.build_table(build)?;
                    probe_rows = probe.into_iter();
                }
            }
        }
    }

    fn close(&mut self, ctx: &ExecContext<'_>) -> Result<()> {
        self.left.close(ctx)?;
        self.right.close(ctx)?;
        self.state = State::Done;
        for path in self.spill_files.drain(..) {
            let _ = std::fs::remove_file(path);
        }
        Ok(())
    }

    fn schema(&self) -> &Schema {
        &self.schema
    }
}
