// Sort operator.
//
// In-memory inputs use an introspective sort: quicksort with
// median-of-three pivots, switching to heapsort past a depth limit of
// 2*log2(n) and to insertion sort below 16 elements; the top quicksort
// levels fan out over rayon helpers. Single-column integer keys take an
// LSD radix path instead (negative and positive keys in separate passes,
// concatenated). Inputs past the memory budget fall back to an external
// merge sort: sorted runs spill to tmp files and a min-heap drives the
// k-way merge. NaN sorts last for double keys in either direction; NULL
// sorts first; equal magnitudes with different signs order by sign.

use crate::ast::{Expr, SortDirection};
use crate::common::{Row, Value};
use crate::error::Result;
use crate::execution::expressions::{evaluate, Schema};
use crate::execution::{ExecContext, Operator};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

const INSERTION_THRESHOLD: usize = 16;
const PARALLEL_THRESHOLD: usize = 64 * 1024;

type Keyed = (Vec<Value>, Row);

/// Key comparison honoring per-key direction, NULL-first, NaN-last.
fn cmp_keys(a: &[Value], b: &[Value], descending: &[bool]) -> Ordering {
    for ((x, y), desc) in a.iter().zip(b).zip(descending) {
        let ord = cmp_one(x, y, *desc);
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

fn cmp_one(a: &Value, b: &Value, desc: bool) -> Ordering {
    // pinned extremes are direction-independent
    let a_nan = matches!(a, Value::Double(d) if d.is_nan());
    let b_nan = matches!(b, Value::Double(d) if d.is_nan());
    match (a_nan, b_nan) {
        (true, true) => return Ordering::Equal,
        (true, false) => return Ordering::Greater,
        (false, true) => return Ordering::Less,
        _ => {}
    }
    match (a.is_null(), b.is_null()) {
        (true, true) => return Ordering::Equal,
        (true, false) => return Ordering::Less,
        (false, true) => return Ordering::Greater,
        _ => {}
    }
    let ord = a.total_cmp(b);
    if desc {
        ord.reverse()
    } else {
        ord
    }
}

// ----------------------------------------------------------------------
// introspective sort
// ----------------------------------------------------------------------

pub fn introsort(data: &mut [Keyed], descending: &[bool]) {
    let depth_limit = 2 * (data.len().max(2) as f64).log2() as usize;
    let helpers = (num_cpus::get() / 2).max(1);
    intro_rec(data, descending, depth_limit, helpers);
}

fn intro_rec(data: &mut [Keyed], descending: &[bool], depth: usize, helpers: usize) {
    let n = data.len();
    if n < INSERTION_THRESHOLD {
        insertion_sort(data, descending);
        return;
    }
    if depth == 0 {
        heapsort(data, descending);
        return;
    }
    let pivot_idx = median_of_three(data, descending);
    data.swap(pivot_idx, n - 1);
    let mut store = 0usize;
    for i in 0..n - 1 {
        if cmp_keys(&data[i].0, &data[n - 1].0, descending) == Ordering::Less {
            data.swap(i, store);
            store += 1;
        }
    }
    data.swap(store, n - 1);
    let (lo, rest) = data.split_at_mut(store);
    let hi = &mut rest[1..];
    if helpers > 1 && n > PARALLEL_THRESHOLD {
        rayon::join(
            || intro_rec(lo, descending, depth - 1, helpers / 2),
            || intro_rec(hi, descending, depth - 1, helpers / 2),
        );
    } else {
        intro_rec(lo, descending, depth - 1, helpers);
        intro_rec(hi, descending, depth - 1, helpers);
    }
}

fn median_of_three(data: &[Keyed], descending: &[bool]) -> usize {
    let n = data.len();
    let (a, b, c) = (0, n / 2, n - 1);
    let lt = |i: usize, j: usize| cmp_keys(&data[i].0, &data[j].0, descending) == Ordering::Less;
    if lt(a, b) {
        if lt(b, c) {
            b
        } else if lt(a, c) {
            c
        } else {
            a
        }
    } else if lt(a, c) {
        a
    } else if lt(b, c) {
        c
    } else {
        b
    }
}

fn insertion_sort(data: &mut [Keyed], descending: &[bool]) {
    for i in 1..data.len() {
        let mut j = i;
        while j > 0 && cmp_keys(&data[j].0, &data[j - 1].0, descending) == Ordering::Less {
            data.swap(j, j - 1);
            j -= 1;
        }
    }
}

fn heapsort(data: &mut [Keyed], descending: &[bool]) {
    let n = data.len();
    for i in (0..n / 2).rev() {
        sift_down(data, i, n, descending);
    }
    for end in (1..n).rev() {
        data.swap(0, end);
        sift_down(data, 0, end, descending);
    }
}

fn sift_down(data: &mut [Keyed], mut root: usize, end: usize, descending: &[bool]) {
    loop {
        let mut child = 2 * root + 1;
        if child >= end {
            return;
        }
        if child + 1 < end
            && cmp_keys(&data[child].0, &data[child + 1].0, descending) == Ordering::Less
        {
            child += 1;
        }
        if cmp_keys(&data[root].0, &data[child].0, descending) == Ordering::Less {
            data.swap(root, child);
            root = child;
        } else {
            return;
        }
    }
}

// ----------------------------------------------------------------------
// LSD radix for single integer keys
// ----------------------------------------------------------------------

/// Byte-wise LSD radix sort; negatives and positives are sorted in
/// separate passes and concatenated (two's-complement bytes order each
/// group correctly on their own).
fn radix_sort_i64(data: Vec<(i64, Row)>) -> Vec<(i64, Row)> {
    let (negatives, positives): (Vec<_>, Vec<_>) = data.into_iter().partition(|(k, _)| *k < 0);
    let mut out = radix_pass_group(negatives);
    out.extend(radix_pass_group(positives));
    out
}

fn radix_pass_group(mut group: Vec<(i64, Row)>) -> Vec<(i64, Row)> {
    for byte in 0..8 {
        let mut counts = [0usize; 256];
        for (k, _) in &group {
            counts[((*k as u64) >> (byte * 8)) as usize & 0xFF] += 1;
        }
        let mut offsets = [0usize; 256];
        let mut acc = 0usize;
        for (i, c) in counts.iter().enumerate() {
            offsets[i] = acc;
            acc += c;
        }
        let mut sorted: Vec<Option<(i64, Row)>> = (0..group.len()).map(|_| None).collect();
        for item in group {
            let bucket = ((item.0 as u64) >> (byte * 8)) as usize & 0xFF;
            sorted[offsets[bucket]] = Some(item);
            offsets[bucket] += 1;
        }
        group = sorted.into_iter().map(|o| o.expect("radix slot")).collect();
    }
    group
}

// ----------------------------------------------------------------------
// external runs
// ----------------------------------------------------------------------

struct RunReader {
    reader: BufReader<File>,
    remaining: u64,
}

impl RunReader {
    fn open(path: &PathBuf) -> Result<RunReader> {
        let mut reader = BufReader::new(File::open(path)?);
        let mut count = [0u8; 8];
        reader.read_exact(&mut count)?;
        Ok(RunReader {
            reader,
            remaining: u64::from_le_bytes(count),
        })
    }

    fn next(&mut self) -> Result<Option<Row>> {
        if self.remaining == 0 {
            return Ok(None);
        }
        self.remaining -= 1;
        let mut len_bytes = [0u8; 4];
        self.reader.read_exact(&mut len_bytes)?;
        let len = u32::from_le_bytes(len_bytes) as usize;
        let mut buf = vec![0u8; len];
        self.reader.read_exact(&mut buf)?;
        Ok(Some(crate::common::decode_row(&buf)?))
    }
}

fn write_run(path: &PathBuf, rows: &[Keyed]) -> Result<()> {
    let mut writer = BufWriter::new(File::create(path)?);
    writer.write_all(&(rows.len() as u64).to_le_bytes())?;
    for (_, row) in rows {
        let bytes = crate::common::encode_row(row)?;
        writer.write_all(&(bytes.len() as u32).to_le_bytes())?;
        writer.write_all(&bytes)?;
    }
    writer.flush()?;
    Ok(())
}

/// Min-heap entry for the k-way merge.
struct HeapEntry {
    keys: Vec<Value>,
    row: Row,
    run: usize,
    descending: Arc<Vec<bool>>,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        cmp_keys(&self.keys, &other.keys, &self.descending) == Ordering::Equal
    }
}
impl Eq for HeapEntry {}
impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // reversed: BinaryHeap is a max-heap, we need the minimum first
        cmp_keys(&other.keys, &self.keys, &self.descending)
    }
}

// ----------------------------------------------------------------------
// operator
// ----------------------------------------------------------------------

enum SortState {
    Unopened,
    InMemory(std::vec::IntoIter<Row>),
    Merging {
        readers: Vec<RunReader>,
        heap: BinaryHeap<HeapEntry>,
        paths: Vec<PathBuf>,
    },
    Done,
}

pub struct SortOp {
    input: Box<dyn Operator>,
    keys: Vec<Expr>,
    descending: Arc<Vec<bool>>,
    schema: Schema,
    state: SortState,
}

impl SortOp {
    pub fn new(input: Box<dyn Operator>, keys: Vec<(Expr, SortDirection)>) -> Self {
        let schema = input.schema().clone();
        let descending = Arc::new(
            keys.iter()
                .map(|(_, d)| *d == SortDirection::Desc)
                .collect::<Vec<bool>>(),
        );
        Self {
            input,
            keys: keys.into_iter().map(|(e, _)| e).collect(),
            descending,
            schema,
            state: SortState::Unopened,
        }
    }

    fn eval_keys(&self, row: &Row) -> Result<Vec<Value>> {
        self.keys
            .iter()
            .map(|k| evaluate(k, &self.schema, row))
            .collect()
    }

    /// All keys are plain ascending integers: radix-eligible.
    fn radix_eligible(&self, data: &[Keyed]) -> bool {
        self.keys.len() == 1
            && !self.descending[0]
            && data
                .iter()
                .all(|(k, _)| matches!(k.first(), Some(Value::Integer(_))))
    }

    fn sort_chunk(&self, mut chunk: Vec<Keyed>) -> Vec<Keyed> {
        if self.radix_eligible(&chunk) {
            let keyed: Vec<(i64, Row)> = chunk
                .into_iter()
                .map(|(k, r)| {
                    let Some(Value::Integer(i)) = k.into_iter().next() else {
                        unreachable!("radix eligibility checked")
                    };
                    (i, r)
                })
                .collect();
            return radix_sort_i64(keyed)
                .into_iter()
                .map(|(i, r)| (vec![Value::Integer(i)], r))
                .collect();
        }
        introsort(&mut chunk, &self.descending);
        chunk
    }

    fn run_path(ctx: &ExecContext<'_>, run: usize) -> PathBuf {
        ctx.tmp_dir
            .join(format!("sort-{}-{}.run", std::process::id(), run))
    }
}

fn approx_row_bytes(row: &Row) -> usize {
    row.iter()
        .map(|v| match v {
            Value::String(s) => s.len() + 8,
            Value::Bytes(b) => b.len() + 8,
            _ => 16,
        })
        .sum()
}

impl Operator for SortOp {
    fn open(&mut self, ctx: &ExecContext<'_>) -> Result<()> {
        self.input.open(ctx)?;

        let mut runs: Vec<PathBuf> = Vec::new();
        let mut chunk: Vec<Keyed> = Vec::new();
        let mut chunk_size = 0usize;

        while let Some(batch) = self.input.next_batch(ctx)? {
            ctx.check_deadline()?;
            for row in batch {
                let keys = self.eval_keys(&row)?;
                chunk_size += approx_row_bytes(&row) + keys.len() * 16 + 48;
                chunk.push((keys, row));
            }
            if chunk_size >= ctx.sort_memory_bytes {
                let sorted = self.sort_chunk(std::mem::take(&mut chunk));
                chunk_size = 0;
                std::fs::create_dir_all(&ctx.tmp_dir)?;
                let path = Self::run_path(ctx, runs.len());
                write_run(&path, &sorted)?;
                runs.push(path);
            }
        }

        if runs.is_empty() {
            // fits in memory
            let sorted = self.sort_chunk(chunk);
            self.state =
                SortState::InMemory(sorted.into_iter().map(|(_, r)| r).collect::<Vec<_>>().into_iter());
            return Ok(());
        }

        // spill the tail run and merge
        if !chunk.is_empty() {
            let sorted = self.sort_chunk(chunk);
            let path = Self::run_path(ctx, runs.len());
            write_run(&path, &sorted)?;
            runs.push(path);
        }
        debug!(runs = runs.len(), "external sort merging");

        let mut readers: Vec<RunReader> = runs
            .iter()
            .map(RunReader::open)
            .collect::<Result<_>>()?;
        let mut heap = BinaryHeap::new();
        for (i, reader) in readers.iter_mut().enumerate() {
            if let Some(row) = reader.next()? {
                let keys = self.eval_keys(&row)?;
                heap.push(HeapEntry {
                    keys,
                    row,
                    run: i,
                    descending: Arc::clone(&self.descending),
                });
            }
        }
        self.state = SortState::Merging {
            readers,
            heap,
            paths: runs,
        };
        Ok(())
    }

    fn next_batch(&mut self, ctx: &ExecContext<'_>) -> Result<Option<Vec<Row>>> {
        ctx.check_deadline()?;
        match &mut self.state {
            SortState::Unopened => Err(crate::error::DbError::Internal(
                "sort not opened".into(),
            )),
            SortState::Done => Ok(None),
            SortState::InMemory(iter) => {
                let batch: Vec<Row> = iter.by_ref().take(ctx.batch_size).collect();
                if batch.is_empty() {
                    Ok(None)
                } else {
                    Ok(Some(batch))
                }
            }
            SortState::Merging { readers, heap, .. } => {
                let mut out = Vec::with_capacity(ctx.batch_size);
                while out.len() < ctx.batch_size {
                    let Some(entry) = heap.pop() else {
                        break;
                    };
                    let run = entry.run;
                    out.push(entry.row);
                    if let Some(row) = readers[run].next()? {
                        let keys = self
                            .keys
                            .iter()
                            .map(|k| evaluate(k, &self.schema, &row))
                            .collect::<Result<Vec<Value>>>()?;
                        heap.push(HeapEntry {
                            keys,
                            row,
                            run,
                            descending: Arc::clone(&self.descending),
                        });
                    }
                }
                if out.is_empty() {
                    Ok(None)
                } else {
                    Ok(Some(out))
                }
            }
        }
    }

    fn close(&mut self, ctx: &ExecContext<'_>) -> Result<()> {
        self.input.close(ctx)?;
        if let SortState::Merging { paths, .. } =
            std::mem::replace(&mut self.state, SortState::Done)
        {
            // temp runs are removed on success and on unwind alike
            for path in paths {
                let _ = std::fs::remove_file(path);
            }
        }
        self.state = SortState::Done;
        Ok(())
    }

    fn schema(&self) -> &Schema {
        &self.schema
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keyed(vals: Vec<i64>) -> Vec<Keyed> {
        vals.into_iter()
            .map(|i| (vec![Value::Integer(i)], vec![Value::Integer(i)]))
            .collect()
    }

    #[test]
    fn test_introsort_orders() {
        let mut data = keyed(vec![5, 3, 9, 1, 1, 7, -4, 0]);
        introsort(&mut data, &[false]);
        let got: Vec<i64> = data
            .iter()
            .map(|(k, _)| match k[0] {
                Value::Integer(i) => i,
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(got, vec![-4, 0, 1, 1, 3, 5, 7, 9]);
    }

    #[test]
    fn test_introsort_descending() {
        let mut data = keyed(vec![2, 8, 5]);
        introsort(&mut data, &[true]);
        let got: Vec<i64> = data
            .iter()
            .map(|(k, _)| match k[0] {
                Value::Integer(i) => i,
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(got, vec![8, 5, 2]);
    }

    #[test]
    fn test_introsort_large_random() {
        let mut vals: Vec<i64> = (0..10_000).map(|i| (i * 48271) % 65_536 - 32_768).collect();
        let mut data = keyed(vals.clone());
        introsort(&mut data, &[false]);
        vals.sort();
        let got: Vec<i64> = data
            .iter()
            .map(|(k, _)| match k[0] {
                Value::Integer(i) => i,
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(got, vals);
    }

    #[test]
    fn test_radix_negative_positive() {
        let data: Vec<(i64, Row)> = vec![5, -3, 0, i64::MIN + 1, i64::MAX, -1]
            .into_iter()
            .map(|i| (i, vec![Value::Integer(i)]))
            .collect();
        let sorted = radix_sort_i64(data);
        let got: Vec<i64> = sorted.iter().map(|(k, _)| *k).collect();
        assert_eq!(got, vec![i64::MIN + 1, -3, -1, 0, 5, i64::MAX]);
    }

    #[test]
    fn test_nan_sorts_last_both_directions() {
        let mk = |d: f64| (vec![Value::Double(d)], vec![Value::Double(d)]);
        for desc in [false, true] {
            let mut data = vec![mk(f64::NAN), mk(1.0), mk(-1.0), mk(f64::INFINITY)];
            introsort(&mut data, &[desc]);
            assert!(
                matches!(&data[3].0[0], Value::Double(d) if d.is_nan()),
                "NaN not last with desc={}",
                desc
            );
        }
    }

    #[test]
    fn test_signed_zeros_order_by_sign() {
        let mk = |d: f64| (vec![Value::Double(d)], vec![Value::Double(d)]);
        let mut data = vec![mk(0.0), mk(-1.0), mk(-0.0), mk(1.0)];
        introsort(&mut data, &[false]);
        assert!(matches!(&data[0].0[0], Value::Double(d) if *d == -1.0));
        assert!(
            matches!(&data[1].0[0], Value::Double(d) if *d == 0.0 && d.is_sign_negative()),
            "-0.0 must precede +0.0"
        );
        assert!(
            matches!(&data[2].0[0], Value::Double(d) if *d == 0.0 && !d.is_sign_negative())
        );
        assert!(matches!(&data[3].0[0], Value::Double(d) if *d == 1.0));
    }
}
