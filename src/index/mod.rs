// Index manager.
//
// Secondary indexes are B+ trees mapping index keys to the owning row's
// primary key. Unique indexes key on the columns alone and reject
// duplicates; non-unique indexes append the primary key to the tree key so
// every entry stays distinct. Builds scan the base table into a bulk load
// while concurrent writers append to a side log that is drained before the
// index goes online; the catalog commit is the linearization point.

use crate::btree::{BTree, KeyCodec, KeyType, RangeCursor};
use crate::catalog::{IndexDescriptor, TableDescriptor};
use crate::common::{IndexId, Row, Value};
use crate::error::{DbError, Result};
use crate::txn::Txn;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, info};

/// Deferred write captured while an index build is scanning.
#[derive(Debug, Clone)]
pub enum SideLogOp {
    Insert { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
}

#[derive(Default)]
struct Clustering {
    entries: u64,
    breaks: u64,
    last_value: Option<Vec<u8>>,
}

impl Clustering {
    fn observe(&mut self, value: &[u8]) {
        if let Some(prev) = &self.last_value {
            if prev.as_slice() != value {
                self.breaks += 1;
            }
        }
        self.entries += 1;
        self.last_value = Some(value.to_vec());
    }

    fn factor(&self) -> f64 {
        if self.entries <= 1 {
            return 0.0;
        }
        self.breaks as f64 / (self.entries - 1) as f64
    }
}

pub struct IndexManager {
    clustering: DashMap<IndexId, Mutex<Clustering>>,
    /// side logs for indexes currently building
    building: DashMap<IndexId, Mutex<Vec<SideLogOp>>>,
}

impl Default for IndexManager {
    fn default() -> Self {
        Self::new()
    }
}

impl IndexManager {
    pub fn new() -> Self {
        Self {
            clustering: DashMap::new(),
            building: DashMap::new(),
        }
    }

    /// Codec for an index's tree: unique indexes key on the columns, the
    /// rest get the primary key appended as a tiebreaker.
    pub fn index_codec(table: &TableDescriptor, index: &IndexDescriptor) -> Result<KeyCodec> {
        let mut parts: Vec<KeyType> = Vec::new();
        for col in &index.columns {
            let (_, c) = table
                .column(col)
                .ok_or_else(|| DbError::NotFound(format!("column {}", col)))?;
            parts.push(c.data_type.key_type());
        }
        if !index.unique {
            match table.primary_key_type() {
                KeyType::Composite(pk_parts) => parts.extend(pk_parts),
                single => parts.push(single),
            }
        }
        Ok(KeyCodec::new(if parts.len() == 1 {
            parts.pop().unwrap()
        } else {
            KeyType::Composite(parts)
        }))
    }

    /// Column values of a row that feed an index key.
    pub fn index_columns(
        table: &TableDescriptor,
        index: &IndexDescriptor,
        row: &Row,
    ) -> Result<Vec<Value>> {
        index
            .columns
            .iter()
            .map(|col| {
                let (i, _) = table
                    .column(col)
                    .ok_or_else(|| DbError::NotFound(format!("column {}", col)))?;
                Ok(row[i].clone())
            })
            .collect()
    }

    /// Full tree key for one row: columns plus (for non-unique) the
    /// primary-key values.
    pub fn entry_key(
        table: &TableDescriptor,
        index: &IndexDescriptor,
        codec: &KeyCodec,
        row: &Row,
        pk_values: &[Value],
    ) -> Result<Vec<u8>> {
        let mut values = Self::index_columns(table, index, row)?;
        if !index.unique {
            values.extend(pk_values.iter().cloned());
        }
        codec.encode(&values)
    }

    /// Probe a unique index for a conflicting key.
    pub fn check_unique(
        &self,
        index: &IndexDescriptor,
        codec: &KeyCodec,
        tree: &BTree,
        table: &TableDescriptor,
        row: &Row,
    ) -> Result<()> {
        if !index.unique {
            return Ok(());
        }
        let cols = Self::index_columns(table, index, row)?;
        if cols.iter().any(|v| v.is_null()) {
            // SQL semantics: NULL never collides
            return Ok(());
        }
        let key = codec.encode(&cols)?;
        if tree.get_encoded(&key)?.is_some() {
            return Err(DbError::UniquenessViolation {
                index: index.name.clone(),
                key: cols
                    .iter()
                    .map(|v| v.to_string())
                    .collect::<Vec<_>>()
                    .join(","),
            });
        }
        Ok(())
    }

    /// Apply one row mutation to an index, or park it in the side log when
    /// the index is still building.
    pub fn maintain(
        &self,
        txn: &Txn,
        table: &TableDescriptor,
        index: &IndexDescriptor,
        codec: &KeyCodec,
        tree: &BTree,
        row_old: Option<(&Row, &[Value])>,
        row_new: Option<(&Row, &[Value])>,
    ) -> Result<()> {
        let del = match row_old {
            Some((row, pk)) => Some(Self::entry_key(table, index, codec, row, pk)?),
            None => None,
        };
        let ins = match row_new {
            Some((row, pk)) => {
                let key = Self::entry_key(table, index, codec, row, pk)?;
                let value = crate::btree::KeyCodec::new(table.primary_key_type())
                    .encode(pk)?;
                Some((key, value))
            }
            None => None,
        };

        if let Some(side) = self.building.get(&index.id) {
            let mut log = side.lock();
            if let Some(key) = del {
                log.push(SideLogOp::Delete { key });
            }
            if let Some((key, value)) = ins {
                log.push(SideLogOp::Insert { key, value });
            }
            return Ok(());
        }

        if let Some(key) = del {
            tree.delete_encoded(txn, &key)?;
        }
        if let Some((key, value)) = ins {
            tree.insert_encoded(txn, &key, &value)?;
            self.observe(index.id, &value);
        }
        Ok(())
    }

    /// Build an index by a full scan of the base table, then drain the side
    /// log accumulated while the scan ran.
    pub fn build(
        &self,
        txn: &Txn,
        table: &TableDescriptor,
        index: &IndexDescriptor,
        codec: &KeyCodec,
        primary: &BTree,
        index_tree: &BTree,
    ) -> Result<u64> {
        self.building.insert(index.id, Mutex::new(Vec::new()));
        let result = self.build_inner(txn, table, index, codec, primary, index_tree);
        let side = self.building.remove(&index.id);
        let entries = result?;

        // drain writes that landed while the scan ran
        if let Some((_, side)) = side {
            let ops = side.into_inner();
            if !ops.is_empty() {
                debug!(index = %index.name, ops = ops.len(), "draining side log");
            }
            for op in ops {
                match op {
                    SideLogOp::Delete { key } => {
                        index_tree.delete_encoded(txn, &key)?;
                    }
                    SideLogOp::Insert { key, value } => {
                        index_tree.insert_encoded(txn, &key, &value)?;
                    }
                }
            }
        }
        info!(index = %index.name, entries, "index built");
        Ok(entries)
    }

    fn build_inner(
        &self,
        txn: &Txn,
        table: &TableDescriptor,
        index: &IndexDescriptor,
        codec: &KeyCodec,
        primary: &BTree,
        index_tree: &BTree,
    ) -> Result<u64> {
        let pk_codec = KeyCodec::new(table.primary_key_type());
        let pk_cols = table.primary_key_columns();

        let mut pairs: Vec<(Vec<u8>, Vec<u8>)> = Vec::new();
        let mut cursor = RangeCursor::new(primary, None, None);
        while let Some((pk_bytes, value)) = cursor.next()? {
            let row = crate::common::decode_row(&value)?;
            let pk_values: Vec<Value> = if pk_cols.is_empty() {
                // row-id keyed table: the key bytes are the row id
                vec![Value::Integer(i64::from_be_bytes(
                    pk_bytes[..8].try_into().map_err(|_| {
                        DbError::Internal("row-id key shorter than 8 bytes".into())
                    })?,
                ) ^ i64::MIN)]
            } else {
                pk_cols.iter().map(|i| row[*i].clone()).collect()
            };
            let key = Self::entry_key(table, index, codec, &row, &pk_values)?;
            let value = pk_codec.encode(&pk_values)?;
            pairs.push((key, value));
        }

        pairs.sort_by(|a, b| a.0.cmp(&b.0));
        if index.unique {
            for w in pairs.windows(2) {
                if w[0].0 == w[1].0 {
                    return Err(DbError::UniquenessViolation {
                        index: index.name.clone(),
                        key: crate::btree::key::encoded_key_to_hex(&w[0].0),
                    });
                }
            }
        }

        // seed the clustering factor from physical adjacency
        let mut clustering = Clustering::default();
        for (_, pk) in &pairs {
            clustering.observe(pk);
        }
        self.clustering
            .insert(index.id, Mutex::new(clustering));

        let count = pairs.len() as u64;
        index_tree.bulk_load(txn, &pairs)?;
        Ok(count)
    }

    fn observe(&self, index: IndexId, pk_bytes: &[u8]) {
        self.clustering
            .entry(index)
            .or_default()
            .lock()
            .observe(pk_bytes);
    }

    /// Running clustering factor: fraction of adjacent entries whose base
    /// row differs from the previous entry's.
    pub fn clustering_factor(&self, index: IndexId) -> f64 {
        self.clustering
            .get(&index)
            .map(|c| c.lock().factor())
            .unwrap_or(0.0)
    }

    pub fn drop_index_state(&self, index: IndexId) {
        self.clustering.remove(&index);
        self.building.remove(&index);
    }

    /// Move build-time state onto the catalog-assigned id.
    pub fn rekey(&self, old: IndexId, new: IndexId) {
        if old == new {
            return;
        }
        if let Some((_, state)) = self.clustering.remove(&old) {
            self.clustering.insert(new, state);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clustering_factor_math() {
        let mut c = Clustering::default();
        for pk in [b"a", b"a", b"b", b"b"] {
            c.observe(pk.as_slice());
        }
        // one break across three adjacencies
        assert!((c.factor() - 1.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_clustering_factor_fully_scattered() {
        let mut c = Clustering::default();
        for pk in [b"a", b"b", b"c", b"d"] {
            c.observe(pk.as_slice());
        }
        assert!((c.factor() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_clustering_factor_single_entry() {
        let mut c = Clustering::default();
        c.observe(b"a");
        assert_eq!(c.factor(), 0.0);
    }
}
