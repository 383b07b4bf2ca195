// Catalog: schema metadata, index registry, statistics snapshot pointers.
//
// Single-writer, many-reader behind a RwLock. Schema changes bump the
// schema version (plan-cache invalidation key) and persist the whole
// catalog to `catalog.json` with an atomic rename; that write is the
// linearization point for DDL.

use crate::btree::KeyType;
use crate::common::{FileId, IndexId, TableId, Value};
use crate::error::{DbError, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Statistics snapshot identifier.
pub type SnapshotId = u64;

/// Column data types.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DataType {
    Integer,
    Double,
    /// decimal rides the double carrier with exact comparison by default
    Decimal,
    Varchar(usize),
    Text,
    Boolean,
    Bytes,
}

impl DataType {
    /// Key type used when this column participates in a tree key.
    pub fn key_type(&self) -> KeyType {
        match self {
            DataType::Integer | DataType::Boolean => KeyType::Integer,
            DataType::Double | DataType::Decimal => KeyType::Double,
            DataType::Varchar(_) | DataType::Text | DataType::Bytes => KeyType::String,
        }
    }

    pub fn accepts(&self, value: &Value) -> bool {
        matches!(
            (self, value),
            (_, Value::Null)
                | (DataType::Integer, Value::Integer(_))
                | (DataType::Double, Value::Double(_))
                | (DataType::Double, Value::Integer(_))
                | (DataType::Decimal, Value::Double(_))
                | (DataType::Decimal, Value::Integer(_))
                | (DataType::Varchar(_), Value::String(_))
                | (DataType::Text, Value::String(_))
                | (DataType::Boolean, Value::Boolean(_))
                | (DataType::Bytes, Value::Bytes(_))
        )
    }
}

/// Column descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub data_type: DataType,
    pub nullable: bool,
    pub default: Option<Value>,
    pub primary_key: bool,
    /// Optional epsilon for point-equality on double keys (per column).
    pub float_epsilon: Option<f64>,
}

impl Column {
    pub fn new(name: &str, data_type: DataType) -> Self {
        Self {
            name: name.to_string(),
            data_type,
            nullable: true,
            default: None,
            primary_key: false,
            float_epsilon: None,
        }
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self.nullable = false;
        self
    }

    pub fn with_default(mut self, value: Value) -> Self {
        self.default = Some(value);
        self
    }
}

/// Secondary index descriptor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexDescriptor {
    pub id: IndexId,
    pub name: String,
    pub table: String,
    pub columns: Vec<String>,
    pub unique: bool,
    pub file_id: FileId,
}

/// Table descriptor. The primary (clustered) tree is keyed by the declared
/// primary key; without one, rows are keyed by their implicit row id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableDescriptor {
    pub id: TableId,
    pub name: String,
    pub columns: Vec<Column>,
    pub file_id: FileId,
    pub indexes: Vec<IndexDescriptor>,
    pub stats_snapshot: Option<SnapshotId>,
}

impl TableDescriptor {
    pub fn column(&self, name: &str) -> Option<(usize, &Column)> {
        self.columns
            .iter()
            .enumerate()
            .find(|(_, c)| c.name == name)
    }

    pub fn primary_key_columns(&self) -> Vec<usize> {
        self.columns
            .iter()
            .enumerate()
            .filter(|(_, c)| c.primary_key)
            .map(|(i, _)| i)
            .collect()
    }

    /// Key type of the clustered tree: composite of PK columns, or the
    /// implicit integer row id.
    pub fn primary_key_type(&self) -> KeyType {
        let pk = self.primary_key_columns();
        match pk.len() {
            0 => KeyType::Integer,
            1 => self.columns[pk[0]].data_type.key_type(),
            _ => KeyType::Composite(
                pk.iter()
                    .map(|i| self.columns[*i].data_type.key_type())
                    .collect(),
            ),
        }
    }

    /// Epsilon policy for the clustered key, taken from its single double
    /// column when declared.
    pub fn primary_key_epsilon(&self) -> Option<f64> {
        let pk = self.primary_key_columns();
        if pk.len() == 1 {
            self.columns[pk[0]].float_epsilon
        } else {
            None
        }
    }

    pub fn index(&self, name: &str) -> Option<&IndexDescriptor> {
        self.indexes.iter().find(|i| i.name == name)
    }
}

/// View definition, expanded at plan time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ViewDescriptor {
    pub name: String,
    pub query: crate::ast::Statement,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct CatalogData {
    tables: BTreeMap<String, TableDescriptor>,
    views: BTreeMap<String, ViewDescriptor>,
    next_table_id: TableId,
    next_index_id: IndexId,
    next_file_id: FileId,
    schema_version: u64,
    next_snapshot_id: SnapshotId,
}

pub struct Catalog {
    path: PathBuf,
    inner: RwLock<CatalogData>,
}

impl Catalog {
    /// Load `catalog.json` or start empty.
    pub fn open(dir: &Path) -> Result<Catalog> {
        let path = dir.join("catalog.json");
        let data = if path.exists() {
            let text = std::fs::read_to_string(&path)?;
            serde_json::from_str(&text)?
        } else {
            CatalogData::default()
        };
        Ok(Catalog {
            path,
            inner: RwLock::new(data),
        })
    }

    /// Persist atomically: write aside, fsync, rename over.
    pub fn save(&self) -> Result<()> {
        let text = serde_json::to_string_pretty(&*self.inner.read())?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, text)?;
        let file = std::fs::File::open(&tmp)?;
        file.sync_all()?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    pub fn schema_version(&self) -> u64 {
        self.inner.read().schema_version
    }

    pub fn allocate_file_id(&self) -> FileId {
        let mut inner = self.inner.write();
        let id = inner.next_file_id;
        inner.next_file_id += 1;
        id
    }

    pub fn next_snapshot_id(&self) -> SnapshotId {
        let mut inner = self.inner.write();
        inner.next_snapshot_id += 1;
        inner.next_snapshot_id
    }

    pub fn create_table(&self, mut desc: TableDescriptor) -> Result<TableDescriptor> {
        let mut inner = self.inner.write();
        if inner.tables.contains_key(&desc.name) {
            return Err(DbError::Catalog(format!(
                "table {} already exists",
                desc.name
            )));
        }
        desc.id = inner.next_table_id;
        inner.next_table_id += 1;
        inner.schema_version += 1;
        inner.tables.insert(desc.name.clone(), desc.clone());
        Ok(desc)
    }

    pub fn drop_table(&self, name: &str) -> Result<TableDescriptor> {
        let mut inner = self.inner.write();
        let desc = inner
            .tables
            .remove(name)
            .ok_or_else(|| DbError::NotFound(format!("table {}", name)))?;
        inner.schema_version += 1;
        Ok(desc)
    }

    pub fn table(&self, name: &str) -> Result<TableDescriptor> {
        self.inner
            .read()
            .tables
            .get(name)
            .cloned()
            .ok_or_else(|| DbError::NotFound(format!("table {}", name)))
    }

    pub fn tables(&self) -> Vec<TableDescriptor> {
        self.inner.read().tables.values().cloned().collect()
    }

    pub fn add_index(&self, table: &str, mut index: IndexDescriptor) -> Result<IndexDescriptor> {
        let mut inner = self.inner.write();
        let desc = inner
            .tables
            .get_mut(table)
            .ok_or_else(|| DbError::NotFound(format!("table {}", table)))?;
        if desc.indexes.iter().any(|i| i.name == index.name) {
            return Err(DbError::Catalog(format!(
                "index {} already exists on {}",
                index.name, table
            )));
        }
        index.id = inner.next_index_id;
        let out = index.clone();
        let desc = inner.tables.get_mut(table).unwrap();
        desc.indexes.push(index);
        inner.next_index_id += 1;
        inner.schema_version += 1;
        Ok(out)
    }

    pub fn drop_index(&self, table: &str, name: &str) -> Result<IndexDescriptor> {
        let mut inner = self.inner.write();
        let desc = inner
            .tables
            .get_mut(table)
            .ok_or_else(|| DbError::NotFound(format!("table {}", table)))?;
        let pos = desc
            .indexes
            .iter()
            .position(|i| i.name == name)
            .ok_or_else(|| DbError::NotFound(format!("index {}", name)))?;
        let removed = desc.indexes.remove(pos);
        inner.schema_version += 1;
        Ok(removed)
    }

    /// Swap the published statistics snapshot for a table.
    pub fn publish_snapshot(&self, table: &str, snapshot: SnapshotId) -> Result<Option<SnapshotId>> {
        let mut inner = self.inner.write();
        let desc = inner
            .tables
            .get_mut(table)
            .ok_or_else(|| DbError::NotFound(format!("table {}", table)))?;
        Ok(desc.stats_snapshot.replace(snapshot))
    }

    pub fn create_view(&self, view: ViewDescriptor) -> Result<()> {
        let mut inner = self.inner.write();
        if inner.views.contains_key(&view.name) {
            return Err(DbError::Catalog(format!(
                "view {} already exists",
                view.name
            )));
        }
        inner.schema_version += 1;
        inner.views.insert(view.name.clone(), view);
        Ok(())
    }

    pub fn drop_view(&self, name: &str) -> Result<()> {
        let mut inner = self.inner.write();
        inner
            .views
            .remove(name)
            .ok_or_else(|| DbError::NotFound(format!("view {}", name)))?;
        inner.schema_version += 1;
        Ok(())
    }

    pub fn view(&self, name: &str) -> Option<ViewDescriptor> {
        self.inner.read().views.get(name).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn users_table() -> TableDescriptor {
        TableDescriptor {
            id: 0,
            name: "users".into(),
            columns: vec![
                Column::new("id", DataType::Integer).primary_key(),
                Column::new("email", DataType::Text).not_null(),
                Column::new("score", DataType::Double),
            ],
            file_id: 1,
            indexes: vec![],
            stats_snapshot: None,
        }
    }

    #[test]
    fn test_create_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = Catalog::open(dir.path()).unwrap();
        catalog.create_table(users_table()).unwrap();
        catalog.save().unwrap();

        let reloaded = Catalog::open(dir.path()).unwrap();
        let t = reloaded.table("users").unwrap();
        assert_eq!(t.columns.len(), 3);
        assert!(t.columns[0].primary_key);
    }

    #[test]
    fn test_duplicate_table_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = Catalog::open(dir.path()).unwrap();
        catalog.create_table(users_table()).unwrap();
        assert!(catalog.create_table(users_table()).is_err());
    }

    #[test]
    fn test_schema_version_bumps() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = Catalog::open(dir.path()).unwrap();
        let v0 = catalog.schema_version();
        catalog.create_table(users_table()).unwrap();
        assert!(catalog.schema_version() > v0);
        let v1 = catalog.schema_version();
        catalog
            .add_index(
                "users",
                IndexDescriptor {
                    id: 0,
                    name: "users_email".into(),
                    table: "users".into(),
                    columns: vec!["email".into()],
                    unique: true,
                    file_id: 2,
                },
            )
            .unwrap();
        assert!(catalog.schema_version() > v1);
    }

    #[test]
    fn test_primary_key_type() {
        let t = users_table();
        assert_eq!(t.primary_key_type(), crate::btree::KeyType::Integer);
        assert_eq!(t.primary_key_columns(), vec![0]);
    }

    #[test]
    fn test_missing_table_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = Catalog::open(dir.path()).unwrap();
        assert!(matches!(
            catalog.table("ghost"),
            Err(DbError::NotFound(_))
        ));
    }
}
