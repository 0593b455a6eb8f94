use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rusqlite::types::ValueRef;
use rusqlite::{Connection, OptionalExtension};
use serde_json::{Map, Number, Value};

const KEY_ALIAS: &str = "__watcher_key";

#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("table {0} does not exist")]
    UnknownTable(String),
    #[error("identifier cannot be empty")]
    EmptyIdentifier,
    #[error("row in table {table} has a NULL value in key column {column}")]
    NullKey { table: String, column: String },
}

/// Full contents of one table at a point in time, keyed by the stringified
/// key column.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TableSnapshot {
    pub table_name: String,
    pub rows: BTreeMap<String, Map<String, Value>>,
}

impl TableSnapshot {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Reads complete snapshots of a single table.
pub struct SnapshotReader {
    path: PathBuf,
    conn: Connection,
    table_name: String,
    key_column: String,
    query: String,
}

impl SnapshotReader {
    pub fn open(
        db_path: impl AsRef<Path>,
        table_name: impl Into<String>,
        key_column: impl Into<String>,
    ) -> Result<Self> {
        let path = db_path.as_ref();
        let table_name = table_name.into();
        let key_column = key_column.into();
        if table_name.is_empty() || key_column.is_empty() {
            return Err(SnapshotError::EmptyIdentifier.into());
        }

        let conn = Connection::open(path)
            .with_context(|| format!("failed to open database {}", path.display()))?;
        let exists = conn
            .query_row(
                "SELECT 1 FROM sqlite_master WHERE type IN ('table', 'view') AND name = ?1",
                [&table_name],
                |_| Ok(()),
            )
            .optional()
            .context("failed to inspect sqlite_master")?;
        if exists.is_none() {
            return Err(SnapshotError::UnknownTable(table_name).into());
        }

        let query = format!(
            "SELECT {} AS {KEY_ALIAS}, * FROM {}",
            quote_identifier(&key_column),
            quote_identifier(&table_name)
        );
        Ok(Self {
            path: path.to_path_buf(),
            conn,
            table_name,
            key_column,
            query,
        })
    }

    pub fn read(&self) -> Result<TableSnapshot> {
        let mut stmt = self
            .conn
            .prepare_cached(&self.query)
            .with_context(|| format!("failed to prepare snapshot of {}", self.table_name))?;
        let column_names: Vec<String> = stmt
            .column_names()
            .into_iter()
            .map(str::to_string)
            .collect();

        let mut rows = stmt.query([])?;
        let mut out = BTreeMap::new();
        while let Some(row) = rows.next()? {
            let key = match row.get_ref(0)? {
                ValueRef::Null => {
                    return Err(SnapshotError::NullKey {
                        table: self.table_name.clone(),
                        column: self.key_column.clone(),
                    }
                    .into())
                }
                value => key_to_string(value),
            };
            let mut columns = Map::new();
            for (idx, name) in column_names.iter().enumerate().skip(1) {
                columns.insert(name.clone(), value_to_json(row.get_ref(idx)?));
            }
            out.insert(key, columns);
        }

        Ok(TableSnapshot {
            table_name: self.table_name.clone(),
            rows: out,
        })
    }

    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn quote_identifier(name: &str) -> String {
    if is_rowid_alias(name) {
        return name.to_string();
    }
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn is_rowid_alias(name: &str) -> bool {
    ["rowid", "oid", "_rowid_"]
        .iter()
        .any(|alias| name.eq_ignore_ascii_case(alias))
}

fn key_to_string(value: ValueRef<'_>) -> String {
    match value {
        ValueRef::Integer(i) => i.to_string(),
        ValueRef::Real(f) => f.to_string(),
        ValueRef::Text(t) => String::from_utf8_lossy(t).into_owned(),
        ValueRef::Blob(b) => BASE64.encode(b),
        ValueRef::Null => String::new(),
    }
}

fn value_to_json(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::Number(i.into()),
        ValueRef::Real(f) => Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null),
        ValueRef::Text(t) => Value::String(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Value::String(BASE64.encode(b)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn reads_rows_keyed_by_column() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("snap.db");
        let conn = Connection::open(&db_path).unwrap();
        conn.execute_batch(
            r#"
            CREATE TABLE vaults(id TEXT PRIMARY KEY, balance REAL, owner TEXT, blob BLOB);
            INSERT INTO vaults VALUES ('a', 1.5, 'alice', x'0102');
            INSERT INTO vaults VALUES ('b', NULL, 'bob', NULL);
        "#,
        )
        .unwrap();

        let reader = SnapshotReader::open(&db_path, "vaults", "id").unwrap();
        let snapshot = reader.read().unwrap();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot.rows["a"]["balance"], json!(1.5));
        assert_eq!(snapshot.rows["a"]["blob"], json!("AQI="));
        assert_eq!(snapshot.rows["b"]["balance"], Value::Null);
        assert!(!snapshot.rows["a"].contains_key(KEY_ALIAS));
    }

    #[test]
    fn defaults_to_rowid_keys() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("rowid.db");
        let conn = Connection::open(&db_path).unwrap();
        conn.execute_batch("CREATE TABLE notes(body TEXT); INSERT INTO notes VALUES ('x');")
            .unwrap();

        let reader = SnapshotReader::open(&db_path, "notes", "rowid").unwrap();
        let snapshot = reader.read().unwrap();
        assert_eq!(snapshot.rows["1"]["body"], json!("x"));
    }

    #[test]
    fn rejects_unknown_table() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("empty.db");
        Connection::open(&db_path).unwrap();

        let err = SnapshotReader::open(&db_path, "missing", "id")
            .err()
            .expect("missing table should fail");
        assert!(matches!(
            err.downcast_ref::<SnapshotError>(),
            Some(SnapshotError::UnknownTable(name)) if name == "missing"
        ));
    }

    #[test]
    fn quotes_identifiers() {
        assert_eq!(quote_identifier("we\"ird"), "\"we\"\"ird\"");
        assert_eq!(quote_identifier("ROWID"), "ROWID");
    }
}
