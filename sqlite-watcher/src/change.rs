use serde_json::{Map, Value};

use crate::snapshot::TableSnapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOperation {
    Insert,
    Update,
    Delete,
}

/// A single row-level change between two snapshots of the same table.
///
/// For deletes `payload` carries the last row contents seen before the row
/// disappeared.
#[derive(Debug, Clone, PartialEq)]
pub struct RowChange {
    pub table_name: String,
    pub operation: ChangeOperation,
    pub primary_key: String,
    pub payload: Map<String, Value>,
}

/// Computes the row changes that turn `previous` into `current`.
///
/// Rows whose contents are unchanged produce nothing. The output is ordered by
/// primary key.
pub fn diff_snapshots(previous: &TableSnapshot, current: &TableSnapshot) -> Vec<RowChange> {
    let mut changes = Vec::new();

    for (key, row) in &current.rows {
        let operation = match previous.rows.get(key) {
            None => ChangeOperation::Insert,
            Some(old) if old != row => ChangeOperation::Update,
            Some(_) => continue,
        };
        changes.push(RowChange {
            table_name: current.table_name.clone(),
            operation,
            primary_key: key.clone(),
            payload: row.clone(),
        });
    }

    for (key, row) in &previous.rows {
        if !current.rows.contains_key(key) {
            changes.push(RowChange {
                table_name: previous.table_name.clone(),
                operation: ChangeOperation::Delete,
                primary_key: key.clone(),
                payload: row.clone(),
            });
        }
    }

    changes.sort_by(|a, b| a.primary_key.cmp(&b.primary_key));
    changes
}
