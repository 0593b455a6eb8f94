// ABOUTME: Applies one finalized window to the target table in a single write transaction
// ABOUTME: Baseline replacement runs before the window's keyed changes

use std::fmt;
use std::sync::Arc;

use serde::Serialize;

use super::config::QueryAllFn;
use super::window::{PendingChange, Window};
use crate::init::Initializer;
use crate::table::{Table, TableRow};

/// Counts reported after a commit. `inserted` and `deleted` count the
/// operations applied, `total` is the row count the commit left behind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CommitStats {
    pub inserted: usize,
    pub deleted: usize,
    pub total: usize,
}

impl fmt::Display for CommitStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} inserted, {} deleted, {} total",
            self.inserted, self.deleted, self.total
        )
    }
}

pub(crate) struct Committer<T: TableRow> {
    table: Arc<Table<T>>,
    initializer: Initializer,
    query_all: Option<QueryAllFn<T>>,
}

impl<T: TableRow> Committer<T> {
    pub(crate) fn new(
        table: Arc<Table<T>>,
        initializer: Initializer,
        query_all: Option<QueryAllFn<T>>,
    ) -> Self {
        Self {
            table,
            initializer,
            query_all,
        }
    }

    pub(crate) fn commit(&self, window: Window<T>) -> CommitStats {
        let (baseline, changes) = window.into_parts();
        let mut stats = CommitStats::default();
        let mut txn = self.table.write();

        if let Some(rows) = baseline {
            let stale: Vec<T::Key> = match &self.query_all {
                Some(query_all) => txn
                    .query(|row| query_all(row))
                    .map(TableRow::primary_key)
                    .collect(),
                None => txn.iter().map(TableRow::primary_key).collect(),
            };
            for key in &stale {
                txn.delete_key(key);
            }
            stats.deleted += stale.len();

            for row in rows {
                txn.insert(row);
                stats.inserted += 1;
            }

            if self.initializer.done(&mut txn) {
                tracing::debug!(
                    table = %self.table.name(),
                    initializer = %self.initializer.name(),
                    "initial snapshot committed"
                );
            }
        }

        for change in changes {
            match change {
                PendingChange::Upsert(row) => {
                    txn.insert(row);
                    stats.inserted += 1;
                }
                PendingChange::Delete(row) => {
                    txn.delete(&row);
                    stats.deleted += 1;
                }
            }
        }

        stats.total = txn.len();
        txn.commit();
        stats
    }
}
