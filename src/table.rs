// ABOUTME: In-memory transactional table with snapshot reads
// ABOUTME: Writers are serialized; readers get immutable snapshots and never wait on writers

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use tokio::sync::watch;

use crate::init::{InitGate, InitWatch, Initializer};

/// A row stored in a [`Table`]. The table indexes rows by `primary_key`, which
/// may differ from the coalescing key a change source derives.
pub trait TableRow: Clone + Send + Sync + 'static {
    type Key: Ord + Clone + fmt::Debug + Send + Sync + 'static;

    fn primary_key(&self) -> Self::Key;
}

/// An immutable, point-in-time view of a table.
#[derive(Clone)]
pub struct ReadTxn<T: TableRow> {
    revision: u64,
    rows: Arc<BTreeMap<T::Key, T>>,
    pending_initializers: Arc<BTreeMap<u64, String>>,
}

impl<T: TableRow> ReadTxn<T> {
    fn empty() -> Self {
        Self {
            revision: 0,
            rows: Arc::new(BTreeMap::new()),
            pending_initializers: Arc::new(BTreeMap::new()),
        }
    }

    /// Number of committed write transactions this snapshot reflects.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn get(&self, key: &T::Key) -> Option<&T> {
        self.rows.get(key)
    }

    /// All rows in primary key order.
    pub fn iter(&self) -> impl Iterator<Item = &T> + '_ {
        self.rows.values()
    }

    pub fn query<'a, F>(&'a self, predicate: F) -> impl Iterator<Item = &'a T> + 'a
    where
        F: Fn(&T) -> bool + 'a,
    {
        self.rows.values().filter(move |row| predicate(row))
    }

    /// True once every registered initializer has completed.
    pub fn initialized(&self) -> bool {
        self.pending_initializers.is_empty()
    }

    pub fn pending_initializers(&self) -> Vec<&str> {
        self.pending_initializers
            .values()
            .map(String::as_str)
            .collect()
    }
}

impl<T: TableRow + fmt::Debug> fmt::Debug for ReadTxn<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadTxn")
            .field("revision", &self.revision)
            .field("rows", &self.rows.len())
            .field("pending_initializers", &self.pending_initializers)
            .finish()
    }
}

/// A multi-version in-memory table.
///
/// Committed state is an `Arc` snapshot that is swapped atomically on commit.
/// A write transaction copies the row map on its first mutation, so the cost of
/// a commit is proportional to the table size rather than the number of changes.
/// Batch writes accordingly.
pub struct Table<T: TableRow> {
    name: String,
    current: RwLock<ReadTxn<T>>,
    writer: Mutex<()>,
    next_initializer: AtomicU64,
    init_gate: InitGate,
    /// Mirrors `initialized()` of the latest committed snapshot.
    ready: watch::Sender<bool>,
}

impl<T: TableRow> Table<T> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            current: RwLock::new(ReadTxn::empty()),
            writer: Mutex::new(()),
            next_initializer: AtomicU64::new(1),
            init_gate: InitGate::new(),
            ready: watch::Sender::new(true),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the latest committed snapshot.
    pub fn read(&self) -> ReadTxn<T> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Opens a write transaction, waiting for any other writer to finish.
    /// Dropping the transaction without committing discards its changes.
    pub fn write(&self) -> WriteTxn<'_, T> {
        let guard = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let base = self.read();
        WriteTxn {
            table: self,
            revision: base.revision,
            rows: base.rows,
            pending_initializers: base.pending_initializers,
            completed_initializer: false,
            _guard: guard,
        }
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Watch that becomes ready the first time a commit completes the last
    /// pending initializer. Commits that never complete an initializer, such
    /// as seeding rows before a reflector registers, leave it untouched.
    pub fn init_watch(&self) -> InitWatch {
        self.init_gate.subscribe()
    }

    /// Waits until the latest committed snapshot has no pending initializers.
    pub async fn wait_initialized(&self) {
        let mut ready = self.ready.subscribe();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = ready.wait_for(|ready| *ready).await;
    }
}

impl<T: TableRow> fmt::Debug for Table<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let snapshot = self.read();
        f.debug_struct("Table")
            .field("name", &self.name)
            .field("revision", &snapshot.revision)
            .field("rows", &snapshot.len())
            .finish()
    }
}

/// An exclusive write transaction. Changes become visible to readers
/// atomically on [`WriteTxn::commit`].
pub struct WriteTxn<'a, T: TableRow> {
    table: &'a Table<T>,
    revision: u64,
    rows: Arc<BTreeMap<T::Key, T>>,
    pending_initializers: Arc<BTreeMap<u64, String>>,
    completed_initializer: bool,
    _guard: MutexGuard<'a, ()>,
}

impl<'a, T: TableRow> WriteTxn<'a, T> {
    /// Inserts or replaces the row with the same primary key. Returns the
    /// previous row, if any.
    pub fn insert(&mut self, row: T) -> Option<T> {
        Arc::make_mut(&mut self.rows).insert(row.primary_key(), row)
    }

    /// Deletes the row with the same primary key as `row`.
    pub fn delete(&mut self, row: &T) -> Option<T> {
        self.delete_key(&row.primary_key())
    }

    pub fn delete_key(&mut self, key: &T::Key) -> Option<T> {
        if !self.rows.contains_key(key) {
            return None;
        }
        Arc::make_mut(&mut self.rows).remove(key)
    }

    pub fn get(&self, key: &T::Key) -> Option<&T> {
        self.rows.get(key)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> + '_ {
        self.rows.values()
    }

    /// Rows visible in this transaction (including its own writes) that match
    /// `predicate`.
    pub fn query<'b, F>(&'b self, predicate: F) -> impl Iterator<Item = &'b T> + 'b
    where
        F: Fn(&T) -> bool + 'b,
    {
        self.rows.values().filter(move |row| predicate(row))
    }

    /// Registers a party that must call [`Initializer::done`] before the table
    /// counts as initialized. Takes effect when this transaction commits.
    pub fn register_initializer(&mut self, name: impl Into<String>) -> Initializer {
        let id = self.table.next_initializer.fetch_add(1, Ordering::Relaxed);
        let name = name.into();
        Arc::make_mut(&mut self.pending_initializers).insert(id, name.clone());
        Initializer::new(id, name)
    }

    pub(crate) fn complete_initializer(&mut self, id: u64) {
        if self.pending_initializers.contains_key(&id) {
            Arc::make_mut(&mut self.pending_initializers).remove(&id);
            self.completed_initializer = true;
        }
    }

    /// Publishes the transaction's changes and returns the resulting snapshot.
    pub fn commit(self) -> ReadTxn<T> {
        let snapshot = ReadTxn {
            revision: self.revision + 1,
            rows: self.rows,
            pending_initializers: self.pending_initializers,
        };
        *self
            .table
            .current
            .write()
            .unwrap_or_else(PoisonError::into_inner) = snapshot.clone();
        let initialized = snapshot.initialized();
        self.table.ready.send_if_modified(|ready| {
            let changed = *ready != initialized;
            *ready = initialized;
            changed
        });
        if initialized && self.completed_initializer && self.table.init_gate.fire() {
            tracing::debug!(table = %self.table.name, "table initialized");
        }
        snapshot
    }
}
