pub mod change;
pub mod snapshot;
pub mod wal;

pub use change::{diff_snapshots, ChangeOperation, RowChange};
pub use snapshot::{SnapshotError, SnapshotReader, TableSnapshot};
pub use wal::{start_wal_watcher, WalEvent, WalWatcherConfig, WalWatcherHandle};
