// ABOUTME: Library root for statedb-reflector
// ABOUTME: Exports the reflector engine, change sources, table and job plumbing

pub mod error;
pub mod health;
pub mod init;
pub mod jobs;
pub mod meta;
pub mod reflector;
pub mod source;
pub mod table;
pub mod utils;

pub use error::{ReflectorError, Result};
pub use health::{Health, HealthReporter, StatusBoard, TracingHealth};
pub use jobs::{JobGroup, JobResult, Shutdown};
pub use meta::{object_key, ObjectMeta};
pub use reflector::{register_reflector, CommitStats, ReflectorConfig};
pub use source::{ChangeEvent, ChangeSource, EventSink};
pub use table::{ReadTxn, Table, TableRow, WriteTxn};
