// ABOUTME: Configuration for a reflector: source, batching limits, transform and scope
// ABOUTME: Unset limits fall back to defaults when the reflector is registered

use std::sync::Arc;
use std::time::Duration;

use crate::meta::ObjectMeta;
use crate::source::ChangeSource;

/// Maximum number of distinct keys to commit to the table in one write transaction.
pub const DEFAULT_MAX_BATCH_KEYS: usize = 10_000;

/// Amount of time to wait for a window to fill before committing it.
/// 10000 keys per 50ms bounds throughput at roughly 200k objects per second.
pub const DEFAULT_MAX_WAIT_TIME: Duration = Duration::from_millis(50);

/// Capacity of the channel between the change source and the reflector.
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Maps a source object to the stored row. Returning `None` drops the object.
pub type TransformFn<S, T> = Arc<dyn Fn(S) -> Option<T> + Send + Sync>;

/// Selects the rows owned by a reflector. On resync, every matching row is
/// deleted before the snapshot is inserted.
pub type QueryAllFn<T> = Arc<dyn Fn(&T) -> bool + Send + Sync>;

pub struct ReflectorConfig<S, T> {
    /// Upper bound on distinct keys per commit window. Zero means default.
    pub max_batch_keys: usize,

    /// Upper bound on how long the first event of a window waits before the
    /// window is committed. Zero means default.
    pub max_wait_time: Duration,

    /// Bounded queue size between source and reflector. Zero means default.
    pub event_capacity: usize,

    pub(crate) source: Option<Box<dyn ChangeSource<Object = S>>>,
    pub(crate) transform: TransformFn<S, T>,
    pub(crate) query_all: Option<QueryAllFn<T>>,
}

impl<S: ObjectMeta + Send + 'static> ReflectorConfig<S, S> {
    /// Config storing source objects as-is. Without a transform the row type
    /// is the source's object type.
    pub fn new() -> Self {
        Self {
            max_batch_keys: 0,
            max_wait_time: Duration::ZERO,
            event_capacity: 0,
            source: None,
            transform: Arc::new(Some),
            query_all: None,
        }
    }
}

impl<S: ObjectMeta + Send + 'static> Default for ReflectorConfig<S, S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S, T> ReflectorConfig<S, T>
where
    S: ObjectMeta + Send + 'static,
    T: Send + 'static,
{
    pub fn with_source(mut self, source: impl ChangeSource<Object = S>) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// Replaces the transform, changing the row type. Any scope predicate set
    /// for the previous row type is dropped, so set it afterwards.
    pub fn with_transform<U, F>(self, transform: F) -> ReflectorConfig<S, U>
    where
        F: Fn(S) -> Option<U> + Send + Sync + 'static,
    {
        ReflectorConfig {
            max_batch_keys: self.max_batch_keys,
            max_wait_time: self.max_wait_time,
            event_capacity: self.event_capacity,
            source: self.source,
            transform: Arc::new(transform),
            query_all: None,
        }
    }

    pub fn with_query_all<F>(mut self, query_all: F) -> Self
    where
        F: Fn(&T) -> bool + Send + Sync + 'static,
    {
        self.query_all = Some(Arc::new(query_all));
        self
    }

    pub fn with_max_batch_keys(mut self, max_batch_keys: usize) -> Self {
        self.max_batch_keys = max_batch_keys;
        self
    }

    pub fn with_max_wait_time(mut self, max_wait_time: Duration) -> Self {
        self.max_wait_time = max_wait_time;
        self
    }

    pub fn with_event_capacity(mut self, event_capacity: usize) -> Self {
        self.event_capacity = event_capacity;
        self
    }

    pub fn has_source(&self) -> bool {
        self.source.is_some()
    }

    /// Fills in unset fields with default values.
    pub(crate) fn with_defaults(mut self) -> Self {
        if self.max_batch_keys == 0 {
            self.max_batch_keys = DEFAULT_MAX_BATCH_KEYS;
        }
        if self.max_wait_time.is_zero() {
            self.max_wait_time = DEFAULT_MAX_WAIT_TIME;
        }
        if self.event_capacity == 0 {
            self.event_capacity = DEFAULT_EVENT_CAPACITY;
        }
        self
    }
}
