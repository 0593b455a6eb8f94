// ABOUTME: Coalescing window accumulating change events between two commits
// ABOUTME: Keeps the latest event per key and the most recent full snapshot

use std::collections::HashMap;

use super::config::TransformFn;
use crate::error::Result;
use crate::meta::{object_key, ObjectMeta};
use crate::source::ChangeEvent;

/// Latest pending change for one key.
#[derive(Debug, Clone, PartialEq)]
pub enum PendingChange<T> {
    Upsert(T),
    Delete(T),
}

#[derive(Debug)]
struct Entry<T> {
    seq: u64,
    change: PendingChange<T>,
}

/// Events accumulated since the last commit.
///
/// A `Replace` discards everything gathered so far in the window, including
/// an earlier baseline. Only the newest snapshot and the events after it are
/// committed.
#[derive(Debug)]
pub struct Window<T> {
    baseline: Option<Vec<T>>,
    entries: HashMap<String, Entry<T>>,
    next_seq: u64,
}

impl<T> Default for Window<T> {
    fn default() -> Self {
        Self {
            baseline: None,
            entries: HashMap::new(),
            next_seq: 0,
        }
    }
}

impl<T> Window<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `event` to the window, running `transform` on its object(s).
    ///
    /// Objects the transform rejects are dropped without touching other keys.
    /// An accepted object without an identity is an error.
    pub fn push<S: ObjectMeta>(
        &mut self,
        event: ChangeEvent<S>,
        transform: &TransformFn<S, T>,
    ) -> Result<()> {
        let (obj, deleted) = match event {
            ChangeEvent::Replace(objs) => {
                self.baseline = Some(objs.into_iter().filter_map(&**transform).collect());
                self.entries.clear();
                return Ok(());
            }
            ChangeEvent::Add(obj) | ChangeEvent::Update(obj) => (obj, false),
            ChangeEvent::Delete(obj) => (obj, true),
        };

        let key = object_key(&obj);
        let Some(row) = transform(obj) else {
            return Ok(());
        };
        let key = key?;

        let change = if deleted {
            PendingChange::Delete(row)
        } else {
            PendingChange::Upsert(row)
        };
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.insert(key, Entry { seq, change });
        Ok(())
    }

    /// Number of distinct keys with a pending change.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when committing the window would change nothing.
    pub fn is_empty(&self) -> bool {
        self.baseline.is_none() && self.entries.is_empty()
    }

    pub fn has_baseline(&self) -> bool {
        self.baseline.is_some()
    }

    /// Returns the window's contents and leaves an empty window behind.
    pub fn take(&mut self) -> Window<T> {
        std::mem::take(self)
    }

    /// Splits the window into its baseline and the pending changes in the
    /// order their latest event arrived.
    pub fn into_parts(self) -> (Option<Vec<T>>, Vec<PendingChange<T>>) {
        let mut entries: Vec<Entry<T>> = self.entries.into_values().collect();
        entries.sort_by_key(|entry| entry.seq);
        let changes = entries.into_iter().map(|entry| entry.change).collect();
        (self.baseline, changes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[derive(Debug, Clone, PartialEq)]
    struct Obj {
        name: &'static str,
        value: i32,
    }

    impl ObjectMeta for Obj {
        fn name(&self) -> Option<&str> {
            Some(self.name)
        }
    }

    fn obj(name: &'static str, value: i32) -> Obj {
        Obj { name, value }
    }

    fn identity() -> TransformFn<Obj, Obj> {
        Arc::new(Some)
    }

    #[test]
    fn test_last_event_per_key_wins() {
        let t = identity();
        let mut window = Window::new();
        window.push(ChangeEvent::Add(obj("a", 1)), &t).unwrap();
        window.push(ChangeEvent::Update(obj("a", 2)), &t).unwrap();
        window.push(ChangeEvent::Add(obj("b", 1)), &t).unwrap();
        window.push(ChangeEvent::Delete(obj("a", 2)), &t).unwrap();
        assert_eq!(window.len(), 2);

        let (baseline, changes) = window.into_parts();
        assert!(baseline.is_none());
        assert_eq!(
            changes,
            vec![
                PendingChange::Upsert(obj("b", 1)),
                PendingChange::Delete(obj("a", 2)),
            ]
        );
    }

    #[test]
    fn test_replace_discards_prior_window_state() {
        let t = identity();
        let mut window = Window::new();
        window
            .push(ChangeEvent::Replace(vec![obj("a", 1)]), &t)
            .unwrap();
        window.push(ChangeEvent::Update(obj("a", 2)), &t).unwrap();
        window
            .push(ChangeEvent::Replace(vec![obj("b", 5)]), &t)
            .unwrap();
        assert_eq!(window.len(), 0);
        window.push(ChangeEvent::Add(obj("c", 9)), &t).unwrap();

        let (baseline, changes) = window.into_parts();
        assert_eq!(baseline, Some(vec![obj("b", 5)]));
        assert_eq!(changes, vec![PendingChange::Upsert(obj("c", 9))]);
    }

    #[test]
    fn test_empty_replace_is_not_empty_window() {
        let t = identity();
        let mut window: Window<Obj> = Window::new();
        assert!(window.is_empty());
        window.push(ChangeEvent::Replace(vec![]), &t).unwrap();
        assert!(!window.is_empty());
        assert!(window.has_baseline());
    }

    #[test]
    fn test_transform_filters_events() {
        let t: TransformFn<Obj, Obj> = Arc::new(|o: Obj| (o.value >= 0).then_some(o));
        let mut window = Window::new();
        window.push(ChangeEvent::Add(obj("a", 1)), &t).unwrap();
        window.push(ChangeEvent::Update(obj("a", -1)), &t).unwrap();
        window
            .push(ChangeEvent::Replace(vec![obj("x", -1), obj("y", 3)]), &t)
            .unwrap();

        let (baseline, _) = window.take().into_parts();
        assert_eq!(baseline, Some(vec![obj("y", 3)]));
        assert!(window.is_empty());
    }

    #[test]
    fn test_filtered_update_keeps_earlier_event() {
        let t: TransformFn<Obj, Obj> = Arc::new(|o: Obj| (o.value >= 0).then_some(o));
        let mut window = Window::new();
        window.push(ChangeEvent::Add(obj("a", 1)), &t).unwrap();
        window.push(ChangeEvent::Update(obj("a", -1)), &t).unwrap();
        let (_, changes) = window.into_parts();
        assert_eq!(changes, vec![PendingChange::Upsert(obj("a", 1))]);
    }

    #[test]
    fn test_missing_identity_is_fatal() {
        let t = identity();
        let mut window = Window::new();
        let err = window
            .push(ChangeEvent::Add(obj("", 1)), &t)
            .unwrap_err();
        assert!(err.is_invariant_violation());
    }
}
