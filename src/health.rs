// ABOUTME: Best-effort health reporting for background jobs
// ABOUTME: Reports are informational only and never influence control flow

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;

/// Receives human-readable status updates. Implementations must not block
/// for long and must never fail.
pub trait HealthReporter: Send + Sync {
    fn report(&self, component: &str, status: &str);
}

/// Forwards health reports to the tracing subscriber.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingHealth;

impl HealthReporter for TracingHealth {
    fn report(&self, component: &str, status: &str) {
        tracing::info!(component, status, "health");
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComponentStatus {
    pub message: String,
    pub updated_at: chrono::DateTime<chrono::Utc>,
    pub updates: u64,
}

/// Keeps the latest status of every component so it can be queried or
/// printed.
#[derive(Debug, Default)]
pub struct StatusBoard {
    statuses: Mutex<BTreeMap<String, ComponentStatus>>,
}

impl StatusBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, component: &str) -> Option<ComponentStatus> {
        self.statuses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(component)
            .cloned()
    }

    pub fn snapshot(&self) -> BTreeMap<String, ComponentStatus> {
        self.statuses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl HealthReporter for StatusBoard {
    fn report(&self, component: &str, status: &str) {
        let mut statuses = self.statuses.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = statuses
            .entry(component.to_string())
            .or_insert_with(|| ComponentStatus {
                message: String::new(),
                updated_at: chrono::Utc::now(),
                updates: 0,
            });
        entry.message = status.to_string();
        entry.updated_at = chrono::Utc::now();
        entry.updates += 1;
    }
}

/// Fans a report out to several reporters.
#[derive(Default, Clone)]
pub struct MultiReporter {
    reporters: Vec<Arc<dyn HealthReporter>>,
}

impl MultiReporter {
    pub fn new(reporters: Vec<Arc<dyn HealthReporter>>) -> Self {
        Self { reporters }
    }
}

impl HealthReporter for MultiReporter {
    fn report(&self, component: &str, status: &str) {
        for reporter in &self.reporters {
            reporter.report(component, status);
        }
    }
}

/// Health handle scoped to one component (usually one job).
#[derive(Clone)]
pub struct Health {
    component: String,
    reporter: Arc<dyn HealthReporter>,
}

impl Health {
    pub fn new(component: impl Into<String>, reporter: Arc<dyn HealthReporter>) -> Self {
        Self {
            component: component.into(),
            reporter,
        }
    }

    pub fn component(&self) -> &str {
        &self.component
    }

    pub fn ok(&self, status: impl AsRef<str>) {
        self.reporter.report(&self.component, status.as_ref());
    }
}

impl std::fmt::Debug for Health {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Health")
            .field("component", &self.component)
            .finish()
    }
}
