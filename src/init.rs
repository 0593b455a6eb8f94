// ABOUTME: One-shot initialization signalling for tables
// ABOUTME: Initializers are registered in a write txn and completed exactly once

use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::watch;

use crate::table::{TableRow, WriteTxn};

/// A one-way not-ready -> ready flag. `fire` is safe to call from any number
/// of threads; only the first call transitions the gate.
#[derive(Debug)]
pub struct InitGate {
    tx: watch::Sender<bool>,
}

impl InitGate {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx }
    }

    /// Marks the gate ready. Returns true only for the call that performed the
    /// transition.
    pub fn fire(&self) -> bool {
        self.tx.send_if_modified(|ready| {
            if *ready {
                false
            } else {
                *ready = true;
                true
            }
        })
    }

    pub fn is_ready(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> InitWatch {
        InitWatch {
            rx: self.tx.subscribe(),
        }
    }
}

impl Default for InitGate {
    fn default() -> Self {
        Self::new()
    }
}

/// Reader side of an [`InitGate`].
#[derive(Debug, Clone)]
pub struct InitWatch {
    rx: watch::Receiver<bool>,
}

impl InitWatch {
    pub fn is_ready(&self) -> bool {
        *self.rx.borrow()
    }

    /// Waits until the gate fires. Returns false if the gate was dropped
    /// without ever firing.
    pub async fn wait(&mut self) -> bool {
        self.rx.wait_for(|ready| *ready).await.is_ok()
    }
}

/// Handle for one party that must finish before a table counts as
/// initialized. Obtained from [`WriteTxn::register_initializer`].
#[derive(Debug)]
pub struct Initializer {
    id: u64,
    name: String,
    fired: AtomicBool,
}

impl Initializer {
    pub(crate) fn new(id: u64, name: String) -> Self {
        Self {
            id,
            name,
            fired: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_done(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }

    /// Completes this initializer as part of `txn`. The completion becomes
    /// visible when `txn` commits. Calls after the first are no-ops and return
    /// false.
    pub fn done<T: TableRow>(&self, txn: &mut WriteTxn<'_, T>) -> bool {
        if self.fired.swap(true, Ordering::AcqRel) {
            return false;
        }
        txn.complete_initializer(self.id);
        true
    }
}
