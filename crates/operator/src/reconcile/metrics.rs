//! Process-wide reconcile counters exposed on `/metrics`

use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Which controller loop a counter belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerKind {
    Session,
    Project,
    Namespace,
}

#[derive(Debug, Default)]
struct Counters {
    reconciles: AtomicU64,
    errors: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            reconciles: self.reconciles.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Default)]
pub struct ControllerMetrics {
    ready: AtomicBool,
    sessions: Counters,
    projects: Counters,
    namespaces: Counters,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CounterSnapshot {
    pub reconciles: u64,
    pub errors: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub ready: bool,
    pub sessions: CounterSnapshot,
    pub projects: CounterSnapshot,
    pub namespaces: CounterSnapshot,
}

impl ControllerMetrics {
    fn counters(&self, kind: ControllerKind) -> &Counters {
        match kind {
            ControllerKind::Session => &self.sessions,
            ControllerKind::Project => &self.projects,
            ControllerKind::Namespace => &self.namespaces,
        }
    }

    pub fn record_reconcile(&self, kind: ControllerKind) {
        self.counters(kind).reconciles.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self, kind: ControllerKind) {
        self.counters(kind).errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::Relaxed);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            ready: self.is_ready(),
            sessions: self.sessions.snapshot(),
            projects: self.projects.snapshot(),
            namespaces: self.namespaces.snapshot(),
        }
    }
}
