//! Constraint tracking.
//!
//! Holds the process-wide [`ConstraintSnapshot`] and the set of records
//! waiting on it. Applying a sensor delta returns exactly the waiting records
//! whose requirements just became satisfied, so the engine never rescans
//! the full work set when a condition flips.

use std::collections::HashMap;

use tokio::sync::mpsc;
use tracing::debug;

use crate::model::{ConstraintDelta, ConstraintSnapshot, Constraints, WorkId};

#[derive(Debug, Default)]
pub struct ConstraintTracker {
    snapshot: ConstraintSnapshot,
    waiting: HashMap<WorkId, Constraints>,
}

impl ConstraintTracker {
    pub fn new(snapshot: ConstraintSnapshot) -> Self {
        Self {
            snapshot,
            waiting: HashMap::new(),
        }
    }

    /// Whether `constraints` hold right now. Empty sets always hold.
    pub fn satisfied(&self, constraints: &Constraints) -> bool {
        constraints.is_empty() || self.snapshot.satisfies(constraints)
    }

    /// Start watching a record whose requirements are not yet met.
    pub fn watch(&mut self, id: WorkId, constraints: Constraints) {
        if !constraints.is_empty() {
            self.waiting.insert(id, constraints);
        }
    }

    pub fn unwatch(&mut self, id: WorkId) {
        self.waiting.remove(&id);
    }

    /// Drop watched records for which `keep` returns false.
    pub fn retain(&mut self, mut keep: impl FnMut(WorkId) -> bool) {
        self.waiting.retain(|id, _| keep(*id));
    }

    pub fn is_watching(&self, id: WorkId) -> bool {
        self.waiting.contains_key(&id)
    }

    pub fn waiting_count(&self) -> usize {
        self.waiting.len()
    }

    /// Apply a delta and return the records that became satisfied.
    /// Returned records are no longer watched.
    pub fn apply(&mut self, delta: &ConstraintDelta) -> Vec<WorkId> {
        if !self.snapshot.apply(delta) {
            return Vec::new();
        }

        let snapshot = self.snapshot;
        let mut ready: Vec<WorkId> = self
            .waiting
            .iter()
            .filter(|(_, constraints)| snapshot.satisfies(constraints))
            .map(|(id, _)| *id)
            .collect();
        ready.sort();

        for id in &ready {
            self.waiting.remove(id);
        }
        if !ready.is_empty() {
            debug!(count = ready.len(), "constraints newly satisfied");
        }
        ready
    }
}

/// Handle sensors use to push snapshot deltas into the scheduler.
#[derive(Debug, Clone)]
pub struct ConstraintSink {
    tx: mpsc::UnboundedSender<ConstraintDelta>,
}

impl ConstraintSink {
    pub(crate) fn new(tx: mpsc::UnboundedSender<ConstraintDelta>) -> Self {
        Self { tx }
    }

    /// Push a delta. Returns false once the scheduler has gone away.
    pub fn push(&self, delta: ConstraintDelta) -> bool {
        self.tx.send(delta).is_ok()
    }
}
