//! Structured events recorded by the engine on every scheduling decision.
//!
//! Events are appended in the same transaction as the state change they
//! describe, so the log never disagrees with the records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{FailureReason, WorkId};

/// A structured event emitted by the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Monotonic sequence number. Consumers can detect gaps.
    pub seq: u64,
    /// When this event occurred.
    pub timestamp: DateTime<Utc>,
    /// What happened.
    pub kind: EventKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    WorkEnqueued {
        id: WorkId,
        worker: String,
        unique_name: Option<String>,
        priority: i32,
    },
    WorkBlocked {
        id: WorkId,
        prerequisites: Vec<WorkId>,
    },
    /// A KEEP submission was dropped in favour of an active record.
    WorkKept {
        existing: WorkId,
        unique_name: String,
    },
    WorkUnblocked {
        id: WorkId,
    },
    WorkRunning {
        id: WorkId,
        attempt: u32,
    },
    WorkSucceeded {
        id: WorkId,
    },
    WorkRetryScheduled {
        id: WorkId,
        attempt: u32,
        delay_ms: u64,
        error: Option<String>,
    },
    PeriodRescheduled {
        id: WorkId,
        next_run: DateTime<Utc>,
    },
    WorkFailed {
        id: WorkId,
        reason: FailureReason,
    },
    WorkCancelled {
        id: WorkId,
    },
    /// Found RUNNING at startup and demoted.
    WorkRecovered {
        id: WorkId,
        attempt: u32,
    },
    WorkPruned {
        count: usize,
    },
    /// A stored event this build does not understand.
    #[serde(skip)]
    Unknown {
        raw: String,
    },
}
