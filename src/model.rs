//! Core data model.
//!
//! A work record is one schedulable unit: which worker runs it and with what
//! input, what gates its eligibility (constraints, earliest start,
//! prerequisites), how it retries, and where it is in its lifecycle.

pub mod constraints;

pub use constraints::{ConstraintDelta, ConstraintSnapshot, Constraints, NetworkState, NetworkType};

use std::collections::BTreeSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::clock::add_duration;

// ---------------------------------------------------------------------------
// Work Record
// ---------------------------------------------------------------------------

/// A unit of work tracked by the scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkRecord {
    /// Unique identifier. Immutable for the record's lifetime.
    pub id: WorkId,

    /// Name of the registered worker that executes this record.
    pub worker: String,

    /// Current lifecycle state.
    pub state: State,

    /// Opaque payload handed to the worker. Bounded in size at enqueue.
    pub input: serde_json::Value,

    /// Payload returned by the last successful run.
    pub output: Option<serde_json::Value>,

    /// Environment conditions that must hold before the record is armed.
    pub constraints: Constraints,

    pub backoff: BackoffPolicy,

    /// Executions that ended in a retry, fault or timeout since the last
    /// reset. Periodic records reset this after every completed period.
    pub run_attempt_count: u32,

    /// Maximum attempts before the record is forced to FAILED.
    /// None = use the scheduler default.
    pub max_attempts: Option<u32>,

    /// Higher = armed first when backend capacity is scarce.
    pub priority: i32,

    pub schedule: Schedule,

    /// Not eligible before this instant. None = immediately.
    pub earliest_start: Option<DateTime<Utc>>,

    /// Set when the record was admitted through `enqueue_unique`.
    pub unique_name: Option<String>,

    pub tags: BTreeSet<String>,

    /// True while the record waits out a retry delay.
    pub is_backed_off: bool,

    /// Reason recorded by the last failed or retried run.
    pub last_error: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl WorkRecord {
    pub fn is_periodic(&self) -> bool {
        matches!(self.schedule, Schedule::Periodic { .. })
    }

    /// Attempt limit for this record given the scheduler default.
    pub fn attempt_limit(&self, default_max_attempts: u32) -> u32 {
        self.max_attempts.unwrap_or(default_max_attempts).max(1)
    }
}

/// Newtype for work record IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkId(pub Uuid);

impl WorkId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for WorkId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Short display: first 8 chars of UUID
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

impl std::str::FromStr for WorkId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        s.parse().map(WorkId)
    }
}

impl Default for WorkId {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Lifecycle state of a work record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum State {
    /// Waiting for constraints, its start time, a backend slot, or a fire.
    Enqueued,
    /// Waiting for prerequisites. Only entered at creation.
    Blocked,
    /// Handed to a worker.
    Running,
    /// Terminal.
    Succeeded,
    /// Terminal.
    Failed,
    /// Terminal.
    Cancelled,
}

impl State {
    /// Can transition from self to `to`?
    pub fn can_transition_to(self, to: State) -> bool {
        use State::*;
        matches!(
            (self, to),
            (Blocked, Enqueued)
                | (Blocked, Failed)     // prerequisite failed or cancelled
                | (Blocked, Cancelled)
                | (Enqueued, Running)
                | (Enqueued, Failed)    // no worker registered
                | (Enqueued, Cancelled)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Running, Enqueued)   // retry, periodic re-arm, recovery
                | (Running, Cancelled)
        )
    }

    /// Is this a terminal state?
    pub fn is_terminal(self) -> bool {
        matches!(self, State::Succeeded | State::Failed | State::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            State::Enqueued => "enqueued",
            State::Blocked => "blocked",
            State::Running => "running",
            State::Succeeded => "succeeded",
            State::Failed => "failed",
            State::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for State {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "enqueued" => Ok(State::Enqueued),
            "blocked" => Ok(State::Blocked),
            "running" => Ok(State::Running),
            "succeeded" => Ok(State::Succeeded),
            "failed" => Ok(State::Failed),
            "cancelled" => Ok(State::Cancelled),
            _ => Err(format!("unknown state: {s}")),
        }
    }
}

// ---------------------------------------------------------------------------
// Backoff
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffKind {
    Linear,
    Exponential,
}

impl BackoffKind {
    pub fn as_str(self) -> &'static str {
        match self {
            BackoffKind::Linear => "linear",
            BackoffKind::Exponential => "exponential",
        }
    }
}

impl std::str::FromStr for BackoffKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "linear" => Ok(BackoffKind::Linear),
            "exponential" => Ok(BackoffKind::Exponential),
            _ => Err(format!("unknown backoff kind: {s}")),
        }
    }
}

/// Maps an attempt count to a retry delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    pub kind: BackoffKind,
    pub base_delay: Duration,
}

pub const DEFAULT_BACKOFF_DELAY: Duration = Duration::from_secs(30);

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            kind: BackoffKind::Exponential,
            base_delay: DEFAULT_BACKOFF_DELAY,
        }
    }
}

impl BackoffPolicy {
    pub fn linear(base_delay: Duration) -> Self {
        Self {
            kind: BackoffKind::Linear,
            base_delay,
        }
    }

    pub fn exponential(base_delay: Duration) -> Self {
        Self {
            kind: BackoffKind::Exponential,
            base_delay,
        }
    }

    /// Delay before the retry following `attempt` (1-based), capped at `max`.
    ///
    /// Linear: `base * attempt`. Exponential: `base * 2^(attempt - 1)`.
    pub fn delay_for(&self, attempt: u32, max: Duration) -> Duration {
        let attempt = attempt.max(1);
        let delay = match self.kind {
            BackoffKind::Linear => self.base_delay.saturating_mul(attempt),
            BackoffKind::Exponential => {
                let factor = 2u32.checked_pow(attempt - 1).unwrap_or(u32::MAX);
                self.base_delay.saturating_mul(factor)
            }
        };
        delay.min(max)
    }
}

// ---------------------------------------------------------------------------
// Schedule
// ---------------------------------------------------------------------------

/// One-shot or fixed-interval execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Schedule {
    #[default]
    OneShot,
    /// Runs once per `interval`. With a flex window the run becomes eligible
    /// `flex` before the end of the interval.
    Periodic {
        interval: Duration,
        flex: Option<Duration>,
    },
}

impl Schedule {
    /// Start of the next period's eligibility window, for periodic schedules.
    pub fn next_run_after(&self, completed_at: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match *self {
            Schedule::OneShot => None,
            Schedule::Periodic { interval, flex } => {
                let offset = interval.saturating_sub(flex.unwrap_or(Duration::ZERO));
                Some(add_duration(completed_at, offset))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Uniqueness
// ---------------------------------------------------------------------------

/// What `enqueue_unique` does when an active record already holds the name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExistingWorkPolicy {
    /// Drop the new submission.
    Keep,
    /// Cancel the existing records and admit the new one.
    Replace,
    /// Chain the new record after the most recent one with the name.
    Append,
}

impl ExistingWorkPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            ExistingWorkPolicy::Keep => "keep",
            ExistingWorkPolicy::Replace => "replace",
            ExistingWorkPolicy::Append => "append",
        }
    }
}

impl std::fmt::Display for ExistingWorkPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for ExistingWorkPolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "keep" => Ok(ExistingWorkPolicy::Keep),
            "replace" => Ok(ExistingWorkPolicy::Replace),
            "append" => Ok(ExistingWorkPolicy::Append),
            _ => Err(format!("unknown policy: {s} (expected keep, replace or append)")),
        }
    }
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// What a worker reports at the end of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum WorkResult {
    Success { output: serde_json::Value },
    Retry,
    Failure { reason: String },
}

impl WorkResult {
    pub fn success() -> Self {
        WorkResult::Success {
            output: serde_json::Value::Null,
        }
    }

    pub fn success_with(output: serde_json::Value) -> Self {
        WorkResult::Success { output }
    }

    pub fn failure(reason: impl Into<String>) -> Self {
        WorkResult::Failure {
            reason: reason.into(),
        }
    }
}

/// Why a record ended in FAILED.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureReason {
    /// The worker returned `Failure`.
    Reported { reason: String },
    /// Retries, faults and timeouts used up the attempt budget.
    MaxAttemptsExceeded { attempts: u32 },
    /// A prerequisite ended FAILED or CANCELLED.
    PrerequisiteFailed { prerequisite: WorkId },
    NoWorker { worker: String },
    OutputTooLarge { bytes: usize, limit: usize },
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureReason::Reported { reason } => write!(f, "{reason}"),
            FailureReason::MaxAttemptsExceeded { attempts } => {
                write!(f, "max attempts exceeded after {attempts} attempts")
            }
            FailureReason::PrerequisiteFailed { prerequisite } => {
                write!(f, "prerequisite {prerequisite} did not succeed")
            }
            FailureReason::NoWorker { worker } => write!(f, "no worker registered for '{worker}'"),
            FailureReason::OutputTooLarge { bytes, limit } => {
                write!(f, "output of {bytes} bytes exceeds limit of {limit} bytes")
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Builder for new work. The scheduler's public API for describing work.
#[derive(Debug, Clone)]
pub struct NewWork {
    pub(crate) worker: String,
    pub(crate) input: serde_json::Value,
    pub(crate) constraints: Constraints,
    pub(crate) backoff: BackoffPolicy,
    pub(crate) max_attempts: Option<u32>,
    pub(crate) priority: i32,
    pub(crate) interval: Option<Duration>,
    pub(crate) flex: Option<Duration>,
    pub(crate) initial_delay: Option<Duration>,
    pub(crate) tags: BTreeSet<String>,
    pub(crate) prerequisites: Vec<WorkId>,
}

impl NewWork {
    pub fn new(worker: impl Into<String>) -> Self {
        Self {
            worker: worker.into(),
            input: serde_json::Value::Null,
            constraints: Constraints::default(),
            backoff: BackoffPolicy::default(),
            max_attempts: None,
            priority: 0,
            interval: None,
            flex: None,
            initial_delay: None,
            tags: BTreeSet::new(),
            prerequisites: Vec::new(),
        }
    }

    pub fn input(mut self, input: serde_json::Value) -> Self {
        self.input = input;
        self
    }

    pub fn constraints(mut self, constraints: Constraints) -> Self {
        self.constraints = constraints;
        self
    }

    pub fn backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn max_attempts(mut self, n: u32) -> Self {
        self.max_attempts = Some(n);
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Make the work periodic with the given interval.
    pub fn periodic(mut self, interval: Duration) -> Self {
        self.interval = Some(interval);
        self
    }

    /// Flex window for periodic work.
    pub fn flex(mut self, flex: Duration) -> Self {
        self.flex = Some(flex);
        self
    }

    pub fn initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = Some(delay);
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    /// Run only after `prerequisite` has succeeded.
    pub fn after(mut self, prerequisite: WorkId) -> Self {
        if !self.prerequisites.contains(&prerequisite) {
            self.prerequisites.push(prerequisite);
        }
        self
    }

    pub fn is_periodic(&self) -> bool {
        self.interval.is_some()
    }
}
