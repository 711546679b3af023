//! # backwork
//!
//! Persistent background work scheduler.
//!
//! Work records survive process restarts in a SQLite store, run only when
//! their environment constraints hold, wait on prerequisite records, retry
//! with backoff, and are dispatched through a capacity-limited managed
//! backend with a self-managed alarm fallback.

pub mod backend;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod event;
pub mod model;
pub mod resolver;
pub mod storage;
pub mod telemetry;
pub mod tracker;
pub mod worker;

pub use engine::{RecoveryReport, Scheduler, SchedulerBuilder, SubmitResult};
pub use error::{Error, Result};
pub use model::{
    BackoffPolicy, ConstraintDelta, ConstraintSnapshot, Constraints, ExistingWorkPolicy,
    NetworkType, NewWork, State, WorkId, WorkRecord, WorkResult,
};
pub use worker::{StopSignal, WorkContext, Worker};
