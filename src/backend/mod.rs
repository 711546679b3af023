//! Dispatch backends and the selector that chooses between them.
//!
//! A backend holds wake-ups for armed records and reports each one through
//! a [`FireSink`] when it fires. Two adapters ship with the crate:
//!
//! - [`ManagedBackend`]: capacity-limited admission, modelling a platform
//!   job service with a fixed number of slots.
//! - [`AlarmBackend`]: a self-managed wake timer with no capacity limit.
//!   Its timers die with the process, so `recover()` re-arms them.
//!
//! The [`BackendSelector`] re-decides per arm call; nothing is cached
//! between calls.

mod alarm;
mod managed;
mod timer;

pub use alarm::AlarmBackend;
pub use managed::ManagedBackend;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::{Error, Result};
use crate::model::{WorkId, WorkRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Managed,
    SelfManaged,
}

impl BackendKind {
    pub fn as_str(self) -> &'static str {
        match self {
            BackendKind::Managed => "managed",
            BackendKind::SelfManaged => "self_managed",
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Capability set shared by every dispatch backend.
pub trait Backend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Host capability check. An unavailable backend rejects every arm.
    fn is_available(&self) -> bool;

    /// Whether one more record can be armed right now.
    fn has_capacity(&self) -> bool;

    /// Arm `record` to fire at `fire_at`. Re-arming an armed id replaces its timer.
    fn schedule(&self, record: &WorkRecord, fire_at: DateTime<Utc>) -> Result<()>;

    /// Disarm `id`. Disarming an id that is not armed is a no-op.
    fn cancel(&self, id: WorkId);

    fn currently_armed_ids(&self) -> Vec<WorkId>;
}

/// A backend wake-up for one armed record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fire {
    pub id: WorkId,
    pub backend: BackendKind,
}

/// Where backends deliver fires. Cloned into every backend.
#[derive(Debug, Clone)]
pub struct FireSink {
    tx: mpsc::UnboundedSender<Fire>,
}

impl FireSink {
    pub(crate) fn new(tx: mpsc::UnboundedSender<Fire>) -> Self {
        Self { tx }
    }

    /// Deliver a fire. Returns false once the scheduler has gone away.
    pub fn fire(&self, id: WorkId, backend: BackendKind) -> bool {
        self.tx.send(Fire { id, backend }).is_ok()
    }
}

/// Chooses a backend for each arm decision.
///
/// The managed backend is preferred while it is available and has a free
/// slot; otherwise the self-managed backend takes the record. When both
/// refuse, the caller leaves the record ENQUEUED for the next pass.
pub struct BackendSelector {
    managed: std::sync::Arc<dyn Backend>,
    fallback: std::sync::Arc<dyn Backend>,
}

impl BackendSelector {
    pub fn new(managed: std::sync::Arc<dyn Backend>, fallback: std::sync::Arc<dyn Backend>) -> Self {
        Self { managed, fallback }
    }

    pub fn arm(&self, record: &WorkRecord, fire_at: DateTime<Utc>) -> Result<BackendKind> {
        if self.managed.is_available() && self.managed.has_capacity() {
            match self.managed.schedule(record, fire_at) {
                Ok(()) => return Ok(self.managed.kind()),
                Err(e) => debug!(id = %record.id, "managed backend refused, falling back: {e}"),
            }
        }

        if !self.fallback.is_available() {
            return Err(Error::BackendUnavailable(
                "managed backend full or unavailable and self-managed backend unavailable"
                    .to_string(),
            ));
        }
        self.fallback.schedule(record, fire_at)?;
        Ok(self.fallback.kind())
    }

    /// Disarm `id` everywhere.
    pub fn disarm(&self, id: WorkId) {
        self.managed.cancel(id);
        self.fallback.cancel(id);
    }

    /// Every id either backend reports as armed, with its holder.
    pub fn currently_armed_ids(&self) -> Vec<(WorkId, BackendKind)> {
        let managed = self.managed.kind();
        let fallback = self.fallback.kind();
        self.managed
            .currently_armed_ids()
            .into_iter()
            .map(|id| (id, managed))
            .chain(
                self.fallback
                    .currently_armed_ids()
                    .into_iter()
                    .map(|id| (id, fallback)),
            )
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use crate::clock::{Clock, MonotonicClock};

    fn record() -> WorkRecord {
        let now = Utc::now();
        WorkRecord {
            id: WorkId::new(),
            worker: "noop".to_string(),
            state: crate::model::State::Enqueued,
            input: serde_json::Value::Null,
            output: None,
            constraints: Default::default(),
            backoff: Default::default(),
            run_attempt_count: 0,
            max_attempts: None,
            priority: 0,
            schedule: Default::default(),
            earliest_start: None,
            unique_name: None,
            tags: Default::default(),
            is_backed_off: false,
            last_error: None,
            created_at: now,
            updated_at: now,
            finished_at: None,
        }
    }

    fn setup(
        capacity: usize,
    ) -> (
        BackendSelector,
        Arc<ManagedBackend>,
        Arc<AlarmBackend>,
        mpsc::UnboundedReceiver<Fire>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sink = FireSink::new(tx);
        let clock: Arc<dyn Clock> = Arc::new(MonotonicClock::new());
        let managed = Arc::new(ManagedBackend::new(capacity, sink.clone(), clock.clone()));
        let alarm = Arc::new(AlarmBackend::new(sink, clock));
        let selector = BackendSelector::new(managed.clone(), alarm.clone());
        (selector, managed, alarm, rx)
    }

    #[tokio::test(start_paused = true)]
    async fn prefers_managed_until_full() {
        let (selector, managed, alarm, _rx) = setup(1);
        let far = Utc::now() + chrono::Duration::hours(1);

        assert_eq!(selector.arm(&record(), far).unwrap(), BackendKind::Managed);
        assert_eq!(
            selector.arm(&record(), far).unwrap(),
            BackendKind::SelfManaged
        );
        assert_eq!(managed.currently_armed_ids().len(), 1);
        assert_eq!(alarm.currently_armed_ids().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn falls_back_when_managed_is_unavailable() {
        let (selector, managed, _alarm, _rx) = setup(10);
        managed.set_available(false);
        let far = Utc::now() + chrono::Duration::hours(1);
        assert_eq!(
            selector.arm(&record(), far).unwrap(),
            BackendKind::SelfManaged
        );
    }

    #[tokio::test(start_paused = true)]
    async fn both_unavailable_is_an_error() {
        let (selector, managed, alarm, _rx) = setup(10);
        managed.set_available(false);
        alarm.set_available(false);
        let err = selector.arm(&record(), Utc::now()).unwrap_err();
        assert!(matches!(err, Error::BackendUnavailable(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn disarm_is_idempotent_and_suppresses_the_fire() {
        let (selector, managed, _alarm, mut rx) = setup(10);
        let rec = record();
        let soon = Utc::now() + chrono::Duration::seconds(5);
        selector.arm(&rec, soon).unwrap();

        selector.disarm(rec.id);
        selector.disarm(rec.id);
        selector.disarm(WorkId::new());
        assert!(managed.currently_armed_ids().is_empty());

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn armed_record_fires_once_and_leaves_the_armed_set() {
        let (selector, managed, _alarm, mut rx) = setup(10);
        let rec = record();
        let clock = MonotonicClock::new();
        selector
            .arm(&rec, clock.now() + chrono::Duration::seconds(30))
            .unwrap();

        let fire = rx.recv().await.unwrap();
        assert_eq!(
            fire,
            Fire {
                id: rec.id,
                backend: BackendKind::Managed
            }
        );
        assert!(managed.currently_armed_ids().is_empty());
        assert!(rx.try_recv().is_err());
    }
}
