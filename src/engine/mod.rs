//! Scheduling core.
//!
//! [`Engine`] is the single sequencer for every state-affecting decision:
//! admission, arming, dispatch, result handling, cancellation and recovery.
//! Each decision commits in one store transaction, then updates the
//! in-memory working set (armed ids, ready queue, running slots) and
//! publishes the resulting transitions to status observers.
//!
//! The engine is synchronous. [`Scheduler`] wraps it in a mutex, feeds it
//! backend fires, worker results and constraint deltas, and spawns the
//! dispatches it produces.

mod control;
mod recovery;

pub use control::{Scheduler, SchedulerBuilder};
pub use recovery::RecoveryReport;

use std::cmp::Reverse;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use tokio::sync::broadcast;
use tracing::{Span, debug, info, warn};

use crate::backend::{BackendKind, BackendSelector, Fire};
use crate::clock::{Clock, add_duration};
use crate::config::SchedulerConfig;
use crate::error::{Error, Result};
use crate::event::{Event, EventKind};
use crate::model::*;
use crate::resolver::{self, DependencyGraph, Readiness, Transition, UniqueDecision};
use crate::storage::{Storage, TxContext};
use crate::telemetry::metrics;
use crate::telemetry::work::{record_state_transition, start_work_span};
use crate::tracker::ConstraintTracker;
use crate::worker::{StopHandle, StopSignal, Worker, WorkerRegistry};

/// What happened when work was submitted.
#[derive(Debug, Clone)]
pub enum SubmitResult {
    /// A new record was stored. Its state is ENQUEUED, BLOCKED, or FAILED
    /// when a prerequisite had already failed.
    Created(WorkRecord),
    /// KEEP policy: an active record already holds the name.
    Kept { existing: WorkId },
}

impl SubmitResult {
    /// Id the caller should track: the new record, or the kept one.
    pub fn id(&self) -> WorkId {
        match self {
            SubmitResult::Created(record) => record.id,
            SubmitResult::Kept { existing } => *existing,
        }
    }
}

/// How a run ended, as seen by the scheduler.
#[derive(Debug, Clone)]
pub(crate) enum Completion {
    Reported(WorkResult),
    /// The worker panicked or timed out.
    Fault(String),
}

#[derive(Debug, Clone)]
pub(crate) struct Finished {
    pub id: WorkId,
    pub run_id: u64,
    pub completion: Completion,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct StatusChange {
    pub id: WorkId,
    pub state: State,
}

/// A record moved to RUNNING that still has to be handed to its worker.
pub(crate) struct Dispatch {
    pub id: WorkId,
    pub run_id: u64,
    pub worker_name: String,
    pub worker: Arc<dyn Worker>,
    pub input: serde_json::Value,
    pub attempt: u32,
    pub stop: StopSignal,
    pub span: Span,
}

/// A fired record waiting for a running slot.
struct Ready {
    id: WorkId,
    priority: i32,
    created_at: DateTime<Utc>,
}

struct RunSlot {
    run_id: u64,
    worker: String,
    deadline: DateTime<Utc>,
    stop: StopHandle,
    span: Span,
}

enum RetryCause {
    Requested,
    Fault(String),
    /// Found RUNNING at startup.
    Interrupted,
}

enum RunOutcome {
    /// The record was no longer RUNNING.
    Skipped,
    Succeeded,
    Retried { attempt: u32, delay: Duration },
    Rescheduled(DateTime<Utc>),
    Failed(FailureReason),
}

enum Start {
    NoWorker(Vec<Transition>),
    Run {
        record: WorkRecord,
        worker: Arc<dyn Worker>,
        attempt: u32,
        changed: Vec<Transition>,
    },
}

pub(crate) struct Engine {
    storage: Storage,
    tracker: ConstraintTracker,
    selector: BackendSelector,
    workers: WorkerRegistry,
    config: SchedulerConfig,
    clock: Arc<dyn Clock>,
    /// Armed ids and the backend holding each.
    armed: HashMap<WorkId, BackendKind>,
    /// Fired records waiting for a running slot, started by priority.
    ready: Vec<Ready>,
    running: HashMap<WorkId, RunSlot>,
    next_run_id: u64,
    storage_available: bool,
    /// Results that arrived while storage was unavailable.
    deferred: Vec<Finished>,
    dispatches: Vec<Dispatch>,
    status_tx: broadcast::Sender<StatusChange>,
}

impl Engine {
    pub(crate) fn new(
        storage: Storage,
        selector: BackendSelector,
        workers: WorkerRegistry,
        tracker: ConstraintTracker,
        config: SchedulerConfig,
        clock: Arc<dyn Clock>,
        status_tx: broadcast::Sender<StatusChange>,
    ) -> Self {
        Self {
            storage,
            tracker,
            selector,
            workers,
            config,
            clock,
            armed: HashMap::new(),
            ready: Vec::new(),
            running: HashMap::new(),
            next_run_id: 0,
            storage_available: true,
            deferred: Vec::new(),
            dispatches: Vec::new(),
            status_tx,
        }
    }

    // -----------------------------------------------------------------------
    // Submission
    // -----------------------------------------------------------------------

    pub fn submit(&mut self, new: NewWork) -> Result<SubmitResult> {
        self.validate(&new)?;
        let worker = new.worker.clone();
        let (record, prerequisites) = self.build_record(new, None);
        let id = record.id;

        let result = self.storage.with_transaction(|tx| {
            let mut changed = Vec::new();
            admit(tx, vec![(record, prerequisites)], &mut changed)?;
            Ok((tx.get_record(id)?, changed))
        });
        let (record, changed) = self.counted(&worker, result)?;

        info!(id = %id, worker = %worker, state = %record.state, "work enqueued");
        self.apply(&changed);
        self.reschedule();
        Ok(SubmitResult::Created(record))
    }

    pub fn submit_unique(
        &mut self,
        name: &str,
        policy: ExistingWorkPolicy,
        new: NewWork,
    ) -> Result<SubmitResult> {
        if name.trim().is_empty() {
            return Err(Error::Validation("unique name is empty".to_string()));
        }
        self.validate(&new)?;
        if new.is_periodic() && policy == ExistingWorkPolicy::Append {
            return Err(Error::Validation(format!(
                "periodic work '{name}' cannot use the append policy"
            )));
        }

        let worker = new.worker.clone();
        let (record, mut prerequisites) = self.build_record(new, Some(name.to_string()));
        let id = record.id;

        let result = self.storage.with_transaction(|tx| {
            let mut changed = Vec::new();
            match resolver::decide_unique(tx, name, policy)? {
                UniqueDecision::Keep(existing) => {
                    tx.record_event(EventKind::WorkKept {
                        existing,
                        unique_name: name.to_string(),
                    })?;
                    return Ok((SubmitResult::Kept { existing }, changed));
                }
                UniqueDecision::Replace(active) => {
                    cancel_in(tx, &active, &mut changed)?;
                }
                UniqueDecision::Append(last) => {
                    if !prerequisites.contains(&last) {
                        prerequisites.push(last);
                    }
                }
                UniqueDecision::Admit => {}
            }
            admit(tx, vec![(record, prerequisites)], &mut changed)?;
            tx.reserve_unique_name(name, id)?;
            Ok((SubmitResult::Created(tx.get_record(id)?), changed))
        });
        let (outcome, changed) = match self.checked(result) {
            Ok(done) => done,
            Err(e) => {
                metrics::work_enqueued().add(
                    1,
                    &[
                        KeyValue::new("worker", worker),
                        KeyValue::new("result", "error"),
                    ],
                );
                return Err(e);
            }
        };

        let label = match &outcome {
            SubmitResult::Created(record) => {
                info!(id = %record.id, unique_name = name, %policy, state = %record.state, "unique work enqueued");
                "created"
            }
            SubmitResult::Kept { existing } => {
                info!(existing = %existing, unique_name = name, "active work kept, submission dropped");
                "kept"
            }
        };
        metrics::work_enqueued().add(
            1,
            &[
                KeyValue::new("worker", worker),
                KeyValue::new("result", label),
            ],
        );

        self.apply(&changed);
        self.reschedule();
        Ok(outcome)
    }

    /// Admit a group of records linked by `(prerequisite, dependent)` index
    /// pairs. Either every record is stored or none is.
    pub fn submit_chain(
        &mut self,
        works: Vec<NewWork>,
        edges: &[(usize, usize)],
    ) -> Result<Vec<WorkId>> {
        if works.is_empty() {
            return Err(Error::Validation("chain is empty".to_string()));
        }
        for work in &works {
            self.validate(work)?;
        }
        let n = works.len();
        for &(pre, dep) in edges {
            if pre >= n || dep >= n {
                return Err(Error::Validation(format!(
                    "edge ({pre}, {dep}) out of range for a chain of {n}"
                )));
            }
            if works[pre].is_periodic() || works[dep].is_periodic() {
                return Err(Error::Validation(
                    "periodic work cannot take part in a chain".to_string(),
                ));
            }
        }

        let mut batch: Vec<(WorkRecord, Vec<WorkId>)> = works
            .into_iter()
            .map(|work| self.build_record(work, None))
            .collect();
        let ids: Vec<WorkId> = batch.iter().map(|(record, _)| record.id).collect();

        let mut graph = DependencyGraph::new();
        for &(pre, dep) in edges {
            graph.add_dependency(ids[dep], ids[pre]);
            if !batch[dep].1.contains(&ids[pre]) {
                batch[dep].1.push(ids[pre]);
            }
        }
        if let Some(cycle) = graph.detect_cycle() {
            let path: Vec<String> = cycle
                .iter()
                .filter_map(|id| ids.iter().position(|i| i == id))
                .map(|i| format!("#{i}"))
                .collect();
            return Err(Error::Validation(format!(
                "dependency cycle: {}",
                path.join(" -> ")
            )));
        }

        let result = self.storage.with_transaction(|tx| {
            let mut changed = Vec::new();
            admit(tx, batch, &mut changed)?;
            Ok(changed)
        });
        let changed = self.checked(result)?;

        metrics::work_enqueued().add(
            n as u64,
            &[
                KeyValue::new("worker", "chain"),
                KeyValue::new("result", "created"),
            ],
        );
        info!(count = n, edges = edges.len(), "work chain enqueued");
        self.apply(&changed);
        self.reschedule();
        Ok(ids)
    }

    fn validate(&self, new: &NewWork) -> Result<()> {
        if new.worker.trim().is_empty() {
            return Err(Error::Validation("worker name is empty".to_string()));
        }
        let bytes = serde_json::to_vec(&new.input)?.len();
        if bytes > self.config.max_data_bytes {
            return Err(Error::Validation(format!(
                "input of {bytes} bytes exceeds limit of {} bytes",
                self.config.max_data_bytes
            )));
        }
        if new.max_attempts == Some(0) {
            return Err(Error::Validation(
                "max_attempts must be at least 1".to_string(),
            ));
        }
        if new.flex.is_some() && !new.is_periodic() {
            return Err(Error::Validation(
                "flex requires a periodic interval".to_string(),
            ));
        }
        if new.is_periodic() && !new.prerequisites.is_empty() {
            return Err(Error::Validation(
                "periodic work cannot have prerequisites".to_string(),
            ));
        }
        Ok(())
    }

    /// Turn a validated description into a record, clamping backoff and
    /// periodic parameters into their configured ranges.
    fn build_record(
        &self,
        new: NewWork,
        unique_name: Option<String>,
    ) -> (WorkRecord, Vec<WorkId>) {
        let now = self.clock.now();
        let schedule = match new.interval {
            None => Schedule::OneShot,
            Some(interval) => {
                let interval = interval.max(self.config.min_periodic_interval);
                Schedule::Periodic {
                    interval,
                    flex: new
                        .flex
                        .map(|flex| flex.max(self.config.min_periodic_flex).min(interval)),
                }
            }
        };
        let backoff = BackoffPolicy {
            kind: new.backoff.kind,
            base_delay: new
                .backoff
                .base_delay
                .max(self.config.min_backoff)
                .min(self.config.max_backoff),
        };

        let record = WorkRecord {
            id: WorkId::new(),
            worker: new.worker,
            state: State::Enqueued,
            input: new.input,
            output: None,
            constraints: new.constraints,
            backoff,
            run_attempt_count: 0,
            max_attempts: new.max_attempts,
            priority: new.priority,
            schedule,
            earliest_start: new.initial_delay.map(|delay| add_duration(now, delay)),
            unique_name,
            tags: new.tags,
            is_backed_off: false,
            last_error: None,
            created_at: now,
            updated_at: now,
            finished_at: None,
        };
        (record, new.prerequisites)
    }

    fn counted<T>(&mut self, worker: &str, result: Result<T>) -> Result<T> {
        let label = if result.is_ok() { "created" } else { "error" };
        metrics::work_enqueued().add(
            1,
            &[
                KeyValue::new("worker", worker.to_string()),
                KeyValue::new("result", label),
            ],
        );
        self.checked(result)
    }

    // -----------------------------------------------------------------------
    // Cancellation
    // -----------------------------------------------------------------------

    /// Cancel `id`. Cancelling a record that already finished is a no-op.
    pub fn cancel(&mut self, id: WorkId) -> Result<()> {
        let result = self.storage.with_transaction(|tx| {
            let mut changed = Vec::new();
            cancel_in(tx, &[id], &mut changed)?;
            Ok(changed)
        });
        let changed = self.checked(result)?;

        if !changed.is_empty() {
            info!(id = %id, dependents_failed = changed.len() - 1, "work cancelled");
        }
        self.apply(&changed);
        self.reschedule();
        Ok(())
    }

    /// Cancel every unfinished record carrying `tag`. Returns how many.
    pub fn cancel_by_tag(&mut self, tag: &str) -> Result<usize> {
        self.cancel_matching(|tx| tx.active_by_tag(tag))
    }

    /// Cancel every unfinished record admitted under `name`. Returns how many.
    pub fn cancel_by_unique_name(&mut self, name: &str) -> Result<usize> {
        self.cancel_matching(|tx| tx.active_by_unique_name(name))
    }

    /// Cancel every unfinished record. Returns how many.
    pub fn cancel_all(&mut self) -> Result<usize> {
        self.cancel_matching(|tx| tx.active_records())
    }

    fn cancel_matching(
        &mut self,
        find: impl FnOnce(&TxContext) -> Result<Vec<WorkRecord>>,
    ) -> Result<usize> {
        let result = self.storage.with_transaction(|tx| {
            let mut changed = Vec::new();
            let ids: Vec<WorkId> = find(&*tx)?.into_iter().map(|r| r.id).collect();
            let count = cancel_in(tx, &ids, &mut changed)?;
            Ok((count, changed))
        });
        let (count, changed) = self.checked(result)?;

        if count > 0 {
            info!(count, "work cancelled");
        }
        self.apply(&changed);
        self.reschedule();
        Ok(count)
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub fn status_of(&self, id: WorkId) -> Result<State> {
        self.storage.state_of(id)
    }

    pub fn work_info(&self, id: WorkId) -> Result<WorkRecord> {
        self.storage.get(id)
    }

    pub fn infos_by_tag(&self, tag: &str) -> Result<Vec<WorkRecord>> {
        self.storage.query_by_tag(tag)
    }

    pub fn infos_by_unique_name(&self, name: &str) -> Result<Vec<WorkRecord>> {
        self.storage.query_by_unique_name(name)
    }

    pub fn infos_by_state(&self, state: State) -> Result<Vec<WorkRecord>> {
        self.storage.query_by_state(state)
    }

    pub fn events_since(&self, seq: u64) -> Result<Vec<Event>> {
        self.storage.get_events_since(seq)
    }

    /// Delete finished records older than the retention window.
    pub fn prune(&mut self) -> Result<usize> {
        let retention = self.config.prune_retention;
        let result = self.storage.with_transaction(|tx| {
            let cutoff = chrono::Duration::from_std(retention)
                .ok()
                .and_then(|d| tx.now.checked_sub_signed(d))
                .unwrap_or(DateTime::<Utc>::MIN_UTC);
            let ids = tx.prunable(cutoff)?;
            for id in &ids {
                tx.delete_record(*id)?;
            }
            if !ids.is_empty() {
                tx.record_event(EventKind::WorkPruned { count: ids.len() })?;
            }
            Ok(ids.len())
        });
        let count = self.checked(result)?;
        if count > 0 {
            info!(count, "pruned finished work");
        }
        Ok(count)
    }

    // -----------------------------------------------------------------------
    // Arming and dispatch
    // -----------------------------------------------------------------------

    /// Reconcile the working set with the store and arm every ENQUEUED
    /// record whose constraints hold. Records still waiting on constraints
    /// go to the tracker; the time gate is the backend's fire time.
    pub fn schedule_pass(&mut self) -> Result<()> {
        if !self.storage_available {
            return Ok(());
        }
        let result = self.storage.query_by_state(State::Enqueued);
        let enqueued = self.checked(result)?;
        let live: HashSet<WorkId> = enqueued.iter().map(|r| r.id).collect();

        let stale: Vec<WorkId> = self
            .armed
            .keys()
            .filter(|id| !live.contains(id))
            .copied()
            .collect();
        for id in stale {
            self.selector.disarm(id);
            self.armed.remove(&id);
        }
        self.ready.retain(|r| live.contains(&r.id));
        self.tracker.retain(|id| live.contains(&id));
        self.reap_running()?;

        let now = self.clock.now();
        for record in &enqueued {
            if self.armed.contains_key(&record.id) || self.is_ready(record.id) {
                continue;
            }
            if !self.tracker.satisfied(&record.constraints) {
                self.tracker.watch(record.id, record.constraints);
                continue;
            }
            self.tracker.unwatch(record.id);
            self.arm(record, now);
        }

        self.drain_ready()
    }

    fn arm(&mut self, record: &WorkRecord, now: DateTime<Utc>) {
        let fire_at = record.earliest_start.map_or(now, |at| at.max(now));
        match self.selector.arm(record, fire_at) {
            Ok(kind) => {
                debug!(id = %record.id, backend = %kind, %fire_at, "armed");
                self.armed.insert(record.id, kind);
                metrics::backend_arm_decisions().add(
                    1,
                    &[
                        KeyValue::new("backend", kind.as_str()),
                        KeyValue::new("result", "armed"),
                    ],
                );
            }
            Err(e) => {
                debug!(id = %record.id, "arm deferred to next pass: {e}");
                metrics::backend_arm_decisions().add(
                    1,
                    &[
                        KeyValue::new("backend", "none"),
                        KeyValue::new("result", "deferred"),
                    ],
                );
            }
        }
    }

    /// Stop runs whose record was finished by another process.
    fn reap_running(&mut self) -> Result<()> {
        let ids: Vec<WorkId> = self.running.keys().copied().collect();
        for id in ids {
            let finished = match self.storage.state_of(id) {
                Ok(state) => state.is_terminal(),
                Err(Error::NotFound(_)) => true,
                Err(e) => return Err(self.storage_failed(e)),
            };
            if finished {
                if let Some(slot) = self.running.remove(&id) {
                    info!(id = %id, "record finished elsewhere, stopping run");
                    slot.stop.stop();
                }
            }
        }
        Ok(())
    }

    /// A backend fired for `fire.id`.
    pub fn on_fire(&mut self, fire: Fire) -> Result<()> {
        if self.armed.get(&fire.id) != Some(&fire.backend) {
            debug!(id = %fire.id, backend = %fire.backend, "ignoring stale fire");
            return Ok(());
        }
        self.armed.remove(&fire.id);

        if !self.storage_available {
            // Re-armed by the first pass after storage recovers.
            debug!(id = %fire.id, "storage unavailable, fire requeued");
            return Ok(());
        }

        let record = match self.storage.get(fire.id) {
            Ok(record) => record,
            Err(Error::NotFound(_)) => return Ok(()),
            Err(e) => return Err(self.storage_failed(e)),
        };
        if record.state != State::Enqueued {
            return Ok(());
        }
        if !self.tracker.satisfied(&record.constraints) {
            debug!(id = %record.id, "constraints no longer hold at fire time");
            self.tracker.watch(record.id, record.constraints);
            return Ok(());
        }
        let now = self.clock.now();
        if record.earliest_start.is_some_and(|at| at > now) {
            self.arm(&record, now);
            return Ok(());
        }

        self.ready.push(Ready {
            id: record.id,
            priority: record.priority,
            created_at: record.created_at,
        });
        self.drain_ready()
    }

    /// A sensor pushed a constraint delta.
    pub fn on_constraints(&mut self, delta: &ConstraintDelta) -> Result<()> {
        let satisfied = self.tracker.apply(delta);
        if satisfied.is_empty() || !self.storage_available {
            return Ok(());
        }

        let now = self.clock.now();
        for id in satisfied {
            let record = match self.storage.get(id) {
                Ok(record) => record,
                Err(Error::NotFound(_)) => continue,
                Err(e) => return Err(self.storage_failed(e)),
            };
            if record.state == State::Enqueued
                && !self.armed.contains_key(&id)
                && !self.is_ready(id)
            {
                debug!(id = %id, "constraints satisfied");
                self.arm(&record, now);
            }
        }
        self.drain_ready()
    }

    fn is_ready(&self, id: WorkId) -> bool {
        self.ready.iter().any(|r| r.id == id)
    }

    /// Start ready records, highest priority then oldest first, while
    /// running slots remain.
    fn drain_ready(&mut self) -> Result<()> {
        while self.running.len() < self.config.max_concurrent_running {
            let Some(next) = self
                .ready
                .iter()
                .enumerate()
                .max_by_key(|(_, r)| (r.priority, Reverse(r.created_at)))
                .map(|(i, _)| i)
            else {
                break;
            };
            let id = self.ready.swap_remove(next).id;
            self.start_run(id)?;
        }
        Ok(())
    }

    fn start_run(&mut self, id: WorkId) -> Result<()> {
        let workers = &self.workers;
        let result = self.storage.with_transaction(|tx| {
            let record = tx.get_record(id)?;
            if record.state != State::Enqueued {
                return Ok(None);
            }
            let mut changed = Vec::new();

            let Some(worker) = workers.get(&record.worker) else {
                let reason = FailureReason::NoWorker {
                    worker: record.worker.clone(),
                };
                let from = tx.update_state(id, State::Failed, 0)?;
                tx.set_last_error(id, Some(&reason.to_string()))?;
                tx.record_event(EventKind::WorkFailed { id, reason })?;
                changed.push(Transition {
                    id,
                    from,
                    to: State::Failed,
                });
                changed.extend(resolver::resolve_dependents(tx, id, State::Failed)?);
                return Ok(Some(Start::NoWorker(changed)));
            };

            let from = tx.update_state(id, State::Running, 0)?;
            tx.set_earliest_start(id, None, false)?;
            let attempt = record.run_attempt_count + 1;
            tx.record_event(EventKind::WorkRunning { id, attempt })?;
            changed.push(Transition {
                id,
                from,
                to: State::Running,
            });
            Ok(Some(Start::Run {
                record,
                worker,
                attempt,
                changed,
            }))
        });

        match self.checked(result)? {
            None => Ok(()),
            Some(Start::NoWorker(changed)) => {
                warn!(id = %id, "no worker registered, failing record");
                self.apply(&changed);
                Ok(())
            }
            Some(Start::Run {
                record,
                worker,
                attempt,
                changed,
            }) => {
                let (stop_handle, stop) = StopSignal::pair();
                let span = start_work_span(&record.worker, &id);
                self.next_run_id += 1;
                let run_id = self.next_run_id;
                self.running.insert(
                    id,
                    RunSlot {
                        run_id,
                        worker: record.worker.clone(),
                        deadline: add_duration(self.clock.now(), self.config.execution_timeout),
                        stop: stop_handle,
                        span: span.clone(),
                    },
                );
                self.apply(&changed);

                metrics::work_dispatched().add(1, &[KeyValue::new("worker", record.worker.clone())]);
                info!(id = %id, worker = %record.worker, attempt, "dispatching");
                self.dispatches.push(Dispatch {
                    id,
                    run_id,
                    worker_name: record.worker,
                    worker,
                    input: record.input,
                    attempt,
                    stop,
                    span,
                });
                Ok(())
            }
        }
    }

    /// Dispatches produced since the last call.
    pub fn take_dispatches(&mut self) -> Vec<Dispatch> {
        std::mem::take(&mut self.dispatches)
    }

    // -----------------------------------------------------------------------
    // Results
    // -----------------------------------------------------------------------

    pub fn on_finished(&mut self, finished: Finished) -> Result<()> {
        let Finished {
            id,
            run_id,
            completion,
        } = finished;
        if !self
            .running
            .get(&id)
            .is_some_and(|slot| slot.run_id == run_id)
        {
            debug!(id = %id, run_id, "ignoring result of a superseded run");
            return Ok(());
        }
        if !self.storage_available {
            debug!(id = %id, "storage unavailable, holding result");
            self.deferred.push(Finished {
                id,
                run_id,
                completion,
            });
            return Ok(());
        }

        let config = &self.config;
        let held = completion.clone();
        let result = self
            .storage
            .with_transaction(|tx| finish_run(tx, config, id, completion));
        let (outcome, changed) = match result {
            Ok(done) => done,
            Err(e) if e.is_storage() => {
                let e = self.storage_failed(e);
                warn!(id = %id, "holding result until storage recovers: {e}");
                self.deferred.push(Finished {
                    id,
                    run_id,
                    completion: held,
                });
                return Ok(());
            }
            Err(e) => {
                self.running.remove(&id);
                return Err(e);
            }
        };

        let worker = match self.running.remove(&id) {
            Some(slot) => {
                for t in changed.iter().filter(|t| t.id == id) {
                    record_state_transition(&slot.span, t.from.as_str(), t.to.as_str());
                }
                slot.worker
            }
            None => String::new(),
        };

        match outcome {
            RunOutcome::Skipped => {}
            RunOutcome::Succeeded => info!(id = %id, "work succeeded"),
            RunOutcome::Retried { attempt, delay } => {
                metrics::work_retries().add(1, &[KeyValue::new("worker", worker)]);
                info!(id = %id, attempt, delay_ms = delay.as_millis() as u64, "retry scheduled");
            }
            RunOutcome::Rescheduled(next_run) => {
                info!(id = %id, %next_run, "periodic work rescheduled")
            }
            RunOutcome::Failed(reason) => warn!(id = %id, %reason, "work failed"),
        }

        self.apply(&changed);
        self.schedule_pass()
    }

    /// Poll tick: storage health check, timeout sweep, then a pass.
    pub fn tick(&mut self) -> Result<()> {
        if !self.storage_available {
            if let Err(e) = self.storage.health_check() {
                debug!("storage still unavailable: {e}");
                return Ok(());
            }
            info!(held = self.deferred.len(), "storage available again, resuming");
            self.storage_available = true;
            for finished in std::mem::take(&mut self.deferred) {
                if let Err(e) = self.on_finished(finished) {
                    warn!("replaying held result failed: {e}");
                }
            }
        }
        self.sweep_timeouts()?;
        self.schedule_pass()
    }

    fn sweep_timeouts(&mut self) -> Result<()> {
        let now = self.clock.now();
        let expired: Vec<(WorkId, u64)> = self
            .running
            .iter()
            .filter(|(_, slot)| slot.deadline <= now)
            .map(|(id, slot)| (*id, slot.run_id))
            .collect();

        for (id, run_id) in expired {
            if let Some(slot) = self.running.get(&id) {
                slot.stop.stop();
            }
            warn!(id = %id, "execution timed out");
            self.on_finished(Finished {
                id,
                run_id,
                completion: Completion::Fault("execution timed out".to_string()),
            })?;
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Bookkeeping
    // -----------------------------------------------------------------------

    /// Publish committed transitions and drop finished records from the
    /// working set.
    fn apply(&mut self, changed: &[Transition]) {
        for t in changed {
            metrics::work_state_transitions().add(
                1,
                &[
                    KeyValue::new("from", t.from.as_str()),
                    KeyValue::new("to", t.to.as_str()),
                ],
            );
            if let Some(slot) = self.running.get(&t.id) {
                record_state_transition(&slot.span, t.from.as_str(), t.to.as_str());
            }
            if t.to.is_terminal() {
                self.forget(t.id);
            }
            let _ = self.status_tx.send(StatusChange {
                id: t.id,
                state: t.to,
            });
        }
    }

    fn forget(&mut self, id: WorkId) {
        self.selector.disarm(id);
        self.armed.remove(&id);
        self.ready.retain(|r| r.id != id);
        self.tracker.unwatch(id);
        if let Some(slot) = self.running.remove(&id) {
            debug!(id = %id, "stop requested");
            slot.stop.stop();
        }
    }

    /// Pass after a committed mutation. The mutation stands even if the pass fails.
    fn reschedule(&mut self) {
        if let Err(e) = self.schedule_pass() {
            warn!("scheduling pass failed: {e}");
        }
    }

    fn storage_failed(&mut self, e: Error) -> Error {
        if e.is_storage() && self.storage_available {
            warn!("storage unavailable, pausing scheduling: {e}");
            self.storage_available = false;
            metrics::storage_unavailable().add(1, &[]);
        }
        e
    }

    fn checked<T>(&mut self, result: Result<T>) -> Result<T> {
        result.map_err(|e| self.storage_failed(e))
    }
}

// ---------------------------------------------------------------------------
// Transaction bodies
// ---------------------------------------------------------------------------

/// Store a batch of new records and their edges, then settle every BLOCKED
/// one against prerequisites that may already be finished.
fn admit(
    tx: &TxContext,
    batch: Vec<(WorkRecord, Vec<WorkId>)>,
    changed: &mut Vec<Transition>,
) -> Result<()> {
    let batch_ids: HashSet<WorkId> = batch.iter().map(|(record, _)| record.id).collect();
    for (_, prerequisites) in &batch {
        for prerequisite in prerequisites {
            if batch_ids.contains(prerequisite) {
                continue;
            }
            match tx.get_record(*prerequisite) {
                Ok(existing) if existing.is_periodic() => {
                    return Err(Error::Validation(format!(
                        "cannot depend on periodic work {prerequisite}"
                    )));
                }
                Ok(_) => {}
                Err(Error::NotFound(_)) => {
                    return Err(Error::Validation(format!(
                        "unknown prerequisite {prerequisite}"
                    )));
                }
                Err(e) => return Err(e),
            }
        }
    }

    let mut edges = Vec::new();
    for (mut record, prerequisites) in batch {
        if !prerequisites.is_empty() {
            record.state = State::Blocked;
        }
        tx.insert_record(&record)?;
        tx.record_event(EventKind::WorkEnqueued {
            id: record.id,
            worker: record.worker.clone(),
            unique_name: record.unique_name.clone(),
            priority: record.priority,
        })?;
        if !prerequisites.is_empty() {
            tx.record_event(EventKind::WorkBlocked {
                id: record.id,
                prerequisites: prerequisites.clone(),
            })?;
            edges.push((record.id, prerequisites));
        }
    }

    for (id, prerequisites) in &edges {
        for prerequisite in prerequisites {
            tx.add_dependency(*prerequisite, *id)?;
        }
    }

    for (id, _) in edges {
        if tx.get_state(id)? != State::Blocked {
            continue;
        }
        match resolver::readiness(tx, id)? {
            Readiness::Ready => changed.push(resolver::unblock(tx, id)?),
            Readiness::Doomed(prerequisite) => {
                changed.push(resolver::fail_blocked(tx, id, prerequisite)?);
                changed.extend(resolver::resolve_dependents(tx, id, State::Failed)?);
            }
            Readiness::Waiting => {}
        }
    }
    Ok(())
}

/// Cancel the unfinished records among `ids`, then fail whatever was
/// blocked on them. The whole set is marked before any cascade runs, so a
/// member blocked on another member ends CANCELLED, not FAILED.
fn cancel_in(tx: &TxContext, ids: &[WorkId], changed: &mut Vec<Transition>) -> Result<usize> {
    let mut cancelled = Vec::with_capacity(ids.len());
    for &id in ids {
        if tx.get_state(id)?.is_terminal() {
            continue;
        }
        let from = tx.update_state(id, State::Cancelled, 0)?;
        tx.record_event(EventKind::WorkCancelled { id })?;
        changed.push(Transition {
            id,
            from,
            to: State::Cancelled,
        });
        cancelled.push(id);
    }
    for &id in &cancelled {
        changed.extend(resolver::resolve_dependents(tx, id, State::Cancelled)?);
    }
    Ok(cancelled.len())
}

fn finish_run(
    tx: &TxContext,
    config: &SchedulerConfig,
    id: WorkId,
    completion: Completion,
) -> Result<(RunOutcome, Vec<Transition>)> {
    let record = tx.get_record(id)?;
    let mut changed = Vec::new();
    if record.state != State::Running {
        return Ok((RunOutcome::Skipped, changed));
    }

    let outcome = match completion {
        Completion::Reported(WorkResult::Success { output }) => {
            let bytes = serde_json::to_vec(&output)?.len();
            if bytes > config.max_data_bytes {
                let reason = FailureReason::OutputTooLarge {
                    bytes,
                    limit: config.max_data_bytes,
                };
                fail_run(tx, &record, reason, 0, &mut changed)?
            } else {
                tx.set_output(id, &output)?;
                tx.set_last_error(id, None)?;
                if record.is_periodic() {
                    next_period(tx, &record, &mut changed)?
                } else {
                    let from = tx.update_state(id, State::Succeeded, 0)?;
                    tx.record_event(EventKind::WorkSucceeded { id })?;
                    changed.push(Transition {
                        id,
                        from,
                        to: State::Succeeded,
                    });
                    changed.extend(resolver::resolve_dependents(tx, id, State::Succeeded)?);
                    RunOutcome::Succeeded
                }
            }
        }
        Completion::Reported(WorkResult::Retry) => {
            retry_or_fail(tx, config, &record, RetryCause::Requested, &mut changed)?
        }
        Completion::Reported(WorkResult::Failure { reason }) => {
            fail_run(tx, &record, FailureReason::Reported { reason }, 0, &mut changed)?
        }
        Completion::Fault(error) => {
            retry_or_fail(tx, config, &record, RetryCause::Fault(error), &mut changed)?
        }
    };
    Ok((outcome, changed))
}

/// Move a RUNNING record back to ENQUEUED with backoff, or to FAILED once
/// the attempt budget is spent. Periodic records start their next period
/// instead of failing.
fn retry_or_fail(
    tx: &TxContext,
    config: &SchedulerConfig,
    record: &WorkRecord,
    cause: RetryCause,
    changed: &mut Vec<Transition>,
) -> Result<RunOutcome> {
    let id = record.id;
    let attempt = record.run_attempt_count + 1;
    if attempt >= record.attempt_limit(config.default_max_attempts) {
        let reason = FailureReason::MaxAttemptsExceeded { attempts: attempt };
        return fail_run(tx, record, reason, 1, changed);
    }

    let delay = record.backoff.delay_for(attempt, config.max_backoff);
    let from = tx.update_state(id, State::Enqueued, 1)?;
    tx.set_earliest_start(id, Some(add_duration(tx.now, delay)), true)?;

    let event = match cause {
        RetryCause::Requested => {
            tx.set_last_error(id, None)?;
            EventKind::WorkRetryScheduled {
                id,
                attempt,
                delay_ms: delay_ms(delay),
                error: None,
            }
        }
        RetryCause::Fault(error) => {
            tx.set_last_error(id, Some(&error))?;
            EventKind::WorkRetryScheduled {
                id,
                attempt,
                delay_ms: delay_ms(delay),
                error: Some(error),
            }
        }
        RetryCause::Interrupted => {
            tx.set_last_error(id, Some("interrupted by process restart"))?;
            EventKind::WorkRecovered { id, attempt }
        }
    };
    tx.record_event(event)?;

    changed.push(Transition {
        id,
        from,
        to: State::Enqueued,
    });
    Ok(RunOutcome::Retried { attempt, delay })
}

fn fail_run(
    tx: &TxContext,
    record: &WorkRecord,
    reason: FailureReason,
    attempt_delta: i32,
    changed: &mut Vec<Transition>,
) -> Result<RunOutcome> {
    let id = record.id;
    tx.set_last_error(id, Some(&reason.to_string()))?;
    if record.is_periodic() {
        return next_period(tx, record, changed);
    }

    let from = tx.update_state(id, State::Failed, attempt_delta)?;
    tx.record_event(EventKind::WorkFailed {
        id,
        reason: reason.clone(),
    })?;
    changed.push(Transition {
        id,
        from,
        to: State::Failed,
    });
    changed.extend(resolver::resolve_dependents(tx, id, State::Failed)?);
    Ok(RunOutcome::Failed(reason))
}

/// Re-enter ENQUEUED for the next period with a fresh attempt budget.
fn next_period(
    tx: &TxContext,
    record: &WorkRecord,
    changed: &mut Vec<Transition>,
) -> Result<RunOutcome> {
    let id = record.id;
    let next_run = record.schedule.next_run_after(tx.now).unwrap_or(tx.now);
    let from = tx.update_state(id, State::Enqueued, 0)?;
    tx.reset_attempts(id)?;
    tx.set_earliest_start(id, Some(next_run), false)?;
    tx.record_event(EventKind::PeriodRescheduled { id, next_run })?;
    changed.push(Transition {
        id,
        from,
        to: State::Enqueued,
    });
    Ok(RunOutcome::Rescheduled(next_run))
}

fn delay_ms(delay: Duration) -> u64 {
    u64::try_from(delay.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use async_trait::async_trait;

    use crate::backend::Backend;
    use crate::clock::ManualClock;
    use crate::worker::WorkContext;

    /// Backend that only records what it was asked to arm. Tests fire by hand.
    struct Recorder {
        kind: BackendKind,
        capacity: usize,
        available: Mutex<bool>,
        armed: Mutex<HashMap<WorkId, DateTime<Utc>>>,
    }

    impl Recorder {
        fn new(kind: BackendKind, capacity: usize) -> Arc<Self> {
            Arc::new(Self {
                kind,
                capacity,
                available: Mutex::new(true),
                armed: Mutex::new(HashMap::new()),
            })
        }

        fn set_available(&self, available: bool) {
            *self.available.lock().unwrap() = available;
        }

        fn fire_at(&self, id: WorkId) -> Option<DateTime<Utc>> {
            self.armed.lock().unwrap().get(&id).copied()
        }
    }

    impl Backend for Recorder {
        fn kind(&self) -> BackendKind {
            self.kind
        }

        fn is_available(&self) -> bool {
            *self.available.lock().unwrap()
        }

        fn has_capacity(&self) -> bool {
            self.armed.lock().unwrap().len() < self.capacity
        }

        fn schedule(&self, record: &WorkRecord, fire_at: DateTime<Utc>) -> Result<()> {
            if !self.is_available() {
                return Err(Error::BackendUnavailable(self.kind.to_string()));
            }
            self.armed.lock().unwrap().insert(record.id, fire_at);
            Ok(())
        }

        fn cancel(&self, id: WorkId) {
            self.armed.lock().unwrap().remove(&id);
        }

        fn currently_armed_ids(&self) -> Vec<WorkId> {
            self.armed.lock().unwrap().keys().copied().collect()
        }
    }

    struct Noop;

    #[async_trait]
    impl Worker for Noop {
        async fn run(&self, _ctx: WorkContext) -> WorkResult {
            WorkResult::success()
        }
    }

    struct Harness {
        engine: Engine,
        clock: Arc<ManualClock>,
        managed: Arc<Recorder>,
        alarm: Arc<Recorder>,
        status_rx: broadcast::Receiver<StatusChange>,
    }

    fn harness_with(config: SchedulerConfig, snapshot: ConstraintSnapshot) -> Harness {
        let clock = Arc::new(ManualClock::new("2026-03-01T12:00:00Z".parse().unwrap()));
        let storage = Storage::in_memory().unwrap().with_clock(clock.clone());
        let managed = Recorder::new(BackendKind::Managed, 2);
        let alarm = Recorder::new(BackendKind::SelfManaged, usize::MAX);
        let mut workers = WorkerRegistry::new();
        workers.register("noop", Arc::new(Noop));
        let (status_tx, status_rx) = broadcast::channel(64);

        let engine = Engine::new(
            storage,
            BackendSelector::new(managed.clone(), alarm.clone()),
            workers,
            ConstraintTracker::new(snapshot),
            config,
            clock.clone(),
            status_tx,
        );
        Harness {
            engine,
            clock,
            managed,
            alarm,
            status_rx,
        }
    }

    fn harness() -> Harness {
        harness_with(SchedulerConfig::default(), ConstraintSnapshot::unrestricted())
    }

    impl Harness {
        fn submit(&mut self, work: NewWork) -> WorkId {
            self.engine.submit(work).unwrap().id()
        }

        fn state(&self, id: WorkId) -> State {
            self.engine.status_of(id).unwrap()
        }

        fn record(&self, id: WorkId) -> WorkRecord {
            self.engine.work_info(id).unwrap()
        }

        /// Deliver the fire the holding backend would send.
        fn fire(&mut self, id: WorkId) {
            let backend = *self.engine.armed.get(&id).expect("record is armed");
            self.managed.cancel(id);
            self.alarm.cancel(id);
            self.engine.on_fire(Fire { id, backend }).unwrap();
        }

        fn run_once(&mut self, id: WorkId) -> Dispatch {
            self.fire(id);
            let mut dispatches = self.engine.take_dispatches();
            assert_eq!(dispatches.len(), 1, "expected one dispatch");
            dispatches.remove(0)
        }

        fn finish(&mut self, dispatch: &Dispatch, result: WorkResult) {
            self.engine
                .on_finished(Finished {
                    id: dispatch.id,
                    run_id: dispatch.run_id,
                    completion: Completion::Reported(result),
                })
                .unwrap();
        }
    }

    #[test]
    fn retries_back_off_linearly_then_fail_at_the_attempt_limit() {
        let mut h = harness();
        let id = h.submit(
            NewWork::new("noop")
                .backoff(BackoffPolicy::linear(Duration::from_secs(30)))
                .max_attempts(3),
        );

        for (attempt, delay_secs) in [(1, 30), (2, 60)] {
            let dispatch = h.run_once(id);
            assert_eq!(dispatch.attempt, attempt);
            h.finish(&dispatch, WorkResult::Retry);

            let record = h.record(id);
            let due = h.clock.now() + chrono::Duration::seconds(delay_secs);
            assert_eq!(record.state, State::Enqueued);
            assert_eq!(record.run_attempt_count, attempt);
            assert!(record.is_backed_off);
            assert_eq!(record.earliest_start, Some(due));
            assert_eq!(h.managed.fire_at(id), Some(due));
            h.clock.set(due);
        }

        let dispatch = h.run_once(id);
        assert_eq!(dispatch.attempt, 3);
        h.finish(&dispatch, WorkResult::Retry);

        let record = h.record(id);
        assert_eq!(record.state, State::Failed);
        assert_eq!(record.run_attempt_count, 3);
        assert!(record.last_error.unwrap().contains("max attempts"));
        assert!(h.managed.fire_at(id).is_none());
    }

    #[test]
    fn early_fire_is_rearmed_for_the_backoff_deadline() {
        let mut h = harness();
        let id = h.submit(NewWork::new("noop"));
        let dispatch = h.run_once(id);
        h.finish(&dispatch, WorkResult::Retry);

        h.fire(id);
        assert!(h.engine.take_dispatches().is_empty());
        assert_eq!(h.managed.fire_at(id), h.record(id).earliest_start);
    }

    #[test]
    fn periodic_success_starts_the_next_period_with_a_fresh_budget() {
        let mut h = harness();
        let id = h.submit(NewWork::new("noop").periodic(Duration::from_secs(3600)));

        let dispatch = h.run_once(id);
        h.finish(&dispatch, WorkResult::Retry);
        assert_eq!(h.record(id).run_attempt_count, 1);
        h.clock.advance(Duration::from_secs(30));

        let dispatch = h.run_once(id);
        assert_eq!(dispatch.attempt, 2);
        h.finish(&dispatch, WorkResult::success());

        let record = h.record(id);
        let next = h.clock.now() + chrono::Duration::hours(1);
        assert_eq!(record.state, State::Enqueued);
        assert_eq!(record.run_attempt_count, 0);
        assert!(!record.is_backed_off);
        assert_eq!(record.earliest_start, Some(next));
        assert_eq!(h.managed.fire_at(id), Some(next));

        let events = h.engine.events_since(0).unwrap();
        assert!(
            events
                .iter()
                .any(|e| matches!(e.kind, EventKind::PeriodRescheduled { id: rescheduled, .. } if rescheduled == id))
        );
    }

    #[test]
    fn periodic_failure_does_not_end_the_series() {
        let mut h = harness();
        let id = h.submit(NewWork::new("noop").periodic(Duration::from_secs(3600)));
        let dispatch = h.run_once(id);
        h.finish(&dispatch, WorkResult::failure("upstream down"));

        let record = h.record(id);
        assert_eq!(record.state, State::Enqueued);
        assert_eq!(record.last_error.as_deref(), Some("upstream down"));
    }

    #[test]
    fn results_are_held_while_storage_is_down_and_replayed_after() {
        let mut h = harness();
        let id = h.submit(NewWork::new("noop"));
        let dispatch = h.run_once(id);

        h.engine.storage.set_read_only(true).unwrap();
        h.finish(&dispatch, WorkResult::success());
        assert!(!h.engine.storage_available);
        assert_eq!(h.engine.deferred.len(), 1);
        assert_eq!(h.state(id), State::Running);

        // Health check still fails; nothing is replayed.
        h.engine.tick().unwrap();
        assert_eq!(h.engine.deferred.len(), 1);

        h.engine.storage.set_read_only(false).unwrap();
        h.engine.tick().unwrap();
        assert!(h.engine.storage_available);
        assert!(h.engine.deferred.is_empty());
        assert_eq!(h.state(id), State::Succeeded);
    }

    #[test]
    fn fire_with_lapsed_constraints_waits_for_the_next_delta() {
        let mut snapshot = ConstraintSnapshot::default();
        snapshot.apply(&ConstraintDelta::network(true));
        let mut h = harness_with(SchedulerConfig::default(), snapshot);

        let id = h.submit(
            NewWork::new("noop").constraints(Constraints::default().network(NetworkType::Connected)),
        );
        assert!(h.managed.fire_at(id).is_some());

        h.engine.on_constraints(&ConstraintDelta::network(false)).unwrap();
        h.fire(id);
        assert!(h.engine.take_dispatches().is_empty());
        assert!(h.engine.tracker.is_watching(id));
        assert_eq!(h.state(id), State::Enqueued);

        h.engine.on_constraints(&ConstraintDelta::network(true)).unwrap();
        assert!(!h.engine.tracker.is_watching(id));
        assert!(h.managed.fire_at(id).is_some());
    }

    #[test]
    fn unsatisfied_records_are_watched_not_armed() {
        let mut h = harness_with(SchedulerConfig::default(), ConstraintSnapshot::default());
        let id = h.submit(NewWork::new("noop").constraints(Constraints::default().charging()));
        assert!(h.engine.tracker.is_watching(id));
        assert!(h.managed.fire_at(id).is_none());
        assert!(h.alarm.fire_at(id).is_none());
    }

    #[test]
    fn timeout_stops_the_worker_and_charges_an_attempt() {
        let mut h = harness();
        let id = h.submit(NewWork::new("noop"));
        let dispatch = h.run_once(id);
        assert!(!dispatch.stop.is_stopped());

        h.clock.advance(SchedulerConfig::default().execution_timeout + Duration::from_secs(1));
        h.engine.tick().unwrap();
        assert!(dispatch.stop.is_stopped());

        let record = h.record(id);
        assert_eq!(record.state, State::Enqueued);
        assert_eq!(record.run_attempt_count, 1);
        assert_eq!(record.last_error.as_deref(), Some("execution timed out"));

        // The timed-out run reporting late changes nothing.
        h.finish(&dispatch, WorkResult::success());
        assert_eq!(h.state(id), State::Enqueued);
    }

    #[test]
    fn missing_worker_fails_the_record_and_its_dependents() {
        let mut h = harness();
        let ids = h
            .engine
            .submit_chain(vec![NewWork::new("ghost"), NewWork::new("noop")], &[(0, 1)])
            .unwrap();
        assert_eq!(h.state(ids[1]), State::Blocked);

        h.fire(ids[0]);
        assert!(h.engine.take_dispatches().is_empty());
        assert_eq!(h.state(ids[0]), State::Failed);
        assert_eq!(h.state(ids[1]), State::Failed);
        assert!(h.record(ids[0]).last_error.unwrap().contains("no worker"));
    }

    #[test]
    fn running_slots_are_capped() {
        let config = SchedulerConfig {
            max_concurrent_running: 1,
            ..SchedulerConfig::default()
        };
        let mut h = harness_with(config, ConstraintSnapshot::unrestricted());
        let first = h.submit(NewWork::new("noop"));
        let second = h.submit(NewWork::new("noop"));

        h.fire(first);
        h.fire(second);
        let mut dispatches = h.engine.take_dispatches();
        assert_eq!(dispatches.len(), 1);
        assert_eq!(h.state(second), State::Enqueued);

        let dispatch = dispatches.remove(0);
        h.finish(&dispatch, WorkResult::success());
        let dispatches = h.engine.take_dispatches();
        assert_eq!(dispatches.len(), 1);
        assert_eq!(dispatches[0].id, second);
        assert_eq!(h.state(second), State::Running);
    }

    #[test]
    fn freed_slot_goes_to_the_highest_priority_ready_record() {
        let config = SchedulerConfig {
            max_concurrent_running: 1,
            ..SchedulerConfig::default()
        };
        let mut h = harness_with(config, ConstraintSnapshot::unrestricted());
        let busy = h.submit(NewWork::new("noop"));
        let dispatch = h.run_once(busy);

        let low = h.submit(NewWork::new("noop").priority(1));
        let high = h.submit(NewWork::new("noop").priority(9));
        h.fire(low);
        h.fire(high);
        assert!(h.engine.take_dispatches().is_empty());

        h.finish(&dispatch, WorkResult::success());
        let dispatches = h.engine.take_dispatches();
        assert_eq!(dispatches.len(), 1);
        assert_eq!(dispatches[0].id, high);
        assert_eq!(h.state(low), State::Enqueued);
    }

    #[test]
    fn higher_priority_is_armed_first_when_slots_are_scarce() {
        let mut h = harness();
        h.managed.set_available(false);
        h.alarm.set_available(false);
        let low = h.submit(NewWork::new("noop").priority(1));
        let high = h.submit(NewWork::new("noop").priority(9));
        let mid = h.submit(NewWork::new("noop").priority(5));

        // Managed holds two; the rest overflows to the alarm backend.
        h.managed.set_available(true);
        h.alarm.set_available(true);
        h.engine.tick().unwrap();
        assert!(h.managed.fire_at(high).is_some());
        assert!(h.managed.fire_at(mid).is_some());
        assert!(h.alarm.fire_at(low).is_some());
    }

    #[test]
    fn chain_cycle_is_rejected_and_nothing_is_stored() {
        let mut h = harness();
        let err = h
            .engine
            .submit_chain(
                vec![NewWork::new("noop"), NewWork::new("noop"), NewWork::new("noop")],
                &[(0, 1), (1, 2), (2, 0)],
            )
            .unwrap_err();
        assert!(matches!(err, Error::Validation(ref msg) if msg.contains("cycle")));
        assert!(h.engine.infos_by_state(State::Enqueued).unwrap().is_empty());
        assert!(h.engine.infos_by_state(State::Blocked).unwrap().is_empty());
    }

    #[test]
    fn malformed_submissions_are_rejected() {
        let mut h = harness();
        let big = serde_json::Value::String("x".repeat(20_000));
        for work in [
            NewWork::new("noop").input(big),
            NewWork::new("noop").after(WorkId::new()),
            NewWork::new("noop").max_attempts(0),
            NewWork::new("noop").flex(Duration::from_secs(600)),
            NewWork::new(" "),
        ] {
            assert!(matches!(h.engine.submit(work), Err(Error::Validation(_))));
        }

        let periodic = NewWork::new("noop").periodic(Duration::from_secs(3600));
        assert!(matches!(
            h.engine
                .submit_unique("sync", ExistingWorkPolicy::Append, periodic),
            Err(Error::Validation(_))
        ));
        assert!(h.engine.infos_by_state(State::Enqueued).unwrap().is_empty());
    }

    #[test]
    fn periodic_parameters_are_clamped() {
        let mut h = harness();
        let id = h.submit(
            NewWork::new("noop")
                .periodic(Duration::from_secs(60))
                .flex(Duration::from_secs(1)),
        );
        let config = SchedulerConfig::default();
        assert_eq!(
            h.record(id).schedule,
            Schedule::Periodic {
                interval: config.min_periodic_interval,
                flex: Some(config.min_periodic_flex),
            }
        );
    }

    #[test]
    fn append_onto_a_finished_holder() {
        let mut h = harness();
        let first = h
            .engine
            .submit_unique("upload", ExistingWorkPolicy::Append, NewWork::new("noop"))
            .unwrap()
            .id();
        let dispatch = h.run_once(first);
        h.finish(&dispatch, WorkResult::success());

        let second = h
            .engine
            .submit_unique("upload", ExistingWorkPolicy::Append, NewWork::new("noop"))
            .unwrap()
            .id();
        assert_eq!(h.state(second), State::Enqueued);

        h.engine.cancel(second).unwrap();
        let third = h
            .engine
            .submit_unique("upload", ExistingWorkPolicy::Append, NewWork::new("noop"))
            .unwrap()
            .id();
        assert_eq!(h.state(third), State::Failed);
        assert!(h.record(third).last_error.unwrap().contains("prerequisite"));
    }

    #[test]
    fn append_onto_an_active_holder_waits_for_it() {
        let mut h = harness();
        let first = h
            .engine
            .submit_unique("upload", ExistingWorkPolicy::Append, NewWork::new("noop"))
            .unwrap()
            .id();
        let second = h
            .engine
            .submit_unique("upload", ExistingWorkPolicy::Append, NewWork::new("noop"))
            .unwrap()
            .id();
        assert_eq!(h.state(second), State::Blocked);

        let dispatch = h.run_once(first);
        h.finish(&dispatch, WorkResult::success());
        assert_eq!(h.state(second), State::Enqueued);
    }

    #[test]
    fn keep_and_replace() {
        let mut h = harness();
        let first = h
            .engine
            .submit_unique("sync", ExistingWorkPolicy::Keep, NewWork::new("noop"))
            .unwrap()
            .id();
        let kept = h
            .engine
            .submit_unique("sync", ExistingWorkPolicy::Keep, NewWork::new("noop"))
            .unwrap();
        assert!(matches!(kept, SubmitResult::Kept { existing } if existing == first));

        let replacement = h
            .engine
            .submit_unique("sync", ExistingWorkPolicy::Replace, NewWork::new("noop"))
            .unwrap()
            .id();
        assert_eq!(h.state(first), State::Cancelled);
        assert_eq!(h.state(replacement), State::Enqueued);
        assert!(h.managed.fire_at(first).is_none());
    }

    #[test]
    fn cancelling_a_running_record_stops_it_and_ignores_its_result() {
        let mut h = harness();
        let id = h.submit(NewWork::new("noop"));
        let dispatch = h.run_once(id);
        while h.status_rx.try_recv().is_ok() {}

        h.engine.cancel(id).unwrap();
        assert!(dispatch.stop.is_stopped());
        assert!(h.engine.running.is_empty());
        assert_eq!(
            h.status_rx.try_recv().unwrap(),
            StatusChange {
                id,
                state: State::Cancelled
            }
        );

        h.finish(&dispatch, WorkResult::success());
        assert_eq!(h.state(id), State::Cancelled);

        // Already terminal: a second cancel is a no-op.
        h.engine.cancel(id).unwrap();
        assert!(matches!(
            h.engine.cancel(WorkId::new()),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn cancel_by_unique_name_cancels_an_appended_chain() {
        let mut h = harness();
        let first = h
            .engine
            .submit_unique("upload", ExistingWorkPolicy::Append, NewWork::new("noop"))
            .unwrap()
            .id();
        let second = h
            .engine
            .submit_unique("upload", ExistingWorkPolicy::Append, NewWork::new("noop"))
            .unwrap()
            .id();

        assert_eq!(h.engine.cancel_by_unique_name("upload").unwrap(), 2);
        assert_eq!(h.state(first), State::Cancelled);
        assert_eq!(h.state(second), State::Cancelled);
    }

    #[test]
    fn replace_cancels_every_record_of_an_appended_chain() {
        let mut h = harness();
        let first = h
            .engine
            .submit_unique("upload", ExistingWorkPolicy::Append, NewWork::new("noop"))
            .unwrap()
            .id();
        let second = h
            .engine
            .submit_unique("upload", ExistingWorkPolicy::Append, NewWork::new("noop"))
            .unwrap()
            .id();
        let replacement = h
            .engine
            .submit_unique("upload", ExistingWorkPolicy::Replace, NewWork::new("noop"))
            .unwrap()
            .id();

        assert_eq!(h.state(first), State::Cancelled);
        assert_eq!(h.state(second), State::Cancelled);
        assert_eq!(h.state(replacement), State::Enqueued);
    }

    #[test]
    fn cancel_by_tag_cancels_tagged_dependents_and_fails_the_rest() {
        let mut h = harness();
        let ids = h
            .engine
            .submit_chain(
                vec![
                    NewWork::new("noop").tag("batch"),
                    NewWork::new("noop").tag("batch"),
                    NewWork::new("noop"),
                ],
                &[(0, 1), (1, 2)],
            )
            .unwrap();

        assert_eq!(h.engine.cancel_by_tag("batch").unwrap(), 2);
        assert_eq!(h.state(ids[0]), State::Cancelled);
        assert_eq!(h.state(ids[1]), State::Cancelled);
        assert_eq!(h.state(ids[2]), State::Failed);
    }

    #[test]
    fn cancel_all_stops_running_work_and_cancels_blocked_work() {
        let mut h = harness();
        let running = h.submit(NewWork::new("noop"));
        let dispatch = h.run_once(running);
        let chain = h
            .engine
            .submit_chain(vec![NewWork::new("noop"), NewWork::new("noop")], &[(0, 1)])
            .unwrap();
        let done = h.submit(NewWork::new("noop"));
        h.engine.cancel(done).unwrap();

        assert_eq!(h.engine.cancel_all().unwrap(), 3);
        assert!(dispatch.stop.is_stopped());
        assert!(h.engine.running.is_empty());
        for id in [running, chain[0], chain[1], done] {
            assert_eq!(h.state(id), State::Cancelled);
        }
        assert!(h.managed.currently_armed_ids().is_empty());
    }

    #[test]
    fn cancel_by_tag_counts_only_active_records() {
        let mut h = harness();
        let a = h.submit(NewWork::new("noop").tag("batch"));
        h.submit(NewWork::new("noop").tag("batch"));
        h.submit(NewWork::new("noop").tag("other"));
        h.engine.cancel(a).unwrap();

        assert_eq!(h.engine.cancel_by_tag("batch").unwrap(), 1);
        assert_eq!(h.engine.cancel_by_tag("batch").unwrap(), 0);
        assert_eq!(h.engine.infos_by_state(State::Enqueued).unwrap().len(), 1);
    }

    #[test]
    fn arming_waits_while_both_backends_refuse() {
        let mut h = harness();
        h.managed.set_available(false);
        h.alarm.set_available(false);
        let id = h.submit(NewWork::new("noop"));
        assert!(h.engine.armed.is_empty());
        assert_eq!(h.state(id), State::Enqueued);

        h.alarm.set_available(true);
        h.engine.tick().unwrap();
        assert_eq!(h.engine.armed.get(&id), Some(&BackendKind::SelfManaged));
    }

    #[test]
    fn prune_removes_only_old_finished_records() {
        let mut h = harness();
        let done = h.submit(NewWork::new("noop"));
        let pending = h.submit(NewWork::new("noop").initial_delay(Duration::from_secs(7 * 86_400)));
        h.engine.cancel(done).unwrap();

        assert_eq!(h.engine.prune().unwrap(), 0);
        h.clock.advance(SchedulerConfig::default().prune_retention + Duration::from_secs(1));
        assert_eq!(h.engine.prune().unwrap(), 1);
        assert!(matches!(h.engine.status_of(done), Err(Error::NotFound(_))));
        assert_eq!(h.state(pending), State::Enqueued);
    }

    #[test]
    fn recovery_requeues_interrupted_runs_once() {
        let mut h = harness();
        let id = h.submit(NewWork::new("noop"));
        h.run_once(id);

        // A fresh process owns no running slots.
        h.engine.running.clear();
        let report = h.engine.recover().unwrap();
        assert_eq!(report.requeued, 1);

        let record = h.record(id);
        assert_eq!(record.state, State::Enqueued);
        assert_eq!(record.run_attempt_count, 1);
        assert_eq!(
            record.last_error.as_deref(),
            Some("interrupted by process restart")
        );
        assert!(h.managed.fire_at(id).is_some());

        assert_eq!(h.engine.recover().unwrap(), RecoveryReport::default());
        assert_eq!(h.record(id).run_attempt_count, 1);
    }

    #[test]
    fn recovery_disarms_ids_with_no_waiting_record() {
        let mut h = harness();
        let id = h.submit(NewWork::new("noop"));
        h.engine.cancel(id).unwrap();
        let stray = WorkRecord {
            id: WorkId::new(),
            ..h.record(id)
        };
        h.alarm.schedule(&stray, h.clock.now()).unwrap();

        let report = h.engine.recover().unwrap();
        assert_eq!(report.disarmed, 1);
        assert!(h.alarm.currently_armed_ids().is_empty());
    }
}
