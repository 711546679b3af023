//! Scheduler handle: the public API and the run loop that feeds the engine.
//!
//! Callers, backend timers, sensors and finished workers all hand off into
//! one mutex-guarded [`Engine`]. Worker bodies run on their own tasks and
//! report back over a channel, so the sequencer never waits on them.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use opentelemetry::KeyValue;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{Notify, broadcast, mpsc};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_stream::Stream;
use tracing::{Instrument, debug, error, info};

use super::{Completion, Dispatch, Engine, Finished, RecoveryReport, StatusChange, SubmitResult};
use crate::backend::{AlarmBackend, Backend, BackendSelector, Fire, FireSink, ManagedBackend};
use crate::clock::{Clock, MonotonicClock};
use crate::config::SchedulerConfig;
use crate::error::{Error, Result};
use crate::event::Event;
use crate::model::*;
use crate::storage::Storage;
use crate::telemetry::metrics;
use crate::tracker::{ConstraintSink, ConstraintTracker};
use crate::worker::{WorkContext, Worker, WorkerRegistry};

/// Status changes buffered per observer before it lags and re-reads.
const STATUS_CHANNEL_CAPACITY: usize = 256;

struct Channels {
    fires: mpsc::UnboundedReceiver<Fire>,
    results: mpsc::UnboundedReceiver<Finished>,
    constraints: mpsc::UnboundedReceiver<ConstraintDelta>,
}

struct Inner {
    engine: Mutex<Engine>,
    status_tx: broadcast::Sender<StatusChange>,
    results_tx: mpsc::UnboundedSender<Finished>,
    constraint_tx: mpsc::UnboundedSender<ConstraintDelta>,
    /// Taken by `run()` for its lifetime.
    channels: Mutex<Option<Channels>>,
    shutdown: Notify,
    poll_interval: Duration,
}

impl Inner {
    fn lock_engine(&self) -> MutexGuard<'_, Engine> {
        self.engine.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Persistent background work scheduler.
///
/// Cheap to clone; every clone drives the same engine. Call
/// [`recover`](Scheduler::recover) once at startup before submitting, then
/// drive it with [`run`](Scheduler::run).
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

/// Builder for [`Scheduler`]. Backends default to a [`ManagedBackend`]
/// with `managed_capacity` slots and an [`AlarmBackend`] fallback.
pub struct SchedulerBuilder {
    storage: Storage,
    config: SchedulerConfig,
    clock: Option<Arc<dyn Clock>>,
    workers: WorkerRegistry,
    snapshot: ConstraintSnapshot,
    managed: Option<Arc<dyn Backend>>,
    fallback: Option<Arc<dyn Backend>>,
    fire_tx: mpsc::UnboundedSender<Fire>,
    fire_rx: mpsc::UnboundedReceiver<Fire>,
}

impl SchedulerBuilder {
    pub fn config(mut self, config: SchedulerConfig) -> Self {
        self.config = config;
        self
    }

    /// Time source for stored timestamps and backend timers.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn worker(mut self, name: impl Into<String>, worker: impl Worker + 'static) -> Self {
        self.workers.register(name, Arc::new(worker));
        self
    }

    /// Initial constraint snapshot. Defaults to nothing satisfied.
    pub fn constraints(mut self, snapshot: ConstraintSnapshot) -> Self {
        self.snapshot = snapshot;
        self
    }

    /// Sink custom backends report fires into.
    pub fn fire_sink(&self) -> FireSink {
        FireSink::new(self.fire_tx.clone())
    }

    pub fn managed_backend(mut self, backend: Arc<dyn Backend>) -> Self {
        self.managed = Some(backend);
        self
    }

    pub fn fallback_backend(mut self, backend: Arc<dyn Backend>) -> Self {
        self.fallback = Some(backend);
        self
    }

    pub fn build(self) -> Result<Scheduler> {
        self.config.validate()?;

        let clock: Arc<dyn Clock> = match self.clock {
            Some(clock) => clock,
            None => Arc::new(MonotonicClock::new()),
        };
        let sink = FireSink::new(self.fire_tx);
        let managed: Arc<dyn Backend> = match self.managed {
            Some(backend) => backend,
            None => Arc::new(ManagedBackend::new(
                self.config.managed_capacity,
                sink.clone(),
                Arc::clone(&clock),
            )),
        };
        let fallback: Arc<dyn Backend> = match self.fallback {
            Some(backend) => backend,
            None => Arc::new(AlarmBackend::new(sink, Arc::clone(&clock))),
        };

        let (status_tx, _) = broadcast::channel(STATUS_CHANNEL_CAPACITY);
        let (results_tx, results_rx) = mpsc::unbounded_channel();
        let (constraint_tx, constraint_rx) = mpsc::unbounded_channel();
        let poll_interval = self.config.poll_interval;

        let engine = Engine::new(
            self.storage.with_clock(Arc::clone(&clock)),
            BackendSelector::new(managed, fallback),
            self.workers,
            ConstraintTracker::new(self.snapshot),
            self.config,
            clock,
            status_tx.clone(),
        );

        Ok(Scheduler {
            inner: Arc::new(Inner {
                engine: Mutex::new(engine),
                status_tx,
                results_tx,
                constraint_tx,
                channels: Mutex::new(Some(Channels {
                    fires: self.fire_rx,
                    results: results_rx,
                    constraints: constraint_rx,
                })),
                shutdown: Notify::new(),
                poll_interval,
            }),
        })
    }
}

impl Scheduler {
    pub fn builder(storage: Storage) -> SchedulerBuilder {
        let (fire_tx, fire_rx) = mpsc::unbounded_channel();
        SchedulerBuilder {
            storage,
            config: SchedulerConfig::default(),
            clock: None,
            workers: WorkerRegistry::new(),
            snapshot: ConstraintSnapshot::default(),
            managed: None,
            fallback: None,
            fire_tx,
            fire_rx,
        }
    }

    /// Reconcile store and backends after a restart. Call once before
    /// accepting submissions.
    pub fn recover(&self) -> Result<RecoveryReport> {
        self.with_engine(|engine| engine.recover())
    }

    // -----------------------------------------------------------------------
    // Submission
    // -----------------------------------------------------------------------

    pub fn enqueue(&self, work: NewWork) -> Result<WorkId> {
        self.with_engine(|engine| engine.submit(work))
            .map(|result| result.id())
    }

    pub fn enqueue_unique(
        &self,
        name: &str,
        policy: ExistingWorkPolicy,
        work: NewWork,
    ) -> Result<SubmitResult> {
        self.with_engine(|engine| engine.submit_unique(name, policy, work))
    }

    /// Enqueue `works` with `(prerequisite, dependent)` edges given as
    /// indices into `works`. Returns ids in the order of `works`.
    pub fn enqueue_chain(
        &self,
        works: Vec<NewWork>,
        edges: &[(usize, usize)],
    ) -> Result<Vec<WorkId>> {
        self.with_engine(|engine| engine.submit_chain(works, edges))
    }

    pub fn cancel(&self, id: WorkId) -> Result<()> {
        self.with_engine(|engine| engine.cancel(id))
    }

    pub fn cancel_by_tag(&self, tag: &str) -> Result<usize> {
        self.with_engine(|engine| engine.cancel_by_tag(tag))
    }

    pub fn cancel_by_unique_name(&self, name: &str) -> Result<usize> {
        self.with_engine(|engine| engine.cancel_by_unique_name(name))
    }

    /// Cancel every unfinished record, including running ones.
    pub fn cancel_all(&self) -> Result<usize> {
        self.with_engine(|engine| engine.cancel_all())
    }

    pub fn prune(&self) -> Result<usize> {
        self.with_engine(|engine| engine.prune())
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub fn status_of(&self, id: WorkId) -> Result<State> {
        self.inner.lock_engine().status_of(id)
    }

    pub fn work_info(&self, id: WorkId) -> Result<WorkRecord> {
        self.inner.lock_engine().work_info(id)
    }

    pub fn infos_by_tag(&self, tag: &str) -> Result<Vec<WorkRecord>> {
        self.inner.lock_engine().infos_by_tag(tag)
    }

    pub fn infos_by_unique_name(&self, name: &str) -> Result<Vec<WorkRecord>> {
        self.inner.lock_engine().infos_by_unique_name(name)
    }

    pub fn infos_by_state(&self, state: State) -> Result<Vec<WorkRecord>> {
        self.inner.lock_engine().infos_by_state(state)
    }

    pub fn events_since(&self, seq: u64) -> Result<Vec<Event>> {
        self.inner.lock_engine().events_since(seq)
    }

    /// States of `id`, starting with the current one and ending after a
    /// terminal state. Consecutive duplicates are dropped. The stream is
    /// not restartable; subscribe again for a fresh one.
    pub fn observe_status(
        &self,
        id: WorkId,
    ) -> Result<impl Stream<Item = State> + Send + 'static + use<>> {
        // Changes are published under the engine lock, so everything the
        // receiver sees happened after this read.
        let (mut rx, current) = {
            let engine = self.inner.lock_engine();
            (self.inner.status_tx.subscribe(), engine.status_of(id)?)
        };
        let weak = Arc::downgrade(&self.inner);

        Ok(async_stream::stream! {
            let mut last = current;
            yield current;
            while !last.is_terminal() {
                let next = match rx.recv().await {
                    Ok(change) if change.id == id => change.state,
                    Ok(_) => continue,
                    Err(RecvError::Lagged(skipped)) => {
                        debug!(id = %id, skipped, "status observer lagged, re-reading");
                        let Some(inner) = weak.upgrade() else { break };
                        let state = inner.lock_engine().status_of(id);
                        match state {
                            Ok(state) => state,
                            Err(_) => break,
                        }
                    }
                    Err(RecvError::Closed) => break,
                };
                if next != last {
                    last = next;
                    yield next;
                }
            }
        })
    }

    /// Handle sensors push constraint deltas into.
    pub fn constraint_sink(&self) -> ConstraintSink {
        ConstraintSink::new(self.inner.constraint_tx.clone())
    }

    // -----------------------------------------------------------------------
    // Run loop
    // -----------------------------------------------------------------------

    /// Drive the scheduler until [`shutdown`](Scheduler::shutdown).
    ///
    /// Running records stay RUNNING in the store when the loop stops; the
    /// next `recover()` requeues them.
    pub async fn run(&self) -> Result<()> {
        let channels = self
            .inner
            .channels
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let Some(mut channels) = channels else {
            return Err(Error::Other("scheduler is already running".to_string()));
        };

        let mut ticker = tokio::time::interval(self.inner.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            poll_interval_secs = self.inner.poll_interval.as_secs(),
            "scheduler started"
        );

        loop {
            tokio::select! {
                _ = self.inner.shutdown.notified() => {
                    info!("scheduler shutting down");
                    break;
                }
                Some(fire) = channels.fires.recv() => {
                    self.step("fire", |engine| engine.on_fire(fire));
                }
                Some(finished) = channels.results.recv() => {
                    self.step("result", |engine| engine.on_finished(finished));
                }
                Some(delta) = channels.constraints.recv() => {
                    self.step("constraints", |engine| engine.on_constraints(&delta));
                }
                _ = ticker.tick() => {
                    self.step("tick", |engine| engine.tick());
                }
            }
        }

        *self
            .inner
            .channels
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(channels);
        Ok(())
    }

    /// Signal the run loop to stop.
    pub fn shutdown(&self) {
        self.inner.shutdown.notify_one();
    }

    fn step(&self, what: &'static str, f: impl FnOnce(&mut Engine) -> Result<()>) {
        if let Err(e) = self.with_engine(f) {
            error!(step = what, "scheduling step failed: {e}");
        }
    }

    /// Run `f` under the engine lock, then spawn whatever it dispatched.
    fn with_engine<T>(&self, f: impl FnOnce(&mut Engine) -> Result<T>) -> Result<T> {
        let (result, dispatches) = {
            let mut engine = self.inner.lock_engine();
            let result = f(&mut engine);
            (result, engine.take_dispatches())
        };
        for dispatch in dispatches {
            self.spawn_dispatch(dispatch);
        }
        result
    }

    fn spawn_dispatch(&self, dispatch: Dispatch) {
        let Dispatch {
            id,
            run_id,
            worker_name,
            worker,
            input,
            attempt,
            stop,
            span,
        } = dispatch;
        let results = self.inner.results_tx.clone();

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            let _ = results.send(Finished {
                id,
                run_id,
                completion: Completion::Fault("no async runtime to run the worker on".to_string()),
            });
            return;
        };

        let ctx = WorkContext {
            id,
            input,
            attempt,
            stop,
        };
        runtime.spawn(
            async move {
                let started = Instant::now();
                // Separate task so a panicking worker becomes a fault.
                let run = tokio::spawn(async move { worker.run(ctx).await }.in_current_span());
                let completion = match run.await {
                    Ok(result) => Completion::Reported(result),
                    Err(e) => {
                        error!("worker panicked: {e}");
                        Completion::Fault(format!("worker panicked: {e}"))
                    }
                };
                metrics::run_duration_ms().record(
                    started.elapsed().as_secs_f64() * 1000.0,
                    &[KeyValue::new("worker", worker_name)],
                );
                if results
                    .send(Finished {
                        id,
                        run_id,
                        completion,
                    })
                    .is_err()
                {
                    debug!("scheduler gone, result dropped");
                }
            }
            .instrument(span),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_stream::StreamExt;

    #[tokio::test]
    async fn observing_finished_work_yields_one_state() {
        let scheduler = Scheduler::builder(Storage::in_memory().unwrap())
            .build()
            .unwrap();
        let id = scheduler.enqueue(NewWork::new("noop")).unwrap();
        scheduler.cancel(id).unwrap();

        let states: Vec<State> = scheduler.observe_status(id).unwrap().collect().await;
        assert_eq!(states, vec![State::Cancelled]);
    }

    #[tokio::test]
    async fn observing_unknown_work_is_not_found() {
        let scheduler = Scheduler::builder(Storage::in_memory().unwrap())
            .build()
            .unwrap();
        assert!(matches!(
            scheduler.observe_status(WorkId::new()),
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn observer_sees_nothing_published_before_its_first_state() {
        let scheduler = Scheduler::builder(Storage::in_memory().unwrap())
            .build()
            .unwrap();
        let ids = scheduler
            .enqueue_chain(vec![NewWork::new("noop"), NewWork::new("noop")], &[(0, 1)])
            .unwrap();

        // Publish while an observer is waiting to read.
        let engine = scheduler.inner.lock_engine();
        let observer = {
            let scheduler = scheduler.clone();
            let id = ids[1];
            std::thread::spawn(move || scheduler.observe_status(id).unwrap())
        };
        std::thread::sleep(Duration::from_millis(50));
        let _ = scheduler.inner.status_tx.send(StatusChange {
            id: ids[1],
            state: State::Enqueued,
        });
        drop(engine);
        let states = observer.join().unwrap();

        scheduler.cancel(ids[0]).unwrap();
        let states: Vec<State> = states.collect().await;
        assert_eq!(states, vec![State::Blocked, State::Failed]);
    }

    #[tokio::test]
    async fn cancel_all_reaches_every_unfinished_record() {
        let scheduler = Scheduler::builder(Storage::in_memory().unwrap())
            .build()
            .unwrap();
        let chain = scheduler
            .enqueue_chain(vec![NewWork::new("noop"), NewWork::new("noop")], &[(0, 1)])
            .unwrap();
        let done = scheduler.enqueue(NewWork::new("noop")).unwrap();
        scheduler.cancel(done).unwrap();

        assert_eq!(scheduler.cancel_all().unwrap(), 2);
        assert_eq!(scheduler.status_of(chain[0]).unwrap(), State::Cancelled);
        assert_eq!(scheduler.status_of(chain[1]).unwrap(), State::Cancelled);
        assert_eq!(scheduler.cancel_all().unwrap(), 0);
    }

    #[tokio::test]
    async fn run_twice_concurrently_is_rejected() {
        let scheduler = Scheduler::builder(Storage::in_memory().unwrap())
            .build()
            .unwrap();
        let running = scheduler.clone();
        let handle = tokio::spawn(async move { running.run().await });
        tokio::task::yield_now().await;

        assert!(scheduler.run().await.is_err());
        scheduler.shutdown();
        handle.await.unwrap().unwrap();
    }
}
