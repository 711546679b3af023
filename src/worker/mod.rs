//! Execution contract between the scheduler and the code that runs work.
//!
//! A worker receives the record id, its input and a [`StopSignal`], and
//! reports a [`WorkResult`]. Stopping is cooperative: the scheduler raises
//! the signal on cancellation or timeout and never aborts the task itself.

mod command;

pub use command::CommandWorker;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;

use crate::model::{WorkId, WorkResult};

#[async_trait]
pub trait Worker: Send + Sync {
    async fn run(&self, ctx: WorkContext) -> WorkResult;
}

/// Everything a worker gets for one run.
#[derive(Debug, Clone)]
pub struct WorkContext {
    pub id: WorkId,
    pub input: serde_json::Value,
    /// 1-based attempt number of this run.
    pub attempt: u32,
    pub stop: StopSignal,
}

/// Cooperative stop flag observed by a running worker.
#[derive(Debug, Clone)]
pub struct StopSignal {
    rx: watch::Receiver<bool>,
}

/// Scheduler-side half of a [`StopSignal`].
#[derive(Debug)]
pub(crate) struct StopHandle {
    tx: watch::Sender<bool>,
}

impl StopHandle {
    pub fn stop(&self) {
        self.tx.send_replace(true);
    }
}

impl StopSignal {
    pub(crate) fn pair() -> (StopHandle, StopSignal) {
        let (tx, rx) = watch::channel(false);
        (StopHandle { tx }, StopSignal { rx })
    }

    /// A signal that is never raised.
    pub fn never() -> Self {
        let (_, signal) = Self::pair();
        signal
    }

    pub fn is_stopped(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once stop has been requested. Pends forever if the run
    /// finished without one.
    pub async fn stopped(&mut self) {
        loop {
            if *self.rx.borrow_and_update() {
                return;
            }
            if self.rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Registry of workers, indexed by the name records refer to.
#[derive(Clone, Default)]
pub struct WorkerRegistry {
    workers: HashMap<String, Arc<dyn Worker>>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, worker: Arc<dyn Worker>) {
        self.workers.insert(name.into(), worker);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Worker>> {
        self.workers.get(name).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    #[async_trait]
    impl Worker for Echo {
        async fn run(&self, ctx: WorkContext) -> WorkResult {
            WorkResult::success_with(ctx.input)
        }
    }

    #[tokio::test]
    async fn stop_signal_wakes_waiters() {
        let (handle, mut signal) = StopSignal::pair();
        assert!(!signal.is_stopped());

        let waiter = tokio::spawn(async move {
            signal.stopped().await;
            signal.is_stopped()
        });
        handle.stop();
        assert!(waiter.await.unwrap());
    }

    #[test]
    fn never_signal_stays_clear() {
        assert!(!StopSignal::never().is_stopped());
    }

    #[tokio::test]
    async fn registry_routes_by_name() {
        let mut registry = WorkerRegistry::new();
        registry.register("echo", Arc::new(Echo));
        assert!(registry.get("missing").is_none());

        let worker = registry.get("echo").unwrap();
        let result = worker
            .run(WorkContext {
                id: WorkId::new(),
                input: serde_json::json!({"k": "v"}),
                attempt: 1,
                stop: StopSignal::never(),
            })
            .await;
        assert_eq!(result, WorkResult::success_with(serde_json::json!({"k": "v"})));
    }
}
