//! In-process timer table shared by the bundled backends.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;

use super::{BackendKind, FireSink};
use crate::clock::{Clock, until};
use crate::error::{Error, Result};
use crate::model::WorkId;

struct Armed {
    generation: u64,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct Table {
    armed: HashMap<WorkId, Armed>,
    next_generation: u64,
}

/// One sleeping task per armed id. A fired timer removes its own entry
/// before reporting, unless it was replaced in the meantime.
pub(super) struct TimerTable {
    kind: BackendKind,
    table: Arc<Mutex<Table>>,
    sink: FireSink,
    clock: Arc<dyn Clock>,
}

impl TimerTable {
    pub fn new(kind: BackendKind, sink: FireSink, clock: Arc<dyn Clock>) -> Self {
        Self {
            kind,
            table: Arc::new(Mutex::new(Table::default())),
            sink,
            clock,
        }
    }

    pub fn arm(&self, id: WorkId, fire_at: DateTime<Utc>) -> Result<()> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| Error::BackendUnavailable("no async runtime to arm timers on".into()))?;
        let delay = until(self.clock.now(), fire_at);

        let mut table = lock(&self.table);
        table.next_generation += 1;
        let generation = table.next_generation;

        let shared = Arc::clone(&self.table);
        let sink = self.sink.clone();
        let kind = self.kind;
        let handle = runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            {
                let mut table = lock(&shared);
                match table.armed.get(&id) {
                    Some(armed) if armed.generation == generation => {
                        table.armed.remove(&id);
                    }
                    _ => return,
                }
            }
            sink.fire(id, kind);
        });

        if let Some(previous) = table.armed.insert(id, Armed { generation, handle }) {
            previous.handle.abort();
        }
        Ok(())
    }

    pub fn disarm(&self, id: WorkId) {
        if let Some(armed) = lock(&self.table).armed.remove(&id) {
            armed.handle.abort();
        }
    }

    pub fn contains(&self, id: WorkId) -> bool {
        lock(&self.table).armed.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        lock(&self.table).armed.len()
    }

    pub fn ids(&self) -> Vec<WorkId> {
        let mut ids: Vec<WorkId> = lock(&self.table).armed.keys().copied().collect();
        ids.sort();
        ids
    }
}

impl Drop for TimerTable {
    fn drop(&mut self) {
        for (_, armed) in lock(&self.table).armed.drain() {
            armed.handle.abort();
        }
    }
}

fn lock(table: &Mutex<Table>) -> std::sync::MutexGuard<'_, Table> {
    table.lock().unwrap_or_else(|e| e.into_inner())
}
