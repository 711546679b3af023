use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};

use super::timer::TimerTable;
use super::{Backend, BackendKind, FireSink};
use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::model::{WorkId, WorkRecord};

/// Self-managed wake timer backend. No capacity limit.
///
/// Armed timers live only as long as the process; after a restart the
/// host's `recover()` call re-arms whatever is still pending.
pub struct AlarmBackend {
    available: AtomicBool,
    timers: TimerTable,
}

impl AlarmBackend {
    pub fn new(sink: FireSink, clock: Arc<dyn Clock>) -> Self {
        Self {
            available: AtomicBool::new(true),
            timers: TimerTable::new(BackendKind::SelfManaged, sink, clock),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::Relaxed);
    }
}

impl Backend for AlarmBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::SelfManaged
    }

    fn is_available(&self) -> bool {
        self.available.load(Ordering::Relaxed)
    }

    fn has_capacity(&self) -> bool {
        true
    }

    fn schedule(&self, record: &WorkRecord, fire_at: DateTime<Utc>) -> Result<()> {
        if !self.is_available() {
            return Err(Error::BackendUnavailable(
                "alarm backend is not available on this host".to_string(),
            ));
        }
        self.timers.arm(record.id, fire_at)
    }

    fn cancel(&self, id: WorkId) {
        self.timers.disarm(id);
    }

    fn currently_armed_ids(&self) -> Vec<WorkId> {
        self.timers.ids()
    }
}
