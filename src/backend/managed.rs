use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};

use super::timer::TimerTable;
use super::{Backend, BackendKind, FireSink};
use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::model::{WorkId, WorkRecord};

/// Capacity-limited backend: at most `capacity` records armed at once.
///
/// Admission is refused rather than queued when full; the selector then
/// routes the record elsewhere or leaves it for the next pass.
pub struct ManagedBackend {
    capacity: usize,
    available: AtomicBool,
    timers: TimerTable,
}

impl ManagedBackend {
    pub fn new(capacity: usize, sink: FireSink, clock: Arc<dyn Clock>) -> Self {
        Self {
            capacity,
            available: AtomicBool::new(true),
            timers: TimerTable::new(BackendKind::Managed, sink, clock),
        }
    }

    /// Flip host capability, e.g. when the platform service goes away.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::Relaxed);
    }
}

impl Backend for ManagedBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Managed
    }

    fn is_available(&self) -> bool {
        self.available.load(Ordering::Relaxed)
    }

    fn has_capacity(&self) -> bool {
        self.timers.len() < self.capacity
    }

    fn schedule(&self, record: &WorkRecord, fire_at: DateTime<Utc>) -> Result<()> {
        if !self.is_available() {
            return Err(Error::BackendUnavailable(
                "managed backend is not available on this host".to_string(),
            ));
        }
        if !self.timers.contains(record.id) && !self.has_capacity() {
            return Err(Error::BackendUnavailable(format!(
                "managed backend at capacity ({})",
                self.capacity
            )));
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
