//! Startup recovery.
//!
//! A record found RUNNING when the process starts was interrupted by the
//! previous incarnation. It is demoted to ENQUEUED with one more attempt
//! charged, exactly as if its worker had faulted. BLOCKED records are
//! settled against prerequisites that may have finished meanwhile, and ids
//! still armed in a backend are adopted instead of armed a second time.

use std::collections::HashSet;

use tracing::info;

use super::{Engine, RetryCause, RunOutcome, retry_or_fail};
use crate::error::Result;
use crate::model::{State, WorkId};
use crate::resolver::{self, Readiness};

/// What `recover()` did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Interrupted runs moved back to ENQUEUED.
    pub requeued: usize,
    /// Interrupted runs whose attempt budget was already spent.
    pub failed: usize,
    /// BLOCKED records released or failed by their prerequisites.
    pub settled: usize,
    /// Backend-armed ids kept as they are.
    pub adopted: usize,
    /// Backend-armed ids whose record no longer waits to run.
    pub disarmed: usize,
}

impl Engine {
    pub(crate) fn recover(&mut self) -> Result<RecoveryReport> {
        let mut running = Vec::new();
        let mut blocked = Vec::new();
        let mut scan_error = None;
        for record in self.storage.all_records() {
            match record {
                Ok(record) => match record.state {
                    // Runs owned by this process are not interrupted.
                    State::Running if !self.running.contains_key(&record.id) => {
                        running.push(record.id)
                    }
                    State::Blocked => blocked.push(record.id),
                    _ => {}
                },
                Err(e) => {
                    scan_error = Some(e);
                    break;
                }
            }
        }
        if let Some(e) = scan_error {
            return Err(self.storage_failed(e));
        }

        let config = &self.config;
        let result = self.storage.with_transaction(|tx| {
            let mut changed = Vec::new();
            let mut report = RecoveryReport::default();

            for id in &running {
                let record = tx.get_record(*id)?;
                if record.state != State::Running {
                    continue;
                }
                match retry_or_fail(tx, config, &record, RetryCause::Interrupted, &mut changed)? {
                    RunOutcome::Failed(_) => report.failed += 1,
                    _ => report.requeued += 1,
                }
            }

            for id in &blocked {
                if tx.get_state(*id)? != State::Blocked {
                    continue;
                }
                match resolver::readiness(tx, *id)? {
                    Readiness::Ready => {
                        changed.push(resolver::unblock(tx, *id)?);
                        report.settled += 1;
                    }
                    Readiness::Doomed(prerequisite) => {
                        changed.push(resolver::fail_blocked(tx, *id, prerequisite)?);
                        changed.extend(resolver::resolve_dependents(tx, *id, State::Failed)?);
                        report.settled += 1;
                    }
                    Readiness::Waiting => {}
                }
            }

            Ok((report, changed))
        });
        let (mut report, changed) = self.checked(result)?;
        self.apply(&changed);

        // Demoted records carry a new backoff deadline, so any timer left
        // over for them is stale.
        let demoted: HashSet<WorkId> = running.iter().copied().collect();
        let result = self.storage.query_by_state(State::Enqueued);
        let enqueued: HashSet<WorkId> = self.checked(result)?.into_iter().map(|r| r.id).collect();

        for (id, kind) in self.selector.currently_armed_ids() {
            if enqueued.contains(&id) && !demoted.contains(&id) {
                if self.armed.insert(id, kind).is_none() {
                    report.adopted += 1;
                }
            } else {
                self.selector.disarm(id);
                self.armed.remove(&id);
                report.disarmed += 1;
            }
        }

        self.schedule_pass()?;

        info!(
            requeued = report.requeued,
            failed = report.failed,
            settled = report.settled,
            adopted = report.adopted,
            disarmed = report.disarmed,
            "recovery complete"
        );
        Ok(report)
    }
}
