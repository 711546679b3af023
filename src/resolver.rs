//! Dependency and uniqueness resolution.
//!
//! Resolution runs inside the engine's transaction so every unblock, cascade
//! and reservation change commits together with the mutation that caused it.
//! Only direct dependents of a changed record are examined; failures walk
//! further down the graph one level at a time.

use std::collections::{HashMap, HashSet};

use crate::error::{Error, Result};
use crate::event::EventKind;
use crate::model::{ExistingWorkPolicy, FailureReason, State, WorkId};
use crate::storage::TxContext;

// ---------------------------------------------------------------------------
// Graph validation
// ---------------------------------------------------------------------------

/// In-memory dependency graph used to validate a chain before it is stored.
/// Edges map each record to the records it waits for.
#[derive(Debug, Default)]
pub struct DependencyGraph {
    edges: HashMap<WorkId, HashSet<WorkId>>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Color {
    Gray,
    Black,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// `dependent` waits for `prerequisite`.
    pub fn add_dependency(&mut self, dependent: WorkId, prerequisite: WorkId) {
        self.edges.entry(dependent).or_default().insert(prerequisite);
    }

    pub fn dependencies(&self, id: WorkId) -> Vec<WorkId> {
        let mut deps: Vec<WorkId> = self
            .edges
            .get(&id)
            .map(|deps| deps.iter().copied().collect())
            .unwrap_or_default();
        deps.sort();
        deps
    }

    /// First cycle found, as the path of ids that closes it, or None for a DAG.
    pub fn detect_cycle(&self) -> Option<Vec<WorkId>> {
        let mut colors: HashMap<WorkId, Color> = HashMap::new();
        let mut path = Vec::new();

        let mut starts: Vec<WorkId> = self.edges.keys().copied().collect();
        starts.sort();
        for start in starts {
            if !colors.contains_key(&start) {
                if let Some(cycle) = self.visit(start, &mut colors, &mut path) {
                    return Some(cycle);
                }
            }
        }
        None
    }

    fn visit(
        &self,
        node: WorkId,
        colors: &mut HashMap<WorkId, Color>,
        path: &mut Vec<WorkId>,
    ) -> Option<Vec<WorkId>> {
        colors.insert(node, Color::Gray);
        path.push(node);

        for dep in self.dependencies(node) {
            match colors.get(&dep) {
                Some(Color::Gray) => {
                    let start = path.iter().position(|id| *id == dep).unwrap_or(0);
                    let mut cycle = path[start..].to_vec();
                    cycle.push(dep);
                    return Some(cycle);
                }
                Some(Color::Black) => {}
                None => {
                    if let Some(cycle) = self.visit(dep, colors, path) {
                        return Some(cycle);
                    }
                }
            }
        }

        colors.insert(node, Color::Black);
        path.pop();
        None
    }
}

// ---------------------------------------------------------------------------
// Prerequisite resolution
// ---------------------------------------------------------------------------

/// A state change made while resolving, reported to status observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Transition {
    pub id: WorkId,
    pub from: State,
    pub to: State,
}

/// Where a record stands with respect to its prerequisites.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Readiness {
    /// Every prerequisite succeeded (or there are none).
    Ready,
    /// At least one prerequisite is still pending.
    Waiting,
    /// A prerequisite failed or was cancelled.
    Doomed(WorkId),
}

pub(crate) fn readiness(tx: &TxContext, id: WorkId) -> Result<Readiness> {
    let mut waiting = false;
    for prerequisite in tx.prerequisites_of(id)? {
        match tx.get_state(prerequisite)? {
            State::Succeeded => {}
            State::Failed | State::Cancelled => return Ok(Readiness::Doomed(prerequisite)),
            _ => waiting = true,
        }
    }
    Ok(if waiting {
        Readiness::Waiting
    } else {
        Readiness::Ready
    })
}

/// Release a BLOCKED record whose prerequisites all succeeded.
pub(crate) fn unblock(tx: &TxContext, id: WorkId) -> Result<Transition> {
    let from = tx.update_state(id, State::Enqueued, 0)?;
    tx.record_event(EventKind::WorkUnblocked { id })?;
    Ok(Transition {
        id,
        from,
        to: State::Enqueued,
    })
}

/// Fail a BLOCKED record because `prerequisite` did not succeed.
pub(crate) fn fail_blocked(tx: &TxContext, id: WorkId, prerequisite: WorkId) -> Result<Transition> {
    let reason = FailureReason::PrerequisiteFailed { prerequisite };
    let from = tx.update_state(id, State::Failed, 0)?;
    tx.set_last_error(id, Some(&reason.to_string()))?;
    tx.record_event(EventKind::WorkFailed { id, reason })?;
    Ok(Transition {
        id,
        from,
        to: State::Failed,
    })
}

/// Recompute the direct dependents of `id`, which just reached `state`.
///
/// A success unblocks dependents whose prerequisites have all succeeded. A
/// failure or cancellation fails every blocked dependent and continues with
/// theirs.
pub(crate) fn resolve_dependents(tx: &TxContext, id: WorkId, state: State) -> Result<Vec<Transition>> {
    let mut changed = Vec::new();
    let mut pending = vec![(id, state)];

    while let Some((finished, state)) = pending.pop() {
        for dependent in tx.dependents_of(finished)? {
            if tx.get_state(dependent)? != State::Blocked {
                continue;
            }
            match state {
                State::Succeeded => {
                    if readiness(tx, dependent)? == Readiness::Ready {
                        changed.push(unblock(tx, dependent)?);
                    }
                }
                State::Failed | State::Cancelled => {
                    changed.push(fail_blocked(tx, dependent, finished)?);
                    pending.push((dependent, State::Failed));
                }
                _ => {}
            }
        }
    }

    Ok(changed)
}

// ---------------------------------------------------------------------------
// Uniqueness
// ---------------------------------------------------------------------------

/// Outcome of checking a unique name against its conflict policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum UniqueDecision {
    /// No conflict; admit as usual.
    Admit,
    /// KEEP: drop the submission, this record stays.
    Keep(WorkId),
    /// REPLACE: cancel these, then admit.
    Replace(Vec<WorkId>),
    /// APPEND: admit as a dependent of this record.
    Append(WorkId),
}

pub(crate) fn decide_unique(
    tx: &TxContext,
    name: &str,
    policy: ExistingWorkPolicy,
) -> Result<UniqueDecision> {
    let active = tx.active_by_unique_name(name)?;

    match policy {
        ExistingWorkPolicy::Keep => Ok(match active.first() {
            Some(existing) => UniqueDecision::Keep(existing.id),
            None => UniqueDecision::Admit,
        }),
        ExistingWorkPolicy::Replace => Ok(if active.is_empty() {
            UniqueDecision::Admit
        } else {
            UniqueDecision::Replace(active.iter().map(|r| r.id).collect())
        }),
        ExistingWorkPolicy::Append => match tx.unique_name_holder(name)? {
            None => Ok(UniqueDecision::Admit),
            Some(last) => {
                if tx.get_record(last)?.is_periodic() {
                    return Err(Error::Validation(format!(
                        "cannot append to periodic work held by name '{name}'"
                    )));
                }
                Ok(UniqueDecision::Append(last))
            }
        },
    }
}
