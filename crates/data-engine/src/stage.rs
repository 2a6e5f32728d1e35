//! Stage state machine
//!
//! Pure planning functions: they read a status snapshot and return the
//! transitions they propose. Only the engine applies them.
//!
//! ```text
//!            invalid                deps IDLE + fetcher
//!   * ──────────────▶ WAITING ─────────────────────────▶ FETCHING ──▶ IDLE / ERROR
//!                        │                                  ▲            │
//!                        │ deps IDLE, no fetcher            └── key changed
//!                        ▼
//!                  WAITING_INPUT ──── available ────▶ IDLE
//! ```

use std::collections::HashSet;

use crate::definition::Definition;
use crate::resolver::dependency_ids;
use crate::types::{DefinitionId, Stage, StatusTable};

/// Why a transition was proposed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionReason {
    /// Found invalid by the resolver
    Invalidated,
    /// All transitive dependencies are `IDLE`
    DependenciesReady,
    /// Availability predicate became true
    DataAvailable,
    /// A fetch is being (re)launched
    FetchLaunched,
    /// A fetch result was accepted
    FetchSucceeded,
    /// A fetch failed
    FetchFailed,
}

/// A proposed stage change
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub definition_id: DefinitionId,
    pub from: Option<Stage>,
    pub to: Stage,
    pub reason: TransitionReason,
}

impl Transition {
    pub fn new(
        definition_id: impl Into<String>,
        from: Option<Stage>,
        to: Stage,
        reason: TransitionReason,
    ) -> Self {
        Self {
            definition_id: definition_id.into(),
            from,
            to,
            reason,
        }
    }
}

/// Apply transitions to a status table, skipping no-op moves
///
/// Returns the transitions that actually changed something.
pub fn apply(status: &mut StatusTable, transitions: Vec<Transition>) -> Vec<Transition> {
    let mut applied = Vec::with_capacity(transitions.len());
    for transition in transitions {
        let previous = status.insert(transition.definition_id.clone(), transition.to);
        if previous != Some(transition.to) {
            log::debug!(
                "Stage '{}': {} -> {} ({:?})",
                transition.definition_id,
                previous.map(|s| s.to_string()).unwrap_or_else(|| "-".to_string()),
                transition.to,
                transition.reason
            );
            applied.push(Transition {
                from: previous,
                ..transition
            });
        }
    }
    applied
}

/// Outcome of the readiness phase
#[derive(Debug, Clone, Default)]
pub struct ReadinessPlan {
    pub transitions: Vec<Transition>,
    /// Definitions that moved into `FETCHING` in this plan
    pub entered_fetching: HashSet<DefinitionId>,
}

/// Re-arm invalid definitions and advance `WAITING` ones whose dependencies are ready
///
/// Invalid definitions are forced to `WAITING`. Then every `WAITING`
/// definition whose transitive dependencies are all `IDLE` moves to
/// `FETCHING` when it has a fetcher, otherwise to `WAITING_INPUT`.
pub fn plan_readiness(
    active: &[Definition],
    invalid: &[Definition],
    status: &StatusTable,
) -> ReadinessPlan {
    let mut next = status.clone();
    let mut plan = ReadinessPlan::default();

    for definition in invalid {
        let current = next.get(definition.id()).copied();
        if current != Some(Stage::Waiting) {
            next.insert(definition.id().to_string(), Stage::Waiting);
            plan.transitions.push(Transition::new(
                definition.id(),
                current,
                Stage::Waiting,
                TransitionReason::Invalidated,
            ));
        }
    }

    for definition in active {
        if next.get(definition.id()) != Some(&Stage::Waiting) {
            continue;
        }
        let ready = dependency_ids(definition)
            .iter()
            .all(|id| next.get(id) == Some(&Stage::Idle));
        if !ready {
            continue;
        }

        let target = if definition.has_fetcher() {
            plan.entered_fetching.insert(definition.id().to_string());
            Stage::Fetching
        } else {
            Stage::WaitingInput
        };
        next.insert(definition.id().to_string(), target);
        plan.transitions.push(Transition::new(
            definition.id(),
            Some(Stage::Waiting),
            target,
            TransitionReason::DependenciesReady,
        ));
    }

    plan
}
