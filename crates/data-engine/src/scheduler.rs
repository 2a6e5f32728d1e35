//! Fetch scheduling and outcome reconciliation
//!
//! Decides which definitions need a fetch invocation and whether a settled
//! fetch may still be applied.
//!
//! Every launch gets a fresh epoch from an engine-wide counter, recorded
//! together with the fetcher key computed at launch. A settled fetch is
//! applied only when its epoch is still the definition's current one, so
//! superseded fetches are left running and their results dropped.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde_json::Value;

use crate::definition::Definition;
use crate::params::{build_parameters, ParameterCache, Parameters};
use crate::stage::{Transition, TransitionReason};
use crate::types::{DefinitionId, Stage, StatusTable, Store};

/// Bookkeeping for the latest fetch launched for a definition
#[derive(Debug, Clone, PartialEq)]
pub struct FetchRecord {
    /// Epoch of the latest launch
    pub epoch: u64,
    /// Fetcher key at the latest launch
    pub key: Option<Value>,
    /// Whether the latest launch already produced its outcome
    pub settled: bool,
}

/// A fetch the runtime should invoke
#[derive(Clone)]
pub struct FetchRequest {
    pub definition: Definition,
    pub epoch: u64,
    pub parameters: Arc<Parameters>,
}

impl std::fmt::Debug for FetchRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchRequest")
            .field("definition", &self.definition.id())
            .field("epoch", &self.epoch)
            .finish()
    }
}

/// A launch decided by the scheduler, before an epoch is assigned
#[derive(Debug, Clone)]
pub struct PlannedLaunch {
    pub definition: Definition,
    pub key: Option<Value>,
    pub parameters: Arc<Parameters>,
}

/// Outcome of the scheduling phase
#[derive(Debug, Clone, Default)]
pub struct FetchPlan {
    pub transitions: Vec<Transition>,
    pub launches: Vec<PlannedLaunch>,
}

impl FetchPlan {
    pub fn is_empty(&self) -> bool {
        self.transitions.is_empty() && self.launches.is_empty()
    }
}

/// Plan availability promotions and fetch launches
///
/// - `WAITING_INPUT` definitions become `IDLE` once available.
/// - `FETCHING` and `ERROR` definitions whose data became available go
///   straight to `IDLE`, pre-empting the pending outcome.
/// - Otherwise a `FETCHING` definition that just entered that stage is
///   launched, as is a `FETCHING` or `ERROR` definition whose fetcher key
///   differs from the key recorded at its latest launch.
pub fn plan_fetches(
    active: &[Definition],
    store: &Store,
    status: &StatusTable,
    entered_fetching: &HashSet<DefinitionId>,
    records: &HashMap<DefinitionId, FetchRecord>,
    cache: &mut ParameterCache,
) -> FetchPlan {
    let mut plan = FetchPlan::default();

    for definition in active {
        let Some(&stage) = status.get(definition.id()) else {
            continue;
        };

        match stage {
            Stage::WaitingInput => {
                let params = build_parameters(definition, store, status, Some(&mut *cache));
                if definition.is_data_available(&params) {
                    plan.transitions.push(Transition::new(
                        definition.id(),
                        Some(stage),
                        Stage::Idle,
                        TransitionReason::DataAvailable,
                    ));
                }
            }
            stage if stage.is_fetch_stage() => {
                if !definition.has_fetcher() {
                    continue;
                }
                let params = build_parameters(definition, store, status, Some(&mut *cache));
                if definition.is_data_available(&params) {
                    plan.transitions.push(Transition::new(
                        definition.id(),
                        Some(stage),
                        Stage::Idle,
                        TransitionReason::DataAvailable,
                    ));
                    continue;
                }

                let just_entered = stage == Stage::Fetching && entered_fetching.contains(definition.id());
                let key = definition.fetcher_key(&params);
                let key_changed = definition.has_fetcher_key()
                    && records.get(definition.id()).map(|r| &r.key) != Some(&key);

                if !just_entered && !key_changed {
                    continue;
                }

                if stage == Stage::Error {
                    plan.transitions.push(Transition::new(
                        definition.id(),
                        Some(stage),
                        Stage::Fetching,
                        TransitionReason::FetchLaunched,
                    ));
                }
                plan.launches.push(PlannedLaunch {
                    definition: definition.clone(),
                    key,
                    parameters: params,
                });
            }
            _ => {}
        }
    }

    plan
}

/// Why a settled fetch was not applied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscardReason {
    /// Definition is no longer `FETCHING` (or no longer active)
    StageChanged,
    /// A newer fetch superseded this one
    Superseded,
}

/// What to do with a settled fetch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    /// Store the payload and move to `IDLE`
    Accept,
    /// Move to `ERROR`; `current` tells whether it was the latest attempt
    Fail { current: bool },
    /// Failure is reported but the stage is left alone
    ReportOnly,
    /// Drop the result silently
    Discard(DiscardReason),
}

/// Decide how a settled fetch reconciles with the current state
///
/// Successes are accepted only for the latest, unsettled attempt while the
/// definition is still `FETCHING`; in any other stage they are discarded.
/// Failures always set `ERROR` while the definition is `FETCHING`, even when
/// superseded, and are reported without a stage change otherwise.
pub fn reconcile(
    stage: Option<Stage>,
    record: Option<&FetchRecord>,
    epoch: u64,
    succeeded: bool,
) -> Settlement {
    let current = record.map_or(false, |r| r.epoch == epoch && !r.settled);

    if succeeded {
        return match stage {
            Some(Stage::Fetching) if current => Settlement::Accept,
            Some(Stage::Fetching) => Settlement::Discard(DiscardReason::Superseded),
            _ => Settlement::Discard(DiscardReason::StageChanged),
        };
    }

    match stage {
        Some(Stage::Fetching) => Settlement::Fail { current },
        _ => Settlement::ReportOnly,
    }
}
