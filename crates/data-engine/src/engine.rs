//! Engine state and the settle loop
//!
//! `EngineState` exclusively owns the store, the status table, the
//! subscriptions and the fetch records. Each of its commands mutates that
//! state once and then runs the settle loop: resolution and scheduling
//! passes repeat until a pass proposes no change. What is left to do
//! asynchronously is returned as `FetchRequest`s; their outcomes come back
//! through `settle_fetch`.
//!
//! # Key Concepts
//!
//! - **Single writer**: nothing outside this type writes store or status
//! - **Proposed deltas**: resolver, stage machine and scheduler only read a
//!   snapshot and return transitions, applied here
//! - **Epochs**: every launch gets a fresh epoch; a settled fetch is applied
//!   only if its epoch is still current

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::{EngineConfig, RetentionPolicy};
use crate::definition::Definition;
use crate::error::{EngineError, Result};
use crate::events::{EngineEvent, EventSink};
use crate::params::{build_parameters, resolve, ParameterCache, ResolvedTree};
use crate::registry::DefinitionRegistry;
use crate::resolver::{active_definitions, invalid_definitions};
use crate::scheduler::{
    plan_fetches, reconcile, DiscardReason, FetchRecord, FetchRequest, PlannedLaunch, Settlement,
};
use crate::stage::{self, plan_readiness, Transition, TransitionReason};
use crate::subscriptions::SubscriptionManager;
use crate::types::{DefinitionId, Stage, StatusTable, Store, Subscription};

/// Read-only view of store and status
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub store: Store,
    pub status: StatusTable,
}

impl Snapshot {
    /// Resolve named definitions the way consumers see them
    pub fn resolve(&self, definitions: &[(String, Definition)]) -> ResolvedTree {
        resolve(definitions, &self.store, &self.status)
    }

    /// Current stage of a definition, `None` when inactive
    pub fn stage(&self, definition: &Definition) -> Option<Stage> {
        self.status.get(definition.id()).copied()
    }

    /// Raw store slot of a definition
    pub fn value(&self, definition: &Definition) -> Option<&Value> {
        self.store.get(definition.store_id())
    }
}

/// Synchronous engine core
pub struct EngineState {
    engine_id: String,
    config: EngineConfig,
    registry: DefinitionRegistry,
    subscriptions: SubscriptionManager,
    store: Store,
    status: StatusTable,
    records: HashMap<DefinitionId, FetchRecord>,
    /// Global epoch counter (never reused)
    epoch: u64,
    event_sink: Arc<dyn EventSink>,
}

impl EngineState {
    pub fn new(config: EngineConfig, event_sink: Arc<dyn EventSink>) -> Self {
        let engine_id = config.resolve_engine_id();
        Self {
            engine_id,
            config,
            registry: DefinitionRegistry::new(),
            subscriptions: SubscriptionManager::new(),
            store: Store::new(),
            status: StatusTable::new(),
            records: HashMap::new(),
            epoch: 0,
            event_sink,
        }
    }

    /// Subscribe to a definition
    ///
    /// The dependency closure is validated and registered first; a cyclic
    /// graph is rejected without touching any state.
    pub fn subscribe(&mut self, subscriber_id: &str, definition: &Definition) -> Result<Vec<FetchRequest>> {
        self.registry.register(definition)?;
        let first_activation = self.subscriptions.subscribe(subscriber_id, definition);
        log::debug!(
            "[{}] '{}' subscribed to '{}' (first activation: {})",
            self.engine_id,
            subscriber_id,
            definition.id(),
            first_activation
        );
        self.emit(EngineEvent::Subscribed {
            engine_id: self.engine_id.clone(),
            subscriber_id: subscriber_id.to_string(),
            definition_id: definition.id().to_string(),
            first_activation,
        });
        self.settle()
    }

    /// Remove a subscription, releasing dependencies nobody else needs
    pub fn unsubscribe(&mut self, subscriber_id: &str, definition: &Definition) -> Result<Vec<FetchRequest>> {
        let released = self.subscriptions.unsubscribe(subscriber_id, definition);
        log::debug!(
            "[{}] '{}' unsubscribed from '{}' (released: {:?})",
            self.engine_id,
            subscriber_id,
            definition.id(),
            released
        );
        self.emit(EngineEvent::Unsubscribed {
            engine_id: self.engine_id.clone(),
            subscriber_id: subscriber_id.to_string(),
            definition_id: definition.id().to_string(),
            released,
        });
        self.settle()
    }

    /// Write a value into a definition's store slot
    pub fn set_store(&mut self, value: Value, definition: &Definition) -> Result<Vec<FetchRequest>> {
        self.store.insert(definition.store_id().to_string(), value);
        self.emit(EngineEvent::StoreWritten {
            engine_id: self.engine_id.clone(),
            store_id: definition.store_id().to_string(),
        });
        self.settle()
    }

    /// Remove a definition's store slot
    pub fn evict(&mut self, definition: &Definition) -> Result<Vec<FetchRequest>> {
        if self.store.remove(definition.store_id()).is_some() {
            self.emit(EngineEvent::StoreEvicted {
                engine_id: self.engine_id.clone(),
                store_id: definition.store_id().to_string(),
            });
        }
        self.settle()
    }

    /// Reconcile a settled fetch with the current state
    ///
    /// Failures never surface as `Err` here: they are recorded as `ERROR`
    /// where applicable and always reported through the event sink.
    pub fn settle_fetch(
        &mut self,
        definition_id: &str,
        epoch: u64,
        outcome: Result<Value>,
    ) -> Result<Vec<FetchRequest>> {
        let stage = self.status.get(definition_id).copied();
        let settlement = reconcile(stage, self.records.get(definition_id), epoch, outcome.is_ok());

        match outcome {
            Ok(payload) => match settlement {
                Settlement::Accept => self.accept(definition_id, epoch, payload)?,
                Settlement::Discard(reason) => self.discard(definition_id, epoch, reason),
                Settlement::Fail { .. } | Settlement::ReportOnly => {
                    self.discard(definition_id, epoch, DiscardReason::StageChanged)
                }
            },
            Err(err) => {
                let err = err.for_definition(definition_id);
                log::error!("[{}] {} (epoch {})", self.engine_id, err, epoch);
                if let Settlement::Fail { current } = settlement {
                    if current {
                        if let Some(record) = self.records.get_mut(definition_id) {
                            record.settled = true;
                        }
                    }
                    self.apply_transitions(vec![Transition::new(
                        definition_id,
                        stage,
                        Stage::Error,
                        TransitionReason::FetchFailed,
                    )]);
                }
                self.emit(EngineEvent::FetchFailed {
                    engine_id: self.engine_id.clone(),
                    definition_id: definition_id.to_string(),
                    epoch,
                    error: err.to_string(),
                });
            }
        }

        self.settle()
    }

    /// Run a settle loop without any mutation
    ///
    /// On an unchanged state this returns no requests and changes nothing.
    pub fn refresh(&mut self) -> Result<Vec<FetchRequest>> {
        self.settle()
    }

    pub fn engine_id(&self) -> &str {
        &self.engine_id
    }

    pub fn stage(&self, definition_id: &str) -> Option<Stage> {
        self.status.get(definition_id).copied()
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn status(&self) -> &StatusTable {
        &self.status
    }

    pub fn subscriptions(&self) -> &[Subscription] {
        self.subscriptions.entries()
    }

    pub fn registry(&self) -> &DefinitionRegistry {
        &self.registry
    }

    /// Currently active definitions in first-subscription order
    pub fn active_definitions(&self) -> Vec<Definition> {
        active_definitions(self.subscriptions.entries(), &self.registry)
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            store: self.store.clone(),
            status: self.status.clone(),
        }
    }

    /// Iterate resolution and scheduling until nothing changes
    fn settle(&mut self) -> Result<Vec<FetchRequest>> {
        let mut requests = Vec::new();

        for pass in 0..self.config.max_settle_passes {
            let mut changed = self.sync_activation();
            let active = self.active_definitions();

            let mut cache = ParameterCache::new();
            let invalid = invalid_definitions(&active, &self.store, &self.status, &mut cache)?;
            let readiness = plan_readiness(&active, &invalid, &self.status);
            changed |= self.apply_transitions(readiness.transitions);

            // Status changed, so parameters from the first phase are stale
            let mut cache = ParameterCache::new();
            let plan = plan_fetches(
                &active,
                &self.store,
                &self.status,
                &readiness.entered_fetching,
                &self.records,
                &mut cache,
            );
            changed |= self.apply_transitions(plan.transitions);
            for launch in plan.launches {
                requests.push(self.launch(launch));
                changed = true;
            }

            if !changed {
                log::trace!("[{}] settled after {} passes", self.engine_id, pass + 1);
                return Ok(self.finalize(requests));
            }
        }

        log::error!(
            "[{}] did not settle within {} passes",
            self.engine_id,
            self.config.max_settle_passes
        );
        self.abandon(requests);
        Err(EngineError::NotQuiescent {
            passes: self.config.max_settle_passes,
        })
    }

    /// Roll back launches that will never be handed to the runtime
    ///
    /// Their records are dropped and their stage returns to `WAITING`, so no
    /// definition reports a fetch in flight that nobody runs.
    fn abandon(&mut self, requests: Vec<FetchRequest>) {
        let mut rollback = Vec::new();
        for request in &requests {
            let id = request.definition.id();
            if self.records.get(id).map(|r| r.epoch) != Some(request.epoch) {
                continue;
            }
            self.records.remove(id);
            if self.status.get(id) == Some(&Stage::Fetching) {
                rollback.push(Transition::new(
                    id,
                    Some(Stage::Fetching),
                    Stage::Waiting,
                    TransitionReason::Invalidated,
                ));
            }
            log::warn!("[{}] abandoned fetch of '{}' (epoch {})", self.engine_id, id, request.epoch);
        }
        self.apply_transitions(rollback);
    }

    /// Create status entries for newly active definitions and drop inactive ones
    fn sync_activation(&mut self) -> bool {
        let mut changed = false;
        let active_ids: Vec<DefinitionId> = self
            .active_definitions()
            .into_iter()
            .map(|d| d.id().to_string())
            .collect();

        let newly_active: Vec<Transition> = active_ids
            .iter()
            .filter(|id| !self.status.contains_key(id.as_str()))
            .map(|id| Transition::new(id.as_str(), None, Stage::Waiting, TransitionReason::Invalidated))
            .collect();
        changed |= self.apply_transitions(newly_active);

        let active_set: HashSet<&str> = active_ids.iter().map(|id| id.as_str()).collect();
        let inactive: Vec<DefinitionId> = self
            .status
            .keys()
            .filter(|id| !active_set.contains(id.as_str()))
            .cloned()
            .collect();

        for id in inactive {
            let previous = self.status.remove(&id);
            self.records.remove(&id);
            changed = true;
            log::debug!("[{}] '{}' deactivated", self.engine_id, id);
            self.emit(EngineEvent::StageChanged {
                engine_id: self.engine_id.clone(),
                definition_id: id.clone(),
                from: previous,
                to: None,
            });

            if self.config.retention == RetentionPolicy::Purge {
                self.purge_slot(&id, &active_set);
            }
        }

        changed
    }

    /// Drop a deactivated definition's slot unless an active definition shares it
    fn purge_slot(&mut self, definition_id: &str, active: &HashSet<&str>) {
        let Some(store_id) = self
            .registry
            .get(definition_id)
            .map(|d| d.store_id().to_string())
        else {
            return;
        };
        let shared = active.iter().any(|id| {
            self.registry
                .get(id)
                .map_or(false, |d| d.store_id() == store_id)
        });
        if !shared && self.store.remove(&store_id).is_some() {
            self.emit(EngineEvent::StoreEvicted {
                engine_id: self.engine_id.clone(),
                store_id,
            });
        }
    }

    fn apply_transitions(&mut self, transitions: Vec<Transition>) -> bool {
        let applied = stage::apply(&mut self.status, transitions);
        for transition in &applied {
            self.emit(EngineEvent::StageChanged {
                engine_id: self.engine_id.clone(),
                definition_id: transition.definition_id.clone(),
                from: transition.from,
                to: Some(transition.to),
            });
        }
        !applied.is_empty()
    }

    fn launch(&mut self, launch: PlannedLaunch) -> FetchRequest {
        self.epoch += 1;
        self.records.insert(
            launch.definition.id().to_string(),
            FetchRecord {
                epoch: self.epoch,
                key: launch.key,
                settled: false,
            },
        );
        FetchRequest {
            definition: launch.definition,
            epoch: self.epoch,
            parameters: launch.parameters,
        }
    }

    /// Keep only requests that are still current after the loop settled
    fn finalize(&self, requests: Vec<FetchRequest>) -> Vec<FetchRequest> {
        let current: Vec<FetchRequest> = requests
            .into_iter()
            .filter(|request| {
                let id = request.definition.id();
                self.status.get(id) == Some(&Stage::Fetching)
                    && self.records.get(id).map(|r| r.epoch) == Some(request.epoch)
            })
            .collect();

        for request in &current {
            log::debug!(
                "[{}] fetching '{}' (epoch {})",
                self.engine_id,
                request.definition.id(),
                request.epoch
            );
            self.emit(EngineEvent::FetchStarted {
                engine_id: self.engine_id.clone(),
                definition_id: request.definition.id().to_string(),
                epoch: request.epoch,
            });
        }
        current
    }

    fn accept(&mut self, definition_id: &str, epoch: u64, payload: Value) -> Result<()> {
        let definition = self
            .registry
            .get(definition_id)
            .cloned()
            .ok_or_else(|| EngineError::UnknownDefinition(definition_id.to_string()))?;

        let params = build_parameters(&definition, &self.store, &self.status, None);
        let value = definition.map_fetcher_response(payload, &params);
        self.store.insert(definition.store_id().to_string(), value);
        if let Some(record) = self.records.get_mut(definition_id) {
            record.settled = true;
        }

        self.apply_transitions(vec![Transition::new(
            definition_id,
            self.status.get(definition_id).copied(),
            Stage::Idle,
            TransitionReason::FetchSucceeded,
        )]);
        self.emit(EngineEvent::FetchSucceeded {
            engine_id: self.engine_id.clone(),
            definition_id: definition_id.to_string(),
            epoch,
        });
        Ok(())
    }

    fn discard(&self, definition_id: &str, epoch: u64, reason: DiscardReason) {
        log::debug!(
            "[{}] discarded result for '{}' (epoch {}, {:?})",
            self.engine_id,
            definition_id,
            epoch,
            reason
        );
        self.emit(EngineEvent::StaleResultDiscarded {
            engine_id: self.engine_id.clone(),
            definition_id: definition_id.to_string(),
            epoch,
        });
    }

    fn emit(&self, event: EngineEvent) {
        let _ = self.event_sink.send(event);
    }
}
