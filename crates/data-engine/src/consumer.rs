//! Consumer binding
//!
//! A `Consumer` is one subscriber with a fixed set of named definitions it
//! reads and named definitions it may write. Mounting subscribes all of
//! them, unmounting releases them, and `read` renders the current snapshot
//! into the resolved view the consumer works with.

use std::collections::HashMap;

use futures_util::future::try_join_all;

use crate::definition::Definition;
use crate::engine::Snapshot;
use crate::error::Result;
use crate::orchestrator::{OrchestratorHandle, StoreSetter};
use crate::params::ResolvedTree;
use crate::types::{Stage, SubscriberId};

#[derive(Debug, Clone)]
pub struct Consumer {
    subscriber_id: SubscriberId,
    definitions: Vec<(String, Definition)>,
    setters: Vec<(String, Definition)>,
}

impl Consumer {
    pub fn new(subscriber_id: impl Into<String>) -> Self {
        Self {
            subscriber_id: subscriber_id.into(),
            definitions: Vec::new(),
            setters: Vec::new(),
        }
    }

    /// Consumer with a generated subscriber id
    pub fn anonymous() -> Self {
        Self::new(format!("consumer-{}", uuid::Uuid::new_v4()))
    }

    /// Read a definition under `name` (dotted names nest)
    pub fn with(mut self, name: impl Into<String>, definition: &Definition) -> Self {
        self.definitions.push((name.into(), definition.clone()));
        self
    }

    /// Expose a setter for a definition's store slot under `name`
    pub fn with_setter(mut self, name: impl Into<String>, definition: &Definition) -> Self {
        self.setters.push((name.into(), definition.clone()));
        self
    }

    pub fn subscriber_id(&self) -> &str {
        &self.subscriber_id
    }

    pub fn definitions(&self) -> &[(String, Definition)] {
        &self.definitions
    }

    /// Subscribe to every read definition, in declaration order
    pub async fn mount(&self, handle: &OrchestratorHandle) -> Result<()> {
        try_join_all(
            self.definitions
                .iter()
                .map(|(_, definition)| handle.subscribe(self.subscriber_id.clone(), definition)),
        )
        .await?;
        Ok(())
    }

    pub async fn unmount(&self, handle: &OrchestratorHandle) -> Result<()> {
        try_join_all(
            self.definitions
                .iter()
                .map(|(_, definition)| handle.unsubscribe(self.subscriber_id.clone(), definition)),
        )
        .await?;
        Ok(())
    }

    /// Resolved view of the read definitions
    pub fn read(&self, snapshot: &Snapshot) -> ResolvedTree {
        snapshot.resolve(&self.definitions)
    }

    /// Whether every read definition is `IDLE`
    pub fn is_ready(&self, snapshot: &Snapshot) -> bool {
        self.definitions
            .iter()
            .all(|(_, definition)| snapshot.stage(definition) == Some(Stage::Idle))
    }

    /// Setters keyed by their declared names
    pub fn setters(&self, handle: &OrchestratorHandle) -> HashMap<String, StoreSetter> {
        self.setters
            .iter()
            .map(|(name, definition)| (name.clone(), handle.setter(definition)))
            .collect()
    }
}
