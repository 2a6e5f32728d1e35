//! Core types shared across the engine
//!
//! These types describe the identifiers, lifecycle stages and the two
//! shared tables (store and status) that the orchestrator owns.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Unique identifier for a definition
pub type DefinitionId = String;

/// Identifier of the store slot a definition writes into
pub type StoreId = String;

/// Identifier of an external (or cascaded) subscriber
pub type SubscriberId = String;

/// Store content, keyed by store slot
///
/// An absent key is the "undefined" slot; `Value::Null` is a defined value.
pub type Store = HashMap<StoreId, serde_json::Value>;

/// Lifecycle stage per active definition
pub type StatusTable = HashMap<DefinitionId, Stage>;

/// Lifecycle stage of an active definition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Stage {
    /// Pending validity check
    #[default]
    Waiting,
    /// No fetcher; waiting for external store writes to satisfy availability
    WaitingInput,
    /// Fetch in flight
    Fetching,
    /// Data available
    Idle,
    /// Last fetch failed
    Error,
}

impl Stage {
    /// Whether a fetch may be (re)launched from this stage
    pub fn is_fetch_stage(&self) -> bool {
        matches!(self, Stage::Fetching | Stage::Error)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Waiting => "WAITING",
            Stage::WaitingInput => "WAITING_INPUT",
            Stage::Fetching => "FETCHING",
            Stage::Idle => "IDLE",
            Stage::Error => "ERROR",
        };
        f.write_str(name)
    }
}

/// A `(subscriber, definition)` pair
///
/// Several subscriptions may target the same definition; the definition
/// stays active while at least one remains.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subscription {
    pub subscriber_id: SubscriberId,
    pub definition_id: DefinitionId,
}

impl Subscription {
    pub fn new(subscriber_id: impl Into<String>, definition_id: impl Into<String>) -> Self {
        Self {
            subscriber_id: subscriber_id.into(),
            definition_id: definition_id.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_serializes_screaming_case() {
        let json = serde_json::to_value(Stage::WaitingInput).unwrap();
        assert_eq!(json, serde_json::json!("WAITING_INPUT"));

        let stage: Stage = serde_json::from_value(serde_json::json!("IDLE")).unwrap();
        assert_eq!(stage, Stage::Idle);
    }

    #[test]
    fn test_stage_defaults_to_waiting() {
        assert_eq!(Stage::default(), Stage::Waiting);
        assert_eq!(Stage::Waiting.to_string(), "WAITING");
    }

    #[test]
    fn test_fetch_stages() {
        assert!(Stage::Fetching.is_fetch_stage());
        assert!(Stage::Error.is_fetch_stage());
        assert!(!Stage::Idle.is_fetch_stage());
        assert!(!Stage::WaitingInput.is_fetch_stage());
    }
}
