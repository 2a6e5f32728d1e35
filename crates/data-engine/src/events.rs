//! Event types for observing the engine
//!
//! Events are sent from the engine to any consumer (a UI binding, a log
//! shipper, a test) to report stage changes, fetch activity and failures.
//! Fetch failures are always delivered here; the engine never swallows them.

use serde::{Deserialize, Serialize};

use crate::types::Stage;

/// Trait for sending engine events
///
/// This abstracts over the transport mechanism (channel, callback, etc.)
/// so the engine can be embedded in different hosts.
pub trait EventSink: Send + Sync {
    /// Send an event
    ///
    /// Returns an error if the event could not be sent (e.g., channel closed)
    fn send(&self, event: EngineEvent) -> Result<(), EventError>;
}

/// Error when sending events fails
#[derive(Debug, Clone)]
pub struct EventError {
    pub message: String,
}

impl std::fmt::Display for EventError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Event error: {}", self.message)
    }
}

impl std::error::Error for EventError {}

impl EventError {
    pub fn channel_closed() -> Self {
        Self {
            message: "Channel closed".to_string(),
        }
    }
}

/// Events emitted by the engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum EngineEvent {
    /// A subscription was added
    #[serde(rename_all = "camelCase")]
    Subscribed {
        engine_id: String,
        subscriber_id: String,
        definition_id: String,
        first_activation: bool,
    },

    /// A subscription was removed
    #[serde(rename_all = "camelCase")]
    Unsubscribed {
        engine_id: String,
        subscriber_id: String,
        definition_id: String,
        released: Vec<String>,
    },

    /// A definition moved between stages
    ///
    /// `from` is `None` for a newly activated definition, `to` is `None`
    /// when the definition was deactivated.
    #[serde(rename_all = "camelCase")]
    StageChanged {
        engine_id: String,
        definition_id: String,
        from: Option<Stage>,
        to: Option<Stage>,
    },

    /// A fetch was launched
    #[serde(rename_all = "camelCase")]
    FetchStarted {
        engine_id: String,
        definition_id: String,
        epoch: u64,
    },

    /// A fetch result was accepted into the store
    #[serde(rename_all = "camelCase")]
    FetchSucceeded {
        engine_id: String,
        definition_id: String,
        epoch: u64,
    },

    /// A fetch failed
    #[serde(rename_all = "camelCase")]
    FetchFailed {
        engine_id: String,
        definition_id: String,
        epoch: u64,
        error: String,
    },

    /// A fetch result arrived after being superseded
    #[serde(rename_all = "camelCase")]
    StaleResultDiscarded {
        engine_id: String,
        definition_id: String,
        epoch: u64,
    },

    /// A store slot was written externally
    #[serde(rename_all = "camelCase")]
    StoreWritten {
        engine_id: String,
        store_id: String,
    },

    /// A store slot was removed
    #[serde(rename_all = "camelCase")]
    StoreEvicted {
        engine_id: String,
        store_id: String,
    },
}

impl EngineEvent {
    /// Definition the event is about, if any
    pub fn definition_id(&self) -> Option<&str> {
        match self {
            Self::Subscribed { definition_id, .. }
            | Self::Unsubscribed { definition_id, .. }
            | Self::StageChanged { definition_id, .. }
            | Self::FetchStarted { definition_id, .. }
            | Self::FetchSucceeded { definition_id, .. }
            | Self::FetchFailed { definition_id, .. }
            | Self::StaleResultDiscarded { definition_id, .. } => Some(definition_id),
            Self::StoreWritten { .. } | Self::StoreEvicted { .. } => None,
        }
    }
}

/// A no-op event sink that discards all events
pub struct NullEventSink;

impl EventSink for NullEventSink {
    fn send(&self, _event: EngineEvent) -> Result<(), EventError> {
        Ok(())
    }
}

/// A vector-based event sink that collects events
///
/// Useful for testing to verify events were emitted correctly.
pub struct VecEventSink {
    events: std::sync::Mutex<Vec<EngineEvent>>,
}

impl VecEventSink {
    pub fn new() -> Self {
        Self {
            events: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// Get all collected events
    pub fn events(&self) -> Vec<EngineEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    /// Collected fetch starts for one definition
    pub fn fetches_started(&self, definition_id: &str) -> usize {
        self.events()
            .iter()
            .filter(|event| {
                matches!(event, EngineEvent::FetchStarted { .. })
                    && event.definition_id() == Some(definition_id)
            })
            .count()
    }

    /// Clear all collected events
    pub fn clear(&self) {
        if let Ok(mut events) = self.events.lock() {
            events.clear();
        }
    }
}

impl Default for VecEventSink {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSink for VecEventSink {
    fn send(&self, event: EngineEvent) -> Result<(), EventError> {
        self.events
            .lock()
            .map_err(|_| EventError {
                message: "Event buffer poisoned".to_string(),
            })?
            .push(event);
        Ok(())
    }
}

/// Forwards events into a tokio channel
pub struct ChannelEventSink {
    sender: tokio::sync::mpsc::UnboundedSender<EngineEvent>,
}

impl ChannelEventSink {
    pub fn new(sender: tokio::sync::mpsc::UnboundedSender<EngineEvent>) -> Self {
        Self { sender }
    }
}

impl EventSink for ChannelEventSink {
    fn send(&self, event: EngineEvent) -> Result<(), EventError> {
        self.sender
            .send(event)
            .map_err(|_| EventError::channel_closed())
    }
}
