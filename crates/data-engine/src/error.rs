//! Error types for the data engine

use thiserror::Error;

use crate::types::DefinitionId;

/// Result type alias using EngineError
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors that can occur in the data engine
#[derive(Debug, Error)]
pub enum EngineError {
    /// A fetcher's asynchronous operation rejected
    #[error("Fetch failed for '{definition_id}': {message}")]
    FetchFailed {
        definition_id: DefinitionId,
        message: String,
    },

    /// Dependency graph contains a cycle
    #[error("Cyclic dependency: {}", path.join(" -> "))]
    CyclicDependency { path: Vec<DefinitionId> },

    /// Fixed-point ordering stopped making progress
    #[error("No topological order for definitions: {}", remaining.join(", "))]
    NoTopologicalOrder { remaining: Vec<DefinitionId> },

    /// Settle loop did not reach quiescence
    #[error("Engine did not settle after {passes} passes")]
    NotQuiescent { passes: usize },

    /// Two distinct descriptors registered under one id
    #[error("Duplicate definition id: {id}")]
    DuplicateDefinitionId { id: DefinitionId },

    /// Definition id not present in the registry
    #[error("Unknown definition: {0}")]
    UnknownDefinition(DefinitionId),

    /// Orchestrator task is no longer running
    #[error("Orchestrator channel closed")]
    ChannelClosed,

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// Create a fetch failure with a message
    ///
    /// The definition id is filled in by the engine when the failure is
    /// recorded, so fetchers only supply the message.
    pub fn failed(msg: impl Into<String>) -> Self {
        Self::FetchFailed {
            definition_id: DefinitionId::new(),
            message: msg.into(),
        }
    }

    /// Attach the failing definition's id to a fetch failure
    pub fn for_definition(self, id: &str) -> Self {
        match self {
            Self::FetchFailed { message, .. } => Self::FetchFailed {
                definition_id: id.to_string(),
                message,
            },
            other => Self::FetchFailed {
                definition_id: id.to_string(),
                message: other.to_string(),
            },
        }
    }

    /// Whether this error is a fatal configuration defect rather than a runtime failure
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::CyclicDependency { .. }
                | Self::NoTopologicalOrder { .. }
                | Self::NotQuiescent { .. }
                | Self::DuplicateDefinitionId { .. }
        )
    }
}
