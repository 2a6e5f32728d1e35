//! Data Engine - Dependency-graph-driven data orchestration
//!
//! This crate keeps a shared store of asynchronously fetched data consistent
//! with what its consumers currently need. It supports:
//!
//! - Declarative data definitions with named, nested dependencies
//! - Reference-counted subscriptions that activate whole dependency closures
//! - A per-definition stage machine (`WAITING`, `WAITING_INPUT`, `FETCHING`,
//!   `IDLE`, `ERROR`)
//! - Fetch scheduling with key-based re-fetching and stale-result rejection
//! - Generic event streaming (not tied to any UI)
//!
//! # Architecture
//!
//! - `EngineState`: synchronous reducer that owns store and status and runs
//!   the settle loop after every command
//! - `Orchestrator`: tokio task around `EngineState`; fetches run as spawned
//!   tasks whose outcomes flow back through its command channel
//! - `Consumer`: subscriber binding that mounts definitions and reads
//!   resolved snapshots
//! - `EventSink`: observation of stage changes and fetch outcomes
//!
//! # Example
//!
//! ```ignore
//! use data_engine::{Consumer, DefinitionBuilder, EngineConfig, NullEventSink, Orchestrator};
//!
//! let user = DefinitionBuilder::new()
//!     .id("user")
//!     .fetch_with(|_mapped, _raw| async { Ok(serde_json::json!({ "name": "ada" })) })
//!     .build();
//!
//! let orchestrator = Orchestrator::spawn(EngineConfig::default(), Arc::new(NullEventSink));
//! let consumer = Consumer::new("profile-view").with("user", &user);
//! consumer.mount(&orchestrator.handle()).await?;
//! ```

pub mod config;
pub mod consumer;
pub mod definition;
pub mod engine;
pub mod error;
pub mod events;
pub mod fetcher;
pub mod orchestrator;
pub mod params;
pub mod registry;
pub mod resolver;
pub mod scheduler;
pub mod stage;
pub mod subscriptions;
pub mod types;

// Re-export key types
pub use config::{EngineConfig, RetentionPolicy};
pub use consumer::Consumer;
pub use definition::{Definition, DefinitionBuilder, DefinitionSet, MapDataInput};
pub use engine::{EngineState, Snapshot};
pub use error::{EngineError, Result};
pub use events::{ChannelEventSink, EngineEvent, EventSink, NullEventSink, VecEventSink};
pub use fetcher::{CallbackFetcher, Fetcher};
pub use orchestrator::{Orchestrator, OrchestratorHandle, StoreSetter};
pub use params::{Parameters, RawParameters, Resolved, ResolvedTree};
pub use scheduler::FetchRequest;
pub use types::{DefinitionId, Stage, StatusTable, Store, StoreId, SubscriberId, Subscription};
