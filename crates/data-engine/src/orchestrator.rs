//! Async runtime around the engine state
//!
//! A single tokio task owns `EngineState`. Handles send commands over an
//! unbounded channel; every fetch runs in its own spawned task and sends its
//! outcome back through that same channel, so all writes to store and status
//! happen on one task in arrival order.
//!
//! After each command the task publishes a fresh `Snapshot` on a `watch`
//! channel. Consumers either read the latest one or await changes.
//!
//! ```text
//!  OrchestratorHandle ──┐
//!  OrchestratorHandle ──┼──▶ mpsc ──▶ [engine task] ──▶ watch<Snapshot>
//!  fetch task ──────────┘                  │
//!        ▲                                 │ FetchRequest
//!        └──────────── tokio::spawn ◀──────┘
//! ```

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::config::EngineConfig;
use crate::definition::Definition;
use crate::engine::{EngineState, Snapshot};
use crate::error::{EngineError, Result};
use crate::events::EventSink;
use crate::scheduler::FetchRequest;

type Reply = oneshot::Sender<Result<()>>;

enum Command {
    Subscribe {
        subscriber_id: String,
        definition: Definition,
        reply: Reply,
    },
    Unsubscribe {
        subscriber_id: String,
        definition: Definition,
        reply: Reply,
    },
    SetStore {
        value: Value,
        definition: Definition,
        reply: Reply,
    },
    Evict {
        definition: Definition,
        reply: Reply,
    },
    Refresh {
        reply: Reply,
    },
    FetchSettled {
        definition_id: String,
        epoch: u64,
        outcome: Result<Value>,
    },
    Shutdown,
}

/// Running engine task together with a handle to it
pub struct Orchestrator {
    handle: OrchestratorHandle,
    task: JoinHandle<()>,
}

impl Orchestrator {
    /// Start the engine task on the current tokio runtime
    pub fn spawn(config: EngineConfig, event_sink: Arc<dyn EventSink>) -> Self {
        let state = EngineState::new(config, event_sink);
        let (commands, receiver) = mpsc::unbounded_channel();
        let (snapshots, snapshot_rx) = watch::channel(state.snapshot());

        let handle = OrchestratorHandle {
            engine_id: state.engine_id().to_string(),
            commands: commands.clone(),
            snapshots: snapshot_rx,
        };

        log::info!("[{}] orchestrator started", state.engine_id());
        let task = tokio::spawn(run(state, receiver, commands.downgrade(), snapshots));

        Self { handle, task }
    }

    /// Get a new handle to the engine task
    pub fn handle(&self) -> OrchestratorHandle {
        self.handle.clone()
    }

    /// Stop the engine task and wait for it to exit
    ///
    /// Fetches still in flight keep running but their outcomes are dropped.
    pub async fn shutdown(self) -> Result<()> {
        self.handle.shutdown();
        self.task.await.map_err(|err| {
            log::error!("[{}] engine task failed: {}", self.handle.engine_id, err);
            EngineError::ChannelClosed
        })
    }
}

/// Cloneable handle for driving the engine task
#[derive(Clone)]
pub struct OrchestratorHandle {
    engine_id: String,
    commands: mpsc::UnboundedSender<Command>,
    snapshots: watch::Receiver<Snapshot>,
}

impl OrchestratorHandle {
    pub fn engine_id(&self) -> &str {
        &self.engine_id
    }

    /// Subscribe `subscriber_id` to a definition
    ///
    /// Fails with `CyclicDependency` or `DuplicateDefinitionId` when the
    /// definition's graph is rejected; the engine keeps running either way.
    pub async fn subscribe(&self, subscriber_id: impl Into<String>, definition: &Definition) -> Result<()> {
        let subscriber_id = subscriber_id.into();
        let definition = definition.clone();
        self.request(|reply| Command::Subscribe {
            subscriber_id,
            definition,
            reply,
        })
        .await
    }

    pub async fn unsubscribe(&self, subscriber_id: impl Into<String>, definition: &Definition) -> Result<()> {
        let subscriber_id = subscriber_id.into();
        let definition = definition.clone();
        self.request(|reply| Command::Unsubscribe {
            subscriber_id,
            definition,
            reply,
        })
        .await
    }

    /// Write a value into the definition's store slot
    pub async fn set_store(&self, value: Value, definition: &Definition) -> Result<()> {
        let definition = definition.clone();
        self.request(|reply| Command::SetStore {
            value,
            definition,
            reply,
        })
        .await
    }

    /// Remove the definition's store slot
    pub async fn evict(&self, definition: &Definition) -> Result<()> {
        let definition = definition.clone();
        self.request(|reply| Command::Evict { definition, reply }).await
    }

    /// Run a settle loop without mutating anything
    pub async fn refresh(&self) -> Result<()> {
        self.request(|reply| Command::Refresh { reply }).await
    }

    /// Latest published snapshot
    pub fn snapshot(&self) -> Snapshot {
        self.snapshots.borrow().clone()
    }

    /// Receiver notified whenever store or status change
    pub fn watch(&self) -> watch::Receiver<Snapshot> {
        self.snapshots.clone()
    }

    /// Ask the engine task to stop
    pub fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown);
    }

    /// Setter bound to one definition's store slot
    pub fn setter(&self, definition: &Definition) -> StoreSetter {
        StoreSetter {
            handle: self.clone(),
            definition: definition.clone(),
        }
    }

    async fn request(&self, command: impl FnOnce(Reply) -> Command) -> Result<()> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(command(reply))
            .map_err(|_| EngineError::ChannelClosed)?;
        response.await.map_err(|_| EngineError::ChannelClosed)?
    }
}

/// Writes into one definition's store slot
#[derive(Clone)]
pub struct StoreSetter {
    handle: OrchestratorHandle,
    definition: Definition,
}

impl StoreSetter {
    pub async fn set(&self, value: Value) -> Result<()> {
        self.handle.set_store(value, &self.definition).await
    }

    pub fn definition(&self) -> &Definition {
        &self.definition
    }
}

async fn run(
    mut state: EngineState,
    mut receiver: mpsc::UnboundedReceiver<Command>,
    commands: mpsc::WeakUnboundedSender<Command>,
    snapshots: watch::Sender<Snapshot>,
) {
    while let Some(command) = receiver.recv().await {
        let (outcome, reply) = match command {
            Command::Shutdown => break,
            Command::Subscribe {
                subscriber_id,
                definition,
                reply,
            } => (state.subscribe(&subscriber_id, &definition), Some(reply)),
            Command::Unsubscribe {
                subscriber_id,
                definition,
                reply,
            } => (state.unsubscribe(&subscriber_id, &definition), Some(reply)),
            Command::SetStore {
                value,
                definition,
                reply,
            } => (state.set_store(value, &definition), Some(reply)),
            Command::Evict { definition, reply } => (state.evict(&definition), Some(reply)),
            Command::Refresh { reply } => (state.refresh(), Some(reply)),
            Command::FetchSettled {
                definition_id,
                epoch,
                outcome,
            } => (state.settle_fetch(&definition_id, epoch, outcome), None),
        };

        // A caller must find its own write in `snapshot()` once its reply arrives
        publish(&state, &snapshots);

        let requests = match outcome {
            Ok(requests) => {
                if let Some(reply) = reply {
                    let _ = reply.send(Ok(()));
                }
                requests
            }
            Err(err) => {
                match reply {
                    Some(reply) => {
                        let _ = reply.send(Err(err));
                    }
                    None => log::error!("[{}] {}", state.engine_id(), err),
                }
                Vec::new()
            }
        };
        launch(requests, &commands);
    }

    log::info!("[{}] orchestrator stopped", state.engine_id());
}

fn publish(state: &EngineState, snapshots: &watch::Sender<Snapshot>) {
    let next = state.snapshot();
    snapshots.send_if_modified(|current| {
        if *current == next {
            return false;
        }
        *current = next;
        true
    });
}

/// Spawn one task per request; outcomes re-enter the command channel
fn launch(requests: Vec<FetchRequest>, commands: &mpsc::WeakUnboundedSender<Command>) {
    for request in requests {
        let Some(sender) = commands.upgrade() else {
            return;
        };
        let Some(fetcher) = request.definition.fetcher().cloned() else {
            continue;
        };
        let definition_id = request.definition.id().to_string();
        let epoch = request.epoch;
        let mapped = request.parameters.mapped.clone();
        let raw = request.parameters.raw.clone();

        tokio::spawn(async move {
            let outcome = fetcher.fetch(mapped, raw).await;
            let _ = sender.send(Command::FetchSettled {
                definition_id,
                epoch,
                outcome,
            });
        });
    }
}
