//! Shared agent runtime - lifecycle, heartbeat, checkpoints
//!
//! Every tier composes an [`AgentRuntime`] rather than inheriting behavior.
//! The state machine is Initializing → Running → Stopped, with Stopped
//! terminal.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::bus::MessageBus;
use crate::protocol::{channels, AgentId, AgentKind, AgentStatus, Checkpoint, Heartbeat, Message};
use crate::storage::Storage;

struct Ticker {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Lifecycle, heartbeat and checkpoint plumbing composed into every tier
pub struct AgentRuntime {
    pub id: AgentId,
    pub kind: AgentKind,
    status: RwLock<AgentStatus>,
    bus: Arc<MessageBus>,
    storage: Arc<Storage>,
    heartbeat_interval: Duration,
    ticker: Mutex<Option<Ticker>>,
}

impl AgentRuntime {
    pub fn new(
        kind: AgentKind,
        bus: Arc<MessageBus>,
        storage: Arc<Storage>,
        heartbeat_interval: Duration,
    ) -> Self {
        Self {
            id: AgentId::new(),
            kind,
            status: RwLock::new(AgentStatus::Initializing),
            bus,
            storage,
            heartbeat_interval,
            ticker: Mutex::new(None),
        }
    }

    pub fn status(&self) -> AgentStatus {
        *self.status.read()
    }

    pub fn is_running(&self) -> bool {
        self.status() == AgentStatus::Running
    }

    /// Set Running and begin the heartbeat ticker
    pub fn start(&self) {
        {
            let mut status = self.status.write();
            match *status {
                AgentStatus::Running => return,
                AgentStatus::Stopped => {
                    warn!(agent_id = %self.id, "cannot restart a stopped agent");
                    return;
                }
                AgentStatus::Initializing => *status = AgentStatus::Running,
            }
        }

        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let bus = Arc::clone(&self.bus);
        let storage = Arc::clone(&self.storage);
        let id = self.id;
        let kind = self.kind;
        let period = self.heartbeat_interval;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        storage.record_heartbeat(id, kind, AgentStatus::Running);
                        bus.publish(
                            channels::AGENT_HEARTBEAT,
                            Message::Heartbeat(Heartbeat {
                                agent_id: id,
                                kind,
                                status: AgentStatus::Running,
                            }),
                        );
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }
        });

        *self.ticker.lock() = Some(Ticker { shutdown, handle });
        info!(agent_id = %self.id, kind = %self.kind, "agent started");
    }

    /// Set Stopped and join the ticker with a bounded wait; idempotent
    pub async fn stop(&self) {
        {
            let mut status = self.status.write();
            if *status == AgentStatus::Stopped {
                return;
            }
            *status = AgentStatus::Stopped;
        }

        let ticker = self.ticker.lock().take();
        if let Some(Ticker { shutdown, handle }) = ticker {
            let _ = shutdown.send(true);
            if tokio::time::timeout(Duration::from_secs(1), handle).await.is_err() {
                warn!(agent_id = %self.id, "heartbeat ticker did not stop within bound");
            }
        }

        self.storage.record_heartbeat(self.id, self.kind, AgentStatus::Stopped);
        info!(agent_id = %self.id, kind = %self.kind, "agent stopped");
    }

    /// Write this agent's checkpoint (overwrite semantics)
    pub fn checkpoint(&self, payload: serde_json::Value) {
        self.storage.write_checkpoint(self.id, payload);
        debug!(agent_id = %self.id, "checkpoint written");
    }

    /// Most recent checkpoint, if any; never consumed to resume work
    pub fn load_checkpoint(&self) -> Option<Checkpoint> {
        self.storage.load_checkpoint(&self.id)
    }
}
