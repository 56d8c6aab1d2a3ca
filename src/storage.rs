//! In-memory bookkeeping store shared by the agent tiers
//!
//! An explicit instance injected into each component; holds the task mirror,
//! last-write-wins checkpoints, the agent liveness table, and raw documents.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use crate::protocol::{
    AgentId, AgentKind, AgentRecord, AgentStatus, Checkpoint, Document, TaskId, TaskState,
};

/// Bookkeeping mirror of a task's lifecycle
#[derive(Debug, Clone)]
pub struct TaskRecord {
    pub id: TaskId,
    pub state: TaskState,
    pub documents: Vec<Document>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A stored raw document
#[derive(Debug, Clone)]
pub struct StoredDocument {
    pub content: String,
    pub metadata: HashMap<String, serde_json::Value>,
    pub stored_at: DateTime<Utc>,
}

#[derive(Default)]
pub struct Storage {
    tasks: RwLock<HashMap<TaskId, TaskRecord>>,
    checkpoints: RwLock<HashMap<AgentId, Checkpoint>>,
    agents: RwLock<HashMap<AgentId, AgentRecord>>,
    documents: RwLock<HashMap<String, StoredDocument>>,
}

impl Storage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store_task(&self, id: TaskId, documents: Vec<Document>) {
        let now = Utc::now();
        self.tasks.write().insert(
            id,
            TaskRecord {
                id,
                state: TaskState::Pending,
                documents,
                created_at: now,
                updated_at: now,
            },
        );
    }

    /// Advance a task's recorded state; terminal states are never overwritten
    pub fn update_task_state(&self, id: &TaskId, state: TaskState) {
        if let Some(record) = self.tasks.write().get_mut(id) {
            if record.state.is_terminal() {
                return;
            }
            record.state = state;
            record.updated_at = Utc::now();
        }
    }

    pub fn get_task(&self, id: &TaskId) -> Option<TaskRecord> {
        self.tasks.read().get(id).cloned()
    }

    pub fn all_tasks(&self) -> Vec<TaskRecord> {
        self.tasks.read().values().cloned().collect()
    }

    /// Write an agent's checkpoint; only the latest is retrievable
    pub fn write_checkpoint(&self, agent_id: AgentId, payload: serde_json::Value) {
        self.checkpoints.write().insert(
            agent_id,
            Checkpoint {
                agent_id,
                payload,
                created_at: Utc::now(),
            },
        );
    }

    pub fn load_checkpoint(&self, agent_id: &AgentId) -> Option<Checkpoint> {
        self.checkpoints.read().get(agent_id).cloned()
    }

    pub fn record_heartbeat(&self, id: AgentId, kind: AgentKind, status: AgentStatus) {
        self.agents.write().insert(
            id,
            AgentRecord {
                id,
                kind,
                status,
                last_heartbeat: Utc::now(),
            },
        );
    }

    pub fn agent_record(&self, id: &AgentId) -> Option<AgentRecord> {
        self.agents.read().get(id).cloned()
    }

    pub fn agent_records(&self) -> Vec<AgentRecord> {
        self.agents.read().values().cloned().collect()
    }

    pub fn store_document(
        &self,
        id: impl Into<String>,
        content: impl Into<String>,
        metadata: HashMap<String, serde_json::Value>,
    ) {
        self.documents.write().insert(
            id.into(),
            StoredDocument {
                content: content.into(),
                metadata,
                stored_at: Utc::now(),
            },
        );
    }

    pub fn document(&self, id: &str) -> Option<StoredDocument> {
        self.documents.read().get(id).cloned()
    }
}
