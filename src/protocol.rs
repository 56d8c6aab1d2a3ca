//! Protocol types shared across the agent tiers
//!
//! Every message that crosses the bus is one variant of [`Message`], so
//! subscribers match exhaustively instead of probing untyped payloads.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a submitted batch task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId(Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// The nil id, used when a result arrives without one
    pub fn nil() -> Self {
        Self(Uuid::nil())
    }

    pub fn is_nil(&self) -> bool {
        self.0.is_nil()
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Unique identifier for an agent instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AgentId(Uuid);

impl AgentId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for AgentId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Correlation key for a single unit of work
///
/// Encodes which task the unit belongs to, which dispatch group the
/// sub-coordinator was handed, and the unit's index within that group.
/// Fan-in correlates on `task` directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubtaskId {
    pub task: TaskId,
    pub group: usize,
    pub unit: usize,
}

impl fmt::Display for SubtaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.task, self.group, self.unit)
    }
}

/// Tier an agent belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    Coordinator,
    SubCoordinator,
    Worker,
    Validator,
}

impl fmt::Display for AgentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Coordinator => "coordinator",
            Self::SubCoordinator => "sub_coordinator",
            Self::Worker => "worker",
            Self::Validator => "validator",
        };
        f.write_str(label)
    }
}

/// Agent lifecycle state; `Stopped` is terminal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Initializing,
    Running,
    Stopped,
}

/// Task lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Distributed,
    Processing,
    Completed,
    Failed,
    TimedOut,
}

impl TaskState {
    /// Terminal states are never overwritten by later bookkeeping
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::TimedOut)
    }
}

/// Outcome of processing one document
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitStatus {
    Completed,
    Failed,
}

/// A document handed to the core by the ingestion collaborator
///
/// Either `chunks` is precomputed and used as-is, or `content` is split by
/// the worker's sentence-accumulation fallback.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunks: Option<Vec<Chunk>>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl Document {
    pub fn new(id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            content: content.into(),
            chunks: None,
            metadata: HashMap::new(),
        }
    }

    pub fn with_chunks(mut self, chunks: Vec<Chunk>) -> Self {
        self.chunks = Some(chunks);
        self
    }
}

/// A span of document text, `span` being the word-offset range
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    pub text: String,
    pub span: (usize, usize),
}

/// Reference to a context snippet consulted during summarization
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Citation {
    pub snippet_id: String,
    pub score: f64,
}

/// Summarization output for a single chunk
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkSummary {
    pub chunk_id: String,
    pub word_count: usize,
    pub bullets: Vec<String>,
    pub key_terms: Vec<String>,
    pub citations: Vec<Citation>,
}

/// Worker → sub-coordinator result for one document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnitResult {
    pub subtask_id: SubtaskId,
    pub document_id: String,
    pub status: UnitStatus,
    pub chunks_processed: usize,
    pub total_words: usize,
    pub per_chunk_summaries: Vec<ChunkSummary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub worker_id: AgentId,
}

/// Sub-coordinator → coordinator aggregate for one dispatch group
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierResult {
    #[serde(default = "TaskId::nil")]
    pub task_id: TaskId,
    pub sub_coordinator_id: AgentId,
    pub total_documents: usize,
    pub successful_documents: usize,
    pub total_chunks_processed: usize,
    pub total_words_processed: usize,
    /// Wall-clock seconds spent between dispatch and compile
    pub processing_time: f64,
    /// True when the fan-in deadline elapsed before every unit reported
    #[serde(default)]
    pub shortfall: bool,
    pub unit_results: Vec<UnitResult>,
}

/// Reason code attached to a validation anomaly
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyReason {
    MissingTaskId,
    NoSuccessfulDocuments,
    NoWorkerResults,
    UnknownValidationFailure,
}

impl AnomalyReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MissingTaskId => "missing_task_id",
            Self::NoSuccessfulDocuments => "no_successful_documents",
            Self::NoWorkerResults => "no_worker_results",
            Self::UnknownValidationFailure => "unknown_validation_failure",
        }
    }
}

impl fmt::Display for AnomalyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A structurally invalid result, recorded without aborting validation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Anomaly {
    pub result_id: TaskId,
    pub reason: AnomalyReason,
}

/// Audit report over a task's tier results
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationReport {
    pub validator_id: AgentId,
    pub total_results: usize,
    pub successful: usize,
    pub failed: usize,
    pub anomalies: Vec<Anomaly>,
    pub quality_score: f64,
    pub validated_at: DateTime<Utc>,
}

/// Last-write-wins bookkeeping record for an agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub agent_id: AgentId,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Liveness table entry, written by the owning agent's heartbeat tick
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRecord {
    pub id: AgentId,
    pub kind: AgentKind,
    pub status: AgentStatus,
    pub last_heartbeat: DateTime<Utc>,
}

/// Per-document bullet synthesis in the final report
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentSummary {
    pub document_id: String,
    pub bullets: Vec<String>,
}

/// The coordinator's reduced report over all tier results
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinalReport {
    pub task_id: TaskId,
    pub coordinator_id: AgentId,
    pub state: TaskState,
    pub total_documents_processed: usize,
    pub successful_documents: usize,
    pub failed_documents: usize,
    pub total_chunks_processed: usize,
    pub total_words_processed: usize,
    pub success_rate: f64,
    pub document_summaries: Vec<DocumentSummary>,
    pub validation: ValidationReport,
    pub total_processing_time: f64,
    pub tier_results: Vec<TierResult>,
}

/// Coordinator → sub-coordinator assignment of one document group
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskAssignment {
    pub task_id: TaskId,
    pub sub_coordinator_id: AgentId,
    pub group_index: usize,
    pub documents: Vec<Document>,
}

/// Sub-coordinator → worker assignment of one document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnitAssignment {
    pub subtask_id: SubtaskId,
    pub worker_id: AgentId,
    pub document: Document,
}

/// Periodic liveness signal
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Heartbeat {
    pub agent_id: AgentId,
    pub kind: AgentKind,
    pub status: AgentStatus,
}

/// Pipeline progress stage, broadcast on the status channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Distributed,
    UnitCompleted,
    UnitFailed,
    TierCompleted,
    TierFailed,
    TaskCompleted,
    TaskTimedOut,
}

/// Progress notification for a task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusEvent {
    pub task_id: TaskId,
    pub agent_id: AgentId,
    pub stage: Stage,
}

/// Completion notification carrying the final report
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskCompleted {
    pub task_id: TaskId,
    pub report: FinalReport,
}

/// Every message kind that crosses the bus
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    TaskAssignment(TaskAssignment),
    UnitAssignment(UnitAssignment),
    UnitResult(UnitResult),
    TierResult(TierResult),
    Heartbeat(Heartbeat),
    Status(StatusEvent),
    TaskCompleted(TaskCompleted),
}

/// Channel naming for the bus topology
pub mod channels {
    use super::AgentId;

    pub const TASK_STATUS: &str = "task_status";
    pub const AGENT_HEARTBEAT: &str = "agent_heartbeat";
    pub const WORKER_RESULTS: &str = "worker_results";
    pub const TIER_RESULTS: &str = "tier_results";

    /// Per-sub-coordinator assignment channel
    pub fn tasks(id: &AgentId) -> String {
        format!("tasks_{id}")
    }

    /// Per-worker assignment channel
    pub fn subtasks(id: &AgentId) -> String {
        format!("subtasks_{id}")
    }
}
