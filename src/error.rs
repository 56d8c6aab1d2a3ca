//! Scriptorium error types

use thiserror::Error;

use crate::protocol::{AgentId, TaskId};

/// Errors that can surface at the orchestration boundary
///
/// Per-unit failures and fan-in timeouts are reported as data (a failed
/// `UnitResult`, a `TierResult` shortfall), never as errors; nothing here
/// terminates the pipeline.
#[derive(Debug, Error)]
pub enum ScribeError {
    /// The tier is already dispatching this task id
    #[error("Task {0} is already being dispatched")]
    ConflictingTask(TaskId),

    /// Dispatch or submission refused after stop()
    #[error("Agent {0} is not running")]
    AgentNotRunning(AgentId),

    /// A document arrived with neither chunks nor content
    #[error("Document {0} has no content to process")]
    EmptyDocument(String),

    /// An agent mailbox was closed while its subscription was live
    #[error("Channel closed: {0}")]
    ChannelClosed(String),
}
