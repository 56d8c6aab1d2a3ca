//! # Scriptorium
//!
//! Hierarchical document-processing orchestration - the scribes' hall.
//!
//! This crate distributes a batch of documents across a three-tier hierarchy
//! of agents, aggregates the partial results, and audits them for structural
//! correctness.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                         COORDINATOR (Tier 0)                         │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐               │
//! │  │ Batch Splitter│ │ Result Reducer│ │  Validator   │               │
//! │  └──────────────┘  └──────────────┘  └──────────────┘               │
//! └────────────────────────────┬────────────────────────────────────────┘
//!                              │
//!              ┌───────────────┴───────────────┐
//!              ▼                               ▼
//!      ┌───────────────┐               ┌───────────────┐
//!      │Sub-Coordinator│               │Sub-Coordinator│
//!      │   (Tier 1)    │               │   (Tier 1)    │
//!      └───────┬───────┘               └───────┬───────┘
//!              │                               │
//!        ┌─────┼─────┐                   ┌─────┼─────┐
//!        ▼     ▼     ▼                   ▼     ▼     ▼
//!      ┌───┐ ┌───┐ ┌───┐               ┌───┐ ┌───┐ ┌───┐
//!      │W1 │ │W2 │ │W3 │               │W4 │ │W5 │ │W6 │
//!      └───┘ └───┘ └───┘               └───┘ └───┘ └───┘
//! ```
//!
//! All tiers communicate over an in-memory [`MessageBus`] with typed
//! messages. The coordinator fans a batch out by round-robin, each
//! sub-coordinator fans its group out to a worker pool by modulo assignment,
//! and results fan back in under bounded deadlines. Per-unit failures are
//! reported as data; a missing result degrades the task to a partial report
//! instead of blocking it.
//!
//! ## Key Concepts
//!
//! - **Worker**: leaf agent; processes exactly one document per assignment
//! - **Sub-Coordinator**: fans a document group out, compiles a [`TierResult`]
//! - **Coordinator**: owns tasks, reduces tier results into a [`FinalReport`]
//! - **Validator**: audits tier results and scores structural quality
//! - **Checkpoint**: write-only fault-tolerance bookkeeping per agent

pub mod agent;
pub mod bus;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod external;
pub mod protocol;
pub mod storage;
pub mod subcoordinator;
pub mod validator;
pub mod worker;

pub use agent::AgentRuntime;
pub use bus::{Envelope, MessageBus, SubscriptionHandle};
pub use config::Config;
pub use coordinator::{Coordinator, TaskProgress, TaskStatusView};
pub use error::ScribeError;
pub use external::{
    ContextSearch, ContextSnippet, ExtractiveSummarizer, LexicalSearch, Summarizer, Summary,
};
pub use protocol::{
    AgentId, AgentKind, AgentRecord, AgentStatus, Anomaly, AnomalyReason, Checkpoint, Chunk,
    ChunkSummary, Citation, Document, DocumentSummary, FinalReport, Heartbeat, Message, Stage,
    StatusEvent, SubtaskId, TaskAssignment, TaskCompleted, TaskId, TaskState, TierResult,
    UnitAssignment, UnitResult, UnitStatus, ValidationReport,
};
pub use storage::Storage;
pub use subcoordinator::SubCoordinator;
pub use validator::Validator;
pub use worker::Worker;
