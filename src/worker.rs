//! Worker agent - processes exactly one document per assignment
//!
//! The bus callback only forwards assignments into the worker's mailbox;
//! chunking, context search and summarization run on the worker's own task.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::agent::AgentRuntime;
use crate::bus::{MessageBus, SubscriptionHandle};
use crate::config::Config;
use crate::error::ScribeError;
use crate::external::{ContextSearch, Summarizer};
use crate::protocol::{
    channels, AgentId, AgentKind, Chunk, ChunkSummary, Document, Message, Stage, StatusEvent,
    SubtaskId, UnitAssignment, UnitResult, UnitStatus,
};
use crate::storage::Storage;

/// Number of leading words used as the context-search query
const QUERY_WORDS: usize = 8;

struct Mailbox {
    subscription: SubscriptionHandle,
    _handle: JoinHandle<()>,
}

/// Leaf agent of the hierarchy
pub struct Worker {
    runtime: AgentRuntime,
    bus: Arc<MessageBus>,
    storage: Arc<Storage>,
    config: Config,
    search: Arc<dyn ContextSearch>,
    summarizer: Arc<dyn Summarizer>,
    mailbox: Mutex<Option<Mailbox>>,
}

impl Worker {
    pub fn new(
        bus: Arc<MessageBus>,
        storage: Arc<Storage>,
        config: Config,
        search: Arc<dyn ContextSearch>,
        summarizer: Arc<dyn Summarizer>,
    ) -> Arc<Self> {
        let runtime = AgentRuntime::new(
            AgentKind::Worker,
            Arc::clone(&bus),
            Arc::clone(&storage),
            config.heartbeat_interval,
        );
        Arc::new(Self {
            runtime,
            bus,
            storage,
            config,
            search,
            summarizer,
            mailbox: Mutex::new(None),
        })
    }

    pub fn id(&self) -> AgentId {
        self.runtime.id
    }

    pub fn runtime(&self) -> &AgentRuntime {
        &self.runtime
    }

    /// Start the runtime and begin consuming assignments
    pub fn start(self: &Arc<Self>) {
        if self.runtime.is_running() {
            return;
        }
        self.runtime.start();

        let channel = channels::subtasks(&self.id());
        let (tx, mut rx) = mpsc::unbounded_channel::<UnitAssignment>();
        let forward_channel = channel.clone();
        let subscription = self.bus.subscribe(&channel, move |envelope| {
            if let Message::UnitAssignment(assignment) = &envelope.payload {
                tx.send(assignment.clone())
                    .map_err(|_| ScribeError::ChannelClosed(forward_channel.clone()))?;
            }
            Ok(())
        });

        let worker = Arc::clone(self);
        let handle = tokio::spawn(async move {
            while let Some(assignment) = rx.recv().await {
                if !worker.runtime.is_running() {
                    debug!(
                        worker_id = %worker.id(),
                        subtask = %assignment.subtask_id,
                        "dropping assignment for stopped worker"
                    );
                    continue;
                }
                let result = worker
                    .process(assignment.subtask_id, &assignment.document)
                    .await;
                worker.report(result);
            }
        });

        *self.mailbox.lock() = Some(Mailbox {
            subscription,
            _handle: handle,
        });
    }

    /// Stop consuming assignments; an in-flight document finishes on its own
    pub async fn stop(&self) {
        let mailbox = self.mailbox.lock().take();
        if let Some(mailbox) = mailbox {
            self.bus.unsubscribe(&mailbox.subscription);
        }
        self.runtime.stop().await;
    }

    /// Process one document into a [`UnitResult`]
    ///
    /// Failure never escapes this boundary: it is checkpointed and returned
    /// as a result with status Failed.
    pub async fn process(&self, subtask_id: SubtaskId, document: &Document) -> UnitResult {
        debug!(
            worker_id = %self.id(),
            document_id = %document.id,
            subtask = %subtask_id,
            "processing document"
        );

        match self.summarize_document(subtask_id, document).await {
            Ok(result) => result,
            Err(error) => {
                self.runtime.checkpoint(serde_json::json!({
                    "subtask_id": subtask_id.to_string(),
                    "document_id": document.id,
                    "error": error.to_string(),
                    "retry_count": 1,
                }));
                warn!(
                    worker_id = %self.id(),
                    document_id = %document.id,
                    error = %error,
                    "document processing failed"
                );
                UnitResult {
                    subtask_id,
                    document_id: document.id.clone(),
                    status: UnitStatus::Failed,
                    chunks_processed: 0,
                    total_words: 0,
                    per_chunk_summaries: Vec::new(),
                    error: Some(error.to_string()),
                    worker_id: self.id(),
                }
            }
        }
    }

    async fn summarize_document(
        &self,
        subtask_id: SubtaskId,
        document: &Document,
    ) -> Result<UnitResult, ScribeError> {
        let chunks = match &document.chunks {
            Some(chunks) if !chunks.is_empty() => chunks.clone(),
            _ => fallback_chunks(&document.id, &document.content, self.config.chunk_char_budget)?,
        };

        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        self.search.index(&document.id, &texts).await;
        self.storage.store_document(
            document.id.as_str(),
            document.content.as_str(),
            document.metadata.clone(),
        );

        let mut per_chunk_summaries = Vec::with_capacity(chunks.len());
        let mut total_words = 0;
        for chunk in &chunks {
            let query = leading_words(&chunk.text, QUERY_WORDS);
            let context = self.search.search(&query, self.config.context_snippets).await;
            let summary = self.summarizer.summarize(&chunk.text, &context).await;

            let word_count = chunk.text.split_whitespace().count();
            total_words += word_count;
            per_chunk_summaries.push(ChunkSummary {
                chunk_id: chunk.id.clone(),
                word_count,
                bullets: summary.bullets,
                key_terms: summary.key_terms,
                citations: summary.citations,
            });
        }

        Ok(UnitResult {
            subtask_id,
            document_id: document.id.clone(),
            status: UnitStatus::Completed,
            chunks_processed: per_chunk_summaries.len(),
            total_words,
            per_chunk_summaries,
            error: None,
            worker_id: self.id(),
        })
    }

    fn report(&self, result: UnitResult) {
        let stage = match result.status {
            UnitStatus::Completed => Stage::UnitCompleted,
            UnitStatus::Failed => Stage::UnitFailed,
        };
        self.bus.publish(
            channels::TASK_STATUS,
            Message::Status(StatusEvent {
                task_id: result.subtask_id.task,
                agent_id: self.id(),
                stage,
            }),
        );
        self.bus
            .publish(channels::WORKER_RESULTS, Message::UnitResult(result));
    }
}

/// Sentence-accumulation fallback split, bounded by a character budget
fn fallback_chunks(
    document_id: &str,
    content: &str,
    budget: usize,
) -> Result<Vec<Chunk>, ScribeError> {
    if content.trim().is_empty() {
        return Err(ScribeError::EmptyDocument(document_id.to_string()));
    }

    let mut chunks: Vec<Chunk> = Vec::new();
    let mut current = String::new();
    let mut span_start = 0usize;
    let mut words_consumed = 0usize;

    let flush = |current: &mut String, span_start: &mut usize, consumed: usize, chunks: &mut Vec<Chunk>| {
        let text = current.trim().to_string();
        if !text.is_empty() {
            chunks.push(Chunk {
                id: format!("{document_id}_chunk_{}", chunks.len()),
                text,
                span: (*span_start, consumed),
            });
        }
        current.clear();
        *span_start = consumed;
    };

    for sentence in content.split(&['.', '!', '?'][..]) {
        let sentence = sentence.trim();
        if sentence.is_empty() {
            continue;
        }
        if !current.is_empty() && current.len() + sentence.len() >= budget {
            flush(&mut current, &mut span_start, words_consumed, &mut chunks);
        }
        current.push_str(sentence);
        current.push_str(". ");
        words_consumed += sentence.split_whitespace().count();
    }
    flush(&mut current, &mut span_start, words_consumed, &mut chunks);

    if chunks.is_empty() {
        chunks.push(Chunk {
            id: format!("{document_id}_chunk_0"),
            text: content.to_string(),
            span: (0, content.split_whitespace().count()),
        });
    }
    Ok(chunks)
}

fn leading_words(text: &str, n: usize) -> String {
    text.split_whitespace().take(n).collect::<Vec<_>>().join(" ")
}
