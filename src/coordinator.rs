//! Coordinator - owns tasks, fans batches out, reduces tier results
//!
//! Fan-in is purely event-driven: the tier-result handler runs to completion
//! per arrival and triggers finalize itself. Finalize runs at most once per
//! task because the winning caller removes the task from the active map
//! before reducing it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::agent::AgentRuntime;
use crate::bus::{MessageBus, SubscriptionHandle};
use crate::config::Config;
use crate::error::ScribeError;
use crate::external::{ContextSearch, Summarizer};
use crate::protocol::{
    channels, AgentId, AgentKind, Document, DocumentSummary, FinalReport, Message, Stage,
    StatusEvent, TaskAssignment, TaskCompleted, TaskId, TaskState, TierResult,
};
use crate::storage::Storage;
use crate::subcoordinator::SubCoordinator;
use crate::validator::Validator;

/// Fan-in bookkeeping for a task in flight
struct ActiveTask {
    expected: usize,
    received: Vec<TierResult>,
    total_documents: usize,
    started: Instant,
}

/// Progress snapshot for a task still in flight
#[derive(Debug, Clone)]
pub struct TaskProgress {
    pub total_documents: usize,
    pub expected_subresults: usize,
    pub received_subresults: usize,
    pub elapsed: f64,
}

/// Answer to [`Coordinator::get_status`]
#[derive(Debug, Clone)]
pub enum TaskStatusView {
    Completed { report: Box<FinalReport> },
    Processing { progress: TaskProgress },
    NotFound,
}

/// Top tier: one instance owns each submitted task for its lifetime
pub struct Coordinator {
    runtime: AgentRuntime,
    bus: Arc<MessageBus>,
    storage: Arc<Storage>,
    config: Config,
    subs: Vec<Arc<SubCoordinator>>,
    validator: Arc<Validator>,
    active: Mutex<HashMap<TaskId, ActiveTask>>,
    completed: RwLock<HashMap<TaskId, FinalReport>>,
    subscriptions: Mutex<Vec<SubscriptionHandle>>,
}

impl Coordinator {
    pub fn new(
        bus: Arc<MessageBus>,
        storage: Arc<Storage>,
        config: Config,
        search: Arc<dyn ContextSearch>,
        summarizer: Arc<dyn Summarizer>,
    ) -> Arc<Self> {
        let subs = (0..config.sub_coordinators)
            .map(|_| {
                SubCoordinator::new(
                    Arc::clone(&bus),
                    Arc::clone(&storage),
                    config.clone(),
                    Arc::clone(&search),
                    Arc::clone(&summarizer),
                )
            })
            .collect();

        let validator = Validator::new(Arc::clone(&bus), Arc::clone(&storage), &config);
        let runtime = AgentRuntime::new(
            AgentKind::Coordinator,
            Arc::clone(&bus),
            Arc::clone(&storage),
            config.heartbeat_interval,
        );

        Arc::new(Self {
            runtime,
            bus,
            storage,
            config,
            subs,
            validator,
            active: Mutex::new(HashMap::new()),
            completed: RwLock::new(HashMap::new()),
            subscriptions: Mutex::new(Vec::new()),
        })
    }

    pub fn id(&self) -> AgentId {
        self.runtime.id
    }

    pub fn runtime(&self) -> &AgentRuntime {
        &self.runtime
    }

    pub fn sub_coordinators(&self) -> &[Arc<SubCoordinator>] {
        &self.subs
    }

    pub fn validator(&self) -> &Arc<Validator> {
        &self.validator
    }

    /// Start the whole hierarchy and subscribe the fan-in handler
    pub fn start(self: &Arc<Self>) {
        if self.runtime.is_running() {
            return;
        }
        self.runtime.start();
        self.validator.start();
        for sub in &self.subs {
            sub.start();
        }
        info!(
            coordinator = %self.id(),
            sub_coordinators = self.subs.len(),
            "hierarchy started"
        );

        let weak = Arc::downgrade(self);
        let subscription = self.bus.subscribe(channels::TIER_RESULTS, move |envelope| {
            if let Message::TierResult(result) = &envelope.payload {
                if let Some(coordinator) = weak.upgrade() {
                    coordinator.handle_tier_result(result.clone());
                }
            }
            Ok(())
        });
        self.subscriptions.lock().push(subscription);
    }

    /// Stop the hierarchy; in-flight dispatches run to their own deadline
    pub async fn stop(&self) {
        let subscriptions: Vec<_> = self.subscriptions.lock().drain(..).collect();
        for subscription in &subscriptions {
            self.bus.unsubscribe(subscription);
        }
        for sub in &self.subs {
            sub.stop().await;
        }
        self.validator.stop().await;
        self.runtime.stop().await;
    }

    /// Create a task and fan the batch out across the sub-coordinator pool
    pub fn submit_batch(self: &Arc<Self>, documents: Vec<Document>) -> Result<TaskId, ScribeError> {
        if !self.runtime.is_running() {
            return Err(ScribeError::AgentNotRunning(self.id()));
        }

        let task_id = TaskId::new();
        let total_documents = documents.len();
        info!(
            coordinator = %self.id(),
            task = %task_id,
            documents = total_documents,
            "submitting document batch"
        );
        self.storage.store_task(task_id, documents.clone());

        let groups = split_round_robin(documents, self.subs.len());
        let expected = groups.iter().filter(|g| !g.is_empty()).count();

        self.active.lock().insert(
            task_id,
            ActiveTask {
                expected,
                received: Vec::new(),
                total_documents,
                started: Instant::now(),
            },
        );

        if expected == 0 {
            // nothing to distribute; resolve now instead of waiting out the watchdog
            if let Some(task) = self.active.lock().remove(&task_id) {
                self.finalize(task_id, task, TaskState::Completed);
            }
            return Ok(task_id);
        }

        for (group_index, group) in groups.into_iter().enumerate() {
            if group.is_empty() {
                continue;
            }
            let sub = &self.subs[group_index];
            self.bus.publish(
                &channels::tasks(&sub.id()),
                Message::TaskAssignment(TaskAssignment {
                    task_id,
                    sub_coordinator_id: sub.id(),
                    group_index,
                    documents: group,
                }),
            );
        }

        self.storage.update_task_state(&task_id, TaskState::Distributed);
        self.bus.publish(
            channels::TASK_STATUS,
            Message::Status(StatusEvent {
                task_id,
                agent_id: self.id(),
                stage: Stage::Distributed,
            }),
        );
        self.storage.update_task_state(&task_id, TaskState::Processing);

        // watchdog: a task whose sub-results never all arrive is finalized
        // as timed out over whatever is present
        let weak = Arc::downgrade(self);
        let deadline = self.config.task_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(deadline).await;
            if let Some(coordinator) = weak.upgrade() {
                coordinator.expire(task_id);
            }
        });

        Ok(task_id)
    }

    /// Fan-in: append a tier result and finalize on the threshold
    fn handle_tier_result(&self, result: TierResult) {
        let task_id = result.task_id;
        let ready = {
            let mut active = self.active.lock();
            let Some(task) = active.get_mut(&task_id) else {
                debug!(task = %task_id, "ignoring tier result for unknown or finalized task");
                return;
            };
            if task.received.len() >= task.expected {
                debug!(task = %task_id, "ignoring surplus tier result");
                return;
            }
            task.received.push(result);
            if task.received.len() >= task.expected {
                // first caller wins; later arrivals find the task gone
                active.remove(&task_id)
            } else {
                None
            }
        };

        if let Some(task) = ready {
            self.finalize(task_id, task, TaskState::Completed);
        }
    }

    /// Watchdog path: deadline elapsed before all sub-results arrived
    fn expire(&self, task_id: TaskId) {
        let task = self.active.lock().remove(&task_id);
        if let Some(task) = task {
            warn!(
                coordinator = %self.id(),
                task = %task_id,
                received = task.received.len(),
                expected = task.expected,
                "task deadline elapsed; finalizing partial results"
            );
            self.finalize(task_id, task, TaskState::TimedOut);
        }
    }

    /// Reduce the tier results into the final report, exactly once per task
    fn finalize(&self, task_id: TaskId, task: ActiveTask, state: TaskState) {
        let tier_results = task.received;
        info!(
            coordinator = %self.id(),
            task = %task_id,
            tiers = tier_results.len(),
            "finalizing task"
        );

        let total: usize = tier_results.iter().map(|r| r.total_documents).sum();
        let successful: usize = tier_results.iter().map(|r| r.successful_documents).sum();
        let success_rate = if total > 0 {
            successful as f64 / total as f64
        } else {
            0.0
        };

        let validation = self.validator.validate(&tier_results);

        let report = FinalReport {
            task_id,
            coordinator_id: self.id(),
            state,
            total_documents_processed: total,
            successful_documents: successful,
            failed_documents: total - successful,
            total_chunks_processed: tier_results
                .iter()
                .map(|r| r.total_chunks_processed)
                .sum(),
            total_words_processed: tier_results
                .iter()
                .map(|r| r.total_words_processed)
                .sum(),
            success_rate,
            document_summaries: synthesize_summaries(&tier_results, self.config.max_report_bullets),
            validation,
            total_processing_time: task.started.elapsed().as_secs_f64(),
            tier_results,
        };

        self.completed.write().insert(task_id, report.clone());
        self.storage.update_task_state(&task_id, state);

        let stage = match state {
            TaskState::TimedOut => Stage::TaskTimedOut,
            _ => Stage::TaskCompleted,
        };
        self.bus.publish(
            channels::TASK_STATUS,
            Message::Status(StatusEvent {
                task_id,
                agent_id: self.id(),
                stage,
            }),
        );
        self.bus.publish(
            channels::TASK_STATUS,
            Message::TaskCompleted(TaskCompleted { task_id, report }),
        );
        info!(coordinator = %self.id(), task = %task_id, "task finalized");
    }

    /// Current view of a task
    pub fn get_status(&self, task_id: &TaskId) -> TaskStatusView {
        if let Some(report) = self.completed.read().get(task_id) {
            return TaskStatusView::Completed {
                report: Box::new(report.clone()),
            };
        }
        if let Some(task) = self.active.lock().get(task_id) {
            return TaskStatusView::Processing {
                progress: TaskProgress {
                    total_documents: task.total_documents,
                    expected_subresults: task.expected,
                    received_subresults: task.received.len(),
                    elapsed: task.started.elapsed().as_secs_f64(),
                },
            };
        }
        TaskStatusView::NotFound
    }
}

/// Round-robin split: document `i` goes to group `i % pools`
///
/// Group sizes differ by at most one and always sum to the input length.
pub(crate) fn split_round_robin(documents: Vec<Document>, pools: usize) -> Vec<Vec<Document>> {
    let mut groups: Vec<Vec<Document>> = (0..pools).map(|_| Vec::new()).collect();
    if pools == 0 {
        return groups;
    }
    for (i, document) in documents.into_iter().enumerate() {
        groups[i % pools].push(document);
    }
    groups
}

/// One synthesized summary per processed document, bullets capped
fn synthesize_summaries(tier_results: &[TierResult], cap: usize) -> Vec<DocumentSummary> {
    tier_results
        .iter()
        .flat_map(|tier| &tier.unit_results)
        .map(|unit| DocumentSummary {
            document_id: unit.document_id.clone(),
            bullets: unit
                .per_chunk_summaries
                .iter()
                .flat_map(|s| s.bullets.iter().cloned())
                .take(cap)
                .collect(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::external::{ExtractiveSummarizer, LexicalSearch};
    use crate::protocol::{SubtaskId, UnitResult, UnitStatus};
    use std::time::Duration;

    fn test_coordinator(config: Config) -> (Arc<Coordinator>, Arc<MessageBus>, Arc<Storage>) {
        let bus = Arc::new(MessageBus::new());
        let storage = Arc::new(Storage::new());
        let coordinator = Coordinator::new(
            Arc::clone(&bus),
            Arc::clone(&storage),
            config,
            Arc::new(LexicalSearch::new()),
            Arc::new(ExtractiveSummarizer::new()),
        );
        (coordinator, bus, storage)
    }

    fn sample_documents(n: usize) -> Vec<Document> {
        let bodies = [
            "Artificial intelligence has revolutionized multiple industries. \
             Machine learning algorithms can process vast amounts of data to identify patterns. \
             Deep learning networks have shown remarkable success in image recognition.",
            "Climate change represents one of the most significant challenges of our time. \
             Rising global temperatures are causing sea levels to rise. \
             Renewable energy sources like solar and wind power offer sustainable alternatives.",
            "The digital transformation of businesses has accelerated rapidly. \
             Cloud computing provides scalable infrastructure for modern applications. \
             Cybersecurity has become crucial as digital threats evolve.",
        ];
        (0..n)
            .map(|i| Document::new(format!("doc_{i:03}"), bodies[i % bodies.len()]))
            .collect()
    }

    async fn wait_for_completion(coordinator: &Arc<Coordinator>, task_id: TaskId) -> FinalReport {
        for _ in 0..500 {
            if let TaskStatusView::Completed { report } = coordinator.get_status(&task_id) {
                return *report;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("task {task_id} never completed");
    }

    #[test]
    fn test_round_robin_split_is_balanced() {
        let groups = split_round_robin(sample_documents(5), 2);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].len(), 3);
        assert_eq!(groups[1].len(), 2);

        for (n, pools) in [(0, 3), (1, 3), (7, 3), (9, 4), (12, 5)] {
            let groups = split_round_robin(sample_documents(n), pools);
            let sizes: Vec<usize> = groups.iter().map(Vec::len).collect();
            assert_eq!(sizes.iter().sum::<usize>(), n);
            let max = sizes.iter().max().unwrap();
            let min = sizes.iter().min().unwrap();
            assert!(max - min <= 1, "unbalanced split for {n} over {pools}: {sizes:?}");
        }
    }

    #[tokio::test]
    async fn test_end_to_end_single_sub_single_worker() {
        let config = Config::default().sub_coordinators(1).workers_per_sub(1);
        let (coordinator, _bus, storage) = test_coordinator(config);
        coordinator.start();

        let task_id = coordinator.submit_batch(sample_documents(3)).unwrap();
        let report = wait_for_completion(&coordinator, task_id).await;

        assert_eq!(report.state, TaskState::Completed);
        assert_eq!(report.total_documents_processed, 3);
        assert_eq!(report.successful_documents, 3);
        assert_eq!(report.failed_documents, 0);
        assert_eq!(report.success_rate, 1.0);
        assert!(report.total_chunks_processed >= 3);
        assert!(report.total_words_processed > 0);
        assert_eq!(report.validation.quality_score, 1.0);
        assert_eq!(report.document_summaries.len(), 3);
        assert!(report.document_summaries.iter().all(|s| !s.bullets.is_empty()));

        assert_eq!(
            storage.get_task(&task_id).unwrap().state,
            TaskState::Completed
        );
        coordinator.stop().await;
    }

    #[tokio::test]
    async fn test_reduction_sums_tier_results_exactly() {
        let config = Config::default().sub_coordinators(2).workers_per_sub(2);
        let (coordinator, _bus, _storage) = test_coordinator(config);
        coordinator.start();

        let task_id = coordinator.submit_batch(sample_documents(5)).unwrap();
        let report = wait_for_completion(&coordinator, task_id).await;

        assert_eq!(report.tier_results.len(), 2);
        let mut group_sizes: Vec<usize> =
            report.tier_results.iter().map(|r| r.total_documents).collect();
        group_sizes.sort_unstable();
        assert_eq!(group_sizes, vec![2, 3]);

        let expected_chunks: usize = report
            .tier_results
            .iter()
            .map(|r| r.total_chunks_processed)
            .sum();
        let expected_words: usize = report
            .tier_results
            .iter()
            .map(|r| r.total_words_processed)
            .sum();
        assert_eq!(report.total_documents_processed, 5);
        assert_eq!(report.total_chunks_processed, expected_chunks);
        assert_eq!(report.total_words_processed, expected_words);
        assert_eq!(report.success_rate, 1.0);

        coordinator.stop().await;
    }

    #[tokio::test]
    async fn test_finalize_runs_once_under_redelivery() {
        let config = Config::default().sub_coordinators(1).workers_per_sub(1);
        let (coordinator, bus, _storage) = test_coordinator(config);
        coordinator.start();

        let task_id = coordinator.submit_batch(sample_documents(2)).unwrap();
        let report = wait_for_completion(&coordinator, task_id).await;

        // redeliver the tier result for the already-finalized task
        let duplicate = report.tier_results[0].clone();
        bus.publish(channels::TIER_RESULTS, Message::TierResult(duplicate));
        tokio::time::sleep(Duration::from_millis(50)).await;

        let completions = bus
            .history(channels::TASK_STATUS, None)
            .iter()
            .filter(|e| matches!(&e.payload, Message::TaskCompleted(c) if c.task_id == task_id))
            .count();
        assert_eq!(completions, 1);

        match coordinator.get_status(&task_id) {
            TaskStatusView::Completed { report: after } => {
                assert_eq!(after.total_documents_processed, report.total_documents_processed);
            }
            other => panic!("unexpected status: {other:?}"),
        }
        coordinator.stop().await;
    }

    #[tokio::test]
    async fn test_missing_tier_result_times_out_with_partial_report() {
        let config = Config::default()
            .sub_coordinators(1)
            .workers_per_sub(1)
            .task_timeout(Duration::from_millis(200));
        let (coordinator, _bus, storage) = test_coordinator(config);
        coordinator.start();
        // silence the only sub-coordinator so no tier result ever arrives
        coordinator.sub_coordinators()[0].stop().await;

        let task_id = coordinator.submit_batch(sample_documents(3)).unwrap();
        let report = wait_for_completion(&coordinator, task_id).await;

        assert_eq!(report.state, TaskState::TimedOut);
        assert_eq!(report.total_documents_processed, 0);
        assert_eq!(report.success_rate, 0.0);
        assert_eq!(report.validation.quality_score, 0.0);
        assert_eq!(
            storage.get_task(&task_id).unwrap().state,
            TaskState::TimedOut
        );
        coordinator.stop().await;
    }

    #[tokio::test]
    async fn test_empty_batch_completes_immediately() {
        let config = Config::default().sub_coordinators(2);
        let (coordinator, _bus, _storage) = test_coordinator(config);
        coordinator.start();

        let task_id = coordinator.submit_batch(Vec::new()).unwrap();
        match coordinator.get_status(&task_id) {
            TaskStatusView::Completed { report } => {
                assert_eq!(report.total_documents_processed, 0);
                assert_eq!(report.success_rate, 0.0);
                assert_eq!(report.validation.quality_score, 0.0);
            }
            other => panic!("unexpected status: {other:?}"),
        }
        coordinator.stop().await;
    }

    #[tokio::test]
    async fn test_submit_refused_after_stop() {
        let (coordinator, _bus, _storage) = test_coordinator(Config::default());
        coordinator.start();
        coordinator.stop().await;

        let result = coordinator.submit_batch(sample_documents(1));
        assert!(matches!(result, Err(ScribeError::AgentNotRunning(_))));
    }

    #[tokio::test]
    async fn test_unknown_task_is_not_found() {
        let (coordinator, _bus, _storage) = test_coordinator(Config::default());
        assert!(matches!(
            coordinator.get_status(&TaskId::new()),
            TaskStatusView::NotFound
        ));
    }

    #[tokio::test]
    async fn test_progress_snapshot_while_processing() {
        let config = Config::default()
            .sub_coordinators(1)
            .workers_per_sub(1)
            .task_timeout(Duration::from_secs(5))
            .dispatch_timeout(Duration::from_millis(500));
        let (coordinator, _bus, _storage) = test_coordinator(config);
        coordinator.start();
        // workers never answer, so the task stays in flight until the
        // sub-coordinator deadline
        for worker in coordinator.sub_coordinators()[0].workers() {
            worker.stop().await;
        }

        let task_id = coordinator.submit_batch(sample_documents(2)).unwrap();
        match coordinator.get_status(&task_id) {
            TaskStatusView::Processing { progress } => {
                assert_eq!(progress.total_documents, 2);
                assert_eq!(progress.expected_subresults, 1);
                assert_eq!(progress.received_subresults, 0);
            }
            other => panic!("unexpected status: {other:?}"),
        }

        // the sub-coordinator eventually reports a shortfall tier result
        let report = wait_for_completion(&coordinator, task_id).await;
        assert_eq!(report.state, TaskState::Completed);
        assert_eq!(report.successful_documents, 0);
        assert!(report.tier_results[0].shortfall);
        // a tier with zero successes is anomalous
        assert_eq!(report.validation.quality_score, 0.0);
        coordinator.stop().await;
    }

    #[tokio::test]
    async fn test_unit_failure_is_isolated_from_siblings() {
        let config = Config::default().sub_coordinators(1).workers_per_sub(2);
        let (coordinator, _bus, _storage) = test_coordinator(config);
        coordinator.start();

        let mut documents = sample_documents(3);
        documents[1] = Document::new("doc_broken", "   ");
        let task_id = coordinator.submit_batch(documents).unwrap();
        let report = wait_for_completion(&coordinator, task_id).await;

        assert_eq!(report.state, TaskState::Completed);
        assert_eq!(report.total_documents_processed, 3);
        assert_eq!(report.successful_documents, 2);
        assert_eq!(report.failed_documents, 1);
        assert_eq!(report.success_rate, 2.0 / 3.0);

        let failed: Vec<&UnitResult> = report
            .tier_results
            .iter()
            .flat_map(|t| &t.unit_results)
            .filter(|u| u.status == UnitStatus::Failed)
            .collect();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].document_id, "doc_broken");
        coordinator.stop().await;
    }

    #[test]
    fn test_synthesized_summaries_cap_bullets() {
        let task = TaskId::new();
        let unit = UnitResult {
            subtask_id: SubtaskId {
                task,
                group: 0,
                unit: 0,
            },
            document_id: "doc_001".to_string(),
            status: UnitStatus::Completed,
            chunks_processed: 1,
            total_words: 10,
            per_chunk_summaries: vec![crate::protocol::ChunkSummary {
                chunk_id: "doc_001_chunk_0".to_string(),
                word_count: 10,
                bullets: (0..10).map(|i| format!("bullet {i}")).collect(),
                key_terms: Vec::new(),
                citations: Vec::new(),
            }],
            error: None,
            worker_id: AgentId::new(),
        };
        let tier = TierResult {
            task_id: task,
            sub_coordinator_id: AgentId::new(),
            total_documents: 1,
            successful_documents: 1,
            total_chunks_processed: 1,
            total_words_processed: 10,
            processing_time: 0.1,
            shortfall: false,
            unit_results: vec![unit],
        };

        let summaries = synthesize_summaries(&[tier], 4);
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].bullets.len(), 4);
    }
}
