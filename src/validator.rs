//! Validator - structural audit of tier results
//!
//! Stateless per call; failing results become anomalies with a reason code
//! and count against the quality score, never aborting the rest.

use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use tracing::{debug, info};

use crate::agent::AgentRuntime;
use crate::bus::MessageBus;
use crate::config::Config;
use crate::protocol::{
    AgentId, AgentKind, Anomaly, AnomalyReason, TierResult, UnitStatus, ValidationReport,
};
use crate::storage::Storage;

pub struct Validator {
    runtime: AgentRuntime,
    /// Past reports kept for audit; not consulted by the coordinator
    history: RwLock<Vec<ValidationReport>>,
}

impl Validator {
    pub fn new(bus: Arc<MessageBus>, storage: Arc<Storage>, config: &Config) -> Arc<Self> {
        let runtime = AgentRuntime::new(
            AgentKind::Validator,
            bus,
            storage,
            config.heartbeat_interval,
        );
        Arc::new(Self {
            runtime,
            history: RwLock::new(Vec::new()),
        })
    }

    pub fn id(&self) -> AgentId {
        self.runtime.id
    }

    pub fn start(&self) {
        self.runtime.start();
    }

    pub async fn stop(&self) {
        self.runtime.stop().await;
    }

    /// Audit every tier result and compute the quality score
    pub fn validate(&self, results: &[TierResult]) -> ValidationReport {
        debug!(validator = %self.id(), results = results.len(), "validating tier results");

        let mut successful = 0;
        let mut anomalies = Vec::new();
        for result in results {
            match audit(result) {
                Ok(()) => successful += 1,
                Err(reason) => {
                    debug!(
                        validator = %self.id(),
                        task = %result.task_id,
                        reason = %reason,
                        "anomalous tier result"
                    );
                    anomalies.push(Anomaly {
                        result_id: result.task_id,
                        reason,
                    });
                }
            }
        }

        let total_results = results.len();
        let failed = anomalies.len();
        let quality_score = if total_results > 0 {
            successful as f64 / total_results as f64
        } else {
            0.0
        };

        let report = ValidationReport {
            validator_id: self.id(),
            total_results,
            successful,
            failed,
            anomalies,
            quality_score,
            validated_at: Utc::now(),
        };
        info!(
            validator = %self.id(),
            successful,
            total = total_results,
            "validation complete"
        );
        self.history.write().push(report.clone());
        report
    }

    pub fn history(&self) -> Vec<ValidationReport> {
        self.history.read().clone()
    }
}

/// Structural checks for one tier result, first failure wins
fn audit(result: &TierResult) -> Result<(), AnomalyReason> {
    if result.task_id.is_nil() {
        return Err(AnomalyReason::MissingTaskId);
    }
    if result.successful_documents == 0 {
        return Err(AnomalyReason::NoSuccessfulDocuments);
    }
    if result.unit_results.is_empty() {
        return Err(AnomalyReason::NoWorkerResults);
    }
    for unit in &result.unit_results {
        if unit.status != UnitStatus::Completed
            || unit.chunks_processed == 0
            || unit.per_chunk_summaries.is_empty()
        {
            return Err(AnomalyReason::UnknownValidationFailure);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ChunkSummary, SubtaskId, TaskId, UnitResult};

    fn test_validator() -> Arc<Validator> {
        let bus = Arc::new(MessageBus::new());
        let storage = Arc::new(Storage::new());
        Validator::new(bus, storage, &Config::default())
    }

    fn completed_unit(task: TaskId) -> UnitResult {
        UnitResult {
            subtask_id: SubtaskId {
                task,
                group: 0,
                unit: 0,
            },
            document_id: "doc_001".to_string(),
            status: UnitStatus::Completed,
            chunks_processed: 2,
            total_words: 40,
            per_chunk_summaries: vec![ChunkSummary {
                chunk_id: "doc_001_chunk_0".to_string(),
                word_count: 20,
                bullets: vec!["a bullet".to_string()],
                key_terms: vec!["keyword".to_string()],
                citations: Vec::new(),
            }],
            error: None,
            worker_id: crate::protocol::AgentId::new(),
        }
    }

    fn valid_tier(task: TaskId) -> TierResult {
        TierResult {
            task_id: task,
            sub_coordinator_id: crate::protocol::AgentId::new(),
            total_documents: 1,
            successful_documents: 1,
            total_chunks_processed: 2,
            total_words_processed: 40,
            processing_time: 0.2,
            shortfall: false,
            unit_results: vec![completed_unit(task)],
        }
    }

    #[test]
    fn test_all_valid_results_score_one() {
        let validator = test_validator();
        let results = vec![valid_tier(TaskId::new()), valid_tier(TaskId::new())];

        let report = validator.validate(&results);

        assert_eq!(report.total_results, 2);
        assert_eq!(report.successful, 2);
        assert_eq!(report.failed, 0);
        assert!(report.anomalies.is_empty());
        assert_eq!(report.quality_score, 1.0);
    }

    #[test]
    fn test_missing_task_id_is_flagged() {
        let validator = test_validator();
        let mut tier = valid_tier(TaskId::new());
        tier.task_id = TaskId::nil();

        let report = validator.validate(&[tier]);

        assert_eq!(report.anomalies.len(), 1);
        assert_eq!(report.anomalies[0].reason, AnomalyReason::MissingTaskId);
    }

    #[test]
    fn test_no_successful_documents_is_flagged() {
        let validator = test_validator();
        let mut tier = valid_tier(TaskId::new());
        tier.successful_documents = 0;

        let report = validator.validate(&[tier]);

        assert_eq!(
            report.anomalies[0].reason,
            AnomalyReason::NoSuccessfulDocuments
        );
        assert_eq!(report.quality_score, 0.0);
    }

    #[test]
    fn test_empty_unit_results_is_flagged() {
        let validator = test_validator();
        let mut tier = valid_tier(TaskId::new());
        tier.unit_results.clear();

        let report = validator.validate(&[tier]);

        assert_eq!(report.anomalies[0].reason, AnomalyReason::NoWorkerResults);
    }

    #[test]
    fn test_failed_unit_is_flagged_as_unknown() {
        let validator = test_validator();
        let task = TaskId::new();
        let mut tier = valid_tier(task);
        tier.unit_results[0].status = UnitStatus::Failed;

        let report = validator.validate(&[tier]);

        assert_eq!(
            report.anomalies[0].reason,
            AnomalyReason::UnknownValidationFailure
        );
        assert_eq!(report.anomalies[0].result_id, task);
    }

    #[test]
    fn test_quality_score_is_exact_fraction() {
        let validator = test_validator();
        let mut bad = valid_tier(TaskId::new());
        bad.successful_documents = 0;
        let results = vec![valid_tier(TaskId::new()), valid_tier(TaskId::new()), bad];

        let report = validator.validate(&results);

        assert_eq!(report.successful, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(report.quality_score, 2.0 / 3.0);
    }

    #[test]
    fn test_empty_input_scores_zero() {
        let validator = test_validator();
        let report = validator.validate(&[]);
        assert_eq!(report.total_results, 0);
        assert_eq!(report.quality_score, 0.0);
    }

    #[test]
    fn test_history_retains_past_reports() {
        let validator = test_validator();
        validator.validate(&[valid_tier(TaskId::new())]);
        validator.validate(&[]);
        assert_eq!(validator.history().len(), 2);
    }
}
