//! Workflow Coordinator
//!
//! Drives a request through Reconnaissance → Generation → Validation →
//! Optimization. After every stage the output and the next status are
//! persisted together as a versioned checkpoint, a metric row is
//! appended and a progress event is published, so a crashed run resumes
//! from the stage after the last one persisted. Cancellation is
//! cooperative and observed at every stage boundary.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{info, warn};
use uuid::Uuid;

use testops_core::config::StageTimeouts;
use testops_core::error::{CopilotError, CopilotResult};
use testops_core::models::{
    AgentName, AuditAction, GenerationMetric, MetricStatus, Request, RequestStatus,
    SecurityAuditLog, TestCase, ValidationStatus,
};
use testops_databases::{ProgressBus, ProgressEvent, SqliteStore};

use crate::generator::{GeneratedBatch, GeneratorAgent};
use crate::optimizer::OptimizerAgent;
use crate::reconnaissance::{PageStructure, ReconnaissanceAgent};
use crate::validator::ValidatorAgent;

/// Current checkpoint format version. A checkpoint written by version V
/// decodes under V and V+1; unknown future versions are rejected.
pub const CHECKPOINT_VERSION: u32 = 1;

/// Pipeline stages in execution order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Reconnaissance,
    Generation,
    Validation,
    Optimization,
}

impl Stage {
    pub fn next(self) -> Option<Stage> {
        match self {
            Stage::Reconnaissance => Some(Stage::Generation),
            Stage::Generation => Some(Stage::Validation),
            Stage::Validation => Some(Stage::Optimization),
            Stage::Optimization => None,
        }
    }

    pub fn status(self) -> RequestStatus {
        match self {
            Stage::Reconnaissance => RequestStatus::Reconnaissance,
            Stage::Generation => RequestStatus::Generation,
            Stage::Validation => RequestStatus::Validation,
            Stage::Optimization => RequestStatus::Optimization,
        }
    }

    pub fn agent_name(self) -> AgentName {
        match self {
            Stage::Reconnaissance => AgentName::Reconnaissance,
            Stage::Generation => AgentName::Generator,
            Stage::Validation => AgentName::Validator,
            Stage::Optimization => AgentName::Optimizer,
        }
    }

    pub fn step_number(self) -> u32 {
        match self {
            Stage::Reconnaissance => 1,
            Stage::Generation => 2,
            Stage::Validation => 3,
            Stage::Optimization => 4,
        }
    }

    pub fn as_str(self) -> &'static str {
        self.agent_name().as_str()
    }
}

/// Optimizer output retained in the checkpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizationSummary {
    pub unique_count: usize,
    pub duplicate_count: usize,
    pub coverage_score: f64,
    pub gaps: Vec<String>,
}

/// Durable per-request snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowCheckpoint {
    pub version: u32,
    /// Last completed stage; None before reconnaissance finished.
    #[serde(default)]
    pub stage: Option<Stage>,
    #[serde(default)]
    pub page_structure: Option<PageStructure>,
    #[serde(default)]
    pub generated: Option<GeneratedBatch>,
    #[serde(default)]
    pub validated: Option<Vec<TestCase>>,
    #[serde(default)]
    pub optimization: Option<OptimizationSummary>,
    #[serde(default)]
    pub retry_count: u32,
}

impl WorkflowCheckpoint {
    pub fn empty() -> Self {
        Self {
            version: CHECKPOINT_VERSION,
            stage: None,
            page_structure: None,
            generated: None,
            validated: None,
            optimization: None,
            retry_count: 0,
        }
    }

    /// Decode a persisted checkpoint, rejecting unknown future formats.
    pub fn decode(payload: &str) -> CopilotResult<Self> {
        let checkpoint: WorkflowCheckpoint = serde_json::from_str(payload)
            .map_err(|e| CopilotError::CheckpointCorrupt(e.to_string()))?;
        if checkpoint.version > CHECKPOINT_VERSION + 1 {
            return Err(CopilotError::CheckpointCorrupt(format!(
                "unsupported checkpoint version {}",
                checkpoint.version
            )));
        }
        Ok(checkpoint)
    }

    pub fn encode(&self) -> CopilotResult<String> {
        serde_json::to_string(self)
            .map_err(|e| CopilotError::CheckpointCorrupt(format!("encode failed: {e}")))
    }
}

/// The orchestrator that owns a request while it runs.
///
/// Retry policies live with the components that retry: the
/// reconnaissance agent carries its driver retry budget and the LLM
/// client its transport backoff.
pub struct WorkflowCoordinator {
    store: Arc<SqliteStore>,
    bus: Arc<ProgressBus>,
    reconnaissance: ReconnaissanceAgent,
    generator: GeneratorAgent,
    validator: ValidatorAgent,
    optimizer: OptimizerAgent,
    timeouts: StageTimeouts,
}

impl WorkflowCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<SqliteStore>,
        bus: Arc<ProgressBus>,
        reconnaissance: ReconnaissanceAgent,
        generator: GeneratorAgent,
        validator: ValidatorAgent,
        optimizer: OptimizerAgent,
        timeouts: StageTimeouts,
    ) -> Self {
        Self {
            store,
            bus,
            reconnaissance,
            generator,
            validator,
            optimizer,
            timeouts,
        }
    }

    /// Start processing a request. Idempotent: terminal requests return
    /// immediately, in-flight requests continue from their checkpoint.
    pub async fn start(&self, request_id: Uuid) -> CopilotResult<()> {
        let request = self.load_request(request_id)?;

        if request.status.is_terminal() {
            info!("Request {request_id} already terminal, nothing to do");
            return Ok(());
        }

        if request.status == RequestStatus::Pending {
            self.store
                .transition_status(request_id, RequestStatus::Reconnaissance)
                .map_err(storage_err)?;
            let request = self.load_request(request_id)?;
            return self.run_pipeline(request, WorkflowCheckpoint::empty()).await;
        }

        // Already past pending: behave like resume.
        self.resume(request_id).await
    }

    /// Continue from the stage after the last persisted checkpoint.
    pub async fn resume(&self, request_id: Uuid) -> CopilotResult<()> {
        let request = self.load_request(request_id)?;

        if request.status.is_terminal() {
            return Ok(());
        }

        let checkpoint = match self.store.load_checkpoint(request_id).map_err(storage_err)? {
            Some(payload) => WorkflowCheckpoint::decode(&payload)?,
            None => WorkflowCheckpoint::empty(),
        };

        info!(
            "Resuming request {request_id} after stage {:?}",
            checkpoint.stage
        );
        self.run_pipeline(request, checkpoint).await
    }

    /// Set the cooperative cancellation flag. The running stage finishes
    /// its active external call and the pipeline lands in `cancelled` at
    /// the next interruption point.
    pub fn cancel(&self, request_id: Uuid) -> CopilotResult<()> {
        let request = self.load_request(request_id)?;
        if request.status.is_terminal() {
            return Ok(());
        }
        self.bus.request_cancel(request_id);
        Ok(())
    }

    fn load_request(&self, request_id: Uuid) -> CopilotResult<Request> {
        self.store
            .get_request(request_id)
            .map_err(storage_err)?
            .ok_or_else(|| CopilotError::NotFound(format!("request {request_id}")))
    }

    async fn run_pipeline(
        &self,
        request: Request,
        mut checkpoint: WorkflowCheckpoint,
    ) -> CopilotResult<()> {
        let request_id = request.id;

        let mut stage = match checkpoint.stage {
            None => Stage::Reconnaissance,
            Some(completed) => match completed.next() {
                Some(next) => next,
                None => return self.complete(&request, &checkpoint).await,
            },
        };

        loop {
            if self.bus.is_cancelled(request_id) {
                return self.cancel_terminal(request_id, stage);
            }

            self.bus.publish(ProgressEvent::new(
                request_id,
                stage.as_str(),
                stage.status(),
                stage.step_number(),
            ));

            let started_at = Utc::now();
            let outcome = match stage {
                Stage::Reconnaissance => self.run_reconnaissance(&request, &mut checkpoint).await,
                Stage::Generation => {
                    self.run_generation(&request, &mut checkpoint, started_at)
                        .await
                }
                Stage::Validation => self.run_validation(&request, &mut checkpoint).await,
                Stage::Optimization => self.run_optimization(&request, &mut checkpoint).await,
            };

            match outcome {
                Ok(()) => {
                    let mut metric = GenerationMetric::new(
                        request_id,
                        stage.agent_name(),
                        stage.step_number(),
                        started_at,
                        MetricStatus::Success,
                    );
                    if stage == Stage::Generation {
                        if let Some(batch) = &checkpoint.generated {
                            metric.model = Some(batch.model.clone());
                            if let Some(usage) = &batch.usage {
                                metric.tokens_input = Some(usage.prompt_tokens);
                                metric.tokens_output = Some(usage.completion_tokens);
                                metric.tokens_total = Some(usage.total_tokens);
                            }
                            metric.agent_metrics.insert(
                                "tests_count".to_string(),
                                serde_json::json!(batch.tests.len()),
                            );
                        }
                    }
                    self.store.append_metric(&metric).map_err(storage_err)?;

                    checkpoint.stage = Some(stage);
                    let next_status = stage
                        .next()
                        .map(|s| s.status())
                        .unwrap_or(RequestStatus::Optimization);
                    self.store
                        .save_checkpoint(
                            request_id,
                            Uuid::new_v4(),
                            &checkpoint.encode()?,
                            next_status,
                        )
                        .map_err(storage_err)?;
                }
                Err(CopilotError::Cancelled) => {
                    return self.cancel_terminal(request_id, stage);
                }
                Err(error) => {
                    let mut metric = GenerationMetric::new(
                        request_id,
                        stage.agent_name(),
                        stage.step_number(),
                        started_at,
                        MetricStatus::Failed,
                    );
                    metric.error_message = Some(error.to_string());
                    self.store.append_metric(&metric).map_err(storage_err)?;
                    return self.fail_terminal(request_id, stage, error);
                }
            }

            match stage.next() {
                Some(next) => stage = next,
                None => return self.complete(&request, &checkpoint).await,
            }
        }
    }

    async fn run_reconnaissance(
        &self,
        request: &Request,
        checkpoint: &mut WorkflowCheckpoint,
    ) -> CopilotResult<()> {
        let deadline = Duration::from_secs(self.timeouts.reconnaissance);
        let page = timeout(deadline, self.reconnaissance.analyze_page(&request.url))
            .await
            .map_err(|_| CopilotError::Transient("reconnaissance deadline expired".into()))??;
        checkpoint.page_structure = Some(page);
        Ok(())
    }

    async fn run_generation(
        &self,
        request: &Request,
        checkpoint: &mut WorkflowCheckpoint,
        stage_started_at: chrono::DateTime<Utc>,
    ) -> CopilotResult<()> {
        let page = checkpoint
            .page_structure
            .as_ref()
            .ok_or_else(|| {
                CopilotError::CheckpointCorrupt("generation without page structure".into())
            })?
            .clone();

        let deadline = Duration::from_secs(self.timeouts.generation);
        let batch = match request.test_type {
            testops_core::models::TestType::Api => {
                let endpoints = crate::generator::openapi::endpoints_from_page(&page);
                timeout(
                    deadline,
                    self.generator
                        .generate_api_tests(&endpoints, &request.requirements),
                )
                .await
            }
            _ => {
                timeout(
                    deadline,
                    self.generator
                        .generate_ui_tests(&request.url, &page, &request.requirements),
                )
                .await
            }
        }
        .map_err(|_| CopilotError::Transient("generation deadline expired".into()))??;

        // Transport retries inside the LLM client surface here as
        // retry metric rows preceding the stage's success row.
        let retries = batch.attempts.saturating_sub(1);
        for _ in 0..retries {
            let mut metric = GenerationMetric::new(
                request.id,
                AgentName::Generator,
                Stage::Generation.step_number(),
                stage_started_at,
                MetricStatus::Retry,
            );
            metric.error_message = Some("transient LLM failure, retried".to_string());
            self.store.append_metric(&metric).map_err(storage_err)?;
        }
        if retries > 0 {
            checkpoint.retry_count += retries;
            self.store
                .set_retry_count(request.id, checkpoint.retry_count)
                .map_err(storage_err)?;
        }

        checkpoint.generated = Some(batch);
        Ok(())
    }

    async fn run_validation(
        &self,
        request: &Request,
        checkpoint: &mut WorkflowCheckpoint,
    ) -> CopilotResult<()> {
        let batch = checkpoint
            .generated
            .as_ref()
            .ok_or_else(|| {
                CopilotError::CheckpointCorrupt("validation without generated tests".into())
            })?
            .clone();

        let per_test = self.timeouts.validation * batch.tests.len().max(1) as u64;
        let deadline = Duration::from_secs(per_test.min(self.timeouts.validation_cap));

        let codes: Vec<String> = batch.tests.iter().map(|t| t.code.clone()).collect();
        let reports = timeout(deadline, self.validator.validate_batch(&codes))
            .await
            .map_err(|_| CopilotError::Transient("validation deadline expired".into()))?;

        let mut tests = Vec::with_capacity(batch.tests.len());
        for (generated, report) in batch.tests.iter().zip(reports.iter()) {
            let mut test = TestCase::new(
                request.id,
                generated.name.clone(),
                generated.code.clone(),
                generated.case_type,
            );
            test.feature = generated.feature.clone();
            test.story = generated.story.clone();
            test.title = generated.title.clone();
            test.severity = generated.severity.clone();
            test.tags = generated.tags.clone();
            test.covered_requirements = generated.covered_requirements.clone();
            test.priority = generated.priority;
            test.validation_status = report.status;
            test.validation_issues = report.issues();
            test.safety_risk_level = report.safety.risk_level;
            test.ast_hash = report.ast_hash.clone();

            // One audit row per Safety Guard sub-layer that fired.
            for finding in &report.safety.findings {
                let entry = SecurityAuditLog {
                    id: Uuid::new_v4(),
                    request_id: request.id,
                    test_id: Some(test.id),
                    security_layer: finding.layer,
                    risk_level: finding.risk_level,
                    issues: finding.issues.clone(),
                    blocked_patterns: finding.blocked_patterns.clone(),
                    action_taken: report.safety.action_taken,
                    details: HashMap::from([(
                        "score".to_string(),
                        serde_json::json!(report.score),
                    )]),
                    created_at: Utc::now(),
                };
                self.store.append_audit(&entry).map_err(storage_err)?;
            }
            if report.safety.action_taken == AuditAction::Blocked {
                warn!(
                    "Safety Guard blocked test '{}' in request {}",
                    test.name, request.id
                );
            }

            tests.push(test);
        }

        checkpoint.validated = Some(tests);
        Ok(())
    }

    async fn run_optimization(
        &self,
        request: &Request,
        checkpoint: &mut WorkflowCheckpoint,
    ) -> CopilotResult<()> {
        let validated = checkpoint
            .validated
            .as_ref()
            .ok_or_else(|| {
                CopilotError::CheckpointCorrupt("optimization without validated tests".into())
            })?
            .clone();

        let (survivors, blocked): (Vec<TestCase>, Vec<TestCase>) = validated
            .into_iter()
            .partition(|t| t.validation_status != ValidationStatus::Failed);

        if survivors.is_empty() {
            return Err(CopilotError::Permanent("no tests survived validation".into()));
        }

        let deadline = Duration::from_secs(self.timeouts.optimization);
        let result = timeout(
            deadline,
            self.optimizer.optimize(survivors, &request.requirements),
        )
        .await
        .map_err(|_| CopilotError::Transient("optimization deadline expired".into()))??;

        if result.unique_count == 0 {
            return Err(CopilotError::Permanent("no tests survived validation".into()));
        }

        self.store
            .replace_coverage(request.id, &result.coverage)
            .map_err(storage_err)?;

        // Blocked tests are persisted for audit only.
        let mut rows = result.tests.clone();
        rows.extend(blocked);
        self.store.insert_test_cases(&rows).map_err(storage_err)?;

        checkpoint.optimization = Some(OptimizationSummary {
            unique_count: result.unique_count,
            duplicate_count: result.duplicate_count,
            coverage_score: result.coverage_score,
            gaps: result.gaps.clone(),
        });
        Ok(())
    }

    async fn complete(
        &self,
        request: &Request,
        checkpoint: &WorkflowCheckpoint,
    ) -> CopilotResult<()> {
        let request_id = request.id;
        self.store
            .transition_status(request_id, RequestStatus::Completed)
            .map_err(storage_err)?;

        let mut summary: HashMap<String, serde_json::Value> = HashMap::new();
        if let Some(batch) = &checkpoint.generated {
            summary.insert("tests_generated".into(), serde_json::json!(batch.tests.len()));
        }
        if let Some(validated) = &checkpoint.validated {
            let survivors = validated
                .iter()
                .filter(|t| t.validation_status != ValidationStatus::Failed)
                .count();
            summary.insert("tests_validated".into(), serde_json::json!(survivors));
        }
        if let Some(optimization) = &checkpoint.optimization {
            summary.insert("tests_unique".into(), serde_json::json!(optimization.unique_count));
            summary.insert(
                "duplicates_found".into(),
                serde_json::json!(optimization.duplicate_count),
            );
            summary.insert(
                "coverage_score".into(),
                serde_json::json!(optimization.coverage_score),
            );
        }
        self.store
            .set_result_summary(request_id, &summary)
            .map_err(storage_err)?;

        self.bus.publish(ProgressEvent::new(
            request_id,
            "completed",
            RequestStatus::Completed,
            Stage::Optimization.step_number() + 1,
        ));
        self.bus.finish(request_id);
        info!("Request {request_id} completed");
        Ok(())
    }

    fn fail_terminal(
        &self,
        request_id: Uuid,
        stage: Stage,
        error: CopilotError,
    ) -> CopilotResult<()> {
        let error_code = match (stage, &error) {
            (Stage::Reconnaissance, CopilotError::Transient(_)) => "recon_timeout",
            (Stage::Generation, CopilotError::Transient(_)) => "llm_unavailable",
            (Stage::Generation, CopilotError::Permanent(_)) => "empty_output",
            (Stage::Optimization, CopilotError::Permanent(_)) => "no_tests",
            _ => "internal",
        };

        self.store
            .mark_failed(request_id, error_code, &error.to_string())
            .map_err(storage_err)?;

        self.bus.publish(ProgressEvent::new(
            request_id,
            stage.as_str(),
            RequestStatus::Failed,
            stage.step_number(),
        ));
        self.bus.finish(request_id);
        warn!("Request {request_id} failed at {}: {error}", stage.as_str());
        Ok(())
    }

    fn cancel_terminal(&self, request_id: Uuid, stage: Stage) -> CopilotResult<()> {
        self.store
            .transition_status(request_id, RequestStatus::Cancelled)
            .map_err(storage_err)?;

        self.bus.publish(ProgressEvent::new(
            request_id,
            stage.as_str(),
            RequestStatus::Cancelled,
            stage.step_number(),
        ));
        self.bus.finish(request_id);
        info!("Request {request_id} cancelled at {}", stage.as_str());
        Ok(())
    }
}

fn storage_err(error: anyhow::Error) -> CopilotError {
    CopilotError::Storage(error.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_order() {
        assert_eq!(Stage::Reconnaissance.next(), Some(Stage::Generation));
        assert_eq!(Stage::Generation.next(), Some(Stage::Validation));
        assert_eq!(Stage::Validation.next(), Some(Stage::Optimization));
        assert_eq!(Stage::Optimization.next(), None);
    }

    #[test]
    fn test_checkpoint_round_trip() {
        let mut checkpoint = WorkflowCheckpoint::empty();
        checkpoint.stage = Some(Stage::Generation);
        checkpoint.retry_count = 2;

        let encoded = checkpoint.encode().unwrap();
        let decoded = WorkflowCheckpoint::decode(&encoded).unwrap();
        assert_eq!(decoded.version, CHECKPOINT_VERSION);
        assert_eq!(decoded.stage, Some(Stage::Generation));
        assert_eq!(decoded.retry_count, 2);
    }

    #[test]
    fn test_checkpoint_decode_rejects_garbage() {
        let err = WorkflowCheckpoint::decode("not json").unwrap_err();
        assert!(matches!(err, CopilotError::CheckpointCorrupt(_)));
    }

    #[test]
    fn test_checkpoint_next_version_readable() {
        // A V+1 writer may add fields this version does not know about.
        let payload = format!(
            r#"{{"version":{},"stage":"validation","retry_count":1,"future_field":[1,2,3]}}"#,
            CHECKPOINT_VERSION + 1
        );
        let decoded = WorkflowCheckpoint::decode(&payload).unwrap();
        assert_eq!(decoded.stage, Some(Stage::Validation));
    }

    #[test]
    fn test_checkpoint_far_future_version_rejected() {
        let payload = format!(r#"{{"version":{}}}"#, CHECKPOINT_VERSION + 2);
        let err = WorkflowCheckpoint::decode(&payload).unwrap_err();
        assert!(matches!(err, CopilotError::CheckpointCorrupt(_)));
    }

    #[test]
    fn test_checkpoint_missing_optional_fields_default() {
        let payload = format!(r#"{{"version":{CHECKPOINT_VERSION}}}"#);
        let decoded = WorkflowCheckpoint::decode(&payload).unwrap();
        assert!(decoded.stage.is_none());
        assert!(decoded.page_structure.is_none());
        assert_eq!(decoded.retry_count, 0);
    }
}
