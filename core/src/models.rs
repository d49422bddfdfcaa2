//! Domain model for the generation pipeline
//!
//! These are the persisted entities: one `Request` per submission, the
//! `TestCase` rows it owns, append-only `GenerationMetric` and
//! `SecurityAuditLog` records, and per-requirement `CoverageAnalysis`
//! rows written by the optimizer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Lifecycle states of a generation request.
///
/// Transitions only move forward through the pipeline order; any
/// non-terminal state may additionally jump to `Failed` or `Cancelled`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Pending,
    Reconnaissance,
    Generation,
    Validation,
    Optimization,
    Completed,
    Failed,
    Cancelled,
}

impl RequestStatus {
    /// Position in the forward pipeline order.
    fn rank(self) -> u8 {
        match self {
            RequestStatus::Pending => 0,
            RequestStatus::Reconnaissance => 1,
            RequestStatus::Generation => 2,
            RequestStatus::Validation => 3,
            RequestStatus::Optimization => 4,
            RequestStatus::Completed => 5,
            RequestStatus::Failed => 6,
            RequestStatus::Cancelled => 7,
        }
    }

    /// Terminal states accept no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RequestStatus::Completed | RequestStatus::Failed | RequestStatus::Cancelled
        )
    }

    /// Whether moving from `self` to `next` is a legal transition.
    pub fn can_transition_to(self, next: RequestStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        match next {
            RequestStatus::Failed | RequestStatus::Cancelled => true,
            RequestStatus::Pending => false,
            _ => next.rank() > self.rank(),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RequestStatus::Pending => "pending",
            RequestStatus::Reconnaissance => "reconnaissance",
            RequestStatus::Generation => "generation",
            RequestStatus::Validation => "validation",
            RequestStatus::Optimization => "optimization",
            RequestStatus::Completed => "completed",
            RequestStatus::Failed => "failed",
            RequestStatus::Cancelled => "cancelled",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(RequestStatus::Pending),
            "reconnaissance" => Some(RequestStatus::Reconnaissance),
            "generation" => Some(RequestStatus::Generation),
            "validation" => Some(RequestStatus::Validation),
            "optimization" => Some(RequestStatus::Optimization),
            "completed" => Some(RequestStatus::Completed),
            "failed" => Some(RequestStatus::Failed),
            "cancelled" => Some(RequestStatus::Cancelled),
            _ => None,
        }
    }
}

/// Kind of test suite the client asked for.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TestType {
    Ui,
    Api,
    Manual,
    Automated,
    Both,
}

impl TestType {
    pub fn as_str(self) -> &'static str {
        match self {
            TestType::Ui => "ui",
            TestType::Api => "api",
            TestType::Manual => "manual",
            TestType::Automated => "automated",
            TestType::Both => "both",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "ui" => Some(TestType::Ui),
            "api" => Some(TestType::Api),
            "manual" => Some(TestType::Manual),
            "automated" => Some(TestType::Automated),
            "both" => Some(TestType::Both),
            _ => None,
        }
    }
}

/// Kind of an individual generated test case.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CaseType {
    Manual,
    Automated,
}

impl CaseType {
    pub fn as_str(self) -> &'static str {
        match self {
            CaseType::Manual => "manual",
            CaseType::Automated => "automated",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "manual" => Some(CaseType::Manual),
            "automated" => Some(CaseType::Automated),
            _ => None,
        }
    }
}

/// Outcome of the validator for one test.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ValidationStatus {
    Passed,
    Warning,
    Failed,
}

impl ValidationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ValidationStatus::Passed => "passed",
            ValidationStatus::Warning => "warning",
            ValidationStatus::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "passed" => Some(ValidationStatus::Passed),
            "warning" => Some(ValidationStatus::Warning),
            "failed" => Some(ValidationStatus::Failed),
            _ => None,
        }
    }
}

/// Safety Guard risk classification, ordered from harmless to blocking.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub enum RiskLevel {
    #[serde(rename = "SAFE")]
    Safe,
    #[serde(rename = "LOW")]
    Low,
    #[serde(rename = "MEDIUM")]
    Medium,
    #[serde(rename = "HIGH")]
    High,
    #[serde(rename = "CRITICAL")]
    Critical,
}

impl RiskLevel {
    /// HIGH and CRITICAL block a test outright.
    pub fn is_blocking(self) -> bool {
        self >= RiskLevel::High
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RiskLevel::Safe => "SAFE",
            RiskLevel::Low => "LOW",
            RiskLevel::Medium => "MEDIUM",
            RiskLevel::High => "HIGH",
            RiskLevel::Critical => "CRITICAL",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "SAFE" => Some(RiskLevel::Safe),
            "LOW" => Some(RiskLevel::Low),
            "MEDIUM" => Some(RiskLevel::Medium),
            "HIGH" => Some(RiskLevel::High),
            "CRITICAL" => Some(RiskLevel::Critical),
            _ => None,
        }
    }
}

/// Which Safety Guard sub-layer produced a finding.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SecurityLayer {
    Static,
    Ast,
    Behavioral,
    Sandbox,
}

impl SecurityLayer {
    pub fn as_str(self) -> &'static str {
        match self {
            SecurityLayer::Static => "static",
            SecurityLayer::Ast => "ast",
            SecurityLayer::Behavioral => "behavioral",
            SecurityLayer::Sandbox => "sandbox",
        }
    }
}

/// Disposition the Safety Guard recorded for a test.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    Allowed,
    Blocked,
    Warning,
    Regenerate,
}

impl AuditAction {
    pub fn as_str(self) -> &'static str {
        match self {
            AuditAction::Allowed => "allowed",
            AuditAction::Blocked => "blocked",
            AuditAction::Warning => "warning",
            AuditAction::Regenerate => "regenerate",
        }
    }
}

/// Pipeline stage that produced a metric row.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AgentName {
    Reconnaissance,
    Generator,
    Validator,
    Optimizer,
}

impl AgentName {
    pub fn as_str(self) -> &'static str {
        match self {
            AgentName::Reconnaissance => "reconnaissance",
            AgentName::Generator => "generator",
            AgentName::Validator => "validator",
            AgentName::Optimizer => "optimizer",
        }
    }
}

/// Outcome of one stage attempt.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MetricStatus {
    Success,
    Failed,
    Retry,
}

impl MetricStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            MetricStatus::Success => "success",
            MetricStatus::Failed => "failed",
            MetricStatus::Retry => "retry",
        }
    }
}

/// One generation job, created at ingest and driven by the coordinator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    /// Unique identifier
    pub id: Uuid,
    /// Optional owner reference (no authorization semantics attached)
    pub owner: Option<Uuid>,
    /// Target URL (or OpenAPI document URL for API requests)
    pub url: String,
    /// Ordered natural-language requirements
    pub requirements: Vec<String>,
    /// Requested test kind
    pub test_type: TestType,
    /// Current lifecycle state
    pub status: RequestStatus,
    /// Free-form summary written at completion
    pub result_summary: HashMap<String, serde_json::Value>,
    /// Human-readable failure message
    pub error_message: Option<String>,
    /// Stable machine-readable failure code
    pub error_code: Option<String>,
    /// Stage retries consumed so far
    pub retry_count: u32,
    /// Retry ceiling
    pub max_retries: u32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_seconds: Option<f64>,
    /// Checkpoint reference, present once the first stage completed
    pub workflow_checkpoint_id: Option<Uuid>,
}

impl Request {
    /// New pending request with default retry limits.
    pub fn new(url: String, requirements: Vec<String>, test_type: TestType) -> Self {
        Self {
            id: Uuid::new_v4(),
            owner: None,
            url,
            requirements,
            test_type,
            status: RequestStatus::Pending,
            result_summary: HashMap::new(),
            error_message: None,
            error_code: None,
            retry_count: 0,
            max_retries: 3,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            duration_seconds: None,
            workflow_checkpoint_id: None,
        }
    }
}

/// One generated test artifact owned by a request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestCase {
    pub id: Uuid,
    pub request_id: Uuid,
    pub name: String,
    /// Full test source, never mutated after generation
    pub code: String,
    pub test_type: CaseType,
    /// Allure metadata extracted from the source
    pub feature: Option<String>,
    pub story: Option<String>,
    pub title: Option<String>,
    pub severity: Option<String>,
    pub tags: Vec<String>,
    /// SHA-256 of the canonicalized source
    pub code_hash: String,
    /// Hash of the parse tree with comments and whitespace removed
    pub ast_hash: Option<String>,
    /// Fixed-dimension embedding used for semantic dedup
    pub semantic_embedding: Option<Vec<f32>>,
    /// Indices into the owning request's requirements
    pub covered_requirements: Vec<usize>,
    /// 1 (lowest) to 10 (highest)
    pub priority: u8,
    pub validation_status: ValidationStatus,
    pub validation_issues: Vec<String>,
    pub safety_risk_level: RiskLevel,
    pub is_duplicate: bool,
    /// Canonical test this one duplicates, always a non-duplicate
    pub duplicate_of: Option<Uuid>,
    pub similarity_score: Option<f32>,
    pub created_at: DateTime<Utc>,
}

impl TestCase {
    pub fn new(request_id: Uuid, name: String, code: String, test_type: CaseType) -> Self {
        Self {
            id: Uuid::new_v4(),
            request_id,
            name,
            code,
            test_type,
            feature: None,
            story: None,
            title: None,
            severity: None,
            tags: Vec::new(),
            code_hash: String::new(),
            ast_hash: None,
            semantic_embedding: None,
            covered_requirements: Vec::new(),
            priority: 5,
            validation_status: ValidationStatus::Warning,
            validation_issues: Vec::new(),
            safety_risk_level: RiskLevel::Safe,
            is_duplicate: false,
            duplicate_of: None,
            similarity_score: None,
            created_at: Utc::now(),
        }
    }
}

/// Append-only record of one stage execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationMetric {
    pub id: Uuid,
    pub request_id: Uuid,
    pub agent_name: AgentName,
    pub step_number: u32,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub model: Option<String>,
    pub tokens_input: Option<u64>,
    pub tokens_output: Option<u64>,
    pub tokens_total: Option<u64>,
    pub cost_usd: Option<f64>,
    pub status: MetricStatus,
    pub error_message: Option<String>,
    pub agent_metrics: HashMap<String, serde_json::Value>,
}

impl GenerationMetric {
    pub fn new(
        request_id: Uuid,
        agent_name: AgentName,
        step_number: u32,
        started_at: DateTime<Utc>,
        status: MetricStatus,
    ) -> Self {
        let completed_at = Utc::now();
        let duration_ms = (completed_at - started_at).num_milliseconds().max(0) as u64;
        Self {
            id: Uuid::new_v4(),
            request_id,
            agent_name,
            step_number,
            started_at,
            completed_at,
            duration_ms,
            model: None,
            tokens_input: None,
            tokens_output: None,
            tokens_total: None,
            cost_usd: None,
            status,
            error_message: None,
            agent_metrics: HashMap::new(),
        }
    }
}

/// One (request, requirement) coverage row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoverageAnalysis {
    pub id: Uuid,
    pub request_id: Uuid,
    pub requirement_text: String,
    pub requirement_index: usize,
    pub is_covered: bool,
    pub covering_tests: Vec<Uuid>,
    pub coverage_count: usize,
    pub coverage_score: f64,
    pub has_gap: bool,
    pub gap_description: Option<String>,
}

/// One Safety Guard decision, append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityAuditLog {
    pub id: Uuid,
    pub request_id: Uuid,
    pub test_id: Option<Uuid>,
    pub security_layer: SecurityLayer,
    pub risk_level: RiskLevel,
    pub issues: Vec<String>,
    pub blocked_patterns: Vec<String>,
    pub action_taken: AuditAction,
    pub details: HashMap<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_forward_path() {
        use RequestStatus::*;
        assert!(Pending.can_transition_to(Reconnaissance));
        assert!(Reconnaissance.can_transition_to(Generation));
        assert!(Generation.can_transition_to(Validation));
        assert!(Validation.can_transition_to(Optimization));
        assert!(Optimization.can_transition_to(Completed));
    }

    #[test]
    fn test_status_no_backward_jumps() {
        use RequestStatus::*;
        assert!(!Generation.can_transition_to(Reconnaissance));
        assert!(!Validation.can_transition_to(Generation));
        assert!(!Optimization.can_transition_to(Pending));
    }

    #[test]
    fn test_status_failure_jumps_from_any_non_terminal() {
        use RequestStatus::*;
        for state in [Pending, Reconnaissance, Generation, Validation, Optimization] {
            assert!(state.can_transition_to(Failed));
            assert!(state.can_transition_to(Cancelled));
        }
    }

    #[test]
    fn test_terminal_states_are_frozen() {
        use RequestStatus::*;
        for state in [Completed, Failed, Cancelled] {
            assert!(state.is_terminal());
            assert!(!state.can_transition_to(Failed));
            assert!(!state.can_transition_to(Completed));
        }
    }

    #[test]
    fn test_risk_level_ordering() {
        assert!(RiskLevel::Critical > RiskLevel::High);
        assert!(RiskLevel::High > RiskLevel::Medium);
        assert!(RiskLevel::Medium > RiskLevel::Low);
        assert!(RiskLevel::Low > RiskLevel::Safe);
        assert!(RiskLevel::High.is_blocking());
        assert!(RiskLevel::Critical.is_blocking());
        assert!(!RiskLevel::Medium.is_blocking());
    }

    #[test]
    fn test_status_string_round_trip() {
        for status in [
            RequestStatus::Pending,
            RequestStatus::Reconnaissance,
            RequestStatus::Generation,
            RequestStatus::Validation,
            RequestStatus::Optimization,
            RequestStatus::Completed,
            RequestStatus::Failed,
            RequestStatus::Cancelled,
        ] {
            assert_eq!(RequestStatus::from_str(status.as_str()), Some(status));
        }
    }

    #[test]
    fn test_new_request_defaults() {
        let request = Request::new(
            "https://example.com".to_string(),
            vec!["login works".to_string()],
            TestType::Ui,
        );
        assert_eq!(request.status, RequestStatus::Pending);
        assert_eq!(request.max_retries, 3);
        assert_eq!(request.retry_count, 0);
        assert!(request.started_at.is_none());
    }
}
