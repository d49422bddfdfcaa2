//! Request and response envelopes for the HTTP surface

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use testops_core::models::{GenerationMetric, Request, TestCase};

/// Body of `POST /generate/test-cases`.
#[derive(Debug, Deserialize)]
pub struct GenerateTestsRequest {
    pub url: String,
    pub requirements: Vec<String>,
    pub test_type: String,
    #[serde(default)]
    pub options: Option<serde_json::Value>,
}

/// Body of `POST /generate/api-tests`.
#[derive(Debug, Deserialize)]
pub struct GenerateApiTestsRequest {
    pub openapi_url: String,
    #[serde(default)]
    pub endpoints: Vec<String>,
    #[serde(default)]
    pub requirements: Vec<String>,
}

/// 202 envelope returned by both generate routes.
#[derive(Debug, Serialize)]
pub struct GenerateAccepted {
    pub request_id: Uuid,
    pub task_id: Uuid,
    pub status: String,
    pub stream_url: String,
}

/// Aggregate over a request's metric rows.
#[derive(Debug, Serialize, Default)]
pub struct MetricsSummary {
    pub steps: usize,
    pub retries: usize,
    pub failures: usize,
    pub total_duration_ms: u64,
    pub total_tokens: u64,
}

impl MetricsSummary {
    pub fn from_metrics(metrics: &[GenerationMetric]) -> Self {
        use testops_core::models::MetricStatus;
        let mut summary = MetricsSummary::default();
        for metric in metrics {
            summary.steps += 1;
            match metric.status {
                MetricStatus::Retry => summary.retries += 1,
                MetricStatus::Failed => summary.failures += 1,
                MetricStatus::Success => {}
            }
            summary.total_duration_ms += metric.duration_ms;
            summary.total_tokens += metric.tokens_total.unwrap_or(0);
        }
        summary
    }
}

/// Response of `GET /tasks/{id}`.
#[derive(Debug, Serialize)]
pub struct TaskStatusResponse {
    pub request: Request,
    pub metrics: MetricsSummary,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tests: Option<Vec<TestCase>>,
}

/// Body of `POST /validate/tests`.
#[derive(Debug, Deserialize)]
pub struct ValidateTestsRequest {
    pub test_code: String,
    #[serde(default = "default_validation_level")]
    pub validation_level: String,
}

fn default_validation_level() -> String {
    "full".to_string()
}

/// One test handed to `POST /optimize/tests`.
#[derive(Debug, Deserialize)]
pub struct OptimizeTestInput {
    #[serde(default)]
    pub name: Option<String>,
    pub code: String,
}

/// Body of `POST /optimize/tests`.
#[derive(Debug, Deserialize)]
pub struct OptimizeTestsRequest {
    pub tests: Vec<OptimizeTestInput>,
    #[serde(default)]
    pub requirements: Vec<String>,
}

/// Query parameters of `GET /tests`.
#[derive(Debug, Deserialize)]
pub struct TestsQuery {
    #[serde(default)]
    pub search: Option<String>,
    #[serde(default)]
    pub test_type: Option<String>,
    #[serde(default = "default_page")]
    pub page: usize,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
}

fn default_page() -> usize {
    1
}

fn default_page_size() -> usize {
    20
}

/// Query parameters of `GET /tests/export`.
#[derive(Debug, Deserialize)]
pub struct ExportQuery {
    #[serde(default = "default_export_format")]
    pub format: String,
    pub request_id: Uuid,
}

fn default_export_format() -> String {
    "json".to_string()
}

/// Query parameters of `GET /tasks/{id}`.
#[derive(Debug, Deserialize)]
pub struct TaskQuery {
    #[serde(default)]
    pub include_tests: bool,
}
