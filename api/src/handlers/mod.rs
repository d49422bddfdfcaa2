//! API Handlers Module
//!
//! Request handlers for the HTTP surface: ingest, task status and
//! progress streaming, direct validation/optimization, test queries and
//! bundle export.

use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::sse::{Event, KeepAlive, Sse},
    response::Json,
};
use futures::stream::{self, Stream, StreamExt};
use serde_json::{json, Value};
use std::convert::Infallible;
use std::io::Write;
use std::sync::Arc;
use uuid::Uuid;

use testops_agents::{OptimizerAgent, ValidationLevel, ValidatorAgent};
use testops_core::models::{CaseType, Request, TestCase, TestType, ValidationStatus};
use testops_databases::{JobQueue, ProgressBus, SqliteStore};

use crate::models::{
    ExportQuery, GenerateAccepted, GenerateApiTestsRequest, GenerateTestsRequest, MetricsSummary,
    OptimizeTestsRequest, TaskQuery, TaskStatusResponse, TestsQuery, ValidateTestsRequest,
};

/// Shared state of the API server.
pub struct ApiState {
    pub store: Arc<SqliteStore>,
    pub bus: Arc<ProgressBus>,
    pub queue: Arc<JobQueue>,
    pub validator: Arc<ValidatorAgent>,
    pub optimizer: Arc<OptimizerAgent>,
}

/// Health check endpoint.
pub async fn health_check() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "service": "testops-copilot-api",
    }))
}

/// Accept a UI test-generation request.
pub async fn generate_test_cases(
    State(state): State<Arc<ApiState>>,
    Json(body): Json<GenerateTestsRequest>,
) -> Result<(StatusCode, Json<GenerateAccepted>), StatusCode> {
    if body.url.trim().is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }
    let test_type = TestType::from_str(&body.test_type).ok_or(StatusCode::BAD_REQUEST)?;

    let request = Request::new(body.url, body.requirements, test_type);
    accept_request(&state, request).await
}

/// Accept an API test-generation request against an OpenAPI document.
pub async fn generate_api_tests(
    State(state): State<Arc<ApiState>>,
    Json(body): Json<GenerateApiTestsRequest>,
) -> Result<(StatusCode, Json<GenerateAccepted>), StatusCode> {
    if body.openapi_url.trim().is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }

    let request = Request::new(body.openapi_url, body.requirements, TestType::Api);
    accept_request(&state, request).await
}

async fn accept_request(
    state: &ApiState,
    request: Request,
) -> Result<(StatusCode, Json<GenerateAccepted>), StatusCode> {
    tracing::debug!("Accepting generation request {}", request.id);

    if let Err(e) = state.store.insert_request(&request) {
        tracing::error!("Failed to persist request: {e}");
        return Err(StatusCode::INTERNAL_SERVER_ERROR);
    }
    if let Err(e) = state.queue.enqueue(request.id) {
        tracing::error!("Failed to enqueue request: {e}");
        return Err(StatusCode::INTERNAL_SERVER_ERROR);
    }

    Ok((
        StatusCode::ACCEPTED,
        Json(GenerateAccepted {
            request_id: request.id,
            task_id: request.id,
            status: request.status.as_str().to_string(),
            stream_url: format!("/tasks/{}/stream", request.id),
        }),
    ))
}

/// Current status of a task, with a metrics summary and optionally its
/// tests.
pub async fn get_task(
    State(state): State<Arc<ApiState>>,
    Path(task_id): Path<String>,
    Query(query): Query<TaskQuery>,
) -> Result<Json<TaskStatusResponse>, StatusCode> {
    let request_id = parse_uuid(&task_id)?;

    let request = match state.store.get_request(request_id) {
        Ok(Some(request)) => request,
        Ok(None) => return Err(StatusCode::NOT_FOUND),
        Err(e) => {
            tracing::error!("Failed to load request: {e}");
            return Err(StatusCode::INTERNAL_SERVER_ERROR);
        }
    };

    let metrics = state
        .store
        .metrics_for_request(request_id)
        .map_err(|e| {
            tracing::error!("Failed to load metrics: {e}");
            StatusCode::INTERNAL_SERVER_ERROR
        })?;

    let tests = if query.include_tests {
        Some(state.store.tests_for_request(request_id).map_err(|e| {
            tracing::error!("Failed to load tests: {e}");
            StatusCode::INTERNAL_SERVER_ERROR
        })?)
    } else {
        None
    };

    Ok(Json(TaskStatusResponse {
        request,
        metrics: MetricsSummary::from_metrics(&metrics),
        tests,
    }))
}

/// Server-Sent-Events stream of a task's progress.
pub async fn stream_task(
    State(state): State<Arc<ApiState>>,
    Path(task_id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, StatusCode> {
    let request_id = parse_uuid(&task_id)?;

    match state.store.get_request(request_id) {
        Ok(Some(_)) => {}
        Ok(None) => return Err(StatusCode::NOT_FOUND),
        Err(e) => {
            tracing::error!("Failed to load request: {e}");
            return Err(StatusCode::INTERNAL_SERVER_ERROR);
        }
    }

    let (snapshot, receiver) = state.bus.subscribe(request_id);

    // Current status first, then live events in publish order.
    let initial = stream::iter(
        snapshot
            .into_iter()
            .map(|event| Ok::<_, Infallible>(progress_sse_event(&event))),
    );
    let live = stream::unfold(receiver, |mut receiver| async move {
        loop {
            match receiver.recv().await {
                Ok(event) => {
                    return Some((Ok::<_, Infallible>(progress_sse_event(&event)), receiver))
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!("SSE subscriber lagged, skipped {skipped} events");
                    continue;
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return None,
            }
        }
    });

    Ok(Sse::new(initial.chain(live)).keep_alive(KeepAlive::default()))
}

fn progress_sse_event(event: &testops_databases::ProgressEvent) -> Event {
    Event::default().data(serde_json::to_string(event).unwrap_or_default())
}

/// Re-enqueue a task so a worker resumes it from its checkpoint.
pub async fn resume_task(
    State(state): State<Arc<ApiState>>,
    Path(task_id): Path<String>,
) -> Result<(StatusCode, Json<Value>), StatusCode> {
    let request_id = parse_uuid(&task_id)?;

    let request = match state.store.get_request(request_id) {
        Ok(Some(request)) => request,
        Ok(None) => return Err(StatusCode::NOT_FOUND),
        Err(e) => {
            tracing::error!("Failed to load request: {e}");
            return Err(StatusCode::INTERNAL_SERVER_ERROR);
        }
    };

    if request.status.is_terminal() {
        return Ok((
            StatusCode::OK,
            Json(json!({"request_id": request_id, "status": request.status.as_str()})),
        ));
    }

    if let Err(e) = state.queue.enqueue(request_id) {
        tracing::error!("Failed to enqueue resume: {e}");
        return Err(StatusCode::INTERNAL_SERVER_ERROR);
    }

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({"request_id": request_id, "status": "resuming"})),
    ))
}

/// Set the cooperative cancellation flag for a task.
pub async fn cancel_task(
    State(state): State<Arc<ApiState>>,
    Path(task_id): Path<String>,
) -> Result<(StatusCode, Json<Value>), StatusCode> {
    let request_id = parse_uuid(&task_id)?;

    let request = match state.store.get_request(request_id) {
        Ok(Some(request)) => request,
        Ok(None) => return Err(StatusCode::NOT_FOUND),
        Err(e) => {
            tracing::error!("Failed to load request: {e}");
            return Err(StatusCode::INTERNAL_SERVER_ERROR);
        }
    };

    if request.status.is_terminal() {
        return Ok((
            StatusCode::OK,
            Json(json!({"request_id": request_id, "status": request.status.as_str()})),
        ));
    }

    state.bus.request_cancel(request_id);
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({"request_id": request_id, "status": "cancelling"})),
    ))
}

/// Validate a single test source directly.
pub async fn validate_tests(
    State(state): State<Arc<ApiState>>,
    Json(body): Json<ValidateTestsRequest>,
) -> Result<Json<Value>, StatusCode> {
    let level =
        ValidationLevel::from_str(&body.validation_level).ok_or(StatusCode::BAD_REQUEST)?;

    let report = state.validator.validate(&body.test_code, level);
    serde_json::to_value(&report)
        .map(Json)
        .map_err(|e| {
            tracing::error!("Failed to serialize validation report: {e}");
            StatusCode::INTERNAL_SERVER_ERROR
        })
}

/// Run the optimizer over caller-provided tests.
pub async fn optimize_tests(
    State(state): State<Arc<ApiState>>,
    Json(body): Json<OptimizeTestsRequest>,
) -> Result<Json<Value>, StatusCode> {
    if body.tests.is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }

    let request_id = Uuid::new_v4();
    let tests: Vec<TestCase> = body
        .tests
        .into_iter()
        .enumerate()
        .map(|(index, input)| {
            TestCase::new(
                request_id,
                input.name.unwrap_or_else(|| format!("test_{index}")),
                input.code,
                CaseType::Automated,
            )
        })
        .collect();

    match state.optimizer.optimize(tests, &body.requirements).await {
        Ok(result) => Ok(Json(json!({
            "optimized_tests": result.unique_tests(),
            "duplicates_found": result.duplicate_count,
            "coverage_score": result.coverage_score,
            "coverage": result.coverage,
            "gaps": result.gaps,
        }))),
        Err(e) => {
            tracing::error!("Optimizer failed: {e}");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

/// Paged test query.
pub async fn list_tests(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<TestsQuery>,
) -> Result<Json<Value>, StatusCode> {
    let test_type = match &query.test_type {
        Some(raw) => Some(CaseType::from_str(raw).ok_or(StatusCode::BAD_REQUEST)?),
        None => None,
    };

    let page = state
        .store
        .search_tests(
            query.search.as_deref(),
            test_type,
            query.page,
            query.page_size.clamp(1, 100),
        )
        .map_err(|e| {
            tracing::error!("Test search failed: {e}");
            StatusCode::INTERNAL_SERVER_ERROR
        })?;

    Ok(Json(json!({
        "items": page.items,
        "total": page.total,
        "page": page.page,
        "page_size": page.page_size,
    })))
}

/// Bundle download. Failed and duplicate tests never appear in bundles.
pub async fn export_tests(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<ExportQuery>,
) -> Result<(HeaderMap, Vec<u8>), StatusCode> {
    let tests = state
        .store
        .tests_for_request(query.request_id)
        .map_err(|e| {
            tracing::error!("Failed to load tests for export: {e}");
            StatusCode::INTERNAL_SERVER_ERROR
        })?;

    let exportable: Vec<&TestCase> = tests
        .iter()
        .filter(|t| t.validation_status != ValidationStatus::Failed && !t.is_duplicate)
        .collect();

    let coverage = state
        .store
        .coverage_for_request(query.request_id)
        .map_err(|e| {
            tracing::error!("Failed to load coverage for export: {e}");
            StatusCode::INTERNAL_SERVER_ERROR
        })?;

    let bundle = json!({
        "request_id": query.request_id,
        "tests": exportable,
        "coverage": coverage,
    });

    let mut headers = HeaderMap::new();
    match query.format.as_str() {
        "json" => {
            headers.insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static("application/json"),
            );
            let body = serde_json::to_vec_pretty(&bundle).map_err(|e| {
                tracing::error!("JSON export failed: {e}");
                StatusCode::INTERNAL_SERVER_ERROR
            })?;
            Ok((headers, body))
        }
        "yaml" => {
            headers.insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static("application/yaml"),
            );
            let body = serde_yaml::to_string(&bundle).map_err(|e| {
                tracing::error!("YAML export failed: {e}");
                StatusCode::INTERNAL_SERVER_ERROR
            })?;
            Ok((headers, body.into_bytes()))
        }
        "zip" => {
            headers.insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static("application/zip"),
            );
            headers.insert(
                header::CONTENT_DISPOSITION,
                HeaderValue::from_static("attachment; filename=\"tests.zip\""),
            );
            let body = build_zip_bundle(&exportable, &bundle).map_err(|e| {
                tracing::error!("ZIP export failed: {e}");
                StatusCode::INTERNAL_SERVER_ERROR
            })?;
            Ok((headers, body))
        }
        _ => Err(StatusCode::BAD_REQUEST),
    }
}

/// One .py file per test plus the full bundle manifest.
fn build_zip_bundle(tests: &[&TestCase], bundle: &Value) -> anyhow::Result<Vec<u8>> {
    let mut cursor = std::io::Cursor::new(Vec::new());
    {
        let mut writer = zip::ZipWriter::new(&mut cursor);
        let options = zip::write::FileOptions::default()
            .compression_method(zip::CompressionMethod::Deflated);

        for (index, test) in tests.iter().enumerate() {
            let file_name = format!("{:03}_{}.py", index, sanitize_file_name(&test.name));
            writer.start_file(file_name, options)?;
            writer.write_all(test.code.as_bytes())?;
        }

        writer.start_file("bundle.json", options)?;
        writer.write_all(serde_json::to_vec_pretty(bundle)?.as_slice())?;
        writer.finish()?;
    }
    Ok(cursor.into_inner())
}

fn sanitize_file_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

fn parse_uuid(raw: &str) -> Result<Uuid, StatusCode> {
    Uuid::parse_str(raw).map_err(|_| StatusCode::BAD_REQUEST)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_file_name() {
        assert_eq!(sanitize_file_name("test_login"), "test_login");
        assert_eq!(sanitize_file_name("weird name/../x"), "weird_name____x");
    }

    #[test]
    fn test_parse_uuid_rejects_garbage() {
        assert!(parse_uuid("not-a-uuid").is_err());
        assert!(parse_uuid(&Uuid::new_v4().to_string()).is_ok());
    }

    #[test]
    fn test_zip_bundle_contains_all_tests() {
        let request_id = Uuid::new_v4();
        let a = TestCase::new(
            request_id,
            "test_a".to_string(),
            "def test_a(): pass".to_string(),
            CaseType::Automated,
        );
        let b = TestCase::new(
            request_id,
            "test_b".to_string(),
            "def test_b(): pass".to_string(),
            CaseType::Automated,
        );
        let refs: Vec<&TestCase> = vec![&a, &b];
        let bundle = json!({"tests": 2});

        let bytes = build_zip_bundle(&refs, &bundle).unwrap();
        let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes)).unwrap();
        assert_eq!(archive.len(), 3);
        assert!(archive.by_name("000_test_a.py").is_ok());
        assert!(archive.by_name("001_test_b.py").is_ok());
        assert!(archive.by_name("bundle.json").is_ok());
    }
}
