//! API Server Module
//!
//! Router construction and server startup for the HTTP surface.

use anyhow::Result;
use axum::{
    routing::{get, post},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;

use testops_agents::{OptimizerAgent, ValidatorAgent};
use testops_databases::{JobQueue, ProgressBus, SqliteStore};

use crate::handlers::{
    cancel_task, export_tests, generate_api_tests, generate_test_cases, get_task, health_check,
    list_tests, optimize_tests, resume_task, stream_task, validate_tests, ApiState,
};

/// Main API server.
pub struct ApiServer {
    host: String,
    port: u16,
    state: Arc<ApiState>,
}

impl ApiServer {
    pub fn new(
        host: String,
        port: u16,
        store: Arc<SqliteStore>,
        bus: Arc<ProgressBus>,
        queue: Arc<JobQueue>,
        validator: Arc<ValidatorAgent>,
        optimizer: Arc<OptimizerAgent>,
    ) -> Self {
        let state = Arc::new(ApiState {
            store,
            bus,
            queue,
            validator,
            optimizer,
        });
        Self { host, port, state }
    }

    /// Build the application router.
    pub fn router(&self) -> Router {
        Router::new()
            // Ingest
            .route("/generate/test-cases", post(generate_test_cases))
            .route("/generate/api-tests", post(generate_api_tests))
            // Task lifecycle
            .route("/tasks/:id", get(get_task))
            .route("/tasks/:id/stream", get(stream_task))
            .route("/tasks/:id/resume", post(resume_task))
            .route("/tasks/:id/cancel", post(cancel_task))
            // Direct agent access
            .route("/validate/tests", post(validate_tests))
            .route("/optimize/tests", post(optimize_tests))
            // Test queries and export
            .route("/tests", get(list_tests))
            .route("/tests/export", get(export_tests))
            // Health check
            .route("/health", get(health_check))
            .with_state(self.state.clone())
    }

    /// Start serving.
    pub async fn start(&self) -> Result<()> {
        let app = self.router();
        let addr: SocketAddr = format!("{}:{}", self.host, self.port)
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid bind address: {e}"))?;

        info!("TestOps Copilot API listening on {addr}");
        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, app)
            .await
            .map_err(|e| anyhow::anyhow!("API server failed: {e}"))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use testops_core::llm::{FakeTransport, LlmClient, LlmSettings};

    #[tokio::test]
    async fn test_router_builds_with_all_routes() {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        store.initialize_schema().unwrap();
        let llm = Arc::new(LlmClient::new(
            LlmSettings::default(),
            Arc::new(FakeTransport::new()),
        ));

        let server = ApiServer::new(
            "127.0.0.1".to_string(),
            0,
            store,
            Arc::new(ProgressBus::new()),
            Arc::new(JobQueue::new()),
            Arc::new(ValidatorAgent::new(8)),
            Arc::new(OptimizerAgent::new(llm, 0.85, 8)),
        );

        // Router construction panics on route conflicts; building it is
        // the smoke test.
        let _router = server.router();
    }
}
