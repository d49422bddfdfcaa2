//! TestOps Copilot
//!
//! AI-assisted test-case generation service: a four-stage pipeline
//! (reconnaissance, generation, validation, optimization) driven by a
//! checkpointing coordinator, fed through an HTTP surface, persisted in
//! SQLite and streamed back over SSE.

pub mod driver;
pub mod worker;

use std::sync::Arc;
use std::time::Duration;

use testops_agents::{
    GeneratorAgent, OptimizerAgent, PageDriver, ReconnaissanceAgent, ValidatorAgent,
    WorkflowCoordinator,
};
use testops_core::config::AppConfig;
use testops_core::llm::{LlmClient, LlmSettings};
use testops_databases::{ProgressBus, SqliteStore};

/// Wire a coordinator from configuration and shared infrastructure.
pub fn build_coordinator(
    config: &AppConfig,
    store: Arc<SqliteStore>,
    bus: Arc<ProgressBus>,
    llm: Arc<LlmClient>,
    driver: Arc<dyn PageDriver>,
) -> WorkflowCoordinator {
    let reconnaissance = ReconnaissanceAgent::new(
        driver,
        config.max_retries.reconnaissance,
        Duration::from_secs(config.stage_timeouts_s.reconnaissance),
    );
    let generator = GeneratorAgent::new(llm.clone());
    let validator = ValidatorAgent::new(config.validator_fanout);
    let optimizer = OptimizerAgent::new(
        llm,
        config.similarity_threshold,
        config.validator_fanout,
    );

    WorkflowCoordinator::new(
        store,
        bus,
        reconnaissance,
        generator,
        validator,
        optimizer,
        config.stage_timeouts_s.clone(),
    )
}

/// LLM client over the real HTTP transport, per configuration.
pub fn build_llm_client(config: &AppConfig) -> Arc<LlmClient> {
    Arc::new(LlmClient::with_http(LlmSettings::from_config(config)))
}
