//! TestOps Copilot service binary
//!
//! Boot order: configuration, tracing, database schema, progress bus
//! and job queue, worker pool, then the HTTP surface.

use std::sync::Arc;

use testops_agents::{OptimizerAgent, ValidatorAgent};
use testops_api::ApiServer;
use testops_copilot::driver::HttpPageDriver;
use testops_copilot::{build_coordinator, build_llm_client, worker};
use testops_core::config::{AppConfig, ConfigFormat};
use testops_databases::{JobQueue, ProgressBus, SqliteStore};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config_path =
        std::env::var("TESTOPS_CONFIG").unwrap_or_else(|_| "testops.toml".to_string());
    let config = AppConfig::load(&config_path, ConfigFormat::Toml)?;

    let store = Arc::new(SqliteStore::new(&config.db_url)?);
    store.initialize_schema()?;

    let bus = Arc::new(ProgressBus::new());
    let queue = Arc::new(JobQueue::new());
    let llm = build_llm_client(&config);
    let driver = Arc::new(HttpPageDriver::new());

    let coordinator = Arc::new(build_coordinator(
        &config,
        store.clone(),
        bus.clone(),
        llm.clone(),
        driver,
    ));

    let workers = worker::spawn_workers(config.worker_count, queue.clone(), coordinator);
    info!("Started {} workers", workers.len());

    let server = ApiServer::new(
        config.api_host.clone(),
        config.api_port,
        store,
        bus,
        queue,
        Arc::new(ValidatorAgent::new(config.validator_fanout)),
        Arc::new(OptimizerAgent::new(
            llm,
            config.similarity_threshold,
            config.validator_fanout,
        )),
    );

    server.start().await
}
