//! Worker pool
//!
//! Workers drain the job queue; each request is processed by one
//! logical task driving the workflow coordinator to a terminal state.
//! Cross-request parallelism equals the worker count.

use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info};

use testops_agents::WorkflowCoordinator;
use testops_databases::JobQueue;

/// Spawn `count` workers over a shared queue and coordinator.
pub fn spawn_workers(
    count: usize,
    queue: Arc<JobQueue>,
    coordinator: Arc<WorkflowCoordinator>,
) -> Vec<JoinHandle<()>> {
    (0..count.max(1))
        .map(|worker_index| {
            let queue = queue.clone();
            let coordinator = coordinator.clone();
            tokio::spawn(async move {
                info!("Worker {worker_index} started");
                while let Some(request_id) = queue.next().await {
                    info!("Worker {worker_index} picked request {request_id}");
                    if let Err(e) = coordinator.start(request_id).await {
                        error!("Worker {worker_index} failed on request {request_id}: {e}");
                    }
                }
                info!("Worker {worker_index} stopped, queue closed");
            })
        })
        .collect()
}
