//! In-process job queue
//!
//! FIFO of request ids. Multiple workers share one receiver behind an
//! async mutex; each id is delivered to exactly one worker.

use anyhow::{anyhow, Result};
use tokio::sync::{mpsc, Mutex};
use tracing::debug;
use uuid::Uuid;

/// Multi-producer, worker-pool-consumer queue of request ids.
pub struct JobQueue {
    sender: mpsc::UnboundedSender<Uuid>,
    receiver: Mutex<mpsc::UnboundedReceiver<Uuid>>,
}

impl JobQueue {
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            sender,
            receiver: Mutex::new(receiver),
        }
    }

    /// Enqueue a request for processing.
    pub fn enqueue(&self, request_id: Uuid) -> Result<()> {
        debug!("Enqueueing request {request_id}");
        self.sender
            .send(request_id)
            .map_err(|e| anyhow!("Job queue closed: {e}"))
    }

    /// Next job, awaiting until one is available. Returns None when the
    /// queue is closed.
    pub async fn next(&self) -> Option<Uuid> {
        let mut receiver = self.receiver.lock().await;
        receiver.recv().await
    }
}

impl Default for JobQueue {
    fn default() -> Self {
        Self::new()
    }
}
