//! Progress bus and cooperative cancellation
//!
//! One broadcast channel per request. Subscribers that join late receive
//! the current status snapshot on join and live events afterwards; the
//! cancellation flag lives on the same structure so stages can poll it
//! at every interruption point.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::RwLock;
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

use testops_core::models::RequestStatus;

const DEFAULT_CHANNEL_CAPACITY: usize = 64;

/// One progress event on a request's channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub request_id: Uuid,
    pub stage: String,
    pub status: RequestStatus,
    pub step_number: u32,
    pub timestamp: DateTime<Utc>,
    pub metric: Option<serde_json::Value>,
}

impl ProgressEvent {
    pub fn new(request_id: Uuid, stage: &str, status: RequestStatus, step_number: u32) -> Self {
        Self {
            request_id,
            stage: stage.to_string(),
            status,
            step_number,
            timestamp: Utc::now(),
            metric: None,
        }
    }
}

/// Per-request pub/sub with a current-status snapshot for late joiners.
pub struct ProgressBus {
    capacity: usize,
    senders: RwLock<HashMap<Uuid, broadcast::Sender<ProgressEvent>>>,
    current: RwLock<HashMap<Uuid, ProgressEvent>>,
    cancelled: RwLock<HashSet<Uuid>>,
}

impl ProgressBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        assert!(capacity > 0, "channel capacity must be greater than 0");
        Self {
            capacity,
            senders: RwLock::new(HashMap::new()),
            current: RwLock::new(HashMap::new()),
            cancelled: RwLock::new(HashSet::new()),
        }
    }

    /// Publish an event on the request's channel and record it as the
    /// current snapshot.
    pub fn publish(&self, event: ProgressEvent) {
        {
            let mut current = self.current.write().expect("progress bus lock poisoned");
            current.insert(event.request_id, event.clone());
        }

        let sender = {
            let senders = self.senders.read().expect("progress bus lock poisoned");
            senders.get(&event.request_id).cloned()
        };
        if let Some(sender) = sender {
            // Send fails only when no receiver is listening.
            let _ = sender.send(event);
        }
    }

    /// Subscribe to a request's events. Returns the current snapshot (if
    /// the request has published anything yet) and the live receiver.
    pub fn subscribe(
        &self,
        request_id: Uuid,
    ) -> (Option<ProgressEvent>, broadcast::Receiver<ProgressEvent>) {
        let receiver = {
            let mut senders = self.senders.write().expect("progress bus lock poisoned");
            senders
                .entry(request_id)
                .or_insert_with(|| broadcast::channel(self.capacity).0)
                .subscribe()
        };
        let snapshot = {
            let current = self.current.read().expect("progress bus lock poisoned");
            current.get(&request_id).cloned()
        };
        (snapshot, receiver)
    }

    /// Set the cooperative cancellation flag.
    pub fn request_cancel(&self, request_id: Uuid) {
        debug!("Cancellation requested for {request_id}");
        let mut cancelled = self.cancelled.write().expect("progress bus lock poisoned");
        cancelled.insert(request_id);
    }

    /// Polled by stages at interruption points.
    pub fn is_cancelled(&self, request_id: Uuid) -> bool {
        let cancelled = self.cancelled.read().expect("progress bus lock poisoned");
        cancelled.contains(&request_id)
    }

    /// Drop the channel and flags once a request reaches a terminal
    /// state. The snapshot is kept so late pollers still see the final
    /// status.
    pub fn finish(&self, request_id: Uuid) {
        let mut senders = self.senders.write().expect("progress bus lock poisoned");
        senders.remove(&request_id);
        let mut cancelled = self.cancelled.write().expect("progress bus lock poisoned");
        cancelled.remove(&request_id);
    }
}

impl Default for ProgressBus {
    fn default() -> Self {
        Self::new()
    }
}
