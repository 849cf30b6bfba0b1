use demogate_protocol::{ClientId, now_ms};
use tokio::sync::Mutex;

use crate::error::BrokerError;

#[derive(Debug, Clone)]
struct QueueEntry {
    client_id: ClientId,
    enqueued_at_ms: u64,
}

/// FIFO waitlist of connected clients.
///
/// Order is strictly by enqueue time; a client appears at most once.
/// Removal is O(n), bounded by the configured cap.
pub struct QueueManager {
    cap: usize,
    avg_session_minutes: u64,
    inner: Mutex<Vec<QueueEntry>>,
}

/// Position snapshot handed to the broadcaster after a mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuePositionSnapshot {
    pub client_id: ClientId,
    /// 1-indexed.
    pub position: usize,
    pub estimated_wait: u64,
    pub queue_size: usize,
}

impl QueueManager {
    pub fn new(cap: usize, avg_session_minutes: u64) -> Self {
        Self {
            cap,
            avg_session_minutes,
            inner: Mutex::new(Vec::new()),
        }
    }

    /// Append a client. Returns its 1-indexed position.
    pub async fn enqueue(&self, client_id: &str) -> Result<usize, BrokerError> {
        let mut queue = self.inner.lock().await;
        if queue.iter().any(|entry| entry.client_id == client_id) {
            return Err(BrokerError::AlreadyQueued);
        }
        if queue.len() >= self.cap {
            return Err(BrokerError::QueueFull { cap: self.cap });
        }
        queue.push(QueueEntry {
            client_id: client_id.to_string(),
            enqueued_at_ms: now_ms(),
        });
        Ok(queue.len())
    }

    /// Remove by identity. Returns whether the client was present.
    pub async fn leave(&self, client_id: &str) -> bool {
        let mut queue = self.inner.lock().await;
        let before = queue.len();
        queue.retain(|entry| entry.client_id != client_id);
        queue.len() != before
    }

    /// Gateway disconnect path; same as leave but named for intent.
    pub async fn remove_if_present(&self, client_id: &str) -> bool {
        self.leave(client_id).await
    }

    pub async fn peek_head(&self) -> Option<ClientId> {
        self.inner
            .lock()
            .await
            .first()
            .map(|entry| entry.client_id.clone())
    }

    /// Restore a popped entry to the head after a lost promotion race.
    pub(crate) async fn push_front(&self, client_id: &str, enqueued_at_ms: u64) {
        let mut queue = self.inner.lock().await;
        if queue.iter().any(|entry| entry.client_id == client_id) {
            return;
        }
        queue.insert(
            0,
            QueueEntry {
                client_id: client_id.to_string(),
                enqueued_at_ms,
            },
        );
    }

    /// Pop the head for promotion. Returns (client, enqueue timestamp).
    pub async fn pop_head(&self) -> Option<(ClientId, u64)> {
        let mut queue = self.inner.lock().await;
        if queue.is_empty() {
            return None;
        }
        let entry = queue.remove(0);
        Some((entry.client_id, entry.enqueued_at_ms))
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.is_empty()
    }

    pub async fn contains(&self, client_id: &str) -> bool {
        self.inner
            .lock()
            .await
            .iter()
            .any(|entry| entry.client_id == client_id)
    }

    /// Fresh positions for every queued client, for broadcast after any
    /// mutation.
    pub async fn positions(&self) -> Vec<QueuePositionSnapshot> {
        let queue = self.inner.lock().await;
        let queue_size = queue.len();
        queue
            .iter()
            .enumerate()
            .map(|(idx, entry)| QueuePositionSnapshot {
                client_id: entry.client_id.clone(),
                position: idx + 1,
                estimated_wait: (idx as u64 + 1) * self.avg_session_minutes,
                queue_size,
            })
            .collect()
    }
}
