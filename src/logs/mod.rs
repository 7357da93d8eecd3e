//! Request Log Buffer — bounded ring buffer with a background batched
//! flusher to durable storage (spec §4.C).

mod sqlite;

pub use sqlite::SqliteRequestLogStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOutcome {
    Ok,
    RateLimit,
    Quota,
    Error,
}

impl RequestOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::RateLimit => "rate_limit",
            Self::Quota => "quota",
            Self::Error => "error",
        }
    }
}

#[derive(Debug, Clone)]
pub struct RequestLog {
    pub request_id: String,
    pub account_id: Option<String>,
    pub requested_at: DateTime<Utc>,
    pub latency_ms: u64,
    pub status: RequestOutcome,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub model: Option<String>,
    pub reasoning_effort: Option<String>,
    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
    pub codex_session_id: Option<String>,
    pub codex_conversation_id: Option<String>,
    pub sticky_fingerprint: Option<String>,
}

#[async_trait]
pub trait RequestLogStore: Send + Sync {
    async fn append_batch(&self, batch: &[RequestLog]) -> anyhow::Result<()>;
}

/// Non-blocking ring buffer in front of `RequestLogStore`. Enqueue never
/// awaits a lock held across I/O; the flusher drains in its own task.
pub struct RequestLogBuffer {
    queue: Mutex<VecDeque<RequestLog>>,
    capacity: usize,
    notify: Notify,
    dropped: AtomicU64,
}

impl RequestLogBuffer {
    pub fn new(capacity: usize) -> Self {
        Self { queue: Mutex::new(VecDeque::with_capacity(capacity)), capacity, notify: Notify::new(), dropped: AtomicU64::new(0) }
    }

    /// Enqueues a log record. If the buffer is full, the oldest record is
    /// dropped to make room and the drop counter is bumped — logs are a
    /// debug aid, never the system of record (spec §4.C).
    pub async fn enqueue(&self, log: RequestLog) {
        let mut queue = self.queue.lock().await;
        if queue.len() >= self.capacity {
            queue.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        queue.push_back(log);
        drop(queue);
        self.notify.notify_one();
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    async fn drain_up_to(&self, n: usize) -> Vec<RequestLog> {
        let mut queue = self.queue.lock().await;
        let take = n.min(queue.len());
        queue.drain(..take).collect()
    }

    async fn len(&self) -> usize {
        self.queue.lock().await.len()
    }

    /// Runs until `shutdown` resolves, draining batches of at least
    /// `batch_size` records or every `flush_interval`, whichever comes
    /// first. Flush failures are retried with a fixed backoff; the batch
    /// stays in the buffer (re-queued at the front) until it succeeds or the
    /// buffer overflows and drops it.
    pub async fn run_flush_loop(
        self: Arc<Self>,
        store: Arc<dyn RequestLogStore>,
        batch_size: usize,
        flush_interval: Duration,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep(flush_interval) => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        self.flush_remaining(&store).await;
                        return;
                    }
                }
            }

            while self.len().await >= batch_size {
                self.flush_one_batch(&store, batch_size).await;
            }
        }
    }

    async fn flush_remaining(&self, store: &Arc<dyn RequestLogStore>) {
        loop {
            let batch = self.drain_up_to(usize::MAX).await;
            if batch.is_empty() {
                return;
            }
            if store.append_batch(&batch).await.is_err() {
                return; // best-effort on shutdown
            }
        }
    }

    async fn flush_one_batch(&self, store: &Arc<dyn RequestLogStore>, batch_size: usize) {
        let batch = self.drain_up_to(batch_size).await;
        if batch.is_empty() {
            return;
        }
        let mut backoff = Duration::from_millis(100);
        loop {
            match store.append_batch(&batch).await {
                Ok(()) => return,
                Err(e) => {
                    tracing::warn!(error = %e, "request log flush failed, retrying");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(Duration::from_secs(10));
                }
            }
        }
    }
}
