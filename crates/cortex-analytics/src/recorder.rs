//! Analytics recorder.
//!
//! Writes never block the response path. Two lanes with different loss
//! policies:
//!
//! * QueryRecords go through a bounded channel and are NEVER dropped —
//!   if the channel is momentarily full the send is completed from a
//!   spawned task (back-pressure lands on the metrics lane, not here).
//! * MetricEvents sit in a bounded deque that drops its oldest entries
//!   on overflow.
//!
//! A single background worker drains both, records first.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use cortex_core::types::{MetricEvent, QueryRecord};
use cortex_storage::{StorageBackend, StorageError};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

const RECORD_CHANNEL_CAP: usize = 256;
const EVENT_QUEUE_CAP: usize = 1024;
const WRITE_RETRIES: u32 = 3;

struct EventQueue {
    queue: Mutex<VecDeque<MetricEvent>>,
    notify: Notify,
    dropped: AtomicU64,
}

impl EventQueue {
    fn push(&self, event: MetricEvent) {
        let mut queue = self.queue.lock().unwrap();
        if queue.len() >= EVENT_QUEUE_CAP {
            queue.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        queue.push_back(event);
        drop(queue);
        self.notify.notify_one();
    }

    fn drain(&self) -> Vec<MetricEvent> {
        let mut queue = self.queue.lock().unwrap();
        queue.drain(..).collect()
    }
}

/// Cheap-to-clone producer handle; one per in-flight request.
#[derive(Clone)]
pub struct AnalyticsHandle {
    records_tx: mpsc::Sender<QueryRecord>,
    events: Arc<EventQueue>,
}

impl AnalyticsHandle {
    /// Enqueue a QueryRecord without blocking. On a full channel the send
    /// completes from a detached task; the record is never dropped.
    pub fn record_query(&self, record: QueryRecord) {
        match self.records_tx.try_send(record) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(record)) => {
                let tx = self.records_tx.clone();
                tokio::spawn(async move {
                    if tx.send(record).await.is_err() {
                        error!("analytics worker gone; query record lost at shutdown");
                    }
                });
            }
            Err(mpsc::error::TrySendError::Closed(record)) => {
                error!(query_id = %record.id, "analytics worker closed; record lost");
            }
        }
    }

    /// Enqueue a metric event. May be dropped under back-pressure.
    pub fn record_event(&self, event: MetricEvent) {
        self.events.push(event);
    }

    pub fn dropped_events(&self) -> u64 {
        self.events.dropped.load(Ordering::Relaxed)
    }
}

/// Owns the background drain task.
pub struct AnalyticsRecorder {
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

impl AnalyticsRecorder {
    pub fn spawn(storage: Arc<dyn StorageBackend>) -> (AnalyticsHandle, AnalyticsRecorder) {
        let (records_tx, records_rx) = mpsc::channel(RECORD_CHANNEL_CAP);
        let events = Arc::new(EventQueue {
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
        });
        let cancel = CancellationToken::new();
        let join = tokio::spawn(drain_loop(
            storage,
            records_rx,
            Arc::clone(&events),
            cancel.clone(),
        ));
        (
            AnalyticsHandle { records_tx, events },
            AnalyticsRecorder { cancel, join },
        )
    }

    /// Flush everything still queued and stop the worker.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        let _ = self.join.await;
    }
}

async fn drain_loop(
    storage: Arc<dyn StorageBackend>,
    mut records_rx: mpsc::Receiver<QueryRecord>,
    events: Arc<EventQueue>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;

            record = records_rx.recv() => {
                match record {
                    Some(record) => write_record(storage.as_ref(), record).await,
                    None => break,
                }
            }

            _ = events.notify.notified() => {
                for event in events.drain() {
                    write_event(storage.as_ref(), event).await;
                }
            }

            _ = cancel.cancelled() => break,
        }
    }

    // Final flush: whatever is still queued gets written before exit.
    while let Ok(record) = records_rx.try_recv() {
        write_record(storage.as_ref(), record).await;
    }
    for event in events.drain() {
        write_event(storage.as_ref(), event).await;
    }
    debug!("analytics drain loop stopped");
}

/// Bounded retry on transient failures; conflicts are final (duplicate
/// record ids must not produce duplicate rows).
async fn write_record(storage: &dyn StorageBackend, record: QueryRecord) {
    for attempt in 0..WRITE_RETRIES {
        match storage.record_query(&record).await {
            Ok(()) => return,
            Err(StorageError::Conflict(msg)) => {
                warn!(query_id = %record.id, %msg, "duplicate query record rejected");
                return;
            }
            Err(e) => {
                warn!(query_id = %record.id, attempt, error = %e, "query record write failed");
                tokio::time::sleep(std::time::Duration::from_millis(50 << attempt)).await;
            }
        }
    }
    error!(query_id = %record.id, "query record dropped after retries");
}

async fn write_event(storage: &dyn StorageBackend, event: MetricEvent) {
    if let Err(e) = storage.record_event(&event).await {
        // Events are best-effort; one warning is enough.
        warn!(error = %e, "metric event write failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use cortex_core::types::{
        QueryIntent, QueryStatus, SessionPattern, Urgency,
    };
    use cortex_storage::SqlBackend;
    use uuid::Uuid;

    fn record(tenant: Uuid) -> QueryRecord {
        QueryRecord {
            id: Uuid::now_v7(),
            tenant_id: tenant,
            user_email: "u@example.com".into(),
            department: None,
            session_id: "s".into(),
            query_text: "q".into(),
            status: QueryStatus::Completed,
            response_time_ms: 10,
            response_length: 5,
            tokens_in: 1,
            tokens_out: 2,
            model: "m".into(),
            category: "lookup".into(),
            keywords: vec![],
            frustration_signals: 0,
            is_repeat: false,
            repeat_of: None,
            query_position_in_session: 1,
            time_since_last_query_ms: None,
            complexity_score: 0.1,
            intent: QueryIntent::InfoSeek,
            specificity: 0.0,
            urgency: Urgency::Low,
            multi_part: false,
            inferred_department: "general".into(),
            department_distribution: Default::default(),
            session_pattern: SessionPattern::SingleQuery,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn records_survive_shutdown_flush() {
        let storage: Arc<dyn StorageBackend> = Arc::new(SqlBackend::in_memory(4).unwrap());
        let (handle, recorder) = AnalyticsRecorder::spawn(Arc::clone(&storage));
        let tenant = Uuid::new_v4();

        for _ in 0..20 {
            handle.record_query(record(tenant));
        }
        recorder.shutdown().await;

        let rows = storage
            .queries_since(tenant, Utc::now() - chrono::Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(rows.len(), 20);
    }

    #[tokio::test]
    async fn event_overflow_drops_oldest_only() {
        let storage: Arc<dyn StorageBackend> = Arc::new(SqlBackend::in_memory(4).unwrap());
        let (handle, recorder) = AnalyticsRecorder::spawn(storage);

        for i in 0..(EVENT_QUEUE_CAP + 10) {
            handle.record_event(MetricEvent::Error {
                query_id: None,
                code: format!("E{}", i),
            });
        }
        assert!(handle.dropped_events() >= 10);
        recorder.shutdown().await;
    }

    #[tokio::test]
    async fn record_query_does_not_block_caller() {
        let storage: Arc<dyn StorageBackend> = Arc::new(SqlBackend::in_memory(4).unwrap());
        let (handle, recorder) = AnalyticsRecorder::spawn(storage);
        let tenant = Uuid::new_v4();

        let start = std::time::Instant::now();
        for _ in 0..500 {
            handle.record_query(record(tenant));
        }
        // All enqueues are non-blocking even past the channel capacity.
        assert!(start.elapsed() < std::time::Duration::from_millis(500));
        recorder.shutdown().await;
    }
}
