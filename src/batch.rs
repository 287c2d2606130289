//! Hybrid size/idle batching of index operations, shared across all tenants.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

use crate::config::SyncConfig;
use crate::error::Result;
use crate::search::SearchIndex;
use crate::types::PendingOperation;

struct PendingQueue {
    ops: VecDeque<PendingOperation>,
    /// When the oldest operation of the current batch was enqueued; drives
    /// the idle-flush trigger.
    oldest_enqueued: Option<Instant>,
    /// Automatic retries are gated until this instant after a failed flush.
    backoff_until: Option<Instant>,
}

/// Accumulates pending index operations from every watcher and bulk-writes
/// them when the batch is full or has sat idle long enough.
///
/// One flush is in flight at a time; enqueues during a flush land in the
/// next batch. A failed bulk write puts the whole batch back at the front of
/// the queue, so order per document id is preserved across retries.
pub struct BatchProcessor {
    search: Arc<dyn SearchIndex>,
    batch_size: usize,
    batch_idle: Duration,
    retry_base: Duration,
    retry_cap: Duration,
    queue: Mutex<PendingQueue>,
    /// Serializes flushes without holding the queue lock across the bulk call.
    flush_gate: Mutex<()>,
    pending_len: AtomicUsize,
    consecutive_failures: AtomicU32,
    items_rejected: AtomicU64,
    shutdown_tx: watch::Sender<bool>,
    timer_handle: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl BatchProcessor {
    pub fn new(search: Arc<dyn SearchIndex>, config: &SyncConfig) -> Arc<Self> {
        let (shutdown_tx, _) = watch::channel(false);

        Arc::new(Self {
            search,
            batch_size: config.batch_size.max(1),
            batch_idle: config.batch_idle(),
            retry_base: config.retry_base(),
            retry_cap: config.retry_cap(),
            queue: Mutex::new(PendingQueue {
                ops: VecDeque::new(),
                oldest_enqueued: None,
                backoff_until: None,
            }),
            flush_gate: Mutex::new(()),
            pending_len: AtomicUsize::new(0),
            consecutive_failures: AtomicU32::new(0),
            items_rejected: AtomicU64::new(0),
            shutdown_tx,
            timer_handle: std::sync::Mutex::new(None),
        })
    }

    /// Spawn the idle-flush timer. Called once by the orchestrator.
    pub fn start_timer(self: &Arc<Self>) {
        let processor = Arc::clone(self);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        // Tick fast enough that an idle batch never overshoots its deadline
        // by more than a fraction of the window.
        let tick = (self.batch_idle / 4).max(Duration::from_millis(50));

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if processor.idle_deadline_passed().await {
                            if let Err(e) = processor.flush().await {
                                tracing::warn!("[BATCH] idle flush failed: {}", e);
                            }
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            tracing::debug!("[BATCH] timer stopped");
                            break;
                        }
                    }
                }
            }
        });

        *self.timer_handle.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
    }

    /// Stop the idle-flush timer. Does not flush; shutdown runs one final
    /// explicit flush after the watchers have stopped feeding the queue.
    pub fn stop_timer(&self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(handle) = self
            .timer_handle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            handle.abort();
        }
    }

    async fn idle_deadline_passed(&self) -> bool {
        let queue = self.queue.lock().await;
        let idle_due = queue
            .oldest_enqueued
            .map(|t| t.elapsed() >= self.batch_idle)
            .unwrap_or(false);
        let backed_off = queue
            .backoff_until
            .map(|t| Instant::now() < t)
            .unwrap_or(false);
        idle_due && !backed_off
    }

    /// Append an operation. Triggers a flush when the batch-size threshold is
    /// reached; a flush error propagates to the caller, which logs and keeps
    /// feeding (the operations stay queued, nothing is lost).
    pub async fn enqueue(&self, op: PendingOperation) -> Result<()> {
        let (len, backed_off) = {
            let mut queue = self.queue.lock().await;
            queue.ops.push_back(op);
            if queue.oldest_enqueued.is_none() {
                queue.oldest_enqueued = Some(Instant::now());
            }
            let backed_off = queue
                .backoff_until
                .map(|t| Instant::now() < t)
                .unwrap_or(false);
            self.pending_len.store(queue.ops.len(), Ordering::Relaxed);
            (queue.ops.len(), backed_off)
        };

        // Inside the backoff window the batch just keeps growing; probing a
        // struggling engine once per window is enough.
        if len >= self.batch_size && !backed_off {
            self.flush().await?;
        }
        Ok(())
    }

    /// Number of operations waiting in the queue.
    pub fn pending_count(&self) -> usize {
        self.pending_len.load(Ordering::Relaxed)
    }

    /// Total operations rejected item-by-item inside otherwise-successful
    /// bulk responses. Rejected items are dropped by design — the source
    /// event will not recur.
    pub fn rejected_count(&self) -> u64 {
        self.items_rejected.load(Ordering::Relaxed)
    }

    /// Drain the queue and bulk-write it as one batch. On failure the whole
    /// batch is requeued at the front and the error is returned.
    pub async fn flush(&self) -> Result<()> {
        let _gate = self.flush_gate.lock().await;

        let batch: Vec<PendingOperation> = {
            let mut queue = self.queue.lock().await;
            queue.oldest_enqueued = None;
            let batch = queue.ops.drain(..).collect();
            self.pending_len.store(0, Ordering::Relaxed);
            batch
        };

        if batch.is_empty() {
            return Ok(());
        }

        tracing::debug!("[BATCH] flushing {} operations", batch.len());

        match self.search.bulk(&batch).await {
            Ok(summary) => {
                self.consecutive_failures.store(0, Ordering::Relaxed);
                {
                    let mut queue = self.queue.lock().await;
                    queue.backoff_until = None;
                }

                if !summary.rejected.is_empty() {
                    self.items_rejected
                        .fetch_add(summary.rejected.len() as u64, Ordering::Relaxed);
                    for failure in &summary.rejected {
                        tracing::warn!(
                            "[BATCH] item rejected: index={} id={} reason={}",
                            failure.index,
                            failure.doc_id,
                            failure.reason
                        );
                    }
                }

                tracing::info!(
                    "[BATCH] flushed {} applied, {} rejected",
                    summary.applied,
                    summary.rejected.len()
                );
                Ok(())
            }
            Err(e) => {
                let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
                let backoff = backoff_delay(self.retry_base, self.retry_cap, failures);
                let requeued = batch.len();

                {
                    let mut queue = self.queue.lock().await;
                    // Front-requeue verbatim so operation order per document
                    // id survives the retry.
                    for op in batch.into_iter().rev() {
                        queue.ops.push_front(op);
                    }
                    queue.oldest_enqueued = Some(Instant::now());
                    queue.backoff_until = Some(Instant::now() + backoff);
                    self.pending_len.store(queue.ops.len(), Ordering::Relaxed);
                }

                tracing::warn!(
                    "[BATCH] flush failed ({} ops requeued, retry in {:?}, attempt {}): {}",
                    requeued,
                    backoff,
                    failures,
                    e
                );
                Err(e)
            }
        }
    }
}

fn backoff_delay(base: Duration, cap: Duration, consecutive_failures: u32) -> Duration {
    let exp = consecutive_failures.saturating_sub(1).min(16);
    base.saturating_mul(1u32 << exp).min(cap)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GriddleError;
    use crate::search::{BulkItemFailure, BulkSummary, IndexMetadata};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::AtomicBool;
    use std::sync::Mutex as StdMutex;

    /// Records bulk calls; optionally fails the next one.
    struct RecordingIndex {
        bulk_batches: StdMutex<Vec<Vec<PendingOperation>>>,
        fail_next: AtomicBool,
        reject_first_item: AtomicBool,
    }

    impl RecordingIndex {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                bulk_batches: StdMutex::new(Vec::new()),
                fail_next: AtomicBool::new(false),
                reject_first_item: AtomicBool::new(false),
            })
        }

        fn batch_sizes(&self) -> Vec<usize> {
            self.bulk_batches
                .lock()
                .unwrap()
                .iter()
                .map(|b| b.len())
                .collect()
        }
    }

    #[async_trait]
    impl SearchIndex for RecordingIndex {
        async fn index_exists(&self, _name: &str) -> Result<bool> {
            Ok(true)
        }
        async fn create_index(&self, _name: &str, _mapping: &serde_json::Value) -> Result<()> {
            Ok(())
        }
        async fn delete_index(&self, _name: &str) -> Result<()> {
            Ok(())
        }
        async fn alias_exists(&self, _alias: &str) -> Result<bool> {
            Ok(false)
        }
        async fn alias_target(&self, _alias: &str) -> Result<Option<String>> {
            Ok(None)
        }
        async fn create_alias(&self, _alias: &str, _index: &str) -> Result<()> {
            Ok(())
        }
        async fn swap_alias(&self, _alias: &str, _from: &str, _to: &str) -> Result<()> {
            Ok(())
        }
        async fn read_metadata(&self, _index: &str) -> Result<Option<IndexMetadata>> {
            Ok(None)
        }
        async fn write_metadata(&self, _index: &str, _meta: &IndexMetadata) -> Result<()> {
            Ok(())
        }
        async fn bulk(&self, operations: &[PendingOperation]) -> Result<BulkSummary> {
            if self.fail_next.swap(false, Ordering::SeqCst) {
                return Err(GriddleError::BulkFailed {
                    attempted: operations.len(),
                    reason: "engine unavailable".to_string(),
                });
            }
            self.bulk_batches
                .lock()
                .unwrap()
                .push(operations.to_vec());

            let mut summary = BulkSummary {
                applied: operations.len(),
                rejected: vec![],
            };
            if self.reject_first_item.swap(false, Ordering::SeqCst) {
                summary.applied -= 1;
                summary.rejected.push(BulkItemFailure {
                    doc_id: operations[0].doc_id().to_string(),
                    index: operations[0].index().to_string(),
                    reason: "mapping conflict".to_string(),
                });
            }
            Ok(summary)
        }
        async fn reindex(&self, _source: &str, _dest: &str) -> Result<u64> {
            Ok(0)
        }
        async fn refresh(&self, _index: &str) -> Result<()> {
            Ok(())
        }
    }

    fn upsert(id: &str) -> PendingOperation {
        PendingOperation::Upsert {
            index: "idx".to_string(),
            doc_id: id.to_string(),
            document: json!({ "n": id }),
        }
    }

    fn test_config(batch_size: usize) -> SyncConfig {
        SyncConfig {
            batch_size,
            batch_idle_ms: 50,
            retry_base_ms: 10,
            retry_cap_ms: 100,
            ..SyncConfig::default()
        }
    }

    #[tokio::test]
    async fn test_size_trigger_flushes_exactly_once() {
        let index = RecordingIndex::new();
        let processor = BatchProcessor::new(index.clone(), &test_config(3));

        for i in 0..3 {
            processor.enqueue(upsert(&i.to_string())).await.unwrap();
        }

        assert_eq!(index.batch_sizes(), vec![3]);
        assert_eq!(processor.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_below_threshold_does_not_flush() {
        let index = RecordingIndex::new();
        let processor = BatchProcessor::new(index.clone(), &test_config(5));

        processor.enqueue(upsert("a")).await.unwrap();
        processor.enqueue(upsert("b")).await.unwrap();

        assert!(index.batch_sizes().is_empty());
        assert_eq!(processor.pending_count(), 2);
    }

    #[tokio::test]
    async fn test_idle_trigger_flushes_partial_batch() {
        let index = RecordingIndex::new();
        let processor = BatchProcessor::new(index.clone(), &test_config(100));
        processor.start_timer();

        processor.enqueue(upsert("a")).await.unwrap();
        processor.enqueue(upsert("b")).await.unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(index.batch_sizes(), vec![2]);
        assert_eq!(processor.pending_count(), 0);
        processor.stop_timer();
    }

    #[tokio::test]
    async fn test_failed_flush_requeues_in_order() {
        let index = RecordingIndex::new();
        let processor = BatchProcessor::new(index.clone(), &test_config(100));

        processor.enqueue(upsert("a")).await.unwrap();
        processor.enqueue(upsert("b")).await.unwrap();
        processor.enqueue(upsert("c")).await.unwrap();

        index.fail_next.store(true, Ordering::SeqCst);
        assert!(processor.flush().await.is_err());
        assert_eq!(processor.pending_count(), 3);

        // Retry succeeds and preserves enqueue order.
        tokio::time::sleep(Duration::from_millis(20)).await;
        processor.flush().await.unwrap();
        let batches = index.bulk_batches.lock().unwrap();
        assert_eq!(batches.len(), 1);
        let ids: Vec<&str> = batches[0].iter().map(|op| op.doc_id()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_enqueue_during_backoff_does_not_probe() {
        let index = RecordingIndex::new();
        let mut config = test_config(2);
        config.retry_base_ms = 60_000;
        let processor = BatchProcessor::new(index.clone(), &config);

        processor.enqueue(upsert("a")).await.unwrap();
        index.fail_next.store(true, Ordering::SeqCst);
        // Hits the size trigger and fails; backoff window opens.
        assert!(processor.enqueue(upsert("b")).await.is_err());

        // Further enqueues accumulate silently instead of re-probing.
        processor.enqueue(upsert("c")).await.unwrap();
        processor.enqueue(upsert("d")).await.unwrap();
        assert!(index.batch_sizes().is_empty());
        assert_eq!(processor.pending_count(), 4);
    }

    #[tokio::test]
    async fn test_partial_item_failures_counted_not_requeued() {
        let index = RecordingIndex::new();
        let processor = BatchProcessor::new(index.clone(), &test_config(100));

        processor.enqueue(upsert("bad")).await.unwrap();
        processor.enqueue(upsert("good")).await.unwrap();

        index.reject_first_item.store(true, Ordering::SeqCst);
        processor.flush().await.unwrap();

        assert_eq!(processor.rejected_count(), 1);
        assert_eq!(processor.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_flush_on_empty_queue_is_noop() {
        let index = RecordingIndex::new();
        let processor = BatchProcessor::new(index.clone(), &test_config(10));

        processor.flush().await.unwrap();
        assert!(index.batch_sizes().is_empty());
    }

    #[test]
    fn test_backoff_delay_doubles_and_caps() {
        let base = Duration::from_millis(500);
        let cap = Duration::from_secs(60);
        assert_eq!(backoff_delay(base, cap, 1), Duration::from_millis(500));
        assert_eq!(backoff_delay(base, cap, 2), Duration::from_millis(1000));
        assert_eq!(backoff_delay(base, cap, 4), Duration::from_millis(4000));
        assert_eq!(backoff_delay(base, cap, 20), cap);
    }
}
