//! Live change-feed tailing, one long-lived task per watched database.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

use crate::batch::BatchProcessor;
use crate::migration::MigrationManager;
use crate::store::PrimaryStore;
use crate::transform::transform;
use crate::types::{ChangeEvent, DatabaseKind, DatabaseSummary, PendingOperation, SequenceToken, TenantId};

/// Live sync state for one watched database. Exactly one of these exists per
/// database name; the orchestrator's registry enforces it.
pub struct DatabaseSyncState {
    pub database: String,
    pub index_name: String,
    pub kind: DatabaseKind,
    pub tenant_id: TenantId,
    pub target_version: u32,
    last_seq: StdMutex<SequenceToken>,
    running: AtomicBool,
    feed: Mutex<Option<FeedHandle>>,
}

struct FeedHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl DatabaseSyncState {
    pub fn new(
        database: String,
        index_name: String,
        kind: DatabaseKind,
        tenant_id: TenantId,
        target_version: u32,
        last_seq: SequenceToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            database,
            index_name,
            kind,
            tenant_id,
            target_version,
            last_seq: StdMutex::new(last_seq),
            running: AtomicBool::new(false),
            feed: Mutex::new(None),
        })
    }

    pub fn last_seq(&self) -> SequenceToken {
        self.last_seq
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn set_last_seq(&self, seq: SequenceToken) {
        *self.last_seq.lock().unwrap_or_else(|e| e.into_inner()) = seq;
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    pub fn summary(&self) -> DatabaseSummary {
        DatabaseSummary {
            database: self.database.clone(),
            index: self.index_name.clone(),
            kind: self.kind,
            tenant_id: self.tenant_id.clone(),
            last_seq: self.last_seq(),
        }
    }
}

/// Opens and supervises change feeds. Shared by every watched database.
pub struct ChangeFeedWatcher {
    store: Arc<dyn PrimaryStore>,
    batch: Arc<BatchProcessor>,
    migration: Arc<MigrationManager>,
    changes_limit: usize,
    poll_wait: Duration,
    feed_retry: Duration,
    checkpoint_interval: Duration,
}

impl ChangeFeedWatcher {
    pub fn new(
        store: Arc<dyn PrimaryStore>,
        batch: Arc<BatchProcessor>,
        migration: Arc<MigrationManager>,
        config: &crate::config::SyncConfig,
    ) -> Self {
        Self {
            store,
            batch,
            migration,
            changes_limit: config.changes_limit,
            poll_wait: config.poll_wait(),
            feed_retry: config.feed_retry(),
            checkpoint_interval: config.checkpoint_interval(),
        }
    }

    /// Begin tailing the feed from `state`'s current token. Idempotent per
    /// state object: a second start while running is a no-op.
    pub async fn start(&self, state: Arc<DatabaseSyncState>) {
        let mut feed = state.feed.lock().await;
        if feed.is_some() {
            tracing::info!("[FEED {}] already running", state.database);
            return;
        }

        state.running.store(true, Ordering::Relaxed);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let store = Arc::clone(&self.store);
        let batch = Arc::clone(&self.batch);
        let migration = Arc::clone(&self.migration);
        let task_state = Arc::clone(&state);
        let changes_limit = self.changes_limit;
        let poll_wait = self.poll_wait;
        let feed_retry = self.feed_retry;
        let checkpoint_interval = self.checkpoint_interval;

        let task = tokio::spawn(async move {
            run_feed(
                store,
                batch,
                migration,
                task_state,
                shutdown_rx,
                changes_limit,
                poll_wait,
                feed_retry,
                checkpoint_interval,
            )
            .await;
        });

        *feed = Some(FeedHandle {
            shutdown: shutdown_tx,
            task,
        });

        tracing::info!(
            "[FEED {}] started from seq {}",
            state.database,
            state.last_seq()
        );
    }

    /// Stop tailing. The final sequence token is persisted before this
    /// returns, so the watcher is fully checkpointed once stopped.
    pub async fn stop(&self, state: &DatabaseSyncState) {
        state.running.store(false, Ordering::Relaxed);

        let handle = state.feed.lock().await.take();
        if let Some(handle) = handle {
            let _ = handle.shutdown.send(true);
            if let Err(e) = handle.task.await {
                tracing::warn!("[FEED {}] task join error: {}", state.database, e);
            }
        }

        tracing::info!("[FEED {}] stopped at seq {}", state.database, state.last_seq());
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_feed(
    store: Arc<dyn PrimaryStore>,
    batch: Arc<BatchProcessor>,
    migration: Arc<MigrationManager>,
    state: Arc<DatabaseSyncState>,
    mut shutdown_rx: watch::Receiver<bool>,
    changes_limit: usize,
    poll_wait: Duration,
    feed_retry: Duration,
    checkpoint_interval: Duration,
) {
    let mut checkpoint_timer = tokio::time::interval_at(
        tokio::time::Instant::now() + checkpoint_interval,
        checkpoint_interval,
    );
    checkpoint_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        let since = state.last_seq();

        tokio::select! {
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
            _ = checkpoint_timer.tick() => {
                persist_checkpoint(&migration, &state).await;
            }
            result = store.changes_since(&state.database, &since, changes_limit, poll_wait) => {
                match result {
                    Ok(feed_batch) => {
                        let count = feed_batch.events.len();
                        for event in feed_batch.events {
                            process_event(&batch, &state, event).await;
                        }
                        // Even an empty longpoll can move the feed position
                        // past non-document entries.
                        state.set_last_seq(feed_batch.last_seq);
                        if count > 0 {
                            tracing::debug!(
                                "[FEED {}] processed {} changes, at seq {}",
                                state.database,
                                count,
                                state.last_seq()
                            );
                        }
                    }
                    Err(e) => {
                        // Transient feed errors leave state untouched; the
                        // next poll resumes from the same token.
                        tracing::warn!("[FEED {}] poll failed: {}", state.database, e);
                        tokio::time::sleep(feed_retry).await;
                    }
                }
            }
        }
    }

    // Final synchronous checkpoint: a stop loses nothing that was processed.
    persist_checkpoint(&migration, &state).await;
}

async fn process_event(batch: &BatchProcessor, state: &DatabaseSyncState, event: ChangeEvent) {
    let op = if event.deleted {
        Some(PendingOperation::Delete {
            index: state.index_name.clone(),
            doc_id: event.id.clone(),
        })
    } else {
        event.doc.as_ref().and_then(|doc| {
            transform(doc, &state.tenant_id, &state.database).map(|(doc_id, document)| {
                PendingOperation::Upsert {
                    index: state.index_name.clone(),
                    doc_id,
                    document,
                }
            })
        })
    };

    match op {
        Some(op) => {
            // A flush failure surfaces here; the operations stay queued, the
            // feed keeps going. Lag grows, nothing is lost.
            if let Err(e) = batch.enqueue(op).await {
                tracing::warn!("[FEED {}] flush failed, continuing: {}", state.database, e);
            }
        }
        None => {
            tracing::debug!(
                "[FEED {}] skipped change {} (unsupported or bodiless)",
                state.database,
                event.id
            );
        }
    }

    // INVARIANT: the token advances even though the operation may still sit
    // in an unflushed batch. Deliberate at-least-once tradeoff — a crash
    // replays at most one batch window of idempotent upserts. Do not "fix"
    // this into checkpoint-after-flush; it deadlocks batching against
    // checkpointing.
    state.set_last_seq(event.seq);
}

async fn persist_checkpoint(migration: &MigrationManager, state: &DatabaseSyncState) {
    let seq = state.last_seq();
    if let Err(e) = migration
        .persist_checkpoint(&state.index_name, state.target_version, &seq)
        .await
    {
        tracing::warn!(
            "[FEED {}] checkpoint persist failed at seq {}: {}",
            state.database,
            seq,
            e
        );
    }
}
