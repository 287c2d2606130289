use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::Path;
use std::time::Duration;

/// Engine configuration. Loaded from `{data_dir}/sync.json` when present,
/// with `GRIDDLE_*` environment variables overriding the connection URLs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Base URL of the primary store, e.g. "http://127.0.0.1:5984".
    #[serde(default = "default_store_url")]
    pub store_url: String,

    /// Base URL of the search engine, e.g. "http://127.0.0.1:9200".
    #[serde(default = "default_search_url")]
    pub search_url: String,

    /// Database naming prefix: `<prefix>_user_<tenant>` / `<prefix>_audit_<tenant>`.
    #[serde(default = "default_prefix")]
    pub database_prefix: String,

    /// Bulk write fires once this many operations are pending.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Bulk write also fires this long after the first operation of a batch
    /// was enqueued, whichever comes first.
    #[serde(default = "default_batch_idle_ms")]
    pub batch_idle_ms: u64,

    /// How often each watcher persists its sequence token into index metadata.
    /// Independent of batch flush timing.
    #[serde(default = "default_checkpoint_interval_secs")]
    pub checkpoint_interval_secs: u64,

    /// Max change rows fetched per feed poll.
    #[serde(default = "default_changes_limit")]
    pub changes_limit: usize,

    /// Longpoll hold time on the change feed before the store returns an
    /// empty batch.
    #[serde(default = "default_poll_wait_ms")]
    pub poll_wait_ms: u64,

    /// Pause before re-polling after a transient feed error.
    #[serde(default = "default_feed_retry_ms")]
    pub feed_retry_ms: u64,

    /// Rows per page during backfill scans.
    #[serde(default = "default_backfill_page_size")]
    pub backfill_page_size: usize,

    /// First retry delay after a failed flush; doubles per consecutive
    /// failure up to `retry_cap_ms`.
    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,

    #[serde(default = "default_retry_cap_ms")]
    pub retry_cap_ms: u64,

    /// Index mappings, supplied as configuration — the engine never decides
    /// what is searchable.
    #[serde(default)]
    pub mappings: MappingSet,
}

fn default_store_url() -> String {
    "http://127.0.0.1:5984".to_string()
}

fn default_search_url() -> String {
    "http://127.0.0.1:9200".to_string()
}

fn default_prefix() -> String {
    "griddle".to_string()
}

fn default_batch_size() -> usize {
    100
}

fn default_batch_idle_ms() -> u64 {
    1000
}

fn default_checkpoint_interval_secs() -> u64 {
    30
}

fn default_changes_limit() -> usize {
    200
}

fn default_poll_wait_ms() -> u64 {
    25_000
}

fn default_feed_retry_ms() -> u64 {
    2_000
}

fn default_backfill_page_size() -> usize {
    500
}

fn default_retry_base_ms() -> u64 {
    500
}

fn default_retry_cap_ms() -> u64 {
    60_000
}

impl Default for SyncConfig {
    fn default() -> Self {
        SyncConfig {
            store_url: default_store_url(),
            search_url: default_search_url(),
            database_prefix: default_prefix(),
            batch_size: default_batch_size(),
            batch_idle_ms: default_batch_idle_ms(),
            checkpoint_interval_secs: default_checkpoint_interval_secs(),
            changes_limit: default_changes_limit(),
            poll_wait_ms: default_poll_wait_ms(),
            feed_retry_ms: default_feed_retry_ms(),
            backfill_page_size: default_backfill_page_size(),
            retry_base_ms: default_retry_base_ms(),
            retry_cap_ms: default_retry_cap_ms(),
            mappings: MappingSet::default(),
        }
    }
}

impl SyncConfig {
    /// Load configuration from `{data_dir}/sync.json` or fall back to
    /// defaults, then apply `GRIDDLE_STORE_URL` / `GRIDDLE_SEARCH_URL` /
    /// `GRIDDLE_DATABASE_PREFIX` overrides.
    pub fn load_or_default(data_dir: &Path) -> Self {
        let sync_json = data_dir.join("sync.json");

        let mut config = if sync_json.exists() {
            match std::fs::read_to_string(&sync_json) {
                Ok(content) => match serde_json::from_str::<SyncConfig>(&content) {
                    Ok(config) => {
                        tracing::info!(
                            "Loaded sync config: store={}, search={}, prefix={}",
                            config.store_url,
                            config.search_url,
                            config.database_prefix
                        );
                        config
                    }
                    Err(e) => {
                        tracing::error!("Failed to parse sync.json: {}, using defaults", e);
                        SyncConfig::default()
                    }
                },
                Err(e) => {
                    tracing::error!("Failed to read sync.json: {}, using defaults", e);
                    SyncConfig::default()
                }
            }
        } else {
            SyncConfig::default()
        };

        if let Ok(url) = std::env::var("GRIDDLE_STORE_URL") {
            config.store_url = url;
        }
        if let Ok(url) = std::env::var("GRIDDLE_SEARCH_URL") {
            config.search_url = url;
        }
        if let Ok(prefix) = std::env::var("GRIDDLE_DATABASE_PREFIX") {
            config.database_prefix = prefix;
        }

        config
    }

    pub fn batch_idle(&self) -> Duration {
        Duration::from_millis(self.batch_idle_ms)
    }

    pub fn checkpoint_interval(&self) -> Duration {
        Duration::from_secs(self.checkpoint_interval_secs)
    }

    pub fn poll_wait(&self) -> Duration {
        Duration::from_millis(self.poll_wait_ms)
    }

    pub fn feed_retry(&self) -> Duration {
        Duration::from_millis(self.feed_retry_ms)
    }

    pub fn retry_base(&self) -> Duration {
        Duration::from_millis(self.retry_base_ms)
    }

    pub fn retry_cap(&self) -> Duration {
        Duration::from_millis(self.retry_cap_ms)
    }
}

/// Per-kind index mappings. Strict by default: the transformer emits explicit
/// nulls and the mapping rejects unknown fields, so drift between the two
/// surfaces immediately.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MappingSet {
    #[serde(default = "default_user_mapping")]
    pub user: serde_json::Value,
    #[serde(default = "default_audit_mapping")]
    pub audit: serde_json::Value,
}

impl Default for MappingSet {
    fn default() -> Self {
        MappingSet {
            user: default_user_mapping(),
            audit: default_audit_mapping(),
        }
    }
}

fn default_user_mapping() -> serde_json::Value {
    json!({
        "dynamic": "strict",
        "properties": {
            "tenant_id":  { "type": "keyword" },
            "database":   { "type": "keyword" },
            "title":      { "type": "text" },
            "content":    { "type": "text" },
            "tags":       { "type": "keyword" },
            "folder":     { "type": "keyword" },
            "pinned":     { "type": "boolean" },
            "created_at": { "type": "date" },
            "updated_at": { "type": "date" }
        }
    })
}

fn default_audit_mapping() -> serde_json::Value {
    json!({
        "dynamic": "strict",
        "properties": {
            "tenant_id":   { "type": "keyword" },
            "database":    { "type": "keyword" },
            "action":      { "type": "keyword" },
            "actor":       { "type": "keyword" },
            "target_id":   { "type": "keyword" },
            "detail":      { "type": "text" },
            "occurred_at": { "type": "date" }
        }
    })
}

impl MappingSet {
    pub fn for_kind(&self, kind: crate::types::DatabaseKind) -> &serde_json::Value {
        match kind {
            crate::types::DatabaseKind::UserData => &self.user,
            crate::types::DatabaseKind::AuditLog => &self.audit,
        }
    }
}
