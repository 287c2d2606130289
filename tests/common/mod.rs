//! In-memory collaborator mocks shared by the integration tests.

use async_trait::async_trait;
use griddle::error::{GriddleError, Result};
use griddle::search::{BulkItemFailure, BulkSummary, IndexMetadata, SearchIndex};
use griddle::store::{ChangeBatch, DocumentPage, PrimaryStore, SourceRow};
use griddle::types::{ChangeEvent, PendingOperation, SequenceToken};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

fn seq_num(token: &SequenceToken) -> u64 {
    token.as_str().parse().unwrap_or(0)
}

/// Primary store backed by maps: documents per database plus a replayable
/// event log with numeric sequence tokens.
#[derive(Default)]
pub struct MockPrimaryStore {
    databases: Mutex<Vec<String>>,
    docs: Mutex<HashMap<String, BTreeMap<String, Value>>>,
    events: Mutex<HashMap<String, Vec<(u64, ChangeEvent)>>>,
    seq: AtomicU64,
}

impl MockPrimaryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_database(&self, name: &str) {
        self.databases.lock().unwrap().push(name.to_string());
        self.docs
            .lock()
            .unwrap()
            .entry(name.to_string())
            .or_default();
    }

    /// Store a document and record the corresponding change event.
    pub fn put_doc(&self, database: &str, doc: Value) {
        let id = doc["_id"].as_str().expect("doc needs _id").to_string();
        self.docs
            .lock()
            .unwrap()
            .entry(database.to_string())
            .or_default()
            .insert(id.clone(), doc.clone());

        let seq = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
        self.events
            .lock()
            .unwrap()
            .entry(database.to_string())
            .or_default()
            .push((
                seq,
                ChangeEvent {
                    seq: SequenceToken(seq.to_string()),
                    id,
                    deleted: false,
                    doc: Some(doc),
                },
            ));
    }

    pub fn delete_doc(&self, database: &str, id: &str) {
        self.docs
            .lock()
            .unwrap()
            .entry(database.to_string())
            .or_default()
            .remove(id);

        let seq = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
        self.events
            .lock()
            .unwrap()
            .entry(database.to_string())
            .or_default()
            .push((
                seq,
                ChangeEvent {
                    seq: SequenceToken(seq.to_string()),
                    id: id.to_string(),
                    deleted: true,
                    doc: None,
                },
            ));
    }

    pub fn doc_count(&self, database: &str) -> usize {
        self.docs
            .lock()
            .unwrap()
            .get(database)
            .map(|m| m.len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl PrimaryStore for MockPrimaryStore {
    async fn list_databases(&self) -> Result<Vec<String>> {
        Ok(self.databases.lock().unwrap().clone())
    }

    async fn current_sequence(&self, _database: &str) -> Result<SequenceToken> {
        Ok(SequenceToken(self.seq.load(Ordering::SeqCst).to_string()))
    }

    async fn changes_since(
        &self,
        database: &str,
        since: &SequenceToken,
        limit: usize,
        _wait: Duration,
    ) -> Result<ChangeBatch> {
        let since = seq_num(since);
        let events: Vec<ChangeEvent> = self
            .events
            .lock()
            .unwrap()
            .get(database)
            .map(|log| {
                log.iter()
                    .filter(|(seq, _)| *seq > since)
                    .take(limit)
                    .map(|(_, event)| event.clone())
                    .collect()
            })
            .unwrap_or_default();

        let last_seq = events
            .last()
            .map(|e| e.seq.clone())
            .unwrap_or_else(|| SequenceToken(since.to_string()));

        if events.is_empty() {
            // Keep the watcher's poll loop from spinning hot in tests.
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        Ok(ChangeBatch { events, last_seq })
    }

    async fn read_page(
        &self,
        database: &str,
        start_after: Option<&str>,
        limit: usize,
    ) -> Result<DocumentPage> {
        let docs = self.docs.lock().unwrap();
        let db = docs
            .get(database)
            .ok_or_else(|| GriddleError::Store(format!("no such database {}", database)))?;

        let rows: Vec<SourceRow> = db
            .iter()
            .filter(|(id, _)| match start_after {
                Some(start) => id.as_str() > start,
                None => true,
            })
            .take(limit)
            .map(|(id, doc)| SourceRow {
                id: id.clone(),
                document: doc.clone(),
            })
            .collect();

        let next_start = if rows.len() == limit {
            rows.last().map(|r| r.id.clone())
        } else {
            None
        };

        Ok(DocumentPage { rows, next_start })
    }
}

#[derive(Default)]
struct MockIndex {
    #[allow(dead_code)]
    mapping: Value,
    meta: Option<IndexMetadata>,
    docs: HashMap<String, Value>,
}

/// Search engine backed by maps, recording every bulk batch it accepts.
#[derive(Default)]
pub struct MockSearchIndex {
    indices: Mutex<HashMap<String, MockIndex>>,
    aliases: Mutex<HashMap<String, String>>,
    bulk_batches: Mutex<Vec<Vec<PendingOperation>>>,
    pub fail_bulk: AtomicBool,
}

impl MockSearchIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed_index(&self, name: &str, meta: Option<IndexMetadata>) {
        self.indices.lock().unwrap().insert(
            name.to_string(),
            MockIndex {
                mapping: Value::Null,
                meta,
                docs: HashMap::new(),
            },
        );
    }

    pub fn seed_doc(&self, index: &str, id: &str, doc: Value) {
        if let Some(idx) = self.indices.lock().unwrap().get_mut(index) {
            idx.docs.insert(id.to_string(), doc);
        }
    }

    pub fn seed_alias(&self, alias: &str, index: &str) {
        self.aliases
            .lock()
            .unwrap()
            .insert(alias.to_string(), index.to_string());
    }

    pub fn bulk_sizes(&self) -> Vec<usize> {
        self.bulk_batches
            .lock()
            .unwrap()
            .iter()
            .map(|b| b.len())
            .collect()
    }

    pub fn bulk_doc_ids(&self) -> Vec<String> {
        self.bulk_batches
            .lock()
            .unwrap()
            .iter()
            .flatten()
            .map(|op| op.doc_id().to_string())
            .collect()
    }

    pub fn doc_count(&self, index: &str) -> usize {
        self.indices
            .lock()
            .unwrap()
            .get(index)
            .map(|i| i.docs.len())
            .unwrap_or(0)
    }

    pub fn get_doc(&self, index: &str, id: &str) -> Option<Value> {
        self.indices
            .lock()
            .unwrap()
            .get(index)
            .and_then(|i| i.docs.get(id).cloned())
    }

    pub fn has_index(&self, name: &str) -> bool {
        self.indices.lock().unwrap().contains_key(name)
    }

    pub fn alias_of(&self, alias: &str) -> Option<String> {
        self.aliases.lock().unwrap().get(alias).cloned()
    }

    pub fn metadata_of(&self, index: &str) -> Option<IndexMetadata> {
        self.indices
            .lock()
            .unwrap()
            .get(index)
            .and_then(|i| i.meta.clone())
    }

    /// Document count reached through the alias, the way readers see it.
    pub fn doc_count_via_alias(&self, alias: &str) -> usize {
        self.alias_of(alias)
            .map(|index| self.doc_count(&index))
            .unwrap_or(0)
    }
}

#[async_trait]
impl SearchIndex for MockSearchIndex {
    async fn index_exists(&self, name: &str) -> Result<bool> {
        Ok(self.indices.lock().unwrap().contains_key(name))
    }

    async fn create_index(&self, name: &str, mapping: &Value) -> Result<()> {
        self.indices.lock().unwrap().insert(
            name.to_string(),
            MockIndex {
                mapping: mapping.clone(),
                meta: None,
                docs: HashMap::new(),
            },
        );
        Ok(())
    }

    async fn delete_index(&self, name: &str) -> Result<()> {
        self.indices.lock().unwrap().remove(name);
        Ok(())
    }

    async fn alias_exists(&self, alias: &str) -> Result<bool> {
        Ok(self.aliases.lock().unwrap().contains_key(alias))
    }

    async fn alias_target(&self, alias: &str) -> Result<Option<String>> {
        Ok(self.aliases.lock().unwrap().get(alias).cloned())
    }

    async fn create_alias(&self, alias: &str, index: &str) -> Result<()> {
        self.aliases
            .lock()
            .unwrap()
            .insert(alias.to_string(), index.to_string());
        Ok(())
    }

    async fn swap_alias(&self, alias: &str, _from: &str, to: &str) -> Result<()> {
        self.aliases
            .lock()
            .unwrap()
            .insert(alias.to_string(), to.to_string());
        Ok(())
    }

    async fn read_metadata(&self, index: &str) -> Result<Option<IndexMetadata>> {
        Ok(self
            .indices
            .lock()
            .unwrap()
            .get(index)
            .and_then(|i| i.meta.clone()))
    }

    async fn write_metadata(&self, index: &str, meta: &IndexMetadata) -> Result<()> {
        match self.indices.lock().unwrap().get_mut(index) {
            Some(idx) => {
                idx.meta = Some(meta.clone());
                Ok(())
            }
            None => Err(GriddleError::Search(format!("no such index {}", index))),
        }
    }

    async fn bulk(&self, operations: &[PendingOperation]) -> Result<BulkSummary> {
        if self.fail_bulk.load(Ordering::SeqCst) {
            return Err(GriddleError::BulkFailed {
                attempted: operations.len(),
                reason: "mock engine down".to_string(),
            });
        }

        let mut indices = self.indices.lock().unwrap();
        let mut summary = BulkSummary::default();

        for op in operations {
            match indices.get_mut(op.index()) {
                Some(idx) => {
                    match op {
                        PendingOperation::Upsert {
                            doc_id, document, ..
                        } => {
                            idx.docs.insert(doc_id.clone(), document.clone());
                        }
                        PendingOperation::Delete { doc_id, .. } => {
                            // Absent is fine: applied no-op.
                            idx.docs.remove(doc_id);
                        }
                    }
                    summary.applied += 1;
                }
                None => summary.rejected.push(BulkItemFailure {
                    doc_id: op.doc_id().to_string(),
                    index: op.index().to_string(),
                    reason: "index_not_found".to_string(),
                }),
            }
        }

        self.bulk_batches
            .lock()
            .unwrap()
            .push(operations.to_vec());
        Ok(summary)
    }

    async fn reindex(&self, source: &str, dest: &str) -> Result<u64> {
        let mut indices = self.indices.lock().unwrap();
        let docs = indices
            .get(source)
            .map(|i| i.docs.clone())
            .ok_or_else(|| GriddleError::Search(format!("no such index {}", source)))?;
        let count = docs.len() as u64;
        if let Some(dst) = indices.get_mut(dest) {
            dst.docs.extend(docs);
        }
        Ok(count)
    }

    async fn refresh(&self, _index: &str) -> Result<()> {
        Ok(())
    }
}

/// A v3 user record shaped like production data.
pub fn user_doc(id: &str, title: &str) -> Value {
    serde_json::json!({
        "_id": id,
        "schema_version": 3,
        "title": title,
        "content": format!("body of {}", title),
        "tags": ["test"],
        "pinned": false,
        "created_at": "2024-05-01T00:00:00Z",
        "updated_at": "2024-05-01T00:00:00Z"
    })
}

/// Config tuned for tests: big idle window and checkpoint interval so only
/// the triggers under test fire.
pub fn test_config(batch_size: usize) -> griddle::SyncConfig {
    griddle::SyncConfig {
        batch_size,
        batch_idle_ms: 60_000,
        checkpoint_interval_secs: 3600,
        poll_wait_ms: 50,
        feed_retry_ms: 10,
        backfill_page_size: 50,
        retry_base_ms: 10,
        retry_cap_ms: 100,
        ..griddle::SyncConfig::default()
    }
}
