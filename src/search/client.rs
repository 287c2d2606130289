//! HTTP adapter for an Elasticsearch-style search engine.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;

use super::{BulkItemFailure, BulkSummary, IndexMetadata, SearchIndex};
use crate::error::{GriddleError, Result};
use crate::types::PendingOperation;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
// Reindex copies whole indices server-side; give it room.
const REINDEX_TIMEOUT: Duration = Duration::from_secs(600);

/// Talks to the search engine over its HTTP API: index CRUD, `_aliases`
/// actions (the atomic swap), mapping `_meta` annotations, NDJSON `_bulk`,
/// and `_reindex`.
pub struct HttpSearchIndex {
    base_url: String,
    http_client: reqwest::Client,
}

#[derive(Deserialize)]
struct BulkResponse {
    #[serde(default)]
    errors: bool,
    #[serde(default)]
    items: Vec<Value>,
}

#[derive(Deserialize)]
struct ReindexResponse {
    #[serde(default)]
    total: u64,
}

impl HttpSearchIndex {
    pub fn new(base_url: String) -> Self {
        let http_client = reqwest::Client::builder()
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http_client,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    async fn alias_actions(&self, actions: Value) -> Result<()> {
        let response = self
            .http_client
            .post(self.url("_aliases"))
            .json(&json!({ "actions": actions }))
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .map_err(|e| GriddleError::Search(format!("alias actions: {}", e)))?;

        if !response.status().is_success() {
            return Err(GriddleError::Search(format!(
                "alias actions returned {}",
                response.status()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl SearchIndex for HttpSearchIndex {
    async fn index_exists(&self, name: &str) -> Result<bool> {
        let response = self
            .http_client
            .head(self.url(name))
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .map_err(|e| GriddleError::Search(format!("head {}: {}", name, e)))?;

        match response.status().as_u16() {
            200 => Ok(true),
            404 => Ok(false),
            status => Err(GriddleError::Search(format!(
                "head {} returned {}",
                name, status
            ))),
        }
    }

    async fn create_index(&self, name: &str, mapping: &Value) -> Result<()> {
        let response = self
            .http_client
            .put(self.url(name))
            .json(&json!({ "mappings": mapping }))
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .map_err(|e| GriddleError::Search(format!("create {}: {}", name, e)))?;

        if !response.status().is_success() {
            return Err(GriddleError::Search(format!(
                "create {} returned {}",
                name,
                response.status()
            )));
        }
        Ok(())
    }

    async fn delete_index(&self, name: &str) -> Result<()> {
        let response = self
            .http_client
            .delete(self.url(name))
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .map_err(|e| GriddleError::Search(format!("delete {}: {}", name, e)))?;

        // Deleting an index that is already gone is fine.
        if !response.status().is_success() && response.status().as_u16() != 404 {
            return Err(GriddleError::Search(format!(
                "delete {} returned {}",
                name,
                response.status()
            )));
        }
        Ok(())
    }

    async fn alias_exists(&self, alias: &str) -> Result<bool> {
        Ok(self.alias_target(alias).await?.is_some())
    }

    async fn alias_target(&self, alias: &str) -> Result<Option<String>> {
        let response = self
            .http_client
            .get(self.url(&format!("_alias/{}", alias)))
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .map_err(|e| GriddleError::Search(format!("alias {}: {}", alias, e)))?;

        if response.status().as_u16() == 404 {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(GriddleError::Search(format!(
                "alias {} returned {}",
                alias,
                response.status()
            )));
        }

        // Response is keyed by the concrete index name the alias resolves to.
        let body: Value = response
            .json()
            .await
            .map_err(|e| GriddleError::Search(format!("parse alias {}: {}", alias, e)))?;

        Ok(body
            .as_object()
            .and_then(|obj| obj.keys().next())
            .map(|name| name.to_string()))
    }

    async fn create_alias(&self, alias: &str, index: &str) -> Result<()> {
        self.alias_actions(json!([
            { "add": { "index": index, "alias": alias } }
        ]))
        .await
    }

    async fn swap_alias(&self, alias: &str, from: &str, to: &str) -> Result<()> {
        // Remove-old and add-new in one actions call: readers always resolve
        // the alias to exactly one index.
        self.alias_actions(json!([
            { "remove": { "index": from, "alias": alias } },
            { "add":    { "index": to,   "alias": alias } }
        ]))
        .await
    }

    async fn read_metadata(&self, index: &str) -> Result<Option<IndexMetadata>> {
        let response = self
            .http_client
            .get(self.url(&format!("{}/_mapping", index)))
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .map_err(|e| GriddleError::Search(format!("mapping {}: {}", index, e)))?;

        if response.status().as_u16() == 404 {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(GriddleError::Search(format!(
                "mapping {} returned {}",
                index,
                response.status()
            )));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| GriddleError::Search(format!("parse mapping {}: {}", index, e)))?;

        // Keyed by concrete index name; callers pass concrete names but an
        // alias would resolve to one entry all the same.
        let meta = body
            .as_object()
            .and_then(|obj| obj.values().next())
            .and_then(|entry| entry.get("mappings"))
            .and_then(|mappings| mappings.get("_meta"));

        match meta {
            None => Ok(None),
            Some(value) => serde_json::from_value::<IndexMetadata>(value.clone())
                .map(Some)
                .map_err(|_| GriddleError::InvalidMetadata(index.to_string())),
        }
    }

    async fn write_metadata(&self, index: &str, meta: &IndexMetadata) -> Result<()> {
        let meta_value =
            serde_json::to_value(meta).map_err(|e| GriddleError::Json(e.to_string()))?;

        let response = self
            .http_client
            .put(self.url(&format!("{}/_mapping", index)))
            .json(&json!({ "_meta": meta_value }))
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .map_err(|e| GriddleError::Search(format!("put mapping {}: {}", index, e)))?;

        if !response.status().is_success() {
            return Err(GriddleError::Search(format!(
                "put mapping {} returned {}",
                index,
                response.status()
            )));
        }
        Ok(())
    }

    async fn bulk(&self, operations: &[PendingOperation]) -> Result<BulkSummary> {
        if operations.is_empty() {
            return Ok(BulkSummary::default());
        }

        let mut body = String::new();
        for op in operations {
            match op {
                PendingOperation::Upsert {
                    index,
                    doc_id,
                    document,
                } => {
                    body.push_str(
                        &json!({ "index": { "_index": index, "_id": doc_id } }).to_string(),
                    );
                    body.push('\n');
                    body.push_str(&document.to_string());
                    body.push('\n');
                }
                PendingOperation::Delete { index, doc_id } => {
                    body.push_str(
                        &json!({ "delete": { "_index": index, "_id": doc_id } }).to_string(),
                    );
                    body.push('\n');
                }
            }
        }

        let response = self
            .http_client
            .post(self.url("_bulk"))
            .header("content-type", "application/x-ndjson")
            .body(body)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .map_err(|e| GriddleError::BulkFailed {
                attempted: operations.len(),
                reason: e.to_string(),
            })?;

        if !response.status().is_success() {
            return Err(GriddleError::BulkFailed {
                attempted: operations.len(),
                reason: format!("engine returned {}", response.status()),
            });
        }

        let parsed: BulkResponse = response.json().await.map_err(|e| GriddleError::BulkFailed {
            attempted: operations.len(),
            reason: format!("parse response: {}", e),
        })?;

        let mut summary = BulkSummary::default();
        if !parsed.errors {
            summary.applied = operations.len();
            return Ok(summary);
        }

        for (op, item) in operations.iter().zip(parsed.items.iter()) {
            // Each item is keyed by its action ("index" or "delete").
            let result = item
                .as_object()
                .and_then(|obj| obj.values().next())
                .cloned()
                .unwrap_or(Value::Null);

            let status = result.get("status").and_then(Value::as_u64).unwrap_or(0);
            let is_delete = matches!(op, PendingOperation::Delete { .. });

            // Deleting a document that was never indexed reports 404 but is
            // an applied no-op for our purposes.
            if status < 300 || (is_delete && status == 404) {
                summary.applied += 1;
            } else {
                let reason = result
                    .get("error")
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| format!("status {}", status));
                summary.rejected.push(BulkItemFailure {
                    doc_id: op.doc_id().to_string(),
                    index: op.index().to_string(),
                    reason,
                });
            }
        }

        Ok(summary)
    }

    async fn reindex(&self, source: &str, dest: &str) -> Result<u64> {
        let response = self
            .http_client
            .post(self.url("_reindex?refresh=true"))
            .json(&json!({
                "source": { "index": source },
                "dest":   { "index": dest }
            }))
            .timeout(REINDEX_TIMEOUT)
            .send()
            .await
            .map_err(|e| GriddleError::Search(format!("reindex {} -> {}: {}", source, dest, e)))?;

        if !response.status().is_success() {
            return Err(GriddleError::Search(format!(
                "reindex {} -> {} returned {}",
                source,
                dest,
                response.status()
            )));
        }

        let parsed: ReindexResponse = response
            .json()
            .await
            .map_err(|e| GriddleError::Search(format!("parse reindex response: {}", e)))?;

        Ok(parsed.total)
    }

    async fn refresh(&self, index: &str) -> Result<()> {
        let response = self
            .http_client
            .post(self.url(&format!("{}/_refresh", index)))
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .map_err(|e| GriddleError::Search(format!("refresh {}: {}", index, e)))?;

        if !response.status().is_success() {
            return Err(GriddleError::Search(format!(
                "refresh {} returned {}",
                index,
                response.status()
            )));
        }
        Ok(())
    }
}
