//! HTTP adapter for a CouchDB-style primary store.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;

use super::{ChangeBatch, DocumentPage, PrimaryStore, SourceRow};
use crate::error::{GriddleError, Result};
use crate::types::{ChangeEvent, SequenceToken};

/// Talks to the primary store over its HTTP API: `/_all_dbs` for discovery,
/// longpoll `/{db}/_changes` for the live feed, `/{db}/_all_docs` for
/// backfill pages, and the database info document for `update_seq`.
pub struct HttpPrimaryStore {
    base_url: String,
    http_client: reqwest::Client,
}

#[derive(Deserialize)]
struct ChangesResponse {
    results: Vec<ChangeRow>,
    last_seq: Value,
}

#[derive(Deserialize)]
struct ChangeRow {
    seq: Value,
    id: String,
    #[serde(default)]
    deleted: bool,
    doc: Option<Value>,
}

#[derive(Deserialize)]
struct AllDocsResponse {
    rows: Vec<AllDocsRow>,
}

#[derive(Deserialize)]
struct AllDocsRow {
    id: String,
    doc: Option<Value>,
}

#[derive(Deserialize)]
struct DatabaseInfo {
    update_seq: Value,
}

// Sequence tokens arrive as strings on modern stores and as bare integers on
// older ones; either way they stay opaque.
fn token_from_value(v: &Value) -> SequenceToken {
    match v {
        Value::String(s) => SequenceToken(s.clone()),
        other => SequenceToken(other.to_string()),
    }
}

impl HttpPrimaryStore {
    pub fn new(base_url: String) -> Self {
        let http_client = reqwest::Client::builder()
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http_client,
        }
    }

    fn db_url(&self, database: &str, path: &str) -> String {
        if path.is_empty() {
            format!("{}/{}", self.base_url, database)
        } else {
            format!("{}/{}/{}", self.base_url, database, path)
        }
    }
}

#[async_trait]
impl PrimaryStore for HttpPrimaryStore {
    async fn list_databases(&self) -> Result<Vec<String>> {
        let url = format!("{}/_all_dbs", self.base_url);

        let response = self
            .http_client
            .get(&url)
            .timeout(Duration::from_secs(10))
            .send()
            .await
            .map_err(|e| GriddleError::Store(format!("list databases: {}", e)))?;

        if !response.status().is_success() {
            return Err(GriddleError::Store(format!(
                "list databases returned {}",
                response.status()
            )));
        }

        response
            .json::<Vec<String>>()
            .await
            .map_err(|e| GriddleError::Store(format!("parse database list: {}", e)))
    }

    async fn current_sequence(&self, database: &str) -> Result<SequenceToken> {
        let url = self.db_url(database, "");

        let response = self
            .http_client
            .get(&url)
            .timeout(Duration::from_secs(10))
            .send()
            .await
            .map_err(|e| GriddleError::Store(format!("info for {}: {}", database, e)))?;

        if !response.status().is_success() {
            return Err(GriddleError::Store(format!(
                "info for {} returned {}",
                database,
                response.status()
            )));
        }

        let info: DatabaseInfo = response
            .json()
            .await
            .map_err(|e| GriddleError::Store(format!("parse info for {}: {}", database, e)))?;

        Ok(token_from_value(&info.update_seq))
    }

    async fn changes_since(
        &self,
        database: &str,
        since: &SequenceToken,
        limit: usize,
        wait: Duration,
    ) -> Result<ChangeBatch> {
        let url = self.db_url(database, "_changes");

        let query: Vec<(&str, String)> = vec![
            ("feed", "longpoll".to_string()),
            ("include_docs", "true".to_string()),
            ("since", since.as_str().to_string()),
            ("limit", limit.to_string()),
            ("timeout", wait.as_millis().to_string()),
        ];

        let response = self
            .http_client
            .get(&url)
            .query(&query)
            // Allow for the server holding the longpoll open plus transit.
            .timeout(wait + Duration::from_secs(15))
            .send()
            .await
            .map_err(|e| GriddleError::Store(format!("changes for {}: {}", database, e)))?;

        if !response.status().is_success() {
            return Err(GriddleError::Store(format!(
                "changes for {} returned {}",
                database,
                response.status()
            )));
        }

        let parsed: ChangesResponse = response
            .json()
            .await
            .map_err(|e| GriddleError::Store(format!("parse changes for {}: {}", database, e)))?;

        let events = parsed
            .results
            .into_iter()
            .map(|row| ChangeEvent {
                seq: token_from_value(&row.seq),
                id: row.id,
                deleted: row.deleted,
                doc: row.doc,
            })
            .collect();

        Ok(ChangeBatch {
            events,
            last_seq: token_from_value(&parsed.last_seq),
        })
    }

    async fn read_page(
        &self,
        database: &str,
        start_after: Option<&str>,
        limit: usize,
    ) -> Result<DocumentPage> {
        let url = self.db_url(database, "_all_docs");

        let mut query: Vec<(&str, String)> = vec![
            ("include_docs", "true".to_string()),
            ("limit", limit.to_string()),
        ];
        if let Some(start) = start_after {
            // startkey_docid is inclusive; skip past the previous page's
            // final row.
            query.push(("startkey_docid", start.to_string()));
            query.push(("skip", "1".to_string()));
        }

        let response = self
            .http_client
            .get(&url)
            .query(&query)
            .timeout(Duration::from_secs(30))
            .send()
            .await
            .map_err(|e| GriddleError::Store(format!("read {}: {}", database, e)))?;

        if !response.status().is_success() {
            return Err(GriddleError::Store(format!(
                "read {} returned {}",
                database,
                response.status()
            )));
        }

        let parsed: AllDocsResponse = response
            .json()
            .await
            .map_err(|e| GriddleError::Store(format!("parse rows for {}: {}", database, e)))?;

        let fetched = parsed.rows.len();
        // A full page means there may be more; resume after its final raw
        // row even when trailing rows get filtered out below.
        let next_start = if fetched == limit {
            parsed.rows.last().map(|row| row.id.clone())
        } else {
            None
        };

        let rows: Vec<SourceRow> = parsed
            .rows
            .into_iter()
            // Design documents are never replicated.
            .filter(|row| !row.id.starts_with("_design/"))
            .filter_map(|row| {
                row.doc.map(|document| SourceRow {
                    id: row.id,
                    document,
                })
            })
            .collect();

        Ok(DocumentPage { rows, next_start })
    }
}
