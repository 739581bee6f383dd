//! Durable search store client.
//!
//! Documents go out over the bulk NDJSON API into daily indices; retention
//! is delegated to an index lifecycle policy created once at startup.

use crate::error::{Result, SurgeError};
use async_trait::async_trait;
use chrono::DateTime;
use serde_json::json;
use std::fmt;
use tracing::{debug, info};
use wikisurge_model::IndexedDocument;

/// Where flushed batches land. The production implementation speaks the
/// Elasticsearch bulk API; tests substitute their own.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BulkSink: Send + Sync {
    async fn bulk_index(&self, index: &str, docs: &[IndexedDocument]) -> Result<()>;

    /// Creates the lifecycle policy and index template. Idempotent;
    /// called once at startup.
    async fn ensure_retention(&self, retention_days: u32) -> Result<()>;
}

/// Daily index name from the document's event time, so broker replays
/// land in the same index they originally did.
pub fn index_name(prefix: &str, timestamp: i64) -> String {
    let day = DateTime::from_timestamp(timestamp, 0)
        .map(|dt| dt.format("%Y-%m-%d").to_string())
        .unwrap_or_else(|| "unknown".to_string());
    format!("{prefix}-{day}")
}

pub struct ElasticSink {
    http: reqwest::Client,
    base_url: String,
    index_prefix: String,
}

impl fmt::Debug for ElasticSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ElasticSink")
            .field("base_url", &self.base_url)
            .field("index_prefix", &self.index_prefix)
            .finish()
    }
}

impl ElasticSink {
    pub fn new(base_url: &str, index_prefix: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            index_prefix: index_prefix.to_string(),
        }
    }

    pub fn index_prefix(&self) -> &str {
        &self.index_prefix
    }

    fn policy_name(&self) -> String {
        format!("{}-retention", self.index_prefix)
    }
}

#[async_trait]
impl BulkSink for ElasticSink {
    async fn bulk_index(&self, index: &str, docs: &[IndexedDocument]) -> Result<()> {
        if docs.is_empty() {
            return Ok(());
        }

        let mut body = String::with_capacity(docs.len() * 256);
        for doc in docs {
            body.push_str(&serde_json::to_string(
                &json!({ "index": { "_index": index, "_id": doc.id } }),
            )?);
            body.push('\n');
            body.push_str(&serde_json::to_string(doc)?);
            body.push('\n');
        }

        let response = self
            .http
            .post(format!("{}/_bulk", self.base_url))
            .header("content-type", "application/x-ndjson")
            .body(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(SurgeError::Sink(format!("bulk request failed: {status}")));
        }

        let reply: serde_json::Value = response.json().await?;
        if reply["errors"].as_bool().unwrap_or(false) {
            return Err(SurgeError::Sink("bulk reply contains item errors".into()));
        }

        debug!(index, count = docs.len(), "bulk indexed");
        Ok(())
    }

    async fn ensure_retention(&self, retention_days: u32) -> Result<()> {
        let policy = json!({
            "policy": {
                "phases": {
                    "delete": {
                        "min_age": format!("{retention_days}d"),
                        "actions": { "delete": {} }
                    }
                }
            }
        });
        let response = self
            .http
            .put(format!("{}/_ilm/policy/{}", self.base_url, self.policy_name()))
            .json(&policy)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(SurgeError::Sink(format!(
                "failed to create lifecycle policy: {}",
                response.status()
            )));
        }

        let template = json!({
            "index_patterns": [format!("{}-*", self.index_prefix)],
            "template": {
                "settings": {
                    "index.lifecycle.name": self.policy_name()
                }
            }
        });
        let response = self
            .http
            .put(format!(
                "{}/_index_template/{}",
                self.base_url, self.index_prefix
            ))
            .json(&template)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(SurgeError::Sink(format!(
                "failed to create index template: {}",
                response.status()
            )));
        }

        info!(
            policy = %self.policy_name(),
            retention_days,
            "index lifecycle policy in place"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_names_rotate_daily() {
        // 2023-11-14T22:13:20Z
        assert_eq!(
            index_name("wikisurge-edits", 1_700_000_000),
            "wikisurge-edits-2023-11-14"
        );
        // Next day
        assert_eq!(
            index_name("wikisurge-edits", 1_700_000_000 + 86_400),
            "wikisurge-edits-2023-11-15"
        );
    }
}
