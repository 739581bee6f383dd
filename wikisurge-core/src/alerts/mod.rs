//! Alert streams: append-only, length-capped, cheap to tail.
//!
//! Each alert kind has its own stream. Entries carry a few flat fields for
//! quick inspection plus the full serialized record under `data`; the hub
//! and the history reads only ever decode `data`.

pub mod hub;

use crate::error::Result;
use crate::store::SharedStore;
use std::fmt;
use tracing::debug;
use wikisurge_model::{Alert, AlertKind};

#[derive(Clone)]
pub struct AlertPublisher {
    store: SharedStore,
    maxlen: u64,
}

impl fmt::Debug for AlertPublisher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AlertPublisher")
            .field("maxlen", &self.maxlen)
            .finish()
    }
}

impl AlertPublisher {
    pub fn new(store: SharedStore, maxlen: u64) -> Self {
        Self { store, maxlen }
    }

    /// Appends to the kind's stream; the MAXLEN cap trims the oldest
    /// entries on the same write.
    pub async fn publish(&self, alert: &Alert) -> Result<String> {
        let fields = vec![
            ("kind".to_string(), alert.kind().to_string()),
            ("title".to_string(), alert.title.clone()),
            ("wiki".to_string(), alert.wiki.clone()),
            ("severity".to_string(), alert.payload.severity().to_string()),
            ("timestamp".to_string(), alert.timestamp.to_string()),
            ("data".to_string(), serde_json::to_string(alert)?),
        ];
        let id = self
            .store
            .xadd_capped(alert.kind().stream(), &fields, self.maxlen)
            .await?;
        debug!(kind = %alert.kind(), title = %alert.title, id = %id, "alert published");
        Ok(id)
    }

    /// Short-term history straight off the stream, newest first.
    pub async fn recent(&self, kind: AlertKind, count: usize) -> Result<Vec<Alert>> {
        let entries = self.store.xrevrange_count(kind.stream(), count).await?;
        Ok(entries
            .iter()
            .filter_map(|entry| {
                entry
                    .field("data")
                    .and_then(|data| serde_json::from_str(data).ok())
            })
            .collect())
    }
}
