use crate::edit::Edit;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Why the selective indexer chose to persist an edit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexReason {
    Watchlist,
    Trending,
    Spike,
    EditWar,
}

impl fmt::Display for IndexReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IndexReason::Watchlist => write!(f, "watchlist"),
            IndexReason::Trending => write!(f, "trending"),
            IndexReason::Spike => write!(f, "spike"),
            IndexReason::EditWar => write!(f, "editwar"),
        }
    }
}

/// Deterministic document id over (wiki, revision id, timestamp).
///
/// Replays of the same edit therefore upsert instead of duplicating.
pub fn document_id(wiki: &str, edit_id: u64, timestamp: i64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(wiki.as_bytes());
    hasher.update(b":");
    hasher.update(edit_id.to_be_bytes());
    hasher.update(b":");
    hasher.update(timestamp.to_be_bytes());
    let digest = hasher.finalize();
    // 128 bits is plenty for uniqueness and keeps the id readable in queries.
    digest[..16].iter().map(|b| format!("{b:02x}")).collect()
}

/// What the selective indexer writes to the durable search store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexedDocument {
    pub id: String,
    pub wiki: String,
    pub language: String,
    pub title: String,
    pub user: String,
    pub bot: bool,
    pub timestamp: i64,
    pub byte_delta: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    pub indexed_reason: IndexReason,
}

impl IndexedDocument {
    pub fn from_edit(edit: &Edit, reason: IndexReason) -> Self {
        Self {
            id: document_id(&edit.wiki, edit.id, edit.timestamp),
            wiki: edit.wiki.clone(),
            language: edit.language().to_string(),
            title: edit.title.clone(),
            user: edit.user.clone(),
            bot: edit.bot,
            timestamp: edit.timestamp,
            byte_delta: edit.byte_delta(),
            comment: edit.comment.clone(),
            indexed_reason: reason,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::edit::EventType;

    #[test]
    fn document_id_is_deterministic() {
        let a = document_id("enwiki", 12345, 1_700_000_000);
        let b = document_id("enwiki", 12345, 1_700_000_000);
        assert_eq!(a, b);
        assert_eq!(a.len(), 32);
    }

    #[test]
    fn document_id_distinguishes_inputs() {
        let base = document_id("enwiki", 12345, 1_700_000_000);
        assert_ne!(base, document_id("dewiki", 12345, 1_700_000_000));
        assert_ne!(base, document_id("enwiki", 12346, 1_700_000_000));
        assert_ne!(base, document_id("enwiki", 12345, 1_700_000_001));
    }

    #[test]
    fn from_edit_derives_language_and_delta() {
        let edit = Edit {
            id: 9,
            event_type: EventType::Edit,
            title: "Rust".into(),
            user: "Bob".into(),
            bot: false,
            wiki: "dewiki".into(),
            old_length: Some(500),
            new_length: Some(420),
            timestamp: 1_700_000_000,
            comment: Some("trim".into()),
        };
        let doc = IndexedDocument::from_edit(&edit, IndexReason::Trending);
        assert_eq!(doc.language, "de");
        assert_eq!(doc.byte_delta, -80);
        assert_eq!(doc.indexed_reason, IndexReason::Trending);
        assert_eq!(doc.id, document_id("dewiki", 9, 1_700_000_000));
    }
}
