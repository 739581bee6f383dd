use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of revision event carried on the edit stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    Edit,
    New,
    Log,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventType::Edit => write!(f, "edit"),
            EventType::New => write!(f, "new"),
            EventType::Log => write!(f, "log"),
        }
    }
}

/// A single revision event as produced to the broker topic.
///
/// Immutable once produced. The broker partitions on [`Edit::page_key`], so
/// all edits to one page land on the same partition and are totally ordered
/// within a consumer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edit {
    /// Monotonic revision id assigned upstream.
    pub id: u64,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub title: String,
    /// Editor name (account or IP).
    pub user: String,
    #[serde(default)]
    pub bot: bool,
    /// Wiki identifier, e.g. `enwiki`.
    pub wiki: String,
    /// Page byte length before the edit, absent for `new` and `log` events.
    #[serde(default)]
    pub old_length: Option<i64>,
    /// Page byte length after the edit.
    #[serde(default)]
    pub new_length: Option<i64>,
    /// Unix timestamp in seconds.
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

impl Edit {
    /// Broker partitioning key. Same-page ordering depends on every producer
    /// using exactly this key.
    pub fn page_key(&self) -> String {
        format!("{}:{}", self.wiki, self.title)
    }

    /// Signed byte delta of this revision, `0` when either length is absent.
    pub fn byte_delta(&self) -> i64 {
        match (self.old_length, self.new_length) {
            (Some(old), Some(new)) => new - old,
            _ => 0,
        }
    }

    /// Language code derived from the wiki identifier (`enwiki` -> `en`).
    pub fn language(&self) -> &str {
        language_from_wiki(&self.wiki)
    }
}

/// Strips the project suffix from a wiki identifier.
///
/// Identifiers without a recognized suffix (e.g. `wikidatawiki` after the
/// first strip, or oddballs like `metawiki`) fall back to whatever remains,
/// which is what downstream language filters expect.
pub fn language_from_wiki(wiki: &str) -> &str {
    const SUFFIXES: [&str; 8] = [
        "wikibooks",
        "wikinews",
        "wikiquote",
        "wikisource",
        "wikiversity",
        "wikivoyage",
        "wiktionary",
        "wiki",
    ];
    for suffix in SUFFIXES {
        if let Some(prefix) = wiki.strip_suffix(suffix)
            && !prefix.is_empty()
        {
            return prefix;
        }
    }
    wiki
}
