//! Storage key namespaces.
//!
//! Every component owns the namespaces listed on its constructor; nothing
//! else writes them. Pages are identified by their partition key
//! (`wiki:title`) throughout.

#[derive(Debug, Clone, Copy)]
pub struct Keys;

impl Keys {
    /// Pre-promotion activity counter, short TTL.
    pub fn activity(page: &str) -> String {
        format!("activity:{page}")
    }

    /// Ordered edit window, score = unix timestamp, member = `ts:edit_id`.
    pub fn hot_window(page: &str) -> String {
        format!("hot:window:{page}")
    }

    pub fn hot_meta(page: &str) -> String {
        format!("hot:meta:{page}")
    }

    /// Per-editor counts on the tracker's window horizon.
    pub fn hot_editors(page: &str) -> String {
        format!("hot:editors:{page}")
    }

    /// Recent byte deltas, newest first, capped.
    pub fn hot_changes(page: &str) -> String {
        format!("hot:changes:{page}")
    }

    /// Ordered registry of all hot pages, score = last edit timestamp.
    /// Backs the promotion cardinality check and background cleanup.
    pub fn hot_pages() -> &'static str {
        "hot:pages"
    }

    pub fn trending_global() -> &'static str {
        "trending:global"
    }

    /// Hash page -> unix seconds of the last score write.
    pub fn trending_updated() -> &'static str {
        "trending:updated"
    }

    pub fn editwar_editors(page: &str) -> String {
        format!("editwar:editors:{page}")
    }

    pub fn editwar_changes(page: &str) -> String {
        format!("editwar:changes:{page}")
    }

    /// Marker read by the selective indexer while a war is considered live.
    pub fn editwar_active(page: &str) -> String {
        format!("editwar:active:{page}")
    }

    pub fn editwar_cooldown(page: &str) -> String {
        format!("editwar:cooldown:{page}")
    }

    /// First-seen timestamp of the current war window.
    pub fn editwar_started(page: &str) -> String {
        format!("editwar:started:{page}")
    }

    pub fn spike_cooldown(page: &str) -> String {
        format!("spike:cooldown:{page}")
    }

    /// Operator-curated set of always-indexed pages.
    pub fn watchlist() -> &'static str {
        "watchlist"
    }

    /// Poison messages from any consumer, with original bytes and reason.
    pub fn dead_letter() -> &'static str {
        "deadletter:edits"
    }
}
