use serde::{Deserialize, Serialize};

/// Windowed activity summary for a page, as reported by the hot-page tracker.
///
/// Non-hot pages report the zero value so rate-based callers never have to
/// special-case cold pages.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PageStats {
    pub edits_last_5min: u64,
    pub edits_last_hour: u64,
    pub unique_editors: u64,
    /// Signed byte delta of the most recent edit, `0` when unknown.
    pub last_byte_change: i64,
    pub total_edits_in_window: u64,
}

impl PageStats {
    /// Per-minute edit rate over the trailing five minutes.
    pub fn rate_5m(&self) -> f64 {
        self.edits_last_5min as f64 / 5.0
    }

    /// Per-minute edit rate over the trailing hour.
    pub fn rate_1h(&self) -> f64 {
        self.edits_last_hour as f64 / 60.0
    }
}
