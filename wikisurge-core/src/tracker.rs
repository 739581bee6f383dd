//! Hot-page tracker: two-stage promotion and windowed edit history.
//!
//! Most pages receive a single edit and never return, so full tracking is
//! gated behind a cheap activity counter. Only pages that cross
//! `hot_threshold` inside `activity_ttl` get a window, and the whole hot set
//! is capped by `max_tracked` as a circuit breaker.

use crate::error::Result;
use crate::keys::Keys;
use crate::metrics::Metrics;
use crate::store::{SharedStore, WindowAppend};
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use wikisurge_config::TrackerConfig;
use wikisurge_model::{Edit, PageStats};

/// Read access to hot-page state for the rate-based detectors.
///
/// The spike detector and the selective indexer consume stats through this
/// seam; neither touches the tracker's keys directly.
#[async_trait]
pub trait PageStatsSource: Send + Sync {
    /// Windowed stats for a page at stream time `now`. Non-hot pages get
    /// the zero value.
    async fn page_stats(&self, page: &str, now: i64) -> Result<PageStats>;

    async fn is_hot(&self, page: &str) -> Result<bool>;
}

pub struct HotPageTracker {
    store: SharedStore,
    config: TrackerConfig,
    metrics: Arc<Metrics>,
}

impl fmt::Debug for HotPageTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HotPageTracker")
            .field("config", &self.config)
            .finish()
    }
}

impl HotPageTracker {
    pub fn new(store: SharedStore, config: TrackerConfig, metrics: Arc<Metrics>) -> Self {
        Self {
            store,
            config,
            metrics,
        }
    }

    /// Entry point for every edit on the tracker consumer.
    pub async fn process_edit(&self, edit: &Edit) -> Result<()> {
        let page = edit.page_key();

        if self.is_hot(&page).await? {
            return self.add_edit_to_window(&page, edit).await;
        }

        let activity_key = Keys::activity(&page);
        let count = self.store.incr(&activity_key).await?;
        if count == 1 {
            self.store
                .expire(&activity_key, self.config.activity_ttl)
                .await?;
        }

        if count >= self.config.hot_threshold {
            self.promote(&page, edit).await?;
        } else {
            debug!(page = %page, count, "activity below promotion threshold");
        }
        Ok(())
    }

    /// Promotes a page to full tracking, unless the hot set is at capacity.
    async fn promote(&self, page: &str, edit: &Edit) -> Result<()> {
        let tracked = self.store.zcard(Keys::hot_pages()).await?;
        if tracked >= self.config.max_tracked {
            Metrics::incr(&self.metrics.promotion_rejected);
            warn!(
                page = %page,
                tracked,
                max_tracked = self.config.max_tracked,
                "hot set at capacity, promotion rejected"
            );
            return Ok(());
        }

        self.add_edit_to_window(page, edit).await?;
        // The activity counter has served its purpose; promotion destroys it.
        self.store.del(&[Keys::activity(page)]).await?;

        Metrics::incr(&self.metrics.promotions);
        debug!(page = %page, tracked = tracked + 1, "page promoted to hot tracking");
        Ok(())
    }

    /// Appends one edit to an already-hot page, trimming and refreshing
    /// TTLs in the same storage transaction.
    async fn add_edit_to_window(&self, page: &str, edit: &Edit) -> Result<()> {
        let member = format!("{}:{}", edit.timestamp, edit.id);
        self.store
            .window_append(WindowAppend {
                window_key: &Keys::hot_window(page),
                meta_key: &Keys::hot_meta(page),
                editors_key: &Keys::hot_editors(page),
                changes_key: &Keys::hot_changes(page),
                registry_key: Keys::hot_pages(),
                page,
                member: &member,
                timestamp: edit.timestamp,
                editor: &edit.user,
                byte_delta: edit.byte_delta(),
                window: self.config.window_duration,
                max_members: self.config.max_members_per_page,
                changes_cap: self.config.changes_cap,
                ttl: self.config.hot_ttl(),
            })
            .await
    }

    /// One background sweep: walk the oldest registry entries and drop
    /// pages whose keys expired or whose windows drained.
    pub async fn cleanup(&self) -> Result<u64> {
        let candidates = self
            .store
            .zrange_withscores(Keys::hot_pages(), 0, 99)
            .await?;

        let mut removed = 0;
        for (page, _) in candidates {
            let window_key = Keys::hot_window(&page);
            let alive = self.store.exists(&Keys::hot_meta(&page)).await?
                && self.store.zcard(&window_key).await? > 0;
            if !alive {
                self.store
                    .del(&[
                        window_key,
                        Keys::hot_meta(&page),
                        Keys::hot_editors(&page),
                        Keys::hot_changes(&page),
                    ])
                    .await?;
                self.store.zrem(Keys::hot_pages(), &[page]).await?;
                removed += 1;
            }
        }

        let tracked = self.store.zcard(Keys::hot_pages()).await?;
        Metrics::set_gauge(&self.metrics.hot_pages, tracked);
        Metrics::add(&self.metrics.cleanup_removed, removed);
        if removed > 0 {
            debug!(removed, tracked, "hot-page cleanup pass");
        }
        Ok(removed)
    }

    /// Periodic cleanup until shutdown. Errors are logged and retried on
    /// the next tick.
    pub async fn run_cleanup(self: Arc<Self>, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.cleanup_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("hot-page cleanup shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(err) = self.cleanup().await {
                        warn!("hot-page cleanup failed: {err}");
                    }
                }
            }
        }
    }
}

#[async_trait]
impl crate::consumer::EditHandler for HotPageTracker {
    fn name(&self) -> &'static str {
        "hot-tracker"
    }

    async fn handle(&self, edit: &Edit) -> Result<()> {
        self.process_edit(edit).await
    }
}

#[async_trait]
impl PageStatsSource for HotPageTracker {
    async fn page_stats(&self, page: &str, now: i64) -> Result<PageStats> {
        if !self.is_hot(page).await? {
            return Ok(PageStats::default());
        }

        // Lower bounds are exclusive: an edit exactly five minutes old is
        // baseline, not burst. Scores are integer seconds, so +1 does it.
        let window_key = Keys::hot_window(page);
        let edits_last_5min = self
            .store
            .zcount(&window_key, (now - 300 + 1) as f64, f64::INFINITY)
            .await?;
        let edits_last_hour = self
            .store
            .zcount(&window_key, (now - 3_600 + 1) as f64, f64::INFINITY)
            .await?;
        let total_edits_in_window = self.store.zcard(&window_key).await?;
        let unique_editors = self.store.hlen(&Keys::hot_editors(page)).await?;
        let last_byte_change = self
            .store
            .lrange(&Keys::hot_changes(page), 0, 0)
            .await?
            .first()
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);

        Ok(PageStats {
            edits_last_5min,
            edits_last_hour,
            unique_editors,
            last_byte_change,
            total_edits_in_window,
        })
    }

    async fn is_hot(&self, page: &str) -> Result<bool> {
        self.store.exists(&Keys::hot_meta(page)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use wikisurge_model::EventType;

    fn tracker_with(config: TrackerConfig) -> HotPageTracker {
        HotPageTracker::new(
            Arc::new(MemoryStore::new()),
            config,
            Arc::new(Metrics::default()),
        )
    }

    fn edit(title: &str, id: u64, ts: i64, user: &str) -> Edit {
        Edit {
            id,
            event_type: EventType::Edit,
            title: title.into(),
            user: user.into(),
            bot: false,
            wiki: "enwiki".into(),
            old_length: Some(100),
            new_length: Some(120),
            timestamp: ts,
            comment: None,
        }
    }

    #[tokio::test]
    async fn pages_below_threshold_stay_cold() {
        let tracker = tracker_with(TrackerConfig::default());
        let base = 1_700_000_000;

        tracker.process_edit(&edit("Once", 1, base, "a")).await.unwrap();
        tracker.process_edit(&edit("Once", 2, base + 5, "a")).await.unwrap();

        assert!(!tracker.is_hot("enwiki:Once").await.unwrap());
        assert_eq!(
            tracker.page_stats("enwiki:Once", base + 10).await.unwrap(),
            PageStats::default()
        );
    }

    #[tokio::test]
    async fn third_edit_promotes_and_clears_the_counter() {
        let tracker = tracker_with(TrackerConfig::default());
        let base = 1_700_000_000;

        for i in 0..3 {
            tracker
                .process_edit(&edit("Busy", i, base + i as i64, "a"))
                .await
                .unwrap();
        }

        assert!(tracker.is_hot("enwiki:Busy").await.unwrap());
        assert!(
            !tracker
                .store
                .exists(&Keys::activity("enwiki:Busy"))
                .await
                .unwrap()
        );
        assert_eq!(tracker.metrics.snapshot().promotions, 1);
    }

    #[tokio::test]
    async fn page_stats_distinguish_rate_windows() {
        let tracker = tracker_with(TrackerConfig::default());
        let base = 1_700_000_000;

        // Three old edits promote the page; they sit outside the 5m window
        // of the later read but inside the hour.
        for i in 0..3 {
            tracker
                .process_edit(&edit("News", i, base + i as i64, "a"))
                .await
                .unwrap();
        }
        // Two recent edits from a second editor.
        let later = base + 2_000;
        for i in 10..12 {
            tracker
                .process_edit(&edit("News", i, later + i as i64, "b"))
                .await
                .unwrap();
        }

        let stats = tracker
            .page_stats("enwiki:News", later + 20)
            .await
            .unwrap();
        assert_eq!(stats.edits_last_5min, 2);
        assert_eq!(stats.edits_last_hour, 5);
        assert_eq!(stats.unique_editors, 2);
        assert_eq!(stats.total_edits_in_window, 5);
        assert_eq!(stats.last_byte_change, 20);
    }

    #[tokio::test]
    async fn replayed_edit_does_not_double_count() {
        let tracker = tracker_with(TrackerConfig::default());
        let base = 1_700_000_000;

        for i in 0..3 {
            tracker
                .process_edit(&edit("Replay", i, base + i as i64, "a"))
                .await
                .unwrap();
        }
        let stats_before = tracker.page_stats("enwiki:Replay", base + 10).await.unwrap();

        // Broker redelivery: same id, same timestamp, same member key.
        tracker
            .process_edit(&edit("Replay", 2, base + 2, "a"))
            .await
            .unwrap();
        let stats_after = tracker.page_stats("enwiki:Replay", base + 10).await.unwrap();
        assert_eq!(
            stats_before.total_edits_in_window,
            stats_after.total_edits_in_window
        );
    }

    #[tokio::test]
    async fn capacity_rejects_promotions_and_counts_them() {
        let config = TrackerConfig {
            max_tracked: 2,
            ..TrackerConfig::default()
        };
        let tracker = tracker_with(config);
        let base = 1_700_000_000;

        for title in ["A", "B", "C"] {
            for i in 0..3 {
                tracker
                    .process_edit(&edit(title, i, base + i as i64, "u"))
                    .await
                    .unwrap();
            }
        }

        assert!(tracker.is_hot("enwiki:A").await.unwrap());
        assert!(tracker.is_hot("enwiki:B").await.unwrap());
        assert!(!tracker.is_hot("enwiki:C").await.unwrap());
        assert_eq!(tracker.store.zcard(Keys::hot_pages()).await.unwrap(), 2);
        assert_eq!(tracker.metrics.snapshot().promotion_rejected, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cleanup_drops_expired_pages_and_updates_the_gauge() {
        let config = TrackerConfig {
            window_duration: std::time::Duration::from_secs(60),
            ttl_buffer: std::time::Duration::from_secs(10),
            ..TrackerConfig::default()
        };
        let tracker = tracker_with(config);
        let base = 1_700_000_000;

        for i in 0..3 {
            tracker
                .process_edit(&edit("Fading", i, base + i as i64, "a"))
                .await
                .unwrap();
        }
        tracker.cleanup().await.unwrap();
        assert_eq!(tracker.metrics.snapshot().hot_pages, 1);

        // All keys TTL out after window + buffer with no further edits.
        tokio::time::advance(std::time::Duration::from_secs(71)).await;
        let removed = tracker.cleanup().await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(tracker.metrics.snapshot().hot_pages, 0);
        assert!(!tracker.is_hot("enwiki:Fading").await.unwrap());
    }
}
