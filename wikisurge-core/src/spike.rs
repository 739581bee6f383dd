//! Spike detector: flags pages whose short-term edit rate is anomalously
//! above their own baseline.

use crate::alerts::AlertPublisher;
use crate::error::Result;
use crate::keys::Keys;
use crate::metrics::Metrics;
use crate::store::SharedStore;
use crate::tracker::PageStatsSource;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};
use wikisurge_config::SpikeConfig;
use wikisurge_model::{Alert, AlertPayload, Edit, PageStats, Severity};

/// 5-minute rate over the baseline rate.
///
/// The baseline is the preceding hour *excluding* the trailing five
/// minutes, so a burst does not inflate its own denominator, and it is
/// floored at 0.1 edits/min so brand-new pages still produce a finite
/// ratio.
pub fn spike_ratio(stats: &PageStats) -> f64 {
    spike_ratio_capped(stats, f64::INFINITY)
}

/// Same, with the baseline additionally capped so always-busy pages are
/// not permanently immune.
pub fn spike_ratio_capped(stats: &PageStats, baseline_cap: f64) -> f64 {
    let baseline_edits = stats.edits_last_hour.saturating_sub(stats.edits_last_5min);
    let rate_1h = (baseline_edits as f64 / 60.0).min(baseline_cap);
    stats.rate_5m() / rate_1h.max(0.1)
}

/// Severity bands over the ratio.
pub fn classify_severity(ratio: f64) -> Severity {
    if ratio >= 50.0 {
        Severity::Critical
    } else if ratio >= 20.0 {
        Severity::High
    } else if ratio >= 10.0 {
        Severity::Medium
    } else {
        Severity::Low
    }
}

pub struct SpikeDetector {
    stats: Arc<dyn PageStatsSource>,
    store: SharedStore,
    publisher: AlertPublisher,
    config: SpikeConfig,
    metrics: Arc<Metrics>,
}

impl fmt::Debug for SpikeDetector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpikeDetector")
            .field("config", &self.config)
            .finish()
    }
}

impl SpikeDetector {
    pub fn new(
        stats: Arc<dyn PageStatsSource>,
        store: SharedStore,
        publisher: AlertPublisher,
        config: SpikeConfig,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            stats,
            store,
            publisher,
            config,
            metrics,
        }
    }

    /// Evaluates one edit. Returns the alert if one fired.
    pub async fn process_edit(&self, edit: &Edit) -> Result<Option<Alert>> {
        if edit.bot {
            return Ok(None);
        }

        let page = edit.page_key();
        let stats = self.stats.page_stats(&page, edit.timestamp).await?;
        // Cold pages report zeros and fall out here.
        if stats.edits_last_5min < self.config.min_edits {
            return Ok(None);
        }

        let ratio = spike_ratio_capped(&stats, self.config.baseline_cap);
        if ratio < self.config.threshold {
            return Ok(None);
        }

        // Cooldown marker doubles as the dedup record; first writer wins.
        let acquired = self
            .store
            .set_nx_ex(&Keys::spike_cooldown(&page), "1", self.config.cooldown)
            .await?;
        if !acquired {
            debug!(page = %page, ratio, "spike suppressed by cooldown");
            return Ok(None);
        }

        let severity = classify_severity(ratio);
        let alert = Alert {
            title: edit.title.clone(),
            wiki: edit.wiki.clone(),
            timestamp: edit.timestamp,
            payload: AlertPayload::Spike {
                ratio,
                edits_last_5min: stats.edits_last_5min,
                severity,
            },
        };
        self.publisher.publish(&alert).await?;
        Metrics::incr(&self.metrics.spike_alerts);
        info!(page = %page, ratio, %severity, "spike alert");
        Ok(Some(alert))
    }
}

#[async_trait::async_trait]
impl crate::consumer::EditHandler for SpikeDetector {
    fn name(&self) -> &'static str {
        "spike-detector"
    }

    async fn handle(&self, edit: &Edit) -> Result<()> {
        self.process_edit(edit).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use tokio::sync::Mutex;
    use wikisurge_model::EventType;

    /// Canned stats per page; what the tracker would answer.
    #[derive(Default)]
    struct FixedStats {
        pages: Mutex<HashMap<String, PageStats>>,
    }

    #[async_trait]
    impl PageStatsSource for FixedStats {
        async fn page_stats(&self, page: &str, _now: i64) -> Result<PageStats> {
            Ok(self
                .pages
                .lock()
                .await
                .get(page)
                .copied()
                .unwrap_or_default())
        }

        async fn is_hot(&self, page: &str) -> Result<bool> {
            Ok(self.pages.lock().await.contains_key(page))
        }
    }

    fn edit(title: &str, ts: i64, bot: bool) -> Edit {
        Edit {
            id: 1,
            event_type: EventType::Edit,
            title: title.into(),
            user: "u".into(),
            bot,
            wiki: "enwiki".into(),
            old_length: Some(10),
            new_length: Some(20),
            timestamp: ts,
            comment: None,
        }
    }

    async fn detector_with(
        stats: Arc<FixedStats>,
    ) -> (SpikeDetector, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let publisher = AlertPublisher::new(store.clone(), 1_000);
        let detector = SpikeDetector::new(
            stats,
            store.clone(),
            publisher,
            SpikeConfig::default(),
            Arc::new(Metrics::default()),
        );
        (detector, store)
    }

    #[tokio::test]
    async fn burst_over_quiet_baseline_is_critical() {
        let stats = Arc::new(FixedStats::default());
        stats.pages.lock().await.insert(
            "enwiki:Breaking News".into(),
            PageStats {
                edits_last_5min: 50,
                edits_last_hour: 54,
                unique_editors: 10,
                last_byte_change: 40,
                total_edits_in_window: 54,
            },
        );
        let (detector, _) = detector_with(stats).await;

        let alert = detector
            .process_edit(&edit("Breaking News", 1_700_000_000, false))
            .await
            .unwrap()
            .expect("alert fires");

        match alert.payload {
            AlertPayload::Spike {
                ratio, severity, ..
            } => {
                // rate_5m = 10/min over a floored 4-edit baseline.
                assert!((ratio - 100.0).abs() < 1e-9);
                assert_eq!(severity, Severity::Critical);
            }
            _ => panic!("wrong payload"),
        }
    }

    #[tokio::test]
    async fn cooldown_suppresses_the_second_burst() {
        let stats = Arc::new(FixedStats::default());
        stats.pages.lock().await.insert(
            "enwiki:Breaking News".into(),
            PageStats {
                edits_last_5min: 50,
                edits_last_hour: 54,
                ..Default::default()
            },
        );
        let (detector, _) = detector_with(stats).await;

        let first = detector
            .process_edit(&edit("Breaking News", 1_700_000_000, false))
            .await
            .unwrap();
        let second = detector
            .process_edit(&edit("Breaking News", 1_700_000_060, false))
            .await
            .unwrap();

        assert!(first.is_some());
        assert!(second.is_none());
        assert_eq!(detector.metrics.snapshot().spike_alerts, 1);
    }

    #[tokio::test]
    async fn cold_pages_and_bots_never_alert() {
        let stats = Arc::new(FixedStats::default());
        stats.pages.lock().await.insert(
            "enwiki:Botted".into(),
            PageStats {
                edits_last_5min: 50,
                edits_last_hour: 54,
                ..Default::default()
            },
        );
        let (detector, _) = detector_with(stats).await;

        assert!(
            detector
                .process_edit(&edit("Nowhere", 1_700_000_000, false))
                .await
                .unwrap()
                .is_none()
        );
        assert!(
            detector
                .process_edit(&edit("Botted", 1_700_000_000, true))
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn gradual_activity_stays_quiet() {
        let stats = Arc::new(FixedStats::default());
        // 30 edits spread over the hour: 5m rate is not anomalous.
        stats.pages.lock().await.insert(
            "enwiki:Steady".into(),
            PageStats {
                edits_last_5min: 3,
                edits_last_hour: 30,
                ..Default::default()
            },
        );
        let (detector, _) = detector_with(stats).await;

        // ratio = 0.6 / max(27/60, 0.1) = 1.33 < 5
        assert!(
            detector
                .process_edit(&edit("Steady", 1_700_000_000, false))
                .await
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn severity_bands() {
        assert_eq!(classify_severity(5.0), Severity::Low);
        assert_eq!(classify_severity(9.9), Severity::Low);
        assert_eq!(classify_severity(10.0), Severity::Medium);
        assert_eq!(classify_severity(20.0), Severity::High);
        assert_eq!(classify_severity(50.0), Severity::Critical);
    }

    #[test]
    fn baseline_cap_keeps_busy_pages_spikeable() {
        let stats = PageStats {
            edits_last_5min: 600,
            edits_last_hour: 3_000,
            ..Default::default()
        };
        // Uncapped baseline = 40/min; capped at 20/min doubles the ratio.
        let uncapped = spike_ratio(&stats);
        let capped = spike_ratio_capped(&stats, 20.0);
        assert!((uncapped - 3.0).abs() < 1e-9);
        assert!((capped - 6.0).abs() < 1e-9);
    }
}
