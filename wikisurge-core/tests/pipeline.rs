//! End-to-end scenarios over the in-memory store: the analytics components
//! wired the way the consumers wire them, minus the broker.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use wikisurge_config::{EditWarConfig, IndexerConfig, SpikeConfig, TrackerConfig, TrendingConfig};
use wikisurge_core::alerts::AlertPublisher;
use wikisurge_core::editwar::EditWarDetector;
use wikisurge_core::indexer::SelectiveIndexer;
use wikisurge_core::indexer::sink::BulkSink;
use wikisurge_core::keys::Keys;
use wikisurge_core::metrics::Metrics;
use wikisurge_core::spike::SpikeDetector;
use wikisurge_core::store::{MemoryStore, SharedStore, Store};
use wikisurge_core::tracker::HotPageTracker;
use wikisurge_core::trending::TrendingScorer;
use wikisurge_core::Result;
use wikisurge_model::{
    Alert, AlertKind, AlertPayload, Edit, EventType, IndexReason, IndexedDocument, Severity,
};

fn edit(title: &str, id: u64, ts: i64, user: &str, old: i64, new: i64) -> Edit {
    Edit {
        id,
        event_type: EventType::Edit,
        title: title.into(),
        user: user.into(),
        bot: false,
        wiki: "enwiki".into(),
        old_length: Some(old),
        new_length: Some(new),
        timestamp: ts,
        comment: None,
    }
}

struct Harness {
    store: SharedStore,
    tracker: Arc<HotPageTracker>,
    spike: SpikeDetector,
    editwar: EditWarDetector,
    trending: Arc<TrendingScorer>,
    publisher: AlertPublisher,
    metrics: Arc<Metrics>,
}

fn harness() -> Harness {
    harness_with(TrackerConfig::default())
}

fn harness_with(tracker_config: TrackerConfig) -> Harness {
    let store: SharedStore = Arc::new(MemoryStore::new());
    let metrics = Arc::new(Metrics::default());
    let publisher = AlertPublisher::new(Arc::clone(&store), 1_000);
    let tracker = Arc::new(HotPageTracker::new(
        Arc::clone(&store),
        tracker_config,
        Arc::clone(&metrics),
    ));
    let spike = SpikeDetector::new(
        tracker.clone(),
        Arc::clone(&store),
        publisher.clone(),
        SpikeConfig::default(),
        Arc::clone(&metrics),
    );
    let editwar = EditWarDetector::new(
        tracker.clone(),
        Arc::clone(&store),
        publisher.clone(),
        EditWarConfig::default(),
        Arc::clone(&metrics),
    );
    let trending = Arc::new(TrendingScorer::new(
        Arc::clone(&store),
        TrendingConfig::default(),
        Arc::clone(&metrics),
    ));
    Harness {
        store,
        tracker,
        spike,
        editwar,
        trending,
        publisher,
        metrics,
    }
}

const BASE: i64 = 1_700_000_000;

/// S1: a 50-edit burst over a 4-edit baseline fires exactly one critical
/// spike alert; a repeat burst inside the cooldown fires nothing.
#[tokio::test]
async fn clear_spike_fires_one_critical_alert() {
    let h = harness();

    // Baseline: 4 edits spread across the preceding hour. The third
    // promotes the page, so the burst below is evaluated against a hot
    // window.
    for i in 0..4u64 {
        let e = edit("Breaking News", i, BASE - 3_500 + i as i64 * 600, "base", 100, 120);
        h.tracker.process_edit(&e).await.unwrap();
    }

    // Burst: 50 edits in five minutes. The tracker consumer has ingested
    // the full burst before the spike consumer catches up, which is the
    // cross-consumer lag the pipeline explicitly tolerates.
    let burst: Vec<Edit> = (0..50u64)
        .map(|i| edit("Breaking News", 100 + i, BASE + i as i64 * 6, "crowd", 100, 130))
        .collect();
    for e in &burst {
        h.tracker.process_edit(e).await.unwrap();
    }

    let mut fired = Vec::new();
    for e in &burst {
        if let Some(alert) = h.spike.process_edit(e).await.unwrap() {
            fired.push(alert);
        }
    }

    assert_eq!(fired.len(), 1, "cooldown suppresses repeats");
    match &fired[0].payload {
        AlertPayload::Spike {
            ratio, severity, ..
        } => {
            // 50/5min over a floored 4-edit baseline: 10 / 0.1.
            assert!((*ratio - 100.0).abs() < 1e-9);
            assert_eq!(*severity, Severity::Critical);
        }
        other => panic!("unexpected payload {other:?}"),
    }

    let on_stream = h.publisher.recent(AlertKind::Spike, 10).await.unwrap();
    assert_eq!(on_stream.len(), 1);
    assert_eq!(h.metrics.snapshot().spike_alerts, 1);
}

/// S2: steady traffic spread over an hour never spikes, but the page
/// does trend.
#[tokio::test]
async fn gradual_increase_trends_without_spiking() {
    let h = harness();

    for i in 0..24u64 {
        let e = edit("Slow Burn", i, BASE + i as i64 * 150, "steady", 100, 110);
        h.tracker.process_edit(&e).await.unwrap();
        h.trending.process_edit(&e).await.unwrap();
        let alert = h.spike.process_edit(&e).await.unwrap();
        assert!(alert.is_none(), "uniform traffic must not spike");
    }

    assert_eq!(h.metrics.snapshot().spike_alerts, 0);
    let top = h.trending.top_n(10).await.unwrap();
    assert_eq!(top[0].0, "enwiki:Slow Burn");
}

/// S3: the A/B/A/B/C revert timeline produces a single high-severity
/// edit-war alert with editors {A,B,C}, five edits and two reverts.
#[tokio::test]
async fn edit_war_timeline_fires_high() {
    let h = harness();

    // Make the page hot first; wars are only evaluated on hot pages.
    for i in 0..3u64 {
        let e = edit("Contested", i, BASE - 600 + i as i64, "setup", 1_000, 1_010);
        h.tracker.process_edit(&e).await.unwrap();
    }

    let timeline = [
        (10, "A", 1_000, 1_500), // +500
        (11, "B", 1_500, 1_020), // -480
        (12, "A", 1_020, 1_530), // +510
        (13, "B", 1_530, 1_025), // -505
        (14, "C", 1_025, 1_225), // +200
    ];
    let mut alerts: Vec<Alert> = Vec::new();
    for (i, (id, user, old, new)) in timeline.into_iter().enumerate() {
        let e = edit("Contested", id, BASE + i as i64 * 72, user, old, new);
        h.tracker.process_edit(&e).await.unwrap();
        if let Some(alert) = h.editwar.process_edit(&e).await.unwrap() {
            alerts.push(alert);
        }
    }

    assert_eq!(alerts.len(), 1);
    match &alerts[0].payload {
        AlertPayload::EditWar {
            editors,
            edit_count,
            revert_count,
            severity,
            ..
        } => {
            assert_eq!(editors, &["A", "B", "C"]);
            assert_eq!(*edit_count, 5);
            assert_eq!(*revert_count, 2);
            assert_eq!(*severity, Severity::High);
        }
        other => panic!("unexpected payload {other:?}"),
    }
    assert_eq!(
        h.publisher.recent(AlertKind::EditWar, 10).await.unwrap().len(),
        1
    );
}

/// S4: one edit scores 1.0; pruning removes it once decay crosses the
/// 0.1 floor, between three and four half-lives later.
#[tokio::test]
async fn trending_entry_decays_out() {
    let h = harness();
    let half_life = 1_800i64;

    let e = edit("Fifteen Minutes", 1, BASE, "u", 100, 140);
    h.trending.process_edit(&e).await.unwrap();

    h.trending.prune(BASE + 3 * half_life).await.unwrap();
    assert_eq!(h.trending.top_n(5).await.unwrap().len(), 1);

    h.trending.prune(BASE + 4 * half_life).await.unwrap();
    assert!(h.trending.top_n(5).await.unwrap().is_empty());
}

/// S5: with max_tracked=2, the third promotion is rejected and counted;
/// the hot set holds exactly two pages.
#[tokio::test]
async fn hot_set_circuit_breaker_rejects_third_page() {
    let h = harness_with(TrackerConfig {
        max_tracked: 2,
        ..TrackerConfig::default()
    });

    for (n, title) in ["First", "Second", "Third"].into_iter().enumerate() {
        for i in 0..3u64 {
            let e = edit(title, n as u64 * 10 + i, BASE + i as i64, "u", 100, 105);
            h.tracker.process_edit(&e).await.unwrap();
        }
    }

    assert_eq!(h.store.zcard(Keys::hot_pages()).await.unwrap(), 2);
    assert_eq!(h.metrics.snapshot().promotion_rejected, 1);
}

/// Records everything that would have gone to the search store.
#[derive(Default)]
struct RecorderSink {
    batches: Mutex<Vec<(String, Vec<IndexedDocument>)>>,
}

impl RecorderSink {
    async fn docs(&self) -> Vec<IndexedDocument> {
        self.batches
            .lock()
            .await
            .iter()
            .flat_map(|(_, docs)| docs.clone())
            .collect()
    }
}

#[async_trait]
impl BulkSink for RecorderSink {
    async fn bulk_index(&self, index: &str, docs: &[IndexedDocument]) -> Result<()> {
        self.batches
            .lock()
            .await
            .push((index.to_string(), docs.to_vec()));
        Ok(())
    }

    async fn ensure_retention(&self, _retention_days: u32) -> Result<()> {
        Ok(())
    }
}

/// S6: dull pages are never forwarded; a trending page yields exactly one
/// document per edit with `indexed_reason = trending`.
#[tokio::test]
async fn selective_indexer_forwards_only_interesting_edits() {
    let h = harness();
    let sink = Arc::new(RecorderSink::default());

    let (indexer, flusher) = SelectiveIndexer::new(
        Arc::clone(&h.store),
        h.tracker.clone(),
        h.trending.clone(),
        sink.clone(),
        "wikisurge-edits",
        IndexerConfig {
            flush_interval: Duration::from_millis(20),
            ..IndexerConfig::default()
        },
        Arc::clone(&h.metrics),
    );
    let shutdown = CancellationToken::new();
    let flusher_task = tokio::spawn(flusher.run(shutdown.clone()));

    // Establish the trending page.
    for i in 0..3u64 {
        h.trending
            .process_edit(&edit("Hot Topic", i, BASE + i as i64, "u", 100, 120))
            .await
            .unwrap();
    }

    for i in 0..3u64 {
        indexer
            .process_edit(&edit("Hot Topic", 50 + i, BASE + 60 + i as i64, "u", 100, 120))
            .await
            .unwrap();
    }
    for i in 0..5u64 {
        indexer
            .process_edit(&edit("Obscure Stub", 90 + i, BASE + 60 + i as i64, "u", 10, 12))
            .await
            .unwrap();
    }

    tokio::time::sleep(Duration::from_millis(80)).await;
    shutdown.cancel();
    flusher_task.await.unwrap();

    let docs = sink.docs().await;
    assert_eq!(docs.len(), 3, "one document per edit to the trending page");
    assert!(docs.iter().all(|d| d.indexed_reason == IndexReason::Trending));
    assert!(docs.iter().all(|d| d.title == "Hot Topic"));

    // Deterministic ids: distinct per edit, stable across replays.
    let mut ids: Vec<&str> = docs.iter().map(|d| d.id.as_str()).collect();
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 3);
    assert_eq!(h.metrics.snapshot().docs_indexed, 3);
    assert_eq!(h.metrics.snapshot().docs_dropped, 0);
}

/// A war alert marks the page, and the indexer picks the marker up as an
/// indexing reason once the decision cache rolls over.
#[tokio::test]
async fn war_marker_feeds_the_indexer() {
    let h = harness();
    let sink = Arc::new(RecorderSink::default());

    let (indexer, _flusher) = SelectiveIndexer::new(
        Arc::clone(&h.store),
        h.tracker.clone(),
        h.trending.clone(),
        sink,
        "wikisurge-edits",
        IndexerConfig::default(),
        Arc::clone(&h.metrics),
    );

    for i in 0..3u64 {
        let e = edit("Flashpoint", i, BASE - 500 + i as i64, "setup", 1_000, 1_010);
        h.tracker.process_edit(&e).await.unwrap();
    }
    let timeline = [
        (10, "A", 1_000, 1_400),
        (11, "B", 1_400, 1_010),
        (12, "A", 1_010, 1_410),
        (13, "B", 1_410, 1_015),
        (14, "C", 1_015, 1_215),
    ];
    for (i, (id, user, old, new)) in timeline.into_iter().enumerate() {
        let e = edit("Flashpoint", id, BASE + i as i64 * 60, user, old, new);
        h.tracker.process_edit(&e).await.unwrap();
        h.editwar.process_edit(&e).await.unwrap();
    }
    assert!(
        h.store
            .exists(&Keys::editwar_active("enwiki:Flashpoint"))
            .await
            .unwrap()
    );

    let verdict = indexer
        .should_index(&edit("Flashpoint", 99, BASE + 400, "D", 1_215, 1_230))
        .await
        .unwrap();
    // The page is also hot and mid-burst, so spike can win first; either
    // way the edit is indexed for a war-adjacent reason.
    assert!(matches!(
        verdict,
        Some(IndexReason::EditWar) | Some(IndexReason::Spike)
    ));
}

/// Invariant 4: alert streams stay within their cap no matter how many
/// alerts are appended.
#[tokio::test]
async fn alert_streams_never_exceed_their_cap() {
    let store: SharedStore = Arc::new(MemoryStore::new());
    let publisher = AlertPublisher::new(Arc::clone(&store), 50);

    for i in 0..500 {
        publisher
            .publish(&Alert {
                title: format!("Page {i}"),
                wiki: "enwiki".into(),
                timestamp: BASE + i,
                payload: AlertPayload::Spike {
                    ratio: 10.0,
                    edits_last_5min: 5,
                    severity: Severity::Medium,
                },
            })
            .await
            .unwrap();
        assert!(store.xlen(AlertKind::Spike.stream()).await.unwrap() <= 50);
    }
}

/// Invariant 5: the per-page window respects both the member cap and the
/// time horizon.
#[tokio::test]
async fn hot_window_is_bounded_by_cap_and_horizon() {
    let h = harness_with(TrackerConfig {
        max_members_per_page: 10,
        ..TrackerConfig::default()
    });

    for i in 0..40u64 {
        let e = edit("Churn", i, BASE + i as i64 * 30, "u", 100, 101);
        h.tracker.process_edit(&e).await.unwrap();
    }
    let window = Keys::hot_window("enwiki:Churn");
    assert!(h.store.zcard(&window).await.unwrap() <= 10);

    // A much later edit drags the horizon forward and clears the rest.
    let e = edit("Churn", 999, BASE + 10_000, "u", 100, 101);
    h.tracker.process_edit(&e).await.unwrap();
    let members = h
        .store
        .zrange_withscores(&window, 0, -1)
        .await
        .unwrap();
    let latest = members
        .iter()
        .map(|(_, s)| *s)
        .fold(f64::MIN, f64::max);
    assert!(
        members
            .iter()
            .all(|(_, score)| latest - score <= 3_600.0)
    );
}
