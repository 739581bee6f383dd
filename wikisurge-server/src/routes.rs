//! Operational endpoints: health and metrics. The query API proper lives
//! elsewhere; this surface exists so orchestration and scraping work.

use axum::{Json, Router, extract::State, routing::get};
use std::sync::Arc;
use wikisurge_core::Metrics;
use wikisurge_core::consumer::supervisor::{HealthReport, PipelineRuntime};
use wikisurge_core::metrics::MetricsSnapshot;

#[derive(Clone)]
pub struct AppState {
    runtime: Arc<PipelineRuntime>,
    metrics: Arc<Metrics>,
}

pub fn router(runtime: Arc<PipelineRuntime>, metrics: Arc<Metrics>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics_text))
        .with_state(AppState { runtime, metrics })
}

/// Always 200; a degraded pipeline is reported, not hidden behind a 5xx
/// that would get the whole process restarted.
async fn healthz(State(state): State<AppState>) -> Json<HealthReport> {
    Json(state.runtime.health().await)
}

async fn metrics_text(State(state): State<AppState>) -> String {
    render_prometheus(&state.metrics.snapshot())
}

fn render_prometheus(snap: &MetricsSnapshot) -> String {
    let mut out = String::with_capacity(2_048);
    let mut counter = |name: &str, help: &str, value: u64| {
        out.push_str(&format!("# HELP {name} {help}\n"));
        out.push_str(&format!("# TYPE {name} counter\n"));
        out.push_str(&format!("{name} {value}\n"));
    };

    counter(
        "wikisurge_edits_processed_total",
        "Edits decoded and handled across all consumers",
        snap.edits_processed,
    );
    counter(
        "wikisurge_promotions_total",
        "Pages promoted to hot tracking",
        snap.promotions,
    );
    counter(
        "wikisurge_promotion_rejected_total",
        "Promotions refused because the hot set was at capacity",
        snap.promotion_rejected,
    );
    counter(
        "wikisurge_cleanup_removed_total",
        "Hot pages removed by background cleanup",
        snap.cleanup_removed,
    );
    counter(
        "wikisurge_spike_alerts_total",
        "Spike alerts emitted",
        snap.spike_alerts,
    );
    counter(
        "wikisurge_editwar_alerts_total",
        "Edit-war alerts emitted",
        snap.editwar_alerts,
    );
    counter(
        "wikisurge_trending_pruned_total",
        "Trending entries pruned below the score floor",
        snap.trending_pruned,
    );
    counter(
        "wikisurge_trending_evicted_total",
        "Trending entries evicted by the size cap",
        snap.trending_evicted,
    );
    counter(
        "wikisurge_docs_indexed_total",
        "Documents written to the search store",
        snap.docs_indexed,
    );
    counter(
        "wikisurge_docs_dropped_total",
        "Documents dropped on a full indexer buffer",
        snap.docs_dropped,
    );
    counter(
        "wikisurge_bulk_failures_total",
        "Bulk write attempts that failed",
        snap.bulk_failures,
    );
    counter(
        "wikisurge_breaker_opens_total",
        "Times the indexing circuit breaker opened",
        snap.breaker_opens,
    );
    counter(
        "wikisurge_poison_messages_total",
        "Messages forwarded to the dead-letter stream",
        snap.poison_messages,
    );
    counter(
        "wikisurge_handler_retries_total",
        "Per-message handler retries",
        snap.handler_retries,
    );
    counter(
        "wikisurge_consumer_restarts_total",
        "Consumer restarts performed by the supervisor",
        snap.consumer_restarts,
    );
    counter(
        "wikisurge_hub_delivered_total",
        "Alerts delivered to hub subscribers",
        snap.hub_delivered,
    );
    counter(
        "wikisurge_hub_dropped_total",
        "Alerts dropped on full subscriber channels",
        snap.hub_dropped,
    );

    out.push_str("# HELP wikisurge_hot_pages Pages currently under hot tracking\n");
    out.push_str("# TYPE wikisurge_hot_pages gauge\n");
    out.push_str(&format!("wikisurge_hot_pages {}\n", snap.hot_pages));
    out
}
