//! Selective indexer: decides which edits are worth durable storage.
//!
//! Indexing everything costs an order of magnitude more than indexing the
//! interesting subset, so every edit passes through an ordered predicate
//! (watchlist, trending, spiking, warring) and only matches become
//! documents. Matches go through a bounded buffer to a background flusher;
//! overflow drops documents rather than stalling the consumer.

pub mod sink;

use crate::error::Result;
use crate::keys::Keys;
use crate::metrics::Metrics;
use crate::spike::spike_ratio;
use crate::store::SharedStore;
use crate::tracker::PageStatsSource;
use crate::trending::TrendingView;
use dashmap::DashMap;
use self::sink::{BulkSink, index_name};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use wikisurge_config::IndexerConfig;
use wikisurge_model::{Edit, IndexReason, IndexedDocument};

/// Process-local breaker over the bulk sink. While open, `should_index`
/// short-circuits to skip and detectors keep running untouched.
struct CircuitBreaker {
    threshold: u32,
    cooldown: std::time::Duration,
    failures: AtomicU32,
    open_until: std::sync::Mutex<Option<Instant>>,
}

impl CircuitBreaker {
    fn new(threshold: u32, cooldown: std::time::Duration) -> Self {
        Self {
            threshold,
            cooldown,
            failures: AtomicU32::new(0),
            open_until: std::sync::Mutex::new(None),
        }
    }

    fn is_open(&self) -> bool {
        let mut guard = self.open_until.lock().unwrap_or_else(|e| e.into_inner());
        match *guard {
            Some(until) if Instant::now() < until => true,
            Some(_) => {
                *guard = None;
                false
            }
            None => false,
        }
    }

    /// Returns true when this failure opened the breaker.
    fn record_failure(&self) -> bool {
        let failures = self.failures.fetch_add(1, Ordering::SeqCst) + 1;
        if failures >= self.threshold {
            self.failures.store(0, Ordering::SeqCst);
            let mut guard = self.open_until.lock().unwrap_or_else(|e| e.into_inner());
            *guard = Some(Instant::now() + self.cooldown);
            true
        } else {
            false
        }
    }

    fn record_success(&self) {
        self.failures.store(0, Ordering::SeqCst);
    }
}

pub struct SelectiveIndexer {
    store: SharedStore,
    stats: Arc<dyn PageStatsSource>,
    trending: Arc<dyn TrendingView>,
    config: IndexerConfig,
    metrics: Arc<Metrics>,
    tx: mpsc::Sender<IndexedDocument>,
    /// Per-page verdicts memoized for `decision_cache_ttl`, amortizing the
    /// trending/stats lookups across batched edits to one page.
    cache: DashMap<String, (Instant, Option<IndexReason>)>,
    breaker: Arc<CircuitBreaker>,
}

impl fmt::Debug for SelectiveIndexer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SelectiveIndexer")
            .field("config", &self.config)
            .field("cached_verdicts", &self.cache.len())
            .finish()
    }
}

impl SelectiveIndexer {
    /// Builds the indexer and its flusher half; the caller spawns
    /// [`IndexFlusher::run`].
    pub fn new(
        store: SharedStore,
        stats: Arc<dyn PageStatsSource>,
        trending: Arc<dyn TrendingView>,
        sink: Arc<dyn BulkSink>,
        index_prefix: &str,
        config: IndexerConfig,
        metrics: Arc<Metrics>,
    ) -> (Self, IndexFlusher) {
        let (tx, rx) = mpsc::channel(config.buffer_capacity);
        let breaker = Arc::new(CircuitBreaker::new(
            config.breaker_threshold,
            config.breaker_cooldown,
        ));
        let flusher = IndexFlusher {
            rx,
            sink,
            index_prefix: index_prefix.to_string(),
            config: config.clone(),
            metrics: Arc::clone(&metrics),
            breaker: Arc::clone(&breaker),
        };
        let indexer = Self {
            store,
            stats,
            trending,
            config,
            metrics,
            tx,
            cache: DashMap::new(),
            breaker,
        };
        (indexer, flusher)
    }

    /// Evaluates one edit and, on a match, buffers the document.
    pub async fn process_edit(&self, edit: &Edit) -> Result<()> {
        let Some(reason) = self.should_index(edit).await? else {
            return Ok(());
        };

        let doc = IndexedDocument::from_edit(edit, reason);
        match self.tx.try_send(doc) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                Metrics::incr(&self.metrics.docs_dropped);
                debug!(page = %edit.page_key(), "indexer buffer full, document dropped");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!("indexer flusher is gone, document dropped");
            }
        }
        Ok(())
    }

    /// The ordered decision. First match wins; the verdict (including a
    /// skip) is memoized per page for one cache interval.
    pub async fn should_index(&self, edit: &Edit) -> Result<Option<IndexReason>> {
        if self.breaker.is_open() {
            return Ok(None);
        }

        let page = edit.page_key();
        if let Some(entry) = self.cache.get(&page) {
            let (at, verdict) = *entry;
            if at.elapsed() < self.config.decision_cache_ttl {
                return Ok(verdict);
            }
        }

        let verdict = self.evaluate(&page, edit).await?;
        self.cache.insert(page, (Instant::now(), verdict));
        Ok(verdict)
    }

    async fn evaluate(&self, page: &str, edit: &Edit) -> Result<Option<IndexReason>> {
        if self.store.sismember(Keys::watchlist(), page).await? {
            return Ok(Some(IndexReason::Watchlist));
        }

        if let Some(rank) = self.trending.rank_of(page).await?
            && rank < self.config.top_n
        {
            return Ok(Some(IndexReason::Trending));
        }

        let stats = self.stats.page_stats(page, edit.timestamp).await?;
        if stats.edits_last_5min > 0 && spike_ratio(&stats) >= self.config.spike_ratio_min {
            return Ok(Some(IndexReason::Spike));
        }

        if self.store.exists(&Keys::editwar_active(page)).await? {
            return Ok(Some(IndexReason::EditWar));
        }

        Ok(None)
    }

    // Watchlist curation; exposed to the operational surface.

    pub async fn watchlist_add(&self, page: &str) -> Result<bool> {
        self.store.sadd(Keys::watchlist(), page).await
    }

    pub async fn watchlist_remove(&self, page: &str) -> Result<bool> {
        self.store.srem(Keys::watchlist(), page).await
    }

    pub async fn watchlist(&self) -> Result<Vec<String>> {
        self.store.smembers(Keys::watchlist()).await
    }
}

#[async_trait::async_trait]
impl crate::consumer::EditHandler for SelectiveIndexer {
    fn name(&self) -> &'static str {
        "selective-indexer"
    }

    async fn handle(&self, edit: &Edit) -> Result<()> {
        self.process_edit(edit).await
    }
}

/// Background half: drains the buffer into bulk requests on size or time,
/// retries once, and trips the breaker on repeated failure.
pub struct IndexFlusher {
    rx: mpsc::Receiver<IndexedDocument>,
    sink: Arc<dyn BulkSink>,
    index_prefix: String,
    config: IndexerConfig,
    metrics: Arc<Metrics>,
    breaker: Arc<CircuitBreaker>,
}

impl fmt::Debug for IndexFlusher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IndexFlusher")
            .field("index_prefix", &self.index_prefix)
            .finish()
    }
}

impl IndexFlusher {
    pub async fn run(mut self, shutdown: CancellationToken) {
        let mut batch: Vec<IndexedDocument> = Vec::with_capacity(self.config.bulk_size);
        let mut ticker = tokio::time::interval(self.config.flush_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    // Final drain: whatever is buffered goes out inside the
                    // shutdown window.
                    while let Ok(doc) = self.rx.try_recv() {
                        batch.push(doc);
                    }
                    self.flush(&mut batch).await;
                    info!("index flusher shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    self.flush(&mut batch).await;
                }
                doc = self.rx.recv() => match doc {
                    Some(doc) => {
                        batch.push(doc);
                        if batch.len() >= self.config.bulk_size {
                            self.flush(&mut batch).await;
                        }
                    }
                    None => {
                        self.flush(&mut batch).await;
                        break;
                    }
                }
            }
        }
    }

    async fn flush(&self, batch: &mut Vec<IndexedDocument>) {
        if batch.is_empty() {
            return;
        }

        let mut by_index: HashMap<String, Vec<IndexedDocument>> = HashMap::new();
        for doc in batch.drain(..) {
            by_index
                .entry(index_name(&self.index_prefix, doc.timestamp))
                .or_default()
                .push(doc);
        }

        for (index, docs) in by_index {
            match self.write_with_retry(&index, &docs).await {
                Ok(()) => {
                    Metrics::add(&self.metrics.docs_indexed, docs.len() as u64);
                    self.breaker.record_success();
                }
                Err(err) => {
                    warn!(index = %index, count = docs.len(), "bulk write failed twice: {err}");
                    if self.breaker.record_failure() {
                        Metrics::incr(&self.metrics.breaker_opens);
                        warn!(
                            cooldown = ?self.config.breaker_cooldown,
                            "indexing circuit breaker opened"
                        );
                    }
                }
            }
        }
    }

    async fn write_with_retry(&self, index: &str, docs: &[IndexedDocument]) -> Result<()> {
        match self.sink.bulk_index(index, docs).await {
            Ok(()) => Ok(()),
            Err(first) => {
                Metrics::incr(&self.metrics.bulk_failures);
                debug!(index, "bulk write failed, retrying once: {first}");
                tokio::time::sleep(std::time::Duration::from_millis(250)).await;
                self.sink.bulk_index(index, docs).await.inspect_err(|_| {
                    Metrics::incr(&self.metrics.bulk_failures);
                })
            }
        }
    }
}
