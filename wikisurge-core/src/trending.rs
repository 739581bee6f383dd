//! Trending scorer: a global ranking under lazy exponential decay.
//!
//! Nothing rewrites scores on a timer. Each edit recomputes the decayed
//! value from the stored (score, last-update) pair, adds its weight, and
//! stores the result. Because every entry decays at the same rate, the
//! ranking read straight off the ordered set preserves relative order.

use crate::error::Result;
use crate::keys::Keys;
use crate::metrics::Metrics;
use crate::store::SharedStore;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use wikisurge_config::TrendingConfig;
use wikisurge_model::{Edit, language_from_wiki};

/// Read access to the trending ranking for other components.
#[async_trait]
pub trait TrendingView: Send + Sync {
    /// Zero-based rank in the global ranking, best first.
    async fn rank_of(&self, page: &str) -> Result<Option<u64>>;
}

/// `score * 2^(-elapsed / half_life)`; clock skew clamps to no decay.
pub fn decayed_score(score: f64, elapsed_secs: i64, half_life_secs: f64) -> f64 {
    if elapsed_secs <= 0 {
        return score;
    }
    score * 2f64.powf(-(elapsed_secs as f64) / half_life_secs)
}

pub struct TrendingScorer {
    store: SharedStore,
    config: TrendingConfig,
    metrics: Arc<Metrics>,
}

impl fmt::Debug for TrendingScorer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrendingScorer")
            .field("config", &self.config)
            .finish()
    }
}

impl TrendingScorer {
    pub fn new(store: SharedStore, config: TrendingConfig, metrics: Arc<Metrics>) -> Self {
        Self {
            store,
            config,
            metrics,
        }
    }

    fn half_life_secs(&self) -> f64 {
        self.config.half_life.as_secs_f64()
    }

    /// Decays the stored score to `now`, adds this edit's weight, stores
    /// both halves of the entry in one transaction.
    pub async fn process_edit(&self, edit: &Edit) -> Result<()> {
        if edit.bot {
            return Ok(());
        }

        let page = edit.page_key();
        let now = edit.timestamp;

        let stored = self.store.zscore(Keys::trending_global(), &page).await?;
        let last_update = self
            .store
            .hget(Keys::trending_updated(), &page)
            .await?
            .and_then(|v| v.parse::<i64>().ok());

        let current = match (stored, last_update) {
            (Some(score), Some(last)) => decayed_score(score, now - last, self.half_life_secs()),
            (Some(score), None) => score,
            _ => 0.0,
        };
        let new_score = current + 1.0;

        self.store.trending_store(&page, new_score, now).await?;
        debug!(page = %page, score = new_score, "trending score updated");
        Ok(())
    }

    /// Top `n` by stored score. Displayed scores may be up to one prune
    /// interval stale; ordering is not.
    pub async fn top_n(&self, n: usize) -> Result<Vec<(String, f64)>> {
        self.store
            .zrevrange_withscores(Keys::trending_global(), 0, n as isize - 1)
            .await
    }

    /// Language-filtered view, derived at read time from the global set.
    pub async fn top_n_for_language(&self, n: usize, language: &str) -> Result<Vec<(String, f64)>> {
        let all = self
            .store
            .zrevrange_withscores(Keys::trending_global(), 0, -1)
            .await?;
        Ok(all
            .into_iter()
            .filter(|(page, _)| {
                page.split_once(':')
                    .is_some_and(|(wiki, _)| language_from_wiki(wiki) == language)
            })
            .take(n)
            .collect())
    }

    /// One prune pass at time `now`: drop entries whose decayed score fell
    /// below the floor, then evict the lowest-ranked beyond `max_pages`.
    pub async fn prune(&self, now: i64) -> Result<u64> {
        let updated = self.store.hgetall(Keys::trending_updated()).await?;
        let half_life = self.half_life_secs();

        let mut doomed: Vec<String> = Vec::new();
        for (page, last) in &updated {
            let last: i64 = match last.parse() {
                Ok(v) => v,
                Err(_) => {
                    doomed.push(page.clone());
                    continue;
                }
            };
            match self.store.zscore(Keys::trending_global(), page).await? {
                Some(score) => {
                    if decayed_score(score, now - last, half_life) < self.config.min_score {
                        doomed.push(page.clone());
                    }
                }
                // Orphaned stamp (entry already evicted): clean it up too.
                None => doomed.push(page.clone()),
            }
        }

        let pruned = doomed.len() as u64;
        if !doomed.is_empty() {
            self.store.zrem(Keys::trending_global(), &doomed).await?;
            self.store.hdel(Keys::trending_updated(), &doomed).await?;
            Metrics::add(&self.metrics.trending_pruned, pruned);
        }

        // Size cap, lowest-scored first.
        let card = self.store.zcard(Keys::trending_global()).await?;
        if card > self.config.max_pages {
            let excess = (card - self.config.max_pages) as isize;
            let evictees: Vec<String> = self
                .store
                .zrange_withscores(Keys::trending_global(), 0, excess - 1)
                .await?
                .into_iter()
                .map(|(page, _)| page)
                .collect();
            self.store.zrem(Keys::trending_global(), &evictees).await?;
            self.store
                .hdel(Keys::trending_updated(), &evictees)
                .await?;
            Metrics::add(&self.metrics.trending_evicted, evictees.len() as u64);
        }

        if pruned > 0 {
            debug!(pruned, "trending prune pass");
        }
        Ok(pruned)
    }

    /// Periodic pruning until shutdown; wall-clock time is fine here since
    /// stamps are written from stream time and only ever compared coarsely.
    pub async fn run_prune(self: Arc<Self>, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.prune_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("trending prune loop shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    let now = chrono::Utc::now().timestamp();
                    if let Err(err) = self.prune(now).await {
                        warn!("trending prune failed: {err}");
                    }
                }
            }
        }
    }
}

#[async_trait]
impl crate::consumer::EditHandler for TrendingScorer {
    fn name(&self) -> &'static str {
        "trending-scorer"
    }

    async fn handle(&self, edit: &Edit) -> Result<()> {
        self.process_edit(edit).await
    }
}

#[async_trait]
impl TrendingView for TrendingScorer {
    async fn rank_of(&self, page: &str) -> Result<Option<u64>> {
        self.store.zrevrank(Keys::trending_global(), page).await
    }
}
