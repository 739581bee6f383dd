//! Environment-driven configuration for the WikiSurge pipeline.
//!
//! Every tunable documented in the component specs maps to one environment
//! variable. Unset variables fall back to the documented defaults; values
//! that fail to parse are logged and replaced by the default rather than
//! aborting startup.

use std::env;
use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;
use tracing::warn;

fn parse_or<T: FromStr + Display + Copy>(raw: Option<String>, default: T, name: &str) -> T {
    match raw {
        Some(value) => match value.trim().parse() {
            Ok(parsed) => parsed,
            Err(_) => {
                warn!("invalid value {value:?} for {name}, using default {default}");
                default
            }
        },
        None => default,
    }
}

fn duration_or(raw: Option<String>, default: Duration, name: &str) -> Duration {
    match raw {
        Some(value) => match humantime::parse_duration(value.trim()) {
            Ok(parsed) => parsed,
            Err(_) => {
                warn!(
                    "invalid duration {value:?} for {name}, using default {}",
                    humantime::format_duration(default)
                );
                default
            }
        },
        None => default,
    }
}

fn string_or(raw: Option<String>, default: &str) -> String {
    raw.unwrap_or_else(|| default.to_string())
}

fn var(name: &str) -> Option<String> {
    env::var(name).ok()
}

/// Connection settings for the broker carrying the edit topic.
#[derive(Debug, Clone, Deserialize)]
pub struct KafkaConfig {
    pub brokers: String,
    pub topic: String,
    /// Consumer group ids are `<prefix>-<component>`.
    pub group_prefix: String,
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            brokers: "localhost:9092".into(),
            topic: "wikisurge.edits".into(),
            group_prefix: "wikisurge".into(),
        }
    }
}

impl KafkaConfig {
    fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            brokers: string_or(var("KAFKA_BROKERS"), &defaults.brokers),
            topic: string_or(var("KAFKA_TOPIC"), &defaults.topic),
            group_prefix: string_or(var("KAFKA_GROUP_PREFIX"), &defaults.group_prefix),
        }
    }
}

/// Durable search store endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct ElasticConfig {
    pub url: String,
    /// Daily indices are named `<prefix>-YYYY-MM-DD`.
    pub index_prefix: String,
}

impl Default for ElasticConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:9200".into(),
            index_prefix: "wikisurge-edits".into(),
        }
    }
}

impl ElasticConfig {
    fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            url: string_or(var("ELASTIC_URL"), &defaults.url),
            index_prefix: string_or(var("ELASTIC_INDEX_PREFIX"), &defaults.index_prefix),
        }
    }
}

/// Bind address for the operational HTTP endpoints.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8080,
        }
    }
}

impl ServerConfig {
    fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            host: string_or(var("SERVER_HOST"), &defaults.host),
            port: parse_or(var("SERVER_PORT"), defaults.port, "SERVER_PORT"),
        }
    }
}

/// Hot-page tracker tuning.
#[derive(Debug, Clone, Deserialize)]
pub struct TrackerConfig {
    /// Hard cap on concurrently tracked hot pages (circuit breaker).
    pub max_tracked: u64,
    /// Activity-counter value at which a page is promoted.
    pub hot_threshold: i64,
    /// Lifetime of a pre-promotion activity counter.
    pub activity_ttl: Duration,
    /// Horizon of the per-page edit window.
    pub window_duration: Duration,
    /// Maximum members retained in one page window.
    pub max_members_per_page: u64,
    /// Grace period added to key TTLs on top of the window horizon.
    pub ttl_buffer: Duration,
    /// Byte-change history length kept per hot page.
    pub changes_cap: u64,
    pub cleanup_interval: Duration,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            max_tracked: 10_000,
            hot_threshold: 3,
            activity_ttl: Duration::from_secs(10 * 60),
            window_duration: Duration::from_secs(60 * 60),
            max_members_per_page: 500,
            ttl_buffer: Duration::from_secs(5 * 60),
            changes_cap: 100,
            cleanup_interval: Duration::from_secs(5 * 60),
        }
    }
}

impl TrackerConfig {
    fn from_env() -> Self {
        let d = Self::default();
        Self {
            max_tracked: parse_or(var("HOT_MAX_TRACKED"), d.max_tracked, "HOT_MAX_TRACKED"),
            hot_threshold: parse_or(var("HOT_THRESHOLD"), d.hot_threshold, "HOT_THRESHOLD"),
            activity_ttl: duration_or(var("HOT_ACTIVITY_TTL"), d.activity_ttl, "HOT_ACTIVITY_TTL"),
            window_duration: duration_or(
                var("HOT_WINDOW_DURATION"),
                d.window_duration,
                "HOT_WINDOW_DURATION",
            ),
            max_members_per_page: parse_or(
                var("HOT_MAX_MEMBERS_PER_PAGE"),
                d.max_members_per_page,
                "HOT_MAX_MEMBERS_PER_PAGE",
            ),
            ttl_buffer: duration_or(var("HOT_TTL_BUFFER"), d.ttl_buffer, "HOT_TTL_BUFFER"),
            changes_cap: parse_or(var("HOT_CHANGES_CAP"), d.changes_cap, "HOT_CHANGES_CAP"),
            cleanup_interval: duration_or(
                var("HOT_CLEANUP_INTERVAL"),
                d.cleanup_interval,
                "HOT_CLEANUP_INTERVAL",
            ),
        }
    }

    /// TTL applied to every hot-page key: window horizon plus grace.
    pub fn hot_ttl(&self) -> Duration {
        self.window_duration + self.ttl_buffer
    }
}

/// Spike detector tuning.
#[derive(Debug, Clone, Deserialize)]
pub struct SpikeConfig {
    /// Minimum 5m/1h rate ratio that fires an alert.
    pub threshold: f64,
    /// Minimum edits in the trailing five minutes.
    pub min_edits: u64,
    /// Per-page alert suppression window.
    pub cooldown: Duration,
    /// Ceiling on the baseline rate so always-busy pages can still spike,
    /// in edits per minute.
    pub baseline_cap: f64,
}

impl Default for SpikeConfig {
    fn default() -> Self {
        Self {
            threshold: 5.0,
            min_edits: 3,
            cooldown: Duration::from_secs(5 * 60),
            baseline_cap: 20.0,
        }
    }
}

impl SpikeConfig {
    fn from_env() -> Self {
        let d = Self::default();
        Self {
            threshold: parse_or(var("SPIKE_THRESHOLD"), d.threshold, "SPIKE_THRESHOLD"),
            min_edits: parse_or(var("SPIKE_MIN_EDITS"), d.min_edits, "SPIKE_MIN_EDITS"),
            cooldown: duration_or(var("SPIKE_COOLDOWN"), d.cooldown, "SPIKE_COOLDOWN"),
            baseline_cap: parse_or(var("SPIKE_BASELINE_CAP"), d.baseline_cap, "SPIKE_BASELINE_CAP"),
        }
    }
}

/// Trending scorer tuning.
#[derive(Debug, Clone, Deserialize)]
pub struct TrendingConfig {
    /// Score half-life.
    pub half_life: Duration,
    /// Cap on the trending collection size.
    pub max_pages: u64,
    pub prune_interval: Duration,
    /// Entries whose decayed score drops below this are pruned.
    pub min_score: f64,
}

impl Default for TrendingConfig {
    fn default() -> Self {
        Self {
            half_life: Duration::from_secs(30 * 60),
            max_pages: 5_000,
            prune_interval: Duration::from_secs(5 * 60),
            min_score: 0.1,
        }
    }
}

impl TrendingConfig {
    fn from_env() -> Self {
        let d = Self::default();
        Self {
            half_life: duration_or(var("TRENDING_HALF_LIFE"), d.half_life, "TRENDING_HALF_LIFE"),
            max_pages: parse_or(var("TRENDING_MAX_PAGES"), d.max_pages, "TRENDING_MAX_PAGES"),
            prune_interval: duration_or(
                var("TRENDING_PRUNE_INTERVAL"),
                d.prune_interval,
                "TRENDING_PRUNE_INTERVAL",
            ),
            min_score: parse_or(var("TRENDING_MIN_SCORE"), d.min_score, "TRENDING_MIN_SCORE"),
        }
    }
}

/// Edit-war detector tuning.
#[derive(Debug, Clone, Deserialize)]
pub struct EditWarConfig {
    pub enabled: bool,
    /// Distinct editors required inside the window.
    pub min_editors: u64,
    /// Total edits required inside the window.
    pub min_edits: u64,
    /// Revert pairs required before an alert fires.
    pub min_reverts: u64,
    /// Sliding detection window.
    pub window: Duration,
    /// Relative magnitude tolerance for a revert pair (0.2 = ±20%).
    pub magnitude_tol: f64,
}

impl Default for EditWarConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_editors: 2,
            min_edits: 5,
            min_reverts: 1,
            window: Duration::from_secs(10 * 60),
            magnitude_tol: 0.2,
        }
    }
}

impl EditWarConfig {
    fn from_env() -> Self {
        let d = Self::default();
        Self {
            enabled: parse_or(var("EDITWAR_ENABLED"), d.enabled, "EDITWAR_ENABLED"),
            min_editors: parse_or(var("EDITWAR_MIN_EDITORS"), d.min_editors, "EDITWAR_MIN_EDITORS"),
            min_edits: parse_or(var("EDITWAR_MIN_EDITS"), d.min_edits, "EDITWAR_MIN_EDITS"),
            min_reverts: parse_or(var("EDITWAR_MIN_REVERTS"), d.min_reverts, "EDITWAR_MIN_REVERTS"),
            window: duration_or(var("EDITWAR_WINDOW"), d.window, "EDITWAR_WINDOW"),
            magnitude_tol: parse_or(
                var("EDITWAR_MAGNITUDE_TOL"),
                d.magnitude_tol,
                "EDITWAR_MAGNITUDE_TOL",
            ),
        }
    }
}

/// Selective indexer tuning.
#[derive(Debug, Clone, Deserialize)]
pub struct IndexerConfig {
    /// Trending rank at or above which an edit is indexed.
    pub top_n: u64,
    /// Spike ratio at or above which an edit is indexed.
    pub spike_ratio_min: f64,
    pub retention_days: u32,
    /// Documents per bulk request.
    pub bulk_size: usize,
    pub flush_interval: Duration,
    /// Bounded buffer between decision and flusher; overflow drops.
    pub buffer_capacity: usize,
    /// Per-page verdict memoization lifetime.
    pub decision_cache_ttl: Duration,
    /// Consecutive bulk failures before the breaker opens.
    pub breaker_threshold: u32,
    /// How long an open breaker disables indexing.
    pub breaker_cooldown: Duration,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            top_n: 50,
            spike_ratio_min: 2.0,
            retention_days: 7,
            bulk_size: 500,
            flush_interval: Duration::from_secs(5),
            buffer_capacity: 1_000,
            decision_cache_ttl: Duration::from_secs(1),
            breaker_threshold: 3,
            breaker_cooldown: Duration::from_secs(30),
        }
    }
}

impl IndexerConfig {
    fn from_env() -> Self {
        let d = Self::default();
        Self {
            top_n: parse_or(var("INDEXER_TOP_N"), d.top_n, "INDEXER_TOP_N"),
            spike_ratio_min: parse_or(
                var("INDEXER_SPIKE_RATIO_MIN"),
                d.spike_ratio_min,
                "INDEXER_SPIKE_RATIO_MIN",
            ),
            retention_days: parse_or(
                var("INDEXER_RETENTION_DAYS"),
                d.retention_days,
                "INDEXER_RETENTION_DAYS",
            ),
            bulk_size: parse_or(var("INDEXER_BULK_SIZE"), d.bulk_size, "INDEXER_BULK_SIZE"),
            flush_interval: duration_or(
                var("INDEXER_FLUSH_INTERVAL"),
                d.flush_interval,
                "INDEXER_FLUSH_INTERVAL",
            ),
            buffer_capacity: parse_or(
                var("INDEXER_BUFFER_CAPACITY"),
                d.buffer_capacity,
                "INDEXER_BUFFER_CAPACITY",
            ),
            decision_cache_ttl: duration_or(
                var("INDEXER_DECISION_CACHE_TTL"),
                d.decision_cache_ttl,
                "INDEXER_DECISION_CACHE_TTL",
            ),
            breaker_threshold: parse_or(
                var("INDEXER_BREAKER_THRESHOLD"),
                d.breaker_threshold,
                "INDEXER_BREAKER_THRESHOLD",
            ),
            breaker_cooldown: duration_or(
                var("INDEXER_BREAKER_COOLDOWN"),
                d.breaker_cooldown,
                "INDEXER_BREAKER_COOLDOWN",
            ),
        }
    }
}

/// Alert stream and hub tuning.
#[derive(Debug, Clone, Deserialize)]
pub struct AlertConfig {
    /// Approximate length cap per alert stream.
    pub stream_maxlen: u64,
    /// Hub tail poll cadence.
    pub hub_poll_interval: Duration,
    /// Bounded per-subscriber channel depth.
    pub subscriber_capacity: usize,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            stream_maxlen: 1_000,
            hub_poll_interval: Duration::from_millis(250),
            subscriber_capacity: 64,
        }
    }
}

impl AlertConfig {
    fn from_env() -> Self {
        let d = Self::default();
        Self {
            stream_maxlen: parse_or(var("ALERT_STREAM_MAXLEN"), d.stream_maxlen, "ALERT_STREAM_MAXLEN"),
            hub_poll_interval: duration_or(
                var("ALERT_HUB_POLL_INTERVAL"),
                d.hub_poll_interval,
                "ALERT_HUB_POLL_INTERVAL",
            ),
            subscriber_capacity: parse_or(
                var("ALERT_SUBSCRIBER_CAPACITY"),
                d.subscriber_capacity,
                "ALERT_SUBSCRIBER_CAPACITY",
            ),
        }
    }
}

/// Consumer loop and supervisor tuning.
#[derive(Debug, Clone, Deserialize)]
pub struct ConsumerConfig {
    /// Transient-error retries per message before redelivery.
    pub max_retries: u32,
    /// Base backoff between retries; doubles per attempt.
    pub retry_backoff: Duration,
    /// Consumer restarts before its feature flag flips off.
    pub max_restarts: u32,
    pub restart_backoff: Duration,
    pub shutdown_timeout: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_backoff: Duration::from_millis(500),
            max_restarts: 5,
            restart_backoff: Duration::from_secs(1),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl ConsumerConfig {
    fn from_env() -> Self {
        let d = Self::default();
        Self {
            max_retries: parse_or(var("CONSUMER_MAX_RETRIES"), d.max_retries, "CONSUMER_MAX_RETRIES"),
            retry_backoff: duration_or(
                var("CONSUMER_RETRY_BACKOFF"),
                d.retry_backoff,
                "CONSUMER_RETRY_BACKOFF",
            ),
            max_restarts: parse_or(var("CONSUMER_MAX_RESTARTS"), d.max_restarts, "CONSUMER_MAX_RESTARTS"),
            restart_backoff: duration_or(
                var("CONSUMER_RESTART_BACKOFF"),
                d.restart_backoff,
                "CONSUMER_RESTART_BACKOFF",
            ),
            shutdown_timeout: duration_or(
                var("SHUTDOWN_TIMEOUT"),
                d.shutdown_timeout,
                "SHUTDOWN_TIMEOUT",
            ),
        }
    }
}

/// Top-level configuration loaded from the environment.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    pub redis_url: Option<String>,
    pub kafka: KafkaConfig,
    pub elastic: ElasticConfig,
    pub server: ServerConfig,
    pub tracker: TrackerConfig,
    pub spike: SpikeConfig,
    pub trending: TrendingConfig,
    pub edit_war: EditWarConfig,
    pub indexer: IndexerConfig,
    pub alerts: AlertConfig,
    pub consumer: ConsumerConfig,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        // Load .env file if present
        dotenvy::dotenv().ok();

        Ok(Self {
            redis_url: var("REDIS_URL"),
            kafka: KafkaConfig::from_env(),
            elastic: ElasticConfig::from_env(),
            server: ServerConfig::from_env(),
            tracker: TrackerConfig::from_env(),
            spike: SpikeConfig::from_env(),
            trending: TrendingConfig::from_env(),
            edit_war: EditWarConfig::from_env(),
            indexer: IndexerConfig::from_env(),
            alerts: AlertConfig::from_env(),
            consumer: ConsumerConfig::from_env(),
        })
    }
}
