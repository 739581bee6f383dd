//! Pipeline runtime: lifecycle, health, and graceful shutdown for every
//! consumer and background loop in the process.
//!
//! Supervision is restart-with-backoff per consumer. A consumer that keeps
//! failing has its feature flag flipped off and the pipeline runs degraded
//! rather than crash-looping the whole process.

use crate::alerts::AlertPublisher;
use crate::alerts::hub::AlertHub;
use crate::consumer::{EditHandler, KafkaEditConsumer};
use crate::editwar::EditWarDetector;
use crate::error::Result;
use crate::indexer::sink::BulkSink;
use crate::indexer::{IndexFlusher, SelectiveIndexer};
use crate::metrics::Metrics;
use crate::spike::SpikeDetector;
use crate::store::SharedStore;
use crate::tracker::HotPageTracker;
use crate::trending::TrendingScorer;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use wikisurge_config::Config;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsumerState {
    Running,
    Restarting,
    Disabled,
    Stopped,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct ConsumerHealth {
    pub state: ConsumerState,
    pub restarts: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    pub consumers: HashMap<&'static str, ConsumerHealth>,
}

type HealthRegistry = Arc<RwLock<HashMap<&'static str, ConsumerHealth>>>;

pub struct PipelineRuntime {
    store: SharedStore,
    config: Config,
    sink: Arc<dyn BulkSink>,
    metrics: Arc<Metrics>,

    tracker: Arc<HotPageTracker>,
    trending: Arc<TrendingScorer>,
    spike: Arc<SpikeDetector>,
    editwar: Arc<EditWarDetector>,
    indexer: Arc<SelectiveIndexer>,
    flusher: Mutex<Option<IndexFlusher>>,
    hub: Arc<AlertHub>,

    health: HealthRegistry,
    shutdown_token: CancellationToken,
    worker_handles: Mutex<Vec<JoinHandle<()>>>,
}

impl fmt::Debug for PipelineRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineRuntime")
            .field("shutdown_cancelled", &self.shutdown_token.is_cancelled())
            .finish()
    }
}

impl PipelineRuntime {
    pub fn new(
        store: SharedStore,
        sink: Arc<dyn BulkSink>,
        config: Config,
        metrics: Arc<Metrics>,
    ) -> Self {
        let publisher = AlertPublisher::new(Arc::clone(&store), config.alerts.stream_maxlen);

        let tracker = Arc::new(HotPageTracker::new(
            Arc::clone(&store),
            config.tracker.clone(),
            Arc::clone(&metrics),
        ));
        let trending = Arc::new(TrendingScorer::new(
            Arc::clone(&store),
            config.trending.clone(),
            Arc::clone(&metrics),
        ));
        let spike = Arc::new(SpikeDetector::new(
            tracker.clone(),
            Arc::clone(&store),
            publisher.clone(),
            config.spike.clone(),
            Arc::clone(&metrics),
        ));
        let editwar = Arc::new(EditWarDetector::new(
            tracker.clone(),
            Arc::clone(&store),
            publisher.clone(),
            config.edit_war.clone(),
            Arc::clone(&metrics),
        ));
        let (indexer, flusher) = SelectiveIndexer::new(
            Arc::clone(&store),
            tracker.clone(),
            trending.clone(),
            Arc::clone(&sink),
            &config.elastic.index_prefix,
            config.indexer.clone(),
            Arc::clone(&metrics),
        );
        let hub = Arc::new(AlertHub::new(
            Arc::clone(&store),
            config.alerts.hub_poll_interval,
            config.alerts.subscriber_capacity,
            Arc::clone(&metrics),
        ));

        Self {
            store,
            config,
            sink,
            metrics,
            tracker,
            trending,
            spike,
            editwar,
            indexer: Arc::new(indexer),
            flusher: Mutex::new(Some(flusher)),
            hub,
            health: Arc::new(RwLock::new(HashMap::new())),
            shutdown_token: CancellationToken::new(),
            worker_handles: Mutex::new(Vec::new()),
        }
    }

    pub fn hub(&self) -> Arc<AlertHub> {
        Arc::clone(&self.hub)
    }

    pub fn indexer(&self) -> Arc<SelectiveIndexer> {
        Arc::clone(&self.indexer)
    }

    pub fn trending(&self) -> Arc<TrendingScorer> {
        Arc::clone(&self.trending)
    }

    pub async fn start(&self) -> Result<()> {
        self.start_background().await;
        self.start_consumers().await;
        Ok(())
    }

    /// Timers and fan-out: cleanup, pruning, the flusher, the hub.
    pub async fn start_background(&self) {
        // Retention setup is best-effort; the breaker covers a sink that
        // stays down.
        if let Err(err) = self
            .sink
            .ensure_retention(self.config.indexer.retention_days)
            .await
        {
            warn!("could not install index retention policy: {err}");
        }

        let mut handles = self.worker_handles.lock().await;
        handles.push(tokio::spawn(
            self.tracker.clone().run_cleanup(self.shutdown_token.clone()),
        ));
        handles.push(tokio::spawn(
            self.trending.clone().run_prune(self.shutdown_token.clone()),
        ));
        handles.push(tokio::spawn(
            self.hub.clone().run(self.shutdown_token.clone()),
        ));
        if let Some(flusher) = self.flusher.lock().await.take() {
            handles.push(tokio::spawn(flusher.run(self.shutdown_token.clone())));
        }
    }

    /// One supervised broker consumer per enabled component.
    pub async fn start_consumers(&self) {
        let mut handlers: Vec<Arc<dyn EditHandler>> = vec![
            self.tracker.clone(),
            self.spike.clone(),
            self.trending.clone(),
            self.indexer.clone(),
        ];
        if self.config.edit_war.enabled {
            handlers.push(self.editwar.clone());
        } else {
            info!("edit-war detection disabled by config");
        }

        let mut handles = self.worker_handles.lock().await;
        for handler in handlers {
            handles.push(self.spawn_supervised(handler).await);
        }
    }

    async fn spawn_supervised(&self, handler: Arc<dyn EditHandler>) -> JoinHandle<()> {
        let name = handler.name();
        self.health.write().await.insert(
            name,
            ConsumerHealth {
                state: ConsumerState::Running,
                restarts: 0,
            },
        );

        let store = Arc::clone(&self.store);
        let metrics = Arc::clone(&self.metrics);
        let kafka = self.config.kafka.clone();
        let consumer_cfg = self.config.consumer.clone();
        let health = Arc::clone(&self.health);
        let shutdown = self.shutdown_token.clone();

        tokio::spawn(async move {
            let mut restarts = 0u32;
            loop {
                if shutdown.is_cancelled() {
                    break;
                }

                let outcome = match KafkaEditConsumer::new(
                    &kafka,
                    consumer_cfg.clone(),
                    handler.clone(),
                    Arc::clone(&store),
                    Arc::clone(&metrics),
                ) {
                    Ok(consumer) => {
                        set_state(&health, name, ConsumerState::Running, restarts).await;
                        consumer.run(shutdown.clone()).await
                    }
                    Err(err) => Err(err),
                };

                match outcome {
                    Ok(()) => {
                        set_state(&health, name, ConsumerState::Stopped, restarts).await;
                        break;
                    }
                    Err(err) => {
                        restarts += 1;
                        Metrics::incr(&metrics.consumer_restarts);
                        if restarts > consumer_cfg.max_restarts {
                            set_state(&health, name, ConsumerState::Disabled, restarts).await;
                            error!(
                                consumer = name,
                                restarts, "too many failures, consumer disabled: {err}"
                            );
                            break;
                        }
                        set_state(&health, name, ConsumerState::Restarting, restarts).await;

                        let backoff = consumer_cfg.restart_backoff
                            * 2u32.pow((restarts - 1).min(6))
                            + std::time::Duration::from_millis(rand::random_range(0..250));
                        warn!(
                            consumer = name,
                            restarts, "consumer failed, restarting in {backoff:?}: {err}"
                        );
                        tokio::select! {
                            _ = shutdown.cancelled() => break,
                            _ = tokio::time::sleep(backoff) => {}
                        }
                    }
                }
            }
        })
    }

    pub async fn health(&self) -> HealthReport {
        let consumers = self.health.read().await.clone();
        let degraded = consumers
            .values()
            .any(|h| matches!(h.state, ConsumerState::Restarting | ConsumerState::Disabled));
        HealthReport {
            status: if degraded { "degraded" } else { "healthy" },
            consumers,
        }
    }

    /// Cancels everything and waits out the shutdown window. The flusher
    /// drains its buffer inside the same window.
    pub async fn shutdown(&self) -> Result<()> {
        info!("initiating graceful shutdown of pipeline runtime");
        self.shutdown_token.cancel();

        let handles = {
            let mut guard = self.worker_handles.lock().await;
            std::mem::take(&mut *guard)
        };

        let deadline = tokio::time::Instant::now() + self.config.consumer.shutdown_timeout;
        for handle in handles {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            match tokio::time::timeout(remaining, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!("worker task failed during shutdown: {err:?}"),
                Err(_) => {
                    warn!("shutdown timeout exceeded, abandoning remaining workers");
                    break;
                }
            }
        }

        info!("pipeline runtime shutdown complete");
        Ok(())
    }
}

async fn set_state(health: &HealthRegistry, name: &'static str, state: ConsumerState, restarts: u32) {
    health
        .write()
        .await
        .insert(name, ConsumerHealth { state, restarts });
}
