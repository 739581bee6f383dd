//! Broker consumers: one per analytics component, each in its own
//! consumer group so offsets and failures stay isolated.
//!
//! Per-message flow is decode -> handle -> commit. Malformed payloads go
//! to the dead-letter stream and the offset is committed so the consumer
//! progresses; transient handler errors are retried with backoff, and
//! exhausted retries abort the consumer without committing, so the broker
//! redelivers from the last committed offset after the supervisor
//! restarts it.

pub mod supervisor;

use crate::error::Result;
use crate::keys::Keys;
use crate::metrics::Metrics;
use crate::store::SharedStore;
use async_trait::async_trait;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::BorrowedMessage;
use rdkafka::{ClientConfig, Message};
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use wikisurge_config::{ConsumerConfig, KafkaConfig};
use wikisurge_model::Edit;

const DEAD_LETTER_MAXLEN: u64 = 1_000;

/// One analytics component, as seen by its consumer loop.
#[async_trait]
pub trait EditHandler: Send + Sync {
    /// Stable component name; also the consumer group suffix.
    fn name(&self) -> &'static str;

    async fn handle(&self, edit: &Edit) -> Result<()>;
}

pub struct KafkaEditConsumer {
    consumer: StreamConsumer,
    handler: Arc<dyn EditHandler>,
    store: SharedStore,
    config: ConsumerConfig,
    metrics: Arc<Metrics>,
}

impl fmt::Debug for KafkaEditConsumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KafkaEditConsumer")
            .field("handler", &self.handler.name())
            .finish()
    }
}

impl KafkaEditConsumer {
    pub fn new(
        kafka: &KafkaConfig,
        config: ConsumerConfig,
        handler: Arc<dyn EditHandler>,
        store: SharedStore,
        metrics: Arc<Metrics>,
    ) -> Result<Self> {
        let group = format!("{}-{}", kafka.group_prefix, handler.name());
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &kafka.brokers)
            .set("group.id", &group)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "latest")
            .set("enable.partition.eof", "false")
            .create()?;
        consumer.subscribe(&[&kafka.topic])?;

        info!(group = %group, topic = %kafka.topic, "consumer subscribed");
        Ok(Self {
            consumer,
            handler,
            store,
            config,
            metrics,
        })
    }

    /// Consumes until shutdown (Ok) or an unrecoverable per-message
    /// failure (Err; the supervisor owns the restart).
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!(consumer = self.handler.name(), "consumer shutting down");
                    return Ok(());
                }
                received = self.consumer.recv() => match received {
                    Ok(message) => self.process_message(&message).await?,
                    Err(err) => {
                        warn!(consumer = self.handler.name(), "broker receive error: {err}");
                        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                    }
                }
            }
        }
    }

    async fn process_message(&self, message: &BorrowedMessage<'_>) -> Result<()> {
        let Some(payload) = message.payload() else {
            self.commit(message)?;
            return Ok(());
        };

        let edit: Edit = match serde_json::from_slice(payload) {
            Ok(edit) => edit,
            Err(err) => {
                // Poison: park it with context and move on.
                self.dead_letter(payload, &err.to_string()).await?;
                Metrics::incr(&self.metrics.poison_messages);
                self.commit(message)?;
                return Ok(());
            }
        };

        Metrics::incr(&self.metrics.edits_processed);

        let mut attempt = 0u32;
        loop {
            match self.handler.handle(&edit).await {
                Ok(()) => {
                    self.commit(message)?;
                    return Ok(());
                }
                Err(err) if attempt < self.config.max_retries => {
                    attempt += 1;
                    Metrics::incr(&self.metrics.handler_retries);
                    let backoff = self.config.retry_backoff * 2u32.pow(attempt - 1);
                    debug!(
                        consumer = self.handler.name(),
                        attempt,
                        "handler error, retrying in {backoff:?}: {err}"
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(err) => {
                    warn!(
                        consumer = self.handler.name(),
                        "retries exhausted, offset not committed: {err}"
                    );
                    return Err(err);
                }
            }
        }
    }

    fn commit(&self, message: &BorrowedMessage<'_>) -> Result<()> {
        self.consumer.commit_message(message, CommitMode::Async)?;
        Ok(())
    }

    async fn dead_letter(&self, payload: &[u8], reason: &str) -> Result<()> {
        let fields = vec![
            ("consumer".to_string(), self.handler.name().to_string()),
            (
                "payload".to_string(),
                String::from_utf8_lossy(payload).into_owned(),
            ),
            ("error".to_string(), reason.to_string()),
            (
                "timestamp".to_string(),
                chrono::Utc::now().timestamp().to_string(),
            ),
        ];
        self.store
            .xadd_capped(Keys::dead_letter(), &fields, DEAD_LETTER_MAXLEN)
            .await?;
        warn!(consumer = self.handler.name(), "poison message dead-lettered: {reason}");
        Ok(())
    }
}
