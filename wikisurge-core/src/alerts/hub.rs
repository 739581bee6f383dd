//! Alert hub: one tailer per process, fanned out to live listeners.
//!
//! The hub is the only subscriber the storage layer ever sees; adding a
//! thousand push clients adds zero storage load. Each subscriber holds a
//! bounded channel and slow ones lose messages rather than stalling the
//! fan-out.

use crate::error::Result;
use crate::metrics::Metrics;
use crate::store::SharedStore;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{RwLock, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use wikisurge_model::{Alert, AlertKind};

type Registry = Arc<RwLock<HashMap<u64, mpsc::Sender<Alert>>>>;

/// Removes its subscriber when asked; dropping without unsubscribing just
/// leaves a closed channel for the next broadcast to reap.
pub struct Subscription {
    id: u64,
    subscribers: Registry,
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

impl Subscription {
    pub async fn unsubscribe(self) {
        self.subscribers.write().await.remove(&self.id);
    }
}

pub struct AlertHub {
    store: SharedStore,
    poll_interval: Duration,
    subscriber_capacity: usize,
    subscribers: Registry,
    next_id: AtomicU64,
    metrics: Arc<Metrics>,
}

impl fmt::Debug for AlertHub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AlertHub")
            .field("poll_interval", &self.poll_interval)
            .field("subscriber_capacity", &self.subscriber_capacity)
            .finish()
    }
}

impl AlertHub {
    pub fn new(
        store: SharedStore,
        poll_interval: Duration,
        subscriber_capacity: usize,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            store,
            poll_interval,
            subscriber_capacity,
            subscribers: Arc::new(RwLock::new(HashMap::new())),
            next_id: AtomicU64::new(0),
            metrics,
        }
    }

    /// Registers a listener. The channel is bounded; a full listener drops
    /// alerts instead of blocking the fan-out.
    pub async fn subscribe(&self) -> (mpsc::Receiver<Alert>, Subscription) {
        let (tx, rx) = mpsc::channel(self.subscriber_capacity);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers.write().await.insert(id, tx);
        debug!(id, "alert hub subscriber added");
        (
            rx,
            Subscription {
                id,
                subscribers: Arc::clone(&self.subscribers),
            },
        )
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.read().await.len()
    }

    /// Tails both alert streams until shutdown. Only alerts appended after
    /// startup are delivered; history belongs to the streams themselves.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let kinds = [AlertKind::Spike, AlertKind::EditWar];
        let mut cursors: HashMap<AlertKind, Option<String>> = HashMap::new();
        for kind in kinds {
            match self.store.xlast_id(kind.stream()).await {
                Ok(id) => {
                    cursors.insert(kind, id);
                }
                Err(err) => {
                    warn!(stream = kind.stream(), "failed to read stream tail: {err}");
                    cursors.insert(kind, None);
                }
            }
        }

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("alert hub shutting down");
                    break;
                }
                _ = tokio::time::sleep(self.poll_interval) => {
                    for kind in kinds {
                        if let Err(err) = self.drain_stream(kind, &mut cursors).await {
                            warn!(stream = kind.stream(), "alert hub poll failed: {err}");
                        }
                    }
                }
            }
        }
    }

    async fn drain_stream(
        &self,
        kind: AlertKind,
        cursors: &mut HashMap<AlertKind, Option<String>>,
    ) -> Result<()> {
        let cursor = cursors.get(&kind).cloned().flatten();
        let entries = self
            .store
            .xrange_after(kind.stream(), cursor.as_deref(), 100)
            .await?;

        for entry in entries {
            cursors.insert(kind, Some(entry.id.clone()));
            let Some(alert) = entry
                .field("data")
                .and_then(|data| serde_json::from_str::<Alert>(data).ok())
            else {
                warn!(stream = kind.stream(), id = %entry.id, "undecodable alert entry");
                continue;
            };
            self.broadcast(&alert).await;
        }
        Ok(())
    }

    /// Non-blocking fan-out under the read lock; dead subscribers are
    /// reaped afterwards under the write lock.
    async fn broadcast(&self, alert: &Alert) {
        let mut dead: Vec<u64> = Vec::new();
        {
            let subscribers = self.subscribers.read().await;
            for (id, tx) in subscribers.iter() {
                match tx.try_send(alert.clone()) {
                    Ok(()) => Metrics::incr(&self.metrics.hub_delivered),
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        Metrics::incr(&self.metrics.hub_dropped);
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => dead.push(*id),
                }
            }
        }
        if !dead.is_empty() {
            let mut subscribers = self.subscribers.write().await;
            for id in dead {
                subscribers.remove(&id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::AlertPublisher;
    use crate::store::MemoryStore;
    use wikisurge_model::{AlertPayload, Severity};

    fn alert(title: &str, ts: i64) -> Alert {
        Alert {
            title: title.into(),
            wiki: "enwiki".into(),
            timestamp: ts,
            payload: AlertPayload::Spike {
                ratio: 25.0,
                edits_last_5min: 20,
                severity: Severity::High,
            },
        }
    }

    fn hub_on(store: Arc<MemoryStore>) -> Arc<AlertHub> {
        Arc::new(AlertHub::new(
            store,
            Duration::from_millis(10),
            4,
            Arc::new(Metrics::default()),
        ))
    }

    #[tokio::test]
    async fn subscribers_receive_only_post_subscription_alerts() {
        let store = Arc::new(MemoryStore::new());
        let publisher = AlertPublisher::new(store.clone(), 1_000);
        let hub = hub_on(store);

        // History before the hub starts is not replayed.
        publisher.publish(&alert("Old", 1)).await.unwrap();

        let shutdown = CancellationToken::new();
        let runner = tokio::spawn(hub.clone().run(shutdown.clone()));
        let (mut rx, sub) = hub.subscribe().await;

        tokio::time::sleep(Duration::from_millis(30)).await;
        publisher.publish(&alert("Fresh", 2)).await.unwrap();

        let received = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("hub delivers within a poll interval")
            .expect("channel open");
        assert_eq!(received.title, "Fresh");

        sub.unsubscribe().await;
        assert_eq!(hub.subscriber_count().await, 0);

        shutdown.cancel();
        runner.await.unwrap();
    }

    #[tokio::test]
    async fn both_streams_reach_every_subscriber() {
        let store = Arc::new(MemoryStore::new());
        let publisher = AlertPublisher::new(store.clone(), 1_000);
        let hub = hub_on(store);

        let shutdown = CancellationToken::new();
        let runner = tokio::spawn(hub.clone().run(shutdown.clone()));
        let (mut rx_a, _sub_a) = hub.subscribe().await;
        let (mut rx_b, _sub_b) = hub.subscribe().await;

        tokio::time::sleep(Duration::from_millis(30)).await;
        let war = Alert {
            title: "Contested".into(),
            wiki: "enwiki".into(),
            timestamp: 5,
            payload: AlertPayload::EditWar {
                editors: vec!["A".into(), "B".into()],
                edit_count: 6,
                revert_count: 2,
                severity: Severity::High,
                started_at: 1,
            },
        };
        publisher.publish(&alert("Spiking", 4)).await.unwrap();
        publisher.publish(&war).await.unwrap();

        for rx in [&mut rx_a, &mut rx_b] {
            let mut kinds = Vec::new();
            for _ in 0..2 {
                let alert = tokio::time::timeout(Duration::from_secs(1), rx.recv())
                    .await
                    .expect("delivered")
                    .expect("open");
                kinds.push(alert.kind());
            }
            kinds.sort_by_key(|k| k.stream());
            assert_eq!(kinds, vec![AlertKind::EditWar, AlertKind::Spike]);
        }

        shutdown.cancel();
        runner.await.unwrap();
    }

    #[tokio::test]
    async fn slow_subscribers_lose_alerts_not_the_hub() {
        let store = Arc::new(MemoryStore::new());
        let publisher = AlertPublisher::new(store.clone(), 1_000);
        let hub = hub_on(store);

        let shutdown = CancellationToken::new();
        let runner = tokio::spawn(hub.clone().run(shutdown.clone()));
        // Capacity 4 and never read: later alerts drop.
        let (_rx, _sub) = hub.subscribe().await;

        tokio::time::sleep(Duration::from_millis(30)).await;
        for i in 0..10 {
            publisher.publish(&alert("Flood", i)).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(100)).await;

        let snap = hub.metrics.snapshot();
        assert_eq!(snap.hub_delivered, 4);
        assert_eq!(snap.hub_dropped, 6);

        shutdown.cancel();
        runner.await.unwrap();
    }
}
