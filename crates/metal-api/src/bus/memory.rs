//! In-process event bus
//!
//! One broadcast channel per topic; every subscription holds its own
//! receiver, which gives the same fan-out semantics as the etcd bus.

use super::{
    Dispatcher, Envelope, EventBus, MessageHandler, Subscription, SubscriptionNames,
    SubscriptionOptions,
};
use crate::error::BusError;
use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const DEFAULT_CAPACITY: usize = 1024;

pub struct MemoryEventBus {
    topics: DashMap<String, broadcast::Sender<Envelope>>,
    names: SubscriptionNames,
    capacity: usize,
}

impl Default for MemoryEventBus {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }
}

impl MemoryEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Per-topic buffer; a subscriber lagging further behind loses messages.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            topics: DashMap::new(),
            names: SubscriptionNames::default(),
            capacity: capacity.max(1),
        }
    }

    fn sender(&self, topic: &str) -> broadcast::Sender<Envelope> {
        self.topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }
}

#[async_trait]
impl EventBus for MemoryEventBus {
    async fn publish(&self, topic: &str, payload: serde_json::Value) -> Result<(), BusError> {
        let envelope = Envelope::new(topic, payload);
        // No receivers just means nobody is subscribed yet.
        if self.sender(topic).send(envelope).is_err() {
            debug!(topic = %topic, "Published with no subscribers");
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        topic: &str,
        name: &str,
        handler: MessageHandler,
        options: SubscriptionOptions,
    ) -> Result<Subscription, BusError> {
        let claim = self.names.claim(name)?;
        let mut rx = self.sender(topic).subscribe();
        let dispatcher = Dispatcher::new(name, handler, options);
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let subscription = name.to_string();

        let task = tokio::spawn(async move {
            let _claim = claim;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    msg = rx.recv() => match msg {
                        Ok(envelope) => dispatcher.dispatch(envelope).await,
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(
                                subscription = %subscription,
                                skipped = skipped,
                                "Subscriber lagged, messages lost"
                            );
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
            debug!(subscription = %subscription, "Subscription closed");
        });

        Ok(Subscription::new(name.to_string(), cancel, task))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn collecting_handler(tx: mpsc::UnboundedSender<serde_json::Value>) -> MessageHandler {
        Arc::new(move |payload: serde_json::Value| {
            let _ = tx.send(payload);
            async { Ok::<_, BusError>(()) }.boxed()
        })
    }

    fn options() -> SubscriptionOptions {
        SubscriptionOptions {
            concurrency: 4,
            handler_timeout: Duration::from_secs(1),
            message_ttl: Duration::from_secs(30),
        }
    }

    #[tokio::test]
    async fn test_every_subscription_receives_every_message() {
        let bus = MemoryEventBus::new();
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();

        let _a = bus
            .subscribe("alloc", "replica-a", collecting_handler(tx_a), options())
            .await
            .unwrap();
        let _b = bus
            .subscribe("alloc", "replica-b", collecting_handler(tx_b), options())
            .await
            .unwrap();

        bus.publish("alloc", serde_json::json!({"machine_id": "m1"}))
            .await
            .unwrap();

        let a = tokio::time::timeout(Duration::from_secs(1), rx_a.recv()).await.unwrap();
        let b = tokio::time::timeout(Duration::from_secs(1), rx_b.recv()).await.unwrap();
        assert_eq!(a, Some(serde_json::json!({"machine_id": "m1"})));
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn test_duplicate_name_rejected_until_closed() {
        let bus = MemoryEventBus::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let sub = bus
            .subscribe("alloc", "replica-a", collecting_handler(tx.clone()), options())
            .await
            .unwrap();
        assert_eq!(sub.name(), "replica-a");

        let dup = bus
            .subscribe("alloc", "replica-a", collecting_handler(tx.clone()), options())
            .await;
        assert!(matches!(dup, Err(BusError::DuplicateSubscription(_))));

        sub.close().await;
        assert!(bus
            .subscribe("alloc", "replica-a", collecting_handler(tx), options())
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_ok() {
        let bus = MemoryEventBus::new();
        assert!(bus.publish("alloc", serde_json::json!({})).await.is_ok());
    }
}
