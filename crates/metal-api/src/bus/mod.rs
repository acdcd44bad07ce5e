//! Event Bus
//!
//! Publish/subscribe with fan-out delivery: every subscription receives
//! every message published on its topic. Subscriptions are named and a
//! name may only be used once per bus, so each replica subscribes with its
//! own unique name instead of competing with the others.
//!
//! - `etcd`: messages are leased keys under a topic prefix, watched by every subscriber
//! - `memory`: in-process broadcast channels

pub mod etcd;
pub mod memory;

pub use etcd::EtcdEventBus;
pub use memory::MemoryEventBus;

use crate::config::BusConfig;
use crate::error::BusError;
use crate::observability::{events, metrics};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashSet;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use uuid::Uuid;

pub type HandlerFuture = BoxFuture<'static, Result<(), BusError>>;

/// Callback invoked once per delivered message payload.
pub type MessageHandler = Arc<dyn Fn(serde_json::Value) -> HandlerFuture + Send + Sync>;

/// Wire format of every bus message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub id: Uuid,
    pub topic: String,
    pub published_at: DateTime<Utc>,
    pub payload: serde_json::Value,
}

impl Envelope {
    pub fn new(topic: &str, payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            topic: topic.to_string(),
            published_at: Utc::now(),
            payload,
        }
    }

    /// True if the message is older than `ttl` at `now`.
    pub fn is_expired_at(&self, ttl: Duration, now: DateTime<Utc>) -> bool {
        match chrono::Duration::from_std(ttl) {
            Ok(ttl) => now - self.published_at > ttl,
            Err(_) => false,
        }
    }
}

/// Per-subscription delivery settings.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionOptions {
    /// Maximum handler invocations in flight
    pub concurrency: usize,
    pub handler_timeout: Duration,
    pub message_ttl: Duration,
}

impl From<&BusConfig> for SubscriptionOptions {
    fn from(config: &BusConfig) -> Self {
        Self {
            concurrency: config.handler_concurrency.max(1),
            handler_timeout: config.handler_timeout,
            message_ttl: config.message_ttl,
        }
    }
}

#[async_trait]
pub trait EventBus: Send + Sync {
    async fn publish(&self, topic: &str, payload: serde_json::Value) -> Result<(), BusError>;

    /// Register a named fan-out subscription and start delivering to `handler`.
    async fn subscribe(
        &self,
        topic: &str,
        name: &str,
        handler: MessageHandler,
        options: SubscriptionOptions,
    ) -> Result<Subscription, BusError>;
}

/// Handle to a running subscription. Dropping it stops delivery.
pub struct Subscription {
    name: String,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl Subscription {
    pub(crate) fn new(name: String, cancel: CancellationToken, task: JoinHandle<()>) -> Self {
        Self {
            name,
            cancel,
            task: Some(task),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stop delivery and wait for the receive loop to exit.
    pub async fn close(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Subscription names in use on one bus instance.
#[derive(Clone, Default)]
pub(crate) struct SubscriptionNames(Arc<DashSet<String>>);

impl SubscriptionNames {
    pub(crate) fn claim(&self, name: &str) -> Result<NameClaim, BusError> {
        if !self.0.insert(name.to_string()) {
            return Err(BusError::DuplicateSubscription(name.to_string()));
        }
        Ok(NameClaim {
            names: self.0.clone(),
            name: name.to_string(),
        })
    }
}

/// Releases the subscription name when the receive loop ends.
pub(crate) struct NameClaim {
    names: Arc<DashSet<String>>,
    name: String,
}

impl Drop for NameClaim {
    fn drop(&mut self) {
        self.names.remove(&self.name);
    }
}

/// Runs handler invocations for one subscription: bounded concurrency,
/// per-invocation timeout, and panic isolation.
pub(crate) struct Dispatcher {
    subscription: String,
    handler: MessageHandler,
    options: SubscriptionOptions,
    permits: Arc<Semaphore>,
    /// Compare `published_at` against the local clock
    check_age: bool,
}

impl Dispatcher {
    pub(crate) fn new(subscription: &str, handler: MessageHandler, options: SubscriptionOptions) -> Self {
        let permits = Arc::new(Semaphore::new(options.concurrency.max(1)));
        Self {
            subscription: subscription.to_string(),
            handler,
            options,
            permits,
            check_age: true,
        }
    }

    /// For backends that expire messages themselves. Skips the age check, so
    /// clock skew between publisher and subscriber cannot drop deliveries.
    pub(crate) fn backend_expiry(mut self) -> Self {
        self.check_age = false;
        self
    }

    /// Hand one message to the handler. Waits for a free slot, then runs the
    /// handler in its own task so slow deliveries do not stall the stream.
    pub(crate) async fn dispatch(&self, envelope: Envelope) {
        if self.check_age && envelope.is_expired_at(self.options.message_ttl, Utc::now()) {
            warn!(
                subscription = %self.subscription,
                message_id = %envelope.id,
                published_at = %envelope.published_at,
                "Dropping expired bus message"
            );
            metrics::record_bus_handler_failure("expired");
            return;
        }

        let Ok(permit) = self.permits.clone().acquire_owned().await else {
            return;
        };

        let handler = self.handler.clone();
        let subscription = self.subscription.clone();
        let timeout = self.options.handler_timeout;

        tokio::spawn(async move {
            let _permit = permit;
            let message_id = envelope.id;
            let payload = envelope.payload;
            let invocation = AssertUnwindSafe(async move { handler(payload).await }).catch_unwind();

            match tokio::time::timeout(timeout, invocation).await {
                Ok(Ok(Ok(()))) => {}
                Ok(Ok(Err(e))) => {
                    events::bus_handler_failed(&subscription, &message_id.to_string(), &e.to_string());
                    metrics::record_bus_handler_failure("error");
                }
                Ok(Err(_panic)) => {
                    events::bus_handler_failed(&subscription, &message_id.to_string(), "handler panicked");
                    metrics::record_bus_handler_failure("panic");
                }
                Err(_) => {
                    events::bus_handler_failed(&subscription, &message_id.to_string(), "handler timed out");
                    metrics::record_bus_handler_failure("timeout");
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn options(timeout: Duration) -> SubscriptionOptions {
        SubscriptionOptions {
            concurrency: 2,
            handler_timeout: timeout,
            message_ttl: Duration::from_secs(30),
        }
    }

    #[test]
    fn test_envelope_expiry() {
        let envelope = Envelope::new("t", serde_json::json!({}));
        let later = envelope.published_at + chrono::Duration::seconds(31);
        assert!(envelope.is_expired_at(Duration::from_secs(30), later));
        assert!(!envelope.is_expired_at(Duration::from_secs(30), envelope.published_at));
    }

    #[test]
    fn test_subscription_names_are_exclusive() {
        let names = SubscriptionNames::default();
        let claim = names.claim("replica-a").unwrap();
        assert!(matches!(
            names.claim("replica-a"),
            Err(BusError::DuplicateSubscription(_))
        ));
        drop(claim);
        assert!(names.claim("replica-a").is_ok());
    }

    #[tokio::test]
    async fn test_dispatcher_survives_panic_and_timeout() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let handler: MessageHandler = Arc::new(move |payload: serde_json::Value| {
            let counter = counter.clone();
            async move {
                match payload.as_str() {
                    Some("panic") => panic!("boom"),
                    Some("slow") => tokio::time::sleep(Duration::from_secs(5)).await,
                    _ => {}
                }
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<_, BusError>(())
            }
            .boxed()
        });

        let dispatcher = Dispatcher::new("test", handler, options(Duration::from_millis(50)));
        dispatcher.dispatch(Envelope::new("t", serde_json::json!("panic"))).await;
        dispatcher.dispatch(Envelope::new("t", serde_json::json!("slow"))).await;
        dispatcher.dispatch(Envelope::new("t", serde_json::json!("ok"))).await;

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_dispatcher_drops_expired() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let handler: MessageHandler = Arc::new(move |_: serde_json::Value| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, BusError>(()) }.boxed()
        });

        let dispatcher = Dispatcher::new("test", handler, options(Duration::from_secs(1)));
        let mut envelope = Envelope::new("t", serde_json::json!({}));
        envelope.published_at = Utc::now() - chrono::Duration::seconds(60);
        dispatcher.dispatch(envelope).await;

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_backend_expiry_ignores_publisher_clock() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let handler: MessageHandler = Arc::new(move |_: serde_json::Value| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, BusError>(()) }.boxed()
        });

        let dispatcher =
            Dispatcher::new("test", handler, options(Duration::from_secs(1))).backend_expiry();
        // Publisher clock a minute behind this replica's.
        let mut envelope = Envelope::new("t", serde_json::json!({}));
        envelope.published_at = Utc::now() - chrono::Duration::seconds(60);
        dispatcher.dispatch(envelope).await;

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
