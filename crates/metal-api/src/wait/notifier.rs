//! Allocation Notifier
//!
//! Publishes an allocation event after an allocation commits, and turns
//! allocation events from the bus into wake-ups for streams blocked on this
//! replica. Every replica subscribes under its own name, so each one sees
//! every event and only the replica holding the stream finds a match.

use super::WaitRegistry;
use crate::bus::{EventBus, MessageHandler, Subscription, SubscriptionOptions};
use crate::config::BusConfig;
use crate::error::BusError;
use crate::models::AllocationEvent;
use crate::observability::{events, metrics};
use futures::FutureExt;
use std::sync::Arc;
use tracing::info;

pub struct AllocationNotifier {
    bus: Arc<dyn EventBus>,
    registry: Arc<WaitRegistry>,
    topic: String,
    subscription_name: String,
    options: SubscriptionOptions,
}

impl AllocationNotifier {
    pub fn new(
        bus: Arc<dyn EventBus>,
        registry: Arc<WaitRegistry>,
        node_id: &str,
        config: &BusConfig,
    ) -> Self {
        Self {
            bus,
            registry,
            topic: config.allocation_topic.clone(),
            subscription_name: format!("{node_id}-{}", uuid::Uuid::new_v4()),
            options: SubscriptionOptions::from(config),
        }
    }

    pub fn subscription_name(&self) -> &str {
        &self.subscription_name
    }

    /// Publish an allocation event. Failures are logged and swallowed:
    /// the waiting stream's store poll picks the allocation up later.
    pub async fn notify(&self, machine_id: &str) {
        let event = AllocationEvent {
            machine_id: machine_id.to_string(),
        };
        let result = match serde_json::to_value(&event) {
            Ok(payload) => self.bus.publish(&self.topic, payload).await,
            Err(e) => Err(BusError::from(e)),
        };

        match result {
            Ok(()) => {
                events::allocation_published(machine_id, &self.topic);
                metrics::record_allocation_notification("published");
            }
            Err(e) => {
                events::allocation_publish_failed(machine_id, &self.topic, &e.to_string());
                metrics::record_allocation_notification("publish_failed");
            }
        }
    }

    /// Subscribe this replica to the allocation topic. Call once per process
    /// and keep the returned handle alive for as long as events should flow.
    pub async fn subscribe(&self) -> Result<Subscription, BusError> {
        let registry = self.registry.clone();
        let subscription = self.subscription_name.clone();

        let handler: MessageHandler = Arc::new(move |payload: serde_json::Value| {
            let registry = registry.clone();
            let subscription = subscription.clone();
            async move {
                let event: AllocationEvent = serde_json::from_value(payload)?;
                wake(&registry, &subscription, &event.machine_id);
                Ok::<_, BusError>(())
            }
            .boxed()
        });

        let handle = self
            .bus
            .subscribe(
                &self.topic,
                &self.subscription_name,
                handler,
                self.options.clone(),
            )
            .await?;

        info!(
            topic = %self.topic,
            subscription = %self.subscription_name,
            "Subscribed to allocation events"
        );
        Ok(handle)
    }

    /// Wake the stream blocked on `machine_id`, if it is on this replica.
    pub fn handle_allocation(&self, machine_id: &str) -> bool {
        wake(&self.registry, &self.subscription_name, machine_id)
    }
}

fn wake(registry: &WaitRegistry, subscription: &str, machine_id: &str) -> bool {
    let woke = registry
        .lookup(machine_id)
        .is_some_and(|signal| signal.fire(true));

    events::allocation_delivered(machine_id, subscription, woke);
    metrics::record_allocation_notification(if woke { "woke" } else { "missed" });
    woke
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MemoryEventBus;
    use crate::wait::Wake;
    use std::time::Duration;

    fn notifier(bus: Arc<dyn EventBus>, registry: Arc<WaitRegistry>, node: &str) -> AllocationNotifier {
        AllocationNotifier::new(bus, registry, node, &BusConfig::default())
    }

    #[test]
    fn test_unregistered_id_is_noop() {
        let bus: Arc<dyn EventBus> = Arc::new(MemoryEventBus::new());
        let registry = Arc::new(WaitRegistry::new());
        let notifier = notifier(bus, registry.clone(), "node-a");

        assert!(!notifier.handle_allocation("unknown"));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_handle_allocation_fires_signal() {
        let bus: Arc<dyn EventBus> = Arc::new(MemoryEventBus::new());
        let registry = Arc::new(WaitRegistry::new());
        let notifier = notifier(bus, registry.clone(), "node-a");

        let mut registration = registry.register("m1").unwrap();
        assert!(notifier.handle_allocation("m1"));
        // Duplicate delivery is harmless.
        assert!(!notifier.handle_allocation("m1"));
        assert_eq!(registration.woken().await, Wake::Allocated);
    }

    #[tokio::test]
    async fn test_event_reaches_only_holding_replica() {
        let bus: Arc<dyn EventBus> = Arc::new(MemoryEventBus::new());
        let holder = Arc::new(WaitRegistry::new());
        let other = Arc::new(WaitRegistry::new());

        let a = notifier(bus.clone(), holder.clone(), "node-a");
        let b = notifier(bus.clone(), other.clone(), "node-b");
        assert_ne!(a.subscription_name(), b.subscription_name());

        let _sub_a = a.subscribe().await.unwrap();
        let _sub_b = b.subscribe().await.unwrap();

        let mut registration = holder.register("m1").unwrap();
        b.notify("m1").await;

        let woke = tokio::time::timeout(Duration::from_secs(1), registration.woken())
            .await
            .unwrap();
        assert_eq!(woke, Wake::Allocated);
        assert!(other.is_empty());
    }

    #[tokio::test]
    async fn test_subscription_names_unique_per_process() {
        let bus: Arc<dyn EventBus> = Arc::new(MemoryEventBus::new());
        let registry = Arc::new(WaitRegistry::new());
        let a = notifier(bus.clone(), registry.clone(), "node-a");
        let b = notifier(bus, registry, "node-a");
        assert_ne!(a.subscription_name(), b.subscription_name());
    }
}
