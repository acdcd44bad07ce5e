//! Etcd-backed event bus
//!
//! Each message is a key under `/metal/bus/{topic}/` attached to a lease
//! of `message_ttl` seconds, so undelivered messages expire on their own.
//! Every subscription runs its own prefix watch; all watchers see every put,
//! which is what gives each replica its own copy of every message.

use super::{
    Dispatcher, Envelope, EventBus, MessageHandler, Subscription, SubscriptionNames,
    SubscriptionOptions,
};
use crate::config::BusConfig;
use crate::error::BusError;
use async_trait::async_trait;
use etcd_client::{Client, EventType, PutOptions, WatchOptions};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// Prefix for bus topics in etcd
pub const BUS_PREFIX: &str = "/metal/bus/";

pub struct EtcdEventBus {
    client: Client,
    names: SubscriptionNames,
    lease_ttl: i64,
    reconnect_delay: Duration,
}

impl EtcdEventBus {
    pub fn new(client: Client, config: &BusConfig) -> Self {
        Self {
            client,
            names: SubscriptionNames::default(),
            lease_ttl: lease_ttl_secs(config.message_ttl),
            reconnect_delay: config.reconnect_delay,
        }
    }

    fn topic_prefix(topic: &str) -> String {
        format!("{BUS_PREFIX}{topic}/")
    }
}

/// Lease TTL in whole seconds, at least one.
fn lease_ttl_secs(ttl: Duration) -> i64 {
    ttl.as_secs().max(1) as i64
}

#[async_trait]
impl EventBus for EtcdEventBus {
    async fn publish(&self, topic: &str, payload: serde_json::Value) -> Result<(), BusError> {
        let envelope = Envelope::new(topic, payload);
        let key = format!("{}{}", Self::topic_prefix(topic), envelope.id);
        let value = serde_json::to_vec(&envelope)?;

        let mut client = self.client.clone();
        let lease = client.lease_grant(self.lease_ttl, None).await?;
        let options = PutOptions::new().with_lease(lease.id());
        client.put(key, value, Some(options)).await?;

        trace!(topic = %topic, message_id = %envelope.id, "Published bus message");
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
        let prefix = Self::topic_prefix(topic);
        let mut client = self.client.clone();

        // Establish the first watch before returning so nothing published
        // after subscribe() returns can be missed.
        let first = client
            .watch(prefix.clone(), Some(WatchOptions::new().with_prefix()))
            .await?;

        // The message lease enforces the TTL.
        let dispatcher = Dispatcher::new(name, handler, options).backend_expiry();
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let subscription = name.to_string();
        let reconnect_delay = self.reconnect_delay;

        info!(subscription = %subscription, prefix = %prefix, "Started watching bus topic");

        let task = tokio::spawn(async move {
            let _claim = claim;
            let mut watch = Some(first);
            let mut last_revision: i64 = 0;

            'reconnect: loop {
                let (mut watcher, mut stream) = match watch.take() {
                    Some(pair) => pair,
                    None => {
                        let mut options = WatchOptions::new().with_prefix();
                        if last_revision > 0 {
                            options = options.with_start_revision(last_revision + 1);
                        }
                        match client.watch(prefix.clone(), Some(options)).await {
                            Ok(pair) => pair,
                            Err(e) => {
                                warn!(subscription = %subscription, error = %e, "Failed to re-establish bus watch");
                                tokio::select! {
                                    _ = token.cancelled() => break 'reconnect,
                                    _ = tokio::time::sleep(reconnect_delay) => continue 'reconnect,
                                }
                            }
                        }
                    }
                };

                loop {
                    tokio::select! {
                        _ = token.cancelled() => {
                            let _ = watcher.cancel().await;
                            break 'reconnect;
                        }
                        msg = stream.message() => match msg {
                            Ok(Some(resp)) => {
                                for event in resp.events() {
                                    if !matches!(event.event_type(), EventType::Put) {
                                        continue;
                                    }
                                    let Some(kv) = event.kv() else { continue };
                                    last_revision = last_revision.max(kv.mod_revision());
                                    match serde_json::from_slice::<Envelope>(kv.value()) {
                                        Ok(envelope) => dispatcher.dispatch(envelope).await,
                                        Err(e) => warn!(
                                            subscription = %subscription,
                                            error = %e,
                                            "Invalid bus message"
                                        ),
                                    }
                                }
                            }
                            Ok(None) => {
                                warn!(subscription = %subscription, "Bus watch stream ended, reconnecting");
                                break;
                            }
                            Err(e) => {
                                error!(subscription = %subscription, error = %e, "Bus watch error, reconnecting");
                                break;
                            }
                        }
                    }
                }

                let _ = watcher.cancel().await;

                tokio::select! {
                    _ = token.cancelled() => break 'reconnect,
                    _ = tokio::time::sleep(reconnect_delay) => {}
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

    #[test]
    fn test_topic_prefix() {
        assert_eq!(
            EtcdEventBus::topic_prefix("machine.allocation"),
            "/metal/bus/machine.allocation/"
        );
    }

    #[test]
    fn test_lease_ttl_rounds_up_to_one_second() {
        assert_eq!(lease_ttl_secs(Duration::from_millis(200)), 1);
        assert_eq!(lease_ttl_secs(Duration::from_secs(30)), 30);
    }
}
