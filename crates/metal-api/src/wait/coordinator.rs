//! Wait Coordinator
//!
//! Drives one long-poll wait stream:
//! INIT -> MARK_WAITING -> REGISTERED -> BLOCKED <-> POLL_CHECK -> DONE.
//!
//! While blocked the stream reacts to whichever comes first: cancellation,
//! the wake signal, or the response-interval tick. A stream that reconnects
//! before its previous one is torn down shares that stream's signal. Every tick sends a
//! keep-alive, and once the check interval has passed the tick re-reads the
//! record first, so a lost bus event delays the wake-up but never loses it.

use super::{Registration, WaitRegistry, Wake};
use crate::config::WaitConfig;
use crate::error::{CancelCause, StoreError, WaitError};
use crate::observability::{events, metrics};
use crate::retry::ConflictRetrier;
use crate::store::MachineStore;
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Outlet for keep-alive messages on an open wait stream.
#[async_trait]
pub trait KeepaliveSink: Send {
    /// Fails with `WaitError::Transport` once the peer is gone.
    async fn send_keepalive(&mut self) -> Result<(), WaitError>;
}

/// Successful end of a wait call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum WaitOutcome {
    /// The machine was allocated before the call started; nothing was registered.
    AlreadyAllocated,
    Allocated,
}

pub struct WaitCoordinator {
    store: Arc<dyn MachineStore>,
    registry: Arc<WaitRegistry>,
    retrier: ConflictRetrier,
    config: WaitConfig,
    node_id: String,
}

impl WaitCoordinator {
    pub fn new(
        store: Arc<dyn MachineStore>,
        registry: Arc<WaitRegistry>,
        retrier: ConflictRetrier,
        config: WaitConfig,
        node_id: impl Into<String>,
    ) -> Self {
        Self {
            store,
            registry,
            retrier,
            config,
            node_id: node_id.into(),
        }
    }

    pub fn registry(&self) -> &Arc<WaitRegistry> {
        &self.registry
    }

    /// Block until `machine_id` is allocated.
    ///
    /// Ends with `Cancelled(Disconnected)` when `cancel` fires and with
    /// `Cancelled(DeadlineExceeded)` once `deadline` elapses. The registry
    /// entry is released on every exit path.
    pub async fn wait<S>(
        &self,
        machine_id: &str,
        deadline: Option<Duration>,
        sink: &mut S,
        cancel: &CancellationToken,
    ) -> Result<WaitOutcome, WaitError>
    where
        S: KeepaliveSink + ?Sized,
    {
        events::wait_started(machine_id, &self.node_id);

        let run = self.run(machine_id, sink, cancel);
        let result = match deadline {
            Some(deadline) => tokio::time::timeout(deadline, run)
                .await
                .unwrap_or(Err(WaitError::Cancelled(CancelCause::DeadlineExceeded))),
            None => run.await,
        };

        match &result {
            Ok(outcome) => {
                let outcome = outcome.to_string();
                events::wait_finished(machine_id, &outcome, None);
                metrics::record_wait_finished(&outcome);
            }
            Err(WaitError::Cancelled(cause)) => {
                events::wait_finished(machine_id, "cancelled", Some(cause.to_string().as_str()));
                metrics::record_wait_finished("cancelled");
            }
            Err(e) => {
                events::wait_finished(machine_id, "error", Some(e.to_string().as_str()));
                metrics::record_wait_finished("error");
            }
        }

        result
    }

    async fn run<S>(
        &self,
        machine_id: &str,
        sink: &mut S,
        cancel: &CancellationToken,
    ) -> Result<WaitOutcome, WaitError>
    where
        S: KeepaliveSink + ?Sized,
    {
        let current = self.store.find_by_id(machine_id).await?;
        if current.value.is_allocated() {
            return Ok(WaitOutcome::AlreadyAllocated);
        }

        // Single attempt: a conflict here means the record moved (possibly an
        // allocation landed), so the client reconnects and starts over.
        let mut marked = current.value.clone();
        marked.waiting = true;
        marked.changed_at = Utc::now();
        self.store.update(&current, &marked).await?;

        let mut registration = self.registry.register(machine_id)?;
        let outcome = self
            .block(machine_id, &mut registration, sink, cancel)
            .await;
        drop(registration);

        // The flag is only cleared on success; after a cancel or an error it
        // keeps its last written value until the next wait.
        if outcome.is_ok() {
            self.clear_waiting(machine_id).await;
        }
        outcome
    }

    async fn block<S>(
        &self,
        machine_id: &str,
        registration: &mut Registration,
        sink: &mut S,
        cancel: &CancellationToken,
    ) -> Result<WaitOutcome, WaitError>
    where
        S: KeepaliveSink + ?Sized,
    {
        let response_interval = self.config.response_interval;
        let mut ticker =
            tokio::time::interval_at(Instant::now() + response_interval, response_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut last_check = Instant::now();
        let mut signal_done = false;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(WaitError::Cancelled(CancelCause::Disconnected));
                }
                wake = registration.woken(), if !signal_done => {
                    match wake {
                        Wake::Allocated => return Ok(WaitOutcome::Allocated),
                        Wake::Closed => {
                            signal_done = true;
                            debug!(machine_id = %machine_id, "Wake signal closed, polling only");
                        }
                        Wake::Recheck | Wake::Pending => {
                            debug!(machine_id = %machine_id, "Wake signal without allocation, re-checking");
                        }
                    }
                    last_check = Instant::now();
                    if self.is_allocated(machine_id).await? {
                        return Ok(WaitOutcome::Allocated);
                    }
                }
                _ = ticker.tick() => {
                    if last_check.elapsed() >= self.config.check_interval {
                        last_check = Instant::now();
                        if self.is_allocated(machine_id).await? {
                            debug!(machine_id = %machine_id, "Allocation found by store poll");
                            return Ok(WaitOutcome::Allocated);
                        }
                    }
                    sink.send_keepalive().await?;
                }
            }
        }
    }

    async fn is_allocated(&self, machine_id: &str) -> Result<bool, WaitError> {
        let current = self.store.find_by_id(machine_id).await?;
        Ok(current.value.is_allocated())
    }

    /// Best-effort reset of the waiting flag; failures are only logged.
    async fn clear_waiting(&self, machine_id: &str) {
        let store = &self.store;
        let result = self
            .retrier
            .run("clear_waiting", move || async move {
                let current = store.find_by_id(machine_id).await?;
                if !current.value.waiting {
                    return Ok::<_, StoreError>(());
                }
                let mut next = current.value.clone();
                next.waiting = false;
                next.changed_at = Utc::now();
                store.update(&current, &next).await.map(|_| ())
            })
            .await;

        if let Err(e) = result {
            warn!(machine_id = %machine_id, error = %e, "Failed to clear waiting flag");
        }
    }
}
