//! Wait Registry
//!
//! Process-local map from machine id to the wake signal of the wait
//! streams blocked on this replica. Streams hold the signal through a
//! [`Registration`]; the notifier only looks it up.
//!
//! A stream that reconnects while its previous stream is still being torn
//! down joins the live signal instead of replacing it, so one allocation
//! wakes both.

use crate::error::RegistryError;
use crate::observability::metrics;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::trace;

/// What a waiter observes on its wake signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wake {
    Pending,
    /// Re-check the store. The signal stays armed.
    Recheck,
    Allocated,
    Closed,
}

impl Wake {
    fn is_final(self) -> bool {
        matches!(self, Wake::Allocated | Wake::Closed)
    }
}

/// Wake signal shared by every stream registered for one machine id.
/// Fires `Allocated` at most once.
#[derive(Debug)]
pub struct WakeSignal {
    generation: u64,
    state: watch::Sender<Wake>,
    holders: AtomicUsize,
}

impl WakeSignal {
    fn new(generation: u64) -> Self {
        let (state, _) = watch::channel(Wake::Pending);
        Self {
            generation,
            state,
            holders: AtomicUsize::new(0),
        }
    }

    /// Fire the signal. `false` only asks waiters to re-check the store.
    /// Returns false if the signal was already allocated or closed, or no
    /// stream holds it any more.
    pub fn fire(&self, allocated: bool) -> bool {
        let next = if allocated { Wake::Allocated } else { Wake::Recheck };
        let fired = self.state.send_if_modified(|state| {
            if state.is_final() {
                return false;
            }
            *state = next;
            true
        });
        fired && self.holders() > 0
    }

    /// Close without allocating. Idempotent.
    pub fn close(&self) {
        self.state.send_if_modified(|state| {
            if state.is_final() {
                return false;
            }
            *state = Wake::Closed;
            true
        });
    }

    /// True once the signal can no longer deliver a wake-up.
    pub fn is_closed(&self) -> bool {
        self.state.borrow().is_final()
    }

    /// Number of live registrations holding this signal.
    pub fn holders(&self) -> usize {
        self.holders.load(Ordering::Acquire)
    }

    fn acquire(&self) -> watch::Receiver<Wake> {
        self.holders.fetch_add(1, Ordering::AcqRel);
        let mut receiver = self.state.subscribe();
        if *receiver.borrow() != Wake::Pending {
            receiver.mark_changed();
        }
        receiver
    }
}

#[derive(Debug, Default)]
pub struct WaitRegistry {
    entries: DashMap<String, Arc<WakeSignal>>,
    next_generation: AtomicU64,
}

impl WaitRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a wait stream for `machine_id`.
    ///
    /// Creates a fresh signal when no stream holds one. A stream arriving
    /// while another still holds a usable signal joins it. An entry whose
    /// signal was closed under a live holder cannot be used and fails with
    /// `RegistryError::Closed`.
    pub fn register(self: &Arc<Self>, machine_id: &str) -> Result<Registration, RegistryError> {
        // Holder counts only change under the entry's shard lock, so an
        // abandoned entry cannot be joined and removed at the same time.
        let (signal, receiver) = match self.entries.entry(machine_id.to_string()) {
            Entry::Occupied(mut entry) => {
                let existing = entry.get().clone();
                if existing.holders() == 0 {
                    let signal = self.fresh_signal();
                    let receiver = signal.acquire();
                    entry.insert(signal.clone());
                    (signal, receiver)
                } else if *existing.state.borrow() == Wake::Closed {
                    return Err(RegistryError::Closed(machine_id.to_string()));
                } else {
                    let receiver = existing.acquire();
                    (existing, receiver)
                }
            }
            Entry::Vacant(entry) => {
                let signal = self.fresh_signal();
                let receiver = signal.acquire();
                entry.insert(signal.clone());
                (signal, receiver)
            }
        };

        metrics::record_wait_stream_opened();
        trace!(
            machine_id = %machine_id,
            generation = signal.generation,
            holders = signal.holders(),
            "Registered wake signal"
        );

        Ok(Registration {
            registry: self.clone(),
            machine_id: machine_id.to_string(),
            signal,
            receiver,
        })
    }

    pub fn lookup(&self, machine_id: &str) -> Option<Arc<WakeSignal>> {
        self.entries.get(machine_id).map(|entry| entry.value().clone())
    }

    /// Drop the entry for `machine_id` and close its signal. Idempotent.
    pub fn remove(&self, machine_id: &str) {
        if let Some((_, signal)) = self.entries.remove(machine_id) {
            signal.close();
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn fresh_signal(&self) -> Arc<WakeSignal> {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        Arc::new(WakeSignal::new(generation))
    }

    /// Remove the entry only if it is still `generation` and nobody joined
    /// it in the meantime.
    fn release(&self, machine_id: &str, generation: u64) -> bool {
        self.entries
            .remove_if(machine_id, |_, signal| {
                signal.generation == generation && signal.holders() == 0
            })
            .is_some()
    }
}

/// One stream's hold on a wake signal. Dropping the last holder removes
/// the registry entry and closes the signal, whichever way the stream ends.
#[derive(Debug)]
pub struct Registration {
    registry: Arc<WaitRegistry>,
    machine_id: String,
    signal: Arc<WakeSignal>,
    receiver: watch::Receiver<Wake>,
}

impl Registration {
    pub fn machine_id(&self) -> &str {
        &self.machine_id
    }

    /// Resolve on the next wake-up. Never returns `Wake::Pending`.
    /// Cancel safe.
    pub async fn woken(&mut self) -> Wake {
        loop {
            if self.receiver.changed().await.is_err() {
                return Wake::Closed;
            }
            let wake = *self.receiver.borrow_and_update();
            if wake != Wake::Pending {
                return wake;
            }
        }
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        if self.signal.holders.fetch_sub(1, Ordering::AcqRel) == 1 {
            let removed = self
                .registry
                .release(&self.machine_id, self.signal.generation);
            // Not removed means the entry was replaced or removed already, or
            // a reconnecting stream joined it; only the latter keeps it open.
            if removed || self.signal.holders() == 0 {
                self.signal.close();
            }
        }
        metrics::record_wait_stream_closed();
        trace!(machine_id = %self.machine_id, "Released wake signal");
    }
}
