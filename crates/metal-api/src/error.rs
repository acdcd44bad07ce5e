//! Error Types
//!
//! One error enum per layer. Store conflicts are a dedicated variant so the
//! retry predicate never depends on message wording.

use thiserror::Error;

/// Errors returned by a [`MachineStore`](crate::store::MachineStore).
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("machine {0} not found")]
    NotFound(String),

    /// The record changed since it was read (optimistic update rejected).
    #[error("machine {id} was modified concurrently")]
    Conflict { id: String },

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("etcd error: {0}")]
    Etcd(#[from] etcd_client::Error),

    #[error("failed to (de)serialize machine record: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    /// True if this is the optimistic-concurrency conflict signature.
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }
}

/// Errors returned by an [`EventBus`](crate::bus::EventBus).
#[derive(Debug, Error)]
pub enum BusError {
    #[error("subscription {0} already exists on this bus")]
    DuplicateSubscription(String),

    #[error("etcd error: {0}")]
    Etcd(#[from] etcd_client::Error),

    #[error("failed to (de)serialize bus message: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors returned by the [`WaitRegistry`](crate::wait::WaitRegistry).
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    /// The signal was closed while a live stream still holds it.
    #[error("wait signal for machine {0} was closed under a live stream")]
    Closed(String),
}

/// Why a wait call was cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum CancelCause {
    /// The client went away or the caller cancelled the token.
    Disconnected,
    /// The caller-supplied deadline elapsed.
    DeadlineExceeded,
}

/// Terminal errors of a single wait call.
#[derive(Debug, Error)]
pub enum WaitError {
    #[error("machine {0} not found")]
    NotFound(String),

    #[error("wait cancelled: {0}")]
    Cancelled(CancelCause),

    #[error("stream send failed: {0}")]
    Transport(String),

    /// The record moved under us while marking it waiting; the client should reconnect.
    #[error("machine {0} changed while entering wait, reconnect")]
    Aborted(String),

    #[error("store error: {0}")]
    Store(StoreError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl WaitError {
    /// Stable code carried in the stream's final error message.
    pub fn code(&self) -> &'static str {
        match self {
            WaitError::NotFound(_) => "not_found",
            WaitError::Cancelled(_) => "cancelled",
            WaitError::Transport(_) | WaitError::Store(_) => "unavailable",
            WaitError::Aborted(_) => "aborted",
            WaitError::Internal(_) => "internal",
        }
    }
}

impl From<StoreError> for WaitError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => WaitError::NotFound(id),
            StoreError::Conflict { id } => WaitError::Aborted(id),
            other => WaitError::Store(other),
        }
    }
}

impl From<RegistryError> for WaitError {
    fn from(err: RegistryError) -> Self {
        WaitError::Internal(err.to_string())
    }
}

/// Errors returned by the machine lifecycle operations.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("machine {0} not found")]
    NotFound(String),

    #[error("machine {0} is already allocated")]
    AlreadyAllocated(String),

    #[error("machine {0} is not allocated")]
    NotAllocated(String),

    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for ServiceError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => ServiceError::NotFound(id),
            other => ServiceError::Store(other),
        }
    }
}
