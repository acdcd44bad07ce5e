//! Wait Endpoint
//!
//! GET /v1/machines/{id}/wait streams server-sent events until the machine
//! is allocated: `keepalive` on every response interval, then exactly one
//! `allocated` or `error` event. The coordinator runs in its own task; the
//! response stream holds a drop guard, so a client disconnect cancels it.

use super::machines::validate_machine_id;
use super::state::AppState;
use crate::error::WaitError;
use crate::wait::{KeepaliveSink, WaitOutcome, WAIT_PROTOCOL_VERSION};
use async_trait::async_trait;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::sse::{Event, Sse},
};
use futures::Stream;
use serde::Deserialize;
use serde_json::json;
use std::convert::Infallible;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::{wrappers::ReceiverStream, StreamExt};

/// Events buffered between the coordinator task and the response body
const STREAM_BUFFER: usize = 8;

/// A keep-alive that cannot be queued within this time counts as a dead peer
const KEEPALIVE_SEND_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Default, Deserialize)]
pub struct WaitParams {
    /// Wait protocol version the client speaks
    pub protocol: Option<u32>,
    /// Caller deadline for the whole stream
    pub timeout_secs: Option<u64>,
}

impl WaitParams {
    fn deadline(&self) -> Option<Duration> {
        self.timeout_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }
}

/// Feeds keep-alives into the response stream.
struct ChannelSink {
    tx: mpsc::Sender<Event>,
}

#[async_trait]
impl KeepaliveSink for ChannelSink {
    async fn send_keepalive(&mut self) -> Result<(), WaitError> {
        self.tx
            .send_timeout(keepalive_event(), KEEPALIVE_SEND_TIMEOUT)
            .await
            .map_err(|e| WaitError::Transport(e.to_string()))
    }
}

fn keepalive_event() -> Event {
    Event::default().event("keepalive").data("{}")
}

fn final_event(machine_id: &str, result: &Result<WaitOutcome, WaitError>) -> Event {
    match result {
        Ok(outcome) => Event::default().event("allocated").data(
            json!({
                "machine_id": machine_id,
                "outcome": outcome.to_string(),
            })
            .to_string(),
        ),
        Err(e) => Event::default().event("error").data(
            json!({
                "code": e.code(),
                "message": e.to_string(),
            })
            .to_string(),
        ),
    }
}

/// GET /v1/machines/{id}/wait
#[tracing::instrument(skip(state))]
pub async fn wait_for_allocation(
    State(state): State<AppState>,
    Path(machine_id): Path<String>,
    Query(params): Query<WaitParams>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, (StatusCode, String)> {
    validate_machine_id(&machine_id)?;

    if let Some(protocol) = params.protocol {
        if protocol != WAIT_PROTOCOL_VERSION {
            return Err((
                StatusCode::NOT_IMPLEMENTED,
                format!(
                    "wait protocol v{protocol} is not supported, this server speaks v{WAIT_PROTOCOL_VERSION}"
                ),
            ));
        }
    }

    let (tx, rx) = mpsc::channel(STREAM_BUFFER);
    let cancel = state.shutdown.child_token();
    let guard = cancel.clone().drop_guard();
    let deadline = params.deadline();
    let coordinator = state.coordinator.clone();

    tokio::spawn(async move {
        let mut sink = ChannelSink { tx: tx.clone() };
        let result = coordinator
            .wait(&machine_id, deadline, &mut sink, &cancel)
            .await;
        // The receiver is gone if the client disconnected.
        let _ = tx.send(final_event(&machine_id, &result)).await;
    });

    let stream = ReceiverStream::new(rx).map(move |event| {
        let _cancel_on_drop = &guard;
        Ok::<_, Infallible>(event)
    });

    Ok(Sse::new(stream))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CancelCause;

    #[test]
    fn test_deadline_ignores_zero() {
        let params = WaitParams {
            protocol: None,
            timeout_secs: Some(0),
        };
        assert_eq!(params.deadline(), None);

        let params = WaitParams {
            protocol: None,
            timeout_secs: Some(30),
        };
        assert_eq!(params.deadline(), Some(Duration::from_secs(30)));
    }

    #[tokio::test]
    async fn test_channel_sink_fails_when_receiver_dropped() {
        let (tx, rx) = mpsc::channel(1);
        let mut sink = ChannelSink { tx };
        assert!(sink.send_keepalive().await.is_ok());
        drop(rx);
        assert!(matches!(
            sink.send_keepalive().await,
            Err(WaitError::Transport(_))
        ));
    }

    #[test]
    fn test_final_event_carries_error_code() {
        let result = Err(WaitError::Cancelled(CancelCause::DeadlineExceeded));
        let rendered = format!("{:?}", final_event("m1", &result));
        assert!(rendered.contains("cancelled"));
    }
}
