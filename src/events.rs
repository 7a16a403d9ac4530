//! Typed stream events and the per-request emitter
//!
//! One request maps to one ordered event stream: any number of progress and
//! delta events, exactly one final event, then the termination marker. The
//! emitter enforces the final-exactly-once guarantee; the HTTP layer appends
//! the marker when the stream closes.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

use crate::models::TradingProposal;

/// Literal line terminating every event stream, success or failure.
pub const DONE_MARKER: &str = "[DONE]";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Start,
    End,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// A named pipeline step opened or closed (per specialist / per stage).
    Progress { step: String, phase: Phase },
    /// Incremental fragment of the answer under composition.
    Delta { fragment: String },
    /// The single terminal event. `proposal` and `error` serialize as
    /// explicit nulls when absent.
    Final {
        message: String,
        context: serde_json::Value,
        proposal: Option<TradingProposal>,
        error: Option<String>,
    },
}

impl StreamEvent {
    pub fn is_final(&self) -> bool {
        matches!(self, StreamEvent::Final { .. })
    }
}

/// Clonable handle through which every pipeline stage reports. Progress and
/// delta events are dropped silently once the final event has gone out or
/// the listener has disconnected; neither condition may fail the pipeline.
#[derive(Clone)]
pub struct EventEmitter {
    tx: mpsc::Sender<StreamEvent>,
    final_sent: Arc<AtomicBool>,
}

impl EventEmitter {
    pub fn new(tx: mpsc::Sender<StreamEvent>) -> Self {
        Self {
            tx,
            final_sent: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Channel + emitter pair, mostly for tests and the demo binary.
    pub fn channel(buffer: usize) -> (Self, mpsc::Receiver<StreamEvent>) {
        let (tx, rx) = mpsc::channel(buffer);
        (Self::new(tx), rx)
    }

    pub async fn progress_start(&self, step: &str) {
        self.send(StreamEvent::Progress {
            step: step.to_string(),
            phase: Phase::Start,
        })
        .await;
    }

    pub async fn progress_end(&self, step: &str) {
        self.send(StreamEvent::Progress {
            step: step.to_string(),
            phase: Phase::End,
        })
        .await;
    }

    pub async fn delta(&self, fragment: impl Into<String>) {
        self.send(StreamEvent::Delta {
            fragment: fragment.into(),
        })
        .await;
    }

    /// Emit the terminal event. Returns false when a final was already
    /// sent; the duplicate is suppressed, never forwarded.
    pub async fn finalize(
        &self,
        message: impl Into<String>,
        context: serde_json::Value,
        proposal: Option<TradingProposal>,
        error: Option<String>,
    ) -> bool {
        if self.final_sent.swap(true, Ordering::SeqCst) {
            debug!("suppressing duplicate final event");
            return false;
        }
        let event = StreamEvent::Final {
            message: message.into(),
            context,
            proposal,
            error,
        };
        if self.tx.send(event).await.is_err() {
            debug!("listener disconnected before final event");
        }
        true
    }

    /// Terminal error shorthand used by every failure path.
    pub async fn finalize_error(&self, message: impl Into<String>, error: impl Into<String>) -> bool {
        self.finalize(message, serde_json::Value::Null, None, Some(error.into()))
            .await
    }

    pub fn final_sent(&self) -> bool {
        self.final_sent.load(Ordering::SeqCst)
    }

    async fn send(&self, event: StreamEvent) {
        if self.final_sent.load(Ordering::SeqCst) {
            debug!("dropping event after final");
            return;
        }
        if self.tx.send(event).await.is_err() {
            debug!("listener disconnected, dropping event");
        }
    }
}
