//! Frames pushed to the client during a session.

use crate::error::{ArenaError, ProviderErrorKind};
use crate::models::{FailedModel, ModelDescriptor, ModelId, RankedResult, Usage};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::trace;

/// Frames buffered between a session and its transport
pub const DEFAULT_EVENT_BUFFER: usize = 64;

/// Data of the frame that closes every event stream
pub const STREAM_TERMINATOR: &str = "[DONE]";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SessionEvent {
    Start {
        models: Vec<ModelDescriptor>,
    },
    ModelStart {
        model: ModelId,
    },
    #[serde(rename_all = "camelCase")]
    TextDelta {
        model: ModelId,
        text_delta: String,
    },
    #[serde(rename_all = "camelCase")]
    ModelComplete {
        model: ModelId,
        latency_ms: u64,
        usage: Usage,
        cost: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        is_mock: Option<bool>,
        /// Set when live text already sent for this model was replaced
        #[serde(default, skip_serializing_if = "Option::is_none")]
        details: Option<String>,
    },
    Error {
        model: ModelId,
        error: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        kind: Option<ProviderErrorKind>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        details: Option<String>,
    },
    JudgeStart {},
    #[serde(rename_all = "camelCase")]
    JudgeDelta {
        text_delta: String,
    },
    #[serde(rename_all = "camelCase")]
    FinalResults {
        evaluations: Vec<RankedResult>,
        total_cost: f64,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        failures: Vec<FailedModel>,
    },
    JudgeError {
        error: String,
    },
    /// Any frame type this build does not know
    #[serde(other)]
    Unknown,
}

impl SessionEvent {
    /// The discriminator written to the wire
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Start { .. } => "start",
            Self::ModelStart { .. } => "model-start",
            Self::TextDelta { .. } => "text-delta",
            Self::ModelComplete { .. } => "model-complete",
            Self::Error { .. } => "error",
            Self::JudgeStart {} => "judge-start",
            Self::JudgeDelta { .. } => "judge-delta",
            Self::FinalResults { .. } => "final-results",
            Self::JudgeError { .. } => "judge-error",
            Self::Unknown => "unknown",
        }
    }
}

/// Sending half of a session's event stream.
///
/// A failed send means the client went away; callers propagate
/// [`ArenaError::Disconnected`] and abandon the session.
#[derive(Debug, Clone)]
pub struct EventEmitter {
    tx: mpsc::Sender<SessionEvent>,
}

impl EventEmitter {
    pub fn channel(buffer: usize) -> (Self, mpsc::Receiver<SessionEvent>) {
        let (tx, rx) = mpsc::channel(buffer);
        (Self { tx }, rx)
    }

    pub async fn emit(&self, event: SessionEvent) -> Result<(), ArenaError> {
        trace!(kind = event.kind(), "emit");
        self.tx
            .send(event)
            .await
            .map_err(|_| ArenaError::Disconnected)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
