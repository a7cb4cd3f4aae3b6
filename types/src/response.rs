//! Request outcomes as seen by callers of the bridge.

use crate::ids::RequestSeq;

/// A successful worker response.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerResponse {
    pub request_seq: RequestSeq,
    pub command: String,
    pub body: Option<serde_json::Value>,
}

/// A worker-reported failure (`success: false`) or a response the bridge
/// could not make sense of.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{command} failed: {message}")]
pub struct WorkerError {
    pub command: String,
    pub message: String,
}

impl WorkerError {
    pub fn new(command: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            message: message.into(),
        }
    }
}

/// Outcome of `execute` / `execute_async`.
///
/// A tagged result rather than an error: cancellation and "no server" are
/// ordinary outcomes in the common path.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerResponse {
    Success(WorkerResponse),
    Failed(WorkerError),
    /// The worker answered but had nothing to say.
    NoContent,
    Cancelled { reason: String },
    /// No worker was running, or it went away before answering.
    NoServer,
}

impl ServerResponse {
    pub fn cancelled(reason: impl Into<String>) -> Self {
        Self::Cancelled {
            reason: reason.into(),
        }
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    #[must_use]
    pub fn body(&self) -> Option<&serde_json::Value> {
        match self {
            Self::Success(response) => response.body.as_ref(),
            _ => None,
        }
    }

    /// Short label for logs.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Success(_) => "success",
            Self::Failed(_) => "failed",
            Self::NoContent => "no-content",
            Self::Cancelled { .. } => "cancelled",
            Self::NoServer => "no-server",
        }
    }
}
