//! Worker message shapes and decoding of incoming frames.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use tsbridge_types::commands::NO_CONTENT_MESSAGE;
use tsbridge_types::{RequestSeq, ServerResponse, WorkerError, WorkerEvent, WorkerResponse};

pub(crate) const REQUEST_COMPLETED: &str = "requestCompleted";

#[derive(Debug, Serialize)]
pub(crate) struct Request<'a> {
    pub seq: RequestSeq,
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub command: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arguments: Option<serde_json::Value>,
}

impl<'a> Request<'a> {
    pub fn new(seq: RequestSeq, command: &'a str, arguments: Option<serde_json::Value>) -> Self {
        Self {
            seq,
            kind: "request",
            command,
            arguments,
        }
    }

    pub fn to_value(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::to_value(self)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct RawResponse {
    pub request_seq: RequestSeq,
    pub success: bool,
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub body: Option<serde_json::Value>,
}

impl RawResponse {
    pub fn into_server_response(self) -> ServerResponse {
        if self.success {
            return ServerResponse::Success(WorkerResponse {
                request_seq: self.request_seq,
                command: self.command,
                body: self.body,
            });
        }
        match self.message {
            Some(message) if message == NO_CONTENT_MESSAGE => ServerResponse::NoContent,
            Some(message) => ServerResponse::Failed(WorkerError::new(self.command, message)),
            None => ServerResponse::Failed(WorkerError::new(
                self.command,
                "worker reported failure without a message",
            )),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawEvent {
    event: String,
    #[serde(default)]
    body: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct RequestCompletedBody {
    request_seq: RequestSeq,
}

#[derive(Debug)]
pub(crate) enum IncomingFrame {
    Response(RawResponse),
    /// Terminal signal for an async request such as `geterr`.
    RequestCompleted { request_seq: RequestSeq },
    Event(WorkerEvent),
}

/// Well-formed JSON that is not a message the bridge understands.
#[derive(Debug, Error)]
pub(crate) enum ProtocolError {
    #[error("message has unknown type {0:?}")]
    UnknownType(Option<String>),
    #[error("malformed response (request_seq {request_seq:?}): {source}")]
    MalformedResponse {
        request_seq: Option<RequestSeq>,
        source: serde_json::Error,
    },
    #[error("malformed '{name}' event: {source}")]
    MalformedEvent {
        name: String,
        source: serde_json::Error,
    },
}

pub(crate) fn parse_incoming(frame: serde_json::Value) -> Result<IncomingFrame, ProtocolError> {
    let kind = frame
        .get("type")
        .and_then(serde_json::Value::as_str)
        .map(String::from);

    match kind.as_deref() {
        Some("response") => {
            let request_seq = frame
                .get("request_seq")
                .and_then(serde_json::Value::as_u64)
                .map(RequestSeq::new);
            serde_json::from_value(frame)
                .map(IncomingFrame::Response)
                .map_err(|source| ProtocolError::MalformedResponse {
                    request_seq,
                    source,
                })
        }
        Some("event") => {
            let raw: RawEvent =
                serde_json::from_value(frame).map_err(|source| ProtocolError::MalformedEvent {
                    name: String::new(),
                    source,
                })?;
            if raw.event == REQUEST_COMPLETED {
                let body: RequestCompletedBody =
                    serde_json::from_value(raw.body.unwrap_or_default()).map_err(|source| {
                        ProtocolError::MalformedEvent {
                            name: raw.event.clone(),
                            source,
                        }
                    })?;
                return Ok(IncomingFrame::RequestCompleted {
                    request_seq: body.request_seq,
                });
            }
            WorkerEvent::decode(&raw.event, raw.body)
                .map(IncomingFrame::Event)
                .map_err(|source| ProtocolError::MalformedEvent {
                    name: raw.event,
                    source,
                })
        }
        _ => Err(ProtocolError::UnknownType(kind)),
    }
}
