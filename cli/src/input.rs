//! Line protocol of the debugging driver.
//!
//! One JSON object per line on stdin, tagged by `op`:
//!
//! ```text
//! {"op":"request","id":1,"command":"quickinfo","arguments":{...}}
//! {"op":"request","id":2,"command":"geterr","arguments":{...},"async":true}
//! {"op":"request","id":3,"command":"completionInfo","resource":"/a.ts"}
//! {"op":"notify","command":"open","arguments":{...}}
//! {"op":"cancel","id":3}
//! {"op":"cancelResource","resource":"/a.ts"}
//! {"op":"diagnostics","files":["/a.ts"]}
//! {"op":"configurePlugin","name":"foo","configuration":{...}}
//! {"op":"status"} | {"op":"restart"} | {"op":"shutdown"}
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;

use tsbridge_client::ServerStatus;
use tsbridge_types::ServerResponse;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum Input {
    Request {
        #[serde(default)]
        id: Option<u64>,
        command: String,
        #[serde(default)]
        arguments: Option<Value>,
        #[serde(default, rename = "async")]
        is_async: bool,
        /// Join the cancellation group for this resource.
        #[serde(default)]
        resource: Option<String>,
        /// A failure takes the worker down.
        #[serde(default)]
        non_recoverable: bool,
    },
    Notify {
        command: String,
        #[serde(default)]
        arguments: Option<Value>,
    },
    Cancel {
        id: u64,
    },
    CancelResource {
        resource: String,
    },
    Diagnostics {
        files: Vec<String>,
    },
    ConfigurePlugin {
        name: String,
        configuration: Value,
    },
    Status,
    Restart,
    Shutdown,
}

impl Input {
    pub fn parse(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line)
    }
}

/// Driver output that is not a bridge event.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Output {
    Response {
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<u64>,
        command: String,
        outcome: &'static str,
        #[serde(skip_serializing_if = "Option::is_none")]
        body: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    Cancelled {
        resource: String,
        count: usize,
    },
    Status {
        status: ServerStatus,
        diagnostics: String,
    },
    Error {
        message: String,
    },
}

impl Output {
    pub fn response(id: Option<u64>, command: String, response: ServerResponse) -> Self {
        let outcome = response.label();
        let (body, message) = match response {
            ServerResponse::Success(success) => (success.body, None),
            ServerResponse::Failed(error) => (None, Some(error.message)),
            ServerResponse::Cancelled { reason } => (None, Some(reason)),
            ServerResponse::NoContent | ServerResponse::NoServer => (None, None),
        };
        Self::Response {
            id,
            command,
            outcome,
            body,
            message,
        }
    }
}
