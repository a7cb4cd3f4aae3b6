//! Events the bridge pushes to its embedding layer.

use std::path::PathBuf;

use serde::Serialize;
use tokio::sync::mpsc;

use tsbridge_types::{ApiVersion, InstanceId, WorkerDiagnostic};

/// Project-load progress, at most one `Begin` outstanding at a time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum ProgressEvent {
    Begin { project: String },
    End { project: String },
}

/// Externally visible summary of the facade's state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum ServerStatus {
    Stopped,
    Running {
        instance: InstanceId,
        #[serde(serialize_with = "serialize_display")]
        api_version: ApiVersion,
    },
    Errored {
        cause: String,
        log_file: Option<PathBuf>,
    },
}

fn serialize_display<S: serde::Serializer>(
    value: &ApiVersion,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.collect_str(value)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum BridgeEvent {
    /// Union of the latest syntax, semantic and suggestion diagnostics for a
    /// file. An empty list clears the file.
    Diagnostics {
        file: String,
        diagnostics: Vec<WorkerDiagnostic>,
    },
    ConfigFileDiagnostics {
        config_file: String,
        trigger_file: String,
        diagnostics: Vec<WorkerDiagnostic>,
    },
    Progress(ProgressEvent),
    StateChanged(ServerStatus),
}

pub type EventSender = mpsc::UnboundedSender<BridgeEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<BridgeEvent>;

/// Send, ignoring a dropped receiver. The embedding layer may stop
/// listening at any time.
pub(crate) fn emit(tx: &EventSender, event: BridgeEvent) {
    if tx.send(event).is_err() {
        tracing::trace!("bridge event receiver dropped");
    }
}
