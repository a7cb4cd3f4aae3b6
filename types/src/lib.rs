//! Wire and domain types for tsbridge.
//!
//! This crate contains pure types with no IO and no async: the worker's
//! events and diagnostics, request outcomes, sequence/instance ids and API
//! versions. Both the bridge core and its callers depend on it.

pub mod commands;

mod diagnostic;
mod event;
mod ids;
mod response;
mod version;

pub use diagnostic::{DiagnosticCategory, DiagnosticKind, Location, WorkerDiagnostic};
pub use event::{ConfigFileDiagnosticBody, DiagnosticEventBody, WorkerEvent};
pub use ids::{InstanceId, RequestSeq};
pub use response::{ServerResponse, WorkerError, WorkerResponse};
pub use version::{ApiVersion, ApiVersionError};
