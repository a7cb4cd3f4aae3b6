//! Bridge to a tsserver-compatible analysis worker.
//!
//! [`TsClient`] spawns the worker, multiplexes requests over its stdio,
//! cancels abandoned work out of band, and turns pushed events into
//! diagnostics and progress notifications on an [`EventReceiver`].

pub mod codec;

mod cache;
mod cancellation;
mod client;
mod config;
mod diagnostics;
mod dispatcher;
mod events;
mod multiplexer;
mod protocol;
mod supervisor;

pub use cache::CachedResponse;
pub use cancellation::{NoopCanceller, PipeCanceller, RequestCanceller};
pub use client::TsClient;
pub use codec::CodecError;
pub use config::{
    BridgeConfig, CONFIG_ENV_VAR, Capabilities, ConfigError, LogVerbosity, PluginConfig,
    ServerMode, WorkerConfig, WorkerLogConfig, config_path,
};
pub use diagnostics::{DiagnosticsCoordinator, DiagnosticsPull, DiagnosticsSnapshot};
pub use events::{BridgeEvent, EventReceiver, EventSender, ProgressEvent, ServerStatus};
pub use multiplexer::ExecuteOptions;
pub use supervisor::SpawnError;
