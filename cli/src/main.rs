//! `tsbridge` - drive a tsserver-compatible worker by hand.
//!
//! Reads [`input::Input`] lines from stdin and writes responses, status
//! lines and [`tsbridge_client::BridgeEvent`]s to stdout as JSON lines.
//! Logs go to `~/.tsbridge/logs/tsbridge.log` so stdout stays parseable.
//!
//! ```text
//! stdin -> Input -> TsClient -> worker
//!                      |
//!                      v
//!          stdout <- Output | BridgeEvent
//! ```

mod input;

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Context, Result};
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use tsbridge_client::{BridgeConfig, EventReceiver, ExecuteOptions, TsClient, config_path};

use crate::input::{Input, Output};

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    let (log_file, init_warnings) = open_log_file();

    if let Some((log_path, file)) = log_file {
        tracing_subscriber::registry()
            .with(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
            .with(env_filter)
            .init();

        tracing::info!(path = %log_path.display(), "Logging initialized");
        for warning in init_warnings {
            tracing::warn!("{warning}");
        }
        return;
    }

    // No log file: stay silent rather than interleave logs with protocol
    // output on stdout.
    tracing_subscriber::registry().with(env_filter).init();
}

fn open_log_file() -> (Option<(PathBuf, fs::File)>, Vec<String>) {
    let mut warnings = Vec::new();

    for candidate in log_file_candidates() {
        if let Some(parent) = candidate.parent()
            && let Err(e) = fs::create_dir_all(parent)
        {
            warnings.push(format!(
                "Failed to create log dir {}: {e}",
                parent.display()
            ));
            continue;
        }

        match OpenOptions::new().create(true).append(true).open(&candidate) {
            Ok(file) => return (Some((candidate, file)), warnings),
            Err(e) => {
                warnings.push(format!(
                    "Failed to open log file {}: {e}",
                    candidate.display()
                ));
            }
        }
    }

    (None, warnings)
}

fn log_file_candidates() -> Vec<PathBuf> {
    let mut candidates = Vec::new();

    // Primary: ~/.tsbridge/logs/tsbridge.log
    if let Some(home) = dirs::home_dir() {
        candidates.push(home.join(".tsbridge").join("logs").join("tsbridge.log"));
    }

    // Fallback: ./.tsbridge/logs/tsbridge.log
    candidates.push(PathBuf::from(".tsbridge").join("logs").join("tsbridge.log"));

    candidates
}

fn load_config() -> Result<BridgeConfig> {
    match BridgeConfig::load() {
        Ok(Some(config)) => Ok(config),
        Ok(None) => {
            tracing::info!(path = ?config_path(), "no config file, using defaults");
            Ok(BridgeConfig::default())
        }
        Err(e) => Err(e).context("failed to load tsbridge config"),
    }
}

fn print_line<T: Serialize>(value: &T) {
    match serde_json::to_string(value) {
        Ok(line) => println!("{line}"),
        Err(e) => tracing::error!("failed to serialize output: {e}"),
    }
}

/// Tokens of requests started from stdin that may still be cancelled by id.
#[derive(Clone, Default)]
struct InFlight {
    tokens: Arc<Mutex<HashMap<u64, CancellationToken>>>,
}

impl InFlight {
    fn register(&self, id: u64) -> CancellationToken {
        let token = CancellationToken::new();
        self.tokens
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, token.clone());
        token
    }

    fn finish(&self, id: u64) {
        self.tokens
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
    }

    fn cancel(&self, id: u64) -> bool {
        let token = self
            .tokens
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
        match token {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }
}

async fn forward_events(mut events: EventReceiver) {
    while let Some(event) = events.recv().await {
        print_line(&event);
    }
}

fn spawn_request(client: &TsClient, in_flight: &InFlight, input: Input) {
    let Input::Request {
        id,
        command,
        arguments,
        is_async,
        resource,
        non_recoverable,
    } = input
    else {
        return;
    };

    let client = client.clone();
    let in_flight = in_flight.clone();
    let token = id.map(|id| in_flight.register(id));
    let options = ExecuteOptions {
        cancel_on_resource_change: resource,
        non_recoverable,
    };

    tokio::spawn(async move {
        let response = if is_async {
            let token = token.unwrap_or_default();
            client.execute_async(&command, arguments, token).await
        } else {
            client.execute(&command, arguments, token, options).await
        };
        if let Some(id) = id {
            in_flight.finish(id);
        }
        print_line(&Output::response(id, command, response));
    });
}

/// Returns `false` when the driver should stop reading input.
async fn handle(client: &TsClient, in_flight: &InFlight, input: Input) -> bool {
    match input {
        request @ Input::Request { .. } => spawn_request(client, in_flight, request),
        Input::Notify { command, arguments } => client.notify(&command, arguments).await,
        Input::Cancel { id } => {
            if !in_flight.cancel(id) {
                tracing::debug!(id, "cancel for unknown or finished request");
            }
        }
        Input::CancelResource { resource } => {
            let count = client.cancel_inflight_requests_for_resource(&resource);
            print_line(&Output::Cancelled { resource, count });
        }
        Input::Diagnostics { files } => client.request_diagnostics(files),
        Input::ConfigurePlugin {
            name,
            configuration,
        } => client.configure_plugin(&name, configuration).await,
        Input::Status => print_line(&Output::Status {
            status: client.state(),
            diagnostics: client.diagnostics().snapshot().status_string(),
        }),
        Input::Restart => {
            if !client.restart().await {
                print_line(&Output::Error {
                    message: "worker failed to restart".to_string(),
                });
            }
        }
        Input::Shutdown => return false,
    }
    true
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = load_config()?;
    let (client, events) = TsClient::new(config);
    tokio::spawn(forward_events(events));

    client.try_start().await.context("failed to start worker")?;

    let in_flight = InFlight::default();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context("failed to read stdin")? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match Input::parse(line) {
            Ok(input) => {
                if !handle(&client, &in_flight, input).await {
                    break;
                }
            }
            Err(e) => print_line(&Output::Error {
                message: format!("invalid input: {e}"),
            }),
        }
    }

    client.shutdown().await;
    Ok(())
}
