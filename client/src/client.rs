//! Session facade: owns the worker state machine and exposes the request
//! surface to callers.

use std::collections::BTreeMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use tsbridge_types::commands::{CONFIGURE_PLUGIN, EXIT, GETERR, UPDATE_OPEN};
use tsbridge_types::{ApiVersion, InstanceId, ServerResponse};

use crate::config::{BridgeConfig, Capabilities};
use crate::diagnostics::{DiagnosticsCoordinator, DiagnosticsPull};
use crate::dispatcher::{EventDispatcher, LoadingIndicator};
use crate::events::{BridgeEvent, EventReceiver, EventSender, ServerStatus, emit};
use crate::multiplexer::{ExecuteOptions, RequestMultiplexer, WorkerEventSink};
use crate::supervisor::{self, SpawnError, SupervisorEvent, WorkerHandle};

/// Grace period between the `exit` notification and a forced kill.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

struct RunningState {
    instance: InstanceId,
    multiplexer: Arc<RequestMultiplexer>,
    handle: WorkerHandle,
    api_version: ApiVersion,
    capabilities: Capabilities,
    log_file: Option<PathBuf>,
    /// `updateOpen` requests in flight against this instance.
    update_open: Arc<AtomicUsize>,
}

enum ServerState {
    None,
    Running(RunningState),
    Errored {
        cause: String,
        log_file: Option<PathBuf>,
    },
}

impl ServerState {
    fn status(&self) -> ServerStatus {
        match self {
            ServerState::None => ServerStatus::Stopped,
            ServerState::Running(running) => ServerStatus::Running {
                instance: running.instance,
                api_version: running.api_version,
            },
            ServerState::Errored { cause, log_file } => ServerStatus::Errored {
                cause: cause.clone(),
                log_file: log_file.clone(),
            },
        }
    }
}

struct ClientInner {
    config: BridgeConfig,
    state: Mutex<ServerState>,
    next_instance: AtomicU64,
    events: EventSender,
    loading: Arc<LoadingIndicator>,
    diagnostics: DiagnosticsCoordinator,
    plugins: Mutex<BTreeMap<String, serde_json::Value>>,
}

impl ClientInner {
    fn lock_state(&self) -> MutexGuard<'_, ServerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn multiplexer(&self) -> Option<Arc<RequestMultiplexer>> {
        match &*self.lock_state() {
            ServerState::Running(running) => Some(Arc::clone(&running.multiplexer)),
            _ => None,
        }
    }

    fn is_current(&self, instance: InstanceId) -> bool {
        matches!(&*self.lock_state(), ServerState::Running(running) if running.instance == instance)
    }

    /// Replace the state unconditionally.
    fn transition(&self, next: ServerState) {
        let (previous, status) = {
            let mut state = self.lock_state();
            let status = next.status();
            (std::mem::replace(&mut *state, next), status)
        };
        self.finish_transition(previous, status);
    }

    /// Replace the state only if `instance` is still the running one.
    fn transition_from(
        &self,
        instance: InstanceId,
        next: impl FnOnce(&RunningState) -> ServerState,
    ) -> bool {
        let (previous, status) = {
            let mut state = self.lock_state();
            let next = match &*state {
                ServerState::Running(running) if running.instance == instance => next(running),
                _ => return false,
            };
            let status = next.status();
            (std::mem::replace(&mut *state, next), status)
        };
        self.finish_transition(previous, status);
        true
    }

    /// Settle a shutdown of `instance`. A fatal error raised while the worker
    /// was going away still ends stopped; a newer instance is left alone.
    fn stop_after_shutdown(&self, instance: InstanceId) {
        let previous = {
            let mut state = self.lock_state();
            match &*state {
                ServerState::Running(running) if running.instance != instance => {
                    tracing::debug!(
                        %instance,
                        current = %running.instance,
                        "newer worker running, shutdown settled"
                    );
                    return;
                }
                ServerState::None => return,
                ServerState::Running(_) | ServerState::Errored { .. } => {
                    std::mem::replace(&mut *state, ServerState::None)
                }
            }
        };
        self.finish_transition(previous, ServerStatus::Stopped);
    }

    /// Everything a state change implies for the instance being left.
    fn finish_transition(&self, previous: ServerState, status: ServerStatus) {
        if let ServerState::Running(running) = previous {
            running.multiplexer.close();
            running.handle.kill();
            self.loading.reset();
            self.diagnostics.on_server_stopped();
        }
        tracing::info!(status = ?status, "worker state changed");
        emit(&self.events, BridgeEvent::StateChanged(status));
    }

    fn on_supervisor_event(&self, event: SupervisorEvent) {
        match event {
            SupervisorEvent::StdErr { instance, line } => {
                tracing::debug!(%instance, "worker stderr: {line}");
            }
            SupervisorEvent::Exited {
                instance,
                code,
                signal,
            } => {
                if self.transition_from(instance, |_| ServerState::None) {
                    tracing::warn!(%instance, ?code, ?signal, "worker exited");
                } else {
                    tracing::debug!(%instance, "exit of inactive worker instance");
                }
            }
            SupervisorEvent::Fatal {
                instance,
                command,
                error,
            } => {
                let cause = match &command {
                    Some(command) => format!("{command}: {error}"),
                    None => error.clone(),
                };
                let moved = self.transition_from(instance, |running| ServerState::Errored {
                    cause,
                    log_file: running.log_file.clone(),
                });
                if moved {
                    tracing::error!(%instance, command = ?command, "fatal worker error: {error}");
                }
            }
        }
    }

    async fn send_plugin_configuration(
        multiplexer: &RequestMultiplexer,
        api_version: ApiVersion,
        name: &str,
        configuration: &serde_json::Value,
    ) {
        if !api_version.gte(ApiVersion::V314) {
            tracing::debug!(plugin = name, %api_version, "worker too old for configurePlugin");
            return;
        }
        multiplexer
            .notify(
                CONFIGURE_PLUGIN,
                Some(json!({ "pluginName": name, "configuration": configuration })),
            )
            .await;
    }
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        if let ServerState::Running(running) = &*self.lock_state() {
            running.multiplexer.close();
            running.handle.kill();
        }
    }
}

/// Diagnostics pulls go through the running worker as async `geterr`.
struct GetErrPuller {
    client: Weak<ClientInner>,
}

impl DiagnosticsPull for GetErrPuller {
    fn pull(&self, file: String, token: CancellationToken) -> BoxFuture<'static, ServerResponse> {
        let client = self.client.clone();
        async move {
            let Some(multiplexer) = client.upgrade().and_then(|inner| inner.multiplexer()) else {
                return ServerResponse::NoServer;
            };
            multiplexer
                .execute_async(GETERR, Some(json!({ "files": [file], "delay": 0 })), token)
                .await
        }
        .boxed()
    }
}

/// Decrements the `updateOpen` counter even if the caller stops waiting.
/// Only the instance that issued the request may end its loading state.
struct UpdateOpenGuard<'a> {
    inner: &'a ClientInner,
    instance: InstanceId,
    in_flight: Arc<AtomicUsize>,
}

impl<'a> UpdateOpenGuard<'a> {
    fn new(inner: &'a ClientInner, instance: InstanceId, in_flight: Arc<AtomicUsize>) -> Self {
        in_flight.fetch_add(1, Ordering::SeqCst);
        Self {
            inner,
            instance,
            in_flight,
        }
    }
}

impl Drop for UpdateOpenGuard<'_> {
    fn drop(&mut self) {
        let previous = self
            .in_flight
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if previous == Ok(1) && self.inner.is_current(self.instance) {
            self.inner.loading.reset();
        }
    }
}

/// Handle to one logical worker session. Cheap to clone.
#[derive(Clone)]
pub struct TsClient {
    inner: Arc<ClientInner>,
}

impl TsClient {
    /// Create a stopped client and the stream of events it will publish.
    pub fn new(config: BridgeConfig) -> (Self, EventReceiver) {
        let (events, rx) = mpsc::unbounded_channel();
        let inner = Arc::new_cyclic(|weak: &Weak<ClientInner>| {
            let puller = Arc::new(GetErrPuller {
                client: weak.clone(),
            });
            ClientInner {
                config,
                state: Mutex::new(ServerState::None),
                next_instance: AtomicU64::new(1),
                loading: Arc::new(LoadingIndicator::new(events.clone())),
                diagnostics: DiagnosticsCoordinator::new(puller, events.clone()),
                events,
                plugins: Mutex::new(BTreeMap::new()),
            }
        });
        (Self { inner }, rx)
    }

    /// Start the worker. `false` if it could not be spawned; the reason is
    /// logged. See [`TsClient::try_start`] for the error itself.
    pub async fn start(&self) -> bool {
        match self.try_start().await {
            Ok(()) => true,
            Err(e) => {
                tracing::error!("failed to start worker: {e}");
                false
            }
        }
    }

    pub async fn try_start(&self) -> Result<(), SpawnError> {
        if let ServerState::Running(running) = &*self.inner.lock_state() {
            tracing::debug!(instance = %running.instance, "worker already running");
            return Ok(());
        }

        let instance = InstanceId::new(self.inner.next_instance.fetch_add(1, Ordering::Relaxed));
        let (lifecycle_tx, lifecycle_rx) = mpsc::unbounded_channel();
        let worker = supervisor::spawn(&self.inner.config, instance, lifecycle_tx.clone())?;

        let api_version = self.inner.config.worker.api_version().unwrap_or_else(|e| {
            tracing::warn!("{e}; assuming {}", ApiVersion::LATEST);
            ApiVersion::LATEST
        });
        let capabilities = self.inner.config.worker.server_mode.capabilities();

        let sink: Arc<dyn WorkerEventSink> = Arc::new(EventDispatcher::new(
            Arc::clone(&self.inner.loading),
            self.inner.diagnostics.clone(),
        ));
        let multiplexer = Arc::new(RequestMultiplexer::new(
            worker.stdout,
            worker.stdin,
            instance,
            worker.canceller,
            sink,
            lifecycle_tx,
        ));

        self.inner.transition(ServerState::Running(RunningState {
            instance,
            multiplexer: Arc::clone(&multiplexer),
            handle: worker.handle,
            api_version,
            capabilities,
            log_file: worker.log_file,
            update_open: Arc::new(AtomicUsize::new(0)),
        }));

        // Events queued before the transition are seen against the new state.
        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(watch_lifecycle(weak, lifecycle_rx));

        let plugins = self
            .inner
            .plugins
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for (name, configuration) in &plugins {
            ClientInner::send_plugin_configuration(&multiplexer, api_version, name, configuration)
                .await;
        }
        Ok(())
    }

    /// Send a request and wait for its outcome.
    pub async fn execute(
        &self,
        command: &str,
        arguments: Option<serde_json::Value>,
        token: Option<CancellationToken>,
        options: ExecuteOptions,
    ) -> ServerResponse {
        let running = match &*self.inner.lock_state() {
            ServerState::Running(running) => Some((
                Arc::clone(&running.multiplexer),
                running.instance,
                Arc::clone(&running.update_open),
            )),
            _ => None,
        };
        let Some((multiplexer, instance, update_open)) = running else {
            return ServerResponse::NoServer;
        };

        let _update_open = (command == UPDATE_OPEN)
            .then(|| UpdateOpenGuard::new(&self.inner, instance, update_open));

        multiplexer.execute(command, arguments, token, &options).await
    }

    /// Send an async worker command (`geterr`...). Always cancellable.
    pub async fn execute_async(
        &self,
        command: &str,
        arguments: Option<serde_json::Value>,
        token: CancellationToken,
    ) -> ServerResponse {
        match self.inner.multiplexer() {
            Some(multiplexer) => multiplexer.execute_async(command, arguments, token).await,
            None => ServerResponse::NoServer,
        }
    }

    pub async fn notify(&self, command: &str, arguments: Option<serde_json::Value>) {
        match self.inner.multiplexer() {
            Some(multiplexer) => multiplexer.notify(command, arguments).await,
            None => tracing::warn!(command, "no worker running, notification dropped"),
        }
    }

    /// Remember a plugin configuration and send it to the running worker.
    /// Remembered configurations are replayed on every start.
    pub async fn configure_plugin(&self, name: &str, configuration: serde_json::Value) {
        self.inner
            .plugins
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string(), configuration.clone());

        let running = match &*self.inner.lock_state() {
            ServerState::Running(running) => {
                Some((Arc::clone(&running.multiplexer), running.api_version))
            }
            _ => None,
        };
        if let Some((multiplexer, api_version)) = running {
            ClientInner::send_plugin_configuration(&multiplexer, api_version, name, &configuration)
                .await;
        }
    }

    pub fn cancel_inflight_requests_for_resource(&self, resource: &str) -> usize {
        self.inner
            .multiplexer()
            .map_or(0, |multiplexer| multiplexer.cancel_inflight_requests_for_resource(resource))
    }

    /// Run `f` with background diagnostics pulls paused.
    pub async fn interrupt_get_err<F, Fut>(&self, f: F) -> Fut::Output
    where
        F: FnOnce() -> Fut,
        Fut: Future,
    {
        self.inner.diagnostics.interrupt_get_err(f).await
    }

    pub fn request_diagnostics<I, S>(&self, files: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.inner.diagnostics.request_diagnostics(files);
    }

    pub fn diagnostics(&self) -> &DiagnosticsCoordinator {
        &self.inner.diagnostics
    }

    /// Stop the worker: `exit`, a short grace period, then kill. Callable
    /// from any state; always ends stopped.
    pub async fn shutdown(&self) {
        let running = match &*self.inner.lock_state() {
            ServerState::None => return,
            ServerState::Running(running) => Some((
                running.instance,
                Arc::clone(&running.multiplexer),
                running.handle.clone(),
            )),
            ServerState::Errored { .. } => None,
        };

        match running {
            Some((instance, multiplexer, handle)) => {
                tracing::info!(%instance, "shutting down worker");
                if !handle.has_exited() {
                    multiplexer.notify(EXIT, None).await;
                    if !handle.wait_for_exit(SHUTDOWN_TIMEOUT).await {
                        tracing::warn!(%instance, "worker ignored exit, killing");
                    }
                }
                self.inner.stop_after_shutdown(instance);
            }
            None => self.inner.transition(ServerState::None),
        }
    }

    pub async fn restart(&self) -> bool {
        self.shutdown().await;
        self.start().await
    }

    pub fn state(&self) -> ServerStatus {
        self.inner.lock_state().status()
    }

    pub fn is_running(&self) -> bool {
        matches!(&*self.inner.lock_state(), ServerState::Running(_))
    }

    pub fn api_version(&self) -> Option<ApiVersion> {
        match &*self.inner.lock_state() {
            ServerState::Running(running) => Some(running.api_version),
            _ => None,
        }
    }

    pub fn capabilities(&self) -> Option<Capabilities> {
        match &*self.inner.lock_state() {
            ServerState::Running(running) => Some(running.capabilities),
            _ => None,
        }
    }

    pub fn pid(&self) -> Option<u32> {
        match &*self.inner.lock_state() {
            ServerState::Running(running) => running.handle.pid(),
            _ => None,
        }
    }

    /// Requests sent to the running worker and not yet resolved.
    pub fn pending_requests(&self) -> usize {
        self.inner
            .multiplexer()
            .map_or(0, |multiplexer| multiplexer.pending_count())
    }

    /// Project whose load is currently reported as in progress.
    pub fn loading_project(&self) -> Option<String> {
        self.inner.loading.active_project()
    }

    /// Responses dropped because nobody was waiting for them any more.
    pub fn late_responses(&self) -> u64 {
        self.inner
            .multiplexer()
            .map_or(0, |multiplexer| multiplexer.late_responses())
    }
}

async fn watch_lifecycle(
    client: Weak<ClientInner>,
    mut events: mpsc::UnboundedReceiver<SupervisorEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(inner) = client.upgrade() else {
            tracing::trace!(instance = %event.instance(), "client dropped, ignoring supervisor event");
            break;
        };
        inner.on_supervisor_event(event);
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::config::WorkerConfig;

    fn unstartable() -> BridgeConfig {
        BridgeConfig {
            worker: WorkerConfig {
                tsserver_path: PathBuf::from("tsbridge-no-such-worker-binary"),
                ..WorkerConfig::default()
            },
            ..BridgeConfig::default()
        }
    }

    #[tokio::test]
    async fn test_new_client_is_stopped() {
        let (client, _rx) = TsClient::new(BridgeConfig::default());
        assert_eq!(client.state(), ServerStatus::Stopped);
        assert!(!client.is_running());
        assert!(client.api_version().is_none());
        assert!(client.capabilities().is_none());
    }

    #[tokio::test]
    async fn test_calls_without_worker_return_no_server() {
        let (client, _rx) = TsClient::new(BridgeConfig::default());
        assert_eq!(
            client
                .execute("quickinfo", None, None, ExecuteOptions::default())
                .await,
            ServerResponse::NoServer
        );
        assert_eq!(
            client
                .execute_async("geterr", None, CancellationToken::new())
                .await,
            ServerResponse::NoServer
        );
        assert_eq!(client.cancel_inflight_requests_for_resource("/a.ts"), 0);
        client.notify("open", None).await;
    }

    #[tokio::test]
    async fn test_failed_start_leaves_state_untouched() {
        let (client, mut rx) = TsClient::new(unstartable());
        assert!(!client.start().await);
        assert!(matches!(
            client.try_start().await,
            Err(SpawnError::NotFound { .. })
        ));
        assert_eq!(client.state(), ServerStatus::Stopped);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_shutdown_when_stopped_is_a_no_op() {
        let (client, mut rx) = TsClient::new(BridgeConfig::default());
        client.shutdown().await;
        client.shutdown().await;
        assert_eq!(client.state(), ServerStatus::Stopped);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_plugin_configuration_is_remembered_while_stopped() {
        let (client, _rx) = TsClient::new(BridgeConfig::default());
        client
            .configure_plugin("styled", json!({ "tags": ["css"] }))
            .await;
        let plugins = client.inner.plugins.lock().unwrap().clone();
        assert_eq!(plugins.get("styled"), Some(&json!({ "tags": ["css"] })));
    }

    #[tokio::test]
    async fn test_update_open_of_stale_instance_keeps_loading_state() {
        let (client, _rx) = TsClient::new(BridgeConfig::default());
        let stale = Arc::new(AtomicUsize::new(0));
        let guard = UpdateOpenGuard::new(&client.inner, InstanceId::new(1), Arc::clone(&stale));
        assert_eq!(stale.load(Ordering::SeqCst), 1);

        client.inner.loading.started_loading_project("/p/tsconfig.json");
        drop(guard);

        assert_eq!(stale.load(Ordering::SeqCst), 0);
        assert_eq!(client.loading_project().as_deref(), Some("/p/tsconfig.json"));
    }

    #[tokio::test]
    async fn test_diagnostics_pull_without_worker_is_no_server() {
        let (client, _rx) = TsClient::new(BridgeConfig::default());
        let puller = GetErrPuller {
            client: Arc::downgrade(&client.inner),
        };
        assert_eq!(
            puller
                .pull("/a.ts".to_string(), CancellationToken::new())
                .await,
            ServerResponse::NoServer
        );
    }
}
