//! Diagnostics pulls and the per-file diagnostics store.
//!
//! The worker only computes diagnostics when asked (`geterr`). The
//! coordinator keeps at most one pull in flight per document, coalesces
//! edits that arrive meanwhile into a single follow-up pull, and can be
//! paused so latency-sensitive requests are not queued behind a long
//! diagnostics pass.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures_util::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use tsbridge_types::{
    ConfigFileDiagnosticBody, DiagnosticCategory, DiagnosticEventBody, DiagnosticKind,
    ServerResponse, WorkerDiagnostic,
};

use crate::events::{BridgeEvent, EventSender, emit};

/// Issues one diagnostics pull for one file.
pub trait DiagnosticsPull: Send + Sync {
    fn pull(&self, file: String, token: CancellationToken) -> BoxFuture<'static, ServerResponse>;
}

/// Latest diagnostics per file, by kind.
struct DiagnosticsStore {
    data: HashMap<String, BTreeMap<DiagnosticKind, Vec<WorkerDiagnostic>>>,
}

impl DiagnosticsStore {
    fn new() -> Self {
        Self {
            data: HashMap::new(),
        }
    }

    /// Replace one kind for `file` and return the union of all kinds.
    fn update(
        &mut self,
        file: &str,
        kind: DiagnosticKind,
        items: Vec<WorkerDiagnostic>,
    ) -> Vec<WorkerDiagnostic> {
        let kinds = self.data.entry(file.to_string()).or_default();
        if items.is_empty() {
            kinds.remove(&kind);
        } else {
            kinds.insert(kind, items);
        }
        let union: Vec<WorkerDiagnostic> = kinds.values().flatten().cloned().collect();
        if kinds.is_empty() {
            self.data.remove(file);
        }
        union
    }

    fn remove(&mut self, file: &str) -> bool {
        self.data.remove(file).is_some()
    }

    fn drain_files(&mut self) -> Vec<String> {
        self.data.drain().map(|(file, _)| file).collect()
    }

    fn snapshot(&self) -> DiagnosticsSnapshot {
        let mut files: Vec<(String, Vec<WorkerDiagnostic>)> = self
            .data
            .iter()
            .map(|(file, kinds)| (file.clone(), kinds.values().flatten().cloned().collect()))
            .collect();

        // Sort: files with errors first, then alphabetically
        files.sort_by(|a, b| {
            let a_has_errors = a.1.iter().any(|d| d.category().is_error());
            let b_has_errors = b.1.iter().any(|d| d.category().is_error());
            b_has_errors.cmp(&a_has_errors).then_with(|| a.0.cmp(&b.0))
        });

        DiagnosticsSnapshot { files }
    }
}

/// Point-in-time view of all stored diagnostics.
#[derive(Debug, Clone, Default)]
pub struct DiagnosticsSnapshot {
    /// Per-file diagnostics, sorted with error-containing files first.
    files: Vec<(String, Vec<WorkerDiagnostic>)>,
}

impl DiagnosticsSnapshot {
    #[must_use]
    pub fn files(&self) -> &[(String, Vec<WorkerDiagnostic>)] {
        &self.files
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    fn count_by_category(&self, category: DiagnosticCategory) -> usize {
        self.files
            .iter()
            .flat_map(|(_, items)| items)
            .filter(|d| d.category() == category)
            .count()
    }

    #[must_use]
    pub fn error_count(&self) -> usize {
        self.count_by_category(DiagnosticCategory::Error)
    }

    #[must_use]
    pub fn warning_count(&self) -> usize {
        self.count_by_category(DiagnosticCategory::Warning)
    }

    #[must_use]
    pub fn total_count(&self) -> usize {
        self.files.iter().map(|(_, items)| items.len()).sum()
    }

    /// Format a compact status string like "E:3 W:5".
    #[must_use]
    pub fn status_string(&self) -> String {
        if self.is_empty() {
            return String::new();
        }
        format!("E:{} W:{}", self.error_count(), self.warning_count())
    }
}

struct InFlight {
    generation: u64,
    token: CancellationToken,
}

#[derive(Default)]
struct RequestRecord {
    last_requested_version: Option<i32>,
    latest_version: Option<i32>,
    dirty: bool,
    in_flight: Option<InFlight>,
}

#[derive(Default)]
struct PullState {
    records: HashMap<String, RequestRecord>,
    paused: usize,
    next_generation: u64,
}

/// A pull decided under the lock, started after it is released.
struct StartPull {
    file: String,
    generation: u64,
    token: CancellationToken,
}

impl PullState {
    fn start(&mut self, file: &str) -> Option<StartPull> {
        self.next_generation += 1;
        let generation = self.next_generation;
        let record = self.records.get_mut(file)?;
        let token = CancellationToken::new();
        record.dirty = false;
        record.last_requested_version = record.latest_version;
        record.in_flight = Some(InFlight {
            generation,
            token: token.clone(),
        });
        Some(StartPull {
            file: file.to_string(),
            generation,
            token,
        })
    }
}

struct Inner {
    state: Mutex<PullState>,
    store: Mutex<DiagnosticsStore>,
    puller: Arc<dyn DiagnosticsPull>,
    events: EventSender,
}

#[derive(Clone)]
pub struct DiagnosticsCoordinator {
    inner: Arc<Inner>,
}

impl DiagnosticsCoordinator {
    pub fn new(puller: Arc<dyn DiagnosticsPull>, events: EventSender) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(PullState::default()),
                store: Mutex::new(DiagnosticsStore::new()),
                puller,
                events,
            }),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, PullState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Pull diagnostics for each file, or mark it dirty if a pull is
    /// already running or pulls are paused.
    pub fn request_diagnostics<I, S>(&self, files: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut starts = Vec::new();
        {
            let mut state = self.lock_state();
            let paused = state.paused > 0;
            for file in files {
                let file = file.into();
                let record = state.records.entry(file.clone()).or_default();
                if paused || record.in_flight.is_some() {
                    record.dirty = true;
                    continue;
                }
                starts.extend(state.start(&file));
            }
        }
        self.spawn_pulls(starts);
    }

    pub fn on_document_changed(&self, file: &str, version: i32) {
        self.lock_state()
            .records
            .entry(file.to_string())
            .or_default()
            .latest_version = Some(version);
        self.request_diagnostics([file]);
    }

    /// Cancel any pull, forget the file and clear its diagnostics.
    pub fn on_document_closed(&self, file: &str) {
        if let Some(record) = self.lock_state().records.remove(file)
            && let Some(in_flight) = record.in_flight
        {
            in_flight.token.cancel();
        }
        let mut store = self.inner.store.lock().unwrap_or_else(PoisonError::into_inner);
        store.remove(file);
        emit(
            &self.inner.events,
            BridgeEvent::Diagnostics {
                file: file.to_string(),
                diagnostics: Vec::new(),
            },
        );
    }

    /// Run `f` with diagnostics pulls paused.
    ///
    /// In-flight pulls are cancelled and re-issued once the outermost
    /// interrupt finishes.
    pub async fn interrupt_get_err<F, Fut>(&self, f: F) -> Fut::Output
    where
        F: FnOnce() -> Fut,
        Fut: Future,
    {
        let _pause = self.pause();
        f().await
    }

    fn pause(&self) -> PauseGuard {
        let mut state = self.lock_state();
        state.paused += 1;
        if state.paused == 1 {
            for (file, record) in &mut state.records {
                if let Some(in_flight) = record.in_flight.take() {
                    tracing::trace!(file = %file, "interrupting diagnostics pull");
                    in_flight.token.cancel();
                    record.dirty = true;
                }
            }
        }
        PauseGuard {
            coordinator: self.clone(),
        }
    }

    fn resume(&self) {
        let mut starts = Vec::new();
        {
            let mut state = self.lock_state();
            state.paused = state.paused.saturating_sub(1);
            if state.paused > 0 {
                return;
            }
            let dirty: Vec<String> = state
                .records
                .iter()
                .filter(|(_, record)| record.dirty && record.in_flight.is_none())
                .map(|(file, _)| file.clone())
                .collect();
            for file in dirty {
                starts.extend(state.start(&file));
            }
        }
        self.spawn_pulls(starts);
    }

    fn spawn_pulls(&self, starts: Vec<StartPull>) {
        if starts.is_empty() {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!("no runtime, diagnostics pulls skipped");
            return;
        };
        for start in starts {
            let this = self.clone();
            let future = self.inner.puller.pull(start.file.clone(), start.token);
            tracing::trace!(file = %start.file, generation = start.generation, "diagnostics pull started");
            runtime.spawn(async move {
                let response = future.await;
                this.on_pull_finished(&start.file, start.generation, &response);
            });
        }
    }

    fn on_pull_finished(&self, file: &str, generation: u64, response: &ServerResponse) {
        let start = {
            let mut state = self.lock_state();
            let paused = state.paused > 0;
            let Some(record) = state.records.get_mut(file) else {
                return;
            };
            if record
                .in_flight
                .as_ref()
                .is_none_or(|in_flight| in_flight.generation != generation)
            {
                // Superseded by an interrupt or a close.
                return;
            }
            record.in_flight = None;
            tracing::trace!(file, outcome = response.label(), "diagnostics pull finished");
            if record.dirty && !paused {
                state.start(file)
            } else {
                None
            }
        };
        self.spawn_pulls(start.into_iter().collect());
    }

    pub(crate) fn on_diagnostics(&self, kind: DiagnosticKind, body: DiagnosticEventBody) {
        let mut store = self.inner.store.lock().unwrap_or_else(PoisonError::into_inner);
        let diagnostics = store.update(&body.file, kind, body.diagnostics);
        emit(
            &self.inner.events,
            BridgeEvent::Diagnostics {
                file: body.file,
                diagnostics,
            },
        );
    }

    pub(crate) fn on_config_file_diagnostics(&self, body: ConfigFileDiagnosticBody) {
        emit(
            &self.inner.events,
            BridgeEvent::ConfigFileDiagnostics {
                config_file: body.config_file,
                trigger_file: body.trigger_file,
                diagnostics: body.diagnostics,
            },
        );
    }

    /// The worker went away: abandon pulls and clear every published file.
    pub(crate) fn on_server_stopped(&self) {
        {
            let mut state = self.lock_state();
            for record in state.records.values_mut() {
                if let Some(in_flight) = record.in_flight.take() {
                    in_flight.token.cancel();
                }
                record.dirty = false;
            }
        }
        let mut store = self.inner.store.lock().unwrap_or_else(PoisonError::into_inner);
        for file in store.drain_files() {
            emit(
                &self.inner.events,
                BridgeEvent::Diagnostics {
                    file,
                    diagnostics: Vec::new(),
                },
            );
        }
    }

    #[must_use]
    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        self.inner
            .store
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .snapshot()
    }

    pub fn is_pending(&self, file: &str) -> bool {
        self.lock_state()
            .records
            .get(file)
            .is_some_and(|record| record.in_flight.is_some())
    }

    pub fn is_dirty(&self, file: &str) -> bool {
        self.lock_state()
            .records
            .get(file)
            .is_some_and(|record| record.dirty)
    }

    /// Version most recently covered by a pull for `file`.
    pub fn last_requested_version(&self, file: &str) -> Option<i32> {
        self.lock_state()
            .records
            .get(file)
            .and_then(|record| record.last_requested_version)
    }
}

struct PauseGuard {
    coordinator: DiagnosticsCoordinator,
}

impl Drop for PauseGuard {
    fn drop(&mut self) {
        self.coordinator.resume();
    }
}
