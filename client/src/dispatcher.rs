//! Routing of worker push-events.

use std::sync::{Arc, Mutex, PoisonError};

use tsbridge_types::{DiagnosticEventBody, DiagnosticKind, WorkerEvent};

use crate::diagnostics::DiagnosticsCoordinator;
use crate::events::{BridgeEvent, EventSender, ProgressEvent, emit};
use crate::multiplexer::WorkerEventSink;

/// Project-load progress with at most one active handle.
pub(crate) struct LoadingIndicator {
    current: Mutex<Option<String>>,
    events: EventSender,
}

impl LoadingIndicator {
    pub fn new(events: EventSender) -> Self {
        Self {
            current: Mutex::new(None),
            events,
        }
    }

    /// End the active handle, if any.
    pub fn reset(&self) {
        let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(project) = current.take() {
            emit(&self.events, BridgeEvent::Progress(ProgressEvent::End { project }));
        }
    }

    pub fn started_loading_project(&self, project: &str) {
        let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = current.take() {
            emit(
                &self.events,
                BridgeEvent::Progress(ProgressEvent::End { project: previous }),
            );
        }
        emit(
            &self.events,
            BridgeEvent::Progress(ProgressEvent::Begin {
                project: project.to_string(),
            }),
        );
        *current = Some(project.to_string());
    }

    /// Ends the handle only if it belongs to `project`.
    pub fn finished_loading_project(&self, project: &str) {
        let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        if current.as_deref() == Some(project) {
            *current = None;
            emit(
                &self.events,
                BridgeEvent::Progress(ProgressEvent::End {
                    project: project.to_string(),
                }),
            );
        } else {
            tracing::trace!(project, active = ?*current, "ignoring load finish for inactive project");
        }
    }

    pub fn active_project(&self) -> Option<String> {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

pub(crate) struct EventDispatcher {
    loading: Arc<LoadingIndicator>,
    diagnostics: DiagnosticsCoordinator,
}

impl EventDispatcher {
    pub fn new(loading: Arc<LoadingIndicator>, diagnostics: DiagnosticsCoordinator) -> Self {
        Self {
            loading,
            diagnostics,
        }
    }

    pub fn dispatch(&self, event: WorkerEvent) {
        match event {
            WorkerEvent::SyntaxDiagnostics(body) => {
                self.on_file_diagnostics(DiagnosticKind::Syntax, body);
            }
            WorkerEvent::SemanticDiagnostics(body) => {
                self.on_file_diagnostics(DiagnosticKind::Semantic, body);
            }
            WorkerEvent::SuggestionDiagnostics(body) => {
                self.on_file_diagnostics(DiagnosticKind::Suggestion, body);
            }
            WorkerEvent::ConfigFileDiagnostics(body) => {
                self.loading.reset();
                self.diagnostics.on_config_file_diagnostics(body);
            }
            WorkerEvent::ProjectsUpdatedInBackground { open_files } => {
                tracing::debug!(files = open_files.len(), "projects updated in background");
                self.diagnostics.request_diagnostics(open_files);
            }
            WorkerEvent::ProjectLoadingStart { project } => {
                self.loading.started_loading_project(&project);
            }
            WorkerEvent::ProjectLoadingFinish { project } => {
                self.loading.finished_loading_project(&project);
            }
            WorkerEvent::Other { name, .. } => {
                tracing::trace!(event = %name, "unhandled worker event");
            }
        }
    }

    fn on_file_diagnostics(&self, kind: DiagnosticKind, body: DiagnosticEventBody) {
        // Diagnostics arriving means the project finished loading.
        self.loading.reset();
        self.diagnostics.on_diagnostics(kind, body);
    }
}

impl WorkerEventSink for EventDispatcher {
    fn on_event(&self, event: WorkerEvent) {
        self.dispatch(event);
    }
}
