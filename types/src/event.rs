//! Asynchronous events pushed by the worker.
//!
//! Events arrive as `{"type":"event","event":<name>,"body":{...}}`. They are
//! decoded exactly once, at the protocol boundary, into [`WorkerEvent`];
//! everything downstream matches on the enum.

use serde::{Deserialize, Serialize};

use crate::diagnostic::WorkerDiagnostic;

/// Body of `syntaxDiag` / `semanticDiag` / `suggestionDiag`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagnosticEventBody {
    pub file: String,
    #[serde(default)]
    pub diagnostics: Vec<WorkerDiagnostic>,
}

/// Body of `configFileDiag`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigFileDiagnosticBody {
    pub trigger_file: String,
    pub config_file: String,
    #[serde(default)]
    pub diagnostics: Vec<WorkerDiagnostic>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProjectLoadingBody {
    project_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProjectsUpdatedBody {
    #[serde(default)]
    open_files: Vec<String>,
}

/// A decoded worker event.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerEvent {
    SyntaxDiagnostics(DiagnosticEventBody),
    SemanticDiagnostics(DiagnosticEventBody),
    SuggestionDiagnostics(DiagnosticEventBody),
    ConfigFileDiagnostics(ConfigFileDiagnosticBody),
    ProjectLoadingStart { project: String },
    ProjectLoadingFinish { project: String },
    ProjectsUpdatedInBackground { open_files: Vec<String> },
    /// An event the bridge does not interpret (telemetry, typings
    /// installer notices, ...).
    Other {
        name: String,
        body: Option<serde_json::Value>,
    },
}

impl WorkerEvent {
    pub const SYNTAX_DIAG: &'static str = "syntaxDiag";
    pub const SEMANTIC_DIAG: &'static str = "semanticDiag";
    pub const SUGGESTION_DIAG: &'static str = "suggestionDiag";
    pub const CONFIG_FILE_DIAG: &'static str = "configFileDiag";
    pub const PROJECT_LOADING_START: &'static str = "projectLoadingStart";
    pub const PROJECT_LOADING_FINISH: &'static str = "projectLoadingFinish";
    pub const PROJECTS_UPDATED_IN_BACKGROUND: &'static str = "projectsUpdatedInBackground";

    /// Decode an event from its wire name and body.
    ///
    /// Unknown names become [`WorkerEvent::Other`]. A known name with a body
    /// that does not match its schema is an error; the caller decides
    /// whether to log and drop it.
    pub fn decode(
        name: &str,
        body: Option<serde_json::Value>,
    ) -> Result<Self, serde_json::Error> {
        fn parse<T: serde::de::DeserializeOwned>(
            body: Option<serde_json::Value>,
        ) -> Result<T, serde_json::Error> {
            serde_json::from_value(body.unwrap_or(serde_json::Value::Null))
        }

        let event = match name {
            Self::SYNTAX_DIAG => Self::SyntaxDiagnostics(parse(body)?),
            Self::SEMANTIC_DIAG => Self::SemanticDiagnostics(parse(body)?),
            Self::SUGGESTION_DIAG => Self::SuggestionDiagnostics(parse(body)?),
            Self::CONFIG_FILE_DIAG => Self::ConfigFileDiagnostics(parse(body)?),
            Self::PROJECT_LOADING_START => {
                let body: ProjectLoadingBody = parse(body)?;
                Self::ProjectLoadingStart {
                    project: body.project_name,
                }
            }
            Self::PROJECT_LOADING_FINISH => {
                let body: ProjectLoadingBody = parse(body)?;
                Self::ProjectLoadingFinish {
                    project: body.project_name,
                }
            }
            Self::PROJECTS_UPDATED_IN_BACKGROUND => {
                let body: ProjectsUpdatedBody = parse(body)?;
                Self::ProjectsUpdatedInBackground {
                    open_files: body.open_files,
                }
            }
            other => Self::Other {
                name: other.to_string(),
                body,
            },
        };
        Ok(event)
    }
}
