//! Diagnostics as reported by the worker.

use serde::{Deserialize, Serialize};

/// Category of a worker diagnostic.
///
/// Unknown categories decode as [`DiagnosticCategory::Message`], the
/// least severe level, so a newer worker never breaks diagnostic delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiagnosticCategory {
    Error,
    Warning,
    Suggestion,
    #[serde(other)]
    Message,
}

impl DiagnosticCategory {
    /// Parse the worker's category string.
    ///
    /// Returns `None` for values the protocol does not define.
    #[must_use]
    pub fn from_wire(value: &str) -> Option<Self> {
        match value {
            "error" => Some(Self::Error),
            "warning" => Some(Self::Warning),
            "suggestion" => Some(Self::Suggestion),
            "message" => Some(Self::Message),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_error(self) -> bool {
        self == Self::Error
    }

    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warning => "warning",
            Self::Suggestion => "suggestion",
            Self::Message => "message",
        }
    }
}

/// Which diagnostics pass produced a set of diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiagnosticKind {
    Syntax,
    Semantic,
    Suggestion,
}

impl DiagnosticKind {
    pub const ALL: [Self; 3] = [Self::Syntax, Self::Semantic, Self::Suggestion];

    /// Event name the worker uses for this kind.
    #[must_use]
    pub fn event_name(self) -> &'static str {
        match self {
            Self::Syntax => "syntaxDiag",
            Self::Semantic => "semanticDiag",
            Self::Suggestion => "suggestionDiag",
        }
    }
}

/// 1-based line/offset position, as used on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Location {
    pub line: u32,
    pub offset: u32,
}

/// A single diagnostic from the worker.
///
/// Fields the bridge does not interpret (related information, deprecation
/// markers...) are kept in `extra` and serialized back unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerDiagnostic {
    start: Location,
    end: Location,
    text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    code: Option<u32>,
    category: DiagnosticCategory,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    source: Option<String>,
    #[serde(flatten)]
    extra: serde_json::Map<String, serde_json::Value>,
}

impl WorkerDiagnostic {
    #[must_use]
    pub fn new(
        category: DiagnosticCategory,
        text: impl Into<String>,
        start: Location,
        end: Location,
        code: Option<u32>,
    ) -> Self {
        Self {
            start,
            end,
            text: text.into(),
            code,
            category,
            source: None,
            extra: serde_json::Map::new(),
        }
    }

    #[must_use]
    pub fn category(&self) -> DiagnosticCategory {
        self.category
    }

    #[must_use]
    pub fn text(&self) -> &str {
        &self.text
    }

    #[must_use]
    pub fn start(&self) -> Location {
        self.start
    }

    #[must_use]
    pub fn end(&self) -> Location {
        self.end
    }

    #[must_use]
    pub fn code(&self) -> Option<u32> {
        self.code
    }

    #[must_use]
    pub fn source(&self) -> Option<&str> {
        self.source.as_deref()
    }

    /// Uninterpreted wire fields.
    #[must_use]
    pub fn extra(&self) -> &serde_json::Map<String, serde_json::Value> {
        &self.extra
    }

    /// Format as `file:line:offset: category: [TScode] text`.
    #[must_use]
    pub fn display_with_file(&self, file: &str) -> String {
        let code = self.code.map(|c| format!("[TS{c}] ")).unwrap_or_default();
        format!(
            "{file}:{}:{}: {}: {code}{}",
            self.start.line,
            self.start.offset,
            self.category.label(),
            self.text,
        )
    }
}
