//! Worker command names the bridge itself needs to know about.
//!
//! Feature-level commands (completion, code fixes, navigation...) are passed
//! through as plain strings by callers; only the commands with bridge-side
//! semantics get a constant here.

pub const OPEN: &str = "open";
pub const CLOSE: &str = "close";
pub const CHANGE: &str = "change";
pub const UPDATE_OPEN: &str = "updateOpen";
pub const QUICKINFO: &str = "quickinfo";
pub const GETERR: &str = "geterr";
pub const CONFIGURE: &str = "configure";
pub const CONFIGURE_PLUGIN: &str = "configurePlugin";
pub const EXIT: &str = "exit";

/// Message the worker uses for an empty-but-successful answer.
pub const NO_CONTENT_MESSAGE: &str = "No content available.";
