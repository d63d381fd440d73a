use std::fmt;

use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Severity {
    Info,
    Success,
    Warning,
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Severity::Info => "info",
            Severity::Success => "success",
            Severity::Warning => "warning",
            Severity::Error => "error",
        })
    }
}

/// User-facing status line. Separate from logging, but every notice is
/// also logged at the matching level when published.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusNotice {
    pub text: String,
    pub severity: Severity,
}

impl StatusNotice {
    pub fn new(text: impl Into<String>, severity: Severity) -> Self {
        Self {
            text: text.into(),
            severity,
        }
    }

    pub fn info(text: impl Into<String>) -> Self {
        Self::new(text, Severity::Info)
    }

    pub fn success(text: impl Into<String>) -> Self {
        Self::new(text, Severity::Success)
    }

    pub fn warning(text: impl Into<String>) -> Self {
        Self::new(text, Severity::Warning)
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self::new(text, Severity::Error)
    }

    pub(crate) fn log(&self) {
        match self.severity {
            Severity::Info | Severity::Success => info!(notice = %self.text, "status notice"),
            Severity::Warning => warn!(notice = %self.text, "status notice"),
            Severity::Error => error!(notice = %self.text, "status notice"),
        }
    }
}

impl fmt::Display for StatusNotice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.severity, self.text)
    }
}
