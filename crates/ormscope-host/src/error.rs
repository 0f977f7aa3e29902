use thiserror::Error;

/// Failure raised by a data-access entry point.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CursorError {
    #[error("{0}")]
    Database(String),
    #[error("cursor is detached")]
    Detached,
}

impl From<rusqlite::Error> for CursorError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Database(value.to_string())
    }
}

/// A failure inside evaluated script code.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct ScriptError {
    /// Line of the innermost frame when the failure happened, if known.
    pub line: Option<usize>,
    pub message: String,
}

impl ScriptError {
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            line: None,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn at(line: usize, message: impl Into<String>) -> Self {
        Self {
            line: Some(line),
            message: message.into(),
        }
    }

    #[must_use]
    pub fn with_line(mut self, line: usize) -> Self {
        if self.line.is_none() {
            self.line = Some(line);
        }
        self
    }
}

impl From<CursorError> for ScriptError {
    fn from(value: CursorError) -> Self {
        Self::new(format!("database error: {value}"))
    }
}

#[derive(Debug, Error)]
pub enum HostError {
    #[error("failed to open storage engine: {0}")]
    Storage(#[from] rusqlite::Error),
    #[error("invalid requirement '{line}': {reason}")]
    Requirement { line: String, reason: String },
    #[error("package '{name}' is not available")]
    UnknownPackage { name: String },
    #[error("package '{name}' {available} does not satisfy '{constraint}'")]
    VersionMismatch {
        name: String,
        available: String,
        constraint: String,
    },
    #[error("{0}")]
    Script(#[from] ScriptError),
}
