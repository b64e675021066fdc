use std::time::Duration;

/// Content problems that need author action and are never retried.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ContentError {
    #[error("no content to publish")]
    Empty,

    #[error("text too long: {len} characters, limit is {max}")]
    TooLong { len: usize, max: usize },

    #[error("unsupported language: {0}")]
    UnsupportedLanguage(String),
}

/// Core error type.
///
/// Adapter crates map their transport errors (HTTP status codes, gateway error
/// codes, teloxide request errors) into this type so the engines can decide
/// between retrying, recording the failure on an entity, or propagating.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("transient failure: {reason}")]
    Transient {
        reason: String,
        retry_after: Option<Duration>,
    },

    #[error("permission denied: {0}")]
    Permission(String),

    #[error("content rejected: {0}")]
    Content(#[from] ContentError),

    #[error("gave up after {attempts} attempts: {last}")]
    RetryExhausted { attempts: u32, last: String },

    #[error("state conflict: {0}")]
    Conflict(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("external error: {0}")]
    External(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Failure taxonomy recorded on entities and in per-item results.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    RetryableTransient,
    TerminalPermission,
    TerminalContent,
    DuplicateSuppressed,
    Internal,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::RetryableTransient => "retryable_transient",
            ErrorKind::TerminalPermission => "terminal_permission",
            ErrorKind::TerminalContent => "terminal_content",
            ErrorKind::DuplicateSuppressed => "duplicate_suppressed",
            ErrorKind::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Error {
    pub fn transient(reason: impl Into<String>) -> Self {
        Error::Transient {
            reason: reason.into(),
            retry_after: None,
        }
    }

    /// Only transient failures are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Transient { .. })
    }

    /// Server-provided delay hint, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Error::Transient { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Validation(_) | Error::NotFound(_) => ErrorKind::Validation,
            Error::Transient { .. } | Error::RetryExhausted { .. } => {
                ErrorKind::RetryableTransient
            }
            Error::Permission(_) => ErrorKind::TerminalPermission,
            Error::Content(_) => ErrorKind::TerminalContent,
            Error::Conflict(_)
            | Error::Config(_)
            | Error::Io(_)
            | Error::Json(_)
            | Error::External(_) => ErrorKind::Internal,
        }
    }

    /// Compact form stored in `ChannelPost::last_error`.
    pub fn to_record(&self) -> String {
        format!("[{}] {}", self.kind(), self)
    }
}
