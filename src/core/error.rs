/// Error taxonomy for the download engine (spec §7).
use serde::Serialize;

/// Main error type for download and storage operations.
///
/// `NotFound` is deliberately absent: a missing stored file surfaces as
/// `Ok(None)` from `ContentStore::get`, never as an error (§7).
#[derive(Debug, Clone, thiserror::Error, Serialize)]
pub enum DownloadError {
    /// Non-2xx response after retries exhausted, or unexpected content-type.
    #[error("HTTP error: {0}")]
    Http(String),

    /// Connection failure, DNS error, transport reset.
    #[error("Network error: {0}")]
    Network(String),

    /// MD5 mismatch, truncated chunk, or range mismatch.
    #[error("Integrity check failed: {message}")]
    Integrity { message: String },

    /// Storage quota exceeded.
    #[error("Capacity exceeded: {0}")]
    Capacity(String),

    /// Server returned a 202 deferral; the parent should mark the file
    /// `pending` and ask again later. Not a terminal failure.
    #[error("Download deferred by server: {0}")]
    Pending(String),

    /// Queue cleared, or the file was removed from the active set mid-flight.
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// File system errors unrelated to capacity (permissions, missing dirs).
    #[error("I/O error: {0}")]
    Io(String),

    /// Parsing errors (headers, URLs, manifest entries).
    #[error("Parse error: {0}")]
    Parse(String),

    /// Configuration errors (invalid settings, missing values).
    #[error("Configuration error: {0}")]
    Config(String),

    /// Task join errors (thread/async task failures).
    #[error("Task join error: {0}")]
    TaskJoin(String),
}

impl DownloadError {
    /// True for task-level errors the spec allows to retry locally
    /// (`Http`/`Network`), per the §7 propagation policy.
    pub fn is_retryable_at_task_level(&self) -> bool {
        matches!(self, DownloadError::Http(_) | DownloadError::Network(_))
    }
}

/// Helper trait to add context to errors, matching the teacher's
/// `core/error.rs` convention.
pub trait ErrorContext<T> {
    fn context(self, msg: &str) -> Result<T, DownloadError>;
}

impl<T, E> ErrorContext<T> for Result<T, E>
where
    E: Into<DownloadError>,
{
    fn context(self, msg: &str) -> Result<T, DownloadError> {
        self.map_err(|e| {
            let base_error = e.into();
            match base_error {
                DownloadError::Network(e) => DownloadError::Network(e),
                DownloadError::Io(e) => DownloadError::Io(e),
                _ => DownloadError::Config(format!("{}: {:?}", msg, base_error)),
            }
        })
    }
}

impl From<tokio::task::JoinError> for DownloadError {
    fn from(err: tokio::task::JoinError) -> Self {
        DownloadError::TaskJoin(err.to_string())
    }
}

impl From<reqwest::Error> for DownloadError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() {
            DownloadError::Network(err.to_string())
        } else {
            DownloadError::Http(err.to_string())
        }
    }
}

impl From<std::io::Error> for DownloadError {
    fn from(err: std::io::Error) -> Self {
        DownloadError::Io(err.to_string())
    }
}

impl From<rusqlite::Error> for DownloadError {
    fn from(err: rusqlite::Error) -> Self {
        DownloadError::Io(err.to_string())
    }
}

impl From<String> for DownloadError {
    fn from(err: String) -> Self {
        DownloadError::Config(err)
    }
}

impl From<&str> for DownloadError {
    fn from(err: &str) -> Self {
        DownloadError::Config(err.to_string())
    }
}
