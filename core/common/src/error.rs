//! Common error types for tablesync.

use thiserror::Error;

use crate::types::{Record, TableAction};

/// Top-level error type for tablesync operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid argument provided by the caller.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// A component was used before `initialize` completed.
    #[error("Not initialized: {0}")]
    NotInitialized(String),

    /// The query uses a clause the operation does not allow.
    #[error("Unsupported query: {0}")]
    UnsupportedQuery(String),

    /// A new action cannot be condensed into the pending operation.
    #[error("Condense not supported: {0}")]
    Condense(String),

    /// Operation lock is held by another operation.
    #[error("Lock error: {0}")]
    Lock(String),

    /// Local store operation failed.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Resource already exists.
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// A regular purge found pending operations for the table.
    #[error("Table '{0}' has pending operations")]
    PendingOperations(String),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The remote table service rejected a request.
    #[error(transparent)]
    Remote(#[from] RemoteError),

    /// Push stopped on an error nobody handled.
    #[error(
        "Push failed while pushing operation for tableName: {table}, action: {action}, and record ID: {item_id}"
    )]
    PushAborted {
        table: String,
        action: TableAction,
        item_id: String,
        #[source]
        source: Box<Error>,
    },

    /// The server returned data that violates the pull contract.
    #[error("Pull error: {0}")]
    Pull(String),
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Failure reported by the remote table service.
///
/// `http_status` is `None` when the request never produced a response
/// (connection failure, request filter rejection).
#[derive(Debug, Clone, Error)]
#[error("Remote error (status {}): {message}", status_text(.http_status))]
pub struct RemoteError {
    /// HTTP status of the failed response, if any.
    pub http_status: Option<u16>,
    /// Human-readable description.
    pub message: String,
    /// Server copy of the record, when the response carried one.
    pub server_record: Option<Record>,
}

impl RemoteError {
    /// Create an error for a response with the given status.
    pub fn with_status(status: u16, message: impl Into<String>) -> Self {
        Self {
            http_status: Some(status),
            message: message.into(),
            server_record: None,
        }
    }

    /// Create an error for a request that produced no response.
    pub fn network(message: impl Into<String>) -> Self {
        Self {
            http_status: None,
            message: message.into(),
            server_record: None,
        }
    }

    /// Attach the server's copy of the record.
    pub fn with_server_record(mut self, record: Record) -> Self {
        self.server_record = Some(record);
        self
    }

    /// Whether the status signals a stale concurrency token (409 or 412).
    pub fn is_conflict(&self) -> bool {
        matches!(self.http_status, Some(409) | Some(412))
    }
}

fn status_text(status: &Option<u16>) -> String {
    match status {
        Some(code) => code.to_string(),
        None => "none".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conflict_statuses() {
        assert!(RemoteError::with_status(409, "conflict").is_conflict());
        assert!(RemoteError::with_status(412, "precondition failed").is_conflict());
        assert!(!RemoteError::with_status(500, "boom").is_conflict());
        assert!(!RemoteError::network("offline").is_conflict());
    }

    #[test]
    fn test_push_aborted_display() {
        let err = Error::PushAborted {
            table: "todo".to_string(),
            action: TableAction::Update,
            item_id: "abc".to_string(),
            source: Box::new(Error::Remote(RemoteError::with_status(500, "boom"))),
        };

        let text = err.to_string();
        assert!(text.contains("todo"));
        assert!(text.contains("update"));
        assert!(text.contains("abc"));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_remote_display() {
        let err = RemoteError::network("connection refused");
        assert_eq!(err.to_string(), "Remote error (status none): connection refused");
    }
}
