//! Error types for the logflow engine.
//!
//! Every failure the engine can observe maps onto one variant of [`Error`],
//! and every variant maps onto one [`ErrorKind`]. Loops decide whether to
//! continue or stop by matching on the kind, never on the message text.

use thiserror::Error;

/// Result type alias for logflow operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Boxed error returned by user-supplied message handlers.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Top-level error type for logflow.
#[derive(Error, Debug)]
pub enum Error {
    /// Transport unreachable or dropped
    #[error("Connection error: {0}")]
    Connection(String),

    /// Credentials rejected or session not authenticated
    #[error("Authentication error: {0}")]
    Auth(String),

    /// Looking up a stream or topic failed (distinct from "not found")
    #[error("Lookup of {resource} failed: {message}")]
    ResourceLookup { resource: String, message: String },

    /// Creating a stream or topic was rejected by the broker
    #[error("Creation of {resource} failed: {message}")]
    ResourceCreate { resource: String, message: String },

    /// A batch was rejected by the broker
    #[error("Dispatch error: {0}")]
    Dispatch(String),

    /// A poll request failed
    #[error("Poll error: {0}")]
    Poll(String),

    /// The message handler failed while processing a message.
    ///
    /// `offset` is the failing message's offset under per-message delivery.
    /// Under batch delivery it is the first offset of the batch, since the
    /// handler reports one error for the whole batch.
    #[error("Handler failed at offset {offset}: {message}")]
    Handler { offset: u64, message: String },

    /// A batch violated the producer's bounds
    #[error("Invalid batch: {0}")]
    InvalidBatch(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Shutdown requested
    #[error("Shutdown requested")]
    Shutdown,
}

/// Copyable classification of an [`Error`], used for events and metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Connection,
    Auth,
    ResourceLookup,
    ResourceCreate,
    Dispatch,
    Poll,
    Handler,
    InvalidBatch,
    Config,
    Io,
    Serialization,
    Shutdown,
}

impl ErrorKind {
    /// All kinds, in label order.
    pub const ALL: [ErrorKind; 12] = [
        ErrorKind::Connection,
        ErrorKind::Auth,
        ErrorKind::ResourceLookup,
        ErrorKind::ResourceCreate,
        ErrorKind::Dispatch,
        ErrorKind::Poll,
        ErrorKind::Handler,
        ErrorKind::InvalidBatch,
        ErrorKind::Config,
        ErrorKind::Io,
        ErrorKind::Serialization,
        ErrorKind::Shutdown,
    ];

    /// Get the label value used in events and metric exports.
    pub fn as_label(&self) -> &'static str {
        match self {
            ErrorKind::Connection => "connection",
            ErrorKind::Auth => "auth",
            ErrorKind::ResourceLookup => "resource_lookup",
            ErrorKind::ResourceCreate => "resource_create",
            ErrorKind::Dispatch => "dispatch",
            ErrorKind::Poll => "poll",
            ErrorKind::Handler => "handler",
            ErrorKind::InvalidBatch => "invalid_batch",
            ErrorKind::Config => "config",
            ErrorKind::Io => "io",
            ErrorKind::Serialization => "serialization",
            ErrorKind::Shutdown => "shutdown",
        }
    }

    /// Whether no loop policy may retry past an error of this kind.
    ///
    /// Connection and auth failures are the caller's to resolve (reconnect,
    /// fix credentials); configuration and batch-shape errors repeat forever.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ErrorKind::Connection
                | ErrorKind::Auth
                | ErrorKind::Config
                | ErrorKind::InvalidBatch
                | ErrorKind::Shutdown
        )
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_label())
    }
}

impl Error {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Connection(_) => ErrorKind::Connection,
            Error::Auth(_) => ErrorKind::Auth,
            Error::ResourceLookup { .. } => ErrorKind::ResourceLookup,
            Error::ResourceCreate { .. } => ErrorKind::ResourceCreate,
            Error::Dispatch(_) => ErrorKind::Dispatch,
            Error::Poll(_) => ErrorKind::Poll,
            Error::Handler { .. } => ErrorKind::Handler,
            Error::InvalidBatch(_) => ErrorKind::InvalidBatch,
            Error::Config(_) => ErrorKind::Config,
            Error::Io(_) => ErrorKind::Io,
            Error::Serialization(_) => ErrorKind::Serialization,
            Error::Shutdown => ErrorKind::Shutdown,
        }
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Error::Config(err.to_string())
    }
}

impl From<toml::ser::Error> for Error {
    fn from(err: toml::ser::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::Config("invalid value".into());
        assert_eq!(err.to_string(), "Configuration error: invalid value");

        let err = Error::ResourceLookup {
            resource: "stream sample-stream".into(),
            message: "connection reset".into(),
        };
        assert!(err.to_string().contains("Lookup of stream sample-stream failed"));

        let err = Error::Handler {
            offset: 42,
            message: "bad payload".into(),
        };
        assert_eq!(err.to_string(), "Handler failed at offset 42: bad payload");
    }

    #[test]
    fn test_error_kind_mapping() {
        assert_eq!(Error::Poll("x".into()).kind(), ErrorKind::Poll);
        assert_eq!(Error::Dispatch("x".into()).kind(), ErrorKind::Dispatch);
        assert_eq!(Error::Auth("x".into()).kind(), ErrorKind::Auth);
        assert_eq!(Error::Shutdown.kind(), ErrorKind::Shutdown);

        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk");
        assert_eq!(Error::from(io).kind(), ErrorKind::Io);
    }

    #[test]
    fn test_fatal_kinds() {
        assert!(ErrorKind::Connection.is_fatal());
        assert!(ErrorKind::Auth.is_fatal());
        assert!(!ErrorKind::Dispatch.is_fatal());
        assert!(!ErrorKind::Poll.is_fatal());
        assert!(!ErrorKind::Handler.is_fatal());
    }

    #[test]
    fn test_labels_are_unique() {
        let mut labels: Vec<_> = ErrorKind::ALL.iter().map(|k| k.as_label()).collect();
        labels.sort_unstable();
        labels.dedup();
        assert_eq!(labels.len(), ErrorKind::ALL.len());
    }
}
