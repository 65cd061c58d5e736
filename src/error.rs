//! Contains the `Error` and `Result` types that `watchstream` uses.

use std::{collections::HashSet, fmt, sync::Arc};

use serde::Deserialize;
use thiserror::Error;

/// Server error codes that indicate a change stream may be resumed against servers
/// that predate the resumable error label (wire version < 9).
const RESUMABLE_CODES: [i32; 17] = [
    6, 7, 63, 89, 91, 133, 150, 189, 234, 262, 9001, 10107, 11600, 11602, 13388, 13435, 13436,
];

const CURSOR_NOT_FOUND_CODE: i32 = 43;

/// Error label attached by 4.4+ servers to errors that a change stream may resume from.
pub const RESUMABLE_CHANGE_STREAM_ERROR: &str = "ResumableChangeStreamError";

/// The result type for all methods that can return an error in the `watchstream` crate.
pub type Result<T> = std::result::Result<T, Error>;

/// An error that can occur in the `watchstream` crate. The inner
/// [`ErrorKind`] is wrapped in a `Box` to allow the errors to be cloned.
#[derive(Clone, Debug, Error)]
#[error("Kind: {kind}, labels: {labels:?}")]
#[non_exhaustive]
pub struct Error {
    /// The type of error that occurred.
    pub kind: Box<ErrorKind>,

    labels: HashSet<String>,

    /// The maximum wire version of the server that produced this error, when known.
    /// Used to select the resumability rules that apply to the error.
    wire_version: Option<i32>,

    #[source]
    source: Option<Box<Error>>,
}

impl Error {
    /// Construct a new `Error` from a kind and an optional set of error labels.
    ///
    /// This is public so that [`Deployment`](crate::deployment::Deployment)
    /// implementations can surface server errors with the labels the server
    /// attached to them.
    pub fn new(kind: ErrorKind, labels: Option<impl IntoIterator<Item = String>>) -> Self {
        Self {
            kind: Box::new(kind),
            labels: labels
                .map(|labels| labels.into_iter().collect())
                .unwrap_or_default(),
            wire_version: None,
            source: None,
        }
    }

    /// Attach the wire version of the server that produced this error.
    pub fn with_wire_version(mut self, wire_version: i32) -> Self {
        self.wire_version = Some(wire_version);
        self
    }

    pub(crate) fn set_wire_version_if_absent(&mut self, wire_version: Option<i32>) {
        if self.wire_version.is_none() {
            self.wire_version = wire_version;
        }
    }

    pub(crate) fn with_source<E: Into<Option<Error>>>(mut self, source: E) -> Self {
        self.source = source.into().map(Box::new);
        self
    }

    pub(crate) fn internal(message: impl Into<String>) -> Error {
        ErrorKind::Internal {
            message: message.into(),
        }
        .into()
    }

    pub(crate) fn invalid_argument(message: impl Into<String>) -> Error {
        ErrorKind::InvalidArgument {
            message: message.into(),
        }
        .into()
    }

    /// The error labels attached to this error, if any.
    pub fn labels(&self) -> &HashSet<String> {
        &self.labels
    }

    /// Whether this error contains the given label.
    pub fn contains_label(&self, label: &str) -> bool {
        self.labels.contains(label)
    }

    /// The server error code, if this error originated from a failed command.
    pub fn server_code(&self) -> Option<i32> {
        match self.kind.as_ref() {
            ErrorKind::Command(ref err) => Some(err.code),
            _ => None,
        }
    }

    pub(crate) fn is_network_error(&self) -> bool {
        matches!(self.kind.as_ref(), ErrorKind::Io(..))
    }

    fn is_server_error(&self) -> bool {
        matches!(self.kind.as_ref(), ErrorKind::Command(..))
    }

    /// Whether a change stream encountering this error may tear down its cursor and
    /// transparently reopen a new one.
    ///
    /// Network-level failures are always resumable. Server errors are resumable if
    /// they indicate a dead cursor, carry the resumable label (4.4+ servers), or
    /// match the legacy code allowlist (pre-4.4 servers).
    pub fn is_resumable(&self) -> bool {
        if self.is_network_error() {
            return true;
        }
        if !self.is_server_error() {
            return false;
        }
        let code = self.server_code();
        if code == Some(CURSOR_NOT_FOUND_CODE) {
            return true;
        }
        match self.wire_version {
            Some(v) if v >= 9 => self.contains_label(RESUMABLE_CHANGE_STREAM_ERROR),
            _ => matches!(code, Some(code) if RESUMABLE_CODES.contains(&code)),
        }
    }
}

impl<E> From<E> for Error
where
    ErrorKind: From<E>,
{
    fn from(err: E) -> Self {
        Error::new(err.into(), None::<Option<String>>)
    }
}

impl From<bson::de::Error> for ErrorKind {
    fn from(err: bson::de::Error) -> Self {
        Self::BsonDeserialization(err)
    }
}

impl From<bson::ser::Error> for ErrorKind {
    fn from(err: bson::ser::Error) -> Self {
        Self::BsonSerialization(err)
    }
}

impl From<bson::raw::Error> for ErrorKind {
    fn from(err: bson::raw::Error) -> Self {
        Self::InvalidResponse {
            message: err.to_string(),
        }
    }
}

impl From<bson::raw::ValueAccessError> for ErrorKind {
    fn from(err: bson::raw::ValueAccessError) -> Self {
        Self::InvalidResponse {
            message: err.to_string(),
        }
    }
}

impl From<std::io::Error> for ErrorKind {
    fn from(err: std::io::Error) -> Self {
        Self::Io(Arc::new(err))
    }
}

impl From<std::io::ErrorKind> for ErrorKind {
    fn from(err: std::io::ErrorKind) -> Self {
        Self::Io(Arc::new(err.into()))
    }
}

/// The types of errors that can occur.
#[allow(missing_docs)]
#[derive(Clone, Debug, Error)]
#[non_exhaustive]
pub enum ErrorKind {
    /// An invalid argument was provided.
    #[error("An invalid argument was provided: {message}")]
    #[non_exhaustive]
    InvalidArgument { message: String },

    /// Wrapper around `bson::de::Error`.
    #[error("{0}")]
    BsonDeserialization(bson::de::Error),

    /// Wrapper around `bson::ser::Error`.
    #[error("{0}")]
    BsonSerialization(bson::ser::Error),

    /// The server returned an error to an attempted operation.
    #[error("Command failed: {0}")]
    Command(CommandError),

    #[error("Internal error: {message}")]
    #[non_exhaustive]
    Internal { message: String },

    /// Wrapper around [`std::io::Error`](https://doc.rust-lang.org/std/io/struct.Error.html).
    #[error("I/O error: {0}")]
    Io(Arc<std::io::Error>),

    /// The server returned an invalid reply to a database operation.
    #[error("The server returned an invalid reply to a database operation: {message}")]
    #[non_exhaustive]
    InvalidResponse { message: String },

    /// The deployment was not able to select a server for the operation.
    #[error("{message}")]
    #[non_exhaustive]
    ServerSelection { message: String },

    /// No resume token was present in a change stream document.
    #[error("Cannot provide resume functionality when the resume token is missing")]
    MissingResumeToken,

    /// An operation was attempted on a change stream that has been closed.
    #[error("The change stream has been closed")]
    StreamClosed,

    /// A push adapter was requested on a change stream with no active cursor.
    #[error("The change stream has no active cursor")]
    NoCursor,

    /// A change stream was consumed in both iterator and emitter modes.
    #[error("Change stream mode conflict: {message}")]
    #[non_exhaustive]
    ModeConflict { message: String },

    /// The topology did not report itself connected within the resume deadline.
    #[error("{message}")]
    #[non_exhaustive]
    TopologyTimeout { message: String },
}

/// An error that occurred due to a database command failing.
#[derive(Clone, Debug, Deserialize)]
#[non_exhaustive]
pub struct CommandError {
    /// Identifies the type of error.
    pub code: i32,

    /// The name associated with the error code.
    #[serde(rename = "codeName", default)]
    pub code_name: String,

    /// A description of the error that occurred.
    #[serde(rename = "errmsg", default = "String::new")]
    pub message: String,
}

impl CommandError {
    /// Construct a new `CommandError` from a code, code name, and message.
    pub fn new(code: i32, code_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code,
            code_name: code_name.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for CommandError {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            fmt,
            "Error code {} ({}): {}",
            self.code, self.code_name, self.message
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn command_error(code: i32) -> Error {
        ErrorKind::Command(CommandError::new(code, "", "")).into()
    }

    #[test]
    fn network_errors_are_resumable() {
        let err = Error::from(std::io::ErrorKind::ConnectionReset);
        assert!(err.is_resumable());
    }

    #[test]
    fn cursor_not_found_is_always_resumable() {
        assert!(command_error(43).is_resumable());
        assert!(command_error(43).with_wire_version(17).is_resumable());
    }

    #[test]
    fn modern_servers_classify_by_label() {
        let labeled = Error::new(
            ErrorKind::Command(CommandError::new(6, "HostUnreachable", "")),
            Some([RESUMABLE_CHANGE_STREAM_ERROR.to_string()]),
        )
        .with_wire_version(9);
        assert!(labeled.is_resumable());

        // The same code without the label is not resumable on 4.4+.
        let unlabeled = command_error(6).with_wire_version(9);
        assert!(!unlabeled.is_resumable());
    }

    #[test]
    fn legacy_servers_classify_by_code() {
        assert!(command_error(91).with_wire_version(8).is_resumable());
        assert!(command_error(91).is_resumable());
        assert!(!command_error(26).with_wire_version(8).is_resumable());
    }

    #[test]
    fn client_side_errors_are_not_resumable() {
        assert!(!Error::from(ErrorKind::MissingResumeToken).is_resumable());
        assert!(!Error::internal("broken").is_resumable());
        assert!(!Error::from(ErrorKind::StreamClosed).is_resumable());
    }
}
