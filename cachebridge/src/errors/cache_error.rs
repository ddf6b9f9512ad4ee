use std::{error, fmt, io};

use arcstr::ArcStr;

use crate::errors::server_error::{ServerError, ServerErrorKind};

/// Stable code carried by errors raised while no engine is attached to a cache handle.
pub const CACHE_NOT_INIT: &str = "CACHE_NOT_INIT";

/// An enum of all error kinds.
#[derive(PartialEq, Eq, Copy, Clone, Debug)]
#[non_exhaustive]
pub enum ErrorKind {
    /// An argument passed to the cache was rejected before any network work.
    InvalidArgument,
    /// The cache handle has no engine: it was never opened or was already disposed.
    NotInitialized,
    /// A value could not be serialized or deserialized.
    Serialization,
    /// A compressed payload could not be compressed or inflated.
    Compression,
    /// The transport failed to move bytes.
    IoError,
    /// No server is reachable to carry the request.
    NoServerAvailable,
    /// Every callback id in the 16-bit space is in use.
    CallbackIdsExhausted,
    /// The client misbehaved, for instance by receiving a response of the
    /// wrong shape.
    ClientError,
    /// The cache was configured with settings that cannot work.
    InvalidClientConfig,
    /// A server error code this library does not know.
    ExtensionError,
    /// An error returned from the server
    ServerError(ServerErrorKind),
}

/// Represents a cache error.
///
/// Match on [`CacheError::kind`] rather than on the message: messages are for
/// humans and may change.
pub struct CacheError {
    repr: ErrorRepr,
}

#[derive(Debug)]
enum ErrorRepr {
    Described(ErrorKind, &'static str, Option<ArcStr>),
    Extension { code: ArcStr, detail: ArcStr },
    Io(io::Error),
    Server(ServerError),
}

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> CacheError {
        CacheError::from((
            ErrorKind::Serialization,
            "Value could not be (de)serialized",
            err.to_string(),
        ))
    }
}

impl From<io::Error> for CacheError {
    fn from(err: io::Error) -> CacheError {
        CacheError {
            repr: ErrorRepr::Io(err),
        }
    }
}

impl From<(ErrorKind, &'static str)> for CacheError {
    fn from((kind, desc): (ErrorKind, &'static str)) -> CacheError {
        CacheError {
            repr: ErrorRepr::Described(kind, desc, None),
        }
    }
}

impl From<(ErrorKind, &'static str, String)> for CacheError {
    fn from((kind, desc, detail): (ErrorKind, &'static str, String)) -> CacheError {
        CacheError {
            repr: ErrorRepr::Described(kind, desc, Some(detail.into())),
        }
    }
}

impl From<ServerError> for CacheError {
    fn from(err: ServerError) -> Self {
        CacheError {
            repr: ErrorRepr::Server(err),
        }
    }
}

impl From<ServerErrorKind> for CacheError {
    fn from(kind: ServerErrorKind) -> Self {
        ServerError::known(kind, None).into()
    }
}

impl From<ServerErrorKind> for ErrorKind {
    fn from(kind: ServerErrorKind) -> Self {
        ErrorKind::ServerError(kind)
    }
}

/// Two errors are equal when they have the same kind and, for server and
/// extension errors, the same code. Messages are not compared.
impl PartialEq for CacheError {
    fn eq(&self, other: &CacheError) -> bool {
        match (&self.repr, &other.repr) {
            (ErrorRepr::Described(a, _, _), ErrorRepr::Described(b, _, _)) => a == b,
            (ErrorRepr::Extension { code: a, .. }, ErrorRepr::Extension { code: b, .. }) => a == b,
            (ErrorRepr::Server(a), ErrorRepr::Server(b)) => a == b,
            _ => false,
        }
    }
}

impl error::Error for CacheError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match &self.repr {
            ErrorRepr::Io(err) => Some(err),
            ErrorRepr::Server(err) => Some(err),
            _ => None,
        }
    }
}

impl fmt::Debug for CacheError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for CacheError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.repr {
            ErrorRepr::Described(kind, desc, None) => write!(f, "{desc} ({kind:?})"),
            ErrorRepr::Described(kind, desc, Some(detail)) => {
                write!(f, "{desc} ({kind:?}): {detail}")
            }
            ErrorRepr::Extension { code, detail } => write!(f, "{code}: {detail}"),
            ErrorRepr::Io(err) => err.fmt(f),
            ErrorRepr::Server(err) => err.fmt(f),
        }
    }
}

/// What method should be used if retrying this request.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryMethod {
    /// The transport must replace its connection first.
    Reconnect,
    /// Don't retry, this is a permanent error.
    NoRetry,
    /// Retry immediately, this doesn't require a wait.
    RetryImmediately,
    /// Resend once, marked as a dedicated call that bypasses the distribution map.
    DedicatedCall,
    /// Resend a distributed request as a single request to one server.
    Reroute,
}

impl CacheError {
    /// Returns the kind of the error.
    pub fn kind(&self) -> ErrorKind {
        match &self.repr {
            ErrorRepr::Described(kind, _, _) => *kind,
            ErrorRepr::Extension { .. } => ErrorKind::ExtensionError,
            ErrorRepr::Io(_) => ErrorKind::IoError,
            ErrorRepr::Server(err) => err
                .kind()
                .map_or(ErrorKind::ExtensionError, ErrorKind::ServerError),
        }
    }

    /// Returns the error detail.
    pub fn detail(&self) -> Option<&str> {
        match &self.repr {
            ErrorRepr::Described(_, _, detail) => detail.as_deref(),
            ErrorRepr::Extension { detail, .. } => Some(detail),
            ErrorRepr::Server(err) => err.details(),
            ErrorRepr::Io(_) => None,
        }
    }

    /// Returns the raw error code if available.
    ///
    /// Errors raised against a handle without an engine always report [`CACHE_NOT_INIT`].
    pub fn code(&self) -> Option<&str> {
        match &self.repr {
            ErrorRepr::Described(ErrorKind::NotInitialized, _, _) => Some(CACHE_NOT_INIT),
            ErrorRepr::Extension { code, .. } => Some(code),
            ErrorRepr::Server(err) => Some(err.code()),
            ErrorRepr::Described(..) | ErrorRepr::Io(_) => None,
        }
    }

    /// Returns the name of the error category for display purposes.
    pub fn category(&self) -> &str {
        match self.kind() {
            ErrorKind::InvalidArgument => "invalid argument",
            ErrorKind::NotInitialized => "cache not initialized",
            ErrorKind::Serialization => "serialization",
            ErrorKind::Compression => "compression",
            ErrorKind::IoError => "I/O error",
            ErrorKind::NoServerAvailable => "no server available",
            ErrorKind::CallbackIdsExhausted => "callback ids exhausted",
            ErrorKind::ClientError => "client error",
            ErrorKind::InvalidClientConfig => "invalid client config",
            ErrorKind::ExtensionError => "extension error",
            ErrorKind::ServerError(ServerErrorKind::OperationFailed) => "operation failed",
            ErrorKind::ServerError(ServerErrorKind::KeyAlreadyExists) => "key already exists",
            ErrorKind::ServerError(ServerErrorKind::LockMismatch) => "lock mismatch",
            ErrorKind::ServerError(ServerErrorKind::ItemLocked) => "item locked",
            ErrorKind::ServerError(ServerErrorKind::StateTransferInProgress) => {
                "state transfer in progress"
            }
            ErrorKind::ServerError(ServerErrorKind::ActivityBlocked) => "activity blocked",
            ErrorKind::ServerError(ServerErrorKind::StaleView) => "stale distribution view",
            ErrorKind::ServerError(ServerErrorKind::NotSupported) => "not supported",
        }
    }

    /// Indicates that the transport failed to move bytes.
    pub fn is_io_error(&self) -> bool {
        self.kind() == ErrorKind::IoError
    }

    /// Indicates that the error was raised by argument validation.
    pub fn is_validation_error(&self) -> bool {
        self.kind() == ErrorKind::InvalidArgument
    }

    /// Indicates that the cache handle had no engine attached.
    pub fn is_not_initialized(&self) -> bool {
        self.kind() == ErrorKind::NotInitialized
    }

    /// Copies the error so one sub-request failure can be reported for every
    /// key the sub-request carried.
    ///
    /// I/O errors cannot be cloned; the copy keeps their kind and message,
    /// prefixed with `ioerror_description`.
    pub fn clone_mostly(&self, ioerror_description: &'static str) -> Self {
        let repr = match &self.repr {
            ErrorRepr::Described(kind, desc, detail) => {
                ErrorRepr::Described(*kind, *desc, detail.clone())
            }
            ErrorRepr::Extension { code, detail } => ErrorRepr::Extension {
                code: code.clone(),
                detail: detail.clone(),
            },
            ErrorRepr::Io(err) => ErrorRepr::Io(io::Error::new(
                err.kind(),
                format!("{ioerror_description}: {err}"),
            )),
            ErrorRepr::Server(err) => ErrorRepr::Server(err.clone()),
        };
        CacheError { repr }
    }

    /// Specifies what method (if any) should be used to retry this request.
    ///
    /// The remote engine already handles [`RetryMethod::DedicatedCall`] and,
    /// for bulk reads, [`RetryMethod::Reroute`].
    pub fn retry_method(&self) -> RetryMethod {
        match &self.repr {
            ErrorRepr::Server(err) => err
                .kind()
                .map_or(RetryMethod::NoRetry, |kind| kind.retry_method()),
            ErrorRepr::Io(err) => match err.kind() {
                io::ErrorKind::ConnectionRefused
                | io::ErrorKind::ConnectionReset
                | io::ErrorKind::ConnectionAborted
                | io::ErrorKind::NotConnected
                | io::ErrorKind::BrokenPipe
                | io::ErrorKind::UnexpectedEof => RetryMethod::Reconnect,
                io::ErrorKind::PermissionDenied | io::ErrorKind::Unsupported => {
                    RetryMethod::NoRetry
                }
                _ => RetryMethod::RetryImmediately,
            },
            ErrorRepr::Described(ErrorKind::NoServerAvailable, _, _) => RetryMethod::Reconnect,
            ErrorRepr::Described(ErrorKind::IoError, _, _) => RetryMethod::RetryImmediately,
            ErrorRepr::Described(ErrorKind::ServerError(kind), _, _) => kind.retry_method(),
            ErrorRepr::Described(..) | ErrorRepr::Extension { .. } => RetryMethod::NoRetry,
        }
    }

    pub(crate) fn not_initialized() -> Self {
        CacheError::from((ErrorKind::NotInitialized, "Cache is not initialized"))
    }
}

/// Wraps a server error code this library does not know.
///
/// Without a `detail`, a generic message is used.
pub fn make_extension_error(code: String, detail: Option<String>) -> CacheError {
    let detail = detail.map_or(arcstr::literal!("Unknown extension error encountered"), ArcStr::from);
    CacheError {
        repr: ErrorRepr::Extension {
            code: code.into(),
            detail,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_initialized_carries_stable_code() {
        let err = CacheError::not_initialized();
        assert!(err.is_not_initialized());
        assert_eq!(err.code(), Some(CACHE_NOT_INIT));
        assert_eq!(err.retry_method(), RetryMethod::NoRetry);
    }

    #[test]
    fn test_state_transfer_asks_for_dedicated_call() {
        let err: CacheError = ServerError::new("STATE_TRANSFER", None).into();
        assert_eq!(
            err.kind(),
            ErrorKind::ServerError(ServerErrorKind::StateTransferInProgress)
        );
        assert_eq!(err.retry_method(), RetryMethod::DedicatedCall);
        assert_eq!(err.code(), Some("STATE_TRANSFER"));
    }

    #[test]
    fn test_unknown_server_codes_are_extensions() {
        let err: CacheError = ServerError::new("QUOTA_EXCEEDED", Some("try later")).into();
        assert_eq!(err.kind(), ErrorKind::ExtensionError);
        assert_eq!(err.code(), Some("QUOTA_EXCEEDED"));
        assert_eq!(err.detail(), Some("try later"));
        assert_eq!(err.retry_method(), RetryMethod::NoRetry);
    }

    #[test]
    fn test_clone_mostly_keeps_io_kind() {
        let err = CacheError::from(io::Error::new(io::ErrorKind::ConnectionReset, "peer gone"));
        let cloned = err.clone_mostly("bulk add");
        assert!(cloned.is_io_error());
        assert_eq!(cloned.retry_method(), RetryMethod::Reconnect);
        assert!(cloned.to_string().starts_with("bulk add: "));
    }

    #[test]
    fn test_extension_error_keeps_code() {
        let err = make_extension_error("QUOTA".to_string(), None);
        assert_eq!(err.kind(), ErrorKind::ExtensionError);
        assert_eq!(err.code(), Some("QUOTA"));
        assert_eq!(err.detail(), Some("Unknown extension error encountered"));
    }

    #[test]
    fn test_display_includes_detail() {
        let err = CacheError::from((ErrorKind::ClientError, "Bad response", "GET".to_string()));
        assert_eq!(err.to_string(), "Bad response (ClientError): GET");
        assert_eq!(err.category(), "client error");
    }
}
