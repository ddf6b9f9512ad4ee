use arcstr::ArcStr;
use std::fmt;

use crate::RetryMethod;

/// Kinds of errors reported by a cache server.
#[derive(PartialEq, Debug, Clone, Copy, Eq, Hash)]
#[non_exhaustive]
pub enum ServerErrorKind {
    /// The server could not complete the operation.
    OperationFailed,
    /// An add was issued for a key that is already present.
    KeyAlreadyExists,
    /// The presented lock id does not match the current lock holder.
    LockMismatch,
    /// The item is locked and the operation did not present a lock.
    ItemLocked,
    /// Data is being moved between servers; the request must be resent as a dedicated call.
    StateTransferInProgress,
    /// The server refused a distributed request while its partition is being rebuilt.
    ActivityBlocked,
    /// The request was routed with a distribution map the server has since superseded.
    StaleView,
    /// The engine does not support the requested operation.
    NotSupported,
}

impl ServerErrorKind {
    pub(crate) fn code(&self) -> &'static str {
        match self {
            Self::OperationFailed => "OPERATION_FAILED",
            Self::KeyAlreadyExists => "KEY_EXISTS",
            Self::LockMismatch => "LOCK_MISMATCH",
            Self::ItemLocked => "ITEM_LOCKED",
            Self::StateTransferInProgress => "STATE_TRANSFER",
            Self::ActivityBlocked => "ACTIVITY_BLOCKED",
            Self::StaleView => "STALE_VIEW",
            Self::NotSupported => "NOT_SUPPORTED",
        }
    }

    fn from_code(code: &str) -> Option<Self> {
        Some(match code {
            "OPERATION_FAILED" => Self::OperationFailed,
            "KEY_EXISTS" => Self::KeyAlreadyExists,
            "LOCK_MISMATCH" => Self::LockMismatch,
            "ITEM_LOCKED" => Self::ItemLocked,
            "STATE_TRANSFER" => Self::StateTransferInProgress,
            "ACTIVITY_BLOCKED" => Self::ActivityBlocked,
            "STALE_VIEW" => Self::StaleView,
            "NOT_SUPPORTED" => Self::NotSupported,
            _ => return None,
        })
    }

    pub(crate) fn retry_method(&self) -> RetryMethod {
        match self {
            Self::StateTransferInProgress => RetryMethod::DedicatedCall,

            Self::ActivityBlocked => RetryMethod::Reroute,
            Self::StaleView => RetryMethod::Reroute,

            Self::OperationFailed => RetryMethod::NoRetry,
            Self::KeyAlreadyExists => RetryMethod::NoRetry,
            Self::LockMismatch => RetryMethod::NoRetry,
            Self::ItemLocked => RetryMethod::NoRetry,
            Self::NotSupported => RetryMethod::NoRetry,
        }
    }
}

/// An error that was returned from a cache server.
#[derive(PartialEq, Debug, Clone)]
pub struct ServerError(pub(crate) Repr);

#[derive(PartialEq, Debug, Clone)]
pub(crate) enum Repr {
    Extension {
        code: ArcStr,
        detail: Option<ArcStr>,
    },
    Known {
        kind: ServerErrorKind,
        detail: Option<ArcStr>,
    },
}

impl ServerError {
    /// Builds a server error from the code string carried in a response.
    ///
    /// Codes this library does not know are kept as extension errors.
    pub fn new(code: &str, detail: Option<&str>) -> Self {
        let detail = detail.map(ArcStr::from);
        match ServerErrorKind::from_code(code) {
            Some(kind) => ServerError(Repr::Known { kind, detail }),
            None => ServerError(Repr::Extension {
                code: code.into(),
                detail,
            }),
        }
    }

    /// Builds an error of a known kind.
    pub fn known(kind: ServerErrorKind, detail: Option<&str>) -> Self {
        ServerError(Repr::Known {
            kind,
            detail: detail.map(ArcStr::from),
        })
    }

    /// Returns the kind of error. If `None`, try `code` to get the error code.
    pub fn kind(&self) -> Option<ServerErrorKind> {
        match &self.0 {
            Repr::Extension { .. } => None,
            Repr::Known { kind, .. } => Some(*kind),
        }
    }

    /// The error code returned from the server
    pub fn code(&self) -> &str {
        match &self.0 {
            Repr::Extension { code, .. } => code,
            Repr::Known { kind, .. } => kind.code(),
        }
    }

    /// Additional details about the error, if exist
    pub fn details(&self) -> Option<&str> {
        match &self.0 {
            Repr::Extension { detail, .. } | Repr::Known { detail, .. } => detail.as_deref(),
        }
    }
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let detail = match &self.0 {
            Repr::Extension { code, detail } => {
                write!(f, "{code:?}")?;
                detail
            }
            Repr::Known { kind, detail } => {
                write!(f, "{kind:?}")?;
                detail
            }
        };
        match detail {
            Some(detail) => write!(f, ": {detail}"),
            None => Ok(()),
        }
    }
}

impl std::error::Error for ServerError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_codes_are_classified() {
        let err = ServerError::new("STATE_TRANSFER", Some("bucket 12 moving"));
        assert_eq!(err.kind(), Some(ServerErrorKind::StateTransferInProgress));
        assert_eq!(err.details(), Some("bucket 12 moving"));
        assert_eq!(err.code(), "STATE_TRANSFER");
    }

    #[test]
    fn test_unknown_codes_stay_extension() {
        let err = ServerError::new("QUOTA", None);
        assert_eq!(err.kind(), None);
        assert_eq!(err.code(), "QUOTA");
        assert_eq!(err.to_string(), "\"QUOTA\"");
    }
}
