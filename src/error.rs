//! Typed error taxonomy for the notebook SDK.
//!
//! Every caller-facing operation resolves to exactly one of these kinds.
//! The transport recovers transient connection issues internally (reconnect
//! plus retry); everything else is surfaced unchanged.

use crate::codec::Value;

/// Filesystem error kinds recognised in server error payloads.
///
/// A generic application error whose payload carries one of these names is
/// re-thrown as [`SdkError::Fs`] with the matching kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsErrorKind {
    /// The filesystem backend is temporarily unavailable.
    Unavailable,
    /// The operation was denied.
    NoPermissions,
    /// Target already exists.
    FileExists,
    /// Target does not exist.
    FileNotFound,
    /// A file operation hit a directory.
    FileIsADirectory,
    /// A directory operation hit a file.
    FileNotADirectory,
}

impl FsErrorKind {
    /// Parse a server-side error name into a kind.
    ///
    /// Returns `None` for names outside the recognised set, in which case
    /// the error stays a plain application error.
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "Unavailable" => Some(Self::Unavailable),
            "NoPermissions" => Some(Self::NoPermissions),
            "FileExists" => Some(Self::FileExists),
            "FileNotFound" => Some(Self::FileNotFound),
            "FileIsADirectory" => Some(Self::FileIsADirectory),
            "FileNotADirectory" => Some(Self::FileNotADirectory),
            _ => None,
        }
    }

    /// Canonical server-side name for this kind.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unavailable => "Unavailable",
            Self::NoPermissions => "NoPermissions",
            Self::FileExists => "FileExists",
            Self::FileNotFound => "FileNotFound",
            Self::FileIsADirectory => "FileIsADirectory",
            Self::FileNotADirectory => "FileNotADirectory",
        }
    }
}

/// Errors surfaced by SDK operations.
#[derive(Debug, Clone)]
pub enum SdkError {
    /// The socket closed while a request was in flight. Retriable.
    ConnectionLost(String),
    /// A connection attempt exceeded its deadline. Retriable.
    ConnectionTimeout,
    /// A request exceeded its per-call timeout. Not retried automatically.
    RequestTimeout(String),
    /// The caller cancelled the request. Never retried.
    Aborted,
    /// The server closed with a policy code, or the client-side rate
    /// limiter was saturated. Surfaced immediately; never retried.
    RateLimited(String),
    /// Typed application error from the server. Never retried.
    Api {
        /// Server error code (HTTP-style, plus `5000` for internal).
        code: i64,
        /// Human-readable message.
        message: String,
        /// Raw error payload as received.
        raw: Value,
    },
    /// Application error with a recognised filesystem name.
    Fs {
        /// Recognised filesystem error kind.
        kind: FsErrorKind,
        /// Server error code.
        code: i64,
        /// Human-readable message.
        message: String,
    },
    /// The notebook init handshake reported an error.
    Init(String),
    /// A malformed frame was received; logged and dropped by the
    /// transport, surfaced only where decoding is explicit.
    InvalidMessage(String),
    /// Constructor-time validation failure. Never retried.
    InvalidConfig(String),
    /// The transport was permanently closed.
    Closed,
}

impl SdkError {
    /// Whether the transport retry loop may resend after this error.
    ///
    /// Only transient connection failures qualify; application errors,
    /// timeouts, rate limits, and aborts are surfaced as-is.
    #[must_use]
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::ConnectionLost(_) | Self::ConnectionTimeout)
    }

    /// Re-throw an application error as a typed filesystem error when its
    /// payload carries a recognised `name`.
    #[must_use]
    pub fn map_fs(self) -> Self {
        if let Self::Api { code, ref message, ref raw } = self {
            if let Some(kind) = raw.get("name").and_then(Value::as_str).and_then(FsErrorKind::parse) {
                return Self::Fs { kind, code, message: message.clone() };
            }
        }
        self
    }
}

impl std::fmt::Display for SdkError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ConnectionLost(msg) => write!(f, "Connection lost: {msg}"),
            Self::ConnectionTimeout => write!(f, "Connection attempt timed out"),
            Self::RequestTimeout(msg) => write!(f, "Request timed out: {msg}"),
            Self::Aborted => write!(f, "Request aborted"),
            Self::RateLimited(msg) => write!(f, "Rate limited: {msg}"),
            Self::Api { code, message, .. } => write!(f, "Server error {code}: {message}"),
            Self::Fs { kind, code, message } => {
                write!(f, "Filesystem error {} ({code}): {message}", kind.as_str())
            }
            Self::Init(msg) => write!(f, "Notebook init failed: {msg}"),
            Self::InvalidMessage(msg) => write!(f, "Invalid message: {msg}"),
            Self::InvalidConfig(msg) => write!(f, "Invalid configuration: {msg}"),
            Self::Closed => write!(f, "Transport closed"),
        }
    }
}

impl std::error::Error for SdkError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retriable_kinds() {
        assert!(SdkError::ConnectionLost("x".into()).is_retriable());
        assert!(SdkError::ConnectionTimeout.is_retriable());
        assert!(!SdkError::Aborted.is_retriable());
        assert!(!SdkError::RateLimited("x".into()).is_retriable());
        assert!(!SdkError::RequestTimeout("x".into()).is_retriable());
        assert!(!SdkError::Closed.is_retriable());
        let api = SdkError::Api { code: 500, message: "boom".into(), raw: Value::Null };
        assert!(!api.is_retriable());
    }

    #[test]
    fn test_fs_kind_parse_round_trip() {
        for name in [
            "Unavailable",
            "NoPermissions",
            "FileExists",
            "FileNotFound",
            "FileIsADirectory",
            "FileNotADirectory",
        ] {
            let kind = FsErrorKind::parse(name).expect("known name");
            assert_eq!(kind.as_str(), name);
        }
        assert!(FsErrorKind::parse("SomethingElse").is_none());
    }

    #[test]
    fn test_map_fs_recognised_name() {
        let raw = Value::map([("name", Value::from("FileNotFound"))]);
        let err = SdkError::Api { code: 404, message: "missing".into(), raw };
        match err.map_fs() {
            SdkError::Fs { kind, code, message } => {
                assert_eq!(kind, FsErrorKind::FileNotFound);
                assert_eq!(code, 404);
                assert_eq!(message, "missing");
            }
            other => panic!("expected Fs error, got {other:?}"),
        }
    }

    #[test]
    fn test_map_fs_unknown_name_passthrough() {
        let raw = Value::map([("name", Value::from("NotAThing"))]);
        let err = SdkError::Api { code: 500, message: "boom".into(), raw };
        assert!(matches!(err.map_fs(), SdkError::Api { code: 500, .. }));
    }

    #[test]
    fn test_display_is_stable() {
        let s = SdkError::RateLimited("rate limit exceeded".into()).to_string();
        assert!(s.contains("rate limit exceeded"));
    }
}
