//! Error types for the media-storage client.
//!
//! # Design
//! A single closed enum covers every failure a call can surface. The server's
//! protocol errors (403, 404, 409, 412, 503 and "anything else") get dedicated
//! variants so callers can branch on them directly; `ErrorKind` mirrors the
//! variants as a `Copy` discriminant for code that only needs to classify.
//!
//! No layer in this crate retries. The one place failures are swallowed is the
//! endpoint resolver's probe loop, which reports exhaustion as `Resolution`.

use std::fmt;

/// Errors returned by the resolver, the transport engine and the client facades.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// No endpoint could be resolved: the SRV lookup failed, returned nothing,
    /// or every candidate failed its liveness probe.
    #[error("unable to resolve a viable server: {0}")]
    Resolution(String),

    /// The exchange did not complete before its deadline.
    #[error("request timed out: {0}")]
    Timeout(String),

    /// Name resolution or the TCP connection failed.
    #[error("unable to send message: {0}")]
    Url(String),

    /// The server answered with a non-2xx status that has no dedicated variant.
    #[error("unable to send message; code: {status}")]
    Protocol { status: u16 },

    /// 403: the supplied key does not grant the requested access.
    #[error("the requested operation could not be performed because an invalid key was provided")]
    NotAuthorised,

    /// 404: the record does not exist or has been unlinked.
    #[error("the requested resource was not retrievable; it may have been deleted or not yet defined")]
    NotFound,

    /// 409: the request envelope is structurally flawed.
    #[error("the uploaded request is structurally flawed and cannot be processed")]
    InvalidRecord,

    /// 412: one of the request headers was rejected.
    #[error("one or more of the headers supplied was rejected by the server")]
    InvalidHeaders,

    /// 503: the server could not process the request right now.
    #[error("the server was unable to process the request")]
    TemporaryFailure,

    /// The body was expected to be JSON but did not parse. `raw` holds the
    /// offending text.
    #[error("unable to decode JSON content received from server: {source}")]
    InvalidJson {
        raw: String,
        #[source]
        source: serde_json::Error,
    },

    /// The compression format is unknown, or known but without a local codec.
    #[error("unsupported compression format: {0}")]
    UnsupportedFormat(String),

    /// A `ServerDescriptor` violated its construction invariants.
    #[error("invalid server descriptor: {0}")]
    InvalidDescriptor(String),

    /// The request header could not be serialized to JSON.
    #[error("failed to serialize request: {0}")]
    Serialization(#[source] serde_json::Error),

    /// Reading a payload or writing a sink failed.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Any other failure reported by the HTTP client library.
    #[error("transport failure: {0}")]
    Transport(String),
}

/// Discriminant of [`Error`], for callers that only need to classify a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Resolution,
    Timeout,
    Url,
    Protocol,
    NotAuthorised,
    NotFound,
    InvalidRecord,
    InvalidHeaders,
    TemporaryFailure,
    InvalidJson,
    UnsupportedFormat,
    InvalidDescriptor,
    Serialization,
    Io,
    Transport,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl Error {
    /// Map a non-2xx HTTP status to its error variant.
    pub fn from_status(status: u16) -> Self {
        match status {
            403 => Error::NotAuthorised,
            404 => Error::NotFound,
            409 => Error::InvalidRecord,
            412 => Error::InvalidHeaders,
            503 => Error::TemporaryFailure,
            status => Error::Protocol { status },
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Resolution(_) => ErrorKind::Resolution,
            Error::Timeout(_) => ErrorKind::Timeout,
            Error::Url(_) => ErrorKind::Url,
            Error::Protocol { .. } => ErrorKind::Protocol,
            Error::NotAuthorised => ErrorKind::NotAuthorised,
            Error::NotFound => ErrorKind::NotFound,
            Error::InvalidRecord => ErrorKind::InvalidRecord,
            Error::InvalidHeaders => ErrorKind::InvalidHeaders,
            Error::TemporaryFailure => ErrorKind::TemporaryFailure,
            Error::InvalidJson { .. } => ErrorKind::InvalidJson,
            Error::UnsupportedFormat(_) => ErrorKind::UnsupportedFormat,
            Error::InvalidDescriptor(_) => ErrorKind::InvalidDescriptor,
            Error::Serialization(_) => ErrorKind::Serialization,
            Error::Io(_) => ErrorKind::Io,
            Error::Transport(_) => ErrorKind::Transport,
        }
    }

    /// True for the server-reported status errors: `Protocol` and its
    /// specializations.
    pub fn is_protocol(&self) -> bool {
        matches!(
            self,
            Error::Protocol { .. }
                | Error::NotAuthorised
                | Error::NotFound
                | Error::InvalidRecord
                | Error::InvalidHeaders
                | Error::TemporaryFailure
        )
    }

    /// The HTTP status behind a protocol error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            Error::Protocol { status } => Some(*status),
            Error::NotAuthorised => Some(403),
            Error::NotFound => Some(404),
            Error::InvalidRecord => Some(409),
            Error::InvalidHeaders => Some(412),
            Error::TemporaryFailure => Some(503),
            _ => None,
        }
    }
}

impl From<ureq::Error> for Error {
    fn from(err: ureq::Error) -> Self {
        match err {
            ureq::Error::StatusCode(status) => Error::from_status(status),
            ureq::Error::Timeout(which) => Error::Timeout(format!("{which:?} deadline exceeded")),
            ureq::Error::HostNotFound => Error::Url("host not found".to_string()),
            ureq::Error::ConnectionFailed => Error::Url("connection failed".to_string()),
            ureq::Error::Io(io) => match io.kind() {
                std::io::ErrorKind::TimedOut => Error::Timeout(io.to_string()),
                std::io::ErrorKind::ConnectionRefused
                | std::io::ErrorKind::ConnectionReset
                | std::io::ErrorKind::AddrNotAvailable => Error::Url(io.to_string()),
                _ => Error::Io(io),
            },
            other => Error::Transport(other.to_string()),
        }
    }
}

impl Error {
    /// Map a failure while streaming a response body. The HTTP client wraps
    /// its own errors in `io::Error` there, so they are unwrapped first and a
    /// deadline still reads as `Timeout`.
    pub(crate) fn from_body_read(err: std::io::Error) -> Self {
        if !err.get_ref().is_some_and(|inner| inner.is::<ureq::Error>()) {
            return Error::from(ureq::Error::Io(err));
        }
        match err.into_inner().map(|inner| inner.downcast::<ureq::Error>()) {
            Some(Ok(inner)) => Error::from(*inner),
            _ => Error::Transport("unreadable response body".to_string()),
        }
    }
}
