//! The crate's error type.
//!
//! Kept as a hand-rolled enum rather than reaching for a derive macro crate:
//! there are few variants and each carries a distinct, human-readable
//! message that call sites want full control over.

use std::fmt;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug)]
pub enum Error {
    /// A `Common.cfg` or `PeerInfo.cfg` file was missing, malformed, or
    /// referred to an unknown peer id.
    Config(String),
    /// The handshake header didn't match `P2PFILESHARINGPROJ` or the
    /// zero-padding wasn't all zero.
    BadHandshake,
    /// A message violated the wire format: wrong length, unknown type, or
    /// an out of range piece index.
    Protocol(String),
    /// A file system operation on the shared file or its directory failed.
    Io(std::io::Error),
    /// A TCP connect/accept/read/write failed.
    Socket(std::io::Error),
    /// An internal channel was closed while a message was still pending
    /// delivery.
    Channel,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Config(msg) => write!(f, "configuration error: {}", msg),
            Error::BadHandshake => write!(f, "invalid handshake"),
            Error::Protocol(msg) => write!(f, "protocol error: {}", msg),
            Error::Io(e) => write!(f, "i/o error: {}", e),
            Error::Socket(e) => write!(f, "socket error: {}", e),
            Error::Channel => write!(f, "internal channel closed"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) | Error::Socket(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<std::num::ParseIntError> for Error {
    fn from(_: std::num::ParseIntError) -> Self {
        Error::Config("expected a decimal integer".into())
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for Error {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        Error::Channel
    }
}
