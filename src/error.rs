use std::sync::Arc;
use std::{error, fmt, io, result};

/// The error type for all buslink operations.
#[derive(Debug)]
pub enum Error {
    /// A malformed server address or invalid argument.
    Address(String),
    /// The connection was created but never opened.
    NotConnected,
    /// The connection is still being established.
    Connecting,
    /// The operation is only valid while the connection is being established.
    AlreadyConnected,
    /// The connection was lost. Carries the failure that caused it.
    Disconnected(Arc<Error>),
    /// The connection was explicitly disposed.
    Disposed,
    /// The operation is not valid in the current connection state.
    InvalidOperation(String),
    /// The peer violated the D-Bus protocol.
    Protocol(String),
    /// The remote side replied with a D-Bus error: (error name, message).
    MethodError(String, String),
    /// An I/O error on the underlying transport.
    Io(io::Error),
    /// The operation was cancelled before it completed.
    Cancelled,
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Error::Disconnected(e) => Some(&**e),
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Address(e) => write!(f, "address error: {}", e),
            Error::NotConnected => write!(f, "not connected"),
            Error::Connecting => write!(f, "connection is being established"),
            Error::AlreadyConnected => write!(f, "already connected"),
            Error::Disconnected(e) => write!(f, "connection lost: {}", e),
            Error::Disposed => write!(f, "connection disposed"),
            Error::InvalidOperation(e) => write!(f, "invalid operation: {}", e),
            Error::Protocol(e) => write!(f, "protocol violation: {}", e),
            Error::MethodError(name, msg) => write!(f, "{}: {}", name, msg),
            Error::Io(e) => e.fmt(f),
            Error::Cancelled => write!(f, "operation cancelled"),
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

/// Alias for a `Result` with the error type `buslink::Error`.
pub type Result<T> = result::Result<T, Error>;
