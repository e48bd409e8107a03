use std::fmt;
use std::io;
use std::net;

pub type NetworkResult<T> = Result<T, NetworkError>;

/// Outcome plumbing for per-connection I/O and parsing. `Wait` is the
/// would-block signal: the operation made as much progress as it could and the
/// reactor should try again on the next readiness event. `Fatal` errors are
/// recovered at the connection boundary.
#[derive(Debug, Eq, PartialEq)]
pub enum NetworkError {
    Wait,
    Fatal(ErrorType),
}

#[derive(Debug, Eq, PartialEq)]
pub enum ErrorType {
    /// Transport error on either endpoint.
    Io(io::ErrorKind),
    /// The HTTP parser rejected the byte stream.
    Parse,
    /// The connect target could not be resolved.
    Resolve,
    /// The peer closed outside an expected terminal transition.
    Closed,
    /// A buffered extent exceeded its capacity bound.
    Overrun,
    /// A host callback panicked.
    Hook,
    /// An internal phase invariant failed.
    Phase,
}

impl From<io::Error> for NetworkError {
    #[inline]
    fn from(io_error: io::Error) -> Self {
        match io_error.kind() {
            io::ErrorKind::WouldBlock => NetworkError::Wait,
            kind => NetworkError::Fatal(ErrorType::Io(kind)),
        }
    }
}

pub trait ErrorUtils {
    fn has_failed(&self) -> bool;
}

impl<T> ErrorUtils for NetworkResult<T> {
    fn has_failed(&self) -> bool {
        match self {
            Ok(_) => false,
            Err(NetworkError::Wait) => false,
            _ => true,
        }
    }
}

/// Host-facing errors surfaced synchronously from `Proxy::bind` and
/// `Proxy::start`.
#[derive(Debug)]
pub enum ProxyError {
    /// Bad bind address or invalid configuration value.
    Config(String),
    /// Socket or poll creation failure.
    Io(io::Error),
    /// `start` was called while the dispatch loop is already running.
    AlreadyRunning,
}

impl fmt::Display for ProxyError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ProxyError::Config(msg) => write!(f, "configuration error: {}", msg),
            ProxyError::Io(err) => write!(f, "i/o error: {}", err),
            ProxyError::AlreadyRunning => write!(f, "proxy is already running"),
        }
    }
}

impl std::error::Error for ProxyError {}

impl From<io::Error> for ProxyError {
    #[inline]
    fn from(err: io::Error) -> Self {
        ProxyError::Io(err)
    }
}

impl From<net::AddrParseError> for ProxyError {
    #[inline]
    fn from(err: net::AddrParseError) -> Self {
        ProxyError::Config(err.to_string())
    }
}
