use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Error descriptor carried by a FAIL reply.
///
/// All three fields are opaque UTF-8 strings produced by the service:
/// `ename` is the remote error class name, `evalue` its string form, and
/// `traceback` a free-form multi-line string displayed verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteError {
    pub ename: String,
    pub evalue: String,
    #[serde(default)]
    pub traceback: String,
}

impl RemoteError {
    pub fn new(ename: impl Into<String>, evalue: impl Into<String>) -> Self {
        RemoteError {
            ename: ename.into(),
            evalue: evalue.into(),
            traceback: String::new(),
        }
    }

    /// Whether this error marks normal end-of-iteration of a remote generator.
    pub fn is_stop_iteration(&self) -> bool {
        self.ename == "StopIteration"
    }
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.ename, self.evalue)
    }
}

/// All error types produced by the zrpc library.
#[derive(Debug)]
pub enum RpcError {
    /// A local misconfiguration: registering a reserved name, calling
    /// before bind/connect, and similar caller mistakes.
    Config(String),

    /// The transport failed or was closed while the operation was in flight.
    Transport(String),

    /// A pending request expired before a terminal reply arrived.
    Timeout(Duration),

    /// The remote procedure failed; wraps the service's error descriptor.
    Remote(RemoteError),

    /// Malformed frames or an undecodable payload.
    Decode(String),
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RpcError::Config(msg) => write!(f, "configuration error: {msg}"),
            RpcError::Transport(msg) => write!(f, "transport error: {msg}"),
            RpcError::Timeout(dur) => {
                write!(f, "request timed out after {:.3} sec", dur.as_secs_f64())
            }
            RpcError::Remote(err) => write!(f, "{err}"),
            RpcError::Decode(msg) => write!(f, "decode error: {msg}"),
        }
    }
}

impl std::error::Error for RpcError {}

impl From<zmq::Error> for RpcError {
    fn from(err: zmq::Error) -> Self {
        RpcError::Transport(err.to_string())
    }
}

impl From<RemoteError> for RpcError {
    fn from(err: RemoteError) -> Self {
        RpcError::Remote(err)
    }
}

impl RpcError {
    /// The error raised when `call` is issued before `bind` or `connect`.
    pub(crate) fn not_ready() -> Self {
        RpcError::Config("bind or connect must be called first".into())
    }

    /// The error pending callers receive when the socket closes under them.
    pub(crate) fn closed() -> Self {
        RpcError::Transport("socket closed while waiting for a reply".into())
    }
}

/// Convenience type alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, RpcError>;
