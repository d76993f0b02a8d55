use std::io;

pub type NetResult<T> = Result<T, NetError>;

/// Two-level error used on the hot IO paths. `Wait` means the operation
/// could not make progress right now and should be retried on the next
/// readiness notification. `Fatal` means the connection is done for.
#[derive(Debug, Eq, PartialEq)]
pub enum NetError {
    Wait,
    Fatal(FatalKind),
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum FatalKind {
    /// Peer closed the connection (EOF, reset, broken pipe).
    Closed,
    /// The kernel accepted a zero-length write.
    WriteZero,
    /// A write was attempted on a queue that no longer accepts data.
    QueueClosed,
    Io(io::ErrorKind),
}

impl NetError {
    #[inline]
    pub fn is_wait(&self) -> bool {
        *self == NetError::Wait
    }
}

impl From<io::Error> for NetError {
    #[inline]
    fn from(io_error: io::Error) -> Self {
        match io_error.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => NetError::Wait,
            io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe => NetError::Fatal(FatalKind::Closed),
            io::ErrorKind::WriteZero => NetError::Fatal(FatalKind::WriteZero),
            kind => NetError::Fatal(FatalKind::Io(kind)),
        }
    }
}

/// Request-level failure. Each variant maps onto the 4xx/5xx response the
/// connection sends before it stops keeping the connection alive.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum HttpError {
    BadRequest,
    PayloadTooLarge,
    UriTooLong,
    ExpectationFailed,
    UpgradeRequired,
    HeadersTooLarge,
    VersionNotSupported,
    NotImplemented,
    Internal,
}

impl HttpError {
    #[inline]
    pub fn status(&self) -> u16 {
        match self {
            HttpError::BadRequest => 400,
            HttpError::PayloadTooLarge => 413,
            HttpError::UriTooLong => 414,
            HttpError::ExpectationFailed => 417,
            HttpError::UpgradeRequired => 426,
            HttpError::HeadersTooLarge => 431,
            HttpError::Internal => 500,
            HttpError::NotImplemented => 501,
            HttpError::VersionNotSupported => 505,
        }
    }
}

/// Startup and configuration failures. These are fatal: the process reports
/// them and exits nonzero.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("invalid listen url `{0}`")]
    InvalidUrl(String),
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}
