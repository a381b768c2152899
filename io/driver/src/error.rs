use std::fmt;
use std::io;

/// Errors returned by the acceptor and reactor.
#[derive(Debug)]
pub enum Error {
    /// Poll setup or socket operation failed.
    Io(io::Error),
    /// The component's event thread is already running.
    AlreadyRunning,
    /// Listener setup failed.
    Listen(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "I/O error: {e}"),
            Error::AlreadyRunning => write!(f, "already running"),
            Error::Listen(msg) => write!(f, "listen: {msg}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}
