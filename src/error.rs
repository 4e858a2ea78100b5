use std::fmt;
use std::io;
use std::os::fd::RawFd;

/// Errors returned by the spindle reactor.
#[derive(Debug)]
pub enum Error {
    /// Underlying syscall or socket operation failed.
    Io(io::Error),
    /// The poller reported readiness for an fd with no live Channel.
    ChannelMissing(RawFd),
    /// Timer timeout is outside the wheel's representable range.
    InvalidTimeout(u64),
    /// A worker thread exited before handing back its loop handle.
    WorkerStartup(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "I/O error: {e}"),
            Error::ChannelMissing(fd) => {
                write!(f, "readiness reported for fd {fd} with no registered channel")
            }
            Error::InvalidTimeout(ticks) => {
                write!(f, "timer timeout {ticks}s out of range (valid 1..60)")
            }
            Error::WorkerStartup(msg) => write!(f, "worker startup: {msg}"),
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
