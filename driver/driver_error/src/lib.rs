//! The error type used across the driver crates.
//!
//! Setup paths (device open, ring configuration, DMA allocation) surface these
//! errors to the caller. Data-path functions never construct them; they signal
//! partial progress through their return counts instead.

use std::fmt;
use std::io;

/// Result alias used throughout the driver crates.
pub type Result<T> = core::result::Result<T, Error>;

/// The classes of failure the driver distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// An argument was out of range at a call boundary.
    InvalidArg,
    /// An operation was issued against an object in the wrong state,
    /// e.g. a closed device or a double free.
    InvalidState,
    /// No memory of the required kind was available.
    OutOfMemory,
    /// The request is outside what this driver supports.
    Unsupported,
    /// A syscall on sysfs, procfs or the hugepage mount failed.
    Io,
    /// A hardware wait exceeded its diagnostic bound.
    Timeout,
}

/// An error from a driver setup path.
///
/// Carries the failure class, a static description of the operation that
/// failed, and the underlying OS error where one exists.
#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    context: &'static str,
    source: Option<io::Error>,
}

impl Error {
    pub fn new(kind: ErrorKind, context: &'static str) -> Error {
        Error { kind, context, source: None }
    }

    pub fn invalid_arg(context: &'static str) -> Error {
        Error::new(ErrorKind::InvalidArg, context)
    }

    pub fn invalid_state(context: &'static str) -> Error {
        Error::new(ErrorKind::InvalidState, context)
    }

    pub fn out_of_memory(context: &'static str) -> Error {
        Error::new(ErrorKind::OutOfMemory, context)
    }

    pub fn unsupported(context: &'static str) -> Error {
        Error::new(ErrorKind::Unsupported, context)
    }

    pub fn timeout(context: &'static str) -> Error {
        Error::new(ErrorKind::Timeout, context)
    }

    /// Wraps a syscall failure, keeping the errno available via `source()`.
    pub fn io(context: &'static str, source: io::Error) -> Error {
        Error { kind: ErrorKind::Io, context, source: Some(source) }
    }

    /// Builds an `Io` error from the current value of `errno`.
    pub fn last_os_error(context: &'static str) -> Error {
        Error::io(context, io::Error::last_os_error())
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn context(&self) -> &'static str {
        self.context
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            ErrorKind::InvalidArg => "invalid argument",
            ErrorKind::InvalidState => "invalid state",
            ErrorKind::OutOfMemory => "out of memory",
            ErrorKind::Unsupported => "unsupported",
            ErrorKind::Io => "I/O error",
            ErrorKind::Timeout => "timeout",
        };
        match &self.source {
            Some(e) => write!(f, "{}: {}: {}", kind, self.context, e),
            None => write!(f, "{}: {}", kind, self.context),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_ref().map(|e| e as &(dyn std::error::Error + 'static))
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Error {
        let kind = match e.kind() {
            io::ErrorKind::OutOfMemory => ErrorKind::OutOfMemory,
            _ => ErrorKind::Io,
        };
        Error { kind, context: "operating system call failed", source: Some(e) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_is_preserved() {
        assert_eq!(Error::invalid_arg("x").kind(), ErrorKind::InvalidArg);
        assert_eq!(Error::out_of_memory("x").kind(), ErrorKind::OutOfMemory);
    }

    #[test]
    fn io_error_keeps_errno() {
        let e = Error::io("reading config space", io::Error::from_raw_os_error(13));
        assert_eq!(e.kind(), ErrorKind::Io);
        let source = std::error::Error::source(&e).expect("source errno");
        assert!(source.to_string().contains("denied"));
    }
}
