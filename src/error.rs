//! Error type used throughout this crate.

use std::error;
use std::ffi::NulError;
use std::fmt;
use std::fmt::Debug;
use std::fmt::Display;
use std::io;
use std::str::Utf8Error;

/// A `Result` specialized for this crate's [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// The kinds of failure this crate can report.
///
/// These map closely onto the error taxonomy used by the attach pipeline:
/// configuration mistakes are distinguished from I/O failures reading kernel
/// tables, from verifier rejections, from resource-limit failures, and from
/// per-function kernel errors that the caller chooses to tolerate.
#[derive(Debug)]
#[non_exhaustive]
pub enum Error {
    /// A caller-supplied argument was malformed (e.g. an invalid glob).
    InvalidArgument(String),
    /// The kernel or the allocator refused a memory request.
    OutOfMemory(String),
    /// Something the caller expected to exist was not found (no functions
    /// selected, a required file missing, a BTF id unresolved).
    NotFound(String),
    /// Reading or parsing one of the external kernel tables failed.
    Io(io::Error),
    /// The kernel verifier rejected a loaded program.
    Verifier(String),
    /// Raising an rlimit, or another resource-acquisition step, failed.
    Resource(String),
    /// A kernel syscall (attach, load) failed for a specific function.
    ///
    /// Carries the raw, positive `errno` value.
    Kernel(i32),
}

impl Error {
    /// Build an [`Error::InvalidArgument`] from a `Utf8Error`/`NulError`-style failure.
    pub(crate) fn with_invalid_data(e: impl Display) -> Self {
        Error::InvalidArgument(e.to_string())
    }

    /// Build an [`Error::Kernel`] from a raw, positive `errno` value.
    pub(crate) fn from_raw_os_error(errno: i32) -> Self {
        Error::Kernel(errno)
    }

    /// The raw `errno`, if this error wraps one.
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            Error::Kernel(errno) => Some(*errno),
            Error::Io(e) => e.raw_os_error(),
            _ => None,
        }
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidArgument(s) => write!(f, "invalid argument: {s}"),
            Error::OutOfMemory(s) => write!(f, "out of memory: {s}"),
            Error::NotFound(s) => write!(f, "not found: {s}"),
            Error::Io(e) => write!(f, "I/O error: {e}"),
            Error::Verifier(s) => write!(f, "verifier rejected program: {s}"),
            Error::Resource(s) => write!(f, "resource error: {s}"),
            Error::Kernel(errno) => {
                write!(f, "kernel syscall failed: {}", io::Error::from_raw_os_error(*errno))
            }
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
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

impl From<NulError> for Error {
    fn from(e: NulError) -> Self {
        Error::InvalidArgument(e.to_string())
    }
}

impl From<Utf8Error> for Error {
    fn from(e: Utf8Error) -> Self {
        Error::InvalidArgument(e.to_string())
    }
}
