//! Error types shared by every module in this crate.

use core::fmt;
use core::result;

#[cfg(feature = "std")]
use std::io;

use alloc::string::String;

/// The kinds of failure this crate can report.
///
/// Each variant corresponds to one row of the error taxonomy: a failure
/// is classified by *why* the data could not be trusted, not by which
/// function noticed it first.
#[derive(Debug)]
pub enum Error {
    /// Header magic, system id, or version id did not match anything we
    /// know how to read.
    WrongFormat(String),
    /// A value in the file is out of range or otherwise nonsensical:
    /// a name offset past the end of a string blob, a non-power-of-two
    /// alignment, a relocation address out of order or out of bounds,
    /// a symbol index too large to encode.
    BadValue(String),
    /// A `count * element_size` computation would overflow.
    FileTooBig,
    /// An allocation-sized request could not be satisfied.
    NoMemory,
    /// The symbol table was requested on a file with no string table.
    NoSymbols,
    /// An archive member header or library symbol table is garbled.
    MalformedArchive(String),
    /// The underlying byte source failed.
    #[cfg(feature = "std")]
    SystemCall(io::Error),
    /// A generic parse failure not covered by the above.
    Malformed(String),
    /// A `scroll` read/write failed.
    Scroll(scroll::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::WrongFormat(msg) => write!(f, "wrong format: {}", msg),
            Error::BadValue(msg) => write!(f, "bad value: {}", msg),
            Error::FileTooBig => write!(f, "file too big"),
            Error::NoMemory => write!(f, "no memory"),
            Error::NoSymbols => write!(f, "no symbols"),
            Error::MalformedArchive(msg) => write!(f, "malformed archive: {}", msg),
            #[cfg(feature = "std")]
            Error::SystemCall(err) => write!(f, "system call: {}", err),
            Error::Malformed(msg) => write!(f, "malformed: {}", msg),
            Error::Scroll(err) => write!(f, "scroll error: {}", err),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::SystemCall(err) => Some(err),
            Error::Scroll(err) => Some(err),
            _ => None,
        }
    }
}

impl From<scroll::Error> for Error {
    fn from(err: scroll::Error) -> Self {
        Error::Scroll(err)
    }
}

#[cfg(feature = "std")]
impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::SystemCall(err)
    }
}

pub type Result<T> = result::Result<T, Error>;
