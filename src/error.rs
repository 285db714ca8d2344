//! Error kinds returned by the core.

use core::fmt;

pub type Result<T> = core::result::Result<T, Error>;

/// Error kinds surfaced by the core API.
///
/// `NoData` is internal plumbing for sparse blocks: the seek layer raises it
/// and the read/write layers consume it, so it should never escape a public
/// call.  `Corrupt` means an invariant was violated; by the time it is
/// returned the volume has already been latched read-only.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Error {
    InvalidArg,
    NotFound,
    Io,
    BadHandle,
    NoMemory,
    Busy,
    Exists,
    CrossDevice,
    NotDir,
    IsDir,
    TooManyOpenFiles,
    FileTooBig,
    NoSpace,
    ReadOnly,
    TooManyLinks,
    NameTooLong,
    NotEmpty,
    SymlinkLoop,
    NoData,
    NoLink,
    Corrupt,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Error::InvalidArg => "invalid argument",
            Error::NotFound => "not found",
            Error::Io => "I/O error",
            Error::BadHandle => "bad inode or handle",
            Error::NoMemory => "out of memory",
            Error::Busy => "resource busy",
            Error::Exists => "already exists",
            Error::CrossDevice => "cross-device operation",
            Error::NotDir => "not a directory",
            Error::IsDir => "is a directory",
            Error::TooManyOpenFiles => "no free inode slots",
            Error::FileTooBig => "file too big",
            Error::NoSpace => "no space left on volume",
            Error::ReadOnly => "volume is read-only",
            Error::TooManyLinks => "too many links",
            Error::NameTooLong => "name too long",
            Error::NotEmpty => "directory not empty",
            Error::SymlinkLoop => "too many levels of symbolic links",
            Error::NoData => "sparse block",
            Error::NoLink => "not a data inode",
            Error::Corrupt => "catastrophic corruption",
        };
        f.write_str(msg)
    }
}
