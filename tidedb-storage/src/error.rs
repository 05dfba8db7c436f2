use crate::ff::Errno;
use std::array::TryFromSliceError;
use std::os::unix::io::RawFd;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, Error)]
pub enum Error {
    #[error("invalid argument")]
    InvalidArgument,
    #[error("Invalid format")]
    InvalidFormat,
    #[error("IO Error")]
    IOError,
    #[error("config error: {0}")]
    ConfigError(String),
    // file and mapping errors, all of them carry OS error code.
    #[error("could not open {path} [errno={errno}]")]
    OpenFileError { path: String, errno: i32 },
    #[error("{op} failed [fd={fd}, errno={errno}]")]
    FileOpError {
        op: &'static str,
        fd: RawFd,
        errno: i32,
    },
    #[error("No space left on device [need={need}, errno={errno}]")]
    NoSpaceLeft { need: usize, errno: i32 },
    #[error("could not mmap [fd={fd}, offset={offset}, size={size}, errno={errno}]")]
    MmapFailed {
        fd: RawFd,
        offset: usize,
        size: usize,
        errno: i32,
    },
    // virtual memory errors
    #[error("insufficient memory({0})")]
    InsufficientMemory(usize),
    #[error("maximum page count exceeded({0})")]
    MaxPagesExceeded(usize),
    // symbol map errors
    #[error("SymbolMap does not exist: {0}")]
    SymbolMapNotFound(String),
    #[error("SymbolMap is too short: {path} [len={len}]")]
    SymbolMapTooShort { path: String, len: usize },
    #[error("symbol id space exhausted")]
    SymbolCountOverflow,
    #[error("bitmap index is corrupted: {0}")]
    IndexCorrupted(String),
}

impl Error {
    /// Returns OS error code if this error is caused by a failed system call.
    #[inline]
    pub fn errno(&self) -> Option<i32> {
        match self {
            Error::OpenFileError { errno, .. }
            | Error::FileOpError { errno, .. }
            | Error::NoSpaceLeft { errno, .. }
            | Error::MmapFailed { errno, .. } => Some(*errno),
            _ => None,
        }
    }

    #[inline]
    pub(crate) fn file_op(op: &'static str, fd: RawFd, errno: Errno) -> Self {
        Error::FileOpError {
            op,
            fd,
            errno: errno.0,
        }
    }
}

impl From<TryFromSliceError> for Error {
    #[inline]
    fn from(_src: TryFromSliceError) -> Error {
        Error::InvalidFormat
    }
}

impl From<std::io::Error> for Error {
    #[inline]
    fn from(_src: std::io::Error) -> Self {
        Error::IOError
    }
}

impl From<std::string::FromUtf16Error> for Error {
    #[inline]
    fn from(_src: std::string::FromUtf16Error) -> Error {
        Error::InvalidFormat
    }
}

impl From<std::num::ParseIntError> for Error {
    #[inline]
    fn from(_src: std::num::ParseIntError) -> Error {
        Error::InvalidFormat
    }
}

impl From<toml::de::Error> for Error {
    #[inline]
    fn from(src: toml::de::Error) -> Error {
        Error::ConfigError(src.to_string())
    }
}
