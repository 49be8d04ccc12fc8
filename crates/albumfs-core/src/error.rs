//! Error taxonomy for the caching engine
//!
//! Every core operation surfaces one of these kinds; the FUSE shim maps
//! them to POSIX error codes at the boundary.

use thiserror::Error;

/// Result alias used across the engine
pub type CacheResult<T> = Result<T, CacheError>;

/// Engine-level errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    #[error("object does not exist")]
    NotFound,

    #[error("access denied")]
    AccessDenied,

    #[error("operation not supported")]
    NotSupported,

    #[error("unimplemented")]
    Unimplemented,

    /// Cache/remote-object desync, e.g. a cached directory whose serialized
    /// form no longer reconstructs
    #[error("unexpected error: {0}")]
    UnexpectedError(String),

    /// Remote call rejected or local I/O failure
    #[error("operation failed: {0}")]
    OperationFailed(String),

    #[error("no network connection")]
    NoNetworkConnection,
}

impl CacheError {
    pub fn unexpected(msg: impl Into<String>) -> Self {
        CacheError::UnexpectedError(msg.into())
    }

    pub fn failed(msg: impl Into<String>) -> Self {
        CacheError::OperationFailed(msg.into())
    }

    /// Map to a libc errno for the filesystem boundary
    pub fn errno(&self) -> i32 {
        match self {
            CacheError::NotFound => libc::ENOENT,
            CacheError::AccessDenied => libc::EACCES,
            CacheError::NotSupported => libc::EOPNOTSUPP,
            CacheError::Unimplemented => libc::ENOSYS,
            CacheError::UnexpectedError(_) => libc::EIO,
            CacheError::OperationFailed(_) => libc::EIO,
            CacheError::NoNetworkConnection => libc::ENETDOWN,
        }
    }
}

impl From<std::io::Error> for CacheError {
    fn from(e: std::io::Error) -> Self {
        CacheError::OperationFailed(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping() {
        assert_eq!(CacheError::NotFound.errno(), libc::ENOENT);
        assert_eq!(CacheError::AccessDenied.errno(), libc::EACCES);
        assert_eq!(CacheError::NoNetworkConnection.errno(), libc::ENETDOWN);
        assert_eq!(CacheError::failed("x").errno(), libc::EIO);
    }
}
