//! Metadata operation errors.
//!
//! The engine surfaces POSIX-shaped errors: every variant maps onto exactly
//! one errno so the kernel bridge can reply without interpretation. Transport
//! problems are retried inside the transaction runner and only reach callers
//! as [`MetaError::Io`] once the retry budget is spent.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum MetaError {
    #[error("no such file or directory")]
    NotFound,

    #[error("file exists")]
    Exists,

    #[error("not a directory")]
    NotDirectory,

    #[error("is a directory")]
    IsDirectory,

    #[error("directory not empty")]
    NotEmpty,

    #[error("permission denied")]
    Access,

    #[error("operation not permitted")]
    NotPermitted,

    #[error("invalid argument")]
    Invalid,

    #[error("resource temporarily unavailable")]
    Again,

    #[error("broken pipe")]
    BrokenPipe,

    #[error("operation not supported")]
    NotSupported,

    #[error("no such attribute")]
    NoAttr,

    #[error("interrupted")]
    Interrupted,

    #[error("invalid volume format: {0}")]
    BadFormat(String),

    #[error("i/o error: {0}")]
    Io(String),
}

impl MetaError {
    /// The errno the kernel bridge should reply with.
    pub fn errno(&self) -> i32 {
        match self {
            MetaError::NotFound => libc::ENOENT,
            MetaError::Exists => libc::EEXIST,
            MetaError::NotDirectory => libc::ENOTDIR,
            MetaError::IsDirectory => libc::EISDIR,
            MetaError::NotEmpty => libc::ENOTEMPTY,
            MetaError::Access => libc::EACCES,
            MetaError::NotPermitted => libc::EPERM,
            MetaError::Invalid => libc::EINVAL,
            MetaError::Again => libc::EAGAIN,
            MetaError::BrokenPipe => libc::EPIPE,
            MetaError::NotSupported => libc::ENOTSUP,
            MetaError::NoAttr => libc::ENODATA,
            MetaError::Interrupted => libc::EINTR,
            MetaError::BadFormat(_) | MetaError::Io(_) => libc::EIO,
        }
    }
}

impl From<redis::RedisError> for MetaError {
    fn from(err: redis::RedisError) -> Self {
        MetaError::Io(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping() {
        assert_eq!(MetaError::NotFound.errno(), libc::ENOENT);
        assert_eq!(MetaError::NotEmpty.errno(), libc::ENOTEMPTY);
        assert_eq!(MetaError::NoAttr.errno(), libc::ENODATA);
        assert_eq!(MetaError::Io("gone".into()).errno(), libc::EIO);
    }
}
