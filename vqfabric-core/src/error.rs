//! Semantic error taxonomy (spec.md section 7). Each variant maps to exactly
//! one of the error kinds the spec calls out, independent of any particular
//! OS error representation.

use errno::Errno;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DriverError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("bus fault: {0}")]
    BusFault(String),

    #[error("node not initialized")]
    NotReady,

    #[error("node is resetting, close and retry")]
    Unclean,

    #[error("node already open")]
    Busy,

    #[error("operation not permitted: {0}")]
    Perm(String),

    #[error("would block, retry")]
    Again,

    #[error("resource exhausted: {0}")]
    NoMem(String),

    #[error("no free device number")]
    NoDev,

    #[error("peer incompatible or absent: {0}")]
    OpNotSupp(String),

    #[error("user buffer copy failed")]
    Fault,

    #[error("transport io error: {0}")]
    Io(String),
}

impl DriverError {
    /// POSIX errno this variant is surfaced as at the ioctl boundary
    /// (spec.md section 6's per-command "Reject with" column).
    pub fn errno(&self) -> Errno {
        let raw = match self {
            DriverError::InvalidArgument(_) => libc::EINVAL,
            DriverError::BusFault(_) => libc::EIO,
            DriverError::NotReady => libc::ENODEV,
            DriverError::Unclean => libc::EUCLEAN,
            DriverError::Busy => libc::EBUSY,
            DriverError::Perm(_) => libc::EPERM,
            DriverError::Again => libc::EAGAIN,
            DriverError::NoMem(_) => libc::ENOMEM,
            DriverError::NoDev => libc::ENODEV,
            DriverError::OpNotSupp(_) => libc::EOPNOTSUPP,
            DriverError::Fault => libc::EFAULT,
            DriverError::Io(_) => libc::ENOLINK,
        };
        Errno(raw)
    }
}

pub type Result<T> = std::result::Result<T, DriverError>;
