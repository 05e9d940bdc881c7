//! Error types for the malidrm library

use std::io;
use thiserror::Error;

/// Main error type for driver operations
///
/// Every variant maps onto the negative errno the host framework expects,
/// see [`DriverError::to_errno`].
#[derive(Error, Debug)]
pub enum DriverError {
    /// Allocation of driver-private state failed
    #[error("Out of memory allocating {0}")]
    OutOfMemory(&'static str),

    /// No device, or no usable component, was found
    #[error("No such device: {0}")]
    NoDevice(String),

    /// Invalid argument passed to a driver entry point
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The caller lacks the rights required by an ioctl
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// A handle table has no free handle left in its range
    #[error("No free handle in range {min}..={max}")]
    NoSpace {
        /// Lowest handle of the exhausted range
        min: u32,
        /// Highest handle of the exhausted range
        max: u32,
    },

    /// A resource is already in use
    #[error("Resource busy: {0}")]
    Busy(String),

    /// Failure reported by the host framework, carried verbatim
    #[error("Host call {call} failed with errno {errno}")]
    Host {
        /// Name of the failing host service
        call: &'static str,
        /// Negative errno returned by the host
        errno: i32,
    },

    /// Board description could not be read
    #[error("Config error: {0}")]
    Config(#[from] io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl DriverError {
    /// Negative errno for this error, as returned to the host framework
    pub fn to_errno(&self) -> i32 {
        match self {
            DriverError::OutOfMemory(_) => -libc::ENOMEM,
            DriverError::NoDevice(_) => -libc::ENODEV,
            DriverError::InvalidArgument(_) => -libc::EINVAL,
            DriverError::PermissionDenied(_) => -libc::EACCES,
            DriverError::NoSpace { .. } => -libc::ENOSPC,
            DriverError::Busy(_) => -libc::EBUSY,
            DriverError::Host { errno, .. } => *errno,
            DriverError::Config(err) => -err.raw_os_error().unwrap_or(libc::EIO),
            DriverError::Json(_) => -libc::EINVAL,
        }
    }

    /// Wrap a negative errno returned by a host service
    pub fn from_errno(call: &'static str, errno: i32) -> Self {
        match -errno {
            libc::ENOMEM => DriverError::OutOfMemory(call),
            _ => DriverError::Host { call, errno },
        }
    }
}

/// Result type for driver operations
pub type DriverResult<T> = std::result::Result<T, DriverError>;

/// Collapse a driver result into the status code a C-style host expects
pub fn to_status<T>(result: &DriverResult<T>) -> i32 {
    match result {
        Ok(_) => 0,
        Err(err) => err.to_errno(),
    }
}
