//! Error types
//!
//! Every failure surfaced by this crate is one of three kinds: a driver error
//! (one variant per negative libusb status code, produced by the static
//! [`Error::from_code`] mapping), a local usage error (raised before any
//! native call is made), or a resource error (native allocation failure,
//! reported as [`Error::NoMem`]).

use libusb1_sys::constants::*;
use std::os::raw::c_int;
use thiserror::Error;

/// Errors returned by this crate.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// Input/output error reported by the driver
    #[error("input/output error")]
    Io,

    /// The driver rejected a parameter value
    #[error("invalid parameter")]
    InvalidParam,

    /// Access denied (insufficient permissions)
    #[error("access denied (insufficient permissions)")]
    Access,

    /// No such device (it may have been disconnected)
    #[error("no such device (it may have been disconnected)")]
    NoDevice,

    /// Entity not found
    #[error("entity not found")]
    NotFound,

    /// Resource busy
    #[error("resource busy")]
    Busy,

    /// Operation timed out
    #[error("operation timed out")]
    Timeout,

    /// Overflow
    #[error("overflow")]
    Overflow,

    /// Pipe error (control request not supported, or endpoint halted)
    #[error("pipe error")]
    Pipe,

    /// System call interrupted (perhaps due to signal)
    #[error("system call interrupted")]
    Interrupted,

    /// Insufficient memory
    #[error("insufficient memory")]
    NoMem,

    /// Operation not supported or unimplemented on this platform
    #[error("operation not supported or unimplemented on this platform")]
    NotSupported,

    /// A negative status code without a dedicated variant
    #[error("driver error (code {0})")]
    Other(i32),

    /// An operation was attempted in a state that forbids it, before any
    /// native call was made
    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    /// The transfer was doomed and refuses configuration and submission
    #[error("transfer is doomed and cannot be reused")]
    Doomed,

    /// Isochronous configuration of a transfer allocated without isochronous
    /// packet slots
    #[error("transfer was allocated without isochronous packet slots")]
    NotIsochronous,

    /// A caller-supplied value failed validation before any native call
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl Error {
    /// Map a negative native status code to its error kind.
    pub fn from_code(code: c_int) -> Error {
        match code {
            LIBUSB_ERROR_IO => Error::Io,
            LIBUSB_ERROR_INVALID_PARAM => Error::InvalidParam,
            LIBUSB_ERROR_ACCESS => Error::Access,
            LIBUSB_ERROR_NO_DEVICE => Error::NoDevice,
            LIBUSB_ERROR_NOT_FOUND => Error::NotFound,
            LIBUSB_ERROR_BUSY => Error::Busy,
            LIBUSB_ERROR_TIMEOUT => Error::Timeout,
            LIBUSB_ERROR_OVERFLOW => Error::Overflow,
            LIBUSB_ERROR_PIPE => Error::Pipe,
            LIBUSB_ERROR_INTERRUPTED => Error::Interrupted,
            LIBUSB_ERROR_NO_MEM => Error::NoMem,
            LIBUSB_ERROR_NOT_SUPPORTED => Error::NotSupported,
            other => Error::Other(other),
        }
    }
}

/// Type alias for results produced by this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Turn a native return code into `Ok(code)` or the mapped driver error.
pub(crate) fn check(code: c_int) -> Result<c_int> {
    if code < 0 {
        Err(Error::from_code(code))
    } else {
        Ok(code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_code_covers_documented_codes() {
        assert_eq!(Error::from_code(LIBUSB_ERROR_IO), Error::Io);
        assert_eq!(Error::from_code(LIBUSB_ERROR_INVALID_PARAM), Error::InvalidParam);
        assert_eq!(Error::from_code(LIBUSB_ERROR_ACCESS), Error::Access);
        assert_eq!(Error::from_code(LIBUSB_ERROR_NO_DEVICE), Error::NoDevice);
        assert_eq!(Error::from_code(LIBUSB_ERROR_NOT_FOUND), Error::NotFound);
        assert_eq!(Error::from_code(LIBUSB_ERROR_BUSY), Error::Busy);
        assert_eq!(Error::from_code(LIBUSB_ERROR_TIMEOUT), Error::Timeout);
        assert_eq!(Error::from_code(LIBUSB_ERROR_OVERFLOW), Error::Overflow);
        assert_eq!(Error::from_code(LIBUSB_ERROR_PIPE), Error::Pipe);
        assert_eq!(Error::from_code(LIBUSB_ERROR_INTERRUPTED), Error::Interrupted);
        assert_eq!(Error::from_code(LIBUSB_ERROR_NO_MEM), Error::NoMem);
        assert_eq!(Error::from_code(LIBUSB_ERROR_NOT_SUPPORTED), Error::NotSupported);
    }

    #[test]
    fn test_from_code_unknown_is_preserved() {
        assert_eq!(Error::from_code(-1000), Error::Other(-1000));
    }

    #[test]
    fn test_check() {
        assert_eq!(check(0), Ok(0));
        assert_eq!(check(17), Ok(17));
        assert_eq!(check(LIBUSB_ERROR_TIMEOUT), Err(Error::Timeout));
    }

    #[test]
    fn test_error_display() {
        let msg = format!("{}", Error::NoDevice);
        assert!(msg.contains("no such device"));
        let msg = format!("{}", Error::InvalidState("cannot alter a submitted transfer"));
        assert!(msg.contains("submitted"));
    }
}
