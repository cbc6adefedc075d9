//! Supplemental libusb-1.0 declarations
//!
//! `libusb1-sys` covers most of the driver ABI. The entry points below are
//! declared here against the documented, versioned C interface: the poll-fd
//! integration surface and context options, with the exact signatures this
//! crate relies on.

#![allow(non_camel_case_types)]

use libc::{c_char, c_int, c_short, c_void, timeval};
use libusb1_sys::libusb_context;
use std::time::Duration;

/// Context option identifiers accepted by `libusb_set_option`.
pub const LIBUSB_OPTION_LOG_LEVEL: c_int = 0;
pub const LIBUSB_OPTION_USE_USBDK: c_int = 1;
pub const LIBUSB_OPTION_NO_DEVICE_DISCOVERY: c_int = 2;

/// Log callback mode: applies to one context only.
pub const LIBUSB_LOG_CB_CONTEXT: c_int = 1 << 1;

/// One entry of the driver's poll descriptor set.
#[repr(C)]
pub struct libusb_pollfd {
    pub fd: c_int,
    pub events: c_short,
}

pub type libusb_pollfd_added_cb =
    extern "system" fn(fd: c_int, events: c_short, user_data: *mut c_void);
pub type libusb_pollfd_removed_cb = extern "system" fn(fd: c_int, user_data: *mut c_void);
pub type libusb_log_cb =
    extern "system" fn(ctx: *mut libusb_context, level: c_int, message: *const c_char);

unsafe extern "system" {
    pub fn libusb_get_pollfds(ctx: *mut libusb_context) -> *const *mut libusb_pollfd;
    pub fn libusb_free_pollfds(pollfds: *const *mut libusb_pollfd);
    pub fn libusb_set_pollfd_notifiers(
        ctx: *mut libusb_context,
        added_cb: libusb_pollfd_added_cb,
        removed_cb: libusb_pollfd_removed_cb,
        user_data: *mut c_void,
    );
    pub fn libusb_get_next_timeout(ctx: *mut libusb_context, tv: *mut timeval) -> c_int;
    pub fn libusb_set_log_cb(ctx: *mut libusb_context, cb: libusb_log_cb, mode: c_int);
}

unsafe extern "C" {
    pub fn libusb_set_option(ctx: *mut libusb_context, option: c_int, ...) -> c_int;
}

/// Convert a duration to the `timeval` the event-handling calls expect.
pub fn duration_to_timeval(duration: Duration) -> timeval {
    timeval {
        tv_sec: duration.as_secs() as libc::time_t,
        tv_usec: duration.subsec_micros() as libc::suseconds_t,
    }
}

/// Convert a `timeval` produced by the driver back into a duration.
pub fn timeval_to_duration(tv: timeval) -> Duration {
    Duration::new(tv.tv_sec as u64, (tv.tv_usec as u32) * 1_000)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeval_round_trip() {
        let tv = duration_to_timeval(Duration::from_millis(1500));
        assert_eq!(tv.tv_sec, 1);
        assert_eq!(tv.tv_usec, 500_000);
        assert_eq!(timeval_to_duration(tv), Duration::from_millis(1500));
    }

    #[test]
    fn test_zero_timeval() {
        let tv = duration_to_timeval(Duration::ZERO);
        assert_eq!(tv.tv_sec, 0);
        assert_eq!(tv.tv_usec, 0);
    }
}
