//! Open device sessions
//!
//! A [`DeviceHandle`] owns one open native handle and the set of transfers
//! currently in flight against it. Closing the handle (explicitly or by
//! dropping it) cancels every in-flight transfer and drives the blocking
//! event call until each one has reported a terminal status, only then
//! releasing the native handle.

use crate::descriptors::ConfigDescriptor;
use crate::device::Device;
use crate::error::{Error, Result, check};
use crate::fields::Direction;
use crate::transfer::{Transfer, TransferCore};
use libc::{c_int, c_uint};
use libusb1_sys as usbffi;
use std::collections::{HashMap, HashSet};
use std::ptr::NonNull;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, warn};

/// Shared core of an open session: the native handle pointer and the
/// in-flight transfer set. Transfers hold a reference to this so that the
/// set can be maintained from completion dispatch even after the public
/// handle was dropped.
pub(crate) struct HandleCore {
    ptr: Mutex<Option<NonNull<usbffi::libusb_device_handle>>>,
    in_flight: Mutex<HashMap<usize, Arc<TransferCore>>>,
}

// SAFETY: the native handle may be used from any thread; interior state is
// lock-protected.
unsafe impl Send for HandleCore {}
unsafe impl Sync for HandleCore {}

impl HandleCore {
    fn new(ptr: NonNull<usbffi::libusb_device_handle>) -> Arc<HandleCore> {
        Arc::new(HandleCore {
            ptr: Mutex::new(Some(ptr)),
            in_flight: Mutex::new(HashMap::new()),
        })
    }

    /// The native handle, or [`Error::NoDevice`] once the session is closed.
    pub(crate) fn raw(&self) -> Result<*mut usbffi::libusb_device_handle> {
        self.ptr
            .lock()
            .unwrap()
            .map(|ptr| ptr.as_ptr())
            .ok_or(Error::NoDevice)
    }

    pub(crate) fn track(&self, key: usize, core: Arc<TransferCore>) {
        self.in_flight.lock().unwrap().insert(key, core);
    }

    pub(crate) fn untrack(&self, key: usize) {
        self.in_flight.lock().unwrap().remove(&key);
    }

    fn in_flight_snapshot(&self) -> Vec<(usize, Arc<TransferCore>)> {
        self.in_flight
            .lock()
            .unwrap()
            .iter()
            .map(|(&key, core)| (key, Arc::clone(core)))
            .collect()
    }

    fn in_flight_is_empty(&self) -> bool {
        self.in_flight.lock().unwrap().is_empty()
    }

    /// Detached core for exercising the transfer state machine without an
    /// open device. The placeholder pointer is never dereferenced as long as
    /// nothing is submitted.
    #[cfg(test)]
    pub(crate) fn detached() -> Arc<HandleCore> {
        Arc::new(HandleCore {
            ptr: Mutex::new(Some(NonNull::dangling())),
            in_flight: Mutex::new(HashMap::new()),
        })
    }
}

/// An open session on a USB device.
pub struct DeviceHandle {
    core: Arc<HandleCore>,
    device: Device,
}

impl DeviceHandle {
    pub(crate) fn from_parts(
        device: Device,
        ptr: NonNull<usbffi::libusb_device_handle>,
    ) -> DeviceHandle {
        DeviceHandle {
            core: HandleCore::new(ptr),
            device,
        }
    }

    /// The device this handle was opened from, for descriptor re-reads.
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Allocate a fresh transfer bound to this handle, with `iso_packets`
    /// isochronous packet slots (0 for the other transfer kinds).
    pub fn alloc_transfer(
        &self,
        iso_packets: usize,
        short_is_error: bool,
        add_zero_packet: bool,
    ) -> Result<Transfer> {
        // Fail early instead of handing out a transfer bound to a dead
        // session.
        self.core.raw()?;
        Transfer::alloc(
            Arc::clone(&self.core),
            iso_packets,
            short_is_error,
            add_zero_packet,
        )
    }

    /// Close the session: cancel every in-flight transfer (tolerating the
    /// cancellation races where the transfer already completed or the device
    /// is gone), drive event handling until the in-flight set drains, then
    /// release the native handle.
    ///
    /// This blocks until all completions have been dispatched. If the calling
    /// thread is also the only thread driving the event loop, that dispatch
    /// can only happen here; but if another thread is blocked inside the
    /// event-handling call, this can wait on it indefinitely. Do not close a
    /// handle with in-flight transfers from a thread the event loop depends
    /// on elsewhere.
    pub fn close(mut self) -> Result<()> {
        self.close_internal()
    }

    fn close_internal(&mut self) -> Result<()> {
        let Some(ptr) = self.core.ptr.lock().unwrap().take() else {
            return Ok(());
        };

        let mut result = Ok(());
        let mut cancelled: HashSet<usize> = HashSet::new();
        while !self.core.in_flight_is_empty() {
            for (key, core) in self.core.in_flight_snapshot() {
                if !cancelled.insert(key) {
                    continue;
                }
                let transfer = Transfer { core };
                match transfer.cancel() {
                    Ok(()) => debug!("cancelled in-flight transfer {:#x}", key),
                    // Completion already landed, or the device is gone and
                    // the terminal status is on its way.
                    Err(Error::NotFound) | Err(Error::NoDevice) => {}
                    Err(e) => warn!("failed to cancel in-flight transfer {:#x}: {}", key, e),
                }
            }
            if let Err(e) = self
                .device
                .context()
                .drive_events_until(|| self.core.in_flight_is_empty())
            {
                // The handle is already unusable; release it regardless so
                // the native session is not leaked.
                warn!("event handling failed while draining in-flight transfers: {}", e);
                result = Err(e);
                break;
            }
        }

        debug!("closing device handle {:p}", ptr.as_ptr());
        unsafe { usbffi::libusb_close(ptr.as_ptr()) };
        result
    }

    /// Active configuration value, 0 if the device is unconfigured.
    pub fn configuration(&self) -> Result<u8> {
        let mut config: c_int = 0;
        check(unsafe { usbffi::libusb_get_configuration(self.core.raw()?, &mut config) })?;
        Ok(config as u8)
    }

    /// Select the active configuration.
    pub fn set_configuration(&self, configuration: u8) -> Result<()> {
        check(unsafe {
            usbffi::libusb_set_configuration(self.core.raw()?, configuration as c_int)
        })?;
        Ok(())
    }

    /// The active configuration descriptor of the underlying device.
    pub fn active_config_descriptor(&self) -> Result<ConfigDescriptor> {
        self.device.active_config_descriptor()
    }

    pub fn claim_interface(&self, interface: u8) -> Result<()> {
        check(unsafe { usbffi::libusb_claim_interface(self.core.raw()?, interface as c_int) })?;
        debug!("claimed interface {}", interface);
        Ok(())
    }

    pub fn release_interface(&self, interface: u8) -> Result<()> {
        check(unsafe { usbffi::libusb_release_interface(self.core.raw()?, interface as c_int) })?;
        debug!("released interface {}", interface);
        Ok(())
    }

    pub fn set_interface_alt_setting(&self, interface: u8, alt_setting: u8) -> Result<()> {
        check(unsafe {
            usbffi::libusb_set_interface_alt_setting(
                self.core.raw()?,
                interface as c_int,
                alt_setting as c_int,
            )
        })?;
        Ok(())
    }

    /// Clear the halt/stall condition of an endpoint.
    pub fn clear_halt(&self, endpoint: u8) -> Result<()> {
        check(unsafe { usbffi::libusb_clear_halt(self.core.raw()?, endpoint) })?;
        Ok(())
    }

    /// Perform a USB port reset on the device.
    pub fn reset(&self) -> Result<()> {
        check(unsafe { usbffi::libusb_reset_device(self.core.raw()?) })?;
        debug!("reset device");
        Ok(())
    }

    /// Whether a kernel driver is attached to `interface`.
    pub fn kernel_driver_active(&self, interface: u8) -> Result<bool> {
        let rc = check(unsafe {
            usbffi::libusb_kernel_driver_active(self.core.raw()?, interface as c_int)
        })?;
        Ok(rc != 0)
    }

    pub fn detach_kernel_driver(&self, interface: u8) -> Result<()> {
        check(unsafe {
            usbffi::libusb_detach_kernel_driver(self.core.raw()?, interface as c_int)
        })?;
        Ok(())
    }

    pub fn attach_kernel_driver(&self, interface: u8) -> Result<()> {
        check(unsafe {
            usbffi::libusb_attach_kernel_driver(self.core.raw()?, interface as c_int)
        })?;
        Ok(())
    }

    /// Have the driver detach and reattach kernel drivers around interface
    /// claims automatically.
    pub fn set_auto_detach_kernel_driver(&self, enable: bool) -> Result<()> {
        check(unsafe {
            usbffi::libusb_set_auto_detach_kernel_driver(self.core.raw()?, enable as c_int)
        })?;
        Ok(())
    }

    /// Read a string descriptor in its ASCII form.
    pub fn read_string_descriptor_ascii(&self, index: u8) -> Result<String> {
        let mut buffer = vec![0u8; 255];
        let length = check(unsafe {
            usbffi::libusb_get_string_descriptor_ascii(
                self.core.raw()?,
                index,
                buffer.as_mut_ptr(),
                buffer.len() as c_int,
            )
        })?;
        buffer.truncate(length as usize);
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }

    /// Blocking control transfer reading into `data`; returns the number of
    /// bytes received. `request_type` must have the IN direction bit set.
    pub fn control_read(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        data: &mut [u8],
        timeout: Duration,
    ) -> Result<usize> {
        require_direction(request_type, Direction::In)?;
        let transferred = check(unsafe {
            usbffi::libusb_control_transfer(
                self.core.raw()?,
                request_type,
                request,
                value,
                index,
                data.as_mut_ptr(),
                data.len().min(u16::MAX as usize) as u16,
                timeout.as_millis() as c_uint,
            )
        })?;
        Ok(transferred as usize)
    }

    /// Blocking control transfer sending `data`; returns the number of bytes
    /// sent. `request_type` must have the OUT direction bit clear.
    pub fn control_write(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize> {
        require_direction(request_type, Direction::Out)?;
        if data.len() > u16::MAX as usize {
            return Err(Error::InvalidParam);
        }
        let transferred = check(unsafe {
            usbffi::libusb_control_transfer(
                self.core.raw()?,
                request_type,
                request,
                value,
                index,
                data.as_ptr() as *mut u8,
                data.len() as u16,
                timeout.as_millis() as c_uint,
            )
        })?;
        Ok(transferred as usize)
    }

    /// Blocking bulk read from an IN endpoint; returns the number of bytes
    /// received.
    pub fn bulk_read(&self, endpoint: u8, data: &mut [u8], timeout: Duration) -> Result<usize> {
        require_direction(endpoint, Direction::In)?;
        self.stream_transfer(endpoint, data.as_mut_ptr(), data.len(), timeout, false)
    }

    /// Blocking bulk write to an OUT endpoint; returns the number of bytes
    /// sent.
    pub fn bulk_write(&self, endpoint: u8, data: &[u8], timeout: Duration) -> Result<usize> {
        require_direction(endpoint, Direction::Out)?;
        self.stream_transfer(endpoint, data.as_ptr() as *mut u8, data.len(), timeout, false)
    }

    /// Blocking interrupt read from an IN endpoint; returns the number of
    /// bytes received.
    pub fn interrupt_read(
        &self,
        endpoint: u8,
        data: &mut [u8],
        timeout: Duration,
    ) -> Result<usize> {
        require_direction(endpoint, Direction::In)?;
        self.stream_transfer(endpoint, data.as_mut_ptr(), data.len(), timeout, true)
    }

    /// Blocking interrupt write to an OUT endpoint; returns the number of
    /// bytes sent.
    pub fn interrupt_write(&self, endpoint: u8, data: &[u8], timeout: Duration) -> Result<usize> {
        require_direction(endpoint, Direction::Out)?;
        self.stream_transfer(endpoint, data.as_ptr() as *mut u8, data.len(), timeout, true)
    }

    fn stream_transfer(
        &self,
        endpoint: u8,
        data: *mut u8,
        length: usize,
        timeout: Duration,
        interrupt: bool,
    ) -> Result<usize> {
        let mut transferred: c_int = 0;
        let rc = unsafe {
            if interrupt {
                usbffi::libusb_interrupt_transfer(
                    self.core.raw()?,
                    endpoint,
                    data,
                    length as c_int,
                    &mut transferred,
                    timeout.as_millis() as c_uint,
                )
            } else {
                usbffi::libusb_bulk_transfer(
                    self.core.raw()?,
                    endpoint,
                    data,
                    length as c_int,
                    &mut transferred,
                    timeout.as_millis() as c_uint,
                )
            }
        };
        if rc < 0 {
            let error = Error::from_code(rc);
            if transferred > 0 {
                debug!(
                    "transfer on endpoint {:#04x} failed after {} bytes: {}",
                    endpoint, transferred, error
                );
            }
            return Err(error);
        }
        Ok(transferred as usize)
    }
}

/// Reject a transfer whose endpoint address or request-type byte does not
/// carry the expected direction bit, before any native call is made.
fn require_direction(address: u8, expected: Direction) -> Result<()> {
    if Direction::from_address(address) != expected {
        return Err(Error::InvalidParam);
    }
    Ok(())
}

impl Drop for DeviceHandle {
    fn drop(&mut self) {
        if let Err(e) = self.close_internal() {
            warn!("error while closing device handle: {}", e);
        }
    }
}

impl std::fmt::Debug for DeviceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceHandle")
            .field("device", &self.device)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::Payload;

    #[test]
    fn test_direction_validation() {
        // Read calls require the IN bit, write calls require it clear.
        assert_eq!(require_direction(0x81, Direction::In), Ok(()));
        assert_eq!(require_direction(0x01, Direction::Out), Ok(()));
        assert_eq!(require_direction(0x01, Direction::In), Err(Error::InvalidParam));
        assert_eq!(require_direction(0x81, Direction::Out), Err(Error::InvalidParam));
        // Control request-type bytes follow the same bit.
        assert_eq!(require_direction(0xc0, Direction::In), Ok(()));
        assert_eq!(require_direction(0x40, Direction::In), Err(Error::InvalidParam));
    }

    #[test]
    fn test_in_flight_tracking() {
        let core = HandleCore::detached();
        let transfer = Transfer::alloc(Arc::clone(&core), 0, false, false).unwrap();
        transfer
            .set_bulk(0x01, Payload::Size(8), Duration::from_millis(10))
            .unwrap();
        let key = transfer.core.native_addr().unwrap();

        assert!(core.in_flight_is_empty());
        core.track(key, Arc::clone(&transfer.core));
        assert!(!core.in_flight_is_empty());
        assert_eq!(core.in_flight_snapshot().len(), 1);
        core.untrack(key);
        assert!(core.in_flight_is_empty());
    }
}
