//! Device objects
//!
//! A [`Device`] is a reference-counted native device with its descriptor
//! cached at construction time and configuration descriptors fetched lazily.
//! It does not represent an open session; call [`Device::open`] for that.

use crate::context::Context;
use crate::descriptors::{ConfigDescriptor, DeviceDescriptor};
use crate::error::{Error, Result, check};
use crate::handle::DeviceHandle;
use libusb1_sys as usbffi;
use libusb1_sys::constants::*;
use std::collections::HashMap;
use std::ptr::{self, NonNull};
use std::sync::{Arc, Mutex};

/// Negotiated connection speed of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Speed {
    Unknown,
    Low,
    Full,
    High,
    Super,
    SuperPlus,
}

fn map_speed(native: libc::c_int) -> Speed {
    match native {
        x if x == LIBUSB_SPEED_LOW as libc::c_int => Speed::Low,
        x if x == LIBUSB_SPEED_FULL as libc::c_int => Speed::Full,
        x if x == LIBUSB_SPEED_HIGH as libc::c_int => Speed::High,
        x if x == LIBUSB_SPEED_SUPER as libc::c_int => Speed::Super,
        x if x == LIBUSB_SPEED_SUPER_PLUS as libc::c_int => Speed::SuperPlus,
        _ => Speed::Unknown,
    }
}

struct DeviceInner {
    context: Context,
    ptr: NonNull<usbffi::libusb_device>,
    descriptor: DeviceDescriptor,
    configs: Mutex<HashMap<u8, Arc<ConfigDescriptor>>>,
}

// SAFETY: the native device is only a descriptor-cache handle; libusb allows
// referencing and querying it from any thread.
unsafe impl Send for DeviceInner {}
unsafe impl Sync for DeviceInner {}

impl Drop for DeviceInner {
    fn drop(&mut self) {
        unsafe { usbffi::libusb_unref_device(self.ptr.as_ptr()) };
    }
}

/// A USB device discovered through a [`Context`]. Cheap to clone; the native
/// reference is released when the last clone is dropped.
#[derive(Clone)]
pub struct Device {
    inner: Arc<DeviceInner>,
}

impl Device {
    /// Wrap a native device, taking a fresh native reference. Fails when the
    /// cached device descriptor cannot be read.
    pub(crate) fn from_raw(context: Context, raw: *mut usbffi::libusb_device) -> Result<Device> {
        let ptr = NonNull::new(raw).ok_or(Error::NoDevice)?;
        let mut raw_descriptor: usbffi::libusb_device_descriptor = unsafe { std::mem::zeroed() };
        check(unsafe { usbffi::libusb_get_device_descriptor(ptr.as_ptr(), &mut raw_descriptor) })?;
        unsafe { usbffi::libusb_ref_device(ptr.as_ptr()) };
        Ok(Device {
            inner: Arc::new(DeviceInner {
                context,
                ptr,
                descriptor: DeviceDescriptor::from_raw(&raw_descriptor),
                configs: Mutex::new(HashMap::new()),
            }),
        })
    }

    pub(crate) fn raw(&self) -> *mut usbffi::libusb_device {
        self.inner.ptr.as_ptr()
    }

    pub fn context(&self) -> &Context {
        &self.inner.context
    }

    /// Number of the bus the device is attached to.
    pub fn bus_number(&self) -> u8 {
        unsafe { usbffi::libusb_get_bus_number(self.raw()) }
    }

    /// Address of the device on its bus. Addresses are reused after
    /// re-enumeration, so they do not identify a device on their own.
    pub fn address(&self) -> u8 {
        unsafe { usbffi::libusb_get_device_address(self.raw()) }
    }

    /// Number of the hub port the device is plugged into, 0 when unknown.
    pub fn port_number(&self) -> u8 {
        unsafe { usbffi::libusb_get_port_number(self.raw()) }
    }

    pub fn speed(&self) -> Speed {
        map_speed(unsafe { usbffi::libusb_get_device_speed(self.raw()) })
    }

    /// The device descriptor cached at construction time.
    pub fn device_descriptor(&self) -> &DeviceDescriptor {
        &self.inner.descriptor
    }

    /// Fetch (and cache) the configuration descriptor at `index`. For a
    /// departed device this fails with [`Error::NoDevice`] or
    /// [`Error::NotFound`] depending on the platform.
    pub fn config_descriptor(&self, index: u8) -> Result<Arc<ConfigDescriptor>> {
        if let Some(config) = self.inner.configs.lock().unwrap().get(&index) {
            return Ok(Arc::clone(config));
        }
        let mut raw: *const usbffi::libusb_config_descriptor = ptr::null();
        check(unsafe { usbffi::libusb_get_config_descriptor(self.raw(), index, &mut raw) })?;
        let config = unsafe {
            let copied = ConfigDescriptor::from_raw(&*raw);
            usbffi::libusb_free_config_descriptor(raw);
            copied
        };
        let config = Arc::new(config);
        self.inner
            .configs
            .lock()
            .unwrap()
            .insert(index, Arc::clone(&config));
        Ok(config)
    }

    /// Fetch the currently active configuration descriptor (not cached, since
    /// it can change behind our back).
    pub fn active_config_descriptor(&self) -> Result<ConfigDescriptor> {
        let mut raw: *const usbffi::libusb_config_descriptor = ptr::null();
        check(unsafe { usbffi::libusb_get_active_config_descriptor(self.raw(), &mut raw) })?;
        Ok(unsafe {
            let copied = ConfigDescriptor::from_raw(&*raw);
            usbffi::libusb_free_config_descriptor(raw);
            copied
        })
    }

    /// Open a session on this device.
    pub fn open(&self) -> Result<DeviceHandle> {
        let mut handle: *mut usbffi::libusb_device_handle = ptr::null_mut();
        check(unsafe { usbffi::libusb_open(self.raw(), &mut handle) })?;
        let handle = NonNull::new(handle).ok_or(Error::NoDevice)?;
        Ok(DeviceHandle::from_parts(self.clone(), handle))
    }
}

impl PartialEq for Device {
    /// Device identity: same context, bus, address and descriptor ids. The
    /// address alone is not enough because buses reuse addresses after
    /// re-enumeration.
    fn eq(&self, other: &Device) -> bool {
        self.inner.context == other.inner.context
            && self.bus_number() == other.bus_number()
            && self.address() == other.address()
            && self.inner.descriptor.vendor_id() == other.inner.descriptor.vendor_id()
            && self.inner.descriptor.product_id() == other.inner.descriptor.product_id()
    }
}

impl Eq for Device {}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("bus", &self.bus_number())
            .field("address", &self.address())
            .field("vendor_id", &self.inner.descriptor.vendor_id())
            .field("product_id", &self.inner.descriptor.product_id())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_speed() {
        assert_eq!(map_speed(LIBUSB_SPEED_LOW as libc::c_int), Speed::Low);
        assert_eq!(map_speed(LIBUSB_SPEED_FULL as libc::c_int), Speed::Full);
        assert_eq!(map_speed(LIBUSB_SPEED_HIGH as libc::c_int), Speed::High);
        assert_eq!(map_speed(LIBUSB_SPEED_SUPER as libc::c_int), Speed::Super);
        assert_eq!(
            map_speed(LIBUSB_SPEED_SUPER_PLUS as libc::c_int),
            Speed::SuperPlus
        );
        assert_eq!(map_speed(-3), Speed::Unknown);
    }
}
