//! Driver context
//!
//! A [`Context`] owns one native libusb context: the device list, the event
//! machinery, the poll-fd notification queue and every hotplug registration
//! made through it. Creation goes through [`ContextBuilder`] so that all
//! native options are applied in one explicit open step; teardown happens
//! when the last clone is dropped.

use crate::device::Device;
use crate::error::{Error, Result, check};
use crate::ffi;
use crate::handle::DeviceHandle;
use crate::hotplug::HotplugTrampoline;
use libc::{c_char, c_int, c_short, c_void};
use libusb1_sys as usbffi;
use std::collections::HashMap;
use std::ffi::CStr;
use std::os::unix::io::RawFd;
use std::ptr::{self, NonNull};
use std::sync::{Arc, LazyLock, Mutex, Weak};
use std::time::Duration;
use tracing::{debug, warn};

/// Message verbosity applied to a context at open time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    None,
    Error,
    Warning,
    Info,
    Debug,
}

impl LogLevel {
    fn as_native(self) -> c_int {
        match self {
            LogLevel::None => 0,
            LogLevel::Error => 1,
            LogLevel::Warning => 2,
            LogLevel::Info => 3,
            LogLevel::Debug => 4,
        }
    }
}

/// Callback invoked with every driver log line routed to this context.
pub type LogCallback = Box<dyn Fn(LogLevel, &str) + Send + Sync>;

/// Per-context log callbacks, keyed by native context address.
///
/// The native log callback entry point carries no user data, so dispatch has
/// to go through process-wide state. Entries are inserted by
/// [`ContextBuilder::open`] and removed on context teardown.
static LOG_CALLBACKS: LazyLock<Mutex<HashMap<usize, Arc<LogCallback>>>> =
    LazyLock::new(Default::default);

extern "system" fn log_trampoline(
    ctx: *mut usbffi::libusb_context,
    level: c_int,
    message: *const c_char,
) {
    let callback = LOG_CALLBACKS.lock().unwrap().get(&(ctx as usize)).cloned();
    let Some(callback) = callback else { return };
    if message.is_null() {
        return;
    }
    let text = unsafe { CStr::from_ptr(message) }.to_string_lossy();
    let level = match level {
        1 => LogLevel::Error,
        2 => LogLevel::Warning,
        3 => LogLevel::Info,
        4 => LogLevel::Debug,
        _ => LogLevel::None,
    };
    (*callback)(level, text.trim_end_matches('\n'));
}

/// A poll-fd set change reported by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FdChange {
    Added(RawFd, c_short),
    Removed(RawFd),
}

/// Queue of poll-fd notifications not yet applied to an external poller.
#[derive(Default)]
pub(crate) struct FdChangeQueue {
    changes: Mutex<Vec<FdChange>>,
}

extern "system" fn fd_added_trampoline(fd: c_int, events: c_short, user_data: *mut c_void) {
    let queue = unsafe { &*(user_data as *const FdChangeQueue) };
    queue.changes.lock().unwrap().push(FdChange::Added(fd, events));
}

extern "system" fn fd_removed_trampoline(fd: c_int, user_data: *mut c_void) {
    let queue = unsafe { &*(user_data as *const FdChangeQueue) };
    queue.changes.lock().unwrap().push(FdChange::Removed(fd));
}

/// Options applied to a context before it is opened.
#[derive(Default)]
pub struct ContextBuilder {
    log_level: Option<LogLevel>,
    log_callback: Option<LogCallback>,
    use_usbdk: bool,
    no_device_discovery: bool,
}

impl ContextBuilder {
    pub fn new() -> ContextBuilder {
        ContextBuilder::default()
    }

    /// Set the context's log level as soon as it is created. May have no
    /// effect depending on the driver's build options.
    pub fn log_level(mut self, level: LogLevel) -> ContextBuilder {
        self.log_level = Some(level);
        self
    }

    /// Route the context's log output to `callback` instead of stderr.
    pub fn log_callback(mut self, callback: LogCallback) -> ContextBuilder {
        self.log_callback = Some(callback);
        self
    }

    /// Windows only: use the UsbDk backend if available.
    pub fn use_usbdk(mut self) -> ContextBuilder {
        self.use_usbdk = true;
        self
    }

    /// Linux only: skip the device scan while initialising the library.
    /// Devices can then only be opened from file descriptors passed in by the
    /// platform.
    pub fn no_device_discovery(mut self) -> ContextBuilder {
        self.no_device_discovery = true;
        self
    }

    fn apply_options(&self, raw: NonNull<usbffi::libusb_context>) -> Result<()> {
        if let Some(level) = self.log_level {
            check(unsafe {
                ffi::libusb_set_option(raw.as_ptr(), ffi::LIBUSB_OPTION_LOG_LEVEL, level.as_native())
            })?;
        }
        if self.use_usbdk {
            check(unsafe { ffi::libusb_set_option(raw.as_ptr(), ffi::LIBUSB_OPTION_USE_USBDK) })?;
        }
        if self.no_device_discovery {
            check(unsafe {
                ffi::libusb_set_option(raw.as_ptr(), ffi::LIBUSB_OPTION_NO_DEVICE_DISCOVERY)
            })?;
        }
        Ok(())
    }

    /// Initialise the native context and apply every configured option.
    pub fn open(self) -> Result<Context> {
        let mut raw: *mut usbffi::libusb_context = ptr::null_mut();
        check(unsafe { usbffi::libusb_init(&mut raw) })?;
        let raw = NonNull::new(raw).ok_or(Error::Other(0))?;

        if let Err(e) = self.apply_options(raw) {
            unsafe { usbffi::libusb_exit(raw.as_ptr()) };
            return Err(e);
        }
        if let Some(callback) = self.log_callback {
            LOG_CALLBACKS
                .lock()
                .unwrap()
                .insert(raw.as_ptr() as usize, Arc::new(callback));
            unsafe {
                ffi::libusb_set_log_cb(raw.as_ptr(), log_trampoline, ffi::LIBUSB_LOG_CB_CONTEXT);
            }
        }

        let inner = Arc::new(ContextInner {
            ptr: raw,
            fd_changes: FdChangeQueue::default(),
            hotplug: Mutex::new(HashMap::new()),
        });

        // The queue lives inside the pinned Arc allocation, so its address is
        // stable until libusb_exit runs in ContextInner::drop.
        unsafe {
            ffi::libusb_set_pollfd_notifiers(
                raw.as_ptr(),
                fd_added_trampoline,
                fd_removed_trampoline,
                &inner.fd_changes as *const FdChangeQueue as *mut c_void,
            );
        }

        debug!("opened libusb context at {:p}", raw.as_ptr());
        Ok(Context { inner })
    }
}

pub(crate) struct ContextInner {
    ptr: NonNull<usbffi::libusb_context>,
    fd_changes: FdChangeQueue,
    pub(crate) hotplug: Mutex<HashMap<c_int, Arc<HotplugTrampoline>>>,
}

// SAFETY: the native context is documented as safe to use from any thread,
// and all interior state is lock-protected.
unsafe impl Send for ContextInner {}
unsafe impl Sync for ContextInner {}

impl Drop for ContextInner {
    fn drop(&mut self) {
        // Deregister every still-live hotplug registration before the context
        // goes away; the native layer would otherwise keep dangling callback
        // pointers until exit.
        let registrations: Vec<c_int> = self.hotplug.lock().unwrap().keys().copied().collect();
        for handle in registrations {
            unsafe { usbffi::libusb_hotplug_deregister_callback(self.ptr.as_ptr(), handle) };
        }
        self.hotplug.lock().unwrap().clear();
        LOG_CALLBACKS.lock().unwrap().remove(&(self.ptr.as_ptr() as usize));
        debug!("closing libusb context at {:p}", self.ptr.as_ptr());
        unsafe { usbffi::libusb_exit(self.ptr.as_ptr()) };
    }
}

/// An open driver context. Clones share the same native context; the native
/// context is released when the last clone is dropped.
#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

impl PartialEq for Context {
    fn eq(&self, other: &Context) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Context {}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context").field("ptr", &self.inner.ptr).finish()
    }
}

impl Context {
    /// Open a context with default options.
    pub fn new() -> Result<Context> {
        ContextBuilder::new().open()
    }

    pub fn builder() -> ContextBuilder {
        ContextBuilder::new()
    }

    pub(crate) fn raw(&self) -> *mut usbffi::libusb_context {
        self.inner.ptr.as_ptr()
    }

    pub(crate) fn inner(&self) -> &Arc<ContextInner> {
        &self.inner
    }

    pub(crate) fn downgrade(&self) -> Weak<ContextInner> {
        Arc::downgrade(&self.inner)
    }

    pub(crate) fn from_inner(inner: Arc<ContextInner>) -> Context {
        Context { inner }
    }

    /// Enumerate the devices currently attached to the system. Devices whose
    /// cached descriptor cannot be read are skipped with a warning.
    pub fn devices(&self) -> Result<Vec<Device>> {
        let mut list: *const *mut usbffi::libusb_device = ptr::null();
        let count = unsafe { usbffi::libusb_get_device_list(self.raw(), &mut list) };
        if count < 0 {
            return Err(Error::from_code(count as c_int));
        }

        let raw_devices = unsafe { std::slice::from_raw_parts(list, count as usize) };
        let mut devices = Vec::with_capacity(raw_devices.len());
        for &raw in raw_devices {
            match Device::from_raw(self.clone(), raw) {
                Ok(device) => devices.push(device),
                Err(e) => warn!("skipping device with unreadable descriptor: {}", e),
            }
        }

        // Each kept device took its own reference above.
        unsafe { usbffi::libusb_free_device_list(list, 1) };
        Ok(devices)
    }

    /// Open the first device matching `vendor_id`/`product_id`.
    ///
    /// Intended for test programs: the match is racy by nature and does not
    /// distinguish between several devices with the same ids.
    pub fn open_device_with_vid_pid(
        &self,
        vendor_id: u16,
        product_id: u16,
    ) -> Result<DeviceHandle> {
        for device in self.devices()? {
            let descriptor = device.device_descriptor();
            if descriptor.vendor_id() == vendor_id && descriptor.product_id() == product_id {
                return device.open();
            }
        }
        Err(Error::NotFound)
    }

    /// Handle any pending driver event, blocking until one arrives.
    pub fn handle_events(&self) -> Result<()> {
        check(unsafe { usbffi::libusb_handle_events(self.raw()) })?;
        Ok(())
    }

    /// Handle pending driver events, waiting at most `timeout`
    /// (`Duration::ZERO` performs a non-blocking drain).
    pub fn handle_events_timeout(&self, timeout: Duration) -> Result<()> {
        let tv = ffi::duration_to_timeval(timeout);
        check(unsafe { usbffi::libusb_handle_events_timeout(self.raw(), &tv) })?;
        Ok(())
    }

    /// Deadline of the next event the driver must handle itself, or `None`
    /// when it has nothing pending.
    pub fn next_timeout(&self) -> Result<Option<Duration>> {
        let mut tv = ffi::duration_to_timeval(Duration::ZERO);
        let rc = check(unsafe { ffi::libusb_get_next_timeout(self.raw(), &mut tv) })?;
        if rc == 0 {
            Ok(None)
        } else {
            Ok(Some(ffi::timeval_to_duration(tv)))
        }
    }

    /// Snapshot of the driver's current poll descriptor set.
    pub fn pollfds(&self) -> Result<Vec<(RawFd, c_short)>> {
        let list = unsafe { ffi::libusb_get_pollfds(self.raw()) };
        if list.is_null() {
            // Not supported on this platform.
            return Err(Error::NotSupported);
        }
        let mut fds = Vec::new();
        let mut cursor = list;
        unsafe {
            while !(*cursor).is_null() {
                let entry = &**cursor;
                fds.push((entry.fd, entry.events));
                cursor = cursor.add(1);
            }
            ffi::libusb_free_pollfds(list);
        }
        Ok(fds)
    }

    /// Drain the queued poll-fd set change notifications.
    pub(crate) fn take_fd_changes(&self) -> Vec<FdChange> {
        std::mem::take(&mut *self.inner.fd_changes.changes.lock().unwrap())
    }

    /// Repeatedly run the blocking event call until `until` holds, retrying
    /// when the call is interrupted by a signal.
    pub(crate) fn drive_events_until(&self, mut until: impl FnMut() -> bool) -> Result<()> {
        while !until() {
            match self.handle_events() {
                Ok(()) => {}
                Err(Error::Interrupted) => debug!("event handling interrupted, retrying"),
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

/// A feature the running driver build may or may not provide.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    /// The capability query itself.
    HasCapability,
    HasHotplug,
    HasHidAccess,
    SupportsDetachKernelDriver,
}

/// Ask the driver whether it supports `capability` on this platform.
pub fn has_capability(capability: Capability) -> bool {
    use libusb1_sys::constants::*;
    let native = match capability {
        Capability::HasCapability => LIBUSB_CAP_HAS_CAPABILITY,
        Capability::HasHotplug => LIBUSB_CAP_HAS_HOTPLUG,
        Capability::HasHidAccess => LIBUSB_CAP_HAS_HID_ACCESS,
        Capability::SupportsDetachKernelDriver => LIBUSB_CAP_SUPPORTS_DETACH_KERNEL_DRIVER,
    };
    unsafe { usbffi::libusb_has_capability(native as u32) != 0 }
}

/// Version of the linked driver library.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LibraryVersion {
    pub major: u16,
    pub minor: u16,
    pub micro: u16,
    pub nano: u16,
}

/// Query the version of the linked driver library.
pub fn library_version() -> LibraryVersion {
    let raw = unsafe { &*usbffi::libusb_get_version() };
    LibraryVersion {
        major: raw.major,
        minor: raw.minor,
        micro: raw.micro,
        nano: raw.nano,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_level_values() {
        assert_eq!(LogLevel::None.as_native(), 0);
        assert_eq!(LogLevel::Error.as_native(), 1);
        assert_eq!(LogLevel::Warning.as_native(), 2);
        assert_eq!(LogLevel::Info.as_native(), 3);
        assert_eq!(LogLevel::Debug.as_native(), 4);
    }

    #[test]
    fn test_fd_change_queue() {
        let queue = FdChangeQueue::default();
        queue.changes.lock().unwrap().push(FdChange::Added(7, 1));
        queue.changes.lock().unwrap().push(FdChange::Removed(7));
        let drained = std::mem::take(&mut *queue.changes.lock().unwrap());
        assert_eq!(drained, vec![FdChange::Added(7, 1), FdChange::Removed(7)]);
        assert!(queue.changes.lock().unwrap().is_empty());
    }
}
