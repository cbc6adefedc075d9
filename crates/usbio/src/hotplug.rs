//! Hotplug watcher
//!
//! Arrival/departure callbacks registered against a context. The context
//! retains every registration's trampoline until it is deregistered (or the
//! context is torn down), so the native layer never invokes a dangling
//! callback pointer. A callback may deregister itself by returning `true`;
//! that is the only form of deregistration allowed while dispatch is in
//! progress.

use crate::context::Context;
use crate::device::Device;
use crate::error::{Result, check};
use libc::{c_int, c_void};
use libusb1_sys as usbffi;
use libusb1_sys::constants::*;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use tracing::{debug, error, warn};

/// A device arrival or departure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HotplugEvent {
    Arrived,
    Left,
}

/// Callback invoked for each matching hotplug event, during event handling.
/// Returning `true` deregisters the callback; it is then never invoked again
/// for the same registration. The callback must not call back into event
/// handling or into synchronous transfer functions.
pub type HotplugCallback = Box<dyn FnMut(&Context, Device, HotplugEvent) -> bool + Send>;

/// Opaque handle identifying one hotplug registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HotplugRegistration {
    handle: c_int,
}

pub(crate) struct HotplugTrampoline {
    context: Weak<crate::context::ContextInner>,
    callback: Mutex<HotplugCallback>,
    /// Native handle, set once registration returns. Dispatch can run before
    /// that when existing devices are enumerated during registration.
    slot: OnceLock<c_int>,
    /// Set once the callback asked for deregistration; the callback is never
    /// invoked again afterwards, even for events already queued in the same
    /// event-handling pass.
    dead: AtomicBool,
}

extern "system" fn hotplug_dispatch(
    _ctx: *mut usbffi::libusb_context,
    device: *mut usbffi::libusb_device,
    event: c_int,
    user_data: *mut c_void,
) -> c_int {
    // SAFETY: user_data is the address of the trampoline kept alive by the
    // registering context (or by the registration call's own strong
    // reference while existing devices are enumerated). Take an extra strong
    // count for the duration of this dispatch so self-deregistration cannot
    // free it under us.
    let trampoline = unsafe {
        let raw = user_data as *const HotplugTrampoline;
        Arc::increment_strong_count(raw);
        Arc::from_raw(raw)
    };

    if trampoline.dead.load(Ordering::Acquire) {
        return 1;
    }
    let Some(inner) = trampoline.context.upgrade() else {
        // Context is being torn down; drop the registration.
        return 1;
    };
    let context = Context::from_inner(inner);

    let event = match event {
        x if x == LIBUSB_HOTPLUG_EVENT_DEVICE_ARRIVED as c_int => HotplugEvent::Arrived,
        x if x == LIBUSB_HOTPLUG_EVENT_DEVICE_LEFT as c_int => HotplugEvent::Left,
        other => {
            warn!("unknown hotplug event {}", other);
            return 0;
        }
    };

    // For a departed device configuration descriptors may no longer be
    // fetchable, but the cached device descriptor always is.
    let device = match Device::from_raw(context.clone(), device) {
        Ok(device) => device,
        Err(e) => {
            warn!("dropping hotplug event, device descriptor unreadable: {}", e);
            return 0;
        }
    };
    debug!("hotplug {:?}: {:?}", event, device);

    let mut callback = trampoline.callback.lock().unwrap();
    let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        (*callback)(&context, device, event)
    }));
    let deregister = match outcome {
        Ok(deregister) => deregister,
        Err(_) => {
            error!("panic in hotplug callback");
            false
        }
    };
    if !deregister {
        return 0;
    }

    trampoline.dead.store(true, Ordering::Release);
    if let Some(&handle) = trampoline.slot.get() {
        context.inner().hotplug.lock().unwrap().remove(&handle);
    }
    // When the slot is still unset we are inside the registration call
    // itself, which checks the dead flag before retaining the trampoline.
    1
}

/// Builder for a hotplug registration.
pub struct HotplugBuilder {
    arrived: bool,
    left: bool,
    vendor_id: Option<u16>,
    product_id: Option<u16>,
    device_class: Option<u8>,
    enumerate: bool,
}

impl Default for HotplugBuilder {
    fn default() -> HotplugBuilder {
        HotplugBuilder {
            arrived: true,
            left: true,
            vendor_id: None,
            product_id: None,
            device_class: None,
            enumerate: false,
        }
    }
}

impl HotplugBuilder {
    /// Watch both arrivals and departures of any device, without enumerating
    /// the devices already present.
    pub fn new() -> HotplugBuilder {
        HotplugBuilder::default()
    }

    /// Only report device arrivals.
    pub fn arrived_only(mut self) -> HotplugBuilder {
        self.arrived = true;
        self.left = false;
        self
    }

    /// Only report device departures.
    pub fn left_only(mut self) -> HotplugBuilder {
        self.arrived = false;
        self.left = true;
        self
    }

    /// Only report devices with this vendor id.
    pub fn vendor_id(mut self, vendor_id: u16) -> HotplugBuilder {
        self.vendor_id = Some(vendor_id);
        self
    }

    /// Only report devices with this product id.
    pub fn product_id(mut self, product_id: u16) -> HotplugBuilder {
        self.product_id = Some(product_id);
        self
    }

    /// Only report devices with this device class.
    pub fn device_class(mut self, device_class: u8) -> HotplugBuilder {
        self.device_class = Some(device_class);
        self
    }

    /// Also report the matching devices already present at registration time,
    /// as arrivals dispatched during the registration call itself.
    pub fn enumerate(mut self, enumerate: bool) -> HotplugBuilder {
        self.enumerate = enumerate;
        self
    }

    fn native_events(&self) -> c_int {
        let mut events = 0;
        if self.arrived {
            events |= LIBUSB_HOTPLUG_EVENT_DEVICE_ARRIVED as c_int;
        }
        if self.left {
            events |= LIBUSB_HOTPLUG_EVENT_DEVICE_LEFT as c_int;
        }
        events
    }

    /// Register `callback` with the driver. The returned handle can be passed
    /// to [`Context::deregister_hotplug_callback`]; the registration is also
    /// dropped when the callback returns `true` or the context is torn down.
    pub fn register(
        self,
        context: &Context,
        callback: HotplugCallback,
    ) -> Result<HotplugRegistration> {
        let trampoline = Arc::new(HotplugTrampoline {
            context: context.downgrade(),
            callback: Mutex::new(callback),
            slot: OnceLock::new(),
            dead: AtomicBool::new(false),
        });

        let flags = if self.enumerate {
            LIBUSB_HOTPLUG_ENUMERATE as c_int
        } else {
            0
        };
        let mut handle: c_int = 0;
        // SAFETY: the trampoline address stays valid for as long as the
        // native layer may dispatch to it: the local strong reference covers
        // enumeration during this call, and afterwards the context's
        // registration table holds it until deregistration.
        let rc = unsafe {
            usbffi::libusb_hotplug_register_callback(
                context.raw(),
                self.native_events(),
                flags,
                native_filter(self.vendor_id),
                native_filter(self.product_id),
                native_filter(self.device_class.map(u16::from)),
                hotplug_dispatch,
                Arc::as_ptr(&trampoline) as *mut c_void,
                &mut handle,
            )
        };
        check(rc)?;

        let registration = HotplugRegistration { handle };
        trampoline.slot.set(handle).ok();
        if trampoline.dead.load(Ordering::Acquire) {
            // The callback already deregistered itself while existing devices
            // were enumerated above. Make sure the native layer agrees and do
            // not retain the trampoline.
            unsafe { usbffi::libusb_hotplug_deregister_callback(context.raw(), handle) };
            return Ok(registration);
        }
        context
            .inner()
            .hotplug
            .lock()
            .unwrap()
            .insert(handle, trampoline);
        debug!("registered hotplug callback {:?}", registration);
        Ok(registration)
    }
}

/// Wildcard filter encoding: `None` matches any value.
fn native_filter(value: Option<u16>) -> c_int {
    match value {
        Some(value) => value as c_int,
        None => LIBUSB_HOTPLUG_MATCH_ANY as c_int,
    }
}

impl Context {
    /// Deregister a hotplug registration. Idempotent: deregistering a handle
    /// that already deregistered itself (or was never retained) is a no-op.
    ///
    /// Must not be called from within a hotplug callback; a callback
    /// deregisters itself by returning `true` instead.
    pub fn deregister_hotplug_callback(&self, registration: HotplugRegistration) {
        let retained = self
            .inner()
            .hotplug
            .lock()
            .unwrap()
            .remove(&registration.handle);
        if retained.is_some() {
            unsafe {
                usbffi::libusb_hotplug_deregister_callback(self.raw(), registration.handle)
            };
            debug!("deregistered hotplug callback {:?}", registration);
        } else {
            debug!("ignoring unknown hotplug registration {:?}", registration);
        }
    }

    /// Shorthand for registering a catch-all hotplug callback.
    pub fn register_hotplug_callback(
        &self,
        enumerate: bool,
        callback: HotplugCallback,
    ) -> Result<HotplugRegistration> {
        HotplugBuilder::new().enumerate(enumerate).register(self, callback)
    }
}
