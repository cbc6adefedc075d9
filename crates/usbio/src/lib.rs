//! usbio — safe host-side USB I/O over libusb-1.0
//!
//! This crate wraps the callback-based libusb driver behind safe Rust types:
//! context and device enumeration, descriptor access, open device sessions
//! with synchronous transfers, and — at its core — an asynchronous transfer
//! engine with explicit lifetime management: a submitted transfer is pinned
//! by a process-wide registry until its completion callback has fired, device
//! handles drain their in-flight transfers before the native handle is
//! released, and the driver's poll descriptors and timeouts can be folded
//! into a caller-owned event loop.
//!
//! ```no_run
//! use std::time::Duration;
//! use usbio::{Context, Payload};
//!
//! # fn main() -> usbio::Result<()> {
//! let context = Context::new()?;
//! let handle = context.open_device_with_vid_pid(0x1d50, 0x6018)?;
//! handle.claim_interface(0)?;
//!
//! let transfer = handle.alloc_transfer(0, false, false)?;
//! transfer.set_callback(Box::new(|transfer| {
//!     println!("completed: {:?}", transfer.status());
//! }));
//! transfer.set_bulk(0x81, Payload::Size(64), Duration::from_secs(1))?;
//! transfer.submit()?;
//!
//! while transfer.is_submitted() {
//!     context.handle_events()?;
//! }
//! # Ok(())
//! # }
//! ```

pub mod context;
pub mod descriptors;
pub mod device;
pub mod error;
pub mod events;
pub mod fields;
pub mod handle;
pub mod hotplug;
pub mod transfer;

mod ffi;
mod registry;

pub use context::{
    Capability, Context, ContextBuilder, LibraryVersion, LogCallback, LogLevel, has_capability,
    library_version,
};
pub use descriptors::{
    ConfigDescriptor, DeviceDescriptor, EndpointDescriptor, Interface, InterfaceDescriptor,
};
pub use device::{Device, Speed};
pub use error::{Error, Result};
pub use events::{EventLoop, EventPoller, FdPoller};
pub use fields::{Direction, Recipient, RequestType, TransferKind, request_type};
pub use handle::DeviceHandle;
pub use hotplug::{HotplugBuilder, HotplugCallback, HotplugEvent, HotplugRegistration};
pub use transfer::{
    IsoPacketSetup, IsoPackets, Payload, Transfer, TransferCallback, TransferStatus,
};
