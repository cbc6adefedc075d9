//! Asynchronous transfers
//!
//! A [`Transfer`] owns one native transfer descriptor together with its data
//! buffer and walks an explicit state machine: unconfigured, configured,
//! submitted, then a terminal status from which it can be reconfigured or
//! resubmitted. While submitted, the submitted-transfer registry holds a
//! strong reference to the internals, so the native layer can never invoke a
//! completion callback into freed memory, even if the caller drops every
//! handle to the transfer in the meantime.
//!
//! Completion dispatch runs on whichever thread is executing the driver's
//! event-handling call and is the only place that removes a live registry
//! entry; submission may happen from any thread.

use crate::error::{Error, Result, check};
use crate::fields::TransferKind;
use crate::handle::HandleCore;
use crate::registry;
use libc::{c_int, c_uint};
use libusb1_sys as usbffi;
use libusb1_sys::constants::*;
use std::any::Any;
use std::ptr::{self, NonNull};
use std::slice;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, error, warn};

/// Terminal status of a completed transfer, one variant per native status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    /// Transfer completed without error (the full buffer may still not have
    /// been transferred unless short-is-error was requested)
    Completed,
    /// Transfer failed
    Error,
    /// Transfer timed out
    TimedOut,
    /// Transfer was cancelled
    Cancelled,
    /// The endpoint stalled, or the control request was not supported
    Stall,
    /// The device was disconnected
    NoDevice,
    /// The device sent more data than requested
    Overflow,
}

impl TransferStatus {
    pub(crate) fn from_native(status: c_int) -> TransferStatus {
        match status {
            LIBUSB_TRANSFER_COMPLETED => TransferStatus::Completed,
            LIBUSB_TRANSFER_TIMED_OUT => TransferStatus::TimedOut,
            LIBUSB_TRANSFER_CANCELLED => TransferStatus::Cancelled,
            LIBUSB_TRANSFER_STALL => TransferStatus::Stall,
            LIBUSB_TRANSFER_NO_DEVICE => TransferStatus::NoDevice,
            LIBUSB_TRANSFER_OVERFLOW => TransferStatus::Overflow,
            LIBUSB_TRANSFER_ERROR => TransferStatus::Error,
            other => {
                warn!("unknown native transfer status {}, reporting as error", other);
                TransferStatus::Error
            }
        }
    }
}

/// Data carried by a transfer setup call: bytes to send, or the size of the
/// buffer to receive into.
#[derive(Debug, Clone, Copy)]
pub enum Payload<'a> {
    Bytes(&'a [u8]),
    Size(usize),
}

impl<'a> From<&'a [u8]> for Payload<'a> {
    fn from(bytes: &'a [u8]) -> Payload<'a> {
        Payload::Bytes(bytes)
    }
}

impl From<usize> for Payload<'static> {
    fn from(size: usize) -> Payload<'static> {
        Payload::Size(size)
    }
}

impl Payload<'_> {
    fn into_vec(self) -> Vec<u8> {
        match self {
            Payload::Bytes(bytes) => bytes.to_vec(),
            Payload::Size(size) => vec![0; size],
        }
    }
}

/// Callback invoked from completion dispatch with the completed transfer.
pub type TransferCallback = Box<dyn FnMut(&Transfer) + Send>;

/// Per-packet setup and result of an isochronous transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IsoPacketSetup {
    pub length: u32,
    pub actual_length: u32,
    pub status: TransferStatus,
}

pub(crate) struct TransferState {
    ptr: Option<NonNull<usbffi::libusb_transfer>>,
    buffer: Vec<u8>,
    configured: bool,
    doomed: bool,
    callback: Option<TransferCallback>,
    user_data: Option<Arc<dyn Any + Send + Sync>>,
}

pub(crate) struct TransferCore {
    iso_packets: usize,
    handle: Arc<HandleCore>,
    state: Mutex<TransferState>,
}

// SAFETY: the native descriptor is only touched under the state lock, and the
// driver itself does not mutate it outside submission (which the registry
// discipline serializes against release).
unsafe impl Send for TransferCore {}
unsafe impl Sync for TransferCore {}

impl TransferCore {
    pub(crate) fn native_addr(&self) -> Option<usize> {
        self.state.lock().unwrap().ptr.map(|p| p.as_ptr() as usize)
    }
}

impl Drop for TransferCore {
    fn drop(&mut self) {
        let st = self.state.get_mut().unwrap();
        if let Some(ptr) = st.ptr.take() {
            // Cannot be submitted here: the registry holds a strong reference
            // for every submitted transfer.
            unsafe { usbffi::libusb_free_transfer(ptr.as_ptr()) };
        }
    }
}

/// One asynchronous USB transfer. Clones share the same native descriptor;
/// it is released when the transfer is closed or the last reference is
/// dropped.
#[derive(Clone)]
pub struct Transfer {
    pub(crate) core: Arc<TransferCore>,
}

impl Transfer {
    pub(crate) fn alloc(
        handle: Arc<HandleCore>,
        iso_packets: usize,
        short_is_error: bool,
        add_zero_packet: bool,
    ) -> Result<Transfer> {
        let raw = unsafe { usbffi::libusb_alloc_transfer(iso_packets as c_int) };
        let ptr = NonNull::new(raw).ok_or(Error::NoMem)?;

        let mut flags: u8 = 0;
        if short_is_error {
            flags |= LIBUSB_TRANSFER_SHORT_NOT_OK as u8;
        }
        if add_zero_packet {
            flags |= LIBUSB_TRANSFER_ADD_ZERO_PACKET as u8;
        }
        unsafe { (*ptr.as_ptr()).flags = flags };

        Ok(Transfer {
            core: Arc::new(TransferCore {
                iso_packets,
                handle,
                state: Mutex::new(TransferState {
                    ptr: Some(ptr),
                    buffer: Vec::new(),
                    configured: false,
                    doomed: false,
                    callback: None,
                    user_data: None,
                }),
            }),
        })
    }

    /// Shared precondition of every configuration call.
    fn begin_configure(st: &TransferState) -> Result<NonNull<usbffi::libusb_transfer>> {
        let ptr = st.ptr.ok_or(Error::InvalidState("transfer is closed"))?;
        if registry::contains(ptr.as_ptr() as usize) {
            return Err(Error::InvalidState("cannot alter a submitted transfer"));
        }
        if st.doomed {
            return Err(Error::Doomed);
        }
        Ok(ptr)
    }

    /// Set up the transfer for control use. The buffer is rebuilt with an
    /// 8-byte setup header in front of the payload; the transfer direction is
    /// taken from bit 7 of `request_type`. A zero `timeout` disables the
    /// timeout.
    pub fn set_control(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        payload: Payload<'_>,
        timeout: Duration,
    ) -> Result<()> {
        let mut st = self.core.state.lock().unwrap();
        let ptr = Transfer::begin_configure(&st)?;
        let dev_handle = self.core.handle.raw()?;

        let data = payload.into_vec();
        if data.len() > u16::MAX as usize {
            return Err(Error::InvalidArgument(format!(
                "control payload of {} bytes does not fit the 16-bit length field",
                data.len()
            )));
        }
        let mut buffer = Vec::with_capacity(LIBUSB_CONTROL_SETUP_SIZE + data.len());
        buffer.resize(LIBUSB_CONTROL_SETUP_SIZE, 0);
        buffer.extend_from_slice(&data);

        st.configured = false;
        st.buffer = buffer;
        unsafe {
            usbffi::libusb_fill_control_setup(
                st.buffer.as_mut_ptr(),
                request_type,
                request,
                value,
                index,
                data.len() as u16,
            );
            usbffi::libusb_fill_control_transfer(
                ptr.as_ptr(),
                dev_handle,
                st.buffer.as_mut_ptr(),
                transfer_dispatch as _,
                ptr::null_mut(),
                timeout.as_millis() as c_uint,
            );
        }
        st.configured = true;
        Ok(())
    }

    /// Set up the transfer for bulk use. The endpoint address defines the
    /// direction; a zero `timeout` disables the timeout.
    pub fn set_bulk(&self, endpoint: u8, payload: Payload<'_>, timeout: Duration) -> Result<()> {
        self.set_stream(endpoint, payload, timeout, false)
    }

    /// Set up the transfer for interrupt use. The endpoint address defines
    /// the direction; a zero `timeout` disables the timeout.
    pub fn set_interrupt(
        &self,
        endpoint: u8,
        payload: Payload<'_>,
        timeout: Duration,
    ) -> Result<()> {
        self.set_stream(endpoint, payload, timeout, true)
    }

    fn set_stream(
        &self,
        endpoint: u8,
        payload: Payload<'_>,
        timeout: Duration,
        interrupt: bool,
    ) -> Result<()> {
        let mut st = self.core.state.lock().unwrap();
        let ptr = Transfer::begin_configure(&st)?;
        let dev_handle = self.core.handle.raw()?;

        st.configured = false;
        st.buffer = payload.into_vec();
        let length = st.buffer.len() as c_int;
        unsafe {
            if interrupt {
                usbffi::libusb_fill_interrupt_transfer(
                    ptr.as_ptr(),
                    dev_handle,
                    endpoint,
                    st.buffer.as_mut_ptr(),
                    length,
                    transfer_dispatch as _,
                    ptr::null_mut(),
                    timeout.as_millis() as c_uint,
                );
            } else {
                usbffi::libusb_fill_bulk_transfer(
                    ptr.as_ptr(),
                    dev_handle,
                    endpoint,
                    st.buffer.as_mut_ptr(),
                    length,
                    transfer_dispatch as _,
                    ptr::null_mut(),
                    timeout.as_millis() as c_uint,
                );
            }
        }
        st.configured = true;
        Ok(())
    }

    /// Set up the transfer for isochronous use. Requires the transfer to have
    /// been allocated with isochronous packet slots. When `packet_lengths` is
    /// omitted the buffer is divided evenly across all allocated slots and
    /// the call fails if it does not divide evenly.
    pub fn set_isochronous(
        &self,
        endpoint: u8,
        payload: Payload<'_>,
        timeout: Duration,
        packet_lengths: Option<&[u32]>,
    ) -> Result<()> {
        let mut st = self.core.state.lock().unwrap();
        let ptr = Transfer::begin_configure(&st)?;
        if self.core.iso_packets == 0 {
            return Err(Error::NotIsochronous);
        }
        let dev_handle = self.core.handle.raw()?;

        let buffer = payload.into_vec();
        let buffer_length = buffer.len();
        let lengths: Vec<u32> = match packet_lengths {
            Some(lengths) => lengths.to_vec(),
            None => {
                if buffer_length % self.core.iso_packets != 0 {
                    return Err(Error::InvalidArgument(format!(
                        "buffer size {} cannot be evenly distributed among {} packets",
                        buffer_length, self.core.iso_packets
                    )));
                }
                vec![(buffer_length / self.core.iso_packets) as u32; self.core.iso_packets]
            }
        };
        if lengths.len() > self.core.iso_packets {
            return Err(Error::InvalidArgument(format!(
                "{} packet lengths configured, only {} packet slots allocated",
                lengths.len(),
                self.core.iso_packets
            )));
        }
        if lengths.iter().any(|&length| length == 0) {
            return Err(Error::InvalidArgument(
                "zero-length isochronous packets are not possible".into(),
            ));
        }
        let total: u64 = lengths.iter().map(|&length| u64::from(length)).sum();
        if total > buffer_length as u64 {
            return Err(Error::InvalidArgument(format!(
                "packet lengths sum to {}, only {} bytes available",
                total, buffer_length
            )));
        }

        st.configured = false;
        st.buffer = buffer;
        unsafe {
            usbffi::libusb_fill_iso_transfer(
                ptr.as_ptr(),
                dev_handle,
                endpoint,
                st.buffer.as_mut_ptr(),
                buffer_length as c_int,
                lengths.len() as c_int,
                transfer_dispatch as _,
                ptr::null_mut(),
                timeout.as_millis() as c_uint,
            );
            let descriptors = iso_descriptors_mut(ptr, lengths.len());
            for (descriptor, &length) in descriptors.iter_mut().zip(&lengths) {
                descriptor.length = length as c_uint;
            }
        }
        st.configured = true;
        Ok(())
    }

    /// Replace the data buffer of a configured bulk or interrupt transfer.
    /// Control buffers are rebuilt by [`Transfer::set_control`] and
    /// isochronous buffer sizes by [`Transfer::set_isochronous`].
    pub fn set_buffer(&self, payload: Payload<'_>) -> Result<()> {
        let mut st = self.core.state.lock().unwrap();
        let ptr = st.ptr.ok_or(Error::InvalidState("transfer is closed"))?;
        if registry::contains(ptr.as_ptr() as usize) {
            return Err(Error::InvalidState("cannot alter a submitted transfer"));
        }
        let kind = unsafe { TransferKind::from_attributes((*ptr.as_ptr()).transfer_type) };
        if kind == TransferKind::Control {
            return Err(Error::InvalidArgument(
                "control transfer buffers are set through set_control".into(),
            ));
        }
        let buffer = payload.into_vec();
        if kind == TransferKind::Isochronous
            && buffer.len() != unsafe { (*ptr.as_ptr()).length } as usize
        {
            return Err(Error::InvalidArgument(
                "isochronous buffer lengths are set through set_isochronous".into(),
            ));
        }
        st.buffer = buffer;
        unsafe {
            (*ptr.as_ptr()).buffer = st.buffer.as_mut_ptr();
            (*ptr.as_ptr()).length = st.buffer.len() as c_int;
        }
        Ok(())
    }

    /// Replace the completion callback.
    pub fn set_callback(&self, callback: TransferCallback) {
        self.core.state.lock().unwrap().callback = Some(callback);
    }

    /// Remove the completion callback.
    pub fn clear_callback(&self) {
        self.core.state.lock().unwrap().callback = None;
    }

    /// Attach arbitrary user data to the transfer.
    pub fn set_user_data(&self, user_data: Arc<dyn Any + Send + Sync>) {
        self.core.state.lock().unwrap().user_data = Some(user_data);
    }

    /// User data attached with [`Transfer::set_user_data`].
    pub fn user_data(&self) -> Option<Arc<dyn Any + Send + Sync>> {
        self.core.state.lock().unwrap().user_data.clone()
    }

    /// Mark the transfer as never to be submitted again. A doomed transfer
    /// refuses configuration and submission and is closed automatically once
    /// its current completion, if any, has been dispatched.
    pub fn doom(&self) {
        self.core.state.lock().unwrap().doomed = true;
    }

    pub fn is_doomed(&self) -> bool {
        self.core.state.lock().unwrap().doomed
    }

    /// Whether the transfer is submitted and still pending.
    pub fn is_submitted(&self) -> bool {
        match self.core.native_addr() {
            Some(key) => registry::contains(key),
            None => false,
        }
    }

    /// Submit the transfer for asynchronous handling. The registry entry and
    /// the in-flight registration are made before the native call and
    /// reversed if it fails.
    pub fn submit(&self) -> Result<()> {
        let st = self.core.state.lock().unwrap();
        let ptr = st.ptr.ok_or(Error::InvalidState("transfer is closed"))?;
        let key = ptr.as_ptr() as usize;
        if registry::contains(key) {
            return Err(Error::InvalidState("cannot submit a submitted transfer"));
        }
        if !st.configured {
            return Err(Error::InvalidState(
                "cannot submit a transfer that has not been configured",
            ));
        }
        if st.doomed {
            return Err(Error::Doomed);
        }

        self.core.handle.track(key, Arc::clone(&self.core));
        registry::insert(key, Arc::clone(&self.core));
        let rc = unsafe { usbffi::libusb_submit_transfer(ptr.as_ptr()) };
        if rc < 0 {
            registry::remove(key);
            self.core.handle.untrack(key);
            return Err(Error::from_code(rc));
        }
        Ok(())
    }

    /// Request cancellation of a submitted transfer. Cancellation is
    /// asynchronous: completion still arrives through the normal dispatch
    /// path, normally with [`TransferStatus::Cancelled`]. Cancelling a
    /// transfer that is not submitted fails with [`Error::NotFound`] rather
    /// than being forwarded to the native layer, which is known to crash on
    /// double cancellation.
    pub fn cancel(&self) -> Result<()> {
        let st = self.core.state.lock().unwrap();
        let ptr = st.ptr.ok_or(Error::InvalidState("transfer is closed"))?;
        if !registry::contains(ptr.as_ptr() as usize) {
            return Err(Error::NotFound);
        }
        check(unsafe { usbffi::libusb_cancel_transfer(ptr.as_ptr()) })?;
        Ok(())
    }

    /// Release the native descriptor and buffer. Fails while the transfer is
    /// submitted: cancel it and let the completion land first. Closing an
    /// already-closed transfer is a no-op.
    pub fn close(&self) -> Result<()> {
        let mut st = self.core.state.lock().unwrap();
        let Some(ptr) = st.ptr else { return Ok(()) };
        if registry::contains(ptr.as_ptr() as usize) {
            return Err(Error::InvalidState("cannot close a submitted transfer"));
        }
        st.doomed = true;
        st.configured = false;
        st.callback = None;
        st.user_data = None;
        unsafe { usbffi::libusb_free_transfer(ptr.as_ptr()) };
        st.ptr = None;
        st.buffer = Vec::new();
        Ok(())
    }

    /// Kind the transfer was last configured for.
    pub fn kind(&self) -> Result<TransferKind> {
        let st = self.core.state.lock().unwrap();
        let ptr = st.ptr.ok_or(Error::InvalidState("transfer is closed"))?;
        Ok(unsafe { TransferKind::from_attributes((*ptr.as_ptr()).transfer_type) })
    }

    /// Endpoint the transfer is configured against.
    pub fn endpoint(&self) -> Result<u8> {
        let st = self.core.state.lock().unwrap();
        let ptr = st.ptr.ok_or(Error::InvalidState("transfer is closed"))?;
        Ok(unsafe { (*ptr.as_ptr()).endpoint })
    }

    /// Status of the last completion. Unspecified while the transfer is
    /// submitted.
    pub fn status(&self) -> Result<TransferStatus> {
        let st = self.core.state.lock().unwrap();
        let ptr = st.ptr.ok_or(Error::InvalidState("transfer is closed"))?;
        Ok(TransferStatus::from_native(unsafe { (*ptr.as_ptr()).status }))
    }

    /// Number of bytes actually transferred at the last completion.
    /// Unspecified while the transfer is submitted.
    pub fn actual_length(&self) -> Result<usize> {
        let st = self.core.state.lock().unwrap();
        let ptr = st.ptr.ok_or(Error::InvalidState("transfer is closed"))?;
        let length = unsafe { (*ptr.as_ptr()).actual_length };
        Ok(length.max(0) as usize)
    }

    /// Copy of the transfer's data area: the payload region for control
    /// transfers (setup header excluded), the whole buffer otherwise.
    /// Unspecified while the transfer is submitted.
    pub fn buffer(&self) -> Result<Vec<u8>> {
        let st = self.core.state.lock().unwrap();
        let ptr = st.ptr.ok_or(Error::InvalidState("transfer is closed"))?;
        let kind = unsafe { TransferKind::from_attributes((*ptr.as_ptr()).transfer_type) };
        if kind == TransferKind::Control && st.buffer.len() >= LIBUSB_CONTROL_SETUP_SIZE {
            Ok(st.buffer[LIBUSB_CONTROL_SETUP_SIZE..].to_vec())
        } else {
            Ok(st.buffer.clone())
        }
    }

    /// Whether a short frame is reported as an error.
    pub fn short_is_error(&self) -> Result<bool> {
        let st = self.core.state.lock().unwrap();
        let ptr = st.ptr.ok_or(Error::InvalidState("transfer is closed"))?;
        Ok(unsafe { (*ptr.as_ptr()).flags } & (LIBUSB_TRANSFER_SHORT_NOT_OK as u8) != 0)
    }

    pub fn set_short_is_error(&self, short_is_error: bool) -> Result<()> {
        self.update_flags(LIBUSB_TRANSFER_SHORT_NOT_OK as u8, short_is_error)
    }

    /// Whether a zero-length packet terminates an out transfer whose length
    /// is a multiple of the endpoint's packet size.
    pub fn zero_packet_added(&self) -> Result<bool> {
        let st = self.core.state.lock().unwrap();
        let ptr = st.ptr.ok_or(Error::InvalidState("transfer is closed"))?;
        Ok(unsafe { (*ptr.as_ptr()).flags } & (LIBUSB_TRANSFER_ADD_ZERO_PACKET as u8) != 0)
    }

    pub fn set_add_zero_packet(&self, add_zero_packet: bool) -> Result<()> {
        self.update_flags(LIBUSB_TRANSFER_ADD_ZERO_PACKET as u8, add_zero_packet)
    }

    fn update_flags(&self, flag: u8, set: bool) -> Result<()> {
        let st = self.core.state.lock().unwrap();
        let ptr = st.ptr.ok_or(Error::InvalidState("transfer is closed"))?;
        unsafe {
            if set {
                (*ptr.as_ptr()).flags |= flag;
            } else {
                (*ptr.as_ptr()).flags &= !flag;
            }
        }
        Ok(())
    }

    /// Per-packet setup and results of an isochronous transfer, in slot
    /// order. Unspecified while the transfer is submitted (except for the
    /// configured lengths).
    pub fn iso_setup_list(&self) -> Result<Vec<IsoPacketSetup>> {
        let st = self.core.state.lock().unwrap();
        let ptr = self.require_isochronous(&st)?;
        let count = unsafe { (*ptr.as_ptr()).num_iso_packets }.max(0) as usize;
        let descriptors = unsafe { iso_descriptors_mut(ptr, count) };
        Ok(descriptors
            .iter()
            .map(|descriptor| IsoPacketSetup {
                length: descriptor.length,
                actual_length: descriptor.actual_length,
                status: TransferStatus::from_native(descriptor.status),
            })
            .collect())
    }

    /// Copies of each isochronous packet's buffer at its configured length,
    /// in the same slot order as [`Transfer::iso_setup_list`]. For truncated
    /// received data prefer [`Transfer::iter_iso`].
    pub fn iso_buffer_list(&self) -> Result<Vec<Vec<u8>>> {
        let st = self.core.state.lock().unwrap();
        let ptr = self.require_isochronous(&st)?;
        let count = unsafe { (*ptr.as_ptr()).num_iso_packets }.max(0) as usize;
        let descriptors = unsafe { iso_descriptors_mut(ptr, count) };
        let mut buffers = Vec::with_capacity(count);
        let mut offset = 0usize;
        for descriptor in descriptors.iter() {
            let length = descriptor.length as usize;
            let start = offset.min(st.buffer.len());
            let end = (offset + length).min(st.buffer.len());
            buffers.push(st.buffer[start..end].to_vec());
            offset += length;
        }
        Ok(buffers)
    }

    /// Iterate over the packets of a completed isochronous transfer, yielding
    /// each packet's status and its buffer truncated to the actual length.
    /// The transfer is locked for the lifetime of the iterator; do not call
    /// other methods on the same transfer while iterating.
    pub fn iter_iso(&self) -> Result<IsoPackets<'_>> {
        let st = self.core.state.lock().unwrap();
        let ptr = self.require_isochronous(&st)?;
        let count = unsafe { (*ptr.as_ptr()).num_iso_packets }.max(0) as usize;
        Ok(IsoPackets {
            state: st,
            ptr,
            count,
            index: 0,
            offset: 0,
        })
    }

    fn require_isochronous(
        &self,
        st: &MutexGuard<'_, TransferState>,
    ) -> Result<NonNull<usbffi::libusb_transfer>> {
        let ptr = st.ptr.ok_or(Error::InvalidState("transfer is closed"))?;
        let kind = unsafe { TransferKind::from_attributes((*ptr.as_ptr()).transfer_type) };
        if kind != TransferKind::Isochronous {
            return Err(Error::NotIsochronous);
        }
        Ok(ptr)
    }
}

impl std::fmt::Debug for Transfer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = self.core.state.lock().unwrap();
        f.debug_struct("Transfer")
            .field("ptr", &st.ptr)
            .field("configured", &st.configured)
            .field("doomed", &st.doomed)
            .field("buffer_len", &st.buffer.len())
            .finish()
    }
}

/// Lazy iterator over the packets of an isochronous transfer.
pub struct IsoPackets<'a> {
    state: MutexGuard<'a, TransferState>,
    ptr: NonNull<usbffi::libusb_transfer>,
    count: usize,
    index: usize,
    offset: usize,
}

impl Iterator for IsoPackets<'_> {
    type Item = (TransferStatus, Vec<u8>);

    fn next(&mut self) -> Option<Self::Item> {
        if self.index >= self.count {
            return None;
        }
        let descriptors = unsafe { iso_descriptors_mut(self.ptr, self.count) };
        let descriptor = &descriptors[self.index];
        let start = self.offset.min(self.state.buffer.len());
        let end = (self.offset + descriptor.actual_length as usize).min(self.state.buffer.len());
        let packet = self.state.buffer[start..end].to_vec();
        self.offset += descriptor.length as usize;
        self.index += 1;
        Some((TransferStatus::from_native(descriptor.status), packet))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.count - self.index;
        (remaining, Some(remaining))
    }
}

/// Native completion entry point. Runs on the thread executing the driver's
/// event-handling call.
pub(crate) extern "system" fn transfer_dispatch(raw: *mut usbffi::libusb_transfer) {
    let key = raw as usize;
    let Some(core) = registry::remove(key) else {
        warn!("completion for unknown transfer descriptor {:#x}", key);
        return;
    };
    core.handle.untrack(key);

    let transfer = Transfer { core: Arc::clone(&core) };
    let callback = core.state.lock().unwrap().callback.take();
    if let Some(mut callback) = callback {
        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            callback(&transfer)
        }));
        if outcome.is_err() {
            error!("panic in transfer completion callback");
        }
        let mut st = core.state.lock().unwrap();
        if st.callback.is_none() {
            st.callback = Some(callback);
        }
    }

    let doomed = core.state.lock().unwrap().doomed;
    if doomed && let Err(e) = transfer.close() {
        debug!("doomed transfer left open after dispatch: {}", e);
    }
}

unsafe fn iso_descriptors_mut<'a>(
    ptr: NonNull<usbffi::libusb_transfer>,
    count: usize,
) -> &'a mut [usbffi::libusb_iso_packet_descriptor] {
    unsafe {
        let base = ptr::addr_of_mut!((*ptr.as_ptr()).iso_packet_desc)
            .cast::<usbffi::libusb_iso_packet_descriptor>();
        slice::from_raw_parts_mut(base, count)
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    impl Transfer {
        /// Transfer bound to a detached handle core: the native descriptor is
        /// real, the device handle is a placeholder that must never be
        /// submitted against.
        pub(crate) fn detached(iso_packets: usize) -> Result<Transfer> {
            Transfer::alloc(HandleCore::detached(), iso_packets, false, false)
        }

        /// Simulate a driver-side completion of every isochronous packet with
        /// the configured length.
        pub(crate) fn fake_iso_completion(&self) {
            let st = self.core.state.lock().unwrap();
            let ptr = st.ptr.expect("transfer is open");
            let count = unsafe { (*ptr.as_ptr()).num_iso_packets }.max(0) as usize;
            for descriptor in unsafe { iso_descriptors_mut(ptr, count) } {
                descriptor.actual_length = descriptor.length;
                descriptor.status = LIBUSB_TRANSFER_COMPLETED;
            }
        }

        pub(crate) fn raw_buffer(&self) -> Vec<u8> {
            self.core.state.lock().unwrap().buffer.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIMEOUT: Duration = Duration::from_millis(1000);

    #[test]
    fn test_control_setup_header_layout() {
        let transfer = Transfer::detached(0).unwrap();
        transfer
            .set_control(0x40, 5, 0, 0, Payload::Bytes(&[1, 2, 3]), TIMEOUT)
            .unwrap();

        // 8-byte little-endian setup header followed by the payload.
        let raw = transfer.raw_buffer();
        assert_eq!(raw.len(), 11);
        assert_eq!(&raw[..8], &[0x40, 0x05, 0x00, 0x00, 0x00, 0x00, 0x03, 0x00]);
        assert_eq!(&raw[8..], &[1, 2, 3]);

        // The public view excludes the setup header.
        assert_eq!(transfer.buffer().unwrap(), vec![1, 2, 3]);
        assert_eq!(transfer.kind().unwrap(), TransferKind::Control);
    }

    #[test]
    fn test_control_receive_buffer_is_sized() {
        let transfer = Transfer::detached(0).unwrap();
        transfer
            .set_control(0xc0, 0x01, 0x0203, 0x0405, Payload::Size(64), TIMEOUT)
            .unwrap();
        let raw = transfer.raw_buffer();
        assert_eq!(raw.len(), 8 + 64);
        assert_eq!(&raw[..8], &[0xc0, 0x01, 0x03, 0x02, 0x05, 0x04, 0x40, 0x00]);
    }

    #[test]
    fn test_set_buffer_round_trip() {
        let transfer = Transfer::detached(0).unwrap();
        transfer
            .set_bulk(0x01, Payload::Bytes(b"hello"), TIMEOUT)
            .unwrap();
        assert_eq!(transfer.buffer().unwrap(), b"hello");

        transfer.set_buffer(Payload::Bytes(b"beep boop")).unwrap();
        assert_eq!(transfer.buffer().unwrap(), b"beep boop");

        transfer.set_buffer(Payload::Size(16)).unwrap();
        assert_eq!(transfer.buffer().unwrap(), vec![0; 16]);
    }

    #[test]
    fn test_set_buffer_rejected_for_control() {
        let transfer = Transfer::detached(0).unwrap();
        transfer
            .set_control(0x40, 1, 0, 0, Payload::Size(4), TIMEOUT)
            .unwrap();
        assert!(matches!(
            transfer.set_buffer(Payload::Size(8)),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_submit_unconfigured_is_rejected() {
        let transfer = Transfer::detached(0).unwrap();
        assert_eq!(
            transfer.submit(),
            Err(Error::InvalidState(
                "cannot submit a transfer that has not been configured"
            ))
        );
    }

    #[test]
    fn test_cancel_unsubmitted_is_rejected() {
        let transfer = Transfer::detached(0).unwrap();
        transfer.set_bulk(0x81, Payload::Size(8), TIMEOUT).unwrap();
        assert_eq!(transfer.cancel(), Err(Error::NotFound));
    }

    #[test]
    fn test_doomed_transfer_refuses_reuse() {
        let transfer = Transfer::detached(0).unwrap();
        transfer.set_bulk(0x01, Payload::Size(8), TIMEOUT).unwrap();
        transfer.doom();
        assert!(transfer.is_doomed());
        assert_eq!(
            transfer.set_bulk(0x01, Payload::Size(8), TIMEOUT),
            Err(Error::Doomed)
        );
        assert_eq!(transfer.submit(), Err(Error::Doomed));
    }

    #[test]
    fn test_close_then_configure_fails() {
        let transfer = Transfer::detached(0).unwrap();
        transfer.close().unwrap();
        assert_eq!(
            transfer.set_bulk(0x01, Payload::Size(8), TIMEOUT),
            Err(Error::InvalidState("transfer is closed"))
        );
        // Closing again is a no-op.
        assert_eq!(transfer.close(), Ok(()));
    }

    #[test]
    fn test_flags() {
        let transfer = Transfer::detached(0).unwrap();
        assert!(!transfer.short_is_error().unwrap());
        transfer.set_short_is_error(true).unwrap();
        assert!(transfer.short_is_error().unwrap());
        transfer.set_add_zero_packet(true).unwrap();
        assert!(transfer.zero_packet_added().unwrap());
        transfer.set_add_zero_packet(false).unwrap();
        assert!(!transfer.zero_packet_added().unwrap());

        let flagged = Transfer::alloc(HandleCore::detached(), 0, true, true).unwrap();
        assert!(flagged.short_is_error().unwrap());
        assert!(flagged.zero_packet_added().unwrap());
    }

    #[test]
    fn test_iso_requires_slots() {
        let transfer = Transfer::detached(0).unwrap();
        assert_eq!(
            transfer.set_isochronous(0x81, Payload::Size(64), TIMEOUT, None),
            Err(Error::NotIsochronous)
        );
    }

    #[test]
    fn test_iso_even_division() {
        let transfer = Transfer::detached(16).unwrap();
        transfer
            .set_isochronous(0x81, Payload::Size(1024), TIMEOUT, None)
            .unwrap();
        let setup = transfer.iso_setup_list().unwrap();
        assert_eq!(setup.len(), 16);
        assert!(setup.iter().all(|packet| packet.length == 64));
    }

    #[test]
    fn test_iso_uneven_division_is_rejected() {
        let transfer = Transfer::detached(16).unwrap();
        assert!(matches!(
            transfer.set_isochronous(0x81, Payload::Size(1000), TIMEOUT, None),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_iso_length_validation() {
        let transfer = Transfer::detached(4).unwrap();
        // More lengths than allocated slots.
        assert!(matches!(
            transfer.set_isochronous(0x81, Payload::Size(64), TIMEOUT, Some(&[8; 5])),
            Err(Error::InvalidArgument(_))
        ));
        // Lengths exceeding the buffer.
        assert!(matches!(
            transfer.set_isochronous(0x81, Payload::Size(16), TIMEOUT, Some(&[8, 8, 8])),
            Err(Error::InvalidArgument(_))
        ));
        // Zero-length packets.
        assert!(matches!(
            transfer.set_isochronous(0x81, Payload::Size(16), TIMEOUT, Some(&[8, 0])),
            Err(Error::InvalidArgument(_))
        ));
        // A valid subset of the slots is accepted.
        transfer
            .set_isochronous(0x81, Payload::Size(16), TIMEOUT, Some(&[8, 8]))
            .unwrap();
        assert_eq!(transfer.iso_setup_list().unwrap().len(), 2);
    }

    #[test]
    fn test_iter_iso_reassembles_buffer() {
        let pattern: Vec<u8> = (0..1024u32).map(|i| (i % 256) as u8).collect();
        let transfer = Transfer::detached(16).unwrap();
        transfer
            .set_isochronous(0x02, Payload::Bytes(&pattern), TIMEOUT, None)
            .unwrap();
        transfer.fake_iso_completion();

        let packets: Vec<(TransferStatus, Vec<u8>)> = transfer.iter_iso().unwrap().collect();
        assert_eq!(packets.len(), 16);
        assert!(packets.iter().all(|(status, _)| *status == TransferStatus::Completed));
        assert!(packets.iter().all(|(_, packet)| packet.len() == 64));
        let reassembled: Vec<u8> = packets.into_iter().flat_map(|(_, packet)| packet).collect();
        assert_eq!(reassembled, pattern);
    }

    #[test]
    fn test_iso_buffer_list_slot_sizes() {
        let transfer = Transfer::detached(4).unwrap();
        transfer
            .set_isochronous(0x81, Payload::Size(96), TIMEOUT, Some(&[16, 32, 48]))
            .unwrap();
        let buffers = transfer.iso_buffer_list().unwrap();
        assert_eq!(
            buffers.iter().map(Vec::len).collect::<Vec<_>>(),
            vec![16, 32, 48]
        );
    }

    #[test]
    fn test_iter_iso_rejected_for_bulk() {
        let transfer = Transfer::detached(0).unwrap();
        transfer.set_bulk(0x01, Payload::Size(8), TIMEOUT).unwrap();
        assert!(matches!(transfer.iter_iso(), Err(Error::NotIsochronous)));
        assert!(matches!(transfer.iso_setup_list(), Err(Error::NotIsochronous)));
    }

    #[test]
    fn test_status_and_kind_accessors() {
        let transfer = Transfer::detached(0).unwrap();
        transfer.set_interrupt(0x83, Payload::Size(8), TIMEOUT).unwrap();
        assert_eq!(transfer.kind().unwrap(), TransferKind::Interrupt);
        assert_eq!(transfer.endpoint().unwrap(), 0x83);
        // A never-submitted transfer reports the zero-value native status.
        assert_eq!(transfer.status().unwrap(), TransferStatus::Completed);
        assert_eq!(transfer.actual_length().unwrap(), 0);
        assert!(!transfer.is_submitted());
    }

    #[test]
    fn test_user_data() {
        let transfer = Transfer::detached(0).unwrap();
        assert!(transfer.user_data().is_none());
        transfer.set_user_data(Arc::new(42u32));
        let data = transfer.user_data().unwrap();
        assert_eq!(data.downcast_ref::<u32>(), Some(&42));
    }

    #[test]
    fn test_transfer_status_mapping() {
        assert_eq!(
            TransferStatus::from_native(LIBUSB_TRANSFER_COMPLETED),
            TransferStatus::Completed
        );
        assert_eq!(
            TransferStatus::from_native(LIBUSB_TRANSFER_TIMED_OUT),
            TransferStatus::TimedOut
        );
        assert_eq!(
            TransferStatus::from_native(LIBUSB_TRANSFER_CANCELLED),
            TransferStatus::Cancelled
        );
        assert_eq!(
            TransferStatus::from_native(LIBUSB_TRANSFER_STALL),
            TransferStatus::Stall
        );
        assert_eq!(
            TransferStatus::from_native(LIBUSB_TRANSFER_NO_DEVICE),
            TransferStatus::NoDevice
        );
        assert_eq!(
            TransferStatus::from_native(LIBUSB_TRANSFER_OVERFLOW),
            TransferStatus::Overflow
        );
        assert_eq!(TransferStatus::from_native(99), TransferStatus::Error);
    }
}
