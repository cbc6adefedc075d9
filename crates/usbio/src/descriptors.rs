//! Descriptor types
//!
//! Owned copies of the descriptors the driver caches for each device. The
//! native configuration tree is walked once and released immediately, so no
//! descriptor object ever borrows driver-owned memory.

use crate::fields::{Direction, TransferKind};
use libusb1_sys as usbffi;
use std::slice;

/// A device descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDescriptor {
    usb_version: u16,
    class: u8,
    sub_class: u8,
    protocol: u8,
    max_packet_size_0: u8,
    vendor_id: u16,
    product_id: u16,
    device_version: u16,
    manufacturer_index: u8,
    product_index: u8,
    serial_number_index: u8,
    num_configurations: u8,
}

impl DeviceDescriptor {
    pub(crate) fn from_raw(raw: &usbffi::libusb_device_descriptor) -> DeviceDescriptor {
        DeviceDescriptor {
            usb_version: raw.bcdUSB,
            class: raw.bDeviceClass,
            sub_class: raw.bDeviceSubClass,
            protocol: raw.bDeviceProtocol,
            max_packet_size_0: raw.bMaxPacketSize0,
            vendor_id: raw.idVendor,
            product_id: raw.idProduct,
            device_version: raw.bcdDevice,
            manufacturer_index: raw.iManufacturer,
            product_index: raw.iProduct,
            serial_number_index: raw.iSerialNumber,
            num_configurations: raw.bNumConfigurations,
        }
    }

    /// USB specification release number in binary-coded decimal (e.g. 0x0200).
    pub fn usb_version(&self) -> u16 {
        self.usb_version
    }

    pub fn class_code(&self) -> u8 {
        self.class
    }

    pub fn sub_class_code(&self) -> u8 {
        self.sub_class
    }

    pub fn protocol_code(&self) -> u8 {
        self.protocol
    }

    /// Maximum packet size of endpoint zero.
    pub fn max_packet_size_0(&self) -> u8 {
        self.max_packet_size_0
    }

    pub fn vendor_id(&self) -> u16 {
        self.vendor_id
    }

    pub fn product_id(&self) -> u16 {
        self.product_id
    }

    /// Device release number in binary-coded decimal.
    pub fn device_version(&self) -> u16 {
        self.device_version
    }

    pub fn manufacturer_string_index(&self) -> Option<u8> {
        nonzero_index(self.manufacturer_index)
    }

    pub fn product_string_index(&self) -> Option<u8> {
        nonzero_index(self.product_index)
    }

    pub fn serial_number_string_index(&self) -> Option<u8> {
        nonzero_index(self.serial_number_index)
    }

    pub fn num_configurations(&self) -> u8 {
        self.num_configurations
    }
}

/// A configuration descriptor with its full interface tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigDescriptor {
    value: u8,
    description_index: u8,
    attributes: u8,
    max_power: u8,
    interfaces: Vec<Interface>,
    extra: Vec<u8>,
}

impl ConfigDescriptor {
    /// Copy a native configuration descriptor tree. The caller still owns the
    /// native descriptor and must release it afterwards.
    pub(crate) unsafe fn from_raw(raw: &usbffi::libusb_config_descriptor) -> ConfigDescriptor {
        let interfaces = if raw.interface.is_null() {
            Vec::new()
        } else {
            unsafe { slice::from_raw_parts(raw.interface, raw.bNumInterfaces as usize) }
                .iter()
                .map(|iface| unsafe { Interface::from_raw(iface) })
                .collect()
        };
        ConfigDescriptor {
            value: raw.bConfigurationValue,
            description_index: raw.iConfiguration,
            attributes: raw.bmAttributes,
            max_power: raw.bMaxPower,
            interfaces,
            extra: unsafe { copy_extra(raw.extra, raw.extra_length) },
        }
    }

    /// The `bConfigurationValue` used with set-configuration requests.
    pub fn value(&self) -> u8 {
        self.value
    }

    pub fn description_string_index(&self) -> Option<u8> {
        nonzero_index(self.description_index)
    }

    pub fn self_powered(&self) -> bool {
        self.attributes & 0x40 != 0
    }

    pub fn remote_wakeup(&self) -> bool {
        self.attributes & 0x20 != 0
    }

    /// Maximum current draw in the descriptor's 2 mA units.
    pub fn max_power(&self) -> u8 {
        self.max_power
    }

    pub fn interfaces(&self) -> &[Interface] {
        &self.interfaces
    }

    /// Class-specific bytes trailing the standard configuration descriptor.
    pub fn extra(&self) -> &[u8] {
        &self.extra
    }
}

/// One interface slot of a configuration, holding its alternate settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interface {
    alt_settings: Vec<InterfaceDescriptor>,
}

impl Interface {
    unsafe fn from_raw(raw: &usbffi::libusb_interface) -> Interface {
        let alt_settings = if raw.altsetting.is_null() || raw.num_altsetting <= 0 {
            Vec::new()
        } else {
            unsafe { slice::from_raw_parts(raw.altsetting, raw.num_altsetting as usize) }
                .iter()
                .map(|setting| unsafe { InterfaceDescriptor::from_raw(setting) })
                .collect()
        };
        Interface { alt_settings }
    }

    /// Interface number, taken from the first alternate setting.
    pub fn number(&self) -> u8 {
        self.alt_settings.first().map_or(0, |s| s.number())
    }

    pub fn alt_settings(&self) -> &[InterfaceDescriptor] {
        &self.alt_settings
    }
}

/// One alternate setting of an interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceDescriptor {
    number: u8,
    alternate_setting: u8,
    class: u8,
    sub_class: u8,
    protocol: u8,
    description_index: u8,
    endpoints: Vec<EndpointDescriptor>,
    extra: Vec<u8>,
}

impl InterfaceDescriptor {
    pub(crate) unsafe fn from_raw(
        raw: &usbffi::libusb_interface_descriptor,
    ) -> InterfaceDescriptor {
        let endpoints = if raw.endpoint.is_null() {
            Vec::new()
        } else {
            unsafe { slice::from_raw_parts(raw.endpoint, raw.bNumEndpoints as usize) }
                .iter()
                .map(|endpoint| unsafe { EndpointDescriptor::from_raw(endpoint) })
                .collect()
        };
        InterfaceDescriptor {
            number: raw.bInterfaceNumber,
            alternate_setting: raw.bAlternateSetting,
            class: raw.bInterfaceClass,
            sub_class: raw.bInterfaceSubClass,
            protocol: raw.bInterfaceProtocol,
            description_index: raw.iInterface,
            endpoints,
            extra: unsafe { copy_extra(raw.extra, raw.extra_length) },
        }
    }

    pub fn number(&self) -> u8 {
        self.number
    }

    pub fn alternate_setting(&self) -> u8 {
        self.alternate_setting
    }

    pub fn class_code(&self) -> u8 {
        self.class
    }

    pub fn sub_class_code(&self) -> u8 {
        self.sub_class
    }

    pub fn protocol_code(&self) -> u8 {
        self.protocol
    }

    pub fn description_string_index(&self) -> Option<u8> {
        nonzero_index(self.description_index)
    }

    pub fn endpoints(&self) -> &[EndpointDescriptor] {
        &self.endpoints
    }

    pub fn extra(&self) -> &[u8] {
        &self.extra
    }
}

/// An endpoint descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointDescriptor {
    address: u8,
    attributes: u8,
    max_packet_size: u16,
    interval: u8,
    refresh: u8,
    synch_address: u8,
    extra: Vec<u8>,
}

impl EndpointDescriptor {
    pub(crate) unsafe fn from_raw(raw: &usbffi::libusb_endpoint_descriptor) -> EndpointDescriptor {
        EndpointDescriptor {
            address: raw.bEndpointAddress,
            attributes: raw.bmAttributes,
            max_packet_size: raw.wMaxPacketSize,
            interval: raw.bInterval,
            refresh: raw.bRefresh,
            synch_address: raw.bSynchAddress,
            extra: unsafe { copy_extra(raw.extra, raw.extra_length) },
        }
    }

    /// Full endpoint address, direction bit included.
    pub fn address(&self) -> u8 {
        self.address
    }

    /// Endpoint number without the direction bit.
    pub fn number(&self) -> u8 {
        self.address & 0x0f
    }

    pub fn direction(&self) -> Direction {
        Direction::from_address(self.address)
    }

    pub fn transfer_kind(&self) -> TransferKind {
        TransferKind::from_attributes(self.attributes)
    }

    pub fn max_packet_size(&self) -> u16 {
        self.max_packet_size
    }

    /// Polling interval, in the unit defined by the device speed.
    pub fn interval(&self) -> u8 {
        self.interval
    }

    pub fn refresh(&self) -> u8 {
        self.refresh
    }

    pub fn synch_address(&self) -> u8 {
        self.synch_address
    }

    pub fn extra(&self) -> &[u8] {
        &self.extra
    }
}

fn nonzero_index(index: u8) -> Option<u8> {
    if index == 0 { None } else { Some(index) }
}

unsafe fn copy_extra(extra: *const libc::c_uchar, extra_length: libc::c_int) -> Vec<u8> {
    if extra.is_null() || extra_length <= 0 {
        Vec::new()
    } else {
        unsafe { slice::from_raw_parts(extra, extra_length as usize) }.to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem;

    fn raw_endpoint(
        address: u8,
        attributes: u8,
        extra: &[u8],
    ) -> usbffi::libusb_endpoint_descriptor {
        let mut raw: usbffi::libusb_endpoint_descriptor = unsafe { mem::zeroed() };
        raw.bLength = 7;
        raw.bDescriptorType = 0x05;
        raw.bEndpointAddress = address;
        raw.bmAttributes = attributes;
        raw.wMaxPacketSize = 512;
        raw.bInterval = 1;
        raw.extra = if extra.is_empty() {
            std::ptr::null()
        } else {
            extra.as_ptr()
        };
        raw.extra_length = extra.len() as libc::c_int;
        raw
    }

    #[test]
    fn test_endpoint_decoding() {
        let raw = raw_endpoint(0x81, 0x02, &[]);
        let endpoint = unsafe { EndpointDescriptor::from_raw(&raw) };
        assert_eq!(endpoint.address(), 0x81);
        assert_eq!(endpoint.number(), 1);
        assert_eq!(endpoint.direction(), Direction::In);
        assert_eq!(endpoint.transfer_kind(), TransferKind::Bulk);
        assert_eq!(endpoint.max_packet_size(), 512);
    }

    #[test]
    fn test_endpoint_extra_pass_through() {
        let class_specific = [0x07, 0x25, 0x01, 0x00, 0x00, 0x00, 0x00];
        let raw = raw_endpoint(0x02, 0x01, &class_specific);
        let endpoint = unsafe { EndpointDescriptor::from_raw(&raw) };
        assert_eq!(endpoint.extra(), &class_specific);
        assert_eq!(endpoint.transfer_kind(), TransferKind::Isochronous);
        assert_eq!(endpoint.direction(), Direction::Out);
    }

    #[test]
    fn test_interface_tree() {
        let endpoints = [raw_endpoint(0x81, 0x03, &[]), raw_endpoint(0x02, 0x03, &[])];
        let mut raw_iface: usbffi::libusb_interface_descriptor = unsafe { mem::zeroed() };
        raw_iface.bInterfaceNumber = 2;
        raw_iface.bAlternateSetting = 1;
        raw_iface.bInterfaceClass = 0x03;
        raw_iface.bInterfaceSubClass = 0x01;
        raw_iface.bInterfaceProtocol = 0x02;
        raw_iface.bNumEndpoints = endpoints.len() as u8;
        raw_iface.endpoint = endpoints.as_ptr();

        let iface = unsafe { InterfaceDescriptor::from_raw(&raw_iface) };
        assert_eq!(iface.number(), 2);
        assert_eq!(iface.alternate_setting(), 1);
        assert_eq!(
            (iface.class_code(), iface.sub_class_code(), iface.protocol_code()),
            (0x03, 0x01, 0x02)
        );
        assert_eq!(iface.endpoints().len(), 2);
        assert_eq!(iface.endpoints()[0].direction(), Direction::In);
        assert_eq!(iface.endpoints()[1].direction(), Direction::Out);
    }

    #[test]
    fn test_device_descriptor_fields() {
        let mut raw: usbffi::libusb_device_descriptor = unsafe { mem::zeroed() };
        raw.bcdUSB = 0x0210;
        raw.bDeviceClass = 0xef;
        raw.bDeviceSubClass = 0x02;
        raw.bDeviceProtocol = 0x01;
        raw.idVendor = 0x1d50;
        raw.idProduct = 0x6018;
        raw.iManufacturer = 1;
        raw.iSerialNumber = 0;
        raw.bNumConfigurations = 1;

        let descriptor = DeviceDescriptor::from_raw(&raw);
        assert_eq!(descriptor.vendor_id(), 0x1d50);
        assert_eq!(descriptor.product_id(), 0x6018);
        assert_eq!(
            (
                descriptor.class_code(),
                descriptor.sub_class_code(),
                descriptor.protocol_code()
            ),
            (0xef, 0x02, 0x01)
        );
        assert_eq!(descriptor.manufacturer_string_index(), Some(1));
        assert_eq!(descriptor.serial_number_string_index(), None);
        assert_eq!(descriptor.num_configurations(), 1);
    }
}
