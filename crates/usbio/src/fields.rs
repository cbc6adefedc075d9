//! Request and endpoint field helpers
//!
//! Small value types for composing control-request type bytes and decoding
//! endpoint addresses.

use libusb1_sys::constants::*;

/// Transfer direction, encoded in bit 7 of an endpoint address or of a
/// control request-type byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Host to device
    Out,
    /// Device to host
    In,
}

impl Direction {
    /// Decode the direction bit of an endpoint address or request-type byte.
    pub fn from_address(address: u8) -> Direction {
        if address & (LIBUSB_ENDPOINT_DIR_MASK as u8) == (LIBUSB_ENDPOINT_IN as u8) {
            Direction::In
        } else {
            Direction::Out
        }
    }
}

/// Kind of USB data exchange carried by an endpoint or a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferKind {
    Control,
    Isochronous,
    Bulk,
    Interrupt,
}

impl TransferKind {
    /// Decode the transfer-type bits of an endpoint `bmAttributes` field or a
    /// native transfer descriptor.
    pub fn from_attributes(attributes: u8) -> TransferKind {
        match attributes & 0x03 {
            x if x == LIBUSB_TRANSFER_TYPE_ISOCHRONOUS as u8 => TransferKind::Isochronous,
            x if x == LIBUSB_TRANSFER_TYPE_BULK as u8 => TransferKind::Bulk,
            x if x == LIBUSB_TRANSFER_TYPE_INTERRUPT as u8 => TransferKind::Interrupt,
            _ => TransferKind::Control,
        }
    }
}

/// Control request type, bits 5..6 of the request-type byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestType {
    Standard,
    Class,
    Vendor,
    Reserved,
}

/// Control request recipient, bits 0..4 of the request-type byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recipient {
    Device,
    Interface,
    Endpoint,
    Other,
}

/// Compose a control request-type byte from its three fields.
pub fn request_type(direction: Direction, request_type: RequestType, recipient: Recipient) -> u8 {
    let mut value: u8 = match recipient {
        Recipient::Device => 0x00,
        Recipient::Interface => 0x01,
        Recipient::Endpoint => 0x02,
        Recipient::Other => 0x03,
    };
    value |= match request_type {
        RequestType::Standard => 0x00,
        RequestType::Class => 0x20,
        RequestType::Vendor => 0x40,
        RequestType::Reserved => 0x60,
    };
    value |= match direction {
        Direction::Out => 0x00,
        Direction::In => 0x80,
    };
    value
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_type_composition() {
        assert_eq!(
            request_type(Direction::Out, RequestType::Vendor, Recipient::Device),
            0x40
        );
        assert_eq!(
            request_type(Direction::In, RequestType::Standard, Recipient::Device),
            0x80
        );
        assert_eq!(
            request_type(Direction::In, RequestType::Class, Recipient::Interface),
            0xa1
        );
        assert_eq!(
            request_type(Direction::Out, RequestType::Reserved, Recipient::Other),
            0x63
        );
    }

    #[test]
    fn test_transfer_kind_from_attributes() {
        assert_eq!(TransferKind::from_attributes(0x00), TransferKind::Control);
        assert_eq!(TransferKind::from_attributes(0x01), TransferKind::Isochronous);
        assert_eq!(TransferKind::from_attributes(0x02), TransferKind::Bulk);
        assert_eq!(TransferKind::from_attributes(0x03), TransferKind::Interrupt);
        // Upper synchronisation/usage bits do not change the kind
        assert_eq!(TransferKind::from_attributes(0x0d), TransferKind::Isochronous);
    }

    #[test]
    fn test_direction_from_address() {
        // Bit 7 = 1 means IN (device to host)
        assert_eq!(Direction::from_address(0x81), Direction::In);
        assert_eq!(Direction::from_address(0x01), Direction::Out);
        assert_eq!(Direction::from_address(0x40), Direction::Out);
        assert_eq!(Direction::from_address(0xc0), Direction::In);
    }
}
