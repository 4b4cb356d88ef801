// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Descriptor layouts and the lookup table GET_DESCRIPTOR is served from.
//!
//! The driver does not build descriptors. Firmware hands it a table of
//! `(wValue, wIndex) -> bytes` entries, usually assembled from the structs
//! below with `zerocopy::AsBytes`.

use byteorder::LittleEndian;
use num_derive::FromPrimitive;
use zerocopy::{AsBytes, U16};

/// One GET_DESCRIPTOR answer.
#[derive(Copy, Clone, Debug)]
pub struct DescriptorEntry {
    /// Descriptor type in the high byte, index in the low byte.
    pub value: u16,
    /// Language ID for strings, interface number for class descriptors,
    /// otherwise zero.
    pub index: u16,
    pub data: &'static [u8],
}

impl DescriptorEntry {
    pub const fn new(value: u16, index: u16, data: &'static [u8]) -> Self {
        Self { value, index, data }
    }

    /// Number of bytes to send.
    ///
    /// String descriptors carry their own length in their first byte, which
    /// lets a string be built into a bigger buffer at runtime (a serial
    /// number, say).
    pub fn len(&self) -> usize {
        if self.value >> 8 == UsbDescType::String as u16 {
            match self.data.first() {
                Some(&n) => usize::from(n).min(self.data.len()),
                None => 0,
            }
        } else {
            self.data.len()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The bytes that [`DescriptorEntry::len`] counts.
    pub fn bytes(&self) -> &'static [u8] {
        &self.data[..self.len()]
    }
}

/// Finds the descriptor registered for `(value, index)`.
pub fn find(table: &[DescriptorEntry], value: u16, index: u16) -> Option<&DescriptorEntry> {
    table.iter().find(|d| d.value == value && d.index == index)
}

/// Builds a string descriptor from ASCII text. `N` must be `2 + 2 * len`.
pub const fn ascii_string<const N: usize>(s: &str) -> [u8; N] {
    let bytes = s.as_bytes();
    assert!(N == 2 + 2 * bytes.len() && N <= 255);
    let mut out = [0u8; N];
    out[0] = N as u8;
    out[1] = UsbDescType::String as u8;
    let mut i = 0;
    while i < bytes.len() {
        out[2 + 2 * i] = bytes[i];
        i += 1;
    }
    out
}

/// Writes `id` as eight hex digits into a string descriptor.
pub fn serial_number(id: u32, out: &mut [u8; 18]) -> &[u8] {
    const HEX: &[u8; 16] = b"0123456789ABCDEF";
    out[0] = 18;
    out[1] = UsbDescType::String as u8;
    for i in 0..8 {
        let nibble = (id >> (28 - 4 * i)) & 0xF;
        out[2 + 2 * i] = HEX[nibble as usize];
        out[3 + 2 * i] = 0;
    }
    &out[..]
}

/// Describes a device. This is the most broad description in USB and is
/// typically the first thing the host asks for.
#[repr(C)]
#[derive(Debug, AsBytes)]
pub struct UsbDeviceDescriptor {
    /// Length of this structure, must be 18.
    pub length: u8,
    /// Type of this descriptor, must be `Device`.
    pub descriptor_type: UsbDescType,
    /// USB version in BCD, `0x0200` for a full-speed USB 2.0 device.
    pub bcd_usb: U16<LittleEndian>,
    pub device_class: u8,
    pub device_subclass: u8,
    pub device_protocol: u8,
    /// Must match `EP0_SIZE`.
    pub max_packet_size0: u8,
    pub vendor: U16<LittleEndian>,
    pub product: U16<LittleEndian>,
    pub bcd_device: U16<LittleEndian>,
    /// String descriptor indices, zero for none.
    pub manufacturer_s: u8,
    pub product_s: u8,
    pub serial_s: u8,
    pub num_configurations: u8,
}

/// Header of a configuration. It is followed on the wire by every interface,
/// class and endpoint descriptor in the configuration.
#[repr(C)]
#[derive(Debug, AsBytes)]
pub struct UsbConfigurationDescriptor {
    /// Length of this structure, must be 9.
    pub length: u8,
    pub descriptor_type: UsbDescType,
    /// Length of the whole configuration tree, this header included.
    pub total_length: U16<LittleEndian>,
    pub num_interfaces: u8,
    /// Value the host passes to SET_CONFIGURATION to pick this one.
    pub configuration_value: u8,
    pub configuration_s: u8,
    /// Bit 7 must be set; bit 6 is self-powered, bit 5 remote wakeup.
    pub attributes: u8,
    /// Maximum bus current in units of 2 mA.
    pub max_power: u8,
}

impl UsbConfigurationDescriptor {
    /// Offset of `max_power` within the configuration tree.
    pub const MAX_POWER_OFFSET: usize = 8;
}

#[repr(C)]
#[derive(Debug, AsBytes)]
pub struct UsbInterfaceDescriptor {
    /// Length of this structure, must be 9.
    pub length: u8,
    pub descriptor_type: UsbDescType,
    pub interface_number: u8,
    pub alternate_setting: u8,
    pub num_endpoints: u8,
    pub interface_class: u8,
    pub interface_subclass: u8,
    pub interface_protocol: u8,
    pub interface_s: u8,
}

#[repr(C)]
#[derive(Debug, AsBytes)]
pub struct UsbEndpointDescriptor {
    /// Length of this struct, must be 7.
    pub length: u8,
    pub descriptor_type: UsbDescType,
    /// Endpoint number in the bottom 4 bits, IN in the top bit.
    pub endpoint_address: u8,
    /// Transfer type in the bottom 2 bits, see `UsbTransferType`.
    pub attributes: u8,
    pub max_packet_size: U16<LittleEndian>,
    /// Polling interval for interrupt endpoints, in frames.
    pub interval: u8,
}

/// Types of USB descriptor.
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive, AsBytes)]
#[repr(u8)]
pub enum UsbDescType {
    Device = 0x01,
    Config = 0x02,
    String = 0x03,
    Interface = 0x04,
    Endpoint = 0x05,
    Hid = 0x21,
    HidReport = 0x22,
}

/// Values for the bottom bits of `UsbEndpointDescriptor::attributes`.
#[derive(Copy, Clone, Debug, FromPrimitive, AsBytes)]
#[repr(u8)]
pub enum UsbTransferType {
    Control = 0,
    Bulk = 2,
    Interrupt = 3,
}
