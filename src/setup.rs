// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! SETUP packets and the requests we understand.

use byteorder::LittleEndian;
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;
use zerocopy::{AsBytes, FromBytes, Unaligned, U16};

/// USB deals in two different transfer directions, called OUT (host-to-device)
/// and IN (device-to-host). In `bmRequestType` and in endpoint addresses, IN is
/// the top bit.
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive)]
pub enum UsbDir {
    Out = 0,
    In = 0x80,
}

impl UsbDir {
    pub const fn endpoint(self, num: u8) -> u8 {
        num | self as u8
    }

    pub const fn of_endpoint_addr(addr: u8) -> Self {
        if addr & Self::In as u8 != 0 {
            Self::In
        } else {
            Self::Out
        }
    }
}

/// Bits 6:5 of `bmRequestType`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive)]
pub enum RequestKind {
    Standard = 0,
    Class = 1,
    Vendor = 2,
}

/// Bits 4:0 of `bmRequestType`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive)]
pub enum Recipient {
    Device = 0,
    Interface = 1,
    Endpoint = 2,
    Other = 3,
}

/// Standard requests, chapter 9.
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive)]
pub enum StandardRequest {
    GetStatus = 0x00,
    ClearFeature = 0x01,
    SetFeature = 0x03,
    SetAddress = 0x05,
    GetDescriptor = 0x06,
    GetConfiguration = 0x08,
    SetConfiguration = 0x09,
}

/// HID class requests.
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive)]
pub enum HidRequest {
    GetReport = 0x01,
    GetIdle = 0x02,
    GetProtocol = 0x03,
    SetReport = 0x09,
    SetIdle = 0x0A,
    SetProtocol = 0x0B,
}

/// CDC-ACM class requests.
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive)]
pub enum CdcRequest {
    SetLineCoding = 0x20,
    GetLineCoding = 0x21,
    SetControlLineState = 0x22,
    SendBreak = 0x23,
}

/// Feature selectors for SET_FEATURE / CLEAR_FEATURE.
pub const FEATURE_ENDPOINT_HALT: u16 = 0;
pub const FEATURE_DEVICE_REMOTE_WAKEUP: u16 = 1;

/// Layout of an 8-byte USB SETUP packet.
#[repr(C)]
#[derive(Copy, Clone, Debug, AsBytes, FromBytes, Unaligned)]
pub struct SetupPacket {
    /// Direction, kind and recipient, see [`SetupPacket::direction`] and
    /// friends.
    pub request_type: u8,
    pub request: u8,
    /// A simple argument of up to 16 bits, specific to the request.
    pub value: U16<LittleEndian>,
    /// Usually an interface or endpoint number.
    pub index: U16<LittleEndian>,
    /// If data will be transferred after this request (in the direction given
    /// by `request_type`), this gives the number of bytes (OUT) or maximum
    /// number of bytes (IN).
    pub length: U16<LittleEndian>,
}

impl SetupPacket {
    pub const EMPTY: Self = Self {
        request_type: 0,
        request: 0,
        value: U16::from_bytes([0; 2]),
        index: U16::from_bytes([0; 2]),
        length: U16::from_bytes([0; 2]),
    };

    /// Reinterprets the first 8 bytes of `bytes`.
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        Self::read_from(bytes.get(..8)?)
    }

    pub fn direction(&self) -> UsbDir {
        UsbDir::of_endpoint_addr(self.request_type)
    }

    pub fn kind(&self) -> Option<RequestKind> {
        RequestKind::from_u8((self.request_type >> 5) & 0x3)
    }

    pub fn recipient(&self) -> Option<Recipient> {
        Recipient::from_u8(self.request_type & 0x1F)
    }
}
