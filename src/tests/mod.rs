// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Whole-driver tests against a simulated controller and host.


mod endpoints;

pub use host::{Handshake, Host};
pub use mock::{MockPeripheral, MockSystem};

use crate::descriptor::{ascii_string, DescriptorEntry};
use crate::power::PowerPolicy;
use crate::regs::{
    ENDPOINT_RECEIVE_ONLY, ENDPOINT_TRANSMIT_AND_RECEIVE, ENDPOINT_TRANSMIT_ONLY, ENDPOINT_UNUSED,
};
use crate::{UsbController, UsbDeviceConfiguration, EP0_SIZE, NUM_ENDPOINTS};

pub type Dev = UsbController<MockPeripheral, MockSystem>;

/// Endpoints in the test configuration.
pub const EP_RX: usize = 1;
pub const EP_TX: usize = 2;
pub const EP_BOTH: usize = 3;

pub const CONFIG_LEN: usize = 2 * EP0_SIZE;
pub const REPORT_LEN: usize = EP0_SIZE + 36;
pub const MAX_POWER: u8 = 250;

pub static DEVICE: [u8; 18] = [
    18, 0x01, 0x00, 0x02, 0, 0, 0, EP0_SIZE as u8, 0xC0, 0x16, 0x7C, 0x04, 0x00, 0x01, 1, 2, 3, 1,
];

/// A configuration tree exactly two endpoint 0 packets long.
pub static CONFIG_TREE: [u8; CONFIG_LEN] = {
    let mut t = [0u8; CONFIG_LEN];
    t[0] = 9;
    t[1] = 0x02;
    t[2] = CONFIG_LEN as u8;
    t[3] = (CONFIG_LEN >> 8) as u8;
    t[4] = 2;
    t[5] = 1;
    t[7] = 0xA0;
    t[8] = MAX_POWER;
    let mut i = 9;
    while i < CONFIG_LEN {
        t[i] = i as u8;
        i += 1;
    }
    t
};

pub static REPORT: [u8; REPORT_LEN] = {
    let mut r = [0u8; REPORT_LEN];
    let mut i = 0;
    while i < REPORT_LEN {
        r[i] = (i as u8).wrapping_mul(7);
        i += 1;
    }
    r
};

static LANG: [u8; 4] = [4, 0x03, 0x09, 0x04];
static PRODUCT: [u8; 8] = ascii_string("Kbd");
/// Serial number in a buffer with room to spare, as firmware builds it.
pub static SERIAL: [u8; 24] = {
    let mut s = [0xEE; 24];
    s[0] = 18;
    s[1] = 0x03;
    let mut i = 0;
    while i < 8 {
        s[2 + 2 * i] = b'0' + i as u8;
        s[3 + 2 * i] = 0;
        i += 1;
    }
    s
};

static DESCRIPTORS: [DescriptorEntry; 6] = [
    DescriptorEntry::new(0x0100, 0, &DEVICE),
    DescriptorEntry::new(0x0200, 0, &CONFIG_TREE),
    DescriptorEntry::new(0x0300, 0, &LANG),
    DescriptorEntry::new(0x0302, 0x0409, &PRODUCT),
    DescriptorEntry::new(0x0303, 0x0409, &SERIAL),
    DescriptorEntry::new(0x2200, 0, &REPORT),
];

const ENDPOINTS: [u8; NUM_ENDPOINTS] = {
    let mut e = [ENDPOINT_UNUSED; NUM_ENDPOINTS];
    e[EP_RX - 1] = ENDPOINT_RECEIVE_ONLY;
    e[EP_TX - 1] = ENDPOINT_TRANSMIT_ONLY;
    e[EP_BOTH - 1] = ENDPOINT_TRANSMIT_AND_RECEIVE;
    e
};

pub static CONFIG: UsbDeviceConfiguration = UsbDeviceConfiguration {
    descriptors: &DESCRIPTORS,
    endpoints: ENDPOINTS,
    hid_interfaces: &[0],
    cdc_interface: Some(1),
    reboot_baud: Some(UsbDeviceConfiguration::DEFAULT_REBOOT_BAUD),
    power: PowerPolicy::Disabled,
};

pub static TABLET_CONFIG: UsbDeviceConfiguration = UsbDeviceConfiguration {
    descriptors: &DESCRIPTORS,
    endpoints: ENDPOINTS,
    hid_interfaces: &[0],
    cdc_interface: Some(1),
    reboot_baud: None,
    power: PowerPolicy::TABLET_WORKAROUND,
};

/// Receive descriptors armed by a configuration: two banks on each of the
/// two receiving endpoints.
pub const RX_ARMED: usize = 4;

pub fn request(request_type: u8, request: u8, value: u16, index: u16, length: u16) -> [u8; 8] {
    let v = value.to_le_bytes();
    let i = index.to_le_bytes();
    let l = length.to_le_bytes();
    [request_type, request, v[0], v[1], i[0], i[1], l[0], l[1]]
}

pub fn get_descriptor(value: u16, index: u16, length: u16) -> [u8; 8] {
    request(0x80, 0x06, value, index, length)
}

pub fn set_configuration(value: u8) -> [u8; 8] {
    request(0x00, 0x09, u16::from(value), 0, 0)
}

pub fn device(config: &'static UsbDeviceConfiguration) -> Dev {
    let mut usb = UsbController::new(MockPeripheral::new(), MockSystem::new(), config);
    usb.init();
    usb
}

/// A device the host has reset, addressed and configured.
pub fn enumerated(config: &'static UsbDeviceConfiguration) -> (Dev, Host) {
    let mut usb = device(config);
    let mut host = Host::new();
    host.reset(&mut usb);
    assert!(host.control_out(&mut usb, request(0x00, 0x05, 7, 0, 0), &[]));
    assert!(host.control_out(&mut usb, set_configuration(1), &[]));
    assert!(usb.configured());
    (usb, host)
}
