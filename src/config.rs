// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Static device configuration and the services the driver borrows from the
//! rest of the firmware.

use crate::descriptor::DescriptorEntry;
use crate::power::PowerPolicy;
use crate::NUM_ENDPOINTS;

/// Everything about the device that is fixed at build time: what the host is
/// told, and how the endpoints are wired up to match.
///
/// Only the driver's *behavior* hangs off this record. The descriptor bytes
/// themselves are produced elsewhere and simply looked up here.
pub struct UsbDeviceConfiguration {
    /// Descriptors served by GET_DESCRIPTOR, keyed by `(wValue, wIndex)`.
    pub descriptors: &'static [DescriptorEntry],

    /// ENDPT register value for endpoints 1..=NUM_ENDPOINTS, in order. Use the
    /// `ENDPOINT_*` constants from [`crate::regs`].
    pub endpoints: [u8; NUM_ENDPOINTS],

    /// Interface numbers that answer HID class requests.
    pub hid_interfaces: &'static [u8],

    /// Interface number of the CDC-ACM communication interface, if any.
    pub cdc_interface: Option<u8>,

    /// A SET_LINE_CODING with this baud rate asks for a jump to the
    /// bootloader. `None` disables the feature.
    pub reboot_baud: Option<u32>,

    pub power: PowerPolicy,
}

impl UsbDeviceConfiguration {
    /// Baud rate that traditionally means "reboot into the loader".
    pub const DEFAULT_REBOOT_BAUD: u32 = 134;

    /// ENDPT configuration byte for endpoint `ep` (1-based).
    pub fn endpoint_config(&self, ep: usize) -> u8 {
        match ep {
            1..=NUM_ENDPOINTS => self.endpoints[ep - 1],
            _ => 0,
        }
    }

    pub fn is_cdc_interface(&self, interface: u16) -> bool {
        self.cdc_interface.map(u16::from) == Some(interface)
    }
}

/// Services from the surrounding firmware.
pub trait System {
    /// Milliseconds since boot. Wraps.
    fn millis(&self) -> u32;

    /// Called on every iteration of a bounded wait, to let other foreground
    /// work make progress.
    fn yield_now(&self);

    /// Jumps to the bootloader. On real hardware this does not return.
    fn device_reload(&self);
}

impl<T: System> System for &T {
    fn millis(&self) -> u32 {
        (**self).millis()
    }

    fn yield_now(&self) {
        (**self).yield_now()
    }

    fn device_reload(&self) {
        (**self).device_reload()
    }
}
