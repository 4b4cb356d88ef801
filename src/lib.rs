// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! USB full-speed device driver for the Kinetis K20 USB-FS controller.
//!
//! This is the USB core of a keyboard controller: it gets the device through
//! enumeration, answers control requests on endpoint 0, and moves 64-byte
//! packets between firmware and the host on the other endpoints. It does
//! this without a heap or an OS, from one interrupt handler plus a foreground
//! loop.
//!
//! The pieces, from the bottom up:
//!
//! - [`packet`]: a fixed pool of 64-byte packets. A packet always has exactly
//!   one owner: the pool, a queue, a buffer descriptor, or whoever holds its
//!   [`PacketHandle`].
//! - [`bdt`]: the buffer descriptor table the controller DMAs through, and the
//!   even/odd bank bookkeeping for transmit endpoints.
//! - [`queue`]: per-endpoint FIFOs and the `tx`/`rx` API.
//! - [`control`]: the endpoint 0 state machine.
//! - `enumeration`: bus reset, SET_CONFIGURATION, and
//!   [`reinit`](UsbController::reinit).
//! - [`power`]: an optional workaround for hosts that silently refuse our
//!   power request.
//! - [`device`]: [`UsbController`], which owns all of the above.
//!
//! The interrupt handler and foreground code share the controller through
//! [`irq::Shared`], which masks interrupts for the duration of each access.
//!
//! Register access goes through the [`regs::Peripheral`] trait, so the whole
//! driver also runs on a development host against a simulated controller,
//! which is how it is tested.

#![cfg_attr(not(test), no_std)]

#[macro_use]
mod log;

pub mod bdt;
pub mod class;
pub mod config;
pub mod control;
pub mod descriptor;
pub mod device;
mod enumeration;
pub mod error;
pub mod irq;
pub mod packet;
pub mod power;
pub mod queue;
pub mod regs;
pub mod sender;
pub mod setup;

#[cfg(test)]
mod tests;

pub use config::{System, UsbDeviceConfiguration};
pub use device::UsbController;
pub use error::{Result, UsbError};
pub use packet::{Packet, PacketHandle};
pub use power::PowerPolicy;
pub use regs::{Kinetis, Peripheral};
pub use sender::TxChannel;

cfg_if::cfg_if! {
    if #[cfg(feature = "ep0-32")] {
        /// Maximum packet size of endpoint 0.
        pub const EP0_SIZE: usize = 32;
    } else {
        /// Maximum packet size of endpoint 0.
        pub const EP0_SIZE: usize = 64;
    }
}

/// Endpoints besides endpoint 0.
pub const NUM_ENDPOINTS: usize = 15;

/// Packets in the pool.
pub const NUM_USB_BUFFERS: usize = 30;

/// Size of a pool packet, and the maximum packet size of every endpoint but 0.
pub const PACKET_SIZE: usize = 64;
