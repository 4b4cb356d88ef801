// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Errors returned by the foreground API.
//!
//! Protocol errors on endpoint 0 never show up here. Those are answered on
//! the wire with a STALL handshake and the control engine goes back to idle.

use core::fmt;

/// Result type for the foreground API.
pub type Result<T> = core::result::Result<T, UsbError>;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum UsbError {
    /// Endpoint number outside `1..=NUM_ENDPOINTS`.
    InvalidEndpoint,
    /// The host has not selected a configuration (or has reset us since).
    NotConfigured,
    /// The host did not drain the endpoint within the allowed time.
    Timeout,
    /// Every packet in the pool is in use.
    NoPacket,
    /// The shared controller cell was used before a controller was installed.
    Uninitialized,
    /// Remote wakeup was requested but the host never enabled it.
    RemoteWakeupDisabled,
}

impl fmt::Display for UsbError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidEndpoint => write!(f, "invalid endpoint number"),
            Self::NotConfigured => write!(f, "device not configured"),
            Self::Timeout => write!(f, "transmit timeout"),
            Self::NoPacket => write!(f, "packet pool exhausted"),
            Self::Uninitialized => write!(f, "controller not installed"),
            Self::RemoteWakeupDisabled => write!(f, "remote wakeup not enabled by host"),
        }
    }
}
