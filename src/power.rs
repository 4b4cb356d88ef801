// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Power negotiation fallback.
//!
//! Some hosts (certain tablets, notably) read the configuration descriptor,
//! decide the advertised `bMaxPower` is more than they are willing to supply,
//! and then go quiet instead of saying so. The only symptom is that nothing
//! follows the GET_DESCRIPTOR. With [`PowerPolicy::LowerOnTimeout`], that
//! silence is detected, the advertised power is lowered, and the device drops
//! off the bus and comes back so the host can try again.

/// Whether to apply the fallback, and with what numbers.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PowerPolicy {
    /// Always advertise what the descriptor says.
    Disabled,
    LowerOnTimeout {
        /// How long the host may stay silent after reading the
        /// configuration descriptor.
        window_ms: u32,
        /// `bMaxPower` (2 mA units) to advertise after a timeout.
        fallback_max_power: u8,
    },
}

impl PowerPolicy {
    /// 100 ms of silence, then fall back to 100 mA.
    pub const TABLET_WORKAROUND: Self = Self::LowerOnTimeout {
        window_ms: 100,
        fallback_max_power: 50,
    };
}

impl Default for PowerPolicy {
    fn default() -> Self {
        Self::Disabled
    }
}

#[derive(Debug)]
pub struct PowerNegotiation {
    policy: PowerPolicy,
    armed_at: Option<u32>,
    lowered: Option<u8>,
}

impl PowerNegotiation {
    pub const fn new(policy: PowerPolicy) -> Self {
        Self {
            policy,
            armed_at: None,
            lowered: None,
        }
    }

    /// The configuration descriptor just went out.
    pub fn arm(&mut self, now: u32) {
        if matches!(self.policy, PowerPolicy::LowerOnTimeout { .. }) && self.lowered.is_none() {
            self.armed_at = Some(now);
        }
    }

    /// The host said something else; it's happy.
    pub fn disarm(&mut self) {
        self.armed_at = None;
    }

    pub fn is_armed(&self) -> bool {
        self.armed_at.is_some()
    }

    /// Checks the timer. Returns `true` exactly once, when the window has run
    /// out; from then on the lowered value is advertised.
    pub fn expired(&mut self, now: u32) -> bool {
        let (window_ms, fallback) = match self.policy {
            PowerPolicy::LowerOnTimeout {
                window_ms,
                fallback_max_power,
            } => (window_ms, fallback_max_power),
            PowerPolicy::Disabled => return false,
        };
        match self.armed_at {
            Some(t) if now.wrapping_sub(t) >= window_ms => {
                self.armed_at = None;
                self.lowered = Some(fallback);
                true
            }
            _ => false,
        }
    }

    /// Replacement for the descriptor's `bMaxPower`, if a fallback happened.
    pub fn max_power_override(&self) -> Option<u8> {
        self.lowered
    }
}
