// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Bounded-wait transmit for foreground code.
//!
//! The queues never push back on their own, so a producer that outruns the
//! host would eat the whole pool. [`TxChannel`] waits for the endpoint's
//! queue to drop below a limit, but only for so long: if the host isn't
//! reading (no terminal open, say) the send fails with
//! [`UsbError::Timeout`]. After one timeout the channel stops waiting
//! altogether until a packet gets through again, so a stalled host costs one
//! timeout rather than one per call.

use crate::config::System;
use crate::device::UsbController;
use crate::error::{Result, UsbError};
use crate::irq::Shared;
use crate::regs::Peripheral;
use crate::PACKET_SIZE;

#[derive(Debug)]
pub struct TxChannel {
    endpoint: usize,
    packet_limit: usize,
    timeout_ms: u32,
    previous_timeout: bool,
}

impl TxChannel {
    pub const fn new(endpoint: usize, packet_limit: usize, timeout_ms: u32) -> Self {
        Self {
            endpoint,
            packet_limit,
            timeout_ms,
            previous_timeout: false,
        }
    }

    pub fn endpoint(&self) -> usize {
        self.endpoint
    }

    /// Whether the last wait ran out.
    pub fn timed_out(&self) -> bool {
        self.previous_timeout
    }

    /// Sends `data`, split into packets.
    pub fn write<P, S, Y>(
        &mut self,
        usb: &Shared<UsbController<P, S>>,
        sys: &Y,
        data: &[u8],
    ) -> Result<()>
    where
        P: Peripheral,
        S: System,
        Y: System,
    {
        for chunk in data.chunks(PACKET_SIZE) {
            self.send(usb, sys, chunk)?;
        }
        Ok(())
    }

    /// Sends one packet of up to `PACKET_SIZE` bytes; anything past that is
    /// cut off.
    pub fn send<P, S, Y>(
        &mut self,
        usb: &Shared<UsbController<P, S>>,
        sys: &Y,
        data: &[u8],
    ) -> Result<()>
    where
        P: Peripheral,
        S: System,
        Y: System,
    {
        let endpoint = self.endpoint;
        let limit = self.packet_limit;
        let start = sys.millis();

        let mut packet = loop {
            let got = usb
                .lock(|u| {
                    if !u.configured() {
                        return Err(UsbError::NotConfigured);
                    }
                    if u.tx_packet_count(endpoint)? < limit {
                        Ok(u.alloc())
                    } else {
                        Ok(None)
                    }
                })
                .and_then(|r| r)?;
            if let Some(p) = got {
                break p;
            }
            if self.previous_timeout || sys.millis().wrapping_sub(start) > self.timeout_ms {
                self.previous_timeout = true;
                return Err(UsbError::Timeout);
            }
            sys.yield_now();
        };
        self.previous_timeout = false;

        usb.lock(move |u| {
            u.packet_mut(&mut packet).fill(data);
            u.tx(endpoint, packet)
        })
        .and_then(|r| r)
    }
}
