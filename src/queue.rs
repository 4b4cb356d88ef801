// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Endpoint queues for endpoints 1 and up.
//!
//! Each endpoint has a receive FIFO (packets the host sent that the firmware
//! hasn't picked up) and a transmit FIFO (packets waiting for a free bank).
//! FIFOs are linked through the packets' own `next` fields, so they cost two
//! slot numbers each and never run out of room on their own.
//!
//! Nothing here blocks or drops. Producers that care about backpressure look
//! at [`UsbController::tx_packet_count`] before queueing more.

use crate::bdt::{bdt_index, index_bank, index_direction, index_endpoint, stat_index, Bank, Direction};
use crate::config::System;
use crate::device::UsbController;
use crate::error::{Result, UsbError};
use crate::packet::{PacketHandle, PacketPool};
use crate::regs::{Peripheral, ENDPT_EPRXEN};
use crate::{NUM_ENDPOINTS, PACKET_SIZE};

/// Singly linked packet FIFO with running packet and byte counts.
///
/// The counts are kept up to date on every push and pop so they can be read
/// without walking the list. A packet's length must not change while it is
/// queued.
#[derive(Copy, Clone, Debug, Default)]
pub struct Fifo {
    first: Option<u8>,
    last: Option<u8>,
    packets: usize,
    bytes: usize,
}

impl Fifo {
    pub const EMPTY: Self = Self {
        first: None,
        last: None,
        packets: 0,
        bytes: 0,
    };

    pub fn is_empty(&self) -> bool {
        self.first.is_none()
    }

    pub fn len(&self) -> usize {
        self.packets
    }

    pub fn bytes(&self) -> usize {
        self.bytes
    }

    pub fn push(&mut self, pool: &mut PacketPool, packet: PacketHandle) {
        let n = packet.into_index();
        let slot = pool.slot_mut(n);
        slot.next = None;
        self.count_in(usize::from(slot.len));
        match self.last {
            Some(last) => pool.slot_mut(last).next = Some(n),
            None => self.first = Some(n),
        }
        self.last = Some(n);
    }

    /// Puts a packet back at the head, ahead of everything queued.
    pub fn push_front(&mut self, pool: &mut PacketPool, packet: PacketHandle) {
        let n = packet.into_index();
        let slot = pool.slot_mut(n);
        slot.next = self.first;
        self.count_in(usize::from(slot.len));
        if self.last.is_none() {
            self.last = Some(n);
        }
        self.first = Some(n);
    }

    pub fn pop(&mut self, pool: &mut PacketPool) -> Option<PacketHandle> {
        let n = self.first?;
        let slot = pool.slot_mut(n);
        self.first = slot.next.take();
        self.packets -= 1;
        self.bytes -= usize::from(slot.len);
        if self.first.is_none() {
            self.last = None;
        }
        Some(PacketHandle::from_index(n))
    }

    fn count_in(&mut self, len: usize) {
        self.packets += 1;
        self.bytes += len;
    }

    /// Returns every queued packet to the pool.
    pub fn drain(&mut self, pool: &mut PacketPool) {
        while let Some(p) = self.pop(pool) {
            pool.release(p);
        }
    }
}

/// FIFOs for endpoints 1..=NUM_ENDPOINTS. Index 0 is endpoint 1.
pub struct EndpointQueues {
    pub rx: [Fifo; NUM_ENDPOINTS],
    pub tx: [Fifo; NUM_ENDPOINTS],
}

impl EndpointQueues {
    pub const fn new() -> Self {
        Self {
            rx: [Fifo::EMPTY; NUM_ENDPOINTS],
            tx: [Fifo::EMPTY; NUM_ENDPOINTS],
        }
    }

    /// Empties every FIFO into the pool.
    pub fn clear(&mut self, pool: &mut PacketPool) {
        for f in self.rx.iter_mut().chain(self.tx.iter_mut()) {
            f.drain(pool);
        }
    }
}

/// Maps an endpoint number to its queue slot, rejecting endpoint 0 and
/// anything past the last endpoint.
pub(crate) fn queue_slot(ep: usize) -> Result<usize> {
    match ep {
        1..=NUM_ENDPOINTS => Ok(ep - 1),
        _ => Err(UsbError::InvalidEndpoint),
    }
}

impl<P: Peripheral, S: System> UsbController<P, S> {
    /// Takes a zeroed packet from the pool.
    pub fn alloc(&mut self) -> Option<PacketHandle> {
        let p = self.pool.alloc();
        if p.is_none() {
            trace!("usb: pool empty");
        }
        p
    }

    /// Gives a packet back. If a receive endpoint is waiting for a buffer it
    /// gets this one directly instead of the pool.
    pub fn free(&mut self, packet: PacketHandle) {
        if self.rx_memory_needed > 0 && self.configuration != 0 {
            self.rx_memory(packet);
        } else {
            self.pool.release(packet);
        }
    }

    /// Arms the first starved receive descriptor with `packet`.
    fn rx_memory(&mut self, packet: PacketHandle) {
        for ep in 1..=NUM_ENDPOINTS {
            if self.config.endpoint_config(ep) & ENDPT_EPRXEN == 0 {
                continue;
            }
            for bank in [Bank::Even, Bank::Odd] {
                let i = bdt_index(ep, Direction::Rx, bank);
                if self.bdt.entry(i).is_idle() && !self.bdt.has_packet(i) {
                    self.arm_rx(ep, bank, packet);
                    self.rx_memory_needed -= 1;
                    return;
                }
            }
        }
        // The count said someone was starved but nobody was.
        self.rx_memory_needed = 0;
        self.pool.release(packet);
    }

    /// Arms receive bank `bank` of `ep` with an empty packet.
    pub(crate) fn arm_rx(&mut self, ep: usize, bank: Bank, packet: PacketHandle) {
        let data1 = self.bdt.toggles(ep).rx_expects(bank);
        self.bdt
            .give_rx(bdt_index(ep, Direction::Rx, bank), packet, &self.pool, data1);
    }

    /// Arms transmit bank `bank` of `ep` with the next packet to go out.
    fn arm_tx(&mut self, ep: usize, bank: Bank, packet: PacketHandle) {
        let data1 = self.bdt.toggles_mut(ep).next_tx();
        self.bdt
            .give_tx(bdt_index(ep, Direction::Tx, bank), packet, &self.pool, data1);
    }

    /// Moves queued packets into free transmit banks.
    fn tx_refill(&mut self, ep: usize, slot: usize) {
        while let Some((bank, next)) = self.bdt.tx_state(ep).claim() {
            let packet = match self.queues.tx[slot].pop(&mut self.pool) {
                Some(p) => p,
                None => break,
            };
            self.bdt.set_tx_state(ep, next);
            self.arm_tx(ep, bank, packet);
        }
    }

    /// Sends `packet` on endpoint `ep`. It goes straight into a free bank if
    /// there is one, otherwise to the back of the endpoint's queue.
    ///
    /// On error the packet has already been returned to the pool.
    pub fn tx(&mut self, ep: usize, packet: PacketHandle) -> Result<()> {
        let slot = match queue_slot(ep) {
            Ok(slot) => slot,
            Err(e) => {
                self.pool.release(packet);
                return Err(e);
            }
        };
        if self.configuration == 0 {
            self.free(packet);
            return Err(UsbError::NotConfigured);
        }
        match self.bdt.tx_state(ep).claim() {
            Some((bank, next)) => {
                self.bdt.set_tx_state(ep, next);
                self.arm_tx(ep, bank, packet);
            }
            None => self.queues.tx[slot].push(&mut self.pool, packet),
        }
        Ok(())
    }

    /// Copies `data` (up to one packet) into a fresh packet and sends it.
    /// Never waits; see [`TxChannel`](crate::TxChannel) for that.
    pub fn send(&mut self, ep: usize, data: &[u8]) -> Result<()> {
        queue_slot(ep)?;
        if self.configuration == 0 {
            return Err(UsbError::NotConfigured);
        }
        let mut packet = self.alloc().ok_or(UsbError::NoPacket)?;
        self.pool.get_mut(&mut packet).fill(data);
        self.tx(ep, packet)
    }

    /// Takes the oldest received packet off endpoint `ep`, if there is one.
    /// The caller owns it and must [`free`](Self::free) it.
    pub fn rx(&mut self, ep: usize) -> Result<Option<PacketHandle>> {
        let slot = queue_slot(ep)?;
        Ok(self.queues.rx[slot].pop(&mut self.pool))
    }

    /// Bytes received on `ep` and not yet taken with [`rx`](Self::rx).
    pub fn rx_byte_count(&self, ep: usize) -> Result<usize> {
        Ok(self.queues.rx[queue_slot(ep)?].bytes())
    }

    pub fn rx_packet_count(&self, ep: usize) -> Result<usize> {
        Ok(self.queues.rx[queue_slot(ep)?].len())
    }

    /// Bytes queued for `ep` that have not reached a bank yet.
    pub fn tx_byte_count(&self, ep: usize) -> Result<usize> {
        Ok(self.queues.tx[queue_slot(ep)?].bytes())
    }

    /// Packets queued for `ep` that have not reached a bank yet.
    pub fn tx_packet_count(&self, ep: usize) -> Result<usize> {
        Ok(self.queues.tx[queue_slot(ep)?].len())
    }

    /// CLEAR_FEATURE(ENDPOINT_HALT): the next packet on `ep` in direction
    /// `dir` is DATA0. Nothing queued or armed is lost.
    pub(crate) fn reset_data_toggle(&mut self, ep: usize, dir: Direction) {
        let slot = match queue_slot(ep) {
            Ok(slot) => slot,
            Err(_) => return,
        };
        match dir {
            Direction::Tx => {
                // Armed packets carry the old toggles. Take them back and
                // send them again, in the same order.
                let state = self.bdt.tx_state(ep);
                for &bank in state.pending().iter().rev() {
                    let i = bdt_index(ep, Direction::Tx, bank);
                    self.bdt.entry_mut(i).release();
                    if let Some(p) = self.bdt.take_packet(i) {
                        self.queues.tx[slot].push_front(&mut self.pool, p);
                    }
                }
                self.bdt.set_tx_state(ep, state.reset());
                self.bdt.toggles_mut(ep).reset_tx();
                self.tx_refill(ep, slot);
            }
            Direction::Rx => {
                self.bdt.toggles_mut(ep).reset_rx();
                for bank in [Bank::Even, Bank::Odd] {
                    let i = bdt_index(ep, Direction::Rx, bank);
                    if self.bdt.entry(i).is_owned() {
                        let data1 = self.bdt.toggles(ep).rx_expects(bank);
                        self.bdt.entry_mut(i).rearm(PACKET_SIZE, data1);
                    }
                }
            }
        }
    }

    /// Handles a completed token on endpoint 1 or up. Runs in the interrupt
    /// handler.
    pub(crate) fn endpoint_token(&mut self, stat: u8) {
        let i = stat_index(stat);
        let ep = index_endpoint(i);
        let bank = index_bank(i);
        let slot = match queue_slot(ep) {
            Ok(slot) => slot,
            Err(_) => return,
        };

        match index_direction(i) {
            Direction::Tx => {
                if let Some(sent) = self.bdt.take_packet(i) {
                    self.free(sent);
                }
                let state = self.bdt.tx_state(ep);
                match self.queues.tx[slot].pop(&mut self.pool) {
                    Some(next) => {
                        self.arm_tx(ep, bank, next);
                        self.bdt.set_tx_state(ep, state.complete(bank, true));
                    }
                    None => self.bdt.set_tx_state(ep, state.complete(bank, false)),
                }
            }
            Direction::Rx => {
                let len = self.bdt.entry(i).byte_count();
                let mut packet = match self.bdt.take_packet(i) {
                    Some(p) => p,
                    None => return,
                };
                self.bdt.toggles_mut(ep).rx_done(bank);
                if len == 0 {
                    // Nothing arrived; use the same buffer again.
                    self.arm_rx(ep, bank, packet);
                    return;
                }
                let p = self.pool.get_mut(&mut packet);
                p.len = len as u16;
                p.index = 0;
                self.queues.rx[slot].push(&mut self.pool, packet);

                match self.pool.alloc() {
                    Some(fresh) => self.arm_rx(ep, bank, fresh),
                    None => {
                        warn!("usb: ep{} rx starved", ep);
                        self.bdt.entry_mut(i).release();
                        self.rx_memory_needed += 1;
                    }
                }
            }
        }
    }
}
