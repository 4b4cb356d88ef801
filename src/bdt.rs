// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Buffer descriptor table.
//!
//! The USB-FS block finds its buffers through a table in ordinary RAM, four
//! descriptors per endpoint: RX even, RX odd, TX even, TX odd. That order is
//! what lets the `STAT` register be turned into a table index with a single
//! shift. The table must be 512-byte aligned; its address goes into the
//! BDTPAGE registers.
//!
//! A descriptor with `OWN` set belongs to the controller, which may be reading
//! or writing its buffer right now. Software must not touch such a descriptor
//! (except to cancel it outright) until the controller clears `OWN`.
//!
//! Alongside the hardware table we keep a shadow that records which pool
//! packet each descriptor points at. The hardware only knows addresses; the
//! shadow is what lets the packet be given back to its owner afterwards.

use crate::packet::{PacketHandle, PacketPool};
use crate::{NUM_ENDPOINTS, PACKET_SIZE};

/// Descriptors in the table: RX/TX times even/odd for endpoint 0 and every
/// other endpoint.
pub const BDT_ENTRIES: usize = (NUM_ENDPOINTS + 1) * 4;

pub const BDT_OWN: u32 = 0x80;
pub const BDT_DATA1: u32 = 0x40;
pub const BDT_DTS: u32 = 0x08;
pub const BDT_STALL: u32 = 0x04;

/// Token PIDs as the controller reports them in a completed descriptor.
pub const PID_OUT: u8 = 0x1;
pub const PID_OUT_ALT: u8 = 0x2;
pub const PID_IN: u8 = 0x9;
pub const PID_SETUP: u8 = 0xD;

/// One hardware buffer descriptor.
///
/// Fields are accessed with volatile operations because the controller reads
/// and writes them behind our back.
#[repr(C)]
pub struct BufferDescriptor {
    desc: u32,
    addr: u32,
}

impl BufferDescriptor {
    pub const EMPTY: Self = Self { desc: 0, addr: 0 };

    #[inline]
    pub fn desc(&self) -> u32 {
        // Safety: plain aligned field of self.
        unsafe { core::ptr::read_volatile(&self.desc) }
    }

    #[inline]
    pub fn addr(&self) -> u32 {
        unsafe { core::ptr::read_volatile(&self.addr) }
    }

    #[inline]
    fn set_desc(&mut self, value: u32) {
        unsafe { core::ptr::write_volatile(&mut self.desc, value) }
    }

    /// Points the descriptor at `addr` and hands it to the controller. The
    /// address goes in first: the controller may start using the descriptor
    /// the moment `OWN` lands.
    pub fn arm(&mut self, addr: u32, len: usize, data1: bool) {
        unsafe { core::ptr::write_volatile(&mut self.addr, addr) };
        self.rearm(len, data1);
    }

    /// Hands the descriptor back to the controller with its current address.
    pub fn rearm(&mut self, len: usize, data1: bool) {
        let toggle = if data1 { BDT_DATA1 } else { 0 };
        self.set_desc(BDT_OWN | BDT_DTS | toggle | ((len as u32) << 16));
    }

    /// Takes the descriptor away from the controller (or marks it unused).
    pub fn release(&mut self) {
        self.set_desc(0);
    }

    pub fn is_owned(&self) -> bool {
        self.desc() & BDT_OWN != 0
    }

    /// A descriptor with nothing in it: not owned, no count, no toggle.
    pub fn is_idle(&self) -> bool {
        self.desc() == 0
    }

    pub fn byte_count(&self) -> usize {
        (self.desc() >> 16) as usize & 0x3FF
    }

    pub fn pid(&self) -> u8 {
        ((self.desc() >> 2) & 0xF) as u8
    }

    pub fn data1(&self) -> bool {
        self.desc() & BDT_DATA1 != 0
    }

    /// What the controller does when a transaction on this descriptor ends:
    /// `OWN` cleared, the token PID and byte count written back.
    #[cfg(test)]
    pub(crate) fn hw_complete(&mut self, pid: u8, len: usize) {
        let keep = self.desc() & BDT_DATA1;
        self.set_desc(keep | (u32::from(pid & 0xF) << 2) | ((len as u32) << 16));
    }
}

/// The table itself, laid out for the controller.
#[repr(C, align(512))]
pub struct BdtTable {
    pub entries: [BufferDescriptor; BDT_ENTRIES],
}

const _: () = assert!(core::mem::size_of::<BdtTable>() == 512);

impl BdtTable {
    pub const fn new() -> Self {
        Self {
            entries: [BufferDescriptor::EMPTY; BDT_ENTRIES],
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Bank {
    Even = 0,
    Odd = 1,
}

impl Bank {
    pub fn other(self) -> Self {
        match self {
            Bank::Even => Bank::Odd,
            Bank::Odd => Bank::Even,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Direction {
    Rx = 0,
    Tx = 1,
}

/// Table index of a descriptor.
pub const fn bdt_index(ep: usize, dir: Direction, bank: Bank) -> usize {
    (ep << 2) | ((dir as usize) << 1) | bank as usize
}

/// Table index of the descriptor a completed token used, from `STAT`.
pub const fn stat_index(stat: u8) -> usize {
    (stat >> 2) as usize
}

pub const fn index_endpoint(index: usize) -> usize {
    index >> 2
}

pub const fn index_direction(index: usize) -> Direction {
    if index & 2 != 0 {
        Direction::Tx
    } else {
        Direction::Rx
    }
}

pub const fn index_bank(index: usize) -> Bank {
    if index & 1 != 0 {
        Bank::Odd
    } else {
        Bank::Even
    }
}

/// Which transmit banks of an endpoint are free, and which one the
/// controller will use next.
///
/// The controller alternates between the two banks on its own, so "next" is a
/// property of the endpoint's history, not of the descriptors. This is tracked
/// here rather than read back from `OWN` bits: a bank we armed a moment ago
/// may already have been sent and released, and looking at the bits would
/// then pick the wrong bank.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TxBankState {
    BothFreeEvenFirst,
    BothFreeOddFirst,
    /// Odd is busy; even is free and next.
    EvenFree,
    /// Even is busy; odd is free and next.
    OddFree,
    NoneFreeEvenFirst,
    NoneFreeOddFirst,
}

impl TxBankState {
    /// Picks a bank for a new packet, returning it with the state that
    /// results. `None` means both banks are busy and the packet must wait in
    /// the queue.
    pub fn claim(self) -> Option<(Bank, TxBankState)> {
        use TxBankState::*;
        match self {
            BothFreeEvenFirst => Some((Bank::Even, OddFree)),
            BothFreeOddFirst => Some((Bank::Odd, EvenFree)),
            EvenFree => Some((Bank::Even, NoneFreeOddFirst)),
            OddFree => Some((Bank::Odd, NoneFreeEvenFirst)),
            NoneFreeEvenFirst | NoneFreeOddFirst => None,
        }
    }

    /// State after the controller finishes sending from bank `done`.
    /// `refilled` says whether a queued packet went straight back into the
    /// same bank.
    pub fn complete(self, done: Bank, refilled: bool) -> TxBankState {
        use TxBankState::*;
        if refilled {
            match self {
                BothFreeEvenFirst => OddFree,
                BothFreeOddFirst => EvenFree,
                EvenFree => NoneFreeOddFirst,
                OddFree => NoneFreeEvenFirst,
                // The refilled bank now goes after the other one.
                NoneFreeEvenFirst | NoneFreeOddFirst => match done {
                    Bank::Even => NoneFreeOddFirst,
                    Bank::Odd => NoneFreeEvenFirst,
                },
            }
        } else {
            match self {
                s @ (BothFreeEvenFirst | BothFreeOddFirst) => s,
                EvenFree => BothFreeEvenFirst,
                OddFree => BothFreeOddFirst,
                NoneFreeEvenFirst | NoneFreeOddFirst => match done {
                    Bank::Odd => OddFree,
                    Bank::Even => EvenFree,
                },
            }
        }
    }

    /// Busy banks, in the order the controller will send them.
    pub fn pending(self) -> &'static [Bank] {
        use TxBankState::*;
        match self {
            BothFreeEvenFirst | BothFreeOddFirst => &[],
            EvenFree => &[Bank::Odd],
            OddFree => &[Bank::Even],
            NoneFreeEvenFirst => &[Bank::Even, Bank::Odd],
            NoneFreeOddFirst => &[Bank::Odd, Bank::Even],
        }
    }

    /// Both banks free again, keeping the controller's idea of which comes
    /// next: the busy bank if only one is busy. Applying it twice changes
    /// nothing.
    pub fn reset(self) -> TxBankState {
        use TxBankState::*;
        match self {
            OddFree | NoneFreeEvenFirst | BothFreeEvenFirst => BothFreeEvenFirst,
            EvenFree | NoneFreeOddFirst | BothFreeOddFirst => BothFreeOddFirst,
        }
    }
}

/// Data toggles of one endpoint, 1 and up.
///
/// The toggle follows the endpoint's transaction history and is reset to
/// DATA0 by SET_CONFIGURATION and CLEAR_FEATURE(ENDPOINT_HALT). The bank
/// pointer is only reset by a bus reset, so the two drift apart and have to
/// be tracked separately.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Toggles {
    /// Toggle for the next TX descriptor armed. TX descriptors are armed in
    /// the order they go out.
    tx_data1: bool,
    /// Bank the controller receives into next.
    rx_bank: Bank,
    /// Toggle the host will use for the packet landing in `rx_bank`.
    rx_data1: bool,
}

impl Toggles {
    pub const RESET: Self = Self {
        tx_data1: false,
        rx_bank: Bank::Even,
        rx_data1: false,
    };

    /// Toggle for a TX descriptor being armed now.
    pub fn next_tx(&mut self) -> bool {
        let t = self.tx_data1;
        self.tx_data1 = !t;
        t
    }

    /// Toggle an RX descriptor in `bank` must expect.
    pub fn rx_expects(&self, bank: Bank) -> bool {
        if bank == self.rx_bank {
            self.rx_data1
        } else {
            !self.rx_data1
        }
    }

    /// Steps past a packet received into `bank`.
    pub fn rx_done(&mut self, bank: Bank) {
        let t = self.rx_expects(bank);
        self.rx_bank = bank.other();
        self.rx_data1 = !t;
    }

    /// Next TX packet goes out as DATA0.
    pub fn reset_tx(&mut self) {
        self.tx_data1 = false;
    }

    /// Next packet received is DATA0. The bank pointer stays where it is.
    pub fn reset_rx(&mut self) {
        self.rx_data1 = false;
    }
}

/// The descriptor table plus the software state that goes with it.
pub struct Bdt {
    pub table: BdtTable,
    packets: [Option<u8>; BDT_ENTRIES],
    tx_state: [TxBankState; NUM_ENDPOINTS + 1],
    toggles: [Toggles; NUM_ENDPOINTS + 1],
}

impl Bdt {
    pub const fn new() -> Self {
        Self {
            table: BdtTable::new(),
            packets: [None; BDT_ENTRIES],
            tx_state: [TxBankState::BothFreeEvenFirst; NUM_ENDPOINTS + 1],
            toggles: [Toggles::RESET; NUM_ENDPOINTS + 1],
        }
    }

    pub fn entry(&self, index: usize) -> &BufferDescriptor {
        &self.table.entries[index]
    }

    pub fn entry_mut(&mut self, index: usize) -> &mut BufferDescriptor {
        &mut self.table.entries[index]
    }

    /// Arms an RX descriptor with an empty packet.
    pub fn give_rx(&mut self, index: usize, packet: PacketHandle, pool: &PacketPool, data1: bool) {
        let addr = pool.buf_ptr(&packet) as u32;
        debug_assert!(self.packets[index].is_none());
        self.packets[index] = Some(packet.into_index());
        self.table.entries[index].arm(addr, PACKET_SIZE, data1);
    }

    /// Arms a TX descriptor with a filled packet.
    pub fn give_tx(&mut self, index: usize, packet: PacketHandle, pool: &PacketPool, data1: bool) {
        let addr = pool.buf_ptr(&packet) as u32;
        let len = usize::from(pool.get(&packet).len).min(PACKET_SIZE);
        debug_assert!(self.packets[index].is_none());
        self.packets[index] = Some(packet.into_index());
        self.table.entries[index].arm(addr, len, data1);
    }

    /// Takes back the packet a descriptor was pointing at, if any. Does not
    /// change the descriptor.
    pub fn take_packet(&mut self, index: usize) -> Option<PacketHandle> {
        self.packets[index].take().map(PacketHandle::from_index)
    }

    pub fn has_packet(&self, index: usize) -> bool {
        self.packets[index].is_some()
    }

    /// Pool slot behind a descriptor, if any.
    pub fn packet_slot(&self, index: usize) -> Option<u8> {
        self.packets[index]
    }

    pub fn tx_state(&self, ep: usize) -> TxBankState {
        self.tx_state[ep]
    }

    pub fn set_tx_state(&mut self, ep: usize, state: TxBankState) {
        self.tx_state[ep] = state;
    }

    pub fn toggles(&self, ep: usize) -> Toggles {
        self.toggles[ep]
    }

    pub fn toggles_mut(&mut self, ep: usize) -> &mut Toggles {
        &mut self.toggles[ep]
    }
}
