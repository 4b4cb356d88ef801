// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Fixed pool of 64-byte transport packets.
//!
//! A packet is both the unit the hardware DMAs into and out of and the node of
//! the endpoint FIFOs (the `next` link). Keeping both roles in one slab means
//! there's no second allocator to size.
//!
//! Ownership is tracked with [`PacketHandle`], which is neither `Copy` nor
//! `Clone`: whoever holds the handle owns the packet, and the only ways to get
//! rid of one are to give it back to the pool or hand it to the driver.

use crate::{NUM_USB_BUFFERS, PACKET_SIZE};

// Free slots are tracked in a u32, MSB first.
const _: () = assert!(NUM_USB_BUFFERS > 0 && NUM_USB_BUFFERS <= 32);

/// One transport packet.
#[repr(C, align(4))]
pub struct Packet {
    /// Number of valid bytes in `buf`.
    pub len: u16,
    /// Read cursor for consumers that drain a packet a few bytes at a time.
    pub index: u16,
    pub(crate) next: Option<u8>,
    pub buf: [u8; PACKET_SIZE],
}

impl Packet {
    const EMPTY: Packet = Packet {
        len: 0,
        index: 0,
        next: None,
        buf: [0; PACKET_SIZE],
    };

    /// The valid bytes.
    pub fn data(&self) -> &[u8] {
        &self.buf[..usize::from(self.len).min(PACKET_SIZE)]
    }

    /// Copies `data` in, truncating to the packet size, and sets `len`.
    pub fn fill(&mut self, data: &[u8]) -> usize {
        let n = data.len().min(PACKET_SIZE);
        self.buf[..n].copy_from_slice(&data[..n]);
        self.len = n as u16;
        self.index = 0;
        n
    }
}

/// Owning reference to a pool slot.
#[derive(Debug, PartialEq, Eq)]
#[must_use = "dropping a packet handle leaks the packet; free it instead"]
pub struct PacketHandle(u8);

impl PacketHandle {
    /// Slot number, for diagnostics.
    pub fn slot(&self) -> usize {
        usize::from(self.0)
    }

    pub(crate) fn into_index(self) -> u8 {
        self.0
    }

    /// Rebuilds a handle from a slot number taken out of a FIFO link or a BDT
    /// shadow. The caller must have removed the number from wherever it came
    /// from, so that the packet keeps a single owner.
    pub(crate) fn from_index(index: u8) -> Self {
        Self(index)
    }
}

pub struct PacketPool {
    slots: [Packet; NUM_USB_BUFFERS],
    /// Bit `31 - n` set means slot `n` is free.
    available: u32,
}

impl PacketPool {
    const ALL_FREE: u32 = !0u32 << (32 - NUM_USB_BUFFERS);

    pub const fn new() -> Self {
        Self {
            slots: [Packet::EMPTY; NUM_USB_BUFFERS],
            available: Self::ALL_FREE,
        }
    }

    /// Takes a zeroed packet, or `None` if every slot is in use.
    pub fn alloc(&mut self) -> Option<PacketHandle> {
        let n = self.available.leading_zeros() as usize;
        if n >= NUM_USB_BUFFERS {
            return None;
        }
        self.available &= !(0x8000_0000 >> n);
        let p = &mut self.slots[n];
        p.len = 0;
        p.index = 0;
        p.next = None;
        p.buf = [0; PACKET_SIZE];
        Some(PacketHandle(n as u8))
    }

    /// Returns a packet to the pool.
    pub fn release(&mut self, packet: PacketHandle) {
        let n = packet.into_index() as usize;
        let mask = 0x8000_0000 >> n;
        debug_assert!(self.available & mask == 0, "packet {} freed twice", n);
        self.available |= mask;
    }

    /// Number of packets currently free.
    pub fn free_count(&self) -> usize {
        self.available.count_ones() as usize
    }

    pub fn get(&self, packet: &PacketHandle) -> &Packet {
        &self.slots[packet.slot()]
    }

    pub fn get_mut(&mut self, packet: &mut PacketHandle) -> &mut Packet {
        &mut self.slots[packet.slot()]
    }

    pub(crate) fn slot_mut(&mut self, index: u8) -> &mut Packet {
        &mut self.slots[usize::from(index)]
    }

    /// Address of the packet's data, for a buffer descriptor.
    pub(crate) fn buf_ptr(&self, packet: &PacketHandle) -> *const u8 {
        self.slots[packet.slot()].buf.as_ptr()
    }
}

impl Default for PacketPool {
    fn default() -> Self {
        Self::new()
    }
}
