// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Endpoint 0: control transfers.
//!
//! Every control transfer starts with a SETUP token carrying an 8-byte
//! request. What follows depends on the request:
//!
//! - No data stage: we answer straight away with a zero-length IN, which is
//!   the status stage.
//! - IN data stage: we send the response in `EP0_SIZE` chunks, and the host
//!   finishes with a zero-length OUT.
//! - OUT data stage: the host sends `wLength` bytes, and we finish with a
//!   zero-length IN.
//!
//! Anything we don't understand is answered with a STALL, which is the
//! protocol's way of saying "no". The next SETUP clears it.
//!
//! Endpoint 0 doesn't use the packet pool. It has two receive buffers (one per
//! bank) that stay armed all the time, and two transmit buffers that IN chunks
//! are copied into. Two chunks may be in flight at once, one per bank; each
//! IN completion queues the next.

use num_traits::FromPrimitive;

use crate::bdt::{bdt_index, index_bank, stat_index, Bank, Direction, PID_IN, PID_OUT, PID_OUT_ALT, PID_SETUP};
use crate::class::ClassEvent;
use crate::config::System;
use crate::descriptor::{self, UsbConfigurationDescriptor, UsbDescType};
use crate::device::UsbController;
use crate::regs::{
    Peripheral, Reg, CTL_USBENSOFEN, ENDPT_EPHSHK, ENDPT_EPRXEN, ENDPT_EPSTALL, ENDPT_EPTXEN,
};
use crate::setup::{
    Recipient, RequestKind, SetupPacket, StandardRequest, UsbDir, FEATURE_DEVICE_REMOTE_WAKEUP,
    FEATURE_ENDPOINT_HALT,
};
use crate::{EP0_SIZE, NUM_ENDPOINTS};

/// Room for class replies (GET_REPORT, GET_LINE_CODING, ...) and the small
/// standard ones.
pub const REPLY_SIZE: usize = 64;
/// Largest OUT data stage we accept.
pub const OUT_CAPACITY: usize = 64;

/// SOF ticks between a reboot request and the reboot. Long enough for the
/// status stage to reach the host.
pub const REBOOT_DELAY_SOFS: u8 = 15;

/// How a request handler wants the transfer to continue.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Response {
    /// Refuse the request.
    Stall,
    /// Done; no data stage.
    Ack,
    /// Send the first `n` bytes of the reply buffer.
    Reply(usize),
    /// Send static bytes, optionally with one byte replaced on the way out.
    Static {
        data: &'static [u8],
        patch: Option<(usize, u8)>,
    },
    /// Expect `wLength` bytes from the host.
    ReceiveOut,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Source {
    Static(&'static [u8]),
    Reply,
}

/// An IN data stage in progress.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct InTransfer {
    source: Source,
    offset: usize,
    remaining: usize,
    /// Another packet still has to be queued. Stays set after the last byte
    /// goes out in a full-size packet, because the host needs a short packet
    /// to know the transfer is over.
    owed: bool,
    patch: Option<(usize, u8)>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ControlStage {
    Idle,
    /// Sending response data.
    DataIn(InTransfer),
    /// All response data queued; waiting for the host's zero-length OUT.
    StatusOut,
    /// Receiving request data.
    DataOut { expected: usize, received: usize },
    /// Our zero-length IN is queued; waiting for it to go out.
    StatusIn,
}

/// Endpoint 0 buffers and transfer state.
#[repr(C, align(4))]
pub struct Ep0 {
    pub(crate) rx_buf: [[u8; EP0_SIZE]; 2],
    pub(crate) tx_buf: [[u8; EP0_SIZE]; 2],
    /// Bank the next IN chunk goes into.
    pub(crate) tx_bank: Bank,
    /// Toggle for the next IN chunk. Control transfers do not tie the toggle
    /// to the bank the way other endpoints do.
    pub(crate) tx_data1: bool,
    pub(crate) setup: SetupPacket,
    pub(crate) stage: ControlStage,
    /// SET_ADDRESS value, written to the hardware once the status stage is
    /// done.
    pub(crate) pending_address: Option<u8>,
    pub(crate) reply: [u8; REPLY_SIZE],
    pub(crate) out_buf: [u8; OUT_CAPACITY],
}

impl Ep0 {
    pub const fn new() -> Self {
        Self {
            rx_buf: [[0; EP0_SIZE]; 2],
            tx_buf: [[0; EP0_SIZE]; 2],
            tx_bank: Bank::Even,
            tx_data1: false,
            setup: SetupPacket::EMPTY,
            stage: ControlStage::Idle,
            pending_address: None,
            reply: [0; REPLY_SIZE],
            out_buf: [0; OUT_CAPACITY],
        }
    }

    pub fn stage(&self) -> ControlStage {
        self.stage
    }

    pub(crate) fn rx_addr(&self, bank: Bank) -> u32 {
        self.rx_buf[bank as usize].as_ptr() as u32
    }
}

impl<P: Peripheral, S: System> UsbController<P, S> {
    /// Handles a completed token on endpoint 0. Runs in the interrupt
    /// handler.
    pub(crate) fn ep0_token(&mut self, stat: u8) {
        let i = stat_index(stat);
        match self.bdt.entry(i).pid() {
            PID_SETUP => self.ep0_setup(index_bank(i)),
            PID_OUT | PID_OUT_ALT => self.ep0_out(index_bank(i)),
            PID_IN => self.ep0_in_complete(),
            _ => {}
        }
    }

    fn ep0_setup(&mut self, bank: Bank) {
        let setup = SetupPacket::parse(&self.ep0.rx_buf[bank as usize]);
        // The setup bytes are copied out, so the buffer can go straight back.
        let addr = self.ep0.rx_addr(bank);
        self.bdt
            .entry_mut(bdt_index(0, Direction::Rx, bank))
            .arm(addr, EP0_SIZE, true);

        // A new SETUP cancels whatever we were still trying to send. The
        // controller only flips its bank pointer for packets that actually
        // went out, so step ours back over the ones that didn't.
        let mut cancelled = 0;
        for b in [Bank::Even, Bank::Odd] {
            let bd = self.bdt.entry_mut(bdt_index(0, Direction::Tx, b));
            if bd.is_owned() {
                cancelled += 1;
            }
            bd.release();
        }
        if cancelled % 2 == 1 {
            self.ep0.tx_bank = self.ep0.tx_bank.other();
        }

        // First packet of any data or status stage is DATA1.
        self.ep0.tx_data1 = true;
        self.ep0.stage = ControlStage::Idle;
        self.ep0.pending_address = None;
        self.power.disarm();

        match setup {
            Some(setup) => {
                self.ep0.setup = setup;
                let response = self.ep0_dispatch(&setup);
                self.ep0_respond(&setup, response);
            }
            None => self.ep0_stall(),
        }

        // Receiving a SETUP suspends token processing until this is cleared.
        self.periph.write(Reg::Ctl, CTL_USBENSOFEN);
    }

    fn ep0_dispatch(&mut self, setup: &SetupPacket) -> Response {
        match (setup.kind(), setup.recipient()) {
            (Some(RequestKind::Standard), _) => self.standard_request(setup),
            (Some(RequestKind::Class), Some(Recipient::Interface)) => {
                self.class.setup(self.config, setup, &mut self.ep0.reply)
            }
            _ => Response::Stall,
        }
    }

    fn standard_request(&mut self, setup: &SetupPacket) -> Response {
        use StandardRequest::*;

        let value = setup.value.get();
        let index = setup.index.get();
        let ep = usize::from(index & 0x7F);
        let ep_in_use = self.endpoint_in_use(ep);
        let reply = &mut self.ep0.reply;
        match (StandardRequest::from_u8(setup.request), setup.direction(), setup.recipient()) {
            (Some(SetAddress), UsbDir::Out, Some(Recipient::Device)) => {
                self.ep0.pending_address = Some((value & 0x7F) as u8);
                Response::Ack
            }
            (Some(SetConfiguration), UsbDir::Out, Some(Recipient::Device)) => {
                self.set_configuration(value as u8);
                Response::Ack
            }
            (Some(GetConfiguration), UsbDir::In, Some(Recipient::Device)) => {
                reply[0] = self.configuration;
                Response::Reply(1)
            }
            (Some(GetStatus), UsbDir::In, Some(Recipient::Device)) => {
                reply[0] = if self.remote_wakeup_enabled { 0x02 } else { 0 };
                reply[1] = 0;
                Response::Reply(2)
            }
            (Some(GetStatus), UsbDir::In, Some(Recipient::Interface)) => {
                reply[0] = 0;
                reply[1] = 0;
                Response::Reply(2)
            }
            (Some(GetStatus), UsbDir::In, Some(Recipient::Endpoint)) => {
                if !ep_in_use {
                    return Response::Stall;
                }
                let halted = self.periph.read(Reg::Endpt(ep as u8)) & ENDPT_EPSTALL != 0;
                reply[0] = halted as u8;
                reply[1] = 0;
                Response::Reply(2)
            }
            (Some(req @ (ClearFeature | SetFeature)), UsbDir::Out, Some(Recipient::Device)) => {
                if value != FEATURE_DEVICE_REMOTE_WAKEUP {
                    return Response::Stall;
                }
                self.remote_wakeup_enabled = req == SetFeature;
                Response::Ack
            }
            (Some(req @ (ClearFeature | SetFeature)), UsbDir::Out, Some(Recipient::Endpoint)) => {
                if !ep_in_use || value != FEATURE_ENDPOINT_HALT {
                    return Response::Stall;
                }
                if ep == 0 {
                    // Endpoint 0 can't be halted, so there is nothing to clear.
                    return if req == SetFeature {
                        Response::Stall
                    } else {
                        Response::Ack
                    };
                }
                if req == SetFeature {
                    self.periph.modify(Reg::Endpt(ep as u8), |v| v | ENDPT_EPSTALL);
                } else {
                    self.periph.modify(Reg::Endpt(ep as u8), |v| v & !ENDPT_EPSTALL);
                    let dir = if index & 0x80 != 0 {
                        Direction::Tx
                    } else {
                        Direction::Rx
                    };
                    self.reset_data_toggle(ep, dir);
                }
                Response::Ack
            }
            (
                Some(GetDescriptor),
                UsbDir::In,
                Some(Recipient::Device | Recipient::Interface),
            ) => self.get_descriptor(value, index),
            _ => Response::Stall,
        }
    }

    /// Endpoint 0, or one the configuration table turns on.
    fn endpoint_in_use(&self, ep: usize) -> bool {
        ep == 0 || (ep <= NUM_ENDPOINTS && self.config.endpoint_config(ep) != 0)
    }

    fn get_descriptor(&mut self, value: u16, index: u16) -> Response {
        let entry = match descriptor::find(self.config.descriptors, value, index) {
            Some(entry) => entry,
            None => return Response::Stall,
        };
        let mut patch = None;
        if value >> 8 == UsbDescType::Config as u16 {
            if value & 0xFF == 0 {
                self.power.arm(self.system.millis());
            }
            patch = self
                .power
                .max_power_override()
                .map(|p| (UsbConfigurationDescriptor::MAX_POWER_OFFSET, p));
        }
        Response::Static {
            data: entry.bytes(),
            patch,
        }
    }

    fn ep0_respond(&mut self, setup: &SetupPacket, response: Response) {
        let wlength = usize::from(setup.length.get());
        match response {
            Response::Stall => {
                debug!(
                    "usb: stall {=u8:#x} {=u8:#x}",
                    setup.request_type, setup.request
                );
                self.ep0_stall();
            }
            Response::Ack => {
                self.ep0_transmit(0);
                self.ep0.stage = ControlStage::StatusIn;
            }
            Response::Reply(n) => self.ep0_begin_in(Source::Reply, n.min(REPLY_SIZE), None, wlength),
            Response::Static { data, patch } => {
                self.ep0_begin_in(Source::Static(data), data.len(), patch, wlength)
            }
            Response::ReceiveOut => {
                if wlength > OUT_CAPACITY {
                    self.ep0_stall();
                } else if wlength == 0 {
                    self.ep0_finish_out(0);
                } else {
                    self.ep0.stage = ControlStage::DataOut {
                        expected: wlength,
                        received: 0,
                    };
                }
            }
        }
    }

    fn ep0_begin_in(&mut self, source: Source, len: usize, patch: Option<(usize, u8)>, wlength: usize) {
        let len = len.min(wlength);
        self.ep0.stage = ControlStage::DataIn(InTransfer {
            source,
            offset: 0,
            remaining: len,
            owed: true,
            patch,
        });
        // One chunk per bank.
        self.ep0_send_next();
        self.ep0_send_next();
    }

    /// Queues the next chunk of the IN data stage, if one is owed.
    fn ep0_send_next(&mut self) {
        let mut t = match self.ep0.stage {
            ControlStage::DataIn(t) if t.owed => t,
            _ => return,
        };
        let size = t.remaining.min(EP0_SIZE);
        let src: &[u8] = match t.source {
            Source::Static(data) => data,
            Source::Reply => &self.ep0.reply,
        };
        let buf = &mut self.ep0.tx_buf[self.ep0.tx_bank as usize];
        buf[..size].copy_from_slice(&src[t.offset..t.offset + size]);
        if let Some((at, byte)) = t.patch {
            if at >= t.offset && at < t.offset + size {
                buf[at - t.offset] = byte;
            }
        }
        self.ep0_transmit(size);

        t.offset += size;
        t.remaining -= size;
        t.owed = t.remaining > 0 || size == EP0_SIZE;
        self.ep0.stage = if t.owed {
            ControlStage::DataIn(t)
        } else {
            ControlStage::StatusOut
        };
    }

    /// Hands the current transmit bank to the controller with `len` bytes of
    /// its buffer.
    fn ep0_transmit(&mut self, len: usize) {
        let bank = self.ep0.tx_bank;
        let addr = self.ep0.tx_buf[bank as usize].as_ptr() as u32;
        self.bdt
            .entry_mut(bdt_index(0, Direction::Tx, bank))
            .arm(addr, len, self.ep0.tx_data1);
        self.ep0.tx_data1 = !self.ep0.tx_data1;
        self.ep0.tx_bank = bank.other();
    }

    fn ep0_out(&mut self, bank: Bank) {
        let i = bdt_index(0, Direction::Rx, bank);
        let len = self.bdt.entry(i).byte_count().min(EP0_SIZE);

        match self.ep0.stage {
            ControlStage::DataOut { expected, received } => {
                let n = len.min(OUT_CAPACITY - received);
                self.ep0.out_buf[received..received + n]
                    .copy_from_slice(&self.ep0.rx_buf[bank as usize][..n]);
                let received = received + n;
                if received >= expected || len < EP0_SIZE {
                    self.ep0_finish_out(received);
                } else {
                    self.ep0.stage = ControlStage::DataOut { expected, received };
                }
            }
            // The host's status stage, or the host cutting a data stage
            // short. Either way the transfer is over.
            ControlStage::DataIn(_) | ControlStage::StatusOut => {
                self.ep0.stage = ControlStage::Idle;
            }
            _ => {}
        }

        let addr = self.ep0.rx_addr(bank);
        self.bdt.entry_mut(i).arm(addr, EP0_SIZE, true);
    }

    fn ep0_finish_out(&mut self, received: usize) {
        let setup = self.ep0.setup;
        let event = self
            .class
            .complete_out(self.config, &setup, &self.ep0.out_buf[..received]);
        if event == ClassEvent::Reboot {
            info!("usb: reboot requested");
            self.reboot_timer = REBOOT_DELAY_SOFS;
        }
        self.ep0_transmit(0);
        self.ep0.stage = ControlStage::StatusIn;
    }

    fn ep0_in_complete(&mut self) {
        match self.ep0.stage {
            ControlStage::DataIn(_) => self.ep0_send_next(),
            ControlStage::StatusIn => {
                if let Some(addr) = self.ep0.pending_address.take() {
                    debug!("usb: address {=u8}", addr);
                    self.periph.write(Reg::Addr, addr);
                }
                self.ep0.stage = ControlStage::Idle;
            }
            _ => {}
        }
    }

    /// Refuses the current request. The stall lasts until the next SETUP.
    pub(crate) fn ep0_stall(&mut self) {
        self.periph.write(
            Reg::Endpt(0),
            ENDPT_EPSTALL | ENDPT_EPRXEN | ENDPT_EPTXEN | ENDPT_EPHSHK,
        );
        self.ep0.stage = ControlStage::Idle;
    }
}
