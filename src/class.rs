// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! HID and CDC-ACM class requests on endpoint 0.
//!
//! The report bytes and the serial data belong to other parts of the
//! firmware. What lives here is the small amount of per-interface state the
//! host reads and writes through control requests: idle rates, protocol
//! selection, the last output report (keyboard LEDs), line coding and the
//! modem control lines.

use num_traits::FromPrimitive;

use crate::config::UsbDeviceConfiguration;
use crate::control::Response;
use crate::setup::{CdcRequest, HidRequest, SetupPacket, UsbDir};

/// HID interfaces whose state we keep.
pub const MAX_HID_INTERFACES: usize = 8;
/// Largest report accepted by SET_REPORT or served by GET_REPORT.
pub const HID_REPORT_SIZE: usize = 32;

/// Host-visible state of one HID interface.
#[derive(Copy, Clone, Debug)]
pub struct HidInterface {
    /// Idle rate in 4 ms units, 0 meaning "only on change".
    pub idle: u8,
    /// 0 for boot protocol, 1 for report protocol.
    pub protocol: u8,
    output: [u8; HID_REPORT_SIZE],
    output_len: usize,
    input: [u8; HID_REPORT_SIZE],
    input_len: usize,
}

impl HidInterface {
    const INITIAL: Self = Self {
        idle: 125,
        protocol: 1,
        output: [0; HID_REPORT_SIZE],
        output_len: 0,
        input: [0; HID_REPORT_SIZE],
        input_len: 0,
    };

    /// Last report the host sent with SET_REPORT.
    pub fn output_report(&self) -> &[u8] {
        &self.output[..self.output_len]
    }

    /// Report answered to GET_REPORT.
    pub fn input_report(&self) -> &[u8] {
        &self.input[..self.input_len]
    }

    pub fn set_input_report(&mut self, data: &[u8]) {
        let n = data.len().min(HID_REPORT_SIZE);
        self.input[..n].copy_from_slice(&data[..n]);
        self.input_len = n;
    }
}

pub struct ClassState {
    hid: [HidInterface; MAX_HID_INTERFACES],
    /// dwDTERate, bCharFormat, bParityType, bDataBits.
    line_coding: [u8; 7],
    /// DTR in bit 0, RTS in bit 1.
    line_state: u16,
}

/// Something the control engine has to act on after a class request.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ClassEvent {
    None,
    /// The host asked for the bootloader.
    Reboot,
}

impl ClassState {
    pub const fn new() -> Self {
        Self {
            hid: [HidInterface::INITIAL; MAX_HID_INTERFACES],
            line_coding: [0; 7],
            line_state: 0,
        }
    }

    fn hid_slot(config: &UsbDeviceConfiguration, interface: u16) -> Option<usize> {
        config
            .hid_interfaces
            .iter()
            .position(|&i| u16::from(i) == interface)
            .filter(|&k| k < MAX_HID_INTERFACES)
    }

    pub fn hid(&self, config: &UsbDeviceConfiguration, interface: u8) -> Option<&HidInterface> {
        Self::hid_slot(config, u16::from(interface)).map(|k| &self.hid[k])
    }

    pub fn hid_mut(
        &mut self,
        config: &UsbDeviceConfiguration,
        interface: u8,
    ) -> Option<&mut HidInterface> {
        match Self::hid_slot(config, u16::from(interface)) {
            Some(k) => Some(&mut self.hid[k]),
            None => None,
        }
    }

    pub fn line_coding(&self) -> &[u8; 7] {
        &self.line_coding
    }

    pub fn baud(&self) -> u32 {
        u32::from_le_bytes([
            self.line_coding[0],
            self.line_coding[1],
            self.line_coding[2],
            self.line_coding[3],
        ])
    }

    pub fn dtr(&self) -> bool {
        self.line_state & 1 != 0
    }

    pub fn line_state(&self) -> u16 {
        self.line_state
    }

    /// Handles a class request aimed at an interface. IN replies are written
    /// into `reply`.
    pub fn setup(
        &mut self,
        config: &UsbDeviceConfiguration,
        setup: &SetupPacket,
        reply: &mut [u8],
    ) -> Response {
        let interface = setup.index.get();
        if let Some(k) = Self::hid_slot(config, interface) {
            return self.hid_setup(k, setup, reply);
        }
        if config.is_cdc_interface(interface) {
            return self.cdc_setup(setup, reply);
        }
        Response::Stall
    }

    fn hid_setup(&mut self, k: usize, setup: &SetupPacket, reply: &mut [u8]) -> Response {
        let hid = &mut self.hid[k];
        match (setup.direction(), HidRequest::from_u8(setup.request)) {
            (UsbDir::In, Some(HidRequest::GetReport)) => {
                let n = hid.input_len.min(reply.len());
                reply[..n].copy_from_slice(&hid.input[..n]);
                Response::Reply(n)
            }
            (UsbDir::In, Some(HidRequest::GetIdle)) => {
                reply[0] = hid.idle;
                Response::Reply(1)
            }
            (UsbDir::In, Some(HidRequest::GetProtocol)) => {
                reply[0] = hid.protocol;
                Response::Reply(1)
            }
            (UsbDir::Out, Some(HidRequest::SetReport)) => {
                if usize::from(setup.length.get()) > HID_REPORT_SIZE {
                    Response::Stall
                } else {
                    Response::ReceiveOut
                }
            }
            (UsbDir::Out, Some(HidRequest::SetIdle)) => {
                hid.idle = (setup.value.get() >> 8) as u8;
                Response::Ack
            }
            (UsbDir::Out, Some(HidRequest::SetProtocol)) => {
                hid.protocol = setup.value.get() as u8;
                Response::Ack
            }
            _ => Response::Stall,
        }
    }

    fn cdc_setup(&mut self, setup: &SetupPacket, reply: &mut [u8]) -> Response {
        match (setup.direction(), CdcRequest::from_u8(setup.request)) {
            (UsbDir::In, Some(CdcRequest::GetLineCoding)) => {
                reply[..7].copy_from_slice(&self.line_coding);
                Response::Reply(7)
            }
            (UsbDir::Out, Some(CdcRequest::SetLineCoding)) => {
                if setup.length.get() == 7 {
                    Response::ReceiveOut
                } else {
                    Response::Stall
                }
            }
            (UsbDir::Out, Some(CdcRequest::SetControlLineState)) => {
                self.line_state = setup.value.get();
                Response::Ack
            }
            (UsbDir::Out, Some(CdcRequest::SendBreak)) => Response::Ack,
            _ => Response::Stall,
        }
    }

    /// Takes the data stage of a request that [`ClassState::setup`] answered
    /// with [`Response::ReceiveOut`].
    pub fn complete_out(
        &mut self,
        config: &UsbDeviceConfiguration,
        setup: &SetupPacket,
        data: &[u8],
    ) -> ClassEvent {
        let interface = setup.index.get();
        if let Some(k) = Self::hid_slot(config, interface) {
            if setup.request == HidRequest::SetReport as u8 {
                let hid = &mut self.hid[k];
                let n = data.len().min(HID_REPORT_SIZE);
                hid.output[..n].copy_from_slice(&data[..n]);
                hid.output_len = n;
            }
            return ClassEvent::None;
        }
        if config.is_cdc_interface(interface) && setup.request == CdcRequest::SetLineCoding as u8 {
            let n = data.len().min(7);
            self.line_coding[..n].copy_from_slice(&data[..n]);
            if config.reboot_baud == Some(self.baud()) {
                return ClassEvent::Reboot;
            }
        }
        ClassEvent::None
    }
}
