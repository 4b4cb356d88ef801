// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The controller: all driver state in one place.
//!
//! `UsbController` owns the packet pool, the descriptor table, the endpoint
//! queues and the endpoint 0 state. Firmware keeps it in an
//! [`irq::Shared`](crate::irq::Shared) so the interrupt handler and the
//! foreground code each get it with interrupts masked.
//!
//! The descriptor table and the endpoint 0 buffers are handed to the
//! controller by address, so [`UsbController::init`] must only be called
//! once the controller has reached the place it will live for good.

use crate::bdt::{Bdt, BdtTable, BDT_ENTRIES};
use crate::class::{ClassState, HidInterface};
use crate::config::{System, UsbDeviceConfiguration};
use crate::control::{ControlStage, Ep0};
use crate::error::{Result, UsbError};
use crate::packet::{Packet, PacketHandle, PacketPool};
use crate::power::PowerNegotiation;
use crate::queue::EndpointQueues;
use crate::regs::{
    Peripheral, Reg, CONTROL_DPPULLUPNONOTG, CTL_RESUME, CTL_USBENSOFEN, ENDPT_EPHSHK,
    ENDPT_EPRXEN, ENDPT_EPTXEN, ISTAT_ERROR, ISTAT_RESUME, ISTAT_SLEEP, ISTAT_SOFTOK,
    ISTAT_STALL, ISTAT_TOKDNE, ISTAT_USBRST,
};

/// How long the pull-up stays off in [`UsbController::reinit`].
pub const RECONNECT_DELAY_MS: u32 = 10;
/// How long resume signalling lasts in [`UsbController::remote_wakeup`].
pub const RESUME_SIGNAL_MS: u32 = 10;

pub struct UsbController<P: Peripheral, S: System> {
    pub(crate) periph: P,
    pub(crate) system: S,
    pub(crate) config: &'static UsbDeviceConfiguration,
    pub(crate) bdt: Bdt,
    pub(crate) pool: PacketPool,
    pub(crate) queues: EndpointQueues,
    pub(crate) ep0: Ep0,
    pub(crate) class: ClassState,
    pub(crate) power: PowerNegotiation,
    /// Value of the last SET_CONFIGURATION, 0 when not configured.
    pub(crate) configuration: u8,
    /// Receive descriptors left empty because the pool ran dry.
    pub(crate) rx_memory_needed: u8,
    /// SOFs until the requested reboot, 0 for none.
    pub(crate) reboot_timer: u8,
    pub(crate) remote_wakeup_enabled: bool,
    pub(crate) suspended: bool,
    pub(crate) reconnect_at: Option<u32>,
    pub(crate) resume_started: Option<u32>,
}

impl<P: Peripheral, S: System> UsbController<P, S> {
    pub fn new(periph: P, system: S, config: &'static UsbDeviceConfiguration) -> Self {
        Self {
            periph,
            system,
            config,
            bdt: Bdt::new(),
            pool: PacketPool::new(),
            queues: EndpointQueues::new(),
            ep0: Ep0::new(),
            class: ClassState::new(),
            power: PowerNegotiation::new(config.power),
            configuration: 0,
            rx_memory_needed: 0,
            reboot_timer: 0,
            remote_wakeup_enabled: false,
            suspended: false,
            reconnect_at: None,
            resume_started: None,
        }
    }

    /// Points the controller at our descriptor table and connects to the bus.
    /// The rest of the setup happens when the host resets us.
    pub fn init(&mut self) {
        for i in 0..BDT_ENTRIES {
            if let Some(p) = self.bdt.take_packet(i) {
                self.pool.release(p);
            }
            self.bdt.entry_mut(i).release();
        }

        let table = &self.bdt.table as *const BdtTable as usize as u32;
        self.periph.write(Reg::BdtPage1, (table >> 8) as u8);
        self.periph.write(Reg::BdtPage2, (table >> 16) as u8);
        self.periph.write(Reg::BdtPage3, (table >> 24) as u8);

        self.periph.write(Reg::Istat, 0xFF);
        self.periph.write(Reg::Errstat, 0xFF);
        self.periph.write(Reg::OtgIstat, 0xFF);

        self.periph.write(Reg::Ctl, CTL_USBENSOFEN);
        self.periph.write(Reg::UsbCtrl, 0);
        self.periph.write(Reg::Inten, ISTAT_USBRST);
        self.periph.write(Reg::Control, CONTROL_DPPULLUPNONOTG);
        info!("usb: init, bdt at {=u32:#x}", table);
    }

    /// Interrupt handler body. Handles every pending token before looking at
    /// the other status bits.
    pub fn isr(&mut self) {
        loop {
            let status = self.periph.read(Reg::Istat);

            if status & ISTAT_SOFTOK != 0 {
                if self.configuration != 0 && self.reboot_timer > 0 {
                    self.reboot_timer -= 1;
                    if self.reboot_timer == 0 {
                        info!("usb: rebooting to loader");
                        self.system.device_reload();
                    }
                }
                self.periph.write(Reg::Istat, ISTAT_SOFTOK);
            }

            if status & ISTAT_TOKDNE != 0 {
                let stat = self.periph.read(Reg::Stat);
                if stat >> 4 == 0 {
                    self.ep0_token(stat);
                } else {
                    self.endpoint_token(stat);
                }
                self.periph.write(Reg::Istat, ISTAT_TOKDNE);
                continue;
            }

            if status & ISTAT_USBRST != 0 {
                self.bus_reset();
                return;
            }

            if status & ISTAT_STALL != 0 {
                // The stall has been sent; let endpoint 0 work again.
                self.periph
                    .write(Reg::Endpt(0), ENDPT_EPRXEN | ENDPT_EPTXEN | ENDPT_EPHSHK);
                self.periph.write(Reg::Istat, ISTAT_STALL);
            }

            if status & ISTAT_ERROR != 0 {
                let err = self.periph.read(Reg::Errstat);
                debug!("usb: error status {=u8:#x}", err);
                self.periph.write(Reg::Errstat, err);
                self.periph.write(Reg::Istat, ISTAT_ERROR);
            }

            if status & ISTAT_SLEEP != 0 {
                debug!("usb: suspend");
                self.suspended = true;
                self.periph.modify(Reg::Inten, |v| v | ISTAT_RESUME);
                self.periph.write(Reg::Istat, ISTAT_SLEEP);
            }

            if status & ISTAT_RESUME != 0 {
                debug!("usb: resume");
                self.suspended = false;
                self.periph.modify(Reg::Inten, |v| v & !ISTAT_RESUME);
                self.periph.write(Reg::Istat, ISTAT_RESUME);
            }

            return;
        }
    }

    /// Foreground housekeeping: timers that must not run in the interrupt
    /// handler. Call it from the main loop.
    pub fn poll(&mut self) {
        let now = self.system.millis();

        if self.power.expired(now) {
            warn!("usb: no request after configuration descriptor, lowering power");
            self.reinit();
        }

        if let Some(t) = self.reconnect_at {
            if now.wrapping_sub(t) >= RECONNECT_DELAY_MS {
                self.periph.write(Reg::Control, CONTROL_DPPULLUPNONOTG);
                self.reconnect_at = None;
            }
        }

        if let Some(t) = self.resume_started {
            if now.wrapping_sub(t) >= RESUME_SIGNAL_MS {
                self.periph.modify(Reg::Ctl, |v| v & !CTL_RESUME);
                self.resume_started = None;
                self.suspended = false;
            }
        }
    }

    /// Starts resume signalling to wake a suspended host. [`poll`](Self::poll)
    /// ends it.
    pub fn remote_wakeup(&mut self) -> Result<()> {
        if !self.remote_wakeup_enabled {
            return Err(UsbError::RemoteWakeupDisabled);
        }
        if self.suspended && self.resume_started.is_none() {
            self.periph.modify(Reg::Ctl, |v| v | CTL_RESUME);
            self.resume_started = Some(self.system.millis());
        }
        Ok(())
    }

    /// Jumps to the bootloader.
    pub fn device_reload(&self) {
        self.system.device_reload();
    }

    pub fn configured(&self) -> bool {
        self.configuration != 0
    }

    pub fn configuration(&self) -> u8 {
        self.configuration
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended
    }

    pub fn remote_wakeup_enabled(&self) -> bool {
        self.remote_wakeup_enabled
    }

    pub fn ep0_stage(&self) -> ControlStage {
        self.ep0.stage()
    }

    pub fn free_packets(&self) -> usize {
        self.pool.free_count()
    }

    pub fn packet(&self, packet: &PacketHandle) -> &Packet {
        self.pool.get(packet)
    }

    pub fn packet_mut(&mut self, packet: &mut PacketHandle) -> &mut Packet {
        self.pool.get_mut(packet)
    }

    pub fn class(&self) -> &ClassState {
        &self.class
    }

    pub fn hid(&self, interface: u8) -> Option<&HidInterface> {
        self.class.hid(self.config, interface)
    }

    pub fn hid_mut(&mut self, interface: u8) -> Option<&mut HidInterface> {
        self.class.hid_mut(self.config, interface)
    }

    pub fn system(&self) -> &S {
        &self.system
    }

    pub fn peripheral(&self) -> &P {
        &self.periph
    }

    /// The memory behind descriptor `index`, the way the controller's DMA
    /// sees it.
    #[cfg(test)]
    pub(crate) fn dma_buffer(&mut self, index: usize) -> Option<&mut [u8]> {
        use crate::bdt::{index_bank, index_direction, index_endpoint, Direction};

        let bank = index_bank(index) as usize;
        if index_endpoint(index) == 0 {
            return Some(match index_direction(index) {
                Direction::Rx => &mut self.ep0.rx_buf[bank][..],
                Direction::Tx => &mut self.ep0.tx_buf[bank][..],
            });
        }
        let slot = self.bdt.packet_slot(index)?;
        Some(&mut self.pool.slot_mut(slot).buf[..])
    }
}
