// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Bus reset, SET_CONFIGURATION, and soft disconnect.
//!
//! All three throw away whatever endpoints 1 and up were doing. Packets
//! sitting in queues or armed in descriptors go back to the pool, and the
//! endpoints are brought up again from the configuration table (or left off).

use crate::bdt::{bdt_index, Bank, Direction, Toggles, TxBankState, BDT_ENTRIES};
use crate::config::System;
use crate::control::ControlStage;
use crate::device::UsbController;
use crate::regs::{
    Peripheral, Reg, CTL_ODDRST, CTL_USBENSOFEN, ENDPT_EPHSHK, ENDPT_EPRXEN, ENDPT_EPTXEN,
    ISTAT_ERROR, ISTAT_SLEEP, ISTAT_SOFTOK, ISTAT_STALL, ISTAT_TOKDNE, ISTAT_USBRST,
};
use crate::{EP0_SIZE, NUM_ENDPOINTS};

impl<P: Peripheral, S: System> UsbController<P, S> {
    /// Returns every packet held for endpoints 1 and up to the pool.
    fn release_endpoint_packets(&mut self) {
        // Nobody is waiting for buffers any more; keep `free` from handing
        // them out while we tear down.
        self.rx_memory_needed = 0;
        for i in bdt_index(1, Direction::Rx, Bank::Even)..BDT_ENTRIES {
            if let Some(p) = self.bdt.take_packet(i) {
                self.pool.release(p);
            }
        }
        self.queues.clear(&mut self.pool);
    }

    /// SET_CONFIGURATION. Resets every endpoint from scratch, so asking for
    /// the same configuration twice leaves things exactly as asking once.
    pub(crate) fn set_configuration(&mut self, value: u8) {
        info!("usb: configuration {=u8}", value);
        self.configuration = value;
        self.release_endpoint_packets();

        for ep in 1..=NUM_ENDPOINTS {
            // The controller's bank pointers are not reset here, so keep
            // ours in step with them. Data toggles start over at DATA0.
            let state = self.bdt.tx_state(ep).reset();
            self.bdt.set_tx_state(ep, state);
            let toggles = self.bdt.toggles_mut(ep);
            toggles.reset_tx();
            toggles.reset_rx();

            let cfg = if value == 0 {
                0
            } else {
                self.config.endpoint_config(ep)
            };
            self.periph.write(Reg::Endpt(ep as u8), cfg);

            for bank in [Bank::Even, Bank::Odd] {
                let rx = bdt_index(ep, Direction::Rx, bank);
                self.bdt.entry_mut(rx).release();
                if cfg & ENDPT_EPRXEN != 0 {
                    match self.pool.alloc() {
                        Some(p) => self.arm_rx(ep, bank, p),
                        None => self.rx_memory_needed += 1,
                    }
                }
                self.bdt
                    .entry_mut(bdt_index(ep, Direction::Tx, bank))
                    .release();
            }
        }
    }

    /// Back to the default state: no configuration, endpoints 1 and up off,
    /// queues empty.
    pub(crate) fn teardown(&mut self) {
        self.configuration = 0;
        self.release_endpoint_packets();
        for ep in 1..=NUM_ENDPOINTS {
            self.periph.write(Reg::Endpt(ep as u8), 0);
            self.bdt.set_tx_state(ep, TxBankState::BothFreeEvenFirst);
            *self.bdt.toggles_mut(ep) = Toggles::RESET;
            for dir in [Direction::Rx, Direction::Tx] {
                for bank in [Bank::Even, Bank::Odd] {
                    self.bdt.entry_mut(bdt_index(ep, dir, bank)).release();
                }
            }
        }
        self.reboot_timer = 0;
        self.power.disarm();
    }

    /// USB reset signalled by the host.
    pub(crate) fn bus_reset(&mut self) {
        info!("usb: bus reset");

        // Every bank pointer in the controller goes back to even.
        self.periph.write(Reg::Ctl, CTL_ODDRST);
        self.ep0.tx_bank = Bank::Even;
        self.ep0.stage = ControlStage::Idle;
        self.ep0.pending_address = None;

        for bank in [Bank::Even, Bank::Odd] {
            let addr = self.ep0.rx_addr(bank);
            self.bdt
                .entry_mut(bdt_index(0, Direction::Rx, bank))
                .arm(addr, EP0_SIZE, false);
            self.bdt
                .entry_mut(bdt_index(0, Direction::Tx, bank))
                .release();
        }

        self.teardown();
        self.remote_wakeup_enabled = false;
        self.suspended = false;

        self.periph
            .write(Reg::Endpt(0), ENDPT_EPRXEN | ENDPT_EPTXEN | ENDPT_EPHSHK);
        self.periph.write(Reg::Errstat, 0xFF);
        self.periph.write(Reg::Istat, 0xFF);
        self.periph.write(Reg::Addr, 0);
        self.periph.write(Reg::Erren, 0xFF);
        self.periph.write(
            Reg::Inten,
            ISTAT_TOKDNE | ISTAT_SOFTOK | ISTAT_STALL | ISTAT_ERROR | ISTAT_USBRST | ISTAT_SLEEP,
        );
        self.periph.write(Reg::Ctl, CTL_USBENSOFEN);
    }

    /// Drops off the bus and comes back a little later (see
    /// [`UsbController::poll`]), making the host enumerate us again.
    pub fn reinit(&mut self) {
        info!("usb: reinit");
        self.periph.write(Reg::Control, 0);
        self.teardown();
        self.reconnect_at = Some(self.system.millis());
    }
}
