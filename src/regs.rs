// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! USB-FS controller registers.
//!
//! The K20 USB-FS block exposes 8-bit registers spaced 4 bytes apart. The
//! driver talks to them through the [`Peripheral`] trait so that the same
//! state machine runs against the real block ([`Kinetis`]) and against a
//! register file in the tests.

/// Base address of USB0 on K20 parts.
pub const USB0_BASE: usize = 0x4007_2000;

/// Registers of the USB-FS block that the driver touches.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Reg {
    /// OTG interrupt status, write-one-to-clear.
    OtgIstat,
    /// Interrupt status, write-one-to-clear.
    Istat,
    /// Interrupt enable.
    Inten,
    /// Error interrupt status, write-one-to-clear.
    Errstat,
    /// Error interrupt enable.
    Erren,
    /// Status of the most recent token. Only valid while TOKDNE is set.
    Stat,
    /// Control.
    Ctl,
    /// Device address.
    Addr,
    /// BDT base address bits 15:9.
    BdtPage1,
    /// BDT base address bits 23:16.
    BdtPage2,
    /// BDT base address bits 31:24.
    BdtPage3,
    /// Endpoint control for endpoint `n` (0..=15).
    Endpt(u8),
    /// USB control (suspend, pulldowns).
    UsbCtrl,
    /// OTG control (D+ pullup).
    Control,
}

impl Reg {
    /// Byte offset from [`USB0_BASE`].
    pub const fn offset(self) -> usize {
        match self {
            Reg::OtgIstat => 0x10,
            Reg::Istat => 0x80,
            Reg::Inten => 0x84,
            Reg::Errstat => 0x88,
            Reg::Erren => 0x8C,
            Reg::Stat => 0x90,
            Reg::Ctl => 0x94,
            Reg::Addr => 0x98,
            Reg::BdtPage1 => 0x9C,
            Reg::BdtPage2 => 0xB0,
            Reg::BdtPage3 => 0xB4,
            Reg::Endpt(n) => 0xC0 + 4 * (n as usize & 0xF),
            Reg::UsbCtrl => 0x100,
            Reg::Control => 0x108,
        }
    }
}

// ISTAT / INTEN bits.
pub const ISTAT_USBRST: u8 = 0x01;
pub const ISTAT_ERROR: u8 = 0x02;
pub const ISTAT_SOFTOK: u8 = 0x04;
pub const ISTAT_TOKDNE: u8 = 0x08;
pub const ISTAT_SLEEP: u8 = 0x10;
pub const ISTAT_RESUME: u8 = 0x20;
pub const ISTAT_STALL: u8 = 0x80;

// CTL bits.
pub const CTL_USBENSOFEN: u8 = 0x01;
pub const CTL_ODDRST: u8 = 0x02;
pub const CTL_RESUME: u8 = 0x04;

// ENDPT bits.
pub const ENDPT_EPHSHK: u8 = 0x01;
pub const ENDPT_EPSTALL: u8 = 0x02;
pub const ENDPT_EPTXEN: u8 = 0x04;
pub const ENDPT_EPRXEN: u8 = 0x08;
pub const ENDPT_EPCTLDIS: u8 = 0x10;

// STAT layout: ENDP in 7:4, TX in 3, ODD in 2.
pub const STAT_TX: u8 = 0x08;
pub const STAT_ODD: u8 = 0x04;

// CONTROL bits.
pub const CONTROL_DPPULLUPNONOTG: u8 = 0x10;

/// ENDPT values for the per-endpoint configuration table.
pub const ENDPOINT_UNUSED: u8 = 0x00;
pub const ENDPOINT_TRANSMIT_ONLY: u8 = ENDPT_EPCTLDIS | ENDPT_EPTXEN | ENDPT_EPHSHK;
pub const ENDPOINT_RECEIVE_ONLY: u8 = ENDPT_EPCTLDIS | ENDPT_EPRXEN | ENDPT_EPHSHK;
pub const ENDPOINT_TRANSMIT_AND_RECEIVE: u8 =
    ENDPT_EPCTLDIS | ENDPT_EPRXEN | ENDPT_EPTXEN | ENDPT_EPHSHK;

/// Access to the USB-FS register block.
pub trait Peripheral {
    fn read(&self, reg: Reg) -> u8;
    fn write(&self, reg: Reg, value: u8);

    fn modify(&self, reg: Reg, f: impl FnOnce(u8) -> u8) {
        let v = self.read(reg);
        self.write(reg, f(v));
    }
}

impl<T: Peripheral> Peripheral for &T {
    fn read(&self, reg: Reg) -> u8 {
        (**self).read(reg)
    }

    fn write(&self, reg: Reg, value: u8) {
        (**self).write(reg, value)
    }
}

/// The real USB0 block.
pub struct Kinetis {
    _private: (),
}

impl Kinetis {
    /// # Safety
    ///
    /// There must be exactly one `Kinetis` in the program; the driver assumes
    /// it has the register block to itself.
    pub const unsafe fn steal() -> Self {
        Self { _private: () }
    }
}

impl Peripheral for Kinetis {
    #[inline(always)]
    fn read(&self, reg: Reg) -> u8 {
        // Safety: the offset table above only names registers inside USB0.
        unsafe { core::ptr::read_volatile((USB0_BASE + reg.offset()) as *const u8) }
    }

    #[inline(always)]
    fn write(&self, reg: Reg, value: u8) {
        unsafe { core::ptr::write_volatile((USB0_BASE + reg.offset()) as *mut u8, value) }
    }
}
