// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Demo firmware for a K20 (MK20DX256) keyboard controller.
//!
//! This brings up the chip, hands the USB-FS block to the driver in the
//! library crate, and then does something simple enough to test from a host
//! without any special tools: it enumerates as a boot keyboard plus a vendor
//! "raw IO" interface, and echoes every packet it receives on the raw IO OUT
//! endpoint back on the raw IO IN endpoint.
//!
//! The shape of the program is the shape of every firmware that uses the
//! driver:
//!
//! 1. Clocks. USB needs an exact 48 MHz, which on this part means running the
//!    PLL from the crystal.
//! 2. Descriptors. The driver only serves bytes it is given; this file builds
//!    them, including a serial number read from the chip's unique ID.
//! 3. The controller goes into a `static` [`Shared`] cell, because the USB
//!    interrupt handler needs it too. Only once it is there (and will never
//!    move again) do we call `init`, which tells the hardware where the buffer
//!    descriptor table lives.
//! 4. The main loop calls `poll` for the timers, and moves packets.
//!
//! Everything that touches a register here does it through a raw pointer.
//! There's no peripheral access crate for this part in our dependency set, and
//! the handful of registers we need don't justify one.
//!
//! # A note on `unsafe`
//!
//! All the `unsafe` in this file is register access at fixed addresses taken
//! from the K20 reference manual. Each helper documents the one thing that has
//! to be true for it to be sound; the call sites don't repeat it.

#![no_std]
#![no_main]

use core::sync::atomic::{AtomicU32, Ordering};

use cortex_m::interrupt::InterruptNumber;
use cortex_m::peripheral::syst::SystClkSource;
use cortex_m::peripheral::{NVIC, SCB};
use cortex_m_rt::{entry, exception, pre_init};
use zerocopy::{AsBytes, U16};

use panic_halt as _;

use kinetis_usbfs::descriptor::{
    ascii_string, serial_number, DescriptorEntry, UsbConfigurationDescriptor, UsbDescType,
    UsbDeviceDescriptor, UsbEndpointDescriptor, UsbInterfaceDescriptor, UsbTransferType,
};
use kinetis_usbfs::irq::Shared;
use kinetis_usbfs::regs::{ENDPOINT_RECEIVE_ONLY, ENDPOINT_TRANSMIT_ONLY, ENDPOINT_UNUSED};
use kinetis_usbfs::{
    Kinetis, PowerPolicy, System, TxChannel, UsbController, UsbDeviceConfiguration, UsbError,
    EP0_SIZE, NUM_ENDPOINTS, PACKET_SIZE,
};

/// Core clock once the PLL is up.
const CORE_HZ: u32 = 96_000_000;

/// USB OTG interrupt on MK20DX256.
const USB_IRQ: u16 = 73;

// Endpoint assignments. These have to agree with the configuration tree
// below; nothing checks that for us.
const KEYBOARD_EP: usize = 3;
const RAW_OUT_EP: usize = 1;
const RAW_IN_EP: usize = 2;

/// Raw IO packets allowed to wait for the host before `send` starts waiting.
const RAW_TX_LIMIT: usize = 4;
/// How long `send` waits for the host to drain the raw IO queue.
const RAW_TX_TIMEOUT_MS: u32 = 20;

///////////////////////////////////////////////////////////////////////////////
// Flash configuration field.
//
// The K20 reads 16 bytes at 0x400 on every reset and takes security and
// protection settings from them. Getting this wrong can lock the chip for
// good, so it's spelled out in full: no backdoor key, nothing protected,
// unsecured (FSEC = 0xFE), and default options.

#[link_section = ".flashconfig"]
#[used]
static FLASH_CONFIG: [u8; 16] = [
    0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, // backdoor key
    0xFF, 0xFF, 0xFF, 0xFF, // FPROT
    0xFE, // FSEC
    0xFF, // FOPT
    0xFF, // FEPROT
    0xFF, // FDPROT
];

///////////////////////////////////////////////////////////////////////////////
// Register access.

mod reg {
    pub const WDOG_STCTRLH: usize = 0x4005_2000;
    pub const WDOG_UNLOCK: usize = 0x4005_200E;

    pub const SIM_SOPT2: usize = 0x4004_8004;
    pub const SIM_SCGC4: usize = 0x4004_8034;
    pub const SIM_CLKDIV1: usize = 0x4004_8044;
    pub const SIM_CLKDIV2: usize = 0x4004_8048;
    pub const SIM_UIDL: usize = 0x4004_8060;

    pub const OSC0_CR: usize = 0x4006_5000;
    pub const MCG_C1: usize = 0x4006_4000;
    pub const MCG_C2: usize = 0x4006_4001;
    pub const MCG_C5: usize = 0x4006_4004;
    pub const MCG_C6: usize = 0x4006_4005;
    pub const MCG_S: usize = 0x4006_4006;

    pub const MPU_RGDAAC0: usize = 0x4000_D800;

    pub const USB0_USBTRC0: usize = 0x4007_210C;

    /// VBAT register file, which survives a system reset.
    pub const RFVBAT_REG0: usize = 0x4003_E000;

    /// # Safety
    ///
    /// `addr` must be a readable device register of this width.
    pub unsafe fn read8(addr: usize) -> u8 {
        core::ptr::read_volatile(addr as *const u8)
    }

    pub unsafe fn write8(addr: usize, v: u8) {
        core::ptr::write_volatile(addr as *mut u8, v)
    }

    pub unsafe fn write16(addr: usize, v: u16) {
        core::ptr::write_volatile(addr as *mut u16, v)
    }

    pub unsafe fn read32(addr: usize) -> u32 {
        core::ptr::read_volatile(addr as *const u32)
    }

    pub unsafe fn write32(addr: usize, v: u32) {
        core::ptr::write_volatile(addr as *mut u32, v)
    }

    pub unsafe fn modify32(addr: usize, f: impl FnOnce(u32) -> u32) {
        write32(addr, f(read32(addr)))
    }

    /// Spins until `(reg & mask) == want`.
    pub unsafe fn wait8(addr: usize, mask: u8, want: u8) {
        while read8(addr) & mask != want {}
    }
}

/// The watchdog is running out of reset, and it has to be unlocked within a
/// few cycles of being touched. Doing it here means it's off before the
/// runtime spends time zeroing RAM.
#[pre_init]
unsafe fn disable_watchdog() {
    reg::write16(reg::WDOG_UNLOCK, 0xC520);
    reg::write16(reg::WDOG_UNLOCK, 0xD928);
    cortex_m::asm::nop();
    cortex_m::asm::nop();
    // ALLOWUPDATE only; WDOGEN clear.
    reg::write16(reg::WDOG_STCTRLH, 0x0010);
}

///////////////////////////////////////////////////////////////////////////////
// Board services for the driver.

static MILLIS: AtomicU32 = AtomicU32::new(0);

struct Board;

impl System for Board {
    fn millis(&self) -> u32 {
        MILLIS.load(Ordering::Relaxed)
    }

    fn yield_now(&self) {
        // SysTick wakes us at least once a millisecond.
        cortex_m::asm::wfi();
    }

    fn device_reload(&self) {
        // The loader checks this word after reset and stays resident if it
        // finds it.
        unsafe { reg::write32(reg::RFVBAT_REG0, 0x7406_EB57) };
        SCB::sys_reset();
    }
}

#[derive(Copy, Clone)]
struct UsbIrq;

// Safety: 73 is the USB OTG vector on this part.
unsafe impl InterruptNumber for UsbIrq {
    fn number(self) -> u16 {
        USB_IRQ
    }
}

static USB: Shared<UsbController<Kinetis, Board>> = Shared::new();

///////////////////////////////////////////////////////////////////////////////
// Descriptors.

/// HID class descriptor, which sits between a HID interface and its
/// endpoints in the configuration tree.
#[repr(C)]
#[derive(AsBytes)]
struct HidDescriptor {
    length: u8,
    descriptor_type: UsbDescType,
    bcd_hid: U16<byteorder::LittleEndian>,
    country_code: u8,
    num_descriptors: u8,
    report_type: UsbDescType,
    report_length: U16<byteorder::LittleEndian>,
}

/// The whole configuration tree, in the order the host expects to read it.
#[repr(C)]
#[derive(AsBytes)]
struct ConfigTree {
    config: UsbConfigurationDescriptor,
    keyboard: UsbInterfaceDescriptor,
    keyboard_hid: HidDescriptor,
    keyboard_in: UsbEndpointDescriptor,
    raw: UsbInterfaceDescriptor,
    raw_out: UsbEndpointDescriptor,
    raw_in: UsbEndpointDescriptor,
}

/// Boot keyboard report: modifiers, reserved byte, six keys in; five LEDs
/// out.
static KEYBOARD_REPORT: [u8; 63] = [
    0x05, 0x01, 0x09, 0x06, 0xA1, 0x01, 0x75, 0x01, 0x95, 0x08, 0x05, 0x07, 0x19, 0xE0, 0x29,
    0xE7, 0x15, 0x00, 0x25, 0x01, 0x81, 0x02, 0x95, 0x01, 0x75, 0x08, 0x81, 0x03, 0x95, 0x05,
    0x75, 0x01, 0x05, 0x08, 0x19, 0x01, 0x29, 0x05, 0x91, 0x02, 0x95, 0x01, 0x75, 0x03, 0x91,
    0x03, 0x95, 0x06, 0x75, 0x08, 0x15, 0x00, 0x25, 0x7F, 0x05, 0x07, 0x19, 0x00, 0x29, 0x7F,
    0x81, 0x00, 0xC0,
];

static LANGUAGE: [u8; 4] = [4, UsbDescType::String as u8, 0x09, 0x04];
static MANUFACTURER: [u8; 20] = ascii_string("Open Keys");
static PRODUCT: [u8; 28] = ascii_string("Demo Keyboard");

fn le(v: u16) -> U16<byteorder::LittleEndian> {
    U16::new(v)
}

fn endpoint(address: u8, kind: UsbTransferType, size: usize, interval: u8) -> UsbEndpointDescriptor {
    UsbEndpointDescriptor {
        length: 7,
        descriptor_type: UsbDescType::Endpoint,
        endpoint_address: address,
        attributes: kind as u8,
        max_packet_size: le(size as u16),
        interval,
    }
}

/// Builds every descriptor and the configuration record around them. Must
/// run once.
fn build_configuration() -> Option<&'static UsbDeviceConfiguration> {
    let device: &'static UsbDeviceDescriptor = cortex_m::singleton!(: UsbDeviceDescriptor =
        UsbDeviceDescriptor {
            length: 18,
            descriptor_type: UsbDescType::Device,
            bcd_usb: le(0x0200),
            // Class is given per interface.
            device_class: 0,
            device_subclass: 0,
            device_protocol: 0,
            max_packet_size0: EP0_SIZE as u8,
            vendor: le(0x1209),
            product: le(0x0001),
            bcd_device: le(0x0100),
            manufacturer_s: 1,
            product_s: 2,
            serial_s: 3,
            num_configurations: 1,
        }
    )?;

    let tree: &'static ConfigTree = cortex_m::singleton!(: ConfigTree = ConfigTree {
        config: UsbConfigurationDescriptor {
            length: 9,
            descriptor_type: UsbDescType::Config,
            total_length: le(core::mem::size_of::<ConfigTree>() as u16),
            num_interfaces: 2,
            configuration_value: 1,
            configuration_s: 0,
            // Bus powered, remote wakeup.
            attributes: 0xA0,
            // 500 mA.
            max_power: 250,
        },
        keyboard: UsbInterfaceDescriptor {
            length: 9,
            descriptor_type: UsbDescType::Interface,
            interface_number: 0,
            alternate_setting: 0,
            num_endpoints: 1,
            // HID, boot subclass, keyboard.
            interface_class: 0x03,
            interface_subclass: 0x01,
            interface_protocol: 0x01,
            interface_s: 0,
        },
        keyboard_hid: HidDescriptor {
            length: 9,
            descriptor_type: UsbDescType::Hid,
            bcd_hid: le(0x0111),
            country_code: 0,
            num_descriptors: 1,
            report_type: UsbDescType::HidReport,
            report_length: le(KEYBOARD_REPORT.len() as u16),
        },
        keyboard_in: endpoint(0x80 | KEYBOARD_EP as u8, UsbTransferType::Interrupt, 8, 1),
        raw: UsbInterfaceDescriptor {
            length: 9,
            descriptor_type: UsbDescType::Interface,
            interface_number: 1,
            alternate_setting: 0,
            num_endpoints: 2,
            interface_class: 0xFF,
            interface_subclass: 0,
            interface_protocol: 0,
            interface_s: 0,
        },
        raw_out: endpoint(RAW_OUT_EP as u8, UsbTransferType::Bulk, PACKET_SIZE, 0),
        raw_in: endpoint(0x80 | RAW_IN_EP as u8, UsbTransferType::Bulk, PACKET_SIZE, 0),
    })?;

    // Serial number from the low word of the chip's unique ID.
    let serial: &'static mut [u8; 18] = cortex_m::singleton!(: [u8; 18] = [0; 18])?;
    let uid = unsafe { reg::read32(reg::SIM_UIDL) };
    let serial: &'static [u8] = serial_number(uid, serial);

    let device = device.as_bytes();
    let tree = tree.as_bytes();
    let keyboard_hid = &tree[18..27];
    let table: &'static [DescriptorEntry] = cortex_m::singleton!(: [DescriptorEntry; 8] = [
        DescriptorEntry::new(0x0100, 0, device),
        DescriptorEntry::new(0x0200, 0, tree),
        DescriptorEntry::new(0x0300, 0, &LANGUAGE),
        DescriptorEntry::new(0x0301, 0x0409, &MANUFACTURER),
        DescriptorEntry::new(0x0302, 0x0409, &PRODUCT),
        DescriptorEntry::new(0x0303, 0x0409, serial),
        DescriptorEntry::new(0x2100, 0, keyboard_hid),
        DescriptorEntry::new(0x2200, 0, &KEYBOARD_REPORT),
    ])?;

    let mut endpoints = [ENDPOINT_UNUSED; NUM_ENDPOINTS];
    endpoints[RAW_OUT_EP - 1] = ENDPOINT_RECEIVE_ONLY;
    endpoints[RAW_IN_EP - 1] = ENDPOINT_TRANSMIT_ONLY;
    endpoints[KEYBOARD_EP - 1] = ENDPOINT_TRANSMIT_ONLY;

    let config: &'static UsbDeviceConfiguration = cortex_m::singleton!(: UsbDeviceConfiguration =
        UsbDeviceConfiguration {
            descriptors: table,
            endpoints,
            hid_interfaces: &[0],
            cdc_interface: None,
            reboot_baud: None,
            power: PowerPolicy::TABLET_WORKAROUND,
        }
    )?;
    Some(config)
}

///////////////////////////////////////////////////////////////////////////////
// Startup.

#[entry]
fn main() -> ! {
    let mut cp = match cortex_m::Peripherals::take() {
        Some(cp) => cp,
        None => halt(),
    };

    //////////////////////////////////////////////////////////////////////////
    // Clocks. Out of reset we run from the internal reference at about
    // 21 MHz. Switch to the 16 MHz crystal, then to the PLL at 96 MHz.
    //
    // The MCG only allows certain mode transitions, so this goes
    // FEI -> FBE -> PBE -> PEE, waiting for the hardware to confirm each step.
    unsafe {
        // Crystal load capacitance.
        reg::write8(reg::OSC0_CR, 0x0A);
        // Very high frequency range, external oscillator.
        reg::write8(reg::MCG_C2, 0x24);
        // FBE: system clock from the crystal, FLL reference divided by 512.
        reg::write8(reg::MCG_C1, 0xA0);
        // Oscillator started, FLL reference is external, clock source is
        // external.
        reg::wait8(reg::MCG_S, 0x02, 0x02);
        reg::wait8(reg::MCG_S, 0x10, 0x00);
        reg::wait8(reg::MCG_S, 0x0C, 0x08);

        // PBE: PLL reference 16 / 4 = 4 MHz, times 24.
        reg::write8(reg::MCG_C5, 0x03);
        reg::write8(reg::MCG_C6, 0x40);
        // PLL selected and locked.
        reg::wait8(reg::MCG_S, 0x20, 0x20);
        reg::wait8(reg::MCG_S, 0x40, 0x40);

        // Core 96 MHz, bus 48 MHz, flash 24 MHz. Set these before the switch.
        reg::write32(reg::SIM_CLKDIV1, 0x0103_0000);

        // PEE.
        reg::write8(reg::MCG_C1, 0x20);
        reg::wait8(reg::MCG_S, 0x0C, 0x0C);
    }

    // One SysTick per millisecond.
    cp.SYST.set_clock_source(SystClkSource::Core);
    cp.SYST.set_reload(CORE_HZ / 1000 - 1);
    cp.SYST.clear_current();
    cp.SYST.enable_counter();
    cp.SYST.enable_interrupt();

    //////////////////////////////////////////////////////////////////////////
    // USB clocking and bus access.
    unsafe {
        // USB clock from the PLL, divided by 2 to get 48 MHz.
        reg::modify32(reg::SIM_SOPT2, |v| v | (1 << 18) | (1 << 16));
        reg::write32(reg::SIM_CLKDIV2, 0x02);
        // Gate the clock on.
        reg::modify32(reg::SIM_SCGC4, |v| v | (1 << 18));
        // The MPU blocks the USB block's DMA from RAM until told otherwise.
        reg::modify32(reg::MPU_RGDAAC0, |v| v | 0x0300_0000);

        // Reset the controller and wait for it to come back.
        reg::write8(reg::USB0_USBTRC0, 0x80);
        reg::wait8(reg::USB0_USBTRC0, 0x80, 0x00);
        // Required by the reference manual, not described by it.
        reg::write8(reg::USB0_USBTRC0, reg::read8(reg::USB0_USBTRC0) | 0x40);
    }

    //////////////////////////////////////////////////////////////////////////
    // The driver.
    let config = match build_configuration() {
        Some(config) => config,
        None => halt(),
    };

    // Safety: this is the only `Kinetis` in the program.
    let periph = unsafe { Kinetis::steal() };
    USB.install(UsbController::new(periph, Board, config));
    // Now that the controller has its final address, point the hardware at
    // it.
    if USB.lock(|usb| usb.init()).is_err() {
        halt();
    }

    unsafe { NVIC::unmask(UsbIrq) };

    //////////////////////////////////////////////////////////////////////////
    // Main loop: echo raw IO packets.
    let mut raw_in = TxChannel::new(RAW_IN_EP, RAW_TX_LIMIT, RAW_TX_TIMEOUT_MS);
    let mut buf = [0u8; PACKET_SIZE];

    loop {
        let _ = USB.lock(|usb| usb.poll());

        let received = USB
            .lock(|usb| -> Result<Option<usize>, UsbError> {
                let packet = match usb.rx(RAW_OUT_EP)? {
                    Some(p) => p,
                    None => return Ok(None),
                };
                let data = usb.packet(&packet).data();
                let n = data.len();
                buf[..n].copy_from_slice(data);
                usb.free(packet);
                Ok(Some(n))
            })
            .and_then(|r| r);

        match received {
            Ok(Some(n)) => {
                // A host that isn't reading just loses the echo; a timeout
                // here is not worth stopping for.
                let _ = raw_in.send(&USB, &Board, &buf[..n]);
            }
            Ok(None) | Err(_) => cortex_m::asm::wfi(),
        }
    }
}

fn halt() -> ! {
    loop {
        cortex_m::asm::wfi();
    }
}

///////////////////////////////////////////////////////////////////////////////
// Interrupts.

#[exception]
fn SysTick() {
    MILLIS.fetch_add(1, Ordering::Relaxed);
}

/// Every device interrupt lands here; only USB is enabled.
#[exception]
fn DefaultHandler(irqn: i16) {
    if irqn == USB_IRQ as i16 {
        let _ = USB.lock(|usb| usb.isr());
    }
}
