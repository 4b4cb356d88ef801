// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Interrupt-mask critical sections.
//!
//! The ISR and foreground code share the packet pool, the BDT, and the
//! endpoint FIFOs. On a single-core Cortex-M with no OS, the only thing that
//! can interleave with foreground code is the interrupt handler, so masking
//! interrupts is all the exclusion we need. Keep the closures short: nothing
//! else runs while they do.

use core::cell::RefCell;

use cortex_m::interrupt::{CriticalSection, Mutex};

use crate::error::{Result, UsbError};

/// Runs `f` with interrupts masked, restoring the previous mask state on the
/// way out no matter how `f` returns.
#[cfg(all(target_arch = "arm", target_os = "none"))]
#[inline]
pub fn free<F, R>(f: F) -> R
where
    F: FnOnce(&CriticalSection) -> R,
{
    cortex_m::interrupt::free(f)
}

/// Host build: there is no interrupt context to exclude.
#[cfg(not(all(target_arch = "arm", target_os = "none")))]
#[inline]
pub fn free<F, R>(f: F) -> R
where
    F: FnOnce(&CriticalSection) -> R,
{
    // Safety: host builds run the driver from a single thread with no
    // interrupt handler, so there is nothing for the token to exclude.
    let cs = unsafe { CriticalSection::new() };
    f(&cs)
}

/// A value shared between the interrupt handler and foreground code.
///
/// Starts empty so it can live in a `static`; [`Shared::install`] puts the
/// value in once it has been built (and, for DMA-visible state, once it has
/// reached its final address).
pub struct Shared<T> {
    inner: Mutex<RefCell<Option<T>>>,
}

impl<T> Shared<T> {
    pub const fn new() -> Self {
        Self {
            inner: Mutex::new(RefCell::new(None)),
        }
    }

    /// Stores `value`, handing back whatever was there before.
    pub fn install(&self, value: T) -> Option<T> {
        free(|cs| self.inner.borrow(cs).borrow_mut().replace(value))
    }

    /// Runs `f` on the shared value with interrupts masked.
    pub fn lock<R>(&self, f: impl FnOnce(&mut T) -> R) -> Result<R> {
        free(|cs| {
            let mut slot = self.inner.borrow(cs).borrow_mut();
            match slot.as_mut() {
                Some(value) => Ok(f(value)),
                None => Err(UsbError::Uninitialized),
            }
        })
    }
}

impl<T> Default for Shared<T> {
    fn default() -> Self {
        Self::new()
    }
}
