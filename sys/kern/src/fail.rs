// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Support for recording kernel panics such that they can be found by
//! tooling.
//!
//! This module defines the following binary interface to debuggers:
//!
//! - `KERNEL_HAS_FAILED` is a `bool`, cleared before kernel main and set if
//!   the kernel panics. Any other value means the kernel either has not
//!   booted or corrupted memory on the way down.
//! - `KERNEL_EPITAPH` is a byte array; the panic handler writes as much of
//!   the panic message into it (as UTF-8) as fits, padded with NULs.
//!
//! Kernel panics are reserved for conditions the design says are
//! unrecoverable: faults from privileged code, destroying primitives with
//! waiters, and scheduler inconsistencies.

use core::fmt::{Display, Write};
use core::sync::atomic::Ordering;

#[used]
static mut KERNEL_HAS_FAILED: bool = false;

const EPITAPH_LEN: usize = 128;

#[used]
static mut KERNEL_EPITAPH: [u8; EPITAPH_LEN] = [0; EPITAPH_LEN];

fn begin_epitaph() -> &'static mut [u8; EPITAPH_LEN] {
    // Safety: only this function touches the flag, from a context where the
    // CPU is about to park forever; a recursive panic spins below instead of
    // re-entering.
    let previous_fail = unsafe {
        core::ptr::replace(core::ptr::addr_of_mut!(KERNEL_HAS_FAILED), true)
    };
    if previous_fail {
        loop {
            core::sync::atomic::fence(Ordering::SeqCst);
        }
    }
    // Safety: the flag guarantees a single caller reaches this point.
    unsafe { &mut *core::ptr::addr_of_mut!(KERNEL_EPITAPH) }
}

pub fn die(msg: impl Display) -> ! {
    let buf = begin_epitaph();
    let mut writer = Eulogist { dest: buf };
    write!(writer, "{msg}").ok();

    if crate::arch::is_debugger_attached() {
        cortex_m::asm::bkpt();
    }
    loop {
        core::sync::atomic::fence(Ordering::SeqCst);
    }
}

struct Eulogist {
    dest: &'static mut [u8],
}

impl Write for Eulogist {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        let s = s.as_bytes();
        let n = s.len().min(self.dest.len());
        let (dest, leftovers) = {
            let taken = core::mem::take(&mut self.dest);
            taken.split_at_mut(n)
        };
        dest.copy_from_slice(&s[..n]);
        self.dest = leftovers;
        Ok(())
    }
}

#[panic_handler]
fn panic(info: &core::panic::PanicInfo<'_>) -> ! {
    die(info)
}
