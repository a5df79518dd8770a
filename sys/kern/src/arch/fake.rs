// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Host-side architecture backend.
//!
//! Interrupts, privilege modes and the hardware timer do not exist here;
//! context switches are simulated by the scheduler's switch-point machinery
//! instead (see `sched::KernelRef::switch_point`). What remains is enough
//! for the portable kernel logic -- and its tests -- to run unmodified.

use core::sync::atomic::{AtomicPtr, AtomicU32, Ordering};

use crate::sched::{Kernel, KernelRef};
use crate::signal::{ExceptionFrame, KernelCtxFrame};
use crate::thread::Thread;
use crate::time::TimeValNanos;

/// The one kernel the syscall layer talks to. Tests that exercise the
/// syscall surface install their kernel here; everything else passes
/// `KernelRef`s around explicitly.
static CURRENT_KERNEL: AtomicPtr<Kernel> = AtomicPtr::new(core::ptr::null_mut());

/// Records the kernel for the entry points.
///
/// # Safety
///
/// `kernel` must outlive all subsequent `kernel_ref` uses.
pub unsafe fn set_kernel(kernel: *mut Kernel) {
    CURRENT_KERNEL.store(kernel, Ordering::Relaxed);
}

pub fn kernel_ref() -> KernelRef {
    let p = CURRENT_KERNEL.load(Ordering::Relaxed);
    uassert!(!p.is_null());
    // Safety: set_kernel's contract.
    unsafe { KernelRef::new(p) }
}

/// No interrupts to disable on the host; the token is vestigial.
pub fn disable_interrupts() -> u32 {
    0
}

pub fn restore_interrupts(_saved: u32) {}

pub fn set_thread_privilege(_user: bool) {}

/// Lays down the initial context-switch frame a new thread resumes from:
/// the hardware frame pointing at its entry point with the argument in R0,
/// under the kernel frame the context restore expects.
pub fn initialize_thread_stack(
    thread: &mut Thread,
    entry: usize,
    argument: usize,
    privileged: bool,
) {
    let top = thread.stack_top();
    let sp = top
        - core::mem::size_of::<KernelCtxFrame>()
        - core::mem::size_of::<ExceptionFrame>();
    uassert_eq!(sp & 0x7, 0);
    let ctx = KernelCtxFrame {
        exc_return: 0xFFFF_FFED,
        ..Default::default()
    };
    let exception = ExceptionFrame {
        r0: argument as u32,
        pc: entry as u32 | 1,
        xpsr: 1 << 24,
        ..Default::default()
    };
    // Safety: sp points into the thread's freshly allocated stack buffer.
    unsafe {
        core::ptr::write(sp as *mut KernelCtxFrame, ctx);
        core::ptr::write(
            (sp + core::mem::size_of::<KernelCtxFrame>()) as *mut ExceptionFrame,
            exception,
        );
    }
    thread.saved_sp = sp as u32 | if privileged { 0 } else { 1 };
}

static BACKUP_REGISTERS: [AtomicU32; 16] = {
    #[allow(clippy::declare_interior_mutable_const)]
    const ZERO: AtomicU32 = AtomicU32::new(0);
    [ZERO; 16]
};

pub fn write_backup_register(index: usize, value: u32) -> abi::KResult<()> {
    BACKUP_REGISTERS
        .get(index)
        .ok_or(abi::ErrorCode::InvalidArg)?
        .store(value, Ordering::Relaxed);
    Ok(())
}

pub fn read_backup_register(index: usize) -> abi::KResult<u32> {
    Ok(BACKUP_REGISTERS
        .get(index)
        .ok_or(abi::ErrorCode::InvalidArg)?
        .load(Ordering::Relaxed))
}

pub fn rtc_set_clock(_time: TimeValNanos) {}

pub fn is_debugger_attached() -> bool {
    false
}

pub fn reset() -> ! {
    panic!("SYSTEM RESET");
}
