// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel startup.
//!
//! The board support code does basic hardware bring-up and then calls
//! [`start_kernel`] with interrupts still masked. Boot builds the kernel
//! value on the fresh heap, installs the idle and init threads, arms the
//! tick, and flips the boot context onto the idle thread's stack -- the
//! code that called `start_kernel` *becomes* the idle thread, exactly so
//! the first context switch has a real stack to dump the outgoing context
//! on. The init thread runs next: it spawns the application's main thread
//! and then settles into its real job, reaping zombies.

use crate::sched::{AppVectors, KernelRef};
use crate::thread;

/// Everything the user runtime tells the kernel about itself at boot.
#[derive(Copy, Clone, Debug)]
pub struct BootParams {
    /// Core clock, Hz; the tick and the hires clock scale from it.
    pub core_frequency: u32,
    /// Entry point of the application's main thread (runs unprivileged).
    pub main_entry: usize,
    pub main_stack_size: usize,
    /// Signal and terminate trampolines in user code.
    pub vectors: AppVectors,
}

#[cfg(target_arch = "arm")]
const IDLE_STACK_SIZE: usize = 256;
#[cfg(target_arch = "arm")]
const INIT_STACK_SIZE: usize = 16 * 1024;

/// Entry point a thread returns to if it falls off the end of its entry
/// function; equivalent to calling `thread_exit(return value)`.
pub extern "C" fn thread_exit_trap(return_value: usize) -> ! {
    let kr = crate::arch::kernel_ref();
    thread::kthread_exit(kr, return_value);
    panic!("exited thread resumed");
}

/// The init thread: spawn the application, then reap zombies forever.
#[cfg(target_arch = "arm")]
extern "C" fn init_thread_entry(main_entry: usize) -> ! {
    use core::sync::atomic::Ordering;

    let kr = crate::arch::kernel_ref();

    if main_entry != 0 {
        let attribs = abi::ThreadAttribs::new(
            "main_thread",
            0,
            abi::ThreadDetachState::Detached,
            BOOT_MAIN_STACK.load(Ordering::Relaxed),
        );
        thread::kthread_spawn(kr, &attribs, false, main_entry, 0)
            .unwrap_or_else(|_| panic!("failed to spawn main thread"));
    }

    loop {
        thread::reaper_wait(kr);
    }
}

/// Stashed between `start_kernel` and the init thread; written once before
/// the scheduler starts.
#[cfg(target_arch = "arm")]
static BOOT_MAIN_STACK: core::sync::atomic::AtomicUsize =
    core::sync::atomic::AtomicUsize::new(4096);

/// Boots the kernel. Never returns in the conventional sense: the calling
/// context becomes the idle thread.
///
/// # Safety
///
/// Call exactly once, with interrupts masked, after clocks and memory are
/// up.
#[cfg(target_arch = "arm")]
pub unsafe fn start_kernel(params: BootParams) -> ! {
    use alloc::boxed::Box;

    unsafe {
        crate::heap::init();
    }

    klog!("starting: handles");
    let mut kernel = Box::new(crate::sched::Kernel::new(
        IDLE_STACK_SIZE,
        INIT_STACK_SIZE,
    ));
    kernel.app_vectors = params.vectors;

    // Unprivileged code may hand the kernel pointers anywhere in SRAM; the
    // bounds come from the linker script.
    extern "C" {
        static _suser_ram: u8;
        static _euser_ram: u8;
    }
    let base = core::ptr::addr_of!(_suser_ram) as usize;
    let size = core::ptr::addr_of!(_euser_ram) as usize - base;
    let _ = kernel.user_regions.push(crate::umem::UserRegion {
        base,
        size,
        writable: true,
    });

    BOOT_MAIN_STACK.store(params.main_stack_size, core::sync::atomic::Ordering::Relaxed);

    // Give the init thread its machine context.
    let init = kernel.init;
    {
        let thread = kernel.thread_mut(init).unwrap();
        crate::arch::initialize_thread_stack(
            thread,
            init_thread_entry as usize,
            params.main_entry,
            true,
        );
    }

    let idle_stack_top = kernel.thread(kernel.idle).unwrap().stack_top() as u32;

    let kernel = Box::leak(kernel);
    unsafe {
        crate::arch::set_kernel(kernel);
        crate::arch::setup_exceptions(params.core_frequency);
    }

    klog!("starting: scheduler");
    // The first switch fires as soon as interrupts come up; we come back
    // here as the idle thread.
    unsafe {
        crate::arch::start_scheduling(idle_stack_top);
    }

    idle_loop(crate::arch::kernel_ref())
}

/// The idle thread body: spin, and while a debugger is attached, force-wake
/// the thread it asked to resume (the debug stub parks threads in Stopped
/// and nominates them here).
pub fn idle_loop(kr: KernelRef) -> ! {
    loop {
        let wake = kr.crit(|k| {
            let wake = k.debug_wakeup_thread;
            if wake.is_valid() {
                k.debug_wakeup_thread = abi::Handle::INVALID;
            }
            wake
        });
        if wake.is_valid() && crate::arch::is_debugger_attached() {
            kr.crit(|k| k.wakeup_thread(wake, true));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::Kernel;
    use abi::ThreadState;

    #[test]
    fn reaper_wait_parks_until_zombie_arrives() {
        let mut kern = Kernel::new_for_test();
        // Run the test as the init thread (new_for_test already does).
        let kr = kern.test_ref();
        let attribs = abi::ThreadAttribs::new(
            "doomed",
            0,
            abi::ThreadDetachState::Detached,
            512,
        );
        let doomed = thread::kthread_spawn(kr, &attribs, false, 0, 0).unwrap();

        // The reaper parks; the doomed thread exits and wakes it.
        kr.sim_enqueue(move |kr| {
            kr.run_as(doomed, |kr| thread::kthread_exit(kr, 0));
        });
        thread::reaper_wait(kr);
        // Back awake; one more pass collects the corpse.
        thread::reap_zombies(kr);
        assert!(kern.thread(doomed).is_none());
        assert_eq!(kern.current_thread().state, ThreadState::Running);
    }
}
