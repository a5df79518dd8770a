// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Architecture support for ARMv7E-M (Cortex-M4F/M7 class parts).
//!
//! # Exception layout
//!
//! - `SVCall` is the syscall gate. It decodes the number from the stacked
//!   R12, drops the thread to privileged mode, and rewrites the exception
//!   frame so the return lands in a small trampoline that calls the handler
//!   on the thread's own stack, re-checks pending signals, and branches back
//!   to the caller with the original privilege restored. Two numbers bypass
//!   the table: the signal-return path and the forced pending-signal check.
//! - `PendSV` performs deferred context switches. It saves the callee-saved
//!   registers (plus the FPU high registers when the frame says so) onto the
//!   outgoing thread's stack, stashes the stack pointer -- privilege mode in
//!   bit 0 -- in the TCB, asks the scheduler for the next thread, and
//!   restores symmetrically.
//! - `SysTick` maintains the kernel tick counter and runs the preemption
//!   tick.
//! - The configurable faults share one thunk that hands the stacked context
//!   to `handle_fault_entry`, which either panics (privileged fault) or
//!   converts the fault into a signal frame on the faulting thread's stack.
//!
//! `SVCall` runs above the device IRQ priorities so an interrupt cannot
//! preempt the argument-decode window; `PendSV` and `SysTick` run at the
//! lowest priority, below every device IRQ.

use core::arch::global_asm;
use core::sync::atomic::{AtomicPtr, AtomicU32, Ordering};

use abi::{SYS_COUNT, SYS_PROCESS_SIGNALS, SYS_SIGRETURN};

use crate::sched::{Kernel, KernelRef};
use crate::signal::{ExceptionFrame, KernelCtxFrame};
use crate::thread::Thread;
use crate::time::TimeValNanos;

/// The kernel, for the exception entry points. Everything below the entry
/// points passes `KernelRef`s explicitly.
static CURRENT_KERNEL: AtomicPtr<Kernel> = AtomicPtr::new(core::ptr::null_mut());

/// Core clock in Hz, needed to scale the SysTick counter into nanoseconds.
/// Kept in a named static so a debugger can find it too.
#[no_mangle]
static CLOCK_FREQ_HZ: AtomicU32 = AtomicU32::new(0);

/// Records the kernel for the exception entry points.
///
/// # Safety
///
/// `kernel` must outlive all subsequent kernel entries and never move.
pub unsafe fn set_kernel(kernel: *mut Kernel) {
    CURRENT_KERNEL.store(kernel, Ordering::Relaxed);
}

pub fn kernel_ref() -> KernelRef {
    let p = CURRENT_KERNEL.load(Ordering::Relaxed);
    uassert!(!p.is_null());
    // Safety: set_kernel's contract.
    unsafe { KernelRef::new(p) }
}

pub unsafe fn set_clock_freq(hz: u32) {
    CLOCK_FREQ_HZ.store(hz, Ordering::Relaxed);
}

//
// Interrupt control. The kernel critical section is a PRIMASK save/disable/
// restore; nesting works because the restore re-installs the saved state.
//

pub fn disable_interrupts() -> u32 {
    let was_enabled = !cortex_m::register::primask::read().is_active();
    cortex_m::interrupt::disable();
    was_enabled as u32
}

pub fn restore_interrupts(saved: u32) {
    if saved != 0 {
        // Safety: re-enabling interrupts cannot break memory safety; the
        // critical section it guarded is already closed.
        unsafe { cortex_m::interrupt::enable() };
    }
}

/// Pends PendSV; the switch fires once interrupts allow.
pub fn pend_context_switch() {
    cortex_m::peripheral::SCB::set_pendsv();
}

/// Opens a one-instruction interrupt window so a pended context switch can
/// run, then closes it again. For the `IRQWait` condition variable forms,
/// which are entered with interrupts disabled.
pub fn irq_context_switch_window() {
    // Safety: momentarily enabling interrupts from an interrupt-disabled
    // region; the caller re-enters its critical section when we return.
    unsafe { cortex_m::interrupt::enable() };
    cortex_m::asm::isb();
    cortex_m::interrupt::disable();
}

/// Sets the thread privilege level (CONTROL.nPRIV).
pub fn set_thread_privilege(user: bool) {
    // Safety: flipping nPRIV only affects the privilege of thread-mode
    // execution, which is exactly what the signal return path needs.
    unsafe {
        let mut control = cortex_m::register::control::read();
        control.set_npriv(if user {
            cortex_m::register::control::Npriv::Unprivileged
        } else {
            cortex_m::register::control::Npriv::Privileged
        });
        cortex_m::register::control::write(control);
        cortex_m::asm::isb();
    }
}

//
// Kernel time. SysTick gives periodic 1 kHz interrupts; the real timestamp
// lives in this pair of words. Split across two AtomicU32 because ARMv7-M
// has no 64-bit atomics; both halves are only written with interrupts off.
//

static TICKS: [AtomicU32; 2] = {
    #[allow(clippy::declare_interior_mutable_const)]
    const ZERO: AtomicU32 = AtomicU32::new(0);
    [ZERO; 2]
};

pub fn now_ticks() -> u64 {
    u64::from(TICKS[0].load(Ordering::Relaxed))
        | u64::from(TICKS[1].load(Ordering::Relaxed)) << 32
}

/// High-resolution read: tick counter plus SysTick sub-tick progress.
///
/// Protocol: read the hardware counter, then the tick words; if a tick is
/// pending or the counter wrapped under us, add the missed tick and re-read
/// the counter. All under interrupts off so the window is two registers
/// wide.
pub fn now_hires_nanos() -> i64 {
    let freq = CLOCK_FREQ_HZ.load(Ordering::Relaxed) as i64;
    if freq == 0 {
        return now_ticks() as i64 * 1_000_000;
    }
    let saved = disable_interrupts();
    // Safety: read-only access to SysTick registers.
    let syst = unsafe { &*cortex_m::peripheral::SYST::PTR };
    let mut counter = syst.cvr.read();
    let mut ticks = now_ticks();
    // Safety: read-only access to ICSR.
    let icsr = unsafe { &*cortex_m::peripheral::SCB::PTR }.icsr.read();
    let pending = icsr & (1 << 26) != 0;
    if pending || syst.cvr.read() > counter {
        counter = syst.cvr.read();
        ticks += 1;
    }
    let reload = syst.rvr.read();
    restore_interrupts(saved);

    let elapsed_cycles = (reload - counter) as i64;
    ticks as i64 * 1_000_000 + elapsed_cycles * 1_000_000_000 / freq
}

/// Handler for the System Tick Timer. (Name dictated by the vector table.)
#[allow(non_snake_case)]
#[no_mangle]
pub unsafe extern "C" fn SysTick() {
    let t0 = TICKS[0].load(Ordering::Relaxed);
    if let Some(t0p) = t0.checked_add(1) {
        TICKS[0].store(t0p, Ordering::Relaxed);
    } else {
        TICKS[0].store(0, Ordering::Relaxed);
        let t1 = TICKS[1].load(Ordering::Relaxed);
        TICKS[1].store(t1 + 1, Ordering::Relaxed);
    }
    kernel_ref().crit(|k| k.tick());
}

//
// Context switch.
//

global_asm! {"
    .section .text.PendSV
    .globl PendSV
    .type PendSV,function
    PendSV:
        mrs r0, psp
        tst lr, #0x10               @ EXC_RETURN bit 4 clear = FPU frame
        it eq
        vstmdbeq r0!, {{s16-s31}}
        stmdb r0!, {{r4-r12, lr}}
        mrs r1, CONTROL
        and r1, r1, #1
        orr r0, r0, r1              @ privilege mode into bit 0 of the SP
        bl {pendsv_entry}
        mrs r1, CONTROL
        bfi r1, r0, #0, #1          @ nPRIV from bit 0 of the new SP
        msr CONTROL, r1
        isb
        bic r0, r0, #1
        ldmia r0!, {{r4-r12, lr}}
        tst lr, #0x10
        it eq
        vldmiaeq r0!, {{s16-s31}}
        msr psp, r0
        bx lr
    ",
    pendsv_entry = sym pendsv_entry,
}

/// The Rust half of PendSV: records the outgoing thread's stack pointer,
/// picks the next thread, and returns its saved stack pointer.
#[no_mangle]
extern "C" fn pendsv_entry(sp_and_privilege: u32) -> u32 {
    kernel_ref().crit(|k| {
        let current = k.current;
        if let Some(thread) = k.thread_mut(current) {
            thread.saved_sp = sp_and_privilege;
        }
        let next = k.reschedule();
        k.thread(next).unwrap().saved_sp
    })
}

//
// Supervisor call gate.
//

global_asm! {"
    .section .text.SVCall
    .globl SVCall
    .type SVCall,function
    SVCall:
        tst lr, #4                  @ EXC_RETURN bit 2: 0=MSP, 1=PSP
        ite eq
        mrseq r0, msp
        mrsne r0, psp
        ldr r1, [r0, #16]           @ stacked R12 = syscall number
        cmp r1, #{sys_count}
        bhs 2f

        mrs r2, CONTROL             @ arg 2: previous CONTROL
        mov r3, r2
        bfc r3, #0, #1              @ clear nPRIV: kernel mode for the call
        msr CONTROL, r3
        isb
        b {setup_system_call}       @ (frame, number, prev CONTROL)

    2:  cmp r1, #{sys_sigreturn}
        beq 3f
        cmp r1, #{sys_process_signals}
        beq 4f
        @ Unknown number: rewrite the return to produce ENOSYS.
        mvn r1, #{enosys_minus_1}
        str r1, [r0, #0]            @ stacked R0 = -ENOSYS
        mov r1, #0
        str r1, [r0, #4]            @ stacked R1 = 0
        ldr r1, [r0, #20]           @ stacked LR...
        str r1, [r0, #24]           @ ...becomes the stacked PC
        bx lr

    3:  @ sigreturn: strip this SVC's own exception frame (plus alignment
        @ padding) to reach the signal stack frame laid down at delivery.
        ldr r2, [r0, #28]           @ stacked xPSR
        lsrs r2, r2, #9
        and r2, r2, #1
        lsl r2, r2, #2              @ 4 bytes of padding or none
        add r0, r0, r2
        tst lr, #0x10
        ite eq
        addeq r0, r0, #104          @ extended (FPU) hardware frame
        addne r0, r0, #32           @ basic hardware frame
        bl {sigreturn_entry}
        ldmia r0!, {{r4-r12, lr}}
        tst lr, #0x10
        it eq
        vldmiaeq r0!, {{s16-s31}}
        msr psp, r0
        bx lr

    4:  @ forced pending-signal check: complete the context frame, process,
        @ and resume on whatever stack comes back.
        tst lr, #0x10
        it eq
        vstmdbeq r0!, {{s16-s31}}
        stmdb r0!, {{r4-r12, lr}}
        mrs r1, CONTROL
        and r1, r1, #1
        mov r4, r0
        bl {process_signals_entry}
        cmp r0, r4
        beq 5f
        mrs r2, CONTROL             @ a frame was added: drop privilege
        orr r2, r2, #1              @ before entering the handler
        msr CONTROL, r2
        isb
    5:  ldmia r0!, {{r4-r12, lr}}
        tst lr, #0x10
        it eq
        vldmiaeq r0!, {{s16-s31}}
        msr psp, r0
        bx lr
    ",
    setup_system_call = sym setup_system_call,
    sigreturn_entry = sym sigreturn_entry,
    process_signals_entry = sym process_signals_entry,
    sys_count = const SYS_COUNT,
    sys_sigreturn = const SYS_SIGRETURN,
    sys_process_signals = const SYS_PROCESS_SIGNALS,
    enosys_minus_1 = const abi::ErrorCode::NotImplemented as i32 as u32 - 1,
}

/// Rewrites the supervisor-call exception frame so the return lands in the
/// syscall trampoline with the handler address in R12, and records the real
/// return address (privilege mode in bit 0) plus the register arguments in
/// the TCB.
#[no_mangle]
unsafe extern "C" fn setup_system_call(
    frame: *mut ExceptionFrame,
    number: u32,
    prev_control: u32,
) {
    // Safety: frame points at the exception frame the hardware just pushed.
    let frame = unsafe { &mut *frame };
    let handler = crate::syscalls::syscall_table_entry(number);
    kernel_ref().crit(|k| {
        let thread = k.current_thread_mut();
        thread.syscall_return = (frame.lr & !1) | (prev_control & 1);
        thread.syscall_replay = crate::thread::SyscallReplay {
            args: [frame.r0, frame.r1, frame.r2, frame.r3],
            handler: handler as u32,
        };
    });
    frame.r12 = handler as u32;
    frame.pc = syscall_trampoline_entry as usize as u32;
}

#[no_mangle]
extern "C" fn sigreturn_entry(frame_sp: u32) -> u32 {
    kernel_ref().crit(|k| crate::signal::ksigreturn(k, frame_sp as usize)) as u32
}

#[no_mangle]
extern "C" fn process_signals_entry(sp: u32, user_mode: u32) -> u32 {
    kernel_ref().crit(|k| {
        crate::signal::process_pending_signals(k, sp as usize, user_mode != 0)
    }) as u32
}

extern "C" {
    /// The privileged trampoline syscalls return through; defined in
    /// assembly below.
    pub fn syscall_trampoline_entry();
}

global_asm! {"
    .section .text.syscall_trampoline_entry
    .globl syscall_trampoline_entry
    .type syscall_trampoline_entry,function
    syscall_trampoline_entry:
    1:  blx r12
        movw r2, #0xFE00            @ -ERESTARTSYS...
        movt r2, #0xFFFF            @ ...built in two halves
        cmp r0, r2
        bne 2f
        bl {restart_decision}       @ r0 = retry?, r1 = &{{args, handler}}
        cmp r0, #0
        beq 3f
        ldm r1, {{r0-r3, r12}}      @ replay with the original arguments
        b 1b
    3:  mvn r0, #3                  @ -EINTR
        mov r1, #0
    2:  push {{r0, r1}}
        bl {syscall_return}
        mov r2, r0
        pop {{r0, r1}}
        mrs r12, CONTROL
        bfi r12, r2, #0, #1         @ restore the caller's privilege
        msr CONTROL, r12
        isb
        orr r2, r2, #1
        bx r2                       @ straight back to the caller
    ",
    restart_decision = sym crate::syscalls::syscall_restart_decision,
    syscall_return = sym crate::syscalls::syscall_return,
}

//
// Fault handling.
//

global_asm! {"
    .section .text.configurable_fault
    .globl configurable_fault
    .type configurable_fault,function
    configurable_fault:
        tst lr, #4
        ite eq
        mrseq r0, msp
        mrsne r0, psp
        tst lr, #0x10
        it eq
        vstmdbeq r0!, {{s16-s31}}
        stmdb r0!, {{r4-r12, lr}}
        mrs r1, CONTROL
        bl {handle_fault}           @ (stack, CONTROL) -> new stack | nPRIV
        mrs r1, CONTROL
        bfi r1, r0, #0, #1
        msr CONTROL, r1
        isb
        bic r0, r0, #1
        ldmia r0!, {{r4-r12, lr}}
        tst lr, #0x10
        it eq
        vldmiaeq r0!, {{s16-s31}}
        msr psp, r0
        bx lr

    .section .text.MemoryManagement
    .globl MemoryManagement
    .type MemoryManagement,function
    MemoryManagement:
        b configurable_fault

    .section .text.BusFault
    .globl BusFault
    .type BusFault,function
    BusFault:
        b configurable_fault

    .section .text.UsageFault
    .globl UsageFault
    .type UsageFault,function
    UsageFault:
        b configurable_fault
    ",
    handle_fault = sym handle_fault_entry,
}

#[allow(non_snake_case)]
#[no_mangle]
pub unsafe extern "C" fn HardFault() {
    // Safety: read-only peek at the fault status for the panic message.
    let scb = unsafe { &*cortex_m::peripheral::SCB::PTR };
    panic!(
        "HardFault: HFSR={:#010x} CFSR={:#010x} BFAR={:#010x}",
        scb.hfsr.read(),
        scb.cfsr.read(),
        scb.bfar.read(),
    );
}

/// Rust entry point for the configurable faults. Faults from privileged
/// code are kernel bugs and panic; faults from unprivileged code become a
/// POSIX signal injected on the faulting thread's stack.
#[no_mangle]
unsafe extern "C" fn handle_fault_entry(stack: u32, control: u32) -> u32 {
    use crate::fault::{classify_fault, Cfsr, FaultKind};

    // Safety: read/clear access to the fault status registers.
    let scb = unsafe { &*cortex_m::peripheral::SCB::PTR };
    let exception_number = scb.icsr.read() & 0x1FF;

    if control & 1 == 0 {
        let name = match exception_number {
            2 => "NMI",
            3 => "HardFault",
            4 => "MemManage",
            5 => "BusFault",
            6 => "UsageFault",
            _ => "unknown fault",
        };
        panic!("{} from privileged code, CFSR={:#010x}", name, scb.cfsr.read());
    }

    let kind = FaultKind::from_exception_number(exception_number)
        .unwrap_or(FaultKind::BusFault);
    let cfsr = Cfsr::from_bits_truncate(scb.cfsr.read());
    let mut info = classify_fault(kind, cfsr, scb.mmfar.read(), scb.bfar.read());

    // For SIGILL/SIGFPE the interesting address is the faulting PC.
    if info.si_signo == abi::SIGILL || info.si_signo == abi::SIGFPE {
        // Safety: the stacked exception frame sits above the kernel frame
        // the assembly thunk just pushed.
        let frame = unsafe {
            &*((stack as usize + core::mem::size_of::<KernelCtxFrame>())
                as *const ExceptionFrame)
        };
        info.si_addr = frame.pc;
    }

    // Write-one-to-clear: wipe the recorded fault status.
    // Safety: standard fault-status acknowledge sequence.
    unsafe {
        scb.cfsr.write(scb.cfsr.read());
        scb.hfsr.write(scb.hfsr.read());
    }

    kernel_ref().crit(|k| {
        k.current_thread_mut().set_pending_signal(info.si_signo);
        let new_sp = crate::signal::kprocess_signal(
            k,
            info.si_signo,
            stack as usize,
            true,
            true,
            Some(&info),
        );
        new_sp as u32 | 1
    })
}

//
// Thread stacks and boot.
//

/// Lays down the initial context-switch frame a new thread resumes from.
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
        exc_return: 0xFFFF_FFED, // thread mode, PSP, basic frame
        ..Default::default()
    };
    let exception = ExceptionFrame {
        r0: argument as u32,
        pc: entry as u32 | 1, // thumb
        lr: crate::startup::thread_exit_trap as usize as u32,
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

/// Exception and timer plumbing for boot: fault handlers enabled and hoisted
/// above the kernel exceptions, SVCall above device IRQs, PendSV/SysTick at
/// the bottom, SysTick programmed for the 1 kHz kernel tick.
pub unsafe fn setup_exceptions(core_frequency: u32) {
    unsafe {
        let scb = &*cortex_m::peripheral::SCB::PTR;
        // Enable MEMFAULT, BUSFAULT and USGFAULT as distinct handlers.
        scb.shcsr.modify(|x| x | 0b111 << 16);
        // Faults at priority 0.
        scb.shpr[0].write(0x00);
        scb.shpr[1].write(0x00);
        scb.shpr[2].write(0x00);
        // SVCall above device IRQs so argument decode is not preempted.
        scb.shpr[7].write(0x10);
        // SysTick and PendSV at the lowest priority.
        scb.shpr[10].write(0xFF);
        scb.shpr[11].write(0xFF);

        // Trap divide-by-zero instead of silently producing 0.
        const DIV_0_TRP: u32 = 1 << 4;
        scb.ccr.modify(|x| x | DIV_0_TRP);

        // Device IRQs below SVCall, above PendSV/SysTick.
        let icb = &*cortex_m::peripheral::ICB::PTR;
        let irq_block_count = (icb.ictr.read() as usize & 0xF) + 1;
        let nvic = &*cortex_m::peripheral::NVIC::PTR;
        for i in 0..irq_block_count * 32 {
            nvic.ipr[i].write(0x80u8);
        }

        set_clock_freq(core_frequency);
        let syst = &*cortex_m::peripheral::SYST::PTR;
        syst.rvr.write(core_frequency / abi::TICKS_PER_SECOND as u32 - 1);
        syst.cvr.write(0);
        syst.csr.modify(|v| v | 0b111);
    }
}

/// Flips the boot context onto the idle thread's stack and lets the
/// scheduler take over: thread mode moves to PSP, the first switch is
/// pended, and enabling interrupts fires it. Returns with the boot context
/// running as the idle thread.
pub unsafe fn start_scheduling(idle_stack_top: u32) {
    unsafe {
        cortex_m::register::psp::write(idle_stack_top);
        let mut control = cortex_m::register::control::read();
        control.set_spsel(cortex_m::register::control::Spsel::Psp);
        cortex_m::register::control::write(control);
        cortex_m::asm::isb();
    }
    pend_context_switch();
    // Safety: boot runs with interrupts masked until this point.
    unsafe { cortex_m::interrupt::enable() };
    cortex_m::asm::isb();
}

//
// Hardware odds and ends.
//

pub fn reset() -> ! {
    cortex_m::peripheral::SCB::sys_reset()
}

pub fn is_debugger_attached() -> bool {
    // DHCSR.C_DEBUGEN
    const DHCSR: *const u32 = 0xE000_EDF0 as *const u32;
    // Safety: read-only access to the Debug Halting Control/Status register.
    unsafe { core::ptr::read_volatile(DHCSR) & 1 != 0 }
}

cfg_if::cfg_if! {
    if #[cfg(feature = "stm32h7-rtc")] {
        /// Backup registers live in the RTC domain and survive everything
        /// short of a power cut.
        pub fn write_backup_register(index: usize, value: u32) -> abi::KResult<()> {
            // Safety: register-level access to the RTC backup register file.
            let rtc = unsafe { &*stm32h7::stm32h743::RTC::ptr() };
            if index >= rtc.bkpr.len() {
                return Err(abi::ErrorCode::InvalidArg);
            }
            rtc.bkpr[index].write(|w| unsafe { w.bkp().bits(value) });
            Ok(())
        }

        pub fn read_backup_register(index: usize) -> abi::KResult<u32> {
            let rtc = unsafe { &*stm32h7::stm32h743::RTC::ptr() };
            if index >= rtc.bkpr.len() {
                return Err(abi::ErrorCode::InvalidArg);
            }
            Ok(rtc.bkpr[index].read().bkp().bits())
        }

        /// Writes the wall-clock time into the RTC. The RTC driver proper
        /// owns calendar conversion; the kernel only pokes the backup
        /// domain through it at boot hand-off, so this stays minimal.
        pub fn rtc_set_clock(time: TimeValNanos) {
            let _ = write_backup_register(1, (time.as_nanos() / 1_000_000_000) as u32);
        }
    } else {
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
    }
}
