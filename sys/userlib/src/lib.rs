// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! User-mode runtime: syscall stubs and the signal trampolines.
//!
//! Each numbered syscall gets a tiny assembly stub that loads the number
//! into R12 and executes `svc 0`. The kernel runs the handler on this
//! thread's stack in privileged mode and branches *directly back to the
//! stub's caller* with the `(code, value)` pair in R0/R1 -- the instruction
//! after the `svc` never executes. The typed wrappers below turn the pair
//! into `Result`s.
//!
//! This crate also owns the two well-known entry points the kernel needs
//! from user space: the signal-return trampoline that handlers return
//! through, and the terminate trampoline that a default-terminating signal
//! resumes into.

#![cfg_attr(not(test), no_std)]

use abi::{ErrorCode, Handle, SigInfo, SysRetPair, Sysnum};

/// Maps an errno coming back from a syscall onto the shared error enum.
fn errno_to_code(errno: i32) -> ErrorCode {
    match errno {
        2 => ErrorCode::NoEntry,
        3 => ErrorCode::NoSuchProcess,
        4 => ErrorCode::Interrupted,
        5 => ErrorCode::IOError,
        12 => ErrorCode::NoMemory,
        16 => ErrorCode::Busy,
        17 => ErrorCode::Exist,
        22 => ErrorCode::InvalidArg,
        45 => ErrorCode::Deadlock,
        79 => ErrorCode::InvalidFileType,
        88 => ErrorCode::NotImplemented,
        116 => ErrorCode::Timeout,
        _ => ErrorCode::IOError,
    }
}

fn check(pair: SysRetPair) -> Result<u32, ErrorCode> {
    if pair.code < 0 {
        Err(errno_to_code(-pair.code))
    } else {
        Ok(pair.value)
    }
}

fn check_unit(pair: SysRetPair) -> Result<(), ErrorCode> {
    check(pair).map(|_| ())
}

/// Emits one syscall stub: load the number, trap. The kernel's return path
/// branches straight back to the stub's caller.
#[cfg(target_arch = "arm")]
macro_rules! syscall_stub {
    ($name:ident, $num:expr) => {
        core::arch::global_asm!(
            concat!(
                ".section .text.",
                stringify!($name),
                "\n.globl ",
                stringify!($name),
                "\n.thumb_func\n",
                stringify!($name),
                ":\n",
                "    movw r12, #{num}\n",
                "    svc 0\n",
            ),
            num = const $num as u32,
        );
    };
}

macro_rules! syscalls {
    ($($name:ident = $sysnum:ident => ($($arg:ident: $ty:ty),*)),* $(,)?) => {
        $(
            #[cfg(target_arch = "arm")]
            syscall_stub!($name, Sysnum::$sysnum as u32);

            #[cfg(target_arch = "arm")]
            extern "C" {
                pub fn $name($($arg: $ty),*) -> SysRetPair;
            }

            /// Host builds have no supervisor to call.
            #[cfg(not(target_arch = "arm"))]
            #[allow(unused_variables)]
            pub unsafe fn $name($($arg: $ty),*) -> SysRetPair {
                let _ = Sysnum::$sysnum;
                unimplemented!(concat!(stringify!($name), " is target-only"))
            }
        )*
    };
}

syscalls! {
    sys_get_monotonic_time_ns = GetMonotonicTimeNs => (out: *mut i64),
    sys_get_monotonic_time_hires_ns = GetMonotonicTimeHiresNs => (out: *mut i64),
    sys_get_real_time_ns = GetRealTimeNs => (out: *mut i64),
    sys_get_real_time_hires_ns = GetRealTimeHiresNs => (out: *mut i64),
    sys_set_real_time_ns = SetRealTimeNs => (time_ns: i64, update_rtc: u32),
    sys_get_clock_time_offset_ns = GetClockTimeOffsetNs => (clock: u32, out: *mut i64),
    sys_get_clock_time_ns = GetClockTimeNs => (clock: u32, out: *mut i64),
    sys_get_clock_time_hires_ns = GetClockTimeHiresNs => (clock: u32, out: *mut i64),
    sys_get_idle_time_ns = GetIdleTimeNs => (out: *mut i64),
    sys_thread_attribs_init = ThreadAttribsInit => (out: *mut u8),
    sys_thread_spawn = ThreadSpawn => (attribs: *const u8, entry: usize, argument: usize),
    sys_thread_exit = ThreadExit => (return_value: usize),
    sys_thread_detach = ThreadDetach => (handle: i32),
    sys_thread_join = ThreadJoin => (handle: i32),
    sys_get_thread_id = GetThreadId => (),
    sys_thread_set_priority = ThreadSetPriority => (handle: i32, priority: i32),
    sys_thread_get_priority = ThreadGetPriority => (handle: i32),
    sys_get_thread_info = GetThreadInfo => (handle: i32, out: *mut u8),
    sys_get_next_thread_info = GetNextThreadInfo => (out: *mut u8),
    sys_snooze_ns = SnoozeNs => (delay_ns: i64),
    sys_snooze_until_ns = SnoozeUntilNs => (resume_ns: i64),
    sys_yield = Yield => (),
    sys_thread_kill = ThreadKill => (handle: i32, sig_num: i32),
    sys_exit = Exit => (code: i32),
    sys_sysconf = SysConf => (name: u32, out: *mut i64),
    sys_semaphore_create = SemaphoreCreate => (name: *const u8, count: u32, clock: u32),
    sys_semaphore_duplicate = SemaphoreDuplicate => (handle: i32),
    sys_semaphore_delete = SemaphoreDelete => (handle: i32),
    sys_semaphore_acquire = SemaphoreAcquire => (handle: i32),
    sys_semaphore_acquire_timeout_ns = SemaphoreAcquireTimeoutNs => (handle: i32, timeout_ns: i64),
    sys_semaphore_acquire_deadline_ns = SemaphoreAcquireDeadlineNs => (handle: i32, deadline_ns: i64),
    sys_semaphore_acquire_clock_ns = SemaphoreAcquireClockNs => (handle: i32, clock: u32, deadline_ns: i64),
    sys_semaphore_try_acquire = SemaphoreTryAcquire => (handle: i32),
    sys_semaphore_release = SemaphoreRelease => (handle: i32, count: u32),
    sys_semaphore_get_count = SemaphoreGetCount => (handle: i32),
    sys_mutex_create = MutexCreate => (name: *const u8, recursion_mode: u32, clock: u32),
    sys_mutex_duplicate = MutexDuplicate => (handle: i32),
    sys_mutex_delete = MutexDelete => (handle: i32),
    sys_mutex_lock = MutexLock => (handle: i32),
    sys_mutex_lock_timeout_ns = MutexLockTimeoutNs => (handle: i32, timeout_ns: i64),
    sys_mutex_lock_deadline_ns = MutexLockDeadlineNs => (handle: i32, deadline_ns: i64),
    sys_mutex_lock_clock_ns = MutexLockClockNs => (handle: i32, clock: u32, deadline_ns: i64),
    sys_mutex_try_lock = MutexTryLock => (handle: i32),
    sys_mutex_unlock = MutexUnlock => (handle: i32),
    sys_mutex_lock_shared = MutexLockShared => (handle: i32),
    sys_mutex_lock_shared_timeout_ns = MutexLockSharedTimeoutNs => (handle: i32, timeout_ns: i64),
    sys_mutex_lock_shared_deadline_ns = MutexLockSharedDeadlineNs => (handle: i32, deadline_ns: i64),
    sys_mutex_lock_shared_clock_ns = MutexLockSharedClockNs => (handle: i32, clock: u32, deadline_ns: i64),
    sys_mutex_try_lock_shared = MutexTryLockShared => (handle: i32),
    sys_mutex_islocked = MutexIsLocked => (handle: i32),
    sys_condition_var_create = ConditionVarCreate => (name: *const u8, clock: u32),
    sys_condition_var_delete = ConditionVarDelete => (handle: i32),
    sys_condition_var_wait = ConditionVarWait => (handle: i32, mutex: i32),
    sys_condition_var_wait_timeout_ns = ConditionVarWaitTimeoutNs => (handle: i32, mutex: i32, timeout_ns: i64),
    sys_condition_var_wait_deadline_ns = ConditionVarWaitDeadlineNs => (handle: i32, mutex: i32, deadline_ns: i64),
    sys_condition_var_wait_clock_ns = ConditionVarWaitClockNs => (handle: i32, mutex: i32, clock: u32, deadline_ns: i64),
    sys_condition_var_wakeup = ConditionVarWakeup => (handle: i32, count: u32),
    sys_condition_var_wakeup_all = ConditionVarWakeupAll => (handle: i32),
    sys_reboot = Reboot => (boot_mode: u32),
    sys_object_wait_group_create = ObjectWaitGroupCreate => (name: *const u8),
    sys_object_wait_group_delete = ObjectWaitGroupDelete => (handle: i32),
    sys_object_wait_group_add_object = ObjectWaitGroupAddObject => (handle: i32, object: i32, mode: u32),
    sys_object_wait_group_remove_object = ObjectWaitGroupRemoveObject => (handle: i32, object: i32, mode: u32),
    sys_object_wait_group_clear = ObjectWaitGroupClear => (handle: i32),
    sys_object_wait_group_wait = ObjectWaitGroupWait => (handle: i32, mutex: i32, flags_out: *mut u8, flags_size: usize),
    sys_object_wait_group_wait_timeout_ns = ObjectWaitGroupWaitTimeoutNs => (handle: i32, mutex: i32, timeout_ns: i64, flags_out: *mut u8, flags_size: usize),
    sys_object_wait_group_wait_deadline_ns = ObjectWaitGroupWaitDeadlineNs => (handle: i32, mutex: i32, deadline_ns: i64, flags_out: *mut u8, flags_size: usize),
    sys_message_port_create = MessagePortCreate => (name: *const u8, max_count: u32),
    sys_message_port_duplicate = MessagePortDuplicate => (handle: i32),
    sys_message_port_delete = MessagePortDelete => (handle: i32),
    sys_message_port_send = MessagePortSend => (handle: i32, target: i32, code: i32, data: *const u8, length: usize),
    sys_message_port_send_timeout_ns = MessagePortSendTimeoutNs => (handle: i32, target: i32, code: i32, data: *const u8, length: usize, timeout_ns: i64),
    sys_message_port_send_deadline_ns = MessagePortSendDeadlineNs => (handle: i32, target: i32, code: i32, data: *const u8, length: usize, deadline_ns: i64),
    sys_message_port_receive = MessagePortReceive => (handle: i32, target_out: *mut i32, code_out: *mut i32, buffer: *mut u8, buffer_size: usize),
    sys_message_port_receive_timeout_ns = MessagePortReceiveTimeoutNs => (handle: i32, target_out: *mut i32, code_out: *mut i32, buffer: *mut u8, buffer_size: usize, timeout_ns: i64),
    sys_message_port_receive_deadline_ns = MessagePortReceiveDeadlineNs => (handle: i32, target_out: *mut i32, code_out: *mut i32, buffer: *mut u8, buffer_size: usize, deadline_ns: i64),
    sys_duplicate_handle = DuplicateHandle => (handle: i32),
    sys_delete_handle = DeleteHandle => (handle: i32),
    sys_is_debugger_attached = IsDebuggerAttached => (),
    sys_write_backup_register = WriteBackupRegister => (index: u32, value: u32),
    sys_read_backup_register = ReadBackupRegister => (index: u32, out: *mut u32),
    sys_sigaction = SigAction => (sig_num: i32, new_action: *const u8, old_action: *mut u8),
    sys_thread_sigqueue = ThreadSigQueue => (handle: i32, sig_num: i32, value: u32),
    sys_thread_sigmask = ThreadSigMask => (how: u32, new_set: *const u64, old_set: *mut u64),
    sys_raise = Raise => (sig_num: i32),
    sys_signal = Signal => (sig_num: i32, handler: usize),
    sys_sigsuspend = SigSuspend => (mask: *const u64),
}

//
// The well-known user-mode entry points the kernel resumes into.
//

// On return from a signal handler, execution lands here (the kernel put
// this address in LR) and traps back into the kernel's sigreturn path.
#[cfg(target_arch = "arm")]
core::arch::global_asm!(
    "
    .section .text.__pados_signal_trampoline
    .globl __pados_signal_trampoline
    .thumb_func
    __pados_signal_trampoline:
        ldr r12, ={sigreturn}
        svc 0
    ",
    sigreturn = const abi::SYS_SIGRETURN,
);

#[cfg(target_arch = "arm")]
extern "C" {
    pub fn __pados_signal_trampoline();
}

/// A signal whose default action is Terminate resumes the thread here,
/// shaped like a handler call.
pub extern "C" fn __pados_terminate_thread(
    sig_num: i32,
    _info: *const SigInfo,
    _context: usize,
) -> ! {
    // Safety: plain syscall.
    unsafe {
        sys_thread_exit(sig_num as usize);
    }
    unreachable!()
}

/// Address of the signal-return trampoline, for kernel boot wiring.
pub fn signal_trampoline_addr() -> usize {
    #[cfg(target_arch = "arm")]
    {
        __pados_signal_trampoline as usize
    }
    #[cfg(not(target_arch = "arm"))]
    {
        0
    }
}

pub fn terminate_thread_addr() -> usize {
    __pados_terminate_thread as usize
}

//
// Thin typed wrappers.
//

pub fn snooze_ns(delay_ns: i64) -> Result<(), ErrorCode> {
    // Safety: plain syscall; all arguments by value.
    check_unit(unsafe { sys_snooze_ns(delay_ns) })
}

pub fn yield_now() {
    // Safety: plain syscall.
    let _ = unsafe { sys_yield() };
}

pub fn get_monotonic_time_ns() -> Result<i64, ErrorCode> {
    let mut out = 0i64;
    // Safety: out points at a live local.
    check_unit(unsafe { sys_get_monotonic_time_ns(&mut out) })?;
    Ok(out)
}

pub fn get_thread_id() -> Handle {
    // Safety: plain syscall.
    Handle(unsafe { sys_get_thread_id() }.value as i32)
}

pub fn mutex_lock(handle: Handle) -> Result<(), ErrorCode> {
    // Safety: plain syscall.
    check_unit(unsafe { sys_mutex_lock(handle.0) })
}

pub fn mutex_unlock(handle: Handle) -> Result<(), ErrorCode> {
    // Safety: plain syscall.
    check_unit(unsafe { sys_mutex_unlock(handle.0) })
}

pub fn mutex_try_lock(handle: Handle) -> Result<(), ErrorCode> {
    // Safety: plain syscall.
    check_unit(unsafe { sys_mutex_try_lock(handle.0) })
}

pub fn semaphore_acquire(handle: Handle) -> Result<(), ErrorCode> {
    // Safety: plain syscall.
    check_unit(unsafe { sys_semaphore_acquire(handle.0) })
}

pub fn semaphore_release(handle: Handle, count: u32) -> Result<(), ErrorCode> {
    // Safety: plain syscall.
    check_unit(unsafe { sys_semaphore_release(handle.0, count) })
}

pub fn send_message(
    handle: Handle,
    target: i32,
    code: i32,
    data: &[u8],
) -> Result<(), ErrorCode> {
    // Safety: data pointer/length describe a live slice.
    check_unit(unsafe {
        sys_message_port_send(handle.0, target, code, data.as_ptr(), data.len())
    })
}

/// Receives into `buffer`; returns `(target_handler, code, bytes_copied)`.
pub fn receive_message(
    handle: Handle,
    buffer: &mut [u8],
) -> Result<(i32, i32, usize), ErrorCode> {
    let mut target = 0i32;
    let mut code = 0i32;
    // Safety: all pointers reference live locals or the caller's buffer.
    let copied = check(unsafe {
        sys_message_port_receive(
            handle.0,
            &mut target,
            &mut code,
            buffer.as_mut_ptr(),
            buffer.len(),
        )
    })?;
    Ok((target, code, copied as usize))
}

pub fn thread_kill(handle: Handle, sig_num: i32) -> Result<(), ErrorCode> {
    // Safety: plain syscall.
    check_unit(unsafe { sys_thread_kill(handle.0, sig_num) })
}

pub fn raise(sig_num: i32) -> Result<(), ErrorCode> {
    // Safety: plain syscall.
    check_unit(unsafe { sys_raise(sig_num) })
}

pub fn delete_handle(handle: Handle) -> Result<(), ErrorCode> {
    // Safety: plain syscall.
    check_unit(unsafe { sys_delete_handle(handle.0) })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping_round_trips_known_codes() {
        for code in [
            ErrorCode::NoEntry,
            ErrorCode::Interrupted,
            ErrorCode::NoMemory,
            ErrorCode::Busy,
            ErrorCode::InvalidArg,
            ErrorCode::Deadlock,
            ErrorCode::Timeout,
            ErrorCode::NotImplemented,
        ] {
            assert_eq!(errno_to_code(code.as_errno()), code);
        }
    }

    #[test]
    fn check_splits_success_and_failure() {
        assert_eq!(check(SysRetPair::success(42)), Ok(42));
        assert_eq!(
            check(SysRetPair::error(ErrorCode::Busy)),
            Err(ErrorCode::Busy)
        );
    }
}
