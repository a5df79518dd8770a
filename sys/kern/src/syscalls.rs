// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The numbered syscall surface.
//!
//! The supervisor-call handler looks the number up in [`SYSCALL_TABLE`] and
//! arranges for the handler to run in privileged thread mode on the caller's
//! own stack (see `arch::arm_m`). Handlers follow one convention: they
//! receive their arguments in registers (64-bit values and extras per the
//! AAPCS), and they return a `(code, value)` pair through R0/R1 -- zero or a
//! small positive count on success, a negative errno on failure. 64-bit
//! results travel through validated out-pointers so the code slot is never
//! ambiguous.
//!
//! `RestartSyscall` never reaches user code: the return trampoline sees the
//! code, lets the pending signal deliver, and then either replays the call
//! with the arguments stashed in the TCB (handler had `SA_RESTART`) or
//! rewrites the result to `Interrupted`.
//!
//! Every pointer received from the caller is validated against the thread's
//! accessible memory before the kernel dereferences it; failures surface as
//! `InvalidArg`.
//!
//! Entries whose subsystem lives outside the kernel core (the VFS, GPIO,
//! the log manager, the serial command bridge) dispatch to
//! [`sys_unimplemented`]. The numbering is positionally stable either way.

use abi::{
    BootMode, ClockId, ErrorCode, Handle, HandleType, KResult,
    MutexRecursionMode, ObjectWaitMode, SigAction, SigActionFlags, SigSet,
    SysRetPair, ThreadAttribs, ThreadDetachState, ThreadInfo, SIG_ERR,
    SYS_COUNT,
};

use crate::sched::KernelRef;
use crate::signal;
use crate::sync::{condvar, mutex, port, sema, waitgroup};
use crate::thread;
use crate::time::TimeValNanos;
use crate::umem::{USlice, UserRegion};

/// One table slot. The wrapper exists because raw pointers are not `Sync`
/// and the table very much is: it is immutable function addresses.
pub struct SyscallEntry(*const ());

// Safety: the table is never written after initialization and the pointers
// are to functions, which are immutable.
unsafe impl Sync for SyscallEntry {}

pub fn syscall_table_entry(number: u32) -> *const () {
    SYSCALL_TABLE[number as usize].0
}

fn kr() -> KernelRef {
    crate::arch::kernel_ref()
}

fn ok(value: u32) -> SysRetPair {
    SysRetPair::success(value)
}

fn ret(result: KResult<u32>) -> SysRetPair {
    match result {
        Ok(value) => SysRetPair::success(value),
        Err(code) => SysRetPair::error(code),
    }
}

fn ret_unit(result: KResult<()>) -> SysRetPair {
    ret(result.map(|()| 0))
}

fn regions(kr: KernelRef) -> heapless::Vec<UserRegion, 4> {
    kr.crit(|k| k.user_regions.clone())
}

/// Reads one `T`-shaped block of plain data from user memory.
fn read_user<T: Copy>(kr: KernelRef, ptr: usize) -> KResult<T> {
    let slice = USlice::<T>::from_raw(ptr, 1)?;
    let regions = regions(kr);
    Ok(slice.try_read(&regions)?[0])
}

fn write_user<T: Copy>(kr: KernelRef, ptr: usize, value: T) -> KResult<()> {
    let mut slice = USlice::<T>::from_raw(ptr, 1)?;
    let regions = regions(kr);
    slice.try_write(&regions)?[0] = value;
    Ok(())
}

fn read_user_bytes<'a>(kr: KernelRef, ptr: usize, len: usize) -> KResult<&'a [u8]> {
    let slice = USlice::<u8>::from_raw(ptr, len)?;
    let regions = regions(kr);
    slice.try_read(&regions)
}

fn write_user_bytes<'a>(kr: KernelRef, ptr: usize, len: usize) -> KResult<&'a mut [u8]> {
    let mut slice = USlice::<u8>::from_raw(ptr, len)?;
    let regions = regions(kr);
    slice.try_write(&regions)
}

//
// Raw mirrors of ABI structs that contain enums or flags. User memory can
// hold any bit pattern, so these come in as plain integers and get checked
// on conversion.
//

#[derive(Copy, Clone)]
#[repr(C)]
struct RawThreadAttribs {
    name: [u8; abi::NAME_LENGTH],
    priority: i32,
    detach_state: u32,
    stack_size: u32,
}

impl RawThreadAttribs {
    fn checked(self) -> KResult<ThreadAttribs> {
        let detach_state = match self.detach_state {
            0 => ThreadDetachState::Joinable,
            1 => ThreadDetachState::Detached,
            _ => return Err(ErrorCode::InvalidArg),
        };
        Ok(ThreadAttribs {
            name: self.name,
            priority: self.priority,
            detach_state,
            stack_size: self.stack_size as usize,
        })
    }
}

#[derive(Copy, Clone, Default)]
#[repr(C)]
struct RawSigAction {
    handler: u32,
    _reserved: u32,
    mask: u64,
    flags: u32,
    _reserved2: u32,
}

impl RawSigAction {
    fn checked(self) -> SigAction {
        SigAction {
            handler: self.handler as usize,
            mask: SigSet(self.mask),
            flags: SigActionFlags::from_bits_truncate(self.flags),
        }
    }

    fn from_action(action: SigAction) -> Self {
        Self {
            handler: action.handler as u32,
            _reserved: 0,
            mask: action.mask.0,
            flags: action.flags.bits(),
            _reserved2: 0,
        }
    }
}

fn clock_from(id: u32) -> KResult<ClockId> {
    ClockId::try_from(id).map_err(|_| ErrorCode::InvalidArg)
}

fn wait_mode_from(mode: u32) -> KResult<ObjectWaitMode> {
    ObjectWaitMode::try_from(mode).map_err(|_| ErrorCode::InvalidArg)
}

fn object_name(kr: KernelRef, ptr: usize) -> KResult<heapless::String<{ abi::NAME_LENGTH }>> {
    let mut name = heapless::String::new();
    if ptr == 0 {
        return Ok(name);
    }
    let bytes = read_user_bytes(kr, ptr, abi::NAME_LENGTH)?;
    for &b in bytes {
        if b == 0 {
            break;
        }
        let _ = name.push(b as char);
    }
    Ok(name)
}

//
// Return-path support called from the trampoline assembly.
//

/// Re-raises any pending unblocked signal through the supervisor call, so
/// delivery happens with a clean exception frame to build on.
pub fn kforce_process_signals() {
    let pending = kr().crit(|k| k.current_thread().has_unblocked_pending_signals());
    if !pending {
        return;
    }
    #[cfg(target_arch = "arm")]
    // Safety: supervisor call; the handler treats this number specially and
    // returns here (possibly after running signal handlers).
    unsafe {
        core::arch::asm!(
            "svc 0",
            inout("r12") abi::SYS_PROCESS_SIGNALS => _,
            out("r0") _,
            out("r1") _,
            out("r2") _,
            out("r3") _,
            out("lr") _,
        );
    }
}

/// Called by the trampoline after every syscall: processes pending signals
/// and hands back the caller's return address with its privilege bit.
#[no_mangle]
pub extern "C" fn syscall_return() -> u32 {
    kforce_process_signals();
    kr().crit(|k| k.current_thread().syscall_return)
}

/// Called by the trampoline when a handler came back with `RestartSyscall`:
/// lets the signal deliver, then reports whether to replay the call
/// (`code = 1`) or fail it with `Interrupted` (`code = 0`). `value` is the
/// address of the saved argument-and-handler record for the replay.
#[no_mangle]
pub extern "C" fn syscall_restart_decision() -> SysRetPair {
    kforce_process_signals();
    kr().crit(|k| {
        let thread = k.current_thread_mut();
        let retry = core::mem::replace(&mut thread.restart_wanted, false);
        SysRetPair {
            code: retry as i32,
            value: core::ptr::addr_of!(thread.syscall_replay) as u32,
        }
    })
}

//
// Handlers.
//

#[no_mangle]
pub extern "C" fn sys_unimplemented() -> SysRetPair {
    SysRetPair::error(ErrorCode::NotImplemented)
}

// Time.

extern "C" fn sys_get_monotonic_time_ns(out: usize) -> SysRetPair {
    let time = kr().crit(|k| k.monotonic_time());
    ret_unit(write_user(kr(), out, time.as_nanos()))
}

extern "C" fn sys_get_monotonic_time_hires_ns(out: usize) -> SysRetPair {
    let time = kr().crit(|k| k.monotonic_time_hires());
    ret_unit(write_user(kr(), out, time.as_nanos()))
}

extern "C" fn sys_get_real_time_ns(out: usize) -> SysRetPair {
    let time = kr().crit(|k| k.real_time());
    ret_unit(write_user(kr(), out, time.as_nanos()))
}

extern "C" fn sys_get_real_time_hires_ns(out: usize) -> SysRetPair {
    let time = kr().crit(|k| k.real_time_hires());
    ret_unit(write_user(kr(), out, time.as_nanos()))
}

extern "C" fn sys_set_real_time_ns(time_ns: i64, update_rtc: u32) -> SysRetPair {
    kr().crit(|k| {
        k.set_real_time(TimeValNanos::from_nanos(time_ns), update_rtc != 0)
    });
    ok(0)
}

extern "C" fn sys_get_clock_time_offset_ns(clock: u32, out: usize) -> SysRetPair {
    ret_unit((|| {
        let clock = clock_from(clock)?;
        let offset = kr().crit(|k| k.clock_time_offset(clock))?;
        write_user(kr(), out, offset.as_nanos())
    })())
}

extern "C" fn sys_get_clock_time_ns(clock: u32, out: usize) -> SysRetPair {
    ret_unit((|| {
        let clock = clock_from(clock)?;
        let time = kr().crit(|k| k.clock_time(clock))?;
        write_user(kr(), out, time.as_nanos())
    })())
}

extern "C" fn sys_get_clock_time_hires_ns(clock: u32, out: usize) -> SysRetPair {
    ret_unit((|| {
        let clock = clock_from(clock)?;
        let time = kr().crit(|k| k.clock_time_hires(clock))?;
        write_user(kr(), out, time.as_nanos())
    })())
}

extern "C" fn sys_get_idle_time_ns(out: usize) -> SysRetPair {
    let time = kr().crit(|k| k.idle_time());
    ret_unit(write_user(kr(), out, time.as_nanos()))
}

extern "C" fn sys_get_clock_resolution_ns(clock: u32, out: usize) -> SysRetPair {
    ret_unit((|| {
        let clock = clock_from(clock)?;
        let resolution = match clock {
            ClockId::Monotonic | ClockId::MonotonicRaw | ClockId::Realtime => 1i64,
            _ => crate::time::TICK_PERIOD_NANOS,
        };
        write_user(kr(), out, resolution)
    })())
}

// Threads.

extern "C" fn sys_thread_attribs_init(out: usize) -> SysRetPair {
    let attribs = ThreadAttribs::default();
    let raw = RawThreadAttribs {
        name: attribs.name,
        priority: attribs.priority,
        detach_state: attribs.detach_state as u32,
        stack_size: attribs.stack_size as u32,
    };
    ret_unit(write_user(kr(), out, raw))
}

extern "C" fn sys_thread_spawn(attribs_ptr: usize, entry: usize, argument: usize) -> SysRetPair {
    ret((|| {
        let raw: RawThreadAttribs = read_user(kr(), attribs_ptr)?;
        let attribs = raw.checked()?;
        let id = thread::kthread_spawn(kr(), &attribs, false, entry, argument)?;
        Ok(id.0 as u32)
    })())
}

extern "C" fn sys_thread_exit(return_value: usize) -> SysRetPair {
    thread::kthread_exit(kr(), return_value);
    // A zombie never runs again; reaching this point means the scheduler
    // resumed a dead thread.
    panic!("thread_exit returned");
}

extern "C" fn sys_thread_detach(handle: i32) -> SysRetPair {
    ret_unit(thread::kthread_detach(kr(), Handle(handle)))
}

extern "C" fn sys_thread_join(handle: i32) -> SysRetPair {
    ret(thread::kthread_join(kr(), Handle(handle)).map(|v| v as u32))
}

extern "C" fn sys_get_thread_id() -> SysRetPair {
    ok(kr().crit(|k| k.current.0 as u32))
}

extern "C" fn sys_thread_set_priority(handle: i32, priority: i32) -> SysRetPair {
    ret_unit(thread::kthread_set_priority(kr(), Handle(handle), priority))
}

extern "C" fn sys_thread_get_priority(handle: i32) -> SysRetPair {
    ret(thread::kthread_get_priority(kr(), Handle(handle)).map(|p| p as u32))
}

extern "C" fn sys_get_thread_info(handle: i32, out: usize) -> SysRetPair {
    ret_unit((|| {
        let info = thread::kget_thread_info(kr(), Handle(handle))?;
        write_thread_info(out, &info)
    })())
}

extern "C" fn sys_get_next_thread_info(out: usize) -> SysRetPair {
    ret_unit((|| {
        let previous: i32 = read_user(kr(), out)?;
        let info = thread::kget_next_thread_info(kr(), Handle(previous))?;
        write_thread_info(out, &info)
    })())
}

/// `ThreadInfo` contains enums, so it goes out as a flat integer mirror:
/// thread id, name, state, priorities, blocking object, times, stack.
fn write_thread_info(out: usize, info: &ThreadInfo) -> KResult<()> {
    #[derive(Copy, Clone)]
    #[repr(C)]
    struct RawThreadInfo {
        thread_id: i32,
        name: [u8; abi::NAME_LENGTH],
        state: u32,
        priority: i32,
        dynamic_priority: i32,
        blocking_object: i32,
        run_time_nanos: i64,
        quantum_nanos: i64,
        stack_size: u32,
    }
    write_user(
        kr(),
        out,
        RawThreadInfo {
            thread_id: info.thread_id.0,
            name: info.name,
            state: info.state as u32,
            priority: info.priority,
            dynamic_priority: info.dynamic_priority,
            blocking_object: info.blocking_object.0,
            run_time_nanos: info.run_time_nanos,
            quantum_nanos: info.quantum_nanos,
            stack_size: info.stack_size as u32,
        },
    )
}

extern "C" fn sys_snooze_ns(delay_ns: i64) -> SysRetPair {
    ret_unit(thread::ksnooze(kr(), TimeValNanos::from_nanos(delay_ns)))
}

extern "C" fn sys_snooze_until_ns(resume_ns: i64) -> SysRetPair {
    ret_unit(thread::ksnooze_until(kr(), TimeValNanos::from_nanos(resume_ns)))
}

extern "C" fn sys_yield() -> SysRetPair {
    thread::kyield(kr());
    ok(0)
}

extern "C" fn sys_thread_kill(handle: i32, sig_num: i32) -> SysRetPair {
    ret_unit(signal::kthread_kill(kr(), Handle(handle), sig_num))
}

extern "C" fn sys_exit(_code: i32) -> SysRetPair {
    if crate::arch::is_debugger_attached() {
        klog!("exit with debugger attached");
    }
    crate::arch::reset()
}

extern "C" fn sys_sysconf(name: u32, out: usize) -> SysRetPair {
    // The handful of configuration values that mean something here; see
    // the user-side header for the numbering.
    const SC_CLK_TCK: u32 = 2;
    const SC_PAGESIZE: u32 = 8;
    const SC_NPROCESSORS_CONF: u32 = 9;
    const SC_NPROCESSORS_ONLN: u32 = 10;
    ret_unit((|| {
        let value: i64 = match name {
            SC_CLK_TCK => abi::TICKS_PER_SECOND as i64,
            SC_PAGESIZE => 4096,
            SC_NPROCESSORS_CONF | SC_NPROCESSORS_ONLN => 1,
            _ => return Err(ErrorCode::InvalidArg),
        };
        write_user(kr(), out, value)
    })())
}

// Semaphores.

extern "C" fn sys_semaphore_create(name_ptr: usize, count: u32, clock: u32) -> SysRetPair {
    ret((|| {
        let name = object_name(kr(), name_ptr)?;
        let clock = clock_from(clock)?;
        let handle = sema::ksemaphore_create(kr(), &name, count, clock)?;
        Ok(handle.0 as u32)
    })())
}

extern "C" fn sys_semaphore_duplicate(handle: i32) -> SysRetPair {
    ret(kr()
        .crit(|k| {
            k.object_typed(Handle(handle), HandleType::Semaphore)?;
            k.duplicate_object(Handle(handle))
        })
        .map(|h| h.0 as u32))
}

extern "C" fn sys_semaphore_delete(handle: i32) -> SysRetPair {
    ret_unit(kr().crit(|k| k.free_object(Handle(handle), HandleType::Semaphore)))
}

extern "C" fn sys_semaphore_acquire(handle: i32) -> SysRetPair {
    ret_unit(sema::ksemaphore_acquire(kr(), Handle(handle), true))
}

extern "C" fn sys_semaphore_acquire_timeout_ns(handle: i32, timeout_ns: i64) -> SysRetPair {
    ret_unit(sema::ksemaphore_acquire_timeout(
        kr(),
        Handle(handle),
        TimeValNanos::from_nanos(timeout_ns),
        true,
    ))
}

extern "C" fn sys_semaphore_acquire_deadline_ns(handle: i32, deadline_ns: i64) -> SysRetPair {
    ret_unit(sema::ksemaphore_acquire_deadline(
        kr(),
        Handle(handle),
        TimeValNanos::from_nanos(deadline_ns),
        true,
    ))
}

extern "C" fn sys_semaphore_acquire_clock_ns(
    handle: i32,
    clock: u32,
    deadline_ns: i64,
) -> SysRetPair {
    ret_unit((|| {
        let clock = clock_from(clock)?;
        sema::ksemaphore_acquire_clock(
            kr(),
            Handle(handle),
            clock,
            TimeValNanos::from_nanos(deadline_ns),
            true,
        )
    })())
}

extern "C" fn sys_semaphore_try_acquire(handle: i32) -> SysRetPair {
    ret_unit(sema::ksemaphore_try_acquire(kr(), Handle(handle)))
}

extern "C" fn sys_semaphore_release(handle: i32, count: u32) -> SysRetPair {
    ret_unit(sema::ksemaphore_release(kr(), Handle(handle), count))
}

extern "C" fn sys_semaphore_get_count(handle: i32) -> SysRetPair {
    ret(sema::ksemaphore_get_count(kr(), Handle(handle)))
}

// Mutexes.

extern "C" fn sys_mutex_create(name_ptr: usize, recursion_mode: u32, clock: u32) -> SysRetPair {
    ret((|| {
        let name = object_name(kr(), name_ptr)?;
        let mode = match recursion_mode {
            0 => MutexRecursionMode::Recurse,
            1 => MutexRecursionMode::RaiseError,
            _ => return Err(ErrorCode::InvalidArg),
        };
        let clock = clock_from(clock)?;
        let handle = mutex::kmutex_create(kr(), &name, mode, clock)?;
        Ok(handle.0 as u32)
    })())
}

extern "C" fn sys_mutex_duplicate(handle: i32) -> SysRetPair {
    ret(kr()
        .crit(|k| {
            k.object_typed(Handle(handle), HandleType::Mutex)?;
            k.duplicate_object(Handle(handle))
        })
        .map(|h| h.0 as u32))
}

extern "C" fn sys_mutex_delete(handle: i32) -> SysRetPair {
    ret_unit(kr().crit(|k| k.free_object(Handle(handle), HandleType::Mutex)))
}

extern "C" fn sys_mutex_lock(handle: i32) -> SysRetPair {
    ret_unit(mutex::kmutex_lock(kr(), Handle(handle), true))
}

extern "C" fn sys_mutex_lock_timeout_ns(handle: i32, timeout_ns: i64) -> SysRetPair {
    ret_unit(mutex::kmutex_lock_timeout(
        kr(),
        Handle(handle),
        TimeValNanos::from_nanos(timeout_ns),
        true,
    ))
}

extern "C" fn sys_mutex_lock_deadline_ns(handle: i32, deadline_ns: i64) -> SysRetPair {
    ret_unit(mutex::kmutex_lock_deadline(
        kr(),
        Handle(handle),
        TimeValNanos::from_nanos(deadline_ns),
        true,
    ))
}

extern "C" fn sys_mutex_lock_clock_ns(handle: i32, clock: u32, deadline_ns: i64) -> SysRetPair {
    ret_unit((|| {
        let clock = clock_from(clock)?;
        mutex::kmutex_lock_clock(
            kr(),
            Handle(handle),
            clock,
            TimeValNanos::from_nanos(deadline_ns),
            true,
        )
    })())
}

extern "C" fn sys_mutex_try_lock(handle: i32) -> SysRetPair {
    ret_unit(mutex::kmutex_try_lock(kr(), Handle(handle)))
}

extern "C" fn sys_mutex_unlock(handle: i32) -> SysRetPair {
    ret_unit(mutex::kmutex_unlock(kr(), Handle(handle)))
}

extern "C" fn sys_mutex_lock_shared(handle: i32) -> SysRetPair {
    ret_unit(mutex::kmutex_lock_shared(kr(), Handle(handle), true))
}

extern "C" fn sys_mutex_lock_shared_timeout_ns(handle: i32, timeout_ns: i64) -> SysRetPair {
    ret_unit(mutex::kmutex_lock_shared_timeout(
        kr(),
        Handle(handle),
        TimeValNanos::from_nanos(timeout_ns),
        true,
    ))
}

extern "C" fn sys_mutex_lock_shared_deadline_ns(handle: i32, deadline_ns: i64) -> SysRetPair {
    ret_unit(mutex::kmutex_lock_shared_deadline(
        kr(),
        Handle(handle),
        TimeValNanos::from_nanos(deadline_ns),
        true,
    ))
}

extern "C" fn sys_mutex_lock_shared_clock_ns(
    handle: i32,
    clock: u32,
    deadline_ns: i64,
) -> SysRetPair {
    ret_unit((|| {
        let clock = clock_from(clock)?;
        mutex::kmutex_lock_shared_clock(
            kr(),
            Handle(handle),
            clock,
            TimeValNanos::from_nanos(deadline_ns),
            true,
        )
    })())
}

extern "C" fn sys_mutex_try_lock_shared(handle: i32) -> SysRetPair {
    ret_unit(mutex::kmutex_try_lock_shared(kr(), Handle(handle)))
}

extern "C" fn sys_mutex_islocked(handle: i32) -> SysRetPair {
    ret(mutex::kmutex_is_locked(kr(), Handle(handle)).map(|b| b as u32))
}

// Condition variables.

extern "C" fn sys_condition_var_create(name_ptr: usize, clock: u32) -> SysRetPair {
    ret((|| {
        let name = object_name(kr(), name_ptr)?;
        let clock = clock_from(clock)?;
        let handle = condvar::kcondvar_create(kr(), &name, clock)?;
        Ok(handle.0 as u32)
    })())
}

extern "C" fn sys_condition_var_delete(handle: i32) -> SysRetPair {
    ret_unit(kr().crit(|k| {
        k.free_object(Handle(handle), HandleType::ConditionVariable)
    }))
}

extern "C" fn sys_condition_var_wait(handle: i32, mutex_handle: i32) -> SysRetPair {
    ret_unit(condvar::kcondvar_wait(kr(), Handle(handle), Handle(mutex_handle)))
}

extern "C" fn sys_condition_var_wait_timeout_ns(
    handle: i32,
    mutex_handle: i32,
    timeout_ns: i64,
) -> SysRetPair {
    ret_unit(condvar::kcondvar_wait_timeout(
        kr(),
        Handle(handle),
        Handle(mutex_handle),
        TimeValNanos::from_nanos(timeout_ns),
    ))
}

extern "C" fn sys_condition_var_wait_deadline_ns(
    handle: i32,
    mutex_handle: i32,
    deadline_ns: i64,
) -> SysRetPair {
    ret_unit(condvar::kcondvar_wait_deadline(
        kr(),
        Handle(handle),
        Handle(mutex_handle),
        TimeValNanos::from_nanos(deadline_ns),
    ))
}

extern "C" fn sys_condition_var_wait_clock_ns(
    handle: i32,
    mutex_handle: i32,
    clock: u32,
    deadline_ns: i64,
) -> SysRetPair {
    ret_unit((|| {
        let clock = clock_from(clock)?;
        condvar::kcondvar_wait_clock(
            kr(),
            Handle(handle),
            Handle(mutex_handle),
            clock,
            TimeValNanos::from_nanos(deadline_ns),
        )
    })())
}

extern "C" fn sys_condition_var_wakeup(handle: i32, count: u32) -> SysRetPair {
    ret_unit(condvar::kcondvar_wakeup(kr(), Handle(handle), count as usize))
}

extern "C" fn sys_condition_var_wakeup_all(handle: i32) -> SysRetPair {
    ret_unit(condvar::kcondvar_wakeup(kr(), Handle(handle), 0))
}

// Reboot and the backup-register hand-off.

extern "C" fn sys_reboot(boot_mode: u32) -> SysRetPair {
    let mode = match boot_mode {
        0 => BootMode::Normal,
        1 => BootMode::Bootloader,
        _ => return SysRetPair::error(ErrorCode::InvalidArg),
    };
    let _ = crate::arch::write_backup_register(abi::BACKUP_REG_BOOT_MODE, mode as u32);
    crate::arch::reset()
}

extern "C" fn sys_write_backup_register(index: u32, value: u32) -> SysRetPair {
    ret_unit(crate::arch::write_backup_register(index as usize, value))
}

extern "C" fn sys_read_backup_register(index: u32, out: usize) -> SysRetPair {
    ret_unit((|| {
        let value = crate::arch::read_backup_register(index as usize)?;
        write_user(kr(), out, value)
    })())
}

// Object wait groups.

extern "C" fn sys_object_wait_group_create(name_ptr: usize) -> SysRetPair {
    ret((|| {
        let name = object_name(kr(), name_ptr)?;
        let handle = waitgroup::kwaitgroup_create(kr(), &name)?;
        Ok(handle.0 as u32)
    })())
}

extern "C" fn sys_object_wait_group_delete(handle: i32) -> SysRetPair {
    ret_unit(kr().crit(|k| {
        k.free_object(Handle(handle), HandleType::ObjectWaitGroup)
    }))
}

extern "C" fn sys_object_wait_group_add_object(
    handle: i32,
    object: i32,
    mode: u32,
) -> SysRetPair {
    ret_unit((|| {
        let mode = wait_mode_from(mode)?;
        waitgroup::kwaitgroup_add(kr(), Handle(handle), Handle(object), mode)
    })())
}

extern "C" fn sys_object_wait_group_remove_object(
    handle: i32,
    object: i32,
    mode: u32,
) -> SysRetPair {
    ret_unit((|| {
        let mode = wait_mode_from(mode)?;
        waitgroup::kwaitgroup_remove(kr(), Handle(handle), Handle(object), mode)
    })())
}

extern "C" fn sys_object_wait_group_clear(handle: i32) -> SysRetPair {
    ret_unit(waitgroup::kwaitgroup_clear(kr(), Handle(handle)))
}

fn finish_wait_group(mask: KResult<u64>, flags_out: usize, flags_size: usize) -> SysRetPair {
    match mask {
        Ok(mask) => {
            if flags_out != 0 && flags_size > 0 {
                match write_user_bytes(kr(), flags_out, flags_size.min(8)) {
                    Ok(buffer) => {
                        let bytes = mask.to_le_bytes();
                        let n = buffer.len();
                        buffer.copy_from_slice(&bytes[..n]);
                    }
                    Err(code) => return SysRetPair::error(code),
                }
            }
            ok(0)
        }
        Err(code) => SysRetPair::error(code),
    }
}

extern "C" fn sys_object_wait_group_wait(
    handle: i32,
    mutex_handle: i32,
    flags_out: usize,
    flags_size: usize,
) -> SysRetPair {
    let mask = waitgroup::kwaitgroup_wait(kr(), Handle(handle), Handle(mutex_handle));
    finish_wait_group(mask, flags_out, flags_size)
}

extern "C" fn sys_object_wait_group_wait_timeout_ns(
    handle: i32,
    mutex_handle: i32,
    timeout_ns: i64,
    flags_out: usize,
    flags_size: usize,
) -> SysRetPair {
    let mask = waitgroup::kwaitgroup_wait_timeout(
        kr(),
        Handle(handle),
        Handle(mutex_handle),
        TimeValNanos::from_nanos(timeout_ns),
    );
    finish_wait_group(mask, flags_out, flags_size)
}

extern "C" fn sys_object_wait_group_wait_deadline_ns(
    handle: i32,
    mutex_handle: i32,
    deadline_ns: i64,
    flags_out: usize,
    flags_size: usize,
) -> SysRetPair {
    let mask = waitgroup::kwaitgroup_wait_deadline(
        kr(),
        Handle(handle),
        Handle(mutex_handle),
        TimeValNanos::from_nanos(deadline_ns),
    );
    finish_wait_group(mask, flags_out, flags_size)
}

// Message ports.

extern "C" fn sys_message_port_create(name_ptr: usize, max_count: u32) -> SysRetPair {
    ret((|| {
        let name = object_name(kr(), name_ptr)?;
        let handle = port::kport_create(kr(), &name, max_count as usize)?;
        Ok(handle.0 as u32)
    })())
}

extern "C" fn sys_message_port_duplicate(handle: i32) -> SysRetPair {
    ret(port::kport_duplicate(kr(), Handle(handle)).map(|h| h.0 as u32))
}

extern "C" fn sys_message_port_delete(handle: i32) -> SysRetPair {
    ret_unit(kr().crit(|k| k.free_object(Handle(handle), HandleType::MessagePort)))
}

extern "C" fn sys_message_port_send(
    handle: i32,
    target_handler: i32,
    code: i32,
    data: usize,
    length: usize,
) -> SysRetPair {
    ret_unit((|| {
        let data = read_user_bytes(kr(), data, length)?;
        port::kport_send(kr(), Handle(handle), target_handler, code, data, true)
    })())
}

extern "C" fn sys_message_port_send_timeout_ns(
    handle: i32,
    target_handler: i32,
    code: i32,
    data: usize,
    length: usize,
    timeout_ns: i64,
) -> SysRetPair {
    ret_unit((|| {
        let data = read_user_bytes(kr(), data, length)?;
        port::kport_send_timeout(
            kr(),
            Handle(handle),
            target_handler,
            code,
            data,
            TimeValNanos::from_nanos(timeout_ns),
            true,
        )
    })())
}

extern "C" fn sys_message_port_send_deadline_ns(
    handle: i32,
    target_handler: i32,
    code: i32,
    data: usize,
    length: usize,
    deadline_ns: i64,
) -> SysRetPair {
    ret_unit((|| {
        let data = read_user_bytes(kr(), data, length)?;
        port::kport_send_deadline(
            kr(),
            Handle(handle),
            target_handler,
            code,
            data,
            TimeValNanos::from_nanos(deadline_ns),
            true,
        )
    })())
}

fn finish_receive(
    result: KResult<(i32, i32, usize)>,
    target_out: usize,
    code_out: usize,
) -> SysRetPair {
    match result {
        Ok((target, code, copied)) => {
            if target_out != 0 {
                if let Err(e) = write_user(kr(), target_out, target) {
                    return SysRetPair::error(e);
                }
            }
            if code_out != 0 {
                if let Err(e) = write_user(kr(), code_out, code) {
                    return SysRetPair::error(e);
                }
            }
            ok(copied as u32)
        }
        Err(code) => SysRetPair::error(code),
    }
}

extern "C" fn sys_message_port_receive(
    handle: i32,
    target_out: usize,
    code_out: usize,
    buffer: usize,
    buffer_size: usize,
) -> SysRetPair {
    let result = (|| {
        let buffer = write_user_bytes(kr(), buffer, buffer_size)?;
        port::kport_receive(kr(), Handle(handle), buffer, true)
    })();
    finish_receive(result, target_out, code_out)
}

extern "C" fn sys_message_port_receive_timeout_ns(
    handle: i32,
    target_out: usize,
    code_out: usize,
    buffer: usize,
    buffer_size: usize,
    timeout_ns: i64,
) -> SysRetPair {
    let result = (|| {
        let buffer = write_user_bytes(kr(), buffer, buffer_size)?;
        port::kport_receive_timeout(
            kr(),
            Handle(handle),
            buffer,
            TimeValNanos::from_nanos(timeout_ns),
            true,
        )
    })();
    finish_receive(result, target_out, code_out)
}

extern "C" fn sys_message_port_receive_deadline_ns(
    handle: i32,
    target_out: usize,
    code_out: usize,
    buffer: usize,
    buffer_size: usize,
    deadline_ns: i64,
) -> SysRetPair {
    let result = (|| {
        let buffer = write_user_bytes(kr(), buffer, buffer_size)?;
        port::kport_receive_deadline(
            kr(),
            Handle(handle),
            buffer,
            TimeValNanos::from_nanos(deadline_ns),
            true,
        )
    })();
    finish_receive(result, target_out, code_out)
}

// Handle plumbing.

extern "C" fn sys_duplicate_handle(handle: i32) -> SysRetPair {
    ret(kr()
        .crit(|k| k.duplicate_object(Handle(handle)))
        .map(|h| h.0 as u32))
}

extern "C" fn sys_delete_handle(handle: i32) -> SysRetPair {
    ret_unit(kr().crit(|k| {
        let object = k.object(Handle(handle))?;
        let tag = object.type_tag();
        k.free_object(Handle(handle), tag)
    }))
}

extern "C" fn sys_is_debugger_attached() -> SysRetPair {
    ok(crate::arch::is_debugger_attached() as u32)
}

// Signals.

extern "C" fn sys_sigaction(sig_num: i32, new_ptr: usize, old_ptr: usize) -> SysRetPair {
    ret_unit((|| {
        let new_action = if new_ptr != 0 {
            let raw: RawSigAction = read_user(kr(), new_ptr)?;
            Some(raw.checked())
        } else {
            None
        };
        let old = kr().crit(|k| signal::ksigaction(k, sig_num, new_action))?;
        if old_ptr != 0 {
            write_user(kr(), old_ptr, RawSigAction::from_action(old))?;
        }
        Ok(())
    })())
}

extern "C" fn sys_thread_sigqueue(handle: i32, sig_num: i32, value: u32) -> SysRetPair {
    ret_unit(signal::kthread_sigqueue(kr(), Handle(handle), sig_num, value))
}

extern "C" fn sys_thread_sigmask(how: u32, new_ptr: usize, old_ptr: usize) -> SysRetPair {
    ret_unit((|| {
        let new_set = if new_ptr != 0 {
            Some(SigSet(read_user(kr(), new_ptr)?))
        } else {
            None
        };
        let old = kr().crit(|k| signal::kthread_sigmask(k, how, new_set))?;
        if old_ptr != 0 {
            write_user(kr(), old_ptr, old.0)?;
        }
        Ok(())
    })())
}

extern "C" fn sys_raise(sig_num: i32) -> SysRetPair {
    ret_unit(signal::kraise(kr(), sig_num))
}

/// The classic `signal()` interface, expressed over sigaction. Returns the
/// previous handler.
extern "C" fn sys_signal(sig_num: i32, handler: usize) -> SysRetPair {
    let action = SigAction {
        handler,
        mask: SigSet::EMPTY,
        flags: SigActionFlags::RESTART,
    };
    match kr().crit(|k| signal::ksigaction(k, sig_num, Some(action))) {
        Ok(old) => ok(old.handler as u32),
        Err(_) => SysRetPair {
            code: -(ErrorCode::InvalidArg.as_errno()),
            value: SIG_ERR as u32,
        },
    }
}

extern "C" fn sys_sigsuspend(mask_ptr: usize) -> SysRetPair {
    ret_unit((|| {
        let mask = SigSet(read_user(kr(), mask_ptr)?);
        signal::ksigsuspend(kr(), mask)
    })())
}

// A couple of syscalls keep their table position but have trivial cores.

extern "C" fn sys_getpid() -> SysRetPair {
    // Single address space: the "process" is the boot image; thread 1 (the
    // init thread) stands in for it.
    ok(kr().crit(|k| k.init.0 as u32))
}

/// The used portion of the table; everything else routes to
/// `sys_unimplemented`, keeping the numbering positionally stable.
static SYSCALL_TABLE: [SyscallEntry; SYS_COUNT as usize] = {
    macro_rules! entry {
        ($f:expr) => {
            SyscallEntry($f as *const ())
        };
    }
    [
        entry!(sys_unimplemented),                      // open
        entry!(sys_unimplemented),                      // openat
        entry!(sys_unimplemented),                      // reopen_file
        entry!(sys_unimplemented),                      // close
        entry!(sys_unimplemented),                      // fcntl
        entry!(sys_unimplemented),                      // dup
        entry!(sys_unimplemented),                      // dup2
        entry!(sys_unimplemented),                      // rename
        entry!(sys_unimplemented),                      // fstat
        entry!(sys_unimplemented),                      // stat
        entry!(sys_unimplemented),                      // write_stat
        entry!(sys_unimplemented),                      // isatty
        entry!(sys_unimplemented),                      // seek
        entry!(sys_unimplemented),                      // read
        entry!(sys_unimplemented),                      // read_pos
        entry!(sys_unimplemented),                      // readv
        entry!(sys_unimplemented),                      // readv_pos
        entry!(sys_unimplemented),                      // write
        entry!(sys_unimplemented),                      // write_pos
        entry!(sys_unimplemented),                      // writev
        entry!(sys_unimplemented),                      // writev_pos
        entry!(sys_unimplemented),                      // device_control
        entry!(sys_unimplemented),                      // create_directory
        entry!(sys_unimplemented),                      // read_directory
        entry!(sys_unimplemented),                      // rewind_directory
        entry!(sys_unimplemented),                      // remove_directory
        entry!(sys_unimplemented),                      // unlink_file
        entry!(sys_unimplemented),                      // readlink
        entry!(sys_unimplemented),                      // symlink
        entry!(sys_unimplemented),                      // get_directory_path
        entry!(sys_unimplemented),                      // chdir
        entry!(sys_unimplemented),                      // getcwd
        entry!(sys_unimplemented),                      // fsync
        entry!(sys_unimplemented),                      // mount
        entry!(sys_get_monotonic_time_ns),
        entry!(sys_get_monotonic_time_hires_ns),
        entry!(sys_get_real_time_ns),
        entry!(sys_get_real_time_hires_ns),
        entry!(sys_set_real_time_ns),
        entry!(sys_get_clock_time_offset_ns),
        entry!(sys_get_clock_time_ns),
        entry!(sys_get_clock_time_hires_ns),
        entry!(sys_get_idle_time_ns),
        entry!(sys_get_clock_resolution_ns),
        entry!(sys_unimplemented),                      // set_clock_resolution_ns
        entry!(sys_thread_attribs_init),
        entry!(sys_thread_spawn),
        entry!(sys_thread_exit),
        entry!(sys_thread_detach),
        entry!(sys_thread_join),
        entry!(sys_get_thread_id),
        entry!(sys_thread_set_priority),
        entry!(sys_thread_get_priority),
        entry!(sys_get_thread_info),
        entry!(sys_get_next_thread_info),
        entry!(sys_snooze_ns),
        entry!(sys_snooze_until_ns),
        entry!(sys_yield),
        entry!(sys_thread_kill),
        entry!(sys_getpid),
        entry!(sys_unimplemented),                      // kill (process groups)
        entry!(sys_unimplemented),                      // get_dirty_disk_cache_blocks
        entry!(sys_exit),
        entry!(sys_sysconf),
        entry!(sys_semaphore_create),
        entry!(sys_semaphore_duplicate),
        entry!(sys_semaphore_delete),
        entry!(sys_unimplemented),                      // semaphore_create_public
        entry!(sys_unimplemented),                      // semaphore_unlink_public
        entry!(sys_semaphore_acquire),
        entry!(sys_semaphore_acquire_timeout_ns),
        entry!(sys_semaphore_acquire_deadline_ns),
        entry!(sys_semaphore_acquire_clock_ns),
        entry!(sys_semaphore_try_acquire),
        entry!(sys_semaphore_release),
        entry!(sys_semaphore_get_count),
        entry!(sys_mutex_create),
        entry!(sys_mutex_duplicate),
        entry!(sys_mutex_delete),
        entry!(sys_mutex_lock),
        entry!(sys_mutex_lock_timeout_ns),
        entry!(sys_mutex_lock_deadline_ns),
        entry!(sys_mutex_lock_clock_ns),
        entry!(sys_mutex_try_lock),
        entry!(sys_mutex_unlock),
        entry!(sys_mutex_lock_shared),
        entry!(sys_mutex_lock_shared_timeout_ns),
        entry!(sys_mutex_lock_shared_deadline_ns),
        entry!(sys_mutex_lock_shared_clock_ns),
        entry!(sys_mutex_try_lock_shared),
        entry!(sys_mutex_islocked),
        entry!(sys_condition_var_create),
        entry!(sys_condition_var_delete),
        entry!(sys_condition_var_wait),
        entry!(sys_condition_var_wait_timeout_ns),
        entry!(sys_condition_var_wait_deadline_ns),
        entry!(sys_condition_var_wait_clock_ns),
        entry!(sys_condition_var_wakeup),
        entry!(sys_condition_var_wakeup_all),
        entry!(sys_reboot),
        entry!(sys_object_wait_group_create),
        entry!(sys_object_wait_group_delete),
        entry!(sys_object_wait_group_add_object),
        entry!(sys_object_wait_group_remove_object),
        entry!(sys_unimplemented),                      // object_wait_group_add_file
        entry!(sys_unimplemented),                      // object_wait_group_remove_file
        entry!(sys_object_wait_group_clear),
        entry!(sys_object_wait_group_wait),
        entry!(sys_object_wait_group_wait_timeout_ns),
        entry!(sys_object_wait_group_wait_deadline_ns),
        entry!(sys_message_port_create),
        entry!(sys_message_port_duplicate),
        entry!(sys_message_port_delete),
        entry!(sys_message_port_send),
        entry!(sys_message_port_send_timeout_ns),
        entry!(sys_message_port_send_deadline_ns),
        entry!(sys_message_port_receive),
        entry!(sys_message_port_receive_timeout_ns),
        entry!(sys_message_port_receive_deadline_ns),
        entry!(sys_unimplemented),                      // get_total_irq_time_ns
        entry!(sys_duplicate_handle),
        entry!(sys_delete_handle),
        entry!(sys_is_debugger_attached),
        entry!(sys_unimplemented),                      // digital_pin_set_direction
        entry!(sys_unimplemented),                      // digital_pin_set_drive_strength
        entry!(sys_unimplemented),                      // digital_pin_set_pull_mode
        entry!(sys_unimplemented),                      // digital_pin_set_peripheral_mux
        entry!(sys_unimplemented),                      // digital_pin_read
        entry!(sys_unimplemented),                      // digital_pin_write
        entry!(sys_write_backup_register),
        entry!(sys_read_backup_register),
        entry!(sys_unimplemented),                      // beep_seconds
        entry!(sys_unimplemented),                      // system_log_register_category
        entry!(sys_unimplemented),                      // system_log_set_category_minimum_severity
        entry!(sys_unimplemented),                      // system_log_is_category_active
        entry!(sys_unimplemented),                      // system_log_get_category_channel
        entry!(sys_unimplemented),                      // system_log_get_severity_name
        entry!(sys_unimplemented),                      // system_log_get_category_name
        entry!(sys_unimplemented),                      // system_log_get_category_display_name
        entry!(sys_unimplemented),                      // system_log_add_message
        entry!(sys_unimplemented),                      // add_serial_command_handler
        entry!(sys_unimplemented),                      // serial_command_send_data
        entry!(sys_unimplemented),                      // spawn_execve
        entry!(sys_sigaction),
        entry!(sys_thread_sigqueue),
        entry!(sys_thread_sigmask),
        entry!(sys_raise),
        entry!(sys_signal),
        entry!(sys_sigsuspend),
    ]
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_covers_every_number() {
        for n in 0..SYS_COUNT {
            assert!(!syscall_table_entry(n).is_null(), "hole at {n}");
        }
    }

    #[test]
    fn landmark_entries_are_wired() {
        use abi::Sysnum;
        // Spot-check that positional landmarks resolve to real handlers,
        // not the stub.
        let stub = sys_unimplemented as *const ();
        for sysnum in [
            Sysnum::ThreadSpawn,
            Sysnum::MutexLock,
            Sysnum::MessagePortSend,
            Sysnum::SigAction,
            Sysnum::Reboot,
        ] {
            assert_ne!(
                syscall_table_entry(sysnum as u32),
                stub,
                "{sysnum:?} routed to the stub"
            );
        }
        // And that a VFS entry really is stubbed here.
        assert_eq!(syscall_table_entry(Sysnum::Open as u32), stub);
    }

    #[test]
    fn errno_mapping_is_negative() {
        let pair = SysRetPair::error(ErrorCode::Timeout);
        assert_eq!(pair.code, -116);
        let pair = SysRetPair::error(ErrorCode::InvalidArg);
        assert_eq!(pair.code, -22);
        assert_eq!(SysRetPair::success(7).code, 0);
    }

    #[test]
    fn raw_attribs_reject_bad_detach_state() {
        let raw = RawThreadAttribs {
            name: [0; abi::NAME_LENGTH],
            priority: 0,
            detach_state: 7,
            stack_size: 4096,
        };
        assert!(raw.checked().is_err());
    }

    #[test]
    fn raw_sigaction_round_trips() {
        let action = SigAction {
            handler: 0x1234,
            mask: SigSet(0xff00),
            flags: SigActionFlags::RESTART | SigActionFlags::NODEFER,
        };
        let raw = RawSigAction::from_action(action);
        let back = raw.checked();
        assert_eq!(back.handler, action.handler);
        assert_eq!(back.mask, action.mask);
        assert_eq!(back.flags, action.flags);
    }
}
