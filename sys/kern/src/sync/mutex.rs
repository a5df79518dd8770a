// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Mutex with optional recursion and shared (reader) mode.
//!
//! The signed count encodes the whole state: 0 free, negative exclusively
//! held (`-count` is the recursion depth), positive shared-held with `count`
//! readers. Exclusive lock blocks while the count is nonzero; shared lock
//! blocks only while it is negative. Unlock walks the count toward zero and,
//! on reaching it, wakes the entire wait queue -- woken writers and readers
//! re-validate the count themselves and the losers park again.

use abi::{
    ClockId, ErrorCode, Handle, HandleType, KResult, MutexRecursionMode,
    ThreadId, ThreadState,
};
use alloc::sync::Arc;

use crate::kobject::{KMutex, KObject};
use crate::sched::{Kernel, KernelRef};
use crate::time::TimeValNanos;

#[derive(Copy, Clone, Eq, PartialEq)]
pub(crate) enum LockKind {
    Exclusive,
    Shared,
}

enum Step {
    Acquired,
    Blocked,
    Restart,
    TimedOut,
}

fn try_acquire(mutex: &mut KMutex, kind: LockKind, tid: ThreadId) -> KResult<Option<()>> {
    match kind {
        LockKind::Exclusive => {
            if mutex.count == 0
                || (mutex.recursion_mode == MutexRecursionMode::Recurse
                    && mutex.holder == tid)
            {
                mutex.count -= 1;
                mutex.holder = tid;
                return Ok(Some(()));
            }
            if mutex.recursion_mode == MutexRecursionMode::RaiseError
                && mutex.holder == tid
            {
                return Err(ErrorCode::Deadlock);
            }
        }
        LockKind::Shared => {
            if mutex.count >= 0 {
                mutex.count += 1;
                return Ok(Some(()));
            }
        }
    }
    Ok(None)
}

/// The lock algorithm shared by every public lock variant, operating on an
/// already-resolved object so the condition variable can reuse it for the
/// re-acquire path.
pub(crate) fn lock_resolved(
    kr: KernelRef,
    object: &Arc<KObject>,
    handle: Handle,
    kind: LockKind,
    clock: Option<ClockId>,
    clock_deadline: TimeValNanos,
    interruptible: bool,
) -> KResult<()> {
    let tid = kr.crit(|k| k.current);
    let deadline = kr.crit(|k| {
        let mut body = object.body.lock();
        let mutex = body.as_mutex()?;
        let clock = clock.unwrap_or(mutex.clock_id);
        k.convert_clock_to_monotonic(clock, clock_deadline)
    })?;

    let mut first = true;
    loop {
        let step = kr.crit(|k| -> KResult<Step> {
            let mut body = object.body.lock();
            let mutex = body.as_mutex()?;
            if try_acquire(mutex, kind, tid)?.is_some() {
                return Ok(Step::Acquired);
            }
            if !(deadline.is_infinite() || k.monotonic_time() < deadline) {
                return Ok(Step::TimedOut);
            }
            // Only a signal breaks an interruptible wait; a waiter that was
            // woken by unlock but lost the re-acquire race parks again.
            if !first
                && interruptible
                && k.thread(tid).unwrap().has_unblocked_pending_signals()
            {
                return Ok(Step::Restart);
            }
            mutex.wait_queue.append(tid);
            let thread = k.thread_mut(tid).unwrap();
            thread.blocking_object = handle;
            if deadline.is_infinite() {
                thread.state = ThreadState::Waiting;
            } else {
                thread.state = ThreadState::Sleeping;
                k.sleep.add(tid, deadline);
            }
            k.request_context_switch();
            Ok(Step::Blocked)
        })?;

        match step {
            Step::Acquired => return Ok(()),
            Step::TimedOut => return Err(ErrorCode::Timeout),
            Step::Restart => return Err(ErrorCode::RestartSyscall),
            Step::Blocked => {}
        }

        kr.switch_point();

        kr.crit(|k| -> KResult<()> {
            let mut body = object.body.lock();
            let mutex = body.as_mutex()?;
            mutex.wait_queue.remove(tid);
            k.sleep.remove(tid);
            let thread = k.thread_mut(tid).unwrap();
            thread.blocking_object = Handle::INVALID;
            if thread.take_target_deleted() {
                return Err(ErrorCode::InvalidArg);
            }
            Ok(())
        })?;
        first = false;
    }
}

/// Unlock on an already-locked body, so callers holding the body lock (the
/// condition variable's atomic release) can use it.
pub(crate) fn unlock_inner(kernel: &mut Kernel, mutex: &mut KMutex) -> KResult<()> {
    if mutex.count < 0 {
        mutex.count += 1;
    } else if mutex.count > 0 {
        mutex.count -= 1;
    } else {
        return Err(ErrorCode::InvalidArg);
    }
    if mutex.count == 0 {
        mutex.holder = Handle::INVALID;
        let need_switch = kernel.wakeup_wait_queue(&mut mutex.wait_queue, 0);
        kernel.fire_listeners(&mut mutex.listeners);
        if need_switch {
            kernel.request_context_switch();
        }
    }
    Ok(())
}

fn resolve(kr: KernelRef, handle: Handle) -> KResult<Arc<KObject>> {
    kr.crit(|k| k.object_typed(handle, HandleType::Mutex))
}

pub fn kmutex_create(
    kr: KernelRef,
    name: &str,
    recursion_mode: MutexRecursionMode,
    clock_id: ClockId,
) -> KResult<Handle> {
    kr.crit(|k| k.register_object(KObject::new_mutex(name, recursion_mode, clock_id)))
}

pub fn kmutex_lock(kr: KernelRef, handle: Handle, interruptible: bool) -> KResult<()> {
    let object = resolve(kr, handle)?;
    lock_resolved(
        kr,
        &object,
        handle,
        LockKind::Exclusive,
        Some(ClockId::MonotonicCoarse),
        TimeValNanos::INFINITE,
        interruptible,
    )
}

/// Timed lock; the deadline is `now + timeout` on the coarse monotonic
/// clock, so a zero timeout degenerates to try-lock-with-Timeout.
pub fn kmutex_lock_timeout(
    kr: KernelRef,
    handle: Handle,
    timeout: TimeValNanos,
    interruptible: bool,
) -> KResult<()> {
    let object = resolve(kr, handle)?;
    let deadline = kr.crit(|k| k.timeout_to_deadline(timeout));
    lock_resolved(
        kr,
        &object,
        handle,
        LockKind::Exclusive,
        Some(ClockId::MonotonicCoarse),
        deadline,
        interruptible,
    )
}

/// Deadline lock on the mutex's own clock.
pub fn kmutex_lock_deadline(
    kr: KernelRef,
    handle: Handle,
    deadline: TimeValNanos,
    interruptible: bool,
) -> KResult<()> {
    let object = resolve(kr, handle)?;
    lock_resolved(
        kr,
        &object,
        handle,
        LockKind::Exclusive,
        None,
        deadline,
        interruptible,
    )
}

pub fn kmutex_lock_clock(
    kr: KernelRef,
    handle: Handle,
    clock: ClockId,
    deadline: TimeValNanos,
    interruptible: bool,
) -> KResult<()> {
    let object = resolve(kr, handle)?;
    lock_resolved(
        kr,
        &object,
        handle,
        LockKind::Exclusive,
        Some(clock),
        deadline,
        interruptible,
    )
}

pub fn kmutex_try_lock(kr: KernelRef, handle: Handle) -> KResult<()> {
    let object = resolve(kr, handle)?;
    kr.crit(|k| {
        let tid = k.current;
        let mut body = object.body.lock();
        let mutex = body.as_mutex()?;
        match try_acquire(mutex, LockKind::Exclusive, tid)? {
            Some(()) => Ok(()),
            None => Err(ErrorCode::Busy),
        }
    })
}

pub fn kmutex_unlock(kr: KernelRef, handle: Handle) -> KResult<()> {
    let object = resolve(kr, handle)?;
    kr.crit(|k| {
        let mut body = object.body.lock();
        let mutex = body.as_mutex()?;
        unlock_inner(k, mutex)
    })
}

pub fn kmutex_lock_shared(kr: KernelRef, handle: Handle, interruptible: bool) -> KResult<()> {
    let object = resolve(kr, handle)?;
    lock_resolved(
        kr,
        &object,
        handle,
        LockKind::Shared,
        Some(ClockId::MonotonicCoarse),
        TimeValNanos::INFINITE,
        interruptible,
    )
}

pub fn kmutex_lock_shared_timeout(
    kr: KernelRef,
    handle: Handle,
    timeout: TimeValNanos,
    interruptible: bool,
) -> KResult<()> {
    let object = resolve(kr, handle)?;
    let deadline = kr.crit(|k| k.timeout_to_deadline(timeout));
    lock_resolved(
        kr,
        &object,
        handle,
        LockKind::Shared,
        Some(ClockId::MonotonicCoarse),
        deadline,
        interruptible,
    )
}

pub fn kmutex_lock_shared_deadline(
    kr: KernelRef,
    handle: Handle,
    deadline: TimeValNanos,
    interruptible: bool,
) -> KResult<()> {
    let object = resolve(kr, handle)?;
    lock_resolved(kr, &object, handle, LockKind::Shared, None, deadline, interruptible)
}

pub fn kmutex_lock_shared_clock(
    kr: KernelRef,
    handle: Handle,
    clock: ClockId,
    deadline: TimeValNanos,
    interruptible: bool,
) -> KResult<()> {
    let object = resolve(kr, handle)?;
    lock_resolved(
        kr,
        &object,
        handle,
        LockKind::Shared,
        Some(clock),
        deadline,
        interruptible,
    )
}

pub fn kmutex_try_lock_shared(kr: KernelRef, handle: Handle) -> KResult<()> {
    let object = resolve(kr, handle)?;
    kr.crit(|k| {
        let tid = k.current;
        let mut body = object.body.lock();
        let mutex = body.as_mutex()?;
        match try_acquire(mutex, LockKind::Shared, tid)? {
            Some(()) => Ok(()),
            None => Err(ErrorCode::Busy),
        }
    })
}

/// Whether the calling thread holds the mutex. Note this deliberately
/// reports on the *caller*, not on "anyone."
pub fn kmutex_is_locked(kr: KernelRef, handle: Handle) -> KResult<bool> {
    let object = resolve(kr, handle)?;
    kr.crit(|k| {
        let tid = k.current;
        let mut body = object.body.lock();
        let mutex = body.as_mutex()?;
        Ok(mutex.count != 0 && mutex.holder == tid)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::thread::spawn_parked;

    fn new_mutex(kr: KernelRef, mode: MutexRecursionMode) -> Handle {
        kmutex_create(kr, "m", mode, ClockId::MonotonicCoarse).unwrap()
    }

    #[test]
    fn lock_unlock_round_trip() {
        let mut kern = Kernel::new_for_test();
        let kr = kern.test_ref();
        let m = new_mutex(kr, MutexRecursionMode::RaiseError);
        kmutex_lock(kr, m, false).unwrap();
        assert!(kmutex_is_locked(kr, m).unwrap());
        kmutex_unlock(kr, m).unwrap();
        assert!(!kmutex_is_locked(kr, m).unwrap());
        // Count is back to zero: unlocking again is an error.
        assert_eq!(kmutex_unlock(kr, m), Err(ErrorCode::InvalidArg));
    }

    #[test]
    fn recursive_lock_counts_depth() {
        let mut kern = Kernel::new_for_test();
        let kr = kern.test_ref();
        let m = new_mutex(kr, MutexRecursionMode::Recurse);
        kmutex_lock(kr, m, false).unwrap();
        kmutex_lock(kr, m, false).unwrap();
        kmutex_unlock(kr, m).unwrap();
        assert!(kmutex_is_locked(kr, m).unwrap());
        kmutex_unlock(kr, m).unwrap();
        assert!(!kmutex_is_locked(kr, m).unwrap());
    }

    #[test]
    fn self_lock_in_raise_error_mode_is_deadlock() {
        let mut kern = Kernel::new_for_test();
        let kr = kern.test_ref();
        let m = new_mutex(kr, MutexRecursionMode::RaiseError);
        kmutex_lock(kr, m, false).unwrap();
        assert_eq!(kmutex_lock(kr, m, false), Err(ErrorCode::Deadlock));
    }

    #[test]
    fn try_lock_reports_busy() {
        let mut kern = Kernel::new_for_test();
        let kr = kern.test_ref();
        let holder = spawn_parked(&mut kern, "holder", 0);
        let m = new_mutex(kr, MutexRecursionMode::RaiseError);
        kr.run_as(holder, |kr| kmutex_try_lock(kr, m).unwrap());
        assert_eq!(kmutex_try_lock(kr, m), Err(ErrorCode::Busy));
    }

    #[test]
    fn zero_timeout_does_not_block() {
        let mut kern = Kernel::new_for_test();
        let kr = kern.test_ref();
        let holder = spawn_parked(&mut kern, "holder", 0);
        let m = new_mutex(kr, MutexRecursionMode::RaiseError);
        kr.run_as(holder, |kr| kmutex_try_lock(kr, m).unwrap());
        assert_eq!(
            kmutex_lock_timeout(kr, m, TimeValNanos::ZERO, false),
            Err(ErrorCode::Timeout)
        );
    }

    #[test]
    fn contended_lock_hands_off_fifo() {
        let mut kern = Kernel::new_for_test();
        let kr = kern.test_ref();
        let holder = spawn_parked(&mut kern, "holder", 0);
        let m = new_mutex(kr, MutexRecursionMode::RaiseError);
        kr.run_as(holder, |kr| kmutex_lock(kr, m, false).unwrap());

        kr.sim_enqueue(move |kr| {
            kr.run_as(holder, |kr| kmutex_unlock(kr, m).unwrap());
        });
        kmutex_lock(kr, m, false).unwrap();
        assert!(kmutex_is_locked(kr, m).unwrap());
    }

    #[test]
    fn lock_timeout_expires() {
        let mut kern = Kernel::new_for_test();
        let kr = kern.test_ref();
        let holder = spawn_parked(&mut kern, "holder", 0);
        let m = new_mutex(kr, MutexRecursionMode::RaiseError);
        kr.run_as(holder, |kr| kmutex_lock(kr, m, false).unwrap());

        kr.sim_enqueue(|kr| {
            kr.crit(|k| k.sim_advance_ms(100));
        });
        assert_eq!(
            kmutex_lock_timeout(kr, m, TimeValNanos::from_millis(50), false),
            Err(ErrorCode::Timeout)
        );
        // The holder still owns it.
        assert_eq!(kmutex_try_lock(kr, m), Err(ErrorCode::Busy));
    }

    #[test]
    fn signal_wake_returns_restart_when_interruptible() {
        let mut kern = Kernel::new_for_test();
        let kr = kern.test_ref();
        let me = kern.current;
        let holder = spawn_parked(&mut kern, "holder", 0);
        let m = new_mutex(kr, MutexRecursionMode::RaiseError);
        kr.run_as(holder, |kr| kmutex_lock(kr, m, false).unwrap());

        kr.sim_enqueue(move |kr| {
            kr.crit(|k| {
                k.thread_mut(me).unwrap().set_pending_signal(abi::SIGUSR1);
                k.wakeup_thread(me, false);
            });
        });
        assert_eq!(
            kmutex_lock(kr, m, true),
            Err(ErrorCode::RestartSyscall)
        );
        kr.crit(|k| k.thread_mut(me).unwrap().clear_pending_signal(abi::SIGUSR1));
    }

    #[test]
    fn lost_race_wakeup_parks_again() {
        let mut kern = Kernel::new_for_test();
        let kr = kern.test_ref();
        let me = kern.current;
        let holder = spawn_parked(&mut kern, "holder", 0);
        let m = new_mutex(kr, MutexRecursionMode::RaiseError);
        kr.run_as(holder, |kr| kmutex_lock(kr, m, false).unwrap());

        // First wake: no signal, and the mutex is still held -- the waiter
        // must park again rather than report an interruption.
        kr.sim_enqueue(move |kr| {
            kr.crit(|k| k.wakeup_thread(me, false));
        });
        // Second wake: a real handoff.
        kr.sim_enqueue(move |kr| {
            kr.run_as(holder, |kr| kmutex_unlock(kr, m).unwrap());
        });
        kmutex_lock(kr, m, true).unwrap();
        assert!(kmutex_is_locked(kr, m).unwrap());
    }

    #[test]
    fn shared_readers_stack_and_block_writers() {
        let mut kern = Kernel::new_for_test();
        let kr = kern.test_ref();
        let m = new_mutex(kr, MutexRecursionMode::RaiseError);
        let readers: alloc::vec::Vec<_> =
            (0..3).map(|i| spawn_parked(&mut kern, "r", i)).collect();
        for &r in &readers {
            kr.run_as(r, |kr| kmutex_try_lock_shared(kr, m).unwrap());
        }
        {
            let object = kern.object(m).unwrap();
            assert_eq!(object.body.lock().as_mutex().unwrap().count, 3);
        }
        // A writer cannot get in.
        assert_eq!(kmutex_try_lock(kr, m), Err(ErrorCode::Busy));
        // But further readers can.
        kmutex_try_lock_shared(kr, m).unwrap();
    }

    #[test]
    fn writer_wakes_when_last_reader_leaves() {
        let mut kern = Kernel::new_for_test();
        let kr = kern.test_ref();
        let reader = spawn_parked(&mut kern, "r", 0);
        let m = new_mutex(kr, MutexRecursionMode::RaiseError);
        kr.run_as(reader, |kr| kmutex_try_lock_shared(kr, m).unwrap());

        kr.sim_enqueue(move |kr| {
            kr.run_as(reader, |kr| kmutex_unlock(kr, m).unwrap());
        });
        kmutex_lock(kr, m, false).unwrap();
        assert!(kmutex_is_locked(kr, m).unwrap());
    }

    #[test]
    fn deleting_mutex_under_waiter_reports_invalid_arg() {
        let mut kern = Kernel::new_for_test();
        let kr = kern.test_ref();
        let holder = spawn_parked(&mut kern, "holder", 0);
        let m = new_mutex(kr, MutexRecursionMode::RaiseError);
        kr.run_as(holder, |kr| kmutex_lock(kr, m, false).unwrap());

        kr.sim_enqueue(move |kr| {
            kr.crit(|k| k.free_object(m, HandleType::Mutex).unwrap());
        });
        assert_eq!(kmutex_lock(kr, m, false), Err(ErrorCode::InvalidArg));
    }

    #[test]
    fn mutex_at_rest_has_no_holder() {
        let mut kern = Kernel::new_for_test();
        let kr = kern.test_ref();
        let m = new_mutex(kr, MutexRecursionMode::Recurse);
        kmutex_lock(kr, m, false).unwrap();
        kmutex_unlock(kr, m).unwrap();
        let object = kern.object(m).unwrap();
        let mut body = object.body.lock();
        let mutex = body.as_mutex().unwrap();
        assert_eq!(mutex.count, 0);
        assert_eq!(mutex.holder, Handle::INVALID);
    }
}
