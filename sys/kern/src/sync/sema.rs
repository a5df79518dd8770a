// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Counting semaphores.
//!
//! `acquire` takes a unit or parks; `release(n)` adds `n` units and wakes up
//! to `n` waiters in FIFO order. A woken waiter re-validates the count, so a
//! release larger than the waiter population leaves the residue in the
//! count. Timed acquisition converts deadlines through the semaphore's
//! clock, exactly like the mutex.

use abi::{ClockId, ErrorCode, Handle, HandleType, KResult, ThreadState};
use alloc::sync::Arc;

use crate::kobject::KObject;
use crate::sched::KernelRef;
use crate::time::TimeValNanos;

enum Step {
    Acquired,
    Blocked,
    Restart,
    TimedOut,
}

fn acquire_resolved(
    kr: KernelRef,
    object: &Arc<KObject>,
    handle: Handle,
    clock: Option<ClockId>,
    clock_deadline: TimeValNanos,
    interruptible: bool,
) -> KResult<()> {
    let tid = kr.crit(|k| k.current);
    let deadline = kr.crit(|k| {
        let mut body = object.body.lock();
        let sema = body.as_semaphore()?;
        let clock = clock.unwrap_or(sema.clock_id);
        k.convert_clock_to_monotonic(clock, clock_deadline)
    })?;

    let mut first = true;
    loop {
        let step = kr.crit(|k| -> KResult<Step> {
            let mut body = object.body.lock();
            let sema = body.as_semaphore()?;
            if sema.count > 0 {
                sema.count -= 1;
                return Ok(Step::Acquired);
            }
            if !(deadline.is_infinite() || k.monotonic_time() < deadline) {
                return Ok(Step::TimedOut);
            }
            // Only a signal breaks an interruptible wait; a waiter that was
            // woken by release but lost the count to someone else parks
            // again.
            if !first
                && interruptible
                && k.thread(tid).unwrap().has_unblocked_pending_signals()
            {
                return Ok(Step::Restart);
            }
            sema.wait_queue.append(tid);
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
            let sema = body.as_semaphore()?;
            sema.wait_queue.remove(tid);
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

fn resolve(kr: KernelRef, handle: Handle) -> KResult<Arc<KObject>> {
    kr.crit(|k| k.object_typed(handle, HandleType::Semaphore))
}

pub fn ksemaphore_create(
    kr: KernelRef,
    name: &str,
    count: u32,
    clock_id: ClockId,
) -> KResult<Handle> {
    kr.crit(|k| k.register_object(KObject::new_semaphore(name, count, clock_id)))
}

pub fn ksemaphore_acquire(kr: KernelRef, handle: Handle, interruptible: bool) -> KResult<()> {
    let object = resolve(kr, handle)?;
    acquire_resolved(
        kr,
        &object,
        handle,
        Some(ClockId::MonotonicCoarse),
        TimeValNanos::INFINITE,
        interruptible,
    )
}

pub fn ksemaphore_acquire_timeout(
    kr: KernelRef,
    handle: Handle,
    timeout: TimeValNanos,
    interruptible: bool,
) -> KResult<()> {
    let object = resolve(kr, handle)?;
    let deadline = kr.crit(|k| k.timeout_to_deadline(timeout));
    acquire_resolved(
        kr,
        &object,
        handle,
        Some(ClockId::MonotonicCoarse),
        deadline,
        interruptible,
    )
}

/// Deadline acquire on the semaphore's own clock.
pub fn ksemaphore_acquire_deadline(
    kr: KernelRef,
    handle: Handle,
    deadline: TimeValNanos,
    interruptible: bool,
) -> KResult<()> {
    let object = resolve(kr, handle)?;
    acquire_resolved(kr, &object, handle, None, deadline, interruptible)
}

pub fn ksemaphore_acquire_clock(
    kr: KernelRef,
    handle: Handle,
    clock: ClockId,
    deadline: TimeValNanos,
    interruptible: bool,
) -> KResult<()> {
    let object = resolve(kr, handle)?;
    acquire_resolved(kr, &object, handle, Some(clock), deadline, interruptible)
}

pub fn ksemaphore_try_acquire(kr: KernelRef, handle: Handle) -> KResult<()> {
    let object = resolve(kr, handle)?;
    kr.crit(|_| {
        let mut body = object.body.lock();
        let sema = body.as_semaphore()?;
        if sema.count > 0 {
            sema.count -= 1;
            Ok(())
        } else {
            Err(ErrorCode::Busy)
        }
    })
}

/// Adds `n` units and wakes up to `n` waiters in FIFO order.
pub fn ksemaphore_release(kr: KernelRef, handle: Handle, n: u32) -> KResult<()> {
    if n == 0 {
        return Ok(());
    }
    let object = resolve(kr, handle)?;
    kr.crit(|k| {
        let mut body = object.body.lock();
        let sema = body.as_semaphore()?;
        sema.count = sema.count.checked_add(n).ok_or(ErrorCode::InvalidArg)?;
        let need_switch = k.wakeup_wait_queue(&mut sema.wait_queue, n as usize);
        k.fire_listeners(&mut sema.listeners);
        if need_switch {
            k.request_context_switch();
        }
        Ok(())
    })
}

pub fn ksemaphore_get_count(kr: KernelRef, handle: Handle) -> KResult<u32> {
    let object = resolve(kr, handle)?;
    kr.crit(|_| {
        let mut body = object.body.lock();
        Ok(body.as_semaphore()?.count)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::Kernel;
    use crate::thread::spawn_parked;

    fn new_sema(kr: KernelRef, count: u32) -> Handle {
        ksemaphore_create(kr, "s", count, ClockId::MonotonicCoarse).unwrap()
    }

    #[test]
    fn acquire_decrements_release_increments() {
        let mut kern = Kernel::new_for_test();
        let kr = kern.test_ref();
        let s = new_sema(kr, 2);
        ksemaphore_acquire(kr, s, false).unwrap();
        ksemaphore_acquire(kr, s, false).unwrap();
        assert_eq!(ksemaphore_get_count(kr, s), Ok(0));
        assert_eq!(ksemaphore_try_acquire(kr, s), Err(ErrorCode::Busy));
        ksemaphore_release(kr, s, 1).unwrap();
        assert_eq!(ksemaphore_get_count(kr, s), Ok(1));
    }

    #[test]
    fn acquire_blocks_until_release() {
        let mut kern = Kernel::new_for_test();
        let kr = kern.test_ref();
        let peer = spawn_parked(&mut kern, "peer", 0);
        let s = new_sema(kr, 0);
        kr.sim_enqueue(move |kr| {
            kr.run_as(peer, |kr| ksemaphore_release(kr, s, 1).unwrap());
        });
        ksemaphore_acquire(kr, s, false).unwrap();
        assert_eq!(ksemaphore_get_count(kr, s), Ok(0));
    }

    #[test]
    fn over_release_leaves_residual_count() {
        let mut kern = Kernel::new_for_test();
        let kr = kern.test_ref();
        let s = new_sema(kr, 0);
        let waiter = spawn_parked(&mut kern, "w", 0);
        // One simulated waiter parked on the queue.
        kr.crit(|k| {
            let object = k.object(s).unwrap();
            object
                .body
                .lock()
                .as_semaphore()
                .unwrap()
                .wait_queue
                .append(waiter);
        });
        ksemaphore_release(kr, s, 3).unwrap();
        assert_eq!(kern.thread(waiter).unwrap().state, ThreadState::Ready);
        // The waiter has not yet consumed its unit (it would on resume);
        // count holds all three until then, residue 3 - 1 after.
        assert_eq!(ksemaphore_get_count(kr, s), Ok(3));
    }

    #[test]
    fn timed_acquire_times_out() {
        let mut kern = Kernel::new_for_test();
        let kr = kern.test_ref();
        let s = new_sema(kr, 0);
        kr.sim_enqueue(|kr| {
            kr.crit(|k| k.sim_advance_ms(5));
        });
        assert_eq!(
            ksemaphore_acquire_timeout(kr, s, TimeValNanos::from_millis(2), false),
            Err(ErrorCode::Timeout)
        );
    }

    #[test]
    fn zero_timeout_acquire_does_not_block() {
        let mut kern = Kernel::new_for_test();
        let kr = kern.test_ref();
        let s = new_sema(kr, 0);
        assert_eq!(
            ksemaphore_acquire_timeout(kr, s, TimeValNanos::ZERO, false),
            Err(ErrorCode::Timeout)
        );
    }

    #[test]
    fn signal_wake_returns_restart_when_interruptible() {
        let mut kern = Kernel::new_for_test();
        let kr = kern.test_ref();
        let me = kern.current;
        let s = new_sema(kr, 0);
        kr.sim_enqueue(move |kr| {
            kr.crit(|k| {
                k.thread_mut(me).unwrap().set_pending_signal(abi::SIGUSR1);
                k.wakeup_thread(me, false);
            });
        });
        assert_eq!(
            ksemaphore_acquire(kr, s, true),
            Err(ErrorCode::RestartSyscall)
        );
        kr.crit(|k| k.thread_mut(me).unwrap().clear_pending_signal(abi::SIGUSR1));
    }

    #[test]
    fn lost_race_wakeup_parks_again() {
        let mut kern = Kernel::new_for_test();
        let kr = kern.test_ref();
        let me = kern.current;
        let peer = spawn_parked(&mut kern, "peer", 0);
        let s = new_sema(kr, 0);

        // First wake: no signal and no unit available -- the waiter must
        // park again rather than report an interruption.
        kr.sim_enqueue(move |kr| {
            kr.crit(|k| k.wakeup_thread(me, false));
        });
        // Second wake: a real release.
        kr.sim_enqueue(move |kr| {
            kr.run_as(peer, |kr| ksemaphore_release(kr, s, 1).unwrap());
        });
        ksemaphore_acquire(kr, s, true).unwrap();
        assert_eq!(ksemaphore_get_count(kr, s), Ok(0));
    }

    #[test]
    fn release_wakes_fifo() {
        let mut kern = Kernel::new_for_test();
        let kr = kern.test_ref();
        let s = new_sema(kr, 0);
        let first = spawn_parked(&mut kern, "first", 0);
        let second = spawn_parked(&mut kern, "second", 0);
        kr.crit(|k| {
            let object = k.object(s).unwrap();
            let mut body = object.body.lock();
            let sema = body.as_semaphore().unwrap();
            sema.wait_queue.append(first);
            sema.wait_queue.append(second);
        });
        ksemaphore_release(kr, s, 1).unwrap();
        assert_eq!(kern.thread(first).unwrap().state, ThreadState::Ready);
        assert_eq!(kern.thread(second).unwrap().state, ThreadState::Waiting);
    }
}
