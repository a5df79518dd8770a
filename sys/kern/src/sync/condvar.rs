// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Condition variables.
//!
//! A wait atomically parks the caller and releases the external mutex, both
//! inside one kernel critical section; the mutex is re-acquired before the
//! wait returns, on every return path. A resumed waiter that is no longer on
//! the queue was deliberately woken (Success); one still on the queue woke
//! for some other reason -- deadline, signal, or nothing at all -- and
//! either reports it or parks again.
//!
//! The `IRQWait` forms serve drivers that call from interrupt-disabled
//! regions: they take no mutex, and they open an interrupt window around the
//! context switch so the switch can actually happen, restoring the previous
//! interrupt state on return.

use abi::{ClockId, ErrorCode, Handle, HandleType, KResult, ThreadState};
use alloc::sync::Arc;

use crate::kobject::KObject;
use crate::sched::KernelRef;
use crate::sync::mutex::{lock_resolved, unlock_inner, LockKind};
use crate::time::TimeValNanos;

enum Step {
    Parked,
    TimedOut,
}

enum Outcome {
    Woken,
    TargetDeleted,
    Interrupted,
    Spurious,
}

/// The shared wait loop. `deadline` is already monotonic; `irq_mode` selects
/// the interrupt-window switch.
fn wait_common(
    kr: KernelRef,
    condvar: &Arc<KObject>,
    cv_handle: Handle,
    mutex: Option<(&Arc<KObject>, Handle)>,
    deadline: TimeValNanos,
    irq_mode: bool,
) -> KResult<()> {
    if let Some((mutex_obj, _)) = mutex {
        if Arc::ptr_eq(condvar, mutex_obj) {
            return Err(ErrorCode::InvalidArg);
        }
    }
    let tid = kr.crit(|k| k.current);

    loop {
        let step = kr.crit(|k| -> KResult<Step> {
            let mut body = condvar.body.lock();
            let cv = body.as_condvar()?;
            if !(deadline.is_infinite() || k.monotonic_time() < deadline) {
                return Ok(Step::TimedOut);
            }
            // Release the external mutex before parking, still inside the
            // same critical section; a bogus mutex bails out with the
            // caller not yet on any queue.
            if let Some((mutex_obj, _)) = mutex {
                let mut mutex_body = mutex_obj.body.lock();
                unlock_inner(k, mutex_body.as_mutex()?)?;
            }
            cv.wait_queue.append(tid);
            let thread = k.thread_mut(tid).unwrap();
            thread.blocking_object = cv_handle;
            if deadline.is_infinite() {
                thread.state = ThreadState::Waiting;
            } else {
                thread.state = ThreadState::Sleeping;
                k.sleep.add(tid, deadline);
            }
            k.request_context_switch();
            Ok(Step::Parked)
        })?;

        if let Step::TimedOut = step {
            // The mutex is held on this path: either we never released it
            // (first iteration) or we re-acquired it below.
            return Err(ErrorCode::Timeout);
        }

        switch_for_wait(kr, irq_mode);

        if let Some((mutex_obj, mutex_handle)) = mutex {
            lock_resolved(
                kr,
                mutex_obj,
                mutex_handle,
                LockKind::Exclusive,
                Some(ClockId::MonotonicCoarse),
                TimeValNanos::INFINITE,
                false,
            )?;
        }

        let outcome = kr.crit(|k| -> KResult<Outcome> {
            let mut body = condvar.body.lock();
            let cv = body.as_condvar()?;
            k.sleep.remove(tid);
            let still_queued = cv.wait_queue.remove(tid);
            let thread = k.thread_mut(tid).unwrap();
            thread.blocking_object = Handle::INVALID;
            if thread.take_target_deleted() {
                return Ok(Outcome::TargetDeleted);
            }
            if !still_queued {
                return Ok(Outcome::Woken);
            }
            if thread.has_unblocked_pending_signals() {
                return Ok(Outcome::Interrupted);
            }
            Ok(Outcome::Spurious)
        })?;

        match outcome {
            Outcome::Woken => return Ok(()),
            Outcome::TargetDeleted => return Err(ErrorCode::InvalidArg),
            Outcome::Interrupted => return Err(ErrorCode::Interrupted),
            Outcome::Spurious => {}
        }
    }
}

/// In IRQ mode the caller sits in an interrupt-disabled region, so the
/// pended switch can only fire inside an explicitly opened window.
#[cfg(target_arch = "arm")]
fn switch_for_wait(kr: KernelRef, irq_mode: bool) {
    if irq_mode {
        crate::arch::irq_context_switch_window();
    } else {
        kr.switch_point();
    }
}

#[cfg(not(target_arch = "arm"))]
fn switch_for_wait(kr: KernelRef, _irq_mode: bool) {
    kr.switch_point();
}

fn resolve(kr: KernelRef, handle: Handle) -> KResult<Arc<KObject>> {
    kr.crit(|k| k.object_typed(handle, HandleType::ConditionVariable))
}

fn resolve_mutex(kr: KernelRef, handle: Handle) -> KResult<Arc<KObject>> {
    kr.crit(|k| k.object_typed(handle, HandleType::Mutex))
}

pub fn kcondvar_create(kr: KernelRef, name: &str, clock_id: ClockId) -> KResult<Handle> {
    kr.crit(|k| k.register_object(KObject::new_condvar(name, clock_id)))
}

/// Untimed wait. `mutex_handle` names the externally held mutex.
pub fn kcondvar_wait(kr: KernelRef, handle: Handle, mutex_handle: Handle) -> KResult<()> {
    let condvar = resolve(kr, handle)?;
    let mutex = resolve_mutex(kr, mutex_handle)?;
    wait_common(
        kr,
        &condvar,
        handle,
        Some((&mutex, mutex_handle)),
        TimeValNanos::INFINITE,
        false,
    )
}

pub fn kcondvar_wait_timeout(
    kr: KernelRef,
    handle: Handle,
    mutex_handle: Handle,
    timeout: TimeValNanos,
) -> KResult<()> {
    let condvar = resolve(kr, handle)?;
    let mutex = resolve_mutex(kr, mutex_handle)?;
    let deadline = kr.crit(|k| k.timeout_to_deadline(timeout));
    wait_common(
        kr,
        &condvar,
        handle,
        Some((&mutex, mutex_handle)),
        deadline,
        false,
    )
}

/// Deadline wait on the condition variable's own clock.
pub fn kcondvar_wait_deadline(
    kr: KernelRef,
    handle: Handle,
    mutex_handle: Handle,
    deadline: TimeValNanos,
) -> KResult<()> {
    let condvar = resolve(kr, handle)?;
    let clock = kr.crit(|k| {
        let mut body = condvar.body.lock();
        body.as_condvar().map(|c| c.clock_id)
    })?;
    kcondvar_wait_clock(kr, handle, mutex_handle, clock, deadline)
}

pub fn kcondvar_wait_clock(
    kr: KernelRef,
    handle: Handle,
    mutex_handle: Handle,
    clock: ClockId,
    clock_deadline: TimeValNanos,
) -> KResult<()> {
    let condvar = resolve(kr, handle)?;
    let mutex = resolve_mutex(kr, mutex_handle)?;
    let deadline = kr.crit(|k| k.convert_clock_to_monotonic(clock, clock_deadline))?;
    wait_common(
        kr,
        &condvar,
        handle,
        Some((&mutex, mutex_handle)),
        deadline,
        false,
    )
}

/// Wait form for code running with interrupts disabled; no mutex involved.
pub fn kcondvar_irq_wait(kr: KernelRef, handle: Handle) -> KResult<()> {
    let condvar = resolve(kr, handle)?;
    wait_common(kr, &condvar, handle, None, TimeValNanos::INFINITE, true)
}

pub fn kcondvar_irq_wait_timeout(
    kr: KernelRef,
    handle: Handle,
    timeout: TimeValNanos,
) -> KResult<()> {
    let condvar = resolve(kr, handle)?;
    let deadline = kr.crit(|k| k.timeout_to_deadline(timeout));
    wait_common(kr, &condvar, handle, None, deadline, true)
}

pub fn kcondvar_irq_wait_clock(
    kr: KernelRef,
    handle: Handle,
    clock: ClockId,
    clock_deadline: TimeValNanos,
) -> KResult<()> {
    let condvar = resolve(kr, handle)?;
    let deadline = kr.crit(|k| k.convert_clock_to_monotonic(clock, clock_deadline))?;
    wait_common(kr, &condvar, handle, None, deadline, true)
}

/// Wakes up to `count` waiters (0 = all) and fires any wait-group listeners
/// observing this condition.
pub fn kcondvar_wakeup(kr: KernelRef, handle: Handle, count: usize) -> KResult<()> {
    let condvar = resolve(kr, handle)?;
    kr.crit(|k| {
        let mut body = condvar.body.lock();
        let cv = body.as_condvar()?;
        let need_switch = k.wakeup_wait_queue(&mut cv.wait_queue, count);
        k.fire_listeners(&mut cv.listeners);
        if need_switch {
            k.request_context_switch();
        }
        Ok(())
    })
}
