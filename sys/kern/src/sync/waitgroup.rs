// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Object wait groups: wait on a heterogeneous set of waitable objects.
//!
//! A group holds `(object, mode)` pairs. `wait` registers a listener with
//! every member -- members that are already ready are recorded immediately --
//! and parks until some member fires, a deadline passes, or a signal
//! arrives. The result is a bitmap with one bit per member slot naming the
//! members that became ready.
//!
//! While a thread is parked in `wait`, the set is frozen: `add`, `remove`
//! and `clear` nudge the waiter awake and park on the blocked-thread
//! condition until the wait unwinds. A finishing wait that sees modifiers
//! queued parks briefly to let them in before the caller can wait again.

use abi::{
    ErrorCode, Handle, HandleType, KResult, ObjectWaitMode, ThreadState,
};
use alloc::sync::Arc;

use crate::kobject::{KObject, Listener};
use crate::sched::KernelRef;
use crate::sync::mutex::{lock_resolved, unlock_inner, LockKind};
use crate::time::TimeValNanos;

/// Hard cap on group members, one bit each in the ready bitmap.
pub const MAX_WAIT_OBJECTS: usize = 64;

fn resolve(kr: KernelRef, handle: Handle) -> KResult<Arc<KObject>> {
    kr.crit(|k| k.object_typed(handle, HandleType::ObjectWaitGroup))
}

pub fn kwaitgroup_create(kr: KernelRef, name: &str) -> KResult<Handle> {
    kr.crit(|k| k.register_object(KObject::new_wait_group(name)))
}

/// Parks the caller until no thread is inside `wait` on this group.
fn wait_for_blocked_thread(kr: KernelRef, group: &Arc<KObject>) -> KResult<()> {
    let tid = kr.crit(|k| k.current);
    loop {
        let parked = kr.crit(|k| -> KResult<bool> {
            let mut body = group.body.lock();
            let g = body.as_wait_group()?;
            let Some(blocked) = g.blocked_thread else {
                return Ok(false);
            };
            // Nudge the waiter so it can unwind and let us in.
            g.pending_mods += 1;
            g.blocked_thread_condition.wait_queue.append(tid);
            k.current_thread_mut().state = ThreadState::Waiting;
            k.wakeup_thread(blocked, false);
            k.request_context_switch();
            Ok(true)
        })?;
        if !parked {
            return Ok(());
        }
        kr.switch_point();
        kr.crit(|k| -> KResult<()> {
            let mut body = group.body.lock();
            let g = body.as_wait_group()?;
            g.pending_mods -= 1;
            g.blocked_thread_condition.wait_queue.remove(tid);
            if k.thread_mut(tid).unwrap().take_target_deleted() {
                return Err(ErrorCode::InvalidArg);
            }
            Ok(())
        })?;
    }
}

pub fn kwaitgroup_add(
    kr: KernelRef,
    handle: Handle,
    object_handle: Handle,
    mode: ObjectWaitMode,
) -> KResult<()> {
    let group = resolve(kr, handle)?;
    let member = kr.crit(|k| k.object(object_handle))?;
    if member.type_tag() == HandleType::ObjectWaitGroup {
        return Err(ErrorCode::InvalidArg);
    }
    wait_for_blocked_thread(kr, &group)?;
    kr.crit(|_| {
        let mut body = group.body.lock();
        let g = body.as_wait_group()?;
        if g.entries.len() >= MAX_WAIT_OBJECTS {
            return Err(ErrorCode::NoMemory);
        }
        g.entries.push((member, mode));
        Ok(())
    })
}

pub fn kwaitgroup_remove(
    kr: KernelRef,
    handle: Handle,
    object_handle: Handle,
    mode: ObjectWaitMode,
) -> KResult<()> {
    let group = resolve(kr, handle)?;
    let member = kr.crit(|k| k.object(object_handle))?;
    wait_for_blocked_thread(kr, &group)?;
    kr.crit(|_| {
        let mut body = group.body.lock();
        let g = body.as_wait_group()?;
        let pos = g
            .entries
            .iter()
            .position(|(o, m)| Arc::ptr_eq(o, &member) && *m == mode)
            .ok_or(ErrorCode::InvalidArg)?;
        g.entries.remove(pos);
        Ok(())
    })
}

pub fn kwaitgroup_clear(kr: KernelRef, handle: Handle) -> KResult<()> {
    let group = resolve(kr, handle)?;
    wait_for_blocked_thread(kr, &group)?;
    kr.crit(|_| {
        let mut body = group.body.lock();
        body.as_wait_group()?.entries.clear();
        Ok(())
    })
}

enum Step {
    /// Some members were ready at registration time.
    Ready(u64),
    TimedOut,
    Parked,
}

/// Waits for any member to become ready. `deadline` is monotonic. With
/// `mutex`, the external mutex is released while parked and re-acquired
/// before returning, condition-variable style. Returns the ready bitmap.
pub fn kwaitgroup_wait_deadline(
    kr: KernelRef,
    handle: Handle,
    mutex_handle: Handle,
    deadline: TimeValNanos,
) -> KResult<u64> {
    let group = resolve(kr, handle)?;
    let mutex = if mutex_handle.is_valid() {
        Some(kr.crit(|k| k.object_typed(mutex_handle, HandleType::Mutex))?)
    } else {
        None
    };
    let tid = kr.crit(|k| k.current);

    wait_for_blocked_thread(kr, &group)?;

    let step = kr.crit(|k| -> KResult<Step> {
        let mut body = group.body.lock();
        let g = body.as_wait_group()?;
        k.thread_mut(tid).unwrap().wg_fired = 0;

        let mut ready: u64 = 0;
        for (slot, (member, mode)) in g.entries.iter().enumerate() {
            let listener = Listener {
                thread: tid,
                slot: slot as u32,
            };
            if member.body.lock().add_listener(listener, *mode)? {
                ready |= 1 << slot;
            }
        }
        if ready != 0 {
            for (member, _) in &g.entries {
                member.body.lock().remove_listeners_for(tid);
            }
            return Ok(Step::Ready(ready));
        }
        if !(deadline.is_infinite() || k.monotonic_time() < deadline) {
            for (member, _) in &g.entries {
                member.body.lock().remove_listeners_for(tid);
            }
            return Ok(Step::TimedOut);
        }

        // Release the external mutex before parking; if it turns out not to
        // be locked, unwind the listener registrations and bail with the
        // caller still runnable.
        if let Some(mutex) = &mutex {
            let mut mutex_body = mutex.body.lock();
            let unlocked = mutex_body.as_mutex().and_then(|m| unlock_inner(k, m));
            if let Err(code) = unlocked {
                for (member, _) in &g.entries {
                    member.body.lock().remove_listeners_for(tid);
                }
                return Err(code);
            }
        }
        g.blocked_thread = Some(tid);
        let thread = k.thread_mut(tid).unwrap();
        thread.blocking_object = handle;
        if deadline.is_infinite() {
            thread.state = ThreadState::Waiting;
        } else {
            thread.state = ThreadState::Sleeping;
            k.sleep.add(tid, deadline);
        }
        k.request_context_switch();
        Ok(Step::Parked)
    })?;

    match step {
        Step::Ready(mask) => return Ok(mask),
        Step::TimedOut => return Err(ErrorCode::Timeout),
        Step::Parked => {}
    }

    kr.switch_point();

    if let Some(mutex) = &mutex {
        lock_resolved(
            kr,
            mutex,
            mutex_handle,
            LockKind::Exclusive,
            Some(abi::ClockId::MonotonicCoarse),
            TimeValNanos::INFINITE,
            false,
        )?;
    }

    let (timed_out, fired, mods_pending) = kr.crit(|k| -> KResult<(bool, u64, bool)> {
        let mut body = group.body.lock();
        let g = body.as_wait_group()?;
        g.blocked_thread = None;
        let need_switch =
            k.wakeup_wait_queue(&mut g.blocked_thread_condition.wait_queue, 0);
        let timed_out = !k.sleep.remove(tid) && !deadline.is_infinite();
        for (member, _) in &g.entries {
            member.body.lock().remove_listeners_for(tid);
        }
        let thread = k.thread_mut(tid).unwrap();
        thread.blocking_object = Handle::INVALID;
        let fired = core::mem::replace(&mut thread.wg_fired, 0);
        // Waiting on group members that get deleted mid-wait would mean the
        // entry table's strong references failed us.
        uassert!(!thread.take_target_deleted());
        if need_switch {
            k.request_context_switch();
        }
        Ok((timed_out, fired, g.pending_mods != 0))
    })?;

    if !timed_out && mods_pending {
        // Give threads trying to modify the set a chance before the caller
        // loops straight back into wait.
        crate::thread::kyield(kr);
    }

    if fired == 0 {
        return Err(if timed_out {
            ErrorCode::Timeout
        } else {
            ErrorCode::Interrupted
        });
    }
    Ok(fired)
}

pub fn kwaitgroup_wait(kr: KernelRef, handle: Handle, mutex_handle: Handle) -> KResult<u64> {
    kwaitgroup_wait_deadline(kr, handle, mutex_handle, TimeValNanos::INFINITE)
}

pub fn kwaitgroup_wait_timeout(
    kr: KernelRef,
    handle: Handle,
    mutex_handle: Handle,
    timeout: TimeValNanos,
) -> KResult<u64> {
    let deadline = kr.crit(|k| k.timeout_to_deadline(timeout));
    kwaitgroup_wait_deadline(kr, handle, mutex_handle, deadline)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::Kernel;
    use crate::sync::port::{kport_create, kport_receive, kport_send};
    use crate::sync::sema::{ksemaphore_create, ksemaphore_release};
    use crate::thread::spawn_parked;
    use abi::ClockId;

    #[test]
    fn ready_member_completes_without_blocking() {
        let mut kern = Kernel::new_for_test();
        let kr = kern.test_ref();
        let g = kwaitgroup_create(kr, "g").unwrap();
        let p = kport_create(kr, "p", 2).unwrap();
        kwaitgroup_add(kr, g, p, ObjectWaitMode::Read).unwrap();
        // Empty port: not read-ready, so a zero timeout reports Timeout.
        assert_eq!(
            kwaitgroup_wait_timeout(kr, g, Handle::INVALID, TimeValNanos::ZERO),
            Err(ErrorCode::Timeout)
        );
        kport_send(kr, p, 0, 0, b"m", false).unwrap();
        assert_eq!(
            kwaitgroup_wait_timeout(kr, g, Handle::INVALID, TimeValNanos::ZERO),
            Ok(1)
        );
    }

    #[test]
    fn fired_member_sets_only_its_bit() {
        let mut kern = Kernel::new_for_test();
        let kr = kern.test_ref();
        let sender = spawn_parked(&mut kern, "tx", 0);
        let g = kwaitgroup_create(kr, "g").unwrap();
        let p1 = kport_create(kr, "p1", 2).unwrap();
        let p2 = kport_create(kr, "p2", 2).unwrap();
        kwaitgroup_add(kr, g, p1, ObjectWaitMode::Read).unwrap();
        kwaitgroup_add(kr, g, p2, ObjectWaitMode::Read).unwrap();

        kr.sim_enqueue(move |kr| {
            kr.run_as(sender, |kr| {
                kport_send(kr, p2, 0, 0, b"m", false).unwrap();
            });
        });
        let mask = kwaitgroup_wait_timeout(
            kr,
            g,
            Handle::INVALID,
            TimeValNanos::from_millis(500),
        )
        .unwrap();
        assert_eq!(mask, 0b10);
    }

    #[test]
    fn wait_times_out_with_no_bits() {
        let mut kern = Kernel::new_for_test();
        let kr = kern.test_ref();
        let g = kwaitgroup_create(kr, "g").unwrap();
        let p = kport_create(kr, "p", 2).unwrap();
        kwaitgroup_add(kr, g, p, ObjectWaitMode::Read).unwrap();
        kr.sim_enqueue(|kr| {
            kr.crit(|k| k.sim_advance_ms(20));
        });
        assert_eq!(
            kwaitgroup_wait_timeout(kr, g, Handle::INVALID, TimeValNanos::from_millis(5)),
            Err(ErrorCode::Timeout)
        );
    }

    #[test]
    fn signal_wake_reports_interrupted() {
        let mut kern = Kernel::new_for_test();
        let kr = kern.test_ref();
        let me = kern.current;
        let g = kwaitgroup_create(kr, "g").unwrap();
        let p = kport_create(kr, "p", 2).unwrap();
        kwaitgroup_add(kr, g, p, ObjectWaitMode::Read).unwrap();
        kr.sim_enqueue(move |kr| {
            kr.crit(|k| k.wakeup_thread(me, false));
        });
        assert_eq!(
            kwaitgroup_wait(kr, g, Handle::INVALID),
            Err(ErrorCode::Interrupted)
        );
    }

    #[test]
    fn write_mode_fires_when_port_drains() {
        let mut kern = Kernel::new_for_test();
        let kr = kern.test_ref();
        let receiver = spawn_parked(&mut kern, "rx", 0);
        let g = kwaitgroup_create(kr, "g").unwrap();
        let p = kport_create(kr, "p", 1).unwrap();
        kport_send(kr, p, 0, 0, b"full", false).unwrap();
        kwaitgroup_add(kr, g, p, ObjectWaitMode::Write).unwrap();

        kr.sim_enqueue(move |kr| {
            kr.run_as(receiver, |kr| {
                let mut buf = [0u8; 8];
                kport_receive(kr, p, &mut buf, false).unwrap();
            });
        });
        assert_eq!(
            kwaitgroup_wait_timeout(kr, g, Handle::INVALID, TimeValNanos::from_millis(100)),
            Ok(1)
        );
    }

    #[test]
    fn semaphore_release_fires_read_listener() {
        let mut kern = Kernel::new_for_test();
        let kr = kern.test_ref();
        let peer = spawn_parked(&mut kern, "peer", 0);
        let g = kwaitgroup_create(kr, "g").unwrap();
        let s = ksemaphore_create(kr, "s", 0, ClockId::MonotonicCoarse).unwrap();
        kwaitgroup_add(kr, g, s, ObjectWaitMode::Read).unwrap();
        kr.sim_enqueue(move |kr| {
            kr.run_as(peer, |kr| ksemaphore_release(kr, s, 1).unwrap());
        });
        assert_eq!(kwaitgroup_wait(kr, g, Handle::INVALID), Ok(1));
    }

    #[test]
    fn modification_waits_for_parked_waiter() {
        let mut kern = Kernel::new_for_test();
        let kr = kern.test_ref();
        let waiter = spawn_parked(&mut kern, "w", 0);
        let g = kwaitgroup_create(kr, "g").unwrap();
        let p1 = kport_create(kr, "p1", 2).unwrap();
        let p2 = kport_create(kr, "p2", 2).unwrap();
        kwaitgroup_add(kr, g, p1, ObjectWaitMode::Read).unwrap();

        // Stage the group as if `waiter` were parked inside wait().
        kr.crit(|k| {
            let object = k.object(g).unwrap();
            object.body.lock().as_wait_group().unwrap().blocked_thread = Some(waiter);
        });

        // The add must nudge the waiter and park until the group is free;
        // this event plays the waiter unwinding its wait.
        kr.sim_enqueue(move |kr| {
            kr.crit(|k| {
                // The gate woke the waiter so it could finish up.
                assert_eq!(k.thread(waiter).unwrap().state, ThreadState::Ready);
                let object = k.object(g).unwrap();
                let mut body = object.body.lock();
                let group = body.as_wait_group().unwrap();
                group.blocked_thread = None;
                let mut queue = core::mem::take(
                    &mut group.blocked_thread_condition.wait_queue,
                );
                k.wakeup_wait_queue(&mut queue, 0);
            });
        });
        kwaitgroup_add(kr, g, p2, ObjectWaitMode::Read).unwrap();
        let object = kern.object(g).unwrap();
        assert_eq!(object.body.lock().as_wait_group().unwrap().entries.len(), 2);
    }

    #[test]
    fn nested_wait_groups_are_rejected() {
        let mut kern = Kernel::new_for_test();
        let kr = kern.test_ref();
        let outer = kwaitgroup_create(kr, "outer").unwrap();
        let inner = kwaitgroup_create(kr, "inner").unwrap();
        assert_eq!(
            kwaitgroup_add(kr, outer, inner, ObjectWaitMode::Read),
            Err(ErrorCode::InvalidArg)
        );
    }

    #[test]
    fn remove_requires_matching_mode() {
        let mut kern = Kernel::new_for_test();
        let kr = kern.test_ref();
        let g = kwaitgroup_create(kr, "g").unwrap();
        let p = kport_create(kr, "p", 2).unwrap();
        kwaitgroup_add(kr, g, p, ObjectWaitMode::Read).unwrap();
        assert_eq!(
            kwaitgroup_remove(kr, g, p, ObjectWaitMode::Write),
            Err(ErrorCode::InvalidArg)
        );
        kwaitgroup_remove(kr, g, p, ObjectWaitMode::Read).unwrap();
        kwaitgroup_clear(kr, g).unwrap();
    }
}
