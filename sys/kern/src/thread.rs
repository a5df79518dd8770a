// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Thread control blocks and the thread lifecycle.
//!
//! Threads are owned by value in the kernel's thread table and named by
//! handle. Lifecycle: spawned Ready, runs, blocks in any of the primitives,
//! and ends as a Zombie -- reaped by the init thread if detached, or by the
//! joiner if joinable. A Deleted state marks a control block whose handle is
//! about to be (or has been) freed, so stale handles resolve to nothing.

use abi::{
    ErrorCode, Handle, KResult, SigAction, SigSet, ThreadAttribs,
    ThreadDetachState, ThreadId, ThreadInfo, ThreadState, NAME_LENGTH, NSIG,
    PRIORITY_LEVELS, THREAD_PRIORITY_MAX, THREAD_PRIORITY_MIN,
};
use alloc::boxed::Box;
use alloc::vec;
use alloc::vec::Vec;

use crate::list::WaitQueue;
#[cfg(not(target_arch = "arm"))]
use crate::sched::Kernel;
use crate::sched::KernelRef;
use crate::signal::SignalNode;
use crate::time::TimeValNanos;

/// Maps a thread priority to a ready-queue level. Level 0 is the most
/// urgent, so the scheduler's "pick the lowest non-empty level" rule gives
/// strict highest-priority-first.
pub fn priority_level(priority: i32) -> usize {
    let clamped = priority.clamp(THREAD_PRIORITY_MIN, THREAD_PRIORITY_MAX);
    (THREAD_PRIORITY_MAX - clamped) as usize
}

static_assertions::const_assert_eq!(
    (THREAD_PRIORITY_MAX - THREAD_PRIORITY_MIN + 1) as usize,
    PRIORITY_LEVELS
);

/// The register arguments and handler address of an in-flight syscall. The
/// restart path in the return trampoline reloads all five words with a
/// single `ldm`, so the layout is fixed.
#[derive(Copy, Clone, Debug, Default)]
#[repr(C)]
pub struct SyscallReplay {
    pub args: [u32; 4],
    pub handler: u32,
}

/// A thread control block.
pub struct Thread {
    name: heapless::String<NAME_LENGTH>,
    pub state: ThreadState,
    pub priority: i32,
    /// Scheduling priority after temporary adjustments. Currently tracks
    /// `priority`; kept separate so boosts don't lose the nominal value.
    pub dynamic_priority: i32,
    pub detach_state: ThreadDetachState,
    /// Handle of the object this thread is blocked on, for the debug
    /// surface.
    pub blocking_object: Handle,
    pub run_time: TimeValNanos,
    pub return_value: usize,

    /// Set when an object this thread was waiting on got destroyed; the
    /// resuming primitive consumes it and reports `InvalidArg`.
    pub wait_target_deleted: bool,
    /// Wait-group slots that fired while this thread was parked in a group
    /// wait.
    pub wg_fired: u64,

    pub pending_signals: SigSet,
    pub blocked_signals: SigSet,
    /// Queued realtime (and coalesced classic) signals, sorted by signal
    /// number, FIFO within a number.
    pub queued_signals: Vec<Box<SignalNode>>,
    pub signal_handlers: [SigAction; NSIG],
    /// Mask to restore when a `sigsuspend` wait ends.
    pub sigsuspend_saved_mask: Option<SigSet>,
    /// Whether the most recently delivered handler had `SA_RESTART`; the
    /// syscall trampoline reads this to decide between retry and
    /// `Interrupted`.
    pub restart_wanted: bool,

    /// Saved stack pointer with the privilege mode in bit 0.
    pub saved_sp: u32,
    /// Return address (with privilege bit) for the in-flight syscall.
    pub syscall_return: u32,
    /// Register arguments and handler address of the in-flight syscall,
    /// kept so the trampoline can replay the call after a signal-driven
    /// restart.
    pub syscall_replay: SyscallReplay,
    stack: Option<Box<[u64]>>,
    pub stack_size: usize,
    /// Opaque user-space TLS block pointer.
    pub tls: usize,

    /// Threads blocked in `join` on this thread.
    pub join_queue: WaitQueue,
}

impl Thread {
    pub fn new(
        name: &str,
        priority: i32,
        detach_state: ThreadDetachState,
        stack_size: usize,
    ) -> Self {
        let mut buf = heapless::String::new();
        for c in name.chars().take(NAME_LENGTH) {
            if buf.push(c).is_err() {
                break;
            }
        }
        let words = stack_size.div_ceil(8).max(8);
        let stack = vec![0u64; words].into_boxed_slice();
        let top = stack.as_ptr() as usize + words * 8;
        Self {
            name: buf,
            state: ThreadState::Ready,
            priority,
            dynamic_priority: priority,
            detach_state,
            blocking_object: Handle::INVALID,
            run_time: TimeValNanos::ZERO,
            return_value: 0,
            wait_target_deleted: false,
            wg_fired: 0,
            pending_signals: SigSet::EMPTY,
            blocked_signals: SigSet::EMPTY,
            queued_signals: Vec::new(),
            signal_handlers: [SigAction::default(); NSIG],
            sigsuspend_saved_mask: None,
            restart_wanted: false,
            saved_sp: top as u32,
            syscall_return: 0,
            syscall_replay: SyscallReplay::default(),
            stack: Some(stack),
            stack_size: words * 8,
            tls: 0,
            join_queue: WaitQueue::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stack_top(&self) -> usize {
        self.stack
            .as_ref()
            .map(|s| s.as_ptr() as usize + s.len() * 8)
            .unwrap_or(0)
    }

    pub fn stack_base(&self) -> usize {
        self.stack.as_ref().map(|s| s.as_ptr() as usize).unwrap_or(0)
    }

    pub fn set_pending_signal(&mut self, signum: i32) {
        self.pending_signals.insert(signum);
    }

    pub fn clear_pending_signal(&mut self, signum: i32) {
        self.pending_signals.remove(signum);
    }

    pub fn is_signal_blocked(&self, signum: i32) -> bool {
        self.blocked_signals.contains(signum)
    }

    pub fn unblocked_pending_signals(&self) -> SigSet {
        self.pending_signals & !self.blocked_signals
    }

    pub fn has_unblocked_pending_signals(&self) -> bool {
        !self.unblocked_pending_signals().is_empty()
    }

    /// Consumes the target-deleted flag left by a destroyed blocking object.
    pub fn take_target_deleted(&mut self) -> bool {
        core::mem::replace(&mut self.wait_target_deleted, false)
    }
}

/// Spawns a new thread. The thread is placed on the ready list immediately;
/// if it is more urgent than the caller, a context switch is requested.
pub fn kthread_spawn(
    kr: KernelRef,
    attribs: &ThreadAttribs,
    privileged: bool,
    entry: usize,
    argument: usize,
) -> KResult<ThreadId> {
    let name_len = attribs
        .name
        .iter()
        .position(|&b| b == 0)
        .unwrap_or(NAME_LENGTH);
    let name = core::str::from_utf8(&attribs.name[..name_len])
        .map_err(|_| ErrorCode::InvalidArg)?;
    if attribs.stack_size < 256 {
        return Err(ErrorCode::InvalidArg);
    }

    let mut thread = Thread::new(
        name,
        attribs.priority,
        attribs.detach_state,
        attribs.stack_size,
    );
    crate::arch::initialize_thread_stack(&mut thread, entry, argument, privileged);

    kr.crit(|k| {
        let id = k.threads.insert(thread)?;
        // insert() leaves the thread Ready but not queued; queue it.
        k.thread_mut(id).unwrap().state = ThreadState::Waiting;
        if k.make_ready(id) {
            k.request_context_switch();
        }
        Ok(id)
    })
}

/// Terminates the calling thread. Joiners are woken; a detached thread goes
/// straight onto the zombie list for the init thread to reap.
///
/// On hardware this never returns; the simulated version returns to the test
/// harness after the bookkeeping is done.
pub fn kthread_exit(kr: KernelRef, return_value: usize) {
    kr.crit(|k| {
        let current = k.current;
        let thread = k.current_thread_mut();
        thread.state = ThreadState::Zombie;
        thread.return_value = return_value;
        let mut joiners = core::mem::take(&mut thread.join_queue);
        // Joiners re-park on the queue themselves if they find the thread
        // not yet reaped; the queue object can be dropped empty.
        let _ = k.wakeup_wait_queue(&mut joiners, 0);
        if k.thread(current).unwrap().detach_state == ThreadDetachState::Detached {
            k.add_zombie(current);
        }
        k.request_context_switch();
    });
    kr.switch_point();
}

/// Flips a joinable thread to detached. If it has already exited, it is
/// handed to the reaper on the spot.
pub fn kthread_detach(kr: KernelRef, handle: ThreadId) -> KResult<()> {
    kr.crit(|k| {
        let thread = k.thread_mut(handle).ok_or(ErrorCode::InvalidArg)?;
        if thread.detach_state != ThreadDetachState::Joinable
            || thread.state == ThreadState::Deleted
        {
            return Err(ErrorCode::InvalidArg);
        }
        thread.detach_state = ThreadDetachState::Detached;
        if thread.state == ThreadState::Zombie {
            k.add_zombie(handle);
        }
        Ok(())
    })
}

/// Waits for `handle` to exit and returns its return value. The caller
/// frees the thread's handle; a second joiner finds the handle gone and gets
/// `InvalidArg`.
pub fn kthread_join(kr: KernelRef, handle: ThreadId) -> KResult<usize> {
    let caller = kr.crit(|k| k.current);
    if handle == caller {
        return Err(ErrorCode::Deadlock);
    }
    loop {
        let parked = kr.crit(|k| {
            let child = k.thread(handle).ok_or(ErrorCode::InvalidArg)?;
            if child.detach_state != ThreadDetachState::Joinable {
                return Err(ErrorCode::InvalidArg);
            }
            match child.state {
                ThreadState::Deleted => Err(ErrorCode::InvalidArg),
                ThreadState::Zombie => Ok(false),
                _ => {
                    k.current_thread_mut().state = ThreadState::Waiting;
                    k.thread_mut(handle).unwrap().join_queue.append(caller);
                    k.request_context_switch();
                    Ok(true)
                }
            }
        })?;

        if parked {
            kr.switch_point();
        }

        let result = kr.crit(|k| {
            if let Some(child) = k.thread_mut(handle) {
                child.join_queue.remove(caller);
            }
            match k.thread(handle).map(|t| t.state) {
                None | Some(ThreadState::Deleted) => Some(Err(ErrorCode::InvalidArg)),
                Some(ThreadState::Zombie) => {
                    let value = k.thread(handle).unwrap().return_value;
                    k.thread_mut(handle).unwrap().state = ThreadState::Deleted;
                    k.threads.free(handle);
                    Some(Ok(value))
                }
                _ => {
                    // Woken without the child exiting: a signal. Let the
                    // syscall return path deal with it.
                    if k.current_thread().has_unblocked_pending_signals() {
                        Some(Err(ErrorCode::RestartSyscall))
                    } else {
                        None
                    }
                }
            }
        });
        if let Some(result) = result {
            return result;
        }
    }
}

pub fn kthread_set_priority(kr: KernelRef, handle: ThreadId, priority: i32) -> KResult<()> {
    kr.crit(|k| {
        let current = k.current;
        let thread = k.thread_mut(handle).ok_or(ErrorCode::InvalidArg)?;
        if thread.state == ThreadState::Deleted {
            return Err(ErrorCode::InvalidArg);
        }
        let previous_level = priority_level(thread.priority);
        thread.priority = priority;
        thread.dynamic_priority = priority;
        if handle != current && priority_level(priority) < previous_level {
            k.request_context_switch();
        }
        Ok(())
    })
}

pub fn kthread_get_priority(kr: KernelRef, handle: ThreadId) -> KResult<i32> {
    kr.crit(|k| {
        let thread = k.thread(handle).ok_or(ErrorCode::InvalidArg)?;
        if thread.state == ThreadState::Deleted {
            return Err(ErrorCode::InvalidArg);
        }
        Ok(thread.priority)
    })
}

fn fill_thread_info(id: ThreadId, thread: &Thread) -> ThreadInfo {
    let mut name = [0u8; NAME_LENGTH];
    let bytes = thread.name().as_bytes();
    name[..bytes.len()].copy_from_slice(bytes);
    ThreadInfo {
        thread_id: id,
        name,
        state: thread.state,
        priority: thread.priority,
        dynamic_priority: thread.dynamic_priority,
        blocking_object: thread.blocking_object,
        run_time_nanos: thread.run_time.as_nanos(),
        quantum_nanos: crate::time::TICK_PERIOD_NANOS,
        stack_size: thread.stack_size,
    }
}

/// Reports on one thread, or on the first live thread when `handle` is
/// invalid.
pub fn kget_thread_info(kr: KernelRef, handle: ThreadId) -> KResult<ThreadInfo> {
    kr.crit(|k| {
        if handle.is_valid() {
            let thread = k.thread(handle).ok_or(ErrorCode::InvalidArg)?;
            Ok(fill_thread_info(handle, thread))
        } else {
            let (id, thread) = k
                .threads
                .get_next(Handle::INVALID, |t| t.state != ThreadState::Deleted)
                .ok_or(ErrorCode::NoEntry)?;
            Ok(fill_thread_info(id, thread))
        }
    })
}

/// Continues a thread-table walk from the thread named in `previous`.
pub fn kget_next_thread_info(kr: KernelRef, previous: ThreadId) -> KResult<ThreadInfo> {
    kr.crit(|k| {
        let (id, thread) = k
            .threads
            .get_next(previous, |t| t.state != ThreadState::Deleted)
            .ok_or(ErrorCode::NoEntry)?;
        Ok(fill_thread_info(id, thread))
    })
}

/// Sleeps until the monotonic clock passes `resume_time`. The deadline is
/// rounded up by one tick so a sleep never ends early. A wake before the
/// deadline (a signal) reports `Interrupted`.
pub fn ksnooze_until(kr: KernelRef, resume_time: TimeValNanos) -> KResult<()> {
    let resume_time =
        resume_time + TimeValNanos::from_nanos(crate::time::TICK_PERIOD_NANOS);
    kr.crit(|k| {
        let current = k.current;
        k.current_thread_mut().state = ThreadState::Sleeping;
        k.sleep.add(current, resume_time);
        k.request_context_switch();
    });
    kr.switch_point();
    kr.crit(|k| {
        let current = k.current;
        k.sleep.remove(current);
        if k.monotonic_time() >= resume_time {
            Ok(())
        } else {
            Err(ErrorCode::Interrupted)
        }
    })
}

pub fn ksnooze(kr: KernelRef, delay: TimeValNanos) -> KResult<()> {
    let resume = kr.crit(|k| k.monotonic_time() + delay);
    ksnooze_until(kr, resume)
}

/// Gives up the CPU to any equally urgent ready thread.
pub fn kyield(kr: KernelRef) {
    kr.crit(|k| k.request_context_switch());
    kr.switch_point();
}

/// One pass of the zombie reaper: detaches the zombie list and frees each
/// entry. Runs on the init thread.
pub fn reap_zombies(kr: KernelRef) {
    loop {
        let batch = kr.crit(|k| k.take_zombies());
        if batch.is_empty() {
            return;
        }
        for zombie in batch {
            kr.crit(|k| {
                if let Some(thread) = k.thread_mut(zombie) {
                    thread.state = ThreadState::Deleted;
                }
                k.threads.free(zombie);
            });
        }
    }
}

/// The init thread's steady-state loop body: reap, then park until the next
/// zombie shows up.
pub fn reaper_wait(kr: KernelRef) {
    reap_zombies(kr);
    kr.crit(|k| {
        if !k.has_zombies() {
            k.park_reaper();
        }
    });
    kr.switch_point();
}

/// Test helper: creates a thread that never executes code, parked in
/// `Waiting` off every queue, to stand in for a peer thread.
#[cfg(not(target_arch = "arm"))]
pub fn spawn_parked(kernel: &mut Kernel, name: &str, priority: i32) -> ThreadId {
    let mut thread = Thread::new(name, priority, ThreadDetachState::Joinable, 512);
    thread.state = ThreadState::Waiting;
    kernel.threads.insert(thread).expect("test thread allocation")
}
