// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Named kernel objects.
//!
//! Every object a handle can name -- mutex, condition variable, semaphore,
//! message port, object wait group -- is a [`KObject`]: a name, a type tag,
//! and a body behind a spin lock. The registry stores `Arc<KObject>`, so a
//! syscall that has resolved a handle keeps the object alive even if another
//! thread frees the handle mid-wait; the freed object's waiters are woken
//! with their `target_deleted` flag set and report `InvalidArg`.
//!
//! The body lock is only ever taken from kernel critical sections on a
//! single CPU, so it is never contended; it exists to give the `Arc`'d body
//! interior mutability with a Sync type, which is how the kernels in this
//! family do it.

use abi::{
    ClockId, ErrorCode, Handle, HandleType, KResult, MutexRecursionMode,
    ObjectWaitMode, ThreadId, NAME_LENGTH,
};
use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::list::WaitQueue;

/// A wait-group registration on some waitable object: when the object
/// becomes ready it sets bit `slot` in `thread`'s fired set and wakes it.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Listener {
    pub thread: ThreadId,
    pub slot: u32,
}

/// Condition variable state. Also embedded inside message ports (the send
/// and receive conditions) and wait groups (the blocked-thread condition).
#[derive(Debug)]
pub struct KCondVar {
    pub clock_id: ClockId,
    pub wait_queue: WaitQueue,
    pub listeners: Vec<Listener>,
}

impl KCondVar {
    pub fn new(clock_id: ClockId) -> Self {
        Self {
            clock_id,
            wait_queue: WaitQueue::new(),
            listeners: Vec::new(),
        }
    }
}

/// Mutex state.
///
/// `count` is signed: 0 = free, negative = exclusively held with `-count`
/// recursion depth, positive = shared-held reader count.
#[derive(Debug)]
pub struct KMutex {
    pub count: i32,
    pub holder: ThreadId,
    pub recursion_mode: MutexRecursionMode,
    pub clock_id: ClockId,
    pub wait_queue: WaitQueue,
    pub listeners: Vec<Listener>,
}

impl KMutex {
    pub fn new(recursion_mode: MutexRecursionMode, clock_id: ClockId) -> Self {
        Self {
            count: 0,
            holder: Handle::INVALID,
            recursion_mode,
            clock_id,
            wait_queue: WaitQueue::new(),
            listeners: Vec::new(),
        }
    }
}

/// Counting semaphore state.
#[derive(Debug)]
pub struct KSemaphore {
    pub count: u32,
    pub clock_id: ClockId,
    pub wait_queue: WaitQueue,
    pub listeners: Vec<Listener>,
}

impl KSemaphore {
    pub fn new(count: u32, clock_id: ClockId) -> Self {
        Self {
            count,
            clock_id,
            wait_queue: WaitQueue::new(),
            listeners: Vec::new(),
        }
    }
}

/// One queued port message. Small payloads borrow a buffer from the
/// kernel-wide message cache; see `sync::port`.
#[derive(Debug)]
pub struct PortMessage {
    pub target_handler: i32,
    pub code: i32,
    pub payload: crate::sync::port::MessagePayload,
}

/// Message port state. The body lock plays the role of the port's internal
/// mutex; the two embedded conditions carry the waiters.
#[derive(Debug)]
pub struct KMessagePort {
    pub send_condition: KCondVar,
    pub receive_condition: KCondVar,
    pub max_count: usize,
    pub message_count: usize,
    pub messages: alloc::collections::VecDeque<PortMessage>,
}

impl KMessagePort {
    pub fn new(max_count: usize) -> Self {
        Self {
            send_condition: KCondVar::new(ClockId::MonotonicCoarse),
            receive_condition: KCondVar::new(ClockId::MonotonicCoarse),
            max_count,
            message_count: 0,
            messages: alloc::collections::VecDeque::new(),
        }
    }
}

/// Object wait group state. `blocked_thread` is the thread currently parked
/// in `wait`, if any; `add`/`remove`/`clear` park on the blocked-thread
/// condition until it clears. `pending_mods` counts threads waiting to
/// modify the set so a hot `wait` loop yields to them.
pub struct KObjectWaitGroup {
    pub entries: Vec<(Arc<KObject>, ObjectWaitMode)>,
    pub blocked_thread: Option<ThreadId>,
    pub blocked_thread_condition: KCondVar,
    pub pending_mods: u32,
}

impl KObjectWaitGroup {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            blocked_thread: None,
            blocked_thread_condition: KCondVar::new(ClockId::MonotonicCoarse),
            pending_mods: 0,
        }
    }
}

impl Default for KObjectWaitGroup {
    fn default() -> Self {
        Self::new()
    }
}

pub enum KObjectBody {
    Mutex(KMutex),
    CondVar(KCondVar),
    Semaphore(KSemaphore),
    MessagePort(KMessagePort),
    WaitGroup(KObjectWaitGroup),
}

impl KObjectBody {
    pub fn as_mutex(&mut self) -> KResult<&mut KMutex> {
        match self {
            KObjectBody::Mutex(m) => Ok(m),
            _ => Err(ErrorCode::InvalidArg),
        }
    }

    pub fn as_condvar(&mut self) -> KResult<&mut KCondVar> {
        match self {
            KObjectBody::CondVar(c) => Ok(c),
            _ => Err(ErrorCode::InvalidArg),
        }
    }

    pub fn as_semaphore(&mut self) -> KResult<&mut KSemaphore> {
        match self {
            KObjectBody::Semaphore(s) => Ok(s),
            _ => Err(ErrorCode::InvalidArg),
        }
    }

    pub fn as_port(&mut self) -> KResult<&mut KMessagePort> {
        match self {
            KObjectBody::MessagePort(p) => Ok(p),
            _ => Err(ErrorCode::InvalidArg),
        }
    }

    pub fn as_wait_group(&mut self) -> KResult<&mut KObjectWaitGroup> {
        match self {
            KObjectBody::WaitGroup(g) => Ok(g),
            _ => Err(ErrorCode::InvalidArg),
        }
    }

    /// Registers a wait-group listener, or reports that the object is
    /// already ready in the requested mode and will not block.
    ///
    /// Returns `true` if the object is ready now (no listener added).
    pub fn add_listener(
        &mut self,
        listener: Listener,
        mode: ObjectWaitMode,
    ) -> KResult<bool> {
        match self {
            KObjectBody::Mutex(m) => {
                if m.count == 0 {
                    Ok(true)
                } else {
                    m.listeners.push(listener);
                    Ok(false)
                }
            }
            KObjectBody::CondVar(c) => {
                c.listeners.push(listener);
                Ok(false)
            }
            KObjectBody::Semaphore(s) => {
                if s.count > 0 {
                    Ok(true)
                } else {
                    s.listeners.push(listener);
                    Ok(false)
                }
            }
            KObjectBody::MessagePort(p) => match mode {
                ObjectWaitMode::Read => {
                    if p.message_count == 0 {
                        p.receive_condition.listeners.push(listener);
                        Ok(false)
                    } else {
                        Ok(true)
                    }
                }
                ObjectWaitMode::Write => {
                    if p.message_count >= p.max_count {
                        p.send_condition.listeners.push(listener);
                        Ok(false)
                    } else {
                        Ok(true)
                    }
                }
                ObjectWaitMode::ReadWrite => {
                    if p.message_count > 0 && p.message_count < p.max_count {
                        Ok(true)
                    } else {
                        p.receive_condition.listeners.push(listener);
                        p.send_condition.listeners.push(listener);
                        Ok(false)
                    }
                }
            },
            // A wait group inside a wait group would have to take two body
            // locks in arbitrary order; reject it.
            KObjectBody::WaitGroup(_) => Err(ErrorCode::InvalidArg),
        }
    }

    /// Removes every listener registration for `thread`.
    pub fn remove_listeners_for(&mut self, thread: ThreadId) {
        fn purge(v: &mut Vec<Listener>, thread: ThreadId) {
            v.retain(|l| l.thread != thread);
        }
        match self {
            KObjectBody::Mutex(m) => purge(&mut m.listeners, thread),
            KObjectBody::CondVar(c) => purge(&mut c.listeners, thread),
            KObjectBody::Semaphore(s) => purge(&mut s.listeners, thread),
            KObjectBody::MessagePort(p) => {
                purge(&mut p.receive_condition.listeners, thread);
                purge(&mut p.send_condition.listeners, thread);
            }
            KObjectBody::WaitGroup(_) => {}
        }
    }

    /// Collects every parked thread from every queue in this body; used when
    /// the object's handle is freed so the waiters can be woken with their
    /// target-deleted flag set.
    pub fn drain_waiters(&mut self) -> Vec<ThreadId> {
        let mut out = Vec::new();
        match self {
            KObjectBody::Mutex(m) => out.extend(m.wait_queue.take_waiters(0)),
            KObjectBody::CondVar(c) => out.extend(c.wait_queue.take_waiters(0)),
            KObjectBody::Semaphore(s) => out.extend(s.wait_queue.take_waiters(0)),
            KObjectBody::MessagePort(p) => {
                out.extend(p.send_condition.wait_queue.take_waiters(0));
                out.extend(p.receive_condition.wait_queue.take_waiters(0));
            }
            KObjectBody::WaitGroup(g) => {
                out.extend(g.blocked_thread_condition.wait_queue.take_waiters(0));
                if let Some(t) = g.blocked_thread.take() {
                    out.push(t);
                }
            }
        }
        out
    }
}

/// A named kernel object: the registry entry type.
pub struct KObject {
    name: heapless::String<NAME_LENGTH>,
    type_tag: HandleType,
    pub body: spin::Mutex<KObjectBody>,
}

impl KObject {
    pub fn new(name: &str, type_tag: HandleType, body: KObjectBody) -> Self {
        let mut buf = heapless::String::new();
        for c in name.chars().take(NAME_LENGTH) {
            if buf.push(c).is_err() {
                break;
            }
        }
        Self {
            name: buf,
            type_tag,
            body: spin::Mutex::new(body),
        }
    }

    pub fn new_mutex(name: &str, mode: MutexRecursionMode, clock_id: ClockId) -> Self {
        Self::new(name, HandleType::Mutex, KObjectBody::Mutex(KMutex::new(mode, clock_id)))
    }

    pub fn new_condvar(name: &str, clock_id: ClockId) -> Self {
        Self::new(
            name,
            HandleType::ConditionVariable,
            KObjectBody::CondVar(KCondVar::new(clock_id)),
        )
    }

    pub fn new_semaphore(name: &str, count: u32, clock_id: ClockId) -> Self {
        Self::new(
            name,
            HandleType::Semaphore,
            KObjectBody::Semaphore(KSemaphore::new(count, clock_id)),
        )
    }

    pub fn new_message_port(name: &str, max_count: usize) -> Self {
        Self::new(
            name,
            HandleType::MessagePort,
            KObjectBody::MessagePort(KMessagePort::new(max_count)),
        )
    }

    pub fn new_wait_group(name: &str) -> Self {
        Self::new(
            name,
            HandleType::ObjectWaitGroup,
            KObjectBody::WaitGroup(KObjectWaitGroup::new()),
        )
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn type_tag(&self) -> HandleType {
        self.type_tag
    }
}
