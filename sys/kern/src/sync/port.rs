// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Message ports: bounded FIFOs of typed messages with back-pressure.
//!
//! Senders park on the send condition while the port is full; receivers park
//! on the receive condition while it is empty. Each enqueue wakes every
//! receiver, each dequeue wakes every sender -- woken threads re-check the
//! counts and the losers park again.
//!
//! Message payloads up to [`MAX_CACHED_MESSAGE_SIZE`] bytes are carried in
//! buffers drawn from a kernel-wide cache, capped at
//! [`MAX_CACHED_MESSAGE_COUNT`] entries, so steady-state messaging does not
//! touch the allocator. Larger payloads go to the heap.

use abi::{ErrorCode, Handle, HandleType, KResult, ThreadState};
use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::kobject::{KObject, PortMessage};
use crate::sched::KernelRef;
use crate::time::TimeValNanos;

/// Largest payload served from the cache.
pub const MAX_CACHED_MESSAGE_SIZE: usize = 64;

/// Upper bound on cached buffers kept around.
pub const MAX_CACHED_MESSAGE_COUNT: usize = 100;

type SmallBuf = Box<[u8; MAX_CACHED_MESSAGE_SIZE]>;

/// Kernel-wide cache of small message buffers.
pub struct MessageCache {
    free: Vec<SmallBuf>,
}

impl MessageCache {
    pub fn new() -> Self {
        Self { free: Vec::new() }
    }

    fn alloc_small(&mut self) -> SmallBuf {
        self.free
            .pop()
            .unwrap_or_else(|| Box::new([0; MAX_CACHED_MESSAGE_SIZE]))
    }

    fn release(&mut self, buf: SmallBuf) {
        if self.free.len() < MAX_CACHED_MESSAGE_COUNT {
            self.free.push(buf);
        }
    }

    pub fn cached(&self) -> usize {
        self.free.len()
    }
}

impl Default for MessageCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Payload storage for one message.
#[derive(Debug)]
pub enum MessagePayload {
    Small { buf: SmallBuf, len: usize },
    Large(Vec<u8>),
}

impl MessagePayload {
    pub fn bytes(&self) -> &[u8] {
        match self {
            MessagePayload::Small { buf, len } => &buf[..*len],
            MessagePayload::Large(v) => v,
        }
    }
}

enum Step {
    Done,
    Blocked,
    Restart,
    TimedOut,
}

fn resolve(kr: KernelRef, handle: Handle) -> KResult<Arc<KObject>> {
    kr.crit(|k| k.object_typed(handle, HandleType::MessagePort))
}

pub fn kport_create(kr: KernelRef, name: &str, max_count: usize) -> KResult<Handle> {
    if max_count == 0 {
        return Err(ErrorCode::InvalidArg);
    }
    kr.crit(|k| k.register_object(KObject::new_message_port(name, max_count)))
}

/// Sends a message, blocking while the port is full. `deadline` is
/// monotonic; pass `INFINITE` for the untimed form.
pub fn kport_send_deadline(
    kr: KernelRef,
    handle: Handle,
    target_handler: i32,
    code: i32,
    data: &[u8],
    deadline: TimeValNanos,
    interruptible: bool,
) -> KResult<()> {
    let object = resolve(kr, handle)?;
    let tid = kr.crit(|k| k.current);

    loop {
        let step = kr.crit(|k| -> KResult<Step> {
            let mut body = object.body.lock();
            let port = body.as_port()?;
            if port.message_count < port.max_count {
                let payload = if data.len() <= MAX_CACHED_MESSAGE_SIZE {
                    let mut buf = k.message_cache.alloc_small();
                    buf[..data.len()].copy_from_slice(data);
                    MessagePayload::Small {
                        buf,
                        len: data.len(),
                    }
                } else {
                    let mut v = Vec::new();
                    v.try_reserve_exact(data.len())
                        .map_err(|_| ErrorCode::NoMemory)?;
                    v.extend_from_slice(data);
                    MessagePayload::Large(v)
                };
                port.messages.push_back(PortMessage {
                    target_handler,
                    code,
                    payload,
                });
                port.message_count += 1;
                let need_switch =
                    k.wakeup_wait_queue(&mut port.receive_condition.wait_queue, 0);
                k.fire_listeners(&mut port.receive_condition.listeners);
                if need_switch {
                    k.request_context_switch();
                }
                return Ok(Step::Done);
            }
            if !(deadline.is_infinite() || k.monotonic_time() < deadline) {
                return Ok(Step::TimedOut);
            }
            if interruptible && k.current_thread().has_unblocked_pending_signals() {
                return Ok(Step::Restart);
            }
            port.send_condition.wait_queue.append(tid);
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
            Step::Done => return Ok(()),
            Step::TimedOut => return Err(ErrorCode::Timeout),
            Step::Restart => return Err(ErrorCode::RestartSyscall),
            Step::Blocked => {}
        }

        kr.switch_point();

        kr.crit(|k| -> KResult<()> {
            let mut body = object.body.lock();
            let port = body.as_port()?;
            port.send_condition.wait_queue.remove(tid);
            k.sleep.remove(tid);
            let thread = k.thread_mut(tid).unwrap();
            thread.blocking_object = Handle::INVALID;
            if thread.take_target_deleted() {
                return Err(ErrorCode::InvalidArg);
            }
            Ok(())
        })?;
    }
}

pub fn kport_send_timeout(
    kr: KernelRef,
    handle: Handle,
    target_handler: i32,
    code: i32,
    data: &[u8],
    timeout: TimeValNanos,
    interruptible: bool,
) -> KResult<()> {
    let deadline = kr.crit(|k| k.timeout_to_deadline(timeout));
    kport_send_deadline(kr, handle, target_handler, code, data, deadline, interruptible)
}

pub fn kport_send(
    kr: KernelRef,
    handle: Handle,
    target_handler: i32,
    code: i32,
    data: &[u8],
    interruptible: bool,
) -> KResult<()> {
    kport_send_deadline(
        kr,
        handle,
        target_handler,
        code,
        data,
        TimeValNanos::INFINITE,
        interruptible,
    )
}

/// Receives the head message, blocking while the port is empty. Copies up to
/// `buffer.len()` payload bytes and returns `(target_handler, code, copied)`.
/// A short buffer truncates; the message is consumed either way.
pub fn kport_receive_deadline(
    kr: KernelRef,
    handle: Handle,
    buffer: &mut [u8],
    deadline: TimeValNanos,
    interruptible: bool,
) -> KResult<(i32, i32, usize)> {
    let object = resolve(kr, handle)?;
    let tid = kr.crit(|k| k.current);

    loop {
        enum RecvStep {
            Got(i32, i32, usize),
            Blocked,
            Restart,
            TimedOut,
        }
        let step = kr.crit(|k| -> KResult<RecvStep> {
            let mut body = object.body.lock();
            let port = body.as_port()?;
            if let Some(message) = port.messages.pop_front() {
                uassert!(port.message_count > 0);
                port.message_count -= 1;
                let bytes = message.payload.bytes();
                let copied = bytes.len().min(buffer.len());
                buffer[..copied].copy_from_slice(&bytes[..copied]);
                if let MessagePayload::Small { buf, .. } = message.payload {
                    k.message_cache.release(buf);
                }
                let need_switch =
                    k.wakeup_wait_queue(&mut port.send_condition.wait_queue, 0);
                k.fire_listeners(&mut port.send_condition.listeners);
                if need_switch {
                    k.request_context_switch();
                }
                return Ok(RecvStep::Got(message.target_handler, message.code, copied));
            }
            if !(deadline.is_infinite() || k.monotonic_time() < deadline) {
                return Ok(RecvStep::TimedOut);
            }
            if interruptible && k.current_thread().has_unblocked_pending_signals() {
                return Ok(RecvStep::Restart);
            }
            port.receive_condition.wait_queue.append(tid);
            let thread = k.thread_mut(tid).unwrap();
            thread.blocking_object = handle;
            if deadline.is_infinite() {
                thread.state = ThreadState::Waiting;
            } else {
                thread.state = ThreadState::Sleeping;
                k.sleep.add(tid, deadline);
            }
            k.request_context_switch();
            Ok(RecvStep::Blocked)
        })?;

        match step {
            RecvStep::Got(target, code, copied) => return Ok((target, code, copied)),
            RecvStep::TimedOut => return Err(ErrorCode::Timeout),
            RecvStep::Restart => return Err(ErrorCode::RestartSyscall),
            RecvStep::Blocked => {}
        }

        kr.switch_point();

        kr.crit(|k| -> KResult<()> {
            let mut body = object.body.lock();
            let port = body.as_port()?;
            port.receive_condition.wait_queue.remove(tid);
            k.sleep.remove(tid);
            let thread = k.thread_mut(tid).unwrap();
            thread.blocking_object = Handle::INVALID;
            if thread.take_target_deleted() {
                return Err(ErrorCode::InvalidArg);
            }
            Ok(())
        })?;
    }
}

pub fn kport_receive_timeout(
    kr: KernelRef,
    handle: Handle,
    buffer: &mut [u8],
    timeout: TimeValNanos,
    interruptible: bool,
) -> KResult<(i32, i32, usize)> {
    let deadline = kr.crit(|k| k.timeout_to_deadline(timeout));
    kport_receive_deadline(kr, handle, buffer, deadline, interruptible)
}

pub fn kport_receive(
    kr: KernelRef,
    handle: Handle,
    buffer: &mut [u8],
    interruptible: bool,
) -> KResult<(i32, i32, usize)> {
    kport_receive_deadline(kr, handle, buffer, TimeValNanos::INFINITE, interruptible)
}

/// A second handle on the same port.
pub fn kport_duplicate(kr: KernelRef, handle: Handle) -> KResult<Handle> {
    kr.crit(|k| {
        k.object_typed(handle, HandleType::MessagePort)?;
        k.duplicate_object(handle)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::Kernel;
    use crate::thread::spawn_parked;

    #[test]
    fn send_receive_round_trips_payload_and_codes() {
        let mut kern = Kernel::new_for_test();
        let kr = kern.test_ref();
        let p = kport_create(kr, "p", 4).unwrap();
        kport_send(kr, p, 17, -3, b"hello port", false).unwrap();

        let mut buf = [0u8; 32];
        let (target, code, len) = kport_receive(kr, p, &mut buf, false).unwrap();
        assert_eq!(target, 17);
        assert_eq!(code, -3);
        assert_eq!(&buf[..len], b"hello port");
    }

    #[test]
    fn short_buffer_truncates_but_consumes() {
        let mut kern = Kernel::new_for_test();
        let kr = kern.test_ref();
        let p = kport_create(kr, "p", 4).unwrap();
        kport_send(kr, p, 0, 0, b"abcdef", false).unwrap();

        let mut buf = [0u8; 3];
        let (_, _, len) = kport_receive(kr, p, &mut buf, false).unwrap();
        assert_eq!(len, 3);
        assert_eq!(&buf, b"abc");
        // Port is empty again.
        assert_eq!(
            kport_receive_timeout(kr, p, &mut buf, TimeValNanos::ZERO, false),
            Err(ErrorCode::Timeout)
        );
    }

    #[test]
    fn port_never_exceeds_max_count() {
        let mut kern = Kernel::new_for_test();
        let kr = kern.test_ref();
        let p = kport_create(kr, "p", 2).unwrap();
        kport_send(kr, p, 0, 1, b"a", false).unwrap();
        kport_send(kr, p, 0, 2, b"b", false).unwrap();
        assert_eq!(
            kport_send_timeout(kr, p, 0, 3, b"c", TimeValNanos::ZERO, false),
            Err(ErrorCode::Timeout)
        );
        let object = kern.object(p).unwrap();
        assert_eq!(object.body.lock().as_port().unwrap().message_count, 2);
    }

    #[test]
    fn full_port_send_completes_after_drain() {
        let mut kern = Kernel::new_for_test();
        let kr = kern.test_ref();
        let receiver = spawn_parked(&mut kern, "rx", 0);
        let p = kport_create(kr, "p", 2).unwrap();
        kport_send(kr, p, 0, 1, b"a", false).unwrap();
        kport_send(kr, p, 0, 2, b"b", false).unwrap();

        kr.sim_enqueue(move |kr| {
            kr.run_as(receiver, |kr| {
                let mut buf = [0u8; 8];
                let (_, code, _) = kport_receive(kr, p, &mut buf, false).unwrap();
                assert_eq!(code, 1);
            });
        });
        // Third send blocks, then succeeds once the receiver drains one.
        kport_send_timeout(kr, p, 0, 3, b"c", TimeValNanos::from_millis(100), false)
            .unwrap();
        let object = kern.object(p).unwrap();
        assert_eq!(object.body.lock().as_port().unwrap().message_count, 2);
    }

    #[test]
    fn receive_blocks_until_message_arrives() {
        let mut kern = Kernel::new_for_test();
        let kr = kern.test_ref();
        let sender = spawn_parked(&mut kern, "tx", 0);
        let p = kport_create(kr, "p", 2).unwrap();
        kr.sim_enqueue(move |kr| {
            kr.run_as(sender, |kr| {
                kport_send(kr, p, 9, 42, b"ping", false).unwrap();
            });
        });
        let mut buf = [0u8; 8];
        let (target, code, len) = kport_receive(kr, p, &mut buf, false).unwrap();
        assert_eq!((target, code, &buf[..len]), (9, 42, &b"ping"[..]));
    }

    #[test]
    fn messages_deliver_in_order() {
        let mut kern = Kernel::new_for_test();
        let kr = kern.test_ref();
        let p = kport_create(kr, "p", 8).unwrap();
        for code in 0..5 {
            kport_send(kr, p, 0, code, &[code as u8], false).unwrap();
        }
        let mut buf = [0u8; 4];
        for code in 0..5 {
            let (_, got, _) = kport_receive(kr, p, &mut buf, false).unwrap();
            assert_eq!(got, code);
        }
    }

    #[test]
    fn small_buffers_return_to_cache() {
        let mut kern = Kernel::new_for_test();
        let kr = kern.test_ref();
        let p = kport_create(kr, "p", 4).unwrap();
        kport_send(kr, p, 0, 0, &[0u8; MAX_CACHED_MESSAGE_SIZE], false).unwrap();
        let mut buf = [0u8; MAX_CACHED_MESSAGE_SIZE];
        kport_receive(kr, p, &mut buf, false).unwrap();
        assert_eq!(kern.message_cache.cached(), 1);

        // Large payloads bypass the cache.
        let big = alloc::vec![7u8; MAX_CACHED_MESSAGE_SIZE + 1];
        kport_send(kr, p, 0, 0, &big, false).unwrap();
        let mut big_buf = alloc::vec![0u8; big.len()];
        let (_, _, len) = kport_receive(kr, p, &mut big_buf, false).unwrap();
        assert_eq!(len, big.len());
        assert_eq!(kern.message_cache.cached(), 1);
    }

    #[test]
    fn duplicate_handle_reaches_same_port() {
        let mut kern = Kernel::new_for_test();
        let kr = kern.test_ref();
        let p = kport_create(kr, "p", 4).unwrap();
        let d = kport_duplicate(kr, p).unwrap();
        assert_ne!(p, d);
        kport_send(kr, p, 0, 5, b"x", false).unwrap();
        let mut buf = [0u8; 4];
        let (_, code, _) = kport_receive(kr, d, &mut buf, false).unwrap();
        assert_eq!(code, 5);
    }
}
