// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Cross-module scenarios, driven through the simulated architecture.
//!
//! These follow the shape of the system's acceptance stories: threads
//! contending for primitives while signals, timeouts and deletions land at
//! awkward moments. The simulation plays "the other threads" through queued
//! events that run whenever the test thread blocks.

use abi::{
    sig_mkmask, ClockId, ErrorCode, Handle, MutexRecursionMode, ObjectWaitMode,
    SigAction, SigActionFlags, SIGALRM, SIGRTMIN,
};
use kern::sched::Kernel;
use kern::signal;
use kern::sync::mutex::{
    kmutex_create, kmutex_lock, kmutex_lock_timeout, kmutex_try_lock,
    kmutex_unlock,
};
use kern::sync::port::{kport_create, kport_receive, kport_send, kport_send_timeout};
use kern::sync::waitgroup::{
    kwaitgroup_add, kwaitgroup_create, kwaitgroup_wait_timeout,
};
use kern::thread::spawn_parked;
use kern::time::TimeValNanos;

/// T1 holds M, T2 waits with a 1 second timeout, and a signal
/// lands on T2 mid-wait. The wait is torn down cleanly: T2's syscall path
/// reports the interruption, and once T1 unlocks, the mutex is free with no
/// residual count or waiters.
#[test]
fn mutex_handoff_under_signal() {
    let mut kern = Kernel::new_for_test();
    let kr = kern.test_ref();
    let me = kern.current;
    let holder = spawn_parked(&mut kern, "t1", 0);
    let m = kmutex_create(kr, "m", MutexRecursionMode::RaiseError, ClockId::MonotonicCoarse)
        .unwrap();
    kr.run_as(holder, |kr| kmutex_lock(kr, m, false).unwrap());

    // At "t=200ms", SIGALRM arrives (default action: terminate).
    kr.sim_enqueue(move |kr| {
        kr.crit(|k| {
            k.sim_advance_ms(200);
            signal::ksend_signal_to_thread(k, me, SIGALRM).unwrap();
        });
    });
    let result = kmutex_lock_timeout(kr, m, TimeValNanos::from_secs(1), true);
    assert_eq!(result, Err(ErrorCode::RestartSyscall));
    assert!(kern.current_thread().pending_signals.contains(SIGALRM));

    // T1 unlocks; the mutex is fully free.
    kr.run_as(holder, |kr| kmutex_unlock(kr, m).unwrap());
    let object = kern.object(m).unwrap();
    let mut body = object.body.lock();
    let mutex = body.as_mutex().unwrap();
    assert_eq!(mutex.count, 0);
    assert_eq!(mutex.holder, Handle::INVALID);
    assert!(mutex.wait_queue.is_empty());
}

/// A port with room for two. The first two sends land, the
/// third blocks and completes only after a concurrent receive drains one,
/// well inside its 100ms budget.
#[test]
fn message_port_back_pressure() {
    let mut kern = Kernel::new_for_test();
    let kr = kern.test_ref();
    let receiver = spawn_parked(&mut kern, "rx", 0);
    let p = kport_create(kr, "p", 2).unwrap();

    kport_send(kr, p, 1, 100, b"first", false).unwrap();
    kport_send(kr, p, 1, 101, b"second", false).unwrap();

    kr.sim_enqueue(move |kr| {
        kr.crit(|k| k.sim_advance_ms(10));
        kr.run_as(receiver, |kr| {
            let mut buf = [0u8; 16];
            let (_, code, len) = kport_receive(kr, p, &mut buf, false).unwrap();
            assert_eq!(code, 100);
            assert_eq!(&buf[..len], b"first");
        });
    });
    kport_send_timeout(kr, p, 1, 102, b"third", TimeValNanos::from_millis(100), false)
        .unwrap();

    // Drain and verify order and integrity of the survivors.
    let mut buf = [0u8; 16];
    let (_, code, len) = kport_receive(kr, p, &mut buf, false).unwrap();
    assert_eq!((code, &buf[..len]), (101, &b"second"[..]));
    let (_, code, len) = kport_receive(kr, p, &mut buf, false).unwrap();
    assert_eq!((code, &buf[..len]), (102, &b"third"[..]));
}

/// A wait group watching two ports in Read mode, with a 500ms
/// deadline. A message lands on the second port at 100ms; the wait reports
/// exactly that port's bit.
#[test]
fn wait_group_race() {
    let mut kern = Kernel::new_for_test();
    let kr = kern.test_ref();
    let sender = spawn_parked(&mut kern, "tx", 0);
    let g = kwaitgroup_create(kr, "g").unwrap();
    let p1 = kport_create(kr, "p1", 4).unwrap();
    let p2 = kport_create(kr, "p2", 4).unwrap();
    kwaitgroup_add(kr, g, p1, ObjectWaitMode::Read).unwrap();
    kwaitgroup_add(kr, g, p2, ObjectWaitMode::Read).unwrap();

    kr.sim_enqueue(move |kr| {
        kr.crit(|k| k.sim_advance_ms(100));
        kr.run_as(sender, |kr| {
            kport_send(kr, p2, 0, 0, b"wake", false).unwrap();
        });
    });
    let mask = kwaitgroup_wait_timeout(
        kr,
        g,
        Handle::INVALID,
        TimeValNanos::from_millis(500),
    )
    .unwrap();
    assert_eq!(mask, 0b10, "only p2's bit may be set");
}

/// Realtime signal ordering. Two values queued on SIGRTMIN and
/// one on SIGRTMIN+1 deliver as v1, v2, v3 -- lower numbers first, FIFO
/// within a number -- across three delivery boundaries.
#[test]
fn realtime_signal_ordering() {
    let mut kern = Kernel::new_for_test();
    let me = kern.current;
    kern.app_vectors.signal_trampoline = 0x0800_2001;
    kern.app_vectors.terminate_thread = 0x0800_3001;
    for sig in [SIGRTMIN, SIGRTMIN + 1] {
        signal::ksigaction(
            &mut kern,
            sig,
            Some(SigAction {
                handler: 0x0800_1001,
                mask: abi::SigSet::EMPTY,
                flags: SigActionFlags::empty(),
            }),
        )
        .unwrap();
    }
    signal::kqueue_signal_to_thread(&mut kern, me, SIGRTMIN, 1).unwrap();
    signal::kqueue_signal_to_thread(&mut kern, me, SIGRTMIN, 2).unwrap();
    signal::kqueue_signal_to_thread(&mut kern, me, SIGRTMIN + 1, 3).unwrap();

    // Fabricate a user stack with an interrupted context on top.
    let stack = Box::new([0u64; 512]);
    let top = stack.as_ptr() as usize + 512 * 8;
    let frame_block = core::mem::size_of::<signal::KernelCtxFrame>()
        + core::mem::size_of::<signal::ExceptionFrame>();
    let mut sp = top - frame_block;
    unsafe {
        core::ptr::write(
            sp as *mut signal::KernelCtxFrame,
            signal::KernelCtxFrame {
                exc_return: 0xFFFF_FFED,
                ..Default::default()
            },
        );
        core::ptr::write(
            (sp + core::mem::size_of::<signal::KernelCtxFrame>())
                as *mut signal::ExceptionFrame,
            signal::ExceptionFrame {
                pc: 0x0800_4000,
                xpsr: 1 << 24,
                ..Default::default()
            },
        );
    }

    let mut delivered = Vec::new();
    loop {
        let new_sp = signal::process_pending_signals(&mut kern, sp, true);
        if new_sp == sp {
            break;
        }
        let frame: signal::SignalStackFrame = unsafe {
            core::ptr::read((new_sp + signal::ctx_frame_size(0xFFFF_FFED)) as *const _)
        };
        delivered.push(frame.siginfo.si_value);
        // Unblock the signal again, as sigreturn would.
        kern.current_thread_mut().blocked_signals = abi::SigSet::EMPTY;
        sp = new_sp;
    }
    assert_eq!(delivered, [1, 2, 3]);
}

/// A thread blocked in a timed wait is charged no run time while asleep,
/// and the clocks it parked against agree when it wakes.
#[test]
fn sleepers_do_not_accrue_cpu_time() {
    let mut kern = Kernel::new_for_test();
    let kr = kern.test_ref();
    let before = kern.current_thread().run_time;
    kr.sim_enqueue(|kr| {
        kr.crit(|k| {
            // The sleeper is off the ready lists, so the scheduler picks
            // idle; time passes on idle's account; the tick wakes the
            // sleeper and the second reschedule hands the CPU back.
            k.reschedule();
            k.sim_advance_ms(50);
            k.reschedule();
        });
    });
    kern::thread::ksnooze(kr, TimeValNanos::from_millis(20)).unwrap();
    let after = kern.current_thread().run_time;
    assert_eq!(after, before, "sleeping thread must not be charged");
    assert!(kern.idle_time() >= TimeValNanos::from_millis(50));
}

/// Blocking with a mask of everything except one signal, then sending that
/// signal, interrupts a sigsuspend exactly once.
#[test]
fn sigsuspend_round_trip() {
    let mut kern = Kernel::new_for_test();
    let kr = kern.test_ref();
    let me = kern.current;
    kr.crit(|k| {
        k.current_thread_mut().blocked_signals = sig_mkmask(SIGALRM);
    });
    kr.sim_enqueue(move |kr| {
        kr.crit(|k| signal::ksend_signal_to_thread(k, me, SIGALRM).unwrap());
    });
    assert_eq!(
        signal::ksigsuspend(kr, abi::SigSet::EMPTY),
        Err(ErrorCode::Interrupted)
    );
    // The pre-suspend mask is parked for the delivery path to restore.
    assert_eq!(
        kern.current_thread().sigsuspend_saved_mask,
        Some(sig_mkmask(SIGALRM))
    );
}

/// try_lock-style paths must never block even under a zero deadline, per
/// the boundary rules.
#[test]
fn zero_timeouts_never_block() {
    let mut kern = Kernel::new_for_test();
    let kr = kern.test_ref();
    let holder = spawn_parked(&mut kern, "h", 0);
    let m = kmutex_create(kr, "m", MutexRecursionMode::RaiseError, ClockId::MonotonicCoarse)
        .unwrap();
    kr.run_as(holder, |kr| kmutex_try_lock(kr, m).unwrap());

    // No events are queued: if any of these blocked, the simulation would
    // panic about a missing event.
    assert_eq!(
        kmutex_lock_timeout(kr, m, TimeValNanos::ZERO, false),
        Err(ErrorCode::Timeout)
    );
    let p = kport_create(kr, "p", 1).unwrap();
    let mut buf = [0u8; 4];
    assert_eq!(
        kern::sync::port::kport_receive_timeout(
            kr,
            p,
            &mut buf,
            TimeValNanos::ZERO,
            false
        ),
        Err(ErrorCode::Timeout)
    );
}
