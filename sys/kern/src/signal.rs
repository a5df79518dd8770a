// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! POSIX signal state and delivery.
//!
//! Each thread carries a pending mask, a blocked mask, an ordered queue of
//! realtime signal nodes, and a table of installed actions. Delivery is
//! synchronous: on return from a syscall or exception, and on the forced
//! check a restarted syscall issues, the kernel picks at most one deliverable
//! signal -- SIGKILL, then SIGSTOP, then SIGCONT, then ascending number --
//! and lays a signal frame on the thread's user stack. A handler that leaves
//! more signals pending gets them one at a time, each return trip through
//! `sigreturn` re-entering the delivery check, so nested handlers layer
//! naturally.
//!
//! # Frame layout
//!
//! At delivery time the interrupted thread's stack top holds a context-switch
//! frame: the callee-saved registers plus EXC_RETURN pushed by the kernel,
//! followed by the hardware exception frame. Delivery copies that whole block
//! down the stack, plants a [`SignalStackFrame`] between the copy and the
//! original, and rewrites the copy's exception frame so the resume lands in
//! the handler with `(signo, &siginfo, old_sp)` in R0-R2 and the user-mode
//! trampoline in LR. `sigreturn` pops back to the original frame, restoring
//! the pre-signal privilege (stashed in bit 0 of the saved stack pointer) and
//! blocked mask.

use abi::{
    sig_can_auto_reset, sig_can_be_ignored, sig_default_action, sig_mkmask,
    ErrorCode, KResult, SigAction, SigActionFlags, SigDefaultAction, SigInfo,
    SigSet, ThreadId, ThreadState, BLOCKABLE_SIGNALS_MASK, NSIG, SIGCHLD,
    SIGCONT, SIGKILL, SIGRTMIN, SIGSTOP, SIG_BLOCK, SIG_DFL, SIG_ERR, SIG_IGN,
    SIG_SETMASK, SIG_UNBLOCK, SI_QUEUE, SI_USER,
};
use alloc::boxed::Box;
use alloc::vec::Vec;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::sched::{Kernel, KernelRef};

/// One queued signal. Nodes live on the per-thread queue, sorted by signal
/// number with FIFO order within a number.
#[derive(Debug)]
pub struct SignalNode {
    pub sig_num: i32,
    pub info: SigInfo,
}

/// Bound on signal nodes in existence; keeps a runaway `sigqueue` loop from
/// eating the heap.
const MAX_SIGNAL_NODES: usize = 64;

/// Free list of signal queue nodes, reused so the delivery path does not
/// allocate.
pub struct SignalNodePool {
    free: Vec<Box<SignalNode>>,
    live: usize,
}

impl SignalNodePool {
    pub fn new() -> Self {
        Self {
            free: Vec::new(),
            live: 0,
        }
    }

    pub fn alloc(&mut self) -> Option<Box<SignalNode>> {
        if let Some(node) = self.free.pop() {
            return Some(node);
        }
        if self.live >= MAX_SIGNAL_NODES {
            return None;
        }
        self.live += 1;
        Some(Box::new(SignalNode {
            sig_num: 0,
            info: SigInfo::default(),
        }))
    }

    pub fn release(&mut self, node: Box<SignalNode>) {
        self.free.push(node);
    }
}

impl Default for SignalNodePool {
    fn default() -> Self {
        Self::new()
    }
}

//
// Exception-frame layout. These mirror what the hardware and the context
// switch path put on the stack; the signal injector moves them around as
// opaque blocks and patches the copy.
//

/// Registers stacked by the hardware on exception entry.
#[derive(Copy, Clone, Debug, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct ExceptionFrame {
    pub r0: u32,
    pub r1: u32,
    pub r2: u32,
    pub r3: u32,
    pub r12: u32,
    pub lr: u32,
    pub pc: u32,
    pub xpsr: u32,
}

/// Callee-saved registers pushed by the kernel entry paths, above the
/// hardware frame. `r12` is a scratch slot that keeps the block 8-byte
/// sized; `exc_return` records the frame flavor.
#[derive(Copy, Clone, Debug, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct KernelCtxFrame {
    pub r4: u32,
    pub r5: u32,
    pub r6: u32,
    pub r7: u32,
    pub r8: u32,
    pub r9: u32,
    pub r10: u32,
    pub r11: u32,
    pub r12: u32,
    pub exc_return: u32,
}

/// The record the kernel plants on the user stack for each delivered
/// signal: where to come back to (with the privilege mode in bit 0), what
/// the blocked mask was, and the delivered siginfo.
#[derive(Copy, Clone, Debug, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct SignalStackFrame {
    pub pre_signal_sp_and_privilege: u32,
    pub reserved: u32,
    pub saved_blocked_mask: SigSet,
    pub siginfo: SigInfo,
}

static_assertions::const_assert_eq!(core::mem::size_of::<SignalStackFrame>() % 8, 0);
static_assertions::const_assert_eq!(core::mem::size_of::<KernelCtxFrame>() % 8, 0);
static_assertions::const_assert_eq!(core::mem::size_of::<ExceptionFrame>() % 8, 0);

/// FPU registers add s16-s31 above the kernel frame and s0-s15 + FPSCR +
/// padding to the hardware frame.
const FPU_KERNEL_WORDS: usize = 16;
const FPU_EXCEPTION_WORDS: usize = 18;

/// EXC_RETURN bit 4 is *clear* when the stacked frame includes FPU state.
pub fn exc_return_has_fpu_frame(exc_return: u32) -> bool {
    exc_return & 0x10 == 0
}

/// Size of the context-switch frame block (kernel part + hardware part) for
/// the given EXC_RETURN flavor.
pub fn ctx_frame_size(exc_return: u32) -> usize {
    let base = core::mem::size_of::<KernelCtxFrame>()
        + core::mem::size_of::<ExceptionFrame>();
    if exc_return_has_fpu_frame(exc_return) {
        base + (FPU_KERNEL_WORDS + FPU_EXCEPTION_WORDS) * 4
    } else {
        base
    }
}

/// Thumb state bit in xPSR; everything else is cleared for handler entry.
const XPSR_THUMB: u32 = 1 << 24;

//
// Sending.
//

/// Marks `sig_num` pending on `target` and wakes it if appropriate.
///
/// Signal 0 probes deliverability without side effects. Signals to the init
/// thread only wake it -- its mask is never touched, so the reaper cannot be
/// killed.
pub fn ksend_signal_to_thread(
    kernel: &mut Kernel,
    target: ThreadId,
    sig_num: i32,
) -> KResult<()> {
    if !(0..=NSIG as i32).contains(&sig_num) {
        return Err(ErrorCode::InvalidArg);
    }
    let thread = kernel.thread(target).ok_or(ErrorCode::NoSuchProcess)?;
    if thread.state == ThreadState::Zombie || thread.state == ThreadState::Deleted {
        return Err(ErrorCode::NoSuchProcess);
    }
    if sig_num == 0 {
        return Ok(());
    }
    if target == kernel.init {
        kernel.wakeup_thread(target, false);
        return Ok(());
    }

    kernel.thread_mut(target).unwrap().set_pending_signal(sig_num);

    if sig_num == SIGCONT || sig_num == SIGKILL {
        kernel.wakeup_thread(target, true);
    } else if sig_num == SIGCHLD
        || !kernel.thread(target).unwrap().is_signal_blocked(sig_num)
    {
        kernel.wakeup_thread(target, false);
    }
    Ok(())
}

/// Queues a signal with a value payload. Realtime signals accumulate in
/// send order; classic signals collapse to a single node whose siginfo is
/// the newest. If no node can be had, a classic signal degrades to a bare
/// pending bit and a realtime signal fails with `NoMemory`.
pub fn kqueue_signal_to_thread(
    kernel: &mut Kernel,
    target: ThreadId,
    sig_num: i32,
    value: u32,
) -> KResult<()> {
    if !(0..=NSIG as i32).contains(&sig_num) {
        return Err(ErrorCode::InvalidArg);
    }
    let thread = kernel.thread(target).ok_or(ErrorCode::NoSuchProcess)?;
    if thread.state == ThreadState::Zombie || thread.state == ThreadState::Deleted {
        return Err(ErrorCode::NoSuchProcess);
    }
    if sig_num == 0 {
        return Ok(());
    }
    if target == kernel.init {
        kernel.wakeup_thread(target, false);
        return Ok(());
    }

    let node = kernel.signal_node_pool.alloc();
    let Some(mut node) = node else {
        if sig_num < SIGRTMIN {
            kernel.thread_mut(target).unwrap().set_pending_signal(sig_num);
            return Ok(());
        }
        return Err(ErrorCode::NoMemory);
    };
    node.sig_num = sig_num;
    node.info = SigInfo {
        si_signo: sig_num,
        si_code: SI_QUEUE,
        si_value: value,
        si_addr: 0,
    };

    let mut replaced = None;
    {
        let thread = kernel.thread_mut(target).unwrap();
        let queue = &mut thread.queued_signals;
        if sig_num < SIGRTMIN {
            // At most one node per classic signal; newest siginfo wins and
            // keeps the old node's position.
            match queue.iter().position(|n| n.sig_num >= sig_num) {
                Some(pos) if queue[pos].sig_num == sig_num => {
                    replaced = Some(core::mem::replace(&mut queue[pos], node));
                }
                Some(pos) => queue.insert(pos, node),
                None => queue.push(node),
            }
        } else {
            // Realtime: after every node with the same or lower number.
            let pos = queue
                .iter()
                .position(|n| n.sig_num > sig_num)
                .unwrap_or(queue.len());
            queue.insert(pos, node);
        }
        thread.set_pending_signal(sig_num);
    }
    if let Some(old) = replaced {
        kernel.signal_node_pool.release(old);
    }

    if !kernel.thread(target).unwrap().is_signal_blocked(sig_num) {
        kernel.wakeup_thread(target, false);
    }
    Ok(())
}

/// Pops the first queued node for `sig_num`, maintaining the pending bit:
/// it stays set while more nodes with the same number remain.
fn pop_queued_signal(kernel: &mut Kernel, target: ThreadId, sig_num: i32) -> Option<SigInfo> {
    let thread = kernel.thread_mut(target)?;
    let pos = thread
        .queued_signals
        .iter()
        .position(|n| n.sig_num == sig_num)?;
    let node = thread.queued_signals.remove(pos);
    let more = thread
        .queued_signals
        .iter()
        .any(|n| n.sig_num == sig_num);
    if !more {
        thread.clear_pending_signal(sig_num);
    }
    let info = node.info;
    kernel.signal_node_pool.release(node);
    Some(info)
}

/// Updates the calling thread's blocked mask. Returns the previous mask.
/// SIGKILL, SIGSTOP and SIGCONT can never be blocked.
pub fn kthread_sigmask(
    kernel: &mut Kernel,
    how: u32,
    new_set: Option<SigSet>,
) -> KResult<SigSet> {
    let thread = kernel.current_thread_mut();
    let old = thread.blocked_signals;
    if let Some(set) = new_set {
        let updated = match how {
            SIG_BLOCK => old | set,
            SIG_UNBLOCK => old & !set,
            SIG_SETMASK => set,
            _ => return Err(ErrorCode::InvalidArg),
        };
        thread.blocked_signals = updated & BLOCKABLE_SIGNALS_MASK;
    }
    Ok(old)
}

/// Installs a signal action on the calling thread, returning the previous
/// one. `sigaction(sig, old); sigaction(sig, old_value)` restores exactly.
pub fn ksigaction(
    kernel: &mut Kernel,
    sig_num: i32,
    new_action: Option<SigAction>,
) -> KResult<SigAction> {
    if !(1..=NSIG as i32).contains(&sig_num) {
        return Err(ErrorCode::InvalidArg);
    }
    if (sig_num == SIGKILL || sig_num == SIGSTOP) && new_action.is_some() {
        return Err(ErrorCode::InvalidArg);
    }
    let thread = kernel.current_thread_mut();
    let slot = &mut thread.signal_handlers[(sig_num - 1) as usize];
    let old = *slot;
    if let Some(action) = new_action {
        *slot = action;
    }
    Ok(old)
}

/// Stops the current thread in its tracks: state goes to Stopped and a
/// context switch is pended. The thread resumes only via a forced wake.
fn stop_current_thread(kernel: &mut Kernel) {
    kernel.current_thread_mut().state = ThreadState::Stopped;
    kernel.request_context_switch();
}

/// Builds the signal frame for one delivery and returns the new stack
/// pointer. See the module docs for the layout.
///
/// # Safety (internal)
///
/// `prev_sp` must point at a live context-switch frame on the current
/// thread's stack with room below it; on hardware that holds by
/// construction, and the tests fabricate conforming stacks.
fn add_signal_handler_frame(
    kernel: &mut Kernel,
    prev_sp: usize,
    user_mode: bool,
    action: &SigAction,
    info: &SigInfo,
) -> usize {
    // Safety: per the function contract, prev_sp points at a readable
    // KernelCtxFrame.
    let prev_ctx: KernelCtxFrame =
        unsafe { core::ptr::read(prev_sp as *const KernelCtxFrame) };
    let frame_size = ctx_frame_size(prev_ctx.exc_return);

    let signal_frame_ptr = prev_sp - core::mem::size_of::<SignalStackFrame>();
    let new_sp = signal_frame_ptr - frame_size;

    let thread = kernel.current_thread_mut();
    let saved_mask = thread
        .sigsuspend_saved_mask
        .take()
        .unwrap_or(thread.blocked_signals);

    let mut frame = SignalStackFrame {
        pre_signal_sp_and_privilege: prev_sp as u32 & !1,
        reserved: 0,
        saved_blocked_mask: saved_mask,
        siginfo: *info,
    };
    if user_mode {
        frame.pre_signal_sp_and_privilege |= 1;
    }
    // Safety: the slot just below the context frame is unused stack space.
    unsafe {
        core::ptr::write(signal_frame_ptr as *mut SignalStackFrame, frame);
    }

    thread.blocked_signals = thread.blocked_signals | action.mask;
    if !action.flags.contains(SigActionFlags::NODEFER) {
        thread.blocked_signals =
            thread.blocked_signals | sig_mkmask(info.si_signo);
    }
    thread.blocked_signals = thread.blocked_signals & BLOCKABLE_SIGNALS_MASK;
    thread.restart_wanted = action.flags.contains(SigActionFlags::RESTART);

    // Safety: copying the live frame block into the unused stack just below
    // the signal frame; the regions cannot overlap because the signal frame
    // sits between them.
    unsafe {
        core::ptr::copy_nonoverlapping(
            prev_sp as *const u8,
            new_sp as *mut u8,
            frame_size,
        );
    }

    // Patch the copy's hardware exception frame so the resume enters the
    // handler.
    let exception_ptr =
        (new_sp + core::mem::size_of::<KernelCtxFrame>()) as *mut ExceptionFrame;
    // Safety: exception_ptr points inside the block we just wrote.
    unsafe {
        let mut exception = core::ptr::read(exception_ptr);
        exception.xpsr &= XPSR_THUMB;
        exception.r0 = info.si_signo as u32;
        exception.r1 = (signal_frame_ptr
            + core::mem::offset_of!(SignalStackFrame, siginfo))
            as u32;
        exception.r2 = prev_sp as u32;
        exception.pc = action.handler as u32;
        exception.lr = kernel.app_vectors.signal_trampoline as u32;
        core::ptr::write(exception_ptr, exception);
    }
    new_sp
}

/// Delivers one signal to the current thread, given the stack pointer of its
/// interrupted context. Returns the (possibly new) stack pointer.
pub fn kprocess_signal(
    kernel: &mut Kernel,
    sig_num: i32,
    prev_sp: usize,
    user_mode: bool,
    from_fault: bool,
    ext_info: Option<&SigInfo>,
) -> usize {
    let current = kernel.current;
    let info = match ext_info {
        Some(info) => {
            kernel.current_thread_mut().clear_pending_signal(sig_num);
            let mut info = *info;
            info.si_signo = sig_num;
            info
        }
        None => match pop_queued_signal(kernel, current, sig_num) {
            Some(mut info) => {
                info.si_signo = sig_num;
                info
            }
            None => {
                kernel.current_thread_mut().clear_pending_signal(sig_num);
                SigInfo {
                    si_signo: sig_num,
                    si_code: SI_USER,
                    si_value: 0,
                    si_addr: 0,
                }
            }
        },
    };

    let action = kernel.current_thread().signal_handlers[(sig_num - 1) as usize];

    if action.handler == SIG_DFL
        || (action.handler == SIG_IGN && from_fault)
        || !sig_can_be_ignored(sig_num)
    {
        match sig_default_action(sig_num) {
            SigDefaultAction::Stop => {
                stop_current_thread(kernel);
                prev_sp
            }
            SigDefaultAction::Terminate | SigDefaultAction::TerminateCoreDump => {
                if kernel.current_thread().state == ThreadState::Stopped {
                    kernel.wakeup_thread(current, true);
                }
                let terminate = SigAction {
                    handler: kernel.app_vectors.terminate_thread,
                    mask: SigSet::EMPTY,
                    flags: SigActionFlags::empty(),
                };
                add_signal_handler_frame(kernel, prev_sp, user_mode, &terminate, &info)
            }
            SigDefaultAction::Ignore | SigDefaultAction::Continue => prev_sp,
        }
    } else if action.handler == SIG_IGN || action.handler == SIG_ERR {
        prev_sp
    } else {
        if action.flags.contains(SigActionFlags::RESETHAND)
            && sig_can_auto_reset(sig_num)
        {
            let slot = &mut kernel.current_thread_mut().signal_handlers
                [(sig_num - 1) as usize];
            slot.handler = SIG_DFL;
            slot.flags.remove(SigActionFlags::SIGINFO | SigActionFlags::RESETHAND);
        }
        if prev_sp & 0x7 != 0 {
            klog!("signal delivery on unaligned sp {:#x}", prev_sp);
        }
        add_signal_handler_frame(kernel, prev_sp, user_mode, &action, &info)
    }
}

/// The synchronous delivery point: picks at most one pending, unblocked
/// signal and delivers it. SIGKILL first, then SIGSTOP, then SIGCONT, then
/// everything else in ascending order. Returns the stack pointer to resume
/// on.
pub fn process_pending_signals(
    kernel: &mut Kernel,
    cur_sp: usize,
    user_mode: bool,
) -> usize {
    let mut pending = kernel.current_thread().unblocked_pending_signals();
    if pending.is_empty() {
        return cur_sp;
    }

    for sig_num in [SIGKILL, SIGSTOP, SIGCONT] {
        if pending.contains(sig_num) {
            pending.remove(sig_num);
            let new_sp =
                kprocess_signal(kernel, sig_num, cur_sp, user_mode, false, None);
            if new_sp != cur_sp {
                return new_sp;
            }
        }
    }
    while let Some(sig_num) = pending.first() {
        pending.remove(sig_num);
        let new_sp = kprocess_signal(kernel, sig_num, cur_sp, user_mode, false, None);
        if new_sp != cur_sp {
            return new_sp;
        }
    }
    cur_sp
}

/// The sigreturn path. `frame_sp` points at the `SignalStackFrame` the
/// delivery planted (the trampoline's own exception frame has already been
/// stripped by the supervisor-call handler). Restores privilege and blocked
/// mask, then immediately re-checks for more pending signals so handlers
/// queued during this one run before the interrupted code does.
pub fn ksigreturn(kernel: &mut Kernel, frame_sp: usize) -> usize {
    // Safety: frame_sp comes from the SVC handler, which computed it from
    // the frame this module planted.
    let frame: SignalStackFrame =
        unsafe { core::ptr::read(frame_sp as *const SignalStackFrame) };

    let user_mode = frame.pre_signal_sp_and_privilege & 1 != 0;
    crate::arch::set_thread_privilege(user_mode);
    kernel.current_thread_mut().blocked_signals =
        frame.saved_blocked_mask & BLOCKABLE_SIGNALS_MASK;

    let pre_sp = (frame.pre_signal_sp_and_privilege & !1) as usize;
    process_pending_signals(kernel, pre_sp, user_mode)
}

//
// Syscall-level wrappers.
//

pub fn kthread_kill(kr: KernelRef, target: ThreadId, sig_num: i32) -> KResult<()> {
    kr.crit(|k| ksend_signal_to_thread(k, target, sig_num))
}

pub fn kthread_sigqueue(
    kr: KernelRef,
    target: ThreadId,
    sig_num: i32,
    value: u32,
) -> KResult<()> {
    kr.crit(|k| kqueue_signal_to_thread(k, target, sig_num, value))
}

pub fn kraise(kr: KernelRef, sig_num: i32) -> KResult<()> {
    kr.crit(|k| {
        let current = k.current;
        ksend_signal_to_thread(k, current, sig_num)
    })
}

/// Swaps in `mask`, parks until a signal is pending and unblocked, and
/// always reports `Interrupted`. The original mask is restored by the
/// delivery path (so the handler's frame carries it) once the woken signal
/// is handled.
pub fn ksigsuspend(kr: KernelRef, mask: SigSet) -> KResult<()> {
    kr.crit(|k| {
        let thread = k.current_thread_mut();
        thread.sigsuspend_saved_mask = Some(thread.blocked_signals);
        thread.blocked_signals = mask & BLOCKABLE_SIGNALS_MASK;
    });
    loop {
        let ready = kr.crit(|k| {
            if k.current_thread().has_unblocked_pending_signals() {
                return true;
            }
            k.current_thread_mut().state = ThreadState::Waiting;
            k.request_context_switch();
            false
        });
        if ready {
            return Err(ErrorCode::Interrupted);
        }
        kr.switch_point();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::thread::spawn_parked;
    use abi::{Handle, SIGALRM, SIGBUS, SIGRTMAX, SIGTERM, SIGUSR1, SIGUSR2};

    fn kern_with_peer() -> (Kernel, ThreadId) {
        let mut kern = Kernel::new_for_test();
        let peer = spawn_parked(&mut kern, "peer", 0);
        (kern, peer)
    }

    #[test]
    fn signal_zero_probes_without_effect() {
        let (mut kern, peer) = kern_with_peer();
        assert_eq!(ksend_signal_to_thread(&mut kern, peer, 0), Ok(()));
        assert!(kern.thread(peer).unwrap().pending_signals.is_empty());
        assert_eq!(
            ksend_signal_to_thread(&mut kern, Handle(999), 0),
            Err(ErrorCode::NoSuchProcess)
        );
    }

    #[test]
    fn kill_sets_pending_and_wakes() {
        let (mut kern, peer) = kern_with_peer();
        ksend_signal_to_thread(&mut kern, peer, SIGTERM).unwrap();
        assert!(kern.thread(peer).unwrap().pending_signals.contains(SIGTERM));
        assert_eq!(kern.thread(peer).unwrap().state, ThreadState::Ready);
    }

    #[test]
    fn blocked_signal_stays_pending_without_wake() {
        let (mut kern, peer) = kern_with_peer();
        kern.thread_mut(peer).unwrap().blocked_signals = sig_mkmask(SIGTERM);
        ksend_signal_to_thread(&mut kern, peer, SIGTERM).unwrap();
        assert!(kern.thread(peer).unwrap().pending_signals.contains(SIGTERM));
        assert_eq!(kern.thread(peer).unwrap().state, ThreadState::Waiting);
    }

    #[test]
    fn sigkill_force_wakes_stopped_thread() {
        let (mut kern, peer) = kern_with_peer();
        kern.thread_mut(peer).unwrap().state = ThreadState::Stopped;
        ksend_signal_to_thread(&mut kern, peer, SIGTERM).unwrap();
        assert_eq!(kern.thread(peer).unwrap().state, ThreadState::Stopped);
        ksend_signal_to_thread(&mut kern, peer, SIGKILL).unwrap();
        assert_eq!(kern.thread(peer).unwrap().state, ThreadState::Ready);
    }

    #[test]
    fn classic_signals_coalesce_newest_wins() {
        let (mut kern, peer) = kern_with_peer();
        kqueue_signal_to_thread(&mut kern, peer, SIGUSR1, 1).unwrap();
        kqueue_signal_to_thread(&mut kern, peer, SIGUSR1, 2).unwrap();
        let queue = &kern.thread(peer).unwrap().queued_signals;
        assert_eq!(queue.len(), 1);
        assert_eq!(queue[0].info.si_value, 2);
    }

    #[test]
    fn realtime_signals_accumulate_in_order() {
        let (mut kern, peer) = kern_with_peer();
        kqueue_signal_to_thread(&mut kern, peer, SIGRTMIN, 1).unwrap();
        kqueue_signal_to_thread(&mut kern, peer, SIGRTMIN, 2).unwrap();
        kqueue_signal_to_thread(&mut kern, peer, SIGRTMIN + 1, 3).unwrap();
        let values: Vec<u32> = kern
            .thread(peer)
            .unwrap()
            .queued_signals
            .iter()
            .map(|n| n.info.si_value)
            .collect();
        assert_eq!(values, [1, 2, 3]);
    }

    #[test]
    fn queue_exhaustion_degrades_classic_fails_realtime() {
        let (mut kern, peer) = kern_with_peer();
        let mut used = 0;
        while kern.signal_node_pool.alloc().is_some() {
            used += 1;
        }
        assert!(used > 0);
        assert_eq!(
            kqueue_signal_to_thread(&mut kern, peer, SIGRTMAX, 5),
            Err(ErrorCode::NoMemory)
        );
        assert_eq!(kqueue_signal_to_thread(&mut kern, peer, SIGUSR2, 5), Ok(()));
        assert!(kern.thread(peer).unwrap().pending_signals.contains(SIGUSR2));
        assert!(kern.thread(peer).unwrap().queued_signals.is_empty());
    }

    #[test]
    fn sigmask_cannot_block_the_unblockable() {
        let mut kern = Kernel::new_for_test();
        let old = kthread_sigmask(&mut kern, SIG_BLOCK, Some(SigSet::FILLED)).unwrap();
        assert!(old.is_empty());
        let mask = kern.current_thread().blocked_signals;
        assert!(!mask.contains(SIGKILL));
        assert!(!mask.contains(SIGSTOP));
        assert!(!mask.contains(SIGCONT));
        assert!(mask.contains(SIGTERM));
        // SETMASK back to the old value restores exactly.
        kthread_sigmask(&mut kern, SIG_SETMASK, Some(old)).unwrap();
        assert!(kern.current_thread().blocked_signals.is_empty());
    }

    #[test]
    fn sigaction_round_trips() {
        let mut kern = Kernel::new_for_test();
        let new = SigAction {
            handler: 0x1001,
            mask: sig_mkmask(SIGUSR1),
            flags: SigActionFlags::RESTART,
        };
        let old = ksigaction(&mut kern, SIGALRM, Some(new)).unwrap();
        assert_eq!(old.handler, SIG_DFL);
        let prev = ksigaction(&mut kern, SIGALRM, Some(old)).unwrap();
        assert_eq!(prev.handler, 0x1001);
        assert_eq!(prev.flags, SigActionFlags::RESTART);
        assert_eq!(
            kern.current_thread().signal_handlers[(SIGALRM - 1) as usize].handler,
            SIG_DFL
        );
    }

    #[test]
    fn sigaction_rejects_kill_and_stop() {
        let mut kern = Kernel::new_for_test();
        let action = SigAction::default();
        assert_eq!(
            ksigaction(&mut kern, SIGKILL, Some(action)),
            Err(ErrorCode::InvalidArg)
        );
        assert_eq!(
            ksigaction(&mut kern, SIGSTOP, Some(action)),
            Err(ErrorCode::InvalidArg)
        );
        // Querying them is fine.
        assert!(ksigaction(&mut kern, SIGKILL, None).is_ok());
    }

    //
    // Frame-injection tests run against a fabricated user stack.
    //

    const STACK_WORDS: usize = 256;

    /// Builds a stack holding one context-switch frame at the top and
    /// returns (storage, sp).
    fn fabricate_stack(pc: u32, xpsr: u32) -> (Box<[u64; STACK_WORDS]>, usize) {
        let storage = Box::new([0u64; STACK_WORDS]);
        let top = storage.as_ptr() as usize + STACK_WORDS * 8;
        let sp = top
            - core::mem::size_of::<KernelCtxFrame>()
            - core::mem::size_of::<ExceptionFrame>();
        let ctx = KernelCtxFrame {
            exc_return: 0xFFFF_FFED, // thread mode, PSP, no FPU frame
            ..Default::default()
        };
        let exception = ExceptionFrame {
            pc,
            xpsr,
            ..Default::default()
        };
        unsafe {
            core::ptr::write(sp as *mut KernelCtxFrame, ctx);
            core::ptr::write(
                (sp + core::mem::size_of::<KernelCtxFrame>()) as *mut ExceptionFrame,
                exception,
            );
        }
        (storage, sp)
    }

    fn read_frames(sp: usize) -> (KernelCtxFrame, ExceptionFrame) {
        unsafe {
            (
                core::ptr::read(sp as *const KernelCtxFrame),
                core::ptr::read(
                    (sp + core::mem::size_of::<KernelCtxFrame>())
                        as *const ExceptionFrame,
                ),
            )
        }
    }

    const HANDLER: usize = 0x0800_1001;
    const TRAMPOLINE: usize = 0x0800_2001;

    fn install_handler(kern: &mut Kernel, sig: i32, flags: SigActionFlags) {
        kern.app_vectors.signal_trampoline = TRAMPOLINE;
        kern.app_vectors.terminate_thread = 0x0800_3001;
        ksigaction(
            kern,
            sig,
            Some(SigAction {
                handler: HANDLER,
                mask: sig_mkmask(SIGUSR2),
                flags,
            }),
        )
        .unwrap();
    }

    #[test]
    fn delivery_builds_handler_frame() {
        let mut kern = Kernel::new_for_test();
        install_handler(&mut kern, SIGUSR1, SigActionFlags::empty());
        let me = kern.current;
        ksend_signal_to_thread(&mut kern, me, SIGUSR1).unwrap();

        let (_stack, sp) = fabricate_stack(0x0800_4000, XPSR_THUMB | 0xff);
        let new_sp = process_pending_signals(&mut kern, sp, true);
        assert_ne!(new_sp, sp);

        let (ctx, exception) = read_frames(new_sp);
        assert_eq!(ctx.exc_return, 0xFFFF_FFED);
        assert_eq!(exception.pc, HANDLER as u32);
        assert_eq!(exception.lr, TRAMPOLINE as u32);
        assert_eq!(exception.r0, SIGUSR1 as u32);
        assert_eq!(exception.r2, sp as u32);
        // Handler runs with only the thumb bit in xPSR.
        assert_eq!(exception.xpsr, XPSR_THUMB);

        // The signal frame sits between the copy and the original.
        let frame: SignalStackFrame = unsafe {
            core::ptr::read((new_sp + ctx_frame_size(0xFFFF_FFED)) as *const _)
        };
        assert_eq!(frame.pre_signal_sp_and_privilege, sp as u32 | 1);
        assert_eq!(frame.siginfo.si_signo, SIGUSR1);
        assert_eq!(frame.siginfo.si_code, SI_USER);
        // Delivered signal plus the action mask are now blocked.
        let blocked = kern.current_thread().blocked_signals;
        assert!(blocked.contains(SIGUSR1));
        assert!(blocked.contains(SIGUSR2));
        // Pending bit consumed.
        assert!(!kern.current_thread().pending_signals.contains(SIGUSR1));
    }

    #[test]
    fn sigreturn_restores_mask_and_resumes_interrupted_context() {
        let mut kern = Kernel::new_for_test();
        install_handler(&mut kern, SIGUSR1, SigActionFlags::empty());
        let me = kern.current;
        ksend_signal_to_thread(&mut kern, me, SIGUSR1).unwrap();

        let (_stack, sp) = fabricate_stack(0x0800_4000, XPSR_THUMB);
        let pre_mask = kern.current_thread().blocked_signals;
        let new_sp = process_pending_signals(&mut kern, sp, true);

        let frame_sp = new_sp + ctx_frame_size(0xFFFF_FFED);
        let resumed_sp = ksigreturn(&mut kern, frame_sp);
        assert_eq!(resumed_sp, sp);
        assert_eq!(kern.current_thread().blocked_signals, pre_mask);
    }

    #[test]
    fn sigreturn_delivers_next_pending_signal_first() {
        let mut kern = Kernel::new_for_test();
        install_handler(&mut kern, SIGUSR1, SigActionFlags::empty());
        install_handler(&mut kern, SIGUSR2, SigActionFlags::empty());
        // Reinstall SIGUSR2 without the blocking mask quirk.
        ksigaction(
            &mut kern,
            SIGUSR2,
            Some(SigAction {
                handler: HANDLER,
                mask: SigSet::EMPTY,
                flags: SigActionFlags::empty(),
            }),
        )
        .unwrap();
        let me = kern.current;
        ksend_signal_to_thread(&mut kern, me, SIGUSR1).unwrap();

        let (_stack, sp) = fabricate_stack(0x0800_4000, XPSR_THUMB);
        let first_sp = process_pending_signals(&mut kern, sp, true);

        // A second signal arrives while the handler runs. The first action's
        // mask blocks SIGUSR2, so it stays pending until sigreturn restores
        // the pre-handler mask, at which point it must get its own frame
        // before the interrupted code resumes.
        ksend_signal_to_thread(&mut kern, me, SIGUSR2).unwrap();

        let frame_sp = first_sp + ctx_frame_size(0xFFFF_FFED);
        let second_sp = ksigreturn(&mut kern, frame_sp);
        // Not back to the original: a new handler frame for SIGUSR2.
        assert_ne!(second_sp, sp);
        let (_, exception) = read_frames(second_sp);
        assert_eq!(exception.r0, SIGUSR2 as u32);

        // Returning from the nested frame lands back on the original.
        let nested_frame = second_sp + ctx_frame_size(0xFFFF_FFED);
        let final_sp = ksigreturn(&mut kern, nested_frame);
        assert_eq!(final_sp, sp);
    }

    #[test]
    fn one_signal_per_boundary_visit() {
        let mut kern = Kernel::new_for_test();
        install_handler(&mut kern, SIGUSR1, SigActionFlags::empty());
        install_handler(&mut kern, SIGTERM, SigActionFlags::empty());
        let me = kern.current;
        ksend_signal_to_thread(&mut kern, me, SIGUSR1).unwrap();
        ksend_signal_to_thread(&mut kern, me, SIGTERM).unwrap();

        let (_stack, sp) = fabricate_stack(0x0800_4000, XPSR_THUMB);
        let new_sp = process_pending_signals(&mut kern, sp, true);
        // Ascending order: SIGUSR1 is 30, SIGTERM is 15, so SIGTERM first.
        let (_, exception) = read_frames(new_sp);
        assert_eq!(exception.r0, SIGTERM as u32);
        // The other one is still pending for the next visit.
        assert!(kern.current_thread().pending_signals.contains(SIGUSR1));
    }

    #[test]
    fn kill_stop_cont_deliver_before_others() {
        let mut kern = Kernel::new_for_test();
        install_handler(&mut kern, SIGUSR1, SigActionFlags::empty());
        let me = kern.current;
        ksend_signal_to_thread(&mut kern, me, SIGUSR1).unwrap();
        kern.current_thread_mut().set_pending_signal(SIGSTOP);

        let (_stack, sp) = fabricate_stack(0x0800_4000, XPSR_THUMB);
        let new_sp = process_pending_signals(&mut kern, sp, true);
        // SIGSTOP's default action stops the thread without a frame; the
        // remaining SIGUSR1 then gets its frame in the same visit (the stop
        // takes effect at the context switch).
        assert_eq!(kern.thread(me).unwrap().state, ThreadState::Stopped);
        assert!(!kern.thread(me).unwrap().pending_signals.contains(SIGSTOP));
        let (_, exception) = read_frames(new_sp);
        assert_eq!(exception.r0, SIGUSR1 as u32);
    }

    #[test]
    fn default_terminate_injects_terminate_frame() {
        let mut kern = Kernel::new_for_test();
        kern.app_vectors.terminate_thread = 0x0800_3001;
        kern.app_vectors.signal_trampoline = TRAMPOLINE;
        let me = kern.current;
        ksend_signal_to_thread(&mut kern, me, SIGTERM).unwrap();

        let (_stack, sp) = fabricate_stack(0x0800_4000, XPSR_THUMB);
        let new_sp = process_pending_signals(&mut kern, sp, true);
        assert_ne!(new_sp, sp);
        let (_, exception) = read_frames(new_sp);
        assert_eq!(exception.pc, 0x0800_3001);
    }

    #[test]
    fn ignored_signal_leaves_stack_alone() {
        let mut kern = Kernel::new_for_test();
        ksigaction(
            &mut kern,
            SIGUSR1,
            Some(SigAction {
                handler: SIG_IGN,
                mask: SigSet::EMPTY,
                flags: SigActionFlags::empty(),
            }),
        )
        .unwrap();
        let me = kern.current;
        ksend_signal_to_thread(&mut kern, me, SIGUSR1).unwrap();
        let (_stack, sp) = fabricate_stack(0x0800_4000, XPSR_THUMB);
        assert_eq!(process_pending_signals(&mut kern, sp, true), sp);
        assert!(!kern.current_thread().pending_signals.contains(SIGUSR1));
    }

    #[test]
    fn fault_delivery_overrides_sig_ign() {
        let mut kern = Kernel::new_for_test();
        kern.app_vectors.terminate_thread = 0x0800_3001;
        kern.app_vectors.signal_trampoline = TRAMPOLINE;
        ksigaction(
            &mut kern,
            SIGBUS,
            Some(SigAction {
                handler: SIG_IGN,
                mask: SigSet::EMPTY,
                flags: SigActionFlags::empty(),
            }),
        )
        .unwrap();
        let info = SigInfo {
            si_signo: SIGBUS,
            si_code: abi::BUS_ADRERR,
            si_value: 0,
            si_addr: 0,
        };
        let (_stack, sp) = fabricate_stack(0x0800_4000, XPSR_THUMB);
        kern.current_thread_mut().set_pending_signal(SIGBUS);
        let new_sp = kprocess_signal(&mut kern, SIGBUS, sp, true, true, Some(&info));
        // Ignoring a synchronous fault is not allowed: terminate frame.
        assert_ne!(new_sp, sp);
        let (_, exception) = read_frames(new_sp);
        assert_eq!(exception.pc, 0x0800_3001);
    }

    #[test]
    fn resethand_resets_to_default_on_delivery() {
        let mut kern = Kernel::new_for_test();
        install_handler(&mut kern, SIGUSR1, SigActionFlags::RESETHAND);
        let me = kern.current;
        ksend_signal_to_thread(&mut kern, me, SIGUSR1).unwrap();
        let (_stack, sp) = fabricate_stack(0x0800_4000, XPSR_THUMB);
        process_pending_signals(&mut kern, sp, true);
        assert_eq!(
            kern.current_thread().signal_handlers[(SIGUSR1 - 1) as usize].handler,
            SIG_DFL
        );
    }

    #[test]
    fn realtime_delivery_order_matches_enqueue_order() {
        let mut kern = Kernel::new_for_test();
        install_handler(&mut kern, SIGRTMIN, SigActionFlags::NODEFER);
        install_handler(&mut kern, SIGRTMIN + 1, SigActionFlags::NODEFER);
        // Clear the action masks so deliveries don't block each other.
        for sig in [SIGRTMIN, SIGRTMIN + 1] {
            ksigaction(
                &mut kern,
                sig,
                Some(SigAction {
                    handler: HANDLER,
                    mask: SigSet::EMPTY,
                    flags: SigActionFlags::NODEFER,
                }),
            )
            .unwrap();
        }
        let me = kern.current;
        kqueue_signal_to_thread(&mut kern, me, SIGRTMIN, 11).unwrap();
        kqueue_signal_to_thread(&mut kern, me, SIGRTMIN, 22).unwrap();
        kqueue_signal_to_thread(&mut kern, me, SIGRTMIN + 1, 33).unwrap();

        let mut delivered = Vec::new();
        let (_stack, mut sp) = fabricate_stack(0x0800_4000, XPSR_THUMB);
        for _ in 0..3 {
            let new_sp = process_pending_signals(&mut kern, sp, true);
            assert_ne!(new_sp, sp, "expected another delivery");
            let frame: SignalStackFrame = unsafe {
                core::ptr::read((new_sp + ctx_frame_size(0xFFFF_FFED)) as *const _)
            };
            delivered.push(frame.siginfo.si_value);
            sp = new_sp;
        }
        assert_eq!(delivered, [11, 22, 33]);
    }

    #[test]
    fn sigsuspend_parks_until_signal() {
        let mut kern = Kernel::new_for_test();
        let kr = kern.test_ref();
        let me = kern.current;
        kr.crit(|k| {
            k.current_thread_mut().blocked_signals = sig_mkmask(SIGUSR1);
        });
        kr.sim_enqueue(move |kr| {
            kr.crit(|k| ksend_signal_to_thread(k, me, SIGUSR1).unwrap());
        });
        // Suspend with SIGUSR1 unblocked; the queued event delivers it.
        assert_eq!(
            ksigsuspend(kr, SigSet::EMPTY),
            Err(ErrorCode::Interrupted)
        );
        // The saved mask is parked in the TCB for the delivery path.
        assert_eq!(
            kern.current_thread().sigsuspend_saved_mask,
            Some(sig_mkmask(SIGUSR1))
        );
    }
}
