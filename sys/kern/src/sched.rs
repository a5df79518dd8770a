// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The scheduler and the kernel state root.
//!
//! All kernel state lives in one [`Kernel`] value: both handle registries,
//! the per-priority ready queues, the sleep list, the zombie list, and the
//! clock offsets. It is constructed once at boot and reached through a
//! [`KernelRef`], a copyable pointer whose `crit` method grants scoped
//! `&mut` access inside an interrupt-disabled critical section. Kernel code
//! never holds `&mut Kernel` across a context switch; every blocking
//! primitive is a loop of short critical sections around an explicit
//! [`KernelRef::switch_point`].
//!
//! Scheduling is strict priority with round-robin inside a level. Ready
//! queues are indexed by *level*, where level 0 is the most urgent, so the
//! scheduler picks the lowest non-empty level. The preemption tick charges
//! run time to the current thread, wakes expired sleepers, and requests a
//! context switch on any of: a more urgent thread became runnable, the
//! current level has other runnable threads (time-slice boundary), or the
//! current thread is no longer runnable.

use abi::{
    ErrorCode, Handle, HandleType, KResult, ThreadId, ThreadState,
    PRIORITY_LEVELS,
};
use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::handle::HandleTable;
use crate::kobject::{KObject, Listener};
use crate::list::{SleepList, WaitQueue};
use crate::thread::{priority_level, Thread};
use crate::time::{TimeValNanos, TICK_PERIOD_NANOS};

/// Entry points into user-mode code that the kernel needs to know about:
/// where a signal handler returns to, and where a terminated thread is sent.
/// Registered once at startup by the user runtime.
#[derive(Copy, Clone, Debug, Default)]
pub struct AppVectors {
    pub signal_trampoline: usize,
    pub terminate_thread: usize,
}

/// Host-side simulation state; see the `sim_*` methods. On the ARM target
/// none of this exists -- context switches are PendSV's problem.
#[cfg(not(target_arch = "arm"))]
pub struct SimState {
    pub now_ms: u64,
    pub switch_requested: bool,
    events: VecDeque<alloc::boxed::Box<dyn FnOnce(KernelRef)>>,
}

#[cfg(not(target_arch = "arm"))]
impl SimState {
    fn new() -> Self {
        Self {
            now_ms: 0,
            switch_requested: false,
            events: VecDeque::new(),
        }
    }
}

pub struct Kernel {
    pub threads: HandleTable<Thread>,
    pub objects: HandleTable<Arc<KObject>>,
    ready: [VecDeque<ThreadId>; PRIORITY_LEVELS],
    pub sleep: SleepList,
    zombies: VecDeque<ThreadId>,
    /// Where the init thread parks between zombie batches.
    reaper_queue: WaitQueue,
    pub current: ThreadId,
    pub idle: ThreadId,
    pub init: ThreadId,
    pub real_time_offset: TimeValNanos,
    pub app_vectors: AppVectors,
    /// Thread the idle loop force-wakes while a debugger is attached; see
    /// the idle thread in `startup`.
    pub debug_wakeup_thread: ThreadId,
    pub message_cache: crate::sync::port::MessageCache,
    pub signal_node_pool: crate::signal::SignalNodePool,
    /// Memory ranges unprivileged code may hand to syscalls; installed at
    /// boot.
    pub user_regions: heapless::Vec<crate::umem::UserRegion, 4>,
    #[cfg(not(target_arch = "arm"))]
    pub sim: SimState,
}

impl Kernel {
    /// Builds a kernel with its idle and init threads installed. The idle
    /// thread takes handle 0 and starts as the running thread; init takes
    /// handle 1 and is ready. `startup` fills in their stacks and machine
    /// context before the first real context switch.
    pub fn new(idle_stack_size: usize, init_stack_size: usize) -> Self {
        let mut threads = HandleTable::new();

        let idle = Thread::new(
            "idle",
            abi::THREAD_PRIORITY_MIN,
            abi::ThreadDetachState::Detached,
            idle_stack_size,
        );
        let init = Thread::new(
            "init",
            0,
            abi::ThreadDetachState::Detached,
            init_stack_size,
        );

        let idle_id = threads.insert(idle).expect("idle thread allocation");
        let init_id = threads.insert(init).expect("init thread allocation");
        uassert!(idle_id == Handle(0));
        uassert!(init_id == Handle(1));

        threads.get_mut(idle_id).unwrap().state = ThreadState::Running;
        threads.get_mut(init_id).unwrap().state = ThreadState::Ready;

        let mut kernel = Self {
            threads,
            objects: HandleTable::new(),
            ready: core::array::from_fn(|_| VecDeque::new()),
            sleep: SleepList::new(),
            zombies: VecDeque::new(),
            reaper_queue: WaitQueue::new(),
            current: idle_id,
            idle: idle_id,
            init: init_id,
            real_time_offset: TimeValNanos::ZERO,
            app_vectors: AppVectors::default(),
            debug_wakeup_thread: Handle::INVALID,
            message_cache: crate::sync::port::MessageCache::new(),
            signal_node_pool: crate::signal::SignalNodePool::new(),
            user_regions: heapless::Vec::new(),
            #[cfg(not(target_arch = "arm"))]
            sim: SimState::new(),
        };
        let level = kernel.thread_level(init_id);
        kernel.ready[level].push_back(init_id);
        kernel
    }

    pub fn thread(&self, id: ThreadId) -> Option<&Thread> {
        self.threads.get(id)
    }

    pub fn thread_mut(&mut self, id: ThreadId) -> Option<&mut Thread> {
        self.threads.get_mut(id)
    }

    pub fn current_thread(&self) -> &Thread {
        self.thread(self.current).expect("current thread missing")
    }

    pub fn current_thread_mut(&mut self) -> &mut Thread {
        let id = self.current;
        self.thread_mut(id).expect("current thread missing")
    }

    fn thread_level(&self, id: ThreadId) -> usize {
        self.thread(id)
            .map(|t| priority_level(t.priority))
            .unwrap_or(PRIORITY_LEVELS - 1)
    }

    /// Moves a parked thread to the ready queue for its priority level.
    /// Returns true if the woken thread is strictly more urgent than the
    /// current one, i.e. the caller should request a context switch.
    pub fn make_ready(&mut self, id: ThreadId) -> bool {
        let Some(thread) = self.thread_mut(id) else {
            return false;
        };
        match thread.state {
            ThreadState::Waiting | ThreadState::Sleeping | ThreadState::Stopped => {}
            _ => return false,
        }
        thread.state = ThreadState::Ready;
        self.sleep.remove(id);
        let level = self.thread_level(id);
        self.ready[level].push_back(id);
        level < self.thread_level(self.current)
    }

    /// Wakes a specific thread out of whatever it is blocked on. `Stopped`
    /// threads only resume when `force` is set (SIGCONT, SIGKILL, debugger).
    /// The thread stays on any wait queue it occupies; it detaches itself
    /// when it next runs, which is how it learns the wake was not a real
    /// handoff.
    pub fn wakeup_thread(&mut self, id: ThreadId, force: bool) {
        let Some(thread) = self.thread(id) else {
            return;
        };
        if thread.state == ThreadState::Stopped && !force {
            return;
        }
        if self.make_ready(id) {
            self.request_context_switch();
        }
    }

    /// Dequeues up to `count` threads (0 = all) from a wait queue in FIFO
    /// order and makes them ready. Returns whether a context switch should
    /// be requested.
    pub fn wakeup_wait_queue(&mut self, queue: &mut WaitQueue, count: usize) -> bool {
        let mut need_switch = false;
        for id in queue.take_waiters(count) {
            need_switch |= self.make_ready(id);
        }
        need_switch
    }

    /// Fires wait-group listeners: records which slot became ready in each
    /// listening thread and wakes it.
    pub fn fire_listeners(&mut self, listeners: &mut Vec<Listener>) {
        for listener in listeners.drain(..) {
            if let Some(thread) = self.thread_mut(listener.thread) {
                thread.wg_fired |= 1u64 << listener.slot;
            }
            self.wakeup_thread(listener.thread, false);
        }
    }

    /// Requests a deferred context switch. On ARM this pends PendSV; the
    /// switch happens when the current critical section ends.
    pub fn request_context_switch(&mut self) {
        #[cfg(target_arch = "arm")]
        crate::arch::pend_context_switch();
        #[cfg(not(target_arch = "arm"))]
        {
            self.sim.switch_requested = true;
        }
    }

    /// Picks the next thread to run: lowest non-empty ready level, with the
    /// outgoing thread re-queued at the back of its level if it is still
    /// runnable. Called from the PendSV handler on ARM and from the
    /// simulated switch on the host.
    pub fn reschedule(&mut self) -> ThreadId {
        let outgoing = self.current;
        if let Some(thread) = self.thread_mut(outgoing) {
            if thread.state == ThreadState::Running {
                thread.state = ThreadState::Ready;
                let level = self.thread_level(outgoing);
                self.ready[level].push_back(outgoing);
            }
        }
        let next = self
            .ready
            .iter_mut()
            .find_map(|q| q.pop_front())
            .expect("no runnable threads, not even idle");
        self.thread_mut(next).unwrap().state = ThreadState::Running;
        self.current = next;
        next
    }

    /// The preemption tick. Charges one tick of run time to the current
    /// thread, wakes expired sleepers, and requests a context switch when
    /// the scheduling decision may have changed.
    pub fn tick(&mut self) {
        let now = self.monotonic_time();
        let current = self.current;
        if let Some(thread) = self.thread_mut(current) {
            thread.run_time += TimeValNanos::from_nanos(TICK_PERIOD_NANOS);
        }

        let mut need_switch = false;
        for id in self.sleep.take_expired(now) {
            need_switch |= self.make_ready(id);
        }

        let level = self.thread_level(current);
        if !self.ready[level].is_empty() {
            // Time-slice boundary: rotate within the level.
            need_switch = true;
        }
        if self
            .thread(current)
            .map(|t| t.state != ThreadState::Running)
            .unwrap_or(true)
        {
            need_switch = true;
        }
        if need_switch {
            self.request_context_switch();
        }
    }

    //
    // Zombie handling.
    //

    /// Links an exited detached thread onto the zombie list and wakes the
    /// init thread to reap it.
    pub fn add_zombie(&mut self, id: ThreadId) {
        self.zombies.push_back(id);
        let mut queue = core::mem::take(&mut self.reaper_queue);
        let need_switch = self.wakeup_wait_queue(&mut queue, 0);
        self.reaper_queue = queue;
        if need_switch {
            self.request_context_switch();
        }
    }

    /// Detaches the zombie list for the reaper to process.
    pub fn take_zombies(&mut self) -> VecDeque<ThreadId> {
        core::mem::take(&mut self.zombies)
    }

    pub fn has_zombies(&self) -> bool {
        !self.zombies.is_empty()
    }

    /// Parks the calling thread (the init thread) until the next zombie
    /// arrives. Must be followed by a switch point.
    pub fn park_reaper(&mut self) {
        let current = self.current;
        self.current_thread_mut().state = ThreadState::Waiting;
        self.reaper_queue.append(current);
        self.request_context_switch();
    }

    //
    // Named-object registry.
    //

    pub fn register_object(&mut self, object: KObject) -> KResult<Handle> {
        self.objects.insert(Arc::new(object))
    }

    pub fn object(&self, handle: Handle) -> KResult<Arc<KObject>> {
        self.objects.get(handle).cloned().ok_or(ErrorCode::InvalidArg)
    }

    pub fn object_typed(
        &self,
        handle: Handle,
        type_tag: HandleType,
    ) -> KResult<Arc<KObject>> {
        let object = self.object(handle)?;
        if object.type_tag() != type_tag {
            return Err(ErrorCode::InvalidArg);
        }
        Ok(object)
    }

    /// Installs a second handle referencing the same object.
    pub fn duplicate_object(&mut self, handle: Handle) -> KResult<Handle> {
        let object = self.object(handle)?;
        self.objects.insert(object)
    }

    /// Removes a handle from the registry. If this was the registry's last
    /// reference to the object, any threads still parked on it are woken
    /// with their target-deleted flag set; they will report `InvalidArg`.
    pub fn free_object(&mut self, handle: Handle, expected: HandleType) -> KResult<()> {
        {
            let object = self.object(handle)?;
            if object.type_tag() != expected {
                return Err(ErrorCode::InvalidArg);
            }
        }
        let object = self.objects.free(handle).ok_or(ErrorCode::InvalidArg)?;

        let still_registered = self
            .objects
            .get_next(Handle::INVALID, |other| Arc::ptr_eq(other, &object))
            .is_some();
        if !still_registered {
            let waiters = object.body.lock().drain_waiters();
            for id in waiters {
                if let Some(thread) = self.thread_mut(id) {
                    thread.wait_target_deleted = true;
                }
                self.wakeup_thread(id, false);
            }
        }
        Ok(())
    }

    fn arch_now_ticks_impl(&self) -> u64 {
        #[cfg(target_arch = "arm")]
        {
            crate::arch::now_ticks()
        }
        #[cfg(not(target_arch = "arm"))]
        {
            self.sim.now_ms
        }
    }

    pub(crate) fn arch_now_ticks(&self) -> u64 {
        self.arch_now_ticks_impl()
    }

    pub(crate) fn arch_now_hires_nanos(&self) -> i64 {
        #[cfg(target_arch = "arm")]
        {
            crate::arch::now_hires_nanos()
        }
        #[cfg(not(target_arch = "arm"))]
        {
            self.sim.now_ms as i64 * 1_000_000
        }
    }
}

//
// Host-side simulation support. Tests use these to play the role of the
// other threads: `sim_enqueue` queues an action that runs the next time the
// calling thread blocks, and `run_as` runs an action in the context of
// another thread.
//

#[cfg(not(target_arch = "arm"))]
impl Kernel {
    /// Builds a kernel for host tests: idle + init threads, init current,
    /// and the whole address space marked user-accessible.
    pub fn new_for_test() -> Self {
        let mut kernel = Self::new(256, 4096);
        let _ = kernel.user_regions.push(crate::umem::UserRegion {
            base: 0,
            size: usize::MAX,
            writable: true,
        });
        // Run tests as the init thread; idle goes back to being a regular
        // ready thread at the bottom level.
        let init = kernel.init;
        let idle = kernel.idle;
        let level = kernel.thread_level(init);
        kernel.ready[level].retain(|&t| t != init);
        kernel.thread_mut(init).unwrap().state = ThreadState::Running;
        kernel.current = init;
        kernel.thread_mut(idle).unwrap().state = ThreadState::Ready;
        let idle_level = kernel.thread_level(idle);
        kernel.ready[idle_level].push_back(idle);
        kernel
    }

    /// Produces a `KernelRef` for a kernel that the caller promises not to
    /// move for the duration of the test.
    pub fn test_ref(&mut self) -> KernelRef {
        unsafe { KernelRef::new(self as *mut Self) }
    }

    pub fn sim_set_now_ms(&mut self, ms: u64) {
        self.sim.now_ms = ms;
    }

    /// Advances simulated time one tick at a time, running the tick handler
    /// for each, exactly like the hardware timer would.
    pub fn sim_advance_ms(&mut self, ms: u64) {
        for _ in 0..ms {
            self.sim.now_ms += 1;
            self.tick();
        }
    }

    /// Removes the (ready) current thread from its ready queue and marks it
    /// running again, completing a simulated switch back.
    fn sim_resume_current(&mut self) {
        let current = self.current;
        let level = self.thread_level(current);
        self.ready[level].retain(|&t| t != current);
        self.thread_mut(current).unwrap().state = ThreadState::Running;
        self.sim.switch_requested = false;
    }
}

/// Copyable reference to the kernel.
///
/// `crit` is the kernel critical section: interrupts disabled on ARM, plain
/// scoped access on the host. The pointer is only dereferenced inside
/// `crit`, never across a switch point, which keeps exclusive access
/// honest: on a single CPU with interrupts off, exactly one critical
/// section is live at a time.
#[derive(Copy, Clone)]
pub struct KernelRef {
    kernel: *mut Kernel,
}

impl KernelRef {
    /// # Safety
    ///
    /// `kernel` must point to a `Kernel` that outlives every use of the
    /// returned reference and is never moved while it is in use.
    pub unsafe fn new(kernel: *mut Kernel) -> Self {
        Self { kernel }
    }

    /// Runs `f` with exclusive access to the kernel, interrupts disabled.
    pub fn crit<R>(self, f: impl FnOnce(&mut Kernel) -> R) -> R {
        let saved = crate::arch::disable_interrupts();
        // Safety: see `new`; single CPU, interrupts off, no other critical
        // section can be live.
        let result = f(unsafe { &mut *self.kernel });
        crate::arch::restore_interrupts(saved);
        result
    }

    /// The moment a blocked thread actually stops running.
    ///
    /// On ARM this is a no-op: the blocking primitive already pended PendSV
    /// inside its critical section, and the switch fires the instant that
    /// section re-enables interrupts. On the host it drives the simulation:
    /// queued events run, each acting as some other thread, until the
    /// calling thread is runnable again.
    #[cfg(target_arch = "arm")]
    pub fn switch_point(self) {
        // The pended PendSV has already run by the time we get here.
    }

    #[cfg(not(target_arch = "arm"))]
    pub fn switch_point(self) {
        loop {
            enum Verdict {
                Done,
                RunEvent,
            }
            // The verdict keys on the calling thread's state alone;
            // `switch_requested` is only advisory here, because events may
            // have run nested switches of their own in the meantime.
            let verdict = self.crit(|k| {
                let current = k.current;
                match k.thread(current).map(|t| t.state) {
                    Some(ThreadState::Running) => {
                        // Yield with nothing better to do.
                        k.sim.switch_requested = false;
                        Verdict::Done
                    }
                    Some(ThreadState::Ready) => {
                        k.sim_resume_current();
                        Verdict::Done
                    }
                    Some(ThreadState::Zombie)
                    | Some(ThreadState::Deleted)
                    | None => {
                        // Simulated execution of this thread ends here; the
                        // test harness carries on.
                        k.sim.switch_requested = false;
                        Verdict::Done
                    }
                    _ => Verdict::RunEvent,
                }
            });
            match verdict {
                Verdict::Done => return,
                Verdict::RunEvent => {
                    let event = self.crit(|k| k.sim.events.pop_front());
                    let Some(event) = event else {
                        let current = self.crit(|k| k.current);
                        panic!(
                            "thread {current:?} blocked with no simulated events pending"
                        );
                    };
                    event(self);
                }
            }
        }
    }

    /// Queues a simulation event to run at a future switch point.
    #[cfg(not(target_arch = "arm"))]
    pub fn sim_enqueue(self, f: impl FnOnce(KernelRef) + 'static) {
        self.crit(|k| k.sim.events.push_back(alloc::boxed::Box::new(f)));
    }

    /// Runs `f` in the scheduling context of `thread`: the thread becomes
    /// current (and running) for the duration, then is parked back on the
    /// ready queue if it is still runnable. This is how tests and queued
    /// events act as "the other thread."
    #[cfg(not(target_arch = "arm"))]
    pub fn run_as<R>(self, thread: ThreadId, f: impl FnOnce(KernelRef) -> R) -> R {
        let previous = self.crit(|k| {
            let previous = k.current;
            if let Some(t) = k.thread_mut(thread) {
                if t.state == ThreadState::Ready {
                    let level = priority_level(t.priority);
                    k.ready[level].retain(|&x| x != thread);
                }
                k.thread_mut(thread).unwrap().state = ThreadState::Running;
            }
            k.current = thread;
            previous
        });
        let result = f(self);
        self.crit(|k| {
            if let Some(t) = k.thread_mut(thread) {
                if t.state == ThreadState::Running {
                    t.state = ThreadState::Ready;
                    let level = priority_level(t.priority);
                    k.ready[level].push_back(thread);
                }
            }
            k.current = previous;
        });
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boot_handles_are_idle_zero_init_one() {
        let kern = Kernel::new(256, 1024);
        assert_eq!(kern.idle, Handle(0));
        assert_eq!(kern.init, Handle(1));
        assert_eq!(kern.current, kern.idle);
        assert_eq!(kern.thread(kern.init).unwrap().state, ThreadState::Ready);
    }

    #[test]
    fn reschedule_prefers_urgent_and_round_robins() {
        let mut kern = Kernel::new_for_test();
        let a = crate::thread::spawn_parked(&mut kern, "a", 5);
        let b = crate::thread::spawn_parked(&mut kern, "b", 5);
        let urgent = crate::thread::spawn_parked(&mut kern, "urgent", 10);
        kern.wakeup_thread(a, false);
        kern.wakeup_thread(b, false);
        kern.wakeup_thread(urgent, false);

        // Current (init, priority 0) is less urgent than all three.
        assert_eq!(kern.reschedule(), urgent);
        // urgent stays running unless it blocks; make it block.
        kern.current_thread_mut().state = ThreadState::Waiting;
        assert_eq!(kern.reschedule(), a);
        // Round robin between a and b at the same level.
        assert_eq!(kern.reschedule(), b);
        assert_eq!(kern.reschedule(), a);
    }

    #[test]
    fn make_ready_reports_urgency() {
        let mut kern = Kernel::new_for_test();
        let lazy = crate::thread::spawn_parked(&mut kern, "lazy", -5);
        let eager = crate::thread::spawn_parked(&mut kern, "eager", 5);
        assert!(!kern.make_ready(lazy));
        assert!(kern.make_ready(eager));
    }

    #[test]
    fn tick_wakes_expired_sleepers_in_deadline_order() {
        let mut kern = Kernel::new_for_test();
        let a = crate::thread::spawn_parked(&mut kern, "a", 0);
        let b = crate::thread::spawn_parked(&mut kern, "b", 0);
        kern.thread_mut(a).unwrap().state = ThreadState::Sleeping;
        kern.thread_mut(b).unwrap().state = ThreadState::Sleeping;
        kern.sleep.add(b, TimeValNanos::from_millis(5));
        kern.sleep.add(a, TimeValNanos::from_millis(2));

        kern.sim_advance_ms(3);
        assert_eq!(kern.thread(a).unwrap().state, ThreadState::Ready);
        assert_eq!(kern.thread(b).unwrap().state, ThreadState::Sleeping);

        kern.sim_advance_ms(3);
        assert_eq!(kern.thread(b).unwrap().state, ThreadState::Ready);
    }

    #[test]
    fn tick_charges_run_time_to_current() {
        let mut kern = Kernel::new_for_test();
        let before = kern.current_thread().run_time;
        kern.sim_advance_ms(7);
        let after = kern.current_thread().run_time;
        assert_eq!((after - before).as_millis(), 7);
    }

    #[test]
    fn freeing_last_handle_wakes_waiters_with_target_deleted() {
        let mut kern = Kernel::new_for_test();
        let waiter = crate::thread::spawn_parked(&mut kern, "w", 0);
        let h = kern
            .register_object(KObject::new_semaphore("s", 0, abi::ClockId::MonotonicCoarse))
            .unwrap();
        let dup = kern.duplicate_object(h).unwrap();

        let obj = kern.object(h).unwrap();
        obj.body.lock().as_semaphore().unwrap().wait_queue.append(waiter);
        kern.thread_mut(waiter).unwrap().state = ThreadState::Waiting;

        // Freeing one of two handles must not disturb the waiter.
        kern.free_object(h, HandleType::Semaphore).unwrap();
        assert_eq!(kern.thread(waiter).unwrap().state, ThreadState::Waiting);
        assert!(!kern.thread(waiter).unwrap().wait_target_deleted);

        // Freeing the last handle wakes it with the flag set.
        kern.free_object(dup, HandleType::Semaphore).unwrap();
        assert_eq!(kern.thread(waiter).unwrap().state, ThreadState::Ready);
        assert!(kern.thread(waiter).unwrap().wait_target_deleted);
    }

    #[test]
    fn free_object_checks_type_and_double_free() {
        let mut kern = Kernel::new_for_test();
        let h = kern
            .register_object(KObject::new_mutex(
                "m",
                abi::MutexRecursionMode::Recurse,
                abi::ClockId::MonotonicCoarse,
            ))
            .unwrap();
        assert_eq!(
            kern.free_object(h, HandleType::Semaphore),
            Err(ErrorCode::InvalidArg)
        );
        assert_eq!(kern.free_object(h, HandleType::Mutex), Ok(()));
        assert_eq!(
            kern.free_object(h, HandleType::Mutex),
            Err(ErrorCode::InvalidArg)
        );
    }
}
