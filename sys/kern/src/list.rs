// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Wait queues and the sleep list.
//!
//! Every blocking primitive parks threads on a [`WaitQueue`]; timed waits
//! additionally register on the kernel's [`SleepList`], which the tick
//! handler walks to wake expired sleepers. A parked thread stays on the wait
//! queue until it detaches *itself* after resuming -- a wakeup only moves it
//! to the ready list. That asymmetry is what lets a resumed thread tell why
//! it woke: if it is no longer on the queue, somebody woke it deliberately;
//! if it is still on the queue, the wake came from a timeout or a signal and
//! the thread removes its own entry.

use abi::ThreadId;
use alloc::collections::VecDeque;
use alloc::vec::Vec;

use crate::time::TimeValNanos;

/// FIFO queue of parked threads.
#[derive(Debug, Default)]
pub struct WaitQueue {
    queue: VecDeque<ThreadId>,
}

impl WaitQueue {
    pub const fn new() -> Self {
        Self {
            queue: VecDeque::new(),
        }
    }

    pub fn append(&mut self, thread: ThreadId) {
        self.queue.push_back(thread);
    }

    /// Removes `thread` from the queue. Returns whether it was present --
    /// the "was I woken or did I wake myself" test described above.
    pub fn remove(&mut self, thread: ThreadId) -> bool {
        if let Some(pos) = self.queue.iter().position(|&t| t == thread) {
            self.queue.remove(pos);
            true
        } else {
            false
        }
    }

    /// Dequeues up to `count` threads in FIFO order; `count == 0` means all.
    pub fn take_waiters(&mut self, count: usize) -> Vec<ThreadId> {
        let n = if count == 0 {
            self.queue.len()
        } else {
            count.min(self.queue.len())
        };
        self.queue.drain(..n).collect()
    }

    pub fn contains(&self, thread: ThreadId) -> bool {
        self.queue.iter().any(|&t| t == thread)
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }
}

/// The sleep list: threads with a pending resume time, kept sorted by
/// ascending deadline. Ties wake in insertion order.
#[derive(Debug, Default)]
pub struct SleepList {
    // (resume_time, thread), sorted ascending by resume_time.
    entries: Vec<(TimeValNanos, ThreadId)>,
}

impl SleepList {
    pub const fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Inserts `thread` with the given resume time, after any entries with
    /// an equal deadline.
    pub fn add(&mut self, thread: ThreadId, resume_time: TimeValNanos) {
        let pos = self
            .entries
            .partition_point(|&(t, _)| t <= resume_time);
        self.entries.insert(pos, (resume_time, thread));
    }

    /// Detaches `thread`. Returns whether it was still on the list; a thread
    /// whose deadline fired has already been removed by the tick handler.
    pub fn remove(&mut self, thread: ThreadId) -> bool {
        if let Some(pos) = self.entries.iter().position(|&(_, t)| t == thread) {
            self.entries.remove(pos);
            true
        } else {
            false
        }
    }

    pub fn contains(&self, thread: ThreadId) -> bool {
        self.entries.iter().any(|&(_, t)| t == thread)
    }

    /// Removes and returns every thread whose resume time has passed, in
    /// deadline order.
    pub fn take_expired(&mut self, now: TimeValNanos) -> Vec<ThreadId> {
        let n = self.entries.partition_point(|&(t, _)| t <= now);
        self.entries.drain(..n).map(|(_, t)| t).collect()
    }

    /// Resume time of the earliest sleeper, if any.
    pub fn next_deadline(&self) -> Option<TimeValNanos> {
        self.entries.first().map(|&(t, _)| t)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
