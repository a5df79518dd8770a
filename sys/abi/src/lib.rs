// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel ABI definitions, shared between kernel and applications.
//!
//! Everything in here is part of the contract between the kernel and
//! unprivileged code: error codes, handle and signal numbering, the syscall
//! table order, and the structs that cross the privilege boundary. Changing
//! any numeric value in this crate is an ABI break.

#![cfg_attr(not(test), no_std)]

use serde::{Deserialize, Serialize};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Maximum length of a thread or kernel object name, in bytes, not counting
/// any terminator.
pub const NAME_LENGTH: usize = 32;

/// Number of distinct scheduling priority levels. Priorities outside the
/// `THREAD_PRIORITY_MIN..=THREAD_PRIORITY_MAX` range are clamped.
pub const PRIORITY_LEVELS: usize = 32;

/// Most urgent thread priority accepted by `thread_spawn` and
/// `thread_set_priority`.
pub const THREAD_PRIORITY_MAX: i32 = 15;

/// Least urgent thread priority. The idle thread runs here.
pub const THREAD_PRIORITY_MIN: i32 = -16;

/// Kernel tick rate. The preemption tick, coarse clocks and time slices all
/// derive from this.
pub const TICKS_PER_SECOND: u64 = 1000;

/// Closed set of error conditions used throughout the kernel and surfaced to
/// user code.
///
/// The discriminants double as `errno` values, which is why they look like
/// newlib's numbering: a syscall that fails stores the discriminant in the
/// calling thread's errno slot. `RestartSyscall` is the one exception -- it
/// never reaches user code; the syscall return path either retries the call
/// or rewrites it to `Interrupted`.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[repr(i32)]
pub enum ErrorCode {
    Success = 0,
    NoEntry = 2,
    NoSuchProcess = 3,
    Interrupted = 4,
    IOError = 5,
    NoMemory = 12,
    Busy = 16,
    Exist = 17,
    InvalidArg = 22,
    Deadlock = 45,
    InvalidFileType = 79,
    NotImplemented = 88,
    Timeout = 116,
    RestartSyscall = 512,
}

impl ErrorCode {
    /// The errno value for this error, or 0 for `Success`.
    pub fn as_errno(self) -> i32 {
        self as i32
    }
}

/// Kernel result type. `Err` never carries `ErrorCode::Success`.
pub type KResult<T> = core::result::Result<T, ErrorCode>;

/// Return-value convention for syscall handlers: a code and a 32-bit value
/// passed back through the two caller-saved return registers. Success codes
/// are zero (or a small positive count), errors are negative errno values.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(C)]
pub struct SysRetPair {
    pub code: i32,
    pub value: u32,
}

impl SysRetPair {
    pub fn success(value: u32) -> Self {
        Self { code: 0, value }
    }

    pub fn error(code: ErrorCode) -> Self {
        Self {
            code: -code.as_errno(),
            value: 0,
        }
    }
}

/// Opaque identifier for an entry in a kernel handle registry.
///
/// Handles are small non-negative integers; the registry reuses freed values,
/// low numbers first, so handle 0 is the idle thread and handle 1 is the init
/// thread on every boot.
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize,
    PartialOrd, Ord,
)]
#[repr(transparent)]
pub struct Handle(pub i32);

impl Handle {
    pub const INVALID: Self = Self(-1);

    pub fn is_valid(self) -> bool {
        self.0 >= 0
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// A thread handle. Threads live in their own registry but share the handle
/// representation with named objects.
pub type ThreadId = Handle;

/// Type tag carried by every object in the named-object registry. `free`
/// checks the tag so a handle of the wrong flavor cannot tear down an
/// unrelated object.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[repr(u32)]
pub enum HandleType {
    Thread = 0,
    Mutex = 1,
    ConditionVariable = 2,
    Semaphore = 3,
    MessagePort = 4,
    ObjectWaitGroup = 5,
    INode = 6,
}

/// What a wait-group entry is watching an object for.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[repr(u32)]
pub enum ObjectWaitMode {
    Read = 0,
    Write = 1,
    ReadWrite = 2,
}

impl core::convert::TryFrom<u32> for ObjectWaitMode {
    type Error = ();

    fn try_from(x: u32) -> Result<Self, ()> {
        match x {
            0 => Ok(Self::Read),
            1 => Ok(Self::Write),
            2 => Ok(Self::ReadWrite),
            _ => Err(()),
        }
    }
}

/// Behavior of a mutex when its holder locks it again.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[repr(u32)]
pub enum MutexRecursionMode {
    /// Self-lock succeeds and increases the recursion depth.
    Recurse = 0,
    /// Self-lock fails with `Deadlock`.
    RaiseError = 1,
}

/// Whether a thread's exit status is retained for `thread_join`.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[repr(u32)]
pub enum ThreadDetachState {
    Joinable = 0,
    Detached = 1,
}

/// Thread lifecycle states, as reported by `get_thread_info`.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[repr(u32)]
pub enum ThreadState {
    Ready = 0,
    Running = 1,
    Waiting = 2,
    Sleeping = 3,
    Stopped = 4,
    Zombie = 5,
    Deleted = 6,
}

/// Parameters for `thread_spawn`. Passed by pointer from user code, hence the
/// fixed layout.
#[derive(Clone, Debug)]
#[repr(C)]
pub struct ThreadAttribs {
    pub name: [u8; NAME_LENGTH],
    pub priority: i32,
    pub detach_state: ThreadDetachState,
    pub stack_size: usize,
}

impl ThreadAttribs {
    pub fn new(name: &str, priority: i32, detach_state: ThreadDetachState, stack_size: usize) -> Self {
        let mut buf = [0; NAME_LENGTH];
        let n = name.len().min(NAME_LENGTH);
        buf[..n].copy_from_slice(&name.as_bytes()[..n]);
        Self {
            name: buf,
            priority,
            detach_state,
            stack_size,
        }
    }
}

impl Default for ThreadAttribs {
    fn default() -> Self {
        Self::new("", 0, ThreadDetachState::Joinable, 4096)
    }
}

/// Snapshot of one thread, as filled in by `get_thread_info` /
/// `get_next_thread_info`.
#[derive(Clone, Debug)]
#[repr(C)]
pub struct ThreadInfo {
    pub thread_id: Handle,
    pub name: [u8; NAME_LENGTH],
    pub state: ThreadState,
    pub priority: i32,
    pub dynamic_priority: i32,
    pub blocking_object: Handle,
    pub run_time_nanos: i64,
    pub quantum_nanos: i64,
    pub stack_size: usize,
}

/// Clock identifiers accepted by the timed syscalls. Every deadline is
/// converted to `MonotonicCoarse` before the calling thread parks.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[repr(u32)]
pub enum ClockId {
    Realtime = 0,
    Monotonic = 1,
    ProcessCpuTime = 2,
    ThreadCpuTime = 3,
    MonotonicRaw = 4,
    RealtimeCoarse = 5,
    MonotonicCoarse = 6,
    Boottime = 7,
    RealtimeAlarm = 8,
    BoottimeAlarm = 9,
}

impl core::convert::TryFrom<u32> for ClockId {
    type Error = ();

    fn try_from(x: u32) -> Result<Self, ()> {
        match x {
            0 => Ok(Self::Realtime),
            1 => Ok(Self::Monotonic),
            2 => Ok(Self::ProcessCpuTime),
            3 => Ok(Self::ThreadCpuTime),
            4 => Ok(Self::MonotonicRaw),
            5 => Ok(Self::RealtimeCoarse),
            6 => Ok(Self::MonotonicCoarse),
            7 => Ok(Self::Boottime),
            8 => Ok(Self::RealtimeAlarm),
            9 => Ok(Self::BoottimeAlarm),
            _ => Err(()),
        }
    }
}

/// Boot modes handed to `reboot` and stashed in backup register 0 for the
/// next boot to find.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[repr(u32)]
pub enum BootMode {
    Normal = 0,
    Bootloader = 1,
}

/// Backup register reserved for the reboot-mode hand-off.
pub const BACKUP_REG_BOOT_MODE: usize = 0;

//
// Signals.
//

/// Number of signals. Signal numbers run 1..=NSIG; bit `n - 1` of a `SigSet`
/// corresponds to signal `n`.
pub const NSIG: usize = 64;

pub const SIGHUP: i32 = 1;
pub const SIGINT: i32 = 2;
pub const SIGQUIT: i32 = 3;
pub const SIGILL: i32 = 4;
pub const SIGTRAP: i32 = 5;
pub const SIGABRT: i32 = 6;
pub const SIGEMT: i32 = 7;
pub const SIGFPE: i32 = 8;
pub const SIGKILL: i32 = 9;
pub const SIGBUS: i32 = 10;
pub const SIGSEGV: i32 = 11;
pub const SIGSYS: i32 = 12;
pub const SIGPIPE: i32 = 13;
pub const SIGALRM: i32 = 14;
pub const SIGTERM: i32 = 15;
pub const SIGURG: i32 = 16;
pub const SIGSTOP: i32 = 17;
pub const SIGTSTP: i32 = 18;
pub const SIGCONT: i32 = 19;
pub const SIGCHLD: i32 = 20;
pub const SIGTTIN: i32 = 21;
pub const SIGTTOU: i32 = 22;
pub const SIGIO: i32 = 23;
pub const SIGXCPU: i32 = 24;
pub const SIGXFSZ: i32 = 25;
pub const SIGVTALRM: i32 = 26;
pub const SIGPROF: i32 = 27;
pub const SIGWINCH: i32 = 28;
pub const SIGLOST: i32 = 29;
pub const SIGUSR1: i32 = 30;
pub const SIGUSR2: i32 = 31;

/// First realtime signal. Realtime signals queue without coalescing and
/// deliver in `sigqueue` order.
pub const SIGRTMIN: i32 = 32;

/// Last realtime signal.
pub const SIGRTMAX: i32 = NSIG as i32 - 1;

/// A set of signals, one bit per signal number.
#[derive(
    Copy, Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize,
    FromBytes, IntoBytes, Immutable, KnownLayout,
)]
#[repr(transparent)]
pub struct SigSet(pub u64);

/// Builds the single-signal mask for `signum`.
pub const fn sig_mkmask(signum: i32) -> SigSet {
    SigSet(1 << (signum - 1))
}

impl SigSet {
    pub const EMPTY: Self = Self(0);
    pub const FILLED: Self = Self(!0);

    pub fn contains(self, signum: i32) -> bool {
        self.0 & sig_mkmask(signum).0 != 0
    }

    pub fn insert(&mut self, signum: i32) {
        self.0 |= sig_mkmask(signum).0;
    }

    pub fn remove(&mut self, signum: i32) {
        self.0 &= !sig_mkmask(signum).0;
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Lowest signal number in the set, if any.
    pub fn first(self) -> Option<i32> {
        if self.0 == 0 {
            None
        } else {
            Some(self.0.trailing_zeros() as i32 + 1)
        }
    }
}

impl core::ops::BitOr for SigSet {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl core::ops::BitAnd for SigSet {
    type Output = Self;
    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

impl core::ops::Not for SigSet {
    type Output = Self;
    fn not(self) -> Self {
        Self(!self.0)
    }
}

/// Signals that can never be blocked. They stay deliverable no matter what a
/// thread puts in its mask.
pub const UNBLOCKABLE_SIGNALS: SigSet = SigSet(
    sig_mkmask(SIGKILL).0 | sig_mkmask(SIGSTOP).0 | sig_mkmask(SIGCONT).0,
);

/// Complement of `UNBLOCKABLE_SIGNALS`; `thread_sigmask` masks every update
/// with this.
pub const BLOCKABLE_SIGNALS_MASK: SigSet = SigSet(!UNBLOCKABLE_SIGNALS.0);

/// `how` argument to `thread_sigmask`.
pub const SIG_BLOCK: u32 = 0;
pub const SIG_UNBLOCK: u32 = 1;
pub const SIG_SETMASK: u32 = 2;

/// Special handler values. Real handler addresses are always odd (thumb bit)
/// and nonzero, so these can't collide.
pub const SIG_DFL: usize = 0;
pub const SIG_IGN: usize = 1;
pub const SIG_ERR: usize = usize::MAX;

bitflags::bitflags! {
    /// `sa_flags` accepted by `sigaction`.
    #[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
    #[repr(transparent)]
    pub struct SigActionFlags: u32 {
        /// Handler takes the three-argument `(signo, siginfo, context)` form.
        const SIGINFO = 1 << 0;
        /// Interrupted syscalls restart instead of failing with `Interrupted`.
        const RESTART = 1 << 1;
        /// Do not add the delivered signal to the blocked mask while the
        /// handler runs.
        const NODEFER = 1 << 2;
        /// Reset the action to `SIG_DFL` on delivery.
        const RESETHAND = 1 << 3;
    }
}

/// One installed signal action. Per thread, per signal.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(C)]
pub struct SigAction {
    /// Handler address, or one of `SIG_DFL` / `SIG_IGN` / `SIG_ERR`.
    pub handler: usize,
    /// Signals added to the blocked mask for the duration of the handler.
    pub mask: SigSet,
    pub flags: SigActionFlags,
}

impl Default for SigAction {
    fn default() -> Self {
        Self {
            handler: SIG_DFL,
            mask: SigSet::EMPTY,
            flags: SigActionFlags::empty(),
        }
    }
}

/// What the kernel does with a signal whose action is `SIG_DFL`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SigDefaultAction {
    Terminate,
    TerminateCoreDump,
    Stop,
    Continue,
    Ignore,
}

/// Default-action table. Realtime signals terminate, like the unlisted
/// classic ones.
pub fn sig_default_action(signum: i32) -> SigDefaultAction {
    match signum {
        SIGCHLD | SIGURG | SIGWINCH | SIGIO => SigDefaultAction::Ignore,
        SIGSTOP | SIGTSTP | SIGTTIN | SIGTTOU => SigDefaultAction::Stop,
        SIGCONT => SigDefaultAction::Continue,
        SIGQUIT | SIGILL | SIGTRAP | SIGABRT | SIGEMT | SIGFPE | SIGBUS
        | SIGSEGV | SIGSYS | SIGXCPU | SIGXFSZ => {
            SigDefaultAction::TerminateCoreDump
        }
        _ => SigDefaultAction::Terminate,
    }
}

/// Whether a `SIG_IGN` disposition is honored for this signal.
pub fn sig_can_be_ignored(signum: i32) -> bool {
    signum != SIGKILL && signum != SIGSTOP
}

/// Whether `SA_RESETHAND` applies to this signal.
pub fn sig_can_auto_reset(signum: i32) -> bool {
    signum != SIGKILL && signum != SIGSTOP
}

/// `si_code` values.
pub const SI_USER: i32 = 0;
pub const SI_QUEUE: i32 = 2;
pub const ILL_ILLOPC: i32 = 1;
pub const ILL_ILLADR: i32 = 3;
pub const ILL_COPROC: i32 = 7;
pub const FPE_INTDIV: i32 = 1;
pub const SEGV_ACCERR: i32 = 2;
pub const BUS_ADRALN: i32 = 1;
pub const BUS_ADRERR: i32 = 2;
pub const BUS_OBJERR: i32 = 3;

/// Payload describing one signal delivery. A copy of this struct is placed in
/// the signal stack frame and its address is passed to the handler in R1.
#[derive(
    Copy, Clone, Debug, Default, Eq, PartialEq,
    FromBytes, IntoBytes, Immutable, KnownLayout,
)]
#[repr(C)]
pub struct SigInfo {
    pub si_signo: i32,
    pub si_code: i32,
    /// `sigqueue` value, if any.
    pub si_value: u32,
    /// Faulting address for memory and bus faults, faulting PC for
    /// `SIGILL`/`SIGFPE`.
    pub si_addr: u32,
}

//
// Syscall numbering.
//

/// Numbered syscalls, in positional order. The table is append-only: new
/// syscalls go at the end, existing numbers never move. Entries whose
/// subsystem lives outside the kernel core dispatch to a stub that returns
/// `NotImplemented`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u32)]
pub enum Sysnum {
    Open = 0,
    OpenAt,
    ReopenFile,
    Close,
    Fcntl,
    Dup,
    Dup2,
    Rename,
    Fstat,
    Stat,
    WriteStat,
    IsATty,
    Seek,
    Read,
    ReadPos,
    ReadV,
    ReadVPos,
    Write,
    WritePos,
    WriteV,
    WriteVPos,
    DeviceControl,
    CreateDirectory,
    ReadDirectory,
    RewindDirectory,
    RemoveDirectory,
    UnlinkFile,
    ReadLink,
    Symlink,
    GetDirectoryPath,
    ChDir,
    GetCwd,
    FSync,
    Mount,
    GetMonotonicTimeNs,
    GetMonotonicTimeHiresNs,
    GetRealTimeNs,
    GetRealTimeHiresNs,
    SetRealTimeNs,
    GetClockTimeOffsetNs,
    GetClockTimeNs,
    GetClockTimeHiresNs,
    GetIdleTimeNs,
    GetClockResolutionNs,
    SetClockResolutionNs,
    ThreadAttribsInit,
    ThreadSpawn,
    ThreadExit,
    ThreadDetach,
    ThreadJoin,
    GetThreadId,
    ThreadSetPriority,
    ThreadGetPriority,
    GetThreadInfo,
    GetNextThreadInfo,
    SnoozeNs,
    SnoozeUntilNs,
    Yield,
    ThreadKill,
    GetPid,
    Kill,
    GetDirtyDiskCacheBlocks,
    Exit,
    SysConf,
    SemaphoreCreate,
    SemaphoreDuplicate,
    SemaphoreDelete,
    SemaphoreCreatePublic,
    SemaphoreUnlinkPublic,
    SemaphoreAcquire,
    SemaphoreAcquireTimeoutNs,
    SemaphoreAcquireDeadlineNs,
    SemaphoreAcquireClockNs,
    SemaphoreTryAcquire,
    SemaphoreRelease,
    SemaphoreGetCount,
    MutexCreate,
    MutexDuplicate,
    MutexDelete,
    MutexLock,
    MutexLockTimeoutNs,
    MutexLockDeadlineNs,
    MutexLockClockNs,
    MutexTryLock,
    MutexUnlock,
    MutexLockShared,
    MutexLockSharedTimeoutNs,
    MutexLockSharedDeadlineNs,
    MutexLockSharedClockNs,
    MutexTryLockShared,
    MutexIsLocked,
    ConditionVarCreate,
    ConditionVarDelete,
    ConditionVarWait,
    ConditionVarWaitTimeoutNs,
    ConditionVarWaitDeadlineNs,
    ConditionVarWaitClockNs,
    ConditionVarWakeup,
    ConditionVarWakeupAll,
    Reboot,
    ObjectWaitGroupCreate,
    ObjectWaitGroupDelete,
    ObjectWaitGroupAddObject,
    ObjectWaitGroupRemoveObject,
    ObjectWaitGroupAddFile,
    ObjectWaitGroupRemoveFile,
    ObjectWaitGroupClear,
    ObjectWaitGroupWait,
    ObjectWaitGroupWaitTimeoutNs,
    ObjectWaitGroupWaitDeadlineNs,
    MessagePortCreate,
    MessagePortDuplicate,
    MessagePortDelete,
    MessagePortSend,
    MessagePortSendTimeoutNs,
    MessagePortSendDeadlineNs,
    MessagePortReceive,
    MessagePortReceiveTimeoutNs,
    MessagePortReceiveDeadlineNs,
    GetTotalIrqTimeNs,
    DuplicateHandle,
    DeleteHandle,
    IsDebuggerAttached,
    DigitalPinSetDirection,
    DigitalPinSetDriveStrength,
    DigitalPinSetPullMode,
    DigitalPinSetPeripheralMux,
    DigitalPinRead,
    DigitalPinWrite,
    WriteBackupRegister,
    ReadBackupRegister,
    BeepSeconds,
    SystemLogRegisterCategory,
    SystemLogSetCategoryMinimumSeverity,
    SystemLogIsCategoryActive,
    SystemLogGetCategoryChannel,
    SystemLogGetSeverityName,
    SystemLogGetCategoryName,
    SystemLogGetCategoryDisplayName,
    SystemLogAddMessage,
    AddSerialCommandHandler,
    SerialCommandSendData,
    SpawnExecve,
    SigAction,
    ThreadSigQueue,
    ThreadSigMask,
    Raise,
    Signal,
    SigSuspend,
}

/// One past the last table entry.
pub const SYS_COUNT: u32 = Sysnum::SigSuspend as u32 + 1;

/// Supervisor-call numbers handled outside the regular table: the
/// signal-return path invoked by the user-mode trampoline, and the forced
/// pending-signal check used for syscall restarts. Both sit far above the
/// table so appending syscalls never collides with them, and both are
/// Thumb-encodable immediates for the supervisor-call handler's compares.
pub const SYS_SIGRETURN: u32 = 0x1000_0000;
pub const SYS_PROCESS_SIGNALS: u32 = 0x2000_0000;

/// We're using an explicit `TryFrom` for `Sysnum` instead of `FromPrimitive`
/// because the kernel doesn't depend on `num-traits` and this seems okay.
impl core::convert::TryFrom<u32> for Sysnum {
    type Error = ();

    fn try_from(x: u32) -> Result<Self, ()> {
        if x >= SYS_COUNT {
            return Err(());
        }
        // Safety: Sysnum is repr(u32) with contiguous discriminants starting
        // at zero, and x was just range-checked against SYS_COUNT.
        Ok(unsafe { core::mem::transmute::<u32, Sysnum>(x) })
    }
}
