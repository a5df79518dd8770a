// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel time representation and clock-domain conversion.
//!
//! The kernel keeps one true timeline: the coarse monotonic clock, which is
//! the tick counter scaled to nanoseconds. Every other clock is expressed as
//! an offset from it, so converting a deadline from any clock domain back to
//! monotonic is a single subtraction. Deadlines of infinity survive every
//! conversion unchanged.

use abi::{ClockId, ErrorCode, KResult, TICKS_PER_SECOND};

/// Nanoseconds per kernel tick.
pub const TICK_PERIOD_NANOS: i64 = 1_000_000_000 / TICKS_PER_SECOND as i64;

/// A point in time or a duration, in nanoseconds.
///
/// `INFINITE` is a sentinel meaning "never"; arithmetic on it saturates so an
/// infinite deadline stays infinite through offset conversion.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Ord, PartialOrd)]
#[repr(transparent)]
pub struct TimeValNanos(i64);

impl TimeValNanos {
    pub const ZERO: Self = Self(0);
    pub const INFINITE: Self = Self(i64::MAX);

    pub const fn from_nanos(ns: i64) -> Self {
        Self(ns)
    }

    pub const fn from_micros(us: i64) -> Self {
        Self(us * 1_000)
    }

    pub const fn from_millis(ms: i64) -> Self {
        Self(ms * 1_000_000)
    }

    pub const fn from_secs(s: i64) -> Self {
        Self(s * 1_000_000_000)
    }

    pub const fn as_nanos(self) -> i64 {
        self.0
    }

    pub const fn as_millis(self) -> i64 {
        self.0 / 1_000_000
    }

    pub const fn is_infinite(self) -> bool {
        self.0 == i64::MAX
    }
}

impl core::ops::Add for TimeValNanos {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        if self.is_infinite() || rhs.is_infinite() {
            Self::INFINITE
        } else {
            Self(self.0.saturating_add(rhs.0))
        }
    }
}

impl core::ops::Sub for TimeValNanos {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self {
        if self.is_infinite() {
            Self::INFINITE
        } else {
            Self(self.0.saturating_sub(rhs.0))
        }
    }
}

impl core::ops::AddAssign for TimeValNanos {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

impl crate::sched::Kernel {
    /// Coarse monotonic time: the tick counter scaled to nanoseconds. Cheap,
    /// tick granularity.
    pub fn monotonic_time(&self) -> TimeValNanos {
        TimeValNanos::from_millis(self.arch_now_ticks() as i64)
    }

    /// High-resolution monotonic time: tick counter plus the sub-tick
    /// progress of the free-running hardware counter. See
    /// `arch::now_hires_nanos` for the pending-tick re-read protocol.
    pub fn monotonic_time_hires(&self) -> TimeValNanos {
        TimeValNanos::from_nanos(self.arch_now_hires_nanos())
    }

    /// Realtime clock: monotonic plus the kernel-wide offset installed by
    /// [`Self::set_real_time`].
    pub fn real_time(&self) -> TimeValNanos {
        self.monotonic_time() + self.real_time_offset
    }

    pub fn real_time_hires(&self) -> TimeValNanos {
        self.monotonic_time_hires() + self.real_time_offset
    }

    /// Installs the realtime offset so that the realtime clock reads `time`
    /// now. With `update_rtc`, also writes the hardware RTC so the setting
    /// survives a reboot.
    pub fn set_real_time(&mut self, time: TimeValNanos, update_rtc: bool) {
        self.real_time_offset = time - self.monotonic_time();
        if update_rtc {
            crate::arch::rtc_set_clock(time);
        }
    }

    /// Total time the idle thread has been running, i.e. time the CPU spent
    /// with nothing to do.
    pub fn idle_time(&self) -> TimeValNanos {
        self.thread(self.idle).expect("idle thread missing").run_time
    }

    /// Offset of `clock` relative to the monotonic clock.
    ///
    /// The CPU-time clocks are expressed the same way: their "offset" is the
    /// (negative) distance between accumulated run time and the monotonic
    /// clock, which makes `monotonic + offset` come out to the accumulator.
    pub fn clock_time_offset(&self, clock: ClockId) -> KResult<TimeValNanos> {
        match clock {
            ClockId::Realtime | ClockId::RealtimeCoarse | ClockId::RealtimeAlarm => {
                Ok(self.real_time_offset)
            }
            ClockId::ProcessCpuTime => Ok(TimeValNanos::ZERO - self.idle_time()),
            ClockId::ThreadCpuTime => {
                let run_time = self
                    .thread(self.current)
                    .ok_or(ErrorCode::InvalidArg)?
                    .run_time;
                Ok(run_time - self.monotonic_time())
            }
            ClockId::Monotonic
            | ClockId::MonotonicRaw
            | ClockId::MonotonicCoarse
            | ClockId::Boottime
            | ClockId::BoottimeAlarm => Ok(TimeValNanos::ZERO),
        }
    }

    /// Absolute time on `clock`.
    pub fn clock_time(&self, clock: ClockId) -> KResult<TimeValNanos> {
        Ok(self.monotonic_time() + self.clock_time_offset(clock)?)
    }

    pub fn clock_time_hires(&self, clock: ClockId) -> KResult<TimeValNanos> {
        Ok(self.monotonic_time_hires() + self.clock_time_offset(clock)?)
    }

    /// Converts a deadline expressed on `clock` into an equivalent monotonic
    /// deadline. Infinity is preserved.
    pub fn convert_clock_to_monotonic(
        &self,
        clock: ClockId,
        deadline: TimeValNanos,
    ) -> KResult<TimeValNanos> {
        if deadline.is_infinite() {
            return Ok(TimeValNanos::INFINITE);
        }
        Ok(deadline - self.clock_time_offset(clock)?)
    }

    /// Turns a relative timeout into a monotonic deadline. A zero timeout
    /// yields a deadline in the past, which makes every timed primitive
    /// behave as its try-variant; infinity stays infinite.
    pub fn timeout_to_deadline(&self, timeout: TimeValNanos) -> TimeValNanos {
        if timeout.is_infinite() {
            TimeValNanos::INFINITE
        } else {
            self.monotonic_time() + timeout
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::Kernel;

    #[test]
    fn infinity_is_sticky() {
        let inf = TimeValNanos::INFINITE;
        assert!((inf + TimeValNanos::from_secs(5)).is_infinite());
        assert!((inf - TimeValNanos::from_secs(5)).is_infinite());
        assert!((TimeValNanos::from_secs(5) + inf).is_infinite());
    }

    #[test]
    fn deadline_conversion_round_trips() {
        let mut kern = Kernel::new_for_test();
        kern.sim_set_now_ms(10_000);
        kern.set_real_time(TimeValNanos::from_secs(1_000_000), false);

        for clock in [
            ClockId::Realtime,
            ClockId::Monotonic,
            ClockId::MonotonicCoarse,
            ClockId::Boottime,
        ] {
            let deadline = kern.clock_time(clock).unwrap() + TimeValNanos::from_millis(250);
            let mono = kern.convert_clock_to_monotonic(clock, deadline).unwrap();
            let back = mono + kern.clock_time_offset(clock).unwrap();
            assert_eq!(back, deadline, "round trip failed for {clock:?}");
        }
    }

    #[test]
    fn infinite_deadline_survives_conversion() {
        let mut kern = Kernel::new_for_test();
        kern.set_real_time(TimeValNanos::from_secs(77), false);
        let mono = kern
            .convert_clock_to_monotonic(ClockId::Realtime, TimeValNanos::INFINITE)
            .unwrap();
        assert!(mono.is_infinite());
    }

    #[test]
    fn set_real_time_shifts_only_realtime() {
        let mut kern = Kernel::new_for_test();
        kern.sim_set_now_ms(5_000);
        let mono_before = kern.monotonic_time();
        kern.set_real_time(TimeValNanos::from_secs(500), false);
        assert_eq!(kern.monotonic_time(), mono_before);
        assert_eq!(kern.real_time(), TimeValNanos::from_secs(500));
    }

    #[test]
    fn zero_timeout_deadline_is_now() {
        let mut kern = Kernel::new_for_test();
        kern.sim_set_now_ms(123);
        assert_eq!(
            kern.timeout_to_deadline(TimeValNanos::ZERO),
            kern.monotonic_time()
        );
        assert!(kern.timeout_to_deadline(TimeValNanos::INFINITE).is_infinite());
    }
}
