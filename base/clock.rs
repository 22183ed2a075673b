// This file is part of Lookback, a continuous screen activity recorder.
// Copyright (C) 2025 The Lookback Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Clock interface and implementations for testability.

use crate::time::{Duration, Time};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration as StdDuration;
use tracing::warn;

/// A monotonic instant, in milliseconds from an arbitrary origin.
///
/// Unlike `std::time::Instant`, values can be fabricated, which the
/// simulated clock needs.
#[derive(Clone, Copy, Debug, Default, Eq, Ord, PartialEq, PartialOrd)]
pub struct Instant(pub i64);

impl Instant {
    /// Elapsed time since `earlier`, saturating to zero if `earlier` is
    /// actually later.
    pub fn saturating_sub(&self, earlier: &Instant) -> Duration {
        Duration((self.0 - earlier.0).max(0))
    }
}

/// Abstract interface to the system clocks. This is for testability.
pub trait Clocks: Send + Sync + 'static {
    /// Gets the current wall-clock time.
    fn realtime(&self) -> Time;

    /// Gets the current time from a monotonic clock.
    ///
    /// On Linux, this uses `CLOCK_BOOTTIME`, which includes suspended time.
    /// On other systems, it uses `CLOCK_MONOTONIC`.
    fn monotonic(&self) -> Instant;

    /// Causes the current thread to sleep for the specified time.
    fn sleep(&self, how_long: Duration);

    /// Calls `rcv.recv_timeout` or substitutes a test implementation.
    fn recv_timeout<T>(
        &self,
        rcv: &mpsc::Receiver<T>,
        timeout: StdDuration,
    ) -> Result<T, mpsc::RecvTimeoutError>;
}

#[derive(Copy, Clone, Default)]
pub struct RealClocks {}

impl RealClocks {
    fn get(&self, clock: libc::clockid_t) -> Instant {
        let mut ts = std::mem::MaybeUninit::uninit();
        // SAFETY: `ts` is a valid out pointer; both supported clock ids exist
        // on the supported platforms.
        let r = unsafe { libc::clock_gettime(clock, ts.as_mut_ptr()) };
        assert_eq!(r, 0);
        let ts = unsafe { ts.assume_init() };
        Instant((ts.tv_sec as i64) * 1_000 + (ts.tv_nsec as i64) / 1_000_000)
    }
}

impl Clocks for RealClocks {
    fn realtime(&self) -> Time {
        Time::new(jiff::Timestamp::now())
    }

    #[cfg(target_os = "linux")]
    fn monotonic(&self) -> Instant {
        self.get(libc::CLOCK_BOOTTIME)
    }

    #[cfg(not(target_os = "linux"))]
    fn monotonic(&self) -> Instant {
        self.get(libc::CLOCK_MONOTONIC)
    }

    fn sleep(&self, how_long: Duration) {
        match how_long.to_std() {
            Ok(d) => thread::sleep(d),
            Err(err) => warn!(%err, "invalid sleep duration {:?}", how_long),
        }
    }

    fn recv_timeout<T>(
        &self,
        rcv: &mpsc::Receiver<T>,
        timeout: StdDuration,
    ) -> Result<T, mpsc::RecvTimeoutError> {
        rcv.recv_timeout(timeout)
    }
}

/// Logs a warning if the guarded operation lives "too long", using the label
/// created by a supplied function.
pub struct TimerGuard<'a, C: Clocks + ?Sized, S: AsRef<str>, F: FnOnce() -> S + 'a> {
    clocks: &'a C,
    label_f: Option<F>,
    start: Instant,
}

impl<'a, C: Clocks + ?Sized, S: AsRef<str>, F: FnOnce() -> S + 'a> TimerGuard<'a, C, S, F> {
    pub fn new(clocks: &'a C, label_f: F) -> Self {
        TimerGuard {
            clocks,
            label_f: Some(label_f),
            start: clocks.monotonic(),
        }
    }
}

impl<'a, C, S, F> Drop for TimerGuard<'a, C, S, F>
where
    C: Clocks + ?Sized,
    S: AsRef<str>,
    F: FnOnce() -> S + 'a,
{
    fn drop(&mut self) {
        let elapsed = self.clocks.monotonic().saturating_sub(&self.start);
        if elapsed >= Duration::from_secs(1) {
            let label_f = self.label_f.take().unwrap();
            warn!("{} took {}!", label_f().as_ref(), elapsed);
        }
    }
}

/// Simulated clock for testing.
#[derive(Clone, Debug)]
pub struct SimulatedClocks(Arc<SimulatedClocksInner>);

#[derive(Debug)]
struct SimulatedClocksInner {
    boot: Time,
    uptime: Mutex<Duration>,
}

impl SimulatedClocks {
    pub fn new(boot: Time) -> Self {
        SimulatedClocks(Arc::new(SimulatedClocksInner {
            boot,
            uptime: Mutex::new(Duration(0)),
        }))
    }
}

impl Clocks for SimulatedClocks {
    fn realtime(&self) -> Time {
        self.0.boot + *self.0.uptime.lock().unwrap()
    }

    fn monotonic(&self) -> Instant {
        Instant(self.0.uptime.lock().unwrap().0)
    }

    /// Advances the clock by the specified amount without actually sleeping.
    fn sleep(&self, how_long: Duration) {
        let mut l = self.0.uptime.lock().unwrap();
        *l += how_long;
    }

    /// Advances the clock by the specified amount if data is not immediately
    /// available.
    fn recv_timeout<T>(
        &self,
        rcv: &mpsc::Receiver<T>,
        timeout: StdDuration,
    ) -> Result<T, mpsc::RecvTimeoutError> {
        let r = rcv.recv_timeout(StdDuration::new(0, 0));
        if r.is_err() {
            self.sleep(Duration(timeout.as_millis() as i64));
        }
        r
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simulated_advances() {
        let c = SimulatedClocks::new(Time(1_000_000));
        assert_eq!(c.realtime(), Time(1_000_000));
        c.sleep(Duration::from_secs(2));
        assert_eq!(c.realtime(), Time(1_002_000));
        assert_eq!(c.monotonic(), Instant(2_000));
    }

    #[test]
    fn instant_saturates() {
        assert_eq!(Instant(5).saturating_sub(&Instant(10)), Duration(0));
        assert_eq!(Instant(10).saturating_sub(&Instant(5)), Duration(5));
    }
}
