// This file is part of Ringcam, an on-demand clip recorder for a live RTSP camera feed.
// Copyright (C) 2024 The Ringcam Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: MIT

//! Clock interface and implementations for testability.
//!
//! All wall-clock reads in the core go through this trait so that tests can
//! drive admission timestamps and request times deterministically instead of
//! racing against the real clock.

use jiff::{Span, Timestamp};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration as StdDuration, Instant};
use tracing::warn;

/// Abstract interface to the system clocks. This exists purely for testability.
pub trait Clocks: Send + Sync + 'static {
    /// Gets the current wall-clock time.
    fn realtime(&self) -> Timestamp;

    /// Gets the current time from a monotonic clock, suitable for measuring
    /// elapsed durations but not for display.
    fn monotonic(&self) -> Instant;

    /// Causes the current thread to sleep for the specified duration.
    /// Implementations used in production actually sleep; simulated clocks
    /// used in tests merely advance their internal notion of time.
    fn sleep(&self, how_long: StdDuration);
}

#[derive(Copy, Clone, Default)]
pub struct RealClocks {}

impl Clocks for RealClocks {
    fn realtime(&self) -> Timestamp {
        Timestamp::now()
    }

    fn monotonic(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, how_long: StdDuration) {
        std::thread::sleep(how_long);
    }
}

/// Logs a warning if the guarded operation takes "too long" (more than a
/// second), using the label created by a supplied function. The label
/// function is only invoked in the slow path, so it may safely be expensive.
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
        let elapsed = self.clocks.monotonic().saturating_duration_since(self.start);
        if elapsed >= StdDuration::from_secs(1) {
            let label_f = self.label_f.take().unwrap();
            warn!(?elapsed, "{} took a while", label_f().as_ref());
        }
    }
}

/// Simulated clock for testing: `sleep` advances a shared counter instead of
/// blocking, so an entire recorder/extractor interaction can be driven from a
/// single test thread without real delays.
#[derive(Clone)]
pub struct SimulatedClocks(Arc<SimulatedClocksInner>);

struct SimulatedClocksInner {
    boot: Timestamp,
    uptime_nanos: AtomicI64,
    start: Instant,
}

impl SimulatedClocks {
    pub fn new(boot: Timestamp) -> Self {
        SimulatedClocks(Arc::new(SimulatedClocksInner {
            boot,
            uptime_nanos: AtomicI64::new(0),
            start: Instant::now(),
        }))
    }

    fn uptime(&self) -> StdDuration {
        StdDuration::from_nanos(self.0.uptime_nanos.load(Ordering::SeqCst) as u64)
    }
}

impl Clocks for SimulatedClocks {
    fn realtime(&self) -> Timestamp {
        let nanos = self.0.uptime_nanos.load(Ordering::SeqCst);
        self.0.boot + Span::new().nanoseconds(nanos)
    }

    fn monotonic(&self) -> Instant {
        self.0.start + self.uptime()
    }

    fn sleep(&self, how_long: StdDuration) {
        self.0
            .uptime_nanos
            .fetch_add(how_long.as_nanos() as i64, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simulated_clock_advances_on_sleep() {
        let clocks = SimulatedClocks::new(Timestamp::now());
        let before = clocks.realtime();
        clocks.sleep(StdDuration::from_secs(5));
        let after = clocks.realtime();
        assert_eq!((after - before).get_seconds(), 5);
    }
}
