// This file is part of Ringcam, an on-demand clip recorder for a live RTSP camera feed.
// Copyright (C) 2024 The Ringcam Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: MIT

//! A single global rate limiter for the façade (§4.6, §9): 1 request/second,
//! burst 1, no per-caller identity. With burst fixed at 1 this degenerates to
//! "at most one admitted request per `min_interval`", so a full token-bucket
//! accumulator isn't needed.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use base::clock::Clocks;

pub struct RateLimiter<C: Clocks> {
    clocks: std::sync::Arc<C>,
    min_interval: Duration,
    last_admitted: Mutex<Option<Instant>>,
}

impl<C: Clocks> RateLimiter<C> {
    pub fn new(clocks: std::sync::Arc<C>, min_interval: Duration) -> Self {
        RateLimiter {
            clocks,
            min_interval,
            last_admitted: Mutex::new(None),
        }
    }

    /// Returns whether a request is admitted right now.
    pub fn try_acquire(&self) -> bool {
        let now = self.clocks.monotonic();
        let mut last = self.last_admitted.lock().unwrap();
        match *last {
            Some(prev) if now.duration_since(prev) < self.min_interval => false,
            _ => {
                *last = Some(now);
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base::clock::SimulatedClocks;
    use jiff::Timestamp;
    use std::sync::Arc;

    #[test]
    fn admits_one_per_second_burst_one() {
        let clocks = Arc::new(SimulatedClocks::new(Timestamp::now()));
        let limiter = RateLimiter::new(clocks.clone(), Duration::from_secs(1));
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());
        clocks.sleep(Duration::from_millis(999));
        assert!(!limiter.try_acquire());
        clocks.sleep(Duration::from_millis(2));
        assert!(limiter.try_acquire());
    }
}
