// This file is part of Ringcam, an on-demand clip recorder for a live RTSP camera feed.
// Copyright (C) 2024 The Ringcam Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: MIT

//! The segment index (C2): a bounded, time-ordered registry of on-disk media
//! segments with eviction and multi-consumer admission notification.
//!
//! Waiters are fanned out with a slab of parked wakers under the same mutex
//! that guards the ordered segment list, the same trick `base::shutdown` uses
//! for its shutdown signal: every `Admit` drains and wakes the whole slab, so
//! a waiter registered before an admission can never miss it.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};
use std::time::Duration as StdDuration;

use base::clock::Clocks;
use base::{bail_t, Error};
use futures::Future;
use jiff::Timestamp;
use slab::Slab;
use tracing::{debug, warn};

/// An on-disk media fragment covering a contiguous real-time window.
///
/// The window is `[t_admit, t_admit + seg_dur)`; see the module docs on
/// [`SegmentIndex`] for why `t_admit` (not the segment's internal PTS) is the
/// window anchor.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Segment {
    path: PathBuf,
    t_admit: Timestamp,
    seg_dur: StdDuration,
}

impl Segment {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn t_admit(&self) -> Timestamp {
        self.t_admit
    }

    /// Start of this segment's semantic window (inclusive).
    pub fn window_start(&self) -> Timestamp {
        self.t_admit
    }

    /// End of this segment's semantic window (exclusive).
    pub fn window_end(&self) -> Timestamp {
        self.t_admit + jiff_span_from_std(self.seg_dur)
    }
}

fn jiff_span_from_std(d: StdDuration) -> jiff::Span {
    jiff::Span::new().nanoseconds(d.as_nanos() as i64)
}

/// Outcome of [`SegmentIndex::wait`].
pub enum WaitOutcome {
    Admitted(Segment),
    TimedOut,
}

struct Inner {
    /// Ordered ascending by `t_admit` (invariant I1/I2 of the data model).
    segments: VecDeque<Segment>,
    waiters: Slab<Waker>,
    /// Monotonically increasing; bumped on every admission so a waiter can
    /// tell whether an admission happened since it started waiting.
    seq: u64,
    last: Option<(u64, Segment)>,
}

/// Time-indexed, bounded, thread-safe registry of on-disk segments.
///
/// `N_max` bounds the retained segment count; `Admit` evicts the oldest
/// segment (deleting its file) whenever the bound is exceeded.
pub struct SegmentIndex<C: Clocks> {
    inner: Mutex<Inner>,
    clocks: Arc<C>,
    n_max: usize,
    seg_dur: StdDuration,
}

impl<C: Clocks> SegmentIndex<C> {
    pub fn new(clocks: Arc<C>, n_max: usize, seg_dur: StdDuration) -> Self {
        assert!(n_max > 0, "n_max must be positive");
        SegmentIndex {
            inner: Mutex::new(Inner {
                segments: VecDeque::with_capacity(n_max),
                waiters: Slab::new(),
                seq: 0,
                last: None,
            }),
            clocks,
            n_max,
            seg_dur,
        }
    }

    pub fn seg_dur(&self) -> StdDuration {
        self.seg_dur
    }

    pub fn n_max(&self) -> usize {
        self.n_max
    }

    /// Admits a newly-created segment file, stamping its admission time from
    /// the index's clock, then evicts from the front until the index is back
    /// within `n_max`. Publishes the admission to every current waiter.
    pub fn admit(&self, path: PathBuf) -> Segment {
        let segment = Segment {
            path,
            t_admit: self.clocks.realtime(),
            seg_dur: self.seg_dur,
        };

        let mut inner = self.inner.lock().unwrap();
        if let Some(last) = inner.segments.back() {
            debug_assert!(
                segment.t_admit > last.t_admit,
                "admission must be strictly increasing (I1)"
            );
        }
        inner.segments.push_back(segment.clone());

        while inner.segments.len() > self.n_max {
            let evicted = inner.segments.pop_front().expect("checked non-empty");
            if let Err(e) = std::fs::remove_file(&evicted.path) {
                warn!(path = %evicted.path.display(), error = %e, "failed to delete evicted segment");
            } else {
                debug!(path = %evicted.path.display(), "evicted segment");
            }
        }

        inner.seq += 1;
        inner.last = Some((inner.seq, segment.clone()));
        for (_, waker) in inner.waiters.drain() {
            waker.wake();
        }

        segment
    }

    /// Returns a defensive copy of the current ordered index.
    pub fn snapshot(&self) -> Vec<Segment> {
        self.inner.lock().unwrap().segments.iter().cloned().collect()
    }

    /// Blocks (asynchronously) until either a new segment is admitted after
    /// this call begins, or `deadline` elapses.
    pub async fn wait(&self, deadline: StdDuration) -> WaitOutcome {
        let starting_seq = self.inner.lock().unwrap().seq;
        let fut = WaitFuture {
            inner: &self.inner,
            starting_seq,
            waker_i: NO_WAKER,
        };
        match tokio::time::timeout(deadline, fut).await {
            Ok(segment) => WaitOutcome::Admitted(segment),
            Err(_) => WaitOutcome::TimedOut,
        }
    }

    /// Convenience wrapper returning an error instead of [`WaitOutcome`],
    /// for call sites (C4) that want to `?`-propagate a timeout.
    pub async fn wait_t(&self, deadline: StdDuration) -> Result<Segment, Error> {
        match self.wait(deadline).await {
            WaitOutcome::Admitted(s) => Ok(s),
            WaitOutcome::TimedOut => bail_t!(DeadlineExceeded, "timed out waiting for a segment"),
        }
    }
}

const NO_WAKER: usize = usize::MAX;

struct WaitFuture<'a> {
    inner: &'a Mutex<Inner>,
    starting_seq: u64,
    waker_i: usize,
}

impl Future for WaitFuture<'_> {
    type Output = Segment;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut inner = self.inner.lock().unwrap();
        if let Some((seq, segment)) = &inner.last {
            if *seq > self.starting_seq {
                return Poll::Ready(segment.clone());
            }
        }
        let waker = cx.waker();
        if self.waker_i == NO_WAKER {
            self.waker_i = inner.waiters.insert(waker.clone());
        } else {
            let existing = &mut inner.waiters[self.waker_i];
            if !waker.will_wake(existing) {
                existing.clone_from(waker);
            }
        }
        Poll::Pending
    }
}

impl Drop for WaitFuture<'_> {
    fn drop(&mut self) {
        if self.waker_i == NO_WAKER {
            return;
        }
        let mut inner = self.inner.lock().unwrap();
        if inner.waiters.contains(self.waker_i) {
            inner.waiters.remove(self.waker_i);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base::clock::SimulatedClocks;
    use std::time::Duration;

    fn index(n_max: usize) -> SegmentIndex<SimulatedClocks> {
        let clocks = Arc::new(SimulatedClocks::new(Timestamp::now()));
        SegmentIndex::new(clocks, n_max, Duration::from_secs(5))
    }

    #[test]
    fn admission_is_ordered_and_bounded() {
        let idx = index(2);
        idx.admit(PathBuf::from("/tmp/a.ts"));
        idx.admit(PathBuf::from("/tmp/b.ts"));
        let snap = idx.snapshot();
        assert_eq!(snap.len(), 2);
        assert!(snap[0].t_admit() < snap[1].t_admit());
    }

    #[tokio::test]
    async fn wait_times_out_when_nothing_admitted() {
        let idx = index(4);
        match idx.wait(Duration::from_millis(10)).await {
            WaitOutcome::TimedOut => {}
            WaitOutcome::Admitted(_) => panic!("expected timeout"),
        }
    }

    #[tokio::test]
    async fn multiple_waiters_each_observe_the_same_admission() {
        let idx = Arc::new(index(8));
        let idx1 = idx.clone();
        let idx2 = idx.clone();

        let w1 = tokio::spawn(async move { idx1.wait(Duration::from_secs(5)).await });
        let w2 = tokio::spawn(async move { idx2.wait(Duration::from_secs(5)).await });

        // Give both tasks a chance to register their wakers before admitting.
        tokio::time::sleep(Duration::from_millis(10)).await;
        let admitted = idx.admit(PathBuf::from("/tmp/c.ts"));

        for handle in [w1, w2] {
            match handle.await.unwrap() {
                WaitOutcome::Admitted(s) => assert_eq!(s, admitted),
                WaitOutcome::TimedOut => panic!("expected admission"),
            }
        }
    }
}
