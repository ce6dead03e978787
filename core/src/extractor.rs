// This file is part of Ringcam, an on-demand clip recorder for a live RTSP camera feed.
// Copyright (C) 2024 The Ringcam Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: MIT

//! The extractor (C4): given a backtrack/duration/request-time, selects
//! segments from the index (waiting for ones not yet produced), builds a
//! concat plan, and drives the transcoder to produce a single trimmed clip.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use base::clock::Clocks;
use base::{bail_t, Error, ResultExt};
use jiff::Timestamp;
use tracing::{debug, warn};

use crate::segment::{Segment, SegmentIndex};
use crate::transcoder::TranscoderDriver;

/// Wait bound for the first segment to ever appear, and for closing gaps in
/// an otherwise-complete selection (§4.4 steps 2b, 2g).
const EMPTY_BUFFER_TIMEOUT: Duration = Duration::from_secs(30);
const GAP_RETRY_TIMEOUT: Duration = Duration::from_secs(30);

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(0);

/// Allocates a process-unique id for a request's transient filenames, so
/// concurrent extractions never collide in the shared segment directory.
pub fn next_request_id() -> u64 {
    NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed)
}

/// A finished clip produced by the extractor, prior to delivery.
#[derive(Clone, Debug)]
pub struct ClipArtifact {
    pub path: PathBuf,
    pub duration: Duration,
    pub size_bytes: u64,
}

fn jiff_span(d: Duration) -> jiff::Span {
    jiff::Span::new().nanoseconds(d.as_nanos() as i64)
}

/// `b - a` as a non-negative [`Duration`], computed from epoch nanoseconds to
/// avoid the ambiguity of decomposing a [`jiff::Span`] into fractional seconds.
fn duration_between(a: Timestamp, b: Timestamp) -> Duration {
    let nanos = b.as_nanosecond() - a.as_nanosecond();
    Duration::from_nanos(nanos.max(0) as u64)
}

/// Returns `(earliest, latest)` window bounds implied by a non-empty, index-ordered
/// snapshot.
fn buffer_bounds(snapshot: &[Segment]) -> (Timestamp, Timestamp) {
    (
        snapshot.first().expect("non-empty").window_start(),
        snapshot.last().expect("non-empty").window_end(),
    )
}

/// Selects the contiguous run of segments whose windows overlap `(t_start, t_end)`.
/// Returns `None` if the selection is empty or doesn't fully cover the window.
fn select_segments(snapshot: &[Segment], t_start: Timestamp, t_end: Timestamp) -> Option<Vec<Segment>> {
    let selected: Vec<Segment> = snapshot
        .iter()
        .filter(|s| s.window_end() > t_start && s.window_start() < t_end)
        .cloned()
        .collect();
    let first = selected.first()?;
    let last = selected.last()?;
    if first.window_start() > t_start || last.window_end() < t_end {
        return None;
    }
    Some(selected)
}

/// Runs the extractor's segment-selection algorithm (§4.4 steps 1-2) to
/// completion, returning the accepted `(segments, t_start, t_end)`.
async fn select<C: Clocks>(
    index: &SegmentIndex<C>,
    backtrack: Duration,
    duration: Duration,
    t_req: Timestamp,
) -> Result<(Vec<Segment>, Timestamp, Timestamp), Error> {
    let mut t_start = t_req - jiff_span(backtrack);
    let mut t_end = t_start + jiff_span(duration);

    loop {
        let snapshot = index.snapshot();
        if snapshot.is_empty() {
            index.wait_t(EMPTY_BUFFER_TIMEOUT).await?;
            continue;
        }

        let (earliest, latest) = buffer_bounds(&snapshot);
        if t_start < earliest {
            t_start = earliest;
            t_end = t_start + jiff_span(duration);
        }

        if t_end > latest {
            index.wait_t(duration.saturating_mul(2)).await?;
            continue;
        }

        match select_segments(&snapshot, t_start, t_end) {
            Some(segments) => return Ok((segments, t_start, t_end)),
            None => {
                index.wait_t(GAP_RETRY_TIMEOUT).await?;
                continue;
            }
        }
    }
}

/// Writes a concat-demuxer list file (basenames only, `safe=0` compatible)
/// for the selected segments.
async fn write_concat_list(segment_dir: &Path, request_id: u64, segments: &[Segment]) -> Result<PathBuf, Error> {
    let mut body = String::new();
    for seg in segments {
        let name = seg
            .path()
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| base::format_err_t!(Internal, "segment path {:?} has no basename", seg.path()))?;
        body.push_str("file '");
        body.push_str(name);
        body.push_str("'\n");
    }
    let list_path = segment_dir.join(format!("concat_list_{request_id}.txt"));
    tokio::fs::write(&list_path, body).await.err_kind(base::ErrorKind::Internal)?;
    Ok(list_path)
}

/// Produces one [`ClipArtifact`] for `(backtrack, duration)` relative to
/// `t_req`, per the 6-step algorithm in §4.4.
pub async fn extract<T, C>(
    transcoder: &T,
    index: &SegmentIndex<C>,
    segment_dir: &Path,
    backtrack: Duration,
    duration: Duration,
    t_req: Timestamp,
) -> Result<ClipArtifact, Error>
where
    T: TranscoderDriver,
    C: Clocks,
{
    let request_id = next_request_id();
    let (segments, t_start, t_end) = select(index, backtrack, duration, t_req).await?;

    let first_start = segments.first().expect("non-empty").window_start();
    let tau0 = duration_between(first_start, t_start);
    let d_prime = duration_between(t_start, t_end);

    let concat_list_path = write_concat_list(segment_dir, request_id, &segments).await?;
    let output_path = segment_dir.join(format!("clip_{}.mp4", t_req.as_second()));

    let concat_result = transcoder.concat_trim(&concat_list_path, tau0, d_prime, &output_path).await;
    let _ = tokio::fs::remove_file(&concat_list_path).await;
    concat_result.map_err(|e| base::format_err_t!(Internal, "concat/trim failed: {}", e.chain()))?;

    let probe = transcoder.probe(&output_path).await?;
    if probe.duration < Duration::from_millis(500) {
        let _ = tokio::fs::remove_file(&output_path).await;
        bail_t!(FailedPrecondition, "extracted clip duration {:?} below minimum", probe.duration);
    }
    let metadata = tokio::fs::metadata(&output_path).await.err_kind(base::ErrorKind::Internal)?;
    if metadata.len() < 1024 {
        let _ = tokio::fs::remove_file(&output_path).await;
        bail_t!(FailedPrecondition, "extracted clip size {} below minimum", metadata.len());
    }

    // Best-effort aspect fix (§4.4 step 5): failures are logged and the
    // unfixed file is kept.
    let aspect = probe.dimensions.reduced_aspect();
    let fixed_path = segment_dir.join(format!(
        "fixed_{}",
        output_path.file_name().and_then(|n| n.to_str()).unwrap_or("clip.mp4")
    ));
    match transcoder.remux(&output_path, aspect, &fixed_path).await {
        Ok(()) => {
            if let Err(e) = tokio::fs::rename(&fixed_path, &output_path).await {
                warn!(error = %e, "failed to replace clip with aspect-fixed remux; keeping original");
                let _ = tokio::fs::remove_file(&fixed_path).await;
            }
        }
        Err(e) => {
            debug!(error = %e.chain(), "aspect-fix remux failed; keeping unfixed clip");
            let _ = tokio::fs::remove_file(&fixed_path).await;
        }
    }

    let final_meta = tokio::fs::metadata(&output_path).await.err_kind(base::ErrorKind::Internal)?;
    Ok(ClipArtifact {
        path: output_path,
        duration: probe.duration,
        size_bytes: final_meta.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use base::clock::SimulatedClocks;
    use std::sync::Arc;

    fn seg(index: &SegmentIndex<SimulatedClocks>, clocks: &SimulatedClocks, path: &str, advance: Duration) -> Segment {
        clocks.sleep(advance);
        index.admit(PathBuf::from(path))
    }

    #[test]
    fn select_segments_requires_full_coverage() {
        let clocks = Arc::new(SimulatedClocks::new(Timestamp::now()));
        let index = SegmentIndex::new(clocks.clone(), 8, Duration::from_secs(5));
        let s0 = seg(&index, &clocks, "/tmp/0.ts", Duration::from_secs(0));
        let s1 = seg(&index, &clocks, "/tmp/1.ts", Duration::from_secs(5));
        let snapshot = vec![s0.clone(), s1.clone()];
        let t_start = s0.window_start();
        let t_end = s1.window_end();
        let selected = select_segments(&snapshot, t_start, t_end).unwrap();
        assert_eq!(selected.len(), 2);

        // A window extending past the buffer's end is not fully covered.
        assert!(select_segments(&snapshot, t_start, t_end + jiff::Span::new().seconds(1)).is_none());
    }
}
