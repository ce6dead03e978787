// This file is part of Ringcam, an on-demand clip recorder for a live RTSP camera feed.
// Copyright (C) 2024 The Ringcam Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: MIT

//! The recorder (C3): a long-running supervisor that keeps the segment index
//! continuously fed, tolerating camera disconnects and disk pressure.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use base::clock::Clocks;
use base::shutdown;
use nom::bytes::complete::{tag, take_until};
use nom::sequence::delimited;
use nom::IResult;
use sysinfo::Disks;
use tracing::{info, warn};

use crate::segment::SegmentIndex;
use crate::transcoder::TranscoderDriver;

/// Free-space floor below which a cycle is skipped (§4.3): 500 MiB.
pub const MIN_FREE_BYTES: u64 = 500 * 1024 * 1024;

const DISK_LOW_SLEEP: Duration = Duration::from_secs(30);
const CONNECTION_ERROR_SLEEP: Duration = Duration::from_secs(10);
const OTHER_ERROR_SLEEP: Duration = Duration::from_secs(5);

/// Substrings (matched case-insensitively) that classify a failure as a
/// camera/network connection issue rather than some other transcoder error.
const CONNECTION_ERROR_SUBSTRINGS: &[&str] = &[
    "connection refused",
    "no route to host",
    "network is unreachable",
    "connection timed out",
    "failed to connect",
    "timeout",
    "eof",
];

fn is_connection_error(stderr_tail: &str) -> bool {
    let lower = stderr_tail.to_ascii_lowercase();
    CONNECTION_ERROR_SUBSTRINGS.iter().any(|s| lower.contains(s))
}

/// Parses a segmenter stderr line of the form `Opening '<path>' for writing`,
/// returning the quoted path if present.
fn parse_opening_line(line: &str) -> Option<&str> {
    let parser = delimited(tag("Opening '"), take_until("'"), tag("' for writing"));
    let result: IResult<&str, &str> = parser(line);
    result.ok().map(|(_, path)| path)
}

/// Returns whether `path`'s basename belongs to the given cycle, guarding
/// against cross-cycle misattribution when a previous cycle's process is
/// still winding down (§6).
fn belongs_to_cycle(path: &Path, cycle_id: u64) -> bool {
    let prefix = format!("segment_cycle{cycle_id}_");
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.starts_with(&prefix) && n.ends_with(".ts"))
}

fn free_bytes(dir: &Path) -> Option<u64> {
    let disks = Disks::new_with_refreshed_list();
    let dir = std::fs::canonicalize(dir).ok()?;
    disks
        .iter()
        .filter(|d| dir.starts_with(d.mount_point()))
        .max_by_key(|d| d.mount_point().as_os_str().len())
        .map(|d| d.available_space())
}

/// Static configuration for the recorder's cycle loop.
#[derive(Clone)]
pub struct RecorderConfig {
    pub input_url: String,
    pub segment_dir: PathBuf,
    pub seg_dur: Duration,
}

/// Runs the recorder's cycle loop until `shutdown` fires. Never returns on
/// transient errors; only returns once shutdown is observed.
pub async fn run<T, C>(
    transcoder: Arc<T>,
    index: Arc<SegmentIndex<C>>,
    config: RecorderConfig,
    mut shutdown: shutdown::Receiver,
) where
    T: TranscoderDriver,
    C: Clocks,
{
    let next_cycle_id = AtomicU64::new(0);

    loop {
        if shutdown.check().is_err() {
            info!("recorder shutting down");
            return;
        }

        match free_bytes(&config.segment_dir) {
            Some(free) if free < MIN_FREE_BYTES => {
                warn!(
                    free = %base::strutil::encode_size(free as i64),
                    min = %base::strutil::encode_size(MIN_FREE_BYTES as i64),
                    "disk low; skipping cycle"
                );
                if interruptible_sleep(DISK_LOW_SLEEP, &shutdown).await.is_err() {
                    info!("recorder shutting down");
                    return;
                }
                continue;
            }
            None => {
                warn!(dir = %config.segment_dir.display(), "could not determine free disk space; proceeding anyway");
            }
            _ => {}
        }

        let cycle_id = next_cycle_id.fetch_add(1, Ordering::SeqCst);
        let outcome = run_cycle(&*transcoder, &index, cycle_id, &config, &mut shutdown).await;
        let backoff = match outcome {
            CycleOutcome::Shutdown => return,
            CycleOutcome::ConnectionError => CONNECTION_ERROR_SLEEP,
            CycleOutcome::OtherError => OTHER_ERROR_SLEEP,
        };
        if interruptible_sleep(backoff, &shutdown).await.is_err() {
            info!("recorder shutting down");
            return;
        }
    }
}

/// Sleeps for `how_long`, or returns early if `shutdown` fires first, so
/// backoff and disk-low waits never hold up process shutdown.
async fn interruptible_sleep(how_long: Duration, shutdown: &shutdown::Receiver) -> Result<(), ()> {
    tokio::select! {
        _ = tokio::time::sleep(how_long) => Ok(()),
        _ = shutdown.as_future() => Err(()),
    }
}

enum CycleOutcome {
    Shutdown,
    ConnectionError,
    OtherError,
}

async fn run_cycle<T, C>(
    transcoder: &T,
    index: &SegmentIndex<C>,
    cycle_id: u64,
    config: &RecorderConfig,
    shutdown: &mut shutdown::Receiver,
) -> CycleOutcome
where
    T: TranscoderDriver,
    C: Clocks,
{
    let segment_pattern = config.segment_dir.join(format!("segment_cycle{cycle_id}_%03d.ts"));
    let segment_list_path = config.segment_dir.join(format!("segments_cycle{cycle_id}.m3u8"));

    let mut handle = match transcoder
        .start_segmenter(
            &config.input_url,
            &segment_pattern,
            &segment_list_path,
            config.seg_dur,
            cycle_id,
        )
        .await
    {
        Ok(h) => h,
        Err(e) => {
            warn!(cycle_id, error = %e.chain(), "failed to start segmenter");
            return if is_connection_error(&e.chain()) {
                CycleOutcome::ConnectionError
            } else {
                CycleOutcome::OtherError
            };
        }
    };

    let mut last_err_line = String::new();
    loop {
        tokio::select! {
            _ = shutdown.as_future() => {
                let _ = handle.child.start_kill();
                return CycleOutcome::Shutdown;
            }
            line = handle.next_stderr_line() => {
                match line {
                    Ok(Some(line)) => {
                        if let Some(path) = parse_opening_line(&line) {
                            let path = PathBuf::from(path);
                            if belongs_to_cycle(&path, cycle_id) {
                                let absolute = if path.is_absolute() {
                                    path
                                } else {
                                    config.segment_dir.join(path)
                                };
                                index.admit(absolute);
                            }
                        } else {
                            last_err_line = line;
                        }
                    }
                    Ok(None) => {
                        // stderr closed; fall through to waiting on process exit.
                        break;
                    }
                    Err(e) => {
                        warn!(cycle_id, error = %e.chain(), "error reading segmenter stderr");
                        break;
                    }
                }
            }
        }
    }

    let _ = handle.child.wait().await;
    info!(cycle_id, last_err_line, "segmenter cycle ended");
    if is_connection_error(&last_err_line) {
        CycleOutcome::ConnectionError
    } else {
        CycleOutcome::OtherError
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_opening_line() {
        let line = "Opening 'segment_cycle3_005.ts' for writing";
        assert_eq!(parse_opening_line(line), Some("segment_cycle3_005.ts"));
    }

    #[test]
    fn ignores_unrelated_lines() {
        assert_eq!(parse_opening_line("frame=  120 fps=25"), None);
    }

    #[test]
    fn classifies_connection_errors() {
        assert!(is_connection_error("Connection refused"));
        assert!(is_connection_error("rtsp://cam: Connection timed out"));
        assert!(!is_connection_error("Invalid data found when processing input"));
    }

    #[test]
    fn belongs_to_cycle_checks_prefix_and_suffix() {
        assert!(belongs_to_cycle(Path::new("segment_cycle3_005.ts"), 3));
        assert!(!belongs_to_cycle(Path::new("segment_cycle4_005.ts"), 3));
        assert!(!belongs_to_cycle(Path::new("segments_cycle3.m3u8"), 3));
    }
}
