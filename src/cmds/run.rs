// This file is part of Ringcam, an on-demand clip recorder for a live RTSP camera feed.
// Copyright (C) 2024 The Ringcam Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: MIT

//! Subcommand to run the recorder and the request façade until interrupted.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use base::clock::RealClocks;
use base::{shutdown, Error, ResultExt};
use bpaf::Bpaf;
use ringcam_core::recorder::{self, RecorderConfig};
use ringcam_core::segment::SegmentIndex;
use ringcam_core::transcoder::FfmpegDriver;
use tracing::info;

use crate::config::Config;
use crate::rate_limit::RateLimiter;
use crate::web::{self, AppState};

/// Runs the recorder and the request façade until interrupted.
#[derive(Bpaf, Clone, Debug)]
#[bpaf(command("run"))]
pub struct Args {
    /// Path to the TOML configuration file.
    #[bpaf(long, argument("PATH"), fallback(PathBuf::from("/etc/ringcam.toml")))]
    config: PathBuf,

    /// The number of worker threads used by the asynchronous runtime.
    /// Defaults to the number of cores on the system.
    #[bpaf(long, argument("N"))]
    worker_threads: Option<usize>,
}

pub fn run(args: Args) -> Result<i32, Error> {
    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if let Some(worker_threads) = args.worker_threads {
        builder.worker_threads(worker_threads);
    }
    builder.build().err_kind(base::ErrorKind::Internal)?.block_on(async_run(args))
}

async fn async_run(args: Args) -> Result<i32, Error> {
    let config = Arc::new(Config::load(&args.config)?);
    config.validate()?;

    let clocks = Arc::new(RealClocks::default());
    let index = Arc::new(SegmentIndex::new(clocks.clone(), config.n_max, config.seg_dur));
    let transcoder = Arc::new(FfmpegDriver::new(config.ffmpeg_bin.clone(), config.ffprobe_bin.clone()));

    let (shutdown_tx, shutdown_rx) = shutdown::channel();

    let recorder_config = RecorderConfig {
        input_url: config.rtsp_url.clone(),
        segment_dir: config.segment_dir.clone(),
        seg_dur: config.seg_dur,
    };
    let recorder_handle = tokio::spawn(recorder::run(
        transcoder.clone(),
        index.clone(),
        recorder_config,
        shutdown_rx.clone(),
    ));

    let http = reqwest::Client::new();
    let limiter = RateLimiter::new(clocks.clone(), Duration::from_secs(1));
    let state = Arc::new(AppState {
        config: config.clone(),
        index,
        transcoder,
        clocks,
        http,
        limiter,
    });
    let server_handle = tokio::spawn(web::serve(state, shutdown_rx));

    info!("ready to serve clip requests");
    tokio::signal::ctrl_c().await.err_kind(base::ErrorKind::Internal)?;
    info!("received interrupt; shutting down");
    drop(shutdown_tx);

    recorder_handle.await.err_kind(base::ErrorKind::Internal)?;
    server_handle.await.err_kind(base::ErrorKind::Internal)??;
    info!("exiting");
    Ok(0)
}
