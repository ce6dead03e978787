// This file is part of Ringcam, an on-demand clip recorder for a live RTSP camera feed.
// Copyright (C) 2024 The Ringcam Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: MIT

//! Subcommand to validate the configuration file without starting anything.

use base::Error;
use bpaf::Bpaf;
use std::path::PathBuf;
use tracing::info;

use crate::config::Config;

/// Validates the configuration file and exits, without starting the
/// recorder or the request façade.
#[derive(Bpaf, Clone, Debug)]
#[bpaf(command("check"))]
pub struct Args {
    /// Path to the TOML configuration file.
    #[bpaf(long, argument("PATH"), fallback(PathBuf::from("/etc/ringcam.toml")))]
    config: PathBuf,
}

pub fn run(args: Args) -> Result<i32, Error> {
    let config = Config::load(&args.config)?;
    config.validate()?;
    info!(
        rtsp_url = %config.rtsp_url,
        destinations = config.destination_credentials.len(),
        "configuration is valid"
    );
    Ok(0)
}
