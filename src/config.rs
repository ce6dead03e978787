// This file is part of Ringcam, an on-demand clip recorder for a live RTSP camera feed.
// Copyright (C) 2024 The Ringcam Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: MIT

//! Startup configuration (§4.C): a TOML file plus select environment
//! variable overrides for container deployments.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use base::{bail_t, Error, ResultExt};
use ringcam_core::delivery::DestinationCredentials;
use ringcam_core::request::Destination;
use serde::Deserialize;

fn default_seg_dur_secs() -> u64 {
    5
}

fn default_n_max() -> usize {
    62
}

fn default_ffmpeg_bin() -> PathBuf {
    PathBuf::from("ffmpeg")
}

fn default_ffprobe_bin() -> PathBuf {
    PathBuf::from("ffprobe")
}

#[derive(Deserialize)]
struct RawConfig {
    rtsp_url: String,
    #[serde(default = "default_listen_addr")]
    listen_addr: String,
    segment_dir: PathBuf,
    #[serde(default = "default_seg_dur_secs")]
    seg_dur_secs: u64,
    #[serde(default = "default_n_max")]
    n_max: usize,
    #[serde(default = "default_ffmpeg_bin")]
    ffmpeg_bin: PathBuf,
    #[serde(default = "default_ffprobe_bin")]
    ffprobe_bin: PathBuf,
    #[serde(default)]
    destinations: RawDestinations,
}

fn default_listen_addr() -> String {
    "0.0.0.0:8080".to_owned()
}

#[derive(Deserialize, Default)]
struct RawDestinations {
    telegram: Option<RawTelegram>,
    mattermost: Option<RawMattermost>,
    discord: Option<RawDiscord>,
}

#[derive(Deserialize)]
struct RawTelegram {
    bot_token: String,
    chat_id: String,
}

#[derive(Deserialize)]
struct RawMattermost {
    base_url: String,
    token: String,
    channel_id: String,
}

#[derive(Deserialize)]
struct RawDiscord {
    webhook_url: String,
}

/// Fully resolved, immutable startup configuration. Threaded through as
/// `Arc<Config>`.
pub struct Config {
    pub rtsp_url: String,
    pub listen_addr: SocketAddr,
    pub segment_dir: PathBuf,
    pub seg_dur: Duration,
    pub n_max: usize,
    pub ffmpeg_bin: PathBuf,
    pub ffprobe_bin: PathBuf,
    pub destination_credentials: HashMap<Destination, DestinationCredentials>,
}

impl Config {
    /// Loads configuration from `path`, then applies `RINGCAM_*` environment
    /// overrides (rtsp url, listen port, segment directory) on top.
    pub fn load(path: &Path) -> Result<Config, Error> {
        let text = std::fs::read_to_string(path).err_kind(base::ErrorKind::NotFound)?;
        let mut raw: RawConfig = toml::from_str(&text).err_kind(base::ErrorKind::InvalidArgument)?;

        if let Ok(url) = std::env::var("RINGCAM_RTSP_URL") {
            raw.rtsp_url = url;
        }
        if let Ok(port) = std::env::var("RINGCAM_PORT") {
            let host = raw
                .listen_addr
                .rsplit_once(':')
                .map(|(h, _)| h.to_owned())
                .unwrap_or_else(|| "0.0.0.0".to_owned());
            raw.listen_addr = format!("{host}:{port}");
        }
        if let Ok(dir) = std::env::var("RINGCAM_SEGMENT_DIR") {
            raw.segment_dir = PathBuf::from(dir);
        }

        let listen_addr = raw
            .listen_addr
            .parse()
            .err_kind(base::ErrorKind::InvalidArgument)?;

        let mut destination_credentials = HashMap::new();
        if let Some(t) = raw.destinations.telegram {
            destination_credentials.insert(
                Destination::Telegram,
                DestinationCredentials::Telegram {
                    bot_token: t.bot_token,
                    chat_id: t.chat_id,
                },
            );
        }
        if let Some(m) = raw.destinations.mattermost {
            destination_credentials.insert(
                Destination::Mattermost,
                DestinationCredentials::Mattermost {
                    base_url: m.base_url,
                    token: m.token,
                    channel_id: m.channel_id,
                },
            );
        }
        if let Some(d) = raw.destinations.discord {
            destination_credentials.insert(
                Destination::Discord,
                DestinationCredentials::Discord { webhook_url: d.webhook_url },
            );
        }

        Ok(Config {
            rtsp_url: raw.rtsp_url,
            listen_addr,
            segment_dir: raw.segment_dir,
            seg_dur: Duration::from_secs(raw.seg_dur_secs),
            n_max: raw.n_max,
            ffmpeg_bin: raw.ffmpeg_bin,
            ffprobe_bin: raw.ffprobe_bin,
            destination_credentials,
        })
    }

    /// Validates that the configuration is usable without starting the
    /// recorder or listener: used by the `check` subcommand.
    pub fn validate(&self) -> Result<(), Error> {
        if !self.segment_dir.is_dir() {
            bail_t!(
                FailedPrecondition,
                "segment_dir {:?} does not exist or is not a directory",
                self.segment_dir
            );
        }
        if self.destination_credentials.is_empty() {
            bail_t!(FailedPrecondition, "no destination credentials configured");
        }
        if self.n_max == 0 {
            bail_t!(InvalidArgument, "n_max must be positive");
        }
        Ok(())
    }

    pub fn configured_destinations(&self) -> Vec<Destination> {
        self.destination_credentials.keys().copied().collect()
    }
}
