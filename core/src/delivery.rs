// This file is part of Ringcam, an on-demand clip recorder for a live RTSP camera feed.
// Copyright (C) 2024 The Ringcam Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: MIT

//! The delivery pipeline (C5): per-destination size adaptation, parallel
//! fan-out, bounded retries, and cleanup.
//!
//! Destinations are represented as a capability value (§9) rather than a
//! conditional chain, so the retry loop is a single generic function.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use base::{bail_t, Error, ResultExt};
use jiff::civil::Date;
use reqwest::multipart;
use tracing::{info, warn};

use crate::extractor::ClipArtifact;
use crate::request::Destination;
use crate::transcoder::TranscoderDriver;

/// Additional attempts beyond the first, per destination (§7).
const RETRY_ATTEMPTS: u32 = 3;
const RETRY_DELAY: Duration = Duration::from_secs(5);
const HTTP_TIMEOUT: Duration = Duration::from_secs(60);

/// Credentials for a single configured destination.
#[derive(Clone, Debug)]
pub enum DestinationCredentials {
    Telegram { bot_token: String, chat_id: String },
    Mattermost { base_url: String, token: String, channel_id: String },
    Discord { webhook_url: String },
}

/// A destination's capability value: its size cap, caption template, and
/// upload behavior, bundled so the retry loop treats every destination
/// uniformly.
struct Capability<'a> {
    destination: Destination,
    cap_bytes: u64,
    credentials: &'a DestinationCredentials,
}

fn cap_bytes_for(destination: Destination) -> u64 {
    match destination {
        Destination::Telegram => 50_000_000,
        Destination::Mattermost => 100_000_000,
        Destination::Discord => 10_000_000,
    }
}

fn caption(destination: Destination, category: Option<&str>) -> String {
    let today = jiff_today_string();
    let category_part = category.map(|c| format!("{c} ")).unwrap_or_default();
    match destination {
        Destination::Telegram => format!(
            "New {category_part}Clip: {today}\n(if distorted, download and view elsewhere)"
        ),
        Destination::Mattermost | Destination::Discord => format!("New {category_part}Clip: {today}"),
    }
}

fn jiff_today_string() -> String {
    let today: Date = jiff::Zoned::now().date();
    format!("{today}")
}

/// Outcome of delivering to every requested destination.
pub struct DeliveryResult {
    pub failures: Vec<(Destination, Error)>,
}

impl DeliveryResult {
    pub fn all_succeeded(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Delivers `artifact` to every destination in `destinations` in parallel,
/// applying size adaptation and the retry policy per destination, then
/// deletes every file this call created (including the original artifact).
pub async fn deliver<T: TranscoderDriver>(
    transcoder: &T,
    http: &reqwest::Client,
    artifact: &ClipArtifact,
    destinations: &[Destination],
    credentials: &HashMap<Destination, DestinationCredentials>,
    category: Option<&str>,
) -> DeliveryResult {
    let mut tasks = Vec::with_capacity(destinations.len());
    let mut attempted = Vec::with_capacity(destinations.len());
    let mut failures = Vec::new();
    for &destination in destinations {
        match credentials.get(&destination) {
            Some(creds) => {
                attempted.push(destination);
                tasks.push(deliver_one(transcoder, http, artifact, destination, creds, category));
            }
            None => {
                warn!(%destination, "no credentials configured; skipping delivery");
                failures.push((
                    destination,
                    base::format_err_t!(FailedPrecondition, "no credentials configured for {destination}"),
                ));
            }
        }
    }
    let results = futures::future::join_all(tasks).await;

    for (destination, result) in attempted.into_iter().zip(results) {
        if let Err(e) = result {
            warn!(%destination, error = %e.chain(), "delivery failed after retries");
            failures.push((destination, e));
        }
    }

    if let Err(e) = tokio::fs::remove_file(&artifact.path).await {
        warn!(path = %artifact.path.display(), error = %e, "failed to delete clip artifact after delivery");
    }

    DeliveryResult { failures }
}

async fn deliver_one<T: TranscoderDriver>(
    transcoder: &T,
    http: &reqwest::Client,
    artifact: &ClipArtifact,
    destination: Destination,
    credentials: &DestinationCredentials,
    category: Option<&str>,
) -> Result<(), Error> {
    let cap = Capability {
        destination,
        cap_bytes: cap_bytes_for(destination),
        credentials,
    };

    let (send_path, reencoded_path) = prepare_artifact(transcoder, artifact, &cap).await?;
    let body = caption(destination, category);

    let mut last_err = None;
    for attempt in 0..=RETRY_ATTEMPTS {
        if attempt > 0 {
            tokio::time::sleep(RETRY_DELAY).await;
        }
        match upload(http, &cap, &send_path, &body).await {
            Ok(()) => {
                info!(%destination, attempt, "delivered clip");
                last_err = None;
                break;
            }
            Err(e) => {
                warn!(%destination, attempt, error = %e.chain(), "upload attempt failed");
                last_err = Some(e);
            }
        }
    }

    if let Some(path) = reencoded_path {
        if let Err(e) = tokio::fs::remove_file(&path).await {
            warn!(path = %path.display(), error = %e, "failed to delete per-destination re-encode");
        }
    }

    match last_err {
        Some(e) => Err(base::format_err_t!(Unavailable, "delivery to {destination} failed: {}", e.chain())),
        None => Ok(()),
    }
}

/// Re-encodes the artifact for this destination if it exceeds the cap.
/// Returns the path to upload and, if a re-encode happened, the path to
/// delete afterward.
async fn prepare_artifact<T: TranscoderDriver>(
    transcoder: &T,
    artifact: &ClipArtifact,
    cap: &Capability<'_>,
) -> Result<(PathBuf, Option<PathBuf>), Error> {
    if artifact.size_bytes <= cap.cap_bytes {
        return Ok((artifact.path.clone(), None));
    }
    let basename = artifact
        .path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("clip.mp4");
    let dest_name = format!("compressed_{}_{}", cap.destination, basename);
    let output_path = artifact
        .path
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .join(dest_name);
    let outcome = transcoder.reencode(&artifact.path, cap.cap_bytes, &output_path).await?;
    if !outcome.met_target {
        warn!(
            destination = %cap.destination,
            cap = %base::strutil::encode_size(cap.cap_bytes as i64),
            "re-encode did not meet size cap; delivering largest attempt anyway"
        );
    }
    Ok((outcome.output_path.clone(), Some(outcome.output_path)))
}

async fn upload(http: &reqwest::Client, cap: &Capability<'_>, path: &Path, caption: &str) -> Result<(), Error> {
    let bytes = tokio::fs::read(path).await.err_kind(base::ErrorKind::Internal)?;
    match cap.credentials {
        DestinationCredentials::Telegram { bot_token, chat_id } => {
            let form = multipart::Form::new()
                .text("chat_id", chat_id.clone())
                .text("caption", caption.to_owned())
                .part("video", multipart::Part::bytes(bytes).file_name("clip.mp4"));
            let url = format!("https://api.telegram.org/bot{bot_token}/sendVideo");
            send_multipart(http, &url, form, None).await
        }
        DestinationCredentials::Mattermost {
            base_url,
            token,
            channel_id,
        } => deliver_mattermost(http, base_url, token, channel_id, path, &bytes, caption).await,
        DestinationCredentials::Discord { webhook_url } => {
            let form = multipart::Form::new()
                .text("content", caption.to_owned())
                .part("file", multipart::Part::bytes(bytes).file_name("clip.mp4"));
            send_multipart(http, webhook_url, form, None).await
        }
    }
}

async fn send_multipart(
    http: &reqwest::Client,
    url: &str,
    form: multipart::Form,
    bearer: Option<&str>,
) -> Result<(), Error> {
    let mut req = http.post(url).timeout(HTTP_TIMEOUT).multipart(form);
    if let Some(token) = bearer {
        req = req.bearer_auth(token);
    }
    let response = req.send().await.err_kind(base::ErrorKind::Unavailable)?;
    if !response.status().is_success() {
        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        bail_t!(Unavailable, "upload to {url} failed with {status}: {text}");
    }
    Ok(())
}

#[derive(serde::Deserialize)]
struct MattermostFileInfo {
    id: String,
}

#[derive(serde::Deserialize)]
struct MattermostFilesResponse {
    file_infos: Vec<MattermostFileInfo>,
}

async fn deliver_mattermost(
    http: &reqwest::Client,
    base_url: &str,
    token: &str,
    channel_id: &str,
    path: &Path,
    bytes: &[u8],
    message: &str,
) -> Result<(), Error> {
    let form = multipart::Form::new()
        .text("channel_id", channel_id.to_owned())
        .part(
            "files",
            multipart::Part::bytes(bytes.to_vec()).file_name(
                path.file_name()
                    .and_then(|n| n.to_str())
                    .unwrap_or("clip.mp4")
                    .to_owned(),
            ),
        );
    let response = http
        .post(format!("{base_url}/api/v4/files"))
        .timeout(HTTP_TIMEOUT)
        .bearer_auth(token)
        .multipart(form)
        .send()
        .await
        .err_kind(base::ErrorKind::Unavailable)?;
    if !response.status().is_success() {
        let status = response.status();
        bail_t!(Unavailable, "mattermost file upload failed with {status}");
    }
    let parsed: MattermostFilesResponse = response.json().await.err_kind(base::ErrorKind::Internal)?;
    let file_ids: Vec<String> = parsed.file_infos.into_iter().map(|f| f.id).collect();
    if file_ids.is_empty() {
        bail_t!(Internal, "mattermost file upload returned no file ids");
    }

    let post_body = serde_json::json!({
        "channel_id": channel_id,
        "message": message,
        "file_ids": file_ids,
    });
    let response = http
        .post(format!("{base_url}/api/v4/posts"))
        .timeout(HTTP_TIMEOUT)
        .bearer_auth(token)
        .json(&post_body)
        .send()
        .await
        .err_kind(base::ErrorKind::Unavailable)?;
    if !response.status().is_success() {
        let status = response.status();
        bail_t!(Unavailable, "mattermost post failed with {status}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn caption_includes_category_and_date() {
        let c = caption(Destination::Discord, Some("front-door"));
        assert!(c.starts_with("New front-door Clip: "));
    }

    #[test]
    fn caption_omits_category_when_absent() {
        let c = caption(Destination::Telegram, None);
        assert!(c.starts_with("New Clip: "));
        assert!(c.contains("distorted"));
    }

    #[test]
    fn cap_bytes_match_contract_table() {
        assert_eq!(cap_bytes_for(Destination::Telegram), 50_000_000);
        assert_eq!(cap_bytes_for(Destination::Mattermost), 100_000_000);
        assert_eq!(cap_bytes_for(Destination::Discord), 10_000_000);
    }
}
