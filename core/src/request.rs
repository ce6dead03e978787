// This file is part of Ringcam, an on-demand clip recorder for a live RTSP camera feed.
// Copyright (C) 2024 The Ringcam Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: MIT

//! The `ClipRequest` type shared between the façade (parsing/validation) and
//! the extractor/delivery pipeline (consumption).

use std::time::Duration;

use base::{bail_t, Error};

/// Largest accepted backtrack, in seconds: `B ∈ [0, 300]`.
pub const MAX_BACKTRACK_SECS: u64 = 300;

/// Accepted clip duration range, in seconds: `D ∈ [1, 300]`.
pub const MIN_DURATION_SECS: u64 = 1;
pub const MAX_DURATION_SECS: u64 = 300;

/// One of the destinations a clip may be delivered to.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Hash)]
pub enum Destination {
    Telegram,
    Mattermost,
    Discord,
}

impl Destination {
    pub fn parse(s: &str) -> Option<Destination> {
        match s.trim().to_ascii_lowercase().as_str() {
            "telegram" => Some(Destination::Telegram),
            "mattermost" => Some(Destination::Mattermost),
            "discord" => Some(Destination::Discord),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Destination::Telegram => "telegram",
            Destination::Mattermost => "mattermost",
            Destination::Discord => "discord",
        }
    }
}

impl std::fmt::Display for Destination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A validated request to extract and deliver a clip.
///
/// Constructed only via [`ClipRequest::validate`]; every instance in
/// circulation already satisfies the range invariants in the data model.
#[derive(Clone, Debug)]
pub struct ClipRequest {
    pub backtrack: Duration,
    pub duration: Duration,
    pub destinations: Vec<Destination>,
    pub category: Option<String>,
}

impl ClipRequest {
    /// Validates raw, caller-supplied fields into a [`ClipRequest`].
    ///
    /// `configured` lists destinations for which the façade has credentials;
    /// requesting an unconfigured destination is `InputInvalid`, same as an
    /// out-of-range backtrack/duration or an empty/unparseable destination
    /// list.
    pub fn validate(
        backtrack_seconds: i64,
        duration_seconds: i64,
        destinations_csv: &str,
        category: Option<String>,
        configured: &[Destination],
    ) -> Result<ClipRequest, Error> {
        if backtrack_seconds < 0 || backtrack_seconds as u64 > MAX_BACKTRACK_SECS {
            bail_t!(
                InvalidArgument,
                "backtrack_seconds must be within [0, {MAX_BACKTRACK_SECS}], got {backtrack_seconds}"
            );
        }
        if duration_seconds < MIN_DURATION_SECS as i64 || duration_seconds as u64 > MAX_DURATION_SECS {
            bail_t!(
                InvalidArgument,
                "duration_seconds must be within [{MIN_DURATION_SECS}, {MAX_DURATION_SECS}], got {duration_seconds}"
            );
        }

        let mut destinations = Vec::new();
        for raw in destinations_csv.split(',') {
            let raw = raw.trim();
            if raw.is_empty() {
                continue;
            }
            let Some(dest) = Destination::parse(raw) else {
                bail_t!(InvalidArgument, "unrecognized destination {raw:?}");
            };
            if !configured.contains(&dest) {
                bail_t!(InvalidArgument, "destination {dest} has no configured credentials");
            }
            if !destinations.contains(&dest) {
                destinations.push(dest);
            }
        }
        if destinations.is_empty() {
            bail_t!(InvalidArgument, "at least one destination is required");
        }

        Ok(ClipRequest {
            backtrack: Duration::from_secs(backtrack_seconds as u64),
            duration: Duration::from_secs(duration_seconds as u64),
            destinations,
            category,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_out_of_range_backtrack() {
        let e = ClipRequest::validate(301, 10, "discord", None, &[Destination::Discord]).unwrap_err();
        assert_eq!(e.kind(), base::ErrorKind::InvalidArgument);
    }

    #[test]
    fn rejects_unconfigured_destination() {
        let e = ClipRequest::validate(0, 10, "telegram", None, &[Destination::Discord]).unwrap_err();
        assert_eq!(e.kind(), base::ErrorKind::InvalidArgument);
    }

    #[test]
    fn dedupes_and_parses_case_insensitively() {
        let req = ClipRequest::validate(
            5,
            10,
            "Discord, discord , DISCORD",
            Some("test".to_owned()),
            &[Destination::Discord],
        )
        .unwrap();
        assert_eq!(req.destinations, vec![Destination::Discord]);
    }
}
