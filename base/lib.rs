// This file is part of Ringcam, an on-demand clip recorder for a live RTSP camera feed.
// Copyright (C) 2024 The Ringcam Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: MIT

pub mod clock;
pub mod shutdown;
pub mod strutil;
pub mod tracing_setup;

mod error;

pub use crate::error::{Error, ErrorKind, ResultExt};
