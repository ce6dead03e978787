// This file is part of Ringcam, an on-demand clip recorder for a live RTSP camera feed.
// Copyright (C) 2024 The Ringcam Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: MIT

pub mod check;
pub mod run;
