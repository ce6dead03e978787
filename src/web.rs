// This file is part of Ringcam, an on-demand clip recorder for a live RTSP camera feed.
// Copyright (C) 2024 The Ringcam Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: MIT

//! The request façade (C6): a minimal `hyper` listener that parses, validates,
//! rate-limits, acknowledges immediately, then hands off to the extractor and
//! delivery pipeline in a background task.

use std::convert::Infallible;
use std::sync::Arc;

use base::clock::RealClocks;
use base::ResultExt;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use nom::bytes::complete::{is_not, tag};
use nom::multi::separated_list1;
use nom::sequence::separated_pair;
use nom::IResult;
use ringcam_core::delivery;
use ringcam_core::extractor;
use ringcam_core::request::ClipRequest;
use ringcam_core::segment::SegmentIndex;
use ringcam_core::transcoder::FfmpegDriver;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::rate_limit::RateLimiter;

/// Shared state for every request handler.
pub struct AppState {
    pub config: Arc<Config>,
    pub index: Arc<SegmentIndex<RealClocks>>,
    pub transcoder: Arc<FfmpegDriver>,
    pub clocks: Arc<RealClocks>,
    pub http: reqwest::Client,
    pub limiter: RateLimiter<RealClocks>,
}

fn query_pairs(input: &str) -> IResult<&str, Vec<(&str, &str)>> {
    separated_list1(tag("&"), separated_pair(is_not("&="), tag("="), is_not("&")))(input)
}

fn percent_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b'%' if i + 2 < bytes.len() => {
                if let Ok(byte) = u8::from_str_radix(&s[i + 1..i + 3], 16) {
                    out.push(byte);
                    i += 3;
                } else {
                    out.push(bytes[i]);
                    i += 1;
                }
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

struct RawRequest {
    backtrack_seconds: i64,
    duration_seconds: i64,
    destinations: String,
    category: Option<String>,
}

fn parse_query(query: &str) -> Result<RawRequest, base::Error> {
    let (_, pairs) = query_pairs(query).map_err(|e| {
        base::format_err_t!(InvalidArgument, "malformed query string: {e}")
    })?;

    let mut backtrack_seconds = None;
    let mut duration_seconds = None;
    let mut destinations = None;
    let mut category = None;
    for (key, value) in pairs {
        let value = percent_decode(value);
        match key {
            "backtrack_seconds" => {
                backtrack_seconds = Some(value.parse::<i64>().map_err(|_| {
                    base::format_err_t!(InvalidArgument, "backtrack_seconds must be an integer")
                })?)
            }
            "duration_seconds" => {
                duration_seconds = Some(value.parse::<i64>().map_err(|_| {
                    base::format_err_t!(InvalidArgument, "duration_seconds must be an integer")
                })?)
            }
            "destinations" => destinations = Some(value),
            "category" => category = Some(value),
            _ => {}
        }
    }

    Ok(RawRequest {
        backtrack_seconds: backtrack_seconds
            .ok_or_else(|| base::format_err_t!(InvalidArgument, "missing backtrack_seconds"))?,
        duration_seconds: duration_seconds
            .ok_or_else(|| base::format_err_t!(InvalidArgument, "missing duration_seconds"))?,
        destinations: destinations
            .ok_or_else(|| base::format_err_t!(InvalidArgument, "missing destinations"))?,
        category,
    })
}

#[derive(serde::Deserialize)]
struct JsonBody {
    backtrack_seconds: i64,
    duration_seconds: i64,
    destinations: String,
    #[serde(default)]
    category: Option<String>,
}

impl From<JsonBody> for RawRequest {
    fn from(b: JsonBody) -> Self {
        RawRequest {
            backtrack_seconds: b.backtrack_seconds,
            duration_seconds: b.duration_seconds,
            destinations: b.destinations,
            category: b.category,
        }
    }
}

fn status_for(kind: base::ErrorKind) -> StatusCode {
    match kind {
        base::ErrorKind::InvalidArgument => StatusCode::BAD_REQUEST,
        base::ErrorKind::ResourceExhausted => StatusCode::TOO_MANY_REQUESTS,
        base::ErrorKind::NotFound => StatusCode::NOT_FOUND,
        base::ErrorKind::DeadlineExceeded => StatusCode::GATEWAY_TIMEOUT,
        base::ErrorKind::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn json_response(status: StatusCode, message: &str) -> Response<Full<Bytes>> {
    let body = serde_json::json!({ "message": message }).to_string();
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Full::new(Bytes::from(body)))
        .expect("response with fixed headers is valid")
}

fn error_response(e: &base::Error) -> Response<Full<Bytes>> {
    json_response(status_for(e.kind()), &e.to_string())
}

async fn handle(req: Request<Incoming>, state: Arc<AppState>) -> Result<Response<Full<Bytes>>, Infallible> {
    let raw = match (req.method(), req.uri().query()) {
        (&Method::GET, Some(query)) => parse_query(query),
        (&Method::POST, _) => {
            let body = match req.into_body().collect().await {
                Ok(b) => b.to_bytes(),
                Err(e) => {
                    return Ok(error_response(&base::format_err_t!(
                        InvalidArgument,
                        "failed to read request body: {e}"
                    )))
                }
            };
            serde_json::from_slice::<JsonBody>(&body)
                .map(RawRequest::from)
                .map_err(|e| base::format_err_t!(InvalidArgument, "invalid JSON body: {e}"))
        }
        _ => Err(base::format_err_t!(InvalidArgument, "GET requires a query string")),
    };

    let raw = match raw {
        Ok(r) => r,
        Err(e) => return Ok(error_response(&e)),
    };

    let configured = state.config.configured_destinations();
    let clip_request = match ClipRequest::validate(
        raw.backtrack_seconds,
        raw.duration_seconds,
        &raw.destinations,
        raw.category,
        &configured,
    ) {
        Ok(r) => r,
        Err(e) => return Ok(error_response(&e)),
    };

    if !state.limiter.try_acquire() {
        return Ok(json_response(StatusCode::TOO_MANY_REQUESTS, "rate limit exceeded"));
    }

    info!(
        backtrack = ?clip_request.backtrack,
        duration = ?clip_request.duration,
        destinations = ?clip_request.destinations,
        "accepted clip request"
    );
    tokio::spawn(run_request(state.clone(), clip_request));

    Ok(json_response(StatusCode::OK, "accepted"))
}

async fn run_request(state: Arc<AppState>, request: ClipRequest) {
    let t_req = state.clocks.realtime();
    let artifact = extractor::extract(
        &*state.transcoder,
        &state.index,
        &state.config.segment_dir,
        request.backtrack,
        request.duration,
        t_req,
    )
    .await;

    let artifact = match artifact {
        Ok(a) => a,
        Err(e) => {
            warn!(error = %e.chain(), "clip extraction failed");
            return;
        }
    };

    let result = delivery::deliver(
        &*state.transcoder,
        &state.http,
        &artifact,
        &request.destinations,
        &state.config.destination_credentials,
        request.category.as_deref(),
    )
    .await;

    if !result.all_succeeded() {
        for (destination, e) in &result.failures {
            error!(%destination, error = %e.chain(), "delivery failed");
        }
    }
}

/// Runs the façade's HTTP listener until `shutdown` fires, then drains
/// in-flight connections before returning.
pub async fn serve(state: Arc<AppState>, shutdown: base::shutdown::Receiver) -> Result<(), base::Error> {
    let listener = TcpListener::bind(state.config.listen_addr)
        .await
        .err_kind(base::ErrorKind::Internal)?;
    info!(addr = %state.config.listen_addr, "façade listening");

    let graceful = hyper_util::server::graceful::GracefulShutdown::new();

    loop {
        tokio::select! {
            _ = shutdown.as_future() => break,
            accepted = listener.accept() => {
                let (stream, _) = match accepted {
                    Ok(x) => x,
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        continue;
                    }
                };
                let io = TokioIo::new(stream);
                let state = state.clone();
                let service = service_fn(move |req| handle(req, state.clone()));
                let conn = http1::Builder::new().serve_connection(io, service);
                let conn = graceful.watch(conn);
                tokio::spawn(async move {
                    if let Err(e) = conn.await {
                        warn!(error = %e, "connection error");
                    }
                });
            }
        }
    }

    info!("façade shutting down; draining in-flight connections");
    graceful.shutdown().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_query_pairs() {
        let (_, pairs) = query_pairs("backtrack_seconds=10&duration_seconds=10&destinations=discord").unwrap();
        assert_eq!(pairs.len(), 3);
        assert_eq!(pairs[0], ("backtrack_seconds", "10"));
    }

    #[test]
    fn percent_decodes_plus_and_escapes() {
        assert_eq!(percent_decode("front+door"), "front door");
        assert_eq!(percent_decode("100%25"), "100%");
    }
}
