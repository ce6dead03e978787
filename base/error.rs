// This file is part of Ringcam, an on-demand clip recorder for a live RTSP camera feed.
// Copyright (C) 2024 The Ringcam Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: MIT

//! A small gRPC-flavored error type shared across crates.
//!
//! Every fallible operation in this codebase returns [`Error`], which pairs a
//! coarse [`ErrorKind`] (used by the web façade to pick an HTTP status code)
//! with a message and an optional source error for the logs.

use std::fmt;

/// Coarse classification of an error, modeled on
/// [gRPC status codes](https://grpc.github.io/grpc/core/md_doc_statuscodes.html).
/// The web façade maps these to HTTP status codes; everything else just logs
/// the full chain.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
#[non_exhaustive]
pub enum ErrorKind {
    Unknown,
    InvalidArgument,
    DeadlineExceeded,
    NotFound,
    ResourceExhausted,
    FailedPrecondition,
    Unavailable,
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            ErrorKind::Unknown => "unknown",
            ErrorKind::InvalidArgument => "invalid argument",
            ErrorKind::DeadlineExceeded => "deadline exceeded",
            ErrorKind::NotFound => "not found",
            ErrorKind::ResourceExhausted => "resource exhausted",
            ErrorKind::FailedPrecondition => "failed precondition",
            ErrorKind::Unavailable => "unavailable",
            ErrorKind::Internal => "internal",
        };
        f.write_str(s)
    }
}

/// An error with a [`kind`](Error::kind), a message, and an optional source.
pub struct Error {
    kind: ErrorKind,
    msg: String,
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl Error {
    pub fn new(kind: ErrorKind, msg: impl Into<String>) -> Self {
        Error {
            kind,
            msg: msg.into(),
            source: None,
        }
    }

    pub fn wrap(
        kind: ErrorKind,
        msg: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Error {
            kind,
            msg: msg.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Returns a multi-line rendering of this error and its full source chain.
    pub fn chain(&self) -> String {
        use std::fmt::Write;
        let mut out = self.msg.clone();
        let mut cause: Option<&(dyn std::error::Error + 'static)> = self
            .source
            .as_deref()
            .map(|e| e as &(dyn std::error::Error + 'static));
        while let Some(c) = cause {
            write!(&mut out, "\ncaused by: {c}").unwrap();
            cause = c.source();
        }
        out
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.msg)
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_deref()
            .map(|e| e as &(dyn std::error::Error + 'static))
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Error {
        let kind = match e.kind() {
            std::io::ErrorKind::NotFound => ErrorKind::NotFound,
            std::io::ErrorKind::TimedOut => ErrorKind::DeadlineExceeded,
            _ => ErrorKind::Internal,
        };
        Error::wrap(kind, "I/O error", e)
    }
}

/// Extension methods for annotating a foreign `Result` with an [`ErrorKind`].
pub trait ResultExt<T> {
    fn err_kind(self, k: ErrorKind) -> Result<T, Error>;
}

impl<T, E> ResultExt<T> for Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn err_kind(self, k: ErrorKind) -> Result<T, Error> {
        self.map_err(|e| Error::wrap(k, e.to_string(), e))
    }
}

/// Like `anyhow::bail!`, but the first argument specifies a type as an [`ErrorKind`].
///
/// ```
/// use ringcam_base::bail_t;
/// let e = || -> Result<(), ringcam_base::Error> {
///     bail_t!(NotFound, "no segments for stream {}", "front-door");
/// }().unwrap_err();
/// assert_eq!(e.kind(), ringcam_base::ErrorKind::NotFound);
/// ```
#[macro_export]
macro_rules! bail_t {
    ($t:ident, $e:expr) => {
        return Err($crate::Error::new($crate::ErrorKind::$t, $e));
    };
    ($t:ident, $fmt:expr, $($arg:tt)+) => {
        return Err($crate::Error::new($crate::ErrorKind::$t, format!($fmt, $($arg)+)));
    };
}

/// Like [`bail_t!`], but returns the error value rather than returning from the
/// enclosing function.
#[macro_export]
macro_rules! format_err_t {
    ($t:ident, $e:expr) => {
        $crate::Error::new($crate::ErrorKind::$t, $e)
    };
    ($t:ident, $fmt:expr, $($arg:tt)+) => {
        $crate::Error::new($crate::ErrorKind::$t, format!($fmt, $($arg)+))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_includes_source() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk full");
        let e = Error::wrap(ErrorKind::Internal, "writing segment", io);
        assert!(e.chain().contains("disk full"));
    }

    #[test]
    fn bail_t_sets_kind() {
        let e = (|| -> Result<(), Error> {
            bail_t!(NotFound, "no segments for {}", "front-door");
        })()
        .unwrap_err();
        assert_eq!(e.kind(), ErrorKind::NotFound);
        assert_eq!(e.to_string(), "not found: no segments for front-door");
    }
}
