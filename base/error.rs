// This file is part of Lookback, a continuous screen activity recorder.
// Copyright (C) 2025 The Lookback Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Error type carrying a classification kind, a message, and a source chain.
//!
//! Construct errors through the [`err!`](crate::err!) and
//! [`bail!`](crate::bail!) macros:
//!
//! ```
//! use lookback_base::{bail, err, Error, ErrorKind};
//! let e = err!(NotFound, msg("no video {}", 42));
//! assert_eq!(e.kind(), ErrorKind::NotFound);
//! let f = || -> Result<(), Error> { bail!(InvalidArgument, msg("empty query")) };
//! assert_eq!(f().unwrap_err().kind(), ErrorKind::InvalidArgument);
//! ```

use std::fmt;

/// Error kind.
///
/// These codes are taken from
/// [grpc::StatusCode](https://github.com/grpc/grpc/blob/master/include/grpcpp/impl/codegen/status_code_enum.h),
/// which is a nice general-purpose classification of errors.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
#[non_exhaustive]
#[rustfmt::skip]
pub enum ErrorKind {
    Cancelled,
    Unknown,
    InvalidArgument,
    DeadlineExceeded,
    NotFound,
    AlreadyExists,
    PermissionDenied,
    Unauthenticated,
    ResourceExhausted,
    FailedPrecondition,
    Aborted,
    OutOfRange,
    Unimplemented,
    Internal,
    Unavailable,
    DataLoss,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ErrorKind::Cancelled => "Cancelled",
            ErrorKind::Unknown => "Unknown",
            ErrorKind::InvalidArgument => "Invalid argument",
            ErrorKind::DeadlineExceeded => "Deadline exceeded",
            ErrorKind::NotFound => "Not found",
            ErrorKind::AlreadyExists => "Already exists",
            ErrorKind::PermissionDenied => "Permission denied",
            ErrorKind::Unauthenticated => "Unauthenticated",
            ErrorKind::ResourceExhausted => "Resource exhausted",
            ErrorKind::FailedPrecondition => "Failed precondition",
            ErrorKind::Aborted => "Aborted",
            ErrorKind::OutOfRange => "Out of range",
            ErrorKind::Unimplemented => "Unimplemented",
            ErrorKind::Internal => "Internal",
            ErrorKind::Unavailable => "Unavailable",
            ErrorKind::DataLoss => "Data loss",
        })
    }
}

type BoxedSource = Box<dyn std::error::Error + Send + Sync + 'static>;

struct Inner {
    kind: ErrorKind,
    msg: Option<String>,
    source: Option<BoxedSource>,
}

/// An error with a [`ErrorKind`], an optional message, and an optional source.
///
/// Boxed so that `Result<T, Error>` stays a pointer wide on the happy path.
pub struct Error(Box<Inner>);

impl Error {
    pub fn kind(&self) -> ErrorKind {
        self.0.kind
    }

    pub fn msg(&self) -> Option<&str> {
        self.0.msg.as_deref()
    }

    /// Returns an object which displays the full cause chain on a single
    /// line, for structured log fields: `err = %e.chain()`.
    pub fn chain(&self) -> Chain<'_> {
        Chain(self)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.msg.as_deref() {
            Some(msg) => write!(f, "{}: {}", self.0.kind, msg),
            None => fmt::Display::fmt(&self.0.kind, f),
        }
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.chain(), f)
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.0
            .source
            .as_ref()
            .map(|s| s.as_ref() as &(dyn std::error::Error + 'static))
    }
}

/// Single-line display of an [`Error`] and all its sources.
pub struct Chain<'a>(&'a Error);

impl fmt::Display for Chain<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self.0, f)?;
        let mut cur = std::error::Error::source(self.0);
        while let Some(e) = cur {
            write!(f, ": {e}")?;
            cur = e.source();
        }
        Ok(())
    }
}

/// Builder used by the [`err!`](crate::err!) macro; not typically used
/// directly.
pub struct ErrorBuilder(Inner);

impl ErrorBuilder {
    pub fn msg(mut self, msg: String) -> Self {
        self.0.msg = Some(msg);
        self
    }

    pub fn source<S: Into<BoxedSource>>(mut self, source: S) -> Self {
        self.0.source = Some(source.into());
        self
    }

    pub fn build(self) -> Error {
        Error(Box::new(self.0))
    }
}

/// The first argument of [`err!`](crate::err!): either a bare [`ErrorKind`]
/// or an existing error to wrap.
pub trait ToErrorBuilder {
    fn to_error_builder(self) -> ErrorBuilder;
}

impl ToErrorBuilder for ErrorKind {
    fn to_error_builder(self) -> ErrorBuilder {
        ErrorBuilder(Inner {
            kind: self,
            msg: None,
            source: None,
        })
    }
}

impl ToErrorBuilder for Error {
    fn to_error_builder(self) -> ErrorBuilder {
        ErrorBuilder(Inner {
            kind: self.kind(),
            msg: None,
            source: Some(Box::new(self)),
        })
    }
}

macro_rules! wraps {
    ($t:ty, $k:expr) => {
        impl ToErrorBuilder for $t {
            fn to_error_builder(self) -> ErrorBuilder {
                ErrorBuilder(Inner {
                    kind: $k(&self),
                    msg: None,
                    source: Some(Box::new(self)),
                })
            }
        }

        impl From<$t> for Error {
            fn from(e: $t) -> Self {
                e.to_error_builder().build()
            }
        }
    };
}

fn io_kind(e: &std::io::Error) -> ErrorKind {
    use std::io::ErrorKind as K;
    match e.kind() {
        K::NotFound => ErrorKind::NotFound,
        K::PermissionDenied => ErrorKind::PermissionDenied,
        K::AlreadyExists => ErrorKind::AlreadyExists,
        K::InvalidInput | K::InvalidData => ErrorKind::InvalidArgument,
        K::TimedOut => ErrorKind::DeadlineExceeded,
        K::UnexpectedEof => ErrorKind::DataLoss,
        K::OutOfMemory => ErrorKind::ResourceExhausted,
        _ => ErrorKind::Unknown,
    }
}

fn sqlite_kind(e: &rusqlite::Error) -> ErrorKind {
    match e {
        rusqlite::Error::QueryReturnedNoRows => ErrorKind::NotFound,
        _ => ErrorKind::Unknown,
    }
}

fn json_kind(_: &serde_json::Error) -> ErrorKind {
    ErrorKind::DataLoss
}

wraps!(std::io::Error, io_kind);
wraps!(rusqlite::Error, sqlite_kind);
wraps!(serde_json::Error, json_kind);

/// Constructs an [`Error`].
///
/// The first argument is an `ErrorKind` variant name or an existing error
/// value; the optional following arguments are `msg(...)` (format string and
/// args) then `source(...)`.
#[macro_export]
macro_rules! err {
    ($base:ident $(, msg($($msg:tt)*))? $(, source($source:expr))? $(,)?) => {{
        #[allow(unused_imports)]
        use $crate::ErrorKind::*;
        let builder = $crate::error_internal::to_builder($base);
        $(let builder = builder.msg(format!($($msg)*));)?
        $(let builder = builder.source($source);)?
        builder.build()
    }};
    ($base:expr $(, msg($($msg:tt)*))? $(, source($source:expr))? $(,)?) => {{
        let builder = $crate::error_internal::to_builder($base);
        $(let builder = builder.msg(format!($($msg)*));)?
        $(let builder = builder.source($source);)?
        builder.build()
    }};
}

/// As [`err!`](crate::err!), but returns the error from the enclosing
/// function.
#[macro_export]
macro_rules! bail {
    ($($t:tt)*) => {
        return Err($crate::err!($($t)*).into())
    };
}

#[doc(hidden)]
pub mod error_internal {
    pub fn to_builder<B: super::ToErrorBuilder>(b: B) -> super::ErrorBuilder {
        b.to_error_builder()
    }
}

/// Extension methods for `Result`.
pub trait ResultExt<T> {
    /// Annotates an error with the given kind, keeping the original as the
    /// source.
    fn err_kind(self, k: ErrorKind) -> Result<T, Error>;
}

impl<T, E> ResultExt<T> for Result<T, E>
where
    E: Into<BoxedSource>,
{
    fn err_kind(self, k: ErrorKind) -> Result<T, Error> {
        self.map_err(|e| {
            ErrorBuilder(Inner {
                kind: k,
                msg: None,
                source: Some(e.into()),
            })
            .build()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate as lookback_base;
    use lookback_base::{bail, err};

    #[test]
    fn kinds_and_msgs() {
        let e = err!(NotFound);
        assert_eq!(e.kind(), ErrorKind::NotFound);
        assert_eq!(e.to_string(), "Not found");

        let e = err!(InvalidArgument, msg("bad query {:?}", "x"));
        assert_eq!(e.to_string(), "Invalid argument: bad query \"x\"");
    }

    #[test]
    fn wrapping() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let e = err!(io, msg("reading frames.bin"));
        assert_eq!(e.kind(), ErrorKind::NotFound);
        assert_eq!(e.chain().to_string(), "Not found: reading frames.bin: gone");

        let io = std::io::Error::new(std::io::ErrorKind::Other, "boom");
        let e = err!(Unavailable, msg("wal append"), source(io));
        assert_eq!(e.kind(), ErrorKind::Unavailable);
        assert_eq!(e.chain().to_string(), "Unavailable: wal append: boom");
    }

    #[test]
    fn bail_returns() {
        fn f() -> Result<(), Error> {
            bail!(DeadlineExceeded, msg("encoder not ready after {} s", 5));
        }
        let e = f().unwrap_err();
        assert_eq!(e.kind(), ErrorKind::DeadlineExceeded);
        assert_eq!(e.to_string(), "Deadline exceeded: encoder not ready after 5 s");
    }

    #[test]
    fn question_mark_conversions() {
        fn f() -> Result<(), Error> {
            let _ = std::fs::metadata("/nonexistent/lookback/x")?;
            Ok(())
        }
        assert_eq!(f().unwrap_err().kind(), ErrorKind::NotFound);
    }
}
