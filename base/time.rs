// This file is part of Lookback, a continuous screen activity recorder.
// Copyright (C) 2025 The Lookback Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Wall-clock time types.
//!
//! All wall-clock timestamps in the database and the write-ahead log are
//! [`Time`] values: milliseconds since the Unix epoch. Media (presentation)
//! time is a separate concept owned by the encoder; see `lookback-db`.

use crate::{bail, Error};
use std::fmt;
use std::ops;
use std::str::FromStr;

pub const MILLIS_PER_SEC: i64 = 1_000;

/// A wall-clock instant, in milliseconds since the Unix epoch.
#[derive(Clone, Copy, Debug, Default, Eq, Ord, PartialEq, PartialOrd)]
pub struct Time(pub i64);

impl Time {
    pub const MIN: Self = Time(i64::MIN);
    pub const MAX: Self = Time(i64::MAX);

    pub fn new(ts: jiff::Timestamp) -> Self {
        Time(ts.as_millisecond())
    }

    /// Unix seconds as `f64`, the representation used in the WAL record
    /// header.
    pub fn as_secs_f64(self) -> f64 {
        (self.0 as f64) / (MILLIS_PER_SEC as f64)
    }

    pub fn from_secs_f64(secs: f64) -> Self {
        Time((secs * MILLIS_PER_SEC as f64).round() as i64)
    }

    /// The Unix second this instant falls in. Recovery uses second
    /// granularity when checking for already-inserted frames.
    pub fn unix_seconds(self) -> i64 {
        self.0.div_euclid(MILLIS_PER_SEC)
    }

    /// Parses either a decimal count of milliseconds since epoch or an
    /// RFC 3339 timestamp.
    pub fn parse(s: &str) -> Result<Self, Error> {
        if let Ok(ms) = s.parse::<i64>() {
            return Ok(Time(ms));
        }
        match s.parse::<jiff::Timestamp>() {
            Ok(ts) => Ok(Time::new(ts)),
            Err(e) => bail!(
                InvalidArgument,
                msg("unparseable time {s:?}; expected milliseconds since epoch or RFC 3339"),
                source(e)
            ),
        }
    }
}

impl ops::Add<Duration> for Time {
    type Output = Time;
    fn add(self, rhs: Duration) -> Time {
        Time(self.0 + rhs.0)
    }
}

impl ops::AddAssign<Duration> for Time {
    fn add_assign(&mut self, rhs: Duration) {
        self.0 += rhs.0;
    }
}

impl ops::Sub<Duration> for Time {
    type Output = Time;
    fn sub(self, rhs: Duration) -> Time {
        Time(self.0 - rhs.0)
    }
}

impl ops::Sub for Time {
    type Output = Duration;
    fn sub(self, rhs: Time) -> Duration {
        Duration(self.0 - rhs.0)
    }
}

impl fmt::Display for Time {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match jiff::Timestamp::from_millisecond(self.0) {
            Ok(ts) => write!(f, "{ts}"),
            Err(_) => write!(f, "{} ms since epoch", self.0),
        }
    }
}

impl FromStr for Time {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Time::parse(s)
    }
}

/// A wall-clock duration, in milliseconds. Can be negative.
#[derive(Clone, Copy, Debug, Default, Eq, Ord, PartialEq, PartialOrd)]
pub struct Duration(pub i64);

impl Duration {
    pub const fn from_secs(secs: i64) -> Self {
        Duration(secs * MILLIS_PER_SEC)
    }

    pub fn to_std(self) -> Result<std::time::Duration, Error> {
        if self.0 < 0 {
            bail!(OutOfRange, msg("negative duration {} ms", self.0));
        }
        Ok(std::time::Duration::from_millis(self.0 as u64))
    }
}

impl fmt::Display for Duration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut ms = self.0;
        if ms < 0 {
            f.write_str("-")?;
            ms = -ms;
        }
        let mut have_written = false;
        for (label, millis_per_unit) in [
            ("day", 86_400_000),
            ("hour", 3_600_000),
            ("minute", 60_000),
            ("second", 1_000),
        ] {
            let units = ms / millis_per_unit;
            if units != 0 || (!have_written && millis_per_unit == 1_000) {
                write!(
                    f,
                    "{}{} {}{}",
                    if have_written { " " } else { "" },
                    units,
                    label,
                    if units == 1 { "" } else { "s" }
                )?;
                have_written = true;
            }
            ms %= millis_per_unit;
        }
        if ms != 0 {
            write!(f, " {ms} ms")?;
        }
        Ok(())
    }
}

impl ops::Add for Duration {
    type Output = Duration;
    fn add(self, rhs: Duration) -> Duration {
        Duration(self.0 + rhs.0)
    }
}

impl ops::AddAssign for Duration {
    fn add_assign(&mut self, rhs: Duration) {
        self.0 += rhs.0;
    }
}

impl ops::Sub for Duration {
    type Output = Duration;
    fn sub(self, rhs: Duration) -> Duration {
        Duration(self.0 - rhs.0)
    }
}
