// This file is part of Lookback, a continuous screen activity recorder.
// Copyright (C) 2025 The Lookback Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Utilities for automated testing involving Lookback's persistence
//! library. Used for tests of both the `lookback_db` crate itself and the
//! `lookback` crate.

use crate::db;
use crate::dir::StorageDir;
use crate::encoder::{FrameSink, SinkParams};
use base::clock::SimulatedClocks;
use base::time::Time;
use base::{bail, Error};
use std::io::Write;
use std::sync::Arc;
use tempfile::TempDir;

static INIT: std::sync::Once = std::sync::Once::new();

/// Performs global initialization for tests: sets up logging to the test
/// writer.
pub fn init() {
    INIT.call_once(|| {
        base::tracing_setup::install_for_tests();
    });
}

/// An initialized in-memory database plus a storage root in a tempdir.
pub struct TestDb {
    pub db: Arc<db::Database<SimulatedClocks>>,
    pub dir: StorageDir,
    pub tmpdir: TempDir,
}

impl TestDb {
    /// Creates a test database with simulated clocks booted at
    /// 2025-01-01T00:00:00Z.
    pub fn new() -> Self {
        Self::with_clocks(SimulatedClocks::new(Time(1_735_689_600_000)))
    }

    pub fn with_clocks(clocks: SimulatedClocks) -> Self {
        let tmpdir = tempfile::Builder::new()
            .prefix("lookback-test")
            .tempdir()
            .unwrap();
        let mut conn = rusqlite::Connection::open_in_memory().unwrap();
        db::init(&mut conn).unwrap();
        let db = Arc::new(db::Database::new(clocks, conn).unwrap());
        let dir = StorageDir::open(tmpdir.path(), true).unwrap();
        TestDb { db, dir, tmpdir }
    }
}

impl Default for TestDb {
    fn default() -> Self {
        Self::new()
    }
}

/// A [`FrameSink`] for tests: writes a recognizable amount of garbage per
/// frame so fragment detection and file sizes behave, with optional
/// injected failure and readiness control.
#[derive(Debug)]
pub struct MockSink {
    /// `write_frame` fails once this many frames have been accepted.
    pub fail_after: Option<u32>,

    /// Value returned by `is_ready`.
    pub ready: bool,

    /// Bytes written at `start`, below the fragment-jump threshold by
    /// default (a fragmented file begins with just ftyp+moov).
    pub init_bytes: usize,

    /// Bytes written per frame, above the fragment-jump threshold by
    /// default.
    pub frame_bytes: usize,

    pub(crate) written: u32,
    pub(crate) file: Option<std::fs::File>,
}

impl Default for MockSink {
    fn default() -> Self {
        MockSink {
            fail_after: None,
            ready: true,
            init_bytes: 512,
            frame_bytes: 2048,
            written: 0,
            file: None,
        }
    }
}

impl FrameSink for MockSink {
    fn start(&mut self, params: &SinkParams) -> Result<bool, Error> {
        let mut f = std::fs::File::create(&params.output)?;
        f.write_all(&vec![0xf4; self.init_bytes])?;
        f.flush()?;
        self.file = Some(f);
        Ok(false)
    }

    fn write_frame(&mut self, _packed_bgra: &[u8]) -> Result<(), Error> {
        if let Some(n) = self.fail_after {
            if self.written >= n {
                bail!(Unknown, msg("mock sink failure injected after {n} frames"));
            }
        }
        let Some(f) = self.file.as_mut() else {
            bail!(FailedPrecondition, msg("mock sink is not started"));
        };
        f.write_all(&vec![0x5a; self.frame_bytes])?;
        f.flush()?;
        self.written += 1;
        Ok(())
    }

    fn is_ready(&self) -> bool {
        self.ready
    }

    fn finish(&mut self) -> Result<(), Error> {
        if let Some(f) = self.file.take() {
            f.sync_all()?;
        }
        Ok(())
    }

    fn abort(&mut self) {
        self.file = None;
    }
}
