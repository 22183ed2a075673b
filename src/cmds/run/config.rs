// This file is part of Lookback, a continuous screen activity recorder.
// Copyright (C) 2025 The Lookback Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Runtime configuration file (`lookback.toml` in the storage root).

use base::{bail, err, Error};
use serde::Deserialize;
use std::path::Path;

fn default_interval_ms() -> u64 {
    2_000
}

fn default_dedup_threshold() -> f64 {
    0.98
}

fn default_frame_rate() -> u32 {
    30
}

fn default_prefer_hardware() -> bool {
    true
}

/// Top-level configuration file object. Every field has a default, so a
/// missing file means a default configuration.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ConfigFile {
    /// Capture interval in milliseconds.
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,

    /// Keep a frame iff its similarity to the last kept frame is at or
    /// below this; higher filters more.
    #[serde(default = "default_dedup_threshold")]
    pub dedup_threshold: f64,

    /// Encoded frame rate. Must evenly divide the 600-unit media timescale.
    #[serde(default = "default_frame_rate")]
    pub frame_rate: u32,

    /// Storage budget for encoded segments, e.g. `"10G"` or `"500M"`
    /// (powers of two). Unset means keep everything.
    #[serde(default)]
    pub retain_bytes: Option<String>,

    /// The number of worker threads used by the asynchronous runtime.
    ///
    /// Defaults to the number of cores on the system.
    #[serde(default)]
    pub worker_threads: Option<usize>,

    /// Display to capture at startup.
    #[serde(default)]
    pub display_id: u32,

    /// Encryption key for the index database. The `--db-key` flag and
    /// `LOOKBACK_DB_KEY` take precedence.
    #[serde(default)]
    pub db_key: Option<String>,

    /// Prefer a hardware encoder when one is available.
    #[serde(default = "default_prefer_hardware")]
    pub prefer_hardware: bool,
}

impl Default for ConfigFile {
    fn default() -> Self {
        toml::from_str("").expect("empty config must deserialize")
    }
}

impl ConfigFile {
    /// Loads the file, or the defaults if it doesn't exist.
    pub fn load(path: &Path) -> Result<ConfigFile, Error> {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(ConfigFile::default())
            }
            Err(e) => return Err(err!(e, msg("unable to read config {}", path.display()))),
        };
        toml::from_str(&raw)
            .map_err(|e| err!(InvalidArgument, msg("bad config {}", path.display()), source(e)))
    }

    /// The retention budget in bytes, if configured.
    pub fn retain_bytes(&self) -> Result<Option<i64>, Error> {
        let Some(raw) = &self.retain_bytes else {
            return Ok(None);
        };
        match base::strutil::decode_size(raw) {
            Ok(n) => Ok(Some(n)),
            Err(()) => bail!(
                InvalidArgument,
                msg("bad retainBytes {raw:?}; expected e.g. \"10G\" or \"500M\"")
            ),
        }
    }
}
