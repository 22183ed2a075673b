// This file is part of Lookback, a continuous screen activity recorder.
// Copyright (C) 2025 The Lookback Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Subcommand to check database and storage-root consistency.

use base::Error;
use bpaf::Bpaf;
use db::dir::StorageDir;
use std::path::PathBuf;
use tracing::info;

/// Checks consistency between the index and the storage root.
#[derive(Bpaf, Debug)]
#[bpaf(command("check"))]
pub struct Args {
    /// Storage root directory.
    #[bpaf(external(crate::parse_storage_root))]
    storage_root: PathBuf,

    /// Encryption key for the index database (also `LOOKBACK_DB_KEY`).
    #[bpaf(long, argument("KEY"))]
    db_key: Option<String>,
}

pub fn run(args: Args) -> Result<i32, Error> {
    let dir = StorageDir::open_shared(&args.storage_root)?;
    let key = super::resolve_key(args.db_key);
    let conn = super::open_conn(dir.root(), key.as_deref(), super::OpenMode::ReadOnly)?;
    let findings = db::check::run(&conn, &dir)?;
    info!(?findings, "check complete");
    if findings.wal_sessions > 0 {
        info!(
            sessions = findings.wal_sessions,
            "WAL sessions are pending recovery; they will be replayed at the next `lookback run`"
        );
    }
    Ok(if findings.is_clean() { 0 } else { 1 })
}
