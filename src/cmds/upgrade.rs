// This file is part of Lookback, a continuous screen activity recorder.
// Copyright (C) 2025 The Lookback Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Subcommand to upgrade the database schema.

use base::Error;
use bpaf::Bpaf;
use db::dir::StorageDir;
use std::path::PathBuf;

/// Upgrades the database to the latest schema version.
#[derive(Bpaf, Debug)]
#[bpaf(command("upgrade"))]
pub struct Args {
    /// Storage root directory.
    #[bpaf(external(crate::parse_storage_root))]
    storage_root: PathBuf,

    /// Encryption key for the index database (also `LOOKBACK_DB_KEY`).
    #[bpaf(long, argument("KEY"))]
    db_key: Option<String>,

    /// Sets the journal mode while upgrading. `delete` is the most
    /// compatible; `off` is faster but a crash mid-upgrade loses the
    /// database.
    #[bpaf(long, argument("MODE"), fallback("delete".to_owned()), debug_fallback)]
    preset_journal: String,

    /// Skips the post-upgrade vacuum.
    #[bpaf(long)]
    no_vacuum: bool,
}

pub fn run(args: Args) -> Result<i32, Error> {
    let dir = StorageDir::open(&args.storage_root, false)?;
    let key = super::resolve_key(args.db_key);
    let mut conn = super::open_conn(dir.root(), key.as_deref(), super::OpenMode::ReadWrite)?;
    db::upgrade::run(
        &db::upgrade::Args {
            preset_journal: &args.preset_journal,
            no_vacuum: args.no_vacuum,
        },
        &mut conn,
    )?;
    Ok(0)
}
