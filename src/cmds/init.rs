// This file is part of Lookback, a continuous screen activity recorder.
// Copyright (C) 2025 The Lookback Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Subcommand to create the storage root and initialize the database.

use base::Error;
use bpaf::Bpaf;
use db::dir::StorageDir;
use std::path::PathBuf;
use tracing::info;

/// Initializes the storage root and the index database.
#[derive(Bpaf, Debug)]
#[bpaf(command("init"))]
pub struct Args {
    /// Storage root directory.
    #[bpaf(external(crate::parse_storage_root))]
    storage_root: PathBuf,

    /// Encryption key for the index database (also `LOOKBACK_DB_KEY`).
    /// Without one, the database is plaintext.
    #[bpaf(long, argument("KEY"))]
    db_key: Option<String>,
}

pub fn run(args: Args) -> Result<i32, Error> {
    let dir = StorageDir::open(&args.storage_root, true)?;
    let key = super::resolve_key(args.db_key);
    let mut conn = super::open_conn(dir.root(), key.as_deref(), super::OpenMode::Create)?;

    if let Some(v) = db::get_schema_version(&conn)? {
        info!("database is already initialized with schema version {v}.");
        return Ok(0);
    }

    // Use WAL mode (the most efficient way to preserve database integrity)
    // with a large page size. Changing the page size requires a vacuum in
    // non-WAL mode; that's cheap on an empty database.
    conn.execute_batch(
        r#"
        pragma journal_mode = delete;
        pragma page_size = 16384;
        vacuum;
        pragma journal_mode = wal;
        "#,
    )?;
    db::init(&mut conn)?;
    info!(root = %dir.root().display(), encrypted = key.is_some(), "database initialized.");
    Ok(0)
}
