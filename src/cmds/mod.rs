// This file is part of Lookback, a continuous screen activity recorder.
// Copyright (C) 2025 The Lookback Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

use base::{err, Error};
use std::path::Path;
use tracing::info;

pub mod check;
pub mod init;
pub mod run;
pub mod search;
pub mod sql;
pub mod ts;
pub mod upgrade;

/// Name of the SQLite index file within the storage root.
pub const DB_FILENAME: &str = "db";

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum OpenMode {
    ReadOnly,
    ReadWrite,
    Create,
}

/// Resolves the database key: the flag wins, then `LOOKBACK_DB_KEY`, then
/// none (plaintext database).
fn resolve_key(flag: Option<String>) -> Option<String> {
    flag.or_else(|| std::env::var("LOOKBACK_DB_KEY").ok())
        .filter(|k| !k.is_empty())
}

/// Opens the SQLite index inside an (already locked) storage root,
/// applying the encryption key before any other statement.
fn open_conn(
    root: &Path,
    key: Option<&str>,
    mode: OpenMode,
) -> Result<rusqlite::Connection, Error> {
    let db_path = root.join(DB_FILENAME);
    info!(
        path = %db_path.display(),
        ?mode,
        sqlite = rusqlite::version(),
        "opening index database"
    );
    let conn = rusqlite::Connection::open_with_flags(
        &db_path,
        match mode {
            OpenMode::ReadOnly => rusqlite::OpenFlags::SQLITE_OPEN_READ_ONLY,
            OpenMode::ReadWrite => rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE,
            OpenMode::Create => {
                rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE
                    | rusqlite::OpenFlags::SQLITE_OPEN_CREATE
            }
        } |
        // rusqlite::Connection is not Sync, so there's no reason to tell
        // SQLite3 to use the serialized threading mode.
        rusqlite::OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )
    .map_err(|e| {
        err!(
            e,
            msg(
                "unable to open {}{}",
                db_path.display(),
                if mode == OpenMode::Create {
                    ""
                } else {
                    "; try `lookback init`"
                }
            )
        )
    })?;
    if let Some(key) = key {
        db::set_key(&conn, key)?;
    }
    Ok(conn)
}
