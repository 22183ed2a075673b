// This file is part of Lookback, a continuous screen activity recorder.
// Copyright (C) 2025 The Lookback Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Subcommand to run a SQLite shell against the index.
//!
//! With an encrypted database, the `sqlite3` on `$PATH` must be a SQLCipher
//! build; the key pragma is passed via `-cmd` so it runs before anything
//! else.

use base::Error;
use bpaf::Bpaf;
use db::dir::StorageDir;
use std::ffi::OsString;
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::Command;

/// Runs a SQLite shell on the index database.
#[derive(Bpaf, Debug)]
#[bpaf(command("sql"))]
pub struct Args {
    /// Storage root directory.
    #[bpaf(external(crate::parse_storage_root))]
    storage_root: PathBuf,

    /// Encryption key for the index database (also `LOOKBACK_DB_KEY`).
    #[bpaf(long, argument("KEY"))]
    db_key: Option<String>,

    /// Opens the database read-write and locks the storage root
    /// exclusively. The default is read-only with a shared lock, which can
    /// run alongside `lookback run`.
    #[bpaf(long)]
    read_write: bool,

    /// Arguments to pass to sqlite3. Use the `--` separator to pass
    /// sqlite3 options, as in `lookback sql -- -line 'select * from tag'`.
    #[bpaf(positional("ARG"))]
    args: Vec<String>,
}

pub fn run(args: Args) -> Result<i32, Error> {
    // Hold the appropriate lock for the shell's lifetime via exec.
    let _dir = if args.read_write {
        StorageDir::open(&args.storage_root, false)?
    } else {
        StorageDir::open_shared(&args.storage_root)?
    };
    let mut db = OsString::new();
    db.push("file:");
    db.push(&args.storage_root);
    db.push("/");
    db.push(super::DB_FILENAME);
    if !args.read_write {
        db.push("?mode=ro");
    }
    let mut cmd = Command::new("sqlite3");
    if let Some(key) = super::resolve_key(args.db_key) {
        cmd.arg("-cmd")
            .arg(format!("pragma key = '{}'", key.replace('\'', "''")));
    }
    Err(cmd.arg(&db).args(&args.args).exec().into())
}
