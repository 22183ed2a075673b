// This file is part of Lookback, a continuous screen activity recorder.
// Copyright (C) 2025 The Lookback Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Upgrades the database schema.
//!
//! Each step runs in its own transaction and appends a `version` row on
//! success; a failing step rolls back atomically and the database refuses
//! to open until upgraded. Steps are never re-ordered. Integrity pragmas
//! and journal mode are set before the first transaction begins.

use crate::db;
use base::{bail, Error};
use rusqlite::params;
use tracing::info;

mod v1_to_v2;
mod v2_to_v3;
mod v3_to_v4;
mod v4_to_v5;
mod v5_to_v6;
mod v6_to_v7;

const UPGRADE_NOTES: &str = concat!("upgraded using lookback-db ", env!("CARGO_PKG_VERSION"));

#[derive(Debug)]
pub struct Args<'a> {
    pub preset_journal: &'a str,
    pub no_vacuum: bool,
}

impl Default for Args<'_> {
    fn default() -> Self {
        Args {
            preset_journal: "delete",
            no_vacuum: false,
        }
    }
}

fn set_journal_mode(conn: &rusqlite::Connection, requested: &str) -> Result<(), Error> {
    assert!(!requested.contains(';')); // quick check for accidental sql injection.
    let actual = conn.query_row(
        &format!("pragma journal_mode = {requested}"),
        params![],
        |row| row.get::<_, String>(0),
    )?;
    info!("...database now in journal_mode {actual} (requested {requested}).");
    Ok(())
}

fn upgrade(args: &Args, target_ver: i32, conn: &mut rusqlite::Connection) -> Result<(), Error> {
    let upgraders = [
        v1_to_v2::run,
        v2_to_v3::run,
        v3_to_v4::run,
        v4_to_v5::run,
        v5_to_v6::run,
        v6_to_v7::run,
    ];

    assert_eq!(upgraders.len() as i32, db::EXPECTED_SCHEMA_VERSION - 1);
    let old_ver: i32 =
        conn.query_row("select max(id) from version", params![], |row| row.get(0))?;
    if old_ver > db::EXPECTED_SCHEMA_VERSION {
        bail!(
            FailedPrecondition,
            msg(
                "database is at version {old_ver}, later than expected {}",
                db::EXPECTED_SCHEMA_VERSION
            ),
        );
    } else if old_ver < 1 {
        bail!(FailedPrecondition, msg("database is at impossible version {old_ver}"));
    }
    info!("upgrading database from version {old_ver} to version {target_ver}...");
    for ver in old_ver..target_ver {
        info!("...from version {ver} to version {}", ver + 1);
        let tx = conn.transaction()?;
        upgraders[(ver - 1) as usize](&args, &tx)?;
        tx.execute(
            r#"
            insert into version (id, unix_time, notes)
                         values (?, cast(strftime('%s', 'now') as int), ?)
            "#,
            params![ver + 1, UPGRADE_NOTES],
        )?;
        tx.commit()?;
    }

    Ok(())
}

pub fn run(args: &Args, conn: &mut rusqlite::Connection) -> Result<(), Error> {
    db::check_sqlite_version()?;
    db::set_integrity_pragmas(conn)?;
    set_journal_mode(conn, args.preset_journal)?;
    upgrade(args, db::EXPECTED_SCHEMA_VERSION, conn)?;

    // Rebuild free pages while in a rollback-journal mode; page_size changes
    // and vacuums don't take effect under WAL.
    if !args.no_vacuum {
        info!("...vacuuming database after upgrade.");
        conn.execute_batch(
            r#"
            pragma page_size = 16384;
            vacuum;
            "#,
        )?;
    }

    set_journal_mode(conn, "wal")?;
    info!("...done.");

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compare;
    use crate::testutil;

    fn new_conn() -> rusqlite::Connection {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        conn.execute_batch("pragma foreign_keys = on").unwrap();
        conn
    }

    /// Builds a v1 database with sample data, upgrades it stepwise to the
    /// current version, and compares the result against a fresh `init`.
    #[test]
    fn upgrade_and_compare() {
        testutil::init();
        let mut upgraded = new_conn();
        upgraded.execute_batch(include_str!("v1.sql")).unwrap();
        upgraded
            .execute_batch(
                r#"
                insert into version (id, unix_time, notes) values (1, 0, 'test');
                insert into segment (id, bundleID, startDate, endDate, windowName)
                    values (1, 'com.example.editor', 1000, 5000, 'main.rs');
                insert into video (id, width, height, path, fileSize, processingState)
                    values (1, 1920, 1080, 'segments/2025/01/01/segment_1', 4096, 0);
                insert into frame (id, createdAt, segmentId, videoId, videoFrameIndex,
                                   encodingStatus)
                    values (1, 1000, 1, 1, 0, 2),
                           (2, 3000, 1, 1, 1, 0);
                insert into searchRanking_content (id, c0, c1, c2)
                    values (1, 'hello world', null, 'main.rs');
                insert into searchRanking (rowid, c0, c1, c2)
                    values (1, 'hello world', null, 'main.rs');
                insert into doc_segment (docid, segmentId, frameId) values (1, 1, 1);
                "#,
            )
            .unwrap();

        upgrade(&Args::default(), db::EXPECTED_SCHEMA_VERSION, &mut upgraded).unwrap();

        let mut fresh = new_conn();
        db::init(&mut fresh).unwrap();
        if let Some(diffs) = compare::get_diffs("upgraded", &upgraded, "fresh", &fresh).unwrap() {
            panic!("differences found:\n{diffs}");
        }

        // Version bookkeeping: one row per step.
        let ver: i32 = upgraded
            .query_row("select max(id) from version", params![], |row| row.get(0))
            .unwrap();
        assert_eq!(ver, db::EXPECTED_SCHEMA_VERSION);

        // v2: existing videos got the default frame count.
        let fc: i64 = upgraded
            .query_row("select frameCount from video where id = 1", params![], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(fc, 150);

        // v3: the hidden tag is seeded.
        let tag: String = upgraded
            .query_row("select name from tag", params![], |row| row.get(0))
            .unwrap();
        assert_eq!(tag, "hidden");

        // v6: processedAt backfilled only for frames already marked
        // processed.
        let processed: Option<i64> = upgraded
            .query_row("select processedAt from frame where id = 1", params![], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(processed, Some(1000));
        let unprocessed: Option<i64> = upgraded
            .query_row("select processedAt from frame where id = 2", params![], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(unprocessed, None);

        // v7: the open-session invariant index exists and works.
        upgraded
            .execute_batch(
                r#"
                insert into display (id, name, lastSeenAt) values (1, 'test', 0);
                insert into display_session (displayID, connectedAt) values (1, 0);
                "#,
            )
            .unwrap();
        upgraded
            .execute(
                "insert into display_session (displayID, connectedAt) values (1, 5)",
                params![],
            )
            .unwrap_err();
    }

    #[test]
    fn refuses_future_version() {
        testutil::init();
        let mut conn = new_conn();
        conn.execute_batch(include_str!("v1.sql")).unwrap();
        conn.execute_batch("insert into version (id, unix_time) values (99, 0)")
            .unwrap();
        upgrade(&Args::default(), db::EXPECTED_SCHEMA_VERSION, &mut conn).unwrap_err();
    }
}
