// This file is part of Lookback, a continuous screen activity recorder.
// Copyright (C) 2025 The Lookback Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Maintenance of the FTS5 external-content index.
//!
//! `searchRanking` is an external-content FTS5 table over
//! `searchRanking_content`, so the index and the content table must be
//! written in lockstep: an index insert carries the new column values, and
//! an index delete must replay the *old* column values. `doc_segment` joins
//! each document to its app segment and frame. Callers wrap these in a
//! transaction (see `LockedDatabase::index_frame_text`).

use base::Error;
use rusqlite::{params, Connection};

/// Inserts one frame's OCR text: `c0` the main text, `c1` UI-chrome text,
/// `c2` the window title. Returns the docid.
pub(crate) fn index_frame_text(
    conn: &Connection,
    main_text: &str,
    chrome_text: Option<&str>,
    window_title: Option<&str>,
    segment_id: i64,
    frame_id: i64,
) -> Result<i64, Error> {
    let mut stmt = conn
        .prepare_cached("insert into searchRanking_content (c0, c1, c2) values (?, ?, ?)")?;
    stmt.execute(params![main_text, chrome_text, window_title])?;
    let docid = conn.last_insert_rowid();

    // Mirror into the index; external content tables don't watch the
    // content table themselves.
    let mut stmt = conn.prepare_cached(
        "insert into searchRanking (rowid, c0, c1, c2) values (?, ?, ?, ?)",
    )?;
    stmt.execute(params![docid, main_text, chrome_text, window_title])?;

    let mut stmt = conn.prepare_cached(
        "insert into doc_segment (docid, segmentId, frameId) values (?, ?, ?)",
    )?;
    stmt.execute(params![docid, segment_id, frame_id])?;
    Ok(docid)
}

/// Removes a frame's document: index entry, content row, and junction row.
pub(crate) fn delete_fts_content(conn: &Connection, frame_id: i64) -> Result<(), Error> {
    let docids: Vec<i64> = {
        let mut stmt =
            conn.prepare_cached("select docid from doc_segment where frameId = ?")?;
        let ids = stmt
            .query_map(params![frame_id], |row| row.get(0))?
            .collect::<Result<Vec<i64>, _>>()?;
        ids
    };
    for docid in docids {
        let row: Option<(Option<String>, Option<String>, Option<String>)> = {
            let mut stmt = conn.prepare_cached(
                "select c0, c1, c2 from searchRanking_content where id = ?",
            )?;
            let mut rows = stmt.query(params![docid])?;
            match rows.next()? {
                Some(r) => Some((r.get(0)?, r.get(1)?, r.get(2)?)),
                None => None,
            }
        };
        if let Some((c0, c1, c2)) = row {
            // FTS5 'delete' command: must present the old values.
            let mut stmt = conn.prepare_cached(
                "insert into searchRanking (searchRanking, rowid, c0, c1, c2) \
                 values ('delete', ?, ?, ?, ?)",
            )?;
            stmt.execute(params![docid, c0, c1, c2])?;
            conn.prepare_cached("delete from searchRanking_content where id = ?")?
                .execute(params![docid])?;
        }
        conn.prepare_cached("delete from doc_segment where docid = ?")?
            .execute(params![docid])?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::SegmentKey;
    use crate::testutil::{self, TestDb};
    use base::time::Time;

    fn count(conn: &Connection, sql: &str) -> i64 {
        conn.query_row(sql, params![], |row| row.get(0)).unwrap()
    }

    #[test]
    fn index_and_match() {
        testutil::init();
        let tdb = TestDb::new();
        let mut l = tdb.db.lock();
        let key = SegmentKey {
            bundle_id: Some("com.example.editor".to_owned()),
            window_name: Some("notes".to_owned()),
        };
        let frame_id = l.insert_frame(&key, None, Time(1_000), None, 0, 0, true).unwrap();
        let seg = l.get_frame(frame_id).unwrap().unwrap().segment_id;
        let docid = l
            .index_frame_text("the quick brown fox", Some("File Edit View"), Some("notes"), seg, frame_id)
            .unwrap();

        let (got_docid, got_frame): (i64, i64) = l
            .conn
            .query_row(
                "select searchRanking.rowid, d.frameId from searchRanking \
                 join doc_segment d on d.docid = searchRanking.rowid \
                 where searchRanking match 'quick'",
                params![],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(got_docid, docid);
        assert_eq!(got_frame, frame_id);
    }

    #[test]
    fn delete_leaves_no_rows() {
        testutil::init();
        let tdb = TestDb::new();
        let mut l = tdb.db.lock();
        let key = SegmentKey::default();
        let f1 = l.insert_frame(&key, None, Time(1_000), None, 0, 0, true).unwrap();
        let f2 = l.insert_frame(&key, None, Time(2_000), None, 1, 0, true).unwrap();
        let seg = l.get_frame(f1).unwrap().unwrap().segment_id;
        l.index_frame_text("alpha beta", None, None, seg, f1).unwrap();
        l.index_frame_text("alpha gamma", None, None, seg, f2).unwrap();

        l.delete_fts_content(f1).unwrap();

        assert_eq!(count(&l.conn, "select count(*) from searchRanking_content"), 1);
        assert_eq!(count(&l.conn, "select count(*) from doc_segment"), 1);
        // The index no longer matches the deleted doc.
        assert_eq!(
            count(
                &l.conn,
                "select count(*) from searchRanking where searchRanking match 'beta'"
            ),
            0
        );
        assert_eq!(
            count(
                &l.conn,
                "select count(*) from searchRanking where searchRanking match 'alpha'"
            ),
            1
        );

        // Deleting a frame with no document is a no-op.
        l.delete_fts_content(f1).unwrap();
    }
}
