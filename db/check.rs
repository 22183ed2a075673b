// This file is part of Lookback, a continuous screen activity recorder.
// Copyright (C) 2025 The Lookback Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Checks database and storage-root consistency, for `lookback check`.
//!
//! Read-only: every finding is reported, nothing is repaired. A non-empty
//! WAL root is not itself a problem (those sessions will be recovered at
//! the next `run`), but is reported for visibility.

use crate::db;
use crate::dir::StorageDir;
use crate::wal;
use base::Error;
use rusqlite::{params, Connection};
use tracing::warn;

#[derive(Debug, Default, PartialEq, Eq)]
pub struct Findings {
    /// Videos still marked in progress; normal only between a crash and
    /// the next recovery run.
    pub in_progress_videos: usize,

    /// Completed videos whose MP4 is missing from the storage root.
    pub missing_files: usize,

    /// Frame rows whose `videoFrameIndex` is outside the owning video's
    /// `frameCount`.
    pub bad_frame_indexes: usize,

    /// WAL sessions awaiting recovery.
    pub wal_sessions: usize,
}

impl Findings {
    /// Whether anything needs attention.
    pub fn is_clean(&self) -> bool {
        *self
            == Findings {
                wal_sessions: self.wal_sessions,
                ..Findings::default()
            }
    }
}

pub fn run(conn: &Connection, dir: &StorageDir) -> Result<Findings, Error> {
    let mut findings = Findings::default();

    let mut stmt = conn.prepare("select id from video where processingState = 1")?;
    let mut rows = stmt.query(params![])?;
    while let Some(row) = rows.next()? {
        let id: i64 = row.get(0)?;
        warn!(video_id = id, "video is still marked in progress");
        findings.in_progress_videos += 1;
    }
    drop(rows);
    drop(stmt);

    let mut stmt =
        conn.prepare("select id, path from video where processingState = 0")?;
    let mut rows = stmt.query(params![])?;
    while let Some(row) = rows.next()? {
        let id: i64 = row.get(0)?;
        let path: String = row.get(1)?;
        if !dir.full_path(&path).is_file() {
            warn!(video_id = id, path, "video file is missing");
            findings.missing_files += 1;
        }
    }
    drop(rows);
    drop(stmt);

    findings.bad_frame_indexes = db::check_frame_indexes(conn)?;
    findings.wal_sessions = wal::list_active_sessions(&dir.wal_root())?.len();
    Ok(findings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::VideoToInsert;
    use crate::testutil::{self, TestDb};

    #[test]
    fn clean_and_dirty() {
        testutil::init();
        let tdb = TestDb::new();
        {
            let l = tdb.db.lock();
            let findings = run(&l.conn, &tdb.dir).unwrap();
            assert!(findings.is_clean(), "got {findings:?}");
        }

        let mut l = tdb.db.lock();
        // An in-progress video and a completed one with no file.
        l.start_video(&VideoToInsert {
            width: 640,
            height: 480,
            frame_rate: 30,
            display_id: 0,
        })
        .unwrap();
        let id = l
            .start_video(&VideoToInsert {
                width: 1920,
                height: 1080,
                frame_rate: 30,
                display_id: 0,
            })
            .unwrap();
        l.complete_video(id, "segments/2025/01/01/segment_999", 4096, 3)
            .unwrap();

        let findings = run(&l.conn, &tdb.dir).unwrap();
        assert_eq!(findings.in_progress_videos, 1);
        assert_eq!(findings.missing_files, 1);
        assert!(!findings.is_clean());
    }
}
