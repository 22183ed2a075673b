// This file is part of Lookback, a continuous screen activity recorder.
// Copyright (C) 2025 The Lookback Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Database access logic for the Lookback SQLite schema.
//!
//! The SQLite index holds everything except the actual video bytes (see the
//! `dir` module for those) and the in-flight WAL sessions (see `wal`). See
//! `schema.sql` for a more detailed description.
//!
//! The [`Database`] struct assumes it is the only process accessing the
//! database. All access is serialized through [`Database::lock`]; callers on
//! the capture path should batch work and avoid holding the lock across
//! anything slow.

use crate::fts;
use crate::raw;
use base::clock::{self, Clocks};
use base::time::Time;
use base::{bail, err, Error, FastHashMap};
use rusqlite::params;
use std::sync::{Mutex, MutexGuard};
use tracing::{error, info, warn};

/// Expected schema version. See `upgrade/mod.rs` for the ladder.
pub const EXPECTED_SCHEMA_VERSION: i32 = 7;

/// The most frames a single video may hold; both the live writer and
/// recovery rotate at this count.
pub const MAX_FRAMES_PER_VIDEO: usize = 150;

/// A video row.
#[derive(Clone, Debug)]
pub struct VideoRow {
    pub id: i64,
    pub width: u32,
    pub height: u32,
    pub path: String,
    pub file_size: i64,
    pub frame_rate: i32,
    pub uploaded_at: Option<Time>,
    pub xid: Option<String>,
    pub processing_state: i32,
    pub frame_count: i64,
    pub display_id: u32,
}

/// A frame row.
#[derive(Clone, Debug)]
pub struct FrameRow {
    pub id: i64,
    pub created_at: Time,
    pub image_file_name: String,
    pub segment_id: i64,
    pub video_id: Option<i64>,
    pub video_frame_index: i32,
    pub is_starred: bool,
    pub encoding_status: i32,
    pub processed_at: Option<Time>,
    pub display_id: u32,
    pub is_focused: bool,
}

/// An app-focus segment row.
#[derive(Clone, Debug)]
pub struct SegmentRow {
    pub id: i64,
    pub bundle_id: Option<String>,
    pub start_date: Time,
    pub end_date: Time,
    pub window_name: Option<String>,
    pub browser_url: Option<String>,
    pub segment_type: i32,
}

/// A video to pass to [`LockedDatabase::start_video`]. The path is recorded
/// at completion; it embeds the id this insert allocates.
#[derive(Clone, Debug)]
pub struct VideoToInsert {
    pub width: u32,
    pub height: u32,
    pub frame_rate: i32,
    pub display_id: u32,
}

/// A frame to pass to [`raw::insert_frame`] via
/// [`LockedDatabase::insert_frame`].
#[derive(Clone, Debug)]
pub struct FrameToInsert {
    pub created_at: Time,
    pub segment_id: i64,
    pub video_id: Option<i64>,
    pub video_frame_index: i32,
    pub display_id: u32,
    pub is_focused: bool,
}

/// An OCR bounding box to insert alongside indexed text.
#[derive(Clone, Debug)]
pub struct NodeToInsert {
    pub frame_id: i64,
    pub node_order: i32,
    pub text_offset: i32,
    pub text_length: i32,
    pub left_x: f64,
    pub top_y: f64,
    pub width: f64,
    pub height: f64,
    pub window_index: i32,
}

/// The focused-app context a frame was captured under; the key of an open
/// app segment.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct SegmentKey {
    pub bundle_id: Option<String>,
    pub window_name: Option<String>,
}

/// A video whose file should be unlinked after the deleting transaction
/// commits; returned by [`LockedDatabase::prune_videos`].
#[derive(Debug)]
pub struct PrunedVideo {
    pub id: i64,
    pub path: String,
    pub file_size: i64,
}

/// In-memory mutable state guarded by the database lock.
#[derive(Debug)]
pub struct LockedDatabase {
    pub(crate) conn: rusqlite::Connection,

    /// Open app segments by context, so consecutive frames under one focus
    /// extend a segment instead of creating one per frame.
    open_segments: FastHashMap<SegmentKey, i64>,
}

impl LockedDatabase {
    /// Finds the at-most-one in-progress video for a display and
    /// resolution, via the partial `video_resumable` index.
    pub fn find_resumable_video(
        &self,
        display_id: u32,
        width: u32,
        height: u32,
    ) -> Result<Option<i64>, Error> {
        let mut stmt = self.conn.prepare_cached(
            "select id from video where displayID = ? and width = ? and height = ? \
             and processingState = 1",
        )?;
        let existing = stmt
            .query_row(params![display_id, width, height], |row| row.get(0))
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                e => Err(e),
            })?;
        Ok(existing)
    }

    /// Starts an in-progress video row, enforcing the one-open-video
    /// invariant per `(displayID, width, height)`.
    pub fn start_video(&mut self, v: &VideoToInsert) -> Result<i64, Error> {
        if let Some(id) = self.find_resumable_video(v.display_id, v.width, v.height)? {
            bail!(
                AlreadyExists,
                msg(
                    "video {id} is already in progress for display {} at {}x{}",
                    v.display_id,
                    v.width,
                    v.height
                ),
            );
        }
        raw::insert_video(&self.conn, v)
    }

    /// Marks a video completed: the MP4 is finalized and readable at `path`
    /// and `frame_count` frame rows reference it.
    pub fn complete_video(
        &mut self,
        id: i64,
        path: &str,
        file_size: i64,
        frame_count: i64,
    ) -> Result<(), Error> {
        raw::complete_video(&self.conn, id, path, file_size, frame_count)
    }

    pub fn get_video(&self, id: i64) -> Result<Option<VideoRow>, Error> {
        self.empty_if_missing(raw::get_video(&self.conn, id))
    }

    pub fn list_in_progress_videos(&self) -> Result<Vec<i64>, Error> {
        self.empty_if_missing(raw::list_in_progress_videos(&self.conn))
    }

    /// Deletes a stale in-progress video row (one whose WAL session was
    /// consumed by recovery).
    pub fn delete_video(&mut self, id: i64) -> Result<bool, Error> {
        raw::delete_video(&self.conn, id)
    }

    /// Detaches frame rows whose index fell beyond a video's final frame
    /// count (the encoder died before reaching them). Their pixels remain
    /// recoverable from the WAL; the rows just stop pointing into the MP4.
    pub fn detach_overflow_frames(&mut self, video_id: i64, frame_count: i64) -> Result<usize, Error> {
        raw::detach_overflow_frames(&self.conn, video_id, frame_count)
    }

    /// Inserts a frame, opening or extending the app segment for its
    /// context. Returns the new frame id.
    pub fn insert_frame(
        &mut self,
        key: &SegmentKey,
        browser_url: Option<&str>,
        created_at: Time,
        video_id: Option<i64>,
        video_frame_index: i32,
        display_id: u32,
        is_focused: bool,
    ) -> Result<i64, Error> {
        let segment_id = self.open_segment(key, browser_url, created_at)?;
        raw::extend_segment(&self.conn, segment_id, created_at)?;
        raw::insert_frame(
            &self.conn,
            &FrameToInsert {
                created_at,
                segment_id,
                video_id,
                video_frame_index,
                display_id,
                is_focused,
            },
        )
    }

    /// Returns the id of the open app segment for `key`, creating one if the
    /// context is new.
    fn open_segment(
        &mut self,
        key: &SegmentKey,
        browser_url: Option<&str>,
        at: Time,
    ) -> Result<i64, Error> {
        if let Some(&id) = self.open_segments.get(key) {
            return Ok(id);
        }
        let id = raw::insert_segment(
            &self.conn,
            key.bundle_id.as_deref(),
            key.window_name.as_deref(),
            browser_url,
            at,
        )?;
        self.open_segments.insert(key.clone(), id);
        Ok(id)
    }

    /// Forgets cached open segments, so the next frame under any context
    /// starts a fresh one. Called when capture stops.
    pub fn close_open_segments(&mut self) {
        self.open_segments.clear();
    }

    pub fn get_frame(&self, id: i64) -> Result<Option<FrameRow>, Error> {
        self.empty_if_missing(raw::get_frame(&self.conn, id))
    }

    pub fn get_segment(&self, id: i64) -> Result<Option<SegmentRow>, Error> {
        self.empty_if_missing(raw::get_segment(&self.conn, id))
    }

    pub fn frame_exists_in_second(&self, unix_second: i64) -> Result<bool, Error> {
        match raw::frame_exists_in_second(&self.conn, unix_second) {
            Err(e) if is_missing_schema(&e) => Ok(false),
            r => r,
        }
    }

    pub fn mark_frame_processed(&mut self, id: i64, at: Time) -> Result<bool, Error> {
        raw::mark_frame_processed(&self.conn, id, at)
    }

    pub fn insert_node(&mut self, n: &NodeToInsert) -> Result<i64, Error> {
        raw::insert_node(&self.conn, n)
    }

    /// Indexes a frame's OCR text for full-text search; see `fts`.
    pub fn index_frame_text(
        &mut self,
        main_text: &str,
        chrome_text: Option<&str>,
        window_title: Option<&str>,
        segment_id: i64,
        frame_id: i64,
    ) -> Result<i64, Error> {
        let tx = self.conn.transaction()?;
        let docid = fts::index_frame_text(&tx, main_text, chrome_text, window_title, segment_id, frame_id)?;
        tx.commit()?;
        Ok(docid)
    }

    /// Removes a frame's full-text rows (content and junction).
    pub fn delete_fts_content(&mut self, frame_id: i64) -> Result<(), Error> {
        let tx = self.conn.transaction()?;
        fts::delete_fts_content(&tx, frame_id)?;
        tx.commit()?;
        Ok(())
    }

    pub fn upsert_display(&mut self, id: u32, name: &str, seen: Time) -> Result<(), Error> {
        raw::upsert_display(&self.conn, id, name, seen)
    }

    pub fn open_display_session(&mut self, id: u32, at: Time) -> Result<(), Error> {
        raw::open_display_session(&self.conn, id, at)
    }

    pub fn close_display_session(&mut self, id: u32, at: Time) -> Result<(), Error> {
        raw::close_display_session(&self.conn, id, at)
    }

    pub fn record_metric(
        &mut self,
        metric_type: &str,
        at: Time,
        metadata: Option<&str>,
    ) -> Result<(), Error> {
        raw::insert_metric(&self.conn, metric_type, at, metadata)
    }

    pub fn total_video_bytes(&self) -> Result<i64, Error> {
        self.empty_if_missing(raw::total_video_bytes(&self.conn))
    }

    /// Deletes the oldest completed videos until the total size of the rest
    /// fits within `retain_bytes`. Cascades remove their frames and nodes;
    /// full-text rows go through [`fts::delete_fts_content`] because the FTS
    /// index needs the old column values.
    ///
    /// Returns the deleted rows so the caller can unlink the files *after*
    /// the transaction has committed; the database stops referencing a file
    /// before the file disappears, never the reverse.
    pub fn prune_videos(&mut self, retain_bytes: i64) -> Result<Vec<PrunedVideo>, Error> {
        let mut excess = raw::total_video_bytes(&self.conn)? - retain_bytes;
        if excess <= 0 {
            return Ok(Vec::new());
        }
        let candidates = raw::list_completed_videos_oldest_first(&self.conn)?;
        let tx = self.conn.transaction()?;
        let mut pruned = Vec::new();
        for v in candidates {
            if excess <= 0 {
                break;
            }
            for frame_id in raw::frame_ids_for_video(&tx, v.id)? {
                fts::delete_fts_content(&tx, frame_id)?;
            }
            raw::delete_video(&tx, v.id)?;
            excess -= v.file_size;
            pruned.push(PrunedVideo {
                id: v.id,
                path: v.path,
                file_size: v.file_size,
            });
        }
        tx.commit()?;
        Ok(pruned)
    }

    /// Maps a missing-schema-object error to an empty result. Read paths
    /// tolerate a database the ingest pipeline hasn't touched yet; write
    /// paths never do.
    fn empty_if_missing<T: Default>(&self, r: Result<T, Error>) -> Result<T, Error> {
        match r {
            Err(e) if is_missing_schema(&e) => Ok(T::default()),
            r => r,
        }
    }
}

/// Whether an error indicates a missing table/index rather than real
/// failure.
pub(crate) fn is_missing_schema(e: &Error) -> bool {
    e.chain().to_string().contains("no such table")
}

pub static INTEGRITY_PRAGMAS: [&str; 2] = [
    // Enforce foreign keys. Note our foreign keys are immediate rather than
    // deferred, so the order of operations during the upgrade matters.
    "pragma foreign_keys = on",
    // Make the database actually durable.
    "pragma synchronous = 3",
];

/// Sets pragmas for full database integrity. These are never run within the
/// migration transaction.
pub(crate) fn set_integrity_pragmas(conn: &mut rusqlite::Connection) -> Result<(), Error> {
    for pragma in INTEGRITY_PRAGMAS {
        conn.execute_batch(pragma)?;
    }
    Ok(())
}

/// Applies the encryption key. Must be the first statement on a fresh
/// connection; until then every read of an encrypted database fails.
pub fn set_key(conn: &rusqlite::Connection, key: &str) -> Result<(), Error> {
    conn.pragma_update(None, "key", key)
        .map_err(|e| err!(e, msg("unable to apply database key")))?;
    // Plaintext in freed pages defeats the point of the cipher.
    conn.pragma_update(None, "cipher_memory_security", "on")?;
    Ok(())
}

pub(crate) fn check_sqlite_version() -> Result<(), Error> {
    // FTS5 external-content tables with a `rank` auxiliary column need
    // 3.20; partial indexes need far less. Bundled SQLCipher is well past
    // this, but a system build might not be.
    if rusqlite::version_number() < 3_020_000 {
        bail!(
            FailedPrecondition,
            msg(
                "SQLite version {} is too old; need at least 3.20",
                rusqlite::version()
            ),
        );
    }
    Ok(())
}

/// Initializes a database at the current schema version.
/// Note this doesn't set journal options, so that it can be used on
/// in-memory databases for test code.
pub fn init(conn: &mut rusqlite::Connection) -> Result<(), Error> {
    check_sqlite_version()?;
    // auto_vacuum can only be chosen before any table exists; changing it
    // later requires a vacuum.
    conn.execute_batch("pragma auto_vacuum = incremental")?;
    set_integrity_pragmas(conn)?;
    let tx = conn.transaction()?;
    tx.execute_batch(include_str!("schema.sql"))
        .map_err(|e| err!(e, msg("unable to create database schema")))?;
    tx.execute(
        r#"
        insert into version (id, unix_time, notes)
                     values (?, cast(strftime('%s', 'now') as int), ?)
        "#,
        params![
            EXPECTED_SCHEMA_VERSION,
            concat!("created by lookback-db ", env!("CARGO_PKG_VERSION")),
        ],
    )?;
    tx.execute("insert into tag (name) values ('hidden')", params![])?;
    tx.commit()?;
    Ok(())
}

/// Gets the schema version from the given database connection.
/// A fully initialized database will return `Ok(Some(schema_version))`. An
/// empty database will return `Ok(None)`. A partially initialized database
/// (in particular, one without a version row) will return some error.
pub fn get_schema_version(conn: &rusqlite::Connection) -> Result<Option<i32>, Error> {
    let ver_tables: i32 = conn.query_row_and_then(
        "select count(*) from sqlite_master where name = 'version'",
        params![],
        |row| row.get(0),
    )?;
    if ver_tables == 0 {
        return Ok(None);
    }
    Ok(Some(conn.query_row_and_then(
        "select max(id) from version",
        params![],
        |row| row.get(0),
    )?))
}

/// Checks that the schema version in the given database is as expected.
pub(crate) fn check_schema_version(conn: &rusqlite::Connection) -> Result<(), Error> {
    let Some(ver) = get_schema_version(conn)? else {
        bail!(
            FailedPrecondition,
            msg("no such table: version.\n\n\
                If you have created an empty database by hand, delete it and \
                use `lookback init` instead. An undecryptable database (wrong \
                or missing --db-key) produces this same symptom."),
        )
    };
    match ver.cmp(&EXPECTED_SCHEMA_VERSION) {
        std::cmp::Ordering::Less => bail!(
            FailedPrecondition,
            msg(
                "database schema version {ver} is too old (expected \
                {EXPECTED_SCHEMA_VERSION}); run `lookback upgrade`"
            ),
        ),
        std::cmp::Ordering::Equal => Ok(()),
        std::cmp::Ordering::Greater => bail!(
            FailedPrecondition,
            msg(
                "database schema version {ver} is too new (expected \
                {EXPECTED_SCHEMA_VERSION}); must use a newer binary to match"
            ),
        ),
    }
}

/// The index database. Abstracts away SQLite queries; serializes all access
/// through [`Database::lock`].
#[derive(Debug)]
pub struct Database<C: Clocks + Clone = clock::RealClocks> {
    /// Wrapped in an `Option` so the `Drop` implementation can take the
    /// connection for its final `pragma optimize`.
    db: Option<Mutex<LockedDatabase>>,

    /// Kept separately from the `LockedDatabase` so the `lock()` operation
    /// itself can use it.
    clocks: C,
}

impl<C: Clocks + Clone> Drop for Database<C> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            return;
        }
        if let Some(m) = self.db.take() {
            let l = m.into_inner().unwrap();
            if let Err(e) = l.conn.execute_batch("pragma optimize") {
                error!(err = %e, "final pragma optimize failed");
            }
        }
    }
}

// Helpers for Database::lock(). Closures don't implement Fn.
fn acquisition() -> &'static str {
    "database lock acquisition"
}
fn operation() -> &'static str {
    "database operation"
}

impl<C: Clocks + Clone> Database<C> {
    /// Creates the database wrapper from a caller-supplied SQLite
    /// connection. Any encryption key must already have been applied with
    /// [`set_key`].
    pub fn new(clocks: C, mut conn: rusqlite::Connection) -> Result<Database<C>, Error> {
        check_sqlite_version()?;
        set_integrity_pragmas(&mut conn)?;
        check_schema_version(&conn)?;
        info!(
            schema_version = EXPECTED_SCHEMA_VERSION,
            sqlite = rusqlite::version(),
            "database opened"
        );
        Ok(Database {
            db: Some(Mutex::new(LockedDatabase {
                conn,
                open_segments: FastHashMap::default(),
            })),
            clocks,
        })
    }

    #[inline(always)]
    pub fn clocks(&self) -> C {
        self.clocks.clone()
    }

    /// Locks the database; the returned reference is the only way to perform
    /// (read or write) operations.
    pub fn lock(&self) -> DatabaseGuard<'_, C> {
        let timer = clock::TimerGuard::new(&self.clocks, acquisition);
        let db = self.db.as_ref().unwrap().lock().unwrap();
        drop(timer);
        let _timer = clock::TimerGuard::<C, &'static str, fn() -> &'static str>::new(
            &self.clocks,
            operation,
        );
        DatabaseGuard { db, _timer }
    }

}

/// Reference to a locked database returned by [`Database::lock`].
pub struct DatabaseGuard<'db, C: Clocks> {
    db: MutexGuard<'db, LockedDatabase>,
    _timer: clock::TimerGuard<'db, C, &'static str, fn() -> &'static str>,
}

impl<'db, C: Clocks + Clone> std::ops::Deref for DatabaseGuard<'db, C> {
    type Target = LockedDatabase;
    fn deref(&self) -> &LockedDatabase {
        &self.db
    }
}

impl<'db, C: Clocks + Clone> std::ops::DerefMut for DatabaseGuard<'db, C> {
    fn deref_mut(&mut self) -> &mut LockedDatabase {
        &mut self.db
    }
}

/// Warns about frame rows whose `videoFrameIndex` falls outside the owning
/// video's `frameCount`; used by `lookback check`.
pub fn check_frame_indexes(conn: &rusqlite::Connection) -> Result<usize, Error> {
    let mut stmt = conn.prepare(
        r#"
        select f.id, f.videoFrameIndex, v.id, v.frameCount
        from frame f join video v on f.videoId = v.id
        where f.videoFrameIndex < 0 or f.videoFrameIndex >= v.frameCount
        "#,
    )?;
    let mut rows = stmt.query(params![])?;
    let mut n = 0;
    while let Some(row) = rows.next()? {
        let (frame_id, index, video_id, count): (i64, i64, i64, i64) =
            (row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?);
        warn!(frame_id, index, video_id, count, "videoFrameIndex out of range");
        n += 1;
    }
    Ok(n)
}
