// This file is part of Lookback, a continuous screen activity recorder.
// Copyright (C) 2025 The Lookback Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Startup recovery: turns surviving WAL sessions back into videos and
//! database rows.
//!
//! Runs exactly once, before normal capture begins. Frames from all
//! readable sessions are grouped by resolution, sorted by timestamp, cut
//! into chunks of at most [`MAX_FRAMES_PER_VIDEO`], and re-encoded through
//! a fresh [`SegmentWriter`] each. Frames the database already has (same
//! Unix second) are skipped, which also makes an interrupted recovery
//! idempotent. A session that fails to process is skipped — and left on
//! disk for the next attempt — without failing the others.

use crate::db::{self, Database, SegmentKey, VideoToInsert, MAX_FRAMES_PER_VIDEO};
use crate::dir::StorageDir;
use crate::encoder::{EncoderConfig, FrameSink};
use crate::frame::CapturedFrame;
use crate::raw;
use crate::wal::{self, WalSession};
use crate::writer::SegmentWriter;
use base::clock::Clocks;
use base::time::Time;
use base::{err, Error, FastHashMap};
use std::collections::VecDeque;
use tracing::{info, info_span, warn};

#[derive(Debug, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// WAL sessions found on disk.
    pub sessions: usize,

    /// Sessions dropped for having zero readable frames.
    pub empty_sessions: usize,

    /// Sessions skipped on error and left on disk.
    pub skipped_sessions: usize,

    pub videos_created: usize,
    pub frames_inserted: usize,

    /// Frames already present in the database (same second).
    pub frames_skipped: usize,
}

/// Recovers all WAL sessions. `make_sink` supplies one encoder backend per
/// produced video; `enqueue_frames` receives every newly inserted frame id
/// for OCR.
pub fn recover<C, S, F>(
    db: &Database<C>,
    dir: &StorageDir,
    cfg: &EncoderConfig,
    mut make_sink: F,
    enqueue_frames: &dyn Fn(&[i64]),
) -> Result<RecoveryReport, Error>
where
    C: Clocks + Clone,
    S: FrameSink,
    F: FnMut() -> S,
{
    let _span = info_span!("recovery").entered();
    let mut report = RecoveryReport::default();
    let sessions = wal::list_active_sessions(&dir.wal_root())?;
    report.sessions = sessions.len();
    if sessions.is_empty() {
        return Ok(report);
    }
    info!(sessions = sessions.len(), "recovering WAL sessions");

    // Group readable sessions by resolution. A session's frames all share
    // the dimensions of its first frame.
    struct Group {
        frames: Vec<CapturedFrame>,
        sessions: Vec<WalSession>,
    }
    let mut groups: FastHashMap<(u32, u32), Group> = FastHashMap::default();
    for session in sessions {
        let frames = match session.read_frames() {
            Ok(f) => f,
            Err(e) => {
                warn!(
                    session = %session.dir().display(),
                    err = %e.chain(),
                    "skipping unreadable WAL session"
                );
                report.skipped_sessions += 1;
                continue;
            }
        };
        clean_stale_video(db, dir, &session);
        let Some(first) = frames.first() else {
            report.empty_sessions += 1;
            if let Err(e) = session.finalize() {
                warn!(err = %e.chain(), "unable to drop empty WAL session");
            }
            continue;
        };
        let group = groups
            .entry((first.width, first.height))
            .or_insert_with(|| Group {
                frames: Vec::new(),
                sessions: Vec::new(),
            });
        group.frames.extend(frames);
        group.sessions.push(session);
    }

    let mut inserted_ids = Vec::new();
    let mut app_segments: FastHashMap<SegmentKey, i64> = FastHashMap::default();
    for ((width, height), group) in groups {
        let mut frames = group.frames;
        frames.sort_by_key(|f| f.timestamp);
        let mut pending: VecDeque<CapturedFrame> = frames.into();
        let mut group_ok = true;
        while !pending.is_empty() {
            let take = pending.len().min(MAX_FRAMES_PER_VIDEO);
            let chunk: Vec<CapturedFrame> = pending.drain(..take).collect();
            match recover_chunk(
                db,
                dir,
                cfg,
                make_sink(),
                &chunk,
                &mut app_segments,
                &mut report,
                &mut inserted_ids,
            ) {
                Ok(leftover) if leftover == chunk.len() => {
                    // No progress; don't spin.
                    warn!(
                        width,
                        height,
                        frames = chunk.len(),
                        "no progress recovering chunk; leaving sessions for next startup"
                    );
                    group_ok = false;
                    break;
                }
                Ok(leftover) => {
                    // The encoder died partway; the tail goes back on the
                    // queue for a fresh writer.
                    for f in chunk.into_iter().rev().take(leftover) {
                        pending.push_front(f);
                    }
                }
                Err(e) => {
                    warn!(
                        width,
                        height,
                        err = %e.chain(),
                        "chunk recovery failed; leaving sessions for next startup"
                    );
                    group_ok = false;
                    break;
                }
            }
        }
        if group_ok {
            for session in group.sessions {
                if let Err(e) = session.finalize() {
                    warn!(err = %e.chain(), "unable to remove recovered WAL session");
                }
            }
        }
    }

    if !inserted_ids.is_empty() {
        enqueue_frames(&inserted_ids);
    }
    info!(
        videos = report.videos_created,
        frames = report.frames_inserted,
        skipped_frames = report.frames_skipped,
        "recovery complete"
    );
    Ok(report)
}

/// Deletes the stale in-progress video row (and any partial MP4) that the
/// crashed writer left behind; recovery re-encodes under fresh ids.
fn clean_stale_video<C: Clocks + Clone>(db: &Database<C>, dir: &StorageDir, session: &WalSession) {
    let video_id = session.video_id();
    let mut l = db.lock();
    match l.get_video(video_id) {
        Ok(Some(v)) if v.processing_state == 1 => {
            if let Err(e) = l.delete_video(video_id) {
                warn!(video_id, err = %e.chain(), "unable to delete stale in-progress video row");
            }
        }
        Ok(_) => return,
        Err(e) => {
            warn!(video_id, err = %e.chain(), "unable to look up stale video row");
            return;
        }
    }
    drop(l);
    if let Ok(rel) = StorageDir::segment_relpath(video_id, Time(session.meta().start_time)) {
        match std::fs::remove_file(dir.full_path(&rel)) {
            Ok(()) => info!(video_id, "removed partial MP4 of crashed segment"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => warn!(video_id, %err, "unable to remove partial MP4"),
        }
    }
}

/// Re-encodes one chunk and commits its rows in a single transaction.
/// Returns how many trailing frames were *not* consumed (encoder died) and
/// should be retried with a fresh writer.
#[allow(clippy::too_many_arguments)]
fn recover_chunk<C, S>(
    db: &Database<C>,
    dir: &StorageDir,
    cfg: &EncoderConfig,
    sink: S,
    chunk: &[CapturedFrame],
    app_segments: &mut FastHashMap<SegmentKey, i64>,
    report: &mut RecoveryReport,
    inserted_ids: &mut Vec<i64>,
) -> Result<usize, Error>
where
    C: Clocks + Clone,
    S: FrameSink,
{
    let l = db.lock();

    // If every frame of the chunk is already present, don't re-create a
    // video for it (an interrupted recovery got here first).
    let mut all_present = true;
    for f in chunk {
        if !l.frame_exists_in_second(f.timestamp.unix_seconds())? {
            all_present = false;
            break;
        }
    }
    if all_present {
        report.frames_skipped += chunk.len();
        return Ok(0);
    }

    let first = &chunk[0];
    let start_time = first.timestamp;
    let display_id = first.metadata.display_id;
    let tx = l.conn.unchecked_transaction()?;
    let video_id = raw::insert_video(
        &tx,
        &VideoToInsert {
            width: first.width,
            height: first.height,
            frame_rate: cfg.frame_rate as i32,
            display_id,
        },
    )?;

    let mut writer = SegmentWriter::new(dir, video_id, display_id, start_time, sink, cfg.clone())?;
    for frame in chunk {
        if !writer.encoder_ok() {
            break;
        }
        writer
            .append(frame)
            .map_err(|e| err!(e, msg("WAL re-append failed during recovery")))?;
    }
    let encoded = writer.encoded_frames() as usize;
    if encoded == 0 {
        // Nothing made it into a video; abandon this attempt entirely.
        writer.cancel()?;
        return Ok(chunk.len());
    }
    let leftover = chunk.len() - encoded;

    let (seg, new_wal) = writer.finalize()?;
    raw::complete_video(&tx, video_id, &seg.rel_path, seg.file_size, seg.frame_count)?;

    for (index, frame) in chunk[..encoded].iter().enumerate() {
        if raw::frame_exists_in_second(&tx, frame.timestamp.unix_seconds())? {
            report.frames_skipped += 1;
            continue;
        }
        let key = SegmentKey {
            bundle_id: frame.metadata.app_bundle_id.clone(),
            window_name: frame.metadata.window_name.clone(),
        };
        let segment_id = match app_segments.get(&key) {
            Some(&id) => id,
            None => {
                let id = raw::insert_segment(
                    &tx,
                    key.bundle_id.as_deref(),
                    key.window_name.as_deref(),
                    frame.metadata.browser_url.as_deref(),
                    frame.timestamp,
                )?;
                app_segments.insert(key, id);
                id
            }
        };
        raw::extend_segment(&tx, segment_id, frame.timestamp)?;
        let frame_id = raw::insert_frame(
            &tx,
            &db::FrameToInsert {
                created_at: frame.timestamp,
                segment_id,
                video_id: Some(video_id),
                video_frame_index: index as i32,
                display_id: frame.metadata.display_id,
                is_focused: frame.metadata.is_focused,
            },
        )?;
        inserted_ids.push(frame_id);
        report.frames_inserted += 1;
    }
    tx.commit()?;
    report.videos_created += 1;

    // The rows are durable; the replay copy of these frames can go.
    new_wal.finalize()?;
    Ok(leftover)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FrameMetadata;
    use crate::testutil::{self, MockSink, TestDb};
    use crate::wal::WalSession;
    use std::sync::Mutex;

    fn frame(t_ms: i64, w: u32, h: u32, display: u32) -> CapturedFrame {
        let mut f = CapturedFrame::solid(Time(t_ms), w, h, [4, 5, 6, 255]);
        f.metadata = FrameMetadata {
            app_bundle_id: Some("com.example.editor".to_owned()),
            app_name: Some("Editor".to_owned()),
            window_name: Some("main.rs".to_owned()),
            browser_url: None,
            display_id: display,
            is_focused: true,
        };
        f
    }

    fn write_session(tdb: &TestDb, video_id: i64, frames: &[CapturedFrame]) {
        let start = frames.first().map(|f| f.timestamp).unwrap_or(Time(0));
        let mut s = WalSession::create(&tdb.dir.wal_root(), video_id, start).unwrap();
        for f in frames {
            s.append(f).unwrap();
        }
        // Dropping without finalize simulates the crash.
    }

    fn run_recovery(tdb: &TestDb) -> (RecoveryReport, Vec<i64>) {
        let enqueued = Mutex::new(Vec::new());
        let report = recover(
            &tdb.db,
            &tdb.dir,
            &EncoderConfig::default(),
            MockSink::default,
            &|ids: &[i64]| enqueued.lock().unwrap().extend_from_slice(ids),
        )
        .unwrap();
        let ids = enqueued.into_inner().unwrap();
        (report, ids)
    }

    /// Spec'd scenario: 3 frames survive a crash; after recovery exactly
    /// one video row exists with frameCount 3 and three frame rows with
    /// videoFrameIndex 0..3, and the WAL is gone.
    #[test]
    fn replay_after_crash() {
        testutil::init();
        let tdb = TestDb::new();
        let t0 = 1_735_689_600_000;
        let frames: Vec<_> = (0..3).map(|i| frame(t0 + i * 2_000, 10, 10, 1)).collect();
        write_session(&tdb, 7, &frames);

        let (report, enqueued) = run_recovery(&tdb);
        assert_eq!(report.sessions, 1);
        assert_eq!(report.videos_created, 1);
        assert_eq!(report.frames_inserted, 3);
        assert_eq!(enqueued.len(), 3);

        let l = tdb.db.lock();
        let mut indexes = Vec::new();
        for (i, &id) in enqueued.iter().enumerate() {
            let f = l.get_frame(id).unwrap().unwrap();
            assert_eq!(f.created_at, frames[i].timestamp);
            indexes.push(f.video_frame_index);
            let v = l.get_video(f.video_id.unwrap()).unwrap().unwrap();
            assert_eq!(v.frame_count, 3);
            assert_eq!(v.processing_state, 0);
            assert!(tdb.dir.full_path(&v.path).exists());
        }
        indexes.sort();
        assert_eq!(indexes, vec![0, 1, 2]);
        assert!(wal::list_active_sessions(&tdb.dir.wal_root()).unwrap().is_empty());
        drop(l);

        // Idempotent: nothing left to do.
        let (report, enqueued) = run_recovery(&tdb);
        assert_eq!(report, RecoveryReport::default());
        assert!(enqueued.is_empty());
    }

    /// Spec'd scenario: 80 + 200 frames at one resolution and 50 at
    /// another become videos of 150, 130, and 50 frames.
    #[test]
    fn groups_by_resolution_and_chunks() {
        testutil::init();
        let tdb = TestDb::new();
        let t0: i64 = 1_735_689_600_000;
        let mut t = t0;
        let mut next = |w, h| {
            t += 1_000;
            frame(t, w, h, 1)
        };
        let a: Vec<_> = (0..80).map(|_| next(32, 16)).collect();
        let b: Vec<_> = (0..200).map(|_| next(32, 16)).collect();
        let c: Vec<_> = (0..50).map(|_| next(16, 16)).collect();
        write_session(&tdb, 1, &a);
        write_session(&tdb, 2, &b);
        write_session(&tdb, 3, &c);

        let (report, enqueued) = run_recovery(&tdb);
        assert_eq!(report.sessions, 3);
        assert_eq!(report.videos_created, 3);
        assert_eq!(report.frames_inserted, 330);
        assert_eq!(enqueued.len(), 330);
        assert!(wal::list_active_sessions(&tdb.dir.wal_root()).unwrap().is_empty());

        let l = tdb.db.lock();
        let mut counts: Vec<(u32, u32, i64)> = Vec::new();
        for video_id in 1..100 {
            let Some(v) = l.get_video(video_id).unwrap() else { continue };
            counts.push((v.width, v.height, v.frame_count));
        }
        counts.sort();
        assert_eq!(counts, vec![(16, 16, 50), (32, 16, 130), (32, 16, 150)]);
    }

    #[test]
    fn empty_sessions_are_dropped() {
        testutil::init();
        let tdb = TestDb::new();
        write_session(&tdb, 5, &[]);
        let (report, enqueued) = run_recovery(&tdb);
        assert_eq!(report.empty_sessions, 1);
        assert_eq!(report.videos_created, 0);
        assert!(enqueued.is_empty());
        assert!(wal::list_active_sessions(&tdb.dir.wal_root()).unwrap().is_empty());
    }

    #[test]
    fn duplicate_timestamps_are_skipped() {
        testutil::init();
        let tdb = TestDb::new();
        let t0 = 1_735_689_600_000;
        let frames: Vec<_> = (0..3).map(|i| frame(t0 + i * 2_000, 10, 10, 1)).collect();

        // The middle frame's second is already in the database (e.g. a
        // second display's recovery got there first).
        {
            let mut l = tdb.db.lock();
            l.insert_frame(&SegmentKey::default(), None, Time(t0 + 2_000), None, 0, 2, true)
                .unwrap();
        }
        write_session(&tdb, 9, &frames);
        let (report, enqueued) = run_recovery(&tdb);
        assert_eq!(report.frames_inserted, 2);
        assert_eq!(report.frames_skipped, 1);
        assert_eq!(enqueued.len(), 2);

        // The video still holds all three encoded frames, and the inserted
        // rows keep their chunk positions.
        let l = tdb.db.lock();
        let f = l.get_frame(enqueued[1]).unwrap().unwrap();
        assert_eq!(f.video_frame_index, 2);
        let v = l.get_video(f.video_id.unwrap()).unwrap().unwrap();
        assert_eq!(v.frame_count, 3);
    }

    #[test]
    fn encoder_failure_splits_chunk() {
        testutil::init();
        let tdb = TestDb::new();
        let t0: i64 = 1_735_689_600_000;
        let frames: Vec<_> = (0..10).map(|i| frame(t0 + i * 1_000, 10, 10, 1)).collect();
        write_session(&tdb, 4, &frames);

        // Each sink dies after 4 frames: 10 frames become videos of 4+4+2.
        let enqueued = Mutex::new(Vec::new());
        let report = recover(
            &tdb.db,
            &tdb.dir,
            &EncoderConfig::default(),
            || MockSink {
                fail_after: Some(4),
                ..Default::default()
            },
            &|ids: &[i64]| enqueued.lock().unwrap().extend_from_slice(ids),
        )
        .unwrap();
        assert_eq!(report.videos_created, 3);
        assert_eq!(report.frames_inserted, 10);
        assert!(wal::list_active_sessions(&tdb.dir.wal_root()).unwrap().is_empty());

        let l = tdb.db.lock();
        let mut counts = Vec::new();
        for video_id in 1..100 {
            let Some(v) = l.get_video(video_id).unwrap() else { continue };
            counts.push(v.frame_count);
        }
        counts.sort();
        assert_eq!(counts, vec![2, 4, 4]);
    }

    #[test]
    fn total_encoder_failure_leaves_wal() {
        testutil::init();
        let tdb = TestDb::new();
        let frames: Vec<_> = (0..3)
            .map(|i| frame(1_735_689_600_000 + i * 1_000, 10, 10, 1))
            .collect();
        write_session(&tdb, 6, &frames);

        let enqueued = Mutex::new(Vec::new());
        let report = recover(
            &tdb.db,
            &tdb.dir,
            &EncoderConfig::default(),
            || MockSink {
                fail_after: Some(0),
                ..Default::default()
            },
            &|ids: &[i64]| enqueued.lock().unwrap().extend_from_slice(ids),
        )
        .unwrap();
        assert_eq!(report.videos_created, 0);
        assert_eq!(report.frames_inserted, 0);
        // The session survives for the next attempt.
        assert_eq!(wal::list_active_sessions(&tdb.dir.wal_root()).unwrap().len(), 1);
    }

    #[test]
    fn stale_in_progress_row_is_cleaned() {
        testutil::init();
        let tdb = TestDb::new();
        let t0 = 1_735_689_600_000;

        // Simulate the live writer's state at crash time: an in-progress
        // video row whose id matches the WAL session.
        let video_id = {
            let mut l = tdb.db.lock();
            l.start_video(&VideoToInsert {
                width: 10,
                height: 10,
                frame_rate: 30,
                display_id: 1,
            })
            .unwrap()
        };
        write_session(&tdb, video_id, &[frame(t0, 10, 10, 1)]);

        let (report, _) = run_recovery(&tdb);
        assert_eq!(report.videos_created, 1);
        let l = tdb.db.lock();
        assert!(l.list_in_progress_videos().unwrap().is_empty());
    }
}
