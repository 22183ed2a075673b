// This file is part of Lookback, a continuous screen activity recorder.
// Copyright (C) 2025 The Lookback Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Raw database access: SQL statements which do not touch any cached state.

use crate::db::{FrameRow, FrameToInsert, NodeToInsert, SegmentRow, VideoRow, VideoToInsert};
use base::time::Time;
use base::Error;
use rusqlite::{named_params, params, Connection, OptionalExtension};

// The path is filled in at completion: it embeds the video id, which isn't
// known until the insert. An in-progress row's WAL session is authoritative
// anyway.
const INSERT_VIDEO_SQL: &str = r#"
    insert into video (width,  height,  path, frameRate,  displayID,  processingState)
               values (:width, :height, '',   :frameRate, :displayID, 1)
"#;

const COMPLETE_VIDEO_SQL: &str = r#"
    update video
    set processingState = 0,
        path = :path,
        fileSize = :fileSize,
        frameCount = :frameCount
    where id = :id
"#;

const INSERT_SEGMENT_SQL: &str = r#"
    insert into segment (bundleID,  startDate,  endDate,  windowName,  browserUrl,  type)
                 values (:bundleID, :startDate, :endDate, :windowName, :browserUrl, 0)
"#;

const INSERT_FRAME_SQL: &str = r#"
    insert into frame (createdAt,  segmentId,  videoId,  videoFrameIndex,  displayID,  isFocused)
               values (:createdAt, :segmentId, :videoId, :videoFrameIndex, :displayID, :isFocused)
"#;

const INSERT_NODE_SQL: &str = r#"
    insert into node (frameId,  nodeOrder,  textOffset,  textLength,
                      leftX,  topY,  width,  height,  windowIndex)
              values (:frameId, :nodeOrder, :textOffset, :textLength,
                      :leftX, :topY, :width, :height, :windowIndex)
"#;

/// Opens a `display_session` row unless the display already has one open.
/// The partial unique index makes a concurrent double-open impossible; this
/// statement makes a sequential one a no-op.
const OPEN_DISPLAY_SESSION_SQL: &str = r#"
    insert into display_session (displayID, connectedAt)
    select :displayID, :connectedAt
    where not exists (select 1 from display_session
                      where displayID = :displayID and disconnectedAt is null)
"#;

pub(crate) fn insert_video(conn: &Connection, v: &VideoToInsert) -> Result<i64, Error> {
    let mut stmt = conn.prepare_cached(INSERT_VIDEO_SQL)?;
    stmt.execute(named_params! {
        ":width": v.width,
        ":height": v.height,
        ":frameRate": v.frame_rate,
        ":displayID": v.display_id,
    })?;
    Ok(conn.last_insert_rowid())
}

pub(crate) fn complete_video(
    conn: &Connection,
    id: i64,
    path: &str,
    file_size: i64,
    frame_count: i64,
) -> Result<(), Error> {
    let mut stmt = conn.prepare_cached(COMPLETE_VIDEO_SQL)?;
    stmt.execute(named_params! {
        ":id": id,
        ":path": path,
        ":fileSize": file_size,
        ":frameCount": frame_count,
    })?;
    Ok(())
}

pub(crate) fn get_video(conn: &Connection, id: i64) -> Result<Option<VideoRow>, Error> {
    let mut stmt = conn.prepare_cached(
        r#"
        select
          id, width, height, path, fileSize, frameRate, uploadedAt, xid,
          processingState, frameCount, displayID
        from video where id = ?
        "#,
    )?;
    Ok(stmt.query_row(params![id], video_row).optional()?)
}

fn video_row(row: &rusqlite::Row) -> rusqlite::Result<VideoRow> {
    Ok(VideoRow {
        id: row.get(0)?,
        width: row.get(1)?,
        height: row.get(2)?,
        path: row.get(3)?,
        file_size: row.get(4)?,
        frame_rate: row.get(5)?,
        uploaded_at: row.get::<_, Option<i64>>(6)?.map(Time),
        xid: row.get(7)?,
        processing_state: row.get(8)?,
        frame_count: row.get(9)?,
        display_id: row.get(10)?,
    })
}

/// Returns ids of videos still marked in progress; after recovery there
/// should be none.
pub(crate) fn list_in_progress_videos(conn: &Connection) -> Result<Vec<i64>, Error> {
    let mut stmt = conn.prepare_cached("select id from video where processingState = 1")?;
    let ids = stmt
        .query_map(params![], |row| row.get(0))?
        .collect::<Result<Vec<i64>, _>>()?;
    Ok(ids)
}

pub(crate) fn delete_video(conn: &Connection, id: i64) -> Result<bool, Error> {
    let mut stmt = conn.prepare_cached("delete from video where id = ?")?;
    Ok(stmt.execute(params![id])? > 0)
}

/// Completed videos, oldest first, for retention pruning.
pub(crate) fn list_completed_videos_oldest_first(
    conn: &Connection,
) -> Result<Vec<VideoRow>, Error> {
    let mut stmt = conn.prepare_cached(
        r#"
        select
          id, width, height, path, fileSize, frameRate, uploadedAt, xid,
          processingState, frameCount, displayID
        from video where processingState = 0 order by id
        "#,
    )?;
    let rows = stmt
        .query_map(params![], video_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub(crate) fn total_video_bytes(conn: &Connection) -> Result<i64, Error> {
    let mut stmt =
        conn.prepare_cached("select coalesce(sum(fileSize), 0) from video where processingState = 0")?;
    Ok(stmt.query_row(params![], |row| row.get(0))?)
}

pub(crate) fn insert_segment(
    conn: &Connection,
    bundle_id: Option<&str>,
    window_name: Option<&str>,
    browser_url: Option<&str>,
    start: Time,
) -> Result<i64, Error> {
    let mut stmt = conn.prepare_cached(INSERT_SEGMENT_SQL)?;
    stmt.execute(named_params! {
        ":bundleID": bundle_id,
        ":startDate": start.0,
        ":endDate": start.0,
        ":windowName": window_name,
        ":browserUrl": browser_url,
    })?;
    Ok(conn.last_insert_rowid())
}

/// Extends a segment's `endDate`; never moves it backward.
pub(crate) fn extend_segment(conn: &Connection, id: i64, end: Time) -> Result<(), Error> {
    let mut stmt =
        conn.prepare_cached("update segment set endDate = ? where id = ? and endDate < ?")?;
    stmt.execute(params![end.0, id, end.0])?;
    Ok(())
}

pub(crate) fn get_segment(conn: &Connection, id: i64) -> Result<Option<SegmentRow>, Error> {
    let mut stmt = conn.prepare_cached(
        "select id, bundleID, startDate, endDate, windowName, browserUrl, type from segment \
         where id = ?",
    )?;
    Ok(stmt
        .query_row(params![id], |row| {
            Ok(SegmentRow {
                id: row.get(0)?,
                bundle_id: row.get(1)?,
                start_date: Time(row.get(2)?),
                end_date: Time(row.get(3)?),
                window_name: row.get(4)?,
                browser_url: row.get(5)?,
                segment_type: row.get(6)?,
            })
        })
        .optional()?)
}

pub(crate) fn insert_frame(conn: &Connection, f: &FrameToInsert) -> Result<i64, Error> {
    let mut stmt = conn.prepare_cached(INSERT_FRAME_SQL)?;
    stmt.execute(named_params! {
        ":createdAt": f.created_at.0,
        ":segmentId": f.segment_id,
        ":videoId": f.video_id,
        ":videoFrameIndex": f.video_frame_index,
        ":displayID": f.display_id,
        ":isFocused": f.is_focused,
    })?;
    Ok(conn.last_insert_rowid())
}

/// Whether any frame exists within the given Unix second. Recovery uses this
/// to avoid re-inserting frames that an earlier (interrupted) recovery pass
/// or a second display already committed.
pub(crate) fn frame_exists_in_second(conn: &Connection, unix_second: i64) -> Result<bool, Error> {
    let mut stmt = conn.prepare_cached(
        "select exists (select 1 from frame where createdAt >= ? and createdAt < ?)",
    )?;
    Ok(stmt.query_row(params![unix_second * 1_000, (unix_second + 1) * 1_000], |row| {
        row.get(0)
    })?)
}

pub(crate) fn get_frame(conn: &Connection, id: i64) -> Result<Option<FrameRow>, Error> {
    let mut stmt = conn.prepare_cached(
        r#"
        select
          id, createdAt, imageFileName, segmentId, videoId, videoFrameIndex,
          isStarred, encodingStatus, processedAt, displayID, isFocused
        from frame where id = ?
        "#,
    )?;
    Ok(stmt
        .query_row(params![id], |row| {
            Ok(FrameRow {
                id: row.get(0)?,
                created_at: Time(row.get(1)?),
                image_file_name: row.get(2)?,
                segment_id: row.get(3)?,
                video_id: row.get(4)?,
                video_frame_index: row.get(5)?,
                is_starred: row.get(6)?,
                encoding_status: row.get(7)?,
                processed_at: row.get::<_, Option<i64>>(8)?.map(Time),
                display_id: row.get(9)?,
                is_focused: row.get(10)?,
            })
        })
        .optional()?)
}

pub(crate) fn frame_ids_for_video(conn: &Connection, video_id: i64) -> Result<Vec<i64>, Error> {
    let mut stmt = conn.prepare_cached("select id from frame where videoId = ?")?;
    let ids = stmt
        .query_map(params![video_id], |row| row.get(0))?
        .collect::<Result<Vec<i64>, _>>()?;
    Ok(ids)
}

pub(crate) fn detach_overflow_frames(
    conn: &Connection,
    video_id: i64,
    frame_count: i64,
) -> Result<usize, Error> {
    let mut stmt = conn.prepare_cached(
        "update frame set videoId = null where videoId = ? and videoFrameIndex >= ?",
    )?;
    Ok(stmt.execute(params![video_id, frame_count])?)
}

pub(crate) fn mark_frame_processed(conn: &Connection, id: i64, at: Time) -> Result<bool, Error> {
    let mut stmt = conn.prepare_cached("update frame set processedAt = ? where id = ?")?;
    Ok(stmt.execute(params![at.0, id])? > 0)
}

pub(crate) fn insert_node(conn: &Connection, n: &NodeToInsert) -> Result<i64, Error> {
    let mut stmt = conn.prepare_cached(INSERT_NODE_SQL)?;
    stmt.execute(named_params! {
        ":frameId": n.frame_id,
        ":nodeOrder": n.node_order,
        ":textOffset": n.text_offset,
        ":textLength": n.text_length,
        ":leftX": n.left_x,
        ":topY": n.top_y,
        ":width": n.width,
        ":height": n.height,
        ":windowIndex": n.window_index,
    })?;
    Ok(conn.last_insert_rowid())
}

pub(crate) fn upsert_display(
    conn: &Connection,
    id: u32,
    name: &str,
    seen: Time,
) -> Result<(), Error> {
    let mut stmt = conn.prepare_cached(
        r#"
        insert into display (id, name, lastSeenAt) values (:id, :name, :seen)
        on conflict (id) do update set name = :name, lastSeenAt = :seen
        "#,
    )?;
    stmt.execute(named_params! { ":id": id, ":name": name, ":seen": seen.0 })?;
    Ok(())
}

pub(crate) fn open_display_session(conn: &Connection, id: u32, at: Time) -> Result<(), Error> {
    let mut stmt = conn.prepare_cached(OPEN_DISPLAY_SESSION_SQL)?;
    stmt.execute(named_params! { ":displayID": id, ":connectedAt": at.0 })?;
    Ok(())
}

pub(crate) fn close_display_session(conn: &Connection, id: u32, at: Time) -> Result<(), Error> {
    let mut stmt = conn.prepare_cached(
        "update display_session set disconnectedAt = ? \
         where displayID = ? and disconnectedAt is null",
    )?;
    stmt.execute(params![at.0, id])?;
    Ok(())
}

pub(crate) fn insert_metric(
    conn: &Connection,
    metric_type: &str,
    at: Time,
    metadata: Option<&str>,
) -> Result<(), Error> {
    let mut stmt = conn
        .prepare_cached("insert into daily_metrics (metricType, timestamp, metadata) values (?, ?, ?)")?;
    stmt.execute(params![metric_type, at.0, metadata])?;
    Ok(())
}
