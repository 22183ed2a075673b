// This file is part of Lookback, a continuous screen activity recorder.
// Copyright (C) 2025 The Lookback Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

/// Upgrades a version 6 schema to a version 7 schema: multi-display
/// support. Frames and videos are attributed to a display (0 = legacy /
/// unknown), the resumable-video lookup gets its partial index, and
/// displays gain a persistent record plus a connected/disconnected session
/// history with at most one open session each.
pub fn run(_args: &super::Args, tx: &rusqlite::Transaction) -> Result<(), base::Error> {
    tx.execute_batch(
        r#"
        alter table frame add column displayID integer not null default 0;
        alter table frame add column isFocused integer not null default 1;

        alter table video add column displayID integer not null default 0;

        create index video_resumable on video (displayID, width, height, processingState)
            where processingState = 1;

        create table display (
          id integer primary key,
          name text not null default '',
          lastSeenAt integer not null
        );

        create table display_session (
          id integer primary key autoincrement,
          displayID integer not null references display (id) on delete cascade,
          connectedAt integer not null,
          disconnectedAt integer,

          check (disconnectedAt is null or disconnectedAt >= connectedAt)
        );

        create unique index display_session_open on display_session (displayID)
            where disconnectedAt is null;
        "#,
    )?;
    Ok(())
}
