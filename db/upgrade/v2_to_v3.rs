// This file is part of Lookback, a continuous screen activity recorder.
// Copyright (C) 2025 The Lookback Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

/// Upgrades a version 2 schema to a version 3 schema: user-defined tags on
/// app segments, with the `hidden` tag seeded.
pub fn run(_args: &super::Args, tx: &rusqlite::Transaction) -> Result<(), base::Error> {
    tx.execute_batch(
        r#"
        create table tag (
          id integer primary key autoincrement,
          name text unique not null
        );

        create table segment_tag (
          segmentId integer not null references segment (id) on delete cascade,
          tagId integer not null references tag (id) on delete cascade,
          createdAt integer not null,
          primary key (segmentId, tagId)
        );

        insert into tag (name) values ('hidden');
        "#,
    )?;
    Ok(())
}
