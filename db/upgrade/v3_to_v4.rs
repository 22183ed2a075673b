// This file is part of Lookback, a continuous screen activity recorder.
// Copyright (C) 2025 The Lookback Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

/// Upgrades a version 3 schema to a version 4 schema: engagement events.
pub fn run(_args: &super::Args, tx: &rusqlite::Transaction) -> Result<(), base::Error> {
    tx.execute_batch(
        r#"
        create table daily_metrics (
          id integer primary key autoincrement,
          metricType text not null,
          timestamp integer not null,
          metadata text
        );

        create index daily_metrics_type_time on daily_metrics (metricType, timestamp);
        "#,
    )?;
    Ok(())
}
