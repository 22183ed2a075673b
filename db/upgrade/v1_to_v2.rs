// This file is part of Lookback, a continuous screen activity recorder.
// Copyright (C) 2025 The Lookback Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

/// Upgrades a version 1 schema to a version 2 schema: videos carry an
/// expected frame count (the in-progress maximum for existing rows).
pub fn run(_args: &super::Args, tx: &rusqlite::Transaction) -> Result<(), base::Error> {
    tx.execute_batch(
        r#"
        alter table video add column frameCount integer not null default 150;
        "#,
    )?;
    Ok(())
}
