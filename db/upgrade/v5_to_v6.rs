// This file is part of Lookback, a continuous screen activity recorder.
// Copyright (C) 2025 The Lookback Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

/// Upgrades a version 5 schema to a version 6 schema: `processedAt` is
/// backfilled for frames that predate the column but were already marked
/// processed (encoding status 2), using their capture time as the best
/// available estimate.
pub fn run(_args: &super::Args, tx: &rusqlite::Transaction) -> Result<(), base::Error> {
    tx.execute_batch(
        r#"
        update frame set processedAt = createdAt
        where processedAt is null and encodingStatus >= 2;
        "#,
    )?;
    Ok(())
}
