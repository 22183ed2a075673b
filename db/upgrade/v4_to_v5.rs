// This file is part of Lookback, a continuous screen activity recorder.
// Copyright (C) 2025 The Lookback Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

/// Upgrades a version 4 schema to a version 5 schema: frames record when
/// OCR finished.
pub fn run(_args: &super::Args, tx: &rusqlite::Transaction) -> Result<(), base::Error> {
    tx.execute_batch(
        r#"
        alter table frame add column processedAt integer;
        "#,
    )?;
    Ok(())
}
