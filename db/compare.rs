// This file is part of Lookback, a continuous screen activity recorder.
// Copyright (C) 2025 The Lookback Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Schema comparison for upgrade tests.
//!
//! Compares structure rather than raw `sqlite_master.sql` text:
//! `alter table add column` leaves the original CREATE text with the new
//! column appended, which never byte-matches a freshly created table even
//! when the schemas are identical. Columns come from `pragma table_info`;
//! indexes and triggers from normalized `sqlite_master` SQL.

use base::Error;
use rusqlite::{params, Connection};
use std::collections::BTreeMap;
use std::fmt::Write as _;

/// A flattened description of one schema object.
fn describe(conn: &Connection) -> Result<BTreeMap<String, String>, Error> {
    let mut out = BTreeMap::new();
    let mut stmt = conn.prepare(
        "select type, name, tbl_name, sql from sqlite_master order by type, name",
    )?;
    let mut rows = stmt.query(params![])?;
    while let Some(row) = rows.next()? {
        let type_: String = row.get(0)?;
        let name: String = row.get(1)?;
        let sql: Option<String> = row.get(3)?;
        if name.starts_with("sqlite_") {
            continue; // sqlite_sequence and friends.
        }
        match type_.as_str() {
            "table" => {
                let mut desc = String::new();
                let mut info =
                    conn.prepare(&format!("pragma table_info({})", quote_ident(&name)))?;
                let mut cols = info.query(params![])?;
                while let Some(col) = cols.next()? {
                    let col_name: String = col.get(1)?;
                    let col_type: String = col.get(2)?;
                    let notnull: bool = col.get(3)?;
                    let dflt: Option<String> = col.get(4)?;
                    let pk: i32 = col.get(5)?;
                    writeln!(
                        &mut desc,
                        "column {col_name}: type={} notnull={notnull} default={dflt:?} pk={pk}",
                        col_type.to_lowercase(),
                    )
                    .unwrap();
                }
                out.insert(format!("table {name}"), desc);
            }
            "index" | "trigger" | "view" => {
                let sql = sql.map(|s| normalize_sql(&s)).unwrap_or_default();
                out.insert(format!("{type_} {name}"), sql);
            }
            _ => {}
        }
    }
    Ok(out)
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Collapses whitespace and lowercases, so formatting differences between
/// migration text and `schema.sql` don't read as schema differences.
fn normalize_sql(sql: &str) -> String {
    sql.to_lowercase().split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Returns `None` if the schemas match, or a human-readable list of
/// differences.
pub(crate) fn get_diffs(
    n1: &str,
    c1: &Connection,
    n2: &str,
    c2: &Connection,
) -> Result<Option<String>, Error> {
    let d1 = describe(c1)?;
    let d2 = describe(c2)?;
    if d1 == d2 {
        return Ok(None);
    }
    let mut diffs = String::new();
    for (key, desc1) in &d1 {
        match d2.get(key) {
            None => writeln!(&mut diffs, "{key}: only in {n1}").unwrap(),
            Some(desc2) if desc1 != desc2 => {
                writeln!(&mut diffs, "{key}: differs\n  {n1}: {desc1:?}\n  {n2}: {desc2:?}")
                    .unwrap();
            }
            Some(_) => {}
        }
    }
    for key in d2.keys() {
        if !d1.contains_key(key) {
            writeln!(&mut diffs, "{key}: only in {n2}").unwrap();
        }
    }
    Ok(Some(diffs))
}
