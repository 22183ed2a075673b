// This file is part of Lookback, a continuous screen activity recorder.
// Copyright (C) 2025 The Lookback Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Subcommand to run full-text search from the command line.

use base::clock::{Clocks, RealClocks};
use base::Error;
use bpaf::Bpaf;
use db::dir::StorageDir;
use db::search::{SearchOptions, SearchResults};
use std::path::PathBuf;

/// Searches the OCR index.
#[derive(Bpaf, Debug)]
#[bpaf(command("search"))]
pub struct Args {
    /// Storage root directory.
    #[bpaf(external(crate::parse_storage_root))]
    storage_root: PathBuf,

    /// Encryption key for the index database (also `LOOKBACK_DB_KEY`).
    #[bpaf(long, argument("KEY"))]
    db_key: Option<String>,

    /// Maximum results to print.
    #[bpaf(long, argument("N"), fallback(20), debug_fallback)]
    limit: usize,

    /// Pagination offset.
    #[bpaf(long, argument("N"), fallback(0))]
    offset: usize,

    /// Prints machine-readable JSON instead of text.
    #[bpaf(long)]
    json: bool,

    /// Prints completion suggestions for a prefix instead of searching.
    #[bpaf(long, argument("PREFIX"))]
    suggest: Option<String>,

    /// The query, e.g. `"syntax error" swift -java app:com.apple.dt.Xcode
    /// after:2025-01-01`.
    #[bpaf(positional("QUERY"))]
    query: Vec<String>,
}

pub fn run(args: Args) -> Result<i32, Error> {
    let dir = StorageDir::open_shared(&args.storage_root)?;
    let key = super::resolve_key(args.db_key);
    let conn = super::open_conn(dir.root(), key.as_deref(), super::OpenMode::ReadOnly)?;
    let db = db::Database::new(RealClocks {}, conn)?;
    let l = db.lock();

    if let Some(prefix) = &args.suggest {
        for s in db::search::suggestions(&l, prefix, args.limit)? {
            println!("{s}");
        }
        return Ok(0);
    }

    let query = args.query.join(" ");
    let results = db::search::search(
        &l,
        RealClocks {}.realtime(),
        &query,
        &SearchOptions {
            limit: args.limit,
            offset: args.offset,
            ..Default::default()
        },
    )?;
    if args.json {
        print_json(&results);
    } else {
        print_text(&results);
    }
    Ok(0)
}

fn print_text(r: &SearchResults) {
    println!(
        "{} result(s) of {} total in {} ms",
        r.results.len(),
        r.total_count,
        r.search_time_ms
    );
    for hit in &r.results {
        println!(
            "{:.3}  frame {}  {}  [{} / {}]",
            hit.relevance_score,
            hit.frame_id,
            hit.timestamp,
            hit.metadata.app_name.as_deref().unwrap_or("?"),
            hit.metadata.window_name.as_deref().unwrap_or("?"),
        );
        println!("       {}", hit.snippet);
    }
}

fn print_json(r: &SearchResults) {
    // Assembled by hand; SearchResult deliberately doesn't implement
    // Serialize to keep the library surface free of wire-format choices.
    let results: Vec<serde_json::Value> = r
        .results
        .iter()
        .map(|hit| {
            serde_json::json!({
                "frameId": hit.frame_id,
                "timestamp": hit.timestamp.0,
                "snippet": hit.snippet,
                "matchedText": hit.matched_text,
                "relevanceScore": hit.relevance_score,
                "metadata": {
                    "appBundleID": hit.metadata.app_bundle_id,
                    "appName": hit.metadata.app_name,
                    "windowName": hit.metadata.window_name,
                    "browserURL": hit.metadata.browser_url,
                },
                "segmentId": hit.segment_id,
                "videoId": hit.video_id,
                "frameIndex": hit.frame_index,
            })
        })
        .collect();
    let out = serde_json::json!({
        "query": r.query,
        "results": results,
        "totalCount": r.total_count,
        "searchTimeMs": r.search_time_ms,
    });
    println!("{out}");
}
