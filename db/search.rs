// This file is part of Lookback, a continuous screen activity recorder.
// Copyright (C) 2025 The Lookback Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Full-text search: query grammar, FTS5 query building, and ranking.
//!
//! A query is a whitespace-separated token list that preserves quoted
//! spans. `foo` prefix-matches, `"foo bar"` is an exact phrase, a `-`
//! prefix excludes, and `app:`, `after:`, `before:` become filters rather
//! than match terms. Ranking starts from BM25 normalized into [0, 1) and
//! adds weighted recency and metadata-hit boosts.

use crate::db::{is_missing_schema, LockedDatabase};
use base::time::Time;
use base::{bail, err, Error};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter};
use std::collections::BTreeSet;

/// Days over which the recency boost decays linearly to zero.
const RECENCY_HORIZON_DAYS: f64 = 30.0;

const WINDOW_TITLE_HIT: f64 = 0.3;
const APP_NAME_HIT: f64 = 0.2;
const BROWSER_URL_HIT: f64 = 0.5;

#[derive(Clone, Debug)]
pub struct SearchOptions {
    pub limit: usize,
    pub offset: usize,

    /// App filter combined with any `app:` token in the query (the query
    /// token wins).
    pub app_filter: Option<String>,

    pub recency_weight: f64,
    pub metadata_weight: f64,

    /// Results scoring below this are dropped after ranking.
    pub minimum_relevance_score: f64,
}

impl Default for SearchOptions {
    fn default() -> Self {
        SearchOptions {
            limit: 50,
            offset: 0,
            app_filter: None,
            recency_weight: 0.2,
            metadata_weight: 0.1,
            minimum_relevance_score: 0.0,
        }
    }
}

/// A parsed query: match terms plus filters.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ParsedQuery {
    pub terms: Vec<String>,
    pub phrases: Vec<String>,
    pub excluded: Vec<String>,
    pub excluded_phrases: Vec<String>,
    pub app_filter: Option<String>,
    pub after: Option<Time>,
    pub before: Option<Time>,
}

impl ParsedQuery {
    /// Parses the query grammar. Fails on an empty query or one with no
    /// positive match terms.
    pub fn parse(query: &str) -> Result<ParsedQuery, Error> {
        if query.trim().is_empty() {
            bail!(InvalidArgument, msg("empty search query"));
        }
        let mut q = ParsedQuery::default();
        let mut rest = query.trim();
        while !rest.is_empty() {
            let (token, negated, remainder) = next_token(rest);
            rest = remainder.trim_start();
            let Some(token) = token else { continue };
            match token {
                Token::Phrase(p) => {
                    if negated {
                        q.excluded_phrases.push(p);
                    } else {
                        q.phrases.push(p);
                    }
                }
                Token::Bare(word) => {
                    if let Some(v) = word.strip_prefix("app:") {
                        if !v.is_empty() {
                            q.app_filter = Some(v.to_owned());
                        }
                    } else if let Some(v) = word.strip_prefix("after:") {
                        q.after = Some(parse_date(v)?);
                    } else if let Some(v) = word.strip_prefix("before:") {
                        q.before = Some(parse_date(v)?);
                    } else if negated {
                        q.excluded.push(word);
                    } else {
                        q.terms.push(word);
                    }
                }
            }
        }
        if q.terms.is_empty() && q.phrases.is_empty() {
            bail!(
                InvalidArgument,
                msg("query {query:?} has no search terms, only filters/exclusions")
            );
        }
        Ok(q)
    }

    /// Builds the FTS5 match string: `term* … "phrase" … NOT excluded …`.
    pub fn fts_string(&self) -> String {
        let mut out = String::new();
        for t in &self.terms {
            if !out.is_empty() {
                out.push(' ');
            }
            out.push_str(t);
            out.push('*');
        }
        for p in &self.phrases {
            if !out.is_empty() {
                out.push(' ');
            }
            out.push('"');
            out.push_str(p);
            out.push('"');
        }
        for t in &self.excluded {
            out.push_str(" NOT ");
            out.push_str(t);
        }
        for p in &self.excluded_phrases {
            out.push_str(" NOT \"");
            out.push_str(p);
            out.push('"');
        }
        out
    }

    /// The positive terms considered for the metadata boost (phrases
    /// included; filters and exclusions are not).
    fn boost_terms(&self) -> impl Iterator<Item = &str> {
        self.terms
            .iter()
            .map(String::as_str)
            .chain(self.phrases.iter().map(String::as_str))
    }
}

enum Token {
    Bare(String),
    Phrase(String),
}

/// Pulls the next token off `input`, honoring `-` negation and quoted
/// spans. Double quotes are delimiters only; they can't appear inside a
/// token.
fn next_token(input: &str) -> (Option<Token>, bool, &str) {
    let (negated, input) = match input.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, input),
    };
    if let Some(rest) = input.strip_prefix('"') {
        let (phrase, remainder) = match rest.find('"') {
            Some(end) => (&rest[..end], &rest[end + 1..]),
            None => (rest, ""), // unterminated quote: take the rest.
        };
        let phrase = phrase.trim();
        let token = (!phrase.is_empty()).then(|| Token::Phrase(phrase.to_owned()));
        return (token, negated, remainder);
    }
    let end = input.find(char::is_whitespace).unwrap_or(input.len());
    let (word, remainder) = input.split_at(end);
    let word = word.trim_matches('"');
    let token = (!word.is_empty()).then(|| Token::Bare(word.to_owned()));
    (token, negated, remainder)
}

fn parse_date(s: &str) -> Result<Time, Error> {
    let date: jiff::civil::Date = s
        .parse()
        .map_err(|e| err!(InvalidArgument, msg("bad date {s:?}; expected YYYY-MM-DD"), source(e)))?;
    let zoned = date
        .to_zoned(jiff::tz::TimeZone::UTC)
        .map_err(|e| err!(InvalidArgument, msg("date {s:?} out of range"), source(e)))?;
    Ok(Time(zoned.timestamp().as_millisecond()))
}

/// Metadata echoed on each result for display and cross-linking.
#[derive(Clone, Debug, Default)]
pub struct ResultMetadata {
    pub app_bundle_id: Option<String>,
    pub app_name: Option<String>,
    pub window_name: Option<String>,
    pub browser_url: Option<String>,
}

#[derive(Clone, Debug)]
pub struct SearchResult {
    pub frame_id: i64,
    pub timestamp: Time,
    pub snippet: String,
    pub matched_text: String,
    pub relevance_score: f64,
    pub metadata: ResultMetadata,
    pub segment_id: i64,
    pub video_id: Option<i64>,
    pub frame_index: i32,
}

#[derive(Clone, Debug, Default)]
pub struct SearchResults {
    pub query: String,
    pub results: Vec<SearchResult>,
    pub total_count: usize,
    pub search_time_ms: u64,
}

/// BM25 rank (negative is better in FTS5) normalized into [0, 1).
fn normalize_bm25(rank: f64) -> f64 {
    -rank / (1.0 + rank.abs())
}

/// Linear decay from 1 at age zero to 0 at the horizon.
fn recency_boost(age_days: f64) -> f64 {
    (1.0 - age_days / RECENCY_HORIZON_DAYS).max(0.0)
}

/// Per-term hits against window title, app name, and browser URL; clamped
/// to 1.
fn metadata_boost<'a>(
    terms: impl Iterator<Item = &'a str>,
    metadata: &ResultMetadata,
) -> f64 {
    let mut boost = 0.0;
    let window = metadata.window_name.as_deref().map(str::to_lowercase);
    let app = metadata.app_name.as_deref().map(str::to_lowercase);
    let url = metadata.browser_url.as_deref().map(str::to_lowercase);
    for term in terms {
        let term = term.to_lowercase();
        if window.as_deref().is_some_and(|w| w.contains(&term)) {
            boost += WINDOW_TITLE_HIT;
        }
        if app.as_deref().is_some_and(|a| a.contains(&term)) {
            boost += APP_NAME_HIT;
        }
        if url.as_deref().is_some_and(|u| u.contains(&term)) {
            boost += BROWSER_URL_HIT;
        }
    }
    boost.min(1.0)
}

fn composite_score(
    bm25_normalized: f64,
    age_days: f64,
    metadata: f64,
    opts: &SearchOptions,
) -> f64 {
    bm25_normalized + opts.recency_weight * recency_boost(age_days) + opts.metadata_weight * metadata
}

/// A human-facing app name derived from a bundle id
/// (`com.example.editor` → `editor`); the index doesn't store names.
fn app_name_from_bundle(bundle_id: &str) -> String {
    bundle_id.rsplit('.').next().unwrap_or(bundle_id).to_owned()
}

/// Runs the full search pipeline; `now` anchors the recency boost.
pub fn search(
    l: &LockedDatabase,
    now: Time,
    query: &str,
    opts: &SearchOptions,
) -> Result<SearchResults, Error> {
    let started = std::time::Instant::now();
    let parsed = ParsedQuery::parse(query)?;
    let fts = parsed.fts_string();

    let mut conditions = String::new();
    let mut filter_params: Vec<Value> = Vec::new();
    let app = parsed.app_filter.clone().or_else(|| opts.app_filter.clone());
    if let Some(app) = app {
        conditions.push_str(" and seg.bundleID = ?");
        filter_params.push(Value::Text(app));
    }
    if let Some(after) = parsed.after {
        conditions.push_str(" and f.createdAt >= ?");
        filter_params.push(Value::Integer(after.0));
    }
    if let Some(before) = parsed.before {
        conditions.push_str(" and f.createdAt < ?");
        filter_params.push(Value::Integer(before.0));
    }

    let base_sql = format!(
        r#"
        from searchRanking
        join doc_segment d on d.docid = searchRanking.rowid
        join frame f on f.id = d.frameId
        join segment seg on seg.id = d.segmentId
        where searchRanking match ?{conditions}
        "#
    );
    let mut all_params: Vec<Value> = Vec::with_capacity(filter_params.len() + 1);
    all_params.push(Value::Text(fts));
    all_params.extend(filter_params);

    let total_count: i64 = {
        let sql = format!("select count(*) {base_sql}");
        match l
            .conn
            .query_row(&sql, params_from_iter(all_params.iter()), |row| row.get(0))
        {
            Ok(n) => n,
            Err(e) => {
                let e: Error = e.into();
                if is_missing_schema(&e) {
                    return Ok(SearchResults {
                        query: query.to_owned(),
                        ..Default::default()
                    });
                }
                return Err(err!(e, msg("search count failed")));
            }
        }
    };

    struct RawRow {
        frame_id: i64,
        segment_id: i64,
        rank: f64,
        snippet: String,
        matched_text: String,
    }
    let raw: Vec<RawRow> = {
        let sql = format!(
            r#"
            select
              f.id,
              seg.id,
              rank,
              snippet(searchRanking, 0, '[', ']', '…', 8),
              snippet(searchRanking, 0, '', '', '…', 8)
            {base_sql}
            order by rank
            limit ? offset ?
            "#
        );
        let mut stmt = l.conn.prepare(&sql)?;
        let mut page_params = all_params;
        page_params.push(Value::Integer(opts.limit as i64));
        page_params.push(Value::Integer(opts.offset as i64));
        let rows = stmt.query_map(params_from_iter(page_params.iter()), |row| {
            Ok(RawRow {
                frame_id: row.get(0)?,
                segment_id: row.get(1)?,
                rank: row.get(2)?,
                snippet: row.get(3)?,
                matched_text: row.get(4)?,
            })
        })?;
        rows.collect::<Result<Vec<_>, _>>()?
    };

    let mut results = Vec::with_capacity(raw.len());
    for row in raw {
        // The frame row recovers the video cross-link and timestamp.
        let Some(frame) = l.get_frame(row.frame_id)? else {
            continue;
        };
        let segment = l.get_segment(row.segment_id)?;
        let metadata = match &segment {
            Some(s) => ResultMetadata {
                app_name: s.bundle_id.as_deref().map(app_name_from_bundle),
                app_bundle_id: s.bundle_id.clone(),
                window_name: s.window_name.clone(),
                browser_url: s.browser_url.clone(),
            },
            None => ResultMetadata::default(),
        };
        let age_days = ((now - frame.created_at).0 as f64 / 86_400_000.0).max(0.0);
        let score = composite_score(
            normalize_bm25(row.rank),
            age_days,
            metadata_boost(parsed.boost_terms(), &metadata),
            opts,
        );
        results.push(SearchResult {
            frame_id: frame.id,
            timestamp: frame.created_at,
            snippet: row.snippet,
            matched_text: row.matched_text,
            relevance_score: score,
            metadata,
            segment_id: row.segment_id,
            video_id: frame.video_id,
            frame_index: frame.video_frame_index,
        });
    }
    // Stable on ties: equal scores keep their BM25 order.
    results.sort_by(|a, b| {
        b.relevance_score
            .partial_cmp(&a.relevance_score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    results.retain(|r| r.relevance_score >= opts.minimum_relevance_score);

    Ok(SearchResults {
        query: query.to_owned(),
        results,
        total_count: total_count as usize,
        search_time_ms: started.elapsed().as_millis() as u64,
    })
}

/// Prefix suggestions: tokens from matching documents which start with
/// `prefix`, normalized, de-duplicated, sorted.
pub fn suggestions(l: &LockedDatabase, prefix: &str, limit: usize) -> Result<Vec<String>, Error> {
    let prefix = prefix.trim().to_lowercase();
    if prefix.is_empty() {
        bail!(InvalidArgument, msg("empty suggestion prefix"));
    }
    let fts = format!("{prefix}*");
    let snippets: Vec<String> = {
        let mut stmt = match l.conn.prepare_cached(
            "select snippet(searchRanking, 0, '', '', '', 10) from searchRanking \
             where searchRanking match ? limit 64",
        ) {
            Ok(stmt) => stmt,
            Err(e) => {
                let e: Error = e.into();
                if is_missing_schema(&e) {
                    return Ok(Vec::new());
                }
                return Err(e);
            }
        };
        let rows = stmt
            .query_map(params![fts], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        rows
    };
    let mut seen = BTreeSet::new();
    for snippet in snippets {
        for raw in snippet.split_whitespace() {
            let token: String = raw
                .chars()
                .filter(|c| c.is_alphanumeric())
                .collect::<String>()
                .to_lowercase();
            if token.starts_with(&prefix) {
                seen.insert(token);
            }
        }
    }
    Ok(seen.into_iter().take(limit).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::SegmentKey;
    use crate::testutil::{self, TestDb};
    use base::clock::Clocks;

    /// Spec'd example: `"syntax error" swift -java app:Xcode after:2025-01-01`.
    #[test]
    fn grammar() {
        let q = ParsedQuery::parse(r#""syntax error" swift -java app:Xcode after:2025-01-01"#)
            .unwrap();
        assert_eq!(q.terms, vec!["swift"]);
        assert_eq!(q.phrases, vec!["syntax error"]);
        assert_eq!(q.excluded, vec!["java"]);
        assert_eq!(q.app_filter.as_deref(), Some("Xcode"));
        assert_eq!(q.after, Some(Time(1_735_689_600_000))); // 2025-01-01T00:00:00Z
        assert_eq!(q.before, None);
        assert_eq!(q.fts_string(), r#"swift* "syntax error" NOT java"#);
    }

    #[test]
    fn grammar_rejects() {
        ParsedQuery::parse("").unwrap_err();
        ParsedQuery::parse("   ").unwrap_err();
        ParsedQuery::parse("-java").unwrap_err();
        ParsedQuery::parse("app:Xcode").unwrap_err();
        ParsedQuery::parse("after:notadate foo").unwrap_err();
    }

    #[test]
    fn grammar_edge_tokens() {
        let q = ParsedQuery::parse(r#"-"big phrase" foo"#).unwrap();
        assert_eq!(q.excluded_phrases, vec!["big phrase"]);
        assert_eq!(q.fts_string(), r#"foo* NOT "big phrase""#);

        // Unterminated quote takes the rest of the input.
        let q = ParsedQuery::parse(r#"foo "bar baz"#).unwrap();
        assert_eq!(q.phrases, vec!["bar baz"]);
    }

    /// Spec'd example: BM25-normalized 0.50, age 15 days, two window-title
    /// hits plus one URL hit ⇒ 0.70.
    #[test]
    fn ranking_composition() {
        let opts = SearchOptions::default();
        assert_eq!(normalize_bm25(-1.0), 0.5);
        let metadata = ResultMetadata {
            app_bundle_id: Some("com.apple.dt.Xcode".to_owned()),
            app_name: Some("Xcode".to_owned()),
            window_name: Some("retry logic in retry.rs".to_owned()),
            browser_url: Some("https://example.com/retry".to_owned()),
        };
        let terms = ["retry", "logic"];
        // "retry" hits window + url; "logic" hits window: 0.3+0.5+0.3 = 1.1 → 1.0.
        let boost = metadata_boost(terms.iter().copied(), &metadata);
        assert_eq!(boost, 1.0);
        let score = composite_score(0.5, 15.0, boost, &opts);
        assert!((score - 0.70).abs() < 1e-9, "got {score}");
    }

    #[test]
    fn recency_clamps() {
        assert_eq!(recency_boost(0.0), 1.0);
        assert_eq!(recency_boost(15.0), 0.5);
        assert_eq!(recency_boost(45.0), 0.0);
    }

    fn index_frame(
        tdb: &TestDb,
        key: &SegmentKey,
        url: Option<&str>,
        t: Time,
        text: &str,
        title: Option<&str>,
    ) -> i64 {
        let mut l = tdb.db.lock();
        let frame_id = l.insert_frame(key, url, t, None, 0, 0, true).unwrap();
        let seg = l.get_frame(frame_id).unwrap().unwrap().segment_id;
        l.index_frame_text(text, None, title, seg, frame_id).unwrap();
        frame_id
    }

    #[test]
    fn end_to_end_search() {
        testutil::init();
        let tdb = TestDb::new();
        let now = tdb.db.clocks().realtime();
        let editor = SegmentKey {
            bundle_id: Some("com.example.editor".to_owned()),
            window_name: Some("compile errors".to_owned()),
        };
        let browser = SegmentKey {
            bundle_id: Some("com.example.browser".to_owned()),
            window_name: Some("cat pictures".to_owned()),
        };
        let f1 = index_frame(
            &tdb,
            &editor,
            None,
            now - base::time::Duration::from_secs(60),
            "syntax error expected semicolon",
            Some("compile errors"),
        );
        index_frame(
            &tdb,
            &browser,
            Some("https://cats.example.com"),
            now - base::time::Duration::from_secs(120),
            "cats and more cats",
            Some("cat pictures"),
        );

        let l = tdb.db.lock();
        let r = search(&l, now, "syntax", &SearchOptions::default()).unwrap();
        assert_eq!(r.total_count, 1);
        assert_eq!(r.results.len(), 1);
        let hit = &r.results[0];
        assert_eq!(hit.frame_id, f1);
        assert_eq!(hit.metadata.app_bundle_id.as_deref(), Some("com.example.editor"));
        assert_eq!(hit.metadata.app_name.as_deref(), Some("editor"));
        assert!(hit.matched_text.contains("syntax"));
        assert!(hit.relevance_score > 0.0);

        // Exclusion drops the match.
        let r = search(&l, now, "cats -more", &SearchOptions::default()).unwrap();
        assert_eq!(r.total_count, 0);

        // App filter.
        let r = search(&l, now, "cats app:com.example.browser", &SearchOptions::default()).unwrap();
        assert_eq!(r.total_count, 1);
        let r = search(&l, now, "cats app:com.example.editor", &SearchOptions::default()).unwrap();
        assert_eq!(r.total_count, 0);

        // Invalid query is rejected before touching SQLite.
        search(&l, now, "", &SearchOptions::default()).unwrap_err();
    }

    #[test]
    fn date_filters() {
        testutil::init();
        let tdb = TestDb::new();
        let key = SegmentKey::default();
        // 2024-12-31T12:00:00Z and 2025-01-02T12:00:00Z.
        index_frame(&tdb, &key, None, Time(1_735_646_400_000), "holiday plans", None);
        index_frame(&tdb, &key, None, Time(1_735_819_200_000), "holiday photos", None);
        let l = tdb.db.lock();
        let now = Time(1_735_900_000_000);
        let r = search(&l, now, "holiday after:2025-01-01", &SearchOptions::default()).unwrap();
        assert_eq!(r.total_count, 1);
        assert!(r.results[0].matched_text.contains("photos"));
        let r = search(&l, now, "holiday before:2025-01-01", &SearchOptions::default()).unwrap();
        assert_eq!(r.total_count, 1);
        assert!(r.results[0].matched_text.contains("plans"));
    }

    #[test]
    fn suggestion_tokens() {
        testutil::init();
        let tdb = TestDb::new();
        let key = SegmentKey::default();
        index_frame(&tdb, &key, None, Time(1_000), "Syntax synthesis synchronized, (sync)", None);
        index_frame(&tdb, &key, None, Time(2_000), "syntax again", None);
        let l = tdb.db.lock();
        let s = suggestions(&l, "syn", 10).unwrap();
        assert_eq!(s, vec!["sync", "synchronized", "syntax", "synthesis"]);
        let s = suggestions(&l, "syn", 2).unwrap();
        assert_eq!(s.len(), 2);
        suggestions(&l, "  ", 10).unwrap_err();
    }
}
