// This file is part of Lookback, a continuous screen activity recorder.
// Copyright (C) 2025 The Lookback Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Logic for setting up a `tracing` subscriber according to our
//! preferences.
//!
//! `LOOKBACK_LOG` is an `EnvFilter` directive (default `info`).
//! `LOOKBACK_FORMAT` selects the output flavor:
//!
//! * default: one line per event with a microsecond UTC timestamp, level,
//!   thread, and span path.
//! * `journal`: the same line prefixed with an sd-daemon(3) priority byte
//!   and without the timestamp or level (the journal records both itself).
//!   `systemd` is accepted as an alias.
//! * `json`: machine-readable, one JSON object per line.
//!
//! A panic hook reports panics as `error!` events (with a captured
//! backtrace) so they land in the same sink as everything else; opt out
//! with `LOOKBACK_PANIC_HOOK=0`.

use tracing::error;
use tracing_core::{Level, Subscriber};
use tracing_log::NormalizeEvent;
use tracing_subscriber::{
    filter::LevelFilter,
    fmt::{format::Writer, FmtContext, FormatEvent, FormatFields, FormattedFields},
    layer::SubscriberExt,
    registry::LookupSpan,
    EnvFilter, Layer,
};

/// Output flavor, from `LOOKBACK_FORMAT`.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
enum Format {
    #[default]
    Human,
    Journal,
    Json,
}

impl Format {
    fn parse(value: Option<&str>) -> Self {
        match value {
            Some("journal") | Some("systemd") => Format::Journal,
            Some("json") => Format::Json,
            _ => Format::Human,
        }
    }

    fn from_env() -> Self {
        Self::parse(std::env::var("LOOKBACK_FORMAT").ok().as_deref())
    }
}

/// The sd-daemon(3) priority prefix for a level. Tracing has no notion of
/// "critical" or finer-than-debug, so the scale is truncated at both ends.
fn journal_priority(level: &Level) -> &'static str {
    const LEVELS: [(Level, &str); 5] = [
        (Level::ERROR, "<3>"),
        (Level::WARN, "<4>"),
        (Level::INFO, "<5>"),
        (Level::DEBUG, "<6>"),
        (Level::TRACE, "<7>"),
    ];
    LEVELS
        .iter()
        .find(|(l, _)| l == level)
        .map(|(_, p)| *p)
        .unwrap_or("<7>")
}

/// Event formatter shared by the human and journal flavors; only the line
/// prefix differs.
struct EventFormat {
    /// Emit an sd-daemon priority and skip the timestamp and level text.
    journal: bool,
}

impl EventFormat {
    fn write_prefix(&self, writer: &mut Writer<'_>, level: &Level) -> std::fmt::Result {
        if self.journal {
            return writer.write_str(journal_priority(level));
        }
        const TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6fZ";
        write!(
            writer,
            "{} {:>5} ",
            jiff::Timestamp::now().strftime(TIME_FORMAT),
            level
        )
    }

    /// The span path from root to leaf, dot-separated, with any span
    /// fields inline: `capture.ingest[video_id=3]`.
    fn write_scope<S, N>(writer: &mut Writer<'_>, ctx: &FmtContext<'_, S, N>) -> std::fmt::Result
    where
        S: Subscriber + for<'a> LookupSpan<'a>,
        N: for<'a> FormatFields<'a> + 'static,
    {
        let Some(scope) = ctx.event_scope() else {
            return Ok(());
        };
        let mut wrote_any = false;
        for span in scope.from_root() {
            if wrote_any {
                writer.write_char('.')?;
            }
            writer.write_str(span.name())?;
            let extensions = span.extensions();
            if let Some(fields) = extensions.get::<FormattedFields<N>>() {
                if !fields.is_empty() {
                    write!(writer, "[{fields}]")?;
                }
            }
            wrote_any = true;
        }
        if wrote_any {
            writer.write_char(' ')?;
        }
        Ok(())
    }
}

impl<S, N> FormatEvent<S, N> for EventFormat
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &tracing_core::Event<'_>,
    ) -> std::fmt::Result {
        // Events forwarded from the `log` crate carry their real metadata
        // in normalized form.
        let normalized = event.normalized_metadata();
        let meta = normalized.as_ref().unwrap_or_else(|| event.metadata());

        self.write_prefix(&mut writer, meta.level())?;
        let thread = std::thread::current();
        if let Some(name) = thread.name() {
            write!(writer, "{name} ")?;
        }
        Self::write_scope(&mut writer, ctx)?;
        write!(writer, "{}: ", meta.target())?;
        ctx.format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

fn env_filter() -> EnvFilter {
    EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .with_env_var("LOOKBACK_LOG")
        .from_env_lossy()
}

/// Reports a panic through the subscriber, so it carries a timestamp (or
/// journal priority) and a captured backtrace like any other error.
fn log_panic(info: &std::panic::PanicHookInfo) {
    let payload = info
        .payload()
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| info.payload().downcast_ref::<String>().map(String::as_str));
    let location = info.location().map(|l| l.to_string());
    error!(
        target: std::env!("CARGO_CRATE_NAME"),
        payload,
        location = location.as_deref(),
        backtrace = %std::backtrace::Backtrace::force_capture(),
        "panic",
    );
}

pub fn install() {
    tracing_log::LogTracer::init().expect("a global logger was already installed");
    let filter = env_filter();
    let registry = tracing_subscriber::registry();
    match Format::from_env() {
        Format::Json => {
            let layer = tracing_subscriber::fmt::Layer::new()
                .with_writer(std::io::stderr)
                .with_thread_names(true)
                .json()
                .with_filter(filter);
            tracing::subscriber::set_global_default(registry.with(layer)).unwrap();
        }
        Format::Journal => {
            let layer = tracing_subscriber::fmt::Layer::new()
                .with_writer(std::io::stderr)
                .with_ansi(false)
                .event_format(EventFormat { journal: true })
                .with_filter(filter);
            tracing::subscriber::set_global_default(registry.with(layer)).unwrap();
        }
        Format::Human => {
            let layer = tracing_subscriber::fmt::Layer::new()
                .with_writer(std::io::stderr)
                .event_format(EventFormat { journal: false })
                .with_filter(filter);
            tracing::subscriber::set_global_default(registry.with(layer)).unwrap();
        }
    }

    match std::env::var("LOOKBACK_PANIC_HOOK").as_deref() {
        Ok("0") | Ok("false") => {}
        _ => std::panic::set_hook(Box::new(log_panic)),
    }
}

pub fn install_for_tests() {
    tracing_log::LogTracer::init().expect("a global logger was already installed");
    let layer = tracing_subscriber::fmt::Layer::new()
        .with_test_writer()
        .event_format(EventFormat { journal: false })
        .with_filter(env_filter());
    tracing::subscriber::set_global_default(tracing_subscriber::registry().with(layer)).unwrap();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priorities_follow_sd_daemon() {
        assert_eq!(journal_priority(&Level::ERROR), "<3>");
        assert_eq!(journal_priority(&Level::WARN), "<4>");
        assert_eq!(journal_priority(&Level::INFO), "<5>");
        assert_eq!(journal_priority(&Level::DEBUG), "<6>");
        assert_eq!(journal_priority(&Level::TRACE), "<7>");
    }

    #[test]
    fn format_selection() {
        assert_eq!(Format::parse(Some("journal")), Format::Journal);
        assert_eq!(Format::parse(Some("systemd")), Format::Journal);
        assert_eq!(Format::parse(Some("json")), Format::Json);
        assert_eq!(Format::parse(Some("anything-else")), Format::Human);
        assert_eq!(Format::parse(None), Format::Human);
    }
}
