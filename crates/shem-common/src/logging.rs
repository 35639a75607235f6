//! ---
//! shem_section: "01-core-functionality"
//! shem_subsection: "module"
//! shem_type: "source"
//! shem_scope: "code"
//! shem_description: "Tracing setup emitting sd-daemon severity prefixes."
//! shem_version: "v0.1.0"
//! shem_owner: "tbd"
//! ---
use std::fmt;

use tracing::{Event, Level, Subscriber};
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;

const LOG_ENV: &str = "SHEM_LOG";

/// Initialize the tracing subscriber for the orchestrator.
///
/// The host supervisor is the log viewer, so events go to stderr with an
/// sd-daemon `<N>` priority prefix and no timestamp (the journal adds one).
/// `SHEM_LOG` overrides the filter; when unset the standard `RUST_LOG`
/// variable is honoured, finally defaulting to `info`.
pub fn init() {
    let filter = match std::env::var(LOG_ENV) {
        Ok(directive) => EnvFilter::try_new(&directive).unwrap_or_else(|err| {
            eprintln!("invalid {LOG_ENV} directive ({err}); defaulting to info logging");
            EnvFilter::new("info")
        }),
        Err(_) => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .event_format(SdFormat)
                .with_writer(std::io::stderr),
        )
        .try_init()
        .ok();
}

/// sd-daemon priority for a tracing level.
pub fn priority(level: Level) -> u8 {
    match level {
        Level::ERROR => 3,
        Level::WARN => 4,
        Level::INFO => 6,
        Level::DEBUG | Level::TRACE => 7,
    }
}

/// Split a leading sd-daemon `<N>` severity tag off a diagnostic line.
///
/// Returns the priority and the remainder when the line carries a tag in the
/// `0..=7` range, `None` otherwise.
pub fn split_severity(line: &str) -> Option<(u8, &str)> {
    let bytes = line.as_bytes();
    if bytes.len() >= 3 && bytes[0] == b'<' && bytes[1].is_ascii_digit() && bytes[2] == b'>' {
        let priority = bytes[1] - b'0';
        if priority <= 7 {
            return Some((priority, &line[3..]));
        }
    }
    None
}

/// Event format rendering `<N>[target] message fields`.
struct SdFormat;

impl<S, N> FormatEvent<S, N> for SdFormat
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let meta = event.metadata();
        write!(writer, "<{}>[{}] ", priority(*meta.level()), meta.target())?;
        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priorities_follow_sd_daemon_convention() {
        assert_eq!(priority(Level::ERROR), 3);
        assert_eq!(priority(Level::WARN), 4);
        assert_eq!(priority(Level::INFO), 6);
        assert_eq!(priority(Level::DEBUG), 7);
    }

    #[test]
    fn split_severity_accepts_tagged_lines() {
        assert_eq!(split_severity("<4>low battery"), Some((4, "low battery")));
        assert_eq!(split_severity("<0>emergency"), Some((0, "emergency")));
        assert_eq!(split_severity("<7>"), Some((7, "")));
    }

    #[test]
    fn split_severity_rejects_untagged_lines() {
        assert_eq!(split_severity("plain line"), None);
        assert_eq!(split_severity("<8>out of range"), None);
        assert_eq!(split_severity("<x>not a digit"), None);
        assert_eq!(split_severity("<1"), None);
        assert_eq!(split_severity(""), None);
    }
}
