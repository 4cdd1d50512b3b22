use std::fmt;

use ansi_term::Colour;
use tracing::level_filters::LevelFilter;
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::format::{self, FormatEvent, FormatFields};
use tracing_subscriber::fmt::FmtContext;
use tracing_subscriber::registry::LookupSpan;

use crate::config::XrcTransportConfig;

const LOG_ENV: &str = "XRC_LOG";

struct FmtLevel<'a> {
    level: &'a Level,
    ansi: bool,
}

impl<'a> FmtLevel<'a> {
    fn new(level: &'a Level, ansi: bool) -> Self {
        Self { level, ansi }
    }
}

const TRACE_STR: &str = "TRACE";
const DEBUG_STR: &str = "DEBUG";
const INFO_STR: &str = " INFO";
const WARN_STR: &str = " WARN";
const ERROR_STR: &str = "ERROR";

impl<'a> fmt::Display for FmtLevel<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.ansi {
            match *self.level {
                Level::TRACE => write!(f, "{}", Colour::Purple.paint(TRACE_STR)),
                Level::DEBUG => write!(f, "{}", Colour::Blue.paint(DEBUG_STR)),
                Level::INFO => write!(f, "{}", Colour::Green.paint(INFO_STR)),
                Level::WARN => write!(f, "{}", Colour::Yellow.paint(WARN_STR)),
                Level::ERROR => write!(f, "{}", Colour::Red.paint(ERROR_STR)),
            }
        } else {
            match *self.level {
                Level::TRACE => f.pad(TRACE_STR),
                Level::DEBUG => f.pad(DEBUG_STR),
                Level::INFO => f.pad(INFO_STR),
                Level::WARN => f.pad(WARN_STR),
                Level::ERROR => f.pad(ERROR_STR),
            }
        }
    }
}

struct XrcFormatter {
    ansi: bool,
}

impl<S, N> FormatEvent<S, N> for XrcFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: format::Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        use chrono::Utc;
        let metadata = event.metadata();
        let fmt_level = FmtLevel::new(metadata.level(), self.ansi && writer.has_ansi_escapes());

        write!(
            writer,
            "[{} {} {}:{}] ",
            Utc::now().format("%Y-%m-%d %H:%M:%S%.6f"),
            fmt_level,
            metadata.file().unwrap_or("<unnamed>"),
            metadata.line().unwrap_or(0),
        )?;

        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

fn env_filter(default_log_level: &str) -> EnvFilter {
    let directive = default_log_level.parse().unwrap_or_else(|_| {
        eprintln!("invalid default log level: {default_log_level}, using info");
        LevelFilter::INFO.into()
    });
    EnvFilter::builder()
        .with_default_directive(directive)
        .with_env_var(LOG_ENV)
        .from_env_lossy()
}

/// Installs the global subscriber. Returns false when one is already set,
/// which makes repeated calls from tests harmless.
pub fn init_log(config: &XrcTransportConfig, ansi: bool) -> bool {
    use tracing_subscriber::prelude::*;

    let log_fmt_layer = tracing_subscriber::fmt::layer()
        .event_format(XrcFormatter { ansi })
        .with_filter(env_filter(&config.log_level));

    match tracing_subscriber::registry().with(log_fmt_layer).try_init() {
        Ok(()) => {
            tracing::info!("tracing-log initialized");
            true
        }
        Err(_) => false,
    }
}
