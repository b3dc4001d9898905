use std::fmt;
use std::io::IsTerminal;
use tracing::{Event, Subscriber};
use tracing_subscriber::fmt::{format::Writer, FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::registry::LookupSpan;

/// ANSI color codes for console output
const COLOR_RESET: &str = "\x1b[0m";
const COLOR_CYAN: &str = "\x1b[36m";
const COLOR_GREEN: &str = "\x1b[32m";
const COLOR_BRIGHT_YELLOW: &str = "\x1b[93m";
const COLOR_BRIGHT_RED: &str = "\x1b[91m";
const COLOR_BRIGHT_GRAY: &str = "\x1b[90m";

/// Column widths
const COMPONENT_WIDTH: usize = 20;
const LOG_LEVEL_WIDTH: usize = 7;

/// Prefix shared by the library crate targets
const CRATE_PREFIX: &str = "fieldnet_";

/// Event formatter printing `[timestamp] [component] [level] message`
pub struct FieldnetLogFormatter {
    service_name: String,
    color_enabled: bool,
}

/// Log with an explicit component column
#[macro_export]
macro_rules! component_info {
    ($component:expr, $($arg:tt)*) => {
        tracing::info!(component = $component, $($arg)*)
    };
}

#[macro_export]
macro_rules! component_warn {
    ($component:expr, $($arg:tt)*) => {
        tracing::warn!(component = $component, $($arg)*)
    };
}

impl FieldnetLogFormatter {
    pub fn new(service_name: String) -> Self {
        let color_enabled = is_terminal();
        Self {
            service_name,
            color_enabled,
        }
    }

    /// Component column: explicit `component` field, else the library crate
    /// the event came from, else the service name
    fn format_component(&self, component: Option<&str>, target: &str) -> String {
        let name = match component {
            Some(comp) => format!("{}-{}", self.service_name, comp),
            None => match target.strip_prefix(CRATE_PREFIX) {
                Some(rest) => {
                    let krate = rest.split("::").next().unwrap_or(rest);
                    format!("{}-{}", self.service_name, krate)
                }
                None => self.service_name.clone(),
            },
        };

        if name.chars().count() > COMPONENT_WIDTH {
            let truncated: String = name.chars().take(COMPONENT_WIDTH - 1).collect();
            format!("{}…", truncated)
        } else {
            format!("{:<width$}", name, width = COMPONENT_WIDTH)
        }
    }

    fn format_log_level(&self, level: &tracing::Level) -> String {
        let level_str = match *level {
            tracing::Level::ERROR => "✗ ERROR",
            tracing::Level::WARN => "⚠ WARN",
            tracing::Level::INFO => "ℹ INFO",
            tracing::Level::DEBUG => "◦ DEBUG",
            tracing::Level::TRACE => "◦ TRACE",
        };

        format!("{:<width$}", level_str, width = LOG_LEVEL_WIDTH + 2) // +2 for icon
    }

    fn color_for_level(&self, level: &tracing::Level) -> &'static str {
        if !self.color_enabled {
            return "";
        }

        match *level {
            tracing::Level::ERROR => COLOR_BRIGHT_RED,
            tracing::Level::WARN => COLOR_BRIGHT_YELLOW,
            tracing::Level::INFO => COLOR_GREEN,
            tracing::Level::DEBUG => COLOR_BRIGHT_GRAY,
            tracing::Level::TRACE => COLOR_BRIGHT_GRAY,
        }
    }
}

impl<S, N> FormatEvent<S, N> for FieldnetLogFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        _ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let now = chrono::Local::now();
        let timestamp = now.format("%Y-%m-%d %H:%M:%S%.3f").to_string();

        let metadata = event.metadata();
        let level = metadata.level();

        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);

        let component = self.format_component(visitor.component.as_deref(), metadata.target());
        let formatted_level = self.format_log_level(level);

        let color = self.color_for_level(level);
        let reset_color = if self.color_enabled { COLOR_RESET } else { "" };
        let cyan_color = if self.color_enabled { COLOR_CYAN } else { "" };

        write!(
            writer,
            "{}[{}] [{}] [{}{}{}] ",
            cyan_color, timestamp, component, color, formatted_level, reset_color
        )?;
        writeln!(writer, "{}{}", visitor.message, reset_color)
    }
}

/// Extracts the message and component fields of an event
#[derive(Default)]
struct FieldVisitor {
    message: String,
    component: Option<String>,
}

impl tracing::field::Visit for FieldVisitor {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn fmt::Debug) {
        match field.name() {
            "message" => self.message = unquote(format!("{:?}", value)),
            "component" => self.component = Some(unquote(format!("{:?}", value))),
            _ => {}
        }
    }

    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        match field.name() {
            "message" => self.message = value.to_string(),
            "component" => self.component = Some(value.to_string()),
            _ => {}
        }
    }
}

fn unquote(value: String) -> String {
    match value.strip_prefix('"').and_then(|v| v.strip_suffix('"')) {
        Some(inner) => inner.to_string(),
        None => value,
    }
}

fn is_terminal() -> bool {
    if std::env::var("TERM").unwrap_or_default() == "dumb" {
        return false;
    }
    std::io::stdout().is_terminal()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plain() -> FieldnetLogFormatter {
        FieldnetLogFormatter {
            service_name: "fieldnet".to_string(),
            color_enabled: false,
        }
    }

    #[test]
    fn test_component_column() {
        let formatter = plain();
        assert_eq!(
            formatter.format_component(None, "fieldnet_routing::inbound").trim_end(),
            "fieldnet-routing"
        );
        assert_eq!(
            formatter.format_component(Some("app"), "fieldnet").trim_end(),
            "fieldnet-app"
        );
        assert_eq!(
            formatter.format_component(None, "fieldnet").trim_end(),
            "fieldnet"
        );
        assert_eq!(
            formatter
                .format_component(Some("a-rather-long-component"), "fieldnet")
                .chars()
                .count(),
            COMPONENT_WIDTH
        );
    }

    #[test]
    fn test_unquote() {
        assert_eq!(unquote("\"hello\"".to_string()), "hello");
        assert_eq!(unquote("42".to_string()), "42");
    }
}
