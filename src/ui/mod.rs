use colored::*;
use serde::Serialize;
use std::io::{self, Write};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Info,
    Success,
    Warn,
    Error,
    Debug,
}

impl Level {
    fn as_str(self) -> &'static str {
        match self {
            Level::Info => "info",
            Level::Success => "success",
            Level::Warn => "warn",
            Level::Error => "error",
            Level::Debug => "debug",
        }
    }
}

/// Receiver for pipeline events.
///
/// Every component takes a `&dyn EventSink` instead of printing, so the caller
/// decides where progress goes (terminal, JSON lines, or a test recorder).
pub trait EventSink {
    fn emit(&self, level: Level, code: &str, message: &str, data: Option<serde_json::Value>);
}

/// Renders events to stdout/stderr as colored text or JSON lines.
#[derive(Debug, Clone)]
pub struct ConsoleSink {
    pub format: OutputFormat,
    pub color: bool,
    pub debug: bool,
}

impl Default for ConsoleSink {
    fn default() -> Self {
        Self {
            format: OutputFormat::Text,
            color: true,
            debug: false,
        }
    }
}

#[derive(Serialize)]
struct Event<'a> {
    level: &'a str,
    code: &'a str,
    message: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<serde_json::Value>,
}

fn colorize(level: Level, s: &str, enable: bool) -> String {
    if !enable {
        return s.to_string();
    }
    match level {
        Level::Info => s.normal().to_string(),
        Level::Success => s.green().bold().to_string(),
        Level::Warn => s.yellow().bold().to_string(),
        Level::Error => s.red().bold().to_string(),
        Level::Debug => s.cyan().to_string(),
    }
}

fn strip_ansi(input: &str) -> String {
    // Remove CSI sequences like \x1b[0m and \x1b[1;32m
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == 0x1b && i + 1 < bytes.len() && bytes[i + 1] == b'[' {
            i += 2;
            while i < bytes.len() {
                let b = bytes[i];
                i += 1;
                if (b'@'..=b'~').contains(&b) {
                    break;
                }
            }
            continue;
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

impl ConsoleSink {
    pub fn new(format: OutputFormat, color: bool, debug: bool) -> Self {
        Self {
            format,
            color,
            debug,
        }
    }

    pub fn is_json(&self) -> bool {
        matches!(self.format, OutputFormat::Json)
    }

    /// Render a single event line, or `None` when the event is filtered out.
    pub fn render(
        &self,
        level: Level,
        code: &str,
        message: &str,
        data: Option<serde_json::Value>,
    ) -> Option<String> {
        if level == Level::Debug && !self.debug {
            return None;
        }
        match self.format {
            OutputFormat::Text => Some(colorize(level, message, self.color)),
            OutputFormat::Json => {
                let clean_msg = strip_ansi(message);
                let ev = Event {
                    level: level.as_str(),
                    code,
                    message: &clean_msg,
                    data,
                };
                serde_json::to_string(&ev).ok()
            }
        }
    }
}

impl EventSink for ConsoleSink {
    fn emit(&self, level: Level, code: &str, message: &str, data: Option<serde_json::Value>) {
        let Some(line) = self.render(level, code, message, data) else {
            return;
        };
        let mut out: Box<dyn Write> = match level {
            Level::Error | Level::Warn => Box::new(io::stderr()),
            _ => Box::new(io::stdout()),
        };
        let _ = writeln!(out, "{}", line);
    }
}

pub mod prelude {
    pub use super::{ConsoleSink, EventSink, Level};
}
