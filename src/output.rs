//! Node output handling.
//!
//! Lines captured from node processes are recoloured by their rosconsole level
//! tag before they are written to the node's terminal. Lines without a level
//! tag are passed through untouched.

use std::sync::OnceLock;

use regex::Regex;
use strip_ansi_escapes::strip;

/// Indicates the source stream of a log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    /// Standard Output.
    Stdout,
    /// Standard Error.
    Stderr,
}

/// Environment set on captured nodes so their output arrives line by line.
pub const CAPTURE_ENV: &[(&str, &str)] = &[
    ("PYTHONUNBUFFERED", "1"),
    ("ROSCONSOLE_STDOUT_LINE_BUFFERED", "1"),
];

/// Severity tag found at the start of a rosconsole line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
}

impl LogLevel {
    fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "DEBUG" => Some(LogLevel::Debug),
            "INFO" => Some(LogLevel::Info),
            "WARN" | "WARNING" => Some(LogLevel::Warn),
            "ERROR" => Some(LogLevel::Error),
            "FATAL" => Some(LogLevel::Fatal),
            _ => None,
        }
    }

    /// SGR sequence used for this level.
    pub fn color(self) -> &'static str {
        match self {
            LogLevel::Debug => "\x1b[32m",
            LogLevel::Info => "\x1b[37m",
            LogLevel::Warn => "\x1b[33m",
            LogLevel::Error => "\x1b[31m",
            LogLevel::Fatal => "\x1b[35m",
        }
    }
}

const RESET: &str = "\x1b[0m";

fn level_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^\[\s*(DEBUG|INFO|WARN|WARNING|ERROR|FATAL)\s*\]")
            .expect("level regex is valid")
    })
}

/// Removes ANSI escape codes. Invalid UTF-8 sequences are replaced.
pub fn sanitize_text(text: &str) -> String {
    let stripped = strip(text.as_bytes());
    String::from_utf8_lossy(&stripped).to_string()
}

/// Returns the level tag at the start of `line`, ignoring existing colours.
pub fn detect_level(line: &str) -> Option<LogLevel> {
    let plain = sanitize_text(line);
    let caps = level_regex().captures(&plain)?;
    LogLevel::from_tag(&caps[1])
}

/// Recolours a line by its level tag; untagged lines are returned unchanged.
pub fn colorize(line: &str) -> String {
    let plain = sanitize_text(line);
    let level = level_regex()
        .captures(&plain)
        .and_then(|caps| LogLevel::from_tag(&caps[1]));
    match level {
        Some(level) => format!("{}{}{}", level.color(), plain, RESET),
        None => line.to_string(),
    }
}
