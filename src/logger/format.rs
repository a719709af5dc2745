//! Log formatting and output
//!
//! Console lines are colorized per tag and level; file lines carry the same
//! content as plain text with a full timestamp.

use super::config::is_console_enabled;
use super::file::write_to_file;
use super::levels::LogLevel;
use super::tags::LogTag;
use chrono::Local;
use colored::*;
use std::io::{stderr, stdout, Write};

/// Log format widths for alignment
const TAG_WIDTH: usize = 9;
const LEVEL_WIDTH: usize = 7;

pub fn format_and_log(tag: LogTag, level: LogLevel, message: &str) {
    let now = Local::now();

    if is_console_enabled() {
        let line = format!(
            "{} [{}] [{}] {}",
            now.format("%H:%M:%S").to_string().dimmed(),
            format_tag(&tag),
            format_level(level),
            format_message(level, message)
        );
        print_safe(level, &line);
    }

    write_to_file(&format!(
        "{} [{}] [{}] {}",
        now.format("%Y-%m-%d %H:%M:%S%.3f"),
        tag.to_plain_string(),
        level.as_str(),
        message
    ));
}

fn format_tag(tag: &LogTag) -> ColoredString {
    let label = format!("{:<width$}", tag.to_plain_string(), width = TAG_WIDTH);
    match tag {
        LogTag::System => label.bright_yellow().bold(),
        LogTag::HeadTracker => label.bright_cyan().bold(),
        LogTag::Broadcaster => label.bright_green().bold(),
        LogTag::Confirmer => label.bright_magenta().bold(),
        LogTag::Jobs => label.bright_blue().bold(),
        LogTag::Store => label.bright_white().bold(),
        LogTag::Config => label.white().bold(),
    }
}

fn format_level(level: LogLevel) -> ColoredString {
    let label = format!("{:<width$}", level.as_str(), width = LEVEL_WIDTH);
    match level {
        LogLevel::Error => label.bright_red().bold(),
        LogLevel::Warning => label.bright_yellow().bold(),
        LogLevel::Info => label.white().bold(),
        LogLevel::Debug => label.cyan(),
        LogLevel::Verbose => label.dimmed(),
    }
}

fn format_message(level: LogLevel, message: &str) -> ColoredString {
    match level {
        LogLevel::Error => message.red(),
        LogLevel::Warning => message.yellow(),
        LogLevel::Verbose => message.dimmed(),
        _ => message.normal(),
    }
}

/// Errors and warnings go to stderr; write failures (closed pipes) are ignored
fn print_safe(level: LogLevel, line: &str) {
    if level <= LogLevel::Warning {
        let mut err = stderr();
        let _ = writeln!(err, "{}", line);
        let _ = err.flush();
    } else {
        let mut out = stdout();
        let _ = writeln!(out, "{}", line);
        let _ = out.flush();
    }
}
