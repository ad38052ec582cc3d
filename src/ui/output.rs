//! Status lines and stage listings
//!
//! Status lines go through `cliclack` on a terminal and fall back to
//! `[OK]`-style prefixes otherwise. Listings are plain text in both modes so
//! they stay greppable; only the table header is styled.

use super::context::UiContext;
use crate::stage::{ClientIdRecord, StageId};
use console::style;
use std::fmt::Write;

/// Outcome shown in front of a status line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    Warn,
    Info,
}

impl Status {
    fn tag(self) -> String {
        match self {
            Status::Ok => style("[OK]").green().to_string(),
            Status::Warn => style("[WARN]").yellow().to_string(),
            Status::Info => style("[INFO]").cyan().to_string(),
        }
    }
}

fn with_hint(message: &str, hint: Option<&str>) -> String {
    match hint {
        Some(hint) => format!("{} - {}", message, hint),
        None => message.to_string(),
    }
}

/// Print a status line, with an optional dimmed hint after the message
pub fn status(ctx: &UiContext, status: Status, message: &str, hint: Option<&str>) {
    if !ctx.use_fancy_output() {
        println!("  {} {}", status.tag(), with_hint(message, hint));
        return;
    }

    let hint = hint.map(|h| style(h).dim().to_string());
    let line = with_hint(message, hint.as_deref());
    match status {
        Status::Ok => cliclack::log::success(line).ok(),
        Status::Warn => cliclack::log::warning(line).ok(),
        Status::Info => cliclack::log::info(line).ok(),
    };
}

/// Render stage ids as a table, newest last, with a total line
pub fn render_stage_table(stages: &[StageId]) -> String {
    let mut sorted: Vec<&StageId> = stages.iter().collect();
    sorted.sort_by(|a, b| a.digest.cmp(&b.digest).then(a.unique_id.cmp(&b.unique_id)));

    let mut out = String::new();
    let _ = writeln!(out, "{:<64} {:<15} {:<20}", "DIGEST", "UNIQUE ID", "STORED");
    for stage in sorted {
        let stored = stage
            .unique_id_as_time()
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| "-".to_string());
        let _ = writeln!(out, "{:<64} {:<15} {:<20}", stage.digest, stage.unique_id, stored);
    }
    let _ = writeln!(out);
    let _ = writeln!(out, "Total: {} stage(s)", stages.len());
    out
}

/// Print a titled stage table
pub fn stage_table(ctx: &UiContext, title: &str, stages: &[StageId]) {
    if ctx.use_fancy_output() {
        cliclack::log::info(style(title).bold()).ok();
    } else {
        println!("{}", style(title).bold());
    }
    print!("{}", render_stage_table(stages));
}

/// Print client id records, oldest first
pub fn client_records(ctx: &UiContext, records: &[ClientIdRecord]) {
    let mut sorted: Vec<&ClientIdRecord> = records.iter().collect();
    sorted.sort_by_key(|r| r.timestamp_millisec);

    for record in sorted {
        if ctx.use_fancy_output() {
            println!("  {}: {}", style(&record.client_id).dim(), record.timestamp_millisec);
        } else {
            println!("  {}: {}", record.client_id, record.timestamp_millisec);
        }
    }
}
