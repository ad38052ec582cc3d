//! Terminal output for the CLI
//!
//! Uses `cliclack` log lines on an interactive terminal and falls back to
//! plain prefixed lines in CI or when output is piped.
//!
//! ```rust,ignore
//! use stevedore::ui::{self, Status, UiContext};
//!
//! let ctx = UiContext::detect();
//! ui::status(&ctx, Status::Ok, "Deleted cache entry abc", None);
//! ui::status(&ctx, Status::Warn, "No cache entry for abc", Some("Entries appear after the first lookup"));
//! ```

mod context;
mod output;

pub use context::UiContext;
pub use output::{client_records, render_stage_table, stage_table, status, Status};
