//! Serve command - expose the configured cache to other hosts

use crate::cache::create_stages_storage_cache;
use crate::cli::args::ServeArgs;
use crate::config::{Config, ConfigManager};
use crate::error::StevedoreResult;
use crate::lock::create_locker;
use crate::sync;
use crate::ui::{self, Status, UiContext};

/// Execute the serve command
pub async fn execute(args: ServeArgs, config: &Config) -> StevedoreResult<()> {
    let ctx = UiContext::detect();
    ConfigManager::ensure_state_dirs().await?;

    let cache = create_stages_storage_cache(config, create_locker(config)?)?;
    ui::status(
        &ctx,
        Status::Info,
        &format!("Serving stages storage cache {} on http://{}", cache, args.listen),
        None,
    );

    sync::serve(args.listen, cache).await?;

    ui::status(&ctx, Status::Ok, "Server stopped", None);
    Ok(())
}
