//! Cache command - inspect or invalidate the stages storage cache

use crate::cache::{create_stages_storage_cache, StagesStorageCache};
use crate::cli::args::{CacheAction, CacheArgs};
use crate::config::Config;
use crate::error::StevedoreResult;
use crate::lock::create_locker;
use crate::stage::StageId;
use crate::ui::{self, Status, UiContext};
use tracing::debug;

/// Execute the cache command
pub async fn execute(args: CacheArgs, config: &Config) -> StevedoreResult<()> {
    let ctx = UiContext::detect();
    let cache = create_stages_storage_cache(config, create_locker(config)?)?;
    debug!("Using stages storage cache {}", cache);

    let project = args.project.as_str();
    match args.action {
        CacheAction::Get { digest } => {
            let stages = cache.get_stages_by_digest(project, &digest).await?;
            show_entry(&ctx, &*cache, &digest, stages);
        }
        CacheAction::GetAll => {
            let stages = cache.get_all_stages(project).await?;
            show_entry(&ctx, &*cache, project, stages);
        }
        CacheAction::Delete { digest } => {
            cache.delete_stages_by_digest(project, &digest).await?;
            ui::status(&ctx, Status::Ok, &format!("Deleted cache entry {}", digest), None);
        }
        CacheAction::DeleteAll => {
            cache.delete_all_stages(project).await?;
            ui::status(
                &ctx,
                Status::Ok,
                &format!("Deleted all cache entries of {}", project),
                None,
            );
        }
    }

    Ok(())
}

fn show_entry(
    ctx: &UiContext,
    cache: &dyn StagesStorageCache,
    what: &str,
    stages: Option<Vec<StageId>>,
) {
    match stages {
        Some(stages) => ui::stage_table(ctx, &format!("Cached stages of {}", what), &stages),
        None => ui::status(
            ctx,
            Status::Warn,
            &format!("No cache entry for {}", what),
            Some(&format!("cache {} has not seen it yet", cache)),
        ),
    }
}
