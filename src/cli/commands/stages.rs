//! Stages command - query the stages storage

use crate::cache::create_stages_storage_cache;
use crate::cli::args::{StagesAction, StagesArgs};
use crate::config::Config;
use crate::error::StevedoreResult;
use crate::lock::{create_locker, LockManager};
use crate::manager::StagesStorageManager;
use crate::parallel::{DoTasksOptions, OutputSink};
use crate::registry::DistributionRegistry;
use crate::runtime::CliImageRuntime;
use crate::storage::{create_stages_storage, StagesStorage};
use crate::ui::{self, UiContext};
use std::sync::Arc;

/// Execute the stages command
pub async fn execute(args: StagesArgs, config: &Config) -> StevedoreResult<()> {
    let ctx = UiContext::detect();
    let address = args
        .storage
        .clone()
        .unwrap_or_else(|| config.storage.address.clone());
    let storage = create_stages_storage(
        &address,
        Arc::new(CliImageRuntime::new(config.storage.runtime.clone())),
        Arc::new(DistributionRegistry::new(config.storage.insecure_registry)),
    );

    match args.action {
        StagesAction::List { digests } if digests.is_empty() => {
            let stages = storage.get_stages_ids(&args.project).await?;
            ui::stage_table(&ctx, &format!("Stages in {}", storage), &stages);
        }
        StagesAction::List { digests } => {
            let manager = build_manager(config, &args.project, storage)?;
            let found = manager
                .get_stages_by_digests(&digests, OutputSink::stdout())
                .await?;

            for digest in &digests {
                let stages = found.get(digest).map(Vec::as_slice).unwrap_or_default();
                ui::stage_table(&ctx, &format!("Stages of {}", digest), stages);
            }
        }
        StagesAction::ManagedImages => {
            let images = storage.get_managed_images(&args.project).await?;
            for image in &images {
                let shown = if image.is_empty() { "~" } else { image.as_str() };
                println!("{}", shown);
            }
        }
        StagesAction::Clients => {
            let records = storage.get_client_id_records(&args.project).await?;
            ui::client_records(&ctx, &records);
        }
    }

    Ok(())
}

fn build_manager(
    config: &Config,
    project: &str,
    storage: Arc<dyn StagesStorage>,
) -> StevedoreResult<StagesStorageManager> {
    let locker = create_locker(config)?;
    let cache = create_stages_storage_cache(config, locker.clone())?;
    let lock_manager = LockManager::new(locker).with_timeout(config.lock_timeout());

    Ok(
        StagesStorageManager::new(project, storage, cache, Arc::new(lock_manager)).with_parallel(
            DoTasksOptions {
                max_number_of_workers: config.parallel.max_workers,
                is_live_output_on: config.parallel.live_output,
            },
        ),
    )
}
