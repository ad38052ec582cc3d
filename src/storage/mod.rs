//! Stages storage
//!
//! The authoritative store of stage artifacts and their bookkeeping records
//! (managed images, commit metadata, client ids). Two backends exist:
//!
//! | Address | Backend | Records live in |
//! |---------|---------|-----------------|
//! | `:local` | [`LocalStagesStorage`] | image repositories of the local runtime |
//! | anything else | [`RepoStagesStorage`] | tags of one registry repository |
//!
//! Every record is an image whose name encodes the record key, see
//! [`crate::stage::naming`].

mod local;
mod repo;

pub use local::LocalStagesStorage;
pub use repo::RepoStagesStorage;

use crate::error::StevedoreResult;
use crate::registry::DockerRegistry;
use crate::runtime::ImageRuntime;
use crate::stage::naming::ImageMetadataGroups;
use crate::stage::{ClientIdRecord, StageDescription, StageId};
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;

/// Address selecting the local runtime backend
pub const LOCAL_STORAGE_ADDRESS: &str = ":local";

#[derive(Debug, Clone, Default)]
pub struct DeleteImageOptions {
    /// Remove images even when tagged in other repositories
    pub rmi_force: bool,
}

/// How images still used by containers are handled before deletion
#[derive(Debug, Clone, Default)]
pub struct FilterStagesAndProcessRelatedDataOptions {
    /// Keep images used by a container out of the result
    pub skip_used_image: bool,
    /// Remove containers that use one of the images
    pub rm_containers_that_use_image: bool,
    /// Force removal of running containers
    pub rm_force: bool,
}

/// A built image handed over by the build pipeline
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerImage {
    /// Target name, `repository:tag`
    pub name: String,
    /// Id of the freshly built image, when it is not yet known by `name`
    pub built_id: Option<String>,
}

impl ContainerImage {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            built_id: None,
        }
    }

    pub fn with_built_id(mut self, built_id: impl Into<String>) -> Self {
        self.built_id = Some(built_id.into());
        self
    }
}

/// Authoritative stage artifact store
#[async_trait]
pub trait StagesStorage: Send + Sync + fmt::Display {
    /// Full image name of a stage
    fn construct_stage_image_name(&self, project: &str, digest: &str, unique_id: i64) -> String;

    async fn get_stages_ids(&self, project: &str) -> StevedoreResult<Vec<StageId>>;

    async fn get_stages_ids_by_digest(
        &self,
        project: &str,
        digest: &str,
    ) -> StevedoreResult<Vec<StageId>>;

    /// `None` when the stage does not exist
    async fn get_stage_description(
        &self,
        project: &str,
        digest: &str,
        unique_id: i64,
    ) -> StevedoreResult<Option<StageDescription>>;

    async fn delete_stage(
        &self,
        description: &StageDescription,
        options: &DeleteImageOptions,
    ) -> StevedoreResult<()>;

    /// Reconcile containers that use the images about to be deleted and
    /// return the descriptions that may still be deleted
    async fn filter_stages_and_process_related_data(
        &self,
        descriptions: Vec<StageDescription>,
        options: &FilterStagesAndProcessRelatedDataOptions,
    ) -> StevedoreResult<Vec<StageDescription>>;

    async fn create_repo(&self) -> StevedoreResult<()>;

    async fn delete_repo(&self) -> StevedoreResult<()>;

    async fn should_fetch_image(&self, image: &ContainerImage) -> StevedoreResult<bool>;

    async fn fetch_image(&self, image: &ContainerImage) -> StevedoreResult<()>;

    async fn store_image(&self, image: &ContainerImage) -> StevedoreResult<()>;

    /// Record `image_name` as managed. Names that cannot be encoded as a tag
    /// are ignored.
    async fn add_managed_image(&self, project: &str, image_name: &str) -> StevedoreResult<()>;

    async fn rm_managed_image(&self, project: &str, image_name: &str) -> StevedoreResult<()>;

    async fn get_managed_images(&self, project: &str) -> StevedoreResult<Vec<String>>;

    async fn put_image_metadata(
        &self,
        project: &str,
        image_name: &str,
        commit: &str,
        stage_id: &str,
    ) -> StevedoreResult<()>;

    /// Remove a commit record given either the image name or its raw id
    async fn rm_image_metadata(
        &self,
        project: &str,
        image_name_or_id: &str,
        commit: &str,
        stage_id: &str,
    ) -> StevedoreResult<()>;

    async fn is_image_metadata_exist(
        &self,
        project: &str,
        image_name: &str,
        commit: &str,
        stage_id: &str,
    ) -> StevedoreResult<bool>;

    /// Commit records of `image_names`, and separately those of unknown images
    async fn get_all_and_group_image_metadata_by_image_name(
        &self,
        project: &str,
        image_names: &[String],
    ) -> StevedoreResult<(ImageMetadataGroups, ImageMetadataGroups)>;

    async fn get_client_id_records(&self, project: &str) -> StevedoreResult<Vec<ClientIdRecord>>;

    async fn post_client_id_record(
        &self,
        project: &str,
        record: &ClientIdRecord,
    ) -> StevedoreResult<()>;

    fn address(&self) -> &str;
}

/// Select the backend for `address`
pub fn create_stages_storage(
    address: &str,
    runtime: Arc<dyn ImageRuntime>,
    registry: Arc<dyn DockerRegistry>,
) -> Arc<dyn StagesStorage> {
    if address == LOCAL_STORAGE_ADDRESS {
        Arc::new(LocalStagesStorage::new(runtime))
    } else {
        Arc::new(RepoStagesStorage::new(address, registry, runtime))
    }
}
