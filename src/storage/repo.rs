//! Stages storage in a registry repository
//!
//! Stages and records share a single repository and are told apart by tag
//! prefix: `managed-image-*`, `meta-*`, `client-id-*`, everything else is a
//! stage tag `<digest>-<uniqueID>`.

use crate::error::{StevedoreError, StevedoreResult};
use crate::registry::DockerRegistry;
use crate::runtime::ImageRuntime;
use crate::stage::naming::{
    client_id_tag, group_image_metadata_tags, image_metadata_tag, image_name_id,
    parse_client_id_tag, parse_stage_tag, slug_image_name, stage_tag, unslug_image_name,
    validate_image_name, ImageMetadataGroups, REPO_CLIENT_ID_TAG_PREFIX,
    REPO_IMAGE_METADATA_TAG_PREFIX, REPO_MANAGED_IMAGE_TAG_PREFIX,
};
use crate::stage::{labels, ClientIdRecord, StageDescription, StageId};
use crate::storage::{
    ContainerImage, DeleteImageOptions, FilterStagesAndProcessRelatedDataOptions, StagesStorage,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

const RECORD_TAG_PREFIXES: [&str; 3] = [
    REPO_MANAGED_IMAGE_TAG_PREFIX,
    REPO_IMAGE_METADATA_TAG_PREFIX,
    REPO_CLIENT_ID_TAG_PREFIX,
];

/// Decode a repository tag as a stage id. Record tags and foreign tags
/// yield `None`.
fn stage_id_from_tag(tag: &str) -> Option<StageId> {
    if RECORD_TAG_PREFIXES.iter().any(|p| tag.starts_with(p)) {
        return None;
    }

    match parse_stage_tag(tag) {
        Ok((digest, unique_id)) => Some(StageId::new(digest, unique_id)),
        Err(e) => {
            debug!("Skipping tag {:?}: {}", tag, e);
            None
        }
    }
}

pub struct RepoStagesStorage {
    address: String,
    registry: Arc<dyn DockerRegistry>,
    runtime: Arc<dyn ImageRuntime>,
}

impl RepoStagesStorage {
    pub fn new(
        address: impl Into<String>,
        registry: Arc<dyn DockerRegistry>,
        runtime: Arc<dyn ImageRuntime>,
    ) -> Self {
        Self {
            address: address.into(),
            registry,
            runtime,
        }
    }

    fn reference(&self, tag: &str) -> String {
        format!("{}:{}", self.address, tag)
    }

    fn managed_image_record(&self, image_name: &str) -> String {
        self.reference(&format!(
            "{}{}",
            REPO_MANAGED_IMAGE_TAG_PREFIX,
            slug_image_name(image_name)
        ))
    }

    fn image_metadata_name_by_id(&self, image_id: &str, commit: &str, stage_id: &str) -> String {
        self.reference(&format!(
            "{}{}",
            REPO_IMAGE_METADATA_TAG_PREFIX,
            image_metadata_tag(image_id, commit, stage_id)
        ))
    }

    fn image_metadata_name(&self, image_name: &str, commit: &str, stage_id: &str) -> String {
        self.image_metadata_name_by_id(&image_name_id(image_name), commit, stage_id)
    }

    async fn repo_tags(&self) -> StevedoreResult<Vec<String>> {
        self.registry
            .tags(&self.address)
            .await
            .map_err(|e| StevedoreError::registry(format!("get repo {} tags", self.address), e))
    }

    /// Push a record marker unless it already exists
    async fn ensure_marker(&self, project: &str, reference: &str) -> StevedoreResult<bool> {
        if self.registry.is_repo_image_exists(reference).await? {
            return Ok(false);
        }

        let labels = HashMap::from([(labels::STEVEDORE.to_string(), project.to_string())]);
        self.registry
            .push_marker_image(reference, &labels)
            .await
            .map_err(|e| StevedoreError::registry(format!("push image {}", reference), e))?;
        Ok(true)
    }
}

impl fmt::Display for RepoStagesStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.address)
    }
}

#[async_trait]
impl StagesStorage for RepoStagesStorage {
    fn construct_stage_image_name(&self, _project: &str, digest: &str, unique_id: i64) -> String {
        self.reference(&stage_tag(digest, unique_id))
    }

    async fn get_stages_ids(&self, _project: &str) -> StevedoreResult<Vec<StageId>> {
        let tags = self.repo_tags().await?;
        Ok(tags.iter().filter_map(|tag| stage_id_from_tag(tag)).collect())
    }

    async fn get_stages_ids_by_digest(
        &self,
        _project: &str,
        digest: &str,
    ) -> StevedoreResult<Vec<StageId>> {
        let tags = self.repo_tags().await?;
        Ok(tags
            .iter()
            .filter(|tag| tag.starts_with(digest))
            .filter_map(|tag| stage_id_from_tag(tag))
            .filter(|id| id.digest == digest)
            .collect())
    }

    async fn get_stage_description(
        &self,
        project: &str,
        digest: &str,
        unique_id: i64,
    ) -> StevedoreResult<Option<StageDescription>> {
        let reference = self.construct_stage_image_name(project, digest, unique_id);
        debug!("Getting stage description of {}", reference);

        let info = self.registry.try_get_repo_image(&reference).await?;
        Ok(info.map(|info| StageDescription {
            stage_id: StageId::new(digest, unique_id),
            info,
        }))
    }

    async fn delete_stage(
        &self,
        description: &StageDescription,
        _options: &DeleteImageOptions,
    ) -> StevedoreResult<()> {
        self.registry
            .delete_repo_image(&description.info)
            .await
            .map_err(|e| {
                StevedoreError::registry(
                    format!("remove repo image {}", description.info.log_name()),
                    e,
                )
            })
    }

    async fn filter_stages_and_process_related_data(
        &self,
        descriptions: Vec<StageDescription>,
        _options: &FilterStagesAndProcessRelatedDataOptions,
    ) -> StevedoreResult<Vec<StageDescription>> {
        Ok(descriptions)
    }

    async fn create_repo(&self) -> StevedoreResult<()> {
        self.registry.create_repo(&self.address).await
    }

    async fn delete_repo(&self) -> StevedoreResult<()> {
        self.registry.delete_repo(&self.address).await
    }

    async fn should_fetch_image(&self, image: &ContainerImage) -> StevedoreResult<bool> {
        Ok(!self.runtime.image_exists(&image.name).await?)
    }

    async fn fetch_image(&self, image: &ContainerImage) -> StevedoreResult<()> {
        self.runtime
            .pull_image(&image.name)
            .await
            .map_err(|e| StevedoreError::runtime(format!("pull image {}", image.name), e))
    }

    async fn store_image(&self, image: &ContainerImage) -> StevedoreResult<()> {
        if let Some(built_id) = &image.built_id {
            self.runtime.tag_image(built_id, &image.name).await?;
        }
        self.runtime
            .push_image(&image.name)
            .await
            .map_err(|e| StevedoreError::runtime(format!("push image {}", image.name), e))
    }

    async fn add_managed_image(&self, project: &str, image_name: &str) -> StevedoreResult<()> {
        debug!("Adding managed image {:?} to {}", image_name, self.address);
        if validate_image_name(image_name).is_err() {
            return Ok(());
        }

        let reference = self.managed_image_record(image_name);
        if self.ensure_marker(project, &reference).await? {
            info!("Added managed image {:?} to {}", image_name, self.address);
        }
        Ok(())
    }

    async fn rm_managed_image(&self, _project: &str, image_name: &str) -> StevedoreResult<()> {
        let reference = self.managed_image_record(image_name);
        let Some(info) = self.registry.try_get_repo_image(&reference).await? else {
            debug!("Managed image record {} does not exist", reference);
            return Ok(());
        };

        self.registry
            .delete_repo_image(&info)
            .await
            .map_err(|e| StevedoreError::registry(format!("remove repo image {}", reference), e))?;
        info!("Removed managed image {:?} from {}", image_name, self.address);
        Ok(())
    }

    async fn get_managed_images(&self, _project: &str) -> StevedoreResult<Vec<String>> {
        let tags = self.repo_tags().await?;

        Ok(tags
            .iter()
            .filter_map(|tag| tag.strip_prefix(REPO_MANAGED_IMAGE_TAG_PREFIX))
            .map(unslug_image_name)
            .filter(|name| validate_image_name(name).is_ok())
            .collect())
    }

    async fn put_image_metadata(
        &self,
        project: &str,
        image_name: &str,
        commit: &str,
        stage_id: &str,
    ) -> StevedoreResult<()> {
        let reference = self.image_metadata_name(image_name, commit, stage_id);
        if self.ensure_marker(project, &reference).await? {
            info!(
                "Put image {} commit {} stage ID {}",
                image_name, commit, stage_id
            );
        }
        Ok(())
    }

    async fn rm_image_metadata(
        &self,
        _project: &str,
        image_name_or_id: &str,
        commit: &str,
        stage_id: &str,
    ) -> StevedoreResult<()> {
        for reference in [
            self.image_metadata_name(image_name_or_id, commit, stage_id),
            self.image_metadata_name_by_id(image_name_or_id, commit, stage_id),
        ] {
            let Some(info) = self.registry.try_get_repo_image(&reference).await? else {
                continue;
            };

            self.registry.delete_repo_image(&info).await.map_err(|e| {
                StevedoreError::registry(format!("remove repo image {}", reference), e)
            })?;
            info!(
                "Removed image {} commit {} stage ID {}",
                image_name_or_id, commit, stage_id
            );
            return Ok(());
        }
        Ok(())
    }

    async fn is_image_metadata_exist(
        &self,
        _project: &str,
        image_name: &str,
        commit: &str,
        stage_id: &str,
    ) -> StevedoreResult<bool> {
        self.registry
            .is_repo_image_exists(&self.image_metadata_name(image_name, commit, stage_id))
            .await
    }

    async fn get_all_and_group_image_metadata_by_image_name(
        &self,
        _project: &str,
        image_names: &[String],
    ) -> StevedoreResult<(ImageMetadataGroups, ImageMetadataGroups)> {
        let tags = self.repo_tags().await?;
        Ok(group_image_metadata_tags(
            image_names,
            &tags,
            REPO_IMAGE_METADATA_TAG_PREFIX,
        ))
    }

    async fn get_client_id_records(&self, _project: &str) -> StevedoreResult<Vec<ClientIdRecord>> {
        let tags = self.repo_tags().await?;

        let mut records = Vec::new();
        for body in tags
            .iter()
            .filter_map(|tag| tag.strip_prefix(REPO_CLIENT_ID_TAG_PREFIX))
        {
            match parse_client_id_tag(body) {
                Some(record) => records.push(record),
                None => debug!("Skipping client id tag {:?}", body),
            }
        }
        Ok(records)
    }

    async fn post_client_id_record(
        &self,
        project: &str,
        record: &ClientIdRecord,
    ) -> StevedoreResult<()> {
        let reference = self.reference(&format!(
            "{}{}",
            REPO_CLIENT_ID_TAG_PREFIX,
            client_id_tag(record)
        ));

        if self.ensure_marker(project, &reference).await? {
            info!(
                "Posted new client id {:?} for project {}",
                record.client_id, project
            );
        }
        Ok(())
    }

    fn address(&self) -> &str {
        &self.address
    }
}
