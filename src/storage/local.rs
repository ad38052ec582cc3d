//! Stages storage in the local image runtime

use crate::error::{StevedoreError, StevedoreResult};
use crate::runtime::{ImageFilter, ImageRuntime};
use crate::stage::naming::{
    client_id_tag, group_image_metadata_tags, image_metadata_tag, image_name_id,
    parse_client_id_tag, parse_stage_tag, slug_image_name, stage_tag, unslug_image_name,
    validate_image_name, ImageMetadataGroups, LOCAL_CLIENT_ID_REPO_PREFIX,
    LOCAL_IMAGES_METADATA_REPO_PREFIX, LOCAL_MANAGED_IMAGES_REPO_PREFIX, LOCAL_STAGES_REPO_PREFIX,
};
use crate::stage::{labels, ClientIdRecord, ImageInfo, StageDescription, StageId};
use crate::storage::{
    ContainerImage, DeleteImageOptions, FilterStagesAndProcessRelatedDataOptions, StagesStorage,
    LOCAL_STORAGE_ADDRESS,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

pub struct LocalStagesStorage {
    runtime: Arc<dyn ImageRuntime>,
}

fn stages_repo(project: &str) -> String {
    format!("{}/{}", LOCAL_STAGES_REPO_PREFIX, project)
}

fn managed_image_record(project: &str, image_name: &str) -> String {
    format!(
        "{}/{}:{}",
        LOCAL_MANAGED_IMAGES_REPO_PREFIX,
        project,
        slug_image_name(image_name)
    )
}

fn image_metadata_repo(project: &str) -> String {
    format!("{}/{}", LOCAL_IMAGES_METADATA_REPO_PREFIX, project)
}

fn image_metadata_name_by_id(project: &str, image_id: &str, commit: &str, stage_id: &str) -> String {
    format!(
        "{}:{}",
        image_metadata_repo(project),
        image_metadata_tag(image_id, commit, stage_id)
    )
}

fn image_metadata_name(project: &str, image_name: &str, commit: &str, stage_id: &str) -> String {
    image_metadata_name_by_id(project, &image_name_id(image_name), commit, stage_id)
}

fn client_id_repo(project: &str) -> String {
    format!("{}/{}", LOCAL_CLIENT_ID_REPO_PREFIX, project)
}

/// Decode stage ids from listed images, skipping foreign tags
fn stage_ids_from_images(images: &[ImageInfo]) -> StevedoreResult<Vec<StageId>> {
    let mut ids = Vec::with_capacity(images.len());
    for image in images {
        if image.tag.is_empty() || image.tag == "<none>" {
            debug!("Skipping untagged image {}", image.id);
            continue;
        }
        match parse_stage_tag(&image.tag) {
            Ok((digest, unique_id)) => ids.push(StageId::new(digest, unique_id)),
            Err(e) if e.is_unexpected_tag_format() => {
                debug!("Skipping image {}: {}", image.log_name(), e);
            }
            Err(e) => return Err(e),
        }
    }
    Ok(ids)
}

/// References that remove exactly this image record
fn image_references(info: &ImageInfo) -> Vec<String> {
    if info.name.is_empty() {
        return vec![info.id.clone()];
    }
    let is_dangling = info.name == "<none>:<none>";
    let is_tagless = !is_dangling && info.tag == "<none>";
    if is_dangling || is_tagless {
        vec![info.id.clone()]
    } else {
        vec![info.name.clone()]
    }
}

impl LocalStagesStorage {
    pub fn new(runtime: Arc<dyn ImageRuntime>) -> Self {
        Self { runtime }
    }

    fn base_filter(project: &str) -> ImageFilter {
        ImageFilter::reference(stages_repo(project))
            .label(labels::STEVEDORE, project)
            .label(labels::CACHE_VERSION, labels::BUILD_CACHE_VERSION)
    }

    async fn repository_tags(&self, repository: String) -> StevedoreResult<Vec<String>> {
        let images = self
            .runtime
            .list_images(&ImageFilter::reference(repository))
            .await?;
        Ok(images.into_iter().map(|i| i.tag).collect())
    }

    /// Create a marker image unless it already exists
    async fn ensure_marker(&self, name: &str) -> StevedoreResult<bool> {
        if self.runtime.image_exists(name).await? {
            return Ok(false);
        }
        self.runtime
            .create_marker_image(name, &HashMap::new())
            .await
            .map_err(|e| StevedoreError::runtime(format!("create image {}", name), e))?;
        Ok(true)
    }

    async fn select_image_metadata_name(
        &self,
        project: &str,
        image_name_or_id: &str,
        commit: &str,
        stage_id: &str,
    ) -> StevedoreResult<Option<String>> {
        for name in [
            image_metadata_name(project, image_name_or_id, commit, stage_id),
            image_metadata_name_by_id(project, image_name_or_id, commit, stage_id),
        ] {
            if self.runtime.image_exists(&name).await? {
                return Ok(Some(name));
            }
        }
        Ok(None)
    }
}

impl fmt::Display for LocalStagesStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", LOCAL_STORAGE_ADDRESS)
    }
}

#[async_trait]
impl StagesStorage for LocalStagesStorage {
    fn construct_stage_image_name(&self, project: &str, digest: &str, unique_id: i64) -> String {
        format!("{}:{}", stages_repo(project), stage_tag(digest, unique_id))
    }

    async fn get_stages_ids(&self, project: &str) -> StevedoreResult<Vec<StageId>> {
        let images = self
            .runtime
            .list_images(&Self::base_filter(project))
            .await
            .map_err(|e| StevedoreError::runtime("list stage images", e))?;
        stage_ids_from_images(&images)
    }

    async fn get_stages_ids_by_digest(
        &self,
        project: &str,
        digest: &str,
    ) -> StevedoreResult<Vec<StageId>> {
        let filter = Self::base_filter(project).label(labels::STAGE_DIGEST, digest);
        let images = self
            .runtime
            .list_images(&filter)
            .await
            .map_err(|e| StevedoreError::runtime("list stage images", e))?;
        stage_ids_from_images(&images)
    }

    async fn get_stage_description(
        &self,
        project: &str,
        digest: &str,
        unique_id: i64,
    ) -> StevedoreResult<Option<StageDescription>> {
        let name = self.construct_stage_image_name(project, digest, unique_id);
        let info = self
            .runtime
            .inspect_image(&name)
            .await
            .map_err(|e| StevedoreError::runtime(format!("inspect image {}", name), e))?;

        Ok(info.map(|info| StageDescription {
            stage_id: StageId::new(digest, unique_id),
            info,
        }))
    }

    async fn delete_stage(
        &self,
        description: &StageDescription,
        options: &DeleteImageOptions,
    ) -> StevedoreResult<()> {
        let references = image_references(&description.info);
        debug!("Removing stage images {:?}", references);
        self.runtime
            .remove_images(&references, options.rmi_force)
            .await
    }

    async fn filter_stages_and_process_related_data(
        &self,
        descriptions: Vec<StageDescription>,
        options: &FilterStagesAndProcessRelatedDataOptions,
    ) -> StevedoreResult<Vec<StageDescription>> {
        let image_ids: Vec<String> = descriptions.iter().map(|d| d.info.id.clone()).collect();
        let containers = self.runtime.list_containers_by_ancestor(&image_ids).await?;

        let mut skipped = vec![false; descriptions.len()];
        let mut to_remove = Vec::new();
        for container in &containers {
            for (i, description) in descriptions.iter().enumerate() {
                if description.info.id != container.image_id {
                    continue;
                }

                if options.skip_used_image {
                    info!(
                        "Skip image {} (used by container {})",
                        description.info.log_name(),
                        container.log_name()
                    );
                    skipped[i] = true;
                } else if options.rm_containers_that_use_image {
                    to_remove.push(container);
                } else {
                    return Err(StevedoreError::ImageUsedByContainer {
                        image: description.info.log_name().to_string(),
                        container: container.log_name().to_string(),
                    });
                }
            }
        }

        for container in to_remove {
            self.runtime
                .remove_container(&container.id, options.rm_force)
                .await?;
        }

        Ok(descriptions
            .into_iter()
            .zip(skipped)
            .filter_map(|(description, skip)| (!skip).then_some(description))
            .collect())
    }

    async fn create_repo(&self) -> StevedoreResult<()> {
        Ok(())
    }

    async fn delete_repo(&self) -> StevedoreResult<()> {
        Ok(())
    }

    async fn should_fetch_image(&self, _image: &ContainerImage) -> StevedoreResult<bool> {
        Ok(false)
    }

    async fn fetch_image(&self, _image: &ContainerImage) -> StevedoreResult<()> {
        Ok(())
    }

    async fn store_image(&self, image: &ContainerImage) -> StevedoreResult<()> {
        match &image.built_id {
            Some(built_id) => self.runtime.tag_image(built_id, &image.name).await,
            None => {
                debug!("Image {} is already stored locally", image.name);
                Ok(())
            }
        }
    }

    async fn add_managed_image(&self, project: &str, image_name: &str) -> StevedoreResult<()> {
        debug!("Adding managed image {:?} for project {}", image_name, project);
        if validate_image_name(image_name).is_err() {
            return Ok(());
        }

        let name = managed_image_record(project, image_name);
        if self.ensure_marker(&name).await? {
            info!("Added managed image {:?} for project {}", image_name, project);
        }
        Ok(())
    }

    async fn rm_managed_image(&self, project: &str, image_name: &str) -> StevedoreResult<()> {
        debug!("Removing managed image {:?} for project {}", image_name, project);
        let name = managed_image_record(project, image_name);
        if !self.runtime.image_exists(&name).await? {
            return Ok(());
        }

        self.runtime
            .remove_images(&[name.clone()], true)
            .await
            .map_err(|e| StevedoreError::runtime(format!("remove image {}", name), e))
    }

    async fn get_managed_images(&self, project: &str) -> StevedoreResult<Vec<String>> {
        let repository = format!("{}/{}", LOCAL_MANAGED_IMAGES_REPO_PREFIX, project);
        let tags = self.repository_tags(repository).await?;

        Ok(tags
            .iter()
            .map(|tag| unslug_image_name(tag))
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
        let name = image_metadata_name(project, image_name, commit, stage_id);
        debug!("Putting image metadata {}", name);

        if self.ensure_marker(&name).await? {
            info!(
                "Put image {} commit {} stage ID {}",
                image_name, commit, stage_id
            );
        }
        Ok(())
    }

    async fn rm_image_metadata(
        &self,
        project: &str,
        image_name_or_id: &str,
        commit: &str,
        stage_id: &str,
    ) -> StevedoreResult<()> {
        let Some(name) = self
            .select_image_metadata_name(project, image_name_or_id, commit, stage_id)
            .await?
        else {
            return Ok(());
        };

        self.runtime
            .remove_images(&[name.clone()], true)
            .await
            .map_err(|e| StevedoreError::runtime(format!("remove image {}", name), e))?;

        info!(
            "Removed image {} commit {} stage ID {}",
            image_name_or_id, commit, stage_id
        );
        Ok(())
    }

    async fn is_image_metadata_exist(
        &self,
        project: &str,
        image_name: &str,
        commit: &str,
        stage_id: &str,
    ) -> StevedoreResult<bool> {
        self.runtime
            .image_exists(&image_metadata_name(project, image_name, commit, stage_id))
            .await
    }

    async fn get_all_and_group_image_metadata_by_image_name(
        &self,
        project: &str,
        image_names: &[String],
    ) -> StevedoreResult<(ImageMetadataGroups, ImageMetadataGroups)> {
        let tags = self.repository_tags(image_metadata_repo(project)).await?;
        Ok(group_image_metadata_tags(image_names, &tags, ""))
    }

    async fn get_client_id_records(&self, project: &str) -> StevedoreResult<Vec<ClientIdRecord>> {
        let tags = self.repository_tags(client_id_repo(project)).await?;

        let mut records = Vec::new();
        for tag in tags {
            match parse_client_id_tag(&tag) {
                Some(record) => {
                    debug!("Got client id record {}", record);
                    records.push(record);
                }
                None => debug!("Skipping client id tag {:?}", tag),
            }
        }
        Ok(records)
    }

    async fn post_client_id_record(
        &self,
        project: &str,
        record: &ClientIdRecord,
    ) -> StevedoreResult<()> {
        let name = format!("{}:{}", client_id_repo(project), client_id_tag(record));
        debug!("Posting client id record {}", name);

        if self.ensure_marker(&name).await? {
            info!(
                "Posted new client id {:?} for project {}",
                record.client_id, project
            );
        }
        Ok(())
    }

    fn address(&self) -> &str {
        LOCAL_STORAGE_ADDRESS
    }
}
