//! Remote registry abstraction
//!
//! The repo stages storage keeps every record as a tag in one registry
//! repository. [`DockerRegistry`] covers the tag and manifest operations it
//! needs; [`DistributionRegistry`] speaks the OCI distribution HTTP API.

mod distribution;

pub use distribution::DistributionRegistry;

use crate::error::{StevedoreError, StevedoreResult};
use crate::stage::{parse_repository_and_tag, ImageInfo};
use async_trait::async_trait;
use std::collections::HashMap;

/// Registry operations used by the repo stages storage
#[async_trait]
pub trait DockerRegistry: Send + Sync {
    /// Every tag of `repository`, empty when the repository does not exist
    async fn tags(&self, repository: &str) -> StevedoreResult<Vec<String>>;

    /// Describe `repository:tag`, `None` when it does not exist
    async fn try_get_repo_image(&self, reference: &str) -> StevedoreResult<Option<ImageInfo>>;

    async fn is_repo_image_exists(&self, reference: &str) -> StevedoreResult<bool>;

    /// Push an image without layers, used as a record marker
    async fn push_marker_image(
        &self,
        reference: &str,
        labels: &HashMap<String, String>,
    ) -> StevedoreResult<()>;

    /// Delete the manifest `image.id` from `image.repository`
    async fn delete_repo_image(&self, image: &ImageInfo) -> StevedoreResult<()>;

    async fn create_repo(&self, repository: &str) -> StevedoreResult<()>;

    async fn delete_repo(&self, repository: &str) -> StevedoreResult<()>;

    /// Implementation name for display
    fn name(&self) -> &'static str;
}

const DOCKER_HUB_REGISTRY: &str = "registry-1.docker.io";

/// Image reference split into its registry parts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoReference {
    /// `host[:port]`
    pub registry: String,
    /// Repository path inside the registry
    pub path: String,
    pub tag: Option<String>,
}

impl RepoReference {
    /// Parse `[host[:port]/]path[:tag]`. The first segment is a registry host
    /// when it contains `.` or `:` or is `localhost`.
    pub fn parse(reference: &str) -> StevedoreResult<Self> {
        let (repository, tag) = match reference.rfind('/') {
            Some(slash) if !reference[slash..].contains(':') => (reference, None),
            None if !reference.contains(':') => (reference, None),
            _ => {
                let (repository, tag) = parse_repository_and_tag(reference);
                (repository, Some(tag.to_string()))
            }
        };

        if repository.is_empty() {
            return Err(StevedoreError::registry(
                "parse reference",
                format!("empty repository in {:?}", reference),
            ));
        }

        let (registry, path) = match repository.split_once('/') {
            Some((host, path))
                if host.contains('.') || host.contains(':') || host == "localhost" =>
            {
                (host.to_string(), path.to_string())
            }
            Some(_) => (DOCKER_HUB_REGISTRY.to_string(), repository.to_string()),
            None => (
                DOCKER_HUB_REGISTRY.to_string(),
                format!("library/{}", repository),
            ),
        };

        Ok(Self {
            registry,
            path,
            tag,
        })
    }
}
