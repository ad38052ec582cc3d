//! Local image runtime abstraction
//!
//! The local stages storage keeps every record as an image in a
//! docker-compatible runtime. [`ImageRuntime`] is the narrow set of image and
//! container operations it needs; [`CliImageRuntime`] drives the runtime's
//! CLI.

mod cli;

pub use cli::CliImageRuntime;

use crate::error::StevedoreResult;
use crate::stage::ImageInfo;
use async_trait::async_trait;
use std::collections::HashMap;

/// Image listing filter, every condition must hold
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImageFilter {
    /// Repository reference, matches every tag of the repository
    pub reference: Option<String>,
    /// `key=value` label conditions
    pub labels: Vec<(String, String)>,
}

impl ImageFilter {
    pub fn reference(reference: impl Into<String>) -> Self {
        Self {
            reference: Some(reference.into()),
            labels: Vec::new(),
        }
    }

    pub fn label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.push((key.into(), value.into()));
        self
    }
}

/// A container as reported by the runtime
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerInfo {
    pub id: String,
    pub names: Vec<String>,
    /// Id of the image the container was created from
    pub image_id: String,
}

impl ContainerInfo {
    /// First name, falling back to the id
    pub fn log_name(&self) -> &str {
        self.names.first().map(String::as_str).unwrap_or(&self.id)
    }
}

/// Image runtime operations used by the local stages storage
#[async_trait]
pub trait ImageRuntime: Send + Sync {
    async fn image_exists(&self, reference: &str) -> StevedoreResult<bool>;

    /// Inspect an image, `None` when it does not exist
    async fn inspect_image(&self, reference: &str) -> StevedoreResult<Option<ImageInfo>>;

    /// List images, one entry per `repository:tag`
    async fn list_images(&self, filter: &ImageFilter) -> StevedoreResult<Vec<ImageInfo>>;

    /// Create an image without content, used as a record marker
    async fn create_marker_image(
        &self,
        name: &str,
        labels: &HashMap<String, String>,
    ) -> StevedoreResult<()>;

    async fn remove_images(&self, references: &[String], force: bool) -> StevedoreResult<()>;

    async fn tag_image(&self, source: &str, target: &str) -> StevedoreResult<()>;

    async fn push_image(&self, name: &str) -> StevedoreResult<()>;

    async fn pull_image(&self, name: &str) -> StevedoreResult<()>;

    /// Containers, running or not, created from any of `image_ids`
    async fn list_containers_by_ancestor(
        &self,
        image_ids: &[String],
    ) -> StevedoreResult<Vec<ContainerInfo>>;

    async fn remove_container(&self, id: &str, force: bool) -> StevedoreResult<()>;

    /// Get runtime name for display
    fn runtime_name(&self) -> &'static str;
}
