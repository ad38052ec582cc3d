//! OCI distribution API client
//!
//! Requests are blocking `ureq` calls moved off the runtime with
//! `spawn_blocking`. Only anonymous access is supported.

use crate::error::{StevedoreError, StevedoreResult};
use crate::registry::{DockerRegistry, RepoReference};
use crate::stage::ImageInfo;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info};

const OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
const OCI_CONFIG: &str = "application/vnd.oci.image.config.v1+json";
const DOCKER_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v2+json";
const DIGEST_HEADER: &str = "Docker-Content-Digest";

/// Registry client over the OCI distribution HTTP API
pub struct DistributionRegistry {
    agent: ureq::Agent,
    insecure: bool,
}

#[derive(Debug, Deserialize)]
struct TagList {
    #[serde(default)]
    tags: Option<Vec<String>>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Descriptor {
    #[serde(default)]
    media_type: Option<String>,
    digest: String,
    #[serde(default)]
    size: i64,
}

#[derive(Debug, Deserialize)]
struct Manifest {
    config: Descriptor,
    #[serde(default)]
    layers: Vec<Descriptor>,
}

#[derive(Debug, Default, Deserialize)]
struct ImageConfig {
    #[serde(default)]
    created: Option<String>,
    #[serde(default)]
    config: Option<ImageConfigBody>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ImageConfigBody {
    #[serde(default)]
    labels: Option<HashMap<String, String>>,
}

fn sha256_digest(data: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(data)))
}

/// Next page of a `Link: <...>; rel="next"` header
fn next_link(link: Option<&str>) -> Option<String> {
    let link = link?;
    if !link.contains("rel=\"next\"") {
        return None;
    }
    let start = link.find('<')? + 1;
    let end = link[start..].find('>')? + start;
    Some(link[start..end].to_string())
}

impl DistributionRegistry {
    pub fn new(insecure: bool) -> Self {
        Self {
            agent: ureq::Agent::config_builder()
                .timeout_global(Some(Duration::from_secs(60)))
                .http_status_as_error(false)
                .build()
                .into(),
            insecure,
        }
    }

    fn base_url(&self, reference: &RepoReference) -> String {
        let scheme = if self.insecure { "http" } else { "https" };
        format!("{}://{}/v2/{}", scheme, reference.registry, reference.path)
    }

    fn tag_of(reference: &RepoReference, raw: &str) -> StevedoreResult<String> {
        reference
            .tag
            .clone()
            .ok_or_else(|| StevedoreError::registry("parse reference", format!("{} has no tag", raw)))
    }

    async fn blocking<T, F>(&self, operation: &str, f: F) -> StevedoreResult<T>
    where
        T: Send + 'static,
        F: FnOnce(ureq::Agent) -> Result<T, String> + Send + 'static,
    {
        let agent = self.agent.clone();
        tokio::task::spawn_blocking(move || f(agent))
            .await
            .map_err(|e| StevedoreError::Internal(format!("registry task failed: {}", e)))?
            .map_err(|reason| StevedoreError::registry(operation, reason))
    }
}

impl Default for DistributionRegistry {
    fn default() -> Self {
        Self::new(false)
    }
}

#[async_trait]
impl DockerRegistry for DistributionRegistry {
    async fn tags(&self, repository: &str) -> StevedoreResult<Vec<String>> {
        let reference = RepoReference::parse(repository)?;
        let base = self.base_url(&reference);
        let origin = base[..base.find("/v2/").unwrap_or(base.len())].to_string();

        self.blocking(&format!("list tags of {}", repository), move |agent| {
            let mut tags = Vec::new();
            let mut url = format!("{}/tags/list", base);
            loop {
                let mut resp = agent.get(&url).call().map_err(|e| e.to_string())?;
                let status = resp.status().as_u16();
                if status == 404 {
                    return Ok(tags);
                }
                let link = resp
                    .headers()
                    .get("Link")
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string);
                let body = resp.body_mut().read_to_string().map_err(|e| e.to_string())?;
                if status != 200 {
                    return Err(format!("status {}: {}", status, body.trim()));
                }

                let page: TagList = serde_json::from_str(&body).map_err(|e| e.to_string())?;
                tags.extend(page.tags.unwrap_or_default());

                match next_link(link.as_deref()) {
                    Some(next) if next.starts_with('/') => url = format!("{}{}", origin, next),
                    Some(next) => url = next,
                    None => return Ok(tags),
                }
            }
        })
        .await
    }

    async fn try_get_repo_image(&self, raw: &str) -> StevedoreResult<Option<ImageInfo>> {
        let reference = RepoReference::parse(raw)?;
        let tag = Self::tag_of(&reference, raw)?;
        let base = self.base_url(&reference);
        let repository = format!("{}/{}", reference.registry, reference.path);
        let name = raw.to_string();

        self.blocking(&format!("get {}", raw), move |agent| {
            let mut resp = agent
                .get(&format!("{}/manifests/{}", base, tag))
                .header("Accept", &format!("{}, {}", OCI_MANIFEST, DOCKER_MANIFEST))
                .call()
                .map_err(|e| e.to_string())?;
            let status = resp.status().as_u16();
            if status == 404 {
                return Ok(None);
            }
            let header_digest = resp
                .headers()
                .get(DIGEST_HEADER)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            let body = resp.body_mut().read_to_vec().map_err(|e| e.to_string())?;
            if status != 200 {
                return Err(format!("status {}: {}", status, String::from_utf8_lossy(&body).trim()));
            }

            let digest = header_digest.unwrap_or_else(|| sha256_digest(&body));
            let manifest: Manifest = serde_json::from_slice(&body).map_err(|e| e.to_string())?;

            let mut config_resp = agent
                .get(&format!("{}/blobs/{}", base, manifest.config.digest))
                .call()
                .map_err(|e| e.to_string())?;
            let config: ImageConfig = if config_resp.status().as_u16() == 200 {
                let text = config_resp
                    .body_mut()
                    .read_to_string()
                    .map_err(|e| e.to_string())?;
                serde_json::from_str(&text).unwrap_or_default()
            } else {
                ImageConfig::default()
            };

            Ok(Some(ImageInfo {
                id: digest,
                name,
                repository,
                tag,
                size: manifest.config.size + manifest.layers.iter().map(|l| l.size).sum::<i64>(),
                created_at: config
                    .created
                    .as_deref()
                    .and_then(|c| DateTime::parse_from_rfc3339(c).ok())
                    .map(|c| c.with_timezone(&Utc)),
                labels: config.config.and_then(|c| c.labels).unwrap_or_default(),
            }))
        })
        .await
    }

    async fn is_repo_image_exists(&self, raw: &str) -> StevedoreResult<bool> {
        let reference = RepoReference::parse(raw)?;
        let tag = Self::tag_of(&reference, raw)?;
        let url = format!("{}/manifests/{}", self.base_url(&reference), tag);

        self.blocking(&format!("check {}", raw), move |agent| {
            let resp = agent
                .head(&url)
                .header("Accept", &format!("{}, {}", OCI_MANIFEST, DOCKER_MANIFEST))
                .call()
                .map_err(|e| e.to_string())?;
            match resp.status().as_u16() {
                200 => Ok(true),
                404 => Ok(false),
                status => Err(format!("status {}", status)),
            }
        })
        .await
    }

    async fn push_marker_image(
        &self,
        raw: &str,
        labels: &HashMap<String, String>,
    ) -> StevedoreResult<()> {
        let reference = RepoReference::parse(raw)?;
        let tag = Self::tag_of(&reference, raw)?;
        let base = self.base_url(&reference);
        let origin = base[..base.find("/v2/").unwrap_or(base.len())].to_string();

        let config = serde_json::to_vec(&json!({
            "architecture": "amd64",
            "os": "linux",
            "created": Utc::now().to_rfc3339(),
            "config": { "Labels": labels },
            "rootfs": { "type": "layers", "diff_ids": [] },
        }))?;
        let config_digest = sha256_digest(&config);
        let manifest = serde_json::to_vec(&json!({
            "schemaVersion": 2,
            "mediaType": OCI_MANIFEST,
            "config": Descriptor {
                media_type: Some(OCI_CONFIG.to_string()),
                digest: config_digest.clone(),
                size: config.len() as i64,
            },
            "layers": [],
        }))?;

        self.blocking(&format!("push {}", raw), move |agent| {
            let mut resp = agent
                .post(&format!("{}/blobs/uploads/", base))
                .send_empty()
                .map_err(|e| e.to_string())?;
            if resp.status().as_u16() != 202 {
                let body = resp.body_mut().read_to_string().unwrap_or_default();
                return Err(format!("blob upload status {}: {}", resp.status().as_u16(), body.trim()));
            }
            let location = resp
                .headers()
                .get("Location")
                .and_then(|v| v.to_str().ok())
                .ok_or("blob upload without location")?
                .to_string();
            let location = if location.starts_with('/') {
                format!("{}{}", origin, location)
            } else {
                location
            };
            let separator = if location.contains('?') { '&' } else { '?' };

            let resp = agent
                .put(&format!("{}{}digest={}", location, separator, config_digest))
                .header("Content-Type", "application/octet-stream")
                .send(&config[..])
                .map_err(|e| e.to_string())?;
            if resp.status().as_u16() != 201 {
                return Err(format!("blob commit status {}", resp.status().as_u16()));
            }

            let mut resp = agent
                .put(&format!("{}/manifests/{}", base, tag))
                .header("Content-Type", OCI_MANIFEST)
                .send(&manifest[..])
                .map_err(|e| e.to_string())?;
            if resp.status().as_u16() != 201 {
                let body = resp.body_mut().read_to_string().unwrap_or_default();
                return Err(format!("manifest status {}: {}", resp.status().as_u16(), body.trim()));
            }
            Ok(())
        })
        .await?;

        info!("Pushed marker image {}", raw);
        Ok(())
    }

    async fn delete_repo_image(&self, image: &ImageInfo) -> StevedoreResult<()> {
        let reference = RepoReference::parse(&image.repository)?;
        let url = format!("{}/manifests/{}", self.base_url(&reference), image.id);
        let name = image.log_name().to_string();

        self.blocking(&format!("delete {}", name), move |agent| {
            let resp = agent.delete(&url).call().map_err(|e| e.to_string())?;
            match resp.status().as_u16() {
                200 | 202 | 404 => Ok(()),
                status => Err(format!("status {}", status)),
            }
        })
        .await?;

        info!("Deleted repo image {}", image.log_name());
        Ok(())
    }

    async fn create_repo(&self, repository: &str) -> StevedoreResult<()> {
        debug!("Repository {} is created on first push", repository);
        Ok(())
    }

    async fn delete_repo(&self, repository: &str) -> StevedoreResult<()> {
        debug!("Registry does not support deleting repository {}", repository);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "distribution"
    }
}
