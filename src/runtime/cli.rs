//! Image runtime driven through a docker-compatible CLI
//!
//! Works with `docker` and `podman`, both accept the same subcommands and
//! output templates for everything used here.

use crate::error::{StevedoreError, StevedoreResult};
use crate::runtime::{ContainerInfo, ImageFilter, ImageRuntime};
use crate::stage::{parse_repository_and_tag, ImageInfo};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info};

/// Two zero blocks, the smallest valid tar archive
const EMPTY_TAR_LEN: usize = 1024;

/// Container runtime using the docker or podman CLI
pub struct CliImageRuntime {
    binary: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectConfig {
    #[serde(default)]
    labels: Option<HashMap<String, String>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ImageInspect {
    id: String,
    #[serde(default)]
    size: i64,
    #[serde(default)]
    created: Option<String>,
    #[serde(default)]
    config: Option<InspectConfig>,
}

impl ImageInspect {
    fn into_info(self, name: &str) -> ImageInfo {
        let (repository, tag) = if name.is_empty() || name == "<none>:<none>" {
            ("<none>", "<none>")
        } else {
            parse_repository_and_tag(name)
        };
        ImageInfo {
            name: name.to_string(),
            repository: repository.to_string(),
            tag: tag.to_string(),
            size: self.size,
            created_at: self
                .created
                .as_deref()
                .and_then(|c| DateTime::parse_from_rfc3339(c).ok())
                .map(|c| c.with_timezone(&Utc)),
            labels: self.config.and_then(|c| c.labels).unwrap_or_default(),
            id: self.id,
        }
    }
}

fn is_missing_image(stderr: &str) -> bool {
    let stderr = stderr.to_lowercase();
    stderr.contains("no such image") || stderr.contains("image not known")
}

impl CliImageRuntime {
    /// Create a runtime for `binary`, e.g. `docker` or `podman`
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    pub fn binary(&self) -> &str {
        &self.binary
    }

    /// Execute a runtime command and return the output
    async fn exec(&self, args: &[&str]) -> StevedoreResult<std::process::Output> {
        debug!("Executing: {} {:?}", self.binary, args);

        Command::new(&self.binary)
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| StevedoreError::command_failed(format!("{} {:?}", self.binary, args), e))
    }

    /// Execute and fail on a non-zero exit, returning stdout
    async fn exec_ok(&self, operation: &str, args: &[&str]) -> StevedoreResult<String> {
        let output = self.exec(args).await?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).to_string())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(StevedoreError::command_exec(
                format!("{} {}", self.binary, operation),
                stderr.trim(),
            ))
        }
    }

    async fn inspect_many(&self, references: &[&str]) -> StevedoreResult<Vec<ImageInspect>> {
        let mut args = vec!["image", "inspect"];
        args.extend_from_slice(references);
        let stdout = self.exec_ok("image inspect", &args).await?;
        Ok(serde_json::from_str(&stdout)?)
    }
}

impl Default for CliImageRuntime {
    fn default() -> Self {
        Self::new("docker")
    }
}

#[async_trait]
impl ImageRuntime for CliImageRuntime {
    async fn image_exists(&self, reference: &str) -> StevedoreResult<bool> {
        Ok(self.inspect_image(reference).await?.is_some())
    }

    async fn inspect_image(&self, reference: &str) -> StevedoreResult<Option<ImageInfo>> {
        let output = self.exec(&["image", "inspect", reference]).await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if is_missing_image(&stderr) {
                return Ok(None);
            }
            return Err(StevedoreError::command_exec(
                format!("{} image inspect", self.binary),
                stderr.trim(),
            ));
        }

        let inspects: Vec<ImageInspect> = serde_json::from_slice(&output.stdout)?;
        Ok(inspects.into_iter().next().map(|i| i.into_info(reference)))
    }

    async fn list_images(&self, filter: &ImageFilter) -> StevedoreResult<Vec<ImageInfo>> {
        let mut args: Vec<String> = vec![
            "image".to_string(),
            "ls".to_string(),
            "--no-trunc".to_string(),
            "--format".to_string(),
            "{{.ID}}\t{{.Repository}}:{{.Tag}}".to_string(),
        ];
        if let Some(reference) = &filter.reference {
            args.push("--filter".to_string());
            args.push(format!("reference={}", reference));
        }
        for (key, value) in &filter.labels {
            args.push("--filter".to_string());
            args.push(format!("label={}={}", key, value));
        }

        let args_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let stdout = self.exec_ok("image ls", &args_refs).await?;

        let listed: Vec<(&str, &str)> = stdout
            .lines()
            .filter_map(|line| line.split_once('\t'))
            .collect();
        if listed.is_empty() {
            return Ok(Vec::new());
        }

        let mut seen = HashSet::new();
        let ids: Vec<&str> = listed
            .iter()
            .map(|(id, _)| *id)
            .filter(|id| seen.insert(*id))
            .collect();

        let by_id: HashMap<String, ImageInspect> = self
            .inspect_many(&ids)
            .await?
            .into_iter()
            .map(|i| (i.id.clone(), i))
            .collect();

        let images: Vec<ImageInfo> = listed
            .into_iter()
            .map(|(id, name)| {
                let inspect = by_id.get(id).cloned().unwrap_or_else(|| ImageInspect {
                    id: id.to_string(),
                    size: 0,
                    created: None,
                    config: None,
                });
                inspect.into_info(name)
            })
            .collect();
        Ok(images)
    }

    async fn create_marker_image(
        &self,
        name: &str,
        labels: &HashMap<String, String>,
    ) -> StevedoreResult<()> {
        let mut args: Vec<String> = vec!["import".to_string()];
        for (key, value) in labels {
            args.push("--change".to_string());
            args.push(format!("LABEL {}={}", key, value));
        }
        args.push("-".to_string());
        args.push(name.to_string());
        debug!("Executing: {} {:?}", self.binary, args);

        let mut child = Command::new(&self.binary)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| StevedoreError::command_failed(format!("{} import", self.binary), e))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(&[0u8; EMPTY_TAR_LEN])
                .await
                .map_err(|e| StevedoreError::io("writing empty image archive", e))?;
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| StevedoreError::command_failed(format!("{} import", self.binary), e))?;

        if output.status.success() {
            debug!("Created marker image {}", name);
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(StevedoreError::command_exec(
                format!("{} import", self.binary),
                stderr.trim(),
            ))
        }
    }

    async fn remove_images(&self, references: &[String], force: bool) -> StevedoreResult<()> {
        if references.is_empty() {
            return Ok(());
        }

        let mut args = vec!["rmi"];
        if force {
            args.push("--force");
        }
        args.extend(references.iter().map(String::as_str));

        self.exec_ok("rmi", &args).await?;
        Ok(())
    }

    async fn tag_image(&self, source: &str, target: &str) -> StevedoreResult<()> {
        debug!("Tagging {} as {}", source, target);
        self.exec_ok("tag", &["tag", source, target]).await?;
        Ok(())
    }

    async fn push_image(&self, name: &str) -> StevedoreResult<()> {
        info!("Pushing image: {}", name);
        self.exec_ok("push", &["push", name]).await?;
        Ok(())
    }

    async fn pull_image(&self, name: &str) -> StevedoreResult<()> {
        info!("Pulling image: {}", name);
        self.exec_ok("pull", &["pull", name]).await?;
        Ok(())
    }

    async fn list_containers_by_ancestor(
        &self,
        image_ids: &[String],
    ) -> StevedoreResult<Vec<ContainerInfo>> {
        if image_ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut args: Vec<String> = vec![
            "ps".to_string(),
            "--all".to_string(),
            "--quiet".to_string(),
            "--no-trunc".to_string(),
        ];
        for id in image_ids {
            args.push("--filter".to_string());
            args.push(format!("ancestor={}", id));
        }
        let args_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let stdout = self.exec_ok("ps", &args_refs).await?;

        let ids: Vec<&str> = stdout.lines().map(str::trim).filter(|l| !l.is_empty()).collect();
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut inspect_args = vec![
            "container",
            "inspect",
            "--format",
            "{{.Id}}\t{{.Name}}\t{{.Image}}",
        ];
        inspect_args.extend(ids);
        let stdout = self.exec_ok("container inspect", &inspect_args).await?;

        Ok(stdout
            .lines()
            .filter_map(|line| {
                let mut parts = line.splitn(3, '\t');
                let id = parts.next()?.to_string();
                let name = parts.next()?.to_string();
                let image_id = parts.next()?.trim().to_string();
                Some(ContainerInfo {
                    id,
                    names: vec![name],
                    image_id,
                })
            })
            .collect())
    }

    async fn remove_container(&self, id: &str, force: bool) -> StevedoreResult<()> {
        debug!("Removing container: {}", id);

        let mut args = vec!["rm"];
        if force {
            args.push("--force");
        }
        args.push(id);

        let output = self.exec(&args).await?;
        if output.status.success() {
            Ok(())
        } else {
            // Ignore error if container doesn't exist
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.to_lowercase().contains("no such container") {
                Ok(())
            } else {
                Err(StevedoreError::command_exec(
                    format!("{} rm", self.binary),
                    stderr.trim(),
                ))
            }
        }
    }

    fn runtime_name(&self) -> &'static str {
        "CLI"
    }
}
