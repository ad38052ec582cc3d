//! Client of the synchronization service cache

use crate::cache::StagesStorageCache;
use crate::error::{StevedoreError, StevedoreResult};
use crate::stage::StageId;
use crate::sync::{
    DigestRequest, ErrResponse, ProjectRequest, StagesResponse, StoreStagesRequest,
    DELETE_ALL_STAGES_PATH, DELETE_STAGES_BY_DIGEST_PATH, GET_ALL_STAGES_PATH,
    GET_STAGES_BY_DIGEST_PATH, STORE_STAGES_BY_DIGEST_PATH,
};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;
use std::time::Duration;
use tracing::debug;

/// Forwards every cache operation to a synchronization server
pub struct HttpStagesStorageCache {
    url: String,
    agent: ureq::Agent,
}

fn build_agent(timeout: Duration) -> ureq::Agent {
    ureq::Agent::config_builder()
        .timeout_global(Some(timeout))
        .http_status_as_error(false)
        .build()
        .into()
}

impl HttpStagesStorageCache {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into().trim_end_matches('/').to_string(),
            agent: build_agent(Duration::from_secs(30)),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.agent = build_agent(timeout);
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn post<Req, Resp>(&self, path: &str, request: &Req) -> StevedoreResult<Resp>
    where
        Req: Serialize,
        Resp: DeserializeOwned + Send + 'static,
    {
        let endpoint = format!("{}{}", self.url, path);
        let body = serde_json::to_string(request)?;
        let agent = self.agent.clone();
        debug!("POST {} {}", endpoint, body);

        let task_endpoint = endpoint.clone();
        let text = tokio::task::spawn_blocking(move || -> Result<String, String> {
            let mut response = agent
                .post(&task_endpoint)
                .header("Content-Type", "application/json")
                .send(body.as_str())
                .map_err(|e| e.to_string())?;

            let status = response.status();
            let text = response
                .body_mut()
                .read_to_string()
                .map_err(|e| e.to_string())?;
            if !status.is_success() {
                return Err(format!("status {}: {}", status.as_u16(), text.trim()));
            }
            Ok(text)
        })
        .await
        .map_err(|e| StevedoreError::Internal(format!("request task failed: {}", e)))?
        .map_err(|reason| StevedoreError::Http {
            endpoint: endpoint.clone(),
            reason,
        })?;

        serde_json::from_str(&text).map_err(|e| StevedoreError::Http {
            endpoint,
            reason: format!("invalid response: {}", e),
        })
    }
}

impl fmt::Display for HttpStagesStorageCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "http-client {}", self.url)
    }
}

#[async_trait]
impl StagesStorageCache for HttpStagesStorageCache {
    async fn get_all_stages(&self, project: &str) -> StevedoreResult<Option<Vec<StageId>>> {
        let request = ProjectRequest {
            project_name: project.to_string(),
        };
        self.post::<_, StagesResponse>(GET_ALL_STAGES_PATH, &request)
            .await?
            .into_result()
    }

    async fn delete_all_stages(&self, project: &str) -> StevedoreResult<()> {
        let request = ProjectRequest {
            project_name: project.to_string(),
        };
        self.post::<_, ErrResponse>(DELETE_ALL_STAGES_PATH, &request)
            .await?
            .into_result()
    }

    async fn get_stages_by_digest(
        &self,
        project: &str,
        digest: &str,
    ) -> StevedoreResult<Option<Vec<StageId>>> {
        let request = DigestRequest {
            project_name: project.to_string(),
            dependencies_digest: digest.to_string(),
        };
        self.post::<_, StagesResponse>(GET_STAGES_BY_DIGEST_PATH, &request)
            .await?
            .into_result()
    }

    async fn store_stages_by_digest(
        &self,
        project: &str,
        digest: &str,
        stages: &[StageId],
    ) -> StevedoreResult<()> {
        let request = StoreStagesRequest {
            project_name: project.to_string(),
            dependencies_digest: digest.to_string(),
            stages: stages.to_vec(),
        };
        self.post::<_, ErrResponse>(STORE_STAGES_BY_DIGEST_PATH, &request)
            .await?
            .into_result()
    }

    async fn delete_stages_by_digest(&self, project: &str, digest: &str) -> StevedoreResult<()> {
        let request = DigestRequest {
            project_name: project.to_string(),
            dependencies_digest: digest.to_string(),
        };
        self.post::<_, ErrResponse>(DELETE_STAGES_BY_DIGEST_PATH, &request)
            .await?
            .into_result()
    }
}
