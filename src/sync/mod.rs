//! Synchronization service
//!
//! Shares one stages storage cache between hosts. Every cache operation is a
//! JSON `POST` whose response carries `err`, `null` on success. Lookup
//! responses also carry `found` and `stages`, mirroring the
//! `Option<Vec<StageId>>` lookup result.
//!
//! | Endpoint | Request fields |
//! |----------|----------------|
//! | `/get-all-stages` | `projectName` |
//! | `/delete-all-stages` | `projectName` |
//! | `/get-stages-by-digest` | `projectName`, `dependenciesDigest` |
//! | `/store-stages-by-digest` | `projectName`, `dependenciesDigest`, `stages` |
//! | `/delete-stages-by-digest` | `projectName`, `dependenciesDigest` |

mod server;

pub use server::{router, serve, serve_listener};

use crate::error::{StevedoreError, StevedoreResult};
use crate::stage::StageId;
use serde::{Deserialize, Serialize};

pub const GET_ALL_STAGES_PATH: &str = "/get-all-stages";
pub const DELETE_ALL_STAGES_PATH: &str = "/delete-all-stages";
pub const GET_STAGES_BY_DIGEST_PATH: &str = "/get-stages-by-digest";
pub const STORE_STAGES_BY_DIGEST_PATH: &str = "/store-stages-by-digest";
pub const DELETE_STAGES_BY_DIGEST_PATH: &str = "/delete-stages-by-digest";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectRequest {
    #[serde(rename = "projectName")]
    pub project_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DigestRequest {
    #[serde(rename = "projectName")]
    pub project_name: String,
    #[serde(rename = "dependenciesDigest")]
    pub dependencies_digest: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreStagesRequest {
    #[serde(rename = "projectName")]
    pub project_name: String,
    #[serde(rename = "dependenciesDigest")]
    pub dependencies_digest: String,
    #[serde(default)]
    pub stages: Vec<StageId>,
}

/// Response of lookups
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StagesResponse {
    pub err: Option<String>,
    #[serde(default)]
    pub found: bool,
    #[serde(default)]
    pub stages: Option<Vec<StageId>>,
}

impl StagesResponse {
    pub fn from_result(result: StevedoreResult<Option<Vec<StageId>>>) -> Self {
        match result {
            Ok(Some(stages)) => Self {
                err: None,
                found: true,
                stages: Some(stages),
            },
            Ok(None) => Self::default(),
            Err(e) => Self {
                err: Some(e.to_string()),
                ..Self::default()
            },
        }
    }

    pub fn into_result(self) -> StevedoreResult<Option<Vec<StageId>>> {
        if let Some(err) = self.err {
            return Err(StevedoreError::Remote(err));
        }
        Ok(self.found.then(|| self.stages.unwrap_or_default()))
    }
}

/// Response of mutations
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrResponse {
    pub err: Option<String>,
}

impl ErrResponse {
    pub fn from_result(result: StevedoreResult<()>) -> Self {
        Self {
            err: result.err().map(|e| e.to_string()),
        }
    }

    pub fn into_result(self) -> StevedoreResult<()> {
        match self.err {
            Some(err) => Err(StevedoreError::Remote(err)),
            None => Ok(()),
        }
    }
}
