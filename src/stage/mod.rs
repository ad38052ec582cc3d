//! Stage identity and descriptor model
//!
//! A stage artifact is addressed by the digest of its declared inputs plus a
//! millisecond-timestamp unique id. Every other module operates on these
//! shapes.

pub mod naming;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Label keys and naming prefixes shared by every backend
pub mod labels {
    /// Marks an image as built by stevedore, value is the project name
    pub const STEVEDORE: &str = "stevedore";
    /// Cache layout version the image was built with
    pub const CACHE_VERSION: &str = "stevedore-cache-version";
    /// Stage dependencies digest
    pub const STAGE_DIGEST: &str = "stevedore-stage-digest";
    /// Current cache layout version
    pub const BUILD_CACHE_VERSION: &str = "1.2";
}

/// Primary key of a stored stage artifact.
///
/// `unique_id` is derived from the wall clock in milliseconds. Hosts with
/// skewed clocks can produce out-of-order or colliding ids for one digest.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StageId {
    #[serde(rename = "dependenciesDigest")]
    pub digest: String,
    #[serde(rename = "uniqueID")]
    pub unique_id: i64,
}

impl StageId {
    pub fn new(digest: impl Into<String>, unique_id: i64) -> Self {
        Self {
            digest: digest.into(),
            unique_id,
        }
    }

    /// Allocate a unique id for a new stage from the current time
    pub fn new_unique_id() -> i64 {
        Utc::now().timestamp_millis()
    }

    /// Interpret the unique id as the time the stage was stored
    pub fn unique_id_as_time(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_millis_opt(self.unique_id).single()
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "digest:{} uniqueID:{}", self.digest, self.unique_id)
    }
}

/// Backend metadata describing one concrete stored image
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImageInfo {
    /// Image id (local runtime) or manifest digest (registry)
    pub id: String,
    /// Full reference, `repository:tag`
    pub name: String,
    pub repository: String,
    pub tag: String,
    pub size: i64,
    pub created_at: Option<DateTime<Utc>>,
    pub labels: HashMap<String, String>,
}

impl ImageInfo {
    /// Name suitable for log lines, falls back to the id for dangling images
    pub fn log_name(&self) -> &str {
        if self.name.is_empty() || self.name == "<none>:<none>" {
            &self.id
        } else {
            &self.name
        }
    }
}

/// A stage id together with the image that stores it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageDescription {
    #[serde(rename = "stageID")]
    pub stage_id: StageId,
    pub info: ImageInfo,
}

/// One client registration event, append-only
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientIdRecord {
    #[serde(rename = "clientID")]
    pub client_id: String,
    #[serde(rename = "timestampMillisec")]
    pub timestamp_millisec: i64,
}

impl ClientIdRecord {
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            timestamp_millisec: Utc::now().timestamp_millis(),
        }
    }
}

impl fmt::Display for ClientIdRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "clientID:{} tsMillisec:{}",
            self.client_id, self.timestamp_millisec
        )
    }
}

/// Split a `repository:tag` reference. The tag separator is the last colon
/// that comes after the last slash, so registry ports are not mistaken for tags.
pub fn parse_repository_and_tag(reference: &str) -> (&str, &str) {
    let slash = reference.rfind('/').map(|i| i + 1).unwrap_or(0);
    match reference[slash..].rfind(':') {
        Some(i) => (&reference[..slash + i], &reference[slash + i + 1..]),
        None => (reference, "latest"),
    }
}
