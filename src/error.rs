//! Error types for Stevedore
//!
//! All modules use `StevedoreResult<T>` as their return type.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for Stevedore operations
pub type StevedoreResult<T> = Result<T, StevedoreError>;

/// Tip appended to errors raised when an image cannot be deleted because a
/// container still uses it. Callers detect the condition by this suffix.
pub const IMAGE_USED_BY_CONTAINER_TIP: &str =
    "Use --force option to remove all containers that are based on deleting images";

/// All errors that can occur in Stevedore
#[derive(Error, Debug)]
pub enum StevedoreError {
    // Configuration errors
    #[error("Invalid configuration at {path}: {reason}")]
    ConfigInvalid { path: PathBuf, reason: String },

    #[error("Failed to create config directory {path}: {source}")]
    ConfigDirCreate {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Unsupported {kind} backend: {name}")]
    UnsupportedBackend { kind: String, name: String },

    // Naming errors
    #[error("unexpected tag format {tag}: {reason}")]
    UnexpectedTagFormat { tag: String, reason: String },

    #[error("malformed stage tag {0}: missing digest separator")]
    MalformedStageTag(String),

    // Storage errors
    #[error("cannot remove image {image} used by container {container}\n{tip}", tip = IMAGE_USED_BY_CONTAINER_TIP)]
    ImageUsedByContainer { image: String, container: String },

    #[error("Registry error: {operation}: {reason}")]
    Registry { operation: String, reason: String },

    #[error("Image runtime error: {operation}: {reason}")]
    Runtime { operation: String, reason: String },

    // Cache errors
    #[error("Update conflict on {0}")]
    Conflict(String),

    #[error("Synchronization server {endpoint}: {reason}")]
    Http { endpoint: String, reason: String },

    #[error("{0}")]
    Remote(String),

    // Lock errors
    #[error("Unable to acquire lock {name}: {reason}")]
    Lock { name: String, reason: String },

    #[error("Timed out waiting for lock {0}")]
    LockTimeout(String),

    #[error("Unknown lock handle for {0}")]
    LockNotHeld(String),

    // IO errors
    #[error("IO error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    // Process errors
    #[error("Command failed: {command}")]
    CommandFailed {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Command execution error: {command}, stderr: {stderr}")]
    CommandExecution { command: String, stderr: String },

    // Serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    // General errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    User(String),
}

impl StevedoreError {
    /// Create an IO error with context
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Create a command failed error
    pub fn command_failed(command: impl Into<String>, source: std::io::Error) -> Self {
        Self::CommandFailed {
            command: command.into(),
            source,
        }
    }

    /// Create a command execution error
    pub fn command_exec(command: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self::CommandExecution {
            command: command.into(),
            stderr: stderr.into(),
        }
    }

    /// Create a registry error
    pub fn registry(operation: impl Into<String>, reason: impl ToString) -> Self {
        Self::Registry {
            operation: operation.into(),
            reason: reason.to_string(),
        }
    }

    /// Create an image runtime error
    pub fn runtime(operation: impl Into<String>, reason: impl ToString) -> Self {
        Self::Runtime {
            operation: operation.into(),
            reason: reason.to_string(),
        }
    }

    /// Create an unexpected tag format error
    pub fn unexpected_tag(tag: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::UnexpectedTagFormat {
            tag: tag.into(),
            reason: reason.into(),
        }
    }

    /// Tag does not follow the stage naming convention and may be skipped
    pub fn is_unexpected_tag_format(&self) -> bool {
        matches!(self, Self::UnexpectedTagFormat { .. })
    }

    /// Optimistic concurrency conflict, the caller should retry
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }

    /// Get actionable hint for the error
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            Self::ImageUsedByContainer { .. } => {
                Some("Remove the container first or allow removing containers that use the image")
            }
            Self::LockTimeout(_) => Some("Another build of this project holds the lock"),
            Self::Http { .. } => Some("Check that the synchronization server is running"),
            _ => None,
        }
    }
}

/// Whether an error (or its rendered message) reports an image deletion that
/// failed because a container still uses the image.
pub fn is_image_used_by_container_error(err: &StevedoreError) -> bool {
    err.to_string().ends_with(IMAGE_USED_BY_CONTAINER_TIP)
}
