//! Stevedore - stages storage, cache and synchronization
//!
//! Keeps build stages in the local image runtime or a registry repository,
//! caches stage lookups per dependencies digest, serializes concurrent
//! builders through named locks and shares a cache between hosts over HTTP.

pub mod cache;
pub mod cli;
pub mod config;
pub mod error;
pub mod lock;
pub mod manager;
pub mod parallel;
pub mod registry;
pub mod runtime;
pub mod stage;
pub mod storage;
pub mod sync;
pub mod ui;

pub use error::{StevedoreError, StevedoreResult};
