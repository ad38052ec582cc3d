//! CLI command implementations

pub mod cache;
pub mod config;
pub mod serve;
pub mod stages;

pub use cache::execute as cache;
pub use config::execute as config;
pub use serve::execute as serve;
pub use stages::execute as stages;
