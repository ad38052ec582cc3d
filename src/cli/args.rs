//! CLI argument definitions using clap derive

use clap::{ArgAction, Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;

/// Stevedore - stages storage, cache and synchronization service
#[derive(Parser, Debug)]
#[command(name = "stevedore")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Increase verbosity (-v info, -vv debug)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    /// Configuration file path
    #[arg(short, long, global = true, env = "STEVEDORE_CONFIG")]
    pub config: Option<PathBuf>,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Serve the configured stages storage cache over HTTP
    Serve(ServeArgs),

    /// Inspect or invalidate the stages storage cache
    Cache(CacheArgs),

    /// Query the stages storage
    Stages(StagesArgs),

    /// Show or initialize configuration
    Config(ConfigArgs),
}

/// Arguments for the serve command
#[derive(Parser, Debug)]
pub struct ServeArgs {
    /// Address to listen on
    #[arg(short, long, default_value = "127.0.0.1:55581")]
    pub listen: SocketAddr,
}

/// Arguments for the cache command
#[derive(Parser, Debug)]
pub struct CacheArgs {
    /// Project name
    #[arg(short, long)]
    pub project: String,

    #[command(subcommand)]
    pub action: CacheAction,
}

/// Cache actions
#[derive(Subcommand, Debug)]
pub enum CacheAction {
    /// Print cached stages of one digest
    Get {
        /// Dependencies digest
        digest: String,
    },

    /// Print every cached stage of the project
    GetAll,

    /// Drop the cache entry of one digest
    Delete {
        /// Dependencies digest
        digest: String,
    },

    /// Drop every cache entry of the project
    DeleteAll,
}

/// Arguments for the stages command
#[derive(Parser, Debug)]
pub struct StagesArgs {
    /// Project name
    #[arg(short, long)]
    pub project: String,

    /// Stages storage address, `:local` or a registry repository
    #[arg(long)]
    pub storage: Option<String>,

    #[command(subcommand)]
    pub action: StagesAction,
}

/// Stages actions
#[derive(Subcommand, Debug)]
pub enum StagesAction {
    /// List stages, of the given digests only when any are passed
    List {
        /// Dependencies digests
        digests: Vec<String>,
    },

    /// List managed images of the project
    ManagedImages,

    /// List client id records of the project
    Clients,
}

/// Arguments for the config command
#[derive(Parser, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub action: Option<ConfigAction>,
}

/// Config actions
#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Show current configuration
    Show,

    /// Show configuration file path
    Path,

    /// Write a default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(short, long)]
        force: bool,
    },
}
