//! CLI argument definitions using clap derive

use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;

/// Kiln - build-job dependency fetcher
///
/// Resolves a build job's binary dependencies from its repository search
/// path, with a content-addressed local cache and preinstall-image reuse.
#[derive(Parser, Debug)]
#[command(name = "kiln")]
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
    #[arg(short, long, global = true, env = "KILN_CONFIG")]
    pub config: Option<PathBuf>,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Resolve a job's dependencies into a package directory
    Resolve(ResolveArgs),

    /// Inspect or maintain the binary cache
    Cache(CacheArgs),

    /// Show or initialize configuration
    Config(ConfigArgs),
}

/// Arguments for the resolve command
#[derive(Parser, Debug)]
pub struct ResolveArgs {
    /// Job description file (TOML)
    pub job: PathBuf,

    /// Package directory for fetched binaries (defaults to ./<package>)
    #[arg(short, long)]
    pub pkgdir: Option<PathBuf>,

    /// Repository server, overriding job and config
    #[arg(long)]
    pub server: Option<String>,

    /// Cache directory, overriding the configuration
    #[arg(long, conflicts_with = "no_cache")]
    pub cache_dir: Option<PathBuf>,

    /// Bypass the binary cache entirely
    #[arg(long)]
    pub no_cache: bool,
}

/// Arguments for the cache command
#[derive(Parser, Debug)]
pub struct CacheArgs {
    #[command(subcommand)]
    pub action: CacheAction,
}

/// Cache maintenance actions
#[derive(Subcommand, Debug)]
pub enum CacheAction {
    /// Show cache usage against its budget
    Stats,

    /// Evict entries until the cache fits its budget
    Gc,

    /// Remove every cached entry
    Clear {
        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },

    /// Print the cache directory path
    Path,
}

/// Arguments for the config command
#[derive(Parser, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub action: ConfigAction,
}

/// Configuration actions
#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Print the active configuration as TOML
    Show,

    /// Print the configuration file path
    Path,

    /// Write a default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(short, long)]
        force: bool,
    },
}
