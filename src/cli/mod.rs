//! CLI module for nodepool
//!
//! Subcommands:
//! - `nodepool serve` - Run the nodemanager service over the configured store
//! - `nodepool add` / `remove` / `reset` - Maintain the inventory
//! - `nodepool list` / `summary` - Inspect nodes and usage
//! - `nodepool allocate` / `deallocate` / `exchange` - Claim and release nodes
//! - `nodepool refresh-cache` - Reload the service's node cache

use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;

mod commands;
mod display;

pub use commands::*;
pub use display::*;

#[derive(Parser, Debug)]
#[command(name = "nodepool")]
#[command(about = "Shared node inventory with race-free allocation")]
#[command(version)]
pub struct Cli {
    /// Enable verbose logging output (-v, -vv, -vvv)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Path to config file (default: ~/.nodepool/config.yaml)
    #[arg(long, global = true, env = "NODEPOOL_CONFIG")]
    pub config: Option<PathBuf>,

    /// Nodemanager URL (default: from config)
    #[arg(long, global = true, env = "NODEPOOL_URL")]
    pub url: Option<String>,

    /// Path to a .env file loaded before anything else
    #[arg(long, global = true, value_name = "FILE")]
    pub env_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the nodemanager service
    Serve(ServeArgs),

    /// Add nodes from a JSON or YAML file
    Add(AddArgs),

    /// Remove nodes by id, pattern, or all of them
    Remove(RemoveArgs),

    /// List nodes
    #[command(visible_alias = "ls")]
    List(ListArgs),

    /// Show per-type usage
    Summary,

    /// Allocate nodes to a consumer
    Allocate(AllocateArgs),

    /// Release a consumer's nodes
    Deallocate(DeallocateArgs),

    /// Release then allocate under one lock hold
    Exchange(AllocateArgs),

    /// Clear ownership of every consumer not listed
    Reset(ResetArgs),

    /// Reload the service's node cache
    RefreshCache,
}

/// Arguments for the serve command
#[derive(Parser, Debug)]
pub struct ServeArgs {
    /// Bind address for the server (default: from config)
    #[arg(long)]
    pub bind_addr: Option<String>,

    /// Port to listen on (default: from config, 5510)
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Use an in-memory store instead of the configured one
    #[arg(long)]
    pub in_memory: bool,

    /// Seed for candidate selection (reproducible allocations)
    #[arg(long)]
    pub seed: Option<u64>,
}

#[derive(Parser, Debug)]
pub struct AddArgs {
    /// Node descriptors (JSON or YAML list)
    pub file: PathBuf,

    /// Run the sync check on each node before accepting it
    #[arg(long)]
    pub validate: bool,
}

#[derive(Parser, Debug)]
pub struct RemoveArgs {
    /// Node ids to remove
    pub ids: Vec<String>,

    /// Glob patterns matched against node ids
    #[arg(short = 'P', long = "pattern")]
    pub patterns: Vec<String>,

    /// Remove every node
    #[arg(long, conflicts_with_all = ["ids", "patterns"])]
    pub all: bool,

    /// Remove nodes even while allocated
    #[arg(long)]
    pub force: bool,
}

#[derive(Parser, Debug)]
pub struct ListArgs {
    /// Only nodes held by this consumer
    #[arg(short, long)]
    pub consumer: Option<String>,

    /// Comma-separated glob patterns
    #[arg(short = 'P', long)]
    pub pattern: Option<String>,

    /// Print JSON instead of a table
    #[arg(long)]
    pub json: bool,
}

#[derive(Parser, Debug)]
pub struct AllocateArgs {
    /// Consumer name
    pub consumer: String,

    /// Per-type counts as TYPE=N (N may be -1 for "all available")
    #[arg(short = 'n', long = "nodes", value_name = "TYPE=N")]
    pub counts: Vec<String>,

    /// Total to split across supported types
    #[arg(short, long)]
    pub total: Option<usize>,

    /// Restrict proportional or fill allocation to these types
    #[arg(short = 's', long = "supported", value_delimiter = ',')]
    pub supported_types: Vec<String>,

    /// Claim the nodes exclusively
    #[arg(long)]
    pub exclusive: bool,

    /// Full request as JSON or YAML; flags above are ignored when set
    #[arg(short, long, conflicts_with_all = ["counts", "total", "supported_types"])]
    pub file: Option<PathBuf>,

    /// Print JSON instead of a table
    #[arg(long)]
    pub json: bool,
}

#[derive(Parser, Debug)]
pub struct DeallocateArgs {
    /// Consumer name
    pub consumer: String,

    /// Only release these node ids
    #[arg(long, value_delimiter = ',')]
    pub nodes: Option<Vec<String>>,
}

#[derive(Parser, Debug)]
pub struct ResetArgs {
    /// Consumers whose ownership survives
    #[arg(value_delimiter = ',')]
    pub active_consumers: Vec<String>,
}
