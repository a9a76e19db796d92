//! Command implementations for the CLI
//!
//! SBIO pattern: Commands return Results, I/O is handled by caller

use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Deserialize;
use thiserror::Error;

use super::display::*;
use super::{AllocateArgs, Commands, DeallocateArgs, ListArgs, RemoveArgs};
use crate::client::{ClientError, NodeManagerApi};
use crate::config::{load_config_from, ConfigError, PoolConfig};
use crate::pool::{AllocationRequest, NodeDescriptor};
use crate::server::RemoveNodesRequest;

/// Errors that can occur during command execution
#[derive(Error, Debug)]
pub enum CommandError {
    #[error("Config error: {0}")]
    Config(String),

    #[error(transparent)]
    ConfigFile(#[from] ConfigError),

    #[error(transparent)]
    Client(#[from] ClientError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid arguments: {0}")]
    Invalid(String),
}

/// Result type for commands
pub type CommandResult<T> = Result<T, CommandError>;

// ============================================================================
// Config & manifests
// ============================================================================

/// Load the config from `path`, or the default location
pub fn load_cli_config(path: Option<&Path>) -> CommandResult<PoolConfig> {
    let config = match path {
        Some(path) => load_config_from(path)?,
        None => crate::config::load_config()?,
    };
    Ok(config)
}

/// The URL flag wins over the configured one
pub fn resolve_url(flag: Option<&str>, config: &PoolConfig) -> String {
    flag.map(String::from)
        .unwrap_or_else(|| config.server.url.clone())
}

/// Parse a manifest as YAML when the extension says so, JSON otherwise
pub fn load_manifest<T: DeserializeOwned>(path: &Path) -> CommandResult<T> {
    let content = std::fs::read_to_string(path)?;

    let value: T = if path.extension().and_then(|e| e.to_str()) == Some("yaml")
        || path.extension().and_then(|e| e.to_str()) == Some("yml")
    {
        serde_yaml::from_str(&content).map_err(|e| CommandError::Config(e.to_string()))?
    } else {
        serde_json::from_str(&content)?
    };

    Ok(value)
}

/// Node files are either a bare list or `{ nodes: [...] }`
#[derive(Deserialize)]
#[serde(untagged)]
enum DescriptorFile {
    List(Vec<NodeDescriptor>),
    Wrapped { nodes: Vec<NodeDescriptor> },
}

pub fn load_descriptors(path: &Path) -> CommandResult<Vec<NodeDescriptor>> {
    let file: DescriptorFile = load_manifest(path)?;
    Ok(match file {
        DescriptorFile::List(nodes) | DescriptorFile::Wrapped { nodes } => nodes,
    })
}

// ============================================================================
// Request building (Pure business logic)
// ============================================================================

/// Parse `TYPE=N`
pub fn parse_count(arg: &str) -> CommandResult<(String, i64)> {
    let (node_type, count) = arg
        .split_once('=')
        .ok_or_else(|| CommandError::Invalid(format!("expected TYPE=N, got '{}'", arg)))?;
    let node_type = node_type.trim();
    if node_type.is_empty() {
        return Err(CommandError::Invalid(format!("missing type in '{}'", arg)));
    }
    let count = count
        .trim()
        .parse::<i64>()
        .map_err(|_| CommandError::Invalid(format!("bad count in '{}'", arg)))?;
    Ok((node_type.to_string(), count))
}

pub fn allocation_request(args: &AllocateArgs) -> CommandResult<AllocationRequest> {
    if let Some(path) = &args.file {
        let mut request: AllocationRequest = load_manifest(path)?;
        request.consumer = args.consumer.clone();
        if args.exclusive {
            request.exclusive = true;
        }
        return Ok(request);
    }

    let mut request = AllocationRequest::new(args.consumer.clone())
        .with_exclusive(args.exclusive)
        .with_supported_types(args.supported_types.iter().cloned());
    for arg in &args.counts {
        let (node_type, count) = parse_count(arg)?;
        request = request.with_count(node_type, count);
    }
    if let Some(total) = args.total {
        request = request.with_total(total);
    }
    Ok(request)
}

pub fn remove_request(args: &RemoveArgs) -> CommandResult<RemoveNodesRequest> {
    if !args.all && args.ids.is_empty() && args.patterns.is_empty() {
        return Err(CommandError::Invalid(
            "give node ids, --pattern, or --all".to_string(),
        ));
    }
    Ok(RemoveNodesRequest {
        ids: args.ids.clone(),
        patterns: args.patterns.clone(),
        all: args.all,
        force: args.force,
    })
}

// ============================================================================
// Remote commands
// ============================================================================

/// Run a client-side command and render its output
///
/// `serve` is handled by the binary and rejected here.
pub async fn execute(command: &Commands, api: &dyn NodeManagerApi) -> CommandResult<String> {
    match command {
        Commands::Serve(_) => Err(CommandError::Invalid(
            "serve runs in-process, not against a service".to_string(),
        )),
        Commands::Add(args) => {
            let nodes = load_descriptors(&args.file)?;
            let report = api.add_nodes(nodes, args.validate).await?;
            Ok(format_add_report(&report))
        }
        Commands::Remove(args) => {
            let report = api.remove_nodes(&remove_request(args)?).await?;
            Ok(format_remove_report(&report))
        }
        Commands::List(args) => list(args, api).await,
        Commands::Summary => Ok(format_summary(&api.summary().await?)),
        Commands::Allocate(args) => {
            let outcome = api.allocate(&allocation_request(args)?).await?;
            if args.json {
                return Ok(serde_json::to_string_pretty(&outcome)?);
            }
            Ok(format_outcome(&outcome))
        }
        Commands::Deallocate(DeallocateArgs { consumer, nodes }) => {
            match api.deallocate(consumer, nodes.clone()).await {
                Ok(report) => Ok(format_deallocation(&report)),
                Err(ClientError::InProgress(consumer)) => Ok(format!(
                    "Deallocation for '{}' already in progress\n",
                    consumer
                )),
                Err(e) => Err(e.into()),
            }
        }
        Commands::Exchange(args) => {
            let outcome = api.exchange(&allocation_request(args)?).await?;
            if args.json {
                return Ok(serde_json::to_string_pretty(&outcome)?);
            }
            Ok(format!(
                "{}{}",
                format_deallocation(&outcome.released),
                format_outcome(&outcome.allocated)
            ))
        }
        Commands::Reset(args) => {
            let status = api.reset(args.active_consumers.clone()).await?;
            Ok(format_status(&status))
        }
        Commands::RefreshCache => Ok(format_status(&api.refresh_cache().await?)),
    }
}

async fn list(args: &ListArgs, api: &dyn NodeManagerApi) -> CommandResult<String> {
    let nodes = api
        .list_nodes(args.consumer.as_deref(), args.pattern.as_deref())
        .await?;
    if args.json {
        return Ok(serde_json::to_string_pretty(&nodes)?);
    }
    Ok(format_node_list(&nodes))
}
