// msd — command-line bootstrap for an MSD node
//
// Loads the JSON node configuration, installs the logger, runs the node until
// Ctrl-C and shuts it down cleanly.

mod config;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use msd_core::cache::Service;
use msd_core::protocol::{Level, ProtocolEvent};
use msd_core::Msd;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Parser)]
#[command(name = "msd")]
#[command(about = "MSD — peer-to-peer service directory node", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file (defaults to the platform config directory)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a fresh configuration file
    Init {
        #[arg(long)]
        node_id: Option<String>,
        /// Start as the leader instead of discovering one
        #[arg(long)]
        leader: bool,
        /// Overwrite an existing file
        #[arg(short, long)]
        force: bool,
    },
    /// Print the configuration in use
    Config,
    /// Run the node until Ctrl-C
    Start {
        /// Local service to register, as `id` or `id:key=value;key=value`
        #[arg(short, long)]
        service: Vec<String>,
    },
    /// Join the network, run one template search and leave
    Browse {
        network: String,
        #[arg(default_value = "")]
        template: String,
        /// Seconds to wait for the node to settle
        #[arg(short, long, default_value = "10")]
        wait: u64,
    },
}

fn init_logging(level: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level)),
        )
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let path = config::resolve(cli.config.as_deref())?;

    match cli.command {
        Commands::Init {
            node_id,
            leader,
            force,
        } => cmd_init(&path, node_id, leader, force),
        Commands::Config => cmd_config(&path),
        Commands::Start { service } => cmd_start(&path, service).await,
        Commands::Browse {
            network,
            template,
            wait,
        } => cmd_browse(&path, &network, &template, wait).await,
    }
}

fn cmd_init(path: &Path, node_id: Option<String>, leader: bool, force: bool) -> Result<()> {
    if path.exists() && !force {
        anyhow::bail!(
            "{} already exists (use --force to overwrite)",
            path.display()
        );
    }
    let node_id = node_id.unwrap_or_else(config::generate_node_id);
    let node_config = config::initial(&node_id, leader);
    config::save(path, &node_config)?;

    println!("{} Configuration written", "✓".green());
    println!("  Node ID: {}", node_id.bright_cyan());
    println!("  File:    {}", path.display());
    println!();
    println!("{}", "Next steps:".bold());
    println!("  • Start node:  {}", "msd start".bright_green());
    println!(
        "  • With a service: {}",
        "msd start --service printer:kind=laser".bright_green()
    );
    Ok(())
}

fn cmd_config(path: &Path) -> Result<()> {
    let node_config = config::load(path)?;
    println!("{} {}", "Configuration".bold(), path.display().to_string().dimmed());
    println!("{}", serde_json::to_string_pretty(&node_config)?);
    Ok(())
}

/// `id` or `id:key=value;key=value`
fn parse_service(text: &str, owner: &str) -> Result<Service> {
    let (id, attributes) = text.split_once(':').unwrap_or((text, ""));
    if id.is_empty() {
        anyhow::bail!("Service without an id: {}", text);
    }
    let mut service = Service::new(id, owner);
    for pair in attributes.split(';').filter(|p| !p.is_empty()) {
        let (key, value) = pair
            .split_once('=')
            .with_context(|| format!("Expected key=value, got {}", pair))?;
        service = service.with_attribute(key.trim(), value.trim());
    }
    Ok(service)
}

fn print_event(event: &ProtocolEvent) {
    match event {
        ProtocolEvent::LevelChanged { network, from, to } => {
            println!("  {} {} {} → {}", "•".dimmed(), network, from, to);
        }
        ProtocolEvent::CacheUpdated { network, update_id } => {
            println!("{} {} cache updated (id {})", "↻".bright_blue(), network.bright_cyan(), update_id);
        }
        ProtocolEvent::LeaderElected { network, leader } => {
            println!("{} {} leader: {}", "✓".green(), network.bright_cyan(), leader.bright_yellow());
        }
        ProtocolEvent::SplitLeader { network, other } => {
            println!("{} {} second leader seen: {}", "⚠".bright_red(), network.bright_cyan(), other);
        }
        ProtocolEvent::PeerLeft { network, peer } => {
            println!("{} {} peer left: {}", "←".bright_blue(), network.bright_cyan(), peer);
        }
    }
}

async fn cmd_start(path: &Path, services: Vec<String>) -> Result<()> {
    let node_config = config::load(path)?;
    init_logging(&node_config.log_level);

    let services = services
        .iter()
        .map(|text| parse_service(text, &node_config.node_id))
        .collect::<Result<Vec<_>>>()?;

    let node = Msd::new(node_config).context("Failed to build node")?;
    let mut events = node.subscribe();

    println!("{}", "MSD — Starting...".bold());
    node.start().await.context("Failed to start node")?;
    println!("{} Node {} up on: {}", "✓".green(), node.node_id().bright_cyan(), node.started_networks().join(", "));

    for service in services {
        let id = service.id.clone();
        let update_id = node.register_service(service).await?;
        println!("{} Registered {} (update {})", "✓".green(), id.bright_cyan(), update_id);
    }
    println!("{}", "Press Ctrl-C to stop".dimmed());

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => print_event(&event),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "event display fell behind");
                }
                Err(_) => break,
            },
            signal = tokio::signal::ctrl_c() => {
                signal.context("Failed to listen for Ctrl-C")?;
                break;
            }
        }
    }

    println!();
    println!("{}", "Shutting down...".bold());
    node.shutdown().await;
    println!("{} Stopped", "✓".green());
    Ok(())
}

async fn cmd_browse(path: &Path, network: &str, template: &str, wait: u64) -> Result<()> {
    let node_config = config::load(path)?;
    init_logging(&node_config.log_level);

    let node = Msd::new(node_config).context("Failed to build node")?;
    node.start().await.context("Failed to start node")?;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(wait);
    while node.level(network) != Some(Level::WaitEvent) {
        if tokio::time::Instant::now() >= deadline {
            node.shutdown().await;
            anyhow::bail!(
                "Network {} did not settle within {}s (level {:?})",
                network,
                wait,
                node.level(network)
            );
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    let result = node.browse(network, template).await;
    node.shutdown().await;
    let found = result.context("Browse failed")?;

    if found.is_empty() {
        println!("{}", "No matching services.".dimmed());
        return Ok(());
    }
    println!("{} ({} found)", "Services".bold(), found.len());
    println!();
    for service in found {
        println!("  {} {} @ {}", "•".bright_green(), service.id.bright_cyan(), service.owner);
        for (key, value) in &service.attributes {
            println!("    {} = {}", key.dimmed(), value);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_service_with_attributes() {
        let service = parse_service("printer:kind=laser; color = no", "n1").unwrap();
        assert_eq!(service.id, "printer");
        assert_eq!(service.owner, "n1");
        assert_eq!(service.attributes.get("kind").map(String::as_str), Some("laser"));
        assert_eq!(service.attributes.get("color").map(String::as_str), Some("no"));
    }

    #[test]
    fn test_parse_bare_service() {
        let service = parse_service("scanner", "n1").unwrap();
        assert!(service.attributes.is_empty());
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(parse_service(":kind=laser", "n1").is_err());
        assert!(parse_service("printer:kind", "n1").is_err());
    }
}
