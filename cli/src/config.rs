// Configuration file handling for the msd CLI
//
// Cross-platform location:
// - macOS: ~/Library/Application Support/msd/config.json
// - Linux: ~/.config/msd/config.json
// - Windows: %APPDATA%\msd\config.json

use anyhow::{Context, Result};
use msd_core::config::{NetworkConfig, NodeConfig};
use msd_core::transport::{Address, TransportKind};
use std::path::{Path, PathBuf};

/// Default port of the internet network, shared by TCP, UDP and the group
pub const DEFAULT_PORT: u16 = 4160;
pub const DEFAULT_GROUP: &str = "239.255.41.60";

/// Get the config directory path (cross-platform)
pub fn config_dir() -> Result<PathBuf> {
    let dir = dirs::config_dir()
        .context("Failed to determine config directory")?
        .join("msd");
    std::fs::create_dir_all(&dir).context("Failed to create config directory")?;
    Ok(dir)
}

/// Explicit path, or the default config file
pub fn resolve(path: Option<&Path>) -> Result<PathBuf> {
    match path {
        Some(path) => Ok(path.to_path_buf()),
        None => Ok(config_dir()?.join("config.json")),
    }
}

/// Load and validate a node configuration
pub fn load(path: &Path) -> Result<NodeConfig> {
    if !path.exists() {
        anyhow::bail!(
            "No configuration at {} (run `msd init` first)",
            path.display()
        );
    }
    NodeConfig::load(path).with_context(|| format!("Failed to load {}", path.display()))
}

pub fn save(path: &Path, config: &NodeConfig) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).context("Failed to create config directory")?;
    }
    let contents = serde_json::to_string_pretty(config).context("Failed to serialize config")?;
    std::fs::write(path, contents).context("Failed to write config file")?;
    Ok(())
}

/// The one-network configuration `msd init` writes
pub fn initial(node_id: &str, leader: bool) -> NodeConfig {
    let mut config = NodeConfig::new(node_id).with_network(NetworkConfig {
        name: "ethernet".to_string(),
        kind: TransportKind::Internet,
        local: Address::new("0.0.0.0", DEFAULT_PORT, "ethernet"),
        multicast: Some(Address::new(DEFAULT_GROUP, DEFAULT_PORT, "ethernet")),
        service_name: "msd".to_string(),
    });
    config.is_leader = leader;
    config
}

/// Fresh short node id
pub fn generate_node_id() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    id[..12].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_config_is_valid() {
        let config = initial("node-1", true);
        assert!(config.validate().is_ok());
        assert!(config.is_leader);
        assert_eq!(config.networks[0].kind, TransportKind::Internet);
        assert_eq!(config.networks[0].multicast.as_ref().unwrap().port, DEFAULT_PORT);
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");
        save(&path, &initial("node-2", false)).unwrap();

        let loaded = load(&path).unwrap();
        assert_eq!(loaded.node_id, "node-2");
        assert!(!loaded.is_leader);
        assert_eq!(loaded.networks.len(), 1);
    }

    #[test]
    fn test_missing_file_explains_init() {
        let dir = tempfile::tempdir().unwrap();
        let err = load(&dir.path().join("config.json")).unwrap_err();
        assert!(err.to_string().contains("msd init"));
    }

    #[test]
    fn test_generated_ids_differ() {
        let a = generate_node_id();
        assert_eq!(a.len(), 12);
        assert_ne!(a, generate_node_id());
    }
}
