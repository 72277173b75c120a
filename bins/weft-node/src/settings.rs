//! Node settings: `weft.toml`, then `WEFT_*` environment variables, then
//! command-line flags.
//!
//! Nested keys use `__` in the environment, e.g.
//! `WEFT_NETWORK__LISTEN_PORT=30444` or `WEFT_NETWORK__SYNC__WARP_SYNC=true`.

use anyhow::Context;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use weft_network::NetworkConfig;

/// Settings file looked up in the data directory when `--config` is absent.
pub const CONFIG_FILE: &str = "weft.toml";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct NodeSettings {
    pub data_dir: PathBuf,
    pub log_level: String,
    pub log_format: LogFormat,
    /// Blocks of the built-in development chain to produce at startup.
    pub dev_blocks: u64,
    pub network: NetworkConfig,
}

impl Default for NodeSettings {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            log_level: "info".to_string(),
            log_format: LogFormat::Text,
            dev_blocks: 0,
            network: NetworkConfig::default(),
        }
    }
}

pub fn default_data_dir() -> PathBuf {
    dirs::data_dir().unwrap_or_else(|| PathBuf::from(".")).join("weft")
}

impl NodeSettings {
    /// Layer the settings file (if any) and the environment over the
    /// defaults. An explicitly named file must exist.
    pub fn load(file: Option<&Path>, data_dir: Option<&Path>) -> anyhow::Result<Self> {
        let (path, required) = match file {
            Some(path) => (path.to_path_buf(), true),
            None => (
                data_dir.map(Path::to_path_buf).unwrap_or_else(default_data_dir).join(CONFIG_FILE),
                false,
            ),
        };

        config::Config::builder()
            .add_source(config::File::from(path.as_path()).required(required))
            .add_source(
                config::Environment::with_prefix("WEFT")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("network.reserved_peers"),
            )
            .build()
            .with_context(|| format!("reading settings from {}", path.display()))?
            .try_deserialize()
            .context("invalid settings")
    }

    /// Where the node key lives unless configured otherwise.
    pub fn node_key_path(&self) -> PathBuf {
        self.network
            .node_key_path
            .clone()
            .unwrap_or_else(|| self.data_dir.join("node.key"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn missing_default_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = NodeSettings::load(None, Some(dir.path())).unwrap();
        assert_eq!(settings.log_level, "info");
        assert_eq!(settings.network, NetworkConfig::default());
    }

    #[test]
    fn explicit_file_must_exist() {
        let dir = tempfile::tempdir().unwrap();
        assert!(NodeSettings::load(Some(&dir.path().join("nope.toml")), None).is_err());
    }

    /// Keys left out of the file keep their defaults, nested tables included.
    #[test]
    fn file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join(CONFIG_FILE),
            r#"
log_format = "json"
dev_blocks = 12

[network]
listen_port = 40000
enable_mdns = false

[network.reputation]
ban_threshold = -300
"#,
        )
        .unwrap();

        let settings = NodeSettings::load(None, Some(dir.path())).unwrap();
        assert_eq!(settings.log_format, LogFormat::Json);
        assert_eq!(settings.dev_blocks, 12);
        assert_eq!(settings.network.listen_port, 40000);
        assert!(!settings.network.enable_mdns);
        assert_eq!(settings.network.reputation.ban_threshold, -300);
        assert_eq!(
            settings.network.reputation.max_score,
            NetworkConfig::default().reputation.max_score
        );
    }

    #[test]
    fn node_key_defaults_into_data_dir() {
        let settings = NodeSettings {
            data_dir: PathBuf::from("/var/lib/weft"),
            ..NodeSettings::default()
        };
        assert_eq!(settings.node_key_path(), PathBuf::from("/var/lib/weft/node.key"));
    }
}
