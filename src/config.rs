use log::info;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::tftp::client::config::ClientConfig;
use crate::tftp::client::config::TftpcConfigFile;
use crate::tftp::server::config::Config as TftpdConfig;

/// Name of the configuration file looked up in the working directory.
pub const CONFIG_FILE: &str = ".tftpkit.toml";

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tftpd: Option<TftpdConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tftpc: Option<TftpcConfigFile>,
}

impl AppConfig {
    pub fn load_from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: AppConfig = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn generate_config_file(force: bool) -> anyhow::Result<()> {
        Self::write_config_file(CONFIG_FILE, force)
    }

    pub fn write_config_file(path: impl AsRef<Path>, force: bool) -> anyhow::Result<()> {
        let path = path.as_ref();

        if path.exists() && !force {
            anyhow::bail!(
                "Configuration file {} already exists. Use --force to overwrite.",
                path.display()
            );
        }

        fs::write(path, Self::generate_full_config()?)?;

        info!("Configuration file generated: {}", path.display());
        info!("Contains full configuration (server + client)");
        info!("Please edit this file to customize configuration");
        Ok(())
    }

    pub fn generate_full_config() -> anyhow::Result<String> {
        let config = AppConfig {
            tftpd: Some(TftpdConfig::with_defaults()),
            tftpc: Some(TftpcConfigFile {
                get: Some(ClientConfig::new("127.0.0.1".to_string(), 69)),
                put: Some(ClientConfig::new("127.0.0.1".to_string(), 69)),
            }),
        };
        let toml_content = toml::to_string_pretty(&config)?;
        Ok(format!(
            "# tftpkit configuration file\n# All fields are optional, command line arguments override config file values\n\n{}",
            toml_content
        ))
    }
}
