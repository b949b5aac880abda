use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TftpcConfigFile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub get: Option<ClientConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub put: Option<ClientConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ClientConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub block_size: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "humantime_serde")]
    pub timeout: Option<Duration>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retries: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    /// Ask for / advertise the file size with `tsize`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transfer_size: Option<bool>,
}

impl ClientConfig {
    pub fn new(server: String, port: u16) -> Self {
        Self {
            server: Some(server),
            port: Some(port),
            block_size: Some(512),
            timeout: Some(Duration::from_secs(5)),
            retries: Some(5),
            mode: Some("octet".to_string()),
            transfer_size: Some(true),
        }
    }

    /// Applies command-line values on top of the file values.
    pub fn merge_cli(
        mut self,
        cli_server: String,
        cli_port: Option<u16>,
        cli_block_size: Option<u16>,
        cli_timeout: Option<u64>,
        cli_mode: Option<String>,
    ) -> Self {
        self.server = Some(cli_server);
        if cli_port.is_some() {
            self.port = cli_port;
        }
        if cli_block_size.is_some() {
            self.block_size = cli_block_size;
        }
        if let Some(secs) = cli_timeout {
            self.timeout = Some(Duration::from_secs(secs));
        }
        if cli_mode.is_some() {
            self.mode = cli_mode;
        }
        self
    }

    pub fn with_block_size(mut self, block_size: u16) -> Self {
        self.block_size = Some(block_size);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = Some(retries);
        self
    }

    pub fn with_mode(mut self, mode: &str) -> Self {
        self.mode = Some(mode.to_string());
        self
    }

    pub fn with_transfer_size(mut self, transfer_size: bool) -> Self {
        self.transfer_size = Some(transfer_size);
        self
    }
}
