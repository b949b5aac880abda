use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use crate::tftp::core::options::{MAX_TIMEOUT_SECS, MIN_TIMEOUT_SECS, OptionsPrivate};

pub const DEFAULT_IP: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 69;

/// TFTP server configuration
///
/// Every field is optional so the same type can be read from the `[tftpd]`
/// table of the config file and then completed from the command line.
///
/// # Example
///
/// ```rust
/// use tftpkit::tftp::server::Config;
/// use std::path::PathBuf;
///
/// let config = Config::default().merge_cli(
///     Some("127.0.0.1".to_string()),
///     Some(6969),
///     Some(PathBuf::from("/tmp/tftp")),
///     false,
/// );
/// assert_eq!(config.bind_addr().unwrap().port(), 6969);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Address to listen on
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    /// Port to listen on
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    /// Directory served to clients
    #[serde(skip_serializing_if = "Option::is_none")]
    pub directory: Option<PathBuf>,
    /// Reject every write request
    #[serde(skip_serializing_if = "Option::is_none")]
    pub read_only: Option<bool>,
    /// Reply timeout when the client does not negotiate one
    #[serde(default, skip_serializing_if = "Option::is_none", with = "humantime_serde")]
    pub timeout: Option<Duration>,
    /// Retransmissions per block before giving up
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retries: Option<u32>,
}

impl Config {
    /// Fully populated configuration, as written by `genconfig`.
    pub fn with_defaults() -> Self {
        let private = OptionsPrivate::default();
        Self {
            ip: Some(DEFAULT_IP.to_string()),
            port: Some(DEFAULT_PORT),
            directory: Some(PathBuf::from(".")),
            read_only: Some(false),
            timeout: Some(private.timeout),
            retries: Some(private.retries),
        }
    }

    /// Applies command-line values on top of the file values.
    pub fn merge_cli(
        mut self,
        cli_ip: Option<String>,
        cli_port: Option<u16>,
        cli_directory: Option<PathBuf>,
        cli_read_only: bool,
    ) -> Self {
        if cli_ip.is_some() {
            self.ip = cli_ip;
        }
        if cli_port.is_some() {
            self.port = cli_port;
        }
        if cli_directory.is_some() {
            self.directory = cli_directory;
        }
        if cli_read_only {
            self.read_only = Some(true);
        }
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

    pub fn bind_addr(&self) -> anyhow::Result<SocketAddr> {
        let ip = self.ip.as_deref().unwrap_or(DEFAULT_IP);
        let ip: IpAddr = ip
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid listen address '{}': {}", ip, e))?;
        Ok(SocketAddr::new(ip, self.port.unwrap_or(DEFAULT_PORT)))
    }

    pub fn directory(&self) -> PathBuf {
        self.directory
            .clone()
            .unwrap_or_else(|| PathBuf::from("."))
    }

    pub fn read_only(&self) -> bool {
        self.read_only.unwrap_or(false)
    }

    /// Local retry settings. The timeout must lie within the range a client
    /// could negotiate.
    pub fn private_options(&self) -> anyhow::Result<OptionsPrivate> {
        let defaults = OptionsPrivate::default();
        let timeout = self.timeout.unwrap_or(defaults.timeout);
        if !(MIN_TIMEOUT_SECS..=MAX_TIMEOUT_SECS).contains(&timeout.as_secs()) {
            anyhow::bail!(
                "Timeout {:?} is out of range ({}-{} seconds)",
                timeout,
                MIN_TIMEOUT_SECS,
                MAX_TIMEOUT_SECS
            );
        }
        Ok(OptionsPrivate {
            retries: self.retries.unwrap_or(defaults.retries),
            timeout,
        })
    }
}
