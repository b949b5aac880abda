//! TFTP client implementation
//!
//! This module provides TFTP client functionality:
//! - File download (GET/RRQ)
//! - File upload (PUT/WRQ), from a file or standard input
//! - blksize, timeout and tsize option negotiation
//!
//! # Usage Examples
//!
//! ## Download file
//!
//! ```rust,no_run
//! use tftpkit::tftp::client::Client;
//! use tftpkit::tftp::client::config::ClientConfig;
//! use std::path::Path;
//!
//! let config = ClientConfig::new("192.168.1.100".to_string(), 69);
//! let client = Client::new(config).unwrap();
//! client.get("remote.txt", Path::new("local.txt")).unwrap();
//! ```
//!
//! ## Upload file
//!
//! ```rust,no_run
//! use tftpkit::tftp::client::Client;
//! use tftpkit::tftp::client::config::ClientConfig;
//! use std::path::Path;
//!
//! let config = ClientConfig::new("192.168.1.100".to_string(), 69);
//! let client = Client::new(config).unwrap();
//! client.put(Path::new("local.txt"), "remote.txt").unwrap();
//! ```
//!
//! # Command Line Usage
//!
//! ```bash
//! # Download file
//! tftpkit tftpc get 192.168.1.100 remote.txt [local.txt]
//!
//! # Upload file
//! tftpkit tftpc put 192.168.1.100 local.txt [remote.txt]
//!
//! # Upload standard input
//! echo hello | tftpkit tftpc put 192.168.1.100 - hello.txt
//! ```

mod client_impl;
pub mod config;

use anyhow::Result;
use clap::Subcommand;
use std::path::{Path, PathBuf};

pub use client_impl::Client;

#[derive(Subcommand)]
pub enum TftpcAction {
    /// Download a file from TFTP server (RRQ)
    Get {
        /// Server IP address or hostname
        server: String,

        /// Remote file name on server
        remote_file: String,

        /// Local file path (defaults to remote file name)
        #[arg(value_name = "LOCAL_FILE")]
        local_file: Option<PathBuf>,

        /// Server port [default: 69]
        #[arg(short, long)]
        port: Option<u16>,

        /// Block size (8-65464) [default: 512]
        #[arg(short, long)]
        block_size: Option<u16>,

        /// Timeout in seconds (1-255) [default: 5]
        #[arg(short, long)]
        timeout: Option<u64>,

        /// Transfer mode: octet or netascii [default: octet]
        #[arg(short, long)]
        mode: Option<String>,
    },

    /// Upload a file to TFTP server (WRQ)
    Put {
        /// Server IP address or hostname
        server: String,

        /// Local file path to upload, `-` for standard input
        local_file: PathBuf,

        /// Remote file name on server (defaults to local file name)
        #[arg(value_name = "REMOTE_FILE")]
        remote_file: Option<String>,

        /// Server port [default: 69]
        #[arg(short, long)]
        port: Option<u16>,

        /// Block size (8-65464) [default: 512]
        #[arg(short, long)]
        block_size: Option<u16>,

        /// Timeout in seconds (1-255) [default: 5]
        #[arg(short, long)]
        timeout: Option<u64>,

        /// Transfer mode: octet or netascii [default: octet]
        #[arg(short, long)]
        mode: Option<String>,
    },
}

/// Run TFTP client command with configuration
pub fn run_with_config(
    action: TftpcAction,
    config: Option<&config::TftpcConfigFile>,
) -> Result<()> {
    match action {
        TftpcAction::Get {
            server,
            remote_file,
            local_file,
            port,
            block_size,
            timeout,
            mode,
        } => {
            let client_config = config.and_then(|c| c.get.clone()).unwrap_or_default();
            let cfg = client_config.merge_cli(server, port, block_size, timeout, mode);

            let local_path = local_file.unwrap_or_else(|| {
                Path::new(&remote_file)
                    .file_name()
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from(&remote_file))
            });

            let client = Client::new(cfg)?;
            log::info!("Server: {}", client.server());
            client.get(&remote_file, &local_path)?;

            log::info!("Download completed successfully");
        }

        TftpcAction::Put {
            server,
            local_file,
            remote_file,
            port,
            block_size,
            timeout,
            mode,
        } => {
            let client_config = config.and_then(|c| c.put.clone()).unwrap_or_default();
            let cfg = client_config.merge_cli(server, port, block_size, timeout, mode);

            let from_stdin = local_file.as_os_str() == "-";
            if !from_stdin && !local_file.exists() {
                log::error!("Local file does not exist: {}", local_file.display());
                return Err(anyhow::anyhow!("Local file does not exist"));
            }

            let remote_name = match remote_file {
                Some(name) => name,
                None if from_stdin => {
                    return Err(anyhow::anyhow!(
                        "A remote file name is required when uploading standard input"
                    ));
                }
                None => local_file
                    .file_name()
                    .and_then(|n| n.to_str())
                    .unwrap_or("file")
                    .to_string(),
            };

            let client = Client::new(cfg)?;
            log::info!("Server: {}", client.server());
            client.put(&local_file, &remote_name)?;

            log::info!("Upload completed successfully");
        }
    }
    Ok(())
}
