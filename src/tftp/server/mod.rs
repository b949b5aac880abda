//! TFTP server implementation
//!
//! This module provides the TFTP server:
//! - `server`: request listener on the well-known port
//! - `worker`: one thread and one ephemeral socket per transfer
//! - `config`: server configuration

pub mod config;
mod server_impl;
mod worker;

use anyhow::Result;
use std::path::PathBuf;

// Public server types
pub use config::Config;
pub use server_impl::Server;
pub use worker::Worker;

/// Run the TFTP server with CLI arguments and optional configuration
pub fn run_with_config(
    ip: Option<String>,
    port: Option<u16>,
    path: Option<PathBuf>,
    read_only: bool,
    config: Option<Config>,
) -> Result<()> {
    let server_config = config.unwrap_or_default();
    let config = server_config.merge_cli(ip, port, path, read_only);

    let addr = config.bind_addr()?;
    let directory = config.directory();
    let private = config.private_options()?;

    log::info!("Starting TFTP server on {}", addr);
    log::info!("Serving directory: {}", directory.display());
    log::info!("Read-only mode: {}", config.read_only());
    log::info!(
        "Timeout: {:?}, retries: {}",
        private.timeout,
        private.retries
    );

    // Ensure directory exists
    if !directory.is_dir() {
        log::error!("Directory does not exist: {}", directory.display());
        return Err(anyhow::anyhow!("Directory does not exist"));
    }

    let server = Server::new(&config)?;

    log::info!("TFTP server listening, press Ctrl+C to stop");
    server.listen();

    Ok(())
}
