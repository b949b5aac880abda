use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;

use super::config::ClientConfig;
use crate::tftp::core::options::{
    DEFAULT_BLOCK_SIZE, MAX_BLOCK_SIZE, MAX_TIMEOUT_SECS, MIN_BLOCK_SIZE, MIN_TIMEOUT_SECS,
};
use crate::tftp::core::{
    LogObserver, MessageObserver, Mode, OptionSet, OptionType, OptionsPrivate, Packet, Role,
    SessionResult, Socket, Transfer, bind_ephemeral,
};

/// TFTP client
///
/// Supports file upload (PUT) and download (GET) operations
pub struct Client {
    server: SocketAddr,
    block_size: u16,
    timeout: Duration,
    private: OptionsPrivate,
    mode: Mode,
    transfer_size: bool,
    observer: Arc<dyn MessageObserver>,
}

impl Client {
    /// Create a new TFTP client
    pub fn new(config: ClientConfig) -> anyhow::Result<Self> {
        let server_str = config
            .server
            .ok_or_else(|| anyhow::anyhow!("Server address not specified"))?;
        let port = config.port.unwrap_or(69);
        let server = (server_str.as_str(), port)
            .to_socket_addrs()
            .with_context(|| format!("Invalid server address '{}'", server_str))?
            .next()
            .ok_or_else(|| anyhow::anyhow!("Server address '{}' did not resolve", server_str))?;
        let mode: Mode = config
            .mode
            .as_deref()
            .unwrap_or("octet")
            .parse()
            .map_err(|e| anyhow::anyhow!("{}", e))?;

        let defaults = OptionsPrivate::default();
        let timeout = config.timeout.unwrap_or(defaults.timeout);
        if !(MIN_TIMEOUT_SECS..=MAX_TIMEOUT_SECS).contains(&timeout.as_secs()) {
            anyhow::bail!(
                "Timeout {:?} is out of range ({}-{} seconds)",
                timeout,
                MIN_TIMEOUT_SECS,
                MAX_TIMEOUT_SECS
            );
        }
        let block_size = config.block_size.unwrap_or(DEFAULT_BLOCK_SIZE);
        if !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&block_size) {
            anyhow::bail!(
                "Block size {} is out of range ({}-{})",
                block_size,
                MIN_BLOCK_SIZE,
                MAX_BLOCK_SIZE
            );
        }

        Ok(Self {
            server,
            block_size,
            timeout,
            private: OptionsPrivate {
                retries: config.retries.unwrap_or(defaults.retries),
                timeout,
            },
            mode,
            transfer_size: config.transfer_size.unwrap_or(true),
            observer: Arc::new(LogObserver),
        })
    }

    pub fn with_observer(mut self, observer: Arc<dyn MessageObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn server(&self) -> SocketAddr {
        self.server
    }

    /// Options carried by a request. Values equal to the protocol defaults
    /// are left out.
    pub fn build_options(&self, transfer_size: Option<u64>) -> OptionSet {
        let mut options = OptionSet::new();

        if self.block_size != DEFAULT_BLOCK_SIZE {
            options.push(OptionType::BlockSize.as_str(), self.block_size.to_string());
        }

        if self.timeout != OptionsPrivate::default().timeout {
            options.push(OptionType::Timeout.as_str(), self.timeout.as_secs().to_string());
        }

        if let Some(size) = transfer_size.filter(|_| self.transfer_size) {
            options.push(OptionType::TransferSize.as_str(), size.to_string());
        }

        options
    }

    /// Download a file from the server (RRQ - Read Request)
    pub fn get(&self, remote_file: &str, local_file: &Path) -> anyhow::Result<()> {
        log::info!("Downloading {} to {}", remote_file, local_file.display());

        let options = self.build_options(Some(0));
        let summary = self
            .start_download(self.server, remote_file, self.mode, options, local_file)
            .with_context(|| format!("Download of {} failed", remote_file))?;

        log::info!(
            "Received {} bytes in {} blocks ({} retransmissions)",
            summary.bytes,
            summary.blocks,
            summary.retransmissions
        );
        Ok(())
    }

    /// Upload a file to the server (WRQ - Write Request)
    ///
    /// A `local_file` of `-` uploads standard input.
    pub fn put(&self, local_file: &Path, remote_file: &str) -> anyhow::Result<()> {
        log::info!("Uploading {} to {}", local_file.display(), remote_file);

        let result = if local_file == Path::new("-") {
            let options = self.build_options(None);
            self.start_upload(self.server, remote_file, self.mode, options, io::stdin().lock())
        } else {
            let file = File::open(local_file)
                .with_context(|| format!("Cannot open {}", local_file.display()))?;
            let file_size = file.metadata()?.len();
            let options = self.build_options(Some(file_size));
            self.start_upload(self.server, remote_file, self.mode, options, file)
        };
        let summary = result.with_context(|| format!("Upload of {} failed", remote_file))?;

        log::info!(
            "Sent {} bytes in {} blocks ({} retransmissions)",
            summary.bytes,
            summary.blocks,
            summary.retransmissions
        );
        Ok(())
    }

    /// Fetches `filename` from `peer` into `local_file`, removing the local
    /// file again if the transfer fails.
    pub fn start_download(
        &self,
        peer: SocketAddr,
        filename: &str,
        mode: Mode,
        options: OptionSet,
        local_file: &Path,
    ) -> SessionResult {
        let file = File::create(local_file)?;
        let socket = bind_ephemeral(peer, None)?;
        let result = self.download_with(socket, peer, filename, mode, options, file);
        if result.is_err() {
            if let Err(e) = fs::remove_file(local_file) {
                log::warn!("Failed to remove {}: {}", local_file.display(), e);
            }
        }
        result
    }

    /// Sends `source` to `peer` as `filename`.
    pub fn start_upload<R: Read>(
        &self,
        peer: SocketAddr,
        filename: &str,
        mode: Mode,
        options: OptionSet,
        source: R,
    ) -> SessionResult {
        let socket = bind_ephemeral(peer, None)?;
        self.upload_with(socket, peer, filename, mode, options, source)
    }

    /// Runs an RRQ over an already bound socket.
    pub fn download_with<S: Socket, W: Write>(
        &self,
        socket: S,
        peer: SocketAddr,
        filename: &str,
        mode: Mode,
        options: OptionSet,
        sink: W,
    ) -> SessionResult {
        let mut transfer = self.transfer(socket, peer, mode);
        let request = Packet::Rrq {
            filename: filename.to_string(),
            mode,
            options: options.clone(),
        };
        transfer.download(&request, &options, sink)
    }

    /// Runs a WRQ over an already bound socket.
    pub fn upload_with<S: Socket, R: Read>(
        &self,
        socket: S,
        peer: SocketAddr,
        filename: &str,
        mode: Mode,
        options: OptionSet,
        source: R,
    ) -> SessionResult {
        let mut transfer = self.transfer(socket, peer, mode);
        let request = Packet::Wrq {
            filename: filename.to_string(),
            mode,
            options: options.clone(),
        };
        transfer.upload(&request, &options, source)
    }

    fn transfer<S: Socket>(&self, socket: S, peer: SocketAddr, mode: Mode) -> Transfer<S> {
        Transfer::new(
            socket,
            peer,
            Role::Client,
            mode,
            &self.private,
            self.observer.clone(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(config: ClientConfig) -> Client {
        Client::new(config).unwrap()
    }

    #[test]
    fn test_build_options() {
        let plain = client(ClientConfig::new("127.0.0.1".to_string(), 69));
        let options = plain.build_options(Some(0));
        assert_eq!(options.len(), 1);
        assert_eq!(options.get("tsize"), Some("0"));

        let tuned = client(
            ClientConfig::new("127.0.0.1".to_string(), 69)
                .with_block_size(1428)
                .with_timeout(Duration::from_secs(2))
                .with_transfer_size(false),
        );
        let options = tuned.build_options(Some(4096));
        assert_eq!(options.to_string(), "blksize=1428 timeout=2");
    }

    #[test]
    fn test_rejects_out_of_range_settings() {
        let base = || ClientConfig::new("127.0.0.1".to_string(), 69);

        assert!(Client::new(base().with_timeout(Duration::ZERO)).is_err());
        assert!(Client::new(base().with_timeout(Duration::from_millis(500))).is_err());
        assert!(Client::new(base().with_timeout(Duration::from_secs(256))).is_err());
        assert!(Client::new(base().with_block_size(4)).is_err());
        assert!(Client::new(base().with_block_size(65465)).is_err());

        assert!(Client::new(base().with_timeout(Duration::from_secs(255))).is_ok());
        assert!(Client::new(base().with_block_size(8)).is_ok());
        assert!(Client::new(base().with_block_size(65464)).is_ok());
    }

    #[test]
    fn test_rejects_unknown_mode() {
        let config = ClientConfig::new("127.0.0.1".to_string(), 69).with_mode("mail");
        assert!(Client::new(config).is_err());
    }
}
