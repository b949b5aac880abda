use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;

use anyhow::Context;

use super::config::Config;
use super::worker::Worker;
use crate::tftp::core::{
    DecodeError, ErrorCode, LocalStorage, LogObserver, MessageObserver, Packet, PacketDirection,
};

/// RFC 2347 caps a request, options included, at 512 bytes.
const MAX_REQUEST_PACKET_SIZE: usize = 512;

/// Listens for requests on the well-known port and hands each one to a
/// [`Worker`] thread.
pub struct Server {
    socket: UdpSocket,
    worker: Worker,
    observer: Arc<dyn MessageObserver>,
}

impl Server {
    pub fn new(config: &Config) -> anyhow::Result<Self> {
        let addr = config.bind_addr()?;
        let directory = config.directory();
        let storage = LocalStorage::new(&directory)
            .with_context(|| format!("Cannot serve directory {}", directory.display()))?;
        let socket =
            UdpSocket::bind(addr).with_context(|| format!("Failed to bind TFTP server to {addr}"))?;

        let observer: Arc<dyn MessageObserver> = Arc::new(LogObserver);
        let local_ip = (!addr.ip().is_unspecified()).then_some(addr.ip());
        let worker = Worker::new(
            Arc::new(storage),
            config.private_options()?,
            config.read_only(),
            observer.clone(),
        )
        .with_local_ip(local_ip);

        Ok(Self {
            socket,
            worker,
            observer,
        })
    }

    /// Replaces the per-packet hook for the listener and every transfer.
    pub fn with_observer(mut self, observer: Arc<dyn MessageObserver>) -> Self {
        self.worker = self.worker.with_observer(observer.clone());
        self.observer = observer;
        self
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Serves requests until the process exits.
    pub fn listen(&self) {
        // one spare byte tells an oversized request from one that fits
        let mut buf = [0u8; MAX_REQUEST_PACKET_SIZE + 1];
        loop {
            let (len, peer) = match self.socket.recv_from(&mut buf) {
                Ok(received) => received,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    log::error!("Failed to receive request: {}", e);
                    continue;
                }
            };

            if len > MAX_REQUEST_PACKET_SIZE {
                log::warn!("Rejecting oversized request from {}", peer);
                self.reply_error(peer, ErrorCode::IllegalOperation, "Request packet too large");
                continue;
            }

            match Packet::decode_observed(&buf[..len], peer, self.observer.as_ref()) {
                Ok(packet @ (Packet::Rrq { .. } | Packet::Wrq { .. })) => {
                    match self.worker.spawn(packet, peer) {
                        Ok(Some(_)) => {}
                        Ok(None) => {
                            log::debug!("Ignoring repeated request from {}", peer);
                        }
                        Err(e) => log::error!("Failed to start transfer for {}: {}", peer, e),
                    }
                }
                Ok(other) => {
                    log::warn!("Ignoring {} from {} on the request port", other.opcode(), peer);
                }
                Err(DecodeError::UnsupportedMode(mode)) => {
                    log::warn!("Rejecting request from {} with mode {:?}", peer, mode);
                    self.reply_error(peer, ErrorCode::IllegalOperation, "Invalid mode specified");
                }
                Err(e) => log::warn!("Malformed request from {}: {}", peer, e),
            }
        }
    }

    fn reply_error(&self, peer: SocketAddr, code: ErrorCode, msg: &str) {
        let packet = Packet::error(code, msg);
        let sent = packet
            .encode()
            .map_err(io::Error::other)
            .and_then(|bytes| self.socket.send_to(&bytes, peer));
        match sent {
            Ok(_) => self
                .observer
                .on_message(&packet, peer, PacketDirection::Sent),
            Err(e) => log::warn!("Failed to send error to {}: {}", peer, e),
        }
    }
}
