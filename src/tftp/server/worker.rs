use std::collections::HashSet;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use crate::tftp::core::{
    ErrorCode, MessageObserver, Mode, OptionSet, OptionsPrivate, OptionsProtocol, Packet,
    RequestType, Role, SessionResult, Socket, Storage, Transfer, TransferError, bind_ephemeral,
};

type ActivePeers = Arc<Mutex<HashSet<SocketAddr>>>;

/// Runs server-side transfers, one thread each.
///
/// Clones share the set of peers with a transfer in progress; everything
/// else they hold is read-only. Every transfer gets its own socket and its
/// own negotiated parameters.
#[derive(Clone)]
pub struct Worker {
    storage: Arc<dyn Storage>,
    private: OptionsPrivate,
    read_only: bool,
    local_ip: Option<IpAddr>,
    observer: Arc<dyn MessageObserver>,
    active: ActivePeers,
}

/// Marks a peer as being served until dropped.
struct ActiveSession {
    peers: ActivePeers,
    peer: SocketAddr,
}

impl ActiveSession {
    fn claim(peers: &ActivePeers, peer: SocketAddr) -> Option<Self> {
        let mut set = peers.lock().unwrap_or_else(PoisonError::into_inner);
        set.insert(peer).then(|| Self {
            peers: peers.clone(),
            peer,
        })
    }
}

impl Drop for ActiveSession {
    fn drop(&mut self) {
        self.peers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.peer);
    }
}

impl Worker {
    pub fn new(
        storage: Arc<dyn Storage>,
        private: OptionsPrivate,
        read_only: bool,
        observer: Arc<dyn MessageObserver>,
    ) -> Self {
        Self {
            storage,
            private,
            read_only,
            local_ip: None,
            observer,
            active: Arc::default(),
        }
    }

    /// Binds transfer sockets to `ip` instead of the unspecified address.
    pub fn with_local_ip(mut self, ip: Option<IpAddr>) -> Self {
        self.local_ip = ip;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn MessageObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Handles `packet` on a new thread.
    ///
    /// Returns `None` without doing anything while `peer` already has a
    /// transfer running: a client repeats its request when our first reply is
    /// lost, and that transfer is still waiting for it.
    pub fn spawn(
        &self,
        packet: Packet,
        peer: SocketAddr,
    ) -> io::Result<Option<JoinHandle<SessionResult>>> {
        let Some(session) = ActiveSession::claim(&self.active, peer) else {
            return Ok(None);
        };
        let worker = self.clone();
        let handle = thread::Builder::new()
            .name(format!("tftp-{peer}"))
            .spawn(move || {
                let _session = session;
                let result = worker.handle_incoming_request(packet, peer);
                match &result {
                    Ok(summary) => log::info!(
                        "Transfer with {} complete: {} bytes in {} blocks ({} retransmissions)",
                        peer,
                        summary.bytes,
                        summary.blocks,
                        summary.retransmissions
                    ),
                    Err(e) => log::warn!("Transfer with {} failed: {}", peer, e),
                }
                result
            })?;
        Ok(Some(handle))
    }

    /// Serves one RRQ or WRQ from `peer` on a fresh ephemeral socket.
    pub fn handle_incoming_request(&self, packet: Packet, peer: SocketAddr) -> SessionResult {
        let socket = bind_ephemeral(peer, self.local_ip)?;
        self.serve(socket, packet, peer)
    }

    /// Serves one request over an already bound socket.
    pub fn serve<S: Socket>(&self, socket: S, packet: Packet, peer: SocketAddr) -> SessionResult {
        match packet {
            Packet::Rrq {
                filename,
                mode,
                options,
            } => self.serve_rrq(socket, peer, &filename, mode, &options),
            Packet::Wrq {
                filename,
                mode,
                options,
            } => self.serve_wrq(socket, peer, &filename, mode, &options),
            other => {
                let mut transfer = self.transfer(socket, peer, Mode::Octet);
                let msg = format!("{} is not a request", other.opcode());
                Err(transfer.abort(ErrorCode::IllegalOperation, &msg))
            }
        }
    }

    fn serve_rrq<S: Socket>(
        &self,
        socket: S,
        peer: SocketAddr,
        filename: &str,
        mode: Mode,
        options: &OptionSet,
    ) -> SessionResult {
        let mut transfer = self.transfer(socket, peer, mode);
        let path = self.confine(&mut transfer, filename)?;

        let (source, size) = match self.storage.open_read(&path) {
            Ok(opened) => opened,
            Err(e) => {
                let code = ErrorCode::from_io_error(&e);
                log::debug!("Cannot open {}: {}", path.display(), e);
                return Err(transfer.abort(code, code.default_message()));
            }
        };
        let offer = self.negotiate(&mut transfer, options, RequestType::Read(size), &path)?;

        log::info!(
            "Sending {} to {} ({} bytes, {} mode, blksize {})",
            path.display(),
            peer,
            size,
            mode,
            transfer.block_size()
        );
        transfer.serve_read(source, offer)
    }

    fn serve_wrq<S: Socket>(
        &self,
        socket: S,
        peer: SocketAddr,
        filename: &str,
        mode: Mode,
        options: &OptionSet,
    ) -> SessionResult {
        let mut transfer = self.transfer(socket, peer, mode);
        let path = self.confine(&mut transfer, filename)?;

        if self.read_only {
            return Err(transfer.abort(ErrorCode::AccessViolation, "Server is read-only"));
        }
        if self.storage.exists(&path) {
            let code = ErrorCode::FileAlreadyExists;
            return Err(transfer.abort(code, code.default_message()));
        }
        let offer = self.negotiate(&mut transfer, options, RequestType::Write, &path)?;

        let sink = match self.storage.create(&path) {
            Ok(sink) => sink,
            Err(e) => {
                let code = ErrorCode::from_io_error(&e);
                return Err(transfer.abort(code, &e.to_string()));
            }
        };

        log::info!(
            "Receiving {} from {} ({} mode, blksize {})",
            path.display(),
            peer,
            mode,
            transfer.block_size()
        );
        let result = transfer.serve_write(sink, offer);
        if result.is_err() {
            if let Err(e) = self.storage.delete(&path) {
                log::warn!("Failed to remove partial file {}: {}", path.display(), e);
            }
        }
        result
    }

    fn transfer<S: Socket>(&self, socket: S, peer: SocketAddr, mode: Mode) -> Transfer<S> {
        Transfer::new(
            socket,
            peer,
            Role::Server,
            mode,
            &self.private,
            self.observer.clone(),
        )
    }

    fn confine<S: Socket>(
        &self,
        transfer: &mut Transfer<S>,
        filename: &str,
    ) -> Result<PathBuf, TransferError> {
        let path = self.storage.resolve(filename);
        if self.storage.is_within_root(&path) {
            Ok(path)
        } else {
            log::warn!("Refusing {:?} outside the served directory", filename);
            Err(transfer.abort(ErrorCode::AccessViolation, "Access violation"))
        }
    }

    /// Negotiates `options`; `None` means no OACK is due.
    fn negotiate<S: Socket>(
        &self,
        transfer: &mut Transfer<S>,
        options: &OptionSet,
        request: RequestType,
        path: &Path,
    ) -> Result<Option<OptionSet>, TransferError> {
        let has_space = |bytes: u64| self.storage.has_space(path, bytes);
        match OptionsProtocol::negotiate(options, request, has_space) {
            Ok((negotiated, accepted)) => {
                transfer.apply(&negotiated);
                Ok((!accepted.is_empty()).then_some(accepted))
            }
            Err(e) => {
                transfer.abort(ErrorCode::OptionNegotiationFailed, &e.to_string());
                Err(e.into())
            }
        }
    }
}
