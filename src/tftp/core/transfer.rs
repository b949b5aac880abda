//! Lock-step transfer engine shared by client and server.
//!
//! A [`Transfer`] owns one socket and drives exactly one file in one
//! direction. Every wait for a reply is bounded: on expiry the last packet is
//! sent again, and after `retries` retransmissions of the same packet the
//! transfer fails with [`TransferError::Timeout`].

use std::{
    io::{self, Read, Write},
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant},
};

use thiserror::Error;

use super::convert::{BlockReader, BlockWriter};
use super::observer::{MessageObserver, PacketDirection};
use super::options::{OptionError, OptionSet, OptionsPrivate, OptionsProtocol};
use super::packet::{DecodeError, ErrorCode, Mode, Packet};
use super::socket::Socket;

/// Upper bound for the backed-off timeout on server downloads.
const MAX_BACKOFF: Duration = Duration::from_secs(255);

/// Large enough for any UDP payload.
const RECV_BUFFER_SIZE: usize = 65536;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Waiting for the peer to confirm an OACK (or the OACK itself).
    Negotiating,
    Transferring,
    Done,
    Failed,
}

/// Counters reported when a transfer completes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferSummary {
    /// DATA packets exchanged, including a final empty one.
    pub blocks: u64,
    /// Payload bytes carried by those packets.
    pub bytes: u64,
    pub retransmissions: u64,
    pub block_size: u16,
}

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("timed out waiting for block {block} after {retries} retransmissions")]
    Timeout { block: u16, retries: u32 },
    #[error("peer reported error {code}: {msg}")]
    Peer { code: ErrorCode, msg: String },
    #[error("protocol violation: {0}")]
    Protocol(String),
    #[error("request rejected with {code}: {msg}")]
    Rejected { code: ErrorCode, msg: String },
    #[error("option negotiation failed: {0}")]
    Negotiation(#[from] OptionError),
    #[error(transparent)]
    Encode(#[from] DecodeError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl TransferError {
    /// The code a peer saw, or would have seen, for this failure.
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            TransferError::Peer { code, .. } | TransferError::Rejected { code, .. } => Some(*code),
            TransferError::Protocol(_) => Some(ErrorCode::IllegalOperation),
            TransferError::Negotiation(_) => Some(ErrorCode::OptionNegotiationFailed),
            TransferError::Io(e) => Some(ErrorCode::from_io_error(e)),
            TransferError::Timeout { .. } | TransferError::Encode(_) => None,
        }
    }
}

pub type SessionResult = Result<TransferSummary, TransferError>;

/// Retransmission budget for the exchange in flight.
#[derive(Debug, Clone)]
struct Retry {
    max: u32,
    left: u32,
    timeout: Duration,
    backoff: bool,
}

impl Retry {
    fn new(private: &OptionsPrivate) -> Self {
        Self {
            max: private.retries,
            left: private.retries,
            timeout: private.timeout,
            backoff: false,
        }
    }

    /// Starts a fresh budget. A backed-off timeout is kept.
    fn reset(&mut self) {
        self.left = self.max;
    }

    /// Spends one retransmission; `false` once the budget is gone.
    fn spend(&mut self, expired: bool) -> bool {
        if self.left == 0 {
            return false;
        }
        self.left -= 1;
        if expired && self.backoff {
            self.timeout = (self.timeout * 2).min(MAX_BACKOFF);
        }
        true
    }
}

fn is_timeout(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}

/// One file transfer between this endpoint and a single peer.
pub struct Transfer<S: Socket> {
    socket: S,
    peer: SocketAddr,
    /// A client learns the server's transfer ID from its first reply.
    peer_locked: bool,
    role: Role,
    mode: Mode,
    block_size: u16,
    block: u16,
    retry: Retry,
    observer: Arc<dyn MessageObserver>,
    state: State,
    last_sent: Vec<u8>,
    deadline: Instant,
    buf: Vec<u8>,
    summary: TransferSummary,
}

impl<S: Socket> Transfer<S> {
    /// Creates a transfer with default protocol parameters.
    ///
    /// For [`Role::Client`], `peer` is the server's request endpoint; replies
    /// are accepted from any port on that host until the first one arrives.
    pub fn new(
        socket: S,
        peer: SocketAddr,
        role: Role,
        mode: Mode,
        private: &OptionsPrivate,
        observer: Arc<dyn MessageObserver>,
    ) -> Self {
        let defaults = OptionsProtocol::default();
        Self {
            socket,
            peer,
            peer_locked: role == Role::Server,
            role,
            mode,
            block_size: defaults.block_size,
            block: 0,
            retry: Retry::new(private),
            observer,
            state: State::Transferring,
            last_sent: Vec::new(),
            deadline: Instant::now(),
            buf: vec![0; RECV_BUFFER_SIZE],
            summary: TransferSummary::default(),
        }
    }

    /// Adopts negotiated parameters. A negotiated timeout replaces the local one.
    pub fn apply(&mut self, negotiated: &OptionsProtocol) {
        self.block_size = negotiated.block_size;
        if let Some(timeout) = negotiated.timeout {
            self.retry.timeout = timeout;
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn block_size(&self) -> u16 {
        self.block_size
    }

    /// Server side of an RRQ: optional OACK round, then send the file.
    pub fn serve_read<R: Read>(&mut self, source: R, offer: Option<OptionSet>) -> SessionResult {
        self.retry.backoff = true;
        let result = self.run_serve_read(source, offer);
        self.finish(result)
    }

    /// Server side of a WRQ: OACK or ACK 0, then receive the file.
    pub fn serve_write<W: Write>(&mut self, sink: W, offer: Option<OptionSet>) -> SessionResult {
        let result = self.run_serve_write(sink, offer);
        self.finish(result)
    }

    /// Client side of an RRQ. `request` is sent as-is and repeated until the
    /// server answers; `offered` is what it carries.
    pub fn download<W: Write>(
        &mut self,
        request: &Packet,
        offered: &OptionSet,
        sink: W,
    ) -> SessionResult {
        let result = self.run_download(request, offered, sink);
        self.finish(result)
    }

    /// Client side of a WRQ.
    pub fn upload<R: Read>(
        &mut self,
        request: &Packet,
        offered: &OptionSet,
        source: R,
    ) -> SessionResult {
        let result = self.run_upload(request, offered, source);
        self.finish(result)
    }

    /// Refuses the transfer before it starts, telling the peer why.
    pub fn abort(&mut self, code: ErrorCode, msg: &str) -> TransferError {
        self.notify(code, msg);
        self.state = State::Failed;
        TransferError::Rejected {
            code,
            msg: msg.to_string(),
        }
    }

    fn run_serve_read<R: Read>(
        &mut self,
        source: R,
        offer: Option<OptionSet>,
    ) -> Result<(), TransferError> {
        let mut reader = BlockReader::new(source, self.mode);
        if let Some(options) = offer {
            self.state = State::Negotiating;
            self.block = 0;
            self.transmit(&Packet::Oack(options))?;
            self.expect_ack(0)?;
            self.retry.reset();
        }
        self.state = State::Transferring;
        self.send_blocks(&mut reader)
    }

    fn run_serve_write<W: Write>(
        &mut self,
        sink: W,
        offer: Option<OptionSet>,
    ) -> Result<(), TransferError> {
        let mut writer = BlockWriter::new(sink, self.mode);
        match offer {
            Some(options) => {
                self.state = State::Negotiating;
                self.transmit(&Packet::Oack(options))?;
            }
            None => self.transmit(&Packet::Ack(0))?,
        }
        self.receive_blocks(&mut writer, None)
    }

    fn run_download<W: Write>(
        &mut self,
        request: &Packet,
        offered: &OptionSet,
        sink: W,
    ) -> Result<(), TransferError> {
        let mut writer = BlockWriter::new(sink, self.mode);
        if !offered.is_empty() {
            self.state = State::Negotiating;
        }
        self.block = 1;
        self.transmit(request)?;

        let first = match self.await_reply()? {
            Packet::Oack(acked) => {
                self.accept_oack(offered, &acked)?;
                self.retry.reset();
                self.transmit(&Packet::Ack(0))?;
                None
            }
            data @ Packet::Data { .. } => Some(data),
            other => {
                let msg = format!("unexpected {} in reply to RRQ", other.opcode());
                return Err(self.fail_protocol(msg));
            }
        };
        self.receive_blocks(&mut writer, first)
    }

    fn run_upload<R: Read>(
        &mut self,
        request: &Packet,
        offered: &OptionSet,
        source: R,
    ) -> Result<(), TransferError> {
        let mut reader = BlockReader::new(source, self.mode);
        if !offered.is_empty() {
            self.state = State::Negotiating;
        }
        self.block = 0;
        self.transmit(request)?;

        match self.await_reply()? {
            Packet::Oack(acked) => self.accept_oack(offered, &acked)?,
            Packet::Ack(0) => {}
            other => {
                let msg = format!("unexpected {} in reply to WRQ", other.opcode());
                return Err(self.fail_protocol(msg));
            }
        }
        self.retry.reset();
        self.state = State::Transferring;
        self.send_blocks(&mut reader)
    }

    fn accept_oack(&mut self, offered: &OptionSet, acked: &OptionSet) -> Result<(), TransferError> {
        match OptionsProtocol::from_oack(offered, acked) {
            Ok(negotiated) => {
                self.apply(&negotiated);
                Ok(())
            }
            Err(e) => {
                self.notify(ErrorCode::OptionNegotiationFailed, &e.to_string());
                Err(e.into())
            }
        }
    }

    fn finish(&mut self, result: Result<(), TransferError>) -> SessionResult {
        match result {
            Ok(()) => {
                self.state = State::Done;
                self.summary.block_size = self.block_size;
                Ok(self.summary.clone())
            }
            Err(e) => {
                self.state = State::Failed;
                Err(e)
            }
        }
    }

    /// Sends DATA from `reader` until a short block has been acknowledged.
    fn send_blocks<R: Read>(&mut self, reader: &mut BlockReader<R>) -> Result<(), TransferError> {
        let size = self.block_size as usize;
        let mut block: u16 = 1;
        loop {
            let data = match reader.next_block(size) {
                Ok(data) => data,
                Err(e) => return Err(self.local_failure(e)),
            };
            let len = data.len();
            self.block = block;
            self.transmit(&Packet::Data {
                block_num: block,
                data,
            })?;
            self.expect_ack(block)?;
            self.retry.reset();
            self.summary.blocks += 1;
            self.summary.bytes += len as u64;

            if len < size {
                return Ok(());
            }
            block = block.wrapping_add(1);
        }
    }

    /// Receives DATA into `writer` until a short block has been acknowledged.
    ///
    /// `first` is a DATA packet that already arrived as the reply to an RRQ.
    fn receive_blocks<W: Write>(
        &mut self,
        writer: &mut BlockWriter<W>,
        mut first: Option<Packet>,
    ) -> Result<(), TransferError> {
        let size = self.block_size as usize;
        let mut expected: u16 = 1;
        loop {
            self.block = expected;
            let packet = match first.take() {
                Some(packet) => packet,
                None => self.await_reply()?,
            };
            match packet {
                Packet::Data { block_num, data } if block_num == expected => {
                    if data.len() > size {
                        return Err(self.fail_protocol(format!(
                            "block {block_num} carries {} bytes, negotiated {size}",
                            data.len()
                        )));
                    }
                    self.state = State::Transferring;
                    let last = data.len() < size;
                    let written = writer
                        .write_block(&data)
                        .and_then(|()| if last { writer.finish() } else { Ok(()) });
                    if let Err(e) = written {
                        return Err(self.local_failure(e));
                    }
                    self.retry.reset();
                    self.summary.blocks += 1;
                    self.summary.bytes += data.len() as u64;
                    self.transmit(&Packet::Ack(expected))?;

                    if last {
                        return Ok(());
                    }
                    expected = expected.wrapping_add(1);
                }
                // our last ACK was lost, the peer is repeating itself
                Packet::Data { block_num, .. }
                    if block_num == expected.wrapping_sub(1) && self.summary.blocks > 0 =>
                {
                    self.echo_last()?;
                }
                Packet::Oack(_) if self.role == Role::Client && self.summary.blocks == 0 => {
                    self.echo_last()?;
                }
                Packet::Data { block_num, .. } => {
                    return Err(self.fail_protocol(format!(
                        "expected DATA {expected}, got DATA {block_num}"
                    )));
                }
                other => {
                    return Err(self.fail_protocol(format!(
                        "expected DATA {expected}, got {}",
                        other.opcode()
                    )));
                }
            }
        }
    }

    /// Waits for ACK `n`, ignoring a repeat of the previous ACK.
    fn expect_ack(&mut self, n: u16) -> Result<(), TransferError> {
        loop {
            match self.await_reply()? {
                Packet::Ack(block) if block == n => return Ok(()),
                Packet::Ack(block) if block == n.wrapping_sub(1) => {
                    log::debug!("Ignoring duplicate ACK {} from {}", block, self.peer);
                }
                Packet::Oack(_) if self.role == Role::Client && n == 1 => {}
                Packet::Ack(block) => {
                    return Err(self.fail_protocol(format!("expected ACK {n}, got ACK {block}")));
                }
                other => {
                    return Err(
                        self.fail_protocol(format!("expected ACK {n}, got {}", other.opcode()))
                    );
                }
            }
        }
    }

    /// Waits for the next valid packet from the peer.
    ///
    /// Timeouts and undecodable packets retransmit the last packet and spend
    /// one retry each. Datagrams from other endpoints are answered with
    /// ERROR 5 and otherwise ignored. An ERROR from the peer ends the
    /// transfer without a reply.
    fn await_reply(&mut self) -> Result<Packet, TransferError> {
        loop {
            let now = Instant::now();
            if now >= self.deadline {
                self.retransmit(true)?;
                continue;
            }
            self.socket.set_read_timeout(self.deadline - now)?;

            let (len, from) = match self.socket.recv_from(&mut self.buf) {
                Ok(received) => received,
                Err(e) if is_timeout(&e) || e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            };

            if !self.accept_source(from) {
                log::warn!("Packet from unknown transfer ID {} (expected {})", from, self.peer);
                self.send_to(
                    &Packet::error(ErrorCode::UnknownTransferId, "Unknown transfer ID"),
                    from,
                );
                continue;
            }

            match Packet::decode_observed(&self.buf[..len], from, self.observer.as_ref()) {
                Ok(Packet::Error { code, msg }) => return Err(TransferError::Peer { code, msg }),
                Ok(packet) => return Ok(packet),
                Err(e) => {
                    log::warn!("Malformed packet from {}: {}", from, e);
                    self.retransmit(false)?;
                }
            }
        }
    }

    fn accept_source(&mut self, from: SocketAddr) -> bool {
        if self.peer_locked {
            return from == self.peer;
        }
        if from.ip() == self.peer.ip() {
            self.peer = from;
            self.peer_locked = true;
            return true;
        }
        false
    }

    fn transmit(&mut self, packet: &Packet) -> Result<(), TransferError> {
        let bytes = packet.encode()?;
        self.socket.send_to(&bytes, self.peer)?;
        self.observer.on_message(packet, self.peer, PacketDirection::Sent);
        self.last_sent = bytes;
        self.deadline = Instant::now() + self.retry.timeout;
        Ok(())
    }

    /// Sends the last packet again after a timeout or a garbled reply.
    fn retransmit(&mut self, expired: bool) -> Result<(), TransferError> {
        if !self.retry.spend(expired) {
            return Err(TransferError::Timeout {
                block: self.block,
                retries: self.retry.max,
            });
        }
        log::debug!(
            "Retransmitting to {} for block {} ({} retries left)",
            self.peer,
            self.block,
            self.retry.left
        );
        self.socket.send_to(&self.last_sent, self.peer)?;
        self.summary.retransmissions += 1;
        self.deadline = Instant::now() + self.retry.timeout;
        Ok(())
    }

    /// Repeats the last packet in answer to a duplicate, without spending a
    /// retry or extending the current wait.
    fn echo_last(&mut self) -> Result<(), TransferError> {
        self.socket.send_to(&self.last_sent, self.peer)?;
        self.summary.retransmissions += 1;
        Ok(())
    }

    /// Best-effort ERROR to the peer.
    fn notify(&self, code: ErrorCode, msg: &str) {
        self.send_to(&Packet::error(code, msg), self.peer);
    }

    fn send_to(&self, packet: &Packet, to: SocketAddr) {
        let sent = match packet.encode() {
            Ok(bytes) => self.socket.send_to(&bytes, to).map_err(TransferError::from),
            Err(e) => Err(e.into()),
        };
        match sent {
            Ok(()) => self.observer.on_message(packet, to, PacketDirection::Sent),
            Err(e) => log::debug!("Failed to send {} to {}: {}", packet.opcode(), to, e),
        }
    }

    fn fail_protocol(&mut self, msg: String) -> TransferError {
        self.notify(ErrorCode::IllegalOperation, &msg);
        self.state = State::Failed;
        TransferError::Protocol(msg)
    }

    fn local_failure(&mut self, err: io::Error) -> TransferError {
        self.notify(ErrorCode::from_io_error(&err), &err.to_string());
        self.state = State::Failed;
        TransferError::Io(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tftp::core::observer::NoopObserver;
    use crate::tftp::core::options::RequestType;
    use crate::tftp::core::socket::ChannelSocket;
    use std::thread;

    fn addrs() -> (SocketAddr, SocketAddr) {
        (
            "127.0.0.1:40000".parse().unwrap(),
            "127.0.0.1:50000".parse().unwrap(),
        )
    }

    fn private(retries: u32, timeout: Duration) -> OptionsPrivate {
        OptionsPrivate { retries, timeout }
    }

    fn server(
        socket: ChannelSocket,
        peer: SocketAddr,
        private: &OptionsPrivate,
    ) -> Transfer<ChannelSocket> {
        Transfer::new(
            socket,
            peer,
            Role::Server,
            Mode::Octet,
            private,
            Arc::new(NoopObserver),
        )
    }

    fn client(socket: ChannelSocket, peer: SocketAddr, mode: Mode) -> Transfer<ChannelSocket> {
        Transfer::new(
            socket,
            peer,
            Role::Client,
            mode,
            &OptionsPrivate::default(),
            Arc::new(NoopObserver),
        )
    }

    fn rrq(options: &OptionSet, mode: Mode) -> Packet {
        Packet::Rrq {
            filename: "file.bin".into(),
            mode,
            options: options.clone(),
        }
    }

    fn recv(socket: &ChannelSocket) -> Packet {
        let (bytes, _) = socket.recv_timeout(Duration::from_secs(5)).unwrap();
        Packet::decode(&bytes).unwrap()
    }

    fn send(socket: &ChannelSocket, packet: Packet, to: SocketAddr) {
        socket.send_to(&packet.encode().unwrap(), to).unwrap();
    }

    /// Runs a server-side RRQ against a client-side download over a channel pair.
    fn download_over_channel(
        data: Vec<u8>,
        offered: OptionSet,
        mode: Mode,
    ) -> (SessionResult, SessionResult, Vec<u8>) {
        let (client_addr, server_addr) = addrs();
        let (client_socket, server_socket) = ChannelSocket::pair(client_addr, server_addr);

        let offer = offered.clone();
        let server_thread = thread::spawn(move || {
            let (request, _) = server_socket.recv_timeout(Duration::from_secs(5)).unwrap();
            let Packet::Rrq { mode, .. } = Packet::decode(&request).unwrap() else {
                panic!("expected RRQ");
            };
            let mut transfer = Transfer::new(
                server_socket,
                client_addr,
                Role::Server,
                mode,
                &OptionsPrivate::default(),
                Arc::new(NoopObserver),
            );
            let offer = if offer.is_empty() {
                None
            } else {
                let (negotiated, accepted) = OptionsProtocol::negotiate(
                    &offer,
                    RequestType::Read(data.len() as u64),
                    |_| true,
                )
                .unwrap();
                transfer.apply(&negotiated);
                Some(accepted)
            };
            transfer.serve_read(data.as_slice(), offer)
        });

        let mut received = Vec::new();
        let mut transfer = client(client_socket, server_addr, mode);
        let client_result = transfer.download(&rrq(&offered, mode), &offered, &mut received);
        let server_result = server_thread.join().unwrap();
        (server_result, client_result, received)
    }

    #[test]
    fn test_download_1000_bytes() {
        let data: Vec<u8> = (0..1000).map(|i| (i % 251) as u8).collect();
        let (server, client, received) =
            download_over_channel(data.clone(), OptionSet::new(), Mode::Octet);

        let server = server.unwrap();
        let client = client.unwrap();
        assert_eq!(received, data);
        assert_eq!(server.blocks, 2);
        assert_eq!(client.blocks, 2);
        assert_eq!(client.bytes, 1000);
        assert_eq!(client.block_size, 512);
    }

    #[test]
    fn test_exact_multiple_sends_empty_block() {
        let data = vec![0x5a; 1024];
        let (server, client, received) =
            download_over_channel(data.clone(), OptionSet::new(), Mode::Octet);

        assert_eq!(received, data);
        assert_eq!(server.unwrap().blocks, 3);
        assert_eq!(client.unwrap().blocks, 3);
    }

    #[test]
    fn test_block_number_wraps() {
        let mut offered = OptionSet::new();
        offered.push("blksize", "8");
        // 65537 full blocks followed by a short one
        let data: Vec<u8> = (0..(65537 * 8 + 3)).map(|i| (i % 256) as u8).collect();
        let (server, client, received) = download_over_channel(data.clone(), offered, Mode::Octet);

        let client = client.unwrap();
        assert_eq!(server.unwrap().blocks, 65538);
        assert_eq!(client.blocks, 65538);
        assert_eq!(client.block_size, 8);
        assert_eq!(received, data);
    }

    #[test]
    fn test_netascii_download_over_boundaries() {
        let mut offered = OptionSet::new();
        offered.push("blksize", "9");
        let data = b"one\r\ntwo\nthree\rfour\n\n\r\r".repeat(7);
        let (server, client, received) =
            download_over_channel(data.clone(), offered, Mode::Netascii);

        server.unwrap();
        client.unwrap();
        assert_eq!(received, data);
    }

    #[test]
    fn test_retry_exhaustion() {
        let (client_addr, server_addr) = addrs();
        let (client_socket, server_socket) = ChannelSocket::pair(client_addr, server_addr);

        let mut transfer = server(
            server_socket,
            client_addr,
            &private(3, Duration::from_millis(5)),
        );
        let err = transfer.serve_read(b"short".as_slice(), None).unwrap_err();

        assert!(matches!(err, TransferError::Timeout { block: 1, retries: 3 }));
        assert_eq!(transfer.state(), State::Failed);

        let sent = client_socket.drain();
        // one original send plus three retransmissions
        assert_eq!(sent.len(), 4);
        for (bytes, _) in sent {
            assert_eq!(
                Packet::decode(&bytes).unwrap(),
                Packet::Data {
                    block_num: 1,
                    data: b"short".to_vec()
                }
            );
        }
    }

    #[test]
    fn test_server_download_backs_off() {
        let mut retry = Retry::new(&private(5, Duration::from_secs(100)));
        retry.backoff = true;
        assert!(retry.spend(true));
        assert_eq!(retry.timeout, Duration::from_secs(200));
        assert!(retry.spend(true));
        assert_eq!(retry.timeout, MAX_BACKOFF);
        assert!(retry.spend(false));
        assert_eq!(retry.timeout, MAX_BACKOFF);
        retry.reset();
        assert_eq!(retry.left, 5);
    }

    #[test]
    fn test_wrong_block_is_rejected() {
        let (client_addr, server_addr) = addrs();
        let (client_socket, server_socket) = ChannelSocket::pair(client_addr, server_addr);

        let handle = thread::spawn(move || {
            let mut transfer = server(server_socket, client_addr, &OptionsPrivate::default());
            let result = transfer.serve_read(vec![1u8; 600].as_slice(), None);
            (result, transfer.state())
        });

        assert!(matches!(recv(&client_socket), Packet::Data { block_num: 1, .. }));
        send(&client_socket, Packet::Ack(7), server_addr);
        assert!(matches!(
            recv(&client_socket),
            Packet::Error {
                code: ErrorCode::IllegalOperation,
                ..
            }
        ));

        let (result, state) = handle.join().unwrap();
        assert!(matches!(result, Err(TransferError::Protocol(_))));
        assert_eq!(state, State::Failed);
    }

    #[test]
    fn test_peer_error_is_not_answered() {
        let (client_addr, server_addr) = addrs();
        let (client_socket, server_socket) = ChannelSocket::pair(client_addr, server_addr);

        let handle = thread::spawn(move || {
            let mut transfer = server(server_socket, client_addr, &OptionsPrivate::default());
            transfer.serve_read(vec![1u8; 600].as_slice(), None)
        });

        recv(&client_socket);
        send(
            &client_socket,
            Packet::error(ErrorCode::DiskFull, "no room"),
            server_addr,
        );

        let result = handle.join().unwrap();
        assert!(matches!(
            result,
            Err(TransferError::Peer {
                code: ErrorCode::DiskFull,
                ..
            })
        ));
        assert!(client_socket.drain().is_empty());
    }

    #[test]
    fn test_duplicate_ack_and_foreign_tid_are_ignored() {
        let (client_addr, server_addr) = addrs();
        let (client_socket, server_socket) = ChannelSocket::pair(client_addr, server_addr);
        let intruder = server_socket.sender();

        let handle = thread::spawn(move || {
            let mut transfer = server(server_socket, client_addr, &OptionsPrivate::default());
            transfer.serve_read(vec![2u8; 700].as_slice(), None)
        });

        assert!(matches!(recv(&client_socket), Packet::Data { block_num: 1, .. }));
        send(&client_socket, Packet::Ack(1), server_addr);
        assert!(matches!(recv(&client_socket), Packet::Data { block_num: 2, .. }));

        let stranger: SocketAddr = "127.0.0.1:45000".parse().unwrap();
        intruder
            .send((Packet::Ack(2).encode().unwrap(), stranger))
            .unwrap();
        send(&client_socket, Packet::Ack(1), server_addr);
        send(&client_socket, Packet::Ack(2), server_addr);

        let summary = handle.join().unwrap().unwrap();
        assert_eq!(summary.blocks, 2);
        assert_eq!(summary.bytes, 700);
    }

    #[test]
    fn test_upload_with_oack() {
        let (client_addr, server_addr) = addrs();
        let (client_socket, server_socket) = ChannelSocket::pair(client_addr, server_addr);

        let mut offered = OptionSet::new();
        offered.push("blksize", "16");
        offered.push("tsize", "40");
        let offer = offered.clone();

        let handle = thread::spawn(move || {
            let (request, _) = server_socket.recv_timeout(Duration::from_secs(5)).unwrap();
            let Packet::Wrq { options, .. } = Packet::decode(&request).unwrap() else {
                panic!("expected WRQ");
            };
            let (negotiated, accepted) = OptionsProtocol::negotiate(
                &options,
                RequestType::Write,
                |n| n <= 1000,
            )
            .unwrap();
            let mut transfer = server(server_socket, client_addr, &OptionsPrivate::default());
            transfer.apply(&negotiated);
            let mut sink = Vec::new();
            let result = transfer.serve_write(&mut sink, Some(accepted));
            (result, sink)
        });

        let data: Vec<u8> = (0..40).collect();
        let request = Packet::Wrq {
            filename: "up.bin".into(),
            mode: Mode::Octet,
            options: offer.clone(),
        };
        let mut transfer = client(client_socket, server_addr, Mode::Octet);
        let summary = transfer.upload(&request, &offer, data.as_slice()).unwrap();
        assert_eq!(summary.block_size, 16);
        assert_eq!(summary.blocks, 3);

        let (result, sink) = handle.join().unwrap();
        assert_eq!(result.unwrap().blocks, 3);
        assert_eq!(sink, data);
    }

    struct Broken(io::ErrorKind);

    impl Read for Broken {
        fn read(&mut self, _: &mut [u8]) -> io::Result<usize> {
            Err(self.0.into())
        }
    }

    impl Write for Broken {
        fn write(&mut self, _: &[u8]) -> io::Result<usize> {
            Err(self.0.into())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_read_error_is_reported() {
        let (client_addr, server_addr) = addrs();
        let (client_socket, server_socket) = ChannelSocket::pair(client_addr, server_addr);

        let mut transfer = server(server_socket, client_addr, &OptionsPrivate::default());
        let source = Broken(io::ErrorKind::PermissionDenied);
        let err = transfer.serve_read(source, None).unwrap_err();

        assert!(matches!(err, TransferError::Io(_)));
        assert_eq!(transfer.state(), State::Failed);
        assert!(matches!(
            recv(&client_socket),
            Packet::Error {
                code: ErrorCode::AccessViolation,
                ..
            }
        ));
        assert!(client_socket.drain().is_empty());
    }

    #[test]
    fn test_write_error_reports_disk_full() {
        let (client_addr, server_addr) = addrs();
        let (client_socket, server_socket) = ChannelSocket::pair(client_addr, server_addr);

        let handle = thread::spawn(move || {
            let mut transfer = server(server_socket, client_addr, &OptionsPrivate::default());
            transfer.serve_write(Broken(io::ErrorKind::StorageFull), None)
        });

        assert_eq!(recv(&client_socket), Packet::Ack(0));
        send(
            &client_socket,
            Packet::Data {
                block_num: 1,
                data: b"last".to_vec(),
            },
            server_addr,
        );
        assert!(matches!(
            recv(&client_socket),
            Packet::Error {
                code: ErrorCode::DiskFull,
                ..
            }
        ));
        assert!(matches!(handle.join().unwrap(), Err(TransferError::Io(_))));
    }

    #[test]
    fn test_garbage_spends_a_retry() {
        let (client_addr, server_addr) = addrs();
        let (client_socket, server_socket) = ChannelSocket::pair(client_addr, server_addr);

        let handle = thread::spawn(move || {
            // long enough that only the garbage can trigger a resend
            let mut transfer = server(
                server_socket,
                client_addr,
                &private(1, Duration::from_secs(5)),
            );
            transfer.serve_read(b"short".as_slice(), None)
        });

        let garbage = [0u8, 9, 0, 0];
        assert!(matches!(recv(&client_socket), Packet::Data { block_num: 1, .. }));
        client_socket.send_to(&garbage, server_addr).unwrap();
        assert!(matches!(recv(&client_socket), Packet::Data { block_num: 1, .. }));
        client_socket.send_to(&garbage, server_addr).unwrap();

        let result = handle.join().unwrap();
        assert!(matches!(result, Err(TransferError::Timeout { block: 1, retries: 1 })));
        assert!(client_socket.drain().is_empty());
    }

    #[test]
    fn test_duplicate_data_is_reacked() {
        let (client_addr, server_addr) = addrs();
        let (client_socket, server_socket) = ChannelSocket::pair(client_addr, server_addr);

        let handle = thread::spawn(move || {
            let mut transfer = server(server_socket, client_addr, &OptionsPrivate::default());
            let mut sink = Vec::new();
            let result = transfer.serve_write(&mut sink, None);
            (result, sink)
        });

        let first = Packet::Data {
            block_num: 1,
            data: vec![7; 512],
        };
        assert_eq!(recv(&client_socket), Packet::Ack(0));
        send(&client_socket, first.clone(), server_addr);
        assert_eq!(recv(&client_socket), Packet::Ack(1));
        // as if that ACK had been lost
        send(&client_socket, first, server_addr);
        assert_eq!(recv(&client_socket), Packet::Ack(1));
        send(
            &client_socket,
            Packet::Data {
                block_num: 2,
                data: vec![8; 10],
            },
            server_addr,
        );
        assert_eq!(recv(&client_socket), Packet::Ack(2));

        let (result, sink) = handle.join().unwrap();
        let summary = result.unwrap();
        assert_eq!(summary.blocks, 2);
        assert_eq!(summary.retransmissions, 1);
        assert_eq!(sink.len(), 522);
        assert_eq!(&sink[..512], &[7; 512][..]);
        assert_eq!(&sink[512..], &[8; 10][..]);
    }

    #[test]
    fn test_client_rejects_unrequested_option() {
        let (client_addr, server_addr) = addrs();
        let (client_socket, server_socket) = ChannelSocket::pair(client_addr, server_addr);

        let handle = thread::spawn(move || {
            let mut transfer = client(client_socket, server_addr, Mode::Octet);
            let mut sink = Vec::new();
            transfer.download(&rrq(&OptionSet::new(), Mode::Octet), &OptionSet::new(), &mut sink)
        });

        assert!(matches!(recv(&server_socket), Packet::Rrq { .. }));
        let mut acked = OptionSet::new();
        acked.push("blksize", "1024");
        send(&server_socket, Packet::Oack(acked), client_addr);
        assert!(matches!(
            recv(&server_socket),
            Packet::Error {
                code: ErrorCode::OptionNegotiationFailed,
                ..
            }
        ));
        assert!(matches!(
            handle.join().unwrap(),
            Err(TransferError::Negotiation(OptionError::Unrequested(_)))
        ));
    }
}
