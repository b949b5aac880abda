use std::net::SocketAddr;

use super::packet::Packet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketDirection {
    Received,
    Sent,
}

/// Hook invoked for every packet a session decodes or sends.
///
/// Implementations only observe; they cannot alter the exchange.
pub trait MessageObserver: Send + Sync {
    fn on_message(&self, packet: &Packet, peer: SocketAddr, direction: PacketDirection);
}

/// Writes one line per packet through the `log` facade.
///
/// Requests, OACKs and errors are logged at `info`, DATA and ACK at `debug`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogObserver;

impl MessageObserver for LogObserver {
    fn on_message(&self, packet: &Packet, peer: SocketAddr, direction: PacketDirection) {
        let arrow = match direction {
            PacketDirection::Received => "<-",
            PacketDirection::Sent => "->",
        };
        match packet {
            Packet::Rrq {
                filename,
                mode,
                options,
            }
            | Packet::Wrq {
                filename,
                mode,
                options,
            } => {
                if options.is_empty() {
                    log::info!("{arrow} {} {peer} \"{filename}\" {mode}", packet.opcode());
                } else {
                    log::info!(
                        "{arrow} {} {peer} \"{filename}\" {mode} {options}",
                        packet.opcode()
                    );
                }
            }
            Packet::Data { block_num, data } => {
                log::debug!("{arrow} DATA {peer} {block_num} ({} bytes)", data.len());
            }
            Packet::Ack(block_num) => log::debug!("{arrow} ACK {peer} {block_num}"),
            Packet::Error { code, msg } => {
                log::info!("{arrow} ERROR {peer} {} \"{msg}\"", *code as u16);
            }
            Packet::Oack(options) => log::info!("{arrow} OACK {peer} {options}"),
        }
    }
}

/// Discards every notification.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl MessageObserver for NoopObserver {
    fn on_message(&self, _packet: &Packet, _peer: SocketAddr, _direction: PacketDirection) {}
}
