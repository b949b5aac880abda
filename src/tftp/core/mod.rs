//! TFTP protocol core
//!
//! This module contains the protocol engine shared by client and server:
//! - `packet`: wire encoding and decoding of the six message kinds
//! - `options`: option negotiation (blksize, timeout, tsize)
//! - `convert`: netascii translation and block-sized file I/O
//! - `transfer`: the lock-step state machine with its retry controller
//! - `socket`: datagram transport abstraction
//! - `storage`: file access and path policy used by the server
//! - `observer`: per-packet diagnostic hook

pub mod convert;
pub mod observer;
pub mod options;
pub mod packet;
pub mod socket;
pub mod storage;
pub mod transfer;

pub use convert::{BlockReader, BlockWriter, from_network, to_network};
pub use observer::{LogObserver, MessageObserver, NoopObserver, PacketDirection};
pub use options::{
    OptionError, OptionSet, OptionType, OptionsPrivate, OptionsProtocol, RequestType,
    TransferOption,
};
pub use packet::{DecodeError, ErrorCode, Mode, Opcode, Packet};
pub use socket::{Socket, bind_ephemeral};
pub use storage::{LocalStorage, Storage};
pub use transfer::{Role, SessionResult, State, Transfer, TransferError, TransferSummary};
