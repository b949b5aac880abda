//! TFTP (Trivial File Transfer Protocol) implementation
//!
//! Implements the protocol as described by:
//! - [RFC 1350](https://www.rfc-editor.org/rfc/rfc1350) The TFTP Protocol (Revision 2)
//! - [RFC 2347](https://www.rfc-editor.org/rfc/rfc2347) TFTP Option Extension
//! - [RFC 2348](https://www.rfc-editor.org/rfc/rfc2348) TFTP Blocksize Option
//! - [RFC 2349](https://www.rfc-editor.org/rfc/rfc2349) TFTP Timeout Interval and Transfer Size Options
//!
//! ## Layout
//!
//! ```text
//! tftp/
//! ├── core/           # protocol engine
//! │   ├── packet      # message codec
//! │   ├── options     # option negotiation
//! │   ├── convert     # netascii translation
//! │   ├── transfer    # lock-step state machine, retries
//! │   ├── socket      # datagram transport
//! │   ├── storage     # file access and path policy
//! │   └── observer    # per-packet logging hook
//! │
//! ├── server/         # TFTP server
//! │   ├── server      # request listener
//! │   ├── worker      # one thread per transfer
//! │   └── config      # server configuration
//! │
//! └── client/         # TFTP client
//!     ├── client      # get / put
//!     └── config      # client configuration
//! ```
//!
//! ## Example
//!
//! ```rust,no_run
//! use tftpkit::tftp::server::{Config, Server};
//! use std::path::PathBuf;
//!
//! let config = Config::default().merge_cli(
//!     Some("0.0.0.0".to_string()),
//!     Some(6969),
//!     Some(PathBuf::from("/srv/tftp")),
//!     false,
//! );
//!
//! let server = Server::new(&config).unwrap();
//! server.listen();
//! ```

pub mod client;
pub mod core;
pub mod server;
