use std::{fmt, io, net::SocketAddr, str::FromStr};

use thiserror::Error;

use super::observer::{MessageObserver, PacketDirection};
use super::options::OptionSet;

/// Longest error text accepted on the wire, excluding the terminating NUL.
pub const MAX_ERROR_MESSAGE_LEN: usize = 512;

/// Every valid message carries at least an opcode and one more 16-bit field.
const MIN_PACKET_LEN: usize = 4;

/// Failures of the message codec.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// Fewer than 4 bytes, or a NUL-terminated field running past the end.
    #[error("packet truncated")]
    Truncated,
    #[error("unknown opcode {0}")]
    UnknownOpcode(u16),
    /// Error text longer than [`MAX_ERROR_MESSAGE_LEN`].
    #[error("error message of {0} bytes exceeds the {MAX_ERROR_MESSAGE_LEN} byte limit")]
    MessageTooLong(usize),
    #[error("unsupported transfer mode {0:?}")]
    UnsupportedMode(String),
    #[error("string field is not valid text")]
    InvalidString,
    /// An OACK must acknowledge at least one option.
    #[error("OACK carries no options")]
    EmptyOack,
}

/// Opcode carried in the first two bytes of every packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Opcode {
    Rrq = 1,
    Wrq = 2,
    Data = 3,
    Ack = 4,
    Error = 5,
    Oack = 6,
}

impl Opcode {
    pub fn as_str(self) -> &'static str {
        match self {
            Opcode::Rrq => "RRQ",
            Opcode::Wrq => "WRQ",
            Opcode::Data => "DATA",
            Opcode::Ack => "ACK",
            Opcode::Error => "ERROR",
            Opcode::Oack => "OACK",
        }
    }
}

impl TryFrom<u16> for Opcode {
    type Error = DecodeError;

    fn try_from(value: u16) -> Result<Self, DecodeError> {
        match value {
            1 => Ok(Opcode::Rrq),
            2 => Ok(Opcode::Wrq),
            3 => Ok(Opcode::Data),
            4 => Ok(Opcode::Ack),
            5 => Ok(Opcode::Error),
            6 => Ok(Opcode::Oack),
            other => Err(DecodeError::UnknownOpcode(other)),
        }
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error codes from RFC 1350, plus code 8 from RFC 2347.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ErrorCode {
    NotDefined = 0,
    FileNotFound = 1,
    AccessViolation = 2,
    DiskFull = 3,
    IllegalOperation = 4,
    UnknownTransferId = 5,
    FileAlreadyExists = 6,
    NoSuchUser = 7,
    OptionNegotiationFailed = 8,
}

impl ErrorCode {
    /// Unknown codes are folded into [`ErrorCode::NotDefined`]; the message
    /// text still reaches the operator.
    pub fn from_u16(value: u16) -> Self {
        match value {
            1 => ErrorCode::FileNotFound,
            2 => ErrorCode::AccessViolation,
            3 => ErrorCode::DiskFull,
            4 => ErrorCode::IllegalOperation,
            5 => ErrorCode::UnknownTransferId,
            6 => ErrorCode::FileAlreadyExists,
            7 => ErrorCode::NoSuchUser,
            8 => ErrorCode::OptionNegotiationFailed,
            _ => ErrorCode::NotDefined,
        }
    }

    /// Picks the code reported to the peer for a local I/O failure.
    pub fn from_io_error(err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => ErrorCode::FileNotFound,
            io::ErrorKind::PermissionDenied => ErrorCode::AccessViolation,
            io::ErrorKind::StorageFull => ErrorCode::DiskFull,
            io::ErrorKind::AlreadyExists => ErrorCode::FileAlreadyExists,
            _ => ErrorCode::NotDefined,
        }
    }

    pub fn default_message(self) -> &'static str {
        match self {
            ErrorCode::NotDefined => "Not defined",
            ErrorCode::FileNotFound => "File not found",
            ErrorCode::AccessViolation => "Access violation",
            ErrorCode::DiskFull => "Disk full or allocation exceeded",
            ErrorCode::IllegalOperation => "Illegal TFTP operation",
            ErrorCode::UnknownTransferId => "Unknown transfer ID",
            ErrorCode::FileAlreadyExists => "File already exists",
            ErrorCode::NoSuchUser => "No such user",
            ErrorCode::OptionNegotiationFailed => "Option negotiation failed",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.default_message(), *self as u16)
    }
}

/// Transfer mode named in a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    #[default]
    Octet,
    Netascii,
}

impl Mode {
    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Octet => "octet",
            Mode::Netascii => "netascii",
        }
    }
}

impl FromStr for Mode {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("octet") {
            Ok(Mode::Octet)
        } else if s.eq_ignore_ascii_case("netascii") {
            Ok(Mode::Netascii)
        } else {
            Err(DecodeError::UnsupportedMode(s.to_string()))
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One TFTP message.
///
/// ```text
/// RRQ/WRQ  | 01/02 | filename | 0 | mode | 0 | [name | 0 | value | 0]* |
/// DATA     | 03    | block    | payload                               |
/// ACK      | 04    | block    |                                       |
/// ERROR    | 05    | code     | message | 0                           |
/// OACK     | 06    | [name | 0 | value | 0]*                          |
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Rrq {
        filename: String,
        mode: Mode,
        options: OptionSet,
    },
    Wrq {
        filename: String,
        mode: Mode,
        options: OptionSet,
    },
    Data {
        block_num: u16,
        data: Vec<u8>,
    },
    Ack(u16),
    Error {
        code: ErrorCode,
        msg: String,
    },
    Oack(OptionSet),
}

impl Packet {
    /// Builds an ERROR packet, cutting `msg` down to the wire limit.
    pub fn error(code: ErrorCode, msg: &str) -> Self {
        let mut end = msg.len().min(MAX_ERROR_MESSAGE_LEN);
        while !msg.is_char_boundary(end) {
            end -= 1;
        }
        Packet::Error {
            code,
            msg: msg[..end].to_string(),
        }
    }

    pub fn opcode(&self) -> Opcode {
        match self {
            Packet::Rrq { .. } => Opcode::Rrq,
            Packet::Wrq { .. } => Opcode::Wrq,
            Packet::Data { .. } => Opcode::Data,
            Packet::Ack(_) => Opcode::Ack,
            Packet::Error { .. } => Opcode::Error,
            Packet::Oack(_) => Opcode::Oack,
        }
    }

    /// Serializes the packet into its wire form.
    ///
    /// An OACK without options is refused: its 2-byte form would not decode.
    /// Without accepted options the peer gets the plain ACK 0 / DATA 1 reply.
    pub fn encode(&self) -> Result<Vec<u8>, DecodeError> {
        let mut buf = Vec::with_capacity(MIN_PACKET_LEN);
        buf.extend_from_slice(&(self.opcode() as u16).to_be_bytes());

        match self {
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
                push_str(&mut buf, filename);
                push_str(&mut buf, mode.as_str());
                options.encode_into(&mut buf);
            }
            Packet::Data { block_num, data } => {
                buf.extend_from_slice(&block_num.to_be_bytes());
                buf.extend_from_slice(data);
            }
            Packet::Ack(block_num) => buf.extend_from_slice(&block_num.to_be_bytes()),
            Packet::Error { code, msg } => {
                if msg.len() > MAX_ERROR_MESSAGE_LEN {
                    return Err(DecodeError::MessageTooLong(msg.len()));
                }
                buf.extend_from_slice(&(*code as u16).to_be_bytes());
                push_str(&mut buf, msg);
            }
            Packet::Oack(options) => {
                if options.is_empty() {
                    return Err(DecodeError::EmptyOack);
                }
                options.encode_into(&mut buf);
            }
        }

        Ok(buf)
    }

    /// Parses a packet from a received datagram.
    pub fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        if buf.len() < MIN_PACKET_LEN {
            return Err(DecodeError::Truncated);
        }
        let opcode = Opcode::try_from(u16::from_be_bytes([buf[0], buf[1]]))?;
        let body = &buf[2..];

        match opcode {
            Opcode::Rrq | Opcode::Wrq => {
                let mut fields = Fields::new(body);
                let filename = fields.next_str()?;
                let mode = fields.next_str()?.parse()?;
                let options = OptionSet::decode(fields.rest())?;
                Ok(if opcode == Opcode::Rrq {
                    Packet::Rrq {
                        filename,
                        mode,
                        options,
                    }
                } else {
                    Packet::Wrq {
                        filename,
                        mode,
                        options,
                    }
                })
            }
            Opcode::Data => Ok(Packet::Data {
                block_num: u16::from_be_bytes([body[0], body[1]]),
                data: body[2..].to_vec(),
            }),
            Opcode::Ack => Ok(Packet::Ack(u16::from_be_bytes([body[0], body[1]]))),
            Opcode::Error => {
                let code = ErrorCode::from_u16(u16::from_be_bytes([body[0], body[1]]));
                let raw = &body[2..];
                let end = raw
                    .iter()
                    .position(|&b| b == 0)
                    .ok_or(DecodeError::Truncated)?;
                if end > MAX_ERROR_MESSAGE_LEN {
                    return Err(DecodeError::MessageTooLong(end));
                }
                let msg = String::from_utf8_lossy(&raw[..end]).into_owned();
                Ok(Packet::Error { code, msg })
            }
            Opcode::Oack => Ok(Packet::Oack(OptionSet::decode(body)?)),
        }
    }

    /// Decodes `buf` and reports the result to `observer`.
    ///
    /// The observer only sees packets that decoded successfully.
    pub fn decode_observed(
        buf: &[u8],
        peer: SocketAddr,
        observer: &dyn MessageObserver,
    ) -> Result<Self, DecodeError> {
        let packet = Self::decode(buf)?;
        observer.on_message(&packet, peer, PacketDirection::Received);
        Ok(packet)
    }
}

fn push_str(buf: &mut Vec<u8>, s: &str) {
    buf.extend_from_slice(s.as_bytes());
    buf.push(0);
}

/// Cursor over NUL-terminated string fields.
pub(crate) struct Fields<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Fields<'a> {
    pub(crate) fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.pos >= self.buf.len()
    }

    pub(crate) fn next_str(&mut self) -> Result<String, DecodeError> {
        let rest = self.rest();
        let end = rest
            .iter()
            .position(|&b| b == 0)
            .ok_or(DecodeError::Truncated)?;
        let field = std::str::from_utf8(&rest[..end]).map_err(|_| DecodeError::InvalidString)?;
        self.pos += end + 1;
        Ok(field.to_string())
    }

    pub(crate) fn rest(&self) -> &'a [u8] {
        &self.buf[self.pos.min(self.buf.len())..]
    }
}
