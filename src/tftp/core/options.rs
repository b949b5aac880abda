use std::{fmt, str::FromStr, time::Duration};

use thiserror::Error;

use super::packet::{DecodeError, Fields};

pub const DEFAULT_BLOCK_SIZE: u16 = 512;
pub const MIN_BLOCK_SIZE: u16 = 8;
pub const MAX_BLOCK_SIZE: u16 = 65464;
pub const MIN_TIMEOUT_SECS: u64 = 1;
pub const MAX_TIMEOUT_SECS: u64 = 255;

const DEFAULT_RETRIES: u32 = 5;
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Options recognised during negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionType {
    /// `blksize` (RFC 2348)
    BlockSize,
    /// `timeout` (RFC 2349)
    Timeout,
    /// `tsize` (RFC 2349)
    TransferSize,
}

impl OptionType {
    pub fn as_str(self) -> &'static str {
        match self {
            OptionType::BlockSize => "blksize",
            OptionType::Timeout => "timeout",
            OptionType::TransferSize => "tsize",
        }
    }
}

impl FromStr for OptionType {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("blksize") {
            Ok(OptionType::BlockSize)
        } else if s.eq_ignore_ascii_case("timeout") {
            Ok(OptionType::Timeout)
        } else if s.eq_ignore_ascii_case("tsize") {
            Ok(OptionType::TransferSize)
        } else {
            Err(())
        }
    }
}

impl fmt::Display for OptionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single name/value pair as it appears on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferOption {
    pub name: String,
    pub value: String,
}

/// Ordered list of options carried by a request or an OACK.
///
/// Lookups ignore ASCII case; order and spelling are kept for encoding.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OptionSet {
    options: Vec<TransferOption>,
}

impl OptionSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.options.push(TransferOption {
            name: name.into(),
            value: value.into(),
        });
    }

    /// Returns the value of the first option named `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.options
            .iter()
            .find(|opt| opt.name.eq_ignore_ascii_case(name))
            .map(|opt| opt.value.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TransferOption> {
        self.options.iter()
    }

    pub fn len(&self) -> usize {
        self.options.len()
    }

    pub fn is_empty(&self) -> bool {
        self.options.is_empty()
    }

    pub(crate) fn encode_into(&self, buf: &mut Vec<u8>) {
        for opt in &self.options {
            buf.extend_from_slice(opt.name.as_bytes());
            buf.push(0);
            buf.extend_from_slice(opt.value.as_bytes());
            buf.push(0);
        }
    }

    /// Parses the trailing `name 0 value 0` pairs of a request or OACK.
    pub(crate) fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        let mut set = Self::new();
        let mut fields = Fields::new(buf);
        while !fields.is_empty() {
            let name = fields.next_str()?;
            let value = fields.next_str()?;
            set.push(name, value);
        }
        Ok(set)
    }
}

impl fmt::Display for OptionSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, opt) in self.options.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{}={}", opt.name, opt.value)?;
        }
        Ok(())
    }
}

impl<N: Into<String>, V: Into<String>> FromIterator<(N, V)> for OptionSet {
    fn from_iter<I: IntoIterator<Item = (N, V)>>(iter: I) -> Self {
        let mut set = Self::new();
        for (name, value) in iter {
            set.push(name, value);
        }
        set
    }
}

/// Direction of the request being negotiated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestType {
    /// RRQ, carrying the size of the file about to be sent.
    Read(u64),
    Write,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OptionError {
    #[error("option {name} has non-numeric value {value:?}")]
    InvalidValue { name: OptionType, value: String },
    #[error("option {name}={value} is out of range")]
    OutOfRange { name: OptionType, value: u64 },
    #[error("not enough space for {0} bytes")]
    InsufficientSpace(u64),
    #[error("server acknowledged option {0:?} that was never requested")]
    Unrequested(String),
    #[error("server raised blksize to {acked}, above the requested {offered}")]
    BlockSizeRaised { offered: u16, acked: u16 },
}

/// Parameters agreed with the peer for one transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OptionsProtocol {
    pub block_size: u16,
    /// Reply timeout requested by the peer, if any.
    pub timeout: Option<Duration>,
    /// Advertised file size, if exchanged.
    pub transfer_size: Option<u64>,
}

impl Default for OptionsProtocol {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            timeout: None,
            transfer_size: None,
        }
    }
}

impl OptionsProtocol {
    /// Receiver-side negotiation.
    ///
    /// Walks `requested` in order. Recognised options are validated,
    /// applied, and echoed back with a canonical lower-case name and value.
    /// Unknown names are dropped, as are repeats of an option already seen.
    /// Any invalid value for a recognised option fails the whole request.
    ///
    /// An RRQ `tsize` is answered with the real file size; a WRQ `tsize` is
    /// checked with `has_space`.
    pub fn negotiate(
        requested: &OptionSet,
        request: RequestType,
        has_space: impl Fn(u64) -> bool,
    ) -> Result<(Self, OptionSet), OptionError> {
        let mut negotiated = Self::default();
        let mut accepted = OptionSet::new();

        for opt in requested.iter() {
            let Ok(kind) = opt.name.parse::<OptionType>() else {
                log::debug!("Ignoring unknown option {}={}", opt.name, opt.value);
                continue;
            };
            if accepted.contains(kind.as_str()) {
                continue;
            }

            let value = parse_value(kind, &opt.value)?;
            let value = match kind {
                OptionType::BlockSize => {
                    negotiated.block_size = check_block_size(value)?;
                    value
                }
                OptionType::Timeout => {
                    negotiated.timeout = Some(check_timeout(value)?);
                    value
                }
                OptionType::TransferSize => {
                    let size = match request {
                        RequestType::Read(size) => size,
                        RequestType::Write => {
                            if !has_space(value) {
                                return Err(OptionError::InsufficientSpace(value));
                            }
                            value
                        }
                    };
                    negotiated.transfer_size = Some(size);
                    size
                }
            };
            accepted.push(kind.as_str(), value.to_string());
        }

        Ok((negotiated, accepted))
    }

    /// Requester-side validation of an OACK against what was offered.
    pub fn from_oack(offered: &OptionSet, acked: &OptionSet) -> Result<Self, OptionError> {
        let mut negotiated = Self::default();

        for opt in acked.iter() {
            let kind = match opt.name.parse::<OptionType>() {
                Ok(kind) if offered.contains(&opt.name) => kind,
                _ => return Err(OptionError::Unrequested(opt.name.clone())),
            };
            let value = parse_value(kind, &opt.value)?;
            match kind {
                OptionType::BlockSize => {
                    let acked_size = check_block_size(value)?;
                    let offered_size = offered
                        .get(kind.as_str())
                        .and_then(|v| v.trim().parse::<u16>().ok())
                        .unwrap_or(MAX_BLOCK_SIZE);
                    if acked_size > offered_size {
                        return Err(OptionError::BlockSizeRaised {
                            offered: offered_size,
                            acked: acked_size,
                        });
                    }
                    negotiated.block_size = acked_size;
                }
                OptionType::Timeout => negotiated.timeout = Some(check_timeout(value)?),
                OptionType::TransferSize => negotiated.transfer_size = Some(value),
            }
        }

        Ok(negotiated)
    }
}

fn parse_value(kind: OptionType, value: &str) -> Result<u64, OptionError> {
    value
        .trim()
        .parse::<u64>()
        .map_err(|_| OptionError::InvalidValue {
            name: kind,
            value: value.to_string(),
        })
}

fn check_block_size(value: u64) -> Result<u16, OptionError> {
    if (MIN_BLOCK_SIZE as u64..=MAX_BLOCK_SIZE as u64).contains(&value) {
        Ok(value as u16)
    } else {
        Err(OptionError::OutOfRange {
            name: OptionType::BlockSize,
            value,
        })
    }
}

fn check_timeout(value: u64) -> Result<Duration, OptionError> {
    if (MIN_TIMEOUT_SECS..=MAX_TIMEOUT_SECS).contains(&value) {
        Ok(Duration::from_secs(value))
    } else {
        Err(OptionError::OutOfRange {
            name: OptionType::Timeout,
            value,
        })
    }
}

/// Local transfer parameters that are never sent to the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OptionsPrivate {
    /// Retransmissions allowed per exchange after the first send.
    pub retries: u32,
    /// Reply timeout used when the peer did not negotiate one.
    pub timeout: Duration,
}

impl Default for OptionsPrivate {
    fn default() -> Self {
        Self {
            retries: DEFAULT_RETRIES,
            timeout: DEFAULT_TIMEOUT,
        }
    }
}
