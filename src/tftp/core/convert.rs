//! Payload conversion between local files and DATA blocks.
//!
//! In netascii mode `\n` travels as `\r\n` and `\r` as `\r\0`. A translated
//! pair may not fit in the block being filled; its second byte is then
//! carried over and becomes the first byte of the next block, so every block
//! but the last is still exactly `block_size` bytes long.

use std::io::{self, BufWriter, Read, Write};

use super::packet::Mode;

const READ_CHUNK: usize = 8192;

/// Incremental local-to-network translator.
#[derive(Debug, Default)]
pub struct NetasciiEncoder {
    pending: Option<u8>,
}

impl NetasciiEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Translates `input` into `out` until `out` holds `limit` bytes.
    ///
    /// Returns how many input bytes were consumed. A consumed byte whose
    /// translation overflows `limit` is remembered and emitted first on the
    /// next call.
    pub fn encode(&mut self, input: &[u8], out: &mut Vec<u8>, limit: usize) -> usize {
        if out.len() < limit {
            if let Some(byte) = self.pending.take() {
                out.push(byte);
            }
        }

        let mut consumed = 0;
        for &byte in input {
            if out.len() >= limit || self.pending.is_some() {
                break;
            }
            consumed += 1;
            let second = match byte {
                b'\n' => b'\n',
                b'\r' => 0,
                other => {
                    out.push(other);
                    continue;
                }
            };
            out.push(b'\r');
            if out.len() < limit {
                out.push(second);
            } else {
                self.pending = Some(second);
            }
        }
        consumed
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }
}

/// Incremental network-to-local translator.
#[derive(Debug, Default)]
pub struct NetasciiDecoder {
    pending_cr: bool,
}

impl NetasciiDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Translates one received block. A trailing `\r` is held until the
    /// next block (or [`NetasciiDecoder::finish`]) decides what it means.
    pub fn decode(&mut self, input: &[u8], out: &mut Vec<u8>) {
        for &byte in input {
            if self.pending_cr {
                self.pending_cr = false;
                match byte {
                    b'\n' => {
                        out.push(b'\n');
                        continue;
                    }
                    0 => {
                        out.push(b'\r');
                        continue;
                    }
                    // bare CR from a sloppy peer
                    _ => out.push(b'\r'),
                }
            }
            if byte == b'\r' {
                self.pending_cr = true;
            } else {
                out.push(byte);
            }
        }
    }

    /// Flushes a lone `\r` left at the very end of the stream.
    pub fn finish(&mut self, out: &mut Vec<u8>) {
        if std::mem::take(&mut self.pending_cr) {
            out.push(b'\r');
        }
    }
}

/// Splits `data` into netascii blocks of `block_size` bytes.
///
/// The last block is always shorter than `block_size`, and is empty when the
/// translated length is an exact multiple.
pub fn to_network(data: &[u8], block_size: usize) -> Vec<Vec<u8>> {
    let mut encoder = NetasciiEncoder::new();
    let mut blocks = Vec::new();
    let mut pos = 0;
    loop {
        let mut block = Vec::with_capacity(block_size);
        pos += encoder.encode(&data[pos..], &mut block, block_size);
        let last = block.len() < block_size;
        blocks.push(block);
        if last {
            return blocks;
        }
    }
}

/// Joins received netascii blocks back into local bytes.
pub fn from_network<B: AsRef<[u8]>>(blocks: &[B]) -> Vec<u8> {
    let mut decoder = NetasciiDecoder::new();
    let mut out = Vec::new();
    for block in blocks {
        decoder.decode(block.as_ref(), &mut out);
    }
    decoder.finish(&mut out);
    out
}

/// Produces DATA payloads from a local source.
pub enum BlockReader<R> {
    Octet(R),
    Netascii {
        inner: R,
        encoder: NetasciiEncoder,
        raw: Vec<u8>,
        pos: usize,
        eof: bool,
    },
}

impl<R: Read> BlockReader<R> {
    pub fn new(inner: R, mode: Mode) -> Self {
        match mode {
            Mode::Octet => BlockReader::Octet(inner),
            Mode::Netascii => BlockReader::Netascii {
                inner,
                encoder: NetasciiEncoder::new(),
                raw: Vec::new(),
                pos: 0,
                eof: false,
            },
        }
    }

    /// Reads the next payload. Anything shorter than `size` is the last one.
    pub fn next_block(&mut self, size: usize) -> io::Result<Vec<u8>> {
        match self {
            BlockReader::Octet(inner) => {
                let mut block = Vec::with_capacity(size);
                inner.by_ref().take(size as u64).read_to_end(&mut block)?;
                Ok(block)
            }
            BlockReader::Netascii {
                inner,
                encoder,
                raw,
                pos,
                eof,
            } => {
                let mut block = Vec::with_capacity(size);
                loop {
                    *pos += encoder.encode(&raw[*pos..], &mut block, size);
                    if block.len() >= size || (*eof && *pos >= raw.len()) {
                        return Ok(block);
                    }
                    if *pos >= raw.len() {
                        raw.resize(READ_CHUNK, 0);
                        let n = loop {
                            match inner.read(raw) {
                                Ok(n) => break n,
                                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                                Err(e) => return Err(e),
                            }
                        };
                        raw.truncate(n);
                        *pos = 0;
                        *eof = n == 0;
                    }
                }
            }
        }
    }
}

/// Consumes DATA payloads into a local sink.
pub enum BlockWriter<W: Write> {
    Octet(BufWriter<W>),
    Netascii {
        inner: BufWriter<W>,
        decoder: NetasciiDecoder,
        scratch: Vec<u8>,
    },
}

impl<W: Write> BlockWriter<W> {
    pub fn new(inner: W, mode: Mode) -> Self {
        let inner = BufWriter::new(inner);
        match mode {
            Mode::Octet => BlockWriter::Octet(inner),
            Mode::Netascii => BlockWriter::Netascii {
                inner,
                decoder: NetasciiDecoder::new(),
                scratch: Vec::new(),
            },
        }
    }

    pub fn write_block(&mut self, data: &[u8]) -> io::Result<()> {
        match self {
            BlockWriter::Octet(inner) => inner.write_all(data),
            BlockWriter::Netascii {
                inner,
                decoder,
                scratch,
            } => {
                scratch.clear();
                decoder.decode(data, scratch);
                inner.write_all(scratch)
            }
        }
    }

    /// Writes out anything still buffered. Call once after the last block.
    pub fn finish(&mut self) -> io::Result<()> {
        match self {
            BlockWriter::Octet(inner) => inner.flush(),
            BlockWriter::Netascii {
                inner,
                decoder,
                scratch,
            } => {
                scratch.clear();
                decoder.finish(scratch);
                inner.write_all(scratch)?;
                inner.flush()
            }
        }
    }
}
