//! Incremental framing check for PostgreSQL binary COPY streams.
//!
//! Rows are piped from source to partition without decoding values, but the
//! framing is still walked chunk by chunk so that the engine knows how many
//! tuples went through and refuses to commit a stream that ended before its
//! trailer.
//!
//! Header: `PGCOPY\n\xff\r\n\0` (11 bytes) + flags (4 bytes) + ext_len (4 bytes) + ext.
//! Each tuple: field_count (2 bytes) + [field_len (4 bytes) + data]*, NULL = -1.
//! Trailer: field_count -1.

use crate::error::{PartitionError, Result};

/// PostgreSQL COPY binary header signature.
pub const PG_COPY_SIGNATURE: &[u8] = b"PGCOPY\n\xff\r\n\0";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Signature,
    Flags,
    ExtensionLength,
    Extension { remaining: usize },
    TupleHeader,
    FieldLength { fields_left: u16 },
    FieldData { fields_left: u16, remaining: usize },
    Done,
}

/// Walks binary COPY framing across arbitrary chunk boundaries.
#[derive(Debug)]
pub struct CopyFrameCounter {
    state: State,
    /// Partial fixed-width item (signature, length, count) split across chunks.
    partial: Vec<u8>,
    rows: u64,
    bytes: u64,
}

impl Default for CopyFrameCounter {
    fn default() -> Self {
        Self::new()
    }
}

impl CopyFrameCounter {
    pub fn new() -> Self {
        Self {
            state: State::Signature,
            partial: Vec::with_capacity(PG_COPY_SIGNATURE.len()),
            rows: 0,
            bytes: 0,
        }
    }

    /// Tuples seen so far.
    pub fn rows(&self) -> u64 {
        self.rows
    }

    /// Bytes seen so far.
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    /// True once the trailer has been read.
    pub fn is_complete(&self) -> bool {
        self.state == State::Done
    }

    /// Consume the next chunk of the stream.
    pub fn feed(&mut self, mut data: &[u8]) -> Result<()> {
        self.bytes += data.len() as u64;

        while !data.is_empty() {
            match self.state {
                State::Signature => {
                    if let Some(sig) = self.take_fixed(&mut data, PG_COPY_SIGNATURE.len()) {
                        if sig != PG_COPY_SIGNATURE {
                            return Err(framing("invalid binary COPY signature"));
                        }
                        self.state = State::Flags;
                    }
                }
                State::Flags => {
                    if self.take_fixed(&mut data, 4).is_some() {
                        self.state = State::ExtensionLength;
                    }
                }
                State::ExtensionLength => {
                    if let Some(raw) = self.take_fixed(&mut data, 4) {
                        let len = u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]) as usize;
                        self.state = if len == 0 {
                            State::TupleHeader
                        } else {
                            State::Extension { remaining: len }
                        };
                    }
                }
                State::Extension { remaining } => {
                    let left = skip(&mut data, remaining);
                    if left == 0 {
                        self.state = State::TupleHeader;
                    } else {
                        self.state = State::Extension { remaining: left };
                    }
                }
                State::TupleHeader => {
                    if let Some(raw) = self.take_fixed(&mut data, 2) {
                        let count = i16::from_be_bytes([raw[0], raw[1]]);
                        self.state = match count {
                            -1 => State::Done,
                            c if c < 0 => {
                                return Err(framing(&format!("negative field count {}", c)))
                            }
                            0 => {
                                self.rows += 1;
                                State::TupleHeader
                            }
                            c => {
                                self.rows += 1;
                                State::FieldLength {
                                    fields_left: c as u16,
                                }
                            }
                        };
                    }
                }
                State::FieldLength { fields_left } => {
                    if let Some(raw) = self.take_fixed(&mut data, 4) {
                        let len = i32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]);
                        self.state = match len {
                            -1 => next_field(fields_left),
                            l if l < 0 => {
                                return Err(framing(&format!("invalid field length {}", l)))
                            }
                            0 => next_field(fields_left),
                            l => State::FieldData {
                                fields_left,
                                remaining: l as usize,
                            },
                        };
                    }
                }
                State::FieldData {
                    fields_left,
                    remaining,
                } => {
                    let left = skip(&mut data, remaining);
                    self.state = if left == 0 {
                        next_field(fields_left)
                    } else {
                        State::FieldData {
                            fields_left,
                            remaining: left,
                        }
                    };
                }
                State::Done => {
                    return Err(framing("data after binary COPY trailer"));
                }
            }
        }
        Ok(())
    }

    /// Check the stream ended on its trailer; returns the tuple count.
    pub fn finish(&self) -> Result<u64> {
        if self.is_complete() {
            Ok(self.rows)
        } else {
            Err(framing(&format!(
                "stream ended before the binary COPY trailer after {} rows",
                self.rows
            )))
        }
    }

    /// Collect `width` bytes of a fixed-width item, possibly across calls.
    fn take_fixed(&mut self, data: &mut &[u8], width: usize) -> Option<Vec<u8>> {
        let need = width - self.partial.len();
        let take = need.min(data.len());
        self.partial.extend_from_slice(&data[..take]);
        *data = &data[take..];
        if self.partial.len() == width {
            Some(std::mem::take(&mut self.partial))
        } else {
            None
        }
    }
}

fn next_field(fields_left: u16) -> State {
    if fields_left <= 1 {
        State::TupleHeader
    } else {
        State::FieldLength {
            fields_left: fields_left - 1,
        }
    }
}

/// Advance past up to `count` bytes; returns how many are still to skip.
fn skip(data: &mut &[u8], count: usize) -> usize {
    let take = count.min(data.len());
    *data = &data[take..];
    count - take
}

fn framing(message: &str) -> PartitionError {
    PartitionError::Io(std::io::Error::new(
        std::io::ErrorKind::InvalidData,
        message.to_string(),
    ))
}
