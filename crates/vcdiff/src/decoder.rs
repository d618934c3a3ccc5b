// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Streaming VCDIFF decoder.
//!
//! Input may be split at arbitrary points. Bytes are buffered until a complete window is
//! available, and each window's target is appended to the output as soon as it is decoded.

use bytes::Bytes;

use crate::address_cache::{AddressCache, AddressError};
use crate::code_table::{CodeTable, Kind};
use crate::varint::{self, VarintError};
use crate::{
    adler32, MAGIC, MAX_WINDOW_SIZE, VCD_CHECKSUM, VCD_CODETABLE, VCD_DECOMPRESS, VCD_SOURCE,
    VCD_TARGET, VERSION_CHECKSUM, VERSION_STANDARD,
};

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("not a VCDIFF stream")]
    BadMagic,
    #[error("unsupported: {0}")]
    Unsupported(&'static str),
    #[error("invalid delta: {0}")]
    Invalid(String),
    #[error("bad COPY address: {0}")]
    Address(#[from] AddressError),
    #[error("checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch { expected: u32, actual: u32 },
    #[error("delta ended in the middle of a window")]
    Truncated,
    #[error("decoder has already been finished")]
    Finished,
}

enum Step {
    NeedMore,
    Failed(DecodeError),
}

impl From<DecodeError> for Step {
    fn from(err: DecodeError) -> Self {
        Step::Failed(err)
    }
}

/// Varints in a window header may simply not have arrived yet.
fn header_varint(buf: &[u8], pos: &mut usize) -> Result<u64, Step> {
    varint::read(buf, pos).map_err(|err| match err {
        VarintError::Truncated => Step::NeedMore,
        VarintError::Overflow => Step::Failed(invalid("window header integer overflow")),
    })
}

/// Varints inside a complete window are never legitimately truncated.
fn section_varint(buf: &[u8], pos: &mut usize, what: &str) -> Result<u64, DecodeError> {
    varint::read(buf, pos).map_err(|err| invalid(format!("{what}: {err}")))
}

fn invalid(msg: impl Into<String>) -> DecodeError {
    DecodeError::Invalid(msg.into())
}

fn to_usize(value: u64, what: &str) -> Result<usize, DecodeError> {
    usize::try_from(value).map_err(|_| invalid(format!("{what} is too large")))
}

pub struct Decoder {
    dictionary: Bytes,
    code_table: CodeTable,
    pending: Vec<u8>,
    header_seen: bool,
    finished: bool,
}

impl Decoder {
    pub fn new(dictionary: Bytes) -> Self {
        Self {
            dictionary,
            code_table: CodeTable::default(),
            pending: vec![],
            header_seen: false,
            finished: false,
        }
    }

    /// Feeds more delta bytes, appending any newly decoded target bytes to `out`.
    pub fn decode_chunk(&mut self, delta: &[u8], out: &mut Vec<u8>) -> Result<(), DecodeError> {
        if self.finished {
            return Err(DecodeError::Finished);
        }
        self.pending.extend_from_slice(delta);
        loop {
            let step = if self.header_seen {
                self.decode_window(out)
            } else {
                self.decode_header()
            };
            match step {
                Ok(0) => return Ok(()),
                Ok(consumed) => {
                    self.pending.drain(..consumed);
                }
                Err(Step::NeedMore) => return Ok(()),
                Err(Step::Failed(err)) => {
                    self.finished = true;
                    return Err(err);
                }
            }
        }
    }

    /// Signals the end of the delta. Fails if a header or window was left incomplete.
    ///
    /// A delta with no bytes at all decodes to nothing.
    pub fn finish(&mut self) -> Result<(), DecodeError> {
        if self.finished {
            return Err(DecodeError::Finished);
        }
        self.finished = true;
        if self.pending.is_empty() {
            Ok(())
        } else {
            Err(DecodeError::Truncated)
        }
    }

    fn decode_header(&mut self) -> Result<usize, Step> {
        let buf = &self.pending;
        if buf.len() < 5 {
            let seen = buf.len().min(3);
            if buf[..seen] != MAGIC[..seen] {
                return Err(DecodeError::BadMagic.into());
            }
            return Err(Step::NeedMore);
        }
        if buf[..3] != MAGIC {
            return Err(DecodeError::BadMagic.into());
        }
        if buf[3] != VERSION_STANDARD && buf[3] != VERSION_CHECKSUM {
            return Err(DecodeError::Unsupported("VCDIFF version").into());
        }
        let indicator = buf[4];
        if indicator & VCD_DECOMPRESS != 0 {
            return Err(DecodeError::Unsupported("secondary compression").into());
        }
        if indicator & VCD_CODETABLE != 0 {
            return Err(DecodeError::Unsupported("application-defined code table").into());
        }
        if indicator & !(VCD_DECOMPRESS | VCD_CODETABLE) != 0 {
            return Err(invalid("unknown header indicator bits").into());
        }
        self.header_seen = true;
        Ok(5)
    }

    /// Decodes the window at the start of `pending`, returning how many bytes it occupied.
    fn decode_window(&mut self, out: &mut Vec<u8>) -> Result<usize, Step> {
        let buf = &self.pending;
        let Some(&indicator) = buf.first() else {
            return Err(Step::NeedMore);
        };
        let mut pos = 1;
        if indicator & VCD_TARGET != 0 {
            return Err(DecodeError::Unsupported("target-sourced windows").into());
        }
        if indicator & !(VCD_SOURCE | VCD_CHECKSUM) != 0 {
            return Err(invalid("unknown window indicator bits").into());
        }
        let source = if indicator & VCD_SOURCE != 0 {
            let len = to_usize(header_varint(buf, &mut pos)?, "source segment")?;
            let start = to_usize(header_varint(buf, &mut pos)?, "source position")?;
            start
                .checked_add(len)
                .and_then(|end| self.dictionary.get(start..end))
                .ok_or_else(|| invalid("source segment is outside the dictionary"))?
        } else {
            &[][..]
        };
        let delta_len = to_usize(header_varint(buf, &mut pos)?, "delta length")?;
        if delta_len > 2 * MAX_WINDOW_SIZE {
            return Err(invalid("delta encoding is too large").into());
        }
        let end = pos + delta_len;
        if buf.len() < end {
            return Err(Step::NeedMore);
        }

        let target = decode_delta(
            &self.code_table,
            source,
            &buf[pos..end],
            indicator & VCD_CHECKSUM != 0,
        )?;
        out.extend_from_slice(&target);
        Ok(end)
    }
}

fn decode_delta(
    code_table: &CodeTable,
    source: &[u8],
    delta: &[u8],
    has_checksum: bool,
) -> Result<Vec<u8>, DecodeError> {
    let mut pos = 0;
    let target_len = to_usize(section_varint(delta, &mut pos, "target length")?, "target")?;
    if target_len > MAX_WINDOW_SIZE {
        return Err(invalid("target window is too large"));
    }
    let delta_indicator = *delta.get(pos).ok_or_else(|| invalid("missing delta indicator"))?;
    pos += 1;
    if delta_indicator != 0 {
        return Err(DecodeError::Unsupported("compressed sections"));
    }
    let data_len = to_usize(section_varint(delta, &mut pos, "data length")?, "data")?;
    let inst_len = to_usize(section_varint(delta, &mut pos, "inst length")?, "inst")?;
    let addr_len = to_usize(section_varint(delta, &mut pos, "addr length")?, "addr")?;
    let checksum = if has_checksum {
        let value = section_varint(delta, &mut pos, "checksum")?;
        Some(u32::try_from(value).map_err(|_| invalid("checksum is wider than 32 bits"))?)
    } else {
        None
    };
    let sections_len = data_len
        .checked_add(inst_len)
        .and_then(|n| n.checked_add(addr_len));
    if sections_len != Some(delta.len() - pos) {
        return Err(invalid("section lengths disagree with delta length"));
    }
    let (data, rest) = delta[pos..].split_at(data_len);
    let (instructions, addresses) = rest.split_at(inst_len);

    let mut target = Vec::with_capacity(target_len);
    let mut cache = AddressCache::new();
    let (mut data_pos, mut inst_pos, mut addr_pos) = (0, 0, 0);

    while inst_pos < instructions.len() {
        let opcode = instructions[inst_pos];
        inst_pos += 1;
        for instruction in code_table.get(opcode) {
            if instruction.kind == Kind::Noop {
                continue;
            }
            let size = match instruction.size {
                0 => to_usize(
                    section_varint(instructions, &mut inst_pos, "instruction size")?,
                    "instruction size",
                )?,
                size => size as usize,
            };
            if size > target_len - target.len() {
                return Err(invalid("instructions overrun the target window"));
            }
            match instruction.kind {
                Kind::Noop => {}
                Kind::Add => {
                    let bytes = data
                        .get(data_pos..data_pos + size)
                        .ok_or_else(|| invalid("ADD overruns the data section"))?;
                    target.extend_from_slice(bytes);
                    data_pos += size;
                }
                Kind::Run => {
                    let byte = *data
                        .get(data_pos)
                        .ok_or_else(|| invalid("RUN overruns the data section"))?;
                    data_pos += 1;
                    target.resize(target.len() + size, byte);
                }
                Kind::Copy(mode) => {
                    let here = (source.len() + target.len()) as u64;
                    let address = cache.decode(mode, here, addresses, &mut addr_pos)? as usize;
                    copy(source, &mut target, address, size);
                }
            }
        }
    }

    if target.len() != target_len {
        return Err(invalid("target window is shorter than declared"));
    }
    if data_pos != data.len() || addr_pos != addresses.len() {
        return Err(invalid("unused bytes in data or address section"));
    }
    if let Some(expected) = checksum {
        let actual = adler32(&target);
        if expected != actual {
            return Err(DecodeError::ChecksumMismatch { expected, actual });
        }
    }
    Ok(target)
}

/// Copies from the concatenation of `source` and the target decoded so far. The copy may
/// overlap the bytes it produces.
fn copy(source: &[u8], target: &mut Vec<u8>, address: usize, size: usize) {
    if address + size <= source.len() {
        target.extend_from_slice(&source[address..address + size]);
        return;
    }
    for offset in 0..size {
        let at = address + offset;
        let byte = if at < source.len() {
            source[at]
        } else {
            target[at - source.len()]
        };
        target.push(byte);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_rfc_style_window_with_run_and_self_copy() {
        // Window with no source: ADD "ab", COPY 6 from address 0 (overlapping), RUN 3 'z'.
        let mut delta = vec![0xd6, 0xc3, 0xc4, 0x00, 0x00];
        let data = b"abz";
        let instructions = [3, 19, 6, 0, 3];
        let addresses = [0];
        let mut body = vec![11, 0, data.len() as u8, instructions.len() as u8, 1];
        body.extend_from_slice(data);
        body.extend_from_slice(&instructions);
        body.extend_from_slice(&addresses);
        delta.push(0);
        delta.push(body.len() as u8);
        delta.extend_from_slice(&body);

        let mut decoder = Decoder::new(Bytes::new());
        let mut out = vec![];
        decoder.decode_chunk(&delta, &mut out).unwrap();
        decoder.finish().unwrap();
        assert_eq!(out, b"ababababzzz");
    }

    #[test]
    fn byte_at_a_time_input() {
        let dictionary = Bytes::from_static(b"hello dictionary world");
        let delta = crate::encode(&dictionary, b"hello world, hello dictionary", true).unwrap();

        let mut decoder = Decoder::new(dictionary);
        let mut out = vec![];
        for byte in &delta {
            decoder.decode_chunk(std::slice::from_ref(byte), &mut out).unwrap();
        }
        decoder.finish().unwrap();
        assert_eq!(out, b"hello world, hello dictionary");
    }

    #[test]
    fn truncated_delta_fails_on_finish() {
        let dictionary = Bytes::from_static(b"0123456789");
        let delta = crate::encode(&dictionary, b"01234567890123456789", false).unwrap();

        let mut decoder = Decoder::new(dictionary);
        let mut out = vec![];
        decoder.decode_chunk(&delta[..delta.len() - 1], &mut out).unwrap();
        assert!(matches!(decoder.finish(), Err(DecodeError::Truncated)));
    }

    #[test]
    fn empty_input_is_empty_output() {
        let mut decoder = Decoder::new(Bytes::from_static(b"dict"));
        let mut out = vec![];
        decoder.decode_chunk(b"", &mut out).unwrap();
        decoder.finish().unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn rejects_garbage() {
        let mut decoder = Decoder::new(Bytes::new());
        let mut out = vec![];
        assert!(matches!(
            decoder.decode_chunk(b"<html>", &mut out),
            Err(DecodeError::BadMagic)
        ));
        assert!(matches!(
            decoder.decode_chunk(b"more", &mut out),
            Err(DecodeError::Finished)
        ));
    }

    #[test]
    fn rejects_secondary_compression() {
        let mut decoder = Decoder::new(Bytes::new());
        let mut out = vec![];
        assert!(matches!(
            decoder.decode_chunk(&[0xd6, 0xc3, 0xc4, 0x00, 0x01, 0x02], &mut out),
            Err(DecodeError::Unsupported(_))
        ));
    }

    #[test]
    fn detects_corruption_with_checksum() {
        let dictionary = Bytes::from_static(b"some dictionary text");
        let mut delta = crate::encode(&dictionary, b"literal bytes only", true).unwrap();
        let position = delta
            .windows(18)
            .position(|window| window == b"literal bytes only")
            .unwrap();
        delta[position] = b'L';

        let mut decoder = Decoder::new(dictionary);
        let mut out = vec![];
        assert!(matches!(
            decoder.decode_chunk(&delta, &mut out),
            Err(DecodeError::ChecksumMismatch { .. })
        ));
    }
}
