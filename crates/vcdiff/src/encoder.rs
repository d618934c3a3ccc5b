// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Streaming VCDIFF encoder.
//!
//! Every chunk handed to [`Encoder::encode_chunk`] becomes one (or more, if very large) target
//! windows whose source segment is the entire dictionary. Matches are found with a hash chain
//! over the dictionary; everything else is added literally.

use std::sync::Arc;

use bytes::Bytes;

use crate::address_cache::AddressCache;
use crate::code_table::{add_opcode, copy_opcode};
use crate::{adler32, varint, FormatFlags, MAX_WINDOW_SIZE, VCD_CHECKSUM, VCD_SOURCE};

/// Hashed prefix length; also the shortest COPY the encoder will emit.
const MIN_MATCH: usize = 4;
/// Bounds the work done per position when a dictionary is highly repetitive.
const MAX_CHAIN: usize = 64;
const NO_POSITION: u32 = u32::MAX;

#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    #[error("dictionary of {0} bytes is too large")]
    DictionaryTooLarge(usize),
    #[error("encoder has already been finished")]
    Finished,
}

/// A dictionary prepared for match finding.
pub struct HashedDictionary {
    data: Bytes,
    buckets: Vec<u32>,
    chain: Vec<u32>,
    mask: u32,
}

impl HashedDictionary {
    pub fn new(data: Bytes) -> Result<Self, EncodeError> {
        if data.len() >= NO_POSITION as usize {
            return Err(EncodeError::DictionaryTooLarge(data.len()));
        }
        let bucket_count = data.len().next_power_of_two().clamp(256, 1 << 20);
        let mut buckets = vec![NO_POSITION; bucket_count];
        let mut chain = vec![NO_POSITION; data.len()];
        let mask = bucket_count as u32 - 1;
        if data.len() >= MIN_MATCH {
            for pos in 0..=data.len() - MIN_MATCH {
                let bucket = (hash(&data[pos..]) & mask) as usize;
                chain[pos] = buckets[bucket];
                buckets[bucket] = pos as u32;
            }
        }
        Ok(Self {
            data,
            buckets,
            chain,
            mask,
        })
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    /// Longest dictionary match for the bytes at the start of `target`.
    fn longest_match(&self, target: &[u8]) -> Option<(usize, usize)> {
        if target.len() < MIN_MATCH {
            return None;
        }
        let mut candidate = self.buckets[(hash(target) & self.mask) as usize];
        let mut best: Option<(usize, usize)> = None;
        for _ in 0..MAX_CHAIN {
            if candidate == NO_POSITION {
                break;
            }
            let start = candidate as usize;
            let len = self.data[start..]
                .iter()
                .zip(target)
                .take_while(|(a, b)| a == b)
                .count();
            if len >= MIN_MATCH && best.map_or(true, |(_, best_len)| len > best_len) {
                best = Some((start, len));
                if len == target.len() {
                    break;
                }
            }
            candidate = self.chain[start];
        }
        best
    }
}

fn hash(bytes: &[u8]) -> u32 {
    let word = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    word.wrapping_mul(0x9e37_79b1) >> 7
}

pub struct Encoder {
    dictionary: Arc<HashedDictionary>,
    flags: FormatFlags,
    header_written: bool,
    finished: bool,
}

impl Encoder {
    pub fn new(dictionary: Arc<HashedDictionary>, flags: FormatFlags) -> Self {
        Self {
            dictionary,
            flags,
            header_written: false,
            finished: false,
        }
    }

    /// Encodes `target` and appends the delta to `out`.
    pub fn encode_chunk(&mut self, target: &[u8], out: &mut Vec<u8>) -> Result<(), EncodeError> {
        if self.finished {
            return Err(EncodeError::Finished);
        }
        if target.is_empty() {
            return Ok(());
        }
        self.write_header(out);
        for window in target.chunks(MAX_WINDOW_SIZE) {
            self.encode_window(window, out);
        }
        Ok(())
    }

    /// Completes the delta. A delta with no windows still carries the file header.
    pub fn finish(&mut self, out: &mut Vec<u8>) -> Result<(), EncodeError> {
        if self.finished {
            return Err(EncodeError::Finished);
        }
        self.write_header(out);
        self.finished = true;
        Ok(())
    }

    fn write_header(&mut self, out: &mut Vec<u8>) {
        if !self.header_written {
            self.header_written = true;
            out.extend_from_slice(&crate::magic(self.flags));
            out.push(0); // Hdr_Indicator: no secondary compressor, default code table
        }
    }

    fn encode_window(&self, target: &[u8], out: &mut Vec<u8>) {
        let source_len = self.dictionary.data.len();
        let mut sections = Sections::default();
        let mut cache = AddressCache::new();

        let mut pos = 0;
        let mut literal_start = 0;
        while pos + MIN_MATCH <= target.len() {
            match self.dictionary.longest_match(&target[pos..]) {
                Some((address, len)) => {
                    sections.add(&target[literal_start..pos]);
                    let here = (source_len + pos) as u64;
                    let mode = cache.encode(address as u64, here, &mut sections.addresses);
                    sections.copy(mode, len);
                    pos += len;
                    literal_start = pos;
                }
                None => pos += 1,
            }
        }
        sections.add(&target[literal_start..]);

        let mut indicator = 0;
        if source_len > 0 {
            indicator |= VCD_SOURCE;
        }
        if self.flags.checksum {
            indicator |= VCD_CHECKSUM;
        }

        let mut delta = Vec::with_capacity(
            sections.data.len() + sections.instructions.len() + sections.addresses.len() + 32,
        );
        varint::write(target.len() as u64, &mut delta);
        delta.push(0); // Delta_Indicator: sections are not compressed
        varint::write(sections.data.len() as u64, &mut delta);
        varint::write(sections.instructions.len() as u64, &mut delta);
        varint::write(sections.addresses.len() as u64, &mut delta);
        if self.flags.checksum {
            varint::write(u64::from(adler32(target)), &mut delta);
        }
        delta.extend_from_slice(&sections.data);
        delta.extend_from_slice(&sections.instructions);
        delta.extend_from_slice(&sections.addresses);

        out.push(indicator);
        if source_len > 0 {
            varint::write(source_len as u64, out);
            varint::write(0, out);
        }
        varint::write(delta.len() as u64, out);
        out.extend_from_slice(&delta);
    }
}

#[derive(Default)]
struct Sections {
    data: Vec<u8>,
    instructions: Vec<u8>,
    addresses: Vec<u8>,
}

impl Sections {
    fn add(&mut self, literal: &[u8]) {
        if literal.is_empty() {
            return;
        }
        let (opcode, explicit) = add_opcode(literal.len());
        self.instructions.push(opcode);
        if explicit {
            varint::write(literal.len() as u64, &mut self.instructions);
        }
        self.data.extend_from_slice(literal);
    }

    fn copy(&mut self, mode: u8, len: usize) {
        let (opcode, explicit) = copy_opcode(mode, len);
        self.instructions.push(opcode);
        if explicit {
            varint::write(len as u64, &mut self.instructions);
        }
    }
}
