// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Big-endian base-128 integers, as used throughout the VCDIFF format.

/// Longest encoding of a `u64`.
pub const MAX_LEN: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum VarintError {
    #[error("integer is truncated")]
    Truncated,
    #[error("integer overflows 64 bits")]
    Overflow,
}

pub fn write(mut value: u64, out: &mut Vec<u8>) {
    let mut buf = [0u8; MAX_LEN];
    let mut pos = MAX_LEN - 1;
    buf[pos] = (value & 0x7f) as u8;
    value >>= 7;
    while value != 0 {
        pos -= 1;
        buf[pos] = 0x80 | (value & 0x7f) as u8;
        value >>= 7;
    }
    out.extend_from_slice(&buf[pos..]);
}

/// Reads an integer starting at `*pos`, advancing `*pos` past it on success.
pub fn read(buf: &[u8], pos: &mut usize) -> Result<u64, VarintError> {
    let mut value: u64 = 0;
    let mut cursor = *pos;
    loop {
        let byte = *buf.get(cursor).ok_or(VarintError::Truncated)?;
        cursor += 1;
        if value >> 57 != 0 {
            return Err(VarintError::Overflow);
        }
        value = (value << 7) | u64::from(byte & 0x7f);
        if byte & 0x80 == 0 {
            *pos = cursor;
            return Ok(value);
        }
    }
}

pub fn len(value: u64) -> usize {
    let bits = 64 - value.leading_zeros() as usize;
    bits.div_ceil(7).max(1)
}
