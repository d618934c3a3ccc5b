// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Streaming VCDIFF (RFC 3284) delta compression against a fixed dictionary.
//!
//! The encoder produces windows whose source segment is the whole dictionary, using the
//! default code table. The decoder accepts any delta using the default code table without
//! secondary compression, including the Adler-32 window checksum extension.

mod address_cache;
mod code_table;
mod decoder;
mod encoder;
mod varint;

use std::sync::Arc;

use bytes::Bytes;

pub use decoder::{DecodeError, Decoder};
pub use encoder::{EncodeError, Encoder, HashedDictionary};

const MAGIC: [u8; 3] = [0xd6, 0xc3, 0xc4];
const VERSION_STANDARD: u8 = 0x00;
/// Marks a stream that uses format extensions (here, window checksums).
const VERSION_CHECKSUM: u8 = b'S';

const VCD_DECOMPRESS: u8 = 0x01;
const VCD_CODETABLE: u8 = 0x02;

const VCD_SOURCE: u8 = 0x01;
const VCD_TARGET: u8 = 0x02;
const VCD_CHECKSUM: u8 = 0x04;

/// Upper bound on a single target window, in bytes.
pub const MAX_WINDOW_SIZE: usize = 1 << 24;

/// Optional format features used when encoding.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FormatFlags {
    /// Append an Adler-32 checksum of each target window.
    pub checksum: bool,
}

fn magic(flags: FormatFlags) -> [u8; 4] {
    let version = if flags.checksum {
        VERSION_CHECKSUM
    } else {
        VERSION_STANDARD
    };
    [MAGIC[0], MAGIC[1], MAGIC[2], version]
}

fn adler32(bytes: &[u8]) -> u32 {
    const MOD: u32 = 65521;
    // Largest run of bytes that cannot overflow the sums before reduction.
    const NMAX: usize = 5552;
    let (mut a, mut b) = (1u32, 0u32);
    for chunk in bytes.chunks(NMAX) {
        for &byte in chunk {
            a += u32::from(byte);
            b += a;
        }
        a %= MOD;
        b %= MOD;
    }
    (b << 16) | a
}

/// Encodes `target` against `dictionary` in one shot.
pub fn encode(dictionary: &Bytes, target: &[u8], checksum: bool) -> Result<Vec<u8>, EncodeError> {
    let hashed = Arc::new(HashedDictionary::new(dictionary.clone())?);
    let mut encoder = Encoder::new(hashed, FormatFlags { checksum });
    let mut out = vec![];
    encoder.encode_chunk(target, &mut out)?;
    encoder.finish(&mut out)?;
    Ok(out)
}

/// Decodes a complete `delta` against `dictionary` in one shot.
pub fn decode(dictionary: &Bytes, delta: &[u8]) -> Result<Vec<u8>, DecodeError> {
    let mut decoder = Decoder::new(dictionary.clone());
    let mut out = vec![];
    decoder.decode_chunk(delta, &mut out)?;
    decoder.finish()?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adler32_known_value() {
        assert_eq!(adler32(b"Wikipedia"), 0x11e6_0398);
        assert_eq!(adler32(b""), 1);
    }

    #[test]
    fn quick_brown_fox() {
        let dictionary = Bytes::from_static(b"The quick brown fox jumps over the lazy dog.");
        let target = b"The quick brown fox jumps over the lazy dog. Again.";
        let delta = encode(&dictionary, target, false).unwrap();
        assert_eq!(decode(&dictionary, &delta).unwrap(), target);
    }

    #[test]
    fn chunked_encoding_matches_target() {
        let dictionary = Bytes::from(
            (0..4096u32)
                .flat_map(|i| (i * 7919 % 251).to_le_bytes())
                .collect::<Vec<u8>>(),
        );
        let target: Vec<u8> = dictionary[100..3000]
            .iter()
            .chain(b"some new bytes")
            .chain(&dictionary[50..900])
            .copied()
            .collect();

        let hashed = Arc::new(HashedDictionary::new(dictionary.clone()).unwrap());
        let mut encoder = Encoder::new(hashed, FormatFlags { checksum: true });
        let mut delta = vec![];
        for chunk in target.chunks(333) {
            encoder.encode_chunk(chunk, &mut delta).unwrap();
        }
        encoder.finish(&mut delta).unwrap();

        assert!(delta.len() < target.len() / 4);
        assert_eq!(decode(&dictionary, &delta).unwrap(), target);
    }

    quickcheck::quickcheck! {
        fn round_trip(dictionary: Vec<u8>, target: Vec<u8>, checksum: bool) -> bool {
            let dictionary = Bytes::from(dictionary);
            let delta = encode(&dictionary, &target, checksum).unwrap();
            decode(&dictionary, &delta).unwrap() == target
        }

        fn round_trip_with_shared_content(dictionary: Vec<u8>, prefix: Vec<u8>, checksum: bool) -> bool {
            let dictionary = Bytes::from(dictionary);
            let mut target = prefix;
            target.extend_from_slice(&dictionary);
            target.extend_from_slice(&dictionary);
            let delta = encode(&dictionary, &target, checksum).unwrap();
            decode(&dictionary, &delta).unwrap() == target
        }
    }
}
