// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Boundary between the HTTP plumbing and the delta codec.
//!
//! A [`CodecSession`] owns everything the codec prepared from its dictionary, and dropping
//! the session releases it.

use std::sync::Arc;

use bytes::Bytes;

type SharedError = Arc<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Clone, thiserror::Error)]
pub enum CodecError {
    #[error("could not prepare dictionary: {0}")]
    Dictionary(#[source] SharedError),
    #[error("encoding failed: {0}")]
    Encode(#[source] SharedError),
    #[error("decoding failed: {0}")]
    Decode(#[source] SharedError),
    #[error("codec session is closed")]
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Encode { checksum: bool },
    Decode,
}

pub trait Codec: Send + Sync {
    fn open(&self, dictionary: Bytes, mode: Mode) -> Result<Box<dyn CodecSession>, CodecError>;
}

/// One encode or decode pass over a stream, bound to a single dictionary.
///
/// Once `write` fails or `finish` has been called, every later call fails with
/// [`CodecError::Closed`].
pub trait CodecSession: Send {
    fn write(&mut self, input: &[u8], output: &mut Vec<u8>) -> Result<(), CodecError>;
    fn finish(&mut self, output: &mut Vec<u8>) -> Result<(), CodecError>;
}

/// [`Codec`] backed by the [`vcdiff`] crate.
#[derive(Debug, Clone, Copy, Default)]
pub struct Vcdiff;

impl Codec for Vcdiff {
    fn open(&self, dictionary: Bytes, mode: Mode) -> Result<Box<dyn CodecSession>, CodecError> {
        Ok(match mode {
            Mode::Encode { checksum } => {
                let hashed = vcdiff::HashedDictionary::new(dictionary)
                    .map_err(|err| CodecError::Dictionary(Arc::new(err)))?;
                let flags = vcdiff::FormatFlags { checksum };
                Box::new(EncodeSession(Some(vcdiff::Encoder::new(
                    Arc::new(hashed),
                    flags,
                ))))
            }
            Mode::Decode => Box::new(DecodeSession(Some(vcdiff::Decoder::new(dictionary)))),
        })
    }
}

struct EncodeSession(Option<vcdiff::Encoder>);

impl CodecSession for EncodeSession {
    fn write(&mut self, input: &[u8], output: &mut Vec<u8>) -> Result<(), CodecError> {
        let encoder = self.0.as_mut().ok_or(CodecError::Closed)?;
        encoder.encode_chunk(input, output).map_err(|err| {
            self.0 = None;
            CodecError::Encode(Arc::new(err))
        })
    }

    fn finish(&mut self, output: &mut Vec<u8>) -> Result<(), CodecError> {
        let mut encoder = self.0.take().ok_or(CodecError::Closed)?;
        encoder
            .finish(output)
            .map_err(|err| CodecError::Encode(Arc::new(err)))
    }
}

struct DecodeSession(Option<vcdiff::Decoder>);

impl CodecSession for DecodeSession {
    fn write(&mut self, input: &[u8], output: &mut Vec<u8>) -> Result<(), CodecError> {
        let decoder = self.0.as_mut().ok_or(CodecError::Closed)?;
        decoder.decode_chunk(input, output).map_err(|err| {
            self.0 = None;
            CodecError::Decode(Arc::new(err))
        })
    }

    fn finish(&mut self, _output: &mut Vec<u8>) -> Result<(), CodecError> {
        let mut decoder = self.0.take().ok_or(CodecError::Closed)?;
        decoder
            .finish()
            .map_err(|err| CodecError::Decode(Arc::new(err)))
    }
}
