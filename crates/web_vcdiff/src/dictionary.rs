// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Content-addressed dictionaries and the server-side [`Dictionaries`] registry interface.

use std::fmt;
use std::io::Write;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, OnceLock};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use bytes::Bytes;
use flate2::write::GzEncoder;
use flate2::Compression;
use http::request;
use sha2::{Digest, Sha256, Sha512_256};

use crate::BoxError;

/// Length in bytes of a [`DictionaryId`].
pub const ID_LEN: usize = 16;

/// Identifies a dictionary by a truncated SHA-512/256 hash of its contents.
///
/// The textual form is unpadded URL-safe base64, and appears both in the
/// `Content-Diff-Dictionary` header and in the dictionary's URL.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct DictionaryId([u8; ID_LEN]);

/// A string that could not be parsed as a [`DictionaryId`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("invalid dictionary identifier")]
pub struct InvalidDictionaryId;

impl DictionaryId {
    pub fn compute(data: &[u8]) -> Self {
        let digest = Sha512_256::digest(data);
        let mut id = [0; ID_LEN];
        id.copy_from_slice(&digest[..ID_LEN]);
        Self(id)
    }

    pub fn encode(&self) -> String {
        URL_SAFE_NO_PAD.encode(self.0)
    }

    /// Parses the textual form, rejecting anything but exactly [`ID_LEN`] canonically
    /// encoded bytes.
    pub fn decode(token: &str) -> Result<Self, InvalidDictionaryId> {
        let bytes = URL_SAFE_NO_PAD
            .decode(token)
            .map_err(|_| InvalidDictionaryId)?;
        let id = bytes.try_into().map_err(|_| InvalidDictionaryId)?;
        Ok(Self(id))
    }

    pub fn as_bytes(&self) -> &[u8; ID_LEN] {
        &self.0
    }
}

impl fmt::Display for DictionaryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

impl fmt::Debug for DictionaryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DictionaryId({self})")
    }
}

impl FromStr for DictionaryId {
    type Err = InvalidDictionaryId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::decode(s)
    }
}

/// Lowercase hex of the first 8 bytes of the SHA-256 of `data`.
///
/// This is how dictionaries sent inline in multipart responses are named.
pub fn short_digest(data: &[u8]) -> String {
    hex::encode(&Sha256::digest(data)[..8])
}

/// Immutable dictionary bytes bound to their identifier.
pub struct Dictionary {
    id: DictionaryId,
    data: Bytes,
    short_digest: OnceLock<String>,
    gzipped: OnceLock<Option<Bytes>>,
}

impl Dictionary {
    pub fn new(data: impl Into<Bytes>) -> Self {
        let data = data.into();
        Self::from_parts(DictionaryId::compute(&data), data)
    }

    /// Pairs `data` with a previously computed identifier, e.g. from a content store.
    ///
    /// The pairing is not checked here. Everything that hands a dictionary to a client or
    /// a codec calls [`Dictionary::assert_valid`] first.
    pub fn from_parts(id: DictionaryId, data: Bytes) -> Self {
        Self {
            id,
            data,
            short_digest: OnceLock::new(),
            gzipped: OnceLock::new(),
        }
    }

    pub fn id(&self) -> DictionaryId {
        self.id
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn is_valid(&self) -> bool {
        DictionaryId::compute(&self.data) == self.id
    }

    /// # Panics
    ///
    /// Panics if the identifier does not match the contents. That can only happen if a
    /// [`Dictionaries`] implementation paired the wrong bytes with an identifier, which is
    /// a bug rather than bad input.
    pub fn assert_valid(&self) {
        if !self.is_valid() {
            panic!("dictionary {} does not match its contents", self.id);
        }
    }

    pub fn short_digest(&self) -> &str {
        self.short_digest.get_or_init(|| short_digest(&self.data))
    }

    /// Gzip-compressed contents, if that is smaller than the contents themselves.
    ///
    /// Computed on first use.
    pub fn gzipped(&self) -> Option<&Bytes> {
        self.gzipped
            .get_or_init(|| {
                let mut encoder = GzEncoder::new(Vec::new(), Compression::best());
                encoder.write_all(&self.data).ok()?;
                let compressed = encoder.finish().ok()?;
                (compressed.len() < self.data.len()).then(|| compressed.into())
            })
            .as_ref()
    }
}

impl fmt::Debug for Dictionary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dictionary")
            .field("id", &self.id)
            .field("len", &self.data.len())
            .finish()
    }
}

/// Loads a dictionary from disk.
pub async fn read_dictionary(path: impl AsRef<Path>) -> std::io::Result<Dictionary> {
    let data = tokio::fs::read(path).await?;
    Ok(Dictionary::new(data))
}

/// Source of dictionaries for the encode middleware and the dictionary registry.
#[async_trait::async_trait]
pub trait Dictionaries: Send + Sync {
    /// Chooses the dictionary to encode the response to `request` against.
    ///
    /// `Ok(None)` means the response is sent without diff-encoding.
    async fn select(&self, request: &request::Parts) -> Result<Option<Arc<Dictionary>>, BoxError>;

    /// Looks up a dictionary for a client that is fetching it by identifier.
    async fn find(&self, id: &DictionaryId) -> Result<Option<Arc<Dictionary>>, BoxError>;
}

/// Uses one dictionary for every response.
#[derive(Debug, Clone)]
pub struct FixedDictionary(Arc<Dictionary>);

impl FixedDictionary {
    pub fn new(dictionary: impl Into<Arc<Dictionary>>) -> Self {
        Self(dictionary.into())
    }
}

#[async_trait::async_trait]
impl Dictionaries for FixedDictionary {
    async fn select(&self, _: &request::Parts) -> Result<Option<Arc<Dictionary>>, BoxError> {
        Ok(Some(self.0.clone()))
    }

    async fn find(&self, id: &DictionaryId) -> Result<Option<Arc<Dictionary>>, BoxError> {
        Ok((self.0.id() == *id).then(|| self.0.clone()))
    }
}
