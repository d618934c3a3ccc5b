// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Subresource Integrity (SRI) assertions over dictionary bytes

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use sha2::{Digest, Sha256, Sha384, Sha512};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Algorithm {
    Sha256,
    Sha384,
    Sha512,
}

impl Algorithm {
    fn from_name(name: &str) -> Option<Self> {
        match name {
            "sha256" => Some(Self::Sha256),
            "sha384" => Some(Self::Sha384),
            "sha512" => Some(Self::Sha512),
            _ => None,
        }
    }

    fn bits(self) -> usize {
        match self {
            Self::Sha256 => 256,
            Self::Sha384 => 384,
            Self::Sha512 => 512,
        }
    }

    fn digest(self, content: &[u8]) -> Vec<u8> {
        match self {
            Self::Sha256 => Sha256::digest(content).to_vec(),
            Self::Sha384 => Sha384::digest(content).to_vec(),
            Self::Sha512 => Sha512::digest(content).to_vec(),
        }
    }
}

/// Checks `content` against an SRI `metadata` list such as `"sha384-abc... sha512-def..."`.
///
/// Only entries using the strongest algorithm present are considered, and `content` passes
/// if it matches any one of them. Entries with unknown algorithms are ignored, and metadata
/// without any known algorithm asserts nothing, so it passes.
pub fn verify_integrity(metadata: &str, content: &[u8]) -> bool {
    let mut strongest: Option<Algorithm> = None;
    let mut candidates = vec![];
    for entry in metadata.split_ascii_whitespace() {
        let Some((name, digest)) = entry.split_once('-') else {
            continue;
        };
        let Some(algorithm) = Algorithm::from_name(name) else {
            continue;
        };
        match strongest {
            Some(best) if best.bits() > algorithm.bits() => {}
            Some(best) if best.bits() == algorithm.bits() => candidates.push(digest),
            _ => {
                strongest = Some(algorithm);
                candidates = vec![digest];
            }
        }
    }

    let Some(algorithm) = strongest else {
        return true;
    };

    let actual = algorithm.digest(content);
    candidates.into_iter().any(|candidate| {
        // options after '?' are reserved for future use
        let encoded = candidate.split('?').next().unwrap_or_default();
        STANDARD
            .decode(encoded)
            .is_ok_and(|expected| expected.len() == actual.len() && expected == actual)
    })
}

/// Produces a `sha384` SRI assertion for `content`.
pub fn integrity_for(content: &[u8]) -> String {
    format!("sha384-{}", STANDARD.encode(Sha384::digest(content)))
}
