// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

use std::sync::Arc;

use crate::codec::CodecError;
use crate::dictionary::InvalidDictionaryId;

/// Errors surfaced by the client transport and by decoded response bodies.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("while {ctx}: {status_wrap}, {retriable_wrap}: {source}", status_wrap=StatusWrapper(*status), retriable_wrap=RetriableWrapper(*retriable))]
    Request {
        ctx: String,
        /// The HTTP status code of the error, if one was received.
        status: Option<u16>,
        retriable: bool,
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
    },
    #[error("vcdiff protocol error: {error}")]
    Protocol { error: String },
    #[error("vcdiff: dictionary fetch from {url} failed: {source}")]
    DictionaryFetch {
        url: String,
        /// Shared with every other request that waited on the same fetch.
        source: Arc<ClientError>,
    },
    #[error("vcdiff: dictionary response failed subresource integrity check")]
    Integrity,
    #[error("vcdiff: {0}")]
    Codec(#[from] CodecError),
    #[error("vcdiff: malformed multipart body: {error}")]
    Multipart { error: String },
}

impl ClientError {
    pub fn protocol(error: impl Into<String>) -> Self {
        Self::Protocol {
            error: error.into(),
        }
    }

    /// Whether repeating the request might succeed. Nothing in this crate retries.
    pub fn is_retriable(&self) -> bool {
        match self {
            ClientError::Request { retriable, .. } => *retriable,
            ClientError::DictionaryFetch { .. }
            | ClientError::Protocol { .. }
            | ClientError::Integrity
            | ClientError::Codec(_)
            | ClientError::Multipart { .. } => false,
        }
    }
}

impl From<InvalidDictionaryId> for ClientError {
    fn from(err: InvalidDictionaryId) -> Self {
        Self::protocol(format!("Content-Diff-Dictionary: {err}"))
    }
}

/// Should a request that failed with `code` be retried by whoever retries?
pub fn is_retriable_status(code: u16) -> bool {
    match code {
        // Too Many Requests: backing off should help.
        429 => true,

        // Internal Server Error: generic enough that it may be intermittent.
        500 => true,

        // Service Unavailable: the quintessential "try again later" status code.
        503 => true,

        // Gateway Timeout: a gateway answered, so the origin may come back.
        504 => true,

        // 400, 401, 404 and friends won't change on their own.
        _ => false,
    }
}

struct StatusWrapper(Option<u16>);

impl std::fmt::Display for StatusWrapper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.0 {
            None => f.write_str("no status"),
            Some(status) => write!(f, "status: {status}"),
        }
    }
}

struct RetriableWrapper(bool);

impl std::fmt::Display for RetriableWrapper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.0 {
            false => f.write_str("not retriable"),
            true => f.write_str("retriable"),
        }
    }
}
