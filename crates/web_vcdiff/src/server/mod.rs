// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Server side: a streaming response-writer abstraction, the diff-encoding middleware built
//! on it, and a bridge to hyper.

mod encode;
pub(crate) mod multipart;
mod service;

use bytes::Bytes;
use http::header::{
    HeaderValue, CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_TYPE, ETAG, IF_NONE_MATCH,
};
use http::{HeaderMap, Method, Request, StatusCode};
use http_body_util::combinators::UnsyncBoxBody;
use sha2::{Digest, Sha256};

use crate::codec::CodecError;
use crate::BoxError;

pub use encode::{
    DiffEncodingWriter, EncodeConfig, IntegrityAdvertisement, Strategy, VcdiffHandler,
};
pub use service::respond;

/// Request body handed to a [`Handler`].
pub type RequestBody = UnsyncBoxBody<Bytes, BoxError>;

#[derive(Debug, Clone, thiserror::Error)]
pub enum WriteError {
    #[error("client went away")]
    Disconnected,
    #[error("response is already closed")]
    Closed,
    #[error("response was aborted")]
    Aborted,
    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Sink for one streamed HTTP response.
///
/// The status line and headers are committed by [`write_header`](Self::write_header) or, if
/// that is never called, by the first [`write`](Self::write) with a 200 status. Header changes
/// after the commit have no effect.
#[async_trait::async_trait]
pub trait ResponseWriter: Send {
    fn headers_mut(&mut self) -> &mut HeaderMap;

    /// Commits the status and headers. Calls after the first are ignored.
    async fn write_header(&mut self, status: StatusCode);

    /// Writes all of `bytes` to the body, returning how many were written.
    async fn write(&mut self, bytes: &[u8]) -> Result<usize, WriteError>;

    /// Terminates the response abruptly, so the client sees a failed transfer instead of a
    /// truncated body that looks complete.
    async fn abort(&mut self, error: BoxError);

    /// Flushing support, if the underlying transport has any.
    fn flusher(&mut self) -> Option<&mut dyn Flush> {
        None
    }

    /// Support for `103 Early Hints`, if the underlying transport has any.
    fn early_hints(&mut self) -> Option<&mut dyn EarlyHints> {
        None
    }
}

#[async_trait::async_trait]
pub trait Flush: Send {
    /// Sends everything written so far, committing headers first if necessary.
    async fn flush(&mut self) -> Result<(), WriteError>;
}

#[async_trait::async_trait]
pub trait EarlyHints: Send {
    /// Sends a `103 Early Hints` interim response carrying `hints`.
    async fn send_hints(&mut self, hints: HeaderMap) -> Result<(), WriteError>;
}

/// Produces responses through a [`ResponseWriter`].
#[async_trait::async_trait]
pub trait Handler: Send + Sync {
    async fn serve(&self, request: Request<RequestBody>, writer: &mut dyn ResponseWriter);
}

/// Replaces whatever the response was going to be with a plain text error.
///
/// Only meaningful before the response has been committed.
pub async fn error_response(writer: &mut dyn ResponseWriter, status: StatusCode) {
    let headers = writer.headers_mut();
    for name in [CONTENT_LENGTH, CONTENT_ENCODING, ETAG] {
        headers.remove(name);
    }
    headers.insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    writer.write_header(status).await;
    let _ = writer.write(status.to_string().as_bytes()).await;
}

/// Serves the same bytes for every request, with a strong `ETag`.
///
/// The smallest useful [`Handler`]: wrap it in a [`VcdiffHandler`] to stand up a fixed
/// diff-encoding origin in tests and examples.
#[derive(Debug, Clone)]
pub struct StaticContent {
    content_type: HeaderValue,
    etag: HeaderValue,
    body: Bytes,
}

impl StaticContent {
    pub fn new(content_type: &'static str, body: impl Into<Bytes>) -> Self {
        let body = body.into();
        let etag = format!("\"{}\"", hex::encode(&Sha256::digest(&body)[..8]));
        Self {
            content_type: HeaderValue::from_static(content_type),
            etag: HeaderValue::try_from(etag).unwrap_or(HeaderValue::from_static("\"\"")),
            body,
        }
    }

    fn matches(&self, if_none_match: &HeaderValue) -> bool {
        let Ok(tags) = if_none_match.to_str() else {
            return false;
        };
        let etag = self.etag.as_bytes();
        tags.split(',').map(str::trim).any(|tag| {
            tag == "*" || tag.strip_prefix("W/").unwrap_or(tag).as_bytes() == etag
        })
    }
}

#[async_trait::async_trait]
impl Handler for StaticContent {
    async fn serve(&self, request: Request<RequestBody>, writer: &mut dyn ResponseWriter) {
        writer.headers_mut().insert(ETAG, self.etag.clone());
        if request
            .headers()
            .get(IF_NONE_MATCH)
            .is_some_and(|value| self.matches(value))
        {
            writer.write_header(StatusCode::NOT_MODIFIED).await;
            return;
        }

        let headers = writer.headers_mut();
        headers.insert(CONTENT_TYPE, self.content_type.clone());
        headers.insert(CONTENT_LENGTH, HeaderValue::from(self.body.len()));
        writer.write_header(StatusCode::OK).await;
        if request.method() != Method::HEAD {
            let _ = writer.write(&self.body).await;
        }
    }
}
