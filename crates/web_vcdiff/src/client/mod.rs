// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Client side: a [`Transport`] decorator that transparently decodes diff-encoded responses.

mod body;
mod cache;
mod multipart;
mod reqwest_transport;

use std::io::Read;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use flate2::read::GzDecoder;
use http::header::{HeaderValue, ACCEPT_ENCODING, CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_TYPE};
use http::{HeaderMap, Request, Response, StatusCode, Uri};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::BodyExt;
use tracing::{debug, warn};

use self::body::Source;
use self::multipart::{Event, MultipartReader};
use crate::codec::{Codec, Mode, Vcdiff};
use crate::dictionary::{short_digest, DictionaryId};
use crate::error::{is_retriable_status, ClientError};
use crate::headers::{
    ACCEPT_DIFF_DICTIONARIES, ACCEPT_DIFF_ENCODING, CONTENT_DIFF_DICTIONARY,
    CONTENT_DIFF_DICTIONARY_INTEGRITY, CONTENT_DIFF_ENCODING, VCDIFF,
};
use crate::integrity::verify_integrity;
use crate::registry::DICTIONARY_PATH;
use crate::BoxError;

pub use body::DecodedBody;
pub use cache::DictionaryCache;
pub use reqwest_transport::ReqwestTransport;

/// Response body produced by a [`Transport`].
pub type ClientBody = UnsyncBoxBody<Bytes, BoxError>;

/// Largest dictionary a client accepts, fetched or inline.
pub const MAX_DICTIONARY_SIZE: usize = 32 * 1024 * 1024;

/// Performs one HTTP exchange. Redirects are returned, not followed.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    async fn round_trip(&self, request: Request<Bytes>) -> Result<Response<ClientBody>, ClientError>;
}

#[async_trait::async_trait]
impl<T: Transport + ?Sized> Transport for Arc<T> {
    async fn round_trip(&self, request: Request<Bytes>) -> Result<Response<ClientBody>, ClientError> {
        (**self).round_trip(request).await
    }
}

/// How a response says it was diff-encoded.
#[derive(Debug, PartialEq, Eq)]
enum Dialect<'a> {
    /// `vcdiff`: the dictionary is named by `Content-Diff-Dictionary` and fetched separately.
    Reference,
    /// `vcdiff:*<digest>`: the body is multipart, with the dictionary in its first part.
    Inline(&'a str),
    /// `vcdiff:<digest>`: the dictionary was sent inline in an earlier response.
    Cached(&'a str),
}

impl<'a> Dialect<'a> {
    fn parse(encoding: &'a str) -> Option<Self> {
        let rest = encoding
            .get(..VCDIFF.len())
            .filter(|name| name.eq_ignore_ascii_case(VCDIFF))
            .and_then(|_| encoding.get(VCDIFF.len()..))?;
        if rest.is_empty() {
            return Some(Dialect::Reference);
        }
        let digest = rest.strip_prefix(':')?;
        Some(match digest.strip_prefix('*') {
            Some(digest) => Dialect::Inline(digest),
            None => Dialect::Cached(digest),
        })
    }
}

/// Wraps a [`Transport`], asking for diff-encoded responses and decoding them.
///
/// Decoded responses lose their `Content-Diff-*` and `Content-Length` headers. Their bodies
/// are decoded as they are read, and fail if the encoded stream turns out to be corrupt.
pub struct VcdiffTransport<T> {
    inner: T,
    cache: Arc<DictionaryCache>,
    codec: Arc<dyn Codec>,
    max_dictionary_size: usize,
}

impl<T: Transport> VcdiffTransport<T> {
    pub fn new(inner: T) -> Self {
        Self {
            inner,
            cache: Arc::new(DictionaryCache::new()),
            codec: Arc::new(Vcdiff),
            max_dictionary_size: MAX_DICTIONARY_SIZE,
        }
    }

    /// Shares `cache` with other transports.
    pub fn with_cache(mut self, cache: Arc<DictionaryCache>) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_codec(mut self, codec: Arc<dyn Codec>) -> Self {
        self.codec = codec;
        self
    }

    /// Lowers the largest dictionary accepted below [`MAX_DICTIONARY_SIZE`].
    pub fn with_max_dictionary_size(mut self, max: usize) -> Self {
        self.max_dictionary_size = max.min(MAX_DICTIONARY_SIZE);
        self
    }

    pub fn cache(&self) -> &Arc<DictionaryCache> {
        &self.cache
    }

    pub fn inner(&self) -> &T {
        &self.inner
    }

    async fn decode_response(
        &self,
        uri: &Uri,
        response: Response<ClientBody>,
    ) -> Result<Response<ClientBody>, ClientError> {
        let Some(encoding) = response.headers().get(CONTENT_DIFF_ENCODING) else {
            return Ok(response);
        };
        let encoding = encoding
            .to_str()
            .map_err(|_| ClientError::protocol("Content-Diff-Encoding is not ASCII"))?
            .trim()
            .to_owned();
        let Some(dialect) = Dialect::parse(&encoding) else {
            return Ok(response);
        };

        let (mut parts, body) = response.into_parts();
        let (dictionary, source) = match dialect {
            Dialect::Reference => {
                let dictionary = self.referenced_dictionary(uri, &parts.headers).await?;
                (dictionary, Source::Raw(body))
            }
            Dialect::Inline(digest) => {
                let boundary = multipart::boundary(&parts.headers)?;
                let mut reader = MultipartReader::new(body, &boundary);
                let (dictionary, content_type) =
                    read_inline_dictionary(&mut reader, self.max_dictionary_size).await?;
                if short_digest(&dictionary) != digest {
                    warn!("inline dictionary does not match digest {digest}");
                    return Err(ClientError::Integrity);
                }
                self.cache.insert_inline(digest, dictionary.clone());
                match content_type {
                    Some(content_type) => parts.headers.insert(CONTENT_TYPE, content_type),
                    None => parts.headers.remove(CONTENT_TYPE),
                };
                (dictionary, Source::Multipart(reader))
            }
            Dialect::Cached(digest) => {
                let dictionary = self.cache.inline(digest).ok_or_else(|| {
                    ClientError::protocol(format!("unknown inline dictionary {digest}"))
                })?;
                (dictionary, Source::Raw(body))
            }
        };

        let session = self.codec.open(dictionary, Mode::Decode)?;
        for name in [
            CONTENT_DIFF_ENCODING,
            CONTENT_DIFF_DICTIONARY,
            CONTENT_DIFF_DICTIONARY_INTEGRITY,
            CONTENT_LENGTH,
        ] {
            parts.headers.remove(name);
        }
        let body = DecodedBody::new(source, session).boxed_unsync();
        Ok(Response::from_parts(parts, body))
    }

    /// Resolves and verifies the dictionary named by `Content-Diff-Dictionary`.
    async fn referenced_dictionary(&self, uri: &Uri, headers: &HeaderMap) -> Result<Bytes, ClientError> {
        let reference = headers
            .get(CONTENT_DIFF_DICTIONARY)
            .ok_or_else(|| ClientError::protocol("missing Content-Diff-Dictionary"))?
            .to_str()
            .map_err(|_| ClientError::protocol("Content-Diff-Dictionary is not ASCII"))?;
        let (token, inline_integrity) = match reference.split_once(';') {
            Some((token, integrity)) => (token.trim(), Some(integrity.trim())),
            None => (reference.trim(), None),
        };
        if token.is_empty() {
            return Err(ClientError::protocol("empty dictionary identifier"));
        }
        let id = DictionaryId::decode(token)?;
        let header_integrity = match headers.get(CONTENT_DIFF_DICTIONARY_INTEGRITY) {
            Some(value) => Some(value.to_str().map_err(|_| {
                ClientError::protocol("Content-Diff-Dictionary-Integrity is not ASCII")
            })?),
            None => None,
        };

        let url = dictionary_url(uri, &id)?;
        let dictionary = self
            .cache
            .resolve(&url, || self.fetch_dictionary(&url))
            .await?;

        if DictionaryId::compute(&dictionary) != id {
            warn!("dictionary from {url} does not hash to {id}");
            return Err(ClientError::Integrity);
        }
        for integrity in [inline_integrity, header_integrity].into_iter().flatten() {
            if !verify_integrity(integrity, &dictionary) {
                warn!("dictionary from {url} failed integrity check {integrity:?}");
                return Err(ClientError::Integrity);
            }
        }
        Ok(dictionary)
    }

    async fn fetch_dictionary(&self, url: &str) -> Result<Bytes, ClientError> {
        debug!("web_vcdiff: fetching dictionary {url}");
        let ctx = format!("fetching dictionary from {url}");
        let request = Request::get(url)
            .header(ACCEPT_ENCODING, "gzip")
            .body(Bytes::new())
            .map_err(|e| ClientError::protocol(format!("bad dictionary URL {url}: {e}")))?;
        let response = self.inner.round_trip(request).await?;

        let status = response.status();
        if status.is_redirection() {
            return Err(ClientError::Request {
                ctx,
                status: Some(status.as_u16()),
                retriable: false,
                source: "redirects are prohibited for dictionary responses".into(),
            });
        }
        if status != StatusCode::OK {
            return Err(ClientError::Request {
                ctx,
                status: Some(status.as_u16()),
                retriable: is_retriable_status(status.as_u16()),
                source: format!("unexpected status {status}").into(),
            });
        }

        let gzipped = response
            .headers()
            .get(CONTENT_ENCODING)
            .is_some_and(|value| value.as_bytes().eq_ignore_ascii_case(b"gzip"));
        let body = read_to_limit(response.into_body(), self.max_dictionary_size)
            .await
            .map_err(|source| ClientError::Request {
                ctx: ctx.clone(),
                status: Some(status.as_u16()),
                retriable: false,
                source,
            })?;
        if !gzipped {
            return Ok(body);
        }

        let mut data = vec![];
        GzDecoder::new(&body[..])
            .take(self.max_dictionary_size as u64 + 1)
            .read_to_end(&mut data)
            .map_err(|e| ClientError::Request {
                ctx: ctx.clone(),
                status: Some(status.as_u16()),
                retriable: false,
                source: Box::new(e),
            })?;
        if data.len() > self.max_dictionary_size {
            return Err(ClientError::Request {
                ctx,
                status: Some(status.as_u16()),
                retriable: false,
                source: "dictionary is too large".into(),
            });
        }
        Ok(data.into())
    }
}

#[async_trait::async_trait]
impl<T: Transport> Transport for VcdiffTransport<T> {
    async fn round_trip(
        &self,
        mut request: Request<Bytes>,
    ) -> Result<Response<ClientBody>, ClientError> {
        let headers = request.headers_mut();
        headers.insert(ACCEPT_DIFF_ENCODING, HeaderValue::from_static(VCDIFF));
        let digests = self.cache.inline_digests();
        if !digests.is_empty() {
            if let Ok(value) = HeaderValue::try_from(digests.join(", ")) {
                headers.insert(ACCEPT_DIFF_DICTIONARIES, value);
            }
        }

        let uri = request.uri().clone();
        let response = self.inner.round_trip(request).await?;
        self.decode_response(&uri, response).await
    }
}

/// Collects `body`, failing once it exceeds `limit` bytes.
async fn read_to_limit(mut body: ClientBody, limit: usize) -> Result<Bytes, BoxError> {
    let mut data = BytesMut::new();
    while let Some(frame) = body.frame().await {
        if let Ok(chunk) = frame?.into_data() {
            if data.len() + chunk.len() > limit {
                return Err("dictionary is too large".into());
            }
            data.extend_from_slice(&chunk);
        }
    }
    Ok(data.freeze())
}

/// Where the dictionary `id` lives on the origin of `uri`.
fn dictionary_url(uri: &Uri, id: &DictionaryId) -> Result<String, ClientError> {
    match (uri.scheme_str(), uri.authority()) {
        (Some(scheme), Some(authority)) => Ok(format!("{scheme}://{authority}{DICTIONARY_PATH}{id}")),
        _ => Err(ClientError::protocol(format!(
            "cannot locate dictionary for relative URL {uri}"
        ))),
    }
}

/// Reads the dictionary part of a multipart response, and the headers of the body part after it.
async fn read_inline_dictionary(
    reader: &mut MultipartReader,
    limit: usize,
) -> Result<(Bytes, Option<HeaderValue>), ClientError> {
    let expect_part = |event: Event, name: &str| match event {
        Event::Headers(headers) if multipart::part_name(&headers).as_deref() == Some(name) => {
            Ok(headers)
        }
        _ => Err(ClientError::Multipart {
            error: format!("expected a part named {name:?}"),
        }),
    };

    expect_part(reader.next_event().await?, multipart::DICTIONARY_PART)?;
    let mut dictionary = BytesMut::new();
    let body_headers = loop {
        match reader.next_event().await? {
            Event::Data(data) => {
                if dictionary.len() + data.len() > limit {
                    return Err(ClientError::Multipart {
                        error: "inline dictionary is too large".into(),
                    });
                }
                dictionary.extend_from_slice(&data);
            }
            event => break expect_part(event, multipart::BODY_PART)?,
        }
    };
    Ok((dictionary.freeze(), body_headers.get(CONTENT_TYPE).cloned()))
}
