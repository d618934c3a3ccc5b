// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Diff-encoding middleware.
//!
//! [`VcdiffHandler`] negotiates with the client, picks a dictionary and wraps the inner
//! handler's [`ResponseWriter`] in a [`DiffEncodingWriter`], which rewrites headers when the
//! response is committed and streams the body through a codec session.

use std::panic::{resume_unwind, AssertUnwindSafe};
use std::sync::Arc;

use futures::FutureExt;
use http::header::{HeaderValue, CONTENT_LENGTH, CONTENT_TYPE, ETAG, VARY};
use http::{HeaderMap, Request, StatusCode};
use tracing::{debug, error};

use super::multipart::{PartWriter, BODY_PART, DICTIONARY_PART};
use super::{
    error_response, EarlyHints, Flush, Handler, RequestBody, ResponseWriter, WriteError,
};
use crate::codec::{Codec, CodecSession, Mode, Vcdiff};
use crate::dictionary::{Dictionaries, Dictionary};
use crate::headers::{
    body_allowed_for_status, contains_token, ACCEPT_DIFF_DICTIONARIES, ACCEPT_DIFF_ENCODING,
    CONTENT_DIFF_DICTIONARY, CONTENT_DIFF_DICTIONARY_INTEGRITY, CONTENT_DIFF_ENCODING, VCDIFF,
};
use crate::integrity::integrity_for;
use crate::BoxError;

/// How the dictionary reaches the client.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Strategy {
    /// Responses name the dictionary, and clients fetch it from the dictionary registry.
    #[default]
    Direct,
    /// Responses embed the dictionary in a `multipart/form-data` body unless the client
    /// lists its digest in `Accept-Diff-Dictionaries`.
    Multipart,
}

/// Where an SRI assertion for the dictionary is advertised, under [`Strategy::Direct`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum IntegrityAdvertisement {
    #[default]
    Omit,
    /// `Content-Diff-Dictionary-Integrity` header
    Header,
    /// After the identifier in `Content-Diff-Dictionary`, separated by `;`
    Inline,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct EncodeConfig {
    pub strategy: Strategy,
    pub integrity: IntegrityAdvertisement,
    /// Add checksums to the encoded stream.
    pub checksum: bool,
}

/// Wraps a [`Handler`], diff-encoding its responses for clients that ask for it.
pub struct VcdiffHandler<H> {
    inner: H,
    dictionaries: Arc<dyn Dictionaries>,
    codec: Arc<dyn Codec>,
    config: EncodeConfig,
}

impl<H> VcdiffHandler<H> {
    pub fn new(inner: H, dictionaries: Arc<dyn Dictionaries>) -> Self {
        Self {
            inner,
            dictionaries,
            codec: Arc::new(Vcdiff),
            config: EncodeConfig::default(),
        }
    }

    pub fn with_codec(mut self, codec: Arc<dyn Codec>) -> Self {
        self.codec = codec;
        self
    }

    pub fn with_config(mut self, config: EncodeConfig) -> Self {
        self.config = config;
        self
    }
}

#[async_trait::async_trait]
impl<H: Handler> Handler for VcdiffHandler<H> {
    async fn serve(&self, request: Request<RequestBody>, writer: &mut dyn ResponseWriter) {
        let vary = match self.config.strategy {
            Strategy::Direct => "Accept-Diff-Encoding",
            Strategy::Multipart => "Accept-Diff-Encoding, Accept-Diff-Dictionaries",
        };
        writer
            .headers_mut()
            .append(VARY, HeaderValue::from_static(vary));

        if !contains_token(request.headers(), &ACCEPT_DIFF_ENCODING, VCDIFF) {
            return self.inner.serve(request, writer).await;
        }

        let (parts, body) = request.into_parts();
        let dictionary = match self.dictionaries.select(&parts).await {
            Ok(Some(dictionary)) => dictionary,
            Ok(None) => {
                return self
                    .inner
                    .serve(Request::from_parts(parts, body), writer)
                    .await
            }
            Err(err) => {
                error!("dictionary callback failed: {err}");
                return error_response(writer, StatusCode::INTERNAL_SERVER_ERROR).await;
            }
        };
        dictionary.assert_valid();

        let client_has_dictionary = self.config.strategy == Strategy::Multipart
            && contains_token(
                &parts.headers,
                &ACCEPT_DIFF_DICTIONARIES,
                dictionary.short_digest(),
            );
        let request = Request::from_parts(parts, body);

        let mut encoder = DiffEncodingWriter::new(
            writer,
            dictionary,
            self.codec.clone(),
            self.config,
            client_has_dictionary,
        );
        let outcome = AssertUnwindSafe(self.inner.serve(request, &mut encoder))
            .catch_unwind()
            .await;
        encoder.close().await;
        if let Err(panic) = outcome {
            resume_unwind(panic);
        }
    }
}

enum State {
    /// Nothing has been committed yet.
    Pending,
    /// Committed without encoding.
    Bypassed,
    Encoding(Box<dyn CodecSession>),
    /// The codec could not be started, and an error response was sent instead.
    Rejected,
    Closed,
}

/// [`ResponseWriter`] that diff-encodes everything written to it.
///
/// Exposes [`Flush`] and [`EarlyHints`] exactly when the wrapped writer does.
/// [`close`](Self::close) must be called once the handler is done.
pub struct DiffEncodingWriter<'a> {
    inner: &'a mut dyn ResponseWriter,
    dictionary: Arc<Dictionary>,
    codec: Arc<dyn Codec>,
    config: EncodeConfig,
    client_has_dictionary: bool,
    can_flush: bool,
    state: State,
    error: Option<WriteError>,
    parts: Option<PartWriter>,
}

impl<'a> DiffEncodingWriter<'a> {
    pub fn new(
        inner: &'a mut dyn ResponseWriter,
        dictionary: Arc<Dictionary>,
        codec: Arc<dyn Codec>,
        config: EncodeConfig,
        client_has_dictionary: bool,
    ) -> Self {
        let can_flush = inner.flusher().is_some();
        Self {
            inner,
            dictionary,
            codec,
            config,
            client_has_dictionary,
            can_flush,
            state: State::Pending,
            error: None,
            parts: None,
        }
    }

    async fn commit(&mut self, status: StatusCode) {
        if !matches!(self.state, State::Pending) {
            return;
        }
        if !body_allowed_for_status(status) || status.is_redirection() {
            self.state = State::Bypassed;
            return self.inner.write_header(status).await;
        }

        // The session must exist before any header reaches the client, so that a failure can
        // still become an error response.
        let mode = Mode::Encode {
            checksum: self.config.checksum,
        };
        let session = match self.codec.open(self.dictionary.data().clone(), mode) {
            Ok(session) => session,
            Err(err) => {
                error!("could not start VCDIFF encoding: {err}");
                self.state = State::Rejected;
                self.error = Some(err.into());
                return error_response(&mut *self.inner, StatusCode::INTERNAL_SERVER_ERROR).await;
            }
        };

        let preamble = self.rewrite_headers();
        self.inner.write_header(status).await;
        self.state = State::Encoding(session);
        if let Err(err) = self.forward(&preamble).await {
            self.error = Some(err);
        }
    }

    /// Replaces headers describing the unencoded body with diff-encoding headers, returning
    /// any bytes that must precede the encoded body.
    fn rewrite_headers(&mut self) -> Vec<u8> {
        let headers = self.inner.headers_mut();
        headers.remove(CONTENT_LENGTH);
        headers.remove(ETAG);

        let dictionary = &self.dictionary;
        let mut preamble = vec![];
        match self.config.strategy {
            Strategy::Direct => {
                let mut reference = dictionary.id().encode();
                match self.config.integrity {
                    IntegrityAdvertisement::Omit => {}
                    IntegrityAdvertisement::Header => {
                        let integrity = integrity_for(dictionary.data());
                        headers.insert(CONTENT_DIFF_DICTIONARY_INTEGRITY, header_value(integrity));
                    }
                    IntegrityAdvertisement::Inline => {
                        let integrity = integrity_for(dictionary.data());
                        reference = format!("{reference};{integrity}");
                    }
                }
                headers.insert(CONTENT_DIFF_ENCODING, HeaderValue::from_static(VCDIFF));
                headers.insert(CONTENT_DIFF_DICTIONARY, header_value(reference));
            }
            Strategy::Multipart if self.client_has_dictionary => {
                let encoding = format!("{VCDIFF}:{}", dictionary.short_digest());
                headers.insert(CONTENT_DIFF_ENCODING, header_value(encoding));
            }
            Strategy::Multipart => {
                let mut parts = PartWriter::new();
                let body_type = headers.get(CONTENT_TYPE).cloned();
                let octets = HeaderValue::from_static("application/octet-stream");
                parts.start_part(DICTIONARY_PART, "d", Some(&octets), &mut preamble);
                preamble.extend_from_slice(dictionary.data());
                parts.start_part(BODY_PART, "b", body_type.as_ref(), &mut preamble);

                let encoding = format!("{VCDIFF}:*{}", dictionary.short_digest());
                headers.insert(CONTENT_DIFF_ENCODING, header_value(encoding));
                headers.insert(CONTENT_TYPE, parts.content_type());
                self.parts = Some(parts);
            }
        }
        preamble
    }

    async fn forward(&mut self, bytes: &[u8]) -> Result<(), WriteError> {
        if !bytes.is_empty() {
            self.inner.write(bytes).await?;
        }
        Ok(())
    }

    /// Finalizes the encoded stream and releases the codec session.
    ///
    /// If the response failed along the way, the failure is logged and the response is
    /// aborted, since its status has already been sent.
    pub async fn close(&mut self) {
        let State::Encoding(mut session) = std::mem::replace(&mut self.state, State::Closed)
        else {
            return;
        };
        let mut trailer = vec![];
        let finished = session.finish(&mut trailer);
        drop(session);

        if self.error.is_none() {
            if let Err(err) = finished {
                self.error = Some(err.into());
            } else {
                if let Some(parts) = &self.parts {
                    parts.finish(&mut trailer);
                }
                if let Err(err) = self.forward(&trailer).await {
                    self.error = Some(err);
                }
            }
        }

        match &self.error {
            Some(err) => {
                error!("error VCDIFF compressing response: {err}");
                self.inner.abort(Box::new(err.clone())).await;
            }
            None => debug!("finished VCDIFF response with {}", self.dictionary.id()),
        }
    }
}

fn header_value(value: String) -> HeaderValue {
    // Identifiers, digests and SRI strings are all base64 or hex.
    HeaderValue::try_from(value).unwrap_or(HeaderValue::from_static(""))
}

#[async_trait::async_trait]
impl ResponseWriter for DiffEncodingWriter<'_> {
    fn headers_mut(&mut self) -> &mut HeaderMap {
        self.inner.headers_mut()
    }

    async fn write_header(&mut self, status: StatusCode) {
        self.commit(status).await
    }

    async fn write(&mut self, bytes: &[u8]) -> Result<usize, WriteError> {
        self.commit(StatusCode::OK).await;
        if let Some(err) = &self.error {
            return Err(err.clone());
        }
        let mut encoded = vec![];
        match &mut self.state {
            State::Bypassed => return self.inner.write(bytes).await,
            State::Encoding(session) => {
                if let Err(err) = session.write(bytes, &mut encoded) {
                    let err = WriteError::from(err);
                    self.error = Some(err.clone());
                    return Err(err);
                }
            }
            State::Pending | State::Rejected | State::Closed => return Err(WriteError::Closed),
        }
        match self.forward(&encoded).await {
            Ok(()) => Ok(bytes.len()),
            Err(err) => {
                self.error = Some(err.clone());
                Err(err)
            }
        }
    }

    async fn abort(&mut self, error: BoxError) {
        self.error.get_or_insert(WriteError::Aborted);
        self.state = State::Closed;
        self.inner.abort(error).await;
    }

    fn flusher(&mut self) -> Option<&mut dyn Flush> {
        if self.can_flush {
            Some(self)
        } else {
            None
        }
    }

    fn early_hints(&mut self) -> Option<&mut dyn EarlyHints> {
        self.inner.early_hints()
    }
}

#[async_trait::async_trait]
impl Flush for DiffEncodingWriter<'_> {
    async fn flush(&mut self) -> Result<(), WriteError> {
        self.commit(StatusCode::OK).await;
        if let Some(err) = &self.error {
            return Err(err.clone());
        }
        match self.inner.flusher() {
            Some(flusher) => flusher.flush().await,
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use bytes::Bytes;
    use http::header::LOCATION;
    use tracing_test::traced_test;

    use super::*;
    use crate::codec::CodecError;
    use crate::dictionary::{DictionaryId, FixedDictionary};
    use crate::server::testing::*;
    use crate::server::StaticContent;

    const DICTIONARY: &[u8] = b"The quick brown fox jumps over the lazy dog.";
    const BODY: &str = "The quick brown fox jumps over the lazy dog. Twice!";

    fn dictionary() -> Arc<Dictionary> {
        Arc::new(Dictionary::new(DICTIONARY))
    }

    fn handler<H>(inner: H) -> VcdiffHandler<H> {
        VcdiffHandler::new(inner, Arc::new(FixedDictionary::new(dictionary())))
    }

    fn negotiating() -> Request<RequestBody> {
        request(&[("accept-diff-encoding", "vcdiff")])
    }

    fn decode(body: &[u8]) -> Vec<u8> {
        vcdiff::decode(dictionary().data(), body).unwrap()
    }

    /// Writes a text body in two pieces.
    struct Text(&'static str);

    #[async_trait::async_trait]
    impl Handler for Text {
        async fn serve(&self, _: Request<RequestBody>, writer: &mut dyn ResponseWriter) {
            writer
                .headers_mut()
                .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
            let (first, second) = self.0.split_at(self.0.len() / 2);
            let _ = writer.write(first.as_bytes()).await;
            let _ = writer.write(second.as_bytes()).await;
        }
    }

    struct Status(StatusCode, &'static str);

    #[async_trait::async_trait]
    impl Handler for Status {
        async fn serve(&self, _: Request<RequestBody>, writer: &mut dyn ResponseWriter) {
            writer
                .headers_mut()
                .insert(LOCATION, HeaderValue::from_static("/elsewhere"));
            writer.write_header(self.0).await;
            if !self.1.is_empty() {
                let _ = writer.write(self.1.as_bytes()).await;
            }
        }
    }

    struct Panics;

    #[async_trait::async_trait]
    impl Handler for Panics {
        async fn serve(&self, _: Request<RequestBody>, writer: &mut dyn ResponseWriter) {
            let _ = writer.write(b"partial response").await;
            panic!("handler failed");
        }
    }

    #[derive(Default)]
    struct SessionCounts {
        opened: AtomicUsize,
        live: AtomicUsize,
        writes: AtomicUsize,
    }

    struct CountingCodec {
        counts: Arc<SessionCounts>,
        fail_open: bool,
        fail_write: bool,
    }

    impl CountingCodec {
        fn new(counts: &Arc<SessionCounts>) -> Self {
            Self {
                counts: counts.clone(),
                fail_open: false,
                fail_write: false,
            }
        }
    }

    impl Codec for CountingCodec {
        fn open(&self, dictionary: Bytes, mode: Mode) -> Result<Box<dyn CodecSession>, CodecError> {
            if self.fail_open {
                return Err(CodecError::Dictionary(Arc::new(io::Error::other(
                    "no room for dictionary",
                ))));
            }
            let inner = Vcdiff.open(dictionary, mode)?;
            self.counts.opened.fetch_add(1, Ordering::SeqCst);
            self.counts.live.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(CountingSession {
                inner,
                counts: self.counts.clone(),
                fail_write: self.fail_write,
            }))
        }
    }

    struct CountingSession {
        inner: Box<dyn CodecSession>,
        counts: Arc<SessionCounts>,
        fail_write: bool,
    }

    impl CodecSession for CountingSession {
        fn write(&mut self, input: &[u8], output: &mut Vec<u8>) -> Result<(), CodecError> {
            self.counts.writes.fetch_add(1, Ordering::SeqCst);
            if self.fail_write {
                return Err(CodecError::Encode(Arc::new(io::Error::other(
                    "codec exploded",
                ))));
            }
            self.inner.write(input, output)
        }

        fn finish(&mut self, output: &mut Vec<u8>) -> Result<(), CodecError> {
            self.inner.finish(output)
        }
    }

    impl Drop for CountingSession {
        fn drop(&mut self) {
            self.counts.live.fetch_sub(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn passes_through_without_negotiation() {
        let mut writer = RecordingWriter::new();
        handler(StaticContent::new("text/plain", BODY))
            .serve(request(&[]), &mut writer)
            .await;

        let recorded = writer.recorded;
        assert_eq!(recorded.status, Some(StatusCode::OK));
        assert_eq!(recorded.body, BODY.as_bytes());
        assert_eq!(recorded.headers[VARY], "Accept-Diff-Encoding");
        assert!(recorded.headers.contains_key(CONTENT_LENGTH));
        assert!(!recorded.headers.contains_key(CONTENT_DIFF_ENCODING));
    }

    #[tokio::test]
    async fn encodes_against_selected_dictionary() {
        let mut writer = RecordingWriter::new();
        handler(StaticContent::new("text/plain", BODY))
            .serve(negotiating(), &mut writer)
            .await;

        let recorded = writer.recorded;
        assert_eq!(recorded.status, Some(StatusCode::OK));
        assert_eq!(recorded.headers[CONTENT_DIFF_ENCODING], "vcdiff");
        assert_eq!(
            recorded.headers[CONTENT_DIFF_DICTIONARY],
            dictionary().id().encode().as_str()
        );
        assert_eq!(recorded.headers[CONTENT_TYPE], "text/plain");
        assert_eq!(recorded.headers[VARY], "Accept-Diff-Encoding");
        assert!(!recorded.headers.contains_key(CONTENT_LENGTH));
        assert!(!recorded.headers.contains_key(ETAG));
        assert!(!recorded.headers.contains_key(CONTENT_DIFF_DICTIONARY_INTEGRITY));
        assert!(recorded.aborted.is_none());
        assert_eq!(decode(&recorded.body), BODY.as_bytes());
    }

    #[tokio::test]
    async fn advertises_integrity() {
        let expected = integrity_for(DICTIONARY);

        let mut writer = RecordingWriter::new();
        handler(Text(BODY))
            .with_config(EncodeConfig {
                integrity: IntegrityAdvertisement::Header,
                ..Default::default()
            })
            .serve(negotiating(), &mut writer)
            .await;
        let headers = writer.recorded.headers;
        assert_eq!(headers[CONTENT_DIFF_DICTIONARY_INTEGRITY], expected.as_str());
        assert_eq!(headers[CONTENT_DIFF_DICTIONARY], dictionary().id().encode().as_str());

        let mut writer = RecordingWriter::new();
        handler(Text(BODY))
            .with_config(EncodeConfig {
                integrity: IntegrityAdvertisement::Inline,
                ..Default::default()
            })
            .serve(negotiating(), &mut writer)
            .await;
        let headers = writer.recorded.headers;
        let inline = format!("{};{expected}", dictionary().id());
        assert_eq!(headers[CONTENT_DIFF_DICTIONARY], inline.as_str());
        assert!(!headers.contains_key(CONTENT_DIFF_DICTIONARY_INTEGRITY));
    }

    #[tokio::test]
    async fn checksummed_output_decodes() {
        let mut writer = RecordingWriter::new();
        handler(Text(BODY))
            .with_config(EncodeConfig {
                checksum: true,
                ..Default::default()
            })
            .serve(negotiating(), &mut writer)
            .await;
        assert_eq!(decode(&writer.recorded.body), BODY.as_bytes());
    }

    #[tokio::test]
    async fn multipart_inlines_dictionary() {
        let mut writer = RecordingWriter::new();
        handler(Text(BODY))
            .with_config(EncodeConfig {
                strategy: Strategy::Multipart,
                ..Default::default()
            })
            .serve(negotiating(), &mut writer)
            .await;

        let recorded = writer.recorded;
        let digest = dictionary().short_digest().to_string();
        assert_eq!(
            recorded.headers[CONTENT_DIFF_ENCODING],
            format!("vcdiff:*{digest}").as_str()
        );
        assert_eq!(
            recorded.headers[VARY],
            "Accept-Diff-Encoding, Accept-Diff-Dictionaries"
        );
        assert!(!recorded.headers.contains_key(CONTENT_DIFF_DICTIONARY));

        let content_type = recorded.headers[CONTENT_TYPE].to_str().unwrap();
        let boundary = content_type
            .strip_prefix("multipart/form-data; boundary=")
            .unwrap();
        let dict_part = format!(
            "--{boundary}\r\n\
             Content-Disposition: form-data; name=\"dict\"; filename=\"d\"\r\n\
             Content-Type: application/octet-stream\r\n\
             \r\n"
        );
        let body_part = format!(
            "\r\n--{boundary}\r\n\
             Content-Disposition: form-data; name=\"body\"; filename=\"b\"\r\n\
             Content-Type: text/plain\r\n\
             \r\n"
        );
        let closing = format!("\r\n--{boundary}--\r\n");

        let body = recorded.body.as_slice();
        let rest = body.strip_prefix(dict_part.as_bytes()).unwrap();
        let rest = rest.strip_prefix(DICTIONARY).unwrap();
        let rest = rest.strip_prefix(body_part.as_bytes()).unwrap();
        let delta = rest.strip_suffix(closing.as_bytes()).unwrap();
        assert_eq!(decode(delta), BODY.as_bytes());
    }

    #[tokio::test]
    async fn multipart_skips_dictionary_the_client_has() {
        let digest = dictionary().short_digest().to_string();
        let mut req = negotiating();
        req.headers_mut().insert(
            ACCEPT_DIFF_DICTIONARIES,
            HeaderValue::try_from(format!("0123456789abcdef, {digest}")).unwrap(),
        );

        let mut writer = RecordingWriter::new();
        handler(Text(BODY))
            .with_config(EncodeConfig {
                strategy: Strategy::Multipart,
                ..Default::default()
            })
            .serve(req, &mut writer)
            .await;

        let recorded = writer.recorded;
        assert_eq!(
            recorded.headers[CONTENT_DIFF_ENCODING],
            format!("vcdiff:{digest}").as_str()
        );
        assert_eq!(recorded.headers[CONTENT_TYPE], "text/plain");
        assert_eq!(decode(&recorded.body), BODY.as_bytes());
    }

    #[tokio::test]
    async fn bodyless_and_redirect_responses_bypass_encoding() {
        let counts = Arc::new(SessionCounts::default());
        for (status, body) in [
            (StatusCode::CONTINUE, ""),
            (StatusCode::NOT_MODIFIED, ""),
            (StatusCode::NO_CONTENT, ""),
            (StatusCode::FOUND, "moved"),
        ] {
            let mut writer = RecordingWriter::new();
            handler(Status(status, body))
                .with_codec(Arc::new(CountingCodec::new(&counts)))
                .serve(negotiating(), &mut writer)
                .await;

            let recorded = writer.recorded;
            assert_eq!(recorded.status, Some(status));
            assert_eq!(recorded.body, body.as_bytes());
            assert_eq!(recorded.headers[LOCATION], "/elsewhere");
            assert!(!recorded.headers.contains_key(CONTENT_DIFF_ENCODING));
        }
        assert_eq!(counts.opened.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn error_statuses_are_encoded() {
        let mut writer = RecordingWriter::new();
        handler(Status(StatusCode::NOT_FOUND, "no such thing"))
            .serve(negotiating(), &mut writer)
            .await;
        let recorded = writer.recorded;
        assert_eq!(recorded.status, Some(StatusCode::NOT_FOUND));
        assert_eq!(recorded.headers[CONTENT_DIFF_ENCODING], "vcdiff");
        assert_eq!(decode(&recorded.body), b"no such thing");
    }

    #[tokio::test]
    #[traced_test]
    async fn open_failure_becomes_server_error() {
        let counts = Arc::new(SessionCounts::default());
        let codec = CountingCodec {
            fail_open: true,
            ..CountingCodec::new(&counts)
        };
        let mut writer = RecordingWriter::new();
        handler(StaticContent::new("text/plain", BODY))
            .with_codec(Arc::new(codec))
            .serve(negotiating(), &mut writer)
            .await;

        let recorded = writer.recorded;
        assert_eq!(recorded.status, Some(StatusCode::INTERNAL_SERVER_ERROR));
        assert_eq!(recorded.body, b"500 Internal Server Error");
        assert!(!recorded.headers.contains_key(CONTENT_DIFF_ENCODING));
        assert!(recorded.aborted.is_none());
        assert!(logs_contain("could not start VCDIFF encoding"));
    }

    #[tokio::test]
    #[traced_test]
    async fn codec_failure_after_commit_aborts() {
        let counts = Arc::new(SessionCounts::default());
        let codec = CountingCodec {
            fail_write: true,
            ..CountingCodec::new(&counts)
        };
        let mut writer = RecordingWriter::new();
        handler(Text(BODY))
            .with_codec(Arc::new(codec))
            .serve(negotiating(), &mut writer)
            .await;

        let recorded = writer.recorded;
        assert_eq!(recorded.status, Some(StatusCode::OK));
        assert!(recorded.aborted.unwrap().contains("codec exploded"));
        // The second write must not reach the codec.
        assert_eq!(counts.writes.load(Ordering::SeqCst), 1);
        assert_eq!(counts.live.load(Ordering::SeqCst), 0);
        assert!(logs_contain("error VCDIFF compressing response"));
    }

    #[tokio::test]
    #[traced_test]
    async fn sink_failure_aborts() {
        let mut writer = RecordingWriter::new();
        writer.fail_after = Some(8);
        handler(Text(BODY)).serve(negotiating(), &mut writer).await;
        assert!(writer.recorded.aborted.is_some());
        assert!(logs_contain("client went away"));
    }

    #[tokio::test]
    async fn panicking_handler_still_closes_session() {
        let counts = Arc::new(SessionCounts::default());
        let handler = handler(Panics).with_codec(Arc::new(CountingCodec::new(&counts)));
        let mut writer = RecordingWriter::new();
        let outcome = AssertUnwindSafe(handler.serve(negotiating(), &mut writer))
            .catch_unwind()
            .await;

        assert!(outcome.is_err());
        assert_eq!(counts.opened.load(Ordering::SeqCst), 1);
        assert_eq!(counts.live.load(Ordering::SeqCst), 0);
        assert_eq!(decode(&writer.recorded.body), b"partial response");
    }

    #[tokio::test]
    async fn selection_outcomes() {
        struct Nothing;

        #[async_trait::async_trait]
        impl Dictionaries for Nothing {
            async fn select(&self, _: &http::request::Parts) -> Result<Option<Arc<Dictionary>>, BoxError> {
                Ok(None)
            }
            async fn find(&self, _: &DictionaryId) -> Result<Option<Arc<Dictionary>>, BoxError> {
                Ok(None)
            }
        }

        struct Broken;

        #[async_trait::async_trait]
        impl Dictionaries for Broken {
            async fn select(&self, _: &http::request::Parts) -> Result<Option<Arc<Dictionary>>, BoxError> {
                Err("dictionary store offline".into())
            }
            async fn find(&self, _: &DictionaryId) -> Result<Option<Arc<Dictionary>>, BoxError> {
                Ok(None)
            }
        }

        let mut writer = RecordingWriter::new();
        VcdiffHandler::new(Text(BODY), Arc::new(Nothing))
            .serve(negotiating(), &mut writer)
            .await;
        assert_eq!(writer.recorded.body, BODY.as_bytes());
        assert!(!writer.recorded.headers.contains_key(CONTENT_DIFF_ENCODING));

        let mut writer = RecordingWriter::new();
        VcdiffHandler::new(Text(BODY), Arc::new(Broken))
            .serve(negotiating(), &mut writer)
            .await;
        assert_eq!(writer.recorded.status, Some(StatusCode::INTERNAL_SERVER_ERROR));
    }

    #[tokio::test]
    #[should_panic(expected = "does not match its contents")]
    async fn mismatched_dictionary_panics() {
        let id = DictionaryId::compute(b"something else entirely");
        let forged = Dictionary::from_parts(id, Bytes::from_static(DICTIONARY));
        let mut writer = RecordingWriter::new();
        VcdiffHandler::new(Text(BODY), Arc::new(FixedDictionary::new(forged)))
            .serve(negotiating(), &mut writer)
            .await;
    }

    #[tokio::test]
    async fn capabilities_follow_wrapped_writer() {
        let mut plain = RecordingWriter::new();
        let mut writer = DiffEncodingWriter::new(
            &mut plain,
            dictionary(),
            Arc::new(Vcdiff),
            EncodeConfig::default(),
            false,
        );
        assert!(writer.flusher().is_none());
        assert!(writer.early_hints().is_none());
        writer.close().await;

        let mut capable = RecordingWriter::new().with_flush().with_hints();
        let mut writer = DiffEncodingWriter::new(
            &mut capable,
            dictionary(),
            Arc::new(Vcdiff),
            EncodeConfig::default(),
            false,
        );
        assert!(writer.early_hints().is_some());
        writer.flusher().unwrap().flush().await.unwrap();
        writer.close().await;

        let recorded = capable.recorded;
        assert_eq!(recorded.flushes, 1);
        assert_eq!(recorded.status, Some(StatusCode::OK));
        assert_eq!(recorded.headers[CONTENT_DIFF_ENCODING], "vcdiff");
        assert_eq!(decode(&recorded.body), b"");
    }
}
