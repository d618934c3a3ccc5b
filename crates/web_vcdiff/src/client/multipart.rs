// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Incremental `multipart/form-data` parsing for responses that carry their dictionary inline.

use bytes::{Buf, Bytes, BytesMut};
use http::header::{HeaderName, HeaderValue, CONTENT_DISPOSITION, CONTENT_TYPE};
use http::HeaderMap;
use http_body_util::BodyExt;

use super::body::read_error;
use super::ClientBody;
use crate::error::ClientError;

pub(crate) use crate::server::multipart::{BODY_PART, DICTIONARY_PART};

const MAX_PART_HEADERS: usize = 16;
const MAX_HEADER_BYTES: usize = 8 * 1024;

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Event {
    /// Start of a new part.
    Headers(HeaderMap),
    /// Some of the current part's contents.
    Data(Bytes),
    /// The closing delimiter.
    End,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Preamble,
    AfterDelimiter,
    Headers,
    Body,
    Epilogue,
}

/// Push parser: [`feed`](Parser::feed) it bytes and pull [`Event`]s out.
pub(crate) struct Parser {
    /// `CRLF--boundary`
    delimiter: Vec<u8>,
    buffer: BytesMut,
    state: State,
}

impl Parser {
    pub fn new(boundary: &str) -> Self {
        let mut delimiter = b"\r\n--".to_vec();
        delimiter.extend_from_slice(boundary.as_bytes());
        // The first delimiter may start the body without a preceding line break.
        let buffer = BytesMut::from(&b"\r\n"[..]);
        Self {
            delimiter,
            buffer,
            state: State::Preamble,
        }
    }

    pub fn feed(&mut self, data: &[u8]) {
        if self.state != State::Epilogue {
            self.buffer.extend_from_slice(data);
        }
    }

    pub fn is_done(&self) -> bool {
        self.state == State::Epilogue
    }

    /// Next event from what has been fed so far, or `None` if more input is needed.
    pub fn next(&mut self) -> Result<Option<Event>, ClientError> {
        loop {
            match self.state {
                State::Preamble => match self.find_delimiter() {
                    Some(at) => {
                        self.buffer.advance(at + self.delimiter.len());
                        self.state = State::AfterDelimiter;
                    }
                    None => {
                        let keep = self.delimiter.len() - 1;
                        if self.buffer.len() > keep {
                            self.buffer.advance(self.buffer.len() - keep);
                        }
                        return Ok(None);
                    }
                },
                State::AfterDelimiter => {
                    if self.buffer.len() < 2 {
                        return Ok(None);
                    }
                    if self.buffer.starts_with(b"--") {
                        self.state = State::Epilogue;
                        self.buffer.clear();
                        return Ok(Some(Event::End));
                    }
                    let Some(eol) = self.buffer.windows(2).position(|w| w == b"\r\n") else {
                        if self.buffer.len() > MAX_HEADER_BYTES {
                            return Err(malformed("delimiter line too long"));
                        }
                        return Ok(None);
                    };
                    if !self.buffer[..eol].iter().all(|b| *b == b' ' || *b == b'\t') {
                        return Err(malformed("garbage after delimiter"));
                    }
                    self.buffer.advance(eol + 2);
                    self.state = State::Headers;
                }
                State::Headers => {
                    let mut storage = [httparse::EMPTY_HEADER; MAX_PART_HEADERS];
                    let (len, headers) = match httparse::parse_headers(&self.buffer, &mut storage)
                    {
                        Ok(httparse::Status::Complete((len, parsed))) => (len, to_header_map(parsed)?),
                        Ok(httparse::Status::Partial) if self.buffer.len() > MAX_HEADER_BYTES => {
                            return Err(malformed("part headers too long"));
                        }
                        Ok(httparse::Status::Partial) => return Ok(None),
                        Err(err) => return Err(malformed(format!("bad part headers: {err}"))),
                    };
                    self.buffer.advance(len);
                    self.state = State::Body;
                    return Ok(Some(Event::Headers(headers)));
                }
                State::Body => match self.find_delimiter() {
                    Some(at) => {
                        let data = self.buffer.split_to(at).freeze();
                        self.buffer.advance(self.delimiter.len());
                        self.state = State::AfterDelimiter;
                        if !data.is_empty() {
                            return Ok(Some(Event::Data(data)));
                        }
                    }
                    None => {
                        // The tail might be the start of a delimiter.
                        let keep = self.delimiter.len() - 1;
                        if self.buffer.len() <= keep {
                            return Ok(None);
                        }
                        let data = self.buffer.split_to(self.buffer.len() - keep).freeze();
                        return Ok(Some(Event::Data(data)));
                    }
                },
                State::Epilogue => return Ok(None),
            }
        }
    }

    /// Checks that the input, which has ended, was complete.
    pub fn finish(&self) -> Result<(), ClientError> {
        match self.state {
            State::Epilogue => Ok(()),
            _ => Err(malformed("body ended before the closing delimiter")),
        }
    }

    fn find_delimiter(&self) -> Option<usize> {
        self.buffer
            .windows(self.delimiter.len())
            .position(|w| w == self.delimiter.as_slice())
    }
}

fn to_header_map(parsed: &[httparse::Header<'_>]) -> Result<HeaderMap, ClientError> {
    let mut headers = HeaderMap::with_capacity(parsed.len());
    for header in parsed {
        let name = HeaderName::from_bytes(header.name.as_bytes())
            .map_err(|_| malformed("bad part header name"))?;
        let value =
            HeaderValue::from_bytes(header.value).map_err(|_| malformed("bad part header value"))?;
        headers.append(name, value);
    }
    Ok(headers)
}

fn malformed(error: impl Into<String>) -> ClientError {
    ClientError::Multipart {
        error: error.into(),
    }
}

/// Pulls [`Event`]s out of a multipart response body.
pub(crate) struct MultipartReader {
    body: ClientBody,
    parser: Parser,
}

impl MultipartReader {
    pub fn new(body: ClientBody, boundary: &str) -> Self {
        Self {
            body,
            parser: Parser::new(boundary),
        }
    }

    /// Returns [`Event::End`] once the closing delimiter has been read, and from then on.
    pub async fn next_event(&mut self) -> Result<Event, ClientError> {
        loop {
            if let Some(event) = self.parser.next()? {
                return Ok(event);
            }
            if self.parser.is_done() {
                return Ok(Event::End);
            }
            match self.body.frame().await {
                Some(Ok(frame)) => {
                    if let Ok(data) = frame.into_data() {
                        self.parser.feed(&data);
                    }
                }
                Some(Err(err)) => return Err(read_error(err)),
                None => {
                    self.parser.finish()?;
                    return Ok(Event::End);
                }
            }
        }
    }
}

/// The `boundary` parameter of a multipart `Content-Type`.
pub(crate) fn boundary(headers: &HeaderMap) -> Result<String, ClientError> {
    let content_type = headers
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| malformed("missing Content-Type"))?;
    let essence = content_type.split(';').next().unwrap_or_default().trim();
    if !essence
        .get(..10)
        .is_some_and(|prefix| prefix.eq_ignore_ascii_case("multipart/"))
    {
        return Err(malformed(format!("not a multipart type: {essence}")));
    }
    match parameter(content_type, "boundary") {
        Some(boundary) if !boundary.is_empty() && boundary.len() <= 70 => Ok(boundary),
        _ => Err(malformed("missing or invalid boundary")),
    }
}

/// The `name` parameter of a part's `Content-Disposition`.
pub(crate) fn part_name(headers: &HeaderMap) -> Option<String> {
    let disposition = headers.get(CONTENT_DISPOSITION)?.to_str().ok()?;
    parameter(disposition, "name")
}

fn parameter(value: &str, name: &str) -> Option<String> {
    value.split(';').skip(1).find_map(|param| {
        let (key, value) = param.split_once('=')?;
        if !key.trim().eq_ignore_ascii_case(name) {
            return None;
        }
        let value = value.trim();
        let value = value
            .strip_prefix('"')
            .and_then(|v| v.strip_suffix('"'))
            .unwrap_or(value);
        Some(value.to_string())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn events(boundary: &str, chunks: &[&[u8]]) -> Result<Vec<Event>, ClientError> {
        let mut parser = Parser::new(boundary);
        let mut events = vec![];
        for chunk in chunks {
            parser.feed(chunk);
            while let Some(event) = parser.next()? {
                events.push(event);
            }
        }
        parser.finish()?;
        Ok(events)
    }

    /// Merges adjacent data events, which depend on how the input was split.
    fn coalesce(events: Vec<Event>) -> Vec<Event> {
        let mut merged: Vec<Event> = vec![];
        for event in events {
            match (merged.last_mut(), event) {
                (Some(Event::Data(previous)), Event::Data(data)) => {
                    let mut joined = BytesMut::from(&previous[..]);
                    joined.extend_from_slice(&data);
                    *previous = joined.freeze();
                }
                (_, event) => merged.push(event),
            }
        }
        merged
    }

    const BODY: &[u8] = b"preamble\r\n\
        --XYZ\r\n\
        Content-Disposition: form-data; name=\"dict\"; filename=\"d\"\r\n\
        Content-Type: application/octet-stream\r\n\
        \r\n\
        dictionary\r\n--XY bytes\r\n\
        --XYZ  \r\n\
        Content-Disposition: form-data; name=body\r\n\
        \r\n\
        payload\r\n\
        --XYZ--\r\n\
        epilogue";

    fn check(events: Vec<Event>) {
        let events = coalesce(events);
        assert_eq!(events.len(), 5);
        let Event::Headers(dict) = &events[0] else {
            panic!("expected headers, got {:?}", events[0]);
        };
        assert_eq!(part_name(dict).as_deref(), Some("dict"));
        assert_eq!(dict[CONTENT_TYPE], "application/octet-stream");
        assert_eq!(events[1], Event::Data(Bytes::from_static(b"dictionary\r\n--XY bytes")));
        let Event::Headers(body) = &events[2] else {
            panic!("expected headers, got {:?}", events[2]);
        };
        assert_eq!(part_name(body).as_deref(), Some("body"));
        assert_eq!(events[3], Event::Data(Bytes::from_static(b"payload")));
        assert_eq!(events[4], Event::End);
    }

    #[test]
    fn parses_whole_body() {
        check(events("XYZ", &[BODY]).unwrap());
    }

    #[test]
    fn parses_any_split() {
        for at in 0..BODY.len() {
            let (first, second) = BODY.split_at(at);
            check(events("XYZ", &[first, second]).unwrap());
        }
        let bytes: Vec<&[u8]> = BODY.chunks(1).collect();
        check(events("XYZ", &bytes).unwrap());
    }

    #[test]
    fn delimiter_at_start() {
        let body = b"--b\r\n\r\nx\r\n--b--";
        let events = coalesce(events("b", &[body]).unwrap());
        assert_eq!(
            events,
            vec![
                Event::Headers(HeaderMap::new()),
                Event::Data(Bytes::from_static(b"x")),
                Event::End
            ]
        );
    }

    #[test]
    fn truncated_body_is_an_error() {
        let truncated = &BODY[..BODY.len() - 20];
        assert!(matches!(
            events("XYZ", &[truncated]),
            Err(ClientError::Multipart { .. })
        ));
    }

    #[test]
    fn garbage_after_delimiter_is_an_error() {
        let body = b"--b oops\r\n\r\nx\r\n--b--";
        assert!(events("b", &[body]).is_err());
    }

    #[test]
    fn boundary_parameter() {
        let mut headers = HeaderMap::new();
        headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_static("multipart/form-data; charset=utf-8; Boundary=\"a b\""),
        );
        assert_eq!(boundary(&headers).unwrap(), "a b");

        headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; boundary=x"));
        assert!(boundary(&headers).is_err());

        headers.insert(CONTENT_TYPE, HeaderValue::from_static("multipart/mixed"));
        assert!(boundary(&headers).is_err());

        headers.remove(CONTENT_TYPE);
        assert!(boundary(&headers).is_err());
    }
}
