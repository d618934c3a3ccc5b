// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! `multipart/form-data` framing for responses that carry their dictionary inline.

use http::header::HeaderValue;

pub(crate) const DICTIONARY_PART: &str = "dict";
pub(crate) const BODY_PART: &str = "body";

pub(crate) struct PartWriter {
    boundary: String,
    parts: usize,
}

impl PartWriter {
    pub fn new() -> Self {
        Self {
            boundary: uuid::Uuid::new_v4().simple().to_string(),
            parts: 0,
        }
    }

    pub fn content_type(&self) -> HeaderValue {
        let value = format!("multipart/form-data; boundary={}", self.boundary);
        HeaderValue::try_from(value).unwrap_or(HeaderValue::from_static("multipart/form-data"))
    }

    /// Delimiter and headers that start a new part named `name`.
    pub fn start_part(
        &mut self,
        name: &str,
        filename: &str,
        content_type: Option<&HeaderValue>,
        out: &mut Vec<u8>,
    ) {
        if self.parts > 0 {
            out.extend_from_slice(b"\r\n");
        }
        self.parts += 1;
        out.extend_from_slice(b"--");
        out.extend_from_slice(self.boundary.as_bytes());
        out.extend_from_slice(b"\r\n");

        let disposition = format!("form-data; name=\"{name}\"; filename=\"{filename}\"");
        header_line(out, "Content-Disposition", disposition.as_bytes());
        if let Some(content_type) = content_type {
            header_line(out, "Content-Type", content_type.as_bytes());
        }
        out.extend_from_slice(b"\r\n");
    }

    /// Appends the closing delimiter.
    pub fn finish(&self, out: &mut Vec<u8>) {
        if self.parts > 0 {
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b"--");
        out.extend_from_slice(self.boundary.as_bytes());
        out.extend_from_slice(b"--\r\n");
    }
}

fn header_line(out: &mut Vec<u8>, name: &str, value: &[u8]) {
    out.extend_from_slice(name.as_bytes());
    out.extend_from_slice(b": ");
    out.extend_from_slice(value);
    out.extend_from_slice(b"\r\n");
}
