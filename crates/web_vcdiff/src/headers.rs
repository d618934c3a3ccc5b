// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Header names and token matching used by diff-encoding negotiation

use http::header::{HeaderMap, HeaderName, ACCEPT_ENCODING};
use http::StatusCode;

/// Request header listing the diff encodings a client understands.
pub const ACCEPT_DIFF_ENCODING: HeaderName = HeaderName::from_static("accept-diff-encoding");
/// Request header listing short digests of dictionaries the client received inline earlier.
pub const ACCEPT_DIFF_DICTIONARIES: HeaderName =
    HeaderName::from_static("accept-diff-dictionaries");
/// Response header naming the diff encoding applied to the body.
pub const CONTENT_DIFF_ENCODING: HeaderName = HeaderName::from_static("content-diff-encoding");
/// Response header naming the dictionary, optionally followed by `;` and an SRI assertion.
pub const CONTENT_DIFF_DICTIONARY: HeaderName = HeaderName::from_static("content-diff-dictionary");
/// Response header carrying an SRI assertion for the dictionary.
pub const CONTENT_DIFF_DICTIONARY_INTEGRITY: HeaderName =
    HeaderName::from_static("content-diff-dictionary-integrity");

/// The only diff encoding this crate speaks.
pub const VCDIFF: &str = "vcdiff";

/// Iterates over the comma-separated elements of every `name` header, without parameters.
pub fn tokens<'a>(headers: &'a HeaderMap, name: &HeaderName) -> impl Iterator<Item = &'a str> {
    headers
        .get_all(name)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(|element| element.split(';').next().unwrap_or_default().trim())
        .filter(|token| !token.is_empty())
}

/// Whether any `name` header lists `token`, compared case-insensitively.
pub fn contains_token(headers: &HeaderMap, name: &HeaderName, token: &str) -> bool {
    tokens(headers, name).any(|t| t.eq_ignore_ascii_case(token))
}

/// Whether a response with `status` may carry a body (RFC 9110 section 6.4.1).
pub fn body_allowed_for_status(status: StatusCode) -> bool {
    !(status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED)
}

/// Whether `Accept-Encoding` permits a gzip response.
pub fn accepts_gzip(headers: &HeaderMap) -> bool {
    let mut gzip = None;
    let mut wildcard = None;
    for value in headers.get_all(ACCEPT_ENCODING).iter() {
        let Ok(value) = value.to_str() else {
            continue;
        };
        for element in value.split(',') {
            let mut params = element.split(';');
            let coding = params.next().unwrap_or_default().trim();
            let quality = params
                .filter_map(|param| param.trim().strip_prefix("q="))
                .find_map(|q| q.trim().parse::<f32>().ok())
                .unwrap_or(1.0);
            if coding.eq_ignore_ascii_case("gzip") || coding.eq_ignore_ascii_case("x-gzip") {
                gzip = Some(quality);
            } else if coding == "*" {
                wildcard = Some(quality);
            }
        }
    }
    gzip.or(wildcard).is_some_and(|q| q > 0.0)
}
