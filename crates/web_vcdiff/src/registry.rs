// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Serves dictionaries to clients at [`DICTIONARY_PATH`].

use http::header::{
    HeaderValue, CACHE_CONTROL, CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_TYPE, IF_MODIFIED_SINCE,
    IF_NONE_MATCH, LAST_MODIFIED, VARY,
};
use http::{request, Method, StatusCode};
use tracing::{debug, error};

use crate::dictionary::{Dictionaries, DictionaryId};
use crate::headers::accepts_gzip;
use crate::response::{self, GenericResponse};

/// Path prefix under which dictionaries are served, followed by the identifier token.
pub const DICTIONARY_PATH: &str = "/.well-known/web-vcdiff/d/";

const IMMUTABLE: &str = "public, max-age=31536000, immutable";
/// Dictionary contents never change, so any fixed date in the past will do.
const LAST_MODIFIED_DATE: &str = "Mon, 01 Jan 2001 01:00:00 GMT";

/// Whether `path` is in the dictionary namespace.
pub fn is_dictionary_path(path: &str) -> bool {
    path.starts_with(DICTIONARY_PATH)
}

/// Answers a request for a dictionary.
///
/// Unknown or malformed identifiers get a 404 and methods other than GET and HEAD a 405.
/// Dictionaries are immutable, so every conditional request is answered with a 304.
///
/// # Panics
///
/// Panics if `dictionaries` returns a dictionary whose contents don't match its identifier.
pub async fn serve_dictionary(
    dictionaries: &dyn Dictionaries,
    request: &request::Parts,
) -> GenericResponse {
    let Some(token) = request.uri.path().strip_prefix(DICTIONARY_PATH) else {
        return response::not_found();
    };
    let Ok(id) = DictionaryId::decode(token) else {
        return response::not_found();
    };
    if request.method != Method::GET && request.method != Method::HEAD {
        return response::method_not_allowed("GET, HEAD");
    }

    let dictionary = match dictionaries.find(&id).await {
        Ok(Some(dictionary)) => dictionary,
        Ok(None) => return response::not_found(),
        Err(err) => {
            error!("dictionary lookup for {id} failed: {err}");
            return response::internal_error();
        }
    };
    dictionary.assert_valid();

    let headers = &request.headers;
    if headers.contains_key(IF_NONE_MATCH) || headers.contains_key(IF_MODIFIED_SINCE) {
        let mut response = response::empty(StatusCode::NOT_MODIFIED);
        set_cache_headers(response.headers_mut());
        return response;
    }

    let (body, gzipped) = match dictionary.gzipped() {
        Some(gzipped) if accepts_gzip(headers) => (gzipped.clone(), true),
        _ => (dictionary.data().clone(), false),
    };
    debug!("serving dictionary {id} ({} bytes, gzip: {gzipped})", body.len());

    let content_length = HeaderValue::from(body.len());
    let mut response = if request.method == Method::HEAD {
        response::empty(StatusCode::OK)
    } else {
        response::full(StatusCode::OK, "application/octet-stream", body)
    };
    let response_headers = response.headers_mut();
    response_headers.insert(
        CONTENT_TYPE,
        HeaderValue::from_static("application/octet-stream"),
    );
    response_headers.insert(CONTENT_LENGTH, content_length);
    set_cache_headers(response_headers);
    response_headers.insert(VARY, HeaderValue::from_static("Accept-Encoding"));
    if gzipped {
        response_headers.insert(CONTENT_ENCODING, HeaderValue::from_static("gzip"));
    }
    response
}

fn set_cache_headers(headers: &mut http::HeaderMap) {
    headers.insert(CACHE_CONTROL, HeaderValue::from_static(IMMUTABLE));
    headers.insert(LAST_MODIFIED, HeaderValue::from_static(LAST_MODIFIED_DATE));
}
