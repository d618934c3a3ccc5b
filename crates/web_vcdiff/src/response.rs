// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Response-related helpers

use http::header::{HeaderValue, CONTENT_TYPE};
use http::{Response, StatusCode};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::Bytes;

/// Type-erased HTTP response
pub type GenericResponse = Response<BoxBody<Bytes, anyhow::Error>>;

/// Return a response with `status` and no body.
pub fn empty(status: StatusCode) -> GenericResponse {
    let body = Empty::new().map_err(anyhow::Error::from).boxed();
    let mut response = Response::new(body);
    *response.status_mut() = status;
    response
}

/// Return a [`GenericResponse`] with known content.
pub fn full(
    status: StatusCode,
    content_type: &'static str,
    content: impl Into<Bytes>,
) -> GenericResponse {
    let body = Full::new(content.into())
        .map_err(anyhow::Error::from)
        .boxed();
    let mut response = Response::new(body);
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

/// Return a plain text response with known content.
pub fn text(status: StatusCode, content: impl ToString) -> GenericResponse {
    full(status, "text/plain; charset=utf-8", content.to_string())
}

/// Return a plain text "404 not found" response with appropriate status code
pub fn not_found() -> GenericResponse {
    text(StatusCode::NOT_FOUND, "404 not found")
}

/// Return a plain text "405 method not allowed" response listing the `allowed` methods.
pub fn method_not_allowed(allowed: &'static str) -> GenericResponse {
    let mut response = text(StatusCode::METHOD_NOT_ALLOWED, "405 method not allowed");
    response
        .headers_mut()
        .insert(http::header::ALLOW, HeaderValue::from_static(allowed));
    response
}

/// Return a plain text "500 internal server error" response.
pub fn internal_error() -> GenericResponse {
    text(StatusCode::INTERNAL_SERVER_ERROR, "500 internal server error")
}

#[cfg(test)]
pub(crate) fn to_body(response: GenericResponse) -> Vec<u8> {
    let body = response.into_body().collect();
    futures::executor::block_on(body)
        .unwrap()
        .to_bytes()
        .to_vec()
}
