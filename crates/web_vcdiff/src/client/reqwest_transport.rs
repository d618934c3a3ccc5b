// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

use bytes::Bytes;
use http::{Request, Response};
use http_body_util::BodyExt;
use tracing::debug;

use super::{ClientBody, Transport};
use crate::error::ClientError;
use crate::BoxError;

/// [`Transport`] over a [`reqwest::Client`] that does not follow redirects.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client, // cheaply cloneable (Arc<...> internally), see docs
}

impl ReqwestTransport {
    pub fn new() -> Result<Self, ClientError> {
        let client = reqwest::ClientBuilder::new()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| ClientError::Request {
                ctx: "building HTTP client".into(),
                status: None,
                retriable: false,
                source: Box::new(e),
            })?;
        Ok(Self { client })
    }

    /// Wraps an existing client. It should be built with redirects disabled.
    pub fn from_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait::async_trait]
impl Transport for ReqwestTransport {
    async fn round_trip(&self, request: Request<Bytes>) -> Result<Response<ClientBody>, ClientError> {
        let (parts, body) = request.into_parts();
        let url = parts.uri.to_string();

        let mut rb = self
            .client
            .request(parts.method, &url)
            .headers(parts.headers);
        if !body.is_empty() {
            rb = rb.body(body);
        }

        debug!("web_vcdiff: requesting {url}");

        let response = rb.send().await.map_err(|e| ClientError::Request {
            ctx: format!("requesting {url}"),
            status: e.status().map(|status| status.as_u16()),
            retriable: e.is_timeout() || e.is_connect(),
            source: Box::new(e),
        })?;

        debug!("web_vcdiff: response from {url:?}: {}", response.status());

        let response = Response::<reqwest::Body>::from(response);
        Ok(response.map(|body| body.map_err(|e| -> BoxError { Box::new(e) }).boxed_unsync()))
    }
}
