// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Runs a [`Handler`] behind a hyper service.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use bytes::Bytes;
use futures::FutureExt;
use http::{response, HeaderMap, Request, Response, StatusCode};
use http_body::{Body, Frame};
use http_body_util::{BodyExt, StreamBody};
use tokio::sync::{mpsc, oneshot};
use tracing::error;

use super::{Flush, Handler, ResponseWriter, WriteError};
use crate::response::{internal_error, GenericResponse};
use crate::BoxError;

type BodyFrame = Result<Frame<Bytes>, anyhow::Error>;

/// Serves `request` with `handler`, returning as soon as the handler commits the response head.
///
/// The handler runs on its own task and the body streams from it as it writes. A panic
/// before the head is committed becomes a 500 response; afterwards it fails the body stream.
pub async fn respond<H, B>(handler: Arc<H>, request: Request<B>) -> GenericResponse
where
    H: Handler + 'static,
    B: Body<Data = Bytes> + Send + 'static,
    B::Error: Into<BoxError>,
{
    let request = request.map(|body| body.map_err(Into::into).boxed_unsync());
    let (head_tx, head_rx) = oneshot::channel();
    let (body_tx, mut body_rx) = mpsc::channel::<BodyFrame>(16);

    tokio::spawn(async move {
        let mut writer = ChannelWriter {
            headers: HeaderMap::new(),
            head: Some(head_tx),
            body: body_tx,
            aborted: false,
        };
        let outcome = AssertUnwindSafe(handler.serve(request, &mut writer))
            .catch_unwind()
            .await;
        match outcome {
            Ok(()) => writer.commit(StatusCode::OK),
            Err(panic) => {
                let message = panic_message(&*panic).to_owned();
                error!("handler panicked: {message}");
                if writer.head.is_some() {
                    writer.headers.clear();
                    writer.commit(StatusCode::INTERNAL_SERVER_ERROR);
                } else {
                    let err = anyhow::anyhow!("handler panicked: {message}");
                    let _ = writer.body.send(Err(err)).await;
                }
            }
        }
    });

    let body = StreamBody::new(futures::stream::poll_fn(move |cx| body_rx.poll_recv(cx))).boxed();
    match head_rx.await {
        Ok(head) => Response::from_parts(head, body),
        // Only possible if the runtime is shutting down under us.
        Err(_) => internal_error(),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "non-string panic payload"
    }
}

/// Hands the response head to [`respond`] on commit, and body frames to hyper.
struct ChannelWriter {
    headers: HeaderMap,
    head: Option<oneshot::Sender<response::Parts>>,
    body: mpsc::Sender<BodyFrame>,
    aborted: bool,
}

impl ChannelWriter {
    fn commit(&mut self, status: StatusCode) {
        let Some(head) = self.head.take() else {
            return;
        };
        let (mut parts, ()) = Response::new(()).into_parts();
        parts.status = status;
        parts.headers = std::mem::take(&mut self.headers);
        let _ = head.send(parts);
    }
}

#[async_trait::async_trait]
impl ResponseWriter for ChannelWriter {
    fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    async fn write_header(&mut self, status: StatusCode) {
        self.commit(status)
    }

    async fn write(&mut self, bytes: &[u8]) -> Result<usize, WriteError> {
        self.commit(StatusCode::OK);
        if self.aborted {
            return Err(WriteError::Aborted);
        }
        if bytes.is_empty() {
            return Ok(0);
        }
        let frame = Frame::data(Bytes::copy_from_slice(bytes));
        self.body
            .send(Ok(frame))
            .await
            .map_err(|_| WriteError::Disconnected)?;
        Ok(bytes.len())
    }

    async fn abort(&mut self, error: BoxError) {
        self.commit(StatusCode::INTERNAL_SERVER_ERROR);
        if !self.aborted {
            self.aborted = true;
            let _ = self.body.send(Err(anyhow::anyhow!(error))).await;
        }
    }

    fn flusher(&mut self) -> Option<&mut dyn Flush> {
        Some(self)
    }
}

#[async_trait::async_trait]
impl Flush for ChannelWriter {
    /// Frames are handed to hyper as soon as they are written, so this only commits.
    async fn flush(&mut self) -> Result<(), WriteError> {
        self.commit(StatusCode::OK);
        if self.body.is_closed() {
            return Err(WriteError::Disconnected);
        }
        Ok(())
    }
}
