// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};

use bytes::Bytes;
use http_body::{Body, Frame};
use http_body_util::BodyExt;
use tokio::sync::mpsc;

use super::multipart::{Event, MultipartReader};
use super::ClientBody;
use crate::codec::CodecSession;
use crate::error::ClientError;
use crate::BoxError;

/// Decoded chunks buffered ahead of the reader.
const PIPE_CAPACITY: usize = 4;

pub(crate) fn read_error(source: BoxError) -> ClientError {
    ClientError::Request {
        ctx: "reading response body".into(),
        status: None,
        retriable: false,
        source,
    }
}

/// Where encoded bytes come from.
pub(crate) enum Source {
    Raw(ClientBody),
    /// The `body` part of an inline-dictionary response, after the dictionary part.
    Multipart(MultipartReader),
}

impl Source {
    async fn next_chunk(&mut self) -> Result<Option<Bytes>, ClientError> {
        match self {
            Source::Raw(body) => loop {
                match body.frame().await {
                    Some(Ok(frame)) => {
                        if let Ok(data) = frame.into_data() {
                            return Ok(Some(data));
                        }
                    }
                    Some(Err(err)) => return Err(read_error(err)),
                    None => return Ok(None),
                }
            },
            Source::Multipart(reader) => match reader.next_event().await? {
                Event::Data(data) => Ok(Some(data)),
                Event::End => Ok(None),
                Event::Headers(_) => Err(ClientError::Multipart {
                    error: "unexpected part after the body part".into(),
                }),
            },
        }
    }
}

enum State {
    Idle {
        source: Source,
        session: Box<dyn CodecSession>,
    },
    Running(mpsc::Receiver<Result<Bytes, ClientError>>),
    Failed(Arc<ClientError>),
    Done,
}

/// Response body that decodes the wire body as it is read.
///
/// Decoding runs on a separate task, started by the first poll, that stops when this body is
/// dropped. If decoding fails, the error is returned by every later poll.
pub struct DecodedBody {
    state: State,
}

impl DecodedBody {
    pub(crate) fn new(source: Source, session: Box<dyn CodecSession>) -> Self {
        Self {
            state: State::Idle { source, session },
        }
    }
}

impl Body for DecodedBody {
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, BoxError>>> {
        let this = &mut *self;
        if matches!(this.state, State::Idle { .. }) {
            if let State::Idle { source, session } = std::mem::replace(&mut this.state, State::Done)
            {
                let (tx, rx) = mpsc::channel(PIPE_CAPACITY);
                tokio::spawn(pump(source, session, tx));
                this.state = State::Running(rx);
            }
        }

        match &mut this.state {
            State::Running(rx) => match ready!(rx.poll_recv(cx)) {
                Some(Ok(data)) => Poll::Ready(Some(Ok(Frame::data(data)))),
                Some(Err(err)) => {
                    let err = Arc::new(err);
                    this.state = State::Failed(err.clone());
                    Poll::Ready(Some(Err(Box::new(err))))
                }
                None => {
                    this.state = State::Done;
                    Poll::Ready(None)
                }
            },
            State::Failed(err) => Poll::Ready(Some(Err(Box::new(err.clone())))),
            State::Idle { .. } | State::Done => Poll::Ready(None),
        }
    }

    fn is_end_stream(&self) -> bool {
        matches!(self.state, State::Done)
    }
}

async fn pump(
    mut source: Source,
    mut session: Box<dyn CodecSession>,
    tx: mpsc::Sender<Result<Bytes, ClientError>>,
) {
    let result = tokio::select! {
        result = decode(&mut source, session.as_mut(), &tx) => result,
        // Nobody is reading anymore.
        _ = tx.closed() => return,
    };
    if let Err(err) = result {
        let _ = tx.send(Err(err)).await;
    }
}

async fn decode(
    source: &mut Source,
    session: &mut dyn CodecSession,
    tx: &mpsc::Sender<Result<Bytes, ClientError>>,
) -> Result<(), ClientError> {
    loop {
        let mut decoded = vec![];
        let done = match source.next_chunk().await {
            Ok(Some(chunk)) => {
                session.write(&chunk, &mut decoded)?;
                false
            }
            Ok(None) => {
                session.finish(&mut decoded)?;
                true
            }
            Err(err) => {
                // Finish anyway so the session is closed, but the read error is what counts.
                let _ = session.finish(&mut decoded);
                return Err(err);
            }
        };
        if !decoded.is_empty() && tx.send(Ok(decoded.into())).await.is_err() {
            return Ok(());
        }
        if done {
            return Ok(());
        }
    }
}
