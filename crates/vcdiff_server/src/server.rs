// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Accept loop with a connection limit and graceful shutdown.

use std::convert::Infallible;
use std::future::Future;
use std::pin::pin;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use hyper::body::{Body, Incoming};
use hyper::server::conn::http1;
use hyper::service::{service_fn, HttpService};
use hyper::Request;
use hyper_util::rt::TokioIo;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::select;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tokio::time::sleep;
use tracing::{error, info, info_span, warn, Instrument};

use web_vcdiff::response::GenericResponse;

/// Serves HTTP/1 connections while allowing for graceful shutdowns.
pub struct Server {
    concurrent_connections: Arc<Semaphore>,
    shutdown: watch::Sender<bool>,
}

impl Server {
    /// `max_connections` is the number of simultaneous connections served before new ones get
    /// a minimal 503 instead.
    pub fn new(max_connections: usize) -> Self {
        let concurrent_connections = Arc::new(Semaphore::new(max_connections));
        let (shutdown, _) = watch::channel(false);
        Self {
            concurrent_connections,
            shutdown,
        }
    }

    /// Serves connections from `listener` with `responder`, each on its own task.
    ///
    /// Resolves once [`graceful_shutdown`](Self::graceful_shutdown) has been called and every
    /// connection accepted by this call has finished.
    pub async fn serve<R, F>(&self, listener: TcpListener, responder: R)
    where
        R: Fn(Request<Incoming>) -> F + Clone + Send + Sync + 'static,
        F: Future<Output = GenericResponse> + Send + 'static,
    {
        let mut shutdown_receiver = self.shutdown.subscribe();
        let mut was_shutdown = pin!(shutdown_receiver.wait_for(|&done| done));
        let mut connections = JoinSet::new();

        info!("Started serving");
        loop {
            let (stream, peer_addr) = select! {
                biased; // necessary to guarantee we don't handle connections if already shut down
                _ = &mut was_shutdown => break,
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        error!("Couldn't accept connection: {err}");
                        continue;
                    }
                },
            };
            while connections.try_join_next().is_some() {}

            let connection_span = info_span!("connection", addr=%peer_addr);
            let Ok(permit) = self.concurrent_connections.clone().try_acquire_owned() else {
                connections.spawn(
                    async move {
                        warn!("Too overloaded; sending minimal 503.");
                        let _ = respond_with_temporarily_unavailable(stream).await;
                    }
                    .instrument(connection_span),
                );
                continue;
            };

            let responder = responder.clone();
            let service = service_fn(move |request: Request<Incoming>| {
                let responder = responder.clone();
                async move {
                    info!("Request: {} {}", request.method(), request.uri());
                    let response = responder(request).await;
                    info!("Response: {}", response.status());
                    Ok::<_, Infallible>(response)
                }
            });
            let mut shutdown_receiver = self.shutdown.subscribe();
            connections.spawn(
                async move {
                    info!("Connected.");
                    let _permit = permit;
                    let wants_shutdown = shutdown_receiver.wait_for(|&done| done);
                    let http_connection =
                        http1::Builder::new().serve_connection(TokioIo::new(stream), service);
                    if let Err(err) = with_graceful_shutdown(http_connection, wants_shutdown).await
                    {
                        error!("Error serving: {err}");
                    }
                    info!("Disconnected.");
                }
                .instrument(connection_span),
            );
        }

        drop(listener);
        while connections.join_next().await.is_some() {}
        info!("Stopped serving");
    }

    /// Stops accepting connections, and lets open ones finish their current request.
    ///
    /// Resolves once every [`serve`](Self::serve) call has returned.
    pub async fn graceful_shutdown(&self) {
        self.shutdown.send_replace(true);
        self.shutdown.closed().await;
    }
}

/// Cheaply responds to an HTTP 1 connection with a minimal 503.
async fn respond_with_temporarily_unavailable(
    mut connection: impl AsyncWriteExt + Unpin,
) -> std::io::Result<()> {
    // The request is never parsed; a slow client shouldn't cost an overloaded server anything.
    let write_response = async {
        let msg = b"HTTP/1.1 503 Service Unavailable\r\n\
                    Content-Type: text/plain;charset=utf-8\r\n\
                    Content-Length: 22\r\n\
                    \r\n\
                    Too many connections!\n";
        connection.write_all(msg).await?;
        connection.shutdown().await
    };
    select! {
         result = write_response => result,
         _ = sleep(Duration::from_secs(1)) => Err(std::io::ErrorKind::TimedOut.into()),
    }
}

/// Gracefully terminate `connection` if `want_shutdown` resolves.
async fn with_graceful_shutdown<I, S, B>(
    connection: http1::Connection<I, S>,
    want_shutdown: impl Future,
) -> Result<(), hyper::Error>
where
    I: hyper::rt::Read + hyper::rt::Write + Unpin + 'static,
    S: HttpService<Incoming, ResBody = B>,
    S::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    B: Body + 'static,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    // Polling a connection and shutting it down both need exclusive access.
    let mut connection = pin!(connection);
    let mut want_shutdown = pin!(want_shutdown.fuse());
    std::future::poll_fn(|cx| {
        if want_shutdown.as_mut().poll(cx).is_ready() {
            connection.as_mut().graceful_shutdown();
        }
        connection.as_mut().poll(cx)
    })
    .await
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use http::StatusCode;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpStream;

    use super::*;
    use web_vcdiff::response;

    async fn listen() -> (TcpListener, SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        (listener, addr)
    }

    async fn raw_get(addr: SocketAddr) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        response
    }

    #[tokio::test]
    async fn serves_until_shutdown() {
        let (listener, addr) = listen().await;
        let server = Server::new(4);
        let serving = server.serve(listener, |_| async {
            response::text(StatusCode::OK, "hello")
        });
        let client = async {
            let response = raw_get(addr).await;
            assert!(response.starts_with("HTTP/1.1 200 OK\r\n"), "{response}");
            assert!(response.ends_with("hello"), "{response}");
            server.graceful_shutdown().await;
        };
        tokio::join!(serving, client);
    }

    #[tokio::test]
    async fn overloaded_server_sends_503() {
        let (listener, addr) = listen().await;
        let server = Server::new(0);
        let serving = server.serve(listener, |_| async {
            response::text(StatusCode::OK, "unreachable")
        });
        let client = async {
            // The 503 is sent without reading the request.
            let mut stream = TcpStream::connect(addr).await.unwrap();
            let mut response = String::new();
            stream.read_to_string(&mut response).await.unwrap();
            assert!(response.starts_with("HTTP/1.1 503 Service Unavailable\r\n"), "{response}");
            assert!(response.ends_with("Too many connections!\n"), "{response}");
            server.graceful_shutdown().await;
        };
        tokio::join!(serving, client);
    }
}
