// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Serves files below a root directory.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use http::header::{HeaderValue, ALLOW, CONTENT_LENGTH, CONTENT_TYPE};
use http::{Method, Request, StatusCode};
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tracing::{debug, error};

use web_vcdiff::server::{error_response, RequestBody};
use web_vcdiff::{Handler, ResponseWriter};

const CHUNK_SIZE: usize = 16 * 1024;

pub struct FileHandler {
    root: PathBuf,
}

impl FileHandler {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Maps a request path to a file below the root, or `None` if it tries to escape it.
    fn resolve(&self, path: &str) -> Option<PathBuf> {
        let relative = path.trim_start_matches('/');
        if relative.contains('\\') || relative.split('/').any(|segment| segment == "..") {
            return None;
        }
        let mut resolved = self.root.join(relative);
        if relative.is_empty() || relative.ends_with('/') {
            resolved.push("index.html");
        }
        Some(resolved)
    }
}

fn content_type(path: &Path) -> &'static str {
    let extension = path
        .extension()
        .and_then(|extension| extension.to_str())
        .unwrap_or_default();
    match extension {
        "html" | "htm" => "text/html; charset=utf-8",
        "css" => "text/css; charset=utf-8",
        "js" | "mjs" => "text/javascript; charset=utf-8",
        "json" => "application/json",
        "txt" => "text/plain; charset=utf-8",
        "svg" => "image/svg+xml",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "wasm" => "application/wasm",
        _ => "application/octet-stream",
    }
}

#[async_trait::async_trait]
impl Handler for FileHandler {
    async fn serve(&self, request: Request<RequestBody>, writer: &mut dyn ResponseWriter) {
        let method = request.method().clone();
        if method != Method::GET && method != Method::HEAD {
            writer
                .headers_mut()
                .insert(ALLOW, HeaderValue::from_static("GET, HEAD"));
            error_response(writer, StatusCode::METHOD_NOT_ALLOWED).await;
            return;
        }

        let Some(path) = self.resolve(request.uri().path()) else {
            error_response(writer, StatusCode::NOT_FOUND).await;
            return;
        };
        let (mut file, len) = match open(&path).await {
            Ok(opened) => opened,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!("no file at {}", path.display());
                error_response(writer, StatusCode::NOT_FOUND).await;
                return;
            }
            Err(err) => {
                error!("could not open {}: {err}", path.display());
                error_response(writer, StatusCode::INTERNAL_SERVER_ERROR).await;
                return;
            }
        };

        let headers = writer.headers_mut();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static(content_type(&path)));
        headers.insert(CONTENT_LENGTH, HeaderValue::from(len));
        writer.write_header(StatusCode::OK).await;
        if method == Method::HEAD {
            return;
        }

        let mut buf = vec![0; CHUNK_SIZE];
        loop {
            let read = match file.read(&mut buf).await {
                Ok(0) => break,
                Ok(read) => read,
                Err(err) => {
                    error!("could not read {}: {err}", path.display());
                    writer.abort(Box::new(err)).await;
                    return;
                }
            };
            if writer.write(&buf[..read]).await.is_err() {
                return;
            }
        }
    }
}

async fn open(path: &Path) -> std::io::Result<(File, u64)> {
    let file = File::open(path).await?;
    let metadata = file.metadata().await?;
    if metadata.is_dir() {
        return Err(ErrorKind::NotFound.into());
    }
    Ok((file, metadata.len()))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use bytes::Bytes;
    use http_body_util::{BodyExt, Empty};

    use super::*;

    fn handler() -> (tempfile::TempDir, Arc<FileHandler>) {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("index.html"), "<h1>home</h1>").unwrap();
        std::fs::create_dir(dir.path().join("docs")).unwrap();
        std::fs::write(dir.path().join("docs/notes.txt"), "x".repeat(40_000)).unwrap();
        let handler = Arc::new(FileHandler::new(dir.path()));
        (dir, handler)
    }

    async fn get(
        handler: &Arc<FileHandler>,
        method: Method,
        path: &str,
    ) -> (StatusCode, http::HeaderMap, Bytes) {
        let request = Request::builder()
            .method(method)
            .uri(path)
            .body(Empty::<Bytes>::new())
            .unwrap();
        let response = web_vcdiff::respond(handler.clone(), request).await;
        let (parts, body) = response.into_parts();
        let body = body.collect().await.unwrap().to_bytes();
        (parts.status, parts.headers, body)
    }

    #[tokio::test]
    async fn serves_files_and_index() {
        let (_dir, handler) = handler();

        let (status, headers, body) = get(&handler, Method::GET, "/").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers[CONTENT_TYPE], "text/html; charset=utf-8");
        assert_eq!(body, "<h1>home</h1>");

        let (status, headers, body) = get(&handler, Method::GET, "/docs/notes.txt").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers[CONTENT_LENGTH], "40000");
        assert_eq!(body, "x".repeat(40_000));
    }

    #[tokio::test]
    async fn head_has_headers_only() {
        let (_dir, handler) = handler();
        let (status, headers, body) = get(&handler, Method::HEAD, "/docs/notes.txt").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers[CONTENT_LENGTH], "40000");
        assert!(body.is_empty());
    }

    #[tokio::test]
    async fn error_statuses() {
        let (_dir, handler) = handler();
        let cases = [
            (Method::GET, "/missing.txt", StatusCode::NOT_FOUND),
            (Method::GET, "/docs", StatusCode::NOT_FOUND),
            (Method::GET, "/docs/", StatusCode::NOT_FOUND),
            (Method::GET, "/../etc/passwd", StatusCode::NOT_FOUND),
            (Method::GET, "/docs/..%2f/x", StatusCode::NOT_FOUND),
            (Method::POST, "/index.html", StatusCode::METHOD_NOT_ALLOWED),
        ];
        for (method, path, expected) in cases {
            let (status, headers, _) = get(&handler, method.clone(), path).await;
            assert_eq!(status, expected, "{method} {path}");
            if expected == StatusCode::METHOD_NOT_ALLOWED {
                assert_eq!(headers[ALLOW], "GET, HEAD");
            }
        }
    }
}
