// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Serves a directory over HTTP, diff-encoding responses for clients that ask for it.

pub mod files;
pub mod opts;
pub mod server;

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use anyhow::Context;
use hyper::body::Incoming;
use hyper::Request;
use tokio::net::TcpListener;
use tracing::info;

use web_vcdiff::dictionary::read_dictionary;
use web_vcdiff::registry::{is_dictionary_path, serve_dictionary};
use web_vcdiff::response::GenericResponse;
use web_vcdiff::{Dictionaries, FixedDictionary, VcdiffHandler};

use crate::files::FileHandler;
use crate::opts::Opts;
use crate::server::Server;

/// Routes dictionary requests to the registry and everything else to the encoded files.
#[derive(Clone)]
pub struct Site {
    files: Arc<VcdiffHandler<FileHandler>>,
    dictionaries: Arc<dyn Dictionaries>,
}

impl Site {
    pub fn new(files: VcdiffHandler<FileHandler>, dictionaries: Arc<dyn Dictionaries>) -> Self {
        Self {
            files: Arc::new(files),
            dictionaries,
        }
    }

    pub async fn respond(&self, request: Request<Incoming>) -> GenericResponse {
        if is_dictionary_path(request.uri().path()) {
            let (parts, _) = request.into_parts();
            return serve_dictionary(self.dictionaries.as_ref(), &parts).await;
        }
        web_vcdiff::respond(self.files.clone(), request).await
    }
}

pub async fn run(opts: Opts) -> anyhow::Result<()> {
    let dictionary = read_dictionary(&opts.dictionary)
        .await
        .with_context(|| format!("reading dictionary {}", opts.dictionary.display()))?;
    info!(
        "using dictionary {} ({} bytes)",
        dictionary.id(),
        dictionary.data().len()
    );
    let dictionaries: Arc<dyn Dictionaries> = Arc::new(FixedDictionary::new(dictionary));
    let files = VcdiffHandler::new(FileHandler::new(&opts.root), dictionaries.clone())
        .with_config(opts.encode_config());
    let site = Site::new(files, dictionaries);

    let address = SocketAddr::from((Ipv4Addr::UNSPECIFIED, opts.port));
    let listener = TcpListener::bind(address)
        .await
        .with_context(|| format!("binding {address}"))?;
    info!("listening on {address}");

    let server = Server::new(opts.max_connections);
    let serving = server.serve(listener, move |request| {
        let site = site.clone();
        async move { site.respond(request).await }
    });
    let shutdown = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!("could not listen for ctrl-c: {err}");
            return;
        }
        info!("shutting down");
        server.graceful_shutdown().await;
    };
    tokio::join!(serving, shutdown);
    Ok(())
}
