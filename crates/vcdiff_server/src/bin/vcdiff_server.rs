// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

use clap::Parser;
use tracing_subscriber::FmtSubscriber;

use vcdiff_server::opts::Opts;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opts = Opts::parse();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(opts.log_level())
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    vcdiff_server::run(opts).await
}
