// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

use anyhow::{anyhow, Context, Result};
use bytes::Bytes;
use clap::{ArgAction, Parser};
use http::header::{HeaderName, HeaderValue};
use http::{Request, Uri};
use http_body_util::BodyExt;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info, Level};
use tracing_subscriber::FmtSubscriber;

use web_vcdiff::{ReqwestTransport, Transport, VcdiffTransport};

#[derive(Debug, Parser)]
#[command(
    version,
    about = "Fetches a URL, asking for a diff-encoded response and decoding it.",
    long_about = "vcurl makes a single GET request with Accept-Diff-Encoding: vcdiff, fetches the dictionary the server names if needed, and writes the decoded body to stdout."
)]
struct Arguments {
    #[arg(help = "URL to fetch.")]
    url: Uri,

    #[arg(
        short = 'H',
        long,
        value_name = "NAME:VALUE",
        action = ArgAction::Append,
        help = "Add a request header, can be used multiple times."
    )]
    header: Vec<String>,

    #[arg(short, long, help = "Print the response status and headers to stderr.")]
    include: bool,

    #[arg(
        short,
        long,
        help = "Suppress non-error output and set the log level to WARN."
    )]
    quiet: bool,

    #[arg(
        short,
        long,
        action = ArgAction::Count,
        help = "Increase verbosity level, can be used multiple times."
    )]
    verbose: u8,
}

fn parse_header(header: &str) -> Result<(HeaderName, HeaderValue)> {
    let (name, value) = header
        .split_once(':')
        .ok_or_else(|| anyhow!("header {header:?} is not of the form NAME:VALUE"))?;
    let name = HeaderName::try_from(name.trim()).context("invalid header name")?;
    let value = HeaderValue::try_from(value.trim()).context("invalid header value")?;
    Ok((name, value))
}

async fn vcurl(args: &Arguments) -> Result<()> {
    let mut request = Request::get(args.url.clone()).body(Bytes::new())?;
    for header in &args.header {
        let (name, value) = parse_header(header)?;
        request.headers_mut().append(name, value);
    }

    let transport = VcdiffTransport::new(ReqwestTransport::new()?);
    let response = transport.round_trip(request).await?;

    info!("{} {}", response.status(), args.url);
    for (name, value) in response.headers() {
        debug!("{name}: {value:?}");
    }
    if args.include {
        eprintln!("{:?} {}", response.version(), response.status());
        for (name, value) in response.headers() {
            eprintln!("{name}: {}", String::from_utf8_lossy(value.as_bytes()));
        }
        eprintln!();
    }

    let mut body = response.into_body();
    let mut stdout = tokio::io::stdout();
    while let Some(frame) = body.frame().await {
        let frame = frame.map_err(|err| anyhow!(err)).context("reading response")?;
        if let Ok(data) = frame.into_data() {
            stdout.write_all(&data).await?;
        }
    }
    stdout.flush().await?;
    Ok(())
}

#[tokio::main]
async fn main() {
    let args = Arguments::parse();

    let subscriber = FmtSubscriber::builder()
        .with_writer(std::io::stderr)
        .with_max_level(match (args.quiet, args.verbose) {
            (true, _) => Level::WARN,
            (false, 0) => Level::INFO,
            (false, 1) => Level::DEBUG,
            (false, _) => Level::TRACE,
        })
        .finish();
    tracing::subscriber::set_global_default(subscriber).unwrap();

    if let Err(err) = vcurl(&args).await {
        error!("{err:#}");
        std::process::exit(1);
    }
}
