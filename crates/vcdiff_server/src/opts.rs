// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

use std::path::PathBuf;

use clap::{crate_version, ArgAction, Parser};
use tracing::Level;

use web_vcdiff::server::{EncodeConfig, IntegrityAdvertisement, Strategy};

#[derive(Debug, Parser)]
#[clap(
    name = "vcdiff_server",
    about = "Serves a directory, diff-encoding responses against a dictionary",
    version = crate_version!()
)]
pub struct Opts {
    #[clap(
        short,
        long,
        help = "Port to listen on.",
        default_value = "8090",
        env = "WEB_VCDIFF_PORT"
    )]
    pub port: u16,

    #[clap(
        long,
        help = "Directory to serve files from.",
        default_value = ".",
        env = "WEB_VCDIFF_ROOT"
    )]
    pub root: PathBuf,

    #[clap(
        long,
        help = "File to use as the dictionary for every response.",
        env = "WEB_VCDIFF_DICTIONARY"
    )]
    pub dictionary: PathBuf,

    #[clap(
        long,
        help = "Send the dictionary inside responses to clients that don't have it yet, instead of serving it separately.",
        env = "WEB_VCDIFF_MULTIPART"
    )]
    pub multipart: bool,

    #[clap(
        long,
        help = "Advertise a subresource integrity digest for the dictionary.",
        env = "WEB_VCDIFF_INTEGRITY"
    )]
    pub integrity: bool,

    #[clap(
        long,
        help = "Add checksums to encoded responses.",
        env = "WEB_VCDIFF_CHECKSUM"
    )]
    pub checksum: bool,

    #[clap(
        long,
        help = "Maximum simultaneously connected clients before connections are no longer accepted",
        default_value = "1024",
        env = "WEB_VCDIFF_MAX_CONNECTIONS"
    )]
    pub max_connections: usize,

    #[clap(short, long, help = "Only log warnings and errors.")]
    pub quiet: bool,

    #[clap(
        short,
        long,
        action = ArgAction::Count,
        help = "Increase verbosity level, can be used multiple times."
    )]
    pub verbose: u8,
}

impl Opts {
    pub fn encode_config(&self) -> EncodeConfig {
        EncodeConfig {
            strategy: if self.multipart {
                Strategy::Multipart
            } else {
                Strategy::Direct
            },
            integrity: if self.integrity {
                IntegrityAdvertisement::Header
            } else {
                IntegrityAdvertisement::Omit
            },
            checksum: self.checksum,
        }
    }

    pub fn log_level(&self) -> Level {
        match (self.quiet, self.verbose) {
            (true, _) => Level::WARN,
            (false, 0) => Level::INFO,
            (false, 1) => Level::DEBUG,
            (false, _) => Level::TRACE,
        }
    }
}
