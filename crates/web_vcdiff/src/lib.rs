// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Diff-encoded HTTP responses.
//!
//! A server encodes responses as VCDIFF deltas against a dictionary the client already has,
//! or can fetch from [`registry::DICTIONARY_PATH`]. Clients that send
//! `Accept-Diff-Encoding: vcdiff` get encoded responses, and [`client::VcdiffTransport`]
//! turns them back into the original bytes.

pub mod client;
pub mod codec;
pub mod dictionary;
pub mod error;
pub mod headers;
pub mod integrity;
pub mod registry;
pub mod response;
pub mod server;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

pub use client::{ReqwestTransport, Transport, VcdiffTransport};
pub use dictionary::{Dictionaries, Dictionary, DictionaryId, FixedDictionary};
pub use error::ClientError;
pub use server::{respond, Handler, ResponseWriter, VcdiffHandler};
