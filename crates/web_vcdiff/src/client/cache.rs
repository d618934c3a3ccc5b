// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

use bytes::Bytes;
use tokio::sync::OnceCell;

use crate::error::ClientError;

type Fetched = Result<Bytes, Arc<ClientError>>;

/// Dictionaries known to a client.
///
/// Fetched dictionaries are keyed by URL, and each URL is fetched at most once: concurrent
/// resolves share a single fetch, and its outcome, failures included, is kept for later ones.
/// Dictionaries received inline in multipart responses are keyed by their short digest.
#[derive(Debug, Default)]
pub struct DictionaryCache {
    fetches: Mutex<HashMap<String, Arc<OnceCell<Fetched>>>>,
    inline: Mutex<HashMap<String, Bytes>>,
}

impl DictionaryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the dictionary at `url`, calling `fetch` if no one has fetched it yet.
    pub async fn resolve<F, Fut>(&self, url: &str, fetch: F) -> Result<Bytes, ClientError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Bytes, ClientError>>,
    {
        let cell = self
            .fetches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(url.to_owned())
            .or_default()
            .clone();
        let fetched = cell
            .get_or_init(|| async { fetch().await.map_err(Arc::new) })
            .await;
        fetched
            .clone()
            .map_err(|source| ClientError::DictionaryFetch {
                url: url.to_owned(),
                source,
            })
    }

    pub fn insert_inline(&self, digest: &str, data: Bytes) {
        self.inline
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(digest.to_owned(), data);
    }

    pub fn inline(&self, digest: &str) -> Option<Bytes> {
        self.inline
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(digest)
            .cloned()
    }

    /// Digests of every inline dictionary, sorted.
    pub fn inline_digests(&self) -> Vec<String> {
        let mut digests: Vec<String> = self
            .inline
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        digests.sort();
        digests
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[tokio::test]
    async fn concurrent_resolves_share_one_fetch() {
        let cache = DictionaryCache::new();
        let fetches = AtomicUsize::new(0);
        let fetches = &fetches;
        let fetch = move || async move {
            fetches.fetch_add(1, Ordering::SeqCst);
            tokio::task::yield_now().await;
            Ok(Bytes::from_static(b"dictionary"))
        };

        let (a, b, c) = tokio::join!(
            cache.resolve("https://example.com/d/1", fetch),
            cache.resolve("https://example.com/d/1", fetch),
            cache.resolve("https://example.com/d/1", fetch),
        );
        for result in [a, b, c] {
            assert_eq!(result.unwrap(), "dictionary");
        }
        assert_eq!(fetches.load(Ordering::SeqCst), 1);

        cache
            .resolve("https://example.com/d/2", fetch)
            .await
            .unwrap();
        assert_eq!(fetches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn failed_fetch_is_replayed() {
        let cache = DictionaryCache::new();
        let fetches = AtomicUsize::new(0);
        let fetches = &fetches;
        let fetch = move || async move {
            fetches.fetch_add(1, Ordering::SeqCst);
            Err(ClientError::protocol("nope"))
        };

        for _ in 0..3 {
            let err = cache.resolve("https://example.com/d/x", fetch).await.unwrap_err();
            let ClientError::DictionaryFetch { url, source } = err else {
                panic!("expected a dictionary fetch error");
            };
            assert_eq!(url, "https://example.com/d/x");
            assert!(matches!(*source, ClientError::Protocol { .. }));
        }
        assert_eq!(fetches.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn inline_dictionaries() {
        let cache = DictionaryCache::new();
        assert!(cache.inline_digests().is_empty());
        cache.insert_inline("ffff", Bytes::from_static(b"second"));
        cache.insert_inline("0000", Bytes::from_static(b"first"));
        assert_eq!(cache.inline_digests(), vec!["0000", "ffff"]);
        assert_eq!(cache.inline("0000").unwrap(), "first");
        assert!(cache.inline("1234").is_none());
    }
}
