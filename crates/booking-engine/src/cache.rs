//! Per-account cache of discovered calendar endpoints.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::error::TransportError;

/// Endpoints keyed by account (case-insensitive).
///
/// Entries are checked before use; a failed check triggers a fresh discovery
/// that replaces the entry.
#[derive(Debug)]
pub struct EndpointCache<E> {
    entries: DashMap<String, E>,
}

impl<E> Default for EndpointCache<E> {
    fn default() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }
}

fn key(account: &str) -> String {
    account.trim().to_lowercase()
}

impl<E: Clone> EndpointCache<E> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, account: &str) -> Option<E> {
        self.entries.get(&key(account)).map(|e| e.value().clone())
    }

    pub fn insert(&self, account: &str, endpoint: E) {
        self.entries.insert(key(account), endpoint);
    }

    pub fn invalidate(&self, account: &str) -> Option<E> {
        self.entries.remove(&key(account)).map(|(_, e)| e)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The cached endpoint if `verify` accepts it, otherwise the result of
    /// `discover`, which then replaces the entry.
    ///
    /// Check and replacement happen under the entry's shard lock, so
    /// concurrent callers for one account discover at most once per stale
    /// entry. `verify` and `discover` must not call back into the cache.
    /// A failed discovery leaves no entry behind.
    pub fn resolve<V, D>(&self, account: &str, verify: V, discover: D) -> Result<E, TransportError>
    where
        V: FnOnce(&E) -> bool,
        D: FnOnce(&str) -> Result<E, TransportError>,
    {
        match self.entries.entry(key(account)) {
            Entry::Occupied(mut entry) => {
                if verify(entry.get()) {
                    return Ok(entry.get().clone());
                }
                tracing::debug!(account, "cached endpoint failed verification");
                match discover(account) {
                    Ok(endpoint) => {
                        tracing::debug!(account, "endpoint rediscovered");
                        entry.insert(endpoint.clone());
                        Ok(endpoint)
                    }
                    Err(err) => {
                        entry.remove();
                        Err(err)
                    }
                }
            }
            Entry::Vacant(entry) => {
                let endpoint = discover(account)?;
                tracing::debug!(account, "endpoint discovered");
                entry.insert(endpoint.clone());
                Ok(endpoint)
            }
        }
    }
}
