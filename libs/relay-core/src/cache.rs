//! Response-caching session variant.
//!
//! Demonstrates the session hook and factory seams: relay sessions
//! record everything the target sends, and once a recording exists,
//! later connections are answered from it without dialing the target.
//! The recording is keyed by a single fixed key, so it suits targets
//! whose response does not depend on the request.

use std::collections::HashMap;
use std::mem;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::debug;

use crate::factory::SessionFactory;
use crate::session::{Session, SessionContext, SessionHandle, SessionHooks, SessionId};
use crate::stream::BoxedStream;

/// Recordings older than this are evicted on lookup.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(60);

/// The single key all sessions share.
pub const CACHE_KEY: &str = "default";

struct CacheEntry {
    chunks: Vec<Bytes>,
    stored_at: Instant,
}

/// TTL-bounded store of recorded target responses.
pub struct CacheStore {
    entries: Mutex<HashMap<String, CacheEntry>>,
    ttl: Duration,
}

impl CacheStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    /// Fetch a recording, evicting it first if it has expired.
    pub fn lookup(&self, key: &str) -> Option<Vec<Bytes>> {
        let mut entries = self.entries.lock().unwrap();
        match entries.get(key) {
            Some(entry) if entry.stored_at.elapsed() < self.ttl => Some(entry.chunks.clone()),
            Some(_) => {
                entries.remove(key);
                debug!(key, "cache entry expired");
                None
            }
            None => None,
        }
    }

    pub fn insert(&self, key: &str, chunks: Vec<Bytes>) {
        debug!(key, chunks = chunks.len(), "cache entry stored");
        self.entries.lock().unwrap().insert(
            key.to_owned(),
            CacheEntry {
                chunks,
                stored_at: Instant::now(),
            },
        );
    }
}

impl Default for CacheStore {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_TTL)
    }
}

/// Hooks that record the target's response chunks and store them when
/// the target closes its side.
struct CachingHooks {
    store: Arc<CacheStore>,
    chunks: Vec<Bytes>,
}

impl SessionHooks for CachingHooks {
    fn on_outbound_data(&mut self, data: &Bytes) {
        self.chunks.push(data.clone());
    }

    fn on_outbound_closed(&mut self) {
        // Nothing recorded means the target never answered (connect
        // failure, force close); that is not worth caching.
        if !self.chunks.is_empty() {
            self.store.insert(CACHE_KEY, mem::take(&mut self.chunks));
        }
    }
}

/// Factory producing caching relay sessions on a cache miss and
/// replay sessions on a hit.
pub struct CachedSessionFactory {
    store: Arc<CacheStore>,
}

impl CachedSessionFactory {
    pub fn new(store: Arc<CacheStore>) -> Self {
        Self { store }
    }
}

impl SessionFactory for CachedSessionFactory {
    fn create(
        &self,
        id: SessionId,
        inbound: BoxedStream,
        peer: SocketAddr,
        ctx: &SessionContext,
    ) -> SessionHandle {
        match self.store.lookup(CACHE_KEY) {
            Some(chunks) => {
                debug!(id, "cache hit, replaying recorded response");
                Session::spawn_replay(id, inbound, peer, chunks, ctx)
            }
            None => {
                let hooks = Box::new(CachingHooks {
                    store: Arc::clone(&self.store),
                    chunks: Vec::new(),
                });
                Session::spawn_relay(id, inbound, peer, hooks, ctx)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_returns_fresh_entries() {
        let store = CacheStore::new(Duration::from_secs(60));
        assert!(store.lookup(CACHE_KEY).is_none());
        store.insert(CACHE_KEY, vec![Bytes::from_static(b"resp")]);
        assert_eq!(
            store.lookup(CACHE_KEY),
            Some(vec![Bytes::from_static(b"resp")])
        );
    }

    #[test]
    fn expired_entries_are_evicted_on_lookup() {
        let store = CacheStore::new(Duration::from_millis(10));
        store.insert(CACHE_KEY, vec![Bytes::from_static(b"resp")]);
        std::thread::sleep(Duration::from_millis(30));
        assert!(store.lookup(CACHE_KEY).is_none());
        // The stale entry is gone, not just hidden.
        assert!(store.entries.lock().unwrap().is_empty());
    }

    #[test]
    fn hooks_store_recording_when_target_closes() {
        let store = Arc::new(CacheStore::default());
        let mut hooks = CachingHooks {
            store: Arc::clone(&store),
            chunks: Vec::new(),
        };
        hooks.on_outbound_data(&Bytes::from_static(b"part1-"));
        hooks.on_outbound_data(&Bytes::from_static(b"part2"));
        assert!(store.lookup(CACHE_KEY).is_none());

        hooks.on_outbound_closed();
        assert_eq!(
            store.lookup(CACHE_KEY),
            Some(vec![
                Bytes::from_static(b"part1-"),
                Bytes::from_static(b"part2"),
            ])
        );
    }

    #[test]
    fn empty_recording_is_not_stored() {
        let store = Arc::new(CacheStore::default());
        let mut hooks = CachingHooks {
            store: Arc::clone(&store),
            chunks: Vec::new(),
        };
        hooks.on_outbound_closed();
        assert!(store.lookup(CACHE_KEY).is_none());
    }
}
