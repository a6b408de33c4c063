//! TLS context and session-cache stand-in.
//!
//! The actual TLS transform is an external collaborator this crate never
//! implements; what the supervisor needs from it is narrow: an opaque
//! handle it can hold a reference to, and the ability to force every
//! cached session to expire when a service is retired on unbind (SPEC_FULL
//! §4.3's "flush the TLS context session cache with an expiry just past
//! the session timeout").

use std::borrow::Borrow;
use std::hash::Hash;
use std::time::{Duration, Instant};

use indexmap::map::IndexMap;

/// An opaque TLS configuration handle. The supervisor only ever flushes
/// its session cache and drops it; the handshake/record-layer logic lives
/// entirely outside this crate.
pub trait TlsContext: Send + Sync {
    /// Replaces every session's expiry with `now + ttl`, so a context that
    /// is about to be dropped still lets in-flight sessions finish instead
    /// of being torn down underneath them, while guaranteeing eventual
    /// cleanup (SPEC_FULL §3 "Destroyed").
    fn flush_sessions(&self, ttl: Duration);

    fn session_count(&self) -> usize;
}

struct Slot<V> {
    value: V,
    expires_at: Instant,
}

/// A small time-sensitive cache keyed by session id, capped at a fixed
/// capacity with oldest-entry eviction once full.
pub struct SessionCache<K: Eq + Hash, V> {
    entries: IndexMap<K, Slot<V>>,
    capacity: usize,
}

impl<K: Eq + Hash, V> SessionCache<K, V> {
    pub fn new(capacity: usize) -> Self {
        SessionCache {
            entries: IndexMap::new(),
            capacity,
        }
    }

    pub fn insert(&mut self, key: K, value: V, ttl: Duration) {
        self.entries.insert(
            key,
            Slot {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
        while self.entries.len() > self.capacity {
            self.entries.shift_remove_index(0);
        }
    }

    pub fn get<Q>(&self, key: &Q) -> Option<&V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.entries.get(key).and_then(|slot| {
            if slot.expires_at > Instant::now() {
                Some(&slot.value)
            } else {
                None
            }
        })
    }

    pub fn remove<Q>(&mut self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.entries.shift_remove(key).map(|slot| slot.value)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Forces every live entry's expiry to `now + ttl`, regardless of its
    /// current one.
    pub fn flush_with_expiry(&mut self, ttl: Duration) {
        let new_expiry = Instant::now() + ttl;
        for slot in self.entries.values_mut() {
            slot.expires_at = new_expiry;
        }
    }
}

/// Minimal stand-in implementation used where a service config does not
/// reference TLS at all (a plain TCP relay) or in tests. A real TLS library
/// binding would implement [`TlsContext`] against its own session-cache
/// type instead of this one.
pub struct NullTlsContext {
    cache: std::sync::Mutex<SessionCache<u64, ()>>,
}

impl NullTlsContext {
    pub fn new(capacity: usize) -> Self {
        NullTlsContext {
            cache: std::sync::Mutex::new(SessionCache::new(capacity)),
        }
    }
}

impl TlsContext for NullTlsContext {
    fn flush_sessions(&self, ttl: Duration) {
        self.cache.lock().unwrap().flush_with_expiry(ttl);
    }

    fn session_count(&self) -> usize {
        self.cache.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expired_entries_are_not_returned() {
        let mut cache: SessionCache<&str, i32> = SessionCache::new(4);
        cache.insert("a", 1, Duration::from_millis(0));
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(cache.get("a"), None);
    }

    #[test]
    fn capacity_evicts_oldest() {
        let mut cache: SessionCache<i32, &str> = SessionCache::new(2);
        cache.insert(1, "a", Duration::from_secs(30));
        cache.insert(2, "b", Duration::from_secs(30));
        cache.insert(3, "c", Duration::from_secs(30));
        assert_eq!(cache.get(&1), None);
        assert_eq!(cache.get(&2), Some(&"b"));
        assert_eq!(cache.get(&3), Some(&"c"));
    }

    #[test]
    fn remove_drops_an_entry_before_its_expiry() {
        let mut cache: SessionCache<&str, i32> = SessionCache::new(4);
        cache.insert("a", 1, Duration::from_secs(30));
        assert_eq!(cache.remove("a"), Some(1));
        assert_eq!(cache.get("a"), None);
    }

    #[test]
    fn flush_extends_expiry_of_live_entries() {
        let ctx = NullTlsContext::new(4);
        ctx.cache
            .lock()
            .unwrap()
            .insert(1, (), Duration::from_secs(30));
        ctx.flush_sessions(Duration::from_millis(1));
        assert_eq!(ctx.session_count(), 1);
    }
}
