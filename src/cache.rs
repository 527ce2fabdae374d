//! Address to key cache
//!
//! Remembers the full public key behind each address seen in authenticated
//! traffic. Entries carry their own deadline; expiry is checked against
//! that deadline under the map lock, so replacing an entry can never be
//! undone by the expiry of the entry it replaced.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use crate::address::Address;
use crate::mesh::PublicKey;

/// Default time a learned key stays valid
pub const DEFAULT_KEY_TTL: Duration = Duration::from_secs(60);

struct CacheEntry {
    key: PublicKey,
    deadline: Instant,
}

/// One live cache entry, for status reporting
#[derive(Debug, Clone, Serialize)]
pub struct CacheSnapshot {
    pub address: Address,
    pub key: String,
    pub expires_in_ms: u64,
}

/// Expiring address → key map shared by the bridge loops
pub struct KeyCache {
    entries: Mutex<HashMap<Address, CacheEntry>>,
    ttl: Duration,
    max_entries: usize,
}

impl KeyCache {
    /// Create a cache; `max_entries` of 0 means unbounded
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
            max_entries,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Store `key` for `address`, replacing any previous entry and its deadline.
    ///
    /// A full cache refuses new addresses until the sweeper frees room;
    /// addresses already present are still updated. Returns whether the
    /// key was stored.
    pub fn put(&self, address: Address, key: PublicKey) -> bool {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());

        if self.max_entries > 0 && entries.len() >= self.max_entries && !entries.contains_key(&address) {
            tracing::trace!("Key cache full, not caching {}", address);
            return false;
        }

        entries.insert(address, CacheEntry { key, deadline: now + self.ttl });
        true
    }

    /// Look up the key for `address`. A hit extends the entry's lifetime.
    pub fn get(&self, address: &Address) -> Option<PublicKey> {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());

        match entries.get_mut(address) {
            Some(entry) if entry.deadline > now => {
                entry.deadline = now + self.ttl;
                Some(entry.key)
            }
            Some(_) => {
                entries.remove(address);
                None
            }
            None => None,
        }
    }

    /// Whether `candidate` could own `address`
    pub fn check_key(&self, address: &Address, candidate: &PublicKey) -> bool {
        address.matches_key(candidate)
    }

    /// Remove every entry past its deadline, returning how many went
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let before = entries.len();
        entries.retain(|_, entry| entry.deadline > now);
        before - entries.len()
    }

    /// Purge expired entries every `interval`, forever
    pub async fn run_sweeper(&self, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let purged = self.purge_expired();
            if purged > 0 {
                tracing::debug!("Expired {} cached keys", purged);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Live entries sorted by address
    pub fn snapshot(&self) -> Vec<CacheSnapshot> {
        let now = Instant::now();
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let mut out: Vec<CacheSnapshot> = entries
            .iter()
            .filter(|(_, entry)| entry.deadline > now)
            .map(|(address, entry)| CacheSnapshot {
                address: *address,
                key: entry.key.to_hex(),
                expires_in_ms: (entry.deadline - now).as_millis() as u64,
            })
            .collect();
        out.sort_by_key(|s| s.address);
        out
    }
}

impl Default for KeyCache {
    fn default() -> Self {
        Self::new(DEFAULT_KEY_TTL, 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::Identity;

    fn peer(seed: u8) -> (Address, PublicKey) {
        let key = Identity::from_seed(&[seed; 32]).public_key();
        (Address::for_key(&key), key)
    }

    #[tokio::test(start_paused = true)]
    async fn test_hit_until_ttl() {
        let cache = KeyCache::new(Duration::from_secs(60), 0);
        let (addr, key) = peer(1);
        cache.put(addr, key);

        tokio::time::advance(Duration::from_secs(59)).await;
        assert_eq!(cache.get(&addr), Some(key));
    }

    #[tokio::test(start_paused = true)]
    async fn test_miss_after_ttl() {
        let cache = KeyCache::new(Duration::from_secs(60), 0);
        let (addr, key) = peer(1);
        cache.put(addr, key);

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(cache.get(&addr), None);
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_hit_refreshes_deadline() {
        let cache = KeyCache::new(Duration::from_secs(60), 0);
        let (addr, key) = peer(1);
        cache.put(addr, key);

        tokio::time::advance(Duration::from_secs(40)).await;
        assert_eq!(cache.get(&addr), Some(key));
        tokio::time::advance(Duration::from_secs(40)).await;
        assert_eq!(cache.get(&addr), Some(key));
    }

    #[tokio::test(start_paused = true)]
    async fn test_overwrite_is_not_undone_by_old_deadline() {
        let cache = KeyCache::new(Duration::from_secs(60), 0);
        let (addr, first) = peer(1);
        let mut second_bytes = *first.as_bytes();
        second_bytes[31] ^= 0x01;
        let second = PublicKey::from_bytes(second_bytes);

        cache.put(addr, first);
        tokio::time::advance(Duration::from_secs(30)).await;
        cache.put(addr, second);

        // Past the first entry's deadline, within the second's
        tokio::time::advance(Duration::from_secs(40)).await;
        assert_eq!(cache.purge_expired(), 0);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(&addr), Some(second));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_purges_expired() {
        let cache = std::sync::Arc::new(KeyCache::new(Duration::from_secs(10), 0));
        let (a, ka) = peer(1);
        let (b, kb) = peer(2);
        cache.put(a, ka);

        let sweeper = {
            let cache = std::sync::Arc::clone(&cache);
            tokio::spawn(async move { cache.run_sweeper(Duration::from_secs(1)).await })
        };

        tokio::time::advance(Duration::from_secs(5)).await;
        cache.put(b, kb);
        tokio::time::sleep(Duration::from_secs(7)).await;

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.snapshot()[0].address, b);
        sweeper.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_cache_refuses_new_addresses_until_swept() {
        let cache = KeyCache::new(Duration::from_secs(60), 2);
        let (a, ka) = peer(1);
        let (b, kb) = peer(2);
        let (c, kc) = peer(3);

        assert!(cache.put(a, ka));
        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(cache.put(b, kb));
        assert!(!cache.put(c, kc));
        assert!(cache.put(a, ka));

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get(&c), None);
        assert_eq!(cache.get(&b), Some(kb));

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(cache.purge_expired(), 2);
        assert!(cache.put(c, kc));
        assert_eq!(cache.get(&c), Some(kc));
    }

    #[test]
    fn test_check_key() {
        let cache = KeyCache::default();
        let (addr, key) = peer(1);
        let (_, other) = peer(2);
        assert!(cache.check_key(&addr, &key));
        assert!(!cache.check_key(&addr, &other));
    }
}
