//! Content-addressed output cache with insertion-order eviction.
//!
//! Entries are keyed by a SHA-256 digest over the document bytes and every
//! render option. An entry is served while its age is below the TTL. On
//! insert, expired entries are purged first; if the cache is still full the
//! single oldest entry (by insertion, not by access) is evicted.

use sha2::{Digest, Sha256};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use crate::lock::mutex_lock;
use crate::options::{OutputFormat, PageFormat, RenderRequest};

const SOURCE: &str = "cache";

/// Default number of cached outputs.
pub const DEFAULT_CAPACITY: usize = 50;

/// Default entry lifetime (30 minutes).
pub const DEFAULT_TTL: Duration = Duration::from_secs(30 * 60);

/// Fixed-length digest of a render request.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheKey([u8; 32]);

impl CacheKey {
    /// Computes the key for `request`.
    ///
    /// Identical documents with identical options always produce the same
    /// key; a change to any single option field produces a different one.
    pub fn compute(request: &RenderRequest) -> Self {
        let opts = &request.options;
        let mut hasher = Sha256::new();

        hasher.update((request.document.len() as u64).to_le_bytes());
        hasher.update(&request.document);

        hasher.update([match opts.format {
            PageFormat::A4 => 0u8,
            PageFormat::Letter => 1u8,
        }]);
        hasher.update([opts.landscape as u8]);
        for value in [
            opts.margins.top,
            opts.margins.right,
            opts.margins.bottom,
            opts.margins.left,
            opts.scale,
        ] {
            hasher.update(canonical_bits(value).to_le_bytes());
        }
        hasher.update([match opts.output {
            OutputFormat::Pdf => 0u8,
            OutputFormat::Png => 1u8,
        }]);

        Self(hasher.finalize().into())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

// -0.0 and 0.0 compare equal as options, so they must hash equal too.
fn canonical_bits(value: f32) -> u32 {
    if value == 0.0 {
        0.0f32.to_bits()
    } else {
        value.to_bits()
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CacheKey({})", &hex::encode(self.0)[..12])
    }
}

/// A cached render output. Never mutated after insertion.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub payload: Arc<Vec<u8>>,
    pub created_at: Instant,
}

#[derive(Default)]
struct CacheInner {
    entries: HashMap<CacheKey, CacheEntry>,
    order: VecDeque<CacheKey>,
}

impl CacheInner {
    fn remove(&mut self, key: &CacheKey) {
        self.entries.remove(key);
        self.order.retain(|k| k != key);
    }
}

/// Size, capacity and TTL snapshot for observability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub size: usize,
    pub capacity: usize,
    pub ttl: Duration,
}

/// Bounded, time-expiring cache of rendered output.
pub struct OutputCache {
    inner: Mutex<CacheInner>,
    capacity: usize,
    ttl: Duration,
}

impl OutputCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(CacheInner::default()),
            capacity,
            ttl,
        }
    }

    /// Returns the payload for `key` if present and younger than the TTL.
    pub fn get(&self, key: &CacheKey) -> Option<Arc<Vec<u8>>> {
        let inner = mutex_lock(&self.inner, SOURCE, "get");
        let entry = inner.entries.get(key)?;
        if entry.created_at.elapsed() < self.ttl {
            Some(Arc::clone(&entry.payload))
        } else {
            None
        }
    }

    /// Inserts a freshly rendered payload.
    ///
    /// Expired entries are purged first. If the cache is still at capacity,
    /// the oldest surviving entry is evicted before the new one is added.
    pub fn put(&self, key: CacheKey, payload: Arc<Vec<u8>>) {
        if self.capacity == 0 {
            return;
        }

        let mut inner = mutex_lock(&self.inner, SOURCE, "put");
        let now = Instant::now();

        let ttl = self.ttl;
        let expired: Vec<CacheKey> = inner
            .order
            .iter()
            .filter(|k| {
                inner
                    .entries
                    .get(*k)
                    .map_or(true, |e| now.duration_since(e.created_at) >= ttl)
            })
            .copied()
            .collect();
        for k in &expired {
            inner.remove(k);
        }

        // Two concurrent misses on the same key: the later write replaces the
        // earlier one and counts as a new insertion.
        if inner.entries.contains_key(&key) {
            inner.remove(&key);
        }

        while inner.entries.len() >= self.capacity {
            match inner.order.pop_front() {
                Some(oldest) => {
                    inner.entries.remove(&oldest);
                    debug!(key = ?oldest, "Evicted oldest cache entry");
                }
                None => break,
            }
        }

        inner.entries.insert(
            key,
            CacheEntry {
                payload,
                created_at: now,
            },
        );
        inner.order.push_back(key);

        debug!(
            key = ?key,
            expired = expired.len(),
            size = inner.entries.len(),
            "Cached render output"
        );
    }

    /// Number of entries physically held, including expired ones not yet purged.
    pub fn len(&self) -> usize {
        mutex_lock(&self.inner, SOURCE, "len").entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        mutex_lock(&self.inner, SOURCE, "contains")
            .entries
            .contains_key(key)
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            size: self.len(),
            capacity: self.capacity,
            ttl: self.ttl,
        }
    }
}

impl Default for OutputCache {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY, DEFAULT_TTL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::{Margins, RenderOptions};

    fn request(doc: &str, options: RenderOptions) -> RenderRequest {
        RenderRequest::new(doc.as_bytes().to_vec(), options)
    }

    fn payload(tag: &str) -> Arc<Vec<u8>> {
        Arc::new(tag.as_bytes().to_vec())
    }

    #[test]
    fn test_identical_requests_share_key() {
        let a = CacheKey::compute(&request("<svg/>", RenderOptions::default()));
        let b = CacheKey::compute(&request("<svg/>", RenderOptions::default()));
        assert_eq!(a, b);
        assert_eq!(a.to_string().len(), 64);
    }

    #[test]
    fn test_single_option_change_changes_key() {
        let base = RenderOptions::default();
        let variants = [
            RenderOptions {
                format: PageFormat::Letter,
                ..base
            },
            RenderOptions {
                landscape: true,
                ..base
            },
            RenderOptions {
                margins: Margins { top: 11.0, ..base.margins },
                ..base
            },
            RenderOptions {
                margins: Margins { right: 11.0, ..base.margins },
                ..base
            },
            RenderOptions {
                margins: Margins { bottom: 11.0, ..base.margins },
                ..base
            },
            RenderOptions {
                margins: Margins { left: 11.0, ..base.margins },
                ..base
            },
            RenderOptions { scale: 1.5, ..base },
            RenderOptions {
                output: OutputFormat::Png,
                ..base
            },
        ];

        let base_key = CacheKey::compute(&request("doc", base));
        let mut seen = std::collections::HashSet::new();
        for options in variants {
            let key = CacheKey::compute(&request("doc", options));
            assert_ne!(key, base_key, "options {:?} collided with base", options);
            assert!(seen.insert(key), "options {:?} collided with a sibling", options);
        }
    }

    #[test]
    fn test_document_change_changes_key() {
        let a = CacheKey::compute(&request("<svg a/>", RenderOptions::default()));
        let b = CacheKey::compute(&request("<svg b/>", RenderOptions::default()));
        assert_ne!(a, b);
    }

    #[test]
    fn test_negative_zero_margin_matches_zero() {
        let zero = RenderOptions {
            margins: Margins::uniform(0.0),
            ..Default::default()
        };
        let neg = RenderOptions {
            margins: Margins::uniform(-0.0),
            ..Default::default()
        };
        assert_eq!(
            CacheKey::compute(&request("d", zero)),
            CacheKey::compute(&request("d", neg))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_evicts_oldest_insertion_not_least_recent_access() {
        let cache = OutputCache::new(3, DEFAULT_TTL);
        let keys: Vec<CacheKey> = (0..4)
            .map(|i| CacheKey::compute(&request(&format!("doc-{}", i), RenderOptions::default())))
            .collect();

        for key in &keys[..3] {
            cache.put(*key, payload("x"));
            tokio::time::advance(Duration::from_secs(1)).await;
        }

        // Touching the oldest entry must not protect it.
        assert!(cache.get(&keys[0]).is_some());

        cache.put(keys[3], payload("x"));

        assert_eq!(cache.len(), 3);
        assert!(!cache.contains(&keys[0]));
        assert!(cache.contains(&keys[1]));
        assert!(cache.contains(&keys[2]));
        assert!(cache.contains(&keys[3]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_never_exceeds_capacity() {
        let cache = OutputCache::new(5, DEFAULT_TTL);
        for i in 0..40 {
            let key = CacheKey::compute(&request(&format!("doc-{}", i), RenderOptions::default()));
            cache.put(key, payload("x"));
            assert!(cache.len() <= 5);
        }
        assert_eq!(cache.stats().size, 5);
        assert_eq!(cache.stats().capacity, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_entry_is_not_returned() {
        let cache = OutputCache::new(10, Duration::from_secs(60));
        let key = CacheKey::compute(&request("doc", RenderOptions::default()));
        cache.put(key, payload("bytes"));

        tokio::time::advance(Duration::from_secs(59)).await;
        assert_eq!(cache.get(&key).as_deref(), Some(&b"bytes".to_vec()));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(cache.get(&key).is_none());
        // Still physically present until the next insert purges it.
        assert!(cache.contains(&key));
    }

    #[tokio::test(start_paused = true)]
    async fn test_put_purges_expired_before_evicting_live_entries() {
        let cache = OutputCache::new(2, Duration::from_secs(60));
        let old = CacheKey::compute(&request("old", RenderOptions::default()));
        let live = CacheKey::compute(&request("live", RenderOptions::default()));
        let new = CacheKey::compute(&request("new", RenderOptions::default()));

        cache.put(old, payload("old"));
        tokio::time::advance(Duration::from_secs(45)).await;
        cache.put(live, payload("live"));
        tokio::time::advance(Duration::from_secs(30)).await;

        cache.put(new, payload("new"));

        assert!(!cache.contains(&old));
        assert!(cache.contains(&live));
        assert!(cache.contains(&new));
    }

    #[test]
    fn test_zero_capacity_stores_nothing() {
        let cache = OutputCache::new(0, DEFAULT_TTL);
        let key = CacheKey::compute(&request("doc", RenderOptions::default()));
        cache.put(key, payload("x"));
        assert!(cache.is_empty());
    }
}
