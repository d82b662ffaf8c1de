//! Bounded prepared-statement cache.
//!
//! Entries are keyed by `(sql, param_count)` and named by a hash of that pair,
//! so the same statement always maps to the same name. Capacity overflow evicts
//! the least recently used entry. Expiry is absolute: an entry dies `ttl` after
//! it was created, however often it has been used since.
//!
//! The driver keeps parsed statements per connection, keyed by SQL text. Each
//! cache entry therefore carries a generation that is folded into the text
//! sent to the server ([`PreparedStatement::server_sql`]): once an entry is
//! evicted, expired or removed, its successor is a different text and every
//! connection prepares it afresh.

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use lru::LruCache;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::CacheSettings;

#[derive(Debug, Clone)]
pub struct PreparedStatement {
    pub name: String,
    pub sql: String,
    pub param_count: usize,
    /// Bumped every time the entry is (re)created.
    pub generation: u64,
    pub created_at: Instant,
    pub last_used: Instant,
    pub use_count: u64,
}

impl PreparedStatement {
    /// Statement text as prepared on the server, tagged with name and generation.
    pub fn server_sql(&self) -> String {
        format!("/* {}:{} */ {}", self.name, self.generation, self.sql)
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct CacheStats {
    pub size: usize,
    pub max_size: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub hit_rate: f64,
}

type CacheKey = (String, usize);

struct Inner {
    entries: LruCache<CacheKey, PreparedStatement>,
    hits: u64,
    misses: u64,
    evictions: u64,
    expirations: u64,
    next_generation: u64,
}

pub struct PreparedStatementCache {
    inner: Mutex<Inner>,
    max_entries: usize,
    ttl: Duration,
}

/// Deterministic statement name for `(sql, param_count)`.
pub fn generate_name(sql: &str, param_count: usize) -> String {
    let mut hasher = Sha256::new();
    hasher.update(sql.as_bytes());
    hasher.update([0u8]);
    hasher.update(param_count.to_le_bytes());
    let digest = hasher.finalize();
    format!("stmt_{}", hex::encode(&digest[..12]))
}

impl PreparedStatementCache {
    pub fn new(settings: &CacheSettings) -> Self {
        let max_entries = settings.max_entries.max(1);
        Self {
            inner: Mutex::new(Inner {
                entries: LruCache::new(NonZeroUsize::new(max_entries).unwrap_or(NonZeroUsize::MIN)),
                hits: 0,
                misses: 0,
                evictions: 0,
                expirations: 0,
                next_generation: 1,
            }),
            max_entries,
            ttl: settings.ttl,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn is_expired(&self, entry: &PreparedStatement, now: Instant) -> bool {
        now.duration_since(entry.created_at) > self.ttl
    }

    /// Return the live entry for `(sql, param_count)`, bumping its usage, or
    /// insert a fresh one (evicting the LRU entry when full).
    pub fn get_or_create(&self, sql: &str, param_count: usize) -> PreparedStatement {
        let now = Instant::now();
        let key = (sql.to_string(), param_count);
        let mut inner = self.lock();

        let expired = match inner.entries.peek(&key) {
            Some(entry) => self.is_expired(entry, now),
            None => false,
        };
        if expired {
            inner.entries.pop(&key);
            inner.expirations += 1;
        }

        if let Some(entry) = inner.entries.get_mut(&key) {
            entry.use_count += 1;
            entry.last_used = now;
            let hit = entry.clone();
            inner.hits += 1;
            return hit;
        }

        inner.misses += 1;
        if inner.entries.len() >= self.max_entries {
            if let Some((_, evicted)) = inner.entries.pop_lru() {
                inner.evictions += 1;
                tracing::debug!(name = %evicted.name, uses = evicted.use_count, "prepared cache: evicted LRU entry");
            }
        }

        let generation = inner.next_generation;
        inner.next_generation += 1;
        let entry = PreparedStatement {
            name: generate_name(sql, param_count),
            sql: sql.to_string(),
            param_count,
            generation,
            created_at: now,
            last_used: now,
            use_count: 1,
        };
        inner.entries.put(key, entry.clone());
        entry
    }

    pub fn has(&self, sql: &str, param_count: usize) -> bool {
        let inner = self.lock();
        inner
            .entries
            .peek(&(sql.to_string(), param_count))
            .is_some_and(|e| !self.is_expired(e, Instant::now()))
    }

    pub fn remove(&self, sql: &str, param_count: usize) -> bool {
        self.lock().entries.pop(&(sql.to_string(), param_count)).is_some()
    }

    pub fn clear(&self) {
        self.lock().entries.clear();
    }

    pub fn max_entries(&self) -> usize {
        self.max_entries
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every entry older than the TTL. Returns how many were removed.
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let mut inner = self.lock();
        let expired: Vec<CacheKey> = inner
            .entries
            .iter()
            .filter(|(_, e)| self.is_expired(e, now))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            inner.entries.pop(key);
        }
        inner.expirations += expired.len() as u64;
        expired.len()
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.lock();
        let lookups = inner.hits + inner.misses;
        CacheStats {
            size: inner.entries.len(),
            max_size: self.max_entries,
            hits: inner.hits,
            misses: inner.misses,
            evictions: inner.evictions,
            expirations: inner.expirations,
            hit_rate: if lookups == 0 { 0.0 } else { inner.hits as f64 / lookups as f64 },
        }
    }

    /// Periodic expiry sweep at half the TTL, stopped by `cancel`.
    pub fn spawn_sweeper(self: &Arc<Self>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let cache = Arc::clone(self);
        let period = (cache.ttl / 2).max(Duration::from_millis(10));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        let removed = cache.sweep_expired();
                        if removed > 0 {
                            tracing::debug!(removed, "prepared cache: expired entries swept");
                        }
                    }
                }
            }
        })
    }
}
