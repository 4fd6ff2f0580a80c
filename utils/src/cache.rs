/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use std::hash::Hash;
use std::time::{Duration, Instant};

use quick_cache::{sync::Cache as QuickCache, Weighter};

/// Implemented by every value stored in a weight-bounded cache so eviction
/// can be driven by approximate memory use rather than item count alone.
pub trait CacheItemWeight {
    fn weight(&self) -> u64;
}

impl<T> CacheItemWeight for std::sync::Arc<T>
where
    T: CacheItemWeight,
{
    fn weight(&self) -> u64 {
        self.as_ref().weight()
    }
}

/// DNS answer types cached directly by `common::Caches` (component A):
/// MX/A/AAAA/PTR record sets and the parsed `TXT` answer. `CacheItemWeight`
/// is local to this crate, so these foreign `mail_auth`/`std::net` types can
/// implement it here even though neither crate that names them owns it.
impl CacheItemWeight for mail_auth::MX {
    fn weight(&self) -> u64 {
        (std::mem::size_of::<mail_auth::MX>() + self.exchanges.iter().map(String::len).sum::<usize>()) as u64
    }
}

impl CacheItemWeight for mail_auth::Txt {
    fn weight(&self) -> u64 {
        std::mem::size_of::<mail_auth::Txt>() as u64
    }
}

impl<T: CacheItemWeight> CacheItemWeight for Vec<T> {
    fn weight(&self) -> u64 {
        (std::mem::size_of::<Vec<T>>() as u64) + self.iter().map(CacheItemWeight::weight).sum::<u64>()
    }
}

impl CacheItemWeight for std::net::Ipv4Addr {
    fn weight(&self) -> u64 {
        std::mem::size_of::<std::net::Ipv4Addr>() as u64
    }
}

impl CacheItemWeight for std::net::Ipv6Addr {
    fn weight(&self) -> u64 {
        std::mem::size_of::<std::net::Ipv6Addr>() as u64
    }
}

impl CacheItemWeight for String {
    fn weight(&self) -> u64 {
        self.len() as u64
    }
}

#[derive(Clone, Copy, Default)]
struct ItemWeighter;

impl<K, V> Weighter<K, (V, Instant)> for ItemWeighter
where
    V: CacheItemWeight,
{
    fn weight(&self, _key: &K, val: &(V, Instant)) -> u64 {
        val.0.weight().max(1)
    }
}

#[derive(Clone, Copy, Default)]
struct PlainWeighter;

impl<K, V> Weighter<K, V> for PlainWeighter
where
    V: CacheItemWeight,
{
    fn weight(&self, _key: &K, val: &V) -> u64 {
        val.weight().max(1)
    }
}

/// Weight-bounded cache without expiry, for values that are valid for the
/// lifetime of the process (e.g. access tokens revalidated on write).
pub struct Cache<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + CacheItemWeight + Send + Sync + 'static,
{
    inner: QuickCache<K, V, PlainWeighter>,
}

impl<K, V> Cache<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + CacheItemWeight + Send + Sync + 'static,
{
    pub fn new(capacity_items: usize, capacity_weight: u64) -> Self {
        Cache {
            inner: QuickCache::with_weighter(
                capacity_items,
                capacity_weight,
                PlainWeighter,
            ),
        }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.inner.get(key)
    }

    pub fn insert(&self, key: K, value: V) {
        self.inner.insert(key, value);
    }

    pub fn remove(&self, key: &K) {
        self.inner.remove(key);
    }
}

impl<K, V> Default for Cache<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + CacheItemWeight + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new(1024, 10 * 1024 * 1024)
    }
}

/// Weight-bounded cache with a per-entry expiry instant. This backs every
/// DNS/MTA-STS lookup cache in the outbound engine: a stale entry is
/// treated as absent on `get`, but the slot is only reclaimed on eviction
/// or overwrite (no background sweeper is required for correctness).
pub struct CacheWithTtl<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + CacheItemWeight + Send + Sync + 'static,
{
    inner: QuickCache<K, (V, Instant), ItemWeighter>,
}

impl<K, V> CacheWithTtl<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + CacheItemWeight + Send + Sync + 'static,
{
    pub fn new(capacity_items: usize, capacity_weight: u64) -> Self {
        CacheWithTtl {
            inner: QuickCache::with_weighter(capacity_items, capacity_weight, ItemWeighter),
        }
    }

    /// Returns the cached value if present and not past its expiry instant.
    pub fn get(&self, key: &K) -> Option<V> {
        let (value, valid_until) = self.inner.get(key)?;
        if valid_until > Instant::now() {
            Some(value)
        } else {
            None
        }
    }

    pub fn insert_with_expiry(&self, key: K, value: V, valid_until: Instant) -> V {
        self.inner.insert(key, (value.clone(), valid_until));
        value
    }

    pub fn insert(&self, key: K, value: V, ttl: Duration) -> V {
        self.insert_with_expiry(key, value, Instant::now() + ttl)
    }

    pub fn remove(&self, key: &K) {
        self.inner.remove(key);
    }
}

impl<K, V> Default for CacheWithTtl<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + CacheItemWeight + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new(1024, 10 * 1024 * 1024)
    }
}
