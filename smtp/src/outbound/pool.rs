/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! Component C — connection pool. A per-destination bounded FIFO of idle
//! connections (spec.md §4.C), guarded by one coarse mutex: "traffic rate is
//! bounded by network, not pool ops" (spec.md §9). Keyed by recipient domain
//! (the Open Question in DESIGN.md resolves this), not by the MX eventually
//! chosen.

use std::{
    collections::VecDeque,
    time::{Duration, Instant},
};

use ahash::AHashMap;
use parking_lot::Mutex;

use super::client::Conn;

/// `require_tls` is part of the key so a REQUIRETLS delivery never shares a
/// bucket with a best-effort one, even for the same domain.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Key {
    pub domain: String,
    pub require_tls: bool,
}

struct Bucket {
    conns: VecDeque<Box<dyn Conn>>,
    last_use: Instant,
}

pub struct Pool {
    buckets: Mutex<AHashMap<Key, Bucket>>,
    max_keys: usize,
    max_conns_per_key: usize,
    max_conn_lifetime: Duration,
    stale_key_lifetime: Duration,
    max_requests: usize,
}

impl Pool {
    pub fn new(
        max_keys: usize,
        max_conns_per_key: usize,
        max_conn_lifetime: Duration,
        stale_key_lifetime: Duration,
        max_requests: usize,
    ) -> Self {
        Pool {
            buckets: Mutex::new(AHashMap::new()),
            max_keys,
            max_conns_per_key,
            max_conn_lifetime,
            stale_key_lifetime,
            max_requests,
        }
    }

    /// spec.md §4.C `Get`. REQUIRETLS pool poisoning rule: the caller must
    /// pass `key.require_tls = true` only when the bucket is allowed to be
    /// bypassed — this function still looks the bucket up, so the caller
    /// (`delivery::connection_for_domain`) is responsible for skipping the
    /// call entirely when `RequireTls` is set (spec.md §4.C "Safety rule").
    pub async fn get(&self, key: &Key) -> Option<Box<dyn Conn>> {
        loop {
            let mut conn = {
                let mut buckets = self.buckets.lock();
                let Some(bucket) = buckets.get_mut(key) else {
                    trc::event!(Pool(trc::PoolEvent::Miss), Domain = key.domain.clone());
                    return None;
                };

                if bucket.last_use.elapsed() > self.max_conn_lifetime {
                    buckets.remove(key);
                    trc::event!(Pool(trc::PoolEvent::Evict), Domain = key.domain.clone());
                    return None;
                }

                match bucket.conns.pop_front() {
                    Some(conn) => conn,
                    None => return None,
                }
            };

            if conn.usable(self.max_requests).await {
                trc::event!(Pool(trc::PoolEvent::Hit), Domain = key.domain.clone());
                return Some(conn);
            }
            // Not usable: drop it (closing the connection) and try the next
            // one in the bucket on the next loop iteration.
        }
    }

    /// spec.md §4.C `Return`. Never called for a `RequireTls` delivery — see
    /// the safety rule above.
    pub fn return_conn(&self, key: Key, conn: Box<dyn Conn>) {
        if conn.is_sticky() {
            return;
        }

        let mut buckets = self.buckets.lock();
        if !buckets.contains_key(&key) && buckets.len() >= self.max_keys {
            let stale = self.stale_key_lifetime;
            buckets.retain(|_, bucket| bucket.last_use.elapsed() <= stale);
        }

        let bucket = buckets.entry(key.clone()).or_insert_with(|| Bucket {
            conns: VecDeque::new(),
            last_use: Instant::now(),
        });
        bucket.last_use = Instant::now();
        if bucket.conns.len() < self.max_conns_per_key {
            bucket.conns.push_back(conn);
        }
        // else: drop `conn`, closing it.
    }

    pub fn close(&self) {
        self.buckets.lock().clear();
    }
}
