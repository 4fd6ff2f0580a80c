/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! Component J — limits governor (spec.md §4.J). A hierarchical set of
//! semaphores (global, per-source-domain, per-destination-domain); the
//! per-domain tiers are created lazily, keyed the same way
//! `common::Data::smtp_destination_throttle` keys its throttle map, but own
//! an `Arc<Semaphore>` rather than a bare one so a permit can be held across
//! the delivery's async lifetime without borrowing the map.

use std::sync::Arc;

use common::config::smtp::LimitsConfig;
use common::ThrottleKey;
use dashmap::DashMap;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use super::error::DeliveryError;

type DomainSemaphores = DashMap<ThrottleKey, Arc<Semaphore>, common::ThrottleKeyHasherBuilder>;

pub struct Limits {
    global: Arc<Semaphore>,
    per_source: DomainSemaphores,
    per_destination: DomainSemaphores,
    max_concurrent_per_source_domain: usize,
    max_concurrent_per_destination_domain: usize,
}

/// Held for the lifetime of one delivery's open connection; dropping it
/// releases all three slots (spec.md §4.J "release on delivery close").
pub struct Permits {
    _global: OwnedSemaphorePermit,
    _source: OwnedSemaphorePermit,
    _destination: OwnedSemaphorePermit,
}

impl Limits {
    pub fn new(config: LimitsConfig) -> Self {
        Limits {
            global: Arc::new(Semaphore::new(config.max_concurrent)),
            per_source: DashMap::with_hasher(common::ThrottleKeyHasherBuilder {}),
            per_destination: DashMap::with_hasher(common::ThrottleKeyHasherBuilder {}),
            max_concurrent_per_source_domain: config.max_concurrent_per_source_domain,
            max_concurrent_per_destination_domain: config.max_concurrent_per_destination_domain,
        }
    }

    fn semaphore_for(map: &DomainSemaphores, domain: &str, limit: usize) -> Arc<Semaphore> {
        map.entry(ThrottleKey::for_domain(domain))
            .or_insert_with(|| Arc::new(Semaphore::new(limit)))
            .clone()
    }

    /// spec.md §4.J "Acquire on successful connect". Cancellation is the
    /// caller's responsibility (`delivery::connection_for_domain` races this
    /// future against the delivery's cancellation token); a dropped future
    /// releases any slot it had already taken.
    pub async fn acquire(&self, source_domain: &str, destination_domain: &str) -> Result<Permits, DeliveryError> {
        let global = self
            .global
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| DeliveryError::cancelled("limits"))?;
        let source = Self::semaphore_for(&self.per_source, source_domain, self.max_concurrent_per_source_domain)
            .acquire_owned()
            .await
            .map_err(|_| DeliveryError::cancelled(source_domain))?;
        let destination = Self::semaphore_for(
            &self.per_destination,
            destination_domain,
            self.max_concurrent_per_destination_domain,
        )
        .acquire_owned()
        .await
        .map_err(|_| DeliveryError::cancelled(destination_domain))?;

        trc::event!(Limits(trc::LimitsEvent::Acquired), Domain = destination_domain.to_string());

        Ok(Permits {
            _global: global,
            _source: source,
            _destination: destination,
        })
    }
}
