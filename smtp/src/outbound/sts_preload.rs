/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! Component E — STARTTLS-Everywhere preload list (spec.md §4.E). Loaded
//! from a URL or local file at init; copy-on-update under `ArcSwap`, mirroring
//! `common::Server`'s `shared_core`/`tls_certificates` use of the same
//! pattern. The loader callback (`Loader`) handles fetch *and* signature
//! verification — SPEC_FULL §C.5: signature verification is out-of-band and
//! kept out of this module.

use std::{sync::Arc, time::Duration};

use arc_swap::ArcSwap;
use common::config::resolver::PreloadList;

pub type LoaderError = Box<dyn std::error::Error + Send + Sync>;

/// Fetches and signature-verifies the raw JSON bytes of a preload snapshot.
/// Implemented by the caller (HTTP + detached-signature check, or a local
/// file read in tests); this module only knows how to parse and compare.
pub trait Loader: Send + Sync {
    fn load(&self) -> impl std::future::Future<Output = Result<bytes::Bytes, LoaderError>> + Send;
}

pub struct StsPreload<L: Loader> {
    current: ArcSwap<Option<PreloadList>>,
    loader: L,
    retry_cooldown: Duration,
}

impl<L: Loader> StsPreload<L> {
    pub fn new(loader: L, retry_cooldown: Duration) -> Self {
        StsPreload {
            current: ArcSwap::from_pointee(None),
            loader,
            retry_cooldown,
        }
    }

    /// Looks up `domain`'s preload entry for `mx`, or `None` if the list is
    /// missing, expired, or has no matching entry. Expiry is checked on
    /// every lookup, not only on refresh (spec.md §3 "must not be used when
    /// expired").
    pub fn lookup(&self, domain: &str, mx: &str, now_unix: u64) -> Option<common::config::resolver::PreloadEntry> {
        let guard = self.current.load();
        let list = guard.as_ref().as_ref()?;
        if list.is_expired(now_unix) {
            return None;
        }
        list.policies.get(domain).filter(|entry| entry.matches_mx(mx)).cloned()
    }

    pub async fn load_initial(&self) {
        self.try_refresh().await;
    }

    async fn try_refresh(&self) -> bool {
        let bytes = match self.loader.load().await {
            Ok(bytes) => bytes,
            Err(_) => {
                trc::event!(StsPreload(trc::StsPreloadEvent::ListFetch));
                return false;
            }
        };
        let Ok(list) = serde_json::from_slice::<PreloadList>(&bytes) else {
            return false;
        };

        let now_unix = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        if list.is_expired(now_unix) {
            trc::event!(StsPreload(trc::StsPreloadEvent::ListExpired));
            return false;
        }

        let accept = {
            let guard = self.current.load();
            match guard.as_ref().as_ref() {
                Some(current) => list.is_newer_than(current),
                None => true,
            }
        };
        if accept {
            self.current.store(Arc::new(Some(list)));
            trc::event!(StsPreload(trc::StsPreloadEvent::ListUpdated));
        } else {
            trc::event!(StsPreload(trc::StsPreloadEvent::ListStale));
        }
        accept
    }

    /// spec.md §4.E: "periodic updater wakes `expiry - grace`; on failure,
    /// retries at a cooldown interval."
    pub async fn run(&self, grace: Duration) {
        loop {
            let sleep_for = {
                let guard = self.current.load();
                match guard.as_ref().as_ref() {
                    Some(list) => {
                        let now_unix = std::time::SystemTime::now()
                            .duration_since(std::time::UNIX_EPOCH)
                            .map(|d| d.as_secs())
                            .unwrap_or(0);
                        let remaining = list.expires.saturating_sub(now_unix);
                        Duration::from_secs(remaining).saturating_sub(grace)
                    }
                    None => self.retry_cooldown,
                }
            };
            tokio::time::sleep(sleep_for.max(Duration::from_secs(1))).await;
            if !self.try_refresh().await {
                tokio::time::sleep(self.retry_cooldown).await;
            }
        }
    }
}
