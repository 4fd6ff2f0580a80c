/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! Component G — policy stack (spec.md §4.G). Five policies run in a fixed
//! order — MTA-STS, STS-preload, DANE, DNSSEC, operator-local — each
//! exposing `PrepareDomain`/`PrepareConn`/`CheckMX`/`CheckConn`. The engine
//! folds every policy's verdict into a running maximum per axis
//! (`levels::merge_mx_level`/`merge_tls_level`) and treats any policy error
//! as terminal for the current MX try (spec.md §9 "policy composition by
//! stack, not inheritance").
//!
//! `PrepareDomain`/`PrepareConn` kick off async lookups (DNS, HTTPS) as soon
//! as they're known to be needed, spawning a background task whose
//! `JoinHandle` is the one-shot holder spec.md §9 describes; the matching
//! `CheckMX`/`CheckConn` call consumes it. A `PolicyStack` is built fresh per
//! delivery by `PolicyStackFactory::build` — the holder maps are per-delivery
//! state, not shared, so two concurrent deliveries to the same domain never
//! race over the same pending-lookup slot.

use std::sync::Arc;

use ahash::AHashMap;
use common::config::{
    resolver::{PolicyMode, Tlsa},
    smtp::{LocalPolicyConfig, MxLevel, TlsLevel},
};
use parking_lot::Mutex;

use crate::core::SMTP;

use super::{
    dane::{self, TlsaLookup},
    error::DeliveryError,
    levels, lookup, mta_sts, sts_preload,
};

/// What `connectPort` observed about the TLS session, handed to every
/// policy's `CheckConn` (spec.md §4.F/§4.G). The achieved level itself is
/// threaded through `PolicyStack::check_conn`'s running maximum, not carried
/// here.
#[derive(Debug, Clone, Default)]
pub struct TlsState {
    pub handshake_complete: bool,
    pub peer_certificates: Vec<Vec<u8>>,
}

/// One entry in the stack. Default methods assert nothing (`MxLevel::None`/
/// `TlsLevel::None`, i.e. no upgrade) and do no prep work, so a policy only
/// overrides the hooks relevant to it.
#[async_trait::async_trait]
pub trait Policy: Send + Sync {
    async fn prepare_domain(&self, _domain: &str) {}
    async fn prepare_conn(&self, _domain: &str, _mx: &str) {}

    async fn check_mx(&self, _domain: &str, _mx: &str, _current: MxLevel) -> Result<MxLevel, DeliveryError> {
        Ok(MxLevel::None)
    }

    async fn check_conn(
        &self,
        _domain: &str,
        _mx: &str,
        _mx_level: MxLevel,
        _current: TlsLevel,
        _tls: &TlsState,
    ) -> Result<TlsLevel, DeliveryError> {
        Ok(TlsLevel::None)
    }
}

/// The ordered engine. spec.md §4.G: "the effective level for each axis is
/// the maximum returned across policies; any policy error is terminal for
/// the current MX try."
pub struct PolicyStack {
    policies: Vec<Box<dyn Policy>>,
}

impl PolicyStack {
    pub fn new(policies: Vec<Box<dyn Policy>>) -> Self {
        PolicyStack { policies }
    }

    pub async fn prepare_domain(&self, domain: &str) {
        for policy in &self.policies {
            policy.prepare_domain(domain).await;
        }
    }

    pub async fn prepare_conn(&self, domain: &str, mx: &str) {
        for policy in &self.policies {
            policy.prepare_conn(domain, mx).await;
        }
    }

    pub async fn check_mx(&self, domain: &str, mx: &str) -> Result<MxLevel, DeliveryError> {
        let mut level = MxLevel::None;
        for policy in &self.policies {
            let asserted = policy.check_mx(domain, mx, level).await?;
            level = levels::merge_mx_level(level, asserted);
        }
        trc::event!(Policy(trc::PolicyEvent::MxLevel), Domain = domain.to_string(), Mx = mx.to_string());
        Ok(level)
    }

    pub async fn check_conn(
        &self,
        domain: &str,
        mx: &str,
        mx_level: MxLevel,
        achieved: TlsLevel,
        tls: &TlsState,
    ) -> Result<TlsLevel, DeliveryError> {
        let mut level = achieved;
        for policy in &self.policies {
            let asserted = policy.check_conn(domain, mx, mx_level, level, tls).await?;
            level = levels::merge_tls_level(level, asserted);
        }
        trc::event!(Policy(trc::PolicyEvent::TlsLevel), Domain = domain.to_string(), Mx = mx.to_string());
        Ok(level)
    }
}

/// MTA-STS policy (component D wired into the stack). `PrepareDomain` kicks
/// off `mta_sts::get_policy` once per domain; every MX candidate's
/// `CheckMX` reuses (or, if the holder was already consumed, redrives) it.
pub struct MtaStsPolicy {
    smtp: Arc<SMTP>,
    pending: Mutex<AHashMap<String, tokio::task::JoinHandle<Result<Option<Arc<mta_sts::Policy>>, mta_sts::Error>>>>,
}

impl MtaStsPolicy {
    pub fn new(smtp: Arc<SMTP>) -> Self {
        MtaStsPolicy {
            smtp,
            pending: Mutex::new(AHashMap::new()),
        }
    }

    async fn resolved(&self, domain: &str) -> Result<Option<Arc<mta_sts::Policy>>, mta_sts::Error> {
        let handle = self.pending.lock().remove(domain);
        match handle {
            Some(handle) => handle.await.unwrap_or(Ok(None)),
            None => mta_sts::get_policy(&self.smtp, domain).await,
        }
    }
}

#[async_trait::async_trait]
impl Policy for MtaStsPolicy {
    async fn prepare_domain(&self, domain: &str) {
        if !self.smtp.server.core.smtp.mtasts.enable {
            return;
        }
        let smtp = self.smtp.clone();
        let domain_owned = domain.to_string();
        let handle = tokio::spawn(async move { mta_sts::get_policy(&smtp, &domain_owned).await });
        self.pending.lock().insert(domain.to_string(), handle);
    }

    async fn check_mx(&self, domain: &str, mx: &str, _current: MxLevel) -> Result<MxLevel, DeliveryError> {
        if !self.smtp.server.core.smtp.mtasts.enable {
            return Ok(MxLevel::None);
        }
        match self.resolved(domain).await {
            Ok(Some(policy)) if policy.mode.is_enforcing() => {
                if policy.matches_mx(mx) {
                    Ok(MxLevel::Mtasts)
                } else {
                    Err(DeliveryError::mta_sts_mismatch(domain, mx))
                }
            }
            Ok(Some(_)) => Ok(MxLevel::None),
            Ok(None) => Ok(MxLevel::None),
            Err(err) => Err(DeliveryError::from_mta_sts_error(domain, &err)),
        }
    }
}

/// STARTTLS-Everywhere preload (component E). Synchronous (the snapshot is
/// already in memory under `ArcSwap`), so no `Prepare*` hook is needed.
/// `Arc<dyn PreloadLookup>` erases `StsPreload<L>`'s loader type parameter so
/// `PolicyStackFactory` doesn't have to carry it through `smtp::core::SMTP`.
pub trait PreloadLookup: Send + Sync {
    fn lookup(&self, domain: &str, mx: &str, now_unix: u64) -> Option<common::config::resolver::PreloadEntry>;
}

impl<L: sts_preload::Loader> PreloadLookup for sts_preload::StsPreload<L> {
    fn lookup(&self, domain: &str, mx: &str, now_unix: u64) -> Option<common::config::resolver::PreloadEntry> {
        sts_preload::StsPreload::lookup(self, domain, mx, now_unix)
    }
}

pub struct StsPreloadPolicy {
    preload: Arc<dyn PreloadLookup>,
    enable: bool,
}

impl StsPreloadPolicy {
    pub fn new(preload: Arc<dyn PreloadLookup>, enable: bool) -> Self {
        StsPreloadPolicy { preload, enable }
    }
}

#[async_trait::async_trait]
impl Policy for StsPreloadPolicy {
    async fn check_mx(&self, domain: &str, mx: &str, current: MxLevel) -> Result<MxLevel, DeliveryError> {
        // spec.md §4.E: "if MTA-STS already produced MX_MTASTS ... preload is
        // a no-op". MTA-STS runs first in the fixed stack order, so `current`
        // already carries its verdict by the time this policy runs.
        if !self.enable || current >= MxLevel::Mtasts {
            return Ok(MxLevel::None);
        }
        let now_unix = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        match self.preload.lookup(domain, mx, now_unix) {
            Some(entry) if entry.mode != PolicyMode::None => Ok(MxLevel::Mtasts),
            _ => Ok(MxLevel::None),
        }
    }
}

/// DANE (component F) wired into the stack. `PrepareConn` kicks off the
/// AD-requiring TLSA lookup at `_25._tcp.<mx>` for each candidate MX.
pub struct DanePolicy {
    smtp: Arc<SMTP>,
    pending: Mutex<AHashMap<String, tokio::task::JoinHandle<mail_auth::Result<Option<Arc<Tlsa>>>>>>,
}

impl DanePolicy {
    pub fn new(smtp: Arc<SMTP>) -> Self {
        DanePolicy {
            smtp,
            pending: Mutex::new(AHashMap::new()),
        }
    }

    async fn resolved(&self, mx: &str) -> Option<Arc<Tlsa>> {
        let handle = self.pending.lock().remove(mx);
        let result = match handle {
            Some(handle) => handle.await.unwrap_or(Ok(None)),
            None => self.smtp.tlsa_lookup(format!("_25._tcp.{mx}")).await,
        };
        result.ok().flatten()
    }
}

#[async_trait::async_trait]
impl Policy for DanePolicy {
    async fn prepare_conn(&self, _domain: &str, mx: &str) {
        if !self.smtp.server.core.smtp.dane.enable {
            return;
        }
        let smtp = self.smtp.clone();
        let name = format!("_25._tcp.{mx}");
        let handle = tokio::spawn(async move { smtp.tlsa_lookup(name).await });
        self.pending.lock().insert(mx.to_string(), handle);
    }

    async fn check_conn(
        &self,
        _domain: &str,
        mx: &str,
        _mx_level: MxLevel,
        current: TlsLevel,
        tls: &TlsState,
    ) -> Result<TlsLevel, DeliveryError> {
        if !self.smtp.server.core.smtp.dane.enable {
            return Ok(current);
        }
        let tlsa = self.resolved(mx).await;
        match dane::verify_dane(tlsa.as_deref(), mx, &tls.peer_certificates) {
            dane::verify::DaneOutcome::Match => Ok(TlsLevel::Authenticated),
            dane::verify::DaneOutcome::Unusable => Ok(current),
            // spec.md §4.F: "non-empty records but TLS handshake incomplete
            // → permanent failure". An empty presented chain is exactly
            // that: `attempt_mx` never completed a handshake at all.
            dane::verify::DaneOutcome::NoMatch if tls.peer_certificates.is_empty() => Err(DeliveryError::dane_tls_required(mx)),
            dane::verify::DaneOutcome::NoMatch => Err(DeliveryError::dane_no_match(mx)),
        }
    }
}

/// DNSSEC axis (component G, §4.G "the DNSSEC policy trivially returns
/// MX_DNSSEC when the MX RRset was AD-signed"). `PrepareDomain` re-resolves
/// the MX set through the DNSSEC-aware resolver once per domain purely to
/// observe its AD bit — `connectionForDomain` already resolved MX via the
/// plain facade for the candidate list itself.
pub struct DnssecPolicy {
    smtp: Arc<SMTP>,
    pending: Mutex<AHashMap<String, tokio::task::JoinHandle<mail_auth::Result<(Arc<Vec<mail_auth::MX>>, bool)>>>>,
}

impl DnssecPolicy {
    pub fn new(smtp: Arc<SMTP>) -> Self {
        DnssecPolicy {
            smtp,
            pending: Mutex::new(AHashMap::new()),
        }
    }

    async fn authenticated(&self, domain: &str) -> bool {
        if !self.smtp.server.core.smtp.dnssec.enable {
            return false;
        }
        let handle = self.pending.lock().remove(domain);
        let result = match handle {
            Some(handle) => handle.await.unwrap_or_else(|_| Err(mail_auth::Error::InvalidRecordType)),
            None => lookup::auth_mx_lookup(&self.smtp, domain).await,
        };
        result.map(|(_, authenticated)| authenticated).unwrap_or(false)
    }
}

#[async_trait::async_trait]
impl Policy for DnssecPolicy {
    async fn prepare_domain(&self, domain: &str) {
        if !self.smtp.server.core.smtp.dnssec.enable {
            return;
        }
        let smtp = self.smtp.clone();
        let domain_owned = domain.to_string();
        let handle = tokio::spawn(async move { lookup::auth_mx_lookup(&smtp, &domain_owned).await });
        self.pending.lock().insert(domain.to_string(), handle);
    }

    async fn check_mx(&self, domain: &str, _mx: &str, _current: MxLevel) -> Result<MxLevel, DeliveryError> {
        Ok(if self.authenticated(domain).await {
            MxLevel::Dnssec
        } else {
            MxLevel::None
        })
    }
}

/// Operator-local floors (component I folded into the stack as its terminal
/// member — spec.md §4.G "the local policy enforces administrator floors").
pub struct LocalPolicy {
    pub config: LocalPolicyConfig,
}

#[async_trait::async_trait]
impl Policy for LocalPolicy {
    async fn check_mx(&self, domain: &str, _mx: &str, current: MxLevel) -> Result<MxLevel, DeliveryError> {
        if current < self.config.min_mx_level {
            Err(DeliveryError::local_policy_floor(domain, TlsLevel::None, current))
        } else {
            Ok(current)
        }
    }

    async fn check_conn(
        &self,
        domain: &str,
        _mx: &str,
        mx_level: MxLevel,
        current: TlsLevel,
        _tls: &TlsState,
    ) -> Result<TlsLevel, DeliveryError> {
        if current < self.config.min_tls_level {
            Err(DeliveryError::local_policy_floor(domain, current, mx_level))
        } else {
            Ok(current)
        }
    }
}

/// Builds a fresh [`PolicyStack`] per delivery. Cheap: each policy only
/// clones the `Arc`s it needs and starts with empty holder maps. The maps
/// are per-delivery state — sharing one `PolicyStack` across concurrent
/// deliveries to the same domain would let one delivery's `PrepareDomain`
/// consume another's pending holder.
pub struct PolicyStackFactory {
    smtp: Arc<SMTP>,
    preload: Arc<dyn PreloadLookup>,
}

impl PolicyStackFactory {
    pub fn new(smtp: Arc<SMTP>, preload: Arc<dyn PreloadLookup>) -> Self {
        PolicyStackFactory { smtp, preload }
    }

    pub fn build(&self) -> PolicyStack {
        let config = self.smtp.server.core.smtp.local_policy;
        PolicyStack::new(vec![
            Box::new(MtaStsPolicy::new(self.smtp.clone())),
            Box::new(StsPreloadPolicy::new(
                self.preload.clone(),
                self.smtp.server.core.smtp.sts_preload.enable,
            )),
            Box::new(DanePolicy::new(self.smtp.clone())),
            Box::new(DnssecPolicy::new(self.smtp.clone())),
            Box::new(LocalPolicy { config }),
        ])
    }
}
