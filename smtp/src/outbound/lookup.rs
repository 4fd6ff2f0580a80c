/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! Component A — DNS facade. Two resolvers coexist (spec.md §4.A): the plain
//! one (`mail_auth::Resolver`) for MX/A/AAAA/TXT/PTR, and the DNSSEC-aware
//! one (`crate::core::DnssecResolver`) that exposes the Authenticated Data
//! (AD) bit for TLSA lookups (see `outbound::dane::dnssec`) and for the
//! DNSSEC axis of the policy stack. Every method checks the relevant
//! `common::Server` cache first, mirroring `dane::dnssec::tlsa_lookup`.

use std::{
    collections::BTreeMap,
    net::{IpAddr, Ipv4Addr, Ipv6Addr},
    sync::Arc,
};

use mail_auth::{
    hickory_resolver::{error::ResolveErrorKind, proto::error::ProtoErrorKind, Name},
    Txt, MX,
};

use crate::core::SMTP;

/// MX record set for a domain, with the synthetic fallback and null-MX
/// handling of spec.md §3 applied by the caller (`delivery::resolve_mx`),
/// not here — this facade only returns what DNS actually said.
pub async fn mx_lookup(smtp: &SMTP, domain: &str) -> mail_auth::Result<Arc<Vec<MX>>> {
    let domain = utils::idna::to_ascii(domain)
        .map(std::borrow::Cow::Owned)
        .unwrap_or(std::borrow::Cow::Borrowed(domain));

    if let Some(value) = smtp.server.inner.cache.dns_mx.get(domain.as_ref()) {
        trc::event!(Dns(trc::DnsEvent::CacheHit), Domain = domain.to_string());
        return Ok(value);
    }

    match smtp.resolvers.dns.mx_lookup(domain.as_ref()).await {
        Ok(value) => {
            trc::event!(Dns(trc::DnsEvent::Lookup), Domain = domain.to_string());
            smtp.server.inner.cache.dns_mx.insert(domain.into_owned(), value.clone(), std::time::Duration::from_secs(3600));
            Ok(value)
        }
        Err(err) => {
            trc::event!(Dns(trc::DnsEvent::LookupError), Domain = domain.to_string());
            Err(err)
        }
    }
}

pub async fn txt_lookup(smtp: &SMTP, name: &str) -> mail_auth::Result<Txt> {
    if let Some(value) = smtp.server.inner.cache.dns_txt.get(name) {
        return Ok(value);
    }
    let value = smtp.resolvers.dns.txt_lookup(name).await?;
    smtp.server
        .inner
        .cache
        .dns_txt
        .insert(name.to_string(), value.clone(), std::time::Duration::from_secs(3600));
    Ok(value)
}

pub async fn ipv4_lookup(smtp: &SMTP, host: &str) -> mail_auth::Result<Arc<Vec<Ipv4Addr>>> {
    if let Some(value) = smtp.server.inner.cache.dns_ipv4.get(host) {
        return Ok(value);
    }
    let value = smtp.resolvers.dns.ipv4_lookup(host).await?;
    smtp.server
        .inner
        .cache
        .dns_ipv4
        .insert(host.to_string(), value.clone(), std::time::Duration::from_secs(3600));
    Ok(value)
}

pub async fn ipv6_lookup(smtp: &SMTP, host: &str) -> mail_auth::Result<Arc<Vec<Ipv6Addr>>> {
    if let Some(value) = smtp.server.inner.cache.dns_ipv6.get(host) {
        return Ok(value);
    }
    let value = smtp.resolvers.dns.ipv6_lookup(host).await?;
    smtp.server
        .inner
        .cache
        .dns_ipv6
        .insert(host.to_string(), value.clone(), std::time::Duration::from_secs(3600));
    Ok(value)
}

pub async fn ptr_lookup(smtp: &SMTP, ip: IpAddr) -> mail_auth::Result<Arc<Vec<String>>> {
    if let Some(value) = smtp.server.inner.cache.dns_ptr.get(&ip) {
        return Ok(value);
    }
    let value = smtp.resolvers.dns.ptr_lookup(ip).await?;
    smtp.server
        .inner
        .cache
        .dns_ptr
        .insert(ip, value.clone(), std::time::Duration::from_secs(3600));
    Ok(value)
}

/// Combined IPv4+IPv6 address set together with the AD bit, used by the DANE
/// policy's connection-level checks (spec.md §4.A `AuthLookupIPAddr`):
/// "the AD bit is the logical AND of the two underlying queries, and if only
/// one family resolves the other is tolerated as long as its failure mode is
/// 'no address'; if the primary (IPv4) query errors, the AD bit is forced
/// false even when the secondary answer is authenticated."
pub struct AuthIpLookup {
    pub ips: Vec<IpAddr>,
    pub authenticated: bool,
}

pub async fn auth_ip_lookup(smtp: &SMTP, host: &str) -> mail_auth::Result<AuthIpLookup> {
    let name = mail_auth::hickory_resolver::Name::from_str_relaxed(host)
        .map_err(|_| mail_auth::Error::InvalidRecordType)?;

    let v4 = smtp.resolvers.dnssec.resolver.ipv4_lookup(name.clone()).await;
    let v6 = smtp.resolvers.dnssec.resolver.ipv6_lookup(name).await;

    // Primary query errors force the AD bit false outright; a secondary
    // query's failure is tolerated (treated as "no address") without
    // affecting authenticity.
    if v4.is_err() && v6.is_err() {
        return Err(mail_auth::Error::DnsRecordNotFound(
            mail_auth::hickory_resolver::proto::rr::RecordType::A,
        ));
    }

    let (v4_ips, v4_ad) = v4.as_ref().map_or((Vec::new(), false), |lookup| {
        (
            lookup.iter().map(|a| IpAddr::V4(a.0)).collect(),
            lookup.as_lookup().is_authenticated(),
        )
    });
    let (v6_ips, v6_ad) = v6.as_ref().map_or((Vec::new(), true), |lookup| {
        (
            lookup.iter().map(|a| IpAddr::V6(a.0)).collect(),
            lookup.as_lookup().is_authenticated(),
        )
    });

    let mut ips = v4_ips;
    ips.extend(v6_ips);

    Ok(AuthIpLookup {
        ips,
        authenticated: v4.is_ok() && v4_ad && v6_ad,
    })
}

/// `AuthLookupMX` for the DNSSEC policy (component G): the plain `mx_lookup`
/// above never surfaces the AD bit, so the DNSSEC axis resolves its own
/// query through the DNSSEC-aware resolver. Unlike TLSA (component F), an
/// unauthenticated answer is not "equivalent to empty" here — MX records are
/// mandatory for delivery to proceed, so an unsigned RRset falls back to the
/// plain resolver's result with `authenticated=false` rather than `None`.
pub async fn auth_mx_lookup(smtp: &SMTP, domain: &str) -> mail_auth::Result<(Arc<Vec<MX>>, bool)> {
    let domain = utils::idna::to_ascii(domain)
        .map(std::borrow::Cow::Owned)
        .unwrap_or(std::borrow::Cow::Borrowed(domain));
    let name = Name::from_str_relaxed(domain.as_ref()).map_err(|_| mail_auth::Error::InvalidRecordType)?;

    match smtp.resolvers.dnssec.resolver.mx_lookup(name).await {
        Ok(lookup) => {
            let authenticated = lookup.as_lookup().is_authenticated();
            let records = group_by_preference(
                lookup
                    .iter()
                    .map(|mx| (mx.preference(), mx.exchange().to_string())),
            );
            Ok((Arc::new(records), authenticated))
        }
        Err(err) => match &err.kind() {
            ResolveErrorKind::Proto(proto_err) if matches!(proto_err.kind(), ProtoErrorKind::RrsigsNotPresent { .. }) => {
                Ok((mx_lookup(smtp, domain.as_ref()).await?, false))
            }
            _ => Err(err.into()),
        },
    }
}

/// Groups `(preference, hostname)` pairs into `mail_auth::MX` records, one
/// per distinct preference value, hostnames ordered as DNS returned them
/// within each tier.
fn group_by_preference(records: impl Iterator<Item = (u16, String)>) -> Vec<MX> {
    let mut by_preference: BTreeMap<u16, Vec<String>> = BTreeMap::new();
    for (preference, exchange) in records {
        by_preference.entry(preference).or_default().push(exchange);
    }
    by_preference
        .into_iter()
        .map(|(preference, exchanges)| MX { exchanges, preference })
        .collect()
}
