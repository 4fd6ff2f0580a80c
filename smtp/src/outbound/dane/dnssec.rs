/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use std::{future::Future, sync::Arc};

use common::config::resolver::{Tlsa, TlsaEntry};
use mail_auth::{
    common::resolver::IntoFqdn,
    hickory_resolver::{
        error::ResolveErrorKind,
        proto::{
            error::ProtoErrorKind,
            rr::rdata::tlsa::{CertUsage, Matching, Selector},
        },
        Name,
    },
};

use crate::core::SMTP;

/// spec.md §4.F: "asynchronously issues an AD-requiring TLSA lookup at
/// `_25._tcp.<mx>`." The AD bit is what `hickory_resolver` signals through
/// `RrsigsNotPresent` on an otherwise-successful query; anything else is a
/// real DNS error and propagates.
pub trait TlsaLookup: Sync + Send {
    fn tlsa_lookup<'x>(
        &self,
        key: impl IntoFqdn<'x> + Sync + Send,
    ) -> impl Future<Output = mail_auth::Result<Option<Arc<Tlsa>>>> + Send;
}

impl TlsaLookup for SMTP {
    async fn tlsa_lookup<'x>(
        &self,
        key: impl IntoFqdn<'x> + Sync + Send,
    ) -> mail_auth::Result<Option<Arc<Tlsa>>> {
        let key = key.into_fqdn();
        if let Some(value) = self.server.inner.cache.dns_tlsa.get(key.as_ref()) {
            return Ok(Some(value));
        }

        if !self.server.core.smtp.dane.enable {
            return Ok(None);
        }

        let tlsa_lookup = match self
            .resolvers
            .dnssec
            .resolver
            .tlsa_lookup(Name::from_str_relaxed(key.as_ref())?)
            .await
        {
            Ok(tlsa_lookup) => tlsa_lookup,
            Err(err) => {
                return match &err.kind() {
                    ResolveErrorKind::Proto(proto_err)
                        if matches!(proto_err.kind(), ProtoErrorKind::RrsigsNotPresent { .. }) =>
                    {
                        // spec.md §4.F: unauthenticated (AD=false) is equivalent to empty.
                        trc::event!(Dane(trc::DaneEvent::UnauthenticatedTlsa), Domain = key.clone().into_owned());
                        Ok(None)
                    }
                    _ => Err(err.into()),
                };
            }
        };

        let mut entries = Vec::new();
        let mut has_end_entities = false;
        let mut has_intermediates = false;

        for record in tlsa_lookup.as_lookup().record_iter() {
            let Some(tlsa) = record.data().and_then(|r| r.as_tlsa()) else {
                continue;
            };
            // Only DANE-TA (2) and DANE-EE (3) are usable; PKIX usages (0, 1)
            // are ignored per RFC 7672.
            let is_end_entity = match tlsa.cert_usage() {
                CertUsage::DomainIssued => true,
                CertUsage::TrustAnchor => false,
                _ => continue,
            };
            let is_sha256 = match tlsa.matching() {
                Matching::Sha256 => true,
                Matching::Sha512 => false,
                _ => continue,
            };
            let is_spki = match tlsa.selector() {
                Selector::Spki => true,
                Selector::Full => false,
                _ => continue,
            };

            if is_end_entity {
                has_end_entities = true;
            } else {
                has_intermediates = true;
            }
            entries.push(TlsaEntry {
                is_end_entity,
                is_sha256,
                is_spki,
                data: tlsa.cert_data().to_vec(),
            });
        }

        trc::event!(Dane(trc::DaneEvent::AuthenticatedTlsa), Domain = key.clone().into_owned());

        let tlsa = Arc::new(Tlsa {
            entries,
            has_end_entities,
            has_intermediates,
        });

        self.server
            .inner
            .cache
            .dns_tlsa
            .insert_with_expiry(key.into_owned(), tlsa.clone(), tlsa_lookup.valid_until());

        Ok(Some(tlsa))
    }
}
