/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! `verifyDANE` (spec.md §4.F). Given the `Tlsa` record set returned by an
//! AD-authenticated lookup and the certificate chain the peer presented
//! (DER, leaf first), decides whether DANE asserts authenticity.

use common::config::resolver::{Tlsa, TlsaEntry};
use sha2::{Digest, Sha256, Sha512};
use x509_parser::prelude::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaneOutcome {
    /// DANE-EE or DANE-TA matched: certificate is authenticated.
    Match,
    /// No usable TLSA records (all filtered out, or RRset was empty/unauthenticated).
    Unusable,
    /// Usable records existed but none matched the presented chain.
    NoMatch,
}

impl DaneOutcome {
    /// C.3 of SPEC_FULL: the RFC 8460 `ResultType` an external TLSRPT
    /// generator would attach to this outcome. `None` for `Match` (not a
    /// failure) and `Unusable` (DANE asserted nothing, so there is no DANE
    /// failure to report).
    pub fn tlsrpt_result_type(&self) -> Option<mail_auth::report::tlsrpt::ResultType> {
        match self {
            DaneOutcome::Match | DaneOutcome::Unusable => None,
            DaneOutcome::NoMatch => Some(mail_auth::report::tlsrpt::ResultType::TlsaInvalid),
        }
    }
}

/// `tlsa` is `None` when the TLSA lookup returned nothing or was
/// unauthenticated (AD=false); both are "no DANE assertion" per RFC 7672.
pub fn verify_dane(tlsa: Option<&Tlsa>, hostname: &str, chain: &[Vec<u8>]) -> DaneOutcome {
    let Some(tlsa) = tlsa else {
        return DaneOutcome::Unusable;
    };
    if tlsa.entries.is_empty() {
        return DaneOutcome::Unusable;
    }
    let Some(leaf_der) = chain.first() else {
        return DaneOutcome::NoMatch;
    };
    let Ok((_, leaf)) = X509Certificate::from_der(leaf_der) else {
        return DaneOutcome::NoMatch;
    };

    // DANE-EE: match against the leaf certificate directly. SAN/CN and
    // expiry are not consulted (RFC 7672 §3.1.1).
    for entry in tlsa.entries.iter().filter(|e| e.is_end_entity) {
        if entry_matches(entry, &leaf, leaf_der) {
            return DaneOutcome::Match;
        }
    }

    // DANE-TA: the matching chain certificate is promoted to a trust
    // anchor; verify the chain up to it, then check hostname and time.
    for (idx, cert_der) in chain.iter().enumerate() {
        let Ok((_, cert)) = X509Certificate::from_der(cert_der) else {
            continue;
        };
        let is_trust_anchor = tlsa
            .entries
            .iter()
            .filter(|e| !e.is_end_entity)
            .any(|entry| entry_matches(entry, &cert, cert_der));
        if !is_trust_anchor {
            continue;
        }
        if verify_chain_to_anchor(chain, idx) && hostname_matches(&leaf, hostname) && currently_valid(&leaf) {
            return DaneOutcome::Match;
        }
    }

    DaneOutcome::NoMatch
}

fn entry_matches(entry: &TlsaEntry, cert: &X509Certificate<'_>, cert_der: &[u8]) -> bool {
    let candidate: &[u8] = if entry.is_spki {
        cert.tbs_certificate.subject_pki.raw
    } else {
        cert_der
    };
    let digest = if entry.is_sha256 {
        Sha256::digest(candidate).to_vec()
    } else {
        Sha512::digest(candidate).to_vec()
    };
    digest == entry.data
}

/// Verifies each certificate in `chain[..=anchor_idx]` is signed by the
/// next, ending at the promoted trust anchor (which need not be self-signed).
fn verify_chain_to_anchor(chain: &[Vec<u8>], anchor_idx: usize) -> bool {
    for window in chain[..=anchor_idx].windows(2) {
        let (Ok((_, subject)), Ok((_, issuer))) = (
            X509Certificate::from_der(&window[0]),
            X509Certificate::from_der(&window[1]),
        ) else {
            return false;
        };
        if subject.verify_signature(Some(&issuer.tbs_certificate.subject_pki)).is_err() {
            return false;
        }
    }
    true
}

fn hostname_matches(cert: &X509Certificate<'_>, hostname: &str) -> bool {
    let hostname = hostname.trim_end_matches('.').to_ascii_lowercase();
    let Ok(Some(san)) = cert.tbs_certificate.subject_alternative_name() else {
        return false;
    };
    san.value.general_names.iter().any(|name| match name {
        GeneralName::DNSName(dns) => dns_name_matches(dns, &hostname),
        _ => false,
    })
}

fn dns_name_matches(pattern: &str, hostname: &str) -> bool {
    let pattern = pattern.trim_end_matches('.').to_ascii_lowercase();
    if let Some(rest) = pattern.strip_prefix("*.") {
        hostname.split_once('.').is_some_and(|(_, suffix)| suffix == rest)
    } else {
        pattern == hostname
    }
}

fn currently_valid(cert: &X509Certificate<'_>) -> bool {
    let now = ASN1Time::now();
    cert.validity().not_before <= now && now <= cert.validity().not_after
}
