/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use std::sync::Arc;

use common::Server;
use mail_auth::{hickory_resolver::AsyncResolver, Resolver};

use crate::outbound::limits::Limits;

/// Top-level handle to the outbound delivery engine: the plain DNS resolver,
/// the DNSSEC-aware one used by the policy stack's DNSSEC axis and by DANE's
/// TLSA lookups, and a handle to the shared `common::Server` (config, caches,
/// TLS connectors).
///
/// Trimmed from the teacher's combined inbound+outbound `SMTP`: no
/// `SessionCore`/`SieveCore`/`ReportCore`/`QueueCore`, no `Session<T>` state
/// machine, no worker thread pool — all inbound-session or queue/report
/// concerns, out of scope per spec.md §1.
pub struct SMTP {
    pub server: Server,
    pub resolvers: Resolvers,
    pub limits: Limits,
}

pub struct Resolvers {
    pub dns: Resolver,
    pub dnssec: DnssecResolver,
}

/// A raw `hickory_resolver` handle configured to request DNSSEC validation,
/// used where the caller needs the Authenticated Data (AD) bit directly
/// rather than `mail_auth::Resolver`'s already-validated answer (spec.md
/// §4.A: TLSA lookups, and the DNSSEC axis of the policy stack).
#[derive(Clone)]
pub struct DnssecResolver {
    pub resolver: AsyncResolver,
}

/// The message envelope (spec.md §3): one sender, many recipients, SMTP
/// options, stable id for logs. Immutable after `Start`.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub id: String,
    pub mail_from: String,
    pub rcpt_to: Vec<RecipientAddress>,
    pub require_tls: bool,
    pub quarantine: bool,
}

/// One recipient, with the canonical (lower-cased, A-label) domain key used
/// for fan-out grouping (spec.md §3 "Recipient domain key").
#[derive(Debug, Clone)]
pub struct RecipientAddress {
    pub address: String,
    pub address_lcase: String,
    pub domain: String,
}

impl RecipientAddress {
    pub fn new(address: String) -> Self {
        let address_lcase = address.to_lowercase();
        let domain = address_lcase
            .rsplit_once('@')
            .map(|(_, domain)| utils::idna::canonical(domain))
            .unwrap_or_default();
        RecipientAddress {
            domain,
            address_lcase,
            address,
        }
    }
}

impl SMTP {
    pub fn new(server: Server, resolvers: Resolvers) -> Arc<Self> {
        let limits = Limits::new(server.core.smtp.limits);
        Arc::new(SMTP { server, resolvers, limits })
    }
}

#[cfg(feature = "test_mode")]
impl SMTP {
    /// Builds an `SMTP` over a default `common::Server` and a resolver
    /// configured for `mail_auth`'s mock-resolve test fixtures (matching the
    /// `#[cfg(any(test, feature = "test_mode"))]` gate used throughout
    /// `outbound::lookup`/`outbound::dane`).
    pub fn test() -> Arc<Self> {
        let server = Server::default();
        let limits = Limits::new(server.core.smtp.limits);
        Arc::new(SMTP {
            resolvers: Resolvers {
                dns: Resolver::new_system_conf().unwrap_or_else(|_| Resolver::new_cloudflare_tls()),
                dnssec: DnssecResolver {
                    resolver: AsyncResolver::tokio(
                        Default::default(),
                        Default::default(),
                    ),
                },
            },
            server,
            limits,
        })
    }
}
