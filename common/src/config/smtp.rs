/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! The config surface spec.md §6 names: hostname, TLS client config, debug,
//! the five named policy sub-blocks, the two local-policy floors, pool
//! sizing, limits. Plain `serde::Deserialize` structs stand in for the
//! directive DSL the teacher normally builds these from (out of scope, see
//! `DESIGN.md`), with `Default` impls matching the teacher's shipped
//! defaults.

use std::time::Duration;

#[derive(Debug, Clone, serde::Deserialize)]
#[serde(default)]
pub struct SmtpConfig {
    /// Local EHLO hostname, A-label form.
    pub hostname: String,
    pub debug: bool,
    pub tls: ClientTlsConfig,
    pub mtasts: MtaStsConfig,
    pub sts_preload: StsPreloadConfig,
    pub dane: DaneConfig,
    pub dnssec: DnssecConfig,
    pub local_policy: LocalPolicyConfig,
    pub pool: PoolConfig,
    pub limits: LimitsConfig,
    /// Ports tried in order for each candidate MX (spec.md §4.H step 3c).
    pub ports: Vec<u16>,
}

impl Default for SmtpConfig {
    fn default() -> Self {
        SmtpConfig {
            hostname: "localhost".to_string(),
            debug: false,
            tls: ClientTlsConfig::default(),
            mtasts: MtaStsConfig::default(),
            sts_preload: StsPreloadConfig::default(),
            dane: DaneConfig::default(),
            dnssec: DnssecConfig::default(),
            local_policy: LocalPolicyConfig::default(),
            pool: PoolConfig::default(),
            limits: LimitsConfig::default(),
            ports: vec![25],
        }
    }
}

#[derive(Debug, Clone, serde::Deserialize)]
#[serde(default)]
pub struct ClientTlsConfig {
    /// Reserved for a future relay-style next hop with an operator-pinned
    /// invalid-cert allowance, mirroring the teacher's `NextHop::Relay`
    /// `tls_allow_invalid_certs`. MX delivery's blind STARTTLS retry (spec.md
    /// §4.H "connectPort" step 3a) is unconditional on any cert-verify
    /// error and does not consult this flag; trust for an MX host is
    /// restored only by DANE-EE, gated by `LocalPolicyConfig::min_tls_level`.
    pub allow_invalid_certs: bool,
    pub connect_timeout: Duration,
    pub command_timeout: Duration,
    pub data_timeout: Duration,
}

impl Default for ClientTlsConfig {
    fn default() -> Self {
        ClientTlsConfig {
            allow_invalid_certs: false,
            connect_timeout: Duration::from_secs(5 * 60),
            command_timeout: Duration::from_secs(5 * 60),
            data_timeout: Duration::from_secs(10 * 60),
        }
    }
}

#[derive(Debug, Clone, Copy, serde::Deserialize)]
#[serde(default)]
pub struct MtaStsConfig {
    pub enable: bool,
    pub refresh_interval: Duration,
    pub http_timeout: Duration,
    pub max_policy_size: usize,
}

impl Default for MtaStsConfig {
    fn default() -> Self {
        MtaStsConfig {
            enable: true,
            refresh_interval: Duration::from_secs(12 * 60 * 60),
            http_timeout: Duration::from_secs(10),
            max_policy_size: 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, serde::Deserialize)]
#[serde(default)]
pub struct StsPreloadConfig {
    pub enable: bool,
    pub url: Option<String>,
    pub grace: Duration,
    pub retry_cooldown: Duration,
}

impl Default for StsPreloadConfig {
    fn default() -> Self {
        StsPreloadConfig {
            enable: false,
            url: None,
            grace: Duration::from_secs(60 * 60),
            retry_cooldown: Duration::from_secs(15 * 60),
        }
    }
}

#[derive(Debug, Clone, Copy, serde::Deserialize)]
#[serde(default)]
pub struct DaneConfig {
    pub enable: bool,
}

impl Default for DaneConfig {
    fn default() -> Self {
        DaneConfig { enable: true }
    }
}

#[derive(Debug, Clone, Copy, serde::Deserialize)]
#[serde(default)]
pub struct DnssecConfig {
    pub enable: bool,
}

impl Default for DnssecConfig {
    fn default() -> Self {
        DnssecConfig { enable: true }
    }
}

/// MX-level lattice, total order `None < Mtasts < Dnssec` (spec.md §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MxLevel {
    None,
    Mtasts,
    Dnssec,
}

/// TLS-level lattice, total order `None < Encrypted < Authenticated`
/// (spec.md §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TlsLevel {
    None,
    Encrypted,
    Authenticated,
}

#[derive(Debug, Clone, Copy, serde::Deserialize)]
#[serde(default)]
pub struct LocalPolicyConfig {
    pub min_tls_level: TlsLevel,
    pub min_mx_level: MxLevel,
    /// Best-effort mode (spec.md §4.H step 6): relax a `RequireTLS` demand
    /// when the server advertises no REQUIRETLS extension at all, instead of
    /// failing the delivery outright.
    pub relax_requiretls: bool,
}

impl Default for LocalPolicyConfig {
    fn default() -> Self {
        LocalPolicyConfig {
            min_tls_level: TlsLevel::None,
            min_mx_level: MxLevel::None,
            relax_requiretls: false,
        }
    }
}

#[derive(Debug, Clone, Copy, serde::Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub max_keys: usize,
    pub max_conns_per_key: usize,
    pub max_conn_lifetime: Duration,
    pub stale_key_lifetime: Duration,
    /// Per-connection reuse cap (spec.md §3 "Connection state": "reuse
    /// limit"), distinct from `max_conns_per_key`'s bucket-capacity bound.
    pub max_requests: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            max_keys: 2_000,
            max_conns_per_key: 10,
            max_conn_lifetime: Duration::from_secs(15 * 60),
            stale_key_lifetime: Duration::from_secs(10 * 60),
            max_requests: 100,
        }
    }
}

#[derive(Debug, Clone, Copy, serde::Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    pub max_concurrent: usize,
    pub max_concurrent_per_source_domain: usize,
    pub max_concurrent_per_destination_domain: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        LimitsConfig {
            max_concurrent: 5_000,
            max_concurrent_per_source_domain: 1_000,
            max_concurrent_per_destination_domain: 100,
        }
    }
}
