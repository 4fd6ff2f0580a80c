/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! The error taxonomy of spec.md §7: `ConfigError` is init-time only and not
//! represented here (it never survives past construction); `DNSError`,
//! `PolicyError`, `TLSError` (folded into the final disposition by
//! `connectPort`), `SMTPError`, and `PartialError` are all modeled as
//! `Status<HostResponse, ErrorDetails>` plus the `PartialError` aggregate.

use common::config::smtp::{MxLevel, TlsLevel};
use smtp_proto::{Response, Severity};

use super::mta_sts;

/// Disposition of one delivery attempt, mirroring the teacher's
/// `queue::Status` shape (`from_smtp_error`/`from_tls_error`/
/// `from_mail_auth_error`/`from_mta_sts_error` factories).
#[derive(Debug, Clone)]
pub enum Status<T, E> {
    Completed(T),
    TemporaryFailure(E),
    PermanentFailure(E),
}

impl<T, E> Status<T, E> {
    pub fn is_permanent(&self) -> bool {
        matches!(self, Status::PermanentFailure(_))
    }

    pub fn is_temporary(&self) -> bool {
        matches!(self, Status::TemporaryFailure(_))
    }

    /// `None` for `Completed`; the failure details otherwise. Used by
    /// `delivery::Delivery::body` to build a `PartialError` out of per-
    /// recipient `DeliveryError`s without re-matching the variant by hand.
    pub fn error_details(&self) -> Option<&E> {
        match self {
            Status::Completed(_) => None,
            Status::TemporaryFailure(details) | Status::PermanentFailure(details) => Some(details),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HostResponse {
    pub hostname: String,
    pub response: Response<String>,
}

/// Structured fields spec.md §6 names alongside every error: `tls_level`,
/// `mx_level`, `domain`, `reason`.
#[derive(Debug, Clone, Default)]
pub struct MiscFields {
    pub tls_level: Option<TlsLevel>,
    pub mx_level: Option<MxLevel>,
    pub domain: Option<String>,
    pub reason: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ErrorDetails {
    pub entity: Box<str>,
    pub smtp_code: u16,
    pub enhanced_code: (u8, u8, u8),
    pub message: Box<str>,
    pub remote_server: Option<Box<str>>,
    pub misc: MiscFields,
}

impl ErrorDetails {
    fn new(entity: &str, smtp_code: u16, enhanced_code: (u8, u8, u8), message: impl Into<Box<str>>) -> Self {
        ErrorDetails {
            entity: entity.into(),
            smtp_code,
            enhanced_code,
            message: message.into(),
            remote_server: None,
            misc: MiscFields::default(),
        }
    }

    pub fn with_misc(mut self, misc: MiscFields) -> Self {
        self.misc = misc;
        self
    }
}

/// The orchestrator-facing error type: every call site in `delivery`,
/// `policy`, `dane`, and `mta_sts` returns `Result<T, DeliveryError>`.
pub type DeliveryError = Status<HostResponse, ErrorDetails>;

impl DeliveryError {
    pub fn from_smtp_error(hostname: &str, command: &str, err: mail_send::Error) -> Self {
        match err {
            mail_send::Error::UnexpectedReply(response) => {
                let details = ErrorDetails::new(
                    hostname,
                    response.code(),
                    (5, 5, 0),
                    format!("unexpected reply to {}: {}", command.trim(), response.message()),
                );
                if response.severity() == Severity::PermanentNegativeCompletion {
                    Status::PermanentFailure(details)
                } else {
                    Status::TemporaryFailure(details)
                }
            }
            mail_send::Error::Auth(_)
            | mail_send::Error::UnsupportedAuthMechanism
            | mail_send::Error::InvalidTLSName
            | mail_send::Error::MissingStartTls => Status::PermanentFailure(ErrorDetails::new(
                hostname,
                550,
                (5, 5, 0),
                err.to_string(),
            )),
            _ => Status::TemporaryFailure(ErrorDetails::new(hostname, 451, (4, 4, 2), err.to_string())),
        }
    }

    pub fn from_tls_error(hostname: &str, err: mail_send::Error) -> Self {
        match err {
            mail_send::Error::InvalidTLSName => {
                Status::PermanentFailure(ErrorDetails::new(hostname, 530, (5, 7, 0), "invalid hostname for TLS"))
            }
            mail_send::Error::Timeout => {
                Status::TemporaryFailure(ErrorDetails::new(hostname, 451, (4, 4, 7), "TLS handshake timed out"))
            }
            _ => Status::TemporaryFailure(ErrorDetails::new(
                hostname,
                451,
                (4, 7, 5),
                format!("TLS handshake failed: {err}"),
            )),
        }
    }

    pub fn timeout(hostname: &str, stage: &str) -> Self {
        Status::TemporaryFailure(ErrorDetails::new(
            hostname,
            451,
            (4, 4, 7),
            format!("timed out while {stage}"),
        ))
    }

    pub fn from_mail_auth_error(entity: &str, err: mail_auth::Error) -> Self {
        match &err {
            mail_auth::Error::DnsRecordNotFound(code) => Status::PermanentFailure(ErrorDetails::new(
                entity,
                550,
                (5, 1, 2),
                format!("domain not found: {code:?}"),
            )),
            _ => Status::TemporaryFailure(ErrorDetails::new(entity, 451, (4, 4, 4), err.to_string())),
        }
    }

    pub fn from_mta_sts_error(entity: &str, err: &mta_sts::Error) -> Self {
        match err {
            mta_sts::Error::Dns(mail_auth::Error::DnsRecordNotFound(code)) => {
                Status::PermanentFailure(ErrorDetails::new(
                    entity,
                    550,
                    (5, 7, 5),
                    format!("MTA-STS record not found: {code:?}"),
                ))
            }
            mta_sts::Error::Dns(err) => {
                Status::TemporaryFailure(ErrorDetails::new(entity, 451, (4, 7, 5), format!("MTA-STS DNS lookup failed: {err}")))
            }
            mta_sts::Error::Http(_) => {
                Status::TemporaryFailure(ErrorDetails::new(entity, 451, (4, 7, 5), "failed to fetch MTA-STS policy"))
            }
            mta_sts::Error::InvalidPolicy(reason) => Status::PermanentFailure(ErrorDetails::new(
                entity,
                550,
                (5, 7, 5),
                format!("invalid MTA-STS policy: {reason}"),
            )),
            mta_sts::Error::PolicyTooLarge => Status::PermanentFailure(ErrorDetails::new(
                entity,
                550,
                (5, 7, 5),
                "MTA-STS policy exceeds size limit",
            )),
        }
    }

    /// spec.md §9: IP-literal recipients are out of scope, rejected with
    /// permanent 5.1.1 at `AddRcpt`.
    pub fn ip_literal_recipient(address: &str) -> Self {
        Status::PermanentFailure(ErrorDetails::new(
            address,
            501,
            (5, 1, 1),
            "IP-literal recipients are not accepted",
        ))
    }

    /// spec.md §3/§4.H: null MX is a terminal permanent failure, no TCP
    /// attempt is made.
    pub fn null_mx(domain: &str) -> Self {
        Status::PermanentFailure(
            ErrorDetails::new(
                domain,
                556,
                (5, 1, 10),
                "domain does not accept email (null MX)",
            )
            .with_misc(MiscFields {
                domain: Some(domain.to_string()),
                ..Default::default()
            }),
        )
    }

    /// spec.md §4.G: REQUIRETLS could not be satisfied by the achieved level.
    pub fn requiretls_denied(domain: &str, tls_level: TlsLevel, mx_level: MxLevel) -> Self {
        Status::PermanentFailure(
            ErrorDetails::new(
                domain,
                550,
                (5, 7, 30),
                "message requires TLS but the achieved security level is insufficient",
            )
            .with_misc(MiscFields {
                tls_level: Some(tls_level),
                mx_level: Some(mx_level),
                domain: Some(domain.to_string()),
                ..Default::default()
            }),
        )
    }

    /// spec.md §4.I: local policy floor unmet; temporary, to allow operator
    /// correction without message loss.
    pub fn local_policy_floor(domain: &str, tls_level: TlsLevel, mx_level: MxLevel) -> Self {
        Status::TemporaryFailure(
            ErrorDetails::new(
                domain,
                451,
                (4, 7, 0),
                "achieved security level is below the configured local policy floor",
            )
            .with_misc(MiscFields {
                tls_level: Some(tls_level),
                mx_level: Some(mx_level),
                domain: Some(domain.to_string()),
                ..Default::default()
            }),
        )
    }

    /// spec.md §4.H: `<postmaster>`-style empty-domain recipient.
    pub fn empty_domain_recipient(address: &str) -> Self {
        Status::PermanentFailure(ErrorDetails::new(address, 501, (5, 1, 3), "recipient has no domain part"))
    }

    pub fn quarantined(domain: &str) -> Self {
        Status::PermanentFailure(ErrorDetails::new(domain, 550, (5, 7, 1), "message is quarantined"))
    }

    /// spec.md §4.G: MTA-STS in `enforce` mode asserted a policy but `mx`
    /// doesn't match any of its patterns — permanent, since enforce mode is
    /// an authenticity demand, unlike STS-preload's best-effort fallback.
    pub fn mta_sts_mismatch(domain: &str, mx: &str) -> Self {
        Status::PermanentFailure(
            ErrorDetails::new(
                domain,
                550,
                (5, 7, 5),
                format!("MX {mx} not authorized by MTA-STS policy"),
            )
            .with_misc(MiscFields {
                domain: Some(domain.to_string()),
                ..Default::default()
            }),
        )
    }

    /// spec.md §4.F: non-empty authenticated TLSA RRset but the handshake
    /// never completed — "TLS required but unsupported".
    pub fn dane_tls_required(mx: &str) -> Self {
        Status::PermanentFailure(ErrorDetails::new(mx, 530, (5, 7, 1), "TLS required by DANE but handshake did not complete"))
    }

    /// spec.md §4.F: usable TLSA records existed but none matched the
    /// presented chain.
    pub fn dane_no_match(mx: &str) -> Self {
        Status::PermanentFailure(ErrorDetails::new(mx, 530, (5, 7, 0), "no matching TLSA records for presented certificate"))
    }

    /// spec.md §5: a cancellation observed while acquiring a limits slot or
    /// awaiting a policy holder is always temporary.
    pub fn cancelled(entity: &str) -> Self {
        Status::TemporaryFailure(ErrorDetails::new(entity, 451, (4, 4, 5), "delivery cancelled"))
    }

    /// spec.md §4.H step 3d: every candidate MX/port was tried and none
    /// connected — not reachable with a `last` error to fall back on (e.g.
    /// an operator configured an empty port list, so no attempt was even
    /// made). Never observed with a non-empty port list.
    pub fn no_candidates(domain: &str) -> Self {
        Status::TemporaryFailure(ErrorDetails::new(domain, 451, (4, 4, 4), "no MX candidates were attempted"))
    }

    pub fn no_mx_reachable(domain: &str, last: &ErrorDetails) -> Self {
        if last.smtp_code >= 500 {
            Status::PermanentFailure(ErrorDetails::new(
                domain,
                550,
                last.enhanced_code,
                format!("could not deliver to any MX: {}", last.message),
            ))
        } else {
            Status::TemporaryFailure(ErrorDetails::new(
                domain,
                451,
                last.enhanced_code,
                format!("could not deliver to any MX: {}", last.message),
            ))
        }
    }
}

/// Aggregate of per-recipient outcomes for `Body` (spec.md §4.H / §7):
/// temporary if any component is temporary, so the caller prefers "retry may
/// duplicate" over "silently lose recipients".
#[derive(Debug, Clone)]
pub struct PartialError {
    pub failures: Vec<(usize, ErrorDetails)>,
    pub temporary: bool,
}
