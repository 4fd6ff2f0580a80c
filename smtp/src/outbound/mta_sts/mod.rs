/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! Component D — MTA-STS policy cache (spec.md §4.D). Discovery over the
//! `_mta-sts.<domain>` TXT record, RFC 8461 §8.4's "use the stale cached
//! policy on failure" survival rule, HTTPS fetch/parse/cache, and the
//! background refresh walk.

mod lookup;
mod refresh;

pub use common::config::resolver::{MtaStsParseError, Policy, PolicyMode};
pub use lookup::get_policy;
pub use refresh::refresh_task;

#[derive(Debug)]
pub enum Error {
    Dns(mail_auth::Error),
    Http(reqwest::Error),
    InvalidPolicy(MtaStsParseError),
    PolicyTooLarge,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Dns(err) => match err {
                mail_auth::Error::DnsRecordNotFound(code) => write!(f, "record not found: {code:?}"),
                mail_auth::Error::InvalidRecordType => f.write_str("failed to parse MTA-STS DNS record"),
                _ => write!(f, "DNS lookup error: {err}"),
            },
            Error::Http(err) => {
                if err.is_timeout() {
                    f.write_str("timeout fetching policy")
                } else if err.is_connect() {
                    f.write_str("could not reach policy host")
                } else {
                    f.write_str("failed to fetch policy")
                }
            }
            Error::InvalidPolicy(err) => write!(f, "failed to parse policy: {err:?}"),
            Error::PolicyTooLarge => f.write_str("policy exceeds configured size limit"),
        }
    }
}

impl From<mail_auth::Error> for Error {
    fn from(err: mail_auth::Error) -> Self {
        Error::Dns(err)
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Error::Http(err)
    }
}

/// C.3 of SPEC_FULL: classification an external TLSRPT generator would
/// attach to a failed policy fetch (RFC 8460); this crate only produces the
/// classification, it does not assemble or send a report.
impl From<&Error> for mail_auth::report::tlsrpt::ResultType {
    fn from(err: &Error) -> Self {
        match err {
            Error::InvalidPolicy(_) | Error::PolicyTooLarge => mail_auth::report::tlsrpt::ResultType::StsPolicyInvalid,
            Error::Dns(_) | Error::Http(_) => mail_auth::report::tlsrpt::ResultType::StsPolicyFetchError,
        }
    }
}
