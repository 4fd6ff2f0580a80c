/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! Component H — delivery orchestrator (spec.md §4.H). Drives one envelope
//! through `Start → AddRcpt* → (Body | BodyNonAtomic) → Commit | Abort`,
//! grouping recipients by domain and holding at most one open connection per
//! domain for the lifetime of the delivery. `connection_for_domain` is the
//! pool-reuse-or-dial algorithm; `attempt_mx`/`connect_port` are the
//! per-candidate policy check and STARTTLS fallback ladder.

use std::{net::SocketAddr, sync::Arc, time::Instant};

use ahash::AHashMap;
use common::config::smtp::{MxLevel, TlsLevel};

use crate::core::{Envelope, RecipientAddress, SMTP};

use super::{
    client::{self, Conn},
    error::{DeliveryError, ErrorDetails, PartialError},
    limits,
    policy::{PolicyStack, PolicyStackFactory, TlsState},
    pool::{self, Pool},
};

/// One recipient's terminal outcome, set either at `AddRcpt` (rejected
/// before any DATA was sent) or by `body`/`body_non_atomic` (DATA response).
#[derive(Debug, Clone)]
enum Outcome {
    Success,
    Failure(DeliveryError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Gathering,
    Sending,
    Closed,
}

/// One open connection shared by every recipient routed to the same domain
/// within this delivery (spec.md §3: "at most one open connection per
/// recipient domain, for the life of the delivery").
struct DomainConnection {
    conn: Box<dyn Conn>,
    /// `Some` only when this connection is eligible to return to the pool on
    /// `Commit` — never set for a `RequireTLS` delivery (spec.md §4.C
    /// "Safety rule": REQUIRETLS pool poisoning).
    pool_key: Option<pool::Key>,
    _permits: limits::Permits,
    mail_from_sent: bool,
    rcpt_idxs: Vec<usize>,
}

/// One in-flight delivery: one envelope, grouped by recipient domain
/// (spec.md §3/§4.H).
pub struct Delivery {
    smtp: Arc<SMTP>,
    pool: Arc<Pool>,
    policies: PolicyStack,
    envelope: Envelope,
    domains: AHashMap<String, DomainConnection>,
    /// Indexed the same as `envelope.rcpt_to`; `None` until that recipient
    /// has a terminal outcome.
    outcomes: Vec<Option<Outcome>>,
    state: State,
    source_domain: String,
}

/// Result of `Delivery::body`: either every recipient succeeded, exactly one
/// failed (the common case), or several did (spec.md §4.H / §7).
pub enum BodyError {
    Single(DeliveryError),
    Partial(PartialError),
}

impl Delivery {
    /// spec.md §4.H `Start(envelope) -> Delivery`.
    pub fn start(smtp: Arc<SMTP>, pool: Arc<Pool>, policy_factory: &PolicyStackFactory, envelope: Envelope) -> Self {
        let source_domain = envelope
            .mail_from
            .rsplit_once('@')
            .map(|(_, domain)| utils::idna::canonical(domain))
            .unwrap_or_default();
        let outcomes = vec![None; envelope.rcpt_to.len()];
        Delivery {
            smtp,
            pool,
            policies: policy_factory.build(),
            envelope,
            domains: AHashMap::new(),
            outcomes,
            state: State::Gathering,
            source_domain,
        }
    }

    /// spec.md §4.H `AddRcpt`. Classifies the recipient, obtains (or reuses)
    /// this delivery's connection for its domain, and issues RCPT TO right
    /// away — so a remote-rejected mailbox is known before `Body` ever runs,
    /// rather than discovered only once DATA is sent.
    pub async fn add_rcpt(&mut self, idx: usize, recipient: &RecipientAddress) -> Result<(), DeliveryError> {
        debug_assert_eq!(self.state, State::Gathering);

        if self.envelope.quarantine {
            return self.fail_rcpt(idx, DeliveryError::quarantined(&recipient.domain));
        }
        if recipient.domain.is_empty() {
            return self.fail_rcpt(idx, DeliveryError::empty_domain_recipient(&recipient.address));
        }
        if recipient.domain.starts_with('[') {
            return self.fail_rcpt(idx, DeliveryError::ip_literal_recipient(&recipient.address));
        }

        let domain = recipient.domain.clone();
        if !self.domains.contains_key(&domain) {
            match self.new_domain_connection(&domain).await {
                Ok(dc) => {
                    self.domains.insert(domain.clone(), dc);
                }
                Err(err) => return self.fail_rcpt(idx, err),
            }
        }

        let dc = self.domains.get_mut(&domain).expect("just inserted or already present");
        match dc.conn.rcpt_to(&recipient.address_lcase).await {
            Ok(()) => {
                dc.rcpt_idxs.push(idx);
                Ok(())
            }
            Err(err) => self.fail_rcpt(idx, err),
        }
    }

    fn fail_rcpt(&mut self, idx: usize, err: DeliveryError) -> Result<(), DeliveryError> {
        self.outcomes[idx] = Some(Outcome::Failure(err.clone()));
        Err(err)
    }

    /// spec.md §4.H steps 1-7, minus the "active conn already exists" check
    /// (that lives in `add_rcpt`, since it needs mutable access to
    /// `self.domains` that this function doesn't otherwise require).
    async fn new_domain_connection(&self, domain: &str) -> Result<DomainConnection, DeliveryError> {
        let require_tls = self.envelope.require_tls;
        let key = pool::Key {
            domain: domain.to_string(),
            require_tls,
        };

        // Step 2: pool reuse, bypassed entirely for RequireTLS deliveries.
        let reused = if require_tls {
            trc::event!(Pool(trc::PoolEvent::Bypass), Domain = domain.to_string());
            None
        } else {
            self.pool.get(&key).await
        };

        let mut conn = match reused {
            Some(conn) => conn,
            None => self.dial_new(domain).await?,
        };

        // Step 4/6: REQUIRETLS cross-check, relaxed when configured and the
        // remote never advertised the extension at all.
        if require_tls {
            let relaxed = self.smtp.server.core.smtp.local_policy.relax_requiretls && !conn.capabilities().requiretls;
            if !relaxed && (conn.tls_level() < TlsLevel::Authenticated || conn.mx_level() < MxLevel::Mtasts) {
                return Err(DeliveryError::requiretls_denied(domain, conn.tls_level(), conn.mx_level()));
            }
        }

        // Step 5: destination slot from the limits governor, held for the
        // lifetime of this domain's connection.
        let permits = self.smtp.limits.acquire(&self.source_domain, domain).await?;

        // Step 7: MAIL FROM, once per domain connection regardless of origin.
        conn.mail_from(&self.envelope.mail_from, require_tls).await?;

        Ok(DomainConnection {
            conn,
            pool_key: if require_tls { None } else { Some(key) },
            _permits: permits,
            mail_from_sent: true,
            rcpt_idxs: Vec::new(),
        })
    }

    /// Step 3: construct a new connection by walking the candidate MX list
    /// in preference order, trying every configured port for each before
    /// moving to the next candidate.
    async fn dial_new(&self, domain: &str) -> Result<Box<dyn Conn>, DeliveryError> {
        self.policies.prepare_domain(domain).await;
        let candidates = self.resolve_mx(domain).await?;

        let mut last_err = None;
        for mx in &candidates {
            self.policies.prepare_conn(domain, mx).await;
            for &port in &self.smtp.server.core.smtp.ports {
                match self.attempt_mx(domain, mx, port).await {
                    Ok(conn) => return Ok(conn),
                    Err(err) => {
                        trc::event!(Delivery(trc::DeliveryEvent::AttemptFailed), Domain = domain.to_string(), Mx = mx.to_string());
                        last_err = Some(err);
                    }
                }
            }
        }

        Err(match last_err.and_then(|err| err.error_details().cloned()) {
            Some(details) => DeliveryError::no_mx_reachable(domain, &details),
            None => DeliveryError::no_candidates(domain),
        })
    }

    /// Step 3a-3d for one MX candidate/port pair: `CheckMX`, dial with the
    /// STARTTLS fallback ladder, `CheckConn`.
    async fn attempt_mx(&self, domain: &str, mx: &str, port: u16) -> Result<Box<dyn Conn>, DeliveryError> {
        let started = Instant::now();
        trc::event!(Delivery(trc::DeliveryEvent::Attempt), Domain = domain.to_string(), Mx = mx.to_string());

        let mx_level = self.policies.check_mx(domain, mx).await?;
        let addr = self.resolve_addr(mx, port).await?;

        let local_hostname = self.smtp.server.core.smtp.hostname.clone();
        let tls = self.smtp.server.core.smtp.tls.clone();
        let (mut conn, tls_state) = self.connect_port(mx, addr, &local_hostname, &tls).await?;

        let tls_level = self
            .policies
            .check_conn(domain, mx, mx_level, conn.tls_level(), &tls_state)
            .await?;

        conn.set_mx_level(mx_level);
        conn.set_tls_level(tls_level);

        trc::event!(
            Delivery(trc::DeliveryEvent::Success),
            Domain = domain.to_string(),
            Mx = mx.to_string(),
            Elapsed = started.elapsed(),
        );

        Ok(conn)
    }

    /// spec.md §4.H step 3: `connectPort`'s STARTTLS fallback ladder.
    /// Authenticated (PKIX-verifying STARTTLS) is always tried first; on a
    /// certificate-verification failure, a second STARTTLS attempt is made
    /// unconditionally with a certificate-blind connector (Encrypted — trust,
    /// if any, is restored later by DANE-EE in `CheckConn`; spec.md §4.H step
    /// 3a does not gate this retry on any config knob). Any other failure,
    /// or the second attempt also failing, falls through to plaintext
    /// (None) — which also covers the remote never advertising STARTTLS at
    /// all. Whether a *merely* Encrypted outcome (no DANE-EE match) is
    /// acceptable is the local policy floor's job (`LocalPolicyConfig::
    /// min_tls_level`), not this ladder's — `tls.allow_invalid_certs` plays
    /// no part in MX delivery.
    async fn connect_port(
        &self,
        hostname: &str,
        addr: SocketAddr,
        local_hostname: &str,
        tls: &common::config::smtp::ClientTlsConfig,
    ) -> Result<(Box<dyn Conn>, TlsState), DeliveryError> {
        let connectors = &self.smtp.server.inner.data.smtp_connectors;

        match client::connect_starttls_raw(hostname, addr, local_hostname, tls.connect_timeout, connectors.pki_verify.clone()).await {
            Ok(conn) => {
                let tls_state = TlsState {
                    handshake_complete: true,
                    peer_certificates: conn.peer_certificates.clone(),
                };
                return Ok((Box::new(conn), tls_state));
            }
            Err(err) if client::is_cert_verify_error(&err) => {
                trc::event!(
                    Delivery(trc::DeliveryEvent::StartTlsFallback),
                    Hostname = hostname.to_string(),
                    Reason = "certificate verification failed".to_string(),
                );
                if let Ok(conn) =
                    client::connect_starttls_raw(hostname, addr, local_hostname, tls.connect_timeout, connectors.dummy_verify.clone()).await
                {
                    let tls_state = TlsState {
                        handshake_complete: true,
                        peer_certificates: conn.peer_certificates.clone(),
                    };
                    return Ok((Box::new(conn), tls_state));
                }
            }
            Err(_) => {}
        }

        let conn = client::connect_plain(hostname, addr, local_hostname, tls.connect_timeout).await?;
        Ok((Box::new(conn), TlsState::default()))
    }

    async fn resolve_mx(&self, domain: &str) -> Result<Vec<String>, DeliveryError> {
        let records = super::lookup::mx_lookup(&self.smtp, domain)
            .await
            .map_err(|err| DeliveryError::from_mail_auth_error(domain, err))?;
        candidates_from_mx(&records, domain)
    }

    async fn resolve_addr(&self, host: &str, port: u16) -> Result<SocketAddr, DeliveryError> {
        if let Ok(ips) = super::lookup::ipv4_lookup(&self.smtp, host).await {
            if let Some(ip) = ips.first() {
                return Ok(SocketAddr::new((*ip).into(), port));
            }
        }
        match super::lookup::ipv6_lookup(&self.smtp, host).await {
            Ok(ips) => match ips.first() {
                Some(ip) => Ok(SocketAddr::new((*ip).into(), port)),
                None => Err(DeliveryError::from_mail_auth_error(
                    host,
                    mail_auth::Error::DnsRecordNotFound(mail_auth::hickory_resolver::proto::rr::RecordType::A),
                )),
            },
            Err(err) => Err(DeliveryError::from_mail_auth_error(host, err)),
        }
    }

    /// spec.md §4.H `BodyNonAtomic`: one sub-task per open domain
    /// connection, run concurrently; every recipient gets exactly one
    /// outcome regardless of how many other domains failed.
    pub async fn body_non_atomic(&mut self, header: Arc<[u8]>, body: Arc<[u8]>) -> Vec<(usize, DeliveryError)> {
        self.state = State::Sending;
        let data_timeout = self.smtp.server.core.smtp.tls.data_timeout;

        let mut tasks = Vec::new();
        for (domain, mut dc) in self.domains.drain() {
            // Every recipient routed to this connection was rejected at RCPT
            // TO: DATA has no accepted recipient to deliver to and real
            // servers reject it as an out-of-sequence command. RSET the
            // transaction and close without ever sending it.
            if dc.rcpt_idxs.is_empty() {
                let _ = dc.conn.reset().await;
                self.close_domain_conn(domain, dc, true).await;
                continue;
            }
            let header = header.clone();
            let body = body.clone();
            tasks.push(tokio::spawn(async move {
                let result = dc.conn.data(&header, &body, data_timeout).await;
                (domain, dc, result)
            }));
        }

        for task in tasks {
            let Ok((domain, dc, result)) = task.await else {
                // The sub-task panicked; its recipients keep whatever
                // outcome `add_rcpt` already recorded (none, for a
                // successful RCPT) and are surfaced as cancelled below.
                continue;
            };

            let outcome = match &result {
                Ok(()) => Outcome::Success,
                Err(err) => Outcome::Failure(err.clone()),
            };
            for idx in &dc.rcpt_idxs {
                self.outcomes[*idx] = Some(outcome.clone());
            }
            self.close_domain_conn(domain, dc, result.is_ok()).await;
        }

        self.state = State::Closed;
        self.outcomes
            .iter()
            .enumerate()
            .filter_map(|(idx, outcome)| match outcome {
                Some(Outcome::Success) => None,
                Some(Outcome::Failure(err)) => Some((idx, err.clone())),
                // Only reachable if this recipient's domain sub-task
                // panicked mid-DATA (see the `let else` above).
                None => Some((idx, DeliveryError::cancelled(&self.envelope.id))),
            })
            .collect()
    }

    /// spec.md §4.H `Body`: as `body_non_atomic`, but collapses the result
    /// into a single error when exactly one recipient failed, matching the
    /// common single-recipient case with a non-composite `DeliveryError`.
    pub async fn body(&mut self, header: Arc<[u8]>, body: Arc<[u8]>) -> Result<(), BodyError> {
        let mut failures = self.body_non_atomic(header, body).await;
        match failures.len() {
            0 => Ok(()),
            1 => Err(BodyError::Single(failures.pop().unwrap().1)),
            _ => {
                let temporary = failures.iter().any(|(_, err)| err.is_temporary());
                let details: Vec<(usize, ErrorDetails)> = failures
                    .into_iter()
                    .filter_map(|(idx, err)| err.error_details().cloned().map(|details| (idx, details)))
                    .collect();
                Err(BodyError::Partial(PartialError { failures: details, temporary }))
            }
        }
    }

    /// spec.md §4.H `Commit`: close every still-open domain connection,
    /// returning eligible ones to the pool.
    pub async fn commit(mut self) {
        self.state = State::Closed;
        for (domain, dc) in self.domains.drain().collect::<Vec<_>>() {
            self.close_domain_conn(domain, dc, true).await;
        }
    }

    /// spec.md §4.H `Abort`: a connection that never issued MAIL FROM is
    /// dropped directly (no QUIT round-trip); one that did attempts a RESET
    /// before closing, so a server-side transaction isn't left dangling.
    pub async fn abort(mut self) {
        self.state = State::Closed;
        for (_, mut dc) in self.domains.drain() {
            if dc.mail_from_sent {
                let _ = dc.conn.reset().await;
                dc.conn.quit().await;
            } else {
                dc.conn.direct_close().await;
            }
        }
    }

    async fn close_domain_conn(&self, _domain: String, dc: DomainConnection, success: bool) {
        match dc.pool_key {
            Some(key) if success => self.pool.return_conn(key, dc.conn),
            _ => dc.conn.quit().await,
        }
    }
}

/// Flattens `mail_auth::MX` records into `(preference, hostname)` pairs, then
/// into the ordered candidate list spec.md §3 describes: the synthetic
/// fallback record when none exist, and null-MX detection (a record whose
/// trailing-dot-stripped host is empty — i.e. literally `"."`).
fn candidates_from_mx(records: &[mail_auth::MX], domain: &str) -> Result<Vec<String>, DeliveryError> {
    let mut flat: Vec<(u16, String)> = records
        .iter()
        .flat_map(|mx| mx.exchanges.iter().map(move |host| (mx.preference, host.trim_end_matches('.').to_string())))
        .collect();

    if flat.is_empty() {
        return Ok(vec![domain.to_string()]);
    }

    if flat.iter().any(|(_, host)| host.is_empty()) {
        return Err(DeliveryError::null_mx(domain));
    }

    flat.sort_by_key(|(pref, _)| *pref);
    Ok(flat.into_iter().map(|(_, host)| host).collect())
}
