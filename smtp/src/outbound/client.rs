/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! Component B — connection primitive. One instance owns one TCP session
//! (spec.md §4.B): `connect`, `ehlo`, `starttls`, `mail`/`rcpt`/`data`,
//! `reset`/`quit`, and the `usable` probe the pool consults before handing a
//! connection back out.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use common::config::smtp::{MxLevel, TlsLevel};
use mail_send::{SmtpClient, SmtpClientBuilder};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

use super::error::DeliveryError;

/// Capability bits parsed out of the EHLO response (supplemented feature
/// C.2 of SPEC_FULL: typed flags from `smtp_proto` rather than a generic
/// string test of `Extension(name)`).
#[derive(Debug, Clone, Copy, Default)]
pub struct Capabilities {
    pub start_tls: bool,
    pub requiretls: bool,
    pub dsn: bool,
    pub smtputf8: bool,
    pub size: Option<usize>,
}

impl Capabilities {
    pub fn from_ehlo(response: &smtp_proto::EhloResponse<String>) -> Self {
        Capabilities {
            start_tls: response.has_capability(smtp_proto::EXT_START_TLS),
            requiretls: response.has_capability(smtp_proto::EXT_REQUIRE_TLS),
            dsn: response.has_capability(smtp_proto::EXT_DSN),
            smtputf8: response.has_capability(smtp_proto::EXT_SMTP_UTF8),
            size: (response.size > 0).then_some(response.size as usize),
        }
    }
}

/// A single SMTP conversation, wrapping `mail_send::SmtpClient` with the
/// reuse bookkeeping spec.md §3 "Connection state" describes: transaction
/// counter, last-use timestamp, sticky error flag.
pub struct Connection<T> {
    pub client: SmtpClient<T>,
    pub hostname: String,
    pub capabilities: Capabilities,
    pub tls_level: TlsLevel,
    /// Highest MX-level asserted by the policy stack for the MX this
    /// connection dialed (spec.md §3 "Connection state"). Carried on the
    /// connection itself so a pooled connection can be reused without
    /// re-running `CheckMX`.
    pub mx_level: MxLevel,
    /// DER chain, leaf first; empty unless `tls_level >= Encrypted`. Fed to
    /// `dane::verify_dane` by `attempt_mx`'s `CheckConn` call.
    pub peer_certificates: Vec<Vec<u8>>,
    pub transactions: usize,
    pub last_use: Instant,
    pub sticky_error: bool,
}

impl<T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin> Connection<T> {
    pub fn new(client: SmtpClient<T>, hostname: String, capabilities: Capabilities, tls_level: TlsLevel) -> Self {
        Connection {
            client,
            hostname,
            capabilities,
            tls_level,
            mx_level: MxLevel::None,
            peer_certificates: Vec::new(),
            transactions: 0,
            last_use: Instant::now(),
            sticky_error: false,
        }
    }

    /// spec.md §4.B "Usable" (for pool return): handshake complete, under
    /// the reuse limit, no sticky error, and a successful RESET probe.
    pub async fn usable(&mut self, reuse_limit: usize) -> bool {
        if self.sticky_error || self.transactions >= reuse_limit {
            return false;
        }
        match self.client.rset().await {
            Ok(()) => true,
            Err(_) => {
                self.sticky_error = true;
                false
            }
        }
    }

    pub async fn mail_from(&mut self, from: &str, require_tls: bool) -> Result<(), DeliveryError> {
        let mut params = Vec::new();
        if require_tls && self.capabilities.requiretls {
            params.push(mail_send::smtp::message::Parameter::RequireTls);
        }
        self.client
            .mail_from(from, &params)
            .await
            .map_err(|err| DeliveryError::from_smtp_error(&self.hostname, "MAIL FROM", err))
            .map(|_| {
                self.transactions += 1;
            })
    }

    pub async fn rcpt_to(&mut self, to: &str) -> Result<(), DeliveryError> {
        self.client
            .rcpt_to(to, &[])
            .await
            .map_err(|err| DeliveryError::from_smtp_error(&self.hostname, "RCPT TO", err))
            .map(|_| ())
    }

    /// spec.md §4.B `Data(header, body)`. MAIL FROM/RCPT TO have already
    /// been issued by [`Connection::mail_from`]/[`Connection::rcpt_to`] (the
    /// orchestrator sends RCPT as each recipient is added, not batched here),
    /// so this is the raw DATA primitive rather than `mail_send`'s
    /// whole-transaction `send_message` helper.
    pub async fn data(&mut self, header: &[u8], body: &[u8], timeout: Duration) -> Result<(), DeliveryError> {
        let mut message = Vec::with_capacity(header.len() + body.len());
        message.extend_from_slice(header);
        message.extend_from_slice(body);
        tokio::time::timeout(timeout, self.client.data(&message))
            .await
            .map_err(|_| DeliveryError::timeout(&self.hostname, "sending DATA"))?
            .map_err(|err| DeliveryError::from_smtp_error(&self.hostname, "DATA", err))
    }

    pub async fn reset(&mut self) -> Result<(), DeliveryError> {
        self.client
            .rset()
            .await
            .map_err(|err| DeliveryError::from_smtp_error(&self.hostname, "RSET", err))
    }

    pub async fn quit(mut self) {
        let _ = self.client.quit().await;
    }
}

/// spec.md §4.B `Connect(host, port, startTLS=false)` + `Hello`: dials over
/// plaintext and sends EHLO. Used directly for the `None`-level rung of
/// `connectPort`'s fallback ladder, and as the first step before an
/// opportunistic STARTTLS attempt.
pub async fn connect_plain(
    hostname: &str,
    addr: SocketAddr,
    local_hostname: &str,
    connect_timeout: Duration,
) -> Result<Connection<TcpStream>, DeliveryError> {
    let client = tokio::time::timeout(
        connect_timeout,
        SmtpClientBuilder::new(hostname, addr.port())
            .helo_host(local_hostname)
            .timeout(connect_timeout)
            .connect_plain(),
    )
    .await
    .map_err(|_| DeliveryError::timeout(hostname, "dialing"))?
    .map_err(|err| DeliveryError::from_smtp_error(hostname, "CONNECT", err))?;

    let capabilities = Capabilities::from_ehlo(client.capabilities());
    Ok(Connection::new(client, hostname.to_string(), capabilities, TlsLevel::None))
}

/// `StartTLS(config)`: dials and opportunistically upgrades if the server
/// advertises the extension. Fails with `mail_send::Error::MissingStartTls`
/// when it doesn't — the caller (`delivery::connect_port`) treats that the
/// same as any other handshake failure and drops straight to plaintext.
///
/// `connector` selects which rung of the ladder this attempt represents:
/// the PKIX-verifying connector for an `Authenticated` attempt, the
/// certificate-blind one for the `Encrypted` retry after a verify failure.
/// Surfaces the raw `mail_send::Error` rather than a `DeliveryError` —
/// `delivery::connect_port`'s fallback ladder needs to distinguish a PKIX
/// chain-verification failure (spec.md §4.H step 3a) from every other
/// handshake error, which [`is_cert_verify_error`] can only do against the
/// unwrapped error.
pub async fn connect_starttls_raw(
    hostname: &str,
    addr: SocketAddr,
    local_hostname: &str,
    connect_timeout: Duration,
    connector: TlsConnector,
) -> Result<Connection<tokio_rustls::client::TlsStream<TcpStream>>, mail_send::Error> {
    let client = tokio::time::timeout(
        connect_timeout,
        SmtpClientBuilder::new(hostname, addr.port())
            .helo_host(local_hostname)
            .timeout(connect_timeout)
            .tls_connector(connector)
            .connect(),
    )
    .await
    .map_err(|_| mail_send::Error::Timeout)??;

    let peer_certificates = client
        .stream()
        .get_ref()
        .1
        .peer_certificates()
        .map(|certs| certs.iter().map(|c| c.as_ref().to_vec()).collect())
        .unwrap_or_default();

    let capabilities = Capabilities::from_ehlo(client.capabilities());
    let mut conn = Connection::new(client, hostname.to_string(), capabilities, TlsLevel::Encrypted);
    conn.peer_certificates = peer_certificates;
    Ok(conn)
}

/// Distinguishes a PKIX chain-verification failure from every other TLS
/// handshake error, per `connectPort` step 3a.
pub fn is_cert_verify_error(err: &mail_send::Error) -> bool {
    matches!(err, mail_send::Error::Tls(tls_err) if matches!(tls_err, rustls::Error::InvalidCertificate(_)))
}

/// Object-safe view of [`Connection`] so the pool (component C) and the
/// orchestrator (component H) can hold a plaintext and a TLS-wrapped
/// connection side by side in one bucket, without a hand-rolled stream enum.
#[async_trait::async_trait]
pub trait Conn: Send {
    fn hostname(&self) -> &str;
    fn tls_level(&self) -> TlsLevel;
    fn mx_level(&self) -> MxLevel;
    fn capabilities(&self) -> Capabilities;
    fn peer_certificates(&self) -> &[Vec<u8>];
    fn set_tls_level(&mut self, level: TlsLevel);
    fn set_mx_level(&mut self, level: MxLevel);

    async fn usable(&mut self, reuse_limit: usize) -> bool;
    async fn mail_from(&mut self, from: &str, require_tls: bool) -> Result<(), DeliveryError>;
    async fn rcpt_to(&mut self, to: &str) -> Result<(), DeliveryError>;
    async fn data(&mut self, header: &[u8], body: &[u8], timeout: Duration) -> Result<(), DeliveryError>;
    async fn reset(&mut self) -> Result<(), DeliveryError>;
    async fn quit(self: Box<Self>);
    /// spec.md §4.B `DirectClose`: drop the socket without a QUIT round-trip,
    /// for `Abort`ing a connection that never issued MAIL FROM.
    async fn direct_close(self: Box<Self>);
    fn is_sticky(&self) -> bool;
}

#[async_trait::async_trait]
impl<T> Conn for Connection<T>
where
    T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send,
{
    fn hostname(&self) -> &str {
        &self.hostname
    }

    fn tls_level(&self) -> TlsLevel {
        self.tls_level
    }

    fn mx_level(&self) -> MxLevel {
        self.mx_level
    }

    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    fn peer_certificates(&self) -> &[Vec<u8>] {
        &self.peer_certificates
    }

    fn set_tls_level(&mut self, level: TlsLevel) {
        self.tls_level = level;
    }

    fn set_mx_level(&mut self, level: MxLevel) {
        self.mx_level = level;
    }

    async fn usable(&mut self, reuse_limit: usize) -> bool {
        Connection::usable(self, reuse_limit).await
    }

    async fn mail_from(&mut self, from: &str, require_tls: bool) -> Result<(), DeliveryError> {
        Connection::mail_from(self, from, require_tls).await
    }

    async fn rcpt_to(&mut self, to: &str) -> Result<(), DeliveryError> {
        Connection::rcpt_to(self, to).await
    }

    async fn data(&mut self, header: &[u8], body: &[u8], timeout: Duration) -> Result<(), DeliveryError> {
        Connection::data(self, header, body, timeout).await
    }

    async fn reset(&mut self) -> Result<(), DeliveryError> {
        Connection::reset(self).await
    }

    async fn quit(mut self: Box<Self>) {
        let _ = self.client.quit().await;
    }

    async fn direct_close(self: Box<Self>) {}

    fn is_sticky(&self) -> bool {
        self.sticky_error
    }
}
