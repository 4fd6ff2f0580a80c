/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! A minimal loopback SMTP server standing in for a remote MX. Reads one
//! byte at a time rather than through a `BufReader` so a plaintext EHLO/
//! STARTTLS preamble can hand the raw socket off to `tokio_rustls` mid-
//! connection without risking the line reader having already buffered bytes
//! that belong to the TLS handshake.

use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::{Arc, Mutex},
};

use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::{TcpListener, TcpStream},
};
use tokio_rustls::TlsAcceptor;

#[derive(Debug, Clone, Default)]
pub struct Transcript {
    pub mail_from: Option<String>,
    pub rcpt_to: Vec<String>,
    pub data: Option<Vec<u8>>,
}

pub enum RcptOutcome {
    Accept,
    Reject(u16, &'static str),
}

#[derive(Clone)]
pub struct Behavior {
    pub tls: Option<Arc<rustls::ServerConfig>>,
    pub requiretls: bool,
    pub rcpt: Arc<dyn Fn(&str) -> RcptOutcome + Send + Sync>,
}

impl Behavior {
    pub fn plain() -> Self {
        Behavior {
            tls: None,
            requiretls: false,
            rcpt: Arc::new(|_| RcptOutcome::Accept),
        }
    }

    pub fn with_tls(tls: Arc<rustls::ServerConfig>) -> Self {
        Behavior {
            tls: Some(tls),
            requiretls: false,
            rcpt: Arc::new(|_| RcptOutcome::Accept),
        }
    }

    pub fn rejecting_rcpt(mut self, rejected: &'static str, code: u16, message: &'static str) -> Self {
        self.rcpt = Arc::new(move |addr| {
            if addr.eq_ignore_ascii_case(rejected) {
                RcptOutcome::Reject(code, message)
            } else {
                RcptOutcome::Accept
            }
        });
        self
    }
}

/// A running fake MX. Every accepted connection is recorded as one
/// [`Transcript`]; scenarios that must prove "no TCP attempt was made"
/// assert `contacted() == false` instead of inspecting the transcript list.
pub struct FakeMx {
    pub addr: SocketAddr,
    transcripts: Arc<Mutex<Vec<Transcript>>>,
}

impl FakeMx {
    pub async fn start(behavior: Behavior) -> Self {
        Self::start_on(IpAddr::V4(Ipv4Addr::LOCALHOST), behavior).await
    }

    /// As [`start`](Self::start), but on a caller-chosen loopback address —
    /// the whole `127.0.0.0/8` range is loopback, so a scenario juggling
    /// several fake MXes at once can give each its own address instead of
    /// relying on `config.ports`' shared, tried-in-order port list to route
    /// correctly between listeners that would otherwise all sit on
    /// `127.0.0.1`.
    pub async fn start_on(addr: IpAddr, behavior: Behavior) -> Self {
        let listener = TcpListener::bind((addr, 0)).await.expect("bind fake MX listener");
        let addr = listener.local_addr().expect("fake MX local addr");
        let transcripts = Arc::new(Mutex::new(Vec::new()));
        let transcripts_task = transcripts.clone();

        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                let behavior = behavior.clone();
                let transcripts = transcripts_task.clone();
                tokio::spawn(async move {
                    handle_conn(stream, behavior, transcripts).await;
                });
            }
        });

        FakeMx { addr, transcripts }
    }

    pub fn transcripts(&self) -> Vec<Transcript> {
        self.transcripts.lock().unwrap().clone()
    }

    pub fn contacted(&self) -> bool {
        !self.transcripts.lock().unwrap().is_empty()
    }
}

/// Generates a self-signed certificate for `names` and a `rustls::ServerConfig`
/// presenting it; returns the leaf certificate's raw DER alongside so a test
/// can seed a matching DANE-EE TLSA record (spec.md §4.F, full-certificate
/// matching: selector 0, i.e. `is_spki = false`).
pub fn self_signed_tls(names: Vec<String>) -> (Arc<rustls::ServerConfig>, Vec<u8>) {
    let rcgen::CertifiedKey { cert, key_pair } = rcgen::generate_simple_self_signed(names).expect("generate self-signed cert");
    let cert_der = cert.der().to_vec();
    let key_der = rustls_pki_types::PrivatePkcs8KeyDer::from(key_pair.serialize_der());

    let server_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(
            vec![rustls_pki_types::CertificateDer::from(cert_der.clone())],
            rustls_pki_types::PrivateKeyDer::Pkcs8(key_der),
        )
        .expect("build fake MX tls config");

    (Arc::new(server_config), cert_der)
}

async fn handle_conn(mut stream: TcpStream, behavior: Behavior, transcripts: Arc<Mutex<Vec<Transcript>>>) {
    write_line(&mut stream, "220 fakemx.invalid ESMTP").await;

    if read_line(&mut stream).await.is_none() {
        return;
    }
    write_ehlo(&mut stream, behavior.tls.is_some(), behavior.requiretls).await;

    if let Some(tls_config) = behavior.tls.clone() {
        if read_line(&mut stream).await.is_none() {
            return;
        }
        write_line(&mut stream, "220 ready to start TLS").await;
        let acceptor = TlsAcceptor::from(tls_config);
        if let Ok(tls_stream) = acceptor.accept(stream).await {
            run_transaction(tls_stream, behavior, transcripts, true).await;
        }
    } else {
        run_transaction(stream, behavior, transcripts, false).await;
    }
}

async fn run_transaction<S: AsyncRead + AsyncWrite + Unpin>(
    mut stream: S,
    behavior: Behavior,
    transcripts: Arc<Mutex<Vec<Transcript>>>,
    post_starttls: bool,
) {
    if post_starttls {
        if read_line(&mut stream).await.is_none() {
            return;
        }
        write_ehlo(&mut stream, false, behavior.requiretls).await;
    }

    let mut transcript = Transcript::default();
    loop {
        let Some(line) = read_line(&mut stream).await else {
            break;
        };
        let upper = line.to_ascii_uppercase();

        if let Some(addr) = strip_command(&upper, &line, "MAIL FROM:") {
            transcript.mail_from = Some(addr.to_string());
            write_line(&mut stream, "250 2.1.0 OK").await;
        } else if let Some(addr) = strip_command(&upper, &line, "RCPT TO:") {
            match (behavior.rcpt)(addr) {
                RcptOutcome::Accept => {
                    transcript.rcpt_to.push(addr.to_string());
                    write_line(&mut stream, "250 2.1.5 OK").await;
                }
                RcptOutcome::Reject(code, message) => {
                    write_line(&mut stream, &format!("{code} {message}")).await;
                }
            }
        } else if upper.starts_with("DATA") {
            write_line(&mut stream, "354 go ahead").await;
            transcript.data = Some(read_data(&mut stream).await);
            write_line(&mut stream, "250 2.0.0 OK: queued").await;
        } else if upper.starts_with("RSET") {
            write_line(&mut stream, "250 2.0.0 OK").await;
        } else if upper.starts_with("QUIT") {
            write_line(&mut stream, "221 2.0.0 bye").await;
            break;
        } else {
            write_line(&mut stream, "500 5.5.1 unrecognized command").await;
        }
    }

    transcripts.lock().unwrap().push(transcript);
}

fn strip_command<'a>(upper: &str, original: &'a str, prefix: &str) -> Option<&'a str> {
    if upper.starts_with(prefix) {
        Some(extract_address(original[prefix.len()..].trim()))
    } else {
        None
    }
}

fn extract_address(rest: &str) -> &str {
    if let Some(stripped) = rest.strip_prefix('<') {
        if let Some(end) = stripped.find('>') {
            return &stripped[..end];
        }
    }
    rest.split_whitespace().next().unwrap_or(rest)
}

async fn read_line<S: AsyncRead + Unpin>(stream: &mut S) -> Option<String> {
    let mut buf = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        match stream.read(&mut byte).await {
            Ok(0) | Err(_) => return None,
            Ok(_) => {
                if byte[0] == b'\n' {
                    if buf.last() == Some(&b'\r') {
                        buf.pop();
                    }
                    return Some(String::from_utf8_lossy(&buf).into_owned());
                }
                buf.push(byte[0]);
            }
        }
    }
}

async fn read_data<S: AsyncRead + Unpin>(stream: &mut S) -> Vec<u8> {
    let mut body = Vec::new();
    loop {
        match read_line(stream).await {
            Some(line) if line == "." => break,
            Some(line) => {
                body.extend_from_slice(line.as_bytes());
                body.extend_from_slice(b"\r\n");
            }
            None => break,
        }
    }
    body
}

async fn write_line<S: AsyncWrite + Unpin>(stream: &mut S, line: &str) {
    let _ = stream.write_all(line.as_bytes()).await;
    let _ = stream.write_all(b"\r\n").await;
}

async fn write_ehlo<S: AsyncWrite + Unpin>(stream: &mut S, starttls: bool, requiretls: bool) {
    let _ = stream.write_all(b"250-fakemx.invalid\r\n").await;
    if starttls {
        let _ = stream.write_all(b"250-STARTTLS\r\n").await;
    }
    if requiretls {
        let _ = stream.write_all(b"250-REQUIRETLS\r\n").await;
    }
    let _ = stream.write_all(b"250 8BITMIME\r\n").await;
}
