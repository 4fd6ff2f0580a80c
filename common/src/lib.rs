/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use std::{
    hash::{BuildHasher, Hasher},
    net::{IpAddr, Ipv4Addr, Ipv6Addr},
    sync::Arc,
};

use arc_swap::ArcSwap;
use mail_auth::{Txt, MX};
use tokio_rustls::TlsConnector;
use utils::{Cache, CacheWithTtl};

use config::{
    resolver::{Policy, Tlsa},
    SmtpConfig,
};

pub mod config;

pub static USER_AGENT: &str = concat!("outbound-delivery/", env!("CARGO_PKG_VERSION"));

/// Shared handle every outbound subsystem is implemented against as an
/// extension trait (`impl TlsaLookup for Server`, `impl MtaStsLookup for
/// Server`, ...), so components can be written as free functions over `&self`
/// without threading every cache and connector through each call.
#[derive(Clone)]
pub struct Server {
    pub inner: Arc<Inner>,
    pub core: Arc<Core>,
}

pub struct Inner {
    /// Swapped wholesale on a config reload; `core` above is a snapshot taken
    /// at `Server` construction time, `shared_core` is the live pointer.
    pub shared_core: ArcSwap<Core>,
    pub data: Data,
    pub cache: Caches,
}

pub struct Data {
    pub smtp_connectors: TlsConnectors,
}

/// The two resolver-plane caches, plus the two policy caches (MTA-STS and
/// STARTTLS-Everywhere's own lookups run through `dns_mx`/`dns_txt` too).
/// Every cache is weight-bounded (see `utils::cache`) rather than
/// item-count-bounded.
pub struct Caches {
    pub dns_txt: CacheWithTtl<String, Txt>,
    pub dns_mx: CacheWithTtl<String, Arc<Vec<MX>>>,
    pub dns_ptr: CacheWithTtl<IpAddr, Arc<Vec<String>>>,
    pub dns_ipv4: CacheWithTtl<String, Arc<Vec<Ipv4Addr>>>,
    pub dns_ipv6: CacheWithTtl<String, Arc<Vec<Ipv6Addr>>>,
    pub dns_tlsa: CacheWithTtl<String, Arc<Tlsa>>,
    pub dbs_mta_sts: CacheWithTtl<String, Arc<Policy>>,
}

pub struct TlsConnectors {
    /// Full PKIX chain verification against the recipient-host SAN.
    pub pki_verify: TlsConnector,
    /// `InsecureSkipVerify` equivalent, used by `connectPort`'s fallback
    /// ladder (spec.md §4.H step 3a) and by DANE-EE, which ignores PKIX.
    pub dummy_verify: TlsConnector,
}

#[derive(Clone, Default)]
pub struct Core {
    pub smtp: SmtpConfig,
}

/// Hashed key for per-domain throttle/limiter maps (component J). Hashing the
/// domain down to a fixed-width key lets the throttle maps use a trivial
/// pass-through hasher (`ThrottleKeyHasher`) instead of re-hashing a `String`
/// on every semaphore acquire.
#[derive(Debug, Clone, Eq)]
pub struct ThrottleKey {
    pub hash: [u8; 32],
}

impl ThrottleKey {
    pub fn for_domain(domain: &str) -> Self {
        use sha2::Digest;
        let mut hasher = sha2::Sha256::new();
        hasher.update(domain.as_bytes());
        ThrottleKey {
            hash: hasher.finalize().into(),
        }
    }
}

impl PartialEq for ThrottleKey {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
    }
}

impl std::hash::Hash for ThrottleKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.hash.hash(state);
    }
}

impl AsRef<[u8]> for ThrottleKey {
    fn as_ref(&self) -> &[u8] {
        &self.hash
    }
}

#[derive(Default)]
pub struct ThrottleKeyHasher {
    hash: u64,
}

impl Hasher for ThrottleKeyHasher {
    fn finish(&self) -> u64 {
        self.hash
    }

    fn write(&mut self, bytes: &[u8]) {
        debug_assert!(
            bytes.len() >= std::mem::size_of::<u64>(),
            "ThrottleKeyHasher: input too short {bytes:?}"
        );
        self.hash = bytes
            .get(0..std::mem::size_of::<u64>())
            .map_or(0, |b| u64::from_ne_bytes(b.try_into().unwrap()));
    }
}

#[derive(Clone, Default)]
pub struct ThrottleKeyHasherBuilder {}

impl BuildHasher for ThrottleKeyHasherBuilder {
    type Hasher = ThrottleKeyHasher;

    fn build_hasher(&self) -> Self::Hasher {
        ThrottleKeyHasher::default()
    }
}

#[cfg(feature = "test_mode")]
impl Default for Server {
    fn default() -> Self {
        Server {
            inner: Arc::new(Inner::default()),
            core: Arc::new(Core::default()),
        }
    }
}

#[cfg(feature = "test_mode")]
impl Default for Inner {
    fn default() -> Self {
        Inner {
            shared_core: ArcSwap::from_pointee(Core::default()),
            data: Data::default(),
            cache: Caches::default(),
        }
    }
}

#[cfg(feature = "test_mode")]
impl Default for Data {
    fn default() -> Self {
        use rustls::ClientConfig;

        let pki_config = ClientConfig::builder()
            .with_root_certificates(rustls::RootCertStore::empty())
            .with_no_client_auth();
        let dummy_config = ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(tls::DummyVerifier))
            .with_no_client_auth();

        Data {
            smtp_connectors: TlsConnectors {
                pki_verify: TlsConnector::from(Arc::new(pki_config)),
                dummy_verify: TlsConnector::from(Arc::new(dummy_config)),
            },
        }
    }
}

#[cfg(feature = "test_mode")]
impl Default for Caches {
    fn default() -> Self {
        Caches {
            dns_txt: CacheWithTtl::new(1024, 10 * 1024 * 1024),
            dns_mx: CacheWithTtl::new(1024, 10 * 1024 * 1024),
            dns_ptr: CacheWithTtl::new(1024, 10 * 1024 * 1024),
            dns_ipv4: CacheWithTtl::new(1024, 10 * 1024 * 1024),
            dns_ipv6: CacheWithTtl::new(1024, 10 * 1024 * 1024),
            dns_tlsa: CacheWithTtl::new(1024, 10 * 1024 * 1024),
            dbs_mta_sts: CacheWithTtl::new(1024, 10 * 1024 * 1024),
        }
    }
}

#[cfg(feature = "test_mode")]
mod tls {
    use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
    use rustls::pki_types::{CertificateDer, ServerName, UnixTime};

    /// Test-only stand-in for the `dummy_verify` connector's real certificate
    /// verifier, which in production accepts any chain (the fallback ladder
    /// relies on the *next* policy stage — e.g. DANE-EE — to restore trust).
    #[derive(Debug)]
    pub struct DummyVerifier;

    impl ServerCertVerifier for DummyVerifier {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: UnixTime,
        ) -> Result<ServerCertVerified, rustls::Error> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &rustls::DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn verify_tls13_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &rustls::DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
            rustls::crypto::ring::default_provider()
                .signature_verification_algorithms
                .supported_schemes()
        }
    }
}
