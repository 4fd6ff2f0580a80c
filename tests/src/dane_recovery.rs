/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! spec.md §8 scenario 4: a self-signed certificate always fails PKIX
//! verification against `common::Server`'s test-mode connector (built over
//! an empty root store), so the first STARTTLS attempt fails chain
//! verification. `connect_port` retries blind unconditionally on any
//! cert-verify error and lands at `Encrypted`; a DANE-EE TLSA record matching
//! the presented leaf then recovers `Authenticated` — asserted here by
//! setting `local_policy.min_tls_level = Authenticated`, which only a
//! DANE-confirmed connection can satisfy.

use std::{net::Ipv4Addr, sync::Arc, time::Instant};

use common::config::{
    resolver::{Tlsa, TlsaEntry},
    smtp::{SmtpConfig, TlsLevel},
};
use mail_auth::MX;
use sha2::{Digest, Sha256};
use smtp::{
    core::{Envelope, RecipientAddress, SMTP},
    outbound::{delivery::Delivery, policy::PolicyStackFactory, pool::Pool},
};

use crate::support::{
    self,
    fake_mx::{self, Behavior, FakeMx},
    DnsCache,
};

#[tokio::test]
async fn self_signed_cert_recovers_authenticated_via_dane_ee() {
    let (tls_config, leaf_der) = fake_mx::self_signed_tls(vec!["mx1.dane.invalid".to_string()]);
    let mx = FakeMx::start(Behavior::with_tls(tls_config)).await;

    let mut config = SmtpConfig::default();
    config.ports = vec![mx.addr.port()];
    config.mtasts.enable = false;
    config.dnssec.enable = false;
    config.dane.enable = true;
    config.local_policy.min_tls_level = TlsLevel::Authenticated;
    let smtp: Arc<SMTP> = support::build_smtp(config);

    smtp.mx_add(
        "dane.invalid",
        vec![MX {
            exchanges: vec!["mx1.dane.invalid".to_string()],
            preference: 10,
        }],
        Instant::now() + std::time::Duration::from_secs(60),
    );
    smtp.ipv4_add("mx1.dane.invalid", vec![Ipv4Addr::LOCALHOST], Instant::now() + std::time::Duration::from_secs(60));
    smtp.tlsa_add(
        "_25._tcp.mx1.dane.invalid",
        Arc::new(Tlsa {
            entries: vec![TlsaEntry {
                is_end_entity: true,
                is_sha256: true,
                is_spki: false,
                data: Sha256::digest(&leaf_der).to_vec(),
            }],
            has_end_entities: true,
            has_intermediates: false,
        }),
        Instant::now() + std::time::Duration::from_secs(60),
    );

    let pool = Arc::new(Pool::new(
        smtp.server.core.smtp.pool.max_keys,
        smtp.server.core.smtp.pool.max_conns_per_key,
        smtp.server.core.smtp.pool.max_conn_lifetime,
        smtp.server.core.smtp.pool.stale_key_lifetime,
        smtp.server.core.smtp.pool.max_requests,
    ));
    let factory = PolicyStackFactory::new(smtp.clone(), support::no_preload());

    let envelope = Envelope {
        id: "test-4".to_string(),
        mail_from: "sender@source.invalid".to_string(),
        rcpt_to: vec![RecipientAddress::new("rcpt@dane.invalid".to_string())],
        require_tls: false,
        quarantine: false,
    };
    let rcpt = envelope.rcpt_to[0].clone();

    let mut delivery = Delivery::start(smtp, pool, &factory, envelope);
    delivery
        .add_rcpt(0, &rcpt)
        .await
        .expect("DANE-EE should recover Authenticated past the failed PKIX verification, satisfying the local policy floor");
    let result = delivery.body(Arc::from(b"Subject: hi\r\n\r\n".as_slice()), Arc::from(b"body\r\n".as_slice())).await;
    assert!(result.is_ok(), "DATA should succeed over the DANE-authenticated TLS session");
    delivery.commit().await;

    assert!(mx.contacted());
}

#[tokio::test]
async fn without_a_matching_tlsa_record_the_local_policy_floor_rejects_it() {
    let (tls_config, _leaf_der) = fake_mx::self_signed_tls(vec!["mx1.dane.invalid".to_string()]);
    let mx = FakeMx::start(Behavior::with_tls(tls_config)).await;

    let mut config = SmtpConfig::default();
    config.ports = vec![mx.addr.port()];
    config.mtasts.enable = false;
    config.dnssec.enable = false;
    // DANE disabled outright: `tlsa_lookup` then short-circuits to `Ok(None)`
    // before ever consulting the live resolver, so this case stays
    // deterministic without depending on real DNS behavior for `.invalid`.
    config.dane.enable = false;
    config.local_policy.min_tls_level = TlsLevel::Authenticated;
    let smtp: Arc<SMTP> = support::build_smtp(config);

    smtp.mx_add(
        "dane.invalid",
        vec![MX {
            exchanges: vec!["mx1.dane.invalid".to_string()],
            preference: 10,
        }],
        Instant::now() + std::time::Duration::from_secs(60),
    );
    smtp.ipv4_add("mx1.dane.invalid", vec![Ipv4Addr::LOCALHOST], Instant::now() + std::time::Duration::from_secs(60));
    // No TLSA record seeded and DANE disabled: the handshake still recovers
    // `Encrypted` via the blind fallback, but nothing promotes it further.

    let pool = Arc::new(Pool::new(
        smtp.server.core.smtp.pool.max_keys,
        smtp.server.core.smtp.pool.max_conns_per_key,
        smtp.server.core.smtp.pool.max_conn_lifetime,
        smtp.server.core.smtp.pool.stale_key_lifetime,
        smtp.server.core.smtp.pool.max_requests,
    ));
    let factory = PolicyStackFactory::new(smtp.clone(), support::no_preload());

    let envelope = Envelope {
        id: "test-4b".to_string(),
        mail_from: "sender@source.invalid".to_string(),
        rcpt_to: vec![RecipientAddress::new("rcpt@dane.invalid".to_string())],
        require_tls: false,
        quarantine: false,
    };
    let rcpt = envelope.rcpt_to[0].clone();

    let mut delivery = Delivery::start(smtp, pool, &factory, envelope);
    let err = delivery.add_rcpt(0, &rcpt).await.expect_err("the local policy floor should reject a merely Encrypted session");
    assert!(err.is_temporary());
    let details = err.error_details().expect("temporary failure carries details");
    assert_eq!(details.smtp_code, 451);

    delivery.abort().await;
}
