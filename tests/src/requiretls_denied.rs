/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! spec.md §8 scenario 6: a `RequireTLS` envelope against an MX that
//! advertises neither STARTTLS nor REQUIRETLS at all. With
//! `local_policy.relax_requiretls` left at its default (`false`), the
//! cross-check in `new_domain_connection` must deny the recipient with a
//! permanent 550/5.7.30 before any RCPT/DATA is attempted, and — since a
//! `RequireTLS` delivery bypasses the pool entirely (spec.md §4.C "Safety
//! rule") — the pool bucket for this domain must stay empty.

use std::{net::Ipv4Addr, sync::Arc, time::Instant};

use mail_auth::MX;
use smtp::{
    core::{Envelope, RecipientAddress, SMTP},
    outbound::{delivery::Delivery, policy::PolicyStackFactory, pool::Pool},
};

use crate::support::{
    self,
    fake_mx::{Behavior, FakeMx},
    DnsCache,
};

#[tokio::test]
async fn requiretls_is_denied_against_a_host_with_no_tls_support() {
    let mx = FakeMx::start(Behavior::plain()).await;

    let mut config = common::config::smtp::SmtpConfig::default();
    config.ports = vec![mx.addr.port()];
    config.mtasts.enable = false;
    config.dane.enable = false;
    config.dnssec.enable = false;
    let smtp: Arc<SMTP> = support::build_smtp(config);

    smtp.mx_add(
        "example.invalid",
        vec![MX {
            exchanges: vec!["mx1.example.invalid".to_string()],
            preference: 10,
        }],
        Instant::now() + std::time::Duration::from_secs(60),
    );
    smtp.ipv4_add("mx1.example.invalid", vec![Ipv4Addr::LOCALHOST], Instant::now() + std::time::Duration::from_secs(60));

    let pool = Arc::new(Pool::new(
        smtp.server.core.smtp.pool.max_keys,
        smtp.server.core.smtp.pool.max_conns_per_key,
        smtp.server.core.smtp.pool.max_conn_lifetime,
        smtp.server.core.smtp.pool.stale_key_lifetime,
        smtp.server.core.smtp.pool.max_requests,
    ));
    let factory = PolicyStackFactory::new(smtp.clone(), support::no_preload());

    let envelope = Envelope {
        id: "test-6".to_string(),
        mail_from: "sender@source.invalid".to_string(),
        rcpt_to: vec![RecipientAddress::new("rcpt@example.invalid".to_string())],
        require_tls: true,
        quarantine: false,
    };
    let rcpt = envelope.rcpt_to[0].clone();

    let mut delivery = Delivery::start(smtp, pool.clone(), &factory, envelope);
    let err = delivery
        .add_rcpt(0, &rcpt)
        .await
        .expect_err("REQUIRETLS must be denied against a host with no TLS support at all");
    assert!(err.is_permanent());
    let details = err.error_details().expect("permanent failure carries details");
    assert_eq!(details.smtp_code, 550);
    assert_eq!(details.enhanced_code, (5, 7, 30));

    delivery.abort().await;

    let key = smtp::outbound::pool::Key {
        domain: "example.invalid".to_string(),
        require_tls: true,
    };
    assert!(pool.get(&key).await.is_none(), "a RequireTLS delivery must never populate the pool");
}
