/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! spec.md §8 scenario 2: an MX set whose sole record is the null-MX host
//! `"."` must be rejected permanently (556/5.1.10) before any connection is
//! attempted — no candidate list is ever built.

use std::{sync::Arc, time::Instant};

use common::config::smtp::SmtpConfig;
use mail_auth::MX;
use smtp::{
    core::{Envelope, RecipientAddress, SMTP},
    outbound::{delivery::Delivery, error::DeliveryError, policy::PolicyStackFactory, pool::Pool},
};

use crate::support::{
    self,
    fake_mx::{Behavior, FakeMx},
    DnsCache,
};

#[tokio::test]
async fn null_mx_is_rejected_before_any_connection() {
    let mx = FakeMx::start(Behavior::plain()).await;

    let mut config = SmtpConfig::default();
    config.ports = vec![mx.addr.port()];
    config.mtasts.enable = false;
    config.dane.enable = false;
    config.dnssec.enable = false;
    let smtp: Arc<SMTP> = support::build_smtp(config);

    smtp.mx_add(
        "example.invalid",
        vec![MX {
            exchanges: vec![".".to_string()],
            preference: 0,
        }],
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
        id: "test-2".to_string(),
        mail_from: "sender@source.invalid".to_string(),
        rcpt_to: vec![RecipientAddress::new("rcpt@example.invalid".to_string())],
        require_tls: false,
        quarantine: false,
    };
    let rcpt = envelope.rcpt_to[0].clone();

    let mut delivery = Delivery::start(smtp, pool, &factory, envelope);
    let err = delivery.add_rcpt(0, &rcpt).await.expect_err("null MX must be rejected");
    assert!(err.is_permanent());
    let details = err.error_details().expect("permanent failure carries details");
    assert_eq!(details.smtp_code, 556);
    assert_eq!(details.enhanced_code, (5, 1, 10));

    delivery.abort().await;
    assert!(!mx.contacted(), "a null MX must never be dialed");
}
