/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! spec.md §8 scenario 1: a single plaintext MX, full EHLO/MAIL/RCPT/DATA
//! transcript.

use std::{net::Ipv4Addr, sync::Arc, time::Instant};

use common::config::smtp::SmtpConfig;
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

fn no_network_config(port: u16) -> SmtpConfig {
    let mut config = SmtpConfig::default();
    config.ports = vec![port];
    config.mtasts.enable = false;
    config.dane.enable = false;
    config.dnssec.enable = false;
    config
}

#[tokio::test]
async fn plain_mx_delivery_round_trips_a_full_transaction() {
    let mx = FakeMx::start(Behavior::plain()).await;
    let smtp: Arc<SMTP> = support::build_smtp(no_network_config(mx.addr.port()));

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
        id: "test-1".to_string(),
        mail_from: "sender@source.invalid".to_string(),
        rcpt_to: vec![RecipientAddress::new("rcpt@example.invalid".to_string())],
        require_tls: false,
        quarantine: false,
    };
    let rcpt = envelope.rcpt_to[0].clone();

    let mut delivery = Delivery::start(smtp, pool, &factory, envelope);
    delivery.add_rcpt(0, &rcpt).await.expect("RCPT TO should be accepted");
    let result = delivery.body(Arc::from(b"Subject: hi\r\n\r\n".as_slice()), Arc::from(b"body\r\n".as_slice())).await;
    assert!(result.is_ok(), "DATA should succeed");
    delivery.commit().await;

    let transcripts = mx.transcripts();
    assert_eq!(transcripts.len(), 1);
    assert_eq!(transcripts[0].mail_from.as_deref(), Some("sender@source.invalid"));
    assert_eq!(transcripts[0].rcpt_to, vec!["rcpt@example.invalid".to_string()]);
    assert!(transcripts[0].data.as_deref().unwrap_or_default().ends_with(b"body\r\n"));
}
