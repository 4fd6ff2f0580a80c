/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! spec.md §8 scenario 3: MTA-STS in `enforce` mode rejects an MX that
//! doesn't match the cached policy's `mx` patterns, then falls through to
//! try the next candidate in preference order. The recipient domain lives
//! under the `.invalid` TLD (RFC 2606) so `mta_sts::get_policy`'s live TXT
//! lookup is guaranteed to fail, exercising the RFC 8461 §8.4 survival rule:
//! the non-expired policy seeded below is kept rather than discarded.

use std::{net::Ipv4Addr, sync::Arc, time::Instant};

use common::config::{resolver::PolicyMode, smtp::SmtpConfig};
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
async fn mismatched_mx_is_skipped_in_favor_of_the_next_candidate() {
    let wrong_mx = FakeMx::start(Behavior::plain()).await;
    let right_mx = FakeMx::start(Behavior::plain()).await;

    // `wrong.example.invalid`'s MTA-STS check fails before `resolve_addr` or
    // any port is ever tried, so only the matching MX's port needs to be
    // configured — leaving it off `wrong_mx` entirely avoids the two
    // loopback listeners colliding on each other's port.
    let mut config = SmtpConfig::default();
    config.ports = vec![right_mx.addr.port()];
    config.mtasts.enable = true;
    config.dane.enable = false;
    config.dnssec.enable = false;
    let smtp: Arc<SMTP> = support::build_smtp(config);

    smtp.mx_add(
        "example.invalid",
        vec![
            MX {
                exchanges: vec!["wrong.example.invalid".to_string()],
                preference: 10,
            },
            MX {
                exchanges: vec!["right.example.invalid".to_string()],
                preference: 20,
            },
        ],
        Instant::now() + std::time::Duration::from_secs(60),
    );
    smtp.ipv4_add(
        "wrong.example.invalid",
        vec![Ipv4Addr::LOCALHOST],
        Instant::now() + std::time::Duration::from_secs(60),
    );
    smtp.ipv4_add(
        "right.example.invalid",
        vec![Ipv4Addr::LOCALHOST],
        Instant::now() + std::time::Duration::from_secs(60),
    );
    smtp.mta_sts_policy_add(
        "example.invalid",
        common::config::resolver::Policy {
            id: "policy1".to_string(),
            mode: PolicyMode::Enforce,
            mx: vec!["right.example.invalid".to_string()],
            max_age: 86_400,
        },
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
        id: "test-3".to_string(),
        mail_from: "sender@source.invalid".to_string(),
        rcpt_to: vec![RecipientAddress::new("rcpt@example.invalid".to_string())],
        require_tls: false,
        quarantine: false,
    };
    let rcpt = envelope.rcpt_to[0].clone();

    let mut delivery = Delivery::start(smtp, pool, &factory, envelope);
    delivery.add_rcpt(0, &rcpt).await.expect("right.example.invalid should still accept delivery");
    let result = delivery.body(Arc::from(b"Subject: hi\r\n\r\n".as_slice()), Arc::from(b"body\r\n".as_slice())).await;
    assert!(result.is_ok(), "DATA should succeed against the matching MX");
    delivery.commit().await;

    assert!(!wrong_mx.contacted(), "the MTA-STS-rejected MX must never be dialed");
    assert!(right_mx.contacted(), "the matching MX must receive the delivery");
}
