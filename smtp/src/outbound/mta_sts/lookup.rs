/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use std::sync::Arc;

use common::config::resolver::Policy;
use mail_auth::mta_sts::MtaSts;
use utils::HttpLimitResponse;

use crate::core::SMTP;

use super::Error;

/// spec.md §4.D `Get(domain)`. Returns `Ok(None)` for "ignore policy" (no
/// TXT record and nothing cached, or a fetch failure with nothing cached) —
/// the caller treats that the same as MTA-STS never having been configured.
pub async fn get_policy(smtp: &SMTP, domain: &str) -> Result<Option<Arc<Policy>>, Error> {
    let record = match smtp
        .resolvers
        .dns
        .txt_lookup::<MtaSts>(format!("_mta-sts.{domain}."))
        .await
    {
        Ok(record) => record,
        Err(err) => {
            return match smtp.server.inner.cache.dbs_mta_sts.get(domain) {
                Some(cached) => Ok(Some(cached)),
                None => {
                    trc::event!(MtaSts(trc::MtaStsEvent::PolicyIgnored), Domain = domain.to_string());
                    let _ = err;
                    Ok(None)
                }
            };
        }
    };

    if let Some(cached) = smtp.server.inner.cache.dbs_mta_sts.get(domain) {
        if cached.id == record.id {
            return Ok(Some(cached));
        }
    }

    match fetch_and_cache(smtp, domain, &record.id).await {
        Ok(policy) => Ok(Some(policy)),
        Err(err) => {
            if let Some(cached) = smtp.server.inner.cache.dbs_mta_sts.get(domain) {
                trc::event!(MtaSts(trc::MtaStsEvent::PolicyCached), Domain = domain.to_string());
                Ok(Some(cached))
            } else {
                trc::event!(MtaSts(trc::MtaStsEvent::PolicyIgnored), Domain = domain.to_string());
                let _ = err;
                Ok(None)
            }
        }
    }
}

async fn fetch_and_cache(smtp: &SMTP, domain: &str, id: &str) -> Result<Arc<Policy>, Error> {
    let started = std::time::Instant::now();
    let config = &smtp.server.core.smtp.mtasts;

    let response = reqwest::Client::builder()
        .user_agent(common::USER_AGENT)
        .timeout(config.http_timeout)
        .redirect(reqwest::redirect::Policy::none())
        .build()?
        .get(format!("https://mta-sts.{domain}/.well-known/mta-sts.txt"))
        .send()
        .await?;

    let bytes = response
        .bytes_with_limit(config.max_policy_size)
        .await?
        .ok_or(Error::PolicyTooLarge)?;

    let text = std::str::from_utf8(&bytes).map_err(|_| {
        Error::InvalidPolicy(common::config::resolver::MtaStsParseError::InvalidVersion)
    })?;
    let policy = Arc::new(Policy::parse(text, id.to_string()).map_err(Error::InvalidPolicy)?);

    let valid_until = std::time::Instant::now() + std::time::Duration::from_secs(policy.bounded_max_age());
    trc::event!(
        MtaSts(trc::MtaStsEvent::PolicyFetch),
        Domain = domain.to_string(),
        Elapsed = started.elapsed(),
    );

    Ok(smtp
        .server
        .inner
        .cache
        .dbs_mta_sts
        .insert_with_expiry(domain.to_string(), policy, valid_until))
}
