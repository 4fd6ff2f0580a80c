/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use std::sync::Arc;

use crate::core::SMTP;

/// spec.md §4.D refresh: "a background task walks cached domains and issues
/// Get, ignoring results, periodically (half of typical max_age; ~12h is
/// safe)." `domains` is supplied by the caller (the orchestrator tracks
/// which domains currently have a cached policy; this module has no
/// iteration primitive over the cache itself).
pub async fn refresh_task(smtp: Arc<SMTP>, domains: impl Fn() -> Vec<String> + Send + 'static) {
    let interval = smtp.server.core.smtp.mtasts.refresh_interval;
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        for domain in domains() {
            let _ = super::get_policy(&smtp, &domain).await;
        }
    }
}
