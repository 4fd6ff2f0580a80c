/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! Size-capped response bodies, used by the MTA-STS policy fetch and the
//! STARTTLS-Everywhere preload list download to bound memory use against a
//! malicious or misconfigured server.

use bytes::{Bytes, BytesMut};
use futures::StreamExt;

pub trait HttpLimitResponse {
    /// Reads the response body, returning `Ok(None)` if it would exceed
    /// `limit` bytes rather than buffering past it.
    fn bytes_with_limit(
        self,
        limit: usize,
    ) -> impl std::future::Future<Output = reqwest::Result<Option<Bytes>>> + Send;
}

impl HttpLimitResponse for reqwest::Response {
    async fn bytes_with_limit(self, limit: usize) -> reqwest::Result<Option<Bytes>> {
        if self.content_length().is_some_and(|len| len > limit as u64) {
            return Ok(None);
        }

        let mut buf = BytesMut::new();
        let mut stream = self.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            if buf.len() + chunk.len() > limit {
                return Ok(None);
            }
            buf.extend_from_slice(&chunk);
        }
        Ok(Some(buf.freeze()))
    }
}
