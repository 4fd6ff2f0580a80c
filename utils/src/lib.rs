/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

pub mod cache;
pub mod http;
pub mod idna;

pub use cache::{Cache, CacheItemWeight, CacheWithTtl};
pub use http::HttpLimitResponse;
