/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! Outbound delivery scenarios (spec.md §8). Each module below drives a full
//! `Delivery` against one or more loopback `support::fake_mx::FakeMx`
//! instances, with DNS/TLSA/MTA-STS state seeded directly into `common`'s
//! caches via `support::DnsCache` rather than hitting a real resolver.

pub mod support;

mod dane_recovery;
mod mta_sts_mismatch;
mod null_mx;
mod plain_delivery;
mod requiretls_denied;
