/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! Component F — DANE evaluator (spec.md §4.F). `dnssec` performs the
//! AD-requiring TLSA lookup at `_25._tcp.<mx>`; `verify` decides whether a
//! presented certificate chain satisfies the returned `Tlsa` record set per
//! RFC 7672 §3.

pub mod dnssec;
pub mod verify;

pub use dnssec::TlsaLookup;
pub use verify::verify_dane;
