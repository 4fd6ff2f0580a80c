/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! The security-level vocabulary of spec.md §3/§4.I. `MxLevel` and
//! `TlsLevel` live in `common::config::smtp` (so the plain-data config
//! surface can name them as floors); this module only re-exports them
//! alongside the merge helper the policy stack (component G) uses.

pub use common::config::smtp::{LocalPolicyConfig, MxLevel, TlsLevel};

/// The merged level for an axis is the maximum asserted by any policy in the
/// stack (spec.md §3 "MX-level lattice"/"TLS-level lattice").
pub fn merge_mx_level(current: MxLevel, upgrade: MxLevel) -> MxLevel {
    current.max(upgrade)
}

pub fn merge_tls_level(current: TlsLevel, upgrade: TlsLevel) -> TlsLevel {
    current.max(upgrade)
}
