/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! Domain normalization at every intake/lookup boundary (spec §9, "IDNA
//! boundary"): ToUnicode, then NFC, then ASCII-lowercase, then strip the
//! trailing dot. DNS queries are always issued against the A-label form;
//! logs may show the U-label form for operator readability.

use unicode_normalization::UnicodeNormalization;

/// Canonical form used for equality comparisons and as a cache/pool key:
/// IDNA ToUnicode, NFC, ASCII-lowercase, no trailing dot.
pub fn canonical(domain: &str) -> String {
    let unicode = idna::domain_to_unicode(domain).0;
    let nfc: String = unicode.nfc().collect();
    nfc.trim_end_matches('.').to_ascii_lowercase()
}

/// A-label (ASCII/Punycode) form suitable for the wire.
pub fn to_ascii(domain: &str) -> Result<String, idna::Errors> {
    idna::domain_to_ascii(domain.trim_end_matches('.'))
}

/// U-label (Unicode) form suitable for logs.
pub fn to_unicode(domain: &str) -> String {
    idna::domain_to_unicode(domain.trim_end_matches('.')).0
}
