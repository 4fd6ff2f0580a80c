/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! Cache value types for the two policy sources that need more than a plain
//! DNS answer: MTA-STS policies (component D) and TLSA record sets
//! (component F). Both are cached with a TTL in `Caches` (see `crate::Caches`)
//! and so must implement `CacheItemWeight`.

use utils::CacheItemWeight;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyMode {
    None,
    Testing,
    Enforce,
}

impl PolicyMode {
    pub fn is_enforcing(&self) -> bool {
        matches!(self, PolicyMode::Enforce)
    }
}

/// A fetched and parsed MTA-STS policy (RFC 8461 §3), plus the DNS id it was
/// fetched against so a later lookup can tell whether the id is stale.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Policy {
    pub id: String,
    pub mode: PolicyMode,
    pub mx: Vec<String>,
    pub max_age: u64,
}

#[derive(Debug)]
pub enum MtaStsParseError {
    MissingField(&'static str),
    InvalidVersion,
    InvalidMode,
    InvalidMaxAge,
}

impl Policy {
    /// Parses an `mta-sts.txt` policy body (RFC 8461 §3.2).
    pub fn parse(text: &str, id: String) -> Result<Self, MtaStsParseError> {
        let mut version_ok = false;
        let mut mode = None;
        let mut max_age = None;
        let mut mx = Vec::new();

        for line in text.lines() {
            let line = line.trim();
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            match key.trim() {
                "version" => version_ok = value.trim() == "STSv1",
                "mode" => {
                    mode = Some(match value.trim() {
                        "enforce" => PolicyMode::Enforce,
                        "testing" => PolicyMode::Testing,
                        "none" => PolicyMode::None,
                        _ => return Err(MtaStsParseError::InvalidMode),
                    })
                }
                "max_age" => {
                    max_age = Some(
                        value
                            .trim()
                            .parse::<u64>()
                            .map_err(|_| MtaStsParseError::InvalidMaxAge)?,
                    )
                }
                "mx" => mx.push(value.trim().to_string()),
                _ => (),
            }
        }

        if !version_ok {
            return Err(MtaStsParseError::InvalidVersion);
        }

        Ok(Policy {
            id,
            mode: mode.ok_or(MtaStsParseError::MissingField("mode"))?,
            mx,
            max_age: max_age.ok_or(MtaStsParseError::MissingField("max_age"))?,
        })
    }

    /// RFC 8461 §4.1: a single leading `*` in an MX pattern matches exactly
    /// one DNS label; any other wildcard use is invalid and never matches.
    pub fn matches_mx(&self, mx: &str) -> bool {
        self.mx.iter().any(|pattern| matches_pattern(pattern, mx))
    }

    /// Bounds `max_age` into the sane range the teacher's lookup path uses:
    /// 1 hour to 1 year, defaulting to 1 day when the parsed value is absurd.
    pub fn bounded_max_age(&self) -> u64 {
        const MIN: u64 = 3600;
        const MAX: u64 = 31_557_600;
        const DEFAULT: u64 = 86_400;
        if (MIN..MAX).contains(&self.max_age) {
            self.max_age
        } else {
            DEFAULT
        }
    }
}

fn matches_pattern(pattern: &str, host: &str) -> bool {
    match pattern.strip_prefix("*.") {
        Some(suffix) => {
            if !pattern[2..].contains('*') {
                host.strip_suffix(suffix)
                    .and_then(|prefix| prefix.strip_suffix('.'))
                    .is_some_and(|label| !label.is_empty() && !label.contains('.'))
            } else {
                false
            }
        }
        None => !pattern.contains('*') && pattern.eq_ignore_ascii_case(host),
    }
}

impl CacheItemWeight for Policy {
    fn weight(&self) -> u64 {
        (std::mem::size_of::<Policy>()
            + self.id.len()
            + self.mx.iter().map(String::len).sum::<usize>()) as u64
    }
}

/// A DANE TLSA record, reduced to what `dane::verify` needs once usage 0/1
/// have been filtered out (spec.md §3 "the evaluator treats only usage in
/// {2,3}... as usable").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TlsaEntry {
    /// `true` for usage 3 (DANE-EE), `false` for usage 2 (DANE-TA).
    pub is_end_entity: bool,
    /// matching-type: `true` = sha256 (1), `false` = sha512 (2); meaningless
    /// when `is_spki` is false and selector is full-certificate matching (0).
    pub is_sha256: bool,
    /// selector: `true` = SubjectPublicKeyInfo (1), `false` = full cert (0).
    pub is_spki: bool,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Default)]
pub struct Tlsa {
    pub entries: Vec<TlsaEntry>,
    pub has_end_entities: bool,
    pub has_intermediates: bool,
}

impl CacheItemWeight for Tlsa {
    fn weight(&self) -> u64 {
        (std::mem::size_of::<Tlsa>()
            + self
                .entries
                .iter()
                .map(|e| std::mem::size_of::<TlsaEntry>() + e.data.len())
                .sum::<usize>()) as u64
    }
}

/// One domain's entry in the STARTTLS-Everywhere preload snapshot
/// (component E); shares `PolicyMode`/pattern semantics with MTA-STS.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct PreloadEntry {
    pub mode: PolicyMode,
    #[serde(default)]
    pub mxs: Vec<String>,
}

impl PreloadEntry {
    pub fn matches_mx(&self, mx: &str) -> bool {
        self.mxs.iter().any(|pattern| matches_pattern(pattern, mx))
    }
}

/// The preload snapshot as a whole (spec.md §3 "STS preload list"); the
/// `timestamp`/`expires` pair is what `sts_preload` checks before accepting
/// a newly downloaded snapshot and before every lookup.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct PreloadList {
    pub timestamp: u64,
    pub expires: u64,
    #[serde(default)]
    pub version: String,
    pub policies: ahash::AHashMap<String, PreloadEntry>,
}

impl PreloadList {
    pub fn is_expired(&self, now_unix: u64) -> bool {
        now_unix >= self.expires
    }

    /// A freshly downloaded list is only accepted if it is not itself
    /// expired and is not older than what we already have (spec.md §4.E).
    pub fn is_newer_than(&self, current: &PreloadList) -> bool {
        self.timestamp > current.timestamp
    }
}
