/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! Structured event logging, trimmed to the events the outbound delivery
//! engine emits. Every suspension point in the engine (DNS query, HTTPS
//! fetch, dial, TLS handshake, SMTP round-trip, pool get/return, policy
//! verdict) reports through [`event!`] rather than ad-hoc `tracing` calls,
//! so a single collector can reconstruct why a delivery took the path it
//! took.

use std::fmt;
use std::time::Duration;

use ahash::AHashMap;
use parking_lot::Mutex;

pub mod fields {
    pub const SPAN_ID: &str = "span_id";
    pub const DOMAIN: &str = "domain";
    pub const MX: &str = "mx";
    pub const HOSTNAME: &str = "hostname";
    pub const DETAILS: &str = "details";
    pub const ELAPSED: &str = "elapsed";
    pub const REASON: &str = "reason";
    pub const COUNT: &str = "count";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone)]
pub enum Value {
    Str(String),
    U64(u64),
    Bool(bool),
    Duration(Duration),
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Str(s) => f.write_str(s),
            Value::U64(n) => write!(f, "{n}"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Duration(d) => write!(f, "{d:?}"),
        }
    }
}

macro_rules! impl_into_value {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for Value {
                fn from(v: $ty) -> Self {
                    Value::$variant(v.into())
                }
            }
        )*
    };
}

impl_into_value!(
    String => Str,
    &str => Str,
    u64 => U64,
    u32 => U64,
    usize => U64,
    bool => Bool,
    Duration => Duration,
);

/// DNS facade events (component A).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DnsEvent {
    Lookup,
    LookupError,
    CacheHit,
}

/// MTA-STS policy cache events (component D).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MtaStsEvent {
    PolicyFetch,
    PolicyCached,
    PolicyIgnored,
    PolicyRefresh,
}

/// STARTTLS-Everywhere preload list events (component E).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StsPreloadEvent {
    ListFetch,
    ListExpired,
    ListStale,
    ListUpdated,
}

/// DANE evaluator events (component F).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaneEvent {
    TlsaLookup,
    AuthenticatedTlsa,
    UnauthenticatedTlsa,
    VerifyOk,
    VerifyFailed,
}

/// Connection pool events (component C).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolEvent {
    Hit,
    Miss,
    Evict,
    Bypass,
}

/// Policy stack events (component G).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyEvent {
    MxLevel,
    TlsLevel,
    Rejected,
}

/// Orchestrator events (component H).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryEvent {
    Attempt,
    AttemptFailed,
    Success,
    PartialFailure,
    StartTlsFallback,
}

/// Limits governor events (component J).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitsEvent {
    Acquired,
    Cancelled,
    Released,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Dns(DnsEvent),
    MtaSts(MtaStsEvent),
    StsPreload(StsPreloadEvent),
    Dane(DaneEvent),
    Pool(PoolEvent),
    Policy(PolicyEvent),
    Delivery(DeliveryEvent),
    Limits(LimitsEvent),
}

impl EventKind {
    pub fn level(&self) -> Level {
        match self {
            EventKind::Dns(DnsEvent::LookupError)
            | EventKind::Delivery(DeliveryEvent::AttemptFailed)
            | EventKind::Dane(DaneEvent::VerifyFailed)
            | EventKind::Limits(LimitsEvent::Cancelled)
            | EventKind::Policy(PolicyEvent::Rejected) => Level::Warn,
            EventKind::Delivery(DeliveryEvent::Success) => Level::Info,
            _ => Level::Debug,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Event {
    pub kind: EventKind,
    pub keys: AHashMap<&'static str, Value>,
}

impl Event {
    pub fn new(kind: EventKind) -> Self {
        Event {
            kind,
            keys: AHashMap::new(),
        }
    }

    pub fn with(mut self, key: &'static str, value: impl Into<Value>) -> Self {
        self.keys.insert(key, value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.keys.get(key)
    }

    fn dispatch(self) {
        match self.kind.level() {
            Level::Trace => tracing::trace!(?self.kind, ?self.keys),
            Level::Debug => tracing::debug!(?self.kind, ?self.keys),
            Level::Info => tracing::info!(?self.kind, ?self.keys),
            Level::Warn => tracing::warn!(?self.kind, ?self.keys),
            Level::Error => tracing::error!(?self.kind, ?self.keys),
        }
        #[cfg(any(test, feature = "test_mode"))]
        COLLECTOR.push(self);
    }
}

/// In-memory sink used by integration tests to assert on emitted events
/// without a real tracing subscriber.
#[cfg(any(test, feature = "test_mode"))]
pub struct Collector {
    events: Mutex<Vec<Event>>,
}

#[cfg(any(test, feature = "test_mode"))]
impl Collector {
    const fn new() -> Self {
        Collector {
            events: Mutex::new(Vec::new()),
        }
    }

    fn push(&self, event: Event) {
        self.events.lock().push(event);
    }

    pub fn drain(&self) -> Vec<Event> {
        std::mem::take(&mut *self.events.lock())
    }
}

#[cfg(any(test, feature = "test_mode"))]
pub static COLLECTOR: Collector = Collector::new();

#[doc(hidden)]
pub fn __build_event(kind: EventKind, fields: &[(&'static str, Value)]) -> Event {
    let mut event = Event::new(kind);
    for (key, value) in fields {
        event.keys.insert(key, value.clone());
    }
    event
}

/// Builds a structured [`Event`] and dispatches it to `tracing` (and, in
/// tests, the in-memory [`COLLECTOR`]).
///
/// ```ignore
/// trc::event!(MtaSts(trc::MtaStsEvent::PolicyFetch),
///     Domain = domain.to_string(),
///     Elapsed = started.elapsed(),
/// );
/// ```
#[macro_export]
macro_rules! event {
    ($kind:ident($inner:expr) $(, $field:ident = $value:expr)* $(,)?) => {{
        let event = $crate::Event::new($crate::EventKind::$kind($inner))
            $(.with($crate::stringify_field!($field), $value))*;
        $crate::dispatch(event);
    }};
}

#[macro_export]
macro_rules! stringify_field {
    (SpanId) => {
        $crate::fields::SPAN_ID
    };
    (Domain) => {
        $crate::fields::DOMAIN
    };
    (Mx) => {
        $crate::fields::MX
    };
    (Hostname) => {
        $crate::fields::HOSTNAME
    };
    (Details) => {
        $crate::fields::DETAILS
    };
    (Elapsed) => {
        $crate::fields::ELAPSED
    };
    (Reason) => {
        $crate::fields::REASON
    };
    (Count) => {
        $crate::fields::COUNT
    };
}

pub fn dispatch(event: Event) {
    event.dispatch();
}
