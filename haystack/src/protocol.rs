//! Wire-level event payloads.
//!
//! Events are immutable once built: the client copies scope state onto them at
//! capture time and from then on they only move toward the transport.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::cron::CheckInEvent;
use crate::trace::{SpanData, TraceContext, TransactionSource};

/// Arbitrary structured values keyed by name, used for extra context,
/// contexts and user identity.
pub type Map = serde_json::Map<String, Value>;

/// Severity of an error-kind event or breadcrumb.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Debug,
    Info,
    #[default]
    Warning,
    Error,
    Fatal,
}

/// Identification of the SDK that produced an event.
#[derive(Clone, Debug, Serialize)]
pub struct SdkInfo {
    pub name: &'static str,
    pub version: &'static str,
}

pub(crate) fn sdk_info() -> SdkInfo {
    SdkInfo {
        name: crate::SDK_NAME,
        version: env!("CARGO_PKG_VERSION"),
    }
}

/// A single entry in an exception chain, outermost error last.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Exception {
    #[serde(rename = "type")]
    pub ty: String,
    pub value: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub module: Option<String>,
}

/// Homogeneous list rendered as `{"values": [...]}` on the wire.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Values<T> {
    pub values: Vec<T>,
}

// derived `Default` would needlessly bound `T: Default`
impl<T> Default for Values<T> {
    fn default() -> Self {
        Values { values: Vec::new() }
    }
}

impl<T> Values<T> {
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// An error- or message-kind event.
#[derive(Clone, Debug, Serialize)]
pub struct ErrorEvent {
    pub event_id: Uuid,
    pub timestamp: f64,
    pub platform: &'static str,
    pub sdk: SdkInfo,
    pub level: Level,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Values::is_empty")]
    pub exception: Values<Exception>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub release: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub environment: Option<String>,
    #[serde(skip_serializing_if = "std::collections::BTreeMap::is_empty")]
    pub tags: std::collections::BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Map::is_empty")]
    pub extra: Map,
    #[serde(skip_serializing_if = "Map::is_empty")]
    pub contexts: Map,
    #[serde(skip_serializing_if = "Map::is_empty")]
    pub user: Map,
    #[serde(skip_serializing_if = "Values::is_empty")]
    pub breadcrumbs: Values<crate::breadcrumb::Breadcrumb>,
}

impl ErrorEvent {
    pub(crate) fn new(level: Level) -> Self {
        ErrorEvent {
            event_id: Uuid::new_v4(),
            timestamp: crate::util::unix_timestamp(),
            platform: "rust",
            sdk: sdk_info(),
            level,
            message: None,
            exception: Values::default(),
            transaction: None,
            release: None,
            environment: None,
            tags: Default::default(),
            extra: Map::new(),
            contexts: Map::new(),
            user: Map::new(),
            breadcrumbs: Values::default(),
        }
    }
}

/// Name metadata attached to a transaction payload.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TransactionInfo {
    pub source: TransactionSource,
}

/// A finished transaction with its recorded child spans.
#[derive(Clone, Debug, Serialize)]
pub struct TransactionEvent {
    pub event_id: Uuid,
    #[serde(rename = "type")]
    pub ty: &'static str,
    pub platform: &'static str,
    pub sdk: SdkInfo,
    pub transaction: String,
    pub transaction_info: TransactionInfo,
    pub start_timestamp: f64,
    pub timestamp: f64,
    /// Trace context of the root span, keyed `trace` inside `contexts`.
    pub contexts: TransactionContexts,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub spans: Vec<SpanData>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub release: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub environment: Option<String>,
    #[serde(skip_serializing_if = "std::collections::BTreeMap::is_empty")]
    pub tags: std::collections::BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Map::is_empty")]
    pub extra: Map,
    #[serde(skip_serializing_if = "Map::is_empty")]
    pub user: Map,
    #[serde(skip_serializing_if = "Map::is_empty")]
    pub measurements: Map,
    /// Dynamic sampling context of the trace, carried to the envelope
    /// header rather than the event payload.
    #[serde(skip)]
    pub dynamic_sampling_context: std::collections::BTreeMap<String, String>,
}

/// Contexts block of a transaction event; the trace entry is mandatory,
/// everything else is free-form.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TransactionContexts {
    pub trace: TraceContext,
    #[serde(flatten, skip_serializing_if = "Map::is_empty")]
    pub other: Map,
}

/// The union of event kinds moving through the capture pipeline.
#[derive(Clone, Debug)]
#[allow(clippy::large_enum_variant)]
pub enum Event {
    Error(ErrorEvent),
    Transaction(TransactionEvent),
    CheckIn(CheckInEvent),
}

impl Event {
    /// The id under which this event is delivered.
    pub fn event_id(&self) -> Uuid {
        match self {
            Event::Error(e) => e.event_id,
            Event::Transaction(e) => e.event_id,
            Event::CheckIn(e) => e.event_id,
        }
    }
}
