//! Delivery of envelopes to the ingestion endpoint, with rate-limit
//! awareness and client-side loss accounting.

mod envelope;
mod http;
mod rate_limiter;

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

pub use envelope::{Envelope, EnvelopeItem, ItemType};
pub use http::HttpTransport;
pub use rate_limiter::RATE_LIMITS_HEADER;

pub(crate) use rate_limiter::RateLimiter;

use crate::error::Result;
use crate::util;

/// Why an event never reached the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DiscardReason {
    SampleRate,
    BeforeSend,
    EventProcessor,
    QueueOverflow,
    NetworkError,
    Backpressure,
    RatelimitBackoff,
}

impl DiscardReason {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            DiscardReason::SampleRate => "sample_rate",
            DiscardReason::BeforeSend => "before_send",
            DiscardReason::EventProcessor => "event_processor",
            DiscardReason::QueueOverflow => "queue_overflow",
            DiscardReason::NetworkError => "network_error",
            DiscardReason::Backpressure => "backpressure",
            DiscardReason::RatelimitBackoff => "ratelimit_backoff",
        }
    }
}

/// Loss-accounting category of a discarded item.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ItemKind {
    Error,
    Transaction,
    Span,
    CheckIn,
    Session,
}

impl ItemKind {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            ItemKind::Error => "error",
            ItemKind::Transaction => "transaction",
            ItemKind::Span => "span",
            ItemKind::CheckIn => "check_in",
            ItemKind::Session => "session",
        }
    }
}

/// Hands envelopes to the ingestion endpoint.
///
/// One attempt per call; failed deliveries are terminal for that envelope
/// and surface only through loss counters, never through retries.
pub trait Transport: Send + Sync + std::fmt::Debug {
    /// Deliver one envelope. Errors are propagated to the caller; the async
    /// worker logs and counts them, the sync path re-raises them.
    fn send_envelope(&self, envelope: Envelope) -> Result<()>;

    /// Count an item dropped client-side, keyed by reason and kind.
    fn record_lost_event(&self, reason: DiscardReason, kind: ItemKind, count: u32);

    /// Whether the server currently suppresses any category.
    fn is_rate_limited(&self) -> bool {
        false
    }

    /// Push out any buffered telemetry, best effort.
    fn flush(&self) {}
}

/// Minimum spacing between client-report items on the wire.
const REPORT_INTERVAL: Duration = Duration::from_secs(30);

/// Aggregates dropped-event counters and periodically drains them into a
/// `client_report` envelope item.
#[derive(Debug)]
pub(crate) struct ClientReportRecorder {
    enabled: bool,
    counters: Mutex<HashMap<(DiscardReason, ItemKind), u32>>,
    last_flush: Mutex<Instant>,
}

impl ClientReportRecorder {
    pub(crate) fn new(enabled: bool) -> Self {
        ClientReportRecorder {
            enabled,
            counters: Mutex::new(HashMap::new()),
            last_flush: Mutex::new(Instant::now()),
        }
    }

    pub(crate) fn record(&self, reason: DiscardReason, kind: ItemKind, count: u32) {
        if !self.enabled || count == 0 {
            return;
        }
        *util::lock(&self.counters).entry((reason, kind)).or_insert(0) += count;
    }

    /// Drain the counters into an envelope item. Without `force`, at most
    /// one report per [`REPORT_INTERVAL`] is produced.
    pub(crate) fn take_item(&self, force: bool) -> Option<EnvelopeItem> {
        if !self.enabled {
            return None;
        }

        {
            let mut last_flush = util::lock(&self.last_flush);
            if !force && last_flush.elapsed() < REPORT_INTERVAL {
                return None;
            }
            *last_flush = Instant::now();
        }

        let counters = std::mem::take(&mut *util::lock(&self.counters));
        if counters.is_empty() {
            return None;
        }

        let discarded_events: Vec<_> = counters
            .into_iter()
            .map(|((reason, kind), quantity)| {
                serde_json::json!({
                    "reason": reason.as_str(),
                    "category": kind.as_str(),
                    "quantity": quantity,
                })
            })
            .collect();
        let payload = serde_json::json!({
            "timestamp": util::unix_timestamp(),
            "discarded_events": discarded_events,
        });

        Some(EnvelopeItem::new(
            ItemType::ClientReport,
            payload.to_string().into_bytes(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recorder_aggregates_by_reason_and_kind() {
        let recorder = ClientReportRecorder::new(true);
        recorder.record(DiscardReason::QueueOverflow, ItemKind::Error, 1);
        recorder.record(DiscardReason::QueueOverflow, ItemKind::Error, 2);
        recorder.record(DiscardReason::SampleRate, ItemKind::Transaction, 1);

        let item = recorder.take_item(true).unwrap();
        assert_eq!(item.ty, ItemType::ClientReport);
        let payload: serde_json::Value = serde_json::from_slice(&item.payload).unwrap();
        let entries = payload["discarded_events"].as_array().unwrap();
        assert_eq!(entries.len(), 2);
        let overflow = entries
            .iter()
            .find(|e| e["reason"] == "queue_overflow")
            .unwrap();
        assert_eq!(overflow["quantity"], 3);
        assert_eq!(overflow["category"], "error");
    }

    #[test]
    fn take_is_draining_and_interval_gated() {
        let recorder = ClientReportRecorder::new(true);
        recorder.record(DiscardReason::NetworkError, ItemKind::Error, 1);
        assert!(recorder.take_item(true).is_some());
        assert!(recorder.take_item(true).is_none());

        recorder.record(DiscardReason::NetworkError, ItemKind::Error, 1);
        // just flushed, the interval has not elapsed
        assert!(recorder.take_item(false).is_none());
    }

    #[test]
    fn disabled_recorder_stays_silent() {
        let recorder = ClientReportRecorder::new(false);
        recorder.record(DiscardReason::BeforeSend, ItemKind::Error, 5);
        assert!(recorder.take_item(true).is_none());
    }
}
