//! Timed operation nodes of a trace tree.
//!
//! A [`Span`] is a cheap handle over shared interior state; clones refer to
//! the same span. Child spans attach through the root transaction's
//! [`SpanRecorder`], which is one shared instance across the whole tree and
//! enforces the per-transaction span cap by silently dropping the excess.

use std::sync::{Arc, Mutex, Weak};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::protocol::Map;
use crate::trace::{SpanId, TraceId};
use crate::util;

/// End state of a span, mirrored onto the wire in snake case.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpanStatus {
    Ok,
    Cancelled,
    UnknownError,
    InvalidArgument,
    DeadlineExceeded,
    NotFound,
    AlreadyExists,
    PermissionDenied,
    ResourceExhausted,
    FailedPrecondition,
    Aborted,
    OutOfRange,
    Unimplemented,
    InternalError,
    Unavailable,
    DataLoss,
    Unauthenticated,
}

/// Trace context of a span as embedded in event payloads.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TraceContext {
    pub trace_id: TraceId,
    pub span_id: SpanId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_span_id: Option<SpanId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub op: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<SpanStatus>,
}

/// Immutable snapshot of a finished (or in-flight) span for serialization.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SpanData {
    pub trace_id: TraceId,
    pub span_id: SpanId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_span_id: Option<SpanId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub op: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub start_timestamp: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<SpanStatus>,
    #[serde(skip_serializing_if = "Map::is_empty")]
    pub data: Map,
}

#[derive(Debug)]
pub(crate) struct SpanInner {
    pub(crate) trace_id: TraceId,
    pub(crate) span_id: SpanId,
    pub(crate) parent_span_id: Option<SpanId>,
    pub(crate) op: Option<String>,
    pub(crate) description: Option<String>,
    pub(crate) start_timestamp: f64,
    pub(crate) timestamp: Option<f64>,
    pub(crate) status: Option<SpanStatus>,
    pub(crate) data: Map,
    pub(crate) sampled: bool,
}

impl SpanInner {
    pub(crate) fn snapshot(&self) -> SpanData {
        SpanData {
            trace_id: self.trace_id,
            span_id: self.span_id,
            parent_span_id: self.parent_span_id,
            op: self.op.clone(),
            description: self.description.clone(),
            start_timestamp: self.start_timestamp,
            timestamp: self.timestamp,
            status: self.status,
            data: self.data.clone(),
        }
    }
}

/// Collects the spans of one transaction, capped at a configured maximum.
/// Spans past the cap are dropped without error.
#[derive(Debug)]
pub(crate) struct SpanRecorder {
    max_spans: usize,
    spans: Vec<Arc<Mutex<SpanInner>>>,
}

impl SpanRecorder {
    pub(crate) fn new(max_spans: usize) -> Self {
        SpanRecorder {
            max_spans,
            spans: Vec::new(),
        }
    }

    pub(crate) fn record(&mut self, span: Arc<Mutex<SpanInner>>) {
        if self.spans.len() < self.max_spans {
            self.spans.push(span);
        }
    }

    /// Number of recorded spans, root included.
    pub(crate) fn len(&self) -> usize {
        self.spans.len()
    }

    /// Snapshots of all finished child spans, excluding the span with the
    /// given id (the root, which is serialized as the transaction itself).
    pub(crate) fn finished_children(&self, root_span_id: SpanId) -> Vec<SpanData> {
        self.spans
            .iter()
            .filter_map(|span| {
                let inner = util::lock(span);
                if inner.span_id == root_span_id || inner.timestamp.is_none() {
                    None
                } else {
                    Some(inner.snapshot())
                }
            })
            .collect()
    }
}

/// A handle on one timed operation within a trace.
#[derive(Clone, Debug)]
pub struct Span {
    pub(crate) inner: Arc<Mutex<SpanInner>>,
    pub(crate) recorder: Arc<Mutex<SpanRecorder>>,
}

impl Span {
    pub(crate) fn record_in(
        inner: SpanInner,
        recorder: Arc<Mutex<SpanRecorder>>,
    ) -> Self {
        let inner = Arc::new(Mutex::new(inner));
        util::lock(&recorder).record(inner.clone());
        Span { inner, recorder }
    }

    /// Start a child span sharing this span's trace and recorder.
    pub fn start_child(&self, op: &str, description: &str) -> Span {
        let (trace_id, parent_span_id, sampled) = {
            let inner = util::lock(&self.inner);
            (inner.trace_id, inner.span_id, inner.sampled)
        };
        let child = SpanInner {
            trace_id,
            span_id: SpanId::random(&mut rand::rng()),
            parent_span_id: Some(parent_span_id),
            op: Some(op.to_owned()),
            description: if description.is_empty() {
                None
            } else {
                Some(description.to_owned())
            },
            start_timestamp: util::unix_timestamp(),
            timestamp: None,
            status: None,
            data: Map::new(),
            sampled,
        };
        Span::record_in(child, self.recorder.clone())
    }

    /// Mark the span as finished now. Finishing twice keeps the first end
    /// timestamp.
    pub fn finish(&self) {
        let mut inner = util::lock(&self.inner);
        if inner.timestamp.is_none() {
            inner.timestamp = Some(util::unix_timestamp());
        }
    }

    pub fn set_op(&self, op: impl Into<String>) {
        util::lock(&self.inner).op = Some(op.into());
    }

    pub fn set_description(&self, description: impl Into<String>) {
        util::lock(&self.inner).description = Some(description.into());
    }

    pub fn set_status(&self, status: SpanStatus) {
        util::lock(&self.inner).status = Some(status);
    }

    pub fn set_data(&self, key: impl Into<String>, value: Value) {
        util::lock(&self.inner).data.insert(key.into(), value);
    }

    pub fn trace_id(&self) -> TraceId {
        util::lock(&self.inner).trace_id
    }

    pub fn span_id(&self) -> SpanId {
        util::lock(&self.inner).span_id
    }

    /// Whether this span's transaction was sampled.
    pub fn is_sampled(&self) -> bool {
        util::lock(&self.inner).sampled
    }

    /// The outbound trace header value pointing at this span.
    pub fn to_traceparent(&self) -> String {
        let inner = util::lock(&self.inner);
        format!(
            "{}-{}-{}",
            inner.trace_id,
            inner.span_id,
            if inner.sampled { "1" } else { "0" }
        )
    }

    /// Trace context for embedding into an event.
    pub fn get_trace_context(&self) -> TraceContext {
        let inner = util::lock(&self.inner);
        TraceContext {
            trace_id: inner.trace_id,
            span_id: inner.span_id,
            parent_span_id: inner.parent_span_id,
            op: inner.op.clone(),
            description: inner.description.clone(),
            status: inner.status,
        }
    }

    pub(crate) fn snapshot(&self) -> SpanData {
        util::lock(&self.inner).snapshot()
    }

    pub(crate) fn downgrade(&self) -> WeakSpan {
        WeakSpan {
            inner: Arc::downgrade(&self.inner),
            recorder: Arc::downgrade(&self.recorder),
        }
    }
}

/// Non-owning span reference held by scopes; the scope must never extend a
/// span's lifetime past its transaction.
#[derive(Clone, Debug, Default)]
pub struct WeakSpan {
    inner: Weak<Mutex<SpanInner>>,
    recorder: Weak<Mutex<SpanRecorder>>,
}

impl WeakSpan {
    pub fn upgrade(&self) -> Option<Span> {
        Some(Span {
            inner: self.inner.upgrade()?,
            recorder: self.recorder.upgrade()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn root_span(max_spans: usize) -> Span {
        let mut rng = rand::rng();
        let inner = SpanInner {
            trace_id: TraceId::random(&mut rng),
            span_id: SpanId::random(&mut rng),
            parent_span_id: None,
            op: Some("http.server".into()),
            description: None,
            start_timestamp: util::unix_timestamp(),
            timestamp: None,
            status: None,
            data: Map::new(),
            sampled: true,
        };
        Span::record_in(inner, Arc::new(Mutex::new(SpanRecorder::new(max_spans))))
    }

    #[test]
    fn children_share_trace_and_recorder() {
        let root = root_span(10);
        let child = root.start_child("db.query", "SELECT 1");
        assert_eq!(child.trace_id(), root.trace_id());
        assert!(Arc::ptr_eq(&child.recorder, &root.recorder));
        let grandchild = child.start_child("db.fetch", "");
        assert!(Arc::ptr_eq(&grandchild.recorder, &root.recorder));
        assert_eq!(util::lock(&root.recorder).len(), 3);
    }

    #[test]
    fn recorder_drops_spans_past_the_cap() {
        let root = root_span(3);
        for _ in 0..5 {
            root.start_child("op", "");
        }
        assert_eq!(util::lock(&root.recorder).len(), 3);
    }

    #[test]
    fn finish_is_idempotent() {
        let root = root_span(10);
        root.finish();
        let first = root.snapshot().timestamp;
        root.finish();
        assert_eq!(root.snapshot().timestamp, first);
    }

    #[test]
    fn finished_children_excludes_root_and_unfinished() {
        let root = root_span(10);
        let done = root.start_child("a", "");
        done.finish();
        let _pending = root.start_child("b", "");
        root.finish();
        let children = util::lock(&root.recorder).finished_children(root.span_id());
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].op.as_deref(), Some("a"));
    }

    #[test]
    fn traceparent_carries_sampled_flag() {
        let root = root_span(10);
        let header = root.to_traceparent();
        assert!(header.ends_with("-1"));
        assert_eq!(header.len(), 32 + 1 + 16 + 2);
    }

    #[test]
    fn weak_span_drops_with_its_transaction() {
        let weak = root_span(10).downgrade();
        assert!(weak.upgrade().is_none());
    }
}
