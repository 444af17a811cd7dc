//! Transactions: root spans with a name, a sampling decision and a baggage
//! payload for downstream propagation.

use std::sync::{Arc, Mutex, Weak};

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::hub::Hub;
use crate::propagation::{Baggage, PropagationContext};
use crate::protocol::{
    Map, TransactionContexts, TransactionEvent, TransactionInfo,
};
use crate::trace::{Span, SpanId, SpanInner, SpanRecorder, TraceId};
use crate::transport::{DiscardReason, ItemKind};
use crate::util;
use crate::{hay_debug, hay_warn};

/// Name shown for transactions that were never given one.
pub const UNLABELED_TRANSACTION: &str = "<unlabeled transaction>";

/// Origin of a transaction name, governing its cardinality.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionSource {
    #[default]
    Custom,
    Url,
    Route,
    View,
    Component,
    Task,
}

impl TransactionSource {
    /// URL-sourced names are unbounded-cardinality and excluded from
    /// baggage propagation.
    pub(crate) fn is_low_quality(self) -> bool {
        matches!(self, TransactionSource::Url)
    }
}

/// Everything a sampler callback may consult when deciding.
#[derive(Clone, Debug)]
pub struct SamplingContext {
    /// Name of the transaction being started.
    pub transaction_name: String,
    /// Operation of the root span.
    pub op: String,
    /// Sampling decision of the upstream service, if known.
    pub parent_sampled: Option<bool>,
    /// Free-form caller-provided context.
    pub custom: Map,
}

/// Options for starting a transaction, either fresh or continued from
/// inbound headers.
#[derive(Clone, Debug)]
pub struct TransactionContext {
    pub(crate) name: String,
    pub(crate) op: String,
    pub(crate) source: TransactionSource,
    pub(crate) trace_id: TraceId,
    pub(crate) parent_span_id: Option<SpanId>,
    pub(crate) parent_sampled: Option<bool>,
    pub(crate) sampled: Option<bool>,
    pub(crate) baggage: Option<Baggage>,
    pub(crate) custom: Map,
}

impl TransactionContext {
    /// A fresh root context with a random trace id.
    pub fn new(name: &str, op: &str) -> Self {
        TransactionContext {
            name: name.to_owned(),
            op: op.to_owned(),
            source: TransactionSource::Custom,
            trace_id: TraceId::random(&mut rand::rng()),
            parent_span_id: None,
            parent_sampled: None,
            sampled: None,
            baggage: None,
            custom: Map::new(),
        }
    }

    /// Continue the trace described by inbound `haystack-trace` and `baggage`
    /// headers; malformed headers start a fresh trace instead.
    pub fn continue_from_headers<'a, I>(name: &str, op: &str, headers: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let cx = PropagationContext::from_headers(headers);
        Self::continue_from_propagation_context(name, op, &cx)
    }

    pub(crate) fn continue_from_propagation_context(
        name: &str,
        op: &str,
        cx: &PropagationContext,
    ) -> Self {
        let mut ctx = Self::new(name, op);
        ctx.trace_id = cx.trace_id;
        ctx.parent_span_id = cx.parent_span_id;
        ctx.parent_sampled = cx.parent_sampled;
        ctx.baggage = cx.incoming_baggage();
        ctx
    }

    /// Set the origin of the transaction name.
    pub fn with_source(mut self, source: TransactionSource) -> Self {
        self.source = source;
        self
    }

    /// Force the sampling decision, bypassing sampler and rate.
    pub fn with_sampled(mut self, sampled: bool) -> Self {
        self.sampled = Some(sampled);
        self
    }

    /// Attach caller context consulted by a configured sampler.
    pub fn with_custom_context(mut self, custom: Map) -> Self {
        self.custom = custom;
        self
    }
}

/// Resolved sampling outcome for one transaction.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) struct SamplingDecision {
    pub(crate) sampled: bool,
    /// Effective rate the decision was drawn against; exactly 1.0/0.0 for
    /// forced, sampler and inherited decisions.
    pub(crate) sample_rate: f64,
    /// Backpressure factor applied to the static rate, 0 when none.
    pub(crate) downsample_factor: u32,
}

/// Resolve the sampling decision, exactly once per transaction and before
/// any child span exists.
///
/// Precedence: explicit force, then sampler callback, then inheritance from
/// the parent, then the static rate. Backpressure downsampling applies only
/// to the static-rate branch and never flips a deterministic decision.
pub(crate) fn decide_sampling<R: Rng + ?Sized>(
    ctx: &SamplingContext,
    forced: Option<bool>,
    config: &Config,
    downsample_factor: u32,
    rng: &mut R,
) -> SamplingDecision {
    let boolean = |sampled: bool| SamplingDecision {
        sampled,
        sample_rate: if sampled { 1.0 } else { 0.0 },
        downsample_factor: 0,
    };

    if !config.tracing_enabled() {
        return boolean(false);
    }

    if let Some(sampled) = forced {
        return boolean(sampled);
    }

    if let Some(sampler) = &config.traces_sampler {
        let sampled = sampler(ctx);
        hay_debug!(name: "Sampling.SamplerDecision", sampled = sampled);
        return boolean(sampled);
    }

    if let Some(sampled) = ctx.parent_sampled {
        hay_debug!(name: "Sampling.InheritedDecision", sampled = sampled);
        return boolean(sampled);
    }

    let rate = config.traces_sample_rate.unwrap_or(0.0);
    if !rate.is_finite() || !(0.0..=1.0).contains(&rate) {
        hay_warn!(
            name: "Sampling.InvalidRate",
            message = "traces_sample_rate outside [0.0, 1.0], discarding transaction"
        );
        return boolean(false);
    }

    let effective = rate / 2f64.powi(downsample_factor as i32);
    SamplingDecision {
        sampled: rng.random::<f64>() < effective,
        sample_rate: effective,
        downsample_factor,
    }
}

#[derive(Debug)]
struct TransactionShared {
    root: Span,
    name: Mutex<String>,
    source: Mutex<TransactionSource>,
    decision: SamplingDecision,
    baggage: Mutex<Option<Baggage>>,
    measurements: Mutex<Map>,
    hub: Weak<Hub>,
}

/// The root of a span tree. Finishing it emits a transaction event (when
/// sampled) through the hub it was started on.
#[derive(Clone, Debug)]
pub struct Transaction {
    shared: Arc<TransactionShared>,
}

/// Non-owning transaction reference held by scopes.
#[derive(Clone, Debug, Default)]
pub struct WeakTransaction {
    shared: Weak<TransactionShared>,
}

impl WeakTransaction {
    pub fn upgrade(&self) -> Option<Transaction> {
        self.shared.upgrade().map(|shared| Transaction { shared })
    }
}

impl Transaction {
    pub(crate) fn start(
        ctx: TransactionContext,
        decision: SamplingDecision,
        config: &Config,
        hub: Weak<Hub>,
    ) -> Self {
        let inner = SpanInner {
            trace_id: ctx.trace_id,
            span_id: SpanId::random(&mut rand::rng()),
            parent_span_id: ctx.parent_span_id,
            op: Some(ctx.op),
            description: None,
            start_timestamp: util::unix_timestamp(),
            timestamp: None,
            status: None,
            data: Map::new(),
            sampled: decision.sampled,
        };
        let recorder = Arc::new(Mutex::new(SpanRecorder::new(config.max_spans)));
        let root = Span::record_in(inner, recorder);

        Transaction {
            shared: Arc::new(TransactionShared {
                root,
                name: Mutex::new(ctx.name),
                source: Mutex::new(ctx.source),
                decision,
                baggage: Mutex::new(ctx.baggage),
                measurements: Mutex::new(Map::new()),
                hub,
            }),
        }
    }

    /// The root span of this transaction's tree.
    pub fn root_span(&self) -> &Span {
        &self.shared.root
    }

    pub fn downgrade(&self) -> WeakTransaction {
        WeakTransaction {
            shared: Arc::downgrade(&self.shared),
        }
    }

    /// Start a direct child of the root span.
    pub fn start_child(&self, op: &str, description: &str) -> Span {
        self.shared.root.start_child(op, description)
    }

    pub fn name(&self) -> String {
        util::lock(&self.shared.name).clone()
    }

    /// Rename the transaction, recording where the new name came from.
    pub fn set_name(&self, name: impl Into<String>, source: TransactionSource) {
        *util::lock(&self.shared.name) = name.into();
        *util::lock(&self.shared.source) = source;
    }

    pub fn source(&self) -> TransactionSource {
        *util::lock(&self.shared.source)
    }

    pub fn is_sampled(&self) -> bool {
        self.shared.decision.sampled
    }

    /// The rate the sampling decision was drawn against.
    pub fn effective_sample_rate(&self) -> f64 {
        self.shared.decision.sample_rate
    }

    /// Record a numeric measurement on the transaction payload.
    pub fn set_measurement(&self, name: impl Into<String>, value: f64) {
        util::lock(&self.shared.measurements).insert(
            name.into(),
            serde_json::json!({ "value": value }),
        );
    }

    /// The outbound trace header value pointing at the root span.
    pub fn to_traceparent(&self) -> String {
        self.shared.root.to_traceparent()
    }

    /// The baggage propagated to downstream services: the frozen inbound
    /// baggage, or one populated from this transaction when it is the head
    /// of the trace.
    pub fn get_baggage(&self, config: &Config) -> Baggage {
        let mut guard = util::lock(&self.shared.baggage);
        let needs_population = match &*guard {
            None => true,
            Some(b) => b.is_mutable(),
        };
        if needs_population {
            *guard = Some(self.populate_head_baggage(config));
        }
        guard.clone().unwrap_or_default()
    }

    fn populate_head_baggage(&self, config: &Config) -> Baggage {
        let mut baggage = Baggage::new();
        baggage.insert("trace_id", self.shared.root.trace_id().to_string());
        baggage.insert(
            "sample_rate",
            self.shared.decision.sample_rate.to_string(),
        );
        baggage.insert(
            "sampled",
            if self.shared.decision.sampled {
                "true"
            } else {
                "false"
            },
        );
        if let Some(environment) = config.environment() {
            baggage.insert("environment", environment);
        }
        if let Some(release) = config.release() {
            baggage.insert("release", release);
        }
        if let Some(dsn) = config.dsn() {
            baggage.insert("public_key", dsn.public_key());
        }
        let source = self.source();
        if !source.is_low_quality() {
            baggage.insert("transaction", self.name());
        }
        baggage.freeze();
        baggage
    }

    /// Freeze timestamps and either emit the transaction event or account
    /// for the loss when unsampled.
    pub fn finish(self) {
        self.shared.root.finish();

        let Some(hub) = self.shared.hub.upgrade() else {
            return;
        };

        if !self.shared.decision.sampled {
            let reason = if self.shared.decision.downsample_factor > 0 {
                DiscardReason::Backpressure
            } else {
                DiscardReason::SampleRate
            };
            let span_count = util::lock(&self.shared.root.recorder).len() as u32;
            hub.record_lost_event(reason, ItemKind::Transaction, 1);
            hub.record_lost_event(reason, ItemKind::Span, span_count);
            hay_debug!(name: "Transaction.DroppedUnsampled");
            return;
        }

        let mut event = self.into_event();
        if let Some(client) = hub.client() {
            event.dynamic_sampling_context = self
                .get_baggage(client.config())
                .dynamic_sampling_context()
                .clone();
        }
        hub.capture_transaction(event);
    }

    fn into_event(&self) -> TransactionEvent {
        let root = self.shared.root.snapshot();
        let spans = util::lock(&self.shared.root.recorder)
            .finished_children(root.span_id);

        let mut name = self.name();
        if name.is_empty() {
            name = UNLABELED_TRANSACTION.to_owned();
        }

        TransactionEvent {
            event_id: uuid::Uuid::new_v4(),
            ty: "transaction",
            platform: "rust",
            sdk: crate::protocol::sdk_info(),
            transaction: name,
            transaction_info: TransactionInfo {
                source: self.source(),
            },
            start_timestamp: root.start_timestamp,
            timestamp: root.timestamp.unwrap_or(root.start_timestamp),
            contexts: TransactionContexts {
                trace: self.shared.root.get_trace_context(),
                other: Map::new(),
            },
            spans,
            release: None,
            environment: None,
            tags: Default::default(),
            extra: Map::new(),
            user: Map::new(),
            measurements: util::lock(&self.shared.measurements).clone(),
            dynamic_sampling_context: Default::default(),
        }
    }
}
