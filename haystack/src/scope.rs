//! Mutable per-context capture state.
//!
//! A scope carries everything the client copies onto an event at capture
//! time: tags, user identity, breadcrumbs, the active span and the trace
//! propagation context. Scopes are cloned, never shared, across execution
//! contexts; mutations on a clone stay on the clone.

use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

use once_cell::sync::Lazy;
use serde_json::Value;

use crate::breadcrumb::{Breadcrumb, BreadcrumbBuffer};
use crate::hay_warn;
use crate::propagation::PropagationContext;
use crate::protocol::{Event, Level, Map, Values};
use crate::trace::{Span, TransactionSource, WeakSpan, WeakTransaction};
use crate::util;

/// A callback that may mutate or discard an event before delivery.
pub type EventProcessor = Arc<dyn Fn(Event) -> Option<Event> + Send + Sync>;

static GLOBAL_EVENT_PROCESSORS: Lazy<Mutex<Vec<EventProcessor>>> =
    Lazy::new(|| Mutex::new(Vec::new()));

/// Register a processor that runs for every scope, before scope-local ones.
pub fn add_global_event_processor(
    processor: impl Fn(Event) -> Option<Event> + Send + Sync + 'static,
) {
    util::lock(&GLOBAL_EVENT_PROCESSORS).push(Arc::new(processor));
}

pub(crate) fn clear_global_event_processors() {
    util::lock(&GLOBAL_EVENT_PROCESSORS).clear();
}

/// Per-context capture state.
#[derive(Clone)]
pub struct Scope {
    level: Option<Level>,
    tags: BTreeMap<String, String>,
    extra: Map,
    contexts: Map,
    user: Map,
    breadcrumbs: BreadcrumbBuffer,
    transaction_name: Option<String>,
    transaction_source: Option<TransactionSource>,
    span: Option<WeakSpan>,
    transaction: Option<WeakTransaction>,
    event_processors: Vec<EventProcessor>,
    pub(crate) session: Option<crate::session::Session>,
    pub(crate) propagation_context: PropagationContext,
}

impl std::fmt::Debug for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scope")
            .field("tags", &self.tags)
            .field("transaction_name", &self.transaction_name)
            .field("breadcrumbs", &self.breadcrumbs.len())
            .field("event_processors", &self.event_processors.len())
            .field("propagation_context", &self.propagation_context)
            .finish_non_exhaustive()
    }
}

impl Scope {
    pub fn new(max_breadcrumbs: usize) -> Self {
        Scope {
            level: None,
            tags: BTreeMap::new(),
            extra: Map::new(),
            contexts: Map::new(),
            user: Map::new(),
            breadcrumbs: BreadcrumbBuffer::new(max_breadcrumbs),
            transaction_name: None,
            transaction_source: None,
            span: None,
            transaction: None,
            event_processors: Vec::new(),
            session: None,
            propagation_context: PropagationContext::new(),
        }
    }

    pub fn set_level(&mut self, level: Level) {
        self.level = Some(level);
    }

    pub fn set_tag(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.tags.insert(key.into(), value.into());
    }

    /// Merge tags into the scope; existing keys are overwritten.
    pub fn set_tags(&mut self, tags: impl IntoIterator<Item = (String, String)>) {
        self.tags.extend(tags);
    }

    pub fn set_extra(&mut self, key: impl Into<String>, value: Value) {
        self.extra.insert(key.into(), value);
    }

    /// Merge a named context block, e.g. `"device"` or `"os"`.
    pub fn set_context(&mut self, key: impl Into<String>, value: Value) {
        self.contexts.insert(key.into(), value);
    }

    /// Merge fields into the user identity.
    pub fn set_user(&mut self, user: Map) {
        for (key, value) in user {
            self.user.insert(key, value);
        }
    }

    pub fn add_breadcrumb(&mut self, crumb: Breadcrumb) {
        self.breadcrumbs.push(crumb);
    }

    pub fn clear_breadcrumbs(&mut self) {
        self.breadcrumbs.clear();
    }

    /// Name the surrounding operation for error events captured here.
    pub fn set_transaction_name(&mut self, name: impl Into<String>, source: TransactionSource) {
        self.transaction_name = Some(name.into());
        self.transaction_source = Some(source);
    }

    pub fn transaction_name(&self) -> Option<&str> {
        self.transaction_name.as_deref()
    }

    /// Bind the active span; the scope never extends the span's lifetime.
    pub fn set_span(&mut self, span: Option<WeakSpan>) {
        self.span = span;
    }

    pub(crate) fn set_transaction(&mut self, transaction: Option<WeakTransaction>) {
        self.transaction = transaction;
    }

    /// The live active span, if its transaction still exists.
    pub fn get_span(&self) -> Option<Span> {
        self.span.as_ref().and_then(WeakSpan::upgrade)
    }

    pub(crate) fn get_transaction(&self) -> Option<crate::trace::Transaction> {
        self.transaction.as_ref().and_then(WeakTransaction::upgrade)
    }

    /// Register a scope-local event processor; runs after global ones.
    pub fn add_event_processor(
        &mut self,
        processor: impl Fn(Event) -> Option<Event> + Send + Sync + 'static,
    ) {
        self.event_processors.push(Arc::new(processor));
    }

    /// Reset everything except the propagation context.
    pub fn clear(&mut self) {
        let propagation_context = self.propagation_context.clone();
        let max = self.breadcrumbs.max_size();
        *self = Scope::new(max);
        self.propagation_context = propagation_context;
    }

    /// Copy scope state onto the event, then run global and scope-local
    /// processors in registration order. Returns `None` when a processor
    /// discards the event or panics.
    pub(crate) fn apply_to_event(&self, mut event: Event) -> Option<Event> {
        match &mut event {
            Event::Error(error) => {
                if let Some(level) = self.level {
                    error.level = level;
                }
                if error.transaction.is_none() {
                    error.transaction = self.transaction_name.clone();
                }
                merge_tags(&mut error.tags, &self.tags);
                merge_map(&mut error.extra, &self.extra);
                merge_map(&mut error.contexts, &self.contexts);
                merge_map(&mut error.user, &self.user);
                if error.breadcrumbs.is_empty() {
                    error.breadcrumbs = Values {
                        values: self.breadcrumbs.to_vec(),
                    };
                }
                if !error.contexts.contains_key("trace") {
                    if let Ok(trace) = serde_json::to_value(self.trace_context()) {
                        error.contexts.insert("trace".into(), trace);
                    }
                }
            }
            Event::Transaction(transaction) => {
                merge_tags(&mut transaction.tags, &self.tags);
                merge_map(&mut transaction.extra, &self.extra);
                merge_map(&mut transaction.user, &self.user);
                merge_map(&mut transaction.contexts.other, &self.contexts);
            }
            Event::CheckIn(check_in) => {
                if !check_in.contexts.contains_key("trace") {
                    if let Ok(trace) = serde_json::to_value(self.trace_context()) {
                        check_in.contexts.insert("trace".into(), trace);
                    }
                }
            }
        }

        let global = util::lock(&GLOBAL_EVENT_PROCESSORS).clone();
        for processor in global.iter().chain(self.event_processors.iter()) {
            match catch_unwind(AssertUnwindSafe(|| processor(event))) {
                Ok(Some(next)) => event = next,
                Ok(None) => return None,
                Err(_) => {
                    hay_warn!(
                        name: "Scope.EventProcessorPanicked",
                        message = "event discarded"
                    );
                    return None;
                }
            }
        }
        Some(event)
    }

    /// Trace context of the active span, falling back to the propagation
    /// context.
    pub(crate) fn trace_context(&self) -> crate::trace::TraceContext {
        match self.get_span() {
            Some(span) => span.get_trace_context(),
            None => self.propagation_context.trace_context(),
        }
    }
}

fn merge_tags(target: &mut BTreeMap<String, String>, source: &BTreeMap<String, String>) {
    for (key, value) in source {
        target.entry(key.clone()).or_insert_with(|| value.clone());
    }
}

fn merge_map(target: &mut Map, source: &Map) {
    for (key, value) in source {
        if !target.contains_key(key) {
            target.insert(key.clone(), value.clone());
        }
    }
}
