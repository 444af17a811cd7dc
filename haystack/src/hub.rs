//! The hub: concurrency-safe entry point binding an execution context to a
//! stack of (client, scope) layers.
//!
//! Every thread works against its own hub. Instead of hiding hubs in
//! thread-local storage, a registry keyed by [`std::thread::ThreadId`] hands
//! each thread a lazily-created clone of the main hub's top layer: shared
//! client, independent scope.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::thread::{self, ThreadId};

use once_cell::sync::Lazy;
use uuid::Uuid;

use crate::breadcrumb::Breadcrumb;
use crate::client::{Client, EventHint};
use crate::cron::{CheckInEvent, MonitorConfig, MonitorStatus};
use crate::propagation::{PropagationContext, BAGGAGE_HEADER_NAME, TRACE_HEADER_NAME};
use crate::protocol::{Event, Level, TransactionEvent};
use crate::scope::Scope;
use crate::session::Session;
use crate::trace::{
    decide_sampling, SamplingContext, Span, Transaction, TransactionContext,
};
use crate::transport::{DiscardReason, ItemKind};
use crate::util;

static REGISTRY: Lazy<Mutex<HashMap<ThreadId, Arc<Hub>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

// Exit hook only: lookups always go through the registry. Touching the
// guard arms a destructor that drops the thread's registry entry when the
// thread dies, so the map stays bounded on thread-per-request hosts.
thread_local! {
    static EXIT_GUARD: RegistryGuard = RegistryGuard(thread::current().id());
}

struct RegistryGuard(ThreadId);

impl Drop for RegistryGuard {
    fn drop(&mut self) {
        util::lock(&REGISTRY).remove(&self.0);
    }
}

fn arm_exit_guard() {
    // fails only during thread teardown, when the entry is about to be
    // removed anyway
    let _ = EXIT_GUARD.try_with(|_| ());
}

/// Drop every per-thread hub; entries for dead threads go with them.
pub(crate) fn clear_registry() {
    util::lock(&REGISTRY).clear();
}

/// Bind a hub to the calling thread, replacing any previous binding.
pub(crate) fn register_current_thread(hub: Arc<Hub>) {
    util::lock(&REGISTRY).insert(thread::current().id(), hub);
    arm_exit_guard();
}

struct Layer {
    client: Option<Arc<Client>>,
    scope: Scope,
}

/// One execution context's view of the SDK.
pub struct Hub {
    stack: Mutex<Vec<Layer>>,
    last_event_id: Mutex<Option<Uuid>>,
}

impl std::fmt::Debug for Hub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hub")
            .field("layers", &util::lock(&self.stack).len())
            .finish_non_exhaustive()
    }
}

impl Hub {
    pub(crate) fn new(client: Option<Arc<Client>>, scope: Scope) -> Arc<Self> {
        Arc::new(Hub {
            stack: Mutex::new(vec![Layer { client, scope }]),
            last_event_id: Mutex::new(None),
        })
    }

    /// The calling thread's hub. A thread that has none yet gets an
    /// isolated clone of the main hub's top layer; `None` before `init`.
    pub fn current() -> Option<Arc<Hub>> {
        let thread_id = thread::current().id();
        if let Some(hub) = util::lock(&REGISTRY).get(&thread_id) {
            return Some(hub.clone());
        }
        let main = crate::main_hub()?;
        let hub = main.clone_for_new_context();
        // a concurrent lookup may have raced us; keep the registered one
        let hub = util::lock(&REGISTRY)
            .entry(thread_id)
            .or_insert(hub)
            .clone();
        arm_exit_guard();
        Some(hub)
    }

    /// A hub with the same client and a cloned scope, for a new execution
    /// context.
    pub fn clone_for_new_context(&self) -> Arc<Hub> {
        let stack = util::lock(&self.stack);
        let top = stack.last().expect("hub stack never empty");
        Hub::new(top.client.clone(), top.scope.clone())
    }

    pub fn client(&self) -> Option<Arc<Client>> {
        util::lock(&self.stack)
            .last()
            .and_then(|layer| layer.client.clone())
    }

    pub fn last_event_id(&self) -> Option<Uuid> {
        *util::lock(&self.last_event_id)
    }

    /// Run `f` with mutable access to the current scope.
    pub fn configure_scope<F, T>(&self, f: F) -> T
    where
        F: FnOnce(&mut Scope) -> T,
    {
        let mut stack = util::lock(&self.stack);
        let top = stack.last_mut().expect("hub stack never empty");
        f(&mut top.scope)
    }

    /// Push a clone of the current layer, run `f` against it, and pop it on
    /// any exit. Mutations inside never leak to the parent scope.
    pub fn with_scope<F, T>(&self, f: F) -> T
    where
        F: FnOnce(&Hub) -> T,
    {
        {
            let mut stack = util::lock(&self.stack);
            let top = stack.last().expect("hub stack never empty");
            let layer = Layer {
                client: top.client.clone(),
                scope: top.scope.clone(),
            };
            stack.push(layer);
        }
        let _guard = PopGuard { hub: self };
        f(self)
    }

    /// Run the capture pipeline for an already-built event.
    pub fn capture_event(&self, event: Event, hint: EventHint) -> Option<Uuid> {
        let (client, scope) = {
            let mut stack = util::lock(&self.stack);
            let top = stack.last_mut().expect("hub stack never empty");
            if let (Event::Error(error), Some(session)) = (&event, &mut top.scope.session) {
                if !error.exception.is_empty() {
                    session.update_from_error();
                }
            }
            (top.client.clone(), top.scope.clone())
        };
        let client = client?;
        let event_id = client.capture_event(event, &scope, hint)?;
        *util::lock(&self.last_event_id) = Some(event_id);
        Some(event_id)
    }

    pub fn capture_message(&self, message: &str, level: Level) -> Option<Uuid> {
        let client = self.client()?;
        let event = client.event_from_message(message, level);
        self.capture_event(Event::Error(event), EventHint::default())
    }

    pub fn capture_error<E>(&self, err: &E) -> Option<Uuid>
    where
        E: std::error::Error + ?Sized,
    {
        let client = self.client()?;
        let event = client.event_from_error(err);
        self.capture_event(Event::Error(event), EventHint::default())
    }

    pub fn add_breadcrumb(&self, crumb: Breadcrumb) {
        self.configure_scope(|scope| scope.add_breadcrumb(crumb));
    }

    /// Start a transaction, resolving its sampling decision immediately.
    /// `None` when the SDK is inactive or tracing is disabled.
    pub fn start_transaction(self: &Arc<Self>, ctx: TransactionContext) -> Option<Transaction> {
        let client = self.client()?;
        let config = client.config();
        if !config.tracing_enabled() {
            return None;
        }

        let sampling_ctx = SamplingContext {
            transaction_name: ctx.name.clone(),
            op: ctx.op.clone(),
            parent_sampled: ctx.parent_sampled,
            custom: ctx.custom.clone(),
        };
        let decision = decide_sampling(
            &sampling_ctx,
            ctx.sampled,
            config,
            crate::backpressure_factor(),
            &mut rand::rng(),
        );

        let transaction = Transaction::start(ctx, decision, config, Arc::downgrade(self));
        self.configure_scope(|scope| {
            scope.set_span(Some(transaction.root_span().downgrade()));
            scope.set_transaction(Some(transaction.downgrade()));
        });
        Some(transaction)
    }

    /// Adopt the trace described by inbound headers and start a transaction
    /// continuing it.
    pub fn continue_trace<'a, I>(
        self: &Arc<Self>,
        headers: I,
        name: &str,
        op: &str,
    ) -> Option<Transaction>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let cx = PropagationContext::from_headers(headers);
        let ctx = TransactionContext::continue_from_propagation_context(name, op, &cx);
        self.configure_scope(|scope| scope.propagation_context = cx);
        self.start_transaction(ctx)
    }

    /// Run `f` under a child of the current active span, restoring the
    /// previous active span afterwards. Without an active span `f` runs
    /// with `None`.
    pub fn with_child_span<F, T>(&self, op: &str, description: &str, f: F) -> T
    where
        F: FnOnce(Option<&Span>) -> T,
    {
        let Some(parent) = self.configure_scope(|scope| scope.get_span()) else {
            return f(None);
        };
        let child = parent.start_child(op, description);
        self.configure_scope(|scope| scope.set_span(Some(child.downgrade())));
        let result = f(Some(&child));
        child.finish();
        self.configure_scope(|scope| scope.set_span(Some(parent.downgrade())));
        result
    }

    /// Outbound trace headers for the current context: the active span's
    /// identity when one exists, the scope's propagation context otherwise.
    pub fn get_trace_propagation_headers(&self) -> Vec<(String, String)> {
        let Some(client) = self.client() else {
            return Vec::new();
        };
        let config = client.config().clone();

        let mut stack = util::lock(&self.stack);
        let top = stack.last_mut().expect("hub stack never empty");
        let mut headers = Vec::with_capacity(2);

        if let Some(span) = top.scope.get_span() {
            headers.push((TRACE_HEADER_NAME.to_owned(), span.to_traceparent()));
            if let Some(transaction) = top.scope.get_transaction() {
                let baggage = transaction.get_baggage(&config).serialize();
                if !baggage.is_empty() {
                    headers.push((BAGGAGE_HEADER_NAME.to_owned(), baggage));
                }
            }
        } else {
            let cx = &mut top.scope.propagation_context;
            headers.push((TRACE_HEADER_NAME.to_owned(), cx.get_traceparent()));
            let baggage = cx.get_baggage(&config).serialize();
            if !baggage.is_empty() {
                headers.push((BAGGAGE_HEADER_NAME.to_owned(), baggage));
            }
        }
        headers
    }

    /// Report a cron monitor check-in.
    pub fn capture_check_in(
        &self,
        slug: &str,
        status: MonitorStatus,
        check_in_id: Option<Uuid>,
        duration: Option<f64>,
        monitor_config: Option<MonitorConfig>,
    ) -> Option<Uuid> {
        let mut event = CheckInEvent::new(slug, status);
        if let Some(id) = check_in_id {
            event.check_in_id = id;
        }
        event.duration = duration;
        event.monitor_config = monitor_config;
        let check_in_id = event.check_in_id;
        self.capture_event(Event::CheckIn(event), EventHint::default())?;
        Some(check_in_id)
    }

    /// Begin a release-health session on the current scope.
    pub fn start_session(&self) {
        self.configure_scope(|scope| scope.session = Some(Session::new()));
    }

    /// End the current session and hand it to the aggregating flusher.
    pub fn end_session(&self) {
        let session = self.configure_scope(|scope| scope.session.take());
        if let Some(mut session) = session {
            session.close();
            if let Some(flusher) = crate::session_flusher() {
                flusher.add_session(&session);
            }
        }
    }

    pub(crate) fn capture_transaction(&self, event: TransactionEvent) {
        self.capture_event(Event::Transaction(event), EventHint::default());
    }

    pub(crate) fn record_lost_event(&self, reason: DiscardReason, kind: ItemKind, count: u32) {
        if let Some(client) = self.client() {
            client.transport().record_lost_event(reason, kind, count);
        }
    }
}

struct PopGuard<'a> {
    hub: &'a Hub,
}

impl Drop for PopGuard<'_> {
    fn drop(&mut self) {
        let mut stack = util::lock(&self.hub.stack);
        if stack.len() > 1 {
            stack.pop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::testing::TestTransport;
    use crate::worker::BackgroundWorker;

    fn test_hub(transport: Arc<TestTransport>) -> Arc<Hub> {
        let config = Arc::new(
            Config::new()
                .with_transport(transport)
                .with_traces_sample_rate(1.0),
        );
        let worker = Arc::new(BackgroundWorker::new(0, 30));
        let client = Arc::new(Client::new(config.clone(), worker).unwrap());
        Hub::new(Some(client), Scope::new(config.max_breadcrumbs))
    }

    #[test]
    fn with_scope_isolates_mutations() {
        let transport = Arc::new(TestTransport::new());
        let hub = test_hub(transport.clone());
        hub.configure_scope(|scope| scope.set_tag("outer", "1"));

        hub.with_scope(|hub| {
            hub.configure_scope(|scope| scope.set_tag("inner", "1"));
            hub.capture_message("inside", Level::Info);
        });
        hub.capture_message("outside", Level::Info);

        let events = transport.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0]["tags"]["inner"], "1");
        assert_eq!(events[0]["tags"]["outer"], "1");
        assert!(events[1]["tags"].get("inner").is_none());
    }

    #[test]
    fn with_scope_pops_when_closure_panics() {
        let transport = Arc::new(TestTransport::new());
        let hub = test_hub(transport);
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            hub.with_scope(|hub| {
                hub.configure_scope(|scope| scope.set_tag("doomed", "1"));
                panic!("user code failed");
            })
        }));
        assert!(result.is_err());
        assert_eq!(util::lock(&hub.stack).len(), 1);
    }

    #[test]
    fn capture_updates_last_event_id() {
        let transport = Arc::new(TestTransport::new());
        let hub = test_hub(transport);
        assert!(hub.last_event_id().is_none());
        let id = hub.capture_message("hello", Level::Info).unwrap();
        assert_eq!(hub.last_event_id(), Some(id));
    }

    #[test]
    fn transaction_binds_active_span_to_scope() {
        let transport = Arc::new(TestTransport::new());
        let hub = test_hub(transport);
        let transaction = hub
            .start_transaction(TransactionContext::new("job", "queue.task"))
            .unwrap();
        assert!(transaction.is_sampled());

        let span = hub.configure_scope(|scope| scope.get_span()).unwrap();
        assert_eq!(span.span_id(), transaction.root_span().span_id());

        let headers = hub.get_trace_propagation_headers();
        assert_eq!(headers[0].0, TRACE_HEADER_NAME);
        assert!(headers[0].1.starts_with(&transaction.root_span().trace_id().to_string()));
        transaction.finish();
    }

    #[test]
    fn transaction_envelope_dsc_matches_its_own_trace() {
        let transport = Arc::new(TestTransport::new());
        let hub = test_hub(transport.clone());
        let transaction = hub
            .start_transaction(TransactionContext::new("GET /orders", "http.server"))
            .unwrap();
        let trace_id = transaction.root_span().trace_id().to_string();
        transaction.finish();

        let envelopes = transport.envelopes();
        assert_eq!(envelopes.len(), 1);
        let dsc = envelopes[0].trace.as_ref().unwrap();
        assert_eq!(dsc.get("trace_id"), Some(&trace_id));
        assert_eq!(dsc.get("sample_rate"), Some(&"1".to_owned()));
        assert_eq!(dsc.get("sampled"), Some(&"true".to_owned()));
    }

    #[test]
    fn with_child_span_restores_parent() {
        let transport = Arc::new(TestTransport::new());
        let hub = test_hub(transport);
        let transaction = hub
            .start_transaction(TransactionContext::new("job", "queue.task"))
            .unwrap();
        let root_id = transaction.root_span().span_id();

        hub.with_child_span("db.query", "SELECT 1", |span| {
            let span = span.unwrap();
            assert_ne!(span.span_id(), root_id);
            let active = hub.configure_scope(|scope| scope.get_span()).unwrap();
            assert_eq!(active.span_id(), span.span_id());
        });

        let active = hub.configure_scope(|scope| scope.get_span()).unwrap();
        assert_eq!(active.span_id(), root_id);
        transaction.finish();
    }

    #[test]
    fn no_client_means_no_capture() {
        let hub = Hub::new(None, Scope::new(10));
        assert!(hub.capture_message("dropped", Level::Error).is_none());
    }

    #[test]
    fn registry_forgets_dead_threads() {
        let transport = Arc::new(TestTransport::new());
        let hub = test_hub(transport);
        let handle = thread::spawn(move || {
            let id = thread::current().id();
            register_current_thread(hub);
            assert!(util::lock(&REGISTRY).contains_key(&id));
            id
        });
        let id = handle.join().unwrap();
        assert!(!util::lock(&REGISTRY).contains_key(&id));
    }
}
