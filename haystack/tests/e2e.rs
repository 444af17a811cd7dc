//! End-to-end pipeline tests against an in-memory transport.
//!
//! The SDK keeps process-wide state (the main hub and its registry), so
//! every test serializes on one lock and closes the SDK before releasing it.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{Receiver, SyncSender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use haystack::testing::TestTransport;
use haystack::transport::{DiscardReason, Envelope, ItemKind, ItemType, Transport};
use haystack::{Config, Level, TransactionContext};

static TEST_LOCK: Mutex<()> = Mutex::new(());

fn serial() -> MutexGuard<'static, ()> {
    TEST_LOCK.lock().unwrap_or_else(PoisonError::into_inner)
}

fn init_with(transport: Arc<TestTransport>, config: Config) -> haystack::InitGuard {
    // one worker thread keeps delivery order deterministic
    haystack::init(
        config
            .with_transport(transport)
            .with_background_worker_threads(1),
    )
    .expect("init failed")
}

#[test]
fn capture_message_delivers_exactly_one_event() {
    let _serial = serial();
    let transport = Arc::new(TestTransport::new());
    let guard = init_with(transport.clone(), Config::new());

    haystack::capture_message("Ooops", Level::Error);
    drop(guard);

    let events = transport.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0]["message"], "Ooops");
    assert_eq!(events[0]["level"], "error");
}

#[test]
fn unsampled_transaction_counts_lost_transaction_and_spans() {
    let _serial = serial();
    let transport = Arc::new(TestTransport::new());
    let guard = init_with(
        transport.clone(),
        Config::new().with_traces_sample_rate(0.0),
    );

    let transaction = haystack::start_transaction(TransactionContext::new("job", "queue.task"))
        .expect("tracing enabled");
    assert!(!transaction.is_sampled());
    for i in 0..5 {
        let span = transaction.start_child("step", &format!("step {i}"));
        span.finish();
    }
    transaction.finish();
    drop(guard);

    assert!(transport.events().is_empty());
    assert_eq!(
        transport.lost_count(DiscardReason::SampleRate, ItemKind::Transaction),
        1
    );
    // root plus five children
    assert_eq!(
        transport.lost_count(DiscardReason::SampleRate, ItemKind::Span),
        6
    );
}

#[test]
fn sampled_transaction_carries_finished_children() {
    let _serial = serial();
    let transport = Arc::new(TestTransport::new());
    let guard = init_with(
        transport.clone(),
        Config::new().with_traces_sample_rate(1.0),
    );

    let transaction = haystack::start_transaction(
        TransactionContext::new("GET /orders", "http.server")
            .with_source(haystack::TransactionSource::Route),
    )
    .expect("tracing enabled");
    haystack::with_child_span("db.query", "SELECT 1", |span| {
        assert!(span.is_some());
    });
    transaction.finish();
    drop(guard);

    let events = transport.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0]["transaction"], "GET /orders");
    assert_eq!(events[0]["transaction_info"]["source"], "route");
    assert_eq!(events[0]["spans"].as_array().unwrap().len(), 1);
    assert_eq!(events[0]["spans"][0]["op"], "db.query");
}

#[test]
fn close_is_idempotent_and_unbinds_the_hub() {
    let _serial = serial();
    let transport = Arc::new(TestTransport::new());
    let _guard = init_with(transport.clone(), Config::new());
    assert!(haystack::is_initialized());

    haystack::close();
    haystack::close();
    assert!(!haystack::is_initialized());
    assert!(haystack::capture_message("after close", Level::Error).is_none());
    assert!(transport.events().is_empty());
}

#[test]
fn with_scope_mutations_never_leak_out() {
    let _serial = serial();
    let transport = Arc::new(TestTransport::new());
    let guard = init_with(transport.clone(), Config::new());

    haystack::configure_scope(|scope| scope.set_tag("stays", "yes"));
    haystack::with_scope(|hub| {
        hub.configure_scope(|scope| scope.set_tag("temporary", "yes"));
    });
    haystack::capture_message("after block", Level::Info);
    drop(guard);

    let events = transport.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0]["tags"]["stays"], "yes");
    assert!(events[0]["tags"].get("temporary").is_none());
}

#[test]
fn continued_trace_inherits_sampling_and_propagates_headers() {
    let _serial = serial();
    let transport = Arc::new(TestTransport::new());
    let guard = init_with(
        transport.clone(),
        // static rate would reject everything; inheritance must win
        Config::new().with_traces_sample_rate(0.0),
    );

    let trace_id = "771a43a4192642f0b136d5159a501701";
    let inbound = format!("{trace_id}-7c51afd529da4a2a-1");
    let baggage = format!("haystack-trace_id={trace_id},haystack-sample_rate=0.25");
    let headers = [
        ("haystack-trace", inbound.as_str()),
        ("baggage", baggage.as_str()),
    ];

    let transaction = haystack::continue_trace(headers, "job", "queue.task")
        .expect("tracing enabled");
    assert!(transaction.is_sampled());
    assert_eq!(transaction.effective_sample_rate(), 1.0);

    let outbound = haystack::get_trace_propagation_headers();
    let trace_header = &outbound
        .iter()
        .find(|(name, _)| name == "haystack-trace")
        .expect("trace header present")
        .1;
    assert!(trace_header.starts_with(trace_id));
    assert!(trace_header.ends_with("-1"));
    let baggage_header = &outbound
        .iter()
        .find(|(name, _)| name == "baggage")
        .expect("baggage header present")
        .1;
    // inbound baggage is frozen and re-serialized untouched
    assert!(baggage_header.contains("haystack-sample_rate=0.25"));

    transaction.finish();
    drop(guard);
    assert_eq!(transport.events().len(), 1);
}

#[test]
fn before_send_filters_errors_but_not_transactions() {
    let _serial = serial();
    let transport = Arc::new(TestTransport::new());
    let guard = init_with(
        transport.clone(),
        Config::new()
            .with_traces_sample_rate(1.0)
            .with_before_send(|_| None),
    );

    haystack::capture_message("filtered", Level::Error);
    let transaction = haystack::start_transaction(TransactionContext::new("kept", "task"))
        .expect("tracing enabled");
    transaction.finish();
    drop(guard);

    let events = transport.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0]["transaction"], "kept");
    assert_eq!(
        transport.lost_count(DiscardReason::BeforeSend, ItemKind::Error),
        1
    );
}

#[test]
fn monitor_reports_paired_check_ins() {
    let _serial = serial();
    let transport = Arc::new(TestTransport::new());
    let guard = init_with(transport.clone(), Config::new());

    let result = haystack::cron::Monitor::new("nightly-report").run(|| "done");
    assert_eq!(result, "done");
    drop(guard);

    let check_ins: Vec<serde_json::Value> = transport
        .envelopes()
        .iter()
        .flat_map(|envelope| envelope.items.clone())
        .filter(|item| item.ty == ItemType::CheckIn)
        .map(|item| serde_json::from_slice(&item.payload).unwrap())
        .collect();
    assert_eq!(check_ins.len(), 2);
    assert_eq!(check_ins[0]["status"], "in_progress");
    assert_eq!(check_ins[1]["status"], "ok");
    assert_eq!(check_ins[0]["check_in_id"], check_ins[1]["check_in_id"]);
    assert!(check_ins[1]["duration"].is_number());
}

#[test]
fn ended_sessions_are_flushed_on_close() {
    let _serial = serial();
    let transport = Arc::new(TestTransport::new());
    let guard = init_with(
        transport.clone(),
        Config::new()
            .with_release("9.0.0")
            .with_auto_session_tracking(true),
    );

    haystack::start_session();
    haystack::capture_message("session error", Level::Error);
    haystack::end_session();
    drop(guard);

    let sessions: Vec<serde_json::Value> = transport
        .envelopes()
        .iter()
        .flat_map(|envelope| envelope.items.clone())
        .filter(|item| item.ty == ItemType::Sessions)
        .map(|item| serde_json::from_slice(&item.payload).unwrap())
        .collect();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0]["attrs"]["release"], "9.0.0");
    // a plain message is not an exception, the session exits cleanly
    assert_eq!(sessions[0]["aggregates"][0]["exited"], 1);
}

/// A transport whose sends block until the test releases them, to pin the
/// single worker thread while the queue fills up.
#[derive(Debug)]
struct BlockingTransport {
    inner: TestTransport,
    started: SyncSender<()>,
    release: Mutex<Receiver<()>>,
    sent: AtomicUsize,
}

impl Transport for BlockingTransport {
    fn send_envelope(&self, envelope: Envelope) -> haystack::Result<()> {
        let _ = self.started.send(());
        let _ = self
            .release
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .recv_timeout(Duration::from_secs(5));
        self.sent.fetch_add(1, Ordering::SeqCst);
        self.inner.send_envelope(envelope)
    }

    fn record_lost_event(&self, reason: DiscardReason, kind: ItemKind, count: u32) {
        self.inner.record_lost_event(reason, kind, count);
    }
}

#[test]
fn queue_overflow_fails_fast_and_counts_the_loss() {
    let _serial = serial();
    let (started_tx, started_rx) = std::sync::mpsc::sync_channel(10);
    let (release_tx, release_rx) = std::sync::mpsc::sync_channel::<()>(10);
    let transport = Arc::new(BlockingTransport {
        inner: TestTransport::new(),
        started: started_tx,
        release: Mutex::new(release_rx),
        sent: AtomicUsize::new(0),
    });

    let guard = haystack::init(
        Config::new()
            .with_transport(transport.clone())
            .with_background_worker_threads(1)
            .with_background_worker_max_queue(1)
            .with_shutdown_timeout(Duration::from_secs(10)),
    )
    .expect("init failed");

    // first event occupies the worker thread inside send_envelope
    haystack::capture_message("in flight", Level::Error);
    started_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("worker never picked up the first event");

    // second fills the single queue slot, third must be rejected
    haystack::capture_message("queued", Level::Error);
    assert!(haystack::capture_message("overflow", Level::Error).is_none());
    assert_eq!(
        transport
            .inner
            .lost_count(DiscardReason::QueueOverflow, ItemKind::Error),
        1
    );

    // unblock the worker and drain on close
    for _ in 0..3 {
        let _ = release_tx.send(());
    }
    drop(guard);
    assert_eq!(transport.sent.load(Ordering::SeqCst), 2);
}
