//! Haystack: the runtime core of an error- and performance-telemetry SDK.
//!
//! The pipeline: application code captures errors and spans through the
//! current [`Hub`], the [`Client`] builds and filters events against the
//! current [`Scope`], and a [`BackgroundWorker`](worker::BackgroundWorker)
//! delivers envelopes through a [`Transport`](transport::Transport) without
//! blocking application threads.
//!
//! ```no_run
//! let _guard = haystack::init(
//!     haystack::Config::new()
//!         .with_dsn("https://key@errors.example.com/42")?
//!         .with_release("my-app@1.0.0")
//!         .with_traces_sample_rate(0.2),
//! )?;
//!
//! haystack::capture_message("something odd happened", haystack::Level::Warning);
//!
//! if let Some(transaction) = haystack::start_transaction(
//!     haystack::TransactionContext::new("checkout", "http.server"),
//! ) {
//!     let span = transaction.start_child("db.query", "SELECT * FROM carts");
//!     span.finish();
//!     transaction.finish();
//! }
//! # Ok::<(), haystack::Error>(())
//! ```

mod backpressure;
pub mod breadcrumb;
pub mod client;
pub mod config;
pub mod cron;
pub mod dsn;
mod error;
mod logging;
pub mod propagation;
pub mod protocol;
pub mod scope;
mod session;
pub mod testing;
pub mod trace;
pub mod transport;
mod util;
pub mod worker;

pub mod hub;

pub use breadcrumb::{Breadcrumb, BreadcrumbLogger};
pub use client::{Client, EventHint};
pub use config::Config;
pub use dsn::Dsn;
pub use error::{Error, Result};
pub use hub::Hub;
pub use protocol::{Event, Level};
pub use scope::{add_global_event_processor, Scope};
pub use trace::{Span, Transaction, TransactionContext, TransactionSource};

use std::sync::{Arc, Mutex};
use std::time::Duration;

use once_cell::sync::Lazy;
use uuid::Uuid;

use crate::backpressure::BackpressureMonitor;
use crate::cron::{MonitorConfig, MonitorStatus};
use crate::session::SessionFlusher;
use crate::worker::BackgroundWorker;

/// SDK identifier reported with every event and in the auth header.
pub const SDK_NAME: &str = "haystack.rust";

#[doc(hidden)]
#[cfg(feature = "internal-logs")]
pub mod _private {
    pub use tracing::{debug, error, info, warn};
}

/// Process-wide singletons, all guarded by one mutex. Touched only on
/// init/close and by cheap reads on the capture path.
#[derive(Default)]
struct Globals {
    main_hub: Option<Arc<Hub>>,
    worker: Option<Arc<BackgroundWorker>>,
    backpressure: Option<Arc<BackpressureMonitor>>,
    session_flusher: Option<Arc<SessionFlusher>>,
    shutdown_timeout: Duration,
}

static GLOBALS: Lazy<Mutex<Globals>> = Lazy::new(|| Mutex::new(Globals::default()));

pub(crate) fn main_hub() -> Option<Arc<Hub>> {
    util::lock(&GLOBALS).main_hub.clone()
}

pub(crate) fn backpressure_factor() -> u32 {
    util::lock(&GLOBALS)
        .backpressure
        .as_ref()
        .map(|monitor| monitor.downsample_factor())
        .unwrap_or(0)
}

pub(crate) fn session_flusher() -> Option<Arc<SessionFlusher>> {
    util::lock(&GLOBALS).session_flusher.clone()
}

/// Keeps the SDK alive; dropping it closes the SDK, flushing pending
/// deliveries.
#[must_use = "dropping the guard closes the SDK"]
#[derive(Debug)]
pub struct InitGuard;

impl Drop for InitGuard {
    fn drop(&mut self) {
        close();
    }
}

/// Initialize the SDK: validate the config, start the delivery machinery
/// and install the main hub. Re-initializing closes the previous instance
/// first.
///
/// Without a DSN or transport the SDK stays installed but inactive: capture
/// calls return `None` instead of failing.
pub fn init(config: Config) -> Result<InitGuard> {
    config.validate()?;
    close();

    let config = Arc::new(config);
    let worker = Arc::new(BackgroundWorker::new(
        config.background_worker_threads,
        config.background_worker_max_queue,
    ));

    let client = if config.sending_allowed() {
        Some(Arc::new(Client::new(config.clone(), worker.clone())?))
    } else {
        hay_warn!(
            name: "Init.NoDsn",
            message = "no DSN or transport configured, events will be discarded"
        );
        None
    };

    let backpressure = match &client {
        Some(client) if config.enable_backpressure_handling => Some(BackpressureMonitor::new(
            worker.clone(),
            client.transport().clone(),
        )),
        _ => None,
    };
    let session_flusher = match &client {
        Some(client) if config.auto_session_tracking => Some(SessionFlusher::new(
            client.transport().clone(),
            config.release.clone(),
            config.environment.clone(),
        )),
        _ => None,
    };

    let hub = Hub::new(client, Scope::new(config.max_breadcrumbs));
    hub::register_current_thread(hub.clone());

    let mut globals = util::lock(&GLOBALS);
    globals.main_hub = Some(hub);
    globals.worker = Some(worker);
    globals.backpressure = backpressure;
    globals.session_flusher = session_flusher;
    globals.shutdown_timeout = config.shutdown_timeout;
    drop(globals);

    hay_info!(name: "Init.Done");
    Ok(InitGuard)
}

/// Whether a main hub is installed.
pub fn is_initialized() -> bool {
    main_hub().is_some()
}

/// Close the SDK: stop the periodic flushers, drain the background queue
/// within the configured timeout and release the main hub. Idempotent;
/// capture calls made afterwards are no-ops.
pub fn close() {
    let globals = {
        let mut guard = util::lock(&GLOBALS);
        std::mem::take(&mut *guard)
    };
    if globals.main_hub.is_none() {
        return;
    }

    if let Some(flusher) = globals.session_flusher {
        flusher.flush();
        flusher.kill();
    }
    if let Some(monitor) = globals.backpressure {
        monitor.kill();
    }
    if let Some(worker) = globals.worker {
        if worker.shutdown(globals.shutdown_timeout).is_err() {
            hay_warn!(name: "Close.ShutdownTimedOut");
        }
    }
    if let Some(hub) = &globals.main_hub {
        if let Some(client) = hub.client() {
            client.flush();
        }
    }
    hub::clear_registry();
    scope::clear_global_event_processors();
    hay_info!(name: "Close.Done");
}

/// Capture a message as an error-kind event on the current hub.
pub fn capture_message(message: &str, level: Level) -> Option<Uuid> {
    Hub::current()?.capture_message(message, level)
}

/// Capture an error and its source chain on the current hub.
pub fn capture_error<E>(err: &E) -> Option<Uuid>
where
    E: std::error::Error + ?Sized,
{
    Hub::current()?.capture_error(err)
}

/// Capture an already-built event on the current hub.
pub fn capture_event(event: Event, hint: EventHint) -> Option<Uuid> {
    Hub::current()?.capture_event(event, hint)
}

/// Mutate the current scope.
pub fn configure_scope<F, T>(f: F) -> Option<T>
where
    F: FnOnce(&mut Scope) -> T,
{
    Hub::current().map(|hub| hub.configure_scope(f))
}

/// Run `f` in a temporary scope that is discarded afterwards.
pub fn with_scope<F, T>(f: F) -> Option<T>
where
    F: FnOnce(&Hub) -> T,
{
    Hub::current().map(|hub| hub.with_scope(f))
}

/// Record a breadcrumb on the current scope.
pub fn add_breadcrumb(crumb: Breadcrumb) {
    if let Some(hub) = Hub::current() {
        hub.add_breadcrumb(crumb);
    }
}

/// Start a transaction on the current hub. `None` when the SDK is inactive
/// or tracing is disabled.
pub fn start_transaction(ctx: TransactionContext) -> Option<Transaction> {
    Hub::current()?.start_transaction(ctx)
}

/// Continue an inbound trace and start a transaction for it.
pub fn continue_trace<'a, I>(headers: I, name: &str, op: &str) -> Option<Transaction>
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    Hub::current()?.continue_trace(headers, name, op)
}

/// Run `f` under a child of the current active span; `f` gets `None` when
/// there is no active span or the SDK is inactive.
pub fn with_child_span<F, T>(op: &str, description: &str, f: F) -> T
where
    F: FnOnce(Option<&Span>) -> T,
{
    match Hub::current() {
        Some(hub) => hub.with_child_span(op, description, f),
        None => f(None),
    }
}

/// Outbound `haystack-trace` and `baggage` headers for the current context.
pub fn get_trace_propagation_headers() -> Vec<(String, String)> {
    Hub::current()
        .map(|hub| hub.get_trace_propagation_headers())
        .unwrap_or_default()
}

/// Report a cron monitor check-in; returns the check-in id to pass to the
/// terminal report.
pub fn capture_check_in(
    slug: &str,
    status: MonitorStatus,
    check_in_id: Option<Uuid>,
    duration: Option<f64>,
    monitor_config: Option<MonitorConfig>,
) -> Option<Uuid> {
    Hub::current()?.capture_check_in(slug, status, check_in_id, duration, monitor_config)
}

/// Id of the last event captured on the current hub.
pub fn last_event_id() -> Option<Uuid> {
    Hub::current()?.last_event_id()
}

/// Begin a release-health session on the current scope.
pub fn start_session() {
    if let Some(hub) = Hub::current() {
        hub.start_session();
    }
}

/// End the current release-health session.
pub fn end_session() {
    if let Some(hub) = Hub::current() {
        hub.end_session();
    }
}
