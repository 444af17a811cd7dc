//! SDK configuration.
//!
//! A [`Config`] is built with `with_*` setters, optionally pre-seeded from
//! environment variables, validated once at [`init`](crate::init), and frozen
//! into the [`Client`](crate::client::Client) as an immutable snapshot.

use std::env;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crate::dsn::Dsn;
use crate::error::{Error, Result};
use crate::protocol::{ErrorEvent, TransactionEvent};
use crate::trace::SamplingContext;
use crate::transport::Transport;

/// DSN override.
pub const HAYSTACK_DSN: &str = "HAYSTACK_DSN";
/// Environment name override.
pub const HAYSTACK_ENVIRONMENT: &str = "HAYSTACK_ENVIRONMENT";
/// Release override.
pub const HAYSTACK_RELEASE: &str = "HAYSTACK_RELEASE";
/// Transaction sample rate override.
pub const HAYSTACK_TRACES_SAMPLE_RATE: &str = "HAYSTACK_TRACES_SAMPLE_RATE";

/// Default breadcrumb ring capacity.
pub const DEFAULT_MAX_BREADCRUMBS: usize = 100;
/// Default cap on spans recorded per transaction.
pub const DEFAULT_MAX_SPANS: usize = 1_000;
/// Default background queue capacity.
pub const DEFAULT_MAX_QUEUE: usize = 30;

/// Callback applied to error/message events before delivery.
pub type BeforeSend = Arc<dyn Fn(ErrorEvent) -> Option<ErrorEvent> + Send + Sync>;
/// Callback applied to transaction events before delivery.
pub type BeforeSendTransaction =
    Arc<dyn Fn(TransactionEvent) -> Option<TransactionEvent> + Send + Sync>;
/// Caller-provided sampling decision, overriding inheritance and static rate.
pub type TracesSampler = Arc<dyn Fn(&SamplingContext) -> bool + Send + Sync>;

/// Immutable-once-initialized SDK configuration.
#[derive(Clone)]
pub struct Config {
    pub(crate) dsn: Option<Dsn>,
    pub(crate) release: Option<String>,
    pub(crate) environment: Option<String>,
    pub(crate) debug: bool,
    pub(crate) sample_rate: f64,
    pub(crate) traces_sample_rate: Option<f64>,
    pub(crate) traces_sampler: Option<TracesSampler>,
    pub(crate) before_send: Option<BeforeSend>,
    pub(crate) before_send_transaction: Option<BeforeSendTransaction>,
    pub(crate) max_breadcrumbs: usize,
    pub(crate) max_spans: usize,
    pub(crate) background_worker_threads: usize,
    pub(crate) background_worker_max_queue: usize,
    pub(crate) shutdown_timeout: Duration,
    pub(crate) connect_timeout: Duration,
    pub(crate) read_timeout: Duration,
    pub(crate) enable_backpressure_handling: bool,
    pub(crate) auto_session_tracking: bool,
    pub(crate) send_client_reports: bool,
    pub(crate) transport: Option<Arc<dyn Transport>>,
}

impl Default for Config {
    /// Defaults, overridden by `HAYSTACK_*` environment variables if set.
    fn default() -> Self {
        Config {
            dsn: None,
            release: None,
            environment: Some("development".to_owned()),
            debug: false,
            sample_rate: 1.0,
            traces_sample_rate: None,
            traces_sampler: None,
            before_send: None,
            before_send_transaction: None,
            max_breadcrumbs: DEFAULT_MAX_BREADCRUMBS,
            max_spans: DEFAULT_MAX_SPANS,
            background_worker_threads: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            background_worker_max_queue: DEFAULT_MAX_QUEUE,
            shutdown_timeout: Duration::from_secs(2),
            connect_timeout: Duration::from_secs(1),
            read_timeout: Duration::from_secs(2),
            enable_backpressure_handling: false,
            auto_session_tracking: false,
            send_client_reports: true,
            transport: None,
        }
        .init_from_env_vars()
    }
}

impl Config {
    /// Create a config with defaults and environment overrides applied.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the ingestion credential. Fails on a malformed DSN.
    pub fn with_dsn(mut self, dsn: &str) -> Result<Self> {
        self.dsn = Some(dsn.parse()?);
        Ok(self)
    }

    /// Set the release identifier propagated with every event.
    pub fn with_release(mut self, release: impl Into<String>) -> Self {
        self.release = Some(release.into());
        self
    }

    /// Set the deploy environment name.
    pub fn with_environment(mut self, environment: impl Into<String>) -> Self {
        self.environment = Some(environment.into());
        self
    }

    /// Enable verbose internal diagnostics.
    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Random sampling rate for error-kind events, in `[0, 1]`.
    pub fn with_sample_rate(mut self, rate: f64) -> Self {
        self.sample_rate = rate;
        self
    }

    /// Static sampling rate for transactions; setting it enables tracing.
    pub fn with_traces_sample_rate(mut self, rate: f64) -> Self {
        self.traces_sample_rate = Some(rate);
        self
    }

    /// Sampler callback; its boolean result overrides inheritance and the
    /// static rate.
    pub fn with_traces_sampler(
        mut self,
        sampler: impl Fn(&SamplingContext) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.traces_sampler = Some(Arc::new(sampler));
        self
    }

    /// Filter/mutate error events just before delivery; `None` discards.
    pub fn with_before_send(
        mut self,
        callback: impl Fn(ErrorEvent) -> Option<ErrorEvent> + Send + Sync + 'static,
    ) -> Self {
        self.before_send = Some(Arc::new(callback));
        self
    }

    /// Filter/mutate transaction events just before delivery; `None`
    /// discards.
    pub fn with_before_send_transaction(
        mut self,
        callback: impl Fn(TransactionEvent) -> Option<TransactionEvent> + Send + Sync + 'static,
    ) -> Self {
        self.before_send_transaction = Some(Arc::new(callback));
        self
    }

    /// Breadcrumb ring capacity.
    pub fn with_max_breadcrumbs(mut self, max: usize) -> Self {
        self.max_breadcrumbs = max;
        self
    }

    /// Number of delivery worker threads; 0 sends synchronously inline.
    pub fn with_background_worker_threads(mut self, threads: usize) -> Self {
        self.background_worker_threads = threads;
        self
    }

    /// Background queue capacity; a full queue drops with a recorded loss.
    pub fn with_background_worker_max_queue(mut self, capacity: usize) -> Self {
        self.background_worker_max_queue = capacity;
        self
    }

    /// Bound on the wait for in-flight deliveries during `close`.
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Enable the backpressure monitor that downsamples transactions while
    /// the delivery pipeline is saturated.
    pub fn with_backpressure_handling(mut self, enabled: bool) -> Self {
        self.enable_backpressure_handling = enabled;
        self
    }

    /// Enable release-health session aggregation.
    pub fn with_auto_session_tracking(mut self, enabled: bool) -> Self {
        self.auto_session_tracking = enabled;
        self
    }

    /// Replace the HTTP transport, mainly for tests.
    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// The configured ingestion credential.
    pub fn dsn(&self) -> Option<&Dsn> {
        self.dsn.as_ref()
    }

    /// The configured release.
    pub fn release(&self) -> Option<&str> {
        self.release.as_deref()
    }

    /// The configured environment.
    pub fn environment(&self) -> Option<&str> {
        self.environment.as_deref()
    }

    /// Whether transactions are collected at all.
    pub fn tracing_enabled(&self) -> bool {
        self.traces_sampler.is_some() || self.traces_sample_rate.is_some()
    }

    /// Whether this config can deliver anything.
    pub(crate) fn sending_allowed(&self) -> bool {
        self.transport.is_some() || self.dsn.is_some()
    }

    /// Fatal setup validation, run once by `init`.
    pub(crate) fn validate(&self) -> Result<()> {
        if !self.sample_rate.is_finite() || !(0.0..=1.0).contains(&self.sample_rate) {
            return Err(Error::Configuration(format!(
                "sample_rate must be within [0.0, 1.0], got {}",
                self.sample_rate
            )));
        }
        Ok(())
    }

    fn init_from_env_vars(mut self) -> Self {
        if let Ok(dsn) = env::var(HAYSTACK_DSN) {
            match dsn.parse() {
                Ok(parsed) => self.dsn = Some(parsed),
                Err(_) => {
                    crate::hay_warn!(name: "Config.EnvDsnInvalid");
                }
            }
        }

        if let Ok(environment) = env::var(HAYSTACK_ENVIRONMENT) {
            self.environment = Some(environment);
        }

        if let Ok(release) = env::var(HAYSTACK_RELEASE) {
            self.release = Some(release);
        }

        if let Some(rate) = env::var(HAYSTACK_TRACES_SAMPLE_RATE)
            .ok()
            .and_then(|rate| f64::from_str(&rate).ok())
        {
            self.traces_sample_rate = Some(rate);
        }

        self
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("dsn", &self.dsn)
            .field("release", &self.release)
            .field("environment", &self.environment)
            .field("debug", &self.debug)
            .field("sample_rate", &self.sample_rate)
            .field("traces_sample_rate", &self.traces_sample_rate)
            .field("traces_sampler", &self.traces_sampler.is_some())
            .field("before_send", &self.before_send.is_some())
            .field(
                "before_send_transaction",
                &self.before_send_transaction.is_some(),
            )
            .field("max_breadcrumbs", &self.max_breadcrumbs)
            .field("max_spans", &self.max_spans)
            .field(
                "background_worker_threads",
                &self.background_worker_threads,
            )
            .field(
                "background_worker_max_queue",
                &self.background_worker_max_queue,
            )
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        assert!(Config::new().validate().is_ok());
    }

    #[test]
    fn invalid_sample_rate_is_fatal() {
        assert!(Config::new().with_sample_rate(1.5).validate().is_err());
        assert!(Config::new().with_sample_rate(-0.1).validate().is_err());
        assert!(Config::new()
            .with_sample_rate(f64::NAN)
            .validate()
            .is_err());
    }

    #[test]
    fn tracing_disabled_without_rate_or_sampler() {
        let config = Config::new();
        assert!(!config.tracing_enabled());
        assert!(config.with_traces_sample_rate(0.0).tracing_enabled());
        assert!(Config::new().with_traces_sampler(|_| true).tracing_enabled());
    }

    #[test]
    fn with_dsn_rejects_garbage() {
        assert!(Config::new().with_dsn("not a dsn").is_err());
    }
}
