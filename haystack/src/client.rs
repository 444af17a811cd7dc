//! Event construction and the capture pipeline.
//!
//! The client is an immutable configuration snapshot plus a transport. It
//! reads scope state but never mutates it, and it never lets its own
//! failures unwind out of the asynchronous capture path.

use std::sync::Arc;

use rand::Rng;
use uuid::Uuid;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::protocol::{ErrorEvent, Event, Exception, Level, Values};
use crate::scope::Scope;
use crate::transport::{DiscardReason, Envelope, HttpTransport, ItemKind, Transport};
use crate::worker::BackgroundWorker;
use crate::{hay_debug, hay_warn};

/// Capture-time options.
#[derive(Clone, Copy, Debug, Default)]
pub struct EventHint {
    /// Deliver on the calling thread, re-raising transport errors.
    pub sync_send: bool,
}

/// Turns raw errors, messages and finished transactions into events and
/// forwards them for delivery.
#[derive(Debug)]
pub struct Client {
    config: Arc<Config>,
    transport: Arc<dyn Transport>,
    worker: Arc<BackgroundWorker>,
}

impl Client {
    /// Build a client from a validated config. Requires a DSN or an
    /// explicit transport.
    pub(crate) fn new(config: Arc<Config>, worker: Arc<BackgroundWorker>) -> Result<Self> {
        config.validate()?;
        let transport: Arc<dyn Transport> = match (&config.transport, config.dsn()) {
            (Some(transport), _) => transport.clone(),
            (None, Some(dsn)) => Arc::new(HttpTransport::new(&config, dsn.clone())?),
            (None, None) => {
                return Err(Error::Configuration(
                    "a DSN or an explicit transport is required".into(),
                ))
            }
        };
        Ok(Client {
            config,
            transport,
            worker,
        })
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    pub(crate) fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// An error-kind event for a plain message.
    pub fn event_from_message(&self, message: &str, level: Level) -> ErrorEvent {
        let mut event = self.base_event(level);
        event.message = Some(message.to_owned());
        event
    }

    /// An error-kind event carrying the error's source chain, outermost
    /// error last.
    pub fn event_from_error<E>(&self, err: &E) -> ErrorEvent
    where
        E: std::error::Error + ?Sized,
    {
        let mut chain = Vec::new();
        chain.push(exception_from_error(err));
        let mut source = err.source();
        while let Some(err) = source {
            chain.push(exception_from_error(err));
            source = err.source();
        }
        chain.reverse();

        let mut event = self.base_event(Level::Error);
        event.exception = Values { values: chain };
        event
    }

    fn base_event(&self, level: Level) -> ErrorEvent {
        let mut event = ErrorEvent::new(level);
        event.release = self.config.release.clone();
        event.environment = self.config.environment.clone();
        event
    }

    /// Run the capture pipeline: scope application, before-send callbacks,
    /// error sampling, then asynchronous enqueue. Never raises; a `None`
    /// return means the event was discarded or lost.
    pub(crate) fn capture_event(
        &self,
        event: Event,
        scope: &Scope,
        hint: EventHint,
    ) -> Option<Uuid> {
        let kind = event_kind(&event);
        let span_count = event_span_count(&event);

        let Some(event) = scope.apply_to_event(event) else {
            self.record_lost(DiscardReason::EventProcessor, kind, span_count);
            return None;
        };

        let event = match self.run_before_send(event) {
            Some(event) => event,
            None => {
                self.record_lost(DiscardReason::BeforeSend, kind, span_count);
                return None;
            }
        };

        // transactions carry their own pre-resolved decision and are never
        // re-sampled here
        if matches!(event, Event::Error(_)) && !self.sample_allows() {
            self.record_lost(DiscardReason::SampleRate, kind, 0);
            hay_debug!(name: "Client.EventSampledOut");
            return None;
        }

        let event = self.finalize(event);
        let event_id = event.event_id();

        if hint.sync_send {
            if let Err(_err) = self.send_event(event) {
                self.record_lost(DiscardReason::NetworkError, kind, span_count);
                hay_warn!(name: "Client.SyncSendFailed");
                return None;
            }
            return Some(event_id);
        }

        let envelope = match self.build_envelope(event) {
            Ok(envelope) => envelope,
            Err(_err) => {
                hay_warn!(name: "Client.SerializationFailed");
                return None;
            }
        };

        let transport = self.transport.clone();
        let enqueued = self.worker.perform(move || {
            if let Err(_err) = transport.send_envelope(envelope) {
                transport.record_lost_event(DiscardReason::NetworkError, kind, 1);
                if kind == ItemKind::Transaction && span_count > 0 {
                    transport.record_lost_event(
                        DiscardReason::NetworkError,
                        ItemKind::Span,
                        span_count,
                    );
                }
                hay_warn!(name: "Client.AsyncSendFailed");
            }
        });
        if !enqueued {
            self.record_lost(DiscardReason::QueueOverflow, kind, span_count);
            hay_debug!(name: "Client.QueueFull");
            return None;
        }
        Some(event_id)
    }

    /// Synchronous delivery; unlike `capture_event` this propagates the
    /// transport error to the caller.
    pub fn send_event(&self, event: Event) -> Result<()> {
        let envelope = self.build_envelope(event)?;
        self.transport.send_envelope(envelope)
    }

    /// Push buffered telemetry (client reports) out through the transport.
    pub(crate) fn flush(&self) {
        self.transport.flush();
    }

    fn run_before_send(&self, event: Event) -> Option<Event> {
        match event {
            Event::Error(error) => {
                let Some(callback) = &self.config.before_send else {
                    return Some(Event::Error(error));
                };
                callback(error).map(Event::Error)
            }
            Event::Transaction(transaction) => {
                let Some(callback) = &self.config.before_send_transaction else {
                    return Some(Event::Transaction(transaction));
                };
                callback(transaction).map(Event::Transaction)
            }
            other => Some(other),
        }
    }

    fn sample_allows(&self) -> bool {
        self.config.sample_rate >= 1.0 || rand::rng().random::<f64>() < self.config.sample_rate
    }

    fn finalize(&self, mut event: Event) -> Event {
        match &mut event {
            Event::Transaction(transaction) => {
                if transaction.release.is_none() {
                    transaction.release = self.config.release.clone();
                }
                if transaction.environment.is_none() {
                    transaction.environment = self.config.environment.clone();
                }
            }
            Event::CheckIn(check_in) => {
                if check_in.release.is_none() {
                    check_in.release = self.config.release.clone();
                }
                if check_in.environment.is_none() {
                    check_in.environment = self.config.environment.clone();
                }
            }
            Event::Error(_) => {}
        }
        event
    }

    fn build_envelope(&self, event: Event) -> Result<Envelope> {
        let mut envelope = Envelope::from_event(&event)?;
        envelope.dsn = self.config.dsn().map(|dsn| dsn.to_string());
        if let Event::Transaction(transaction) = &event {
            // dynamic sampling context of the transaction's own trace, for
            // server-side sampling decisions
            if !transaction.dynamic_sampling_context.is_empty() {
                envelope.trace = Some(transaction.dynamic_sampling_context.clone());
            }
        }
        Ok(envelope)
    }

    fn record_lost(&self, reason: DiscardReason, kind: ItemKind, span_count: u32) {
        self.transport.record_lost_event(reason, kind, 1);
        if kind == ItemKind::Transaction && span_count > 0 {
            self.transport
                .record_lost_event(reason, ItemKind::Span, span_count);
        }
    }
}

fn event_kind(event: &Event) -> ItemKind {
    match event {
        Event::Error(_) => ItemKind::Error,
        Event::Transaction(_) => ItemKind::Transaction,
        Event::CheckIn(_) => ItemKind::CheckIn,
    }
}

/// Spans carried by the event, root included, for loss accounting.
fn event_span_count(event: &Event) -> u32 {
    match event {
        Event::Transaction(transaction) => transaction.spans.len() as u32 + 1,
        _ => 0,
    }
}

fn exception_from_error<E>(err: &E) -> Exception
where
    E: std::error::Error + ?Sized,
{
    let debug_repr = format!("{err:?}");
    let value = err.to_string();
    // `Debug` output usually starts with the type name; fall back to a
    // generic label when it is a message-style representation
    let ty = debug_repr
        .split(['(', '{', ' '])
        .next()
        .filter(|candidate| {
            !candidate.is_empty()
                && candidate
                    .chars()
                    .all(|c| c.is_alphanumeric() || c == '_' || c == ':')
        })
        .unwrap_or("Error");
    Exception {
        ty: ty.to_owned(),
        value,
        module: None,
    }
}
