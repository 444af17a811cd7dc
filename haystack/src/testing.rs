//! In-memory test doubles.
//!
//! [`TestTransport`] stands in for the HTTP transport: it keeps every
//! envelope it is handed and exposes the loss counters, so tests can assert
//! on exactly what would have gone over the wire.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use crate::error::{Error, Result};
use crate::transport::{DiscardReason, Envelope, ItemKind, ItemType, Transport};
use crate::util;

/// A transport that captures envelopes instead of sending them.
#[derive(Debug, Default)]
pub struct TestTransport {
    envelopes: Mutex<Vec<Envelope>>,
    lost: Mutex<HashMap<(DiscardReason, ItemKind), u32>>,
    rate_limited: AtomicBool,
    fail_sends: AtomicBool,
}

impl TestTransport {
    pub fn new() -> Self {
        TestTransport::default()
    }

    /// Every envelope handed to the transport so far.
    pub fn envelopes(&self) -> Vec<Envelope> {
        util::lock(&self.envelopes).clone()
    }

    /// Decoded payloads of all event and transaction items.
    pub fn events(&self) -> Vec<serde_json::Value> {
        self.envelopes()
            .iter()
            .flat_map(|envelope| envelope.items.clone())
            .filter(|item| matches!(item.ty, ItemType::Event | ItemType::Transaction))
            .filter_map(|item| serde_json::from_slice(&item.payload).ok())
            .collect()
    }

    /// The accumulated loss counter for one (reason, kind) pair.
    pub fn lost_count(&self, reason: DiscardReason, kind: ItemKind) -> u32 {
        util::lock(&self.lost)
            .get(&(reason, kind))
            .copied()
            .unwrap_or(0)
    }

    /// Make `is_rate_limited` report the given state.
    pub fn set_rate_limited(&self, limited: bool) {
        self.rate_limited.store(limited, Ordering::SeqCst);
    }

    /// Make every subsequent send fail with a transport error.
    pub fn set_fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    pub fn clear(&self) {
        util::lock(&self.envelopes).clear();
        util::lock(&self.lost).clear();
    }
}

impl Transport for TestTransport {
    fn send_envelope(&self, envelope: Envelope) -> Result<()> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(Error::Transport("test transport failure".into()));
        }
        util::lock(&self.envelopes).push(envelope);
        Ok(())
    }

    fn record_lost_event(&self, reason: DiscardReason, kind: ItemKind, count: u32) {
        if count == 0 {
            return;
        }
        *util::lock(&self.lost).entry((reason, kind)).or_insert(0) += count;
    }

    fn is_rate_limited(&self) -> bool {
        self.rate_limited.load(Ordering::SeqCst)
    }
}
