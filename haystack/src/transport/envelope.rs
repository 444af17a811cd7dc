//! The envelope wire format: one JSON header line identifying the delivery,
//! followed by `(item header, item body)` pairs, newline delimited.

use std::collections::BTreeMap;

use serde::Serialize;
use uuid::Uuid;

use crate::error::Result;
use crate::protocol::Event;
use crate::transport::ItemKind;

/// Type tag of one envelope item.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ItemType {
    Event,
    Transaction,
    CheckIn,
    Sessions,
    ClientReport,
}

impl ItemType {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            ItemType::Event => "event",
            ItemType::Transaction => "transaction",
            ItemType::CheckIn => "check_in",
            ItemType::Sessions => "sessions",
            ItemType::ClientReport => "client_report",
        }
    }

    /// The loss-accounting category of this item, if it has one. Client
    /// reports are never themselves counted as lost.
    pub(crate) fn kind(self) -> Option<ItemKind> {
        match self {
            ItemType::Event => Some(ItemKind::Error),
            ItemType::Transaction => Some(ItemKind::Transaction),
            ItemType::CheckIn => Some(ItemKind::CheckIn),
            ItemType::Sessions => Some(ItemKind::Session),
            ItemType::ClientReport => None,
        }
    }
}

/// One typed payload inside an envelope.
#[derive(Clone, Debug)]
pub struct EnvelopeItem {
    pub ty: ItemType,
    pub payload: Vec<u8>,
    /// Spans carried by a transaction payload, counted on rate-limit drops.
    pub span_count: u32,
}

impl EnvelopeItem {
    pub fn new(ty: ItemType, payload: Vec<u8>) -> Self {
        EnvelopeItem {
            ty,
            payload,
            span_count: 0,
        }
    }
}

/// A single delivery batch.
#[derive(Clone, Debug, Default)]
pub struct Envelope {
    pub event_id: Option<Uuid>,
    pub dsn: Option<String>,
    /// Dynamic sampling context of the trace this delivery belongs to.
    pub trace: Option<BTreeMap<String, String>>,
    pub items: Vec<EnvelopeItem>,
}

#[derive(Serialize)]
struct EnvelopeHeader<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    event_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    dsn: Option<&'a str>,
    sdk: crate::protocol::SdkInfo,
    sent_at: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    trace: Option<&'a BTreeMap<String, String>>,
}

#[derive(Serialize)]
struct ItemHeader {
    #[serde(rename = "type")]
    ty: &'static str,
    length: usize,
}

impl Envelope {
    /// Wrap one event into a single-item envelope.
    pub fn from_event(event: &Event) -> Result<Self> {
        let (ty, span_count) = match event {
            Event::Error(_) => (ItemType::Event, 0),
            Event::Transaction(t) => (ItemType::Transaction, t.spans.len() as u32 + 1),
            Event::CheckIn(_) => (ItemType::CheckIn, 0),
        };
        let payload = match event {
            Event::Error(e) => serde_json::to_vec(e)?,
            Event::Transaction(e) => serde_json::to_vec(e)?,
            Event::CheckIn(e) => serde_json::to_vec(e)?,
        };
        let mut item = EnvelopeItem::new(ty, payload);
        item.span_count = span_count;
        Ok(Envelope {
            event_id: Some(event.event_id()),
            dsn: None,
            trace: None,
            items: vec![item],
        })
    }

    pub fn add_item(&mut self, item: EnvelopeItem) {
        self.items.push(item);
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Serialize into the newline-delimited wire form.
    pub fn to_vec(&self) -> Result<Vec<u8>> {
        let mut out = serde_json::to_vec(&EnvelopeHeader {
            event_id: self.event_id,
            dsn: self.dsn.as_deref(),
            sdk: crate::protocol::sdk_info(),
            sent_at: crate::util::unix_timestamp(),
            trace: self.trace.as_ref(),
        })?;
        out.push(b'\n');

        for item in &self.items {
            out.extend_from_slice(&serde_json::to_vec(&ItemHeader {
                ty: item.ty.as_str(),
                length: item.payload.len(),
            })?);
            out.push(b'\n');
            out.extend_from_slice(&item.payload);
            out.push(b'\n');
        }

        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ErrorEvent, Level};

    #[test]
    fn event_envelope_has_one_item_per_event() {
        let event = Event::Error(ErrorEvent::new(Level::Error));
        let envelope = Envelope::from_event(&event).unwrap();
        assert_eq!(envelope.event_id, Some(event.event_id()));
        assert_eq!(envelope.items.len(), 1);
        assert_eq!(envelope.items[0].ty, ItemType::Event);
    }

    #[test]
    fn wire_form_is_newline_delimited_with_lengths() {
        let event = Event::Error(ErrorEvent::new(Level::Error));
        let envelope = Envelope::from_event(&event).unwrap();
        let bytes = envelope.to_vec().unwrap();
        let text = std::str::from_utf8(&bytes).unwrap();
        let mut lines = text.lines();

        let header: serde_json::Value = serde_json::from_str(lines.next().unwrap()).unwrap();
        assert!(header["event_id"].is_string());
        assert!(header["sent_at"].is_number());

        let item_header: serde_json::Value = serde_json::from_str(lines.next().unwrap()).unwrap();
        assert_eq!(item_header["type"], "event");
        let body = lines.next().unwrap();
        assert_eq!(item_header["length"].as_u64().unwrap() as usize, body.len());
    }

    #[test]
    fn transaction_item_counts_root_span() {
        use crate::protocol::{TransactionContexts, TransactionEvent, TransactionInfo};
        use crate::trace::{SpanId, TraceContext, TraceId, TransactionSource};

        let event = Event::Transaction(TransactionEvent {
            event_id: Uuid::new_v4(),
            ty: "transaction",
            platform: "rust",
            sdk: crate::protocol::sdk_info(),
            transaction: "GET /".into(),
            transaction_info: TransactionInfo {
                source: TransactionSource::Route,
            },
            start_timestamp: 0.0,
            timestamp: 1.0,
            contexts: TransactionContexts {
                trace: TraceContext {
                    trace_id: TraceId::from_hex("0").unwrap(),
                    span_id: SpanId::from_hex("0").unwrap(),
                    parent_span_id: None,
                    op: None,
                    description: None,
                    status: None,
                },
                other: Default::default(),
            },
            spans: vec![],
            release: None,
            environment: None,
            tags: Default::default(),
            extra: Default::default(),
            user: Default::default(),
            measurements: Default::default(),
            dynamic_sampling_context: Default::default(),
        });
        let envelope = Envelope::from_event(&event).unwrap();
        assert_eq!(envelope.items[0].span_count, 1);
    }
}
