//! W3C-style baggage header codec, restricted to this SDK's namespace.

use std::collections::BTreeMap;

use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, CONTROLS};

/// Key prefix identifying pairs that belong to this SDK.
pub const BAGGAGE_PREFIX: &str = "haystack-";

const ENCODE_SET: &AsciiSet = &CONTROLS.add(b' ').add(b'"').add(b';').add(b',').add(b'=');

/// Ordered key/value sampling context propagated across service boundaries.
///
/// A baggage becomes permanently immutable the moment any inbound trace data
/// is observed; from then on this process is not the head of the trace and
/// must not rewrite the sampling context.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Baggage {
    items: BTreeMap<String, String>,
    mutable: bool,
}

impl Baggage {
    /// An empty, still mutable baggage.
    pub fn new() -> Self {
        Baggage {
            items: BTreeMap::new(),
            mutable: true,
        }
    }

    /// Build a baggage from already-collected items, optionally frozen.
    pub fn from_items(items: BTreeMap<String, String>, mutable: bool) -> Self {
        Baggage { items, mutable }
    }

    /// Decode an incoming `baggage` header.
    ///
    /// Only SDK-namespaced keys (prefix `haystack-`) are decoded; foreign
    /// vendor pairs are ignored. The presence of at least one namespaced pair
    /// freezes the result.
    pub fn from_incoming_header(header: &str) -> Self {
        let mut items = BTreeMap::new();
        let mut mutable = true;

        for item in header.split(',') {
            let item = item.trim();
            let Some((key, value)) = item.split_once('=') else {
                continue;
            };
            let Some(key) = key.strip_prefix(BAGGAGE_PREFIX) else {
                continue;
            };
            if key.is_empty() || value.is_empty() {
                continue;
            }

            let key = percent_decode_str(key).decode_utf8_lossy().into_owned();
            let value = percent_decode_str(value).decode_utf8_lossy().into_owned();
            items.insert(key, value);
            mutable = false;
        }

        Baggage { items, mutable }
    }

    /// Whether this baggage may still be modified.
    pub fn is_mutable(&self) -> bool {
        self.mutable
    }

    /// Make the baggage permanently immutable.
    pub fn freeze(&mut self) {
        self.mutable = false;
    }

    /// Insert a pair; silently ignored once frozen.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        if self.mutable {
            self.items.insert(key.into(), value.into());
        }
    }

    /// The dynamic sampling context carried by this baggage, used in the
    /// envelope trace header.
    pub fn dynamic_sampling_context(&self) -> &BTreeMap<String, String> {
        &self.items
    }

    /// Serialize back to a `baggage` header value, namespacing and
    /// percent-encoding every pair.
    pub fn serialize(&self) -> String {
        let items: Vec<String> = self
            .items
            .iter()
            .map(|(k, v)| {
                format!(
                    "{}{}={}",
                    BAGGAGE_PREFIX,
                    utf8_percent_encode(k, ENCODE_SET),
                    utf8_percent_encode(v, ENCODE_SET)
                )
            })
            .collect();
        items.join(",")
    }
}
