//! Trace continuation state for contexts that have no active span.

use crate::config::Config;
use crate::propagation::Baggage;
use crate::trace::{SpanId, TraceContext, TraceId};

/// Name of the trace propagation header.
pub const TRACE_HEADER_NAME: &str = "haystack-trace";
/// Name of the baggage propagation header.
pub const BAGGAGE_HEADER_NAME: &str = "baggage";

/// Per-scope trace identity, either freshly generated or continued from an
/// inbound trace header.
#[derive(Clone, Debug)]
pub struct PropagationContext {
    pub trace_id: TraceId,
    pub span_id: SpanId,
    pub parent_span_id: Option<SpanId>,
    /// Sampling decision of the upstream transaction, if it sent one.
    pub parent_sampled: Option<bool>,
    /// Whether this context continues an externally-observed trace.
    pub incoming_trace: bool,
    baggage: Option<Baggage>,
}

impl PropagationContext {
    /// A fresh local trace context with random ids.
    pub fn new() -> Self {
        let mut rng = rand::rng();
        PropagationContext {
            trace_id: TraceId::random(&mut rng),
            span_id: SpanId::random(&mut rng),
            parent_span_id: None,
            parent_sampled: None,
            incoming_trace: false,
            baggage: None,
        }
    }

    /// Continue from inbound headers. Falls back to a fresh local context
    /// when the trace header is absent or malformed.
    pub fn from_headers<'a, I>(headers: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut trace_header = None;
        let mut baggage_header = None;
        for (key, value) in headers {
            if key.eq_ignore_ascii_case(TRACE_HEADER_NAME) {
                trace_header = Some(value);
            } else if key.eq_ignore_ascii_case(BAGGAGE_HEADER_NAME) {
                baggage_header = Some(value);
            }
        }

        let mut cx = PropagationContext::new();

        let Some(data) = trace_header.and_then(extract_trace_data) else {
            return cx;
        };
        let (trace_id, parent_span_id, parent_sampled) = data;

        let Some(trace_id) = trace_id else {
            return cx;
        };

        let mut baggage = match baggage_header {
            Some(header) if !header.is_empty() => Baggage::from_incoming_header(header),
            // Incoming trace without baggage, e.g. from an older SDK: the
            // baggage stays empty and frozen and is never repopulated as
            // head of the trace.
            _ => Baggage::new(),
        };
        baggage.freeze();

        cx.trace_id = trace_id;
        cx.parent_span_id = parent_span_id;
        cx.parent_sampled = parent_sampled;
        cx.baggage = Some(baggage);
        cx.incoming_trace = true;
        cx
    }

    /// The outbound trace header value derived from this context.
    pub fn get_traceparent(&self) -> String {
        match self.parent_sampled {
            Some(sampled) => format!(
                "{}-{}-{}",
                self.trace_id,
                self.span_id,
                if sampled { "1" } else { "0" }
            ),
            None => format!("{}-{}", self.trace_id, self.span_id),
        }
    }

    /// Trace context for embedding into an event.
    pub fn trace_context(&self) -> TraceContext {
        TraceContext {
            trace_id: self.trace_id,
            span_id: self.span_id,
            parent_span_id: self.parent_span_id,
            op: None,
            description: None,
            status: None,
        }
    }

    /// The frozen baggage captured from an inbound trace, if any.
    pub(crate) fn incoming_baggage(&self) -> Option<Baggage> {
        self.baggage.clone()
    }

    /// The frozen incoming baggage, or one populated from local state when
    /// this process is the head of the trace.
    pub(crate) fn get_baggage(&mut self, config: &Config) -> &Baggage {
        let needs_population = match &self.baggage {
            None => true,
            Some(b) => b.is_mutable(),
        };
        if needs_population {
            self.baggage = Some(self.populate_head_baggage(config));
        }
        self.baggage.as_ref().expect("baggage populated above")
    }

    fn populate_head_baggage(&self, config: &Config) -> Baggage {
        let mut baggage = Baggage::new();
        baggage.insert("trace_id", self.trace_id.to_string());
        if let Some(environment) = config.environment() {
            baggage.insert("environment", environment);
        }
        if let Some(release) = config.release() {
            baggage.insert("release", release);
        }
        if let Some(dsn) = config.dsn() {
            baggage.insert("public_key", dsn.public_key());
        }
        baggage.freeze();
        baggage
    }
}

impl Default for PropagationContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse a trace header of the form `traceid[-spanid[-sampledflag]]`, all
/// fields optional but order fixed, surrounded by optional spaces or tabs.
///
/// Returns `None` when the value does not match the grammar.
#[allow(clippy::type_complexity)]
pub fn extract_trace_data(
    header: &str,
) -> Option<(Option<TraceId>, Option<SpanId>, Option<bool>)> {
    let mut rest = header.trim_matches([' ', '\t']);

    let trace_hex = take_lower_hex(&mut rest, 32);
    take_dash(&mut rest);
    let span_hex = take_lower_hex(&mut rest, 16);
    take_dash(&mut rest);
    let sampled = take_sampled_flag(&mut rest);

    if !rest.is_empty() {
        return None;
    }

    let trace_id = match trace_hex {
        Some(hex) => Some(TraceId::from_hex(hex).ok()?),
        None => None,
    };
    let span_id = match span_hex {
        Some(hex) => Some(SpanId::from_hex(hex).ok()?),
        None => None,
    };

    Some((trace_id, span_id, sampled))
}

fn take_lower_hex<'a>(rest: &mut &'a str, len: usize) -> Option<&'a str> {
    if rest.len() >= len
        && rest
            .as_bytes()
            .iter()
            .take(len)
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(b))
    {
        let (hex, tail) = rest.split_at(len);
        *rest = tail;
        Some(hex)
    } else {
        None
    }
}

fn take_dash(rest: &mut &str) {
    if let Some(tail) = rest.strip_prefix('-') {
        *rest = tail;
    }
}

fn take_sampled_flag(rest: &mut &str) -> Option<bool> {
    if let Some(tail) = rest.strip_prefix('1') {
        *rest = tail;
        Some(true)
    } else if let Some(tail) = rest.strip_prefix('0') {
        *rest = tail;
        Some(false)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    const TRACE: &str = "771a43a4192642f0b136d5159a501701";
    const SPAN: &str = "7c51afd529da4a2a";

    #[test]
    fn extracts_full_header() {
        let header = format!("{TRACE}-{SPAN}-1");
        let (trace_id, span_id, sampled) = extract_trace_data(&header).unwrap();
        assert_eq!(trace_id.unwrap().to_string(), TRACE);
        assert_eq!(span_id.unwrap().to_string(), SPAN);
        assert_eq!(sampled, Some(true));
    }

    #[test]
    fn extracts_without_sampled_flag() {
        let header = format!("  {TRACE}-{SPAN}\t");
        let (trace_id, span_id, sampled) = extract_trace_data(&header).unwrap();
        assert!(trace_id.is_some());
        assert!(span_id.is_some());
        assert_eq!(sampled, None);
    }

    #[test]
    fn rejects_malformed_headers() {
        for header in [
            "771a43a4192642f0b136d5159a50170", // 31 chars
            "771a43a4192642f0b136d5159a501701-xyz",
            "771A43A4192642F0B136D5159A501701-7c51afd529da4a2a-1", // uppercase
            &format!("{TRACE}-{SPAN}-2"),
            &format!("{TRACE}-{SPAN}-1-extra"),
            "garbage",
        ] {
            assert!(extract_trace_data(header).is_none(), "accepted {header:?}");
        }
    }

    #[test]
    fn empty_header_extracts_nothing() {
        assert_eq!(extract_trace_data(""), Some((None, None, None)));
    }

    #[test]
    fn malformed_header_yields_fresh_context() {
        let cx = PropagationContext::from_headers([("haystack-trace", "not a trace")]);
        assert!(!cx.incoming_trace);
        assert!(cx.parent_span_id.is_none());
    }

    #[test]
    fn inbound_trace_without_baggage_freezes_empty_baggage() {
        let header = format!("{TRACE}-{SPAN}-0");
        let mut cx = PropagationContext::from_headers([("haystack-trace", header.as_str())]);
        assert!(cx.incoming_trace);
        assert_eq!(cx.parent_sampled, Some(false));

        let config = Config::new().with_release("9.9.9");
        let baggage = cx.get_baggage(&config);
        assert!(baggage.dynamic_sampling_context().is_empty());
        assert!(!baggage.is_mutable());
    }

    #[test]
    fn head_context_populates_baggage_from_config() {
        let mut cx = PropagationContext::new();
        let config = Config::new()
            .with_dsn("https://pubkey@errors.example.com/42")
            .unwrap()
            .with_release("1.2.3")
            .with_environment("staging");
        let baggage = cx.get_baggage(&config).clone();
        let dsc = baggage.dynamic_sampling_context();
        assert_eq!(dsc.get("release"), Some(&"1.2.3".to_owned()));
        assert_eq!(dsc.get("environment"), Some(&"staging".to_owned()));
        assert_eq!(dsc.get("public_key"), Some(&"pubkey".to_owned()));
        assert_eq!(dsc.get("trace_id"), Some(&cx.trace_id.to_string()));
        assert!(!baggage.is_mutable());
    }

    #[test]
    fn traceparent_includes_known_parent_decision() {
        let header = format!("{TRACE}-{SPAN}-1");
        let cx = PropagationContext::from_headers([("HAYSTACK-TRACE", header.as_str())]);
        assert!(cx.get_traceparent().ends_with("-1"));
    }
}
