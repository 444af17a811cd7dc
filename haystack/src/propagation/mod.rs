//! Distributed trace-context propagation: the `haystack-trace` header and the
//! SDK-namespaced baggage header.

mod baggage;
mod context;

pub use baggage::{Baggage, BAGGAGE_PREFIX};
pub use context::{
    extract_trace_data, PropagationContext, BAGGAGE_HEADER_NAME, TRACE_HEADER_NAME,
};
