//! Distributed performance tracing: span trees, transactions and the
//! sampling decision.

mod id;
mod span;
mod transaction;

pub use id::{SpanId, TraceId};
pub use span::{Span, SpanData, SpanStatus, TraceContext, WeakSpan};
pub use transaction::{
    SamplingContext, Transaction, TransactionContext, TransactionSource,
    WeakTransaction, UNLABELED_TRANSACTION,
};

pub(crate) use span::{SpanInner, SpanRecorder};
pub(crate) use transaction::decide_sampling;
