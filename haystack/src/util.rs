use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

/// Lock a mutex, recovering the guard when a panicking holder poisoned it.
/// Span and scope state stays usable after a user callback panics.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Current time as fractional seconds since the unix epoch, the timestamp
/// representation used throughout the wire payloads.
pub(crate) fn unix_timestamp() -> f64 {
    timestamp_from(SystemTime::now())
}

pub(crate) fn timestamp_from(time: SystemTime) -> f64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}
