//! Breadcrumbs: a bounded diagnostic trail preceding an error.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::protocol::{Level, Map};

/// One timestamped trail entry.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Breadcrumb {
    pub timestamp: f64,
    pub level: Level,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Map::is_empty")]
    pub data: Map,
}

impl Breadcrumb {
    /// A breadcrumb with the given message, stamped now.
    pub fn new(message: impl Into<String>) -> Self {
        Breadcrumb {
            timestamp: crate::util::unix_timestamp(),
            level: Level::Info,
            category: None,
            message: Some(message.into()),
            data: Map::new(),
        }
    }

    /// Set the category, e.g. `"log"` or `"http"`.
    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    /// Set the severity level.
    pub fn with_level(mut self, level: Level) -> Self {
        self.level = level;
        self
    }
}

/// Bounded FIFO of breadcrumbs; pushing onto a full buffer evicts the oldest.
#[derive(Clone, Debug)]
pub(crate) struct BreadcrumbBuffer {
    max_size: usize,
    buffer: VecDeque<Breadcrumb>,
}

impl BreadcrumbBuffer {
    pub(crate) fn new(max_size: usize) -> Self {
        BreadcrumbBuffer {
            max_size,
            buffer: VecDeque::with_capacity(max_size.min(64)),
        }
    }

    pub(crate) fn push(&mut self, crumb: Breadcrumb) {
        if self.max_size == 0 {
            return;
        }
        if self.buffer.len() >= self.max_size {
            self.buffer.pop_front();
        }
        self.buffer.push_back(crumb);
    }

    pub(crate) fn clear(&mut self) {
        self.buffer.clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.buffer.len()
    }

    pub(crate) fn max_size(&self) -> usize {
        self.max_size
    }

    pub(crate) fn to_vec(&self) -> Vec<Breadcrumb> {
        self.buffer.iter().cloned().collect()
    }
}

/// A [`log::Log`] decorator that forwards every record to an inner logger and
/// additionally records it as a breadcrumb on the current hub.
///
/// This replaces in-place patching of a host logger: install it explicitly
/// via `log::set_boxed_logger`, wrapping whatever sink the application
/// already uses.
pub struct BreadcrumbLogger {
    inner: Box<dyn log::Log>,
}

impl BreadcrumbLogger {
    /// Wrap an existing logging sink.
    pub fn new(inner: Box<dyn log::Log>) -> Self {
        BreadcrumbLogger { inner }
    }
}

impl std::fmt::Debug for BreadcrumbLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BreadcrumbLogger").finish_non_exhaustive()
    }
}

fn level_from_log(level: log::Level) -> Level {
    match level {
        log::Level::Error => Level::Error,
        log::Level::Warn => Level::Warning,
        log::Level::Info => Level::Info,
        log::Level::Debug | log::Level::Trace => Level::Debug,
    }
}

impl log::Log for BreadcrumbLogger {
    fn enabled(&self, metadata: &log::Metadata<'_>) -> bool {
        self.inner.enabled(metadata)
    }

    fn log(&self, record: &log::Record<'_>) {
        if let Some(hub) = crate::hub::Hub::current() {
            let crumb = Breadcrumb::new(record.args().to_string())
                .with_category(record.target().to_owned())
                .with_level(level_from_log(record.level()));
            hub.add_breadcrumb(crumb);
        }
        self.inner.log(record);
    }

    fn flush(&self) {
        self.inner.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_evicts_oldest_on_overflow() {
        let mut buf = BreadcrumbBuffer::new(3);
        for i in 0..5 {
            buf.push(Breadcrumb::new(format!("crumb {i}")));
        }
        assert_eq!(buf.len(), 3);
        let crumbs = buf.to_vec();
        assert_eq!(crumbs[0].message.as_deref(), Some("crumb 2"));
        assert_eq!(crumbs[2].message.as_deref(), Some("crumb 4"));
    }

    #[test]
    fn zero_capacity_buffer_stays_empty() {
        let mut buf = BreadcrumbBuffer::new(0);
        buf.push(Breadcrumb::new("dropped"));
        assert_eq!(buf.len(), 0);
    }

    #[test]
    fn breadcrumb_serializes_without_empty_data() {
        let crumb = Breadcrumb::new("hi").with_category("log");
        let json = serde_json::to_value(&crumb).unwrap();
        assert_eq!(json["message"], "hi");
        assert!(json.get("data").is_none());
    }
}
