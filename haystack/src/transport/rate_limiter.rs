//! Server-driven rate limiting.
//!
//! The ingestion service answers with an `X-Haystack-Rate-Limits` header
//! (`retry_after_seconds:category;category:scope`, comma separated) or a
//! plain `Retry-After` on 429. Affected categories are suppressed locally
//! until their deadline passes.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::transport::ItemKind;
use crate::util;

/// Header carrying per-category limits.
pub const RATE_LIMITS_HEADER: &str = "X-Haystack-Rate-Limits";
/// Fallback applied when a 429 carries no explicit retry delay.
const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(60);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
enum Category {
    All,
    Kind(ItemKind),
}

impl FromStr for Category {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, ()> {
        match s {
            "" => Ok(Category::All),
            "error" | "default" => Ok(Category::Kind(ItemKind::Error)),
            "transaction" => Ok(Category::Kind(ItemKind::Transaction)),
            "span" => Ok(Category::Kind(ItemKind::Span)),
            "check_in" | "monitor" => Ok(Category::Kind(ItemKind::CheckIn)),
            "session" => Ok(Category::Kind(ItemKind::Session)),
            _ => Err(()),
        }
    }
}

/// Tracks per-category suppression deadlines.
#[derive(Debug, Default)]
pub(crate) struct RateLimiter {
    deadlines: Mutex<HashMap<Category, Instant>>,
}

impl RateLimiter {
    pub(crate) fn new() -> Self {
        RateLimiter::default()
    }

    /// Whether deliveries of this kind are currently suppressed.
    pub(crate) fn is_limited(&self, kind: ItemKind) -> bool {
        let now = Instant::now();
        let deadlines = util::lock(&self.deadlines);
        let active = |category: &Category| {
            deadlines.get(category).is_some_and(|deadline| *deadline > now)
        };
        active(&Category::All) || active(&Category::Kind(kind))
    }

    /// Whether any category is currently suppressed.
    pub(crate) fn is_any_limited(&self) -> bool {
        let now = Instant::now();
        util::lock(&self.deadlines)
            .values()
            .any(|deadline| *deadline > now)
    }

    /// Digest a response. `rate_limits` is the `X-Haystack-Rate-Limits`
    /// value, `retry_after` the plain `Retry-After` seconds value.
    pub(crate) fn update(
        &self,
        status: u16,
        rate_limits: Option<&str>,
        retry_after: Option<&str>,
    ) {
        if let Some(header) = rate_limits {
            self.update_from_rate_limits(header);
        } else if status == 429 {
            let delay = retry_after
                .and_then(|value| f64::from_str(value.trim()).ok())
                .and_then(Self::parse_delay)
                .unwrap_or(DEFAULT_RETRY_AFTER);
            self.limit(Category::All, delay);
        }
    }

    fn update_from_rate_limits(&self, header: &str) {
        for entry in header.split(',') {
            let mut parts = entry.trim().split(':');
            let Some(delay) = parts
                .next()
                .and_then(|v| f64::from_str(v).ok())
                .and_then(Self::parse_delay)
            else {
                continue;
            };
            let categories = parts.next().unwrap_or("");
            for category in categories.split(';') {
                if let Ok(category) = category.trim().parse() {
                    self.limit(category, delay);
                }
            }
        }
    }

    /// Server-supplied seconds to a duration; `None` for values a hostile
    /// or broken server could use to crash the conversion (NaN, negative
    /// treated as zero, absurdly large).
    fn parse_delay(secs: f64) -> Option<Duration> {
        Duration::try_from_secs_f64(secs.max(0.0)).ok()
    }

    fn limit(&self, category: Category, delay: Duration) {
        let deadline = Instant::now() + delay;
        let mut deadlines = util::lock(&self.deadlines);
        let entry = deadlines.entry(category).or_insert(deadline);
        if *entry < deadline {
            *entry = deadline;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_multi_category_header() {
        let limiter = RateLimiter::new();
        limiter.update(200, Some("60:transaction;session:organization"), None);
        assert!(limiter.is_limited(ItemKind::Transaction));
        assert!(limiter.is_limited(ItemKind::Session));
        assert!(!limiter.is_limited(ItemKind::Error));
    }

    #[test]
    fn empty_category_limits_everything() {
        let limiter = RateLimiter::new();
        limiter.update(200, Some("10::key"), None);
        assert!(limiter.is_limited(ItemKind::Error));
        assert!(limiter.is_limited(ItemKind::CheckIn));
    }

    #[test]
    fn plain_429_uses_retry_after() {
        let limiter = RateLimiter::new();
        limiter.update(429, None, Some("120"));
        assert!(limiter.is_limited(ItemKind::Error));
        assert!(limiter.is_any_limited());
    }

    #[test]
    fn expired_limits_clear_themselves() {
        let limiter = RateLimiter::new();
        limiter.update(200, Some("0:transaction:"), None);
        assert!(!limiter.is_limited(ItemKind::Transaction));
    }

    #[test]
    fn oversized_retry_after_falls_back_to_default() {
        let limiter = RateLimiter::new();
        limiter.update(429, None, Some("1e300"));
        assert!(limiter.is_limited(ItemKind::Error));
    }

    #[test]
    fn oversized_rate_limit_delay_is_skipped() {
        let limiter = RateLimiter::new();
        limiter.update(200, Some("9e99:transaction:"), None);
        assert!(!limiter.is_any_limited());
        // NaN and negatives collapse to an already-expired limit
        limiter.update(200, Some("NaN:transaction:,-5:session:"), None);
        assert!(!limiter.is_any_limited());
    }

    #[test]
    fn unknown_categories_ignored() {
        let limiter = RateLimiter::new();
        limiter.update(200, Some("60:attachment:"), None);
        assert!(!limiter.is_any_limited());
        limiter.update(200, Some("garbage"), None);
        assert!(!limiter.is_any_limited());
    }
}
