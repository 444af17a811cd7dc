//! Default HTTP transport, delivering envelopes over blocking `reqwest`.

use crate::config::Config;
use crate::dsn::Dsn;
use crate::error::{Error, Result};
use crate::transport::{
    ClientReportRecorder, DiscardReason, Envelope, ItemKind, RateLimiter, Transport,
    RATE_LIMITS_HEADER,
};
use crate::{hay_debug, hay_warn};

/// Authentication header carrying the public key.
pub const AUTH_HEADER: &str = "X-Haystack-Auth";
const CONTENT_TYPE: &str = "application/x-haystack-envelope";

/// Delivers envelopes to the DSN's envelope endpoint, one HTTP POST per
/// call, honoring server rate limits.
#[derive(Debug)]
pub struct HttpTransport {
    url: String,
    auth: String,
    client: reqwest::blocking::Client,
    limiter: RateLimiter,
    reports: ClientReportRecorder,
}

impl HttpTransport {
    /// Build a transport for the config's DSN.
    pub fn new(config: &Config, dsn: Dsn) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.read_timeout)
            .build()
            .map_err(|err| Error::Transport(err.to_string()))?;
        Ok(HttpTransport {
            url: dsn.envelope_uri(),
            auth: dsn.auth_header(),
            client,
            limiter: RateLimiter::new(),
            reports: ClientReportRecorder::new(config.send_client_reports),
        })
    }

    /// Drop items in currently rate-limited categories, counting the loss.
    fn filter_rate_limited(&self, envelope: &mut Envelope) {
        envelope.items.retain(|item| {
            let Some(kind) = item.ty.kind() else {
                return true;
            };
            if !self.limiter.is_limited(kind) {
                return true;
            }
            self.record_lost_event(DiscardReason::RatelimitBackoff, kind, 1);
            if kind == ItemKind::Transaction && item.span_count > 0 {
                self.record_lost_event(
                    DiscardReason::RatelimitBackoff,
                    ItemKind::Span,
                    item.span_count,
                );
            }
            false
        });
    }

    fn post(&self, envelope: Envelope) -> Result<()> {
        let body = envelope.to_vec()?;
        let response = self
            .client
            .post(&self.url)
            .header(AUTH_HEADER, &self.auth)
            .header(reqwest::header::CONTENT_TYPE, CONTENT_TYPE)
            .body(body)
            .send()
            .map_err(|err| Error::Transport(err.to_string()))?;

        let status = response.status();
        let headers = response.headers();
        let rate_limits = headers
            .get(RATE_LIMITS_HEADER)
            .and_then(|v| v.to_str().ok());
        let retry_after = headers.get("Retry-After").and_then(|v| v.to_str().ok());
        self.limiter.update(status.as_u16(), rate_limits, retry_after);

        if status.is_success() {
            hay_debug!(name: "HttpTransport.EnvelopeSent");
            Ok(())
        } else {
            Err(Error::Transport(format!(
                "envelope endpoint responded with {status}"
            )))
        }
    }
}

impl Transport for HttpTransport {
    fn send_envelope(&self, mut envelope: Envelope) -> Result<()> {
        self.filter_rate_limited(&mut envelope);
        if let Some(report) = self.reports.take_item(false) {
            envelope.add_item(report);
        }
        if envelope.is_empty() {
            return Ok(());
        }
        self.post(envelope)
    }

    fn record_lost_event(&self, reason: DiscardReason, kind: ItemKind, count: u32) {
        self.reports.record(reason, kind, count);
    }

    fn is_rate_limited(&self) -> bool {
        self.limiter.is_any_limited()
    }

    /// Push out any pending client report immediately.
    fn flush(&self) {
        if let Some(report) = self.reports.take_item(true) {
            let mut envelope = Envelope::default();
            envelope.add_item(report);
            if let Err(_err) = self.post(envelope) {
                hay_warn!(name: "HttpTransport.ClientReportFlushFailed");
            }
        }
    }
}
