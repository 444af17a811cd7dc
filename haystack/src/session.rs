//! Release-health sessions, aggregated per started minute and flushed
//! periodically from a dedicated thread.

use std::collections::HashMap;
use std::sync::mpsc::{self, RecvTimeoutError, SyncSender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::transport::{Envelope, EnvelopeItem, ItemType, Transport};
use crate::util;
use crate::{hay_debug, hay_warn};

const FLUSH_INTERVAL: Duration = Duration::from_secs(60);
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Ok,
    Errored,
    Exited,
}

/// One logical user/request session.
#[derive(Clone, Debug)]
pub struct Session {
    pub(crate) started: f64,
    pub(crate) status: SessionStatus,
}

impl Session {
    pub(crate) fn new() -> Self {
        Session {
            started: util::unix_timestamp(),
            status: SessionStatus::Ok,
        }
    }

    /// An error captured during the session marks it errored.
    pub(crate) fn update_from_error(&mut self) {
        self.status = SessionStatus::Errored;
    }

    /// Terminal state when the session ends cleanly.
    pub(crate) fn close(&mut self) {
        if self.status == SessionStatus::Ok {
            self.status = SessionStatus::Exited;
        }
    }
}

#[derive(Default)]
struct Bucket {
    exited: u32,
    errored: u32,
}

enum Message {
    Shutdown(SyncSender<()>),
}

/// Aggregates ended sessions into minutely buckets and ships them as a
/// `sessions` envelope item once a minute.
pub(crate) struct SessionFlusher {
    transport: Arc<dyn Transport>,
    release: Option<String>,
    environment: Option<String>,
    pending: Arc<Mutex<HashMap<u64, Bucket>>>,
    sender: SyncSender<Message>,
    handle: Mutex<Option<thread::JoinHandle<()>>>,
}

impl std::fmt::Debug for SessionFlusher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionFlusher")
            .field("release", &self.release)
            .finish_non_exhaustive()
    }
}

impl SessionFlusher {
    pub(crate) fn new(
        transport: Arc<dyn Transport>,
        release: Option<String>,
        environment: Option<String>,
    ) -> Arc<Self> {
        let (sender, receiver) = mpsc::sync_channel(1);
        let flusher = Arc::new(SessionFlusher {
            transport,
            release,
            environment,
            pending: Arc::new(Mutex::new(HashMap::new())),
            sender,
            handle: Mutex::new(None),
        });

        let worker = flusher.clone();
        let handle = thread::Builder::new()
            .name("haystack-session-flusher".to_string())
            .spawn(move || loop {
                match receiver.recv_timeout(FLUSH_INTERVAL) {
                    Ok(Message::Shutdown(ack)) => {
                        worker.flush();
                        let _ = ack.send(());
                        return;
                    }
                    Err(RecvTimeoutError::Timeout) => worker.flush(),
                    Err(RecvTimeoutError::Disconnected) => return,
                }
            })
            .expect("failed to spawn session flusher thread");
        *util::lock(&flusher.handle) = Some(handle);
        flusher
    }

    /// Fold an ended session into its started-minute bucket. Sessions are
    /// only meaningful with a release to aggregate under.
    pub(crate) fn add_session(&self, session: &Session) {
        if self.release.is_none() {
            return;
        }
        let minute = (session.started as u64) / 60 * 60;
        let mut pending = util::lock(&self.pending);
        let bucket = pending.entry(minute).or_default();
        match session.status {
            SessionStatus::Errored => bucket.errored += 1,
            _ => bucket.exited += 1,
        }
    }

    /// Drain the buckets into one `sessions` envelope, best effort.
    pub(crate) fn flush(&self) {
        let buckets = std::mem::take(&mut *util::lock(&self.pending));
        if buckets.is_empty() {
            return;
        }

        let aggregates: Vec<_> = buckets
            .into_iter()
            .map(|(minute, bucket)| {
                serde_json::json!({
                    "started": minute as f64,
                    "exited": bucket.exited,
                    "errored": bucket.errored,
                })
            })
            .collect();
        let payload = serde_json::json!({
            "attrs": {
                "release": self.release,
                "environment": self.environment,
            },
            "aggregates": aggregates,
        });

        let mut envelope = Envelope::default();
        envelope.add_item(EnvelopeItem::new(
            ItemType::Sessions,
            payload.to_string().into_bytes(),
        ));
        if let Err(_err) = self.transport.send_envelope(envelope) {
            hay_warn!(name: "SessionFlusher.SendFailed");
        } else {
            hay_debug!(name: "SessionFlusher.Flushed");
        }
    }

    /// Flush once more and stop the thread. Idempotent.
    pub(crate) fn kill(&self) {
        let Some(handle) = util::lock(&self.handle).take() else {
            return;
        };
        let (ack_tx, ack_rx) = mpsc::sync_channel(1);
        if self.sender.try_send(Message::Shutdown(ack_tx)).is_ok() {
            let _ = ack_rx.recv_timeout(SHUTDOWN_TIMEOUT);
        }
        let _ = handle.join();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestTransport;

    #[test]
    fn sessions_aggregate_by_started_minute() {
        let transport = Arc::new(TestTransport::new());
        let flusher = SessionFlusher::new(transport.clone(), Some("1.0".into()), None);

        let mut errored = Session::new();
        errored.update_from_error();
        errored.close();
        flusher.add_session(&errored);

        let mut clean = Session::new();
        clean.close();
        flusher.add_session(&clean);

        flusher.flush();
        flusher.kill();

        let envelopes = transport.envelopes();
        assert_eq!(envelopes.len(), 1);
        let payload: serde_json::Value =
            serde_json::from_slice(&envelopes[0].items[0].payload).unwrap();
        let aggregates = payload["aggregates"].as_array().unwrap();
        assert_eq!(aggregates.len(), 1);
        assert_eq!(aggregates[0]["exited"], 1);
        assert_eq!(aggregates[0]["errored"], 1);
    }

    #[test]
    fn no_release_means_no_sessions() {
        let transport = Arc::new(TestTransport::new());
        let flusher = SessionFlusher::new(transport.clone(), None, None);
        let mut session = Session::new();
        session.close();
        flusher.add_session(&session);
        flusher.flush();
        flusher.kill();
        assert!(transport.envelopes().is_empty());
    }

    #[test]
    fn kill_is_idempotent() {
        let transport = Arc::new(TestTransport::new());
        let flusher = SessionFlusher::new(transport, Some("1.0".into()), None);
        flusher.kill();
        flusher.kill();
    }
}
