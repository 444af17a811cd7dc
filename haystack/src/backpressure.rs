//! Backpressure monitoring: while the delivery pipeline is saturated, the
//! static transaction sample rate is halved per unit of the downsample
//! factor.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, SyncSender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crate::hay_debug;
use crate::transport::Transport;
use crate::util;
use crate::worker::BackgroundWorker;

const PROBE_INTERVAL: Duration = Duration::from_secs(10);
const MAX_DOWNSAMPLE_FACTOR: u32 = 10;

/// Periodically probes pipeline health and exposes the current downsample
/// factor to the sampling decision.
pub(crate) struct BackpressureMonitor {
    factor: AtomicU32,
    sender: SyncSender<()>,
    handle: Mutex<Option<thread::JoinHandle<()>>>,
}

impl std::fmt::Debug for BackpressureMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackpressureMonitor")
            .field("factor", &self.factor.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl BackpressureMonitor {
    pub(crate) fn new(
        worker: Arc<BackgroundWorker>,
        transport: Arc<dyn Transport>,
    ) -> Arc<Self> {
        let (sender, receiver) = mpsc::sync_channel(1);
        let monitor = Arc::new(BackpressureMonitor {
            factor: AtomicU32::new(0),
            sender,
            handle: Mutex::new(None),
        });

        let probe = monitor.clone();
        let handle = thread::Builder::new()
            .name("haystack-backpressure".to_string())
            .spawn(move || loop {
                match receiver.recv_timeout(PROBE_INTERVAL) {
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => return,
                    Err(RecvTimeoutError::Timeout) => {
                        probe.check_health(&worker, &transport);
                    }
                }
            })
            .expect("failed to spawn backpressure thread");
        *util::lock(&monitor.handle) = Some(handle);
        monitor
    }

    /// The factor *f* applied as `rate / 2^f` on the static-rate branch.
    pub(crate) fn downsample_factor(&self) -> u32 {
        self.factor.load(Ordering::Relaxed)
    }

    fn check_health(&self, worker: &BackgroundWorker, transport: &Arc<dyn Transport>) {
        let healthy = !worker.is_full() && !transport.is_rate_limited();
        if healthy {
            if self.factor.swap(0, Ordering::Relaxed) > 0 {
                hay_debug!(name: "Backpressure.Recovered");
            }
        } else {
            let _ = self
                .factor
                .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |f| {
                    Some(f.saturating_add(1).min(MAX_DOWNSAMPLE_FACTOR))
                });
            hay_debug!(
                name: "Backpressure.Unhealthy",
                factor = self.factor.load(Ordering::Relaxed)
            );
        }
    }

    /// Stop the probe thread. Idempotent.
    pub(crate) fn kill(&self) {
        let Some(handle) = util::lock(&self.handle).take() else {
            return;
        };
        let _ = self.sender.try_send(());
        let _ = handle.join();
    }
}
