//! Per-group auto-poll timer task.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::core::events::EventSource;

use super::registry::{RegistryInner, MAX_CONSECUTIVE_POLL_FAILURES};

/// Handle to a running poll timer.
pub(crate) struct PollerHandle {
    cancel: CancellationToken,
    handle: tokio::task::JoinHandle<()>,
}

impl PollerHandle {
    /// Stop the timer.
    pub(crate) fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Whether the timer task has exited.
    pub(crate) fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for PollerHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Spawn the poll timer for one group.
///
/// Ticks are coalesced: a tick that fires while the previous poll is
/// still awaiting the core is skipped, so at most one poll per group is
/// ever outstanding. After ten consecutive failed ticks the timer
/// suspends itself and reports `repeated-failures`.
pub(crate) fn spawn_poller(
    inner: Arc<RegistryInner>,
    group_id: String,
    rate_seconds: f64,
) -> PollerHandle {
    let cancel = CancellationToken::new();
    let task_cancel = cancel.clone();

    let handle = tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs_f64(rate_seconds));
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut consecutive_failures: u32 = 0;

        loop {
            tokio::select! {
                biased;
                _ = task_cancel.cancelled() => return,
                _ = interval.tick() => {
                    match inner.poll_once(&group_id, EventSource::SdkControlEvent).await {
                        Ok(_) => {
                            consecutive_failures = 0;
                        }
                        Err(e) => {
                            consecutive_failures += 1;
                            tracing::warn!(
                                group = %group_id,
                                failures = consecutive_failures,
                                error = %e,
                                "Change-group poll tick failed"
                            );
                            if consecutive_failures >= MAX_CONSECUTIVE_POLL_FAILURES {
                                tracing::error!(
                                    group = %group_id,
                                    "Suspending auto-poll after repeated failures"
                                );
                                inner.poller_suspended(&group_id, "repeated-failures");
                                return;
                            }
                        }
                    }
                }
            }
        }
    });

    PollerHandle { cancel, handle }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::changegroup::registry::tests::MockReader;
    use crate::changegroup::registry::ChangeGroupRegistry;
    use crate::core::events::{signal_channel, ChangeGroupSignal};
    use crate::qrwc::adapter::ControlReader;
    use std::sync::atomic::Ordering;

    #[tokio::test(start_paused = true)]
    async fn test_auto_poll_ticks_at_configured_rate() {
        let reader = MockReader::new(&["A.gain"]);
        let (signals, _rx) = signal_channel();
        let registry = ChangeGroupRegistry::new(Arc::clone(&reader) as Arc<dyn ControlReader>, signals);
        registry.add_controls("g", &["A.gain".into()]).unwrap();
        registry.auto_poll("g", Some(0.03)).unwrap();

        // Paused clock: one second elapses deterministically.
        tokio::time::sleep(Duration::from_millis(1000)).await;
        registry.destroy("g").unwrap();

        // 33 Hz over one second of wall time.
        let ticks = reader.read_count.load(Ordering::SeqCst);
        assert!(ticks >= 30, "expected >= 30 ticks, got {ticks}");
        assert!(ticks <= 36, "expected <= 36 ticks, got {ticks}");
    }

    #[tokio::test]
    async fn test_destroy_stops_ticks_within_one_period() {
        let reader = MockReader::new(&["A.gain"]);
        let (signals, _rx) = signal_channel();
        let registry = ChangeGroupRegistry::new(Arc::clone(&reader) as Arc<dyn ControlReader>, signals);
        registry.add_controls("g", &["A.gain".into()]).unwrap();
        registry.auto_poll("g", Some(0.03)).unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        registry.destroy("g").unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;

        let after_destroy = reader.read_count.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(reader.read_count.load(Ordering::SeqCst), after_destroy);
    }

    #[tokio::test]
    async fn test_repeated_failures_suspend_auto_poll() {
        let reader = MockReader::new(&["A.gain"]);
        reader.fail_reads.store(true, Ordering::SeqCst);
        let (signals, mut rx) = signal_channel();
        let registry = ChangeGroupRegistry::new(Arc::clone(&reader) as Arc<dyn ControlReader>, signals);
        registry.add_controls("g", &["A.gain".into()]).unwrap();
        registry.auto_poll("g", Some(0.03)).unwrap();

        // 10 failing ticks at 30 ms.
        tokio::time::sleep(Duration::from_millis(600)).await;

        let mut stopped_reason = None;
        while let Ok(signal) = rx.try_recv() {
            if let ChangeGroupSignal::AutoPollStopped { reason, .. } = signal {
                stopped_reason = Some(reason);
            }
        }
        assert_eq!(stopped_reason.as_deref(), Some("repeated-failures"));
        assert!(!registry.info("g").unwrap().active);
        // The group survives; only polling is suspended.
        assert!(registry.contains("g"));
    }

    #[tokio::test]
    async fn test_rate_update_restarts_timer() {
        let reader = MockReader::new(&["A.gain"]);
        let (signals, _rx) = signal_channel();
        let registry = ChangeGroupRegistry::new(Arc::clone(&reader) as Arc<dyn ControlReader>, signals);
        registry.add_controls("g", &["A.gain".into()]).unwrap();

        registry.auto_poll("g", Some(0.03)).unwrap();
        registry.auto_poll("g", Some(1.0)).unwrap();
        assert_eq!(registry.info("g").unwrap().poll_rate_seconds, 1.0);

        // The slow timer polls immediately once, then every second.
        tokio::time::sleep(Duration::from_millis(300)).await;
        let ticks = reader.read_count.load(Ordering::SeqCst);
        assert!(ticks <= 3, "old fast timer must be gone, got {ticks} ticks");
        registry.destroy("g").unwrap();
    }
}
