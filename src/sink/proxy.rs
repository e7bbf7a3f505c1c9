use std::sync::{Arc, Mutex};

use anyhow::Result;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::retry::ExponentialBackoff;

use super::{SinkHealth, SinkKind, SinkStatus};
use crate::trace::TraceEvent;

/// Result of a proxied batch write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Batch delivered to the sink.
    Written,
    /// The retry backoff was interrupted by cancellation; the batch was not
    /// delivered. Distinguished from `Failed` in logging and state reports.
    Cancelled,
    /// The strategy gave up; the sink is now in the failed state.
    Failed,
}

/// Shared read-side view of a proxy's status, cloned out before the proxy
/// moves into its channel's run task.
#[derive(Clone)]
pub struct SinkStatusHandle {
    status: Arc<Mutex<SinkStatus>>,
    health: tokio::sync::watch::Receiver<SinkHealth>,
}

impl SinkStatusHandle {
    /// Snapshot of the current status for state reporting.
    pub fn snapshot(&self) -> SinkStatus {
        self.status.lock().expect("sink status lock").clone()
    }

    pub fn health(&self) -> SinkHealth {
        *self.health.borrow()
    }

    /// Receiver that resolves whenever failure/recovery transitions occur.
    pub fn subscribe(&self) -> tokio::sync::watch::Receiver<SinkHealth> {
        self.health.clone()
    }
}

/// Wraps a raw sink with retry-on-write-failure and open/close idempotence.
///
/// Blocking this proxy's own async path during a backoff sleep is fine: each
/// channel owns exactly one proxy, so a sleeping proxy never stalls another
/// channel.
pub struct SinkRetryProxy {
    name: String,
    sink: SinkKind,
    strategy: ExponentialBackoff,
    opened: bool,
    closed: bool,
    status: Arc<Mutex<SinkStatus>>,
    health_tx: tokio::sync::watch::Sender<SinkHealth>,
    health_rx: tokio::sync::watch::Receiver<SinkHealth>,
}

impl SinkRetryProxy {
    pub fn new(name: impl Into<String>, sink: SinkKind, strategy: ExponentialBackoff) -> Self {
        let (health_tx, health_rx) = tokio::sync::watch::channel(SinkHealth::Ok);
        Self {
            name: name.into(),
            sink,
            strategy,
            opened: false,
            closed: false,
            status: Arc::new(Mutex::new(SinkStatus::default())),
            health_tx,
            health_rx,
        }
    }

    pub fn sink_name(&self) -> &str {
        self.sink.name()
    }

    pub fn status_handle(&self) -> SinkStatusHandle {
        SinkStatusHandle {
            status: Arc::clone(&self.status),
            health: self.health_rx.clone(),
        }
    }

    fn set_health(&self, health: SinkHealth) {
        // send_if_modified only wakes watchers on actual transitions.
        self.health_tx.send_if_modified(|current| {
            if *current == health {
                false
            } else {
                *current = health;
                true
            }
        });
    }

    fn record_failure(&self, err: &anyhow::Error) {
        let mut status = self.status.lock().expect("sink status lock");
        status.last_error = Some(format!("{err:#}"));
        status.num_retries += 1;
        if status.retry_start.is_none() {
            status.retry_start = Some(Utc::now());
        }
    }

    fn record_recovery(&self) {
        let mut status = self.status.lock().expect("sink status lock");
        status.last_error = None;
        status.num_retries = 0;
        status.retry_start = None;
    }

    /// Opens the underlying sink. Safe to call repeatedly; a failure is
    /// logged and recorded but leaves the proxy usable (the write path will
    /// try again).
    pub async fn open(&mut self) -> Result<()> {
        if self.opened {
            return Ok(());
        }

        match self.sink.open().await {
            Ok(()) => {
                self.opened = true;
                debug!(sink = %self.name, "sink opened");
                Ok(())
            }
            Err(e) => {
                warn!(sink = %self.name, error = %e, "sink open failed");
                self.record_failure(&e);
                Err(e)
            }
        }
    }

    /// Writes one batch, retrying per the strategy. On exhaustion the sink
    /// transitions to the failed state and stays there until the channel is
    /// explicitly removed or reset.
    pub async fn write_batch(
        &mut self,
        events: &[TraceEvent],
        cancel: &CancellationToken,
    ) -> WriteOutcome {
        let mut attempt: u32 = 0;

        loop {
            if !self.opened && self.open().await.is_err() {
                // Fall through to the retry decision below with a synthetic
                // attempt; open errors were already recorded.
            } else {
                match self.sink.write_batch(events).await {
                    Ok(()) => {
                        let was_degraded = *self.health_rx.borrow() != SinkHealth::Ok;
                        self.record_recovery();
                        self.set_health(SinkHealth::Ok);
                        if was_degraded {
                            debug!(sink = %self.name, "sink recovered");
                        }
                        return WriteOutcome::Written;
                    }
                    Err(e) => {
                        warn!(
                            sink = %self.name,
                            attempt,
                            error = %e,
                            "sink write failed",
                        );
                        self.record_failure(&e);
                    }
                }
            }

            attempt += 1;
            self.set_health(SinkHealth::Retrying);

            let Some(delay) = self.strategy.next_delay(attempt) else {
                error!(
                    sink = %self.name,
                    attempts = attempt,
                    "sink retries exhausted, marking failed",
                );
                self.set_health(SinkHealth::Failed);
                return WriteOutcome::Failed;
            };

            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(sink = %self.name, "retry backoff cancelled");
                    return WriteOutcome::Cancelled;
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Closes the underlying sink; safe to call multiple times.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.opened = false;

        if let Err(e) = self.sink.close().await {
            warn!(sink = %self.name, error = %e, "sink close failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::retry::RetryPolicy;
    use crate::sink::memory;
    use crate::trace::{testing, TraceLevel};

    fn fast_policy(attempts: u32) -> ExponentialBackoff {
        RetryPolicy {
            initial_delay: Duration::from_millis(1),
            multiplier: 1.0,
            max_delay: Duration::from_millis(1),
            max_attempts: attempts,
        }
        .strategy()
    }

    fn memory_proxy(id: &str, attempts: u32) -> SinkRetryProxy {
        let sink = SinkKind::Memory(memory::MemorySink::from_options(
            &serde_json::json!({ "id": id }),
        ));
        SinkRetryProxy::new(id.to_string(), sink, fast_policy(attempts))
    }

    #[tokio::test]
    async fn test_write_success_keeps_health_ok() {
        let mut proxy = memory_proxy("proxy-ok", 3);
        let handle = proxy.status_handle();
        let cancel = CancellationToken::new();

        let outcome = proxy
            .write_batch(&[testing::event("P", "a", TraceLevel::Info)], &cancel)
            .await;

        assert_eq!(outcome, WriteOutcome::Written);
        assert_eq!(handle.health(), SinkHealth::Ok);
        assert!(handle.snapshot().last_error.is_none());
    }

    #[tokio::test]
    async fn test_exhausted_retries_mark_failed() {
        let mut proxy = memory_proxy("proxy-fail", 2);
        let handle = proxy.status_handle();
        memory::handle("proxy-fail").set_fail_writes(true);

        let cancel = CancellationToken::new();
        let outcome = proxy
            .write_batch(&[testing::event("P", "a", TraceLevel::Info)], &cancel)
            .await;

        assert_eq!(outcome, WriteOutcome::Failed);
        assert_eq!(handle.health(), SinkHealth::Failed);

        let status = handle.snapshot();
        assert!(status.last_error.is_some());
        assert!(status.num_retries >= 2);
        assert!(status.retry_start.is_some());
    }

    #[tokio::test]
    async fn test_recovery_resets_status_and_notifies() {
        let mut proxy = memory_proxy("proxy-recover", 5);
        let handle = proxy.status_handle();
        let mut health = handle.subscribe();
        let script = memory::handle("proxy-recover");

        let cancel = CancellationToken::new();

        script.set_fail_writes(true);
        let writer = tokio::spawn(async move {
            proxy
                .write_batch(&[testing::event("P", "a", TraceLevel::Info)], &cancel)
                .await
        });

        // First transition: Ok -> Retrying.
        health.changed().await.expect("health change");
        assert_eq!(*health.borrow(), SinkHealth::Retrying);

        script.set_fail_writes(false);
        let outcome = writer.await.expect("join");
        assert_eq!(outcome, WriteOutcome::Written);

        assert_eq!(handle.health(), SinkHealth::Ok);
        assert_eq!(handle.snapshot().num_retries, 0);
    }

    #[tokio::test]
    async fn test_cancellation_during_backoff() {
        let sink = SinkKind::Memory(memory::MemorySink::from_options(
            &serde_json::json!({ "id": "proxy-cancel" }),
        ));
        let slow = RetryPolicy {
            initial_delay: Duration::from_secs(60),
            multiplier: 1.0,
            max_delay: Duration::from_secs(60),
            max_attempts: 10,
        }
        .strategy();
        let mut proxy = SinkRetryProxy::new("proxy-cancel", sink, slow);
        memory::handle("proxy-cancel").set_fail_writes(true);

        let cancel = CancellationToken::new();
        let cancel2 = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            cancel2.cancel();
        });

        let outcome = proxy
            .write_batch(&[testing::event("P", "a", TraceLevel::Info)], &cancel)
            .await;
        assert_eq!(outcome, WriteOutcome::Cancelled);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let mut proxy = memory_proxy("proxy-close", 1);
        proxy.open().await.expect("open");
        proxy.close().await;
        proxy.close().await;
    }
}
