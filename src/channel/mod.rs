pub mod wal;

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::sink::proxy::{SinkRetryProxy, SinkStatusHandle, WriteOutcome};
use crate::sink::SinkHealth;
use crate::trace::TraceEvent;

use self::wal::WalQueue;

/// Where a channel keeps events that have not reached the sink yet.
pub enum ChannelMode {
    /// In-memory only; a bounded queue that drops the newest events on
    /// overflow, with the drop count surfaced on the handle.
    Transient,
    /// Journal-backed; events survive restarts and are replayed in order
    /// before new traffic.
    Persistent { dir: PathBuf },
}

/// Runtime adjustments applied by the run loop without recreating the
/// channel or its sink.
enum ChannelCommand {
    ChangeBatchSize(usize),
    ChangeWriteDelay(Duration),
}

/// Handle to a running event channel.
///
/// The run loop owns the sink proxy; this handle is the producer side plus
/// the observation surface used by state reporting and the processor.
pub struct EventChannel {
    name: String,
    tx: mpsc::Sender<TraceEvent>,
    commands: mpsc::UnboundedSender<ChannelCommand>,
    dropped: Arc<AtomicU64>,
    status: SinkStatusHandle,
    cancel: CancellationToken,
    task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl EventChannel {
    /// Spawns the channel's run loop. For persistent channels this opens the
    /// journal and seeds the pending queue with the unacknowledged backlog.
    pub async fn start(
        name: impl Into<String>,
        proxy: SinkRetryProxy,
        mode: ChannelMode,
        batch_size: usize,
        write_delay: Duration,
        capacity: usize,
        parent_cancel: &CancellationToken,
    ) -> Result<Self> {
        let name = name.into();
        let batch_size = batch_size.max(1);

        let (wal, backlog) = match mode {
            ChannelMode::Transient => (None, Vec::new()),
            ChannelMode::Persistent { dir } => {
                let (wal, backlog) = WalQueue::open(&dir, &name).await?;
                (Some(wal), backlog)
            }
        };

        let (tx, rx) = mpsc::channel(capacity.max(1));
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let cancel = parent_cancel.child_token();
        let status = proxy.status_handle();
        let dropped = Arc::new(AtomicU64::new(0));

        let mut runner = Runner {
            name: name.clone(),
            rx,
            cmd_rx,
            proxy,
            wal,
            pending: backlog.into_iter().map(|event| (event, true)).collect(),
            batch_size,
            write_delay,
            deadline: None,
            failed: false,
            cancel: cancel.clone(),
        };
        if !runner.pending.is_empty() {
            runner.deadline = Some(Instant::now() + runner.write_delay);
        }

        let task = tokio::spawn(async move { runner.run().await });

        Ok(Self {
            name,
            tx,
            commands: cmd_tx,
            dropped,
            status,
            cancel,
            task: std::sync::Mutex::new(Some(task)),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Offers one event without blocking the producer. Returns false when
    /// the queue is full or the run loop has exited; the event is dropped
    /// and counted either way.
    pub fn post(&self, event: TraceEvent) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(_) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if dropped.is_power_of_two() {
                    warn!(channel = %self.name, dropped, "channel overflow, dropping events");
                }
                false
            }
        }
    }

    /// Total events dropped due to overflow since the channel started.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn set_batch_size(&self, batch_size: usize) {
        let _ = self
            .commands
            .send(ChannelCommand::ChangeBatchSize(batch_size.max(1)));
    }

    pub fn set_write_delay(&self, write_delay: Duration) {
        let _ = self
            .commands
            .send(ChannelCommand::ChangeWriteDelay(write_delay));
    }

    pub fn status(&self) -> SinkStatusHandle {
        self.status.clone()
    }

    pub fn health(&self) -> SinkHealth {
        self.status.health()
    }

    /// Stops the run loop, flushing pending events best-effort, and closes
    /// the sink. Safe to call more than once; later calls return
    /// immediately.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let task = self.task.lock().expect("channel task lock").take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!(channel = %self.name, error = %e, "channel task panicked");
            }
        }
    }
}

struct Runner {
    name: String,
    rx: mpsc::Receiver<TraceEvent>,
    cmd_rx: mpsc::UnboundedReceiver<ChannelCommand>,
    proxy: SinkRetryProxy,
    wal: Option<WalQueue>,
    /// Buffered events with a flag for whether each one made it into the
    /// journal; acknowledgments count only journaled entries.
    pending: VecDeque<(TraceEvent, bool)>,
    batch_size: usize,
    write_delay: Duration,
    deadline: Option<Instant>,
    failed: bool,
    cancel: CancellationToken,
}

enum LoopStep {
    Continue,
    Stop,
}

impl Runner {
    async fn run(mut self) {
        if let Err(e) = self.proxy.open().await {
            // Not fatal; the write path retries the open per batch.
            debug!(channel = %self.name, error = %e, "initial sink open failed");
        }

        loop {
            let step = tokio::select! {
                _ = self.cancel.cancelled() => LoopStep::Stop,

                maybe = self.rx.recv() => match maybe {
                    Some(event) => {
                        self.ingest(event).await;
                        while self.pending.len() < self.batch_size {
                            match self.rx.try_recv() {
                                Ok(event) => self.ingest(event).await,
                                Err(_) => break,
                            }
                        }
                        if self.pending.len() >= self.batch_size {
                            self.flush_full().await
                        } else {
                            LoopStep::Continue
                        }
                    }
                    None => LoopStep::Stop,
                },

                Some(cmd) = self.cmd_rx.recv() => self.apply(cmd).await,

                _ = tokio::time::sleep_until(self.deadline.unwrap_or_else(Instant::now)),
                    if self.deadline.is_some() =>
                {
                    self.flush_once().await
                }
            };

            if matches!(step, LoopStep::Stop) {
                break;
            }
        }

        self.drain().await;
        self.proxy.close().await;
        debug!(channel = %self.name, "channel stopped");
    }

    async fn ingest(&mut self, event: TraceEvent) {
        let mut journaled = false;
        if let Some(wal) = self.wal.as_mut() {
            match wal.append(&event).await {
                Ok(()) => journaled = true,
                Err(e) => {
                    // Deliver without durability rather than drop.
                    warn!(channel = %self.name, error = %e, "journal append failed");
                }
            }
        }

        if self.pending.is_empty() {
            self.deadline = Some(Instant::now() + self.write_delay);
        }
        self.pending.push_back((event, journaled));
    }

    async fn apply(&mut self, cmd: ChannelCommand) -> LoopStep {
        match cmd {
            ChannelCommand::ChangeBatchSize(batch_size) => {
                debug!(channel = %self.name, batch_size, "batch size changed");
                self.batch_size = batch_size;
                if self.pending.len() >= self.batch_size {
                    return self.flush_full().await;
                }
            }
            ChannelCommand::ChangeWriteDelay(write_delay) => {
                debug!(channel = %self.name, delay = ?write_delay, "write delay changed");
                self.write_delay = write_delay;
                if !self.pending.is_empty() {
                    self.deadline = Some(Instant::now() + self.write_delay);
                }
            }
        }
        LoopStep::Continue
    }

    /// Flushes while full batches remain.
    async fn flush_full(&mut self) -> LoopStep {
        while self.pending.len() >= self.batch_size {
            if let LoopStep::Stop = self.flush_once().await {
                return LoopStep::Stop;
            }
        }
        LoopStep::Continue
    }

    /// Writes one batch of up to `batch_size` events from the head of the
    /// pending queue.
    async fn flush_once(&mut self) -> LoopStep {
        let take = self.pending.len().min(self.batch_size);
        if take == 0 {
            self.deadline = None;
            return LoopStep::Continue;
        }

        let (events, journaled): (Vec<TraceEvent>, Vec<bool>) =
            self.pending.drain(..take).unzip();

        match self.proxy.write_batch(&events, &self.cancel).await {
            WriteOutcome::Written => {
                // Only events that actually reached the journal advance the
                // ack offset; a failed append must not retire someone
                // else's entry.
                let delivered_journaled = journaled.iter().filter(|j| **j).count() as u64;
                if delivered_journaled > 0 {
                    if let Some(wal) = self.wal.as_mut() {
                        if let Err(e) = wal.ack(delivered_journaled).await {
                            warn!(channel = %self.name, error = %e, "journal ack failed");
                        }
                    }
                }
                self.deadline = if self.pending.is_empty() {
                    None
                } else {
                    Some(Instant::now() + self.write_delay)
                };
                LoopStep::Continue
            }
            WriteOutcome::Cancelled => {
                // Undelivered; a persistent channel replays these from the
                // journal on restart.
                for entry in events.into_iter().zip(journaled).rev() {
                    self.pending.push_front(entry);
                }
                LoopStep::Stop
            }
            WriteOutcome::Failed => {
                let undelivered = events.len() + self.pending.len();
                if self.wal.is_some() {
                    info!(
                        channel = %self.name,
                        retained = undelivered,
                        "sink failed, stopping channel; journal keeps undelivered events for replay",
                    );
                } else {
                    info!(
                        channel = %self.name,
                        lost = undelivered,
                        "sink failed, stopping channel",
                    );
                }
                self.pending.clear();
                self.failed = true;
                LoopStep::Stop
            }
        }
    }

    /// Best-effort final flush on shutdown. The cancel token is already
    /// tripped, so each batch gets exactly one write attempt. After a sink
    /// failure nothing more is written.
    async fn drain(&mut self) {
        if self.failed {
            return;
        }

        while let Ok(event) = self.rx.try_recv() {
            self.ingest(event).await;
        }

        while !self.pending.is_empty() {
            if !matches!(self.flush_once().await, LoopStep::Continue) {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::RetryPolicy;
    use crate::sink::memory;
    use crate::sink::SinkKind;

    use crate::trace::{testing, TraceLevel};

    fn proxy_for(id: &str, policy: RetryPolicy) -> SinkRetryProxy {
        let sink = SinkKind::Memory(memory::MemorySink::from_options(
            &serde_json::json!({ "id": id }),
        ));
        SinkRetryProxy::new(id.to_string(), sink, policy.strategy())
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            initial_delay: Duration::from_millis(1),
            multiplier: 1.0,
            max_delay: Duration::from_millis(1),
            max_attempts: 2,
        }
    }

    async fn wait_for_events(handle: &memory::MemorySinkHandle, count: usize) {
        for _ in 0..200 {
            if handle.event_count() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("sink never received {count} events");
    }

    #[tokio::test]
    async fn test_flush_on_batch_size() {
        let cancel = CancellationToken::new();
        let channel = EventChannel::start(
            "size",
            proxy_for("ch-size", fast_policy()),
            ChannelMode::Transient,
            2,
            Duration::from_secs(60),
            64,
            &cancel,
        )
        .await
        .expect("start");

        let sink = memory::handle("ch-size");
        assert!(channel.post(testing::event("P", "a", TraceLevel::Info)));
        assert!(channel.post(testing::event("P", "b", TraceLevel::Info)));

        wait_for_events(&sink, 2).await;
        let batches = sink.batches();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 2);

        channel.shutdown().await;
    }

    #[tokio::test]
    async fn test_flush_on_write_delay() {
        let cancel = CancellationToken::new();
        let channel = EventChannel::start(
            "delay",
            proxy_for("ch-delay", fast_policy()),
            ChannelMode::Transient,
            100,
            Duration::from_millis(50),
            64,
            &cancel,
        )
        .await
        .expect("start");

        let sink = memory::handle("ch-delay");
        assert!(channel.post(testing::event("P", "lonely", TraceLevel::Info)));

        wait_for_events(&sink, 1).await;
        assert_eq!(sink.batches()[0].len(), 1);

        channel.shutdown().await;
    }

    #[tokio::test]
    async fn test_change_batch_size_takes_effect() {
        let cancel = CancellationToken::new();
        let channel = EventChannel::start(
            "resize",
            proxy_for("ch-resize", fast_policy()),
            ChannelMode::Transient,
            100,
            Duration::from_secs(60),
            64,
            &cancel,
        )
        .await
        .expect("start");

        let sink = memory::handle("ch-resize");
        assert!(channel.post(testing::event("P", "a", TraceLevel::Info)));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(sink.event_count(), 0);

        channel.set_batch_size(1);
        wait_for_events(&sink, 1).await;

        channel.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_flushes_pending() {
        let cancel = CancellationToken::new();
        let channel = EventChannel::start(
            "final",
            proxy_for("ch-final", fast_policy()),
            ChannelMode::Transient,
            100,
            Duration::from_secs(60),
            64,
            &cancel,
        )
        .await
        .expect("start");

        let sink = memory::handle("ch-final");
        assert!(channel.post(testing::event("P", "a", TraceLevel::Info)));
        assert!(channel.post(testing::event("P", "b", TraceLevel::Info)));

        channel.shutdown().await;
        assert_eq!(sink.event_count(), 2);
    }

    #[tokio::test]
    async fn test_overflow_drops_newest_and_counts() {
        let slow = RetryPolicy {
            initial_delay: Duration::from_secs(60),
            multiplier: 1.0,
            max_delay: Duration::from_secs(60),
            max_attempts: 10,
        };
        let cancel = CancellationToken::new();
        let channel = EventChannel::start(
            "full",
            proxy_for("ch-full", slow),
            ChannelMode::Transient,
            1,
            Duration::from_secs(60),
            2,
            &cancel,
        )
        .await
        .expect("start");

        memory::handle("ch-full").set_fail_writes(true);

        // First event wedges the run loop in retry backoff; the queue then
        // fills and later posts overflow.
        for i in 0..16 {
            channel.post(testing::event("P", &format!("e{i}"), TraceLevel::Info));
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        assert!(channel.dropped() > 0);
        channel.shutdown().await;
    }

    #[tokio::test]
    async fn test_persistent_failure_retains_journal_for_replay() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mode = || ChannelMode::Persistent {
            dir: dir.path().to_path_buf(),
        };

        let cancel = CancellationToken::new();
        let sink = memory::handle("ch-wal-fail");
        sink.set_fail_writes(true);

        // Retries exhaust quickly; the channel stops in the failed state.
        let channel = EventChannel::start(
            "doomed",
            proxy_for("ch-wal-fail", fast_policy()),
            mode(),
            1,
            Duration::from_millis(10),
            64,
            &cancel,
        )
        .await
        .expect("start");

        assert!(channel.post(testing::event("P", "kept", TraceLevel::Info)));
        for _ in 0..200 {
            if channel.health() == crate::sink::SinkHealth::Failed {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        channel.shutdown().await;
        assert_eq!(sink.event_count(), 0);

        // The journal kept the undelivered event; a recreated channel
        // against a healthy sink replays it.
        sink.set_fail_writes(false);
        let channel = EventChannel::start(
            "doomed",
            proxy_for("ch-wal-fail", fast_policy()),
            mode(),
            1,
            Duration::from_millis(10),
            64,
            &cancel,
        )
        .await
        .expect("restart");

        wait_for_events(&sink, 1).await;
        assert_eq!(sink.batches()[0][0].name, "kept");

        channel.shutdown().await;
    }

    #[tokio::test]
    async fn test_ack_counts_only_journaled_entries() {
        let dir = tempfile::tempdir().expect("tempdir");

        // Journal holds a and c; b failed to append and is memory-only.
        let (mut wal, _) = WalQueue::open(dir.path(), "acct").await.expect("open");
        let a = testing::event("P", "a", TraceLevel::Info);
        let b = testing::event("P", "b", TraceLevel::Info);
        let c = testing::event("P", "c", TraceLevel::Info);
        wal.append(&a).await.expect("append");
        wal.append(&c).await.expect("append");

        let (_tx, rx) = mpsc::channel(4);
        let (_cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let mut runner = Runner {
            name: "acct".to_string(),
            rx,
            cmd_rx,
            proxy: proxy_for("ch-acct", fast_policy()),
            wal: Some(wal),
            pending: VecDeque::from([(a, true), (b, false), (c, true)]),
            batch_size: 2,
            write_delay: Duration::from_secs(60),
            deadline: None,
            failed: false,
            cancel: CancellationToken::new(),
        };

        // Delivering [a, b] retires exactly one journal entry, not two:
        // c's entry must stay outstanding.
        assert!(matches!(runner.flush_once().await, LoopStep::Continue));
        assert_eq!(runner.wal.as_ref().expect("wal").backlog(), 1);
    }

    #[tokio::test]
    async fn test_persistent_backlog_replays_after_restart() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mode = || ChannelMode::Persistent {
            dir: dir.path().to_path_buf(),
        };

        let cancel = CancellationToken::new();
        let sink = memory::handle("ch-wal");
        sink.set_fail_writes(true);

        let channel = EventChannel::start(
            "durable",
            proxy_for("ch-wal", fast_policy()),
            mode(),
            100,
            Duration::from_secs(60),
            64,
            &cancel,
        )
        .await
        .expect("start");

        assert!(channel.post(testing::event("P", "first", TraceLevel::Info)));
        assert!(channel.post(testing::event("P", "second", TraceLevel::Info)));
        tokio::time::sleep(Duration::from_millis(50)).await;
        channel.shutdown().await;
        assert_eq!(sink.event_count(), 0);

        // Restart against a healthy sink; the journal backlog is delivered.
        sink.set_fail_writes(false);
        let channel = EventChannel::start(
            "durable",
            proxy_for("ch-wal", fast_policy()),
            mode(),
            1,
            Duration::from_millis(20),
            64,
            &cancel,
        )
        .await
        .expect("restart");

        wait_for_events(&sink, 2).await;
        let delivered: Vec<String> = sink
            .batches()
            .into_iter()
            .flatten()
            .map(|e| e.name)
            .collect();
        assert_eq!(delivered, ["first", "second"]);

        channel.shutdown().await;
    }
}
