use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Result};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::control::{commands, ControlEvent};

/// Keep-alive frame enqueued for idle agents.
const KEEP_ALIVE_EVENT: &str = "KeepAlive";

/// Writes the mailbox's events to one live agent connection.
///
/// Implemented by the HTTP surface (one writer per streaming response) and
/// by tests.
pub trait ConnectionWriter: Send {
    fn write(
        &mut self,
        event: &ControlEvent,
    ) -> impl std::future::Future<Output = Result<()>> + Send;
}

struct Pending {
    completions: HashMap<u64, oneshot::Sender<String>>,
}

/// Manager-side mailbox for one agent.
///
/// Commands pushed here are drained by the agent's live connection; replies
/// correlate back through the locally generated event id. The mailbox is
/// unbounded: the manager side is trusted and bursts are small.
pub struct AgentProxy {
    agent_id: String,
    outbox: mpsc::UnboundedSender<ControlEvent>,
    inbox: tokio::sync::Mutex<mpsc::UnboundedReceiver<ControlEvent>>,
    next_event_id: AtomicU64,
    pending: Mutex<Pending>,
    /// Tick of last use, in the manager's sweep ticks.
    last_used_tick: AtomicU64,
    /// Cancels the previous connection's drain when a new one attaches.
    writer_epoch: Mutex<Option<CancellationToken>>,
    completed: CancellationToken,
}

impl AgentProxy {
    fn new(agent_id: &str, tick: u64) -> Self {
        let (outbox, inbox) = mpsc::unbounded_channel();
        Self {
            agent_id: agent_id.to_string(),
            outbox,
            inbox: tokio::sync::Mutex::new(inbox),
            next_event_id: AtomicU64::new(1),
            pending: Mutex::new(Pending {
                completions: HashMap::new(),
            }),
            last_used_tick: AtomicU64::new(tick),
            writer_epoch: Mutex::new(None),
            completed: CancellationToken::new(),
        }
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    /// Resolves when the mailbox has been completed by an agent close.
    pub fn completed(&self) -> CancellationToken {
        self.completed.clone()
    }

    fn touch(&self, tick: u64) {
        self.last_used_tick.store(tick, Ordering::Relaxed);
    }

    /// Posts a fire-and-forget command.
    pub fn post(&self, event: ControlEvent) -> Result<()> {
        if self.completed.is_cancelled() {
            bail!("agent {} mailbox is completed", self.agent_id);
        }
        self.outbox
            .send(event)
            .map_err(|_| anyhow::anyhow!("agent {} mailbox is gone", self.agent_id))
    }

    /// Posts a command and awaits its correlated reply. Cancellation or
    /// timeout removes the pending registration so a late reply is a no-op.
    pub async fn call(
        &self,
        event: &str,
        data: String,
        timeout: Duration,
    ) -> Result<String> {
        let event_id = self.next_event_id.fetch_add(1, Ordering::Relaxed);
        let (reply_tx, reply_rx) = oneshot::channel();

        // Register before posting so a fast reply cannot race the send.
        self.pending
            .lock()
            .expect("pending lock")
            .completions
            .insert(event_id, reply_tx);

        let frame = ControlEvent::new(event, event_id.to_string(), data);
        if let Err(e) = self.post(frame) {
            self.pending
                .lock()
                .expect("pending lock")
                .completions
                .remove(&event_id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, reply_rx).await {
            Ok(Ok(payload)) => Ok(payload),
            Ok(Err(_)) => bail!("agent {} reply channel dropped", self.agent_id),
            Err(_) => {
                self.pending
                    .lock()
                    .expect("pending lock")
                    .completions
                    .remove(&event_id);
                bail!("agent {} did not reply within {timeout:?}", self.agent_id)
            }
        }
    }

    /// Resolves the pending call registered under `event_id`. Returns false
    /// when nothing is pending under that id (already resolved, cancelled,
    /// or never registered) — completion is exactly-once.
    pub fn complete_response(&self, event_id: u64, payload: String) -> bool {
        let sender = self
            .pending
            .lock()
            .expect("pending lock")
            .completions
            .remove(&event_id);

        match sender {
            Some(sender) => sender.send(payload).is_ok(),
            None => false,
        }
    }

    /// Drains the mailbox into `writer` until the connection drops, the
    /// mailbox completes, or a newer connection replaces this one
    /// (last-connect-wins).
    pub async fn process_messages<W: ConnectionWriter>(&self, mut writer: W) {
        let my_epoch = CancellationToken::new();
        {
            let mut epoch = self.writer_epoch.lock().expect("writer epoch lock");
            if let Some(previous) = epoch.replace(my_epoch.clone()) {
                previous.cancel();
            }
        }

        // The previous drain releases the receiver when its epoch cancels.
        let mut inbox = self.inbox.lock().await;
        if my_epoch.is_cancelled() {
            // An even newer connection arrived while we waited.
            return;
        }

        debug!(agent = %self.agent_id, "connection attached");

        loop {
            let event = tokio::select! {
                _ = my_epoch.cancelled() => break,
                _ = self.completed.cancelled() => break,
                event = inbox.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };

            let is_close = event.event == commands::CLOSE;
            if let Err(e) = writer.write(&event).await {
                debug!(agent = %self.agent_id, error = %e, "connection write failed");
                break;
            }
            if is_close {
                self.completed.cancel();
                break;
            }
        }

        debug!(agent = %self.agent_id, "connection detached");
    }

    /// Completes the mailbox: a Close frame is queued for the live
    /// connection and no further sends are accepted afterwards.
    pub fn close(&self) {
        let _ = self
            .outbox
            .send(ControlEvent::new(commands::CLOSE, "", ""));
    }
}

/// Keep-alive tuning for the proxy registry.
#[derive(Debug, Clone)]
pub struct KeepAliveConfig {
    /// Sweep period; one sweep advances the tick counter by one.
    pub interval: Duration,
    /// Idle ticks after which a keep-alive frame is enqueued.
    pub idle_ticks: u64,
}

impl Default for KeepAliveConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(15),
            idle_ticks: 2,
        }
    }
}

/// Registry of agent proxies with lazy activation and keep-alive sweeping.
pub struct AgentProxyManager {
    proxies: Mutex<HashMap<String, Arc<AgentProxy>>>,
    /// Monotonic sweep counter; wraps, so all comparisons use wrapping
    /// subtraction.
    tick: AtomicU64,
    config: KeepAliveConfig,
    cancel: CancellationToken,
}

impl AgentProxyManager {
    pub fn new(config: KeepAliveConfig, parent_cancel: &CancellationToken) -> Arc<Self> {
        Arc::new(Self {
            proxies: Mutex::new(HashMap::new()),
            tick: AtomicU64::new(0),
            config,
            cancel: parent_cancel.child_token(),
        })
    }

    /// Returns the proxy for `agent_id`, creating it on first reference.
    /// A completed proxy is replaced by a fresh one.
    pub fn proxy(self: &Arc<Self>, agent_id: &str) -> Arc<AgentProxy> {
        let mut proxies = self.proxies.lock().expect("proxies lock");

        if let Some(existing) = proxies.get(agent_id) {
            if !existing.completed.is_cancelled() {
                existing.touch(self.tick.load(Ordering::Relaxed));
                return Arc::clone(existing);
            }
        }

        let proxy = Arc::new(AgentProxy::new(
            agent_id,
            self.tick.load(Ordering::Relaxed),
        ));
        proxies.insert(agent_id.to_string(), Arc::clone(&proxy));
        info!(agent = %agent_id, "agent proxy created");

        // Drop the registry entry once the mailbox completes.
        let manager = Arc::clone(self);
        let completed = proxy.completed();
        let id = agent_id.to_string();
        tokio::spawn(async move {
            completed.cancelled().await;
            manager.remove(&id);
        });

        proxy
    }

    pub fn get(&self, agent_id: &str) -> Option<Arc<AgentProxy>> {
        self.proxies
            .lock()
            .expect("proxies lock")
            .get(agent_id)
            .cloned()
    }

    fn remove(&self, agent_id: &str) {
        if self
            .proxies
            .lock()
            .expect("proxies lock")
            .remove(agent_id)
            .is_some()
        {
            info!(agent = %agent_id, "agent proxy removed");
        }
    }

    pub fn len(&self) -> usize {
        self.proxies.lock().expect("proxies lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// One keep-alive sweep: advances the tick and enqueues a keep-alive
    /// frame for every proxy idle longer than the configured tick budget.
    /// The tick counter wraps; idleness uses `wrapping_sub`, never ordering
    /// comparisons.
    pub fn keep_alive_sweep(&self) {
        let now = self.tick.fetch_add(1, Ordering::Relaxed).wrapping_add(1);

        let proxies: Vec<Arc<AgentProxy>> = self
            .proxies
            .lock()
            .expect("proxies lock")
            .values()
            .cloned()
            .collect();

        for proxy in proxies {
            let last = proxy.last_used_tick.load(Ordering::Relaxed);
            if now.wrapping_sub(last) >= self.config.idle_ticks {
                debug!(agent = %proxy.agent_id, "enqueueing keep-alive");
                if proxy
                    .post(ControlEvent::new(KEEP_ALIVE_EVENT, "", ""))
                    .is_ok()
                {
                    proxy.touch(now);
                }
            }
        }
    }

    /// Spawns the periodic keep-alive sweeper.
    pub fn start_keep_alive(self: &Arc<Self>) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(manager.config.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = manager.cancel.cancelled() => return,
                    _ = ticker.tick() => manager.keep_alive_sweep(),
                }
            }
        })
    }

    /// Force-sets the sweep tick; used to exercise counter wraparound.
    #[cfg(test)]
    fn set_tick(&self, tick: u64) {
        self.tick.store(tick, Ordering::Relaxed);
    }
}

impl Drop for AgentProxyManager {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
