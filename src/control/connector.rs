use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use futures::StreamExt;
use serde::Deserialize;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::retry::RetryPolicy;

use super::{commands, ControlEvent, FrameParser};

/// Control-transport tuning.
#[derive(Debug, Clone, Deserialize)]
pub struct ConnectorConfig {
    /// Capacity of the command queue between transport and worker.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Reconnect backoff.
    #[serde(default)]
    pub backoff: RetryPolicy,

    /// A connection that lives at least this long resets the backoff.
    #[serde(default = "default_reset_threshold", with = "humantime_serde")]
    pub reset_threshold: Duration,

    /// Read timeout for the streaming connection; also bounds how long a
    /// dead connection goes unnoticed.
    #[serde(default = "default_read_timeout", with = "humantime_serde")]
    pub read_timeout: Duration,
}

fn default_queue_capacity() -> usize {
    64
}

fn default_reset_threshold() -> Duration {
    Duration::from_secs(30)
}

fn default_read_timeout() -> Duration {
    Duration::from_secs(90)
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            backoff: RetryPolicy::default(),
            reset_threshold: default_reset_threshold(),
            read_timeout: default_read_timeout(),
        }
    }
}

/// Remote control for a running connector. `restart` drops the current
/// streaming connection so the next one is established fresh, used after
/// the agent's outbound identity changes.
#[derive(Clone, Default)]
pub struct ConnectorHandle {
    restart: Arc<Notify>,
}

impl ConnectorHandle {
    pub fn restart(&self) {
        self.restart.notify_one();
    }
}

/// Consumes the manager's command stream and feeds the worker queue.
///
/// Maintains exactly one streaming connection at a time, reconnecting with
/// exponential backoff that resets after a sustained connection. Commands
/// that do not fit in the queue are dropped with an error log; the
/// transport never blocks on a slow worker.
pub struct ControlConnector {
    url: String,
    config: ConnectorConfig,
    handle: ConnectorHandle,
    cancel: CancellationToken,
}

impl ControlConnector {
    /// Spawns the connector task; the receiver is the worker's command
    /// queue. The queue closes when the manager sends `Close` or the token
    /// is cancelled.
    pub fn start(
        url: String,
        config: ConnectorConfig,
        parent_cancel: &CancellationToken,
    ) -> (mpsc::Receiver<ControlEvent>, ConnectorHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let handle = ConnectorHandle::default();
        let connector = Self {
            url,
            config,
            handle: handle.clone(),
            cancel: parent_cancel.child_token(),
        };

        let task = tokio::spawn(async move { connector.run(tx).await });
        (rx, handle, task)
    }

    async fn run(self, tx: mpsc::Sender<ControlEvent>) {
        let backoff = self.config.backoff.strategy();
        let mut attempt: u32 = 0;

        let client = match reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .read_timeout(self.config.read_timeout)
            .build()
        {
            Ok(client) => client,
            Err(e) => {
                error!(error = %e, "building control stream client");
                return;
            }
        };

        loop {
            if self.cancel.is_cancelled() {
                return;
            }

            let connected_at = Instant::now();
            match self.consume_stream(&client, &tx).await {
                Ok(StreamEnd::Closed) => {
                    info!("control stream closed by manager");
                    return;
                }
                Ok(StreamEnd::Cancelled) => return,
                Ok(StreamEnd::Disconnected) => {
                    debug!("control stream ended, reconnecting");
                }
                Err(e) => {
                    warn!(error = %e, "control stream error");
                }
            }

            if connected_at.elapsed() >= self.config.reset_threshold {
                attempt = 0;
            }
            attempt += 1;

            let delay = backoff
                .next_delay(attempt)
                .unwrap_or(self.config.backoff.max_delay);
            debug!(attempt, delay = ?delay, "control reconnect backoff");

            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn consume_stream(
        &self,
        client: &reqwest::Client,
        tx: &mpsc::Sender<ControlEvent>,
    ) -> Result<StreamEnd> {
        let resp = client
            .get(&self.url)
            .header("Accept", "text/event-stream")
            .send()
            .await
            .with_context(|| format!("connecting to {}", self.url))?;

        let status = resp.status();
        if !status.is_success() {
            bail!("unexpected status {status} from {}", self.url);
        }

        info!(url = %self.url, "control stream connected");

        let mut stream = resp.bytes_stream();
        let mut parser = FrameParser::new();
        let mut buffer: Vec<u8> = Vec::new();

        loop {
            let chunk = tokio::select! {
                _ = self.cancel.cancelled() => return Ok(StreamEnd::Cancelled),
                _ = self.handle.restart.notified() => {
                    info!("control connection restart requested");
                    return Ok(StreamEnd::Disconnected);
                }
                chunk = stream.next() => chunk,
            };

            let chunk = match chunk {
                Some(Ok(chunk)) => chunk,
                Some(Err(e)) => return Err(e).context("reading control stream"),
                None => return Ok(StreamEnd::Disconnected),
            };

            // Accumulate raw bytes and split on newlines before decoding,
            // so a multibyte character spanning two chunks stays intact.
            buffer.extend_from_slice(&chunk);

            while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = buffer.drain(..=pos).collect();
                let line = String::from_utf8_lossy(&line[..line.len() - 1]);
                let Some(event) = parser.push_line(&line) else {
                    continue;
                };

                if event.event == commands::CLOSE {
                    return Ok(StreamEnd::Closed);
                }

                // Best-effort delivery: an overflowing queue drops the
                // command, the manager re-drives via GetState.
                if let Err(e) = tx.try_send(event) {
                    match e {
                        mpsc::error::TrySendError::Full(event) => {
                            error!(command = %event.event, "command queue full, dropping");
                        }
                        mpsc::error::TrySendError::Closed(_) => {
                            return Ok(StreamEnd::Cancelled);
                        }
                    }
                }
            }
        }
    }
}

enum StreamEnd {
    /// Manager sent Close; stop for good.
    Closed,
    /// Local shutdown.
    Cancelled,
    /// Transport dropped; reconnect.
    Disconnected,
}
