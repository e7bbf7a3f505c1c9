use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::trace::TraceEvent;

/// Durable event queue backing a persistent channel.
///
/// Events are appended as JSON lines to a journal file; a side file records
/// how many entries have been acknowledged (delivered to the sink). On open,
/// unacknowledged entries are returned as backlog so they are replayed before
/// any new event, preserving original order. Once every entry is
/// acknowledged the journal is truncated and counters reset.
pub struct WalQueue {
    journal_path: PathBuf,
    ack_path: PathBuf,
    file: File,
    total: u64,
    acked: u64,
}

impl WalQueue {
    /// Opens (or creates) the queue named `name` under `dir`, returning the
    /// queue and the backlog of unacknowledged events in append order.
    pub async fn open(dir: &Path, name: &str) -> Result<(Self, Vec<TraceEvent>)> {
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("creating channel directory {}", dir.display()))?;

        let journal_path = dir.join(format!("{name}.wal"));
        let ack_path = dir.join(format!("{name}.ack"));

        let acked = match tokio::fs::read_to_string(&ack_path).await {
            Ok(s) => s.trim().parse::<u64>().unwrap_or(0),
            Err(_) => 0,
        };

        let mut total: u64 = 0;
        let mut backlog = Vec::new();

        if let Ok(data) = tokio::fs::read_to_string(&journal_path).await {
            for line in data.lines() {
                if line.is_empty() {
                    continue;
                }
                match serde_json::from_str::<TraceEvent>(line) {
                    Ok(event) => {
                        if total >= acked {
                            backlog.push(event);
                        }
                        total += 1;
                    }
                    Err(e) => {
                        // A torn final line from an interrupted append; the
                        // entry was never durable, so drop it and stop.
                        warn!(
                            journal = %journal_path.display(),
                            entry = total,
                            error = %e,
                            "discarding unreadable journal entry",
                        );
                        break;
                    }
                }
            }
        }

        let acked = acked.min(total);

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&journal_path)
            .await
            .with_context(|| format!("opening journal {}", journal_path.display()))?;

        if !backlog.is_empty() {
            debug!(
                journal = %journal_path.display(),
                entries = backlog.len(),
                "replaying unacknowledged journal entries",
            );
        }

        Ok((
            Self {
                journal_path,
                ack_path,
                file,
                total,
                acked,
            },
            backlog,
        ))
    }

    /// Appends one event and makes it durable before returning.
    pub async fn append(&mut self, event: &TraceEvent) -> Result<()> {
        let mut line = serde_json::to_vec(event).context("serializing journal entry")?;
        line.push(b'\n');

        self.file
            .write_all(&line)
            .await
            .with_context(|| format!("appending to {}", self.journal_path.display()))?;
        self.file
            .flush()
            .await
            .with_context(|| format!("flushing {}", self.journal_path.display()))?;

        self.total += 1;
        Ok(())
    }

    /// Acknowledges `count` entries as delivered, persisting the offset.
    /// Compacts the journal once everything outstanding is acknowledged.
    pub async fn ack(&mut self, count: u64) -> Result<()> {
        self.acked = (self.acked + count).min(self.total);

        if self.acked == self.total && self.total > 0 {
            self.file = File::create(&self.journal_path)
                .await
                .with_context(|| format!("compacting {}", self.journal_path.display()))?;
            self.total = 0;
            self.acked = 0;
        }

        self.persist_ack().await
    }

    /// Number of appended entries not yet acknowledged.
    pub fn backlog(&self) -> u64 {
        self.total - self.acked
    }

    async fn persist_ack(&self) -> Result<()> {
        let tmp = self.ack_path.with_extension("ack.tmp");
        tokio::fs::write(&tmp, self.acked.to_string())
            .await
            .with_context(|| format!("writing {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &self.ack_path)
            .await
            .with_context(|| format!("replacing {}", self.ack_path.display()))?;
        Ok(())
    }
}
