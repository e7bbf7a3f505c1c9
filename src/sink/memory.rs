use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use anyhow::{bail, Result};
use serde::Deserialize;

use crate::trace::TraceEvent;

#[derive(Debug, Deserialize)]
struct MemorySinkOptions {
    /// Registry key; sinks created with the same id share one handle.
    #[serde(default)]
    id: String,
}

/// Shared observation/scripting handle for a memory sink.
///
/// Obtained via [`handle`]; lets tests inspect delivered batches and script
/// write failures for a sink created through the profile-driven registry.
#[derive(Clone, Default)]
pub struct MemorySinkHandle {
    batches: Arc<Mutex<Vec<Vec<TraceEvent>>>>,
    fail_writes: Arc<AtomicBool>,
    open_count: Arc<AtomicUsize>,
}

impl MemorySinkHandle {
    /// All batches written so far, in write order.
    pub fn batches(&self) -> Vec<Vec<TraceEvent>> {
        self.batches.lock().expect("memory sink lock").clone()
    }

    /// Total number of events across all batches.
    pub fn event_count(&self) -> usize {
        self.batches
            .lock()
            .expect("memory sink lock")
            .iter()
            .map(Vec::len)
            .sum()
    }

    /// Makes subsequent writes fail (or succeed again).
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Number of times the sink was opened.
    pub fn open_count(&self) -> usize {
        self.open_count.load(Ordering::SeqCst)
    }
}

fn registry() -> &'static Mutex<HashMap<String, MemorySinkHandle>> {
    static REGISTRY: OnceLock<Mutex<HashMap<String, MemorySinkHandle>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Returns the shared handle for the given memory sink id, creating it if
/// no sink with that id exists yet.
pub fn handle(id: &str) -> MemorySinkHandle {
    registry()
        .lock()
        .expect("memory sink registry lock")
        .entry(id.to_string())
        .or_default()
        .clone()
}

/// In-process sink capturing batches, used by tests and local loopback runs.
pub struct MemorySink {
    handle: MemorySinkHandle,
    opened: bool,
}

impl MemorySink {
    pub fn from_options(options: &serde_json::Value) -> Self {
        let opts: MemorySinkOptions =
            serde_json::from_value(options.clone()).unwrap_or(MemorySinkOptions {
                id: String::new(),
            });

        Self {
            handle: handle(&opts.id),
            opened: false,
        }
    }

    pub fn name(&self) -> &str {
        "memory"
    }

    pub async fn open(&mut self) -> Result<()> {
        if !self.opened {
            self.opened = true;
            self.handle.open_count.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    pub async fn write_batch(&mut self, events: &[TraceEvent]) -> Result<()> {
        if self.handle.fail_writes.load(Ordering::SeqCst) {
            bail!("memory sink write failure (scripted)");
        }

        self.handle
            .batches
            .lock()
            .expect("memory sink lock")
            .push(events.to_vec());
        Ok(())
    }

    pub async fn close(&mut self) -> Result<()> {
        self.opened = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::{testing, TraceLevel};

    #[tokio::test]
    async fn test_shared_handle_observes_writes() {
        let h = handle("obs-1");
        let mut sink = MemorySink::from_options(&serde_json::json!({"id": "obs-1"}));
        sink.open().await.expect("open");

        sink.write_batch(&[testing::event("P", "a", TraceLevel::Info)])
            .await
            .expect("write");

        assert_eq!(h.event_count(), 1);
        assert_eq!(h.batches().len(), 1);
        assert_eq!(h.open_count(), 1);
    }

    #[tokio::test]
    async fn test_scripted_failure() {
        let h = handle("obs-2");
        let mut sink = MemorySink::from_options(&serde_json::json!({"id": "obs-2"}));
        sink.open().await.expect("open");

        h.set_fail_writes(true);
        assert!(sink
            .write_batch(&[testing::event("P", "a", TraceLevel::Info)])
            .await
            .is_err());

        h.set_fail_writes(false);
        assert!(sink
            .write_batch(&[testing::event("P", "a", TraceLevel::Info)])
            .await
            .is_ok());
        assert_eq!(h.event_count(), 1);
    }
}
