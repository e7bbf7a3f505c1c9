use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{bail, Result};
use arc_swap::ArcSwap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::channel::EventChannel;
use crate::sink::SinkHealth;
use crate::trace::TraceEvent;

type ChannelMap = HashMap<String, Arc<EventChannel>>;

/// Fans trace events out to named channels.
///
/// The active and failed maps are copy-on-write snapshots: the hot path
/// loads the current active map without locking, while the (rare) mutations
/// from the control side swap in a new map. A channel whose sink exhausts
/// its retries moves to the failed map and stays there, visible in state
/// reports, until a control command removes it.
pub struct EventProcessor {
    active: Arc<ArcSwap<ChannelMap>>,
    failed: Arc<ArcSwap<ChannelMap>>,
    /// Pinged on every sink health transition so the owner can push a
    /// fresh state report instead of waiting for the next command.
    health_events: Option<mpsc::UnboundedSender<()>>,
    cancel: CancellationToken,
}

impl EventProcessor {
    pub fn new(
        parent_cancel: &CancellationToken,
        health_events: Option<mpsc::UnboundedSender<()>>,
    ) -> Self {
        Self {
            active: Arc::new(ArcSwap::from_pointee(ChannelMap::new())),
            failed: Arc::new(ArcSwap::from_pointee(ChannelMap::new())),
            health_events,
            cancel: parent_cancel.child_token(),
        }
    }

    /// Registers a channel under its name (case-insensitive). Fails if a
    /// channel with the same name exists in either map.
    pub fn add_channel(&self, channel: EventChannel) -> Result<()> {
        let key = channel.name().to_lowercase();

        if self.active.load().contains_key(&key) || self.failed.load().contains_key(&key) {
            bail!("channel {:?} already exists", channel.name());
        }

        let mut health = channel.status().subscribe();
        let channel = Arc::new(channel);

        self.active.rcu(|map| {
            let mut next = ChannelMap::clone(map);
            next.insert(key.clone(), Arc::clone(&channel));
            next
        });

        // Watch health transitions: surface each one to the owner and
        // demote the channel on retry exhaustion.
        let active = Arc::clone(&self.active);
        let failed = Arc::clone(&self.failed);
        let notify = self.health_events.clone();
        let cancel = self.cancel.clone();
        let name = key.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    changed = health.changed() => {
                        if changed.is_err() {
                            return;
                        }
                    }
                }

                if let Some(notify) = &notify {
                    let _ = notify.send(());
                }

                if *health.borrow() != SinkHealth::Failed {
                    continue;
                }

                let demoted = active.load().get(&name).cloned();
                if let Some(channel) = demoted {
                    active.rcu(|map| {
                        let mut next = ChannelMap::clone(map);
                        next.remove(&name);
                        next
                    });
                    failed.rcu(|map| {
                        let mut next = ChannelMap::clone(map);
                        next.insert(name.clone(), Arc::clone(&channel));
                        next
                    });
                    warn!(channel = %name, "channel moved to failed set");
                }
                return;
            }
        });

        debug!(channel = %key, "channel added");
        Ok(())
    }

    /// Removes the channel from whichever map holds it, without shutting it
    /// down; the caller owns the returned handle's lifecycle.
    pub fn remove_channel(&self, name: &str) -> Option<Arc<EventChannel>> {
        let key = name.to_lowercase();

        let found = self
            .active
            .load()
            .get(&key)
            .cloned()
            .or_else(|| self.failed.load().get(&key).cloned())?;

        self.active.rcu(|map| {
            let mut next = ChannelMap::clone(map);
            next.remove(&key);
            next
        });
        self.failed.rcu(|map| {
            let mut next = ChannelMap::clone(map);
            next.remove(&key);
            next
        });

        Some(found)
    }

    pub fn get(&self, name: &str) -> Option<Arc<EventChannel>> {
        let key = name.to_lowercase();
        self.active
            .load()
            .get(&key)
            .cloned()
            .or_else(|| self.failed.load().get(&key).cloned())
    }

    pub fn contains(&self, name: &str) -> bool {
        let key = name.to_lowercase();
        self.active.load().contains_key(&key) || self.failed.load().contains_key(&key)
    }

    /// Offers one event to every active channel. A slow or wedged channel
    /// never blocks the others; its queue simply overflows.
    pub fn process(&self, event: &TraceEvent) {
        let active = self.active.load();
        for channel in active.values() {
            channel.post(event.clone());
        }
    }

    pub fn active_channels(&self) -> Vec<Arc<EventChannel>> {
        self.active.load().values().cloned().collect()
    }

    pub fn failed_channels(&self) -> Vec<Arc<EventChannel>> {
        self.failed.load().values().cloned().collect()
    }

    /// Stops every channel and empties both maps.
    pub async fn shutdown(&self) {
        self.cancel.cancel();

        let active = self.active.swap(Arc::new(ChannelMap::new()));
        let failed = self.failed.swap(Arc::new(ChannelMap::new()));

        for channel in active.values().chain(failed.values()) {
            channel.shutdown().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::channel::ChannelMode;
    use crate::retry::RetryPolicy;
    use crate::sink::memory;
    use crate::sink::proxy::SinkRetryProxy;
    use crate::sink::SinkKind;
    use crate::trace::{testing, TraceLevel};

    async fn make_channel(name: &str, sink_id: &str, attempts: u32) -> EventChannel {
        let sink = SinkKind::Memory(memory::MemorySink::from_options(
            &serde_json::json!({ "id": sink_id }),
        ));
        let policy = RetryPolicy {
            initial_delay: Duration::from_millis(1),
            multiplier: 1.0,
            max_delay: Duration::from_millis(1),
            max_attempts: attempts,
        };
        EventChannel::start(
            name,
            SinkRetryProxy::new(sink_id.to_string(), sink, policy.strategy()),
            ChannelMode::Transient,
            1,
            Duration::from_millis(10),
            64,
            &CancellationToken::new(),
        )
        .await
        .expect("channel start")
    }

    #[tokio::test]
    async fn test_duplicate_name_rejected_case_insensitive() {
        let cancel = CancellationToken::new();
        let processor = EventProcessor::new(&cancel, None);

        processor
            .add_channel(make_channel("Metrics", "proc-dup-1", 2).await)
            .expect("first add");
        let err = processor
            .add_channel(make_channel("METRICS", "proc-dup-2", 2).await)
            .expect_err("duplicate add");
        assert!(err.to_string().contains("already exists"));

        processor.shutdown().await;
    }

    #[tokio::test]
    async fn test_failing_channel_does_not_stall_healthy_one() {
        let cancel = CancellationToken::new();
        let processor = EventProcessor::new(&cancel, None);

        let good = memory::handle("proc-good");
        let bad = memory::handle("proc-bad");
        bad.set_fail_writes(true);

        processor
            .add_channel(make_channel("good", "proc-good", 2).await)
            .expect("add good");
        processor
            .add_channel(make_channel("bad", "proc-bad", 2).await)
            .expect("add bad");

        for i in 0..5 {
            processor.process(&testing::event("P", &format!("e{i}"), TraceLevel::Info));
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        for _ in 0..100 {
            if good.event_count() >= 5 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(good.event_count(), 5);
        assert_eq!(bad.event_count(), 0);

        processor.shutdown().await;
    }

    #[tokio::test]
    async fn test_health_transitions_ping_the_owner() {
        let cancel = CancellationToken::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let processor = EventProcessor::new(&cancel, Some(tx));

        memory::handle("proc-notify").set_fail_writes(true);
        processor
            .add_channel(make_channel("noisy", "proc-notify", 1).await)
            .expect("add");

        processor.process(&testing::event("P", "e", TraceLevel::Info));

        // The retry/failure transitions reach the owner without any poll.
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("health ping timeout")
            .expect("health ping");

        processor.shutdown().await;
    }

    #[tokio::test]
    async fn test_exhausted_channel_moves_to_failed_set() {
        let cancel = CancellationToken::new();
        let processor = EventProcessor::new(&cancel, None);

        memory::handle("proc-demote").set_fail_writes(true);
        processor
            .add_channel(make_channel("doomed", "proc-demote", 1).await)
            .expect("add");

        processor.process(&testing::event("P", "e", TraceLevel::Info));

        for _ in 0..100 {
            if !processor.failed_channels().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert!(processor.active_channels().is_empty());
        assert_eq!(processor.failed_channels().len(), 1);
        assert!(processor.contains("doomed"));

        // Still removable by name once failed.
        let channel = processor.remove_channel("DOOMED").expect("remove");
        channel.shutdown().await;
        assert!(!processor.contains("doomed"));

        processor.shutdown().await;
    }
}
