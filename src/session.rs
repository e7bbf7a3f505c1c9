use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use arc_swap::ArcSwap;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::channel::{ChannelMode, EventChannel};
use crate::filter::{compile, CompiledFilter, Diagnostic, FilterSource, Severity};
use crate::processor::EventProcessor;
use crate::retry::RetryPolicy;
use crate::sink::profile::{EventSinkProfile, LIVE_VIEW_SINK_NAME};
use crate::sink::proxy::SinkRetryProxy;
use crate::sink::SinkKind;
use crate::state::EventSinkState;
use crate::trace::{ProviderSettings, TraceSession};

/// Channel construction defaults shared by every sink in a session.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Directory for persistent channel journals.
    pub wal_dir: PathBuf,
    /// Queue capacity of each channel.
    pub channel_capacity: usize,
    /// Sink write retry policy.
    pub retry: RetryPolicy,
}

enum SessionCommand {
    ApplyProviders(Vec<ProviderSettings>, oneshot::Sender<Result<()>>),
}

/// A running trace session: the trace event loop feeding the processor,
/// one channel per sink profile, and the live filter.
///
/// The trace loop owns the `TraceSession`; provider changes reach it
/// through a command queue. A supervisor task awaits the loop, tears the
/// channels down and fires the end notification when the loop exits on its
/// own (trace stream ended or crashed) rather than via `shutdown`.
pub struct SessionWorker {
    settings: SessionSettings,
    processor: Arc<EventProcessor>,
    filter: Arc<ArcSwap<CompiledFilter>>,
    profiles: Mutex<HashMap<String, EventSinkProfile>>,
    enabled: Arc<Mutex<Vec<ProviderSettings>>>,
    commands: mpsc::UnboundedSender<SessionCommand>,
    cancel: CancellationToken,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl SessionWorker {
    /// Builds channels for every profile, enables the providers and spawns
    /// the trace loop. `on_end` fires exactly once if the loop exits
    /// without `shutdown` being called; `sink_health` is pinged on every
    /// sink health transition.
    pub async fn start(
        mut session: TraceSession,
        profiles: Vec<EventSinkProfile>,
        filter_source: &FilterSource,
        providers: &[ProviderSettings],
        settings: SessionSettings,
        on_end: Box<dyn FnOnce() + Send>,
        sink_health: mpsc::UnboundedSender<()>,
        parent_cancel: &CancellationToken,
    ) -> Result<Self> {
        let cancel = parent_cancel.child_token();
        let processor = Arc::new(EventProcessor::new(&cancel, Some(sink_health)));

        let (compiled, diagnostics) = compile(filter_source);
        let compiled = match compiled {
            Some(f) => f,
            None => {
                warn!(
                    errors = diagnostics.len(),
                    "persisted filter does not compile, starting with empty filter",
                );
                CompiledFilter::default()
            }
        };
        let filter = Arc::new(ArcSwap::from_pointee(compiled));

        session
            .apply_providers(providers)
            .context("enabling trace providers")?;
        let enabled = Arc::new(Mutex::new(session.enabled_providers()));

        let worker = Self {
            settings,
            processor,
            filter,
            profiles: Mutex::new(HashMap::new()),
            enabled,
            commands: mpsc::unbounded_channel().0,
            cancel,
            supervisor: Mutex::new(None),
        };

        for profile in profiles {
            if let Err(e) = worker.create_channel_for_profile(profile.clone()).await {
                // A sink that cannot be constructed never gets a channel;
                // the rest of the session still starts.
                error!(sink = %profile.name, error = %e, "sink creation failed");
            }
        }

        let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel();
        let loop_cancel = worker.cancel.clone();
        let loop_processor = Arc::clone(&worker.processor);
        let loop_filter = Arc::clone(&worker.filter);
        let loop_enabled = Arc::clone(&worker.enabled);

        let trace_loop = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = loop_cancel.cancelled() => return,

                    Some(cmd) = cmd_rx.recv() => match cmd {
                        SessionCommand::ApplyProviders(providers, reply) => {
                            let result = session.apply_providers(&providers);
                            if result.is_ok() {
                                *loop_enabled.lock().expect("enabled lock") =
                                    session.enabled_providers();
                            }
                            let _ = reply.send(result);
                        }
                    },

                    maybe = session.next_event() => match maybe {
                        Some(event) => {
                            if loop_filter.load().matches(&event) {
                                loop_processor.process(&event);
                            }
                        }
                        None => {
                            info!("trace event stream ended");
                            return;
                        }
                    },
                }
            }
        });

        let sup_cancel = worker.cancel.clone();
        let sup_processor = Arc::clone(&worker.processor);
        let supervisor = tokio::spawn(async move {
            if let Err(e) = trace_loop.await {
                error!(error = %e, "trace loop panicked");
            }

            let expected = sup_cancel.is_cancelled();
            sup_processor.shutdown().await;

            if !expected {
                warn!("trace session ended unexpectedly");
                on_end();
            }
        });

        let worker = Self {
            commands: cmd_tx,
            supervisor: Mutex::new(Some(supervisor)),
            ..worker
        };
        Ok(worker)
    }

    /// Compiles and, when clean, swaps in a new filter. Diagnostics are
    /// returned either way; the previous filter stays active on errors.
    pub fn apply_filter(&self, source: &FilterSource) -> Vec<Diagnostic> {
        let (compiled, diagnostics) = compile(source);
        match compiled {
            Some(filter) => {
                self.filter.store(Arc::new(filter));
                debug!("filter applied");
            }
            None => {
                warn!(
                    errors = diagnostics
                        .iter()
                        .filter(|d| d.severity == Severity::Error)
                        .count(),
                    "filter rejected",
                );
            }
        }
        diagnostics
    }

    /// Applies a provider set to the live trace session.
    pub async fn apply_providers(&self, providers: Vec<ProviderSettings>) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(SessionCommand::ApplyProviders(providers, reply))
            .map_err(|_| anyhow::anyhow!("trace loop is gone"))?;
        rx.await.context("trace loop dropped the reply")?
    }

    pub fn enabled_providers(&self) -> Vec<ProviderSettings> {
        self.enabled.lock().expect("enabled lock").clone()
    }

    /// Creates a channel for a profile that has no channel yet.
    pub async fn create_channel_for_profile(&self, profile: EventSinkProfile) -> Result<()> {
        if self.processor.contains(&profile.name) {
            bail!("channel {:?} already exists", profile.name);
        }

        let channel = self.build_channel(&profile).await?;
        self.processor.add_channel(channel)?;
        self.profiles
            .lock()
            .expect("profiles lock")
            .insert(profile.key(), profile);
        Ok(())
    }

    /// Applies a changed profile to its existing channel: a matching profile
    /// only adjusts batch size and write delay in place; a non-matching one
    /// tears the channel down and recreates it.
    pub async fn update_channel_for_profile(&self, profile: EventSinkProfile) -> Result<()> {
        let current = self
            .profiles
            .lock()
            .expect("profiles lock")
            .get(&profile.key())
            .cloned();

        let Some(current) = current else {
            return self.create_channel_for_profile(profile).await;
        };

        if current.matches(&profile) {
            if let Some(channel) = self.processor.get(&profile.name) {
                channel.set_batch_size(profile.batch_size);
                channel.set_write_delay(Duration::from_millis(profile.max_write_delay_m_secs));
                debug!(sink = %profile.name, "channel soft-updated");
            }
            self.profiles
                .lock()
                .expect("profiles lock")
                .insert(profile.key(), profile);
            return Ok(());
        }

        debug!(sink = %profile.name, "profile changed, recreating channel");
        self.remove_channel(&profile.name).await;
        self.create_channel_for_profile(profile).await
    }

    /// Flushes and destroys the named channel.
    pub async fn remove_channel(&self, name: &str) {
        if let Some(channel) = self.processor.remove_channel(name) {
            channel.shutdown().await;
        }
        self.profiles
            .lock()
            .expect("profiles lock")
            .remove(&name.to_lowercase());
    }

    /// Reconciles the full profile set: channels whose profile disappeared
    /// are destroyed, the rest are created or updated. The live-view
    /// channel is managed separately and never touched here.
    pub async fn apply_profiles(&self, desired: Vec<EventSinkProfile>) -> Result<()> {
        let desired_keys: HashSet<String> = desired.iter().map(EventSinkProfile::key).collect();

        let existing: Vec<String> = self
            .profiles
            .lock()
            .expect("profiles lock")
            .keys()
            .cloned()
            .collect();

        for key in existing {
            if key != LIVE_VIEW_SINK_NAME && !desired_keys.contains(&key) {
                self.remove_channel(&key).await;
            }
        }

        for profile in desired {
            self.update_channel_for_profile(profile).await?;
        }
        Ok(())
    }

    /// Attaches (or replaces) the live-view channel.
    pub async fn start_live_view(&self, mut profile: EventSinkProfile) -> Result<()> {
        profile.name = LIVE_VIEW_SINK_NAME.to_string();
        // Live view is ephemeral by definition.
        profile.persistent_channel = false;

        if self.processor.contains(LIVE_VIEW_SINK_NAME) {
            self.remove_channel(LIVE_VIEW_SINK_NAME).await;
        }
        self.create_channel_for_profile(profile).await
    }

    pub async fn stop_live_view(&self) {
        self.remove_channel(LIVE_VIEW_SINK_NAME).await;
    }

    pub fn has_live_view(&self) -> bool {
        self.processor.contains(LIVE_VIEW_SINK_NAME)
    }

    /// Per-sink runtime status for the state report.
    pub fn sink_states(&self) -> Vec<EventSinkState> {
        let mut out = Vec::new();
        for channel in self
            .processor
            .active_channels()
            .into_iter()
            .chain(self.processor.failed_channels())
        {
            out.push(EventSinkState {
                name: channel.name().to_string(),
                health: channel.health(),
                status: channel.status().snapshot(),
                dropped_events: channel.dropped(),
            });
        }
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    /// Stops the trace loop and flushes every channel.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let supervisor = self.supervisor.lock().expect("supervisor lock").take();
        if let Some(supervisor) = supervisor {
            if let Err(e) = supervisor.await {
                error!(error = %e, "session supervisor panicked");
            }
        }
    }

    async fn build_channel(&self, profile: &EventSinkProfile) -> Result<EventChannel> {
        let sink = SinkKind::create(profile, &profile.credentials)?;
        let proxy = SinkRetryProxy::new(
            profile.name.clone(),
            sink,
            self.settings.retry.strategy(),
        );

        let mode = if profile.persistent_channel {
            ChannelMode::Persistent {
                dir: self.settings.wal_dir.clone(),
            }
        } else {
            ChannelMode::Transient
        };

        EventChannel::start(
            profile.name.clone(),
            proxy,
            mode,
            profile.batch_size,
            Duration::from_millis(profile.max_write_delay_m_secs),
            self.settings.channel_capacity,
            &self.cancel,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::{memory, SinkType};
    use crate::trace::{testing, TraceLevel};

    fn settings(dir: &std::path::Path) -> SessionSettings {
        SessionSettings {
            wal_dir: dir.to_path_buf(),
            channel_capacity: 64,
            retry: RetryPolicy {
                initial_delay: Duration::from_millis(1),
                multiplier: 1.0,
                max_delay: Duration::from_millis(1),
                max_attempts: 2,
            },
        }
    }

    fn memory_profile(name: &str, sink_id: &str, batch_size: usize) -> EventSinkProfile {
        EventSinkProfile {
            name: name.to_string(),
            sink_type: SinkType::Memory,
            batch_size,
            max_write_delay_m_secs: 50,
            persistent_channel: false,
            credentials: String::new(),
            options: serde_json::json!({ "id": sink_id }),
        }
    }

    async fn start_worker(
        dir: &std::path::Path,
        profiles: Vec<EventSinkProfile>,
    ) -> (SessionWorker, testing::LoopbackHandle) {
        let (session, handle) = testing::loopback(64);
        let worker = SessionWorker::start(
            session,
            profiles,
            &FilterSource::empty(),
            &[ProviderSettings {
                name: "Kernel-Process".to_string(),
                level: TraceLevel::Info,
                match_any_keyword: 0,
            }],
            settings(dir),
            Box::new(|| {}),
            mpsc::unbounded_channel().0,
            &CancellationToken::new(),
        )
        .await
        .expect("worker start");
        (worker, handle)
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
    async fn test_events_flow_through_filter_to_sinks() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (worker, trace) =
            start_worker(dir.path(), vec![memory_profile("out", "sw-flow", 1)]).await;

        let sink = memory::handle("sw-flow");
        trace
            .emit(testing::event("P", "hello", TraceLevel::Info))
            .await
            .expect("emit");
        wait_for_events(&sink, 1).await;

        // A filter narrows the stream without touching the channel.
        let mut source = FilterSource::empty();
        source.dynamic_parts = vec!["level <= error".to_string()];
        let diagnostics = worker.apply_filter(&source);
        assert!(diagnostics.is_empty());

        trace
            .emit(testing::event("P", "dropped", TraceLevel::Info))
            .await
            .expect("emit");
        trace
            .emit(testing::event("P", "kept", TraceLevel::Error))
            .await
            .expect("emit");
        wait_for_events(&sink, 2).await;

        let names: Vec<String> = sink.batches().into_iter().flatten().map(|e| e.name).collect();
        assert_eq!(names, ["hello", "kept"]);

        worker.shutdown().await;
    }

    #[tokio::test]
    async fn test_matching_profile_soft_updates_channel() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (worker, trace) =
            start_worker(dir.path(), vec![memory_profile("out", "sw-soft", 100)]).await;

        let sink = memory::handle("sw-soft");
        let channel_before = worker.processor.get("out").expect("channel");

        // Same profile with batch size 1 keeps the channel instance.
        let updated = memory_profile("out", "sw-soft", 1);
        worker
            .update_channel_for_profile(updated)
            .await
            .expect("update");

        let channel_after = worker.processor.get("out").expect("channel");
        assert!(Arc::ptr_eq(&channel_before, &channel_after));

        trace
            .emit(testing::event("P", "x", TraceLevel::Info))
            .await
            .expect("emit");
        wait_for_events(&sink, 1).await;

        worker.shutdown().await;
    }

    #[tokio::test]
    async fn test_non_matching_profile_recreates_channel() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (worker, _trace) =
            start_worker(dir.path(), vec![memory_profile("out", "sw-hard", 100)]).await;

        let channel_before = worker.processor.get("out").expect("channel");

        let mut updated = memory_profile("out", "sw-hard-2", 100);
        updated.options = serde_json::json!({ "id": "sw-hard-2" });
        worker
            .update_channel_for_profile(updated)
            .await
            .expect("update");

        let channel_after = worker.processor.get("out").expect("channel");
        assert!(!Arc::ptr_eq(&channel_before, &channel_after));
        assert_eq!(memory::handle("sw-hard-2").open_count(), 1);

        worker.shutdown().await;
    }

    #[tokio::test]
    async fn test_live_view_attach_and_detach() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (worker, trace) = start_worker(dir.path(), Vec::new()).await;

        worker
            .start_live_view(memory_profile("ignored", "sw-live", 1))
            .await
            .expect("live view");
        assert!(worker.has_live_view());

        let sink = memory::handle("sw-live");
        trace
            .emit(testing::event("P", "live", TraceLevel::Info))
            .await
            .expect("emit");
        wait_for_events(&sink, 1).await;

        worker.stop_live_view().await;
        assert!(!worker.has_live_view());

        worker.shutdown().await;
    }

    #[tokio::test]
    async fn test_end_notification_fires_on_trace_stream_end() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (ended_tx, ended_rx) = oneshot::channel();

        let (session, trace) = testing::loopback(8);
        let worker = SessionWorker::start(
            session,
            Vec::new(),
            &FilterSource::empty(),
            &[],
            settings(dir.path()),
            Box::new(move || {
                let _ = ended_tx.send(());
            }),
            mpsc::unbounded_channel().0,
            &CancellationToken::new(),
        )
        .await
        .expect("worker start");

        // Dropping the injection handle closes the trace stream.
        drop(trace);

        tokio::time::timeout(Duration::from_secs(2), ended_rx)
            .await
            .expect("end notification timeout")
            .expect("end notification");

        worker.shutdown().await;
    }

    #[tokio::test]
    async fn test_apply_providers_reaches_live_session() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (worker, trace) = start_worker(dir.path(), Vec::new()).await;

        assert_eq!(trace.enabled_names(), vec!["Kernel-Process".to_string()]);

        worker
            .apply_providers(vec![ProviderSettings {
                name: "Kernel-Network".to_string(),
                level: TraceLevel::Verbose,
                match_any_keyword: 0,
            }])
            .await
            .expect("apply");

        assert_eq!(trace.enabled_names(), vec!["Kernel-Network".to_string()]);
        assert_eq!(worker.enabled_providers().len(), 1);

        worker.shutdown().await;
    }
}
