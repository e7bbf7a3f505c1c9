use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::api::{CommandAck, ManagerClient};
use crate::crypto::{CertIdentity, CertInstallError};
use crate::filter::{compile, FilterSource, Severity};
use crate::session::{SessionSettings, SessionWorker};
use crate::sink::profile::EventSinkProfile;
use crate::state::{
    AgentState, CertInstallOutcome, CertInstallResult, LiveViewOptions, ProcessingState,
};
use crate::store::SessionStore;
use crate::trace::{ProviderSettings, TraceSession};

use super::{commands, ControlEvent};

/// Identity the agent reports itself under.
#[derive(Debug, Clone)]
pub struct AgentIdentity {
    pub agent_id: String,
    pub host_name: String,
}

/// Where state reports and command acknowledgments go.
///
/// Enum dispatch keeps the worker free of trait objects; the memory variant
/// backs the integration tests.
pub enum Reporter {
    Http(Arc<ManagerClient>),
    Memory(mpsc::UnboundedSender<ReportEvent>),
}

/// One outbound report, as observed by the memory reporter.
#[derive(Debug)]
pub enum ReportEvent {
    State(AgentState),
    Ack { event_id: String, ack: CommandAck },
}

impl Reporter {
    async fn state(&self, state: &AgentState) {
        match self {
            Self::Http(client) => {
                if let Err(e) = client.post_state(state).await {
                    error!(error = %e, "state report failed");
                }
            }
            Self::Memory(tx) => {
                let _ = tx.send(ReportEvent::State(state.clone()));
            }
        }
    }

    async fn ack(&self, event_id: &str, ack: CommandAck) {
        if event_id.is_empty() {
            debug!("uncorrelated command, acknowledgment skipped");
            return;
        }
        match self {
            Self::Http(client) => {
                if let Err(e) = client.post_ack(event_id, &ack).await {
                    error!(event_id, error = %e, "acknowledgment failed");
                }
            }
            Self::Memory(tx) => {
                let _ = tx.send(ReportEvent::Ack {
                    event_id: event_id.to_string(),
                    ack,
                });
            }
        }
    }
}

/// Factory for trace sessions; the binary wires the real provider here,
/// tests wire the loopback.
pub type SessionFactory = Box<dyn Fn() -> Result<TraceSession> + Send + Sync>;

/// ApplyAgentOptions payload; each sub-object is applied independently.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AgentOptions {
    #[serde(default)]
    enabled_providers: Option<Vec<ProviderSettings>>,

    #[serde(default)]
    processing_options: Option<ProcessingState>,

    #[serde(default)]
    event_sink_profiles: Option<Vec<EventSinkProfile>>,

    #[serde(default)]
    live_view_options: Option<LiveViewOptions>,
}

/// Single-consumer command processor for one agent.
///
/// Commands are handled strictly in arrival order; every mutating command
/// finishes with a state report so the manager is never silently out of
/// sync. The at-most-one-session invariant hangs on `session_active`.
pub struct ControlWorker {
    identity: AgentIdentity,
    store: Arc<SessionStore>,
    reporter: Reporter,
    session_settings: SessionSettings,
    session_factory: SessionFactory,

    session: Option<SessionWorker>,
    session_active: Arc<AtomicBool>,
    session_end_tx: mpsc::UnboundedSender<()>,
    session_end_rx: mpsc::UnboundedReceiver<()>,
    sink_health_tx: mpsc::UnboundedSender<()>,
    sink_health_rx: mpsc::UnboundedReceiver<()>,

    /// Pinged after a new outbound identity is installed; the binary uses
    /// it to re-establish the control stream under the new certificate.
    identity_events: Option<mpsc::UnboundedSender<()>>,

    empty_template: FilterSource,
    cert_identity: Option<CertIdentity>,
    last_cert_install: Option<CertInstallResult>,

    cancel: CancellationToken,
}

impl ControlWorker {
    pub fn new(
        identity: AgentIdentity,
        store: Arc<SessionStore>,
        reporter: Reporter,
        session_settings: SessionSettings,
        session_factory: SessionFactory,
        parent_cancel: &CancellationToken,
    ) -> Self {
        let (session_end_tx, session_end_rx) = mpsc::unbounded_channel();
        let (sink_health_tx, sink_health_rx) = mpsc::unbounded_channel();
        Self {
            identity,
            store,
            reporter,
            session_settings,
            session_factory,
            session: None,
            session_active: Arc::new(AtomicBool::new(false)),
            session_end_tx,
            session_end_rx,
            sink_health_tx,
            sink_health_rx,
            identity_events: None,
            empty_template: FilterSource::empty(),
            cert_identity: None,
            last_cert_install: None,
            cancel: parent_cancel.child_token(),
        }
    }

    pub fn with_identity_events(mut self, tx: mpsc::UnboundedSender<()>) -> Self {
        self.identity_events = Some(tx);
        self
    }

    /// Runs the command loop until the queue closes or the token cancels.
    /// Auto-starts the session unless the stopped sentinel is present.
    pub async fn run(mut self, mut queue: mpsc::Receiver<ControlEvent>) {
        if self.store.is_stopped() {
            info!("session explicitly stopped, not auto-starting");
        } else if let Err(e) = self.start_session().await {
            error!(error = %e, "session auto-start failed");
        }
        self.report_state().await;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,

                Some(()) = self.session_end_rx.recv() => {
                    warn!("session ended unexpectedly");
                    self.session = None;
                    self.session_active.store(false, Ordering::SeqCst);
                    self.report_state().await;
                }

                // A sink health transition pushes a fresh report instead of
                // waiting for the manager's next command.
                Some(()) = self.sink_health_rx.recv() => {
                    debug!("sink health changed");
                    self.report_state().await;
                }

                maybe = queue.recv() => match maybe {
                    Some(event) => self.handle(event).await,
                    None => {
                        info!("command queue completed");
                        break;
                    }
                },
            }
        }

        self.stop_session().await;
    }

    async fn handle(&mut self, event: ControlEvent) {
        debug!(command = %event.event, id = %event.id, "control command");

        match event.event.as_str() {
            commands::START => self.on_start().await,
            commands::STOP => self.on_stop().await,
            commands::RESET => self.on_reset().await,
            commands::GET_STATE => self.report_state().await,
            commands::SET_EMPTY_FILTER => self.on_set_empty_filter(&event).await,
            commands::TEST_FILTER => self.on_test_filter(&event).await,
            commands::APPLY_AGENT_OPTIONS => self.on_apply_agent_options(&event).await,
            commands::START_LIVE_VIEW_SINK => self.on_start_live_view(&event).await,
            commands::STOP_LIVE_VIEW_SINK => self.on_stop_live_view().await,
            commands::INSTALL_CERT => self.on_install_cert(&event).await,
            commands::CLOSE => {
                // Normally consumed by the transport; tolerate it here.
                self.cancel.cancel();
            }
            other => warn!(command = %other, "unknown control command ignored"),
        }
    }

    // Command handlers.

    async fn on_start(&mut self) {
        if let Err(e) = self.store.set_stopped(false).await {
            error!(error = %e, "clearing stopped sentinel failed");
        }
        if let Err(e) = self.start_session().await {
            error!(error = %e, "session start failed");
        }
        self.report_state().await;
    }

    async fn on_stop(&mut self) {
        self.stop_session().await;
        if let Err(e) = self.store.set_stopped(true).await {
            error!(error = %e, "recording stopped sentinel failed");
        }
        self.report_state().await;
    }

    async fn on_reset(&mut self) {
        self.stop_session().await;

        if let Err(e) = self
            .store
            .update_session_state(|state| *state = Default::default())
            .await
        {
            error!(error = %e, "clearing session state failed");
        }
        if let Err(e) = self.store.replace_profiles(Vec::new()).await {
            error!(error = %e, "clearing sink profiles failed");
        }

        info!("configuration reset");
        self.report_state().await;
    }

    async fn on_set_empty_filter(&mut self, event: &ControlEvent) {
        match serde_json::from_str::<FilterSource>(&event.data) {
            Ok(template) => {
                self.empty_template = template;
                debug!("empty-filter template updated");
            }
            Err(e) => warn!(error = %e, "unparseable empty-filter template"),
        }
        self.report_state().await;
    }

    async fn on_test_filter(&mut self, event: &ControlEvent) {
        let ack = match serde_json::from_str::<FilterSource>(&event.data) {
            Ok(mut source) => {
                source.canonicalize();
                let (compiled, diagnostics) = compile(&source);
                CommandAck {
                    success: compiled.is_some(),
                    diagnostics,
                    filter_source: compiled.is_some().then_some(source),
                }
            }
            Err(e) => CommandAck {
                success: false,
                diagnostics: vec![crate::filter::Diagnostic {
                    code: "TR1000".to_string(),
                    message: format!("unparseable filter payload: {e}"),
                    severity: Severity::Error,
                    line: 0,
                    character: 0,
                }],
                filter_source: None,
            },
        };

        self.reporter.ack(&event.id, ack).await;
    }

    async fn on_apply_agent_options(&mut self, event: &ControlEvent) {
        let options = match serde_json::from_str::<AgentOptions>(&event.data) {
            Ok(options) => options,
            Err(e) => {
                warn!(error = %e, "unparseable agent options");
                self.reporter
                    .ack(
                        &event.id,
                        CommandAck {
                            success: false,
                            diagnostics: Vec::new(),
                            filter_source: None,
                        },
                    )
                    .await;
                return;
            }
        };

        let mut errors: Vec<String> = Vec::new();
        let mut diagnostics = Vec::new();
        let mut canonical_source = None;

        if let Some(providers) = options.enabled_providers {
            if let Err(e) = self.apply_providers(providers).await {
                errors.push(format!("providers: {e:#}"));
            }
        }

        if let Some(mut processing) = options.processing_options {
            processing.filter_source.canonicalize();
            let (compiled, filter_diagnostics) = compile(&processing.filter_source);
            diagnostics.extend(filter_diagnostics);

            if compiled.is_some() {
                if let Some(session) = self.session.as_ref() {
                    session.apply_filter(&processing.filter_source);
                }
                canonical_source = Some(processing.filter_source.clone());
                if let Err(e) = self
                    .store
                    .update_session_state(|state| state.processing_state = processing)
                    .await
                {
                    errors.push(format!("filter: {e:#}"));
                }
            } else {
                errors.push("filter: compilation failed".to_string());
            }
        }

        if let Some(profiles) = options.event_sink_profiles {
            match self.apply_sink_profiles(profiles).await {
                Ok(()) => {}
                Err(e) => errors.push(format!("sinks: {e:#}")),
            }
        }

        if let Some(live_view) = options.live_view_options {
            if let Err(e) = self.apply_live_view_options(live_view).await {
                errors.push(format!("live view: {e:#}"));
            }
        }

        for error in &errors {
            warn!(error = %error, "agent option rejected");
        }

        self.reporter
            .ack(
                &event.id,
                CommandAck {
                    success: errors.is_empty()
                        && !diagnostics.iter().any(|d| d.severity == Severity::Error),
                    diagnostics,
                    filter_source: canonical_source,
                },
            )
            .await;
        self.report_state().await;
    }

    async fn on_start_live_view(&mut self, event: &ControlEvent) {
        let Some(session) = self.session.as_ref() else {
            info!("live view requested while stopped, ignoring");
            return;
        };

        match serde_json::from_str::<EventSinkProfile>(&event.data) {
            Ok(profile) => {
                match session.start_live_view(profile.clone()).await {
                    Ok(()) => {
                        if let Err(e) = self
                            .store
                            .update_session_state(|state| {
                                state.live_view_options.profile = Some(profile);
                            })
                            .await
                        {
                            error!(error = %e, "persisting live-view options failed");
                        }
                    }
                    Err(e) => error!(error = %e, "live-view sink failed to start"),
                }
            }
            Err(e) => warn!(error = %e, "unparseable live-view profile"),
        }
        self.report_state().await;
    }

    async fn on_stop_live_view(&mut self) {
        if let Some(session) = self.session.as_ref() {
            session.stop_live_view().await;
        }
        if let Err(e) = self
            .store
            .update_session_state(|state| state.live_view_options.profile = None)
            .await
        {
            error!(error = %e, "clearing live-view options failed");
        }
        self.report_state().await;
    }

    async fn on_install_cert(&mut self, event: &ControlEvent) {
        let result = self.install_cert(&event.data).await;

        self.last_cert_install = Some(match result {
            Ok(already_installed) => {
                info!(already_installed, "certificate install succeeded");
                CertInstallResult {
                    outcome: CertInstallOutcome::Success,
                    message: if already_installed {
                        "already installed".to_string()
                    } else {
                        "installed".to_string()
                    },
                    at: Utc::now(),
                }
            }
            Err(e) => {
                error!(error = %e, "certificate install failed");
                CertInstallResult {
                    outcome: e.outcome(),
                    message: e.message().to_string(),
                    at: Utc::now(),
                }
            }
        });

        self.report_state().await;
    }

    /// InstallCert pipeline: parse, validate chain, short-circuit when the
    /// thumbprint is already current, then rotate data protection.
    async fn install_cert(&mut self, pem: &str) -> Result<bool, CertInstallError> {
        let identity = CertIdentity::from_pem(pem)?;
        identity.validate_chain()?;

        if self.store.cert_thumbprint().await.as_deref() == Some(identity.thumbprint()) {
            self.cert_identity = Some(identity);
            return Ok(true);
        }

        self.store
            .rotate_certificate(&identity)
            .await
            .map_err(|e| CertInstallError::InstallFailure(format!("{e:#}")))?;

        self.cert_identity = Some(identity);

        // The control stream still runs under the previous identity; tell
        // the owner so it can reconnect with the new one.
        if let Some(tx) = &self.identity_events {
            let _ = tx.send(());
        }
        Ok(false)
    }

    // Option application, routed by running state.

    async fn apply_providers(&mut self, providers: Vec<ProviderSettings>) -> Result<()> {
        if let Some(session) = self.session.as_ref() {
            session.apply_providers(providers.clone()).await?;
        }
        self.store
            .update_session_state(|state| state.provider_settings = providers)
            .await?;
        Ok(())
    }

    async fn apply_sink_profiles(&mut self, profiles: Vec<EventSinkProfile>) -> Result<()> {
        for profile in &profiles {
            if profile.is_live_view() {
                anyhow::bail!("sink name {:?} is reserved", profile.name);
            }
        }

        if let Some(session) = self.session.as_ref() {
            session.apply_profiles(profiles.clone()).await?;
        }
        self.store.replace_profiles(profiles).await?;
        Ok(())
    }

    async fn apply_live_view_options(&mut self, options: LiveViewOptions) -> Result<()> {
        if let Some(session) = self.session.as_ref() {
            match options.profile.clone() {
                Some(profile) => session.start_live_view(profile).await?,
                None => session.stop_live_view().await,
            }
        }
        self.store
            .update_session_state(|state| state.live_view_options = options)
            .await?;
        Ok(())
    }

    // Session lifecycle.

    async fn start_session(&mut self) -> Result<()> {
        if self
            .session_active
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            info!("session already running, start is a no-op");
            return Ok(());
        }

        let result = self.start_session_inner().await;
        if result.is_err() {
            self.session_active.store(false, Ordering::SeqCst);
        }
        result
    }

    async fn start_session_inner(&mut self) -> Result<()> {
        let state = self.store.session_state().await;
        let profiles = self.store.profiles().await;

        let trace_session = (self.session_factory)().context("creating trace session")?;

        let end_tx = self.session_end_tx.clone();
        let worker = SessionWorker::start(
            trace_session,
            profiles,
            &state.processing_state.filter_source,
            &state.provider_settings,
            self.session_settings.clone(),
            Box::new(move || {
                let _ = end_tx.send(());
            }),
            self.sink_health_tx.clone(),
            &self.cancel,
        )
        .await?;

        if let Some(profile) = state.live_view_options.profile {
            if let Err(e) = worker.start_live_view(profile).await {
                warn!(error = %e, "live-view sink failed to resume");
            }
        }

        self.session = Some(worker);
        info!("session started");
        Ok(())
    }

    async fn stop_session(&mut self) {
        if let Some(session) = self.session.take() {
            session.shutdown().await;
            info!("session stopped");
        }
        self.session_active.store(false, Ordering::SeqCst);
    }

    // State reporting.

    async fn report_state(&mut self) {
        let state = self.build_state().await;
        self.reporter.state(&state).await;
    }

    async fn build_state(&self) -> AgentState {
        let persisted = self.store.session_state().await;
        let running = self.session.is_some();

        let enabled_providers = match self.session.as_ref() {
            Some(session) => session.enabled_providers(),
            None => persisted.provider_settings.clone(),
        };

        let event_sink_states = match self.session.as_ref() {
            Some(session) => session.sink_states(),
            None => Vec::new(),
        };

        let mut processing_state = persisted.processing_state.clone();
        // Fix persisted sources up against the current template base.
        if processing_state.filter_source.source_lines.is_empty() {
            processing_state.filter_source = self.empty_template.clone();
        } else {
            processing_state.filter_source.canonicalize();
        }

        let cert_thumbprint = match self.cert_identity.as_ref() {
            Some(identity) => Some(identity.thumbprint().to_string()),
            None => self.store.cert_thumbprint().await,
        };

        AgentState {
            agent_id: self.identity.agent_id.clone(),
            host_name: self.identity.host_name.clone(),
            running,
            stopped: self.store.is_stopped(),
            enabled_providers,
            processing_state,
            event_sink_states,
            live_view_options: persisted.live_view_options,
            cert_thumbprint,
            cert_days_remaining: self.cert_identity.as_ref().map(CertIdentity::days_remaining),
            last_cert_install: self.last_cert_install.clone(),
            reported_at: Utc::now(),
        }
    }
}
