//! Node supervisor: registration, reconciliation and the shutdown drain.
//!
//! The supervisor owns the node's mutable state:
//!
//! - the current [`ClientSettings`] snapshot, re-read every cycle
//! - the current [`Assignment`] from the control plane
//! - the [`RunState`] shared with the serving layer
//!
//! Snapshots are published through `watch` channels holding `Arc`s, so
//! readers always see a complete old or new value.
//!
//! Lifecycle: [`NodeSupervisor::start`] registers the node (`Starting ->
//! Running`), [`NodeSupervisor::run_reconciliation`] keeps settings, cache
//! limits and the assignment fresh until shutdown begins, and
//! [`NodeSupervisor::shutdown`] drains (`Running -> Draining -> Stopped`).

use std::sync::Arc;
use std::time::Duration;

use pier_cache::CacheEngine;
use pier_control::{Assignment, ControlError, ControlPlane, PingRequest};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep, sleep_until, timeout};
use tracing::{debug, error, info, warn};

use crate::settings::{ClientSettings, SettingsError, SettingsSource};
use crate::state::RunState;

/// Observable lifecycle phase of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodePhase {
    Starting,
    Running,
    Draining,
    Stopped,
}

/// How a drain ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    /// Request traffic went quiet before the deadline.
    Quiet,
    /// The graceful-shutdown ceiling was reached first.
    TimedOut,
}

/// Timing knobs for the supervisor.
#[derive(Debug, Clone, Copy)]
pub struct SupervisorOptions {
    /// Delay before the first cycle and between two cycles.
    pub reconcile_interval: Duration,
    /// Traffic must be silent this long for a drain to finish early.
    pub quiet_window: Duration,
    /// Poll period while draining.
    pub drain_poll: Duration,
    /// Upper bound on a single control-plane call.
    pub control_timeout: Duration,
    /// Build number declared on every ping.
    pub build_version: u32,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self {
            reconcile_interval: Duration::from_secs(10),
            quiet_window: Duration::from_secs(30),
            drain_poll: Duration::from_secs(1),
            control_timeout: Duration::from_secs(15),
            build_version: 0,
        }
    }
}

/// Errors that stop a node from starting.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error(transparent)]
    Settings(#[from] SettingsError),

    #[error("initial registration failed: {0}")]
    Register(#[source] ControlError),

    #[error("initial registration timed out after {0:?}")]
    RegisterTimeout(Duration),
}

/// A log filter that was rejected.
#[derive(Debug, thiserror::Error)]
#[error("invalid log level {0:?}")]
pub struct InvalidLevel(pub String);

/// Runtime control over log verbosity.
pub trait LevelControl: Send + Sync {
    /// Switch the active filter to `level`.
    fn set_level(&self, level: &str) -> Result<(), InvalidLevel>;
}

/// What one reconciliation cycle changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// A valid settings snapshot was loaded and published.
    pub settings_reloaded: bool,
    /// The ping succeeded and a new assignment was published.
    pub assignment_updated: bool,
}

/// Owns the node lifecycle.
pub struct NodeSupervisor {
    settings_source: Arc<dyn SettingsSource>,
    control: Arc<dyn ControlPlane>,
    engine: Arc<CacheEngine>,
    levels: Option<Arc<dyn LevelControl>>,
    options: SupervisorOptions,
    settings: watch::Sender<Arc<ClientSettings>>,
    assignment: watch::Sender<Arc<Assignment>>,
    phase: watch::Sender<NodePhase>,
    run_state: Arc<RunState>,
}

impl NodeSupervisor {
    /// Validate `settings`, register with the control plane and enter
    /// `Running`.
    ///
    /// Shorthand for [`new`](Self::new) followed by
    /// [`register`](Self::register).
    pub async fn start(
        settings: ClientSettings,
        settings_source: Arc<dyn SettingsSource>,
        control: Arc<dyn ControlPlane>,
        engine: Arc<CacheEngine>,
        levels: Option<Arc<dyn LevelControl>>,
        options: SupervisorOptions,
    ) -> Result<Arc<Self>, SupervisorError> {
        let supervisor = Self::new(settings, settings_source, control, engine, levels, options)?;
        supervisor.register().await?;
        Ok(supervisor)
    }

    /// Validate `settings` and build a supervisor in `Starting`.
    ///
    /// `settings_source` is consulted again on every reconciliation cycle.
    pub fn new(
        settings: ClientSettings,
        settings_source: Arc<dyn SettingsSource>,
        control: Arc<dyn ControlPlane>,
        engine: Arc<CacheEngine>,
        levels: Option<Arc<dyn LevelControl>>,
        options: SupervisorOptions,
    ) -> Result<Arc<Self>, SupervisorError> {
        settings.validate()?;

        let (settings, _) = watch::channel(Arc::new(settings));
        let (assignment, _) = watch::channel(Arc::new(Assignment::default()));
        let (phase, _) = watch::channel(NodePhase::Starting);

        Ok(Arc::new(Self {
            settings_source,
            control,
            engine,
            levels,
            options,
            settings,
            assignment,
            phase,
            run_state: Arc::new(RunState::new()),
        }))
    }

    /// Push the cache limits, perform the initial ping and enter `Running`.
    ///
    /// Failure is fatal to startup: without an assignment there is nothing
    /// to serve. The phase stays `Starting` on error.
    pub async fn register(&self) -> Result<(), SupervisorError> {
        let settings = self.settings();
        self.engine.update_limits(settings.cache_limits()).await;

        let request = ping_request(&settings, self.options.build_version, None);
        let assignment = match timeout(self.options.control_timeout, self.control.ping(&request)).await
        {
            Ok(Ok(assignment)) => assignment.with_upstream(settings.upstream_override()),
            Ok(Err(e)) => return Err(SupervisorError::Register(e)),
            Err(_) => return Err(SupervisorError::RegisterTimeout(self.options.control_timeout)),
        };
        info!(
            image_server = %assignment.image_server,
            url = %assignment.url,
            latest_build = assignment.latest_build,
            "registered with control plane"
        );
        if assignment.latest_build > self.options.build_version {
            warn!(
                current = self.options.build_version,
                latest = assignment.latest_build,
                "a newer node build is available"
            );
        }

        self.assignment.send_replace(Arc::new(assignment));
        self.phase.send_replace(NodePhase::Running);
        Ok(())
    }

    /// Current settings snapshot.
    pub fn settings(&self) -> Arc<ClientSettings> {
        self.settings.borrow().clone()
    }

    /// Current assignment snapshot.
    pub fn assignment(&self) -> Arc<Assignment> {
        self.assignment.borrow().clone()
    }

    /// Receiver notified whenever the assignment is replaced.
    pub fn subscribe_assignment(&self) -> watch::Receiver<Arc<Assignment>> {
        self.assignment.subscribe()
    }

    pub fn phase(&self) -> NodePhase {
        *self.phase.borrow()
    }

    pub fn subscribe_phase(&self) -> watch::Receiver<NodePhase> {
        self.phase.subscribe()
    }

    pub fn run_state(&self) -> &Arc<RunState> {
        &self.run_state
    }

    pub fn engine(&self) -> &Arc<CacheEngine> {
        &self.engine
    }

    pub fn options(&self) -> &SupervisorOptions {
        &self.options
    }

    // ------------------------------------------------------------------
    // Reconciliation
    // ------------------------------------------------------------------

    /// Spawn [`run_reconciliation`](Self::run_reconciliation) on the runtime.
    pub fn spawn_reconciliation(self: &Arc<Self>) -> JoinHandle<()> {
        let supervisor = self.clone();
        tokio::spawn(async move { supervisor.run_reconciliation().await })
    }

    /// Reconcile every `reconcile_interval` until shutdown begins.
    ///
    /// The first cycle runs one interval after the call.
    pub async fn run_reconciliation(&self) {
        let mut stopping = self.run_state.stopping();
        let interval = self.options.reconcile_interval;
        let mut next = Instant::now() + interval;
        info!(interval_secs = interval.as_secs(), "reconciliation started");

        loop {
            tokio::select! {
                _ = sleep_until(next) => {}
                _ = async { stopping.wait_for(|stop| *stop).await.map(|_| ()) } => break,
            }
            if !self.run_state.is_running() {
                break;
            }

            self.reconcile_once().await;
            next = Instant::now() + interval;
        }

        info!("reconciliation stopped");
    }

    /// Run one cycle: reload settings, apply verbosity and cache limits,
    /// then ping and publish the new assignment.
    pub async fn reconcile_once(&self) -> CycleReport {
        let mut report = CycleReport::default();
        let previous = self.settings();

        let settings = match self.settings_source.load() {
            Ok(settings) => {
                let settings = Arc::new(settings);
                self.settings.send_replace(settings.clone());
                report.settings_reloaded = true;
                settings
            }
            Err(e) => {
                warn!(error = %e, "settings reload failed, keeping previous settings");
                previous.clone()
            }
        };

        if settings.log_level != previous.log_level
            && let Some(levels) = &self.levels
        {
            match levels.set_level(&settings.log_level) {
                Ok(()) => info!(level = %settings.log_level, "log level changed"),
                Err(e) => warn!(error = %e, "ignoring log level"),
            }
        }

        self.engine.update_limits(settings.cache_limits()).await;

        let current = self.assignment();
        let request = ping_request(
            &settings,
            self.options.build_version,
            current.tls.as_ref().map(|tls| tls.created_at.clone()),
        );
        match timeout(self.options.control_timeout, self.control.ping(&request)).await {
            Ok(Ok(mut assignment)) => {
                if assignment.tls.is_none() {
                    assignment.tls = current.tls.clone();
                }
                let assignment = assignment.with_upstream(settings.upstream_override());
                if assignment.image_server != current.image_server {
                    info!(image_server = %assignment.image_server, "upstream changed");
                }
                if assignment.compromised {
                    error!("control plane reports this node's secret as compromised");
                }
                self.assignment.send_replace(Arc::new(assignment));
                report.assignment_updated = true;
                debug!("ping succeeded");
            }
            Ok(Err(e)) => warn!(error = %e, "ping failed, keeping previous assignment"),
            Err(_) => warn!(
                timeout_secs = self.options.control_timeout.as_secs(),
                "ping timed out, keeping previous assignment"
            ),
        }

        report
    }

    // ------------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------------

    /// Stop accepting new work.
    ///
    /// Returns `true` for the first call only; later calls are no-ops.
    pub fn begin_shutdown(&self) -> bool {
        if !self.run_state.begin_shutdown() {
            return false;
        }
        self.phase.send_replace(NodePhase::Draining);
        info!("shutting down gracefully");
        true
    }

    /// Deregister, then wait for request traffic to go quiet.
    ///
    /// The wait is capped by `graceful_shutdown_seconds`.
    pub async fn drain(&self) -> DrainOutcome {
        let settings = self.settings();

        match timeout(
            self.options.control_timeout,
            self.control.shutdown(&settings.client_secret),
        )
        .await
        {
            Ok(Ok(())) => info!("deregistered from control plane"),
            Ok(Err(e)) => warn!(error = %e, "control plane shutdown failed"),
            Err(_) => warn!("control plane shutdown timed out"),
        }

        let ceiling = Duration::from_secs(settings.graceful_shutdown_seconds);
        let outcome = match timeout(ceiling, self.wait_for_quiet()).await {
            Ok(()) => DrainOutcome::Quiet,
            Err(_) => {
                warn!(ceiling_secs = ceiling.as_secs(), "giving up on drain");
                DrainOutcome::TimedOut
            }
        };

        self.phase.send_replace(NodePhase::Stopped);
        info!(?outcome, "drain finished");
        outcome
    }

    /// [`begin_shutdown`](Self::begin_shutdown) followed by
    /// [`drain`](Self::drain).
    ///
    /// Only the first call drains and returns `Some`.
    pub async fn shutdown(&self) -> Option<DrainOutcome> {
        if !self.begin_shutdown() {
            debug!("shutdown already in progress");
            return None;
        }
        Some(self.drain().await)
    }

    async fn wait_for_quiet(&self) {
        while !self.run_state.is_quiet(self.options.quiet_window) {
            info!(
                since_last_request_ms = self
                    .run_state
                    .since_last_request()
                    .map(|d| d.as_millis() as u64),
                in_flight = self.run_state.in_flight(),
                "waiting for requests to finish"
            );
            sleep(self.options.drain_poll).await;
        }
    }
}

fn ping_request(
    settings: &ClientSettings,
    build_version: u32,
    tls_created_at: Option<String>,
) -> PingRequest {
    PingRequest {
        secret: settings.client_secret.clone(),
        port: settings.client_port,
        disk_space: settings.max_cache_bytes(),
        network_speed: settings.network_speed_bytes(),
        build_version,
        tls_created_at,
    }
}
