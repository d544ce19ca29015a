//! Engine process supervisor.
//!
//! Owns the single live engine process. Start, stop and restart are
//! serialised on one async mutex, so a restart never races another restart
//! into spawning a second process. Process state sits behind a separate
//! lock so status queries never wait on a process transition.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use warden_core::TrafficDelta;
use warden_storage::Database;

use crate::config::{build_config, to_bytes, DEFAULT_API_PORT};
use crate::engine::{Engine, EngineProcess, ProcessExit};
use crate::error::{EngineError, Result};
use crate::flag::RestartFlag;

/// Version reported when the binary cannot be queried.
pub const UNKNOWN_VERSION: &str = "Unknown";

/// Default time a process gets to exit after SIGTERM.
pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(10);

/// Supervisor settings.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Port forced onto the template's stats API inbound.
    pub api_port: u16,
    /// Time a process gets to exit after SIGTERM before it is killed.
    pub stop_grace: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            api_port: DEFAULT_API_PORT,
            stop_grace: DEFAULT_STOP_GRACE,
        }
    }
}

/// Coarse engine state for status reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineState {
    Running,
    Stop,
    Error,
}

/// Engine status snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineStatus {
    pub state: EngineState,
    pub error_msg: String,
    pub version: String,
}

#[derive(Debug, Default)]
struct ProcessState {
    running: bool,
    last_error: Option<EngineError>,
    last_exit_detail: String,
    version: String,
    last_config: Option<String>,
    // Bumped on every start and before every stop; a monitor whose
    // generation no longer matches belongs to a superseded process.
    generation: u64,
}

/// Supervises the engine process.
pub struct Supervisor {
    engine: Arc<dyn Engine>,
    db: Database,
    config: SupervisorConfig,
    process: Mutex<Option<Box<dyn EngineProcess>>>,
    state: Arc<RwLock<ProcessState>>,
    flag: RestartFlag,
}

impl Supervisor {
    /// Creates a supervisor with default settings.
    pub fn new(engine: Arc<dyn Engine>, db: Database) -> Self {
        Self::with_config(engine, db, SupervisorConfig::default())
    }

    /// Creates a supervisor with the given settings.
    pub fn with_config(engine: Arc<dyn Engine>, db: Database, config: SupervisorConfig) -> Self {
        Self {
            engine,
            db,
            config,
            process: Mutex::new(None),
            state: Arc::new(RwLock::new(ProcessState {
                version: UNKNOWN_VERSION.to_string(),
                ..Default::default()
            })),
            flag: RestartFlag::new(),
        }
    }

    /// Starts the engine with the current enabled tunnels.
    ///
    /// A no-op if a process is already running. `silent` keeps the startup
    /// logs at debug level.
    pub async fn start(&self, silent: bool) -> Result<()> {
        let mut slot = self.process.lock().await;
        self.start_locked(&mut slot, silent).await
    }

    /// Gracefully stops the engine. A no-op if nothing is running.
    pub async fn stop(&self) -> Result<()> {
        let mut slot = self.process.lock().await;
        self.stop_locked(&mut slot).await
    }

    /// Stops then starts the engine as one serialised step.
    pub async fn restart(&self, silent: bool) -> Result<()> {
        let mut slot = self.process.lock().await;
        self.stop_locked(&mut slot).await?;
        self.start_locked(&mut slot, silent).await
    }

    /// Whether the engine process is running.
    pub fn is_running(&self) -> bool {
        self.state.read().running
    }

    /// Marks the engine configuration as stale.
    pub fn set_to_need_restart(&self) {
        self.flag.set();
    }

    /// Returns whether a restart was requested, clearing the request.
    pub fn is_need_restart_and_set_false(&self) -> bool {
        self.flag.take()
    }

    /// The shared restart flag.
    pub fn restart_flag(&self) -> &RestartFlag {
        &self.flag
    }

    /// Last launch, stop or unexpected-exit error.
    pub fn running_error(&self) -> Option<EngineError> {
        self.state.read().last_error.clone()
    }

    /// Captured output of the last exited process.
    pub fn last_exit_detail(&self) -> String {
        self.state.read().last_exit_detail.clone()
    }

    /// Version of the running engine, or [`UNKNOWN_VERSION`].
    pub fn version(&self) -> String {
        self.state.read().version.clone()
    }

    /// The configuration the current or last process was started with.
    pub fn last_config(&self) -> Option<String> {
        self.state.read().last_config.clone()
    }

    /// Status snapshot for reporting.
    pub fn status(&self) -> EngineStatus {
        let state = self.state.read();
        let (engine_state, error_msg) = match (&state.last_error, state.running) {
            (_, true) => (EngineState::Running, String::new()),
            (Some(e), false) => (EngineState::Error, e.to_string()),
            (None, false) => (EngineState::Stop, String::new()),
        };
        EngineStatus {
            state: engine_state,
            error_msg,
            version: state.version.clone(),
        }
    }

    /// Pulls traffic counters from the running engine.
    pub async fn pull_traffic(&self) -> Result<Vec<TrafficDelta>> {
        if !self.is_running() {
            return Err(EngineError::NotRunning);
        }
        self.engine.pull_traffic().await
    }

    async fn start_locked(
        &self,
        slot: &mut Option<Box<dyn EngineProcess>>,
        silent: bool,
    ) -> Result<()> {
        if slot.is_some() && self.is_running() {
            debug!("Engine already running");
            return Ok(());
        }
        // A handle left behind by a crashed process
        slot.take();

        let config = match self.generate_config() {
            Ok(config) => config,
            Err(e) => {
                self.record_failure(e.clone());
                return Err(e);
            }
        };

        let process = match self.engine.launch(config.as_bytes()).await {
            Ok(process) => process,
            Err(e) => {
                warn!("Failed to start engine: {}", e);
                self.record_failure(e.clone());
                return Err(e);
            }
        };

        let version = match self.engine.version().await {
            Ok(version) => version,
            Err(e) => {
                debug!("Failed to query engine version: {}", e);
                UNKNOWN_VERSION.to_string()
            }
        };

        let generation = {
            let mut state = self.state.write();
            state.generation += 1;
            state.running = true;
            state.last_error = None;
            state.version = version.clone();
            state.last_config = Some(config);
            state.generation
        };

        self.monitor(process.exit(), generation);

        if silent {
            debug!(pid = ?process.pid(), %version, "Engine started");
        } else {
            info!(pid = ?process.pid(), %version, "Engine started");
        }

        *slot = Some(process);
        Ok(())
    }

    async fn stop_locked(&self, slot: &mut Option<Box<dyn EngineProcess>>) -> Result<()> {
        let Some(process) = slot.take() else {
            self.state.write().running = false;
            return Ok(());
        };

        // Retire the monitor before the exit it would otherwise report
        self.state.write().generation += 1;

        let pid = process.pid();
        let result = process.terminate(self.config.stop_grace).await;
        let detail = process.exit().borrow().as_ref().map(|e| e.detail.clone());

        let mut state = self.state.write();
        state.running = false;
        if let Some(detail) = detail {
            state.last_exit_detail = detail;
        }

        match result {
            Ok(()) => {
                info!(?pid, "Engine stopped");
                Ok(())
            }
            Err(e) => {
                warn!(?pid, "Failed to stop engine: {}", e);
                state.last_error = Some(e.clone());
                Err(e)
            }
        }
    }

    fn generate_config(&self) -> Result<String> {
        let settings = self.db.panel_settings()?;
        let tunnels = self.db.get_enabled_tunnels()?;
        let config = build_config(
            settings.engine_template_config.as_deref(),
            &tunnels,
            self.config.api_port,
        )?;
        let bytes = to_bytes(&config)?;
        String::from_utf8(bytes).map_err(|e| EngineError::ConfigInvalid(e.to_string()))
    }

    fn record_failure(&self, error: EngineError) {
        let mut state = self.state.write();
        state.running = false;
        state.last_error = Some(error);
    }

    fn monitor(
        &self,
        mut exit: tokio::sync::watch::Receiver<Option<ProcessExit>>,
        generation: u64,
    ) {
        let state = Arc::clone(&self.state);
        tokio::spawn(async move {
            let exit = match exit.wait_for(Option::is_some).await {
                Ok(exit) => exit.clone(),
                Err(_) => return,
            };
            let Some(exit) = exit else { return };

            let mut state = state.write();
            if state.generation != generation {
                return;
            }
            warn!(code = ?exit.code, "Engine exited unexpectedly");
            state.running = false;
            state.last_error = Some(EngineError::Exited(exit.detail.clone()));
            state.last_exit_detail = exit.detail;
        });
    }
}
