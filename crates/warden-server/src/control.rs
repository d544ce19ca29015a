//! Lifetime of the running panel.
//!
//! Startup order: bind the web listener, restart the engine, register the
//! recurring jobs, serve. Shutdown runs the steps in reverse and reports
//! every failure instead of stopping at the first one.

use std::fmt::Debug;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::serve::Listener;
use axum::Router;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use warden_engine::Supervisor;
use warden_jobs::{
    EnforcerJob, RestartJob, Schedule, Scheduler, StatsReportJob, TelegramNotifier, TrafficJob,
    WatchdogJob,
};
use warden_net::{load_tls_config, SniffingListener, TlsListener};
use warden_storage::{Database, PanelSettings};

use crate::service::TunnelService;
use crate::state::AppState;
use crate::{router, ServerConfig, ServerError};

/// Interval of the engine liveness check.
pub const WATCHDOG_INTERVAL: Duration = Duration::from_secs(30);
/// Interval of the traffic pull.
pub const TRAFFIC_INTERVAL: Duration = Duration::from_secs(10);
/// Extra delay before the first traffic pull, so it does not race the
/// initial engine start.
pub const TRAFFIC_DELAY: Duration = Duration::from_secs(5);
/// Interval of the quota and expiry scan.
pub const ENFORCER_INTERVAL: Duration = Duration::from_secs(30);
/// Interval of the restart-request check.
pub const RESTART_INTERVAL: Duration = Duration::from_secs(10);

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Handle to the running web listener, jobs and engine.
pub struct ControlPlane {
    supervisor: Arc<Supervisor>,
    tunnels: TunnelService,
    scheduler: Scheduler,
    local_addr: SocketAddr,
    shutdown_tx: broadcast::Sender<()>,
    server: JoinHandle<std::result::Result<(), ServerError>>,
}

impl ControlPlane {
    /// Opens the listener, starts the engine and the jobs, and begins serving.
    ///
    /// An engine that fails to start is not fatal: the failure is recorded in
    /// the supervisor and the watchdog retries.
    pub async fn start(
        config: ServerConfig,
        supervisor: Arc<Supervisor>,
        db: Database,
    ) -> std::result::Result<Self, ServerError> {
        let settings = db.panel_settings()?;
        let addr = config.addr()?;
        let app = router(AppState::new(supervisor.clone()));
        let (shutdown_tx, _) = broadcast::channel(1);

        let (server, local_addr) = match (&config.cert_file, &config.key_file) {
            (Some(cert_file), Some(key_file)) => {
                let tls = load_tls_config(cert_file, key_file)?;
                let listener = SniffingListener::bind(addr)?;
                let local_addr = listener
                    .local_addr()
                    .map_err(|e| ServerError::BindError(addr, e))?;
                let listener =
                    TlsListener::new(listener, tls).map_err(|e| ServerError::BindError(addr, e))?;
                info!("Serving HTTPS on {}", local_addr);
                (spawn_server(listener, app, shutdown_tx.subscribe()), local_addr)
            }
            _ => {
                let listener = warden_net::bind(addr)?;
                let local_addr = listener
                    .local_addr()
                    .map_err(|e| ServerError::BindError(addr, e))?;
                info!("Serving HTTP on {}", local_addr);
                (spawn_server(listener, app, shutdown_tx.subscribe()), local_addr)
            }
        };

        if let Err(e) = supervisor.restart(true).await {
            warn!("Engine failed to start: {}", e);
        }

        let scheduler = Scheduler::new();
        schedule_jobs(&scheduler, &supervisor, &db, &settings);
        info!(jobs = scheduler.len(), "Control plane started");

        let tunnels = TunnelService::new(db, supervisor.restart_flag().clone());
        Ok(Self {
            supervisor,
            tunnels,
            scheduler,
            local_addr,
            shutdown_tx,
            server,
        })
    }

    /// Address the web listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The engine supervisor.
    pub fn supervisor(&self) -> &Arc<Supervisor> {
        &self.supervisor
    }

    /// Tunnel mutations; each one is picked up by the restart job.
    pub fn tunnels(&self) -> &TunnelService {
        &self.tunnels
    }

    /// Stops the jobs, the engine and the listener.
    pub async fn stop(self) -> std::result::Result<(), ServerError> {
        let mut errors = Vec::new();

        self.scheduler.shutdown().await;

        if let Err(e) = self.supervisor.stop().await {
            error!("Failed to stop engine: {}", e);
            errors.push(format!("engine: {}", e));
        }

        let _ = self.shutdown_tx.send(());
        let mut server = self.server;
        match tokio::time::timeout(SHUTDOWN_TIMEOUT, &mut server).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => errors.push(format!("listener: {}", e)),
            Ok(Err(e)) => errors.push(format!("listener task: {}", e)),
            Err(_) => {
                warn!("Listener did not drain in time, aborting");
                server.abort();
            }
        }

        if errors.is_empty() {
            info!("Control plane stopped");
            Ok(())
        } else {
            Err(ServerError::Runtime(errors.join("; ")))
        }
    }
}

fn schedule_jobs(
    scheduler: &Scheduler,
    supervisor: &Arc<Supervisor>,
    db: &Database,
    settings: &PanelSettings,
) {
    scheduler.add(
        Schedule::every(WATCHDOG_INTERVAL),
        WatchdogJob::new(supervisor.clone()),
    );
    scheduler.add(
        Schedule::every(TRAFFIC_INTERVAL).with_delay(TRAFFIC_DELAY),
        TrafficJob::new(supervisor.clone(), db.clone()),
    );
    scheduler.add(
        Schedule::every(ENFORCER_INTERVAL),
        EnforcerJob::new(supervisor.clone(), db.clone()),
    );
    scheduler.add(
        Schedule::every(RESTART_INTERVAL),
        RestartJob::new(supervisor.clone()),
    );

    if !settings.tg_bot_enable {
        return;
    }
    let notifier = match TelegramNotifier::from_settings(settings) {
        Ok(notifier) => Arc::new(notifier),
        Err(e) => {
            warn!("Stats report disabled: {}", e);
            return;
        }
    };
    let schedule = Schedule::parse(&settings.tg_run_time).unwrap_or_else(|e| {
        warn!("{}, using @daily", e);
        Schedule::DAILY
    });
    scheduler.add(
        schedule,
        StatsReportJob::new(supervisor.clone(), db.clone(), notifier),
    );
}

fn spawn_server<L>(
    listener: L,
    app: Router,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> JoinHandle<std::result::Result<(), ServerError>>
where
    L: Listener,
    L::Addr: Debug,
{
    tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.recv().await;
            })
            .await
            .map_err(|e| ServerError::Runtime(e.to_string()))
    })
}
