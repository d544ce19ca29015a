//! Warden Server - control plane wiring and the status API.
//!
//! [`ControlPlane`] owns everything that runs for the lifetime of the panel:
//! the web listener, the recurring jobs, the engine supervisor and the
//! [`TunnelService`] that admin code mutates tunnels through.
//!
//! ## Endpoints
//!
//! - `GET /api/status` - Engine state, last error and version
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use warden_engine::{Supervisor, XrayEngine};
//! use warden_server::{ControlPlane, ServerConfig};
//! use warden_storage::Database;
//!
//! #[tokio::main]
//! async fn main() {
//!     let db = Database::new().unwrap();
//!     let engine = Arc::new(XrayEngine::new("/usr/local/bin/xray"));
//!     let supervisor = Arc::new(Supervisor::new(engine, db.clone()));
//!
//!     let plane = ControlPlane::start(ServerConfig::default(), supervisor, db)
//!         .await
//!         .unwrap();
//!     tokio::signal::ctrl_c().await.unwrap();
//!     plane.stop().await.unwrap();
//! }
//! ```

pub mod control;
mod handlers;
pub mod service;
pub mod state;

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;

use axum::routing::get;
use axum::Router;
use thiserror::Error;

use warden_net::NetError;
use warden_storage::{PanelSettings, DEFAULT_WEB_PORT};

pub use control::ControlPlane;
pub use service::TunnelService;
pub use state::AppState;

/// Web listener configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Address to bind to (empty = all interfaces).
    pub listen: String,
    /// Port to bind to.
    pub port: u16,
    /// PEM certificate chain; TLS is enabled when both files are set.
    pub cert_file: Option<PathBuf>,
    /// PEM private key.
    pub key_file: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: String::new(),
            port: DEFAULT_WEB_PORT,
            cert_file: None,
            key_file: None,
        }
    }
}

impl ServerConfig {
    /// Builds the config from persisted panel settings.
    pub fn from_settings(settings: &PanelSettings) -> Self {
        let non_empty = |s: &str| (!s.trim().is_empty()).then(|| PathBuf::from(s.trim()));
        Self {
            listen: settings.web_listen.clone(),
            port: settings.web_port,
            cert_file: non_empty(&settings.web_cert_file),
            key_file: non_empty(&settings.web_key_file),
        }
    }

    /// Sets the listen address.
    pub fn with_listen(mut self, listen: impl Into<String>) -> Self {
        self.listen = listen.into();
        self
    }

    /// Sets the port.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Sets the certificate and key files.
    pub fn with_tls(mut self, cert_file: impl Into<PathBuf>, key_file: impl Into<PathBuf>) -> Self {
        self.cert_file = Some(cert_file.into());
        self.key_file = Some(key_file.into());
        self
    }

    /// Returns true if both TLS files are set.
    pub fn is_tls(&self) -> bool {
        self.cert_file.is_some() && self.key_file.is_some()
    }

    /// Socket address to bind.
    pub fn addr(&self) -> std::result::Result<SocketAddr, ServerError> {
        let listen = self.listen.trim();
        let ip = if listen.is_empty() {
            IpAddr::V4(Ipv4Addr::UNSPECIFIED)
        } else {
            listen
                .parse()
                .map_err(|e| ServerError::Runtime(format!("invalid listen address {:?}: {}", listen, e)))?
        };
        Ok(SocketAddr::new(ip, self.port))
    }
}

/// Server error types.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Failed to bind to address.
    #[error("failed to bind to {0}: {1}")]
    BindError(SocketAddr, std::io::Error),

    /// Certificate or key could not be loaded.
    #[error("TLS error: {0}")]
    Tls(String),

    /// Database error.
    #[error("database error: {0}")]
    Database(#[from] warden_storage::StorageError),

    /// Server runtime error.
    #[error("server error: {0}")]
    Runtime(String),
}

impl From<NetError> for ServerError {
    fn from(e: NetError) -> Self {
        match e {
            NetError::Bind(addr, e) => ServerError::BindError(addr, e),
            NetError::Tls(msg) => ServerError::Tls(msg),
            NetError::Io(e) => ServerError::Runtime(e.to_string()),
        }
    }
}

/// Builds the API router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/status", get(handlers::get_status))
        .with_state(state)
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::sync::watch;
    use warden_core::TrafficDelta;
    use warden_engine::{Engine, EngineError, EngineProcess, ProcessExit};

    /// Engine whose processes live until terminated.
    #[derive(Default)]
    pub struct FakeEngine {
        pub fail_launch: bool,
    }

    struct FakeProcess {
        exit_tx: watch::Sender<Option<ProcessExit>>,
    }

    #[async_trait]
    impl EngineProcess for FakeProcess {
        fn pid(&self) -> Option<u32> {
            Some(7)
        }

        fn exit(&self) -> watch::Receiver<Option<ProcessExit>> {
            self.exit_tx.subscribe()
        }

        async fn terminate(&self, _grace: Duration) -> warden_engine::Result<()> {
            self.exit_tx.send_replace(Some(ProcessExit {
                code: Some(0),
                detail: String::new(),
            }));
            Ok(())
        }
    }

    #[async_trait]
    impl Engine for FakeEngine {
        async fn launch(&self, _config: &[u8]) -> warden_engine::Result<Box<dyn EngineProcess>> {
            if self.fail_launch {
                return Err(EngineError::LaunchFailed("binary missing".into()));
            }
            let (exit_tx, _) = watch::channel(None);
            Ok(Box::new(FakeProcess { exit_tx }))
        }

        async fn version(&self) -> warden_engine::Result<String> {
            Ok("1.8.4".into())
        }

        async fn pull_traffic(&self) -> warden_engine::Result<Vec<TrafficDelta>> {
            Ok(Vec::new())
        }
    }

    pub fn fake_engine() -> Arc<FakeEngine> {
        Arc::new(FakeEngine::default())
    }
}
