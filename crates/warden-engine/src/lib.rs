//! Warden Engine - supervision of the external proxy engine.
//!
//! - [`Supervisor`] owns the one live engine process: start, graceful stop,
//!   serialised restart, crash capture and status reporting
//! - [`RestartFlag`] is the many-writers, one-consumer restart request
//! - [`Engine`] / [`EngineProcess`] abstract the engine binary;
//!   [`XrayEngine`] drives the Xray CLI
//! - [`config`] turns the enabled tunnels into the engine's JSON config

pub mod config;
pub mod engine;
pub mod error;
pub mod flag;
pub mod supervisor;
pub mod xray;

pub use engine::{Engine, EngineProcess, OutputBuffer, ProcessExit};
pub use error::{EngineError, Result};
pub use flag::RestartFlag;
pub use supervisor::{EngineState, EngineStatus, Supervisor, SupervisorConfig, UNKNOWN_VERSION};
pub use xray::XrayEngine;
