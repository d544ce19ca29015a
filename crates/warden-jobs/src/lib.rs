//! Warden Jobs - recurring control plane tasks.
//!
//! Every task runs on the [`Scheduler`] and talks to the engine through the
//! [`EngineControl`] seam:
//!
//! - [`WatchdogJob`] requests a restart after consecutive failed liveness checks
//! - [`TrafficJob`] folds engine counters into tunnel records
//! - [`EnforcerJob`] disables tunnels past their quota or expiry
//! - [`RestartJob`] applies pending restart requests
//! - [`StatsReportJob`] sends the traffic report over Telegram

pub mod control;
pub mod enforcer;
pub mod error;
pub mod notify;
pub mod restart;
pub mod scheduler;
pub mod traffic;
pub mod watchdog;

pub use control::EngineControl;
pub use enforcer::EnforcerJob;
pub use error::{NotifyError, SchedulerError};
pub use notify::{
    build_report, login_message, notify_login, LoginStatus, Notifier, StatsReportJob,
    TelegramNotifier,
};
pub use restart::RestartJob;
pub use scheduler::{Job, Schedule, Scheduler};
pub use traffic::{TrafficJob, TrafficTick};
pub use watchdog::{WatchdogJob, WatchdogState, FAILURE_THRESHOLD};
