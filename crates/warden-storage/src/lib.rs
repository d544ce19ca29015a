//! Warden Storage - SQLite persistence layer.
//!
//! This crate owns every record the control plane persists:
//!
//! - Tunnel records, with their cumulative traffic counters, quota and expiry
//! - The atomic traffic batch used by the accounting task
//! - The atomic quota/expiry disable used by the enforcer
//! - Panel settings as a JSON key-value store
//!
//! # Example
//!
//! ```no_run
//! use warden_core::{Protocol, TrafficDelta};
//! use warden_storage::{Database, NewTunnel};
//!
//! let db = Database::in_memory().unwrap();
//!
//! db.create_tunnel(&NewTunnel::new(1, 443, Protocol::Trojan).with_total(1 << 30))
//!     .unwrap();
//!
//! // Fold one poll cycle of engine counters into the tunnel
//! db.add_traffic(&[TrafficDelta::inbound("inbound-443", 1024, 4096)])
//!     .unwrap();
//! ```

mod database;
pub mod error;
pub mod models;
mod pool;
pub mod repository;
mod schema;

pub use database::Database;
pub use error::{Result, StorageError};
pub use models::{
    tag_for_port, NewTunnel, PanelSettings, Setting, Tunnel, DEFAULT_TG_RUN_TIME,
    DEFAULT_WEB_PORT,
};
pub use pool::ConnectionPool;
pub use repository::settings as setting_keys;
