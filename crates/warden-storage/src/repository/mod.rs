//! Database repositories for each table.

pub mod settings;
pub mod tunnels;

pub use settings::SettingsRepo;
pub use tunnels::TunnelsRepo;
