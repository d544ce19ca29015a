//! High-level database interface.

use std::path::PathBuf;

use directories::ProjectDirs;
use tracing::{debug, info};
use warden_core::{TrafficDelta, APP_NAME};

use crate::error::{Result, StorageError};
use crate::models::{NewTunnel, PanelSettings, Setting, Tunnel};
use crate::pool::ConnectionPool;
use crate::repository::settings as keys;
use crate::repository::{SettingsRepo, TunnelsRepo};

/// High-level database interface for Warden.
#[derive(Clone)]
pub struct Database {
    pool: ConnectionPool,
}

impl Database {
    /// Create a new database in the default app data directory.
    pub fn new() -> Result<Self> {
        Self::with_path(Self::default_db_path()?)
    }

    /// Create a new database at a specific path.
    pub fn with_path(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();

        // Create parent directories if they don't exist
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        info!("Opening database at: {:?}", path);
        let pool = ConnectionPool::new(&path)?;

        Ok(Self { pool })
    }

    /// Create an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let pool = ConnectionPool::in_memory()?;
        Ok(Self { pool })
    }

    /// Get the default database path.
    pub fn default_db_path() -> Result<PathBuf> {
        let proj_dirs = ProjectDirs::from("com", APP_NAME, APP_NAME)
            .ok_or_else(|| StorageError::Config("Could not determine app data directory".into()))?;

        Ok(proj_dirs.data_dir().join(format!("{}.db", APP_NAME)))
    }

    // === Tunnels ===

    /// Create a tunnel. Fails with `Conflict` if the port is taken.
    pub fn create_tunnel(&self, tunnel: &NewTunnel) -> Result<i64> {
        let conn = self.pool.get();
        TunnelsRepo::insert(&conn, tunnel)
    }

    /// Create several tunnels atomically.
    pub fn create_tunnels(&self, tunnels: &[NewTunnel]) -> Result<Vec<i64>> {
        let conn = self.pool.get();
        TunnelsRepo::insert_many(&conn, tunnels)
    }

    /// Get a tunnel by ID.
    pub fn get_tunnel(&self, id: i64) -> Result<Option<Tunnel>> {
        let conn = self.pool.get();
        TunnelsRepo::get_by_id(&conn, id)
    }

    /// Get a tunnel by engine tag.
    pub fn get_tunnel_by_tag(&self, tag: &str) -> Result<Option<Tunnel>> {
        let conn = self.pool.get();
        TunnelsRepo::get_by_tag(&conn, tag)
    }

    /// Get all tunnels owned by a user.
    pub fn get_tunnels_by_user(&self, user_id: i64) -> Result<Vec<Tunnel>> {
        let conn = self.pool.get();
        TunnelsRepo::get_by_user(&conn, user_id)
    }

    /// Get all tunnels.
    pub fn get_all_tunnels(&self) -> Result<Vec<Tunnel>> {
        let conn = self.pool.get();
        TunnelsRepo::get_all(&conn)
    }

    /// Get the tunnels the engine should serve.
    pub fn get_enabled_tunnels(&self) -> Result<Vec<Tunnel>> {
        let conn = self.pool.get();
        TunnelsRepo::get_enabled(&conn)
    }

    /// Replace a tunnel.
    pub fn update_tunnel(&self, id: i64, tunnel: &NewTunnel) -> Result<()> {
        let conn = self.pool.get();
        TunnelsRepo::update(&conn, id, tunnel)
    }

    /// Delete a tunnel.
    pub fn delete_tunnel(&self, id: i64) -> Result<()> {
        let conn = self.pool.get();
        TunnelsRepo::delete(&conn, id)
    }

    /// Apply one poll cycle of engine traffic as a single transaction.
    pub fn add_traffic(&self, deltas: &[TrafficDelta]) -> Result<usize> {
        let conn = self.pool.get();
        let applied = TunnelsRepo::add_traffic(&conn, deltas)?;
        debug!(deltas = deltas.len(), applied, "Traffic batch committed");
        Ok(applied)
    }

    /// Disable tunnels over quota or past expiry. Returns how many changed.
    pub fn disable_invalid_tunnels(&self, now_ms: i64) -> Result<u64> {
        let conn = self.pool.get();
        TunnelsRepo::disable_invalid(&conn, now_ms)
    }

    // === Settings ===

    /// Get a setting.
    pub fn get_setting(&self, key: &str) -> Result<Option<Setting>> {
        let conn = self.pool.get();
        SettingsRepo::get(&conn, key)
    }

    /// Set a setting.
    pub fn set_setting(&self, key: &str, value: &serde_json::Value) -> Result<()> {
        let conn = self.pool.get();
        SettingsRepo::set(&conn, key, value)
    }

    /// Delete a setting.
    pub fn delete_setting(&self, key: &str) -> Result<bool> {
        let conn = self.pool.get();
        SettingsRepo::delete(&conn, key)
    }

    /// Get all settings.
    pub fn get_all_settings(&self) -> Result<Vec<Setting>> {
        let conn = self.pool.get();
        SettingsRepo::get_all(&conn)
    }

    /// Get a typed setting with a default.
    pub fn get_setting_or<T: serde::de::DeserializeOwned>(&self, key: &str, default: T) -> Result<T> {
        let conn = self.pool.get();
        SettingsRepo::get_or_default(&conn, key, default)
    }

    /// Read every panel setting with defaults applied.
    pub fn panel_settings(&self) -> Result<PanelSettings> {
        let conn = self.pool.get();
        let d = PanelSettings::default();

        let template: String =
            SettingsRepo::get_or_default(&conn, keys::ENGINE_TEMPLATE_CONFIG, String::new())?;

        Ok(PanelSettings {
            web_listen: SettingsRepo::get_or_default(&conn, keys::WEB_LISTEN, d.web_listen)?,
            web_port: SettingsRepo::get_or_default(&conn, keys::WEB_PORT, d.web_port)?,
            web_cert_file: SettingsRepo::get_or_default(&conn, keys::WEB_CERT_FILE, d.web_cert_file)?,
            web_key_file: SettingsRepo::get_or_default(&conn, keys::WEB_KEY_FILE, d.web_key_file)?,
            engine_template_config: (!template.trim().is_empty()).then_some(template),
            tg_bot_enable: SettingsRepo::get_or_default(&conn, keys::TG_BOT_ENABLE, d.tg_bot_enable)?,
            tg_bot_token: SettingsRepo::get_or_default(&conn, keys::TG_BOT_TOKEN, d.tg_bot_token)?,
            tg_bot_chat_id: SettingsRepo::get_or_default(
                &conn,
                keys::TG_BOT_CHAT_ID,
                d.tg_bot_chat_id,
            )?,
            tg_run_time: SettingsRepo::get_or_default(&conn, keys::TG_RUN_TIME, d.tg_run_time)?,
        })
    }
}

impl Default for Database {
    fn default() -> Self {
        Self::in_memory().expect("Failed to create in-memory database")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use warden_core::Protocol;

    #[test]
    fn test_tunnel_lifecycle() {
        let db = Database::in_memory().unwrap();

        let id = db
            .create_tunnel(&NewTunnel::new(1, 443, Protocol::Trojan))
            .unwrap();
        assert_eq!(db.get_all_tunnels().unwrap().len(), 1);

        db.add_traffic(&[TrafficDelta::inbound("inbound-443", 5, 6)])
            .unwrap();
        let tunnel = db.get_tunnel_by_tag("inbound-443").unwrap().unwrap();
        assert_eq!((tunnel.up, tunnel.down), (5, 6));

        db.delete_tunnel(id).unwrap();
        assert!(db.get_tunnel(id).unwrap().is_none());
    }

    #[test]
    fn test_disable_invalid_tunnels() {
        let db = Database::in_memory().unwrap();
        db.create_tunnel(&NewTunnel::new(1, 1, Protocol::VMess).with_total(10))
            .unwrap();
        db.add_traffic(&[TrafficDelta::inbound("inbound-1", 4, 6)])
            .unwrap();

        assert_eq!(db.disable_invalid_tunnels(0).unwrap(), 1);
        assert!(db.get_enabled_tunnels().unwrap().is_empty());
    }

    #[test]
    fn test_panel_settings_defaults() {
        let db = Database::in_memory().unwrap();
        let settings = db.panel_settings().unwrap();
        assert_eq!(settings, PanelSettings::default());
        assert_eq!(settings.web_port, 54321);
        assert_eq!(settings.tg_run_time, "@daily");
        assert!(settings.engine_template_config.is_none());
    }

    #[test]
    fn test_panel_settings_overrides() {
        let db = Database::in_memory().unwrap();
        db.set_setting(keys::WEB_PORT, &json!(8443)).unwrap();
        db.set_setting(keys::TG_BOT_ENABLE, &json!(true)).unwrap();
        db.set_setting(keys::TG_BOT_CHAT_ID, &json!(123456)).unwrap();
        db.set_setting(keys::ENGINE_TEMPLATE_CONFIG, &json!("{\"log\":{}}"))
            .unwrap();

        let settings = db.panel_settings().unwrap();
        assert_eq!(settings.web_port, 8443);
        assert!(settings.tg_bot_enable);
        assert_eq!(settings.tg_bot_chat_id, 123456);
        assert_eq!(settings.engine_template_config.as_deref(), Some("{\"log\":{}}"));
    }

    #[test]
    fn test_with_path_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join(format!("{}.db", APP_NAME));
        let db = Database::with_path(&path).unwrap();
        db.set_setting("k", &json!(1)).unwrap();
        assert!(path.exists());
    }

    #[test]
    fn test_default_path_is_named_after_app() {
        // No home directory in some sandboxes
        if let Ok(path) = Database::default_db_path() {
            assert!(path.ends_with("warden.db"));
            assert!(path.to_string_lossy().contains(APP_NAME));
        }
    }
}
