//! Settings repository.
//!
//! Values are stored as JSON text so typed getters can round-trip numbers,
//! booleans and strings through the same column.

use rusqlite::{params, Connection, OptionalExtension};

use crate::error::Result;
use crate::models::Setting;

/// Address the web listener binds to (empty = all interfaces).
pub const WEB_LISTEN: &str = "web_listen";
/// Port the web listener binds to.
pub const WEB_PORT: &str = "web_port";
/// PEM certificate chain for the web listener.
pub const WEB_CERT_FILE: &str = "web_cert_file";
/// PEM private key for the web listener.
pub const WEB_KEY_FILE: &str = "web_key_file";
/// Base engine configuration the tunnel inbounds are appended to.
pub const ENGINE_TEMPLATE_CONFIG: &str = "engine_template_config";
/// Whether the Telegram stats report is sent.
pub const TG_BOT_ENABLE: &str = "tg_bot_enable";
/// Telegram bot token.
pub const TG_BOT_TOKEN: &str = "tg_bot_token";
/// Telegram chat that receives reports.
pub const TG_BOT_CHAT_ID: &str = "tg_bot_chat_id";
/// Schedule of the Telegram stats report.
pub const TG_RUN_TIME: &str = "tg_run_time";

/// Repository for settings operations.
pub struct SettingsRepo;

impl SettingsRepo {
    /// Get a setting.
    pub fn get(conn: &Connection, key: &str) -> Result<Option<Setting>> {
        let mut stmt = conn.prepare("SELECT key, value FROM settings WHERE key = ?1")?;

        let setting = stmt
            .query_row([key], |row| {
                let value_str: String = row.get(1)?;
                Ok(Setting {
                    key: row.get(0)?,
                    value: serde_json::from_str(&value_str).unwrap_or(serde_json::Value::Null),
                })
            })
            .optional()?;

        Ok(setting)
    }

    /// Set a setting (insert or update).
    pub fn set(conn: &Connection, key: &str, value: &serde_json::Value) -> Result<()> {
        let value_json = serde_json::to_string(value)?;

        conn.execute(
            "INSERT INTO settings (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = ?2",
            params![key, value_json],
        )?;

        Ok(())
    }

    /// Delete a setting. Returns whether it existed.
    pub fn delete(conn: &Connection, key: &str) -> Result<bool> {
        let deleted = conn.execute("DELETE FROM settings WHERE key = ?1", [key])?;
        Ok(deleted > 0)
    }

    /// Get all settings ordered by key.
    pub fn get_all(conn: &Connection) -> Result<Vec<Setting>> {
        let mut stmt = conn.prepare("SELECT key, value FROM settings ORDER BY key")?;

        let settings = stmt
            .query_map([], |row| {
                let value_str: String = row.get(1)?;
                Ok(Setting {
                    key: row.get(0)?,
                    value: serde_json::from_str(&value_str).unwrap_or(serde_json::Value::Null),
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(settings)
    }

    /// Get a typed setting, falling back to `default` when missing or mistyped.
    pub fn get_or_default<T: serde::de::DeserializeOwned>(
        conn: &Connection,
        key: &str,
        default: T,
    ) -> Result<T> {
        match Self::get(conn, key)? {
            Some(setting) => Ok(serde_json::from_value(setting.value).unwrap_or(default)),
            None => Ok(default),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::run_migrations;
    use serde_json::json;

    fn setup_db() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        conn
    }

    #[test]
    fn test_set_get_overwrite() {
        let conn = setup_db();
        SettingsRepo::set(&conn, WEB_PORT, &json!(8080)).unwrap();
        SettingsRepo::set(&conn, WEB_PORT, &json!(9090)).unwrap();

        let setting = SettingsRepo::get(&conn, WEB_PORT).unwrap().unwrap();
        assert_eq!(setting.value, json!(9090));
        assert!(SettingsRepo::get(&conn, "missing").unwrap().is_none());
    }

    #[test]
    fn test_get_or_default() {
        let conn = setup_db();
        assert_eq!(
            SettingsRepo::get_or_default(&conn, WEB_PORT, 54321u16).unwrap(),
            54321
        );

        // Wrong type falls back
        SettingsRepo::set(&conn, WEB_PORT, &json!("not a port")).unwrap();
        assert_eq!(
            SettingsRepo::get_or_default(&conn, WEB_PORT, 54321u16).unwrap(),
            54321
        );

        SettingsRepo::set(&conn, TG_BOT_ENABLE, &json!(true)).unwrap();
        assert!(SettingsRepo::get_or_default(&conn, TG_BOT_ENABLE, false).unwrap());
    }

    #[test]
    fn test_delete_and_get_all() {
        let conn = setup_db();
        SettingsRepo::set(&conn, TG_BOT_TOKEN, &json!("t")).unwrap();
        SettingsRepo::set(&conn, TG_BOT_CHAT_ID, &json!(42)).unwrap();

        let keys: Vec<String> = SettingsRepo::get_all(&conn)
            .unwrap()
            .into_iter()
            .map(|s| s.key)
            .collect();
        assert_eq!(keys, vec![TG_BOT_CHAT_ID, TG_BOT_TOKEN]);

        assert!(SettingsRepo::delete(&conn, TG_BOT_TOKEN).unwrap());
        assert!(!SettingsRepo::delete(&conn, TG_BOT_TOKEN).unwrap());
    }
}
