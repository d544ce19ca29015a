//! Data models for storage.

use serde::{Deserialize, Serialize};
use warden_core::Protocol;

/// A configured proxy endpoint realised by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tunnel {
    /// Unique identifier.
    pub id: i64,
    /// Owning panel user.
    #[serde(skip)]
    pub user_id: i64,
    /// Cumulative uploaded bytes.
    pub up: i64,
    /// Cumulative downloaded bytes.
    pub down: i64,
    /// Traffic quota in bytes (0 = unlimited).
    pub total: i64,
    /// Free-form label.
    pub remark: String,
    /// Whether the engine should serve this tunnel.
    pub enable: bool,
    /// Absolute expiry in epoch milliseconds (0 = never).
    pub expiry_time: i64,
    /// Listen address (empty = engine default).
    pub listen: String,
    /// Listen port, unique across tunnels.
    pub port: u16,
    /// Proxy protocol.
    pub protocol: Protocol,
    /// Protocol settings (raw JSON, opaque to the control plane).
    pub settings: String,
    /// Transport settings (raw JSON).
    pub stream_settings: String,
    /// Engine tag, always `inbound-<port>`.
    pub tag: String,
    /// Sniffing settings (raw JSON).
    pub sniffing: String,
}

impl Tunnel {
    /// Returns true if the quota is set and used up.
    pub fn is_quota_exhausted(&self) -> bool {
        self.total > 0 && self.up + self.down >= self.total
    }

    /// Returns true if the expiry is set and has passed at `now_ms`.
    pub fn is_expired(&self, now_ms: i64) -> bool {
        self.expiry_time > 0 && self.expiry_time <= now_ms
    }

    /// Returns true if the enforcer would disable this tunnel at `now_ms`.
    pub fn should_disable(&self, now_ms: i64) -> bool {
        self.enable && (self.is_quota_exhausted() || self.is_expired(now_ms))
    }
}

/// Engine tag for a tunnel listening on `port`.
pub fn tag_for_port(port: u16) -> String {
    format!("inbound-{}", port)
}

/// Parameters for creating or replacing a tunnel.
///
/// The tag is not part of the input; it is always derived from the port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewTunnel {
    #[serde(default)]
    pub user_id: i64,
    #[serde(default)]
    pub up: i64,
    #[serde(default)]
    pub down: i64,
    #[serde(default)]
    pub total: i64,
    #[serde(default)]
    pub remark: String,
    #[serde(default = "default_enable")]
    pub enable: bool,
    #[serde(default)]
    pub expiry_time: i64,
    #[serde(default)]
    pub listen: String,
    pub port: u16,
    pub protocol: Protocol,
    #[serde(default = "empty_object")]
    pub settings: String,
    #[serde(default = "empty_object")]
    pub stream_settings: String,
    #[serde(default = "empty_object")]
    pub sniffing: String,
}

fn default_enable() -> bool {
    true
}

fn empty_object() -> String {
    "{}".to_string()
}

impl NewTunnel {
    /// Creates an enabled, unlimited tunnel with empty settings.
    pub fn new(user_id: i64, port: u16, protocol: Protocol) -> Self {
        Self {
            user_id,
            up: 0,
            down: 0,
            total: 0,
            remark: String::new(),
            enable: true,
            expiry_time: 0,
            listen: String::new(),
            port,
            protocol,
            settings: empty_object(),
            stream_settings: empty_object(),
            sniffing: empty_object(),
        }
    }

    /// Sets the remark.
    pub fn with_remark(mut self, remark: impl Into<String>) -> Self {
        self.remark = remark.into();
        self
    }

    /// Sets the traffic quota in bytes.
    pub fn with_total(mut self, total: i64) -> Self {
        self.total = total;
        self
    }

    /// Sets the expiry in epoch milliseconds.
    pub fn with_expiry(mut self, expiry_time: i64) -> Self {
        self.expiry_time = expiry_time;
        self
    }

    /// Sets the cumulative counters.
    pub fn with_usage(mut self, up: i64, down: i64) -> Self {
        self.up = up;
        self.down = down;
        self
    }

    /// Sets the protocol settings JSON.
    pub fn with_settings(mut self, settings: impl Into<String>) -> Self {
        self.settings = settings.into();
        self
    }

    /// Sets the enable flag.
    pub fn with_enable(mut self, enable: bool) -> Self {
        self.enable = enable;
        self
    }

    /// Engine tag this tunnel will be stored with.
    pub fn tag(&self) -> String {
        tag_for_port(self.port)
    }
}

/// A persisted key-value setting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Setting {
    /// Setting key.
    pub key: String,
    /// Setting value (JSON).
    pub value: serde_json::Value,
}

/// Default port of the web listener.
pub const DEFAULT_WEB_PORT: u16 = 54321;

/// Default schedule of the stats report.
pub const DEFAULT_TG_RUN_TIME: &str = "@daily";

/// Typed view of the panel settings, with defaults applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PanelSettings {
    pub web_listen: String,
    pub web_port: u16,
    pub web_cert_file: String,
    pub web_key_file: String,
    /// Engine template override; `None` means the built-in template.
    pub engine_template_config: Option<String>,
    pub tg_bot_enable: bool,
    pub tg_bot_token: String,
    pub tg_bot_chat_id: i64,
    pub tg_run_time: String,
}

impl Default for PanelSettings {
    fn default() -> Self {
        Self {
            web_listen: String::new(),
            web_port: DEFAULT_WEB_PORT,
            web_cert_file: String::new(),
            web_key_file: String::new(),
            engine_template_config: None,
            tg_bot_enable: false,
            tg_bot_token: String::new(),
            tg_bot_chat_id: 0,
            tg_run_time: DEFAULT_TG_RUN_TIME.to_string(),
        }
    }
}
