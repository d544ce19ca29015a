//! Engine configuration generation.
//!
//! The engine is configured from a JSON template plus one inbound per
//! enabled tunnel. The template carries the stats API plumbing the
//! accounting task depends on: an `api` inbound, the `stats` object and a
//! policy that turns on per-inbound counters.

use serde_json::{json, Map, Value};
use warden_storage::Tunnel;

use crate::error::{EngineError, Result};

/// Tag of the engine's stats API inbound.
pub const API_TAG: &str = "api";

/// Default loopback port of the stats API.
pub const DEFAULT_API_PORT: u16 = 62789;

/// Built-in template used when no override is stored.
pub const DEFAULT_TEMPLATE: &str = r#"{
  "log": {
    "loglevel": "warning"
  },
  "api": {
    "services": ["HandlerService", "LoggerService", "StatsService"],
    "tag": "api"
  },
  "inbounds": [
    {
      "listen": "127.0.0.1",
      "port": 62789,
      "protocol": "dokodemo-door",
      "settings": {
        "address": "127.0.0.1"
      },
      "tag": "api"
    }
  ],
  "outbounds": [
    {
      "protocol": "freedom",
      "settings": {}
    },
    {
      "protocol": "blackhole",
      "settings": {},
      "tag": "blocked"
    }
  ],
  "policy": {
    "system": {
      "inboundDownlink": true,
      "inboundUplink": true
    }
  },
  "routing": {
    "rules": [
      {
        "inboundTag": ["api"],
        "outboundTag": "api",
        "type": "field"
      },
      {
        "outboundTag": "blocked",
        "protocol": ["bittorrent"],
        "type": "field"
      }
    ]
  },
  "stats": {}
}"#;

/// Builds the full engine configuration.
///
/// `template` falls back to [`DEFAULT_TEMPLATE`]. The `api` inbound's port
/// is forced to `api_port` so stats queries reach it. Only enabled tunnels
/// are emitted.
pub fn build_config(template: Option<&str>, tunnels: &[Tunnel], api_port: u16) -> Result<Value> {
    let template = template.unwrap_or(DEFAULT_TEMPLATE);
    let mut config: Value = serde_json::from_str(template)
        .map_err(|e| EngineError::ConfigInvalid(format!("template: {}", e)))?;

    let root = config
        .as_object_mut()
        .ok_or_else(|| EngineError::ConfigInvalid("template is not a JSON object".into()))?;

    let inbounds = root
        .entry("inbounds")
        .or_insert_with(|| Value::Array(Vec::new()))
        .as_array_mut()
        .ok_or_else(|| EngineError::ConfigInvalid("template inbounds is not an array".into()))?;

    for inbound in inbounds.iter_mut() {
        if inbound.get("tag").and_then(Value::as_str) == Some(API_TAG) {
            inbound["port"] = json!(api_port);
        }
    }

    for tunnel in tunnels.iter().filter(|t| t.enable) {
        inbounds.push(tunnel_inbound(tunnel)?);
    }

    Ok(config)
}

/// Serialises the configuration the way the engine reads it from stdin.
pub fn to_bytes(config: &Value) -> Result<Vec<u8>> {
    serde_json::to_vec_pretty(config).map_err(|e| EngineError::ConfigInvalid(e.to_string()))
}

fn tunnel_inbound(tunnel: &Tunnel) -> Result<Value> {
    let mut inbound = Map::new();

    if !tunnel.listen.is_empty() {
        inbound.insert("listen".into(), json!(tunnel.listen));
    }
    inbound.insert("port".into(), json!(tunnel.port));
    inbound.insert("protocol".into(), json!(tunnel.protocol.as_str()));

    for (key, raw) in [
        ("settings", &tunnel.settings),
        ("streamSettings", &tunnel.stream_settings),
        ("sniffing", &tunnel.sniffing),
    ] {
        if let Some(value) = raw_json(&tunnel.tag, key, raw)? {
            inbound.insert(key.into(), value);
        }
    }

    inbound.insert("tag".into(), json!(tunnel.tag));

    Ok(Value::Object(inbound))
}

fn raw_json(tag: &str, key: &str, raw: &str) -> Result<Option<Value>> {
    if raw.trim().is_empty() {
        return Ok(None);
    }
    serde_json::from_str(raw)
        .map(Some)
        .map_err(|e| EngineError::ConfigInvalid(format!("{} {}: {}", tag, key, e)))
}
