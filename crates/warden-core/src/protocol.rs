//! Proxy protocols a tunnel can be configured with.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error returned when a protocol name is not recognised.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown protocol: {0}")]
pub struct ProtocolParseError(pub String);

/// Protocol of a tunnel, as understood by the engine.
///
/// The control plane never interprets the protocol; it is carried through to
/// the generated engine configuration verbatim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Protocol {
    #[serde(rename = "vmess")]
    VMess,
    #[serde(rename = "vless")]
    VLess,
    #[serde(rename = "dokodemo-door")]
    Dokodemo,
    #[serde(rename = "http")]
    Http,
    #[serde(rename = "trojan")]
    Trojan,
    #[serde(rename = "shadowsocks")]
    Shadowsocks,
}

impl Protocol {
    /// Engine-facing name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::VMess => "vmess",
            Protocol::VLess => "vless",
            Protocol::Dokodemo => "dokodemo-door",
            Protocol::Http => "http",
            Protocol::Trojan => "trojan",
            Protocol::Shadowsocks => "shadowsocks",
        }
    }

    /// Parse from the engine-facing name (case-insensitive).
    pub fn parse(s: &str) -> Result<Self, ProtocolParseError> {
        match s.to_ascii_lowercase().as_str() {
            "vmess" => Ok(Protocol::VMess),
            "vless" => Ok(Protocol::VLess),
            "dokodemo-door" => Ok(Protocol::Dokodemo),
            "http" => Ok(Protocol::Http),
            "trojan" => Ok(Protocol::Trojan),
            "shadowsocks" => Ok(Protocol::Shadowsocks),
            _ => Err(ProtocolParseError(s.to_string())),
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Protocol {
    type Err = ProtocolParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_accepts_mixed_case() {
        assert_eq!(Protocol::parse("VMess").unwrap(), Protocol::VMess);
        assert_eq!(Protocol::parse("Dokodemo-door").unwrap(), Protocol::Dokodemo);
    }

    #[test]
    fn parse_rejects_unknown() {
        let err = Protocol::parse("wireguard").unwrap_err();
        assert_eq!(err.0, "wireguard");
    }

    #[test]
    fn serde_uses_engine_names() {
        let json = serde_json::to_string(&Protocol::Shadowsocks).unwrap();
        assert_eq!(json, "\"shadowsocks\"");

        let parsed: Protocol = serde_json::from_str("\"trojan\"").unwrap();
        assert_eq!(parsed, Protocol::Trojan);
    }
}
