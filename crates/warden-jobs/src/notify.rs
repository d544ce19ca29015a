//! Telegram notifications: the periodic traffic report and login notices.

use std::net::{IpAddr, UdpSocket};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Local, TimeZone};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};
use warden_core::format_traffic;
use warden_storage::{Database, PanelSettings, Tunnel};

use crate::control::EngineControl;
use crate::error::NotifyError;
use crate::scheduler::Job;

/// Public Telegram bot API endpoint.
pub const TELEGRAM_API_BASE: &str = "https://api.telegram.org";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Delivers plain-text messages to the operator.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, text: &str) -> Result<(), NotifyError>;
}

/// Sends messages through a Telegram bot.
pub struct TelegramNotifier {
    client: reqwest::Client,
    api_base: String,
    token: String,
    chat_id: i64,
}

#[derive(Debug, Deserialize)]
struct TelegramResponse {
    ok: bool,
    #[serde(default)]
    description: Option<String>,
}

impl TelegramNotifier {
    /// Creates a notifier for `chat_id` using the bot `token`.
    pub fn new(token: impl Into<String>, chat_id: i64) -> Result<Self, NotifyError> {
        let token = token.into();
        if token.trim().is_empty() {
            return Err(NotifyError::NotConfigured("bot token is empty".into()));
        }
        if chat_id == 0 {
            return Err(NotifyError::NotConfigured("chat id is not set".into()));
        }

        let client = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;

        Ok(Self {
            client,
            api_base: TELEGRAM_API_BASE.to_string(),
            token,
            chat_id,
        })
    }

    /// Creates a notifier from the panel settings.
    pub fn from_settings(settings: &PanelSettings) -> Result<Self, NotifyError> {
        Self::new(settings.tg_bot_token.clone(), settings.tg_bot_chat_id)
    }

    /// Points the notifier at another bot API server.
    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_string();
        self
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn send(&self, text: &str) -> Result<(), NotifyError> {
        let url = format!("{}/bot{}/sendMessage", self.api_base, self.token);
        let response = self
            .client
            .post(&url)
            .json(&json!({ "chat_id": self.chat_id, "text": text }))
            .send()
            .await?;

        let body: TelegramResponse = response.json().await?;
        if body.ok {
            debug!(chat_id = self.chat_id, "Telegram message sent");
            Ok(())
        } else {
            Err(NotifyError::Rejected(
                body.description.unwrap_or_else(|| "unknown error".into()),
            ))
        }
    }
}

/// Outcome of a panel login attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginStatus {
    Success,
    Failure,
}

/// Builds a login notice. `None` if any field is empty.
pub fn login_message(
    host: &str,
    username: &str,
    ip: &str,
    time: &str,
    status: LoginStatus,
) -> Option<String> {
    if username.is_empty() || ip.is_empty() || time.is_empty() {
        return None;
    }

    let title = match status {
        LoginStatus::Success => "Panel login succeeded",
        LoginStatus::Failure => "Panel login failed",
    };
    Some(format!(
        "{}\nHost: {}\nTime: {}\nUser: {}\nIP: {}\n",
        title, host, time, username, ip
    ))
}

/// Sends a login notice, logging instead of failing.
pub async fn notify_login(
    notifier: &dyn Notifier,
    username: &str,
    ip: &str,
    time: &str,
    status: LoginStatus,
) {
    let Some(message) = login_message(&hostname(), username, ip, time, status) else {
        warn!("Login notice skipped: incomplete login details");
        return;
    };
    if let Err(e) = notifier.send(&message).await {
        warn!("Failed to send login notice: {}", e);
    }
}

/// Builds the traffic report for all tunnels.
pub fn build_report(host: &str, ip: Option<IpAddr>, tunnels: &[Tunnel]) -> String {
    let mut report = format!("Host: {}\n", host);
    match ip {
        Some(ip) => report.push_str(&format!("IP: {}\n\n", ip)),
        None => report.push_str("IP: unknown\n\n"),
    }

    for tunnel in tunnels {
        report.push_str(&format!(
            "Tunnel: {}\nPort: {}\nUp: {}\nDown: {}\nTotal: {}\nExpiry: {}\n\n",
            tunnel.remark,
            tunnel.port,
            format_traffic(tunnel.up),
            format_traffic(tunnel.down),
            format_traffic(tunnel.up + tunnel.down),
            format_expiry(tunnel.expiry_time),
        ));
    }

    report
}

fn format_expiry(expiry_ms: i64) -> String {
    if expiry_ms == 0 {
        return "unlimited".to_string();
    }
    match Local.timestamp_millis_opt(expiry_ms).single() {
        Some(at) => at.format("%Y-%m-%d %H:%M:%S").to_string(),
        None => expiry_ms.to_string(),
    }
}

/// Name of this host.
pub fn hostname() -> String {
    #[cfg(unix)]
    {
        nix::unistd::gethostname()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown".to_string())
    }
    #[cfg(not(unix))]
    {
        std::env::var("COMPUTERNAME").unwrap_or_else(|_| "unknown".to_string())
    }
}

/// Address of the interface that carries the default route.
///
/// Connecting a UDP socket only selects a route; nothing is sent.
pub fn primary_ip() -> Option<IpAddr> {
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:80").ok()?;
    let ip = socket.local_addr().ok()?.ip();
    (!ip.is_loopback() && !ip.is_unspecified()).then_some(ip)
}

/// Sends the traffic report while the engine runs.
pub struct StatsReportJob<E> {
    engine: Arc<E>,
    db: Database,
    notifier: Arc<dyn Notifier>,
}

impl<E: EngineControl> StatsReportJob<E> {
    pub fn new(engine: Arc<E>, db: Database, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            engine,
            db,
            notifier,
        }
    }

    /// Builds and sends one report. Returns true if a message was sent.
    pub async fn report(&self) -> bool {
        if !self.engine.is_running() {
            return false;
        }

        let tunnels = match self.db.get_all_tunnels() {
            Ok(tunnels) => tunnels,
            Err(e) => {
                warn!("Stats report skipped: {}", e);
                return false;
            }
        };

        let report = build_report(&hostname(), primary_ip(), &tunnels);
        match self.notifier.send(&report).await {
            Ok(()) => true,
            Err(e) => {
                warn!("Failed to send stats report: {}", e);
                false
            }
        }
    }
}

#[async_trait]
impl<E: EngineControl> Job for StatsReportJob<E> {
    fn name(&self) -> &str {
        "stats-report"
    }

    async fn run(&mut self) {
        self.report().await;
    }
}
