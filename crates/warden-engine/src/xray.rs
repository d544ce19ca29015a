//! Xray engine driven through its command line.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use warden_core::TrafficDelta;

use crate::config::DEFAULT_API_PORT;
use crate::engine::{Engine, EngineProcess, OutputBuffer, ProcessExit};
use crate::error::{EngineError, Result};

/// Lines of process output kept for the exit detail.
pub const DEFAULT_OUTPUT_LINES: usize = 100;

/// Time allowed for a killed process to be reaped.
const KILL_TIMEOUT: Duration = Duration::from_secs(5);

/// Time allowed for output readers to drain after exit.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// The Xray binary.
#[derive(Debug, Clone)]
pub struct XrayEngine {
    binary: PathBuf,
    api_port: u16,
    output_lines: usize,
}

impl XrayEngine {
    /// Creates an engine for the binary at `binary`.
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            api_port: DEFAULT_API_PORT,
            output_lines: DEFAULT_OUTPUT_LINES,
        }
    }

    /// Sets the loopback port of the stats API.
    pub fn with_api_port(mut self, api_port: u16) -> Self {
        self.api_port = api_port;
        self
    }

    /// Sets how many output lines are kept per process.
    pub fn with_output_lines(mut self, output_lines: usize) -> Self {
        self.output_lines = output_lines;
        self
    }

    /// Path of the binary.
    pub fn binary(&self) -> &PathBuf {
        &self.binary
    }

    /// Loopback port of the stats API.
    pub fn api_port(&self) -> u16 {
        self.api_port
    }
}

#[async_trait]
impl Engine for XrayEngine {
    async fn launch(&self, config: &[u8]) -> Result<Box<dyn EngineProcess>> {
        let mut child = Command::new(&self.binary)
            .args(["run", "-c", "stdin:"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| EngineError::LaunchFailed(format!("{}: {}", self.binary.display(), e)))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| EngineError::LaunchFailed("stdin not captured".into()))?;
        stdin
            .write_all(config)
            .await
            .map_err(|e| EngineError::LaunchFailed(format!("writing config: {}", e)))?;
        // Closing stdin tells the engine the configuration is complete
        drop(stdin);

        let output = OutputBuffer::new(self.output_lines);
        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            readers.push(capture(stdout, output.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(capture(stderr, output.clone()));
        }

        let pid = child.id();
        let (exit_tx, exit_rx) = watch::channel(None);
        let (kill_tx, mut kill_rx) = mpsc::channel::<()>(1);
        let reaped = Arc::new(AtomicBool::new(false));
        let reaper_flag = reaped.clone();

        tokio::spawn(async move {
            let status = loop {
                tokio::select! {
                    status = child.wait() => break status,
                    Some(()) = kill_rx.recv() => {
                        if let Err(e) = child.start_kill() {
                            warn!(?pid, "Failed to kill engine: {}", e);
                        }
                    }
                }
            };
            // The pid may be reused from here on, so no signal may target it
            reaper_flag.store(true, Ordering::Release);

            let _ = tokio::time::timeout(DRAIN_TIMEOUT, async {
                for reader in readers {
                    let _ = reader.await;
                }
            })
            .await;

            let tail = output.contents();
            let exit = match status {
                Ok(status) => ProcessExit {
                    code: status.code(),
                    detail: join_detail(&tail, &format!("exit status: {}", status)),
                },
                Err(e) => ProcessExit {
                    code: None,
                    detail: join_detail(&tail, &format!("wait failed: {}", e)),
                },
            };
            debug!(?pid, code = ?exit.code, "Engine process reaped");
            exit_tx.send_replace(Some(exit));
        });

        Ok(Box::new(XrayProcess {
            pid,
            reaped,
            exit_rx,
            kill_tx,
        }))
    }

    async fn version(&self) -> Result<String> {
        let output = Command::new(&self.binary)
            .arg("-version")
            .output()
            .await
            .map_err(|e| EngineError::LaunchFailed(format!("{}: {}", self.binary.display(), e)))?;

        parse_version(&String::from_utf8_lossy(&output.stdout)).ok_or_else(|| {
            EngineError::LaunchFailed("unrecognised version output".into())
        })
    }

    async fn pull_traffic(&self) -> Result<Vec<TrafficDelta>> {
        let server = format!("--server=127.0.0.1:{}", self.api_port);
        let output = Command::new(&self.binary)
            .args(["api", "statsquery", &server, "-pattern", "", "-reset"])
            .output()
            .await
            .map_err(|e| EngineError::StatsPullFailed(e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(EngineError::StatsPullFailed(format!(
                "{}: {}",
                output.status,
                stderr.trim()
            )));
        }

        parse_stats(&output.stdout)
    }
}

/// Handle to a running Xray process.
///
/// The child is owned by a reaper task; the handle talks to it through the
/// exit watch and a kill channel. Dropping the handle kills the process.
/// `reaped` is set as soon as the child is waited on, before its output has
/// drained and the exit is published.
struct XrayProcess {
    pid: Option<u32>,
    reaped: Arc<AtomicBool>,
    exit_rx: watch::Receiver<Option<ProcessExit>>,
    kill_tx: mpsc::Sender<()>,
}

#[async_trait]
impl EngineProcess for XrayProcess {
    fn pid(&self) -> Option<u32> {
        if self.is_reaped() {
            None
        } else {
            self.pid
        }
    }

    fn exit(&self) -> watch::Receiver<Option<ProcessExit>> {
        self.exit_rx.clone()
    }

    async fn terminate(&self, grace: Duration) -> Result<()> {
        let mut exit = self.exit_rx.clone();
        let exited = exit.borrow().is_some();
        if exited {
            return Ok(());
        }

        if !self.is_reaped() {
            self.signal_terminate();
        }

        if wait_exit(&mut exit, grace).await {
            return Ok(());
        }

        warn!(pid = ?self.pid, "Engine did not exit within {:?}, killing", grace);
        let _ = self.kill_tx.try_send(());

        if wait_exit(&mut exit, KILL_TIMEOUT).await {
            Ok(())
        } else {
            Err(EngineError::TerminateFailed(format!(
                "pid {:?} still running after kill",
                self.pid
            )))
        }
    }
}

impl XrayProcess {
    fn is_reaped(&self) -> bool {
        self.reaped.load(Ordering::Acquire)
    }

    #[cfg(unix)]
    fn signal_terminate(&self) {
        use nix::sys::signal::{self, Signal};
        use nix::unistd::Pid;

        match self.pid {
            Some(pid) => {
                if let Err(e) = signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                    warn!(pid, "Failed to send SIGTERM: {}", e);
                } else {
                    debug!(pid, "Sent SIGTERM to engine");
                }
            }
            None => {
                let _ = self.kill_tx.try_send(());
            }
        }
    }

    #[cfg(not(unix))]
    fn signal_terminate(&self) {
        let _ = self.kill_tx.try_send(());
    }
}

impl Drop for XrayProcess {
    fn drop(&mut self) {
        let _ = self.kill_tx.try_send(());
    }
}

fn capture<R>(stream: R, output: OutputBuffer) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            output.push(line);
        }
    })
}

async fn wait_exit(rx: &mut watch::Receiver<Option<ProcessExit>>, limit: Duration) -> bool {
    matches!(
        tokio::time::timeout(limit, rx.wait_for(Option::is_some)).await,
        Ok(Ok(_))
    )
}

fn join_detail(tail: &str, status: &str) -> String {
    if tail.is_empty() {
        status.to_string()
    } else {
        format!("{}\n{}", tail, status)
    }
}

/// Second token of the first line, e.g. `Xray 1.8.4 (Xray, Penetrates Everything.) ...`.
fn parse_version(stdout: &str) -> Option<String> {
    stdout
        .lines()
        .next()?
        .split_whitespace()
        .nth(1)
        .map(str::to_string)
}

fn stats_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(inbound|outbound)>>>([^>]+)>>>traffic>>>(uplink|downlink)$")
            .expect("stats pattern is valid")
    })
}

/// Folds `statsquery` output into one delta per tag and direction.
fn parse_stats(stdout: &[u8]) -> Result<Vec<TrafficDelta>> {
    let body = String::from_utf8_lossy(stdout);
    if body.trim().is_empty() {
        return Ok(Vec::new());
    }

    let json: Value = serde_json::from_str(&body)
        .map_err(|e| EngineError::StatsPullFailed(format!("invalid stats output: {}", e)))?;

    let mut folded: BTreeMap<(bool, String), (i64, i64)> = BTreeMap::new();
    let stats = json.get("stat").and_then(Value::as_array);

    for stat in stats.into_iter().flatten() {
        let Some(name) = stat.get("name").and_then(Value::as_str) else {
            continue;
        };
        let Some(caps) = stats_regex().captures(name) else {
            continue;
        };
        let is_inbound = &caps[1] == "inbound";
        let entry = folded
            .entry((is_inbound, caps[2].to_string()))
            .or_insert((0, 0));

        let value = stat_value(stat.get("value"));
        if &caps[3] == "uplink" {
            entry.0 += value;
        } else {
            entry.1 += value;
        }
    }

    Ok(folded
        .into_iter()
        .map(|((is_inbound, tag), (up, down))| TrafficDelta {
            tag,
            is_inbound,
            up,
            down,
        })
        .collect())
}

// Zero counters are omitted and int64 may be rendered as a string
fn stat_value(value: Option<&Value>) -> i64 {
    match value {
        Some(Value::Number(n)) => n.as_i64().unwrap_or(0).max(0),
        Some(Value::String(s)) => s.parse::<i64>().unwrap_or(0).max(0),
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_is_second_token() {
        let out = "Xray 1.8.4 (Xray, Penetrates Everything.) Custom (go1.21.1 linux/amd64)\nA unified platform";
        assert_eq!(parse_version(out).as_deref(), Some("1.8.4"));
        assert_eq!(parse_version(""), None);
        assert_eq!(parse_version("Xray"), None);
    }

    #[test]
    fn stats_are_folded_per_tag() {
        let out = br#"{
            "stat": [
                {"name": "inbound>>>inbound-443>>>traffic>>>uplink", "value": 100},
                {"name": "inbound>>>inbound-443>>>traffic>>>downlink", "value": "250"},
                {"name": "inbound>>>api>>>traffic>>>downlink"},
                {"name": "outbound>>>direct>>>traffic>>>uplink", "value": 7},
                {"name": "user>>>a@b>>>traffic>>>uplink", "value": 9}
            ]
        }"#;

        let deltas = parse_stats(out).unwrap();
        assert_eq!(
            deltas,
            vec![
                TrafficDelta::outbound("direct", 7, 0),
                TrafficDelta::inbound("api", 0, 0),
                TrafficDelta::inbound("inbound-443", 100, 250),
            ]
        );
    }

    #[test]
    fn negative_counters_count_as_zero() {
        let out = br#"{
            "stat": [
                {"name": "inbound>>>inbound-443>>>traffic>>>uplink", "value": "-5"},
                {"name": "inbound>>>inbound-443>>>traffic>>>downlink", "value": -3},
                {"name": "inbound>>>inbound-443>>>traffic>>>downlink", "value": 10}
            ]
        }"#;

        let deltas = parse_stats(out).unwrap();
        assert_eq!(deltas, vec![TrafficDelta::inbound("inbound-443", 0, 10)]);
    }

    #[test]
    fn empty_stats_output() {
        assert!(parse_stats(b"").unwrap().is_empty());
        assert!(parse_stats(b"{}").unwrap().is_empty());
    }

    #[test]
    fn garbage_stats_output_fails() {
        assert!(matches!(
            parse_stats(b"failed to dial"),
            Err(EngineError::StatsPullFailed(_))
        ));
    }

    #[tokio::test]
    async fn missing_binary_fails_to_launch() {
        let engine = XrayEngine::new("/nonexistent/warden-test-engine");
        let err = engine.launch(b"{}").await.err().unwrap();
        assert!(matches!(err, EngineError::LaunchFailed(_)));
        assert!(engine.version().await.is_err());
        assert!(matches!(
            engine.pull_traffic().await,
            Err(EngineError::StatsPullFailed(_))
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn exit_detail_captures_output() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("engine.sh");
        std::fs::write(&script, "#!/bin/sh\ncat > /dev/null\necho started\necho boom >&2\nexit 3\n")
            .unwrap();
        std::fs::set_permissions(&script, std::os::unix::fs::PermissionsExt::from_mode(0o755))
            .unwrap();

        let engine = XrayEngine::new(&script);
        let process = engine.launch(b"{}").await.unwrap();
        let mut exit = process.exit();
        let exit = exit.wait_for(Option::is_some).await.unwrap().clone().unwrap();

        assert_eq!(exit.code, Some(3));
        assert!(exit.detail.contains("started"));
        assert!(exit.detail.contains("boom"));
        process.terminate(Duration::from_millis(10)).await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn terminate_stops_running_process() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("engine.sh");
        std::fs::write(&script, "#!/bin/sh\ncat > /dev/null\nexec sleep 30\n").unwrap();
        std::fs::set_permissions(&script, std::os::unix::fs::PermissionsExt::from_mode(0o755))
            .unwrap();

        let engine = XrayEngine::new(&script);
        let process = engine.launch(b"{}").await.unwrap();
        assert!(process.pid().is_some());

        process.terminate(Duration::from_secs(5)).await.unwrap();
        assert!(process.exit().borrow().is_some());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn reaped_process_is_not_signalled_while_output_drains() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("engine.sh");
        // The background sleep keeps stdout open past the exit
        std::fs::write(&script, "#!/bin/sh\ncat > /dev/null\nsleep 3 &\nexit 0\n").unwrap();
        std::fs::set_permissions(&script, std::os::unix::fs::PermissionsExt::from_mode(0o755))
            .unwrap();

        let engine = XrayEngine::new(&script);
        let process = engine.launch(b"{}").await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert!(process.exit().borrow().is_none());
        assert_eq!(process.pid(), None);

        process.terminate(Duration::from_secs(5)).await.unwrap();
        let exit = process.exit().borrow().clone().unwrap();
        assert_eq!(exit.code, Some(0));
    }
}
