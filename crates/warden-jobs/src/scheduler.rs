//! Recurring task runner.
//!
//! Every registered job gets its own tokio task. The job body is awaited
//! inside that task's loop, so a job never overlaps itself; ticks missed
//! while a body runs long are skipped rather than queued.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{Local, NaiveDateTime, NaiveTime};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};

use crate::error::SchedulerError;

/// A recurring task.
#[async_trait]
pub trait Job: Send + 'static {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Runs one tick. Failures are logged by the job, never propagated.
    async fn run(&mut self);
}

/// When a job runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Schedule {
    /// Every `interval`, first after `first`.
    Every { interval: Duration, first: Duration },
    /// Once a day at a local wall-clock time.
    Daily(NaiveTime),
}

impl Schedule {
    /// Once a day at local midnight.
    pub const DAILY: Schedule = Schedule::Daily(NaiveTime::MIN);

    /// Runs every `interval`, first one `interval` from now.
    pub fn every(interval: Duration) -> Self {
        Schedule::Every {
            interval,
            first: interval,
        }
    }

    /// Pushes the first run back by `delay`.
    pub fn with_delay(self, delay: Duration) -> Self {
        match self {
            Schedule::Every { interval, first } => Schedule::Every {
                interval,
                first: first + delay,
            },
            daily => daily,
        }
    }

    /// Parses `@every <n><ms|s|m|h>`, `@hourly`, `@daily` or `HH:MM`.
    pub fn parse(expr: &str) -> Result<Self, SchedulerError> {
        let expr = expr.trim();
        let invalid = || SchedulerError::InvalidSchedule(expr.to_string());

        if let Some(rest) = expr.strip_prefix("@every") {
            let interval = parse_duration(rest.trim()).ok_or_else(invalid)?;
            if interval.is_zero() {
                return Err(invalid());
            }
            return Ok(Schedule::every(interval));
        }

        match expr {
            "@hourly" => Ok(Schedule::every(Duration::from_secs(3600))),
            "@daily" | "@midnight" => Ok(Schedule::DAILY),
            _ => NaiveTime::parse_from_str(expr, "%H:%M")
                .map(Schedule::Daily)
                .map_err(|_| invalid()),
        }
    }

    /// Time from `now` until the next daily run.
    fn until_next(at: NaiveTime, now: NaiveDateTime) -> Duration {
        let mut next = now.date().and_time(at);
        if next <= now {
            next += chrono::Duration::days(1);
        }
        (next - now).to_std().unwrap_or(Duration::from_secs(60))
    }
}

fn parse_duration(s: &str) -> Option<Duration> {
    let split = s.find(|c: char| !c.is_ascii_digit())?;
    let (value, unit) = s.split_at(split);
    let value: u64 = value.parse().ok()?;

    match unit {
        "ms" => Some(Duration::from_millis(value)),
        "s" => Some(Duration::from_secs(value)),
        "m" => Some(Duration::from_secs(value * 60)),
        "h" => Some(Duration::from_secs(value * 3600)),
        _ => None,
    }
}

/// Runs jobs on their schedules until shut down.
pub struct Scheduler {
    shutdown_tx: broadcast::Sender<()>,
    tasks: Mutex<Vec<(String, JoinHandle<()>)>>,
}

impl Scheduler {
    /// Creates an empty scheduler.
    pub fn new() -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Registers a job. It starts ticking immediately.
    pub fn add<J: Job>(&self, schedule: Schedule, job: J) {
        let name = job.name().to_string();
        let shutdown_rx = self.shutdown_tx.subscribe();
        debug!(job = %name, ?schedule, "Registering job");

        let handle = tokio::spawn(run_job(schedule, job, shutdown_rx));
        self.tasks.lock().push((name, handle));
    }

    /// Number of registered jobs.
    pub fn len(&self) -> usize {
        self.tasks.lock().len()
    }

    /// Returns true if no job is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stops all ticking and waits for running job bodies to finish.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
        let tasks = std::mem::take(&mut *self.tasks.lock());

        for (name, handle) in tasks {
            if let Err(e) = handle.await {
                debug!(job = %name, "Job task ended abnormally: {}", e);
            }
        }
        info!("Scheduler stopped");
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

async fn run_job<J: Job>(schedule: Schedule, mut job: J, mut shutdown_rx: broadcast::Receiver<()>) {
    match schedule {
        Schedule::Every { interval, first } => {
            let mut ticker = tokio::time::interval_at(Instant::now() + first, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    biased;
                    _ = shutdown_rx.recv() => break,
                    _ = ticker.tick() => job.run().await,
                }
            }
        }
        Schedule::Daily(at) => loop {
            let wait = Schedule::until_next(at, Local::now().naive_local());
            tokio::select! {
                biased;
                _ = shutdown_rx.recv() => break,
                _ = tokio::time::sleep(wait) => job.run().await,
            }
        },
    }
    debug!(job = %job.name(), "Job stopped");
}
