//! Recurring backup scheduling.
//!
//! Cadences are turned into cron or fixed-interval jobs on a
//! [`JobScheduler`]. Every scheduled name gets a [`TriggerGate`]: a tick that
//! arrives while the previous run is still going is remembered, and exactly
//! one catch-up run starts as soon as the current one finishes, however many
//! ticks were missed in between.

use crate::utils::{EngineError, Result};
use chrono::{DateTime, Datelike, Duration as ChronoDuration, NaiveTime, Utc, Weekday};
use futures_util::future::BoxFuture;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, info, warn};

const DEFAULT_HOUR: u32 = 2;
const DEFAULT_MINUTE: u32 = 0;

/// When a scheduled backup runs. All times are UTC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cadence {
    Interval(Duration),
    Daily { hour: u32, minute: u32 },
    Weekly { weekday: Weekday, hour: u32, minute: u32 },
}

impl Cadence {
    /// Six-field cron expression (sec min hour dom month dow), or `None` for
    /// fixed intervals.
    pub fn cron_expression(&self) -> Option<String> {
        match self {
            Cadence::Interval(_) => None,
            Cadence::Daily { hour, minute } => Some(format!("0 {} {} * * *", minute, hour)),
            Cadence::Weekly {
                weekday,
                hour,
                minute,
            } => Some(format!("0 {} {} * * {}", minute, hour, weekday)),
        }
    }

    /// First due time strictly after `now`.
    pub fn next_after(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match *self {
            Cadence::Interval(every) => ChronoDuration::from_std(every)
                .ok()
                .and_then(|d| now.checked_add_signed(d))
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
            Cadence::Daily { hour, minute } => {
                let today = at(now, hour, minute);
                if today > now {
                    today
                } else {
                    today + ChronoDuration::days(1)
                }
            }
            Cadence::Weekly {
                weekday,
                hour,
                minute,
            } => {
                let ahead = (7 + weekday.num_days_from_monday() as i64
                    - now.weekday().num_days_from_monday() as i64)
                    % 7;
                let candidate = at(now, hour, minute) + ChronoDuration::days(ahead);
                if candidate > now {
                    candidate
                } else {
                    candidate + ChronoDuration::days(7)
                }
            }
        }
    }
}

fn at(day: DateTime<Utc>, hour: u32, minute: u32) -> DateTime<Utc> {
    let time = NaiveTime::from_hms_opt(hour, minute, 0).unwrap_or_default();
    day.date_naive().and_time(time).and_utc()
}

fn parse_time(s: &str) -> Result<(u32, u32)> {
    let bad = || EngineError::Config(format!("invalid time of day '{}' (expected HH:MM)", s));
    let (h, m) = s.split_once(':').ok_or_else(bad)?;
    let hour: u32 = h.parse().map_err(|_| bad())?;
    let minute: u32 = m.parse().map_err(|_| bad())?;
    if hour > 23 || minute > 59 {
        return Err(bad());
    }
    Ok((hour, minute))
}

fn parse_interval(s: &str) -> Result<Duration> {
    let bad = || EngineError::Config(format!("invalid interval '{}' (e.g. 30s, 15m, 6h)", s));
    if !s.is_ascii() {
        return Err(bad());
    }
    let split = s.len().checked_sub(1).ok_or_else(bad)?;
    let (amount, unit) = s.split_at(split);
    let amount: u64 = amount.parse().map_err(|_| bad())?;
    let seconds = match unit {
        "s" => amount,
        "m" => amount.saturating_mul(60),
        "h" => amount.saturating_mul(3600),
        _ => return Err(bad()),
    };
    if seconds == 0 {
        return Err(bad());
    }
    Ok(Duration::from_secs(seconds))
}

/// Accepted forms: `daily`, `daily@HH:MM`, `weekly`, `weekly@HH:MM`,
/// `weekly:<weekday>@HH:MM`, `interval:<n>{s,m,h}`.
impl FromStr for Cadence {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim().to_ascii_lowercase();
        let (kind, time) = match s.split_once('@') {
            Some((kind, time)) => (kind, Some(parse_time(time)?)),
            None => (s.as_str(), None),
        };
        let (hour, minute) = time.unwrap_or((DEFAULT_HOUR, DEFAULT_MINUTE));

        if kind == "daily" {
            return Ok(Cadence::Daily { hour, minute });
        }
        if kind == "weekly" {
            return Ok(Cadence::Weekly {
                weekday: Weekday::Sun,
                hour,
                minute,
            });
        }
        if let Some(day) = kind.strip_prefix("weekly:") {
            let weekday = day
                .parse::<Weekday>()
                .map_err(|_| EngineError::Config(format!("unknown weekday '{}'", day)))?;
            return Ok(Cadence::Weekly {
                weekday,
                hour,
                minute,
            });
        }
        if let Some(every) = kind.strip_prefix("interval:") {
            if time.is_some() {
                return Err(EngineError::Config(format!(
                    "interval cadence '{}' does not take a time of day",
                    s
                )));
            }
            return Ok(Cadence::Interval(parse_interval(every)?));
        }

        Err(EngineError::Config(format!(
            "unknown cadence '{}' (expected daily, weekly or interval:<n>{{s,m,h}})",
            s
        )))
    }
}

impl fmt::Display for Cadence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cadence::Interval(every) => write!(f, "interval:{}s", every.as_secs()),
            Cadence::Daily { hour, minute } => write!(f, "daily@{:02}:{:02}", hour, minute),
            Cadence::Weekly {
                weekday,
                hour,
                minute,
            } => write!(
                f,
                "weekly:{}@{:02}:{:02}",
                weekday.to_string().to_lowercase(),
                hour,
                minute
            ),
        }
    }
}

/// Zero-argument action run at each due time.
pub type Trigger = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fire {
    /// The trigger ran (possibly followed by one catch-up run)
    Ran,
    /// A run was already in flight; one more run is queued behind it
    Deferred,
}

#[derive(Debug, Default)]
struct GateState {
    running: bool,
    pending: bool,
}

/// Serializes runs of one logical name and coalesces missed ticks.
#[derive(Clone)]
pub struct TriggerGate {
    logical_name: String,
    state: Arc<Mutex<GateState>>,
    trigger: Trigger,
}

impl TriggerGate {
    pub fn new(logical_name: impl Into<String>, trigger: Trigger) -> Self {
        Self {
            logical_name: logical_name.into(),
            state: Arc::new(Mutex::new(GateState::default())),
            trigger,
        }
    }

    pub fn is_running(&self) -> bool {
        self.lock().running
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, GateState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Handle one due tick.
    pub async fn fire(&self) -> Fire {
        {
            let mut state = self.lock();
            if state.running {
                state.pending = true;
                info!(logical_name = %self.logical_name, "Previous run still in progress, deferring");
                return Fire::Deferred;
            }
            state.running = true;
        }
        let mut run = RunGuard {
            gate: self,
            armed: true,
        };

        loop {
            (self.trigger)().await;

            let mut state = self.lock();
            if state.pending {
                state.pending = false;
                drop(state);
                info!(logical_name = %self.logical_name, "Running deferred tick");
            } else {
                state.running = false;
                run.armed = false;
                return Fire::Ran;
            }
        }
    }
}

/// Releases the gate if a run unwinds or is dropped mid-flight.
struct RunGuard<'a> {
    gate: &'a TriggerGate,
    armed: bool,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            let mut state = self.gate.lock();
            state.running = false;
            state.pending = false;
            warn!(logical_name = %self.gate.logical_name, "Scheduled run ended abnormally, gate released");
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Idle,
    Running,
    Stopped,
}

/// Owns the cron runtime and the per-name gates.
pub struct BackupScheduler {
    scheduler: JobScheduler,
    gates: HashMap<String, TriggerGate>,
    lifecycle: Lifecycle,
}

impl BackupScheduler {
    pub async fn new() -> Result<Self> {
        let scheduler = JobScheduler::new().await.map_err(scheduler_err)?;
        Ok(Self {
            scheduler,
            gates: HashMap::new(),
            lifecycle: Lifecycle::Idle,
        })
    }

    /// Register `trigger` to run for `logical_name` at every `cadence` tick.
    /// Several cadences for one name share a single gate (and the trigger
    /// given first).
    pub async fn schedule(
        &mut self,
        logical_name: &str,
        cadence: Cadence,
        trigger: Trigger,
    ) -> Result<uuid::Uuid> {
        if self.lifecycle == Lifecycle::Stopped {
            return Err(EngineError::Scheduler("scheduler has been stopped".to_string()));
        }

        let gate = self
            .gates
            .entry(logical_name.to_string())
            .or_insert_with(|| TriggerGate::new(logical_name, trigger))
            .clone();

        let job = match cadence.cron_expression() {
            Some(expr) => Job::new_async(expr.as_str(), move |_uuid, _lock| {
                let gate = gate.clone();
                Box::pin(async move {
                    tokio::spawn(async move { gate.fire().await });
                })
            }),
            None => {
                let Cadence::Interval(every) = cadence else {
                    return Err(EngineError::Scheduler(format!("no schedule for {}", cadence)));
                };
                Job::new_repeated_async(every, move |_uuid, _lock| {
                    let gate = gate.clone();
                    Box::pin(async move {
                        tokio::spawn(async move { gate.fire().await });
                    })
                })
            }
        }
        .map_err(scheduler_err)?;

        let id = self.scheduler.add(job).await.map_err(scheduler_err)?;
        info!(
            logical_name = %logical_name,
            cadence = %cadence,
            next = %cadence.next_after(Utc::now()),
            "Backup scheduled"
        );
        Ok(id)
    }

    pub async fn start(&mut self) -> Result<()> {
        match self.lifecycle {
            Lifecycle::Idle => {
                self.scheduler.start().await.map_err(scheduler_err)?;
                self.lifecycle = Lifecycle::Running;
                info!(jobs = self.gates.len(), "Scheduler started");
                Ok(())
            }
            Lifecycle::Running => Err(EngineError::Scheduler("scheduler already started".to_string())),
            Lifecycle::Stopped => Err(EngineError::Scheduler("scheduler has been stopped".to_string())),
        }
    }

    /// Stop firing new ticks. Runs already in progress are not interrupted.
    pub async fn stop(&mut self) -> Result<()> {
        if self.lifecycle != Lifecycle::Running {
            debug!("Scheduler stop requested while not running");
            self.lifecycle = Lifecycle::Stopped;
            return Ok(());
        }
        self.lifecycle = Lifecycle::Stopped;
        self.scheduler.shutdown().await.map_err(scheduler_err)?;

        let busy: Vec<_> = self
            .gates
            .iter()
            .filter(|(_, gate)| gate.is_running())
            .map(|(name, _)| name.as_str())
            .collect();
        if !busy.is_empty() {
            warn!("Scheduler stopped with runs still in progress: {}", busy.join(", "));
        }
        info!("Scheduler stopped");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.lifecycle == Lifecycle::Running
    }
}

fn scheduler_err(e: tokio_cron_scheduler::JobSchedulerError) -> EngineError {
    EngineError::Scheduler(e.to_string())
}
