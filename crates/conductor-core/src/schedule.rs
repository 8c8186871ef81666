use crate::{ConductorError, ConductorResult, JsonMap};
use chrono::{DateTime, Duration, Utc};
use cron::Schedule;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// A recurring task definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledTask {
    /// Generated id.
    pub schedule_id: String,
    /// Display name.
    pub name: String,
    /// Instruction each run delegates.
    pub prompt: String,
    /// Page the executor opens first.
    #[serde(default)]
    pub start_url: Option<String>,
    /// Seconds between runs without a cron expression.
    pub interval_seconds: u64,
    /// 7-field cron expression; overrides `interval_seconds` when set.
    #[serde(default)]
    pub cron_expression: Option<String>,
    /// Disabled schedules keep their definition but never fire.
    pub enabled: bool,
    /// Executor options copied into every run.
    #[serde(default)]
    pub options: JsonMap,
    /// How many tasks each firing fans out to.
    pub parallel_workers: u32,
    /// Disable after this many runs.
    #[serde(default)]
    pub max_runs: Option<u32>,
    /// Runs so far; advanced when a run is claimed.
    #[serde(default)]
    pub run_count: u32,
    /// Null exactly when the schedule was disabled by reaching `max_runs`.
    #[serde(default)]
    pub next_run_at: Option<DateTime<Utc>>,
    /// When the latest run was claimed.
    #[serde(default)]
    pub last_run_at: Option<DateTime<Utc>>,
    /// Notify every gateway when a run finishes.
    #[serde(default)]
    pub notify_on_complete: bool,
    /// Send finished runs to a supervisor for prompt refinement.
    #[serde(default)]
    pub self_learning: bool,
    /// Re-run failed tasks up to the configured retry limit.
    #[serde(default)]
    pub self_healing: bool,
    /// Cap on optimizer runs; unlimited when absent.
    #[serde(default)]
    pub self_learning_max_runs: Option<u32>,
    /// Optimizer runs so far.
    #[serde(default)]
    pub self_learning_run_count: u32,
    /// Tombstone; deleted schedules are never selected again.
    #[serde(default)]
    pub deleted: bool,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last definition or counter change.
    pub updated_at: DateTime<Utc>,
}

/// Parse a 7-field cron expression (sec min hour dom month dow year).
pub fn parse_cron(expr: &str) -> ConductorResult<Schedule> {
    Schedule::from_str(expr)
        .map_err(|e| ConductorError::Config(format!("Invalid cron expression '{expr}': {e}")))
}

impl ScheduledTask {
    /// An enabled schedule firing every `interval_seconds`, first at
    /// `now + interval`.
    pub fn new(name: impl Into<String>, prompt: impl Into<String>, interval_seconds: u64) -> Self {
        let now = Utc::now();
        let mut schedule = Self {
            schedule_id: crate::new_id(),
            name: name.into(),
            prompt: prompt.into(),
            start_url: None,
            interval_seconds,
            cron_expression: None,
            enabled: true,
            options: JsonMap::new(),
            parallel_workers: 1,
            max_runs: None,
            run_count: 0,
            next_run_at: None,
            last_run_at: None,
            notify_on_complete: false,
            self_learning: false,
            self_healing: false,
            self_learning_max_runs: None,
            self_learning_run_count: 0,
            deleted: false,
            created_at: now,
            updated_at: now,
        };
        schedule.next_run_at = schedule.next_after(now);
        schedule
    }

    /// Check the fields that would make the schedule unusable.
    pub fn validate(&self) -> ConductorResult<()> {
        if self.prompt.trim().is_empty() {
            return Err(ConductorError::Config(format!(
                "schedule '{}' has an empty prompt",
                self.name
            )));
        }
        match &self.cron_expression {
            Some(expr) => {
                parse_cron(expr)?;
            }
            None if self.interval_seconds == 0 => {
                return Err(ConductorError::Config(format!(
                    "schedule '{}' needs interval_seconds > 0 or a cron expression",
                    self.name
                )));
            }
            None => {}
        }
        Ok(())
    }

    /// Next firing strictly after `now`, ignoring run limits.
    pub fn next_after(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if let Some(expr) = &self.cron_expression {
            return match parse_cron(expr) {
                Ok(schedule) => schedule.after(&now).next(),
                Err(e) => {
                    tracing::warn!(schedule_id = %self.schedule_id, error = %e, "Unparseable cron, falling back to interval");
                    self.interval_next(now)
                }
            };
        }
        self.interval_next(now)
    }

    fn interval_next(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let secs = i64::try_from(self.interval_seconds.max(1)).ok()?;
        Duration::try_seconds(secs).and_then(|step| now.checked_add_signed(step))
    }

    /// Enabled, not deleted, and `next_run_at` has passed.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.enabled && !self.deleted && self.next_run_at.is_some_and(|at| at <= now)
    }

    /// `max_runs` is set and reached.
    pub fn runs_exhausted(&self) -> bool {
        self.max_runs.is_some_and(|max| self.run_count >= max)
    }

    /// Account for one firing at `now`.
    ///
    /// Increments `run_count`, stamps `last_run_at`, and either schedules the
    /// next firing or, once `max_runs` is reached, disables the schedule and
    /// nulls `next_run_at`.
    pub fn record_run(&mut self, now: DateTime<Utc>) {
        self.run_count += 1;
        self.last_run_at = Some(now);
        if self.runs_exhausted() {
            self.enabled = false;
            self.next_run_at = None;
        } else {
            self.next_run_at = self.next_after(now);
        }
        self.updated_at = now;
    }

    /// Re-enable and recompute the next firing from `now`.
    pub fn enable(&mut self, now: DateTime<Utc>) {
        self.enabled = true;
        self.next_run_at = self.next_after(now);
        self.updated_at = now;
    }

    /// Disable without touching `next_run_at`.
    pub fn disable(&mut self, now: DateTime<Utc>) {
        self.enabled = false;
        self.updated_at = now;
    }

    /// Whether another optimizer run is allowed.
    pub fn learning_allowed(&self) -> bool {
        self.self_learning
            && self
                .self_learning_max_runs
                .map_or(true, |max| self.self_learning_run_count < max)
    }

    /// Executor type requested through `options.target`.
    pub fn target(&self) -> Option<crate::ClientType> {
        self.options
            .get("target")
            .and_then(serde_json::Value::as_str)
            .and_then(|t| t.parse().ok())
    }

    /// Apply a partial update, then recompute `next_run_at` if the cadence or
    /// the enabled flag changed.
    pub fn apply(&mut self, patch: SchedulePatch, now: DateTime<Utc>) {
        let cadence_changed =
            patch.interval_seconds.is_some() || patch.cron_expression.is_some();
        if let Some(name) = patch.name {
            self.name = name;
        }
        if let Some(prompt) = patch.prompt {
            self.prompt = prompt;
        }
        if let Some(url) = patch.start_url {
            self.start_url = Some(url);
        }
        if let Some(secs) = patch.interval_seconds {
            self.interval_seconds = secs;
        }
        if let Some(expr) = patch.cron_expression {
            self.cron_expression = if expr.trim().is_empty() { None } else { Some(expr) };
        }
        if let Some(options) = patch.options {
            self.options = options;
        }
        if let Some(n) = patch.parallel_workers {
            self.parallel_workers = n.max(1);
        }
        if let Some(max) = patch.max_runs {
            self.max_runs = Some(max);
        }
        if let Some(v) = patch.notify_on_complete {
            self.notify_on_complete = v;
        }
        if let Some(v) = patch.self_learning {
            self.self_learning = v;
        }
        if let Some(v) = patch.self_healing {
            self.self_healing = v;
        }
        if let Some(v) = patch.self_learning_max_runs {
            self.self_learning_max_runs = Some(v);
        }
        match patch.enabled {
            Some(true) if !self.enabled || self.next_run_at.is_none() => self.enable(now),
            Some(false) => self.disable(now),
            _ if cadence_changed && self.enabled => self.next_run_at = self.next_after(now),
            _ => {}
        }
        self.updated_at = now;
    }
}

/// Partial update for a [`ScheduledTask`]; `None` fields are left alone.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchedulePatch {
    /// New display name.
    #[serde(default)]
    pub name: Option<String>,
    /// New instruction text.
    #[serde(default)]
    pub prompt: Option<String>,
    /// New start page.
    #[serde(default)]
    pub start_url: Option<String>,
    /// New interval; recomputes `next_run_at`.
    #[serde(default)]
    pub interval_seconds: Option<u64>,
    /// New cron expression; empty clears it.
    #[serde(default)]
    pub cron_expression: Option<String>,
    /// Enable or disable.
    #[serde(default)]
    pub enabled: Option<bool>,
    /// Replacement options.
    #[serde(default)]
    pub options: Option<JsonMap>,
    /// New fan-out width.
    #[serde(default)]
    pub parallel_workers: Option<u32>,
    /// New run cap.
    #[serde(default)]
    pub max_runs: Option<u32>,
    /// Toggle completion notices.
    #[serde(default)]
    pub notify_on_complete: Option<bool>,
    /// Toggle self-learning.
    #[serde(default)]
    pub self_learning: Option<bool>,
    /// Toggle self-healing.
    #[serde(default)]
    pub self_healing: Option<bool>,
    /// New optimizer run cap.
    #[serde(default)]
    pub self_learning_max_runs: Option<u32>,
}
