//! Recurring and one-shot jobs, reconciled against a [`TimerSource`].
//!
//! The scheduler itself persists nothing. Every call to
//! [`Scheduler::register`] compares the declared specs with what the timer
//! source currently holds and only touches triggers that differ, so it is
//! safe to run on every process start.
//!
//! ```ignore
//! let mut scheduler = Scheduler::new(timer, dispatcher, registry);
//! scheduler.job(PruneSessions).hourly().on_queue("maintenance");
//! scheduler.job(SendDigest { user_id: 7 }).cron("0 30 8 * * Mon-Fri");
//! scheduler.job(Reindex).every_minutes(15).skip(|| in_maintenance_window());
//!
//! let summary = scheduler.register().await;
//! ```

use chrono::{DateTime, Utc};
use futures::FutureExt;
use heck::ToSnakeCase;
use serde_json::Value;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::clock::{self, SharedClock};
use crate::dispatcher::Dispatcher;
use crate::job::{Job, JobId, JobOptions};
use crate::payload::{Payload, PayloadRegistry, Task};
use crate::timer::{CustomInterval, TimerSource, TriggerCallback};
use crate::types::StoredPayload;

pub const DEFAULT_HOOK_PREFIX: &str = "adjutant_";

#[derive(Error, Debug)]
pub enum ScheduleError {
    #[error("No job type registered under '{0}'")]
    UnknownJobType(String),

    #[error("Invalid interval: {0}")]
    InvalidInterval(String),

    #[error("Invalid cron expression '{expr}': {reason}")]
    InvalidCron { expr: String, reason: String },

    #[error("Could not build job '{type_tag}': {reason}")]
    InvalidArguments { type_tag: String, reason: String },

    #[error("Timer source error: {0:#}")]
    Timer(#[from] anyhow::Error),
}

/// When a scheduled job fires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Interval {
    /// A recurrence the timer source knows by name, e.g. `hourly`.
    Named(String),
    /// Once, at the given instant.
    Once(DateTime<Utc>),
    /// A cron expression, armed one occurrence at a time.
    Cron(String),
}

type Decode = fn(Value) -> Result<Box<dyn Payload>, serde_json::Error>;
type Predicate = Arc<dyn Fn() -> bool + Send + Sync>;

fn decode_task<T: Task>(data: Value) -> Result<Box<dyn Payload>, serde_json::Error> {
    let task: T = serde_json::from_value(data)?;
    Ok(Box::new(task))
}

/// Everything needed to build a fresh job each time a trigger fires.
#[derive(Clone)]
struct JobTemplate {
    type_tag: String,
    args: Result<Value, String>,
    decode: Option<Decode>,
    options: JobOptions,
}

impl JobTemplate {
    fn build(&self, registry: &PayloadRegistry, args: Option<Value>) -> Result<Job, ScheduleError> {
        let invalid = |reason: String| ScheduleError::InvalidArguments {
            type_tag: self.type_tag.clone(),
            reason,
        };
        let data = match args {
            Some(args) => args,
            None => self.args.clone().map_err(invalid)?,
        };

        let payload = match self.decode {
            Some(decode) => decode(data).map_err(|e| invalid(e.to_string()))?,
            None => {
                if !registry.contains(&self.type_tag) {
                    return Err(ScheduleError::UnknownJobType(self.type_tag.clone()));
                }
                let stored = StoredPayload {
                    type_tag: self.type_tag.clone(),
                    data,
                };
                registry
                    .decode(JobId::new(), stored)
                    .map_err(|e| invalid(e.to_string()))?
            }
        };
        Ok(Job::with_options(payload, self.options.clone()))
    }
}

/// Schedule of one job type. Built through [`Scheduler::job`].
pub struct ScheduleSpec {
    template: JobTemplate,
    interval: Option<Interval>,
    custom_interval: Option<CustomInterval>,
    queue: Option<String>,
    timeout_secs: Option<u64>,
    max_attempts: Option<u32>,
    filters: Vec<Predicate>,
}

impl ScheduleSpec {
    fn new(template: JobTemplate) -> Self {
        Self {
            template,
            interval: None,
            custom_interval: None,
            queue: None,
            timeout_secs: None,
            max_attempts: None,
            filters: Vec::new(),
        }
    }

    pub fn type_tag(&self) -> &str {
        &self.template.type_tag
    }

    pub fn schedule(&self) -> Option<&Interval> {
        self.interval.as_ref()
    }

    fn named(&mut self, name: &str) -> &mut Self {
        self.interval = Some(Interval::Named(name.to_string()));
        self.custom_interval = None;
        self
    }

    pub fn every_minute(&mut self) -> &mut Self {
        self.every_minutes(1)
    }

    /// Recur every `minutes`, registering a matching custom interval.
    pub fn every_minutes(&mut self, minutes: u32) -> &mut Self {
        let name = format!("every_{minutes}_minutes");
        self.interval = Some(Interval::Named(name.clone()));
        self.custom_interval = Some(CustomInterval {
            name,
            period_secs: u64::from(minutes) * 60,
            display_label: if minutes == 1 {
                "Every minute".to_string()
            } else {
                format!("Every {minutes} minutes")
            },
        });
        self
    }

    pub fn hourly(&mut self) -> &mut Self {
        self.named("hourly")
    }

    pub fn twice_daily(&mut self) -> &mut Self {
        self.named("twicedaily")
    }

    pub fn daily(&mut self) -> &mut Self {
        self.named("daily")
    }

    pub fn weekly(&mut self) -> &mut Self {
        self.named("weekly")
    }

    /// Recur on any interval the timer source knows by `name`.
    pub fn interval(&mut self, name: impl Into<String>) -> &mut Self {
        let name = name.into();
        self.named(&name)
    }

    /// Fire once at `at`.
    pub fn at(&mut self, at: DateTime<Utc>) -> &mut Self {
        self.interval = Some(Interval::Once(at));
        self.custom_interval = None;
        self
    }

    /// Fire on a cron schedule. Five-field expressions are accepted and run at second zero.
    pub fn cron(&mut self, expr: impl Into<String>) -> &mut Self {
        self.interval = Some(Interval::Cron(expr.into()));
        self.custom_interval = None;
        self
    }

    /// Only keep the trigger while `predicate` holds.
    pub fn when(&mut self, predicate: impl Fn() -> bool + Send + Sync + 'static) -> &mut Self {
        self.filters.push(Arc::new(predicate));
        self
    }

    /// Tear the trigger down while `predicate` holds.
    pub fn skip(&mut self, predicate: impl Fn() -> bool + Send + Sync + 'static) -> &mut Self {
        self.filters.push(Arc::new(move || !predicate()));
        self
    }

    pub fn on_queue(&mut self, queue: impl Into<String>) -> &mut Self {
        self.queue = Some(queue.into());
        self
    }

    pub fn timeout(&mut self, secs: u64) -> &mut Self {
        self.timeout_secs = Some(secs);
        self
    }

    pub fn retries(&mut self, max_attempts: u32) -> &mut Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    fn is_enabled(&self) -> bool {
        self.filters.iter().all(|filter| filter())
    }

    fn effective_template(&self) -> JobTemplate {
        let mut template = self.template.clone();
        if let Some(queue) = &self.queue {
            template.options.queue = queue.clone();
        }
        if let Some(timeout) = self.timeout_secs {
            template.options.timeout_secs = timeout;
        }
        if let Some(max_attempts) = self.max_attempts {
            template.options.max_attempts = max_attempts.max(1);
        }
        template
    }
}

impl std::fmt::Debug for ScheduleSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScheduleSpec")
            .field("type_tag", &self.template.type_tag)
            .field("interval", &self.interval)
            .field("queue", &self.queue)
            .field("timeout_secs", &self.timeout_secs)
            .field("max_attempts", &self.max_attempts)
            .field("filters", &self.filters.len())
            .finish()
    }
}

/// What one [`Scheduler::register`] pass did, by hook name.
#[derive(Debug, Default)]
pub struct Reconciliation {
    pub scheduled: Vec<String>,
    pub unchanged: Vec<String>,
    pub removed: Vec<String>,
    /// Specs that could not be registered, by job type tag.
    pub errors: Vec<(String, ScheduleError)>,
}

impl Reconciliation {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

enum Outcome {
    Scheduled,
    Unchanged,
    Removed,
}

/// How a valid interval is armed on the timer source.
enum Plan {
    Recurring(String),
    Once(DateTime<Utc>),
    Cron(cron::Schedule),
}

/// Turn `PascalCase` (or `path::To::Type`) into `snake_case`, prefixed.
pub fn hook_name(prefix: &str, type_tag: &str) -> String {
    format!("{prefix}{}", type_tag.to_snake_case())
}

fn parse_cron(expr: &str) -> Result<cron::Schedule, ScheduleError> {
    let normalized = if expr.split_whitespace().count() == 5 {
        format!("0 {expr}")
    } else {
        expr.to_string()
    };
    cron::Schedule::from_str(&normalized).map_err(|e| ScheduleError::InvalidCron {
        expr: expr.to_string(),
        reason: e.to_string(),
    })
}

fn is_occurrence(schedule: &cron::Schedule, at: DateTime<Utc>) -> bool {
    let just_before = at - chrono::Duration::seconds(1);
    schedule.after(&just_before).next() == Some(at)
}

pub struct Scheduler {
    timer: Arc<dyn TimerSource>,
    dispatcher: Dispatcher,
    registry: Arc<PayloadRegistry>,
    clock: SharedClock,
    hook_prefix: String,
    specs: Vec<ScheduleSpec>,
    custom_intervals: Vec<CustomInterval>,
}

impl Scheduler {
    pub fn new(
        timer: Arc<dyn TimerSource>,
        dispatcher: Dispatcher,
        registry: Arc<PayloadRegistry>,
    ) -> Self {
        Self {
            timer,
            dispatcher,
            registry,
            clock: clock::system(),
            hook_prefix: DEFAULT_HOOK_PREFIX.to_string(),
            specs: Vec::new(),
            custom_intervals: Vec::new(),
        }
    }

    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_hook_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.hook_prefix = prefix.into();
        self
    }

    /// Schedule `task`. Each trigger dispatches a copy of it. Calling this
    /// again for the same type replaces the task but keeps the schedule.
    pub fn job<T: Task>(&mut self, task: T) -> &mut ScheduleSpec {
        let template = JobTemplate {
            type_tag: T::TYPE_TAG.to_string(),
            args: serde_json::to_value(&task).map_err(|e| e.to_string()),
            decode: Some(decode_task::<T> as Decode),
            options: T::default_options(),
        };
        self.upsert(template)
    }

    /// Schedule a job by type tag, built through the [`PayloadRegistry`] from
    /// `args`. The tag is checked when [`register`](Self::register) runs.
    pub fn job_by_tag(&mut self, type_tag: impl Into<String>, args: Value) -> &mut ScheduleSpec {
        let template = JobTemplate {
            type_tag: type_tag.into(),
            args: Ok(args),
            decode: None,
            options: JobOptions::default(),
        };
        self.upsert(template)
    }

    fn upsert(&mut self, template: JobTemplate) -> &mut ScheduleSpec {
        let index = match self
            .specs
            .iter()
            .position(|spec| spec.template.type_tag == template.type_tag)
        {
            Some(index) => {
                self.specs[index].template = template;
                index
            }
            None => {
                self.specs.push(ScheduleSpec::new(template));
                self.specs.len() - 1
            }
        };
        &mut self.specs[index]
    }

    /// Make an extra named interval available to [`ScheduleSpec::interval`].
    pub fn custom_interval(
        &mut self,
        name: impl Into<String>,
        period_secs: u64,
        display_label: impl Into<String>,
    ) -> &mut Self {
        self.custom_intervals.push(CustomInterval {
            name: name.into(),
            period_secs,
            display_label: display_label.into(),
        });
        self
    }

    pub fn specs(&self) -> &[ScheduleSpec] {
        &self.specs
    }

    pub fn hook_name(&self, type_tag: &str) -> String {
        hook_name(&self.hook_prefix, type_tag)
    }

    /// Bring the timer source in line with the declared specs. Errors are
    /// collected per spec; one bad spec never stops the others.
    pub async fn register(&self) -> Reconciliation {
        let mut summary = Reconciliation::default();

        for interval in &self.custom_intervals {
            if let Err(error) = self.register_interval(interval).await {
                error!(interval = %interval.name, error = %error, "Failed to register custom interval");
                summary.errors.push((interval.name.clone(), error));
            }
        }

        for spec in &self.specs {
            let hook = self.hook_name(spec.type_tag());
            match self.reconcile(spec, &hook).await {
                Ok(Some(Outcome::Scheduled)) => summary.scheduled.push(hook),
                Ok(Some(Outcome::Unchanged)) => summary.unchanged.push(hook),
                Ok(Some(Outcome::Removed)) => summary.removed.push(hook),
                Ok(None) => {}
                Err(error) => {
                    error!(job_type = spec.type_tag(), hook = %hook, error = %error, "Failed to register scheduled job");
                    summary.errors.push((spec.type_tag().to_string(), error));
                }
            }
        }

        info!(
            scheduled = summary.scheduled.len(),
            unchanged = summary.unchanged.len(),
            removed = summary.removed.len(),
            errors = summary.errors.len(),
            "Scheduler reconciled"
        );
        summary
    }

    async fn register_interval(&self, interval: &CustomInterval) -> Result<(), ScheduleError> {
        if interval.period_secs == 0 {
            return Err(ScheduleError::InvalidInterval(format!(
                "'{}' has a zero period",
                interval.name
            )));
        }
        self.timer
            .register_recurring_trigger(
                &interval.name,
                interval.period_secs,
                &interval.display_label,
            )
            .await?;
        Ok(())
    }

    fn plan(&self, interval: &Interval) -> Result<Plan, ScheduleError> {
        match interval {
            Interval::Named(name) if name.trim().is_empty() => Err(
                ScheduleError::InvalidInterval("interval name is empty".to_string()),
            ),
            Interval::Named(name) => Ok(Plan::Recurring(name.clone())),
            Interval::Once(at) => Ok(Plan::Once(*at)),
            Interval::Cron(expr) => parse_cron(expr).map(Plan::Cron),
        }
    }

    async fn reconcile(
        &self,
        spec: &ScheduleSpec,
        hook: &str,
    ) -> Result<Option<Outcome>, ScheduleError> {
        let Some(interval) = &spec.interval else {
            return Ok(None);
        };

        if !spec.is_enabled() {
            if self.timer.next_fire_time(hook).await?.is_some() {
                self.timer.unschedule(hook).await?;
                debug!(hook, "Predicate is false, trigger removed");
                return Ok(Some(Outcome::Removed));
            }
            return Ok(Some(Outcome::Unchanged));
        }

        let plan = self.plan(interval)?;
        let template = spec.effective_template();
        template.build(&self.registry, None)?;
        if let Some(custom) = &spec.custom_interval {
            self.register_interval(custom).await?;
        }

        let cron = match &plan {
            Plan::Cron(schedule) => Some(schedule.clone()),
            _ => None,
        };
        self.timer
            .on_fire(hook, self.callback(hook, template, cron))
            .await?;

        let now = self.clock.now();
        let existing = self.timer.next_fire_time(hook).await?;
        let recurrence = self.timer.recurrence(hook).await?;

        let outcome = match plan {
            Plan::Once(at) => {
                if recurrence.is_none() && existing == Some(at) {
                    Outcome::Unchanged
                } else if existing.is_none() && at <= now {
                    debug!(hook, %at, "One-shot time has passed, treating as fired");
                    Outcome::Unchanged
                } else {
                    if existing.is_some() {
                        self.timer.unschedule(hook).await?;
                    }
                    self.timer.schedule_once(hook, at).await?;
                    Outcome::Scheduled
                }
            }
            Plan::Cron(schedule) => {
                let armed = recurrence.is_none()
                    && existing.is_some_and(|at| is_occurrence(&schedule, at));
                if armed {
                    Outcome::Unchanged
                } else {
                    let next = schedule.after(&now).next().ok_or_else(|| {
                        ScheduleError::InvalidCron {
                            expr: schedule.to_string(),
                            reason: "never fires again".to_string(),
                        }
                    })?;
                    if existing.is_some() {
                        self.timer.unschedule(hook).await?;
                    }
                    self.timer.schedule_once(hook, next).await?;
                    Outcome::Scheduled
                }
            }
            Plan::Recurring(name) => {
                if recurrence.as_deref() == Some(name.as_str()) {
                    Outcome::Unchanged
                } else {
                    if existing.is_some() {
                        self.timer.unschedule(hook).await?;
                    }
                    self.timer.schedule_recurring(hook, &name, now).await?;
                    Outcome::Scheduled
                }
            }
        };
        Ok(Some(outcome))
    }

    /// Dispatch a fresh job when the trigger fires, then re-arm cron schedules.
    fn callback(
        &self,
        hook: &str,
        template: JobTemplate,
        cron: Option<cron::Schedule>,
    ) -> TriggerCallback {
        let hook = hook.to_string();
        let dispatcher = self.dispatcher.clone();
        let registry = self.registry.clone();
        let timer = Arc::downgrade(&self.timer);
        let clock = self.clock.clone();

        Arc::new(move |args: Value| {
            let hook = hook.clone();
            let dispatcher = dispatcher.clone();
            let registry = registry.clone();
            let timer = timer.clone();
            let clock = clock.clone();
            let template = template.clone();
            let cron = cron.clone();

            async move {
                let args = (!args.is_null()).then_some(args);
                match template.build(&registry, args).map(|job| job.stamped(&*clock)) {
                    Ok(job) => match dispatcher.push(&job).await {
                        Ok(id) => info!(hook = %hook, job_id = %id, queue = job.queue(), "Scheduled job dispatched"),
                        Err(error) => error!(hook = %hook, error = %error, "Failed to dispatch scheduled job"),
                    },
                    Err(error) => error!(hook = %hook, error = %error, "Failed to build scheduled job"),
                }

                let Some(schedule) = cron else {
                    return;
                };
                let Some(timer) = timer.upgrade() else {
                    warn!(hook = %hook, "Timer source is gone, cron job not re-armed");
                    return;
                };
                let next = schedule.after(&clock.now()).next();
                if let Some(next) = next {
                    if let Err(error) = timer.schedule_once(&hook, next).await {
                        error!(hook = %hook, error = %error, "Failed to re-arm cron job");
                    }
                }
            }
            .boxed()
        })
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("hook_prefix", &self.hook_prefix)
            .field("specs", &self.specs)
            .field("custom_intervals", &self.custom_intervals)
            .finish_non_exhaustive()
    }
}
