//! The timer source the scheduler registers triggers with.
//!
//! A timer source owns "what is currently scheduled" and calls back into the
//! application when a trigger is due. [`MemoryTimer`] is an in-process
//! implementation; production deployments may plug in anything that honours
//! [`TimerSource`].

use anyhow::{anyhow, bail};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use futures::future::BoxFuture;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, error, info, warn};

use crate::clock::{self, SharedClock};

/// Execution callback invoked with the trigger's arguments each time it fires.
pub type TriggerCallback = Arc<dyn Fn(Value) -> BoxFuture<'static, ()> + Send + Sync>;

#[async_trait]
pub trait TimerSource: Send + Sync {
    /// Make a named interval legal for [`schedule_recurring`](Self::schedule_recurring).
    async fn register_recurring_trigger(
        &self,
        name: &str,
        interval_secs: u64,
        display_label: &str,
    ) -> anyhow::Result<()>;

    /// Fire `hook` every `interval`, first at `start`. Replaces any existing trigger.
    async fn schedule_recurring(
        &self,
        hook: &str,
        interval: &str,
        start: DateTime<Utc>,
    ) -> anyhow::Result<()>;

    /// Fire `hook` once at `at`. Replaces any existing trigger.
    async fn schedule_once(&self, hook: &str, at: DateTime<Utc>) -> anyhow::Result<()>;

    async fn unschedule(&self, hook: &str) -> anyhow::Result<()>;

    async fn next_fire_time(&self, hook: &str) -> anyhow::Result<Option<DateTime<Utc>>>;

    /// Interval name `hook` recurs on, `None` for one-shots and unknown hooks.
    async fn recurrence(&self, hook: &str) -> anyhow::Result<Option<String>>;

    /// Run the callback for `hook` right away, outside of its schedule.
    async fn fire_immediately(&self, hook: &str, args: Value) -> anyhow::Result<()>;

    /// Set the callback `hook` runs when it fires, replacing any previous one.
    async fn on_fire(&self, hook: &str, callback: TriggerCallback) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CustomInterval {
    pub name: String,
    pub period_secs: u64,
    pub display_label: String,
}

/// A trigger as currently held by a [`MemoryTimer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Trigger {
    pub hook: String,
    pub next_fire: DateTime<Utc>,
    pub interval: Option<String>,
}

#[derive(Default)]
struct TimerState {
    intervals: HashMap<String, CustomInterval>,
    triggers: BTreeMap<String, Trigger>,
    callbacks: HashMap<String, TriggerCallback>,
}

/// In-process [`TimerSource`]. Knows `hourly`, `twicedaily`, `daily` and
/// `weekly` out of the box; nothing survives a restart.
#[derive(Clone)]
pub struct MemoryTimer {
    state: Arc<Mutex<TimerState>>,
    clock: SharedClock,
}

impl Default for MemoryTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTimer {
    pub fn new() -> Self {
        let mut state = TimerState::default();
        for (name, period_secs, label) in [
            ("hourly", 3_600, "Once Hourly"),
            ("twicedaily", 43_200, "Twice Daily"),
            ("daily", 86_400, "Once Daily"),
            ("weekly", 604_800, "Once Weekly"),
        ] {
            state.intervals.insert(
                name.to_string(),
                CustomInterval {
                    name: name.to_string(),
                    period_secs,
                    display_label: label.to_string(),
                },
            );
        }
        Self {
            state: Arc::new(Mutex::new(state)),
            clock: clock::system(),
        }
    }

    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    fn state(&self) -> anyhow::Result<MutexGuard<'_, TimerState>> {
        self.state.lock().map_err(|_| anyhow!("timer state mutex poisoned"))
    }

    /// Every trigger, ordered by hook name.
    pub fn triggers(&self) -> anyhow::Result<Vec<Trigger>> {
        Ok(self.state()?.triggers.values().cloned().collect())
    }

    pub fn interval(&self, name: &str) -> anyhow::Result<Option<CustomInterval>> {
        Ok(self.state()?.intervals.get(name).cloned())
    }

    /// Fire every trigger due at `now`, once each. Recurring triggers move on
    /// to the first multiple of their period after `now`, so runs missed while
    /// nothing was polling are skipped; one-shots are removed. Returns how
    /// many fired.
    pub async fn run_due(&self, now: DateTime<Utc>) -> anyhow::Result<usize> {
        let due: Vec<(String, Option<TriggerCallback>)> = {
            let mut state = self.state()?;
            let TimerState {
                intervals,
                triggers,
                callbacks,
            } = &mut *state;

            let hooks: Vec<String> = triggers
                .values()
                .filter(|t| t.next_fire <= now)
                .map(|t| t.hook.clone())
                .collect();

            for hook in &hooks {
                let rearm = triggers.get(hook).and_then(|trigger| {
                    let interval = trigger.interval.as_ref()?;
                    let period = intervals.get(interval)?.period_secs;
                    Some(next_after(trigger.next_fire, period, now))
                });
                match rearm {
                    Some(next_fire) => {
                        if let Some(trigger) = triggers.get_mut(hook) {
                            trigger.next_fire = next_fire;
                        }
                    }
                    None => {
                        triggers.remove(hook);
                    }
                }
            }

            hooks
                .into_iter()
                .map(|hook| {
                    let callback = callbacks.get(&hook).cloned();
                    (hook, callback)
                })
                .collect()
        };

        let fired = due.len();
        for (hook, callback) in due {
            match callback {
                Some(callback) => {
                    debug!(hook = %hook, "Firing trigger");
                    callback(Value::Null).await;
                }
                None => warn!(hook = %hook, "Trigger fired with no callback registered"),
            }
        }
        Ok(fired)
    }

    /// Call [`run_due`](Self::run_due) every `poll` until `shutdown` completes.
    pub async fn run_with_shutdown<F>(&self, poll: std::time::Duration, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        info!(poll_interval = ?poll, "Timer starting");
        let mut interval = tokio::time::interval(poll);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.run_due(self.clock.now()).await {
                        error!(error = %e, "Error firing due triggers");
                    }
                }
                _ = &mut shutdown => {
                    info!("Shutdown signal received, stopping timer");
                    break;
                }
            }
        }
    }
}

/// First `last + k * period` (k >= 1) strictly after `now`.
fn next_after(last: DateTime<Utc>, period_secs: u64, now: DateTime<Utc>) -> DateTime<Utc> {
    let period = period_secs.max(1) as i64;
    let behind = (now - last).num_seconds().max(0);
    last + Duration::seconds((behind / period + 1) * period)
}

#[async_trait]
impl TimerSource for MemoryTimer {
    async fn register_recurring_trigger(
        &self,
        name: &str,
        interval_secs: u64,
        display_label: &str,
    ) -> anyhow::Result<()> {
        if interval_secs == 0 {
            bail!("interval '{name}' must be at least one second");
        }
        self.state()?.intervals.insert(
            name.to_string(),
            CustomInterval {
                name: name.to_string(),
                period_secs: interval_secs,
                display_label: display_label.to_string(),
            },
        );
        Ok(())
    }

    async fn schedule_recurring(
        &self,
        hook: &str,
        interval: &str,
        start: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        let mut state = self.state()?;
        if !state.intervals.contains_key(interval) {
            bail!("unknown interval '{interval}'");
        }
        state.triggers.insert(
            hook.to_string(),
            Trigger {
                hook: hook.to_string(),
                next_fire: start,
                interval: Some(interval.to_string()),
            },
        );
        Ok(())
    }

    async fn schedule_once(&self, hook: &str, at: DateTime<Utc>) -> anyhow::Result<()> {
        self.state()?.triggers.insert(
            hook.to_string(),
            Trigger {
                hook: hook.to_string(),
                next_fire: at,
                interval: None,
            },
        );
        Ok(())
    }

    async fn unschedule(&self, hook: &str) -> anyhow::Result<()> {
        self.state()?.triggers.remove(hook);
        Ok(())
    }

    async fn next_fire_time(&self, hook: &str) -> anyhow::Result<Option<DateTime<Utc>>> {
        Ok(self.state()?.triggers.get(hook).map(|t| t.next_fire))
    }

    async fn recurrence(&self, hook: &str) -> anyhow::Result<Option<String>> {
        Ok(self
            .state()?
            .triggers
            .get(hook)
            .and_then(|t| t.interval.clone()))
    }

    async fn fire_immediately(&self, hook: &str, args: Value) -> anyhow::Result<()> {
        let callback = self
            .state()?
            .callbacks
            .get(hook)
            .cloned()
            .ok_or_else(|| anyhow!("no callback registered for hook '{hook}'"))?;
        callback(args).await;
        Ok(())
    }

    async fn on_fire(&self, hook: &str, callback: TriggerCallback) -> anyhow::Result<()> {
        self.state()?.callbacks.insert(hook.to_string(), callback);
        Ok(())
    }
}

impl std::fmt::Debug for MemoryTimer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let triggers = self.triggers().unwrap_or_default();
        f.debug_struct("MemoryTimer")
            .field("triggers", &triggers)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use futures::FutureExt;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counter() -> (Arc<AtomicUsize>, TriggerCallback) {
        let count = Arc::new(AtomicUsize::new(0));
        let inner = count.clone();
        let callback: TriggerCallback = Arc::new(move |_| {
            let inner = inner.clone();
            async move {
                inner.fetch_add(1, Ordering::SeqCst);
            }
            .boxed()
        });
        (count, callback)
    }

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2030, 1, 1, hour, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn recurring_trigger_rearms_one_period_later() {
        let timer = MemoryTimer::new();
        let (count, callback) = counter();
        timer.on_fire("hook", callback).await.unwrap();
        timer.schedule_recurring("hook", "hourly", at(0)).await.unwrap();

        assert_eq!(timer.run_due(at(0)).await.unwrap(), 1);
        assert_eq!(timer.next_fire_time("hook").await.unwrap(), Some(at(1)));
        assert_eq!(timer.run_due(at(0)).await.unwrap(), 0);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn missed_runs_are_skipped_after_downtime() {
        let timer = MemoryTimer::new();
        let (count, callback) = counter();
        timer.on_fire("hook", callback).await.unwrap();
        timer.schedule_recurring("hook", "hourly", at(0)).await.unwrap();

        let late = at(5) + Duration::minutes(30);
        assert_eq!(timer.run_due(late).await.unwrap(), 1);
        assert_eq!(timer.next_fire_time("hook").await.unwrap(), Some(at(6)));
        assert_eq!(timer.run_due(late).await.unwrap(), 0);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn one_shot_fires_once() {
        let timer = MemoryTimer::new();
        let (count, callback) = counter();
        timer.on_fire("hook", callback).await.unwrap();
        timer.schedule_once("hook", at(2)).await.unwrap();

        assert_eq!(timer.run_due(at(1)).await.unwrap(), 0);
        assert_eq!(timer.run_due(at(3)).await.unwrap(), 1);
        assert_eq!(timer.next_fire_time("hook").await.unwrap(), None);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unknown_interval_is_rejected() {
        let timer = MemoryTimer::new();
        assert!(timer.schedule_recurring("hook", "fortnightly", at(0)).await.is_err());

        timer
            .register_recurring_trigger("fortnightly", 1_209_600, "Every two weeks")
            .await
            .unwrap();
        timer.schedule_recurring("hook", "fortnightly", at(0)).await.unwrap();
        assert_eq!(
            timer.recurrence("hook").await.unwrap().as_deref(),
            Some("fortnightly")
        );
    }

    #[tokio::test]
    async fn fire_immediately_needs_a_callback() {
        let timer = MemoryTimer::new();
        assert!(timer.fire_immediately("hook", Value::Null).await.is_err());

        let (count, callback) = counter();
        timer.on_fire("hook", callback).await.unwrap();
        timer.fire_immediately("hook", Value::Null).await.unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn run_with_shutdown_stops() {
        let timer = MemoryTimer::new();
        timer
            .run_with_shutdown(std::time::Duration::from_millis(10), async {
                tokio::time::sleep(std::time::Duration::from_millis(30)).await;
            })
            .await;
    }
}
