//! Named recurring jobs
//!
//! Every job owns at most one live timer task. Re-arming a job aborts the
//! previous timer under the job's lock before the new one is spawned, so a
//! restart can never leave two timers firing the same body. Each fire runs
//! the body as its own detached task; failures and panics are logged and do
//! not affect later fires.

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Timelike, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use rand::Rng;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::{DailySchedule, IntervalSchedule};
use crate::error::{HubError, HubResult};

const DAY: Duration = Duration::from_secs(24 * 60 * 60);

pub type JobAction = Arc<dyn Fn() -> BoxFuture<'static, HubResult<()>> + Send + Sync>;

/// Wrap an async closure as a [`JobAction`].
pub fn job_action<F, Fut>(f: F) -> JobAction
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HubResult<()>> + Send + 'static,
{
    Arc::new(move || -> BoxFuture<'static, HubResult<()>> { Box::pin(f()) })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerPolicy {
    /// Once a day at hh:mm UTC
    DailyAtUtc { hour: u32, minute: u32 },
    Interval { start_delay: Duration, period: Duration },
}

impl TriggerPolicy {
    pub fn daily(hour: u32, minute: u32) -> HubResult<Self> {
        if hour > 23 || minute > 59 {
            return Err(HubError::Scheduler(format!(
                "invalid daily time {:02}:{:02}",
                hour, minute
            )));
        }
        Ok(TriggerPolicy::DailyAtUtc { hour, minute })
    }

    pub fn interval(start_delay: Duration, period: Duration) -> HubResult<Self> {
        if period.is_zero() {
            return Err(HubError::Scheduler(
                "interval period must be positive".to_string(),
            ));
        }
        Ok(TriggerPolicy::Interval {
            start_delay,
            period,
        })
    }

    fn initial_delay(&self, now: DateTime<Utc>, jitter: Duration) -> Duration {
        match *self {
            TriggerPolicy::DailyAtUtc { hour, minute } => delay_until_next_utc(hour, minute, now),
            TriggerPolicy::Interval { start_delay, .. } => {
                let extra = match jitter_millis(jitter) {
                    0 => 0,
                    max => rand::thread_rng().gen_range(0..max),
                };
                start_delay + Duration::from_millis(extra)
            }
        }
    }

    fn period(&self) -> Duration {
        match *self {
            TriggerPolicy::DailyAtUtc { .. } => DAY,
            TriggerPolicy::Interval { period, .. } => period,
        }
    }
}

impl TryFrom<DailySchedule> for TriggerPolicy {
    type Error = HubError;

    fn try_from(value: DailySchedule) -> HubResult<Self> {
        TriggerPolicy::daily(value.hour, value.minute)
    }
}

impl TryFrom<IntervalSchedule> for TriggerPolicy {
    type Error = HubError;

    fn try_from(value: IntervalSchedule) -> HubResult<Self> {
        TriggerPolicy::interval(
            Duration::from_millis(value.start_delay_ms),
            Duration::from_millis(value.period_ms),
        )
    }
}

/// Jitter bound in whole milliseconds, saturating at `u64::MAX`.
fn jitter_millis(jitter: Duration) -> u64 {
    u64::try_from(jitter.as_millis()).unwrap_or(u64::MAX)
}

/// Delay from `now` to the next hh:mm UTC: today if `now` is not past it,
/// otherwise tomorrow. Always in `[0, 24h)`.
pub fn delay_until_next_utc(hour: u32, minute: u32, now: DateTime<Utc>) -> Duration {
    let target = now
        .with_hour(hour)
        .and_then(|t| t.with_minute(minute))
        .and_then(|t| t.with_second(0))
        .and_then(|t| t.with_nanosecond(0));
    let Some(target) = target else {
        return DAY;
    };
    let delta = if now <= target {
        target - now
    } else {
        target + chrono::Duration::days(1) - now
    };
    delta.to_std().unwrap_or(Duration::ZERO)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Unarmed,
    Armed,
    Disarming,
}

enum JobState {
    Unarmed,
    Armed(JoinHandle<()>),
    Disarming,
}

impl JobState {
    fn status(&self) -> JobStatus {
        match self {
            JobState::Unarmed => JobStatus::Unarmed,
            JobState::Armed(_) => JobStatus::Armed,
            JobState::Disarming => JobStatus::Disarming,
        }
    }

    /// Abort the live timer, if any, leaving the slot unarmed.
    fn disarm(&mut self, name: &str) {
        if let JobState::Armed(handle) = std::mem::replace(self, JobState::Disarming) {
            debug!("[Scheduler] Cancelling pending fires of '{}'", name);
            handle.abort();
        }
        *self = JobState::Unarmed;
    }
}

#[derive(Default)]
pub struct Scheduler {
    jobs: Mutex<HashMap<String, Arc<Mutex<JobState>>>>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, name: &str) -> HubResult<Arc<Mutex<JobState>>> {
        let mut jobs = self
            .jobs
            .lock()
            .map_err(|_| HubError::Scheduler("job table lock poisoned".to_string()))?;
        Ok(jobs
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(JobState::Unarmed)))
            .clone())
    }

    /// Install (or replace) the timer of `name`. Must run inside a tokio runtime.
    pub fn arm(
        &self,
        name: &str,
        policy: TriggerPolicy,
        jitter: Duration,
        action: JobAction,
    ) -> HubResult<()> {
        let slot = self.slot(name)?;
        let mut state = slot
            .lock()
            .map_err(|_| HubError::Scheduler(format!("job '{}' lock poisoned", name)))?;
        state.disarm(name);

        let delay = policy.initial_delay(Utc::now(), jitter);
        let period = policy.period();
        info!(
            "[Scheduler] Arming '{}' ({:?}): first fire in {:?}, then every {:?}",
            name, policy, delay, period
        );
        let handle = tokio::spawn(run_timer(name.to_string(), delay, period, action));
        *state = JobState::Armed(handle);
        Ok(())
    }

    /// Cancel future fires of `name`; a body already running is left alone.
    pub fn disarm(&self, name: &str) -> HubResult<()> {
        let slot = self.slot(name)?;
        let mut state = slot
            .lock()
            .map_err(|_| HubError::Scheduler(format!("job '{}' lock poisoned", name)))?;
        state.disarm(name);
        info!("[Scheduler] Disarmed '{}'", name);
        Ok(())
    }

    pub fn shutdown(&self) {
        for name in self.job_names() {
            if let Err(e) = self.disarm(&name) {
                warn!("[Scheduler] Failed to disarm '{}': {}", name, e);
            }
        }
        info!("[Scheduler] All jobs disarmed");
    }

    pub fn status(&self, name: &str) -> Option<JobStatus> {
        let jobs = self.jobs.lock().ok()?;
        let slot = jobs.get(name)?;
        let state = slot.lock().ok()?;
        Some(state.status())
    }

    /// Number of timer tasks currently alive across all jobs.
    pub fn live_timers(&self) -> usize {
        let Ok(jobs) = self.jobs.lock() else {
            return 0;
        };
        jobs.values()
            .filter(|slot| {
                slot.lock()
                    .map(|state| matches!(&*state, JobState::Armed(h) if !h.is_finished()))
                    .unwrap_or(false)
            })
            .count()
    }

    pub fn job_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .jobs
            .lock()
            .map(|jobs| jobs.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        if let Ok(jobs) = self.jobs.get_mut() {
            for (name, slot) in jobs.iter() {
                if let Ok(mut state) = slot.lock() {
                    state.disarm(name);
                }
            }
        }
    }
}

async fn run_timer(name: String, delay: Duration, period: Duration, action: JobAction) {
    let mut ticker = interval_at(Instant::now() + delay, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        debug!("[Scheduler] Firing '{}'", name);
        let body = match std::panic::catch_unwind(AssertUnwindSafe(|| action())) {
            Ok(body) => body,
            Err(_) => {
                error!("[Scheduler] Job '{}' panicked while starting", name);
                continue;
            }
        };
        let job = name.clone();
        tokio::spawn(async move {
            match AssertUnwindSafe(body).catch_unwind().await {
                Ok(Ok(())) => debug!("[Scheduler] Job '{}' finished", job),
                Ok(Err(e)) => error!("[Scheduler] Job '{}' failed: {}", job, e),
                Err(_) => error!("[Scheduler] Job '{}' panicked", job),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_action(counter: Arc<AtomicUsize>) -> JobAction {
        job_action(move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
    }

    fn every(ms: u64) -> TriggerPolicy {
        TriggerPolicy::interval(Duration::ZERO, Duration::from_millis(ms)).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn rearming_keeps_a_single_timer() {
        let scheduler = Scheduler::new();
        let fires = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            scheduler
                .arm("poll", every(100), Duration::ZERO, counting_action(fires.clone()))
                .unwrap();
        }
        assert_eq!(scheduler.live_timers(), 1);

        tokio::time::sleep(Duration::from_millis(350)).await;
        // fires at 0, 100, 200 and 300 ms
        assert_eq!(fires.load(Ordering::SeqCst), 4);
        assert_eq!(scheduler.status("poll"), Some(JobStatus::Armed));
    }

    #[tokio::test(start_paused = true)]
    async fn disarm_stops_future_fires() {
        let scheduler = Scheduler::new();
        let fires = Arc::new(AtomicUsize::new(0));
        scheduler
            .arm("evict", every(100), Duration::ZERO, counting_action(fires.clone()))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        scheduler.disarm("evict").unwrap();
        let seen = fires.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(500)).await;

        assert_eq!(seen, 2);
        assert_eq!(fires.load(Ordering::SeqCst), 2);
        assert_eq!(scheduler.status("evict"), Some(JobStatus::Unarmed));
        assert_eq!(scheduler.live_timers(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn failing_body_does_not_stop_the_timer() {
        let scheduler = Scheduler::new();
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();
        let action = job_action(move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(HubError::Upstream("feed offline".to_string()))
            }
        });
        scheduler
            .arm("flaky", every(50), Duration::ZERO, action)
            .unwrap();
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_body_does_not_stop_the_timer() {
        let scheduler = Scheduler::new();
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();
        let action = job_action(move || {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    panic!("first fire blows up");
                }
                Ok(())
            }
        });
        scheduler
            .arm("panicky", every(50), Duration::ZERO, action)
            .unwrap();
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert_eq!(scheduler.live_timers(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn action_panicking_before_its_future_is_skipped() {
        let scheduler = Scheduler::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let action: JobAction = Arc::new(move || -> BoxFuture<'static, HubResult<()>> {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                panic!("cannot build the job body");
            }
            Box::pin(async { Ok(()) })
        });
        scheduler
            .arm("fragile", every(50), Duration::ZERO, action)
            .unwrap();
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(scheduler.status("fragile"), Some(JobStatus::Armed));
    }

    #[tokio::test(start_paused = true)]
    async fn start_delay_and_jitter_defer_the_first_fire() {
        let scheduler = Scheduler::new();
        let fires = Arc::new(AtomicUsize::new(0));
        let policy =
            TriggerPolicy::interval(Duration::from_millis(200), Duration::from_secs(60)).unwrap();
        scheduler
            .arm("jittered", policy, Duration::from_millis(100), counting_action(fires.clone()))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(190)).await;
        assert_eq!(fires.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(fires.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn shutdown_disarms_everything() {
        let scheduler = Scheduler::new();
        let fires = Arc::new(AtomicUsize::new(0));
        for name in ["a", "b"] {
            scheduler
                .arm(name, every(1000), Duration::ZERO, counting_action(fires.clone()))
                .unwrap();
        }
        assert_eq!(scheduler.job_names(), vec!["a".to_string(), "b".to_string()]);
        scheduler.shutdown();
        assert_eq!(scheduler.live_timers(), 0);
        assert_eq!(scheduler.status("a"), Some(JobStatus::Unarmed));
    }

    #[test]
    fn oversized_jitter_saturates_instead_of_wrapping() {
        assert_eq!(jitter_millis(Duration::from_millis(250)), 250);
        assert_eq!(jitter_millis(Duration::MAX), u64::MAX);

        let policy =
            TriggerPolicy::interval(Duration::from_secs(5), Duration::from_secs(60)).unwrap();
        let delay = policy.initial_delay(Utc::now(), Duration::MAX);
        assert!(delay >= Duration::from_secs(5));
    }

    #[test]
    fn policies_validate_their_inputs() {
        assert!(TriggerPolicy::daily(24, 0).is_err());
        assert!(TriggerPolicy::daily(23, 60).is_err());
        assert!(TriggerPolicy::interval(Duration::ZERO, Duration::ZERO).is_err());
        assert_eq!(
            TriggerPolicy::try_from(DailySchedule { hour: 1, minute: 30 }).unwrap(),
            TriggerPolicy::DailyAtUtc { hour: 1, minute: 30 }
        );
    }

    #[test]
    fn daily_delay_is_zero_only_at_the_exact_target() {
        let now = Utc.with_ymd_and_hms(2024, 3, 10, 10, 0, 0).unwrap();
        assert_eq!(delay_until_next_utc(10, 0, now), Duration::ZERO);
        assert_eq!(delay_until_next_utc(10, 1, now), Duration::from_secs(60));
        assert_eq!(
            delay_until_next_utc(9, 59, now),
            Duration::from_secs(23 * 3600 + 59 * 60)
        );

        let just_after = now + chrono::Duration::milliseconds(1);
        let delay = delay_until_next_utc(10, 0, just_after);
        assert!(delay > Duration::ZERO && delay < DAY);
    }

    #[test]
    fn daily_delay_stays_within_a_day_for_every_minute() {
        let now = Utc.with_ymd_and_hms(2024, 12, 31, 23, 59, 30).unwrap();
        for hour in 0..24 {
            for minute in 0..60 {
                let delay = delay_until_next_utc(hour, minute, now);
                assert!(delay < DAY, "{:02}:{:02} gave {:?}", hour, minute, delay);
                assert!(delay > Duration::ZERO);
            }
        }
    }
}
