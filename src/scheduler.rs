//! # Alarm Scheduler
//!
//! Owns the alarm settings and the one timer that makes them happen.
//!
//! ## State Machine
//!
//! ```text
//!                 reschedule (active)
//!   Unscheduled ──────────────────────► Scheduled(trigger)
//!        ▲                                   │
//!        │   reschedule (inactive)           │ reschedule (active):
//!        └───────────────────────────────────┤ cancel old, install new
//!                                            ▼
//!                                    Scheduled(trigger')
//! ```
//!
//! The transition itself is pure: [`apply`] maps an [`AlarmConfig`] to the
//! [`CronTrigger`] that should be live, or `None`. [`AlarmScheduler`] holds the
//! config and the current [`TimerHandle`] behind a single mutex, and every
//! setter runs *mutate → cancel → install* inside that lock. Two callers racing
//! on the knob and the button therefore serialize, and there is never more
//! than one live timer.
//!
//! ## Timers
//!
//! Installing is delegated to a [`TimerFacility`] so tests can count installs
//! and cancels. [`TokioTimer`] is the real one: a task per handle that sleeps
//! toward the next due minute in bounded naps (so a wall-clock jump is noticed
//! within one nap) and calls the fire callback.
//!
//! ## Failure Policy
//! If the facility cannot install a timer the setter returns
//! [`SchedulerError`]. The requested settings are kept, the state is left
//! `Unscheduled`, and the caller is expected to treat it as fatal.

use chrono::{
    Datelike, Duration as ChronoDuration, Local, NaiveDateTime, NaiveTime, Timelike, Weekday,
};
use log::{debug, error, info};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;

/// Errors raised while changing or arming the alarm.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchedulerError {
    /// Hour or minute out of range
    #[error("invalid alarm time {hour:02}:{minute:02}")]
    InvalidTime { hour: u32, minute: u32 },

    /// No tokio runtime to run the timer task on
    #[error("no async runtime available to install alarm timer")]
    NoRuntime,

    /// The timer facility refused the job
    #[error("timer install failed: {0}")]
    Install(String),
}

/// User-facing alarm settings.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlarmConfig {
    /// Wall-clock time of day, whole minutes
    pub time_of_day: NaiveTime,
    /// Whether the alarm should fire at all
    pub active: bool,
    /// Fire on Saturday and Sunday too
    pub include_weekends: bool,
}

impl Default for AlarmConfig {
    fn default() -> Self {
        Self {
            time_of_day: NaiveTime::from_hms_opt(6, 30, 0).expect("06:30 should be a valid time"),
            active: true,
            include_weekends: true,
        }
    }
}

impl AlarmConfig {
    /// Build a config, validating the hour and minute.
    pub fn new(
        hour: u32,
        minute: u32,
        active: bool,
        include_weekends: bool,
    ) -> Result<Self, SchedulerError> {
        Ok(Self {
            time_of_day: time_of_day(hour, minute)?,
            active,
            include_weekends,
        })
    }
}

fn time_of_day(hour: u32, minute: u32) -> Result<NaiveTime, SchedulerError> {
    NaiveTime::from_hms_opt(hour, minute, 0).ok_or(SchedulerError::InvalidTime { hour, minute })
}

/// Day-of-week mask for the recurring trigger.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DaySet {
    /// Monday through Sunday
    AllDays,
    /// Monday through Friday
    Weekdays,
}

impl DaySet {
    pub fn contains(self, day: Weekday) -> bool {
        match self {
            DaySet::AllDays => true,
            DaySet::Weekdays => !matches!(day, Weekday::Sat | Weekday::Sun),
        }
    }
}

impl fmt::Display for DaySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DaySet::AllDays => f.write_str("mon-sun"),
            DaySet::Weekdays => f.write_str("mon-fri"),
        }
    }
}

/// A recurring hour:minute trigger restricted to a set of weekdays.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CronTrigger {
    pub time: NaiveTime,
    pub days: DaySet,
}

impl CronTrigger {
    /// Earliest firing strictly after `now`.
    ///
    /// # Example
    /// ```
    /// use chrono::{NaiveDate, NaiveTime};
    /// use rotary_alarm_lib::scheduler::{CronTrigger, DaySet};
    ///
    /// let trigger = CronTrigger {
    ///     time: NaiveTime::from_hms_opt(7, 15, 0).unwrap(),
    ///     days: DaySet::Weekdays,
    /// };
    /// // Friday evening -> Monday morning
    /// let friday = NaiveDate::from_ymd_opt(2024, 6, 14).unwrap().and_hms_opt(20, 0, 0).unwrap();
    /// let next = trigger.next_after(friday).unwrap();
    /// assert_eq!(next.date(), NaiveDate::from_ymd_opt(2024, 6, 17).unwrap());
    /// ```
    pub fn next_after(&self, now: NaiveDateTime) -> Option<NaiveDateTime> {
        (0..=7)
            .map(|offset| now.date() + ChronoDuration::days(offset))
            .map(|date| date.and_time(self.time))
            .find(|candidate| *candidate > now && self.days.contains(candidate.weekday()))
    }
}

impl fmt::Display for CronTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02} {}", self.time.hour(), self.time.minute(), self.days)
    }
}

/// Pure transition: the trigger that should be live for `config`, if any.
pub fn apply(config: &AlarmConfig) -> Option<CronTrigger> {
    config.active.then(|| CronTrigger {
        time: config.time_of_day.with_second(0).unwrap_or(config.time_of_day),
        days: if config.include_weekends {
            DaySet::AllDays
        } else {
            DaySet::Weekdays
        },
    })
}

/// Scheduler state as seen from outside.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScheduleState {
    Unscheduled,
    Scheduled(CronTrigger),
}

/// Callback run when a timer fires.
pub type FireFn = Arc<dyn Fn() + Send + Sync>;

/// Handle to one installed recurring job. Dropping it cancels the job.
pub struct TimerHandle {
    id: u64,
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl TimerHandle {
    /// Wrap a job id and the action that tears it down.
    pub fn new(id: u64, cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            id,
            cancel: Some(Box::new(cancel)),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Cancel the job now.
    pub fn cancel(mut self) {
        self.cancel_in_place();
    }

    fn cancel_in_place(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        self.cancel_in_place();
    }
}

impl fmt::Debug for TimerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerHandle")
            .field("id", &self.id)
            .field("live", &self.cancel.is_some())
            .finish()
    }
}

/// Something that can run a recurring cron-style job.
pub trait TimerFacility: Send + Sync {
    fn install(&self, trigger: CronTrigger, fire: FireFn) -> Result<TimerHandle, SchedulerError>;
}

/// Source of local wall-clock time.
pub trait WallClock: Send + Sync {
    fn now(&self) -> NaiveDateTime;
}

/// The system's local time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl WallClock for SystemClock {
    fn now(&self) -> NaiveDateTime {
        Local::now().naive_local()
    }
}

const MINUTES_PER_DAY: i64 = 24 * 60;

/// Longest single sleep while waiting for a trigger.
const MAX_NAP: Duration = Duration::from_secs(30);

/// Timer facility backed by tokio tasks.
pub struct TokioTimer {
    clock: Arc<dyn WallClock>,
    next_id: AtomicU64,
}

impl TokioTimer {
    pub fn new(clock: Arc<dyn WallClock>) -> Self {
        Self {
            clock,
            next_id: AtomicU64::new(1),
        }
    }
}

impl Default for TokioTimer {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

impl TimerFacility for TokioTimer {
    fn install(&self, trigger: CronTrigger, fire: FireFn) -> Result<TimerHandle, SchedulerError> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| SchedulerError::NoRuntime)?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let clock = Arc::clone(&self.clock);

        let task = runtime.spawn(async move {
            loop {
                let Some(due) = trigger.next_after(clock.now()) else {
                    error!("Timer {} has no future firing for {}", id, trigger);
                    return;
                };
                debug!("Timer {} next due at {}", id, due);

                loop {
                    let now = clock.now();
                    if now >= due {
                        break;
                    }
                    let remaining = (due - now).to_std().unwrap_or(Duration::ZERO);
                    tokio::time::sleep(remaining.min(MAX_NAP)).await;
                }
                fire();
            }
        });

        let abort = task.abort_handle();
        Ok(TimerHandle::new(id, move || abort.abort()))
    }
}

struct Inner {
    config: AlarmConfig,
    handle: Option<TimerHandle>,
    state: ScheduleState,
}

/// Alarm settings plus the single live timer, kept consistent under one lock.
pub struct AlarmScheduler {
    inner: Mutex<Inner>,
    timer: Arc<dyn TimerFacility>,
    fire: FireFn,
    reschedules: AtomicU64,
}

impl AlarmScheduler {
    /// Create the scheduler and arm it for `config`.
    pub fn new(
        config: AlarmConfig,
        timer: Arc<dyn TimerFacility>,
        fire: FireFn,
    ) -> Result<Self, SchedulerError> {
        let scheduler = Self {
            inner: Mutex::new(Inner {
                config,
                handle: None,
                state: ScheduleState::Unscheduled,
            }),
            timer,
            fire,
            reschedules: AtomicU64::new(0),
        };
        {
            let mut inner = scheduler.lock();
            scheduler.reschedule(&mut inner)?;
        }
        Ok(scheduler)
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // Inner is left consistent between statements, so a poisoned lock is
        // still usable
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Cancel whatever is live and install what `inner.config` calls for.
    ///
    /// Must be called with the lock held; that is what makes it atomic with
    /// respect to other setters.
    fn reschedule(&self, inner: &mut Inner) -> Result<(), SchedulerError> {
        self.reschedules.fetch_add(1, Ordering::Relaxed);

        if let Some(old) = inner.handle.take() {
            debug!("Cancelling alarm timer {}", old.id());
            old.cancel();
        }
        inner.state = ScheduleState::Unscheduled;

        let Some(trigger) = apply(&inner.config) else {
            info!("Alarm inactive, nothing scheduled");
            return Ok(());
        };

        let handle = self.timer.install(trigger, Arc::clone(&self.fire))?;
        info!("Alarm scheduled for: {}", trigger);
        debug!("Alarm using timer {}", handle.id());
        inner.handle = Some(handle);
        inner.state = ScheduleState::Scheduled(trigger);
        Ok(())
    }

    /// Move the alarm to `hour:minute`.
    pub fn set_time(&self, hour: u32, minute: u32) -> Result<(), SchedulerError> {
        let time = time_of_day(hour, minute)?;
        let mut inner = self.lock();
        inner.config.time_of_day = time;
        self.reschedule(&mut inner)
    }

    /// Shift the alarm by a signed number of minutes, wrapping at midnight.
    ///
    /// Returns the new time of day.
    pub fn shift_time(&self, minutes: i64) -> Result<NaiveTime, SchedulerError> {
        let mut inner = self.lock();
        let offset = ChronoDuration::minutes(minutes.rem_euclid(MINUTES_PER_DAY));
        let (shifted, _) = inner.config.time_of_day.overflowing_add_signed(offset);
        inner.config.time_of_day = shifted;
        self.reschedule(&mut inner)?;
        Ok(shifted)
    }

    pub fn set_active(&self, active: bool) -> Result<(), SchedulerError> {
        let mut inner = self.lock();
        inner.config.active = active;
        self.reschedule(&mut inner)
    }

    /// Flip the active flag. Returns the new value.
    pub fn toggle_active(&self) -> Result<bool, SchedulerError> {
        let mut inner = self.lock();
        inner.config.active = !inner.config.active;
        let active = inner.config.active;
        self.reschedule(&mut inner)?;
        Ok(active)
    }

    pub fn set_weekends(&self, include_weekends: bool) -> Result<(), SchedulerError> {
        let mut inner = self.lock();
        inner.config.include_weekends = include_weekends;
        self.reschedule(&mut inner)
    }

    pub fn get_time(&self) -> NaiveTime {
        self.lock().config.time_of_day
    }

    pub fn get_active(&self) -> bool {
        self.lock().config.active
    }

    pub fn get_weekends(&self) -> bool {
        self.lock().config.include_weekends
    }

    pub fn config(&self) -> AlarmConfig {
        self.lock().config
    }

    pub fn state(&self) -> ScheduleState {
        self.lock().state
    }

    /// Number of reschedules performed, including the initial arm.
    pub fn reschedule_count(&self) -> u64 {
        self.reschedules.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for AlarmScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.lock();
        f.debug_struct("AlarmScheduler")
            .field("config", &inner.config)
            .field("state", &inner.state)
            .field("handle", &inner.handle)
            .finish()
    }
}
