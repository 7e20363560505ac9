//! # Alarm Clock
//!
//! Ties the [`AlarmScheduler`] to the wake action, and the encoder to the
//! scheduler.
//!
//! - Turning the knob one click moves the alarm by `step_minutes` in the
//!   direction of rotation, wrapping around midnight.
//! - Pressing the button toggles the alarm on or off.
//! - When the timer fires, the wake action runs once on the blocking pool.
//!
//! Input callbacks cannot return errors to anyone, so a scheduler failure
//! raised from inside one is parked as the clock's fatal error and surfaced
//! through [`AlarmClock::failed`], where the process root can pick it up.

use crate::dispatcher::InputHandler;
use crate::scheduler::{AlarmConfig, AlarmScheduler, FireFn, SchedulerError, TimerFacility};
use crate::wake::WakeAction;
use crate::Direction;
use log::{error, info};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

/// Default knob resolution in minutes per click.
pub const DEFAULT_STEP_MINUTES: i64 = 5;

/// The alarm clock: settings, timer and wake action.
pub struct AlarmClock {
    scheduler: AlarmScheduler,
    step_minutes: i64,
    fired: Arc<AtomicU64>,
    fatal: watch::Sender<Option<SchedulerError>>,
}

impl AlarmClock {
    /// Build the clock and arm the initial alarm.
    ///
    /// Fails if the initial timer cannot be installed.
    pub fn new(
        config: AlarmConfig,
        step_minutes: i64,
        timer: Arc<dyn TimerFacility>,
        wake: Arc<dyn WakeAction>,
    ) -> Result<Self, SchedulerError> {
        let fired = Arc::new(AtomicU64::new(0));
        let fire = fire_callback(wake, Arc::clone(&fired));
        let scheduler = AlarmScheduler::new(config, timer, fire)?;
        info!("Alarm setup complete");
        Ok(Self {
            scheduler,
            step_minutes,
            fired,
            fatal: watch::channel(None).0,
        })
    }

    pub fn scheduler(&self) -> &AlarmScheduler {
        &self.scheduler
    }

    /// Number of times the alarm has gone off.
    pub fn fired_count(&self) -> u64 {
        self.fired.load(Ordering::SeqCst)
    }

    /// Resolves with the first scheduler error raised from an input callback.
    pub async fn failed(&self) -> SchedulerError {
        let mut rx = self.fatal.subscribe();
        loop {
            if let Some(err) = rx.borrow_and_update().clone() {
                return err;
            }
            // The sender lives in `self`, so it outlives `rx`
            if rx.changed().await.is_err() {
                return std::future::pending().await;
            }
        }
    }

    /// The recorded fatal error, if any.
    pub fn fatal_error(&self) -> Option<SchedulerError> {
        self.fatal.borrow().clone()
    }

    fn record_fatal(&self, err: SchedulerError) {
        error!("Alarm could not be rescheduled: {}", err);
        self.fatal.send_if_modified(|slot| {
            if slot.is_none() {
                *slot = Some(err);
                true
            } else {
                false
            }
        });
    }
}

/// Timer callback: count the firing and run the wake action once.
fn fire_callback(wake: Arc<dyn WakeAction>, fired: Arc<AtomicU64>) -> FireFn {
    Arc::new(move || {
        let n = fired.fetch_add(1, Ordering::SeqCst) + 1;
        info!("Alarm triggered! Wake-up! (firing #{})", n);
        let wake = Arc::clone(&wake);
        let task = tokio::task::spawn_blocking(move || wake.wake());
        tokio::spawn(async move {
            if let Err(e) = task.await {
                error!("Wake action failed: {}", e);
            }
        });
    })
}

impl InputHandler for AlarmClock {
    fn on_change(&self, direction: Direction) {
        let delta = self.step_minutes.saturating_mul(i64::from(direction.signum()));
        match self.scheduler.shift_time(delta) {
            Ok(time) => info!("Alarm time now {}", time.format("%H:%M")),
            Err(e) => self.record_fatal(e),
        }
    }

    fn on_button_press(&self) {
        match self.scheduler.toggle_active() {
            Ok(true) => info!("Alarm switched on"),
            Ok(false) => info!("Alarm switched off"),
            Err(e) => self.record_fatal(e),
        }
    }
}
