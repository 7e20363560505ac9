//! # End-to-End Scenarios
//!
//! These tests run the real pipeline: simulated GPIO edges go through the edge
//! queue, the decoder and the dispatcher into an [`AlarmClock`], whose
//! scheduler installs timers on a recording facility or on the tokio timer.

use chrono::{Duration as ChronoDuration, NaiveDate, NaiveDateTime, NaiveTime};
use rotary_alarm_lib::alarm::{AlarmClock, DEFAULT_STEP_MINUTES};
use rotary_alarm_lib::dispatcher::InputHandler;
use rotary_alarm_lib::encoder::{EncoderSettings, RotaryEncoder};
use rotary_alarm_lib::gpio::SimulatedEdgeSource;
use rotary_alarm_lib::scheduler::{
    AlarmConfig, CronTrigger, DaySet, FireFn, ScheduleState, SchedulerError, TimerFacility,
    TimerHandle, TokioTimer, WallClock,
};
use rotary_alarm_lib::wake::LogWakeAction;
use rotary_alarm_lib::{Level, PinId};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Timer facility that records every trigger and tracks live handles.
#[derive(Default)]
struct RecordingTimer {
    installed: Mutex<Vec<CronTrigger>>,
    live: Arc<AtomicUsize>,
    next_id: AtomicU64,
}

impl RecordingTimer {
    fn last_trigger(&self) -> Option<CronTrigger> {
        self.installed.lock().unwrap().last().copied()
    }

    fn install_count(&self) -> usize {
        self.installed.lock().unwrap().len()
    }

    fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }
}

impl TimerFacility for RecordingTimer {
    fn install(&self, trigger: CronTrigger, _fire: FireFn) -> Result<TimerHandle, SchedulerError> {
        self.installed.lock().unwrap().push(trigger);
        self.live.fetch_add(1, Ordering::SeqCst);
        let live = Arc::clone(&self.live);
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        Ok(TimerHandle::new(id, move || {
            live.fetch_sub(1, Ordering::SeqCst);
        }))
    }
}

fn hm(h: u32, m: u32) -> NaiveTime {
    NaiveTime::from_hms_opt(h, m, 0).unwrap()
}

/// Poll `cond` until it holds, failing after a few seconds.
async fn eventually(what: &str, cond: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {}",
            what
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

fn recording_clock() -> (Arc<RecordingTimer>, Arc<AlarmClock>) {
    let timer = Arc::new(RecordingTimer::default());
    let clock = AlarmClock::new(
        AlarmConfig::default(),
        DEFAULT_STEP_MINUTES,
        timer.clone(),
        Arc::new(LogWakeAction),
    )
    .unwrap();
    (timer, Arc::new(clock))
}

/// A clockwise click from rest moves the alarm forward one step, and a later
/// `set_time` replaces the timer rather than adding a second one.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn clockwise_click_then_set_time_replaces_timer() {
    let (timer, clock) = recording_clock();
    let source = SimulatedEdgeSource::at_rest();
    let handler: Arc<dyn InputHandler> = clock.clone();
    let encoder =
        RotaryEncoder::start(source.clone(), EncoderSettings::default(), handler).unwrap();

    // Detent -> Right -> Mid -> Left -> Detent
    source.drive(PinId::EncoderA, Level::Low).unwrap();
    source.drive(PinId::EncoderB, Level::Low).unwrap();
    source.drive(PinId::EncoderA, Level::High).unwrap();
    source.drive(PinId::EncoderB, Level::High).unwrap();

    eventually("alarm to move to 06:35", || {
        clock.scheduler().get_time() == hm(6, 35)
    })
    .await;
    assert_eq!(timer.last_trigger().unwrap().time, hm(6, 35));

    let installs_before = timer.install_count();
    clock.scheduler().set_time(7, 15).unwrap();
    assert_eq!(timer.install_count(), installs_before + 1);
    assert_eq!(
        timer.last_trigger(),
        Some(CronTrigger {
            time: hm(7, 15),
            days: DaySet::AllDays,
        })
    );
    assert_eq!(timer.live(), 1);

    clock.scheduler().set_weekends(false).unwrap();
    assert_eq!(timer.last_trigger().unwrap().days, DaySet::Weekdays);
    assert_eq!(timer.live(), 1);

    let report = encoder.shutdown().await;
    assert_eq!(report.decoder.clockwise_ticks, 1);
    assert_eq!(report.decoder.invalid_transitions, 0);
}

/// A press that lands in the middle of a click is handled on its own, and the
/// click still counts.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn button_press_during_click() {
    let (timer, clock) = recording_clock();
    let source = SimulatedEdgeSource::at_rest();
    let handler: Arc<dyn InputHandler> = clock.clone();
    let encoder =
        RotaryEncoder::start(source.clone(), EncoderSettings::default(), handler).unwrap();

    // Counter-clockwise click with the button pressed halfway through
    source.drive(PinId::EncoderB, Level::Low).unwrap();
    source.drive(PinId::EncoderA, Level::Low).unwrap();
    source.press().unwrap();
    source.drive(PinId::EncoderB, Level::High).unwrap();
    source.drive(PinId::EncoderA, Level::High).unwrap();

    eventually("tick and press to be handled", || {
        clock.scheduler().get_time() == hm(6, 25) && !clock.scheduler().get_active()
    })
    .await;
    assert_eq!(clock.scheduler().state(), ScheduleState::Unscheduled);
    assert_eq!(timer.live(), 0);

    let report = encoder.shutdown().await;
    assert_eq!(report.decoder.counter_clockwise_ticks, 1);
    assert_eq!(report.button_presses, 1);
    assert_eq!(report.dispatch.failed, 0);
}

/// Going halfway and back is not a click.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn half_turn_and_back_is_ignored() {
    let (_timer, clock) = recording_clock();
    let source = SimulatedEdgeSource::at_rest();
    let handler: Arc<dyn InputHandler> = clock.clone();
    let encoder =
        RotaryEncoder::start(source.clone(), EncoderSettings::default(), handler).unwrap();

    source.drive(PinId::EncoderA, Level::Low).unwrap();
    source.drive(PinId::EncoderB, Level::Low).unwrap();
    source.drive(PinId::EncoderB, Level::High).unwrap();
    source.drive(PinId::EncoderA, Level::High).unwrap();

    let report = encoder.shutdown().await;
    assert_eq!(report.decoder.clockwise_ticks, 0);
    assert_eq!(report.decoder.counter_clockwise_ticks, 0);
    assert_eq!(report.decoder.detents_without_cycle, 1);
    assert_eq!(clock.scheduler().get_time(), hm(6, 30));
}

/// A bouncing contact that repeats an interrupt mid-click changes nothing.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn repeated_edges_mid_click_count_once() {
    let (_timer, clock) = recording_clock();
    let source = SimulatedEdgeSource::at_rest();
    let handler: Arc<dyn InputHandler> = clock.clone();
    let encoder =
        RotaryEncoder::start(source.clone(), EncoderSettings::default(), handler).unwrap();

    source.drive(PinId::EncoderA, Level::Low).unwrap();
    source.glitch(PinId::EncoderA).unwrap();
    source.drive(PinId::EncoderB, Level::Low).unwrap();
    source.glitch(PinId::EncoderB).unwrap();
    source.glitch(PinId::EncoderB).unwrap();
    source.drive(PinId::EncoderA, Level::High).unwrap();
    source.glitch(PinId::EncoderA).unwrap();
    source.drive(PinId::EncoderB, Level::High).unwrap();

    eventually("alarm to move to 06:35", || {
        clock.scheduler().get_time() == hm(6, 35)
    })
    .await;

    let report = encoder.shutdown().await;
    assert_eq!(report.decoder.clockwise_ticks, 1);
    assert_eq!(report.decoder.counter_clockwise_ticks, 0);
    assert_eq!(report.decoder.invalid_transitions, 0);
    assert_eq!(report.decoder.detents_without_cycle, 0);
    assert_eq!(report.dropped_edges, 0);
    assert_eq!(clock.scheduler().get_time(), hm(6, 35));
}

/// Wall clock that advances with tokio's (paused) clock.
struct TokioDrivenClock {
    base: NaiveDateTime,
    start: tokio::time::Instant,
}

impl WallClock for TokioDrivenClock {
    fn now(&self) -> NaiveDateTime {
        self.base + ChronoDuration::from_std(self.start.elapsed()).unwrap()
    }
}

fn tokio_clock(config: AlarmConfig) -> AlarmClock {
    // Wednesday 07:00
    let base = NaiveDate::from_ymd_opt(2024, 6, 12)
        .unwrap()
        .and_hms_opt(7, 0, 0)
        .unwrap();
    let wall = Arc::new(TokioDrivenClock {
        base,
        start: tokio::time::Instant::now(),
    });
    AlarmClock::new(
        config,
        DEFAULT_STEP_MINUTES,
        Arc::new(TokioTimer::new(wall)),
        Arc::new(LogWakeAction),
    )
    .unwrap()
}

/// The alarm goes off at its minute, once.
#[tokio::test(start_paused = true)]
async fn alarm_fires_at_configured_minute() {
    let clock = tokio_clock(AlarmConfig::new(7, 15, true, true).unwrap());

    tokio::time::sleep(Duration::from_secs(14 * 60)).await;
    assert_eq!(clock.fired_count(), 0);

    tokio::time::sleep(Duration::from_secs(2 * 60)).await;
    assert_eq!(clock.fired_count(), 1);
    // Firing leaves the alarm armed for tomorrow
    assert!(matches!(
        clock.scheduler().state(),
        ScheduleState::Scheduled(_)
    ));
}

/// Switching the alarm off cancels the live timer; nothing fires at the old
/// time.
#[tokio::test(start_paused = true)]
async fn deactivated_alarm_does_not_fire() {
    let clock = tokio_clock(AlarmConfig::new(7, 15, true, true).unwrap());

    clock.scheduler().set_active(false).unwrap();
    assert_eq!(clock.scheduler().state(), ScheduleState::Unscheduled);

    tokio::time::sleep(Duration::from_secs(30 * 60)).await;
    assert_eq!(clock.fired_count(), 0);
}

/// Moving the alarm earlier while it is armed makes it fire at the new time.
#[tokio::test(start_paused = true)]
async fn rescheduled_alarm_fires_at_new_time() {
    let clock = tokio_clock(AlarmConfig::new(8, 0, true, true).unwrap());

    clock.scheduler().set_time(7, 10).unwrap();
    tokio::time::sleep(Duration::from_secs(11 * 60)).await;
    assert_eq!(clock.fired_count(), 1);

    // The old 08:00 timer is gone
    tokio::time::sleep(Duration::from_secs(60 * 60)).await;
    assert_eq!(clock.fired_count(), 1);
}
