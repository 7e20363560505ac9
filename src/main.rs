//! # Rotary Alarm Application Entry Point
//!
//! This binary wires the library together: it loads the configuration, arms the
//! alarm clock, binds the encoder to GPIO and runs until interrupted.
//! It supports both production mode (Raspberry Pi GPIO) and a simulation mode
//! that reads encoder gestures from stdin for testing without hardware.

// Test modules
#[cfg(test)]
mod tests;

use anyhow::{bail, Context};
use log::{error, info, warn};
use rotary_alarm_lib::alarm::AlarmClock;
use rotary_alarm_lib::config::Config;
use rotary_alarm_lib::dispatcher::InputHandler;
use rotary_alarm_lib::encoder::{EncoderReport, RotaryEncoder};
use rotary_alarm_lib::gpio::{EdgeSource, SimulatedEdgeSource};
use rotary_alarm_lib::scheduler::TokioTimer;
use rotary_alarm_lib::wake::{CommandWakeAction, LogWakeAction, WakeAction};
use std::env;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};

/// Command line options.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Args {
    /// Explicit config file; missing or invalid is an error
    pub config: Option<PathBuf>,
    /// Drive a simulated encoder from stdin instead of GPIO
    pub simulate: bool,
}

/// Parse `[--config <path>] [--simulate]`.
pub fn parse_args<I: IntoIterator<Item = String>>(args: I) -> anyhow::Result<Args> {
    let mut parsed = Args::default();
    let mut args = args.into_iter();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--simulate" => parsed.simulate = true,
            "--config" => {
                let path = args.next().context("--config needs a path")?;
                parsed.config = Some(PathBuf::from(path));
            }
            other => bail!("unknown argument: {}", other),
        }
    }
    Ok(parsed)
}

/// Main application entry point.
fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = parse_args(env::args().skip(1))?;
    let config = match &args.config {
        Some(path) => Config::load_strict(path)?,
        None => Config::load(),
    };

    // Create Tokio runtime for timers, decoding and callbacks
    let rt = tokio::runtime::Runtime::new()?;
    let result = rt.block_on(run(config, args.simulate));

    // A pending stdin read would otherwise keep the runtime alive
    rt.shutdown_timeout(Duration::from_secs(1));
    result
}

async fn run(config: Config, simulate: bool) -> anyhow::Result<()> {
    let wake: Arc<dyn WakeAction> = if config.alarm.wake_command.is_empty() {
        Arc::new(LogWakeAction)
    } else {
        Arc::new(CommandWakeAction::from_argv(&config.alarm.wake_command)?)
    };

    let clock = Arc::new(
        AlarmClock::new(
            config.alarm_config()?,
            config.alarm.step_minutes,
            Arc::new(TokioTimer::default()),
            wake,
        )
        .context("failed to arm the alarm")?,
    );
    let handler: Arc<dyn InputHandler> = clock.clone();

    if simulate {
        run_simulated(&config, clock, handler).await
    } else {
        run_hardware(&config, clock, handler).await
    }
}

/// Wait for Ctrl+C, a fatal alarm error, or the end of `input`.
async fn wait_for_exit<F: Future<Output = ()>>(clock: &AlarmClock, input: F) -> anyhow::Result<()> {
    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("failed to listen for Ctrl+C")?;
            info!("Interrupted, shutting down");
            Ok(())
        }
        err = clock.failed() => {
            Err(anyhow::Error::new(err).context("alarm could not be rescheduled"))
        }
        () = input => {
            info!("Input closed, shutting down");
            Ok(())
        }
    }
}

async fn shutdown<S: EdgeSource>(encoder: RotaryEncoder<S>) -> EncoderReport {
    let report = encoder.shutdown().await;
    if report.dispatch.failed > 0 || report.dispatch.dropped > 0 {
        warn!(
            "{} callbacks failed, {} dropped",
            report.dispatch.failed, report.dispatch.dropped
        );
    }
    report
}

async fn run_simulated(
    config: &Config,
    clock: Arc<AlarmClock>,
    handler: Arc<dyn InputHandler>,
) -> anyhow::Result<()> {
    let source = SimulatedEdgeSource::at_rest();
    let encoder = RotaryEncoder::start(source.clone(), config.encoder_settings(), handler)?;

    println!("Simulated encoder ready: cw, ccw, press, status, quit");
    let result = wait_for_exit(&clock, drive_from_stdin(&source, &clock, &encoder)).await;
    shutdown(encoder).await;
    result
}

async fn drive_from_stdin(
    source: &SimulatedEdgeSource,
    clock: &AlarmClock,
    encoder: &RotaryEncoder<SimulatedEdgeSource>,
) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => return,
            Err(e) => {
                error!("Failed to read stdin: {}", e);
                return;
            }
        };
        let outcome = match line.trim() {
            "" => Ok(()),
            "cw" => source.turn(true),
            "ccw" => source.turn(false),
            "press" => source.press(),
            "status" => {
                print_status(clock, &encoder.report());
                Ok(())
            }
            "quit" => return,
            other => {
                warn!("Unknown command: {}", other);
                Ok(())
            }
        };
        if let Err(e) = outcome {
            error!("Simulated input failed: {}", e);
        }
    }
}

fn print_status(clock: &AlarmClock, report: &EncoderReport) {
    let scheduler = clock.scheduler();
    println!(
        "alarm {} {} (weekends {}), {:?}, fired {} times",
        scheduler.get_time().format("%H:%M"),
        if scheduler.get_active() { "on" } else { "off" },
        if scheduler.get_weekends() { "on" } else { "off" },
        scheduler.state(),
        clock.fired_count()
    );
    println!(
        "ticks +{} -{}, invalid {}, partial {}, presses {}, dropped edges {}",
        report.decoder.clockwise_ticks,
        report.decoder.counter_clockwise_ticks,
        report.decoder.invalid_transitions,
        report.decoder.detents_without_cycle,
        report.button_presses,
        report.dropped_edges
    );
}

#[cfg(all(target_os = "linux", feature = "hardware"))]
async fn run_hardware(
    config: &Config,
    clock: Arc<AlarmClock>,
    handler: Arc<dyn InputHandler>,
) -> anyhow::Result<()> {
    use rotary_alarm_lib::gpio::RppalEdgeSource;
    use rotary_alarm_lib::PinId;

    let wiring = &config.encoder;
    info!(
        "GPIO pin configuration: A=BCM {}, B=BCM {}, button={}",
        wiring.pin_a,
        wiring.pin_b,
        if wiring.use_button {
            format!("BCM {}", wiring.button_pin)
        } else {
            "none".to_string()
        }
    );

    let mut mapping = vec![
        (PinId::EncoderA, wiring.pin_a),
        (PinId::EncoderB, wiring.pin_b),
    ];
    if wiring.use_button {
        mapping.push((PinId::Button, wiring.button_pin));
    }
    let source = RppalEdgeSource::new(&mapping).context("failed to claim GPIO lines")?;
    let encoder = RotaryEncoder::start(source, config.encoder_settings(), handler)
        .context("failed to register edge interrupts")?;

    let result = wait_for_exit(&clock, std::future::pending::<()>()).await;
    shutdown(encoder).await;
    result
}

#[cfg(not(all(target_os = "linux", feature = "hardware")))]
async fn run_hardware(
    _config: &Config,
    _clock: Arc<AlarmClock>,
    _handler: Arc<dyn InputHandler>,
) -> anyhow::Result<()> {
    bail!("GPIO support not enabled. Rebuild on Linux with --features hardware, or use --simulate.")
}
