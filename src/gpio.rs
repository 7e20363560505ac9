//! # Edge Sources
//!
//! Where edges come from. The rest of the crate only sees the [`EdgeSource`]
//! trait: read a line's level synchronously, and register a callback that is
//! invoked from interrupt context with `(pin, level)` on every edge.
//!
//! - [`SimulatedEdgeSource`] drives callbacks by hand. Tests use it, and so
//!   does the binary's `--simulate` mode.
//! - `RppalEdgeSource` (feature `hardware`, Linux only) binds real Raspberry Pi
//!   GPIO lines through rppal's asynchronous interrupts.

use crate::{Level, PinId};
use log::debug;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;

/// Errors binding or reading GPIO lines. All are fatal at startup.
#[derive(Error, Debug)]
pub enum GpioError {
    /// The line is not wired to anything this source knows about
    #[error("no GPIO line configured for {0:?}")]
    Unmapped(PinId),

    /// The underlying driver refused the request
    #[error("GPIO error on {pin:?}: {message}")]
    Driver { pin: PinId, message: String },
}

/// Which edges trigger the callback.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EdgeMode {
    Rising,
    Falling,
    Both,
}

impl EdgeMode {
    /// Whether a transition to `level` matches this mode.
    pub fn matches(self, level: Level) -> bool {
        match self {
            EdgeMode::Rising => level == Level::High,
            EdgeMode::Falling => level == Level::Low,
            EdgeMode::Both => true,
        }
    }
}

/// Callback invoked from interrupt context.
pub type EdgeCallback = Box<dyn FnMut(PinId, Level) + Send + 'static>;

/// Something that can report input levels and notify about edges.
pub trait EdgeSource: Send {
    /// Read the current level of `pin` synchronously.
    fn read_level(&mut self, pin: PinId) -> Result<Level, GpioError>;

    /// Invoke `on_edge` on every `mode` edge of `pin`, from interrupt context.
    fn register_edge_interrupt(
        &mut self,
        pin: PinId,
        mode: EdgeMode,
        on_edge: EdgeCallback,
    ) -> Result<(), GpioError>;

    /// Remove every registered callback.
    fn deregister_all(&mut self);
}

struct SimulatedLine {
    level: Level,
    handler: Option<(EdgeMode, EdgeCallback)>,
}

/// In-memory edge source. Cloning shares the same lines.
#[derive(Clone)]
pub struct SimulatedEdgeSource {
    lines: Arc<Mutex<HashMap<PinId, SimulatedLine>>>,
}

impl SimulatedEdgeSource {
    /// Create with the given lines at their initial levels.
    pub fn new(initial: &[(PinId, Level)]) -> Self {
        let lines = initial
            .iter()
            .map(|&(pin, level)| {
                (
                    pin,
                    SimulatedLine {
                        level,
                        handler: None,
                    },
                )
            })
            .collect();
        Self {
            lines: Arc::new(Mutex::new(lines)),
        }
    }

    /// Encoder at rest and button released.
    pub fn at_rest() -> Self {
        Self::new(&[
            (PinId::EncoderA, Level::High),
            (PinId::EncoderB, Level::High),
            (PinId::Button, Level::High),
        ])
    }

    /// Set a line's level, invoking its callback if the level changed.
    pub fn drive(&self, pin: PinId, level: Level) -> Result<(), GpioError> {
        let mut lines = self.lines.lock().unwrap_or_else(PoisonError::into_inner);
        let line = lines.get_mut(&pin).ok_or(GpioError::Unmapped(pin))?;
        if line.level == level {
            return Ok(());
        }
        line.level = level;
        if let Some((mode, callback)) = line.handler.as_mut() {
            if mode.matches(level) {
                callback(pin, level);
            }
        }
        Ok(())
    }

    /// Deliver a notification even if the level did not change, like a
    /// bouncing contact that fires the interrupt twice.
    pub fn glitch(&self, pin: PinId) -> Result<(), GpioError> {
        let mut lines = self.lines.lock().unwrap_or_else(PoisonError::into_inner);
        let line = lines.get_mut(&pin).ok_or(GpioError::Unmapped(pin))?;
        let level = line.level;
        if let Some((_, callback)) = line.handler.as_mut() {
            callback(pin, level);
        }
        Ok(())
    }

    /// Drive both encoder channels through one full click.
    pub fn turn(&self, clockwise: bool) -> Result<(), GpioError> {
        // Clockwise leads with A, counter-clockwise with B
        let (first, second) = if clockwise {
            (PinId::EncoderA, PinId::EncoderB)
        } else {
            (PinId::EncoderB, PinId::EncoderA)
        };
        self.drive(first, Level::Low)?;
        self.drive(second, Level::Low)?;
        self.drive(first, Level::High)?;
        self.drive(second, Level::High)
    }

    /// Press and release the button.
    pub fn press(&self) -> Result<(), GpioError> {
        self.drive(PinId::Button, Level::Low)?;
        self.drive(PinId::Button, Level::High)
    }

    /// Whether any callbacks are registered.
    pub fn has_handlers(&self) -> bool {
        self.lines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .any(|line| line.handler.is_some())
    }
}

impl EdgeSource for SimulatedEdgeSource {
    fn read_level(&mut self, pin: PinId) -> Result<Level, GpioError> {
        let lines = self.lines.lock().unwrap_or_else(PoisonError::into_inner);
        lines
            .get(&pin)
            .map(|line| line.level)
            .ok_or(GpioError::Unmapped(pin))
    }

    fn register_edge_interrupt(
        &mut self,
        pin: PinId,
        mode: EdgeMode,
        on_edge: EdgeCallback,
    ) -> Result<(), GpioError> {
        let mut lines = self.lines.lock().unwrap_or_else(PoisonError::into_inner);
        let line = lines.get_mut(&pin).ok_or(GpioError::Unmapped(pin))?;
        line.handler = Some((mode, on_edge));
        debug!("Simulated interrupt registered for {:?}", pin);
        Ok(())
    }

    fn deregister_all(&mut self) {
        let mut lines = self.lines.lock().unwrap_or_else(PoisonError::into_inner);
        for line in lines.values_mut() {
            line.handler = None;
        }
    }
}

#[cfg(all(target_os = "linux", feature = "hardware"))]
pub use self::hardware::RppalEdgeSource;

#[cfg(all(target_os = "linux", feature = "hardware"))]
mod hardware {
    use super::{EdgeCallback, EdgeMode, EdgeSource, GpioError};
    use crate::{Level, PinId};
    use log::debug;
    use rppal::gpio::{Gpio, InputPin, Trigger};
    use std::collections::HashMap;

    /// Raspberry Pi GPIO lines with internal pull-ups, via rppal.
    pub struct RppalEdgeSource {
        pins: HashMap<PinId, InputPin>,
    }

    impl RppalEdgeSource {
        /// Claim the given BCM lines as pulled-up inputs.
        pub fn new(mapping: &[(PinId, u8)]) -> Result<Self, GpioError> {
            let gpio = Gpio::new().map_err(|e| GpioError::Driver {
                pin: mapping.first().map_or(PinId::EncoderA, |m| m.0),
                message: e.to_string(),
            })?;
            let mut pins = HashMap::new();
            for &(pin, bcm) in mapping {
                let line = gpio
                    .get(bcm)
                    .map_err(|e| GpioError::Driver {
                        pin,
                        message: format!("BCM {}: {}", bcm, e),
                    })?
                    .into_input_pullup();
                debug!("Claimed BCM {} for {:?}", bcm, pin);
                pins.insert(pin, line);
            }
            Ok(Self { pins })
        }
    }

    fn to_level(level: rppal::gpio::Level) -> Level {
        match level {
            rppal::gpio::Level::Low => Level::Low,
            rppal::gpio::Level::High => Level::High,
        }
    }

    impl EdgeSource for RppalEdgeSource {
        fn read_level(&mut self, pin: PinId) -> Result<Level, GpioError> {
            let line = self.pins.get(&pin).ok_or(GpioError::Unmapped(pin))?;
            Ok(to_level(line.read()))
        }

        fn register_edge_interrupt(
            &mut self,
            pin: PinId,
            mode: EdgeMode,
            mut on_edge: EdgeCallback,
        ) -> Result<(), GpioError> {
            let line = self.pins.get_mut(&pin).ok_or(GpioError::Unmapped(pin))?;
            let trigger = match mode {
                EdgeMode::Rising => Trigger::RisingEdge,
                EdgeMode::Falling => Trigger::FallingEdge,
                EdgeMode::Both => Trigger::Both,
            };
            line.set_async_interrupt(trigger, move |level| on_edge(pin, to_level(level)))
                .map_err(|e| GpioError::Driver {
                    pin,
                    message: e.to_string(),
                })
        }

        fn deregister_all(&mut self) {
            for (pin, line) in self.pins.iter_mut() {
                if let Err(e) = line.clear_async_interrupt() {
                    log::warn!("Failed to clear interrupt on {:?}: {}", pin, e);
                }
            }
        }
    }
}
