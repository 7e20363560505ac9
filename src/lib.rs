//! # Rotary Alarm Core Library
//!
//! This library turns the raw edge interrupts of a quadrature rotary encoder into
//! directional "tick" events, and uses those ticks (plus a push button) to move a
//! recurring wake-up alarm around the clock. It is designed for a Raspberry Pi
//! sitting on the nightstand: two GPIO lines for the encoder, one for the button,
//! and a cron-style timer that re-arms whenever the alarm changes.
//!
//! ## Design Philosophy
//!
//! ### Interrupts Only Enqueue
//! Edge interrupts arrive on their own threads, possibly at the same time and
//! possibly out of physical order. They never touch decoder state: each edge is
//! pushed into a bounded [`edge_queue`] and the call returns immediately. When
//! the queue is full the edge is dropped and counted, never blocked on.
//!
//! ### One Owner for Decoder State
//! A single decode task owns the [`decoder::QuadratureDecoder`] and processes
//! one edge at a time to completion. Serializing the edges this way is what
//! keeps the quadrature state machine correct without any locks.
//!
//! ### Debounce by Construction
//! Only a complete, legal four-edge cycle that returns to the detent produces a
//! tick. A single invalid transition anywhere in the cycle throws the whole
//! cycle away, so contact bounce can never double-count.
//!
//! ### Slow Callbacks Never Stall Decoding
//! Ticks and presses are handed to the [`dispatcher`], a bounded pool of workers
//! that runs user callbacks on the blocking thread pool. A slow or panicking
//! callback costs a worker, not the decode loop.
//!
//! ### One Timer, Always
//! The [`scheduler::AlarmScheduler`] holds the alarm settings and the single
//! live [`scheduler::TimerHandle`] behind one mutex. Every setter cancels and
//! re-installs the timer inside that critical section, so concurrent knob turns
//! and button presses can never leak a second timer.
//!
//! ## Data Flow
//! 1. **Edge source** → `(pin, level)` notifications from GPIO interrupts
//! 2. **Edge queue** → bounded FIFO between interrupt context and the decoder
//! 3. **Decoder** → tick(+1) / tick(-1) / press
//! 4. **Dispatcher** → `InputHandler` callbacks on worker tasks
//! 5. **Alarm clock** → shifts the alarm time or toggles it, rescheduling the timer
//! 6. **Timer** → fires at the due minute and runs the wake action
//!
//! ## Core Types
//!
//! The library exports the small value types shared by every stage:
//! - [`Level`]: a logic level read from a GPIO line
//! - [`PinId`]: which logical input an edge belongs to
//! - [`EdgeEvent`]: one queued edge notification
//! - [`Direction`]: the rotation direction of a confirmed tick
//! - [`InputEvent`]: what the decoder hands to the dispatcher

use serde::{Deserialize, Serialize};
use std::fmt;

// Module declarations
pub mod alarm;
pub mod config;
pub mod decoder;
pub mod dispatcher;
pub mod edge_queue;
pub mod encoder;
pub mod gpio;
pub mod scheduler;
pub mod wake;

/// Logic level of a GPIO line.
///
/// The encoder and button inputs are wired with pull-ups, so `High` is the
/// resting level for both encoder channels and for a released button.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Level {
    Low,
    High,
}

impl Level {
    /// Returns the level as a single bit (`High` = 1).
    pub fn bit(self) -> u8 {
        match self {
            Level::Low => 0,
            Level::High => 1,
        }
    }
}

impl From<bool> for Level {
    fn from(high: bool) -> Self {
        if high {
            Level::High
        } else {
            Level::Low
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.bit())
    }
}

/// Logical identity of an input line.
///
/// The edge source maps physical BCM pin numbers onto these; everything past
/// the edge source only ever sees the logical channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PinId {
    /// Quadrature channel A
    EncoderA,
    /// Quadrature channel B
    EncoderB,
    /// Push button (active low)
    Button,
}

/// A single edge notification, as delivered from interrupt context.
///
/// # Example
/// ```
/// use rotary_alarm_lib::{EdgeEvent, Level, PinId};
///
/// let edge = EdgeEvent { channel: PinId::EncoderA, level: Level::Low };
/// assert_eq!(edge.level.bit(), 0);
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EdgeEvent {
    /// Line that changed
    pub channel: PinId,
    /// Level read right after the change
    pub level: Level,
}

/// Rotation direction of a confirmed tick.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Detent → Right → Mid → Left → Detent
    Clockwise,
    /// Detent → Left → Mid → Right → Detent
    CounterClockwise,
}

impl Direction {
    /// Signed unit step: `+1` clockwise, `-1` counter-clockwise.
    pub fn signum(self) -> i32 {
        match self {
            Direction::Clockwise => 1,
            Direction::CounterClockwise => -1,
        }
    }
}

/// Events the decoder hands to the dispatcher.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InputEvent {
    /// One full detent-to-detent rotation
    Tick(Direction),
    /// A debounced button press
    Press,
}
