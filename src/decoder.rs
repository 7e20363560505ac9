//! # Quadrature Decoder
//!
//! Folds a stream of single-channel edges into directional ticks.
//!
//! ## Encoder States
//!
//! The two channels of a detented encoder are both high at rest. Turning one
//! click walks through all four Gray-code states and back:
//!
//! | A | B | State    |
//! |---|---|----------|
//! | 1 | 1 | `Detent` |
//! | 1 | 0 | `Left`   |
//! | 0 | 1 | `Right`  |
//! | 0 | 0 | `Mid`    |
//!
//! ```text
//!   clockwise:          Detent → Right → Mid → Left → Detent   (+1 per edge)
//!   counter-clockwise:  Detent → Left → Mid → Right → Detent   (-1 per edge)
//! ```
//!
//! ## Cycle Rules
//! - Repeating the current state (a duplicate or bounced edge) is a no-op.
//! - Any state change that is not one legal step in either direction marks the
//!   cycle invalid and is counted. The step count is left alone.
//! - On reaching `Detent` the cycle is judged: invalid cycles are discarded,
//!   a count of `+4`/`-4` is a tick, anything else is a partial turn that
//!   snapped back to rest. The count and the invalid flag are then cleared.
//!
//! Edges are delivered per channel and may interleave out of physical order,
//! which is exactly what the invalid-cycle rule absorbs.
//!
//! ## Button
//! [`ButtonDebouncer`] is much simpler: a High→Low edge is a press, unless it
//! lands within the hold-off window of the previous press.

use crate::{Direction, EdgeEvent, InputEvent, Level, PinId};
use log::{debug, error, trace};
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

/// Position of the encoder derived from the two channel levels.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EncoderState {
    /// `(1,1)` resting in a detent
    Detent,
    /// `(1,0)` left of the detent
    Left,
    /// `(0,1)` right of the detent
    Right,
    /// `(0,0)` halfway between detents
    Mid,
}

impl EncoderState {
    /// Derive the state from the current `(A, B)` levels.
    ///
    /// # Example
    /// ```
    /// use rotary_alarm_lib::decoder::EncoderState;
    /// use rotary_alarm_lib::Level::{High, Low};
    ///
    /// assert_eq!(EncoderState::from_levels(High, High), EncoderState::Detent);
    /// assert_eq!(EncoderState::from_levels(Low, High), EncoderState::Right);
    /// ```
    pub fn from_levels(a: Level, b: Level) -> Self {
        match (a, b) {
            (Level::High, Level::High) => EncoderState::Detent,
            (Level::High, Level::Low) => EncoderState::Left,
            (Level::Low, Level::High) => EncoderState::Right,
            (Level::Low, Level::Low) => EncoderState::Mid,
        }
    }

    /// Step contributed by moving from `self` to `next`.
    ///
    /// `Some(+1)` for a legal clockwise edge, `Some(-1)` for a legal
    /// counter-clockwise edge, `None` for anything else (including no change).
    fn step_to(self, next: EncoderState) -> Option<i8> {
        use EncoderState::*;
        match (self, next) {
            (Detent, Right) | (Right, Mid) | (Mid, Left) | (Left, Detent) => Some(1),
            (Detent, Left) | (Left, Mid) | (Mid, Right) | (Right, Detent) => Some(-1),
            _ => None,
        }
    }
}

impl fmt::Display for EncoderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let symbol = match self {
            EncoderState::Detent => "^",
            EncoderState::Left => "L",
            EncoderState::Right => "R",
            EncoderState::Mid => "_",
        };
        f.write_str(symbol)
    }
}

/// Counters describing how the decoder has been fed so far.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DecoderStats {
    /// Clockwise ticks emitted
    pub clockwise_ticks: u64,
    /// Counter-clockwise ticks emitted
    pub counter_clockwise_ticks: u64,
    /// State changes that were not a legal single step
    pub invalid_transitions: u64,
    /// Returns to detent with a clean but incomplete cycle
    pub detents_without_cycle: u64,
    /// Edges tagged with a channel the decoder does not handle
    pub unknown_channel_edges: u64,
}

/// The quadrature state machine.
///
/// Owned by exactly one task; nothing in here is shared or synchronized.
#[derive(Debug, Clone)]
pub struct QuadratureDecoder {
    level_a: Level,
    level_b: Level,
    last_state: EncoderState,
    step_count: i8,
    invalid: bool,
    stats: DecoderStats,
}

impl QuadratureDecoder {
    /// Create a decoder from levels sampled synchronously at startup.
    pub fn new(level_a: Level, level_b: Level) -> Self {
        Self {
            level_a,
            level_b,
            last_state: EncoderState::from_levels(level_a, level_b),
            step_count: 0,
            invalid: false,
            stats: DecoderStats::default(),
        }
    }

    /// Fold one encoder edge into the state machine.
    ///
    /// Only `EncoderA`/`EncoderB` edges are meaningful here; anything else is
    /// logged, counted and ignored.
    pub fn apply(&mut self, edge: EdgeEvent) -> Option<Direction> {
        match edge.channel {
            PinId::EncoderA => self.level_a = edge.level,
            PinId::EncoderB => self.level_b = edge.level,
            other => {
                error!("Invalid channel from queue: {:?}", other);
                self.stats.unknown_channel_edges += 1;
                return None;
            }
        }
        self.process_levels(self.level_a, self.level_b)
    }

    /// Run one transition with both channel levels given explicitly.
    pub fn process_levels(&mut self, a: Level, b: Level) -> Option<Direction> {
        self.level_a = a;
        self.level_b = b;
        let state = EncoderState::from_levels(a, b);
        let last = self.last_state;

        if state == last {
            return None;
        }

        match last.step_to(state) {
            Some(step) => self.step_count = (self.step_count + step).clamp(-4, 4),
            None => {
                debug!("Invalid transition! Last state: {} Current state: {}", last, state);
                self.invalid = true;
                self.stats.invalid_transitions += 1;
            }
        }

        let mut tick = None;
        if state == EncoderState::Detent {
            if self.invalid {
                debug!("Resetting after seeing an invalid transition");
            } else {
                match self.step_count {
                    4 => tick = Some(Direction::Clockwise),
                    -4 => tick = Some(Direction::CounterClockwise),
                    _ => {
                        debug!("Back to detent without full transition");
                        self.stats.detents_without_cycle += 1;
                    }
                }
            }
            match tick {
                Some(Direction::Clockwise) => self.stats.clockwise_ticks += 1,
                Some(Direction::CounterClockwise) => self.stats.counter_clockwise_ticks += 1,
                None => {}
            }
            self.invalid = false;
            self.step_count = 0;
        }

        self.last_state = state;
        trace!(
            "Change | A: {}  B: {} | State = {} | Count = {:2}",
            a,
            b,
            state,
            self.step_count
        );
        tick
    }

    /// State after the most recent edge.
    pub fn last_state(&self) -> EncoderState {
        self.last_state
    }

    /// Net legal steps taken since the last detent.
    pub fn step_count(&self) -> i8 {
        self.step_count
    }

    /// Whether an invalid transition has been seen since the last detent.
    pub fn is_cycle_invalid(&self) -> bool {
        self.invalid
    }

    pub fn stats(&self) -> DecoderStats {
        self.stats
    }
}

/// Turns raw button edges into presses.
///
/// The button is active low: a press is the High→Low edge. A second qualifying
/// edge within `holdoff` of the last accepted press is treated as bounce.
#[derive(Debug, Clone)]
pub struct ButtonDebouncer {
    level: Level,
    holdoff: Duration,
    last_press: Option<Instant>,
    presses: u64,
    suppressed: u64,
}

impl ButtonDebouncer {
    pub fn new(initial: Level, holdoff: Duration) -> Self {
        Self {
            level: initial,
            holdoff,
            last_press: None,
            presses: 0,
            suppressed: 0,
        }
    }

    /// Feed one button edge. Returns `Some(InputEvent::Press)` for a press.
    pub fn apply(&mut self, level: Level) -> Option<InputEvent> {
        let previous = std::mem::replace(&mut self.level, level);
        if !(previous == Level::High && level == Level::Low) {
            return None;
        }

        let now = Instant::now();
        if let Some(last) = self.last_press {
            if now.duration_since(last) < self.holdoff {
                trace!("Button edge inside hold-off, ignoring");
                self.suppressed += 1;
                return None;
            }
        }
        self.last_press = Some(now);
        self.presses += 1;
        Some(InputEvent::Press)
    }

    /// Accepted presses so far.
    pub fn presses(&self) -> u64 {
        self.presses
    }

    /// Qualifying edges rejected by the hold-off.
    pub fn suppressed(&self) -> u64 {
        self.suppressed
    }
}
