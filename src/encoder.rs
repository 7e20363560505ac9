//! # Rotary Encoder Worker
//!
//! Wires an [`EdgeSource`] to the decoder and the dispatcher:
//!
//! ```text
//!  interrupt (A) ─┐
//!  interrupt (B) ─┼─► EdgeQueue ─► decode task ─► Dispatcher ─► InputHandler
//!  interrupt (btn)┘                  (owns QuadratureDecoder
//!                                     and ButtonDebouncer)
//! ```
//!
//! Interrupt callbacks only enqueue. The decode task is the single owner of
//! all decoder state and handles one edge at a time to completion. When the
//! queue stays empty for `poll_timeout` the task wakes up anyway to report
//! dropped edges and refresh the published [`EncoderReport`].
//!
//! ## Lifecycle
//! - [`RotaryEncoder::start`] samples both channels, registers the interrupts
//!   and spawns the decode task. Any registration failure is returned as a
//!   [`GpioError`] after undoing the registrations that did succeed.
//! - [`RotaryEncoder::shutdown`] deregisters the interrupts, stops the task,
//!   decodes whatever is still queued and waits for dispatched callbacks.

use crate::decoder::{ButtonDebouncer, DecoderStats, QuadratureDecoder};
use crate::dispatcher::{DispatchLimits, DispatchStats, Dispatcher, InputHandler};
use crate::edge_queue::{edge_queue, EdgeConsumer, EdgeProducer, DEFAULT_CAPACITY};
use crate::gpio::{EdgeCallback, EdgeMode, EdgeSource, GpioError};
use crate::{Direction, EdgeEvent, InputEvent, PinId};
use log::{debug, error, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Shortest idle wait between housekeeping passes.
pub const MIN_POLL_TIMEOUT: Duration = Duration::from_millis(10);

/// Tuning for the encoder pipeline.
#[derive(Clone, Copy, Debug)]
pub struct EncoderSettings {
    /// Edge queue depth
    pub queue_capacity: usize,
    /// How long the decode task waits for an edge before housekeeping,
    /// never less than [`MIN_POLL_TIMEOUT`]
    pub poll_timeout: Duration,
    /// Whether a push button is wired
    pub use_button: bool,
    /// Minimum spacing between two accepted button presses
    pub button_holdoff: Duration,
    /// Callback pool sizing
    pub dispatch: DispatchLimits,
}

impl Default for EncoderSettings {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_CAPACITY,
            poll_timeout: Duration::from_millis(500),
            use_button: true,
            button_holdoff: Duration::from_millis(50),
            dispatch: DispatchLimits::default(),
        }
    }
}

/// Everything the decode task has counted.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EncoderReport {
    pub decoder: DecoderStats,
    pub button_presses: u64,
    pub button_bounces: u64,
    pub dropped_edges: u64,
    pub dispatch: DispatchStats,
}

/// A running encoder pipeline.
pub struct RotaryEncoder<S: EdgeSource> {
    source: S,
    stop: watch::Sender<bool>,
    report: watch::Receiver<EncoderReport>,
    worker: JoinHandle<EncoderReport>,
}

impl<S: EdgeSource> RotaryEncoder<S> {
    /// Sample the encoder, register interrupts and start decoding.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(
        mut source: S,
        settings: EncoderSettings,
        handler: Arc<dyn InputHandler>,
    ) -> Result<Self, GpioError> {
        let level_a = source.read_level(PinId::EncoderA)?;
        let level_b = source.read_level(PinId::EncoderB)?;
        let button = if settings.use_button {
            let level = source.read_level(PinId::Button)?;
            Some(ButtonDebouncer::new(level, settings.button_holdoff))
        } else {
            None
        };

        let (producer, consumer) = edge_queue(settings.queue_capacity);
        let mut lines = vec![
            (PinId::EncoderA, EdgeMode::Both),
            (PinId::EncoderB, EdgeMode::Both),
        ];
        if settings.use_button {
            // Both edges, so the debouncer can tell a release from a bounce
            lines.push((PinId::Button, EdgeMode::Both));
        }
        for (pin, mode) in lines {
            let on_edge = enqueue_on_edge(producer.clone());
            if let Err(e) = source.register_edge_interrupt(pin, mode, on_edge) {
                source.deregister_all();
                return Err(e);
            }
        }
        drop(producer);

        let decoder = QuadratureDecoder::new(level_a, level_b);
        let dispatcher = Dispatcher::start(handler, settings.dispatch);
        let (stop, stop_rx) = watch::channel(false);
        let (report_tx, report) = watch::channel(EncoderReport::default());

        let worker = tokio::spawn(
            DecodeTask {
                consumer,
                decoder,
                button,
                dispatcher,
                report: report_tx,
                last_report: EncoderReport::default(),
            }
            .run(stop_rx, settings.poll_timeout.max(MIN_POLL_TIMEOUT)),
        );

        info!("Encoder setup complete");
        Ok(Self {
            source,
            stop,
            report,
            worker,
        })
    }

    /// Latest counters published by the decode task.
    pub fn report(&self) -> EncoderReport {
        *self.report.borrow()
    }

    /// Deregister interrupts, drain the queue and stop the decode task.
    pub async fn shutdown(self) -> EncoderReport {
        let RotaryEncoder {
            mut source,
            stop,
            report,
            worker,
        } = self;
        source.deregister_all();
        debug!("Edge interrupts deregistered");
        let _ = stop.send(true);
        match worker.await {
            Ok(final_report) => final_report,
            Err(e) => {
                error!("Decode task ended abnormally: {}", e);
                let last = *report.borrow();
                last
            }
        }
    }
}

fn enqueue_on_edge(producer: EdgeProducer) -> EdgeCallback {
    Box::new(move |channel, level| {
        // Full queue: the edge is dropped and counted by the producer
        let _ = producer.enqueue(EdgeEvent { channel, level });
    })
}

/// State owned by the decode task.
struct DecodeTask {
    consumer: EdgeConsumer,
    decoder: QuadratureDecoder,
    button: Option<ButtonDebouncer>,
    dispatcher: Dispatcher,
    report: watch::Sender<EncoderReport>,
    last_report: EncoderReport,
}

impl DecodeTask {
    async fn run(
        mut self,
        mut stop: watch::Receiver<bool>,
        poll_timeout: Duration,
    ) -> EncoderReport {
        loop {
            tokio::select! {
                biased;
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        break;
                    }
                }
                next = self.consumer.dequeue(poll_timeout) => match next {
                    Ok(Some(edge)) => {
                        self.handle(edge);
                        self.publish();
                    }
                    Ok(None) => self.housekeeping(),
                    Err(_closed) => break,
                },
            }
        }

        // Stop accepting edges and decode what already made it in
        self.consumer.close();
        while let Ok(Some(edge)) = self.consumer.dequeue(Duration::ZERO).await {
            self.handle(edge);
        }

        let DecodeTask {
            consumer,
            decoder,
            button,
            dispatcher,
            report,
            ..
        } = self;
        let dispatch = dispatcher.shutdown().await;
        let final_report = EncoderReport {
            decoder: decoder.stats(),
            button_presses: button.as_ref().map_or(0, ButtonDebouncer::presses),
            button_bounces: button.as_ref().map_or(0, ButtonDebouncer::suppressed),
            dropped_edges: consumer.dropped(),
            dispatch,
        };
        report.send_replace(final_report);
        info!(
            "Encoder stopped: {} cw / {} ccw ticks, {} invalid transitions, {} dropped edges",
            final_report.decoder.clockwise_ticks,
            final_report.decoder.counter_clockwise_ticks,
            final_report.decoder.invalid_transitions,
            final_report.dropped_edges
        );
        final_report
    }

    fn handle(&mut self, edge: EdgeEvent) {
        if let (PinId::Button, Some(button)) = (edge.channel, self.button.as_mut()) {
            if let Some(press) = button.apply(edge.level) {
                info!("Button pressed");
                self.dispatcher.dispatch(press);
            }
            return;
        }

        if let Some(direction) = self.decoder.apply(edge) {
            match direction {
                Direction::Clockwise => info!("Incrementing!"),
                Direction::CounterClockwise => info!("Decrementing!"),
            }
            self.dispatcher.dispatch(InputEvent::Tick(direction));
        }
    }

    fn snapshot(&self) -> EncoderReport {
        EncoderReport {
            decoder: self.decoder.stats(),
            button_presses: self.button.as_ref().map_or(0, ButtonDebouncer::presses),
            button_bounces: self.button.as_ref().map_or(0, ButtonDebouncer::suppressed),
            dropped_edges: self.consumer.dropped(),
            dispatch: self.dispatcher.stats(),
        }
    }

    fn publish(&mut self) {
        let snapshot = self.snapshot();
        self.report.send_replace(snapshot);
    }

    fn housekeeping(&mut self) {
        let snapshot = self.snapshot();
        if snapshot.dropped_edges > self.last_report.dropped_edges {
            warn!(
                "Edge queue overflowed, {} edges dropped so far",
                snapshot.dropped_edges
            );
        }
        if snapshot != self.last_report {
            debug!("Encoder stats: {:?}", snapshot);
        }
        self.last_report = snapshot;
        self.report.send_replace(snapshot);
    }
}
