//! # Callback Dispatcher
//!
//! Runs user callbacks for ticks and presses away from the decode loop.
//!
//! Every event is split into independent invocations (a clockwise tick calls
//! both [`InputHandler::increment`] and [`InputHandler::on_change`]) which are
//! pushed into a bounded queue. A fixed pool of worker tasks drains the queue
//! and runs each invocation on tokio's blocking pool, so handlers are free to
//! take locks or sleep.
//!
//! ## Guarantees
//! - [`Dispatcher::dispatch`] never blocks; when the queue is full the
//!   invocation is dropped and counted
//! - a panicking handler is caught, logged and counted; the worker carries on
//! - invocations may run concurrently and in any order relative to each other
//! - nothing is cancelled once queued, except by shutdown closing the queue

use crate::{Direction, InputEvent};
use log::{debug, error, warn};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

/// Callbacks invoked for decoded input. All default to doing nothing.
///
/// Implementations are shared between worker tasks and must tolerate being
/// called concurrently.
pub trait InputHandler: Send + Sync + 'static {
    /// One clockwise tick
    fn increment(&self) {}

    /// One counter-clockwise tick
    fn decrement(&self) {}

    /// Any tick, with its direction
    fn on_change(&self, _direction: Direction) {}

    /// A debounced button press
    fn on_button_press(&self) {}
}

/// One unit of callback work.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Invocation {
    Increment,
    Decrement,
    Change(Direction),
    ButtonPress,
}

impl Invocation {
    /// Split an input event into the invocations it triggers.
    pub fn for_event(event: InputEvent) -> &'static [Invocation] {
        match event {
            InputEvent::Tick(Direction::Clockwise) => {
                &[Invocation::Increment, Invocation::Change(Direction::Clockwise)]
            }
            InputEvent::Tick(Direction::CounterClockwise) => &[
                Invocation::Decrement,
                Invocation::Change(Direction::CounterClockwise),
            ],
            InputEvent::Press => &[Invocation::ButtonPress],
        }
    }

    fn run(self, handler: &dyn InputHandler) {
        match self {
            Invocation::Increment => handler.increment(),
            Invocation::Decrement => handler.decrement(),
            Invocation::Change(direction) => handler.on_change(direction),
            Invocation::ButtonPress => handler.on_button_press(),
        }
    }
}

/// Sizing for the dispatcher's queue and worker pool.
#[derive(Clone, Copy, Debug)]
pub struct DispatchLimits {
    /// Number of worker tasks running invocations
    pub workers: usize,
    /// Invocations that may wait for a worker
    pub queue_capacity: usize,
}

impl Default for DispatchLimits {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_capacity: 64,
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    completed: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
}

/// Snapshot of dispatcher activity.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub completed: u64,
    pub failed: u64,
    pub dropped: u64,
}

/// Bounded worker pool for input callbacks.
pub struct Dispatcher {
    tx: mpsc::Sender<Invocation>,
    workers: Vec<JoinHandle<()>>,
    counters: Arc<Counters>,
}

impl Dispatcher {
    /// Start the worker pool on the current tokio runtime.
    pub fn start(handler: Arc<dyn InputHandler>, limits: DispatchLimits) -> Self {
        let (tx, rx) = mpsc::channel(limits.queue_capacity.max(1));
        let rx = Arc::new(Mutex::new(rx));
        let counters = Arc::new(Counters::default());

        let workers = (0..limits.workers.max(1))
            .map(|id| {
                let rx = Arc::clone(&rx);
                let handler = Arc::clone(&handler);
                let counters = Arc::clone(&counters);
                tokio::spawn(worker_loop(id, rx, handler, counters))
            })
            .collect();

        Self {
            tx,
            workers,
            counters,
        }
    }

    /// Queue the callbacks for `event` without waiting.
    pub fn dispatch(&self, event: InputEvent) {
        for &invocation in Invocation::for_event(event) {
            if self.tx.try_send(invocation).is_err() {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                warn!("Dispatch queue full, dropping {:?}", invocation);
            }
        }
    }

    pub fn stats(&self) -> DispatchStats {
        DispatchStats {
            completed: self.counters.completed.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
        }
    }

    /// Stop accepting work, let queued invocations finish, join the workers.
    pub async fn shutdown(self) -> DispatchStats {
        let Dispatcher {
            tx,
            workers,
            counters,
        } = self;
        drop(tx);
        for worker in workers {
            if let Err(e) = worker.await {
                error!("Dispatch worker ended abnormally: {}", e);
            }
        }
        DispatchStats {
            completed: counters.completed.load(Ordering::Relaxed),
            failed: counters.failed.load(Ordering::Relaxed),
            dropped: counters.dropped.load(Ordering::Relaxed),
        }
    }
}

async fn worker_loop(
    id: usize,
    rx: Arc<Mutex<mpsc::Receiver<Invocation>>>,
    handler: Arc<dyn InputHandler>,
    counters: Arc<Counters>,
) {
    loop {
        // Hold the receiver lock only while waiting, never while running
        let next = rx.lock().await.recv().await;
        let Some(invocation) = next else {
            debug!("Dispatch worker {} exiting", id);
            return;
        };

        let handler = Arc::clone(&handler);
        let result = tokio::task::spawn_blocking(move || invocation.run(handler.as_ref())).await;
        match result {
            Ok(()) => {
                counters.completed.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                counters.failed.fetch_add(1, Ordering::Relaxed);
                error!("Callback {:?} failed: {}", invocation, e);
            }
        }
    }
}
