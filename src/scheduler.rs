//! src/scheduler.rs
//!
//! A small timer service that delivers delayed self-messages into an actor's
//! inbox. Every time-based event in the system (gossip tick, Fail/Miss/
//! Cleanup expiry, multicast reminder, experiment stop) goes through here,
//! so timers interleave with network messages at the inbox boundary only.

use std::time::Duration;
use tokio::{sync::mpsc, task::JoinHandle};

/// Schedules events for delivery into a single actor's inbox.
///
/// Cloning is cheap; each actor hands clones to whichever component needs to
/// arm timers on its behalf.
pub struct Scheduler<E> {
    events_tx: mpsc::Sender<E>,
}

impl<E> Clone for Scheduler<E> {
    fn clone(&self) -> Self {
        Self {
            events_tx: self.events_tx.clone(),
        }
    }
}

impl<E: Send + 'static> Scheduler<E> {
    pub fn new(events_tx: mpsc::Sender<E>) -> Self {
        Self { events_tx }
    }

    /// Arms a one-shot timer: after `delay`, `event` is posted to the inbox.
    ///
    /// The returned handle aborts the timer when cancelled or dropped.
    /// Abortion is best-effort; an event already in flight is filtered by
    /// the receiver's token check.
    pub fn schedule(&self, delay: Duration, event: E) -> TimerHandle {
        let events_tx = self.events_tx.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if events_tx.send(event).await.is_err() {
                tracing::trace!("Inbox closed before timer delivery");
            }
        });
        TimerHandle { task }
    }
}

/// Cancellable handle for one scheduled event.
#[derive(Debug)]
pub struct TimerHandle {
    task: JoinHandle<()>,
}

impl TimerHandle {
    pub fn cancel(&self) {
        self.task.abort();
    }
}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}
