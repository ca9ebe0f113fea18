//! Deadline scheduling for the controller link.
//!
//! [`TimerService`] arms one-shot timers that deliver a value into a
//! channel when they expire. The link actor selects on that channel next to
//! its command channel, so timeouts are processed in the same serialized
//! context as every other link event.
//!
//! A fired timer is only acted upon if [`TimerService::acknowledge`] still
//! knows its handle. Cancelling a timer that already fired removes the
//! handle, so a fire that is still queued in the channel is ignored.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Identifies one armed timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerHandle(u64);

/// A timer expiry delivered by the service.
#[derive(Debug)]
pub struct Fired<E> {
    /// Handle returned by [`TimerService::arm`].
    pub handle: TimerHandle,
    /// Value passed to [`TimerService::arm`].
    pub event: E,
}

/// Schedules and cancels one-shot timers.
pub struct TimerService<E> {
    next_handle: u64,
    armed: HashMap<TimerHandle, JoinHandle<()>>,
    fired_tx: mpsc::UnboundedSender<Fired<E>>,
}

impl<E: Send + 'static> TimerService<E> {
    /// Creates a timer service and the receiver its expiries are delivered to.
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Fired<E>>) {
        let (fired_tx, fired_rx) = mpsc::unbounded_channel();
        let service = Self {
            next_handle: 0,
            armed: HashMap::new(),
            fired_tx,
        };
        (service, fired_rx)
    }

    /// Arms a timer that delivers `event` after `duration`.
    pub fn arm(&mut self, duration: Duration, event: E) -> TimerHandle {
        self.next_handle += 1;
        let handle = TimerHandle(self.next_handle);
        let fired_tx = self.fired_tx.clone();

        let task = tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            // Receiver gone means the link shut down
            let _ = fired_tx.send(Fired { handle, event });
        });
        self.armed.insert(handle, task);

        tracing::trace!("armed timer {:?} for {:?}", handle, duration);
        handle
    }

    /// Cancels a timer. Cancelling an unknown or fired timer is a no-op.
    pub fn cancel(&mut self, handle: TimerHandle) {
        if let Some(task) = self.armed.remove(&handle) {
            task.abort();
            tracing::trace!("cancelled timer {:?}", handle);
        }
    }

    /// Consumes a delivered expiry.
    ///
    /// Returns `true` if the timer was still armed, `false` if it was
    /// cancelled after it fired and the expiry must be ignored.
    pub fn acknowledge(&mut self, handle: TimerHandle) -> bool {
        self.armed.remove(&handle).is_some()
    }

    /// Cancels every armed timer.
    pub fn cancel_all(&mut self) {
        for (_, task) in self.armed.drain() {
            task.abort();
        }
    }

    /// Returns the number of armed timers.
    #[must_use]
    pub fn armed(&self) -> usize {
        self.armed.len()
    }
}

impl<E> Drop for TimerService<E> {
    fn drop(&mut self) {
        for (_, task) in self.armed.drain() {
            task.abort();
        }
    }
}
