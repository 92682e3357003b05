//! Background producer threads.
//!
//! Every thread that feeds the tick loop (audio capture, the overlay
//! listener, the clock peer protocol) runs inside a [`Worker`]. The tick
//! loop never calls into a worker; it only asks it to stop and waits a
//! bounded amount of time for it to exit.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};

use tracing::{debug, warn};

use crate::Result;

const STOP_POLL: Duration = Duration::from_millis(5);

/// Cooperative cancellation flag shared between a worker and its owner.
#[derive(Debug, Clone, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    /// Creates a signal that has not been raised.
    pub fn new() -> Self {
        Self::default()
    }

    /// Raises the signal. Every clone observes it.
    pub fn stop(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// Sleeps for `duration` unless stopped first. Returns `false` when the
    /// sleep was cut short by a stop request.
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if self.is_stopped() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            thread::sleep((deadline - now).min(STOP_POLL));
        }
    }
}

/// Named background thread with a stop flag.
///
/// Dropping a worker requests a stop but does not wait for it.
#[derive(Debug)]
pub struct Worker {
    name: String,
    stop: StopSignal,
    handle: Option<thread::JoinHandle<()>>,
}

impl Worker {
    /// Spawns `body` on a named thread, handing it the worker's stop signal.
    pub fn spawn<F>(name: impl Into<String>, body: F) -> Result<Self>
    where
        F: FnOnce(StopSignal) + Send + 'static,
    {
        let name = name.into();
        let stop = StopSignal::new();
        let signal = stop.clone();
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || body(signal))?;

        debug!(worker = %name, "worker started");
        Ok(Self {
            name,
            stop,
            handle: Some(handle),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Raises the stop signal without waiting.
    pub fn request_stop(&self) {
        self.stop.stop();
    }

    pub fn is_finished(&self) -> bool {
        self.handle
            .as_ref()
            .map(|handle| handle.is_finished())
            .unwrap_or(true)
    }

    /// Requests a stop and waits up to `timeout` for the thread to exit.
    /// Returns `true` when the thread was joined.
    pub fn stop_and_join(mut self, timeout: Duration) -> bool {
        self.request_stop();
        let deadline = Instant::now() + timeout;
        while !self.is_finished() {
            if Instant::now() >= deadline {
                warn!(worker = %self.name, ?timeout, "worker did not stop in time, detaching");
                return false;
            }
            thread::sleep(STOP_POLL);
        }

        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!(worker = %self.name, "worker panicked");
            }
        }
        debug!(worker = %self.name, "worker stopped");
        true
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.stop.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stops_cooperative_worker() {
        let worker = Worker::spawn("test-loop", |stop| while stop.sleep(Duration::from_millis(1)) {})
            .unwrap();

        assert!(!worker.is_finished());
        assert!(worker.stop_and_join(Duration::from_secs(2)));
    }

    #[test]
    fn gives_up_on_stuck_worker() {
        let worker = Worker::spawn("stuck", |_| thread::sleep(Duration::from_millis(300))).unwrap();
        assert!(!worker.stop_and_join(Duration::from_millis(20)));
    }

    #[test]
    fn sleep_is_cut_short_by_stop() {
        let stop = StopSignal::new();
        stop.stop();
        assert!(!stop.sleep(Duration::from_secs(10)));
    }
}
