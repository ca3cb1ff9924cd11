//! Process-wide run state and the request gate.
//!
//! [`RunState`] is shared by the serving layer, which stamps request
//! activity through [`RunState::enter`], and by the supervisor, which flips
//! the run flag once on shutdown and polls activity while draining.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;

/// Run flag plus request activity.
#[derive(Debug)]
pub struct RunState {
    running: AtomicBool,
    stopping: watch::Sender<bool>,
    base: Instant,
    /// Milliseconds since `base` of the latest request activity, plus one.
    /// Zero means no request has been seen yet.
    last_request: AtomicU64,
    in_flight: AtomicUsize,
}

impl Default for RunState {
    fn default() -> Self {
        Self::new()
    }
}

impl RunState {
    pub fn new() -> Self {
        let (stopping, _) = watch::channel(false);
        Self {
            running: AtomicBool::new(true),
            stopping,
            base: Instant::now(),
            last_request: AtomicU64::new(0),
            in_flight: AtomicUsize::new(0),
        }
    }

    /// Whether the node is still accepting work.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Flip the run flag to `false`.
    ///
    /// Returns `true` only for the call that performed the transition.
    pub fn begin_shutdown(&self) -> bool {
        let flipped = self
            .running
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if flipped {
            self.stopping.send_replace(true);
        }
        flipped
    }

    /// Receiver that turns `true` once shutdown has begun.
    pub fn stopping(&self) -> watch::Receiver<bool> {
        self.stopping.subscribe()
    }

    /// Register a client request.
    ///
    /// The returned guard keeps the request counted as in flight until it
    /// is dropped. Entry and exit both stamp the last-request time.
    pub fn enter(&self) -> RequestGuard<'_> {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        self.stamp();
        RequestGuard { state: self }
    }

    /// Number of requests currently being served.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Time since the last request activity, or `None` if there was none.
    pub fn since_last_request(&self) -> Option<Duration> {
        let stamp = self.last_request.load(Ordering::Acquire);
        if stamp == 0 {
            return None;
        }
        let last = self.base + Duration::from_millis(stamp - 1);
        Some(Instant::now().saturating_duration_since(last))
    }

    /// Whether no request is in flight and none was seen within `window`.
    pub fn is_quiet(&self, window: Duration) -> bool {
        self.in_flight() == 0 && self.since_last_request().is_none_or(|since| since >= window)
    }

    fn stamp(&self) {
        let millis = u64::try_from(self.base.elapsed().as_millis()).unwrap_or(u64::MAX - 1);
        self.last_request.fetch_max(millis + 1, Ordering::AcqRel);
    }
}

/// In-flight marker returned by [`RunState::enter`].
#[derive(Debug)]
pub struct RequestGuard<'a> {
    state: &'a RunState,
}

impl Drop for RequestGuard<'_> {
    fn drop(&mut self) {
        self.state.stamp();
        self.state.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}
