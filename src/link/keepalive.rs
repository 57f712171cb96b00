//! Keepalive timers for the physical link.
//!
//! Two single-shot deadlines: an idle timer that fires a `ping` after
//! `interval` without inbound traffic, and a timeout armed by that ping.
//! Any inbound frame disarms the timeout and restarts the idle timer.

use std::time::{Duration, Instant};

/// Default time to wait for any frame after a ping.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(1000);

/// What the link must do after polling the timers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepAliveAction {
    /// Idle interval elapsed; send `{"command":"ping"}`.
    SendPing,
    /// Nothing arrived within the timeout; force a disconnect.
    TimedOut,
}

/// Deadline-based ping/timeout state.
#[derive(Debug, Clone)]
pub struct KeepAlive {
    interval: Duration,
    timeout: Duration,
    ping_at: Option<Instant>,
    deadline: Option<Instant>,
}

impl KeepAlive {
    /// Create stopped timers.
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self {
            interval,
            timeout,
            ping_at: None,
            deadline: None,
        }
    }

    /// Idle interval.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Ping timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Arm the idle timer.
    pub fn start(&mut self, now: Instant) {
        self.ping_at = Some(now + self.interval);
        self.deadline = None;
    }

    /// Disarm both timers.
    pub fn stop(&mut self) {
        self.ping_at = None;
        self.deadline = None;
    }

    /// An inbound frame arrived.
    pub fn on_frame(&mut self, now: Instant) {
        self.start(now);
    }

    /// Fire whichever timer has expired.
    pub fn poll(&mut self, now: Instant) -> Option<KeepAliveAction> {
        if let Some(deadline) = self.deadline {
            if now >= deadline {
                self.stop();
                return Some(KeepAliveAction::TimedOut);
            }
        }
        if let Some(ping_at) = self.ping_at {
            if now >= ping_at {
                self.ping_at = None;
                self.deadline = Some(now + self.timeout);
                return Some(KeepAliveAction::SendPing);
            }
        }
        None
    }

    /// Earliest armed deadline.
    pub fn next_deadline(&self) -> Option<Instant> {
        match (self.ping_at, self.deadline) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const INTERVAL: Duration = Duration::from_millis(100);
    const TIMEOUT: Duration = Duration::from_millis(50);

    #[test]
    fn test_stopped_timers_never_fire() {
        let mut ka = KeepAlive::new(INTERVAL, TIMEOUT);
        let now = Instant::now();
        assert_eq!(ka.poll(now + Duration::from_secs(10)), None);
        assert_eq!(ka.next_deadline(), None);
    }

    #[test]
    fn test_ping_then_timeout() {
        let mut ka = KeepAlive::new(INTERVAL, TIMEOUT);
        let t0 = Instant::now();
        ka.start(t0);
        assert_eq!(ka.next_deadline(), Some(t0 + INTERVAL));

        assert_eq!(ka.poll(t0 + Duration::from_millis(99)), None);
        assert_eq!(ka.poll(t0 + INTERVAL), Some(KeepAliveAction::SendPing));
        assert_eq!(ka.next_deadline(), Some(t0 + INTERVAL + TIMEOUT));

        assert_eq!(ka.poll(t0 + INTERVAL + TIMEOUT), Some(KeepAliveAction::TimedOut));
        // Fires exactly once
        assert_eq!(ka.poll(t0 + Duration::from_secs(10)), None);
    }

    #[test]
    fn test_frame_cancels_timeout_and_restarts_idle() {
        let mut ka = KeepAlive::new(INTERVAL, TIMEOUT);
        let t0 = Instant::now();
        ka.start(t0);
        assert_eq!(ka.poll(t0 + INTERVAL), Some(KeepAliveAction::SendPing));

        let t1 = t0 + INTERVAL + Duration::from_millis(10);
        ka.on_frame(t1);
        assert_eq!(ka.poll(t0 + INTERVAL + TIMEOUT), None);
        assert_eq!(ka.next_deadline(), Some(t1 + INTERVAL));
    }
}
