//! Sliding-window frame rate limiter, one instance per transport.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Tracks frame arrival timestamps over a rolling window.
///
/// The limit is advisory: the caller decides what to do when `allow`
/// returns `false` (the broker closes the transport with code 1013).
#[derive(Debug)]
pub struct RateWindow {
    max_frames: u32,
    window: Duration,
    stamps: VecDeque<Instant>,
}

impl RateWindow {
    pub fn new(max_frames: u32, window: Duration) -> Self {
        Self {
            max_frames,
            window,
            stamps: VecDeque::new(),
        }
    }

    /// Record an arrival at `now`; returns `false` when the window already
    /// holds `max_frames` arrivals.
    pub fn allow_at(&mut self, now: Instant) -> bool {
        let cutoff = now - self.window;
        while self.stamps.front().is_some_and(|t| *t <= cutoff) {
            self.stamps.pop_front();
        }
        if self.stamps.len() as u32 >= self.max_frames {
            return false;
        }
        self.stamps.push_back(now);
        true
    }

    /// Record an arrival now.
    pub fn allow(&mut self) -> bool {
        self.allow_at(Instant::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn burst_up_to_limit_allowed() {
        let mut window = RateWindow::new(20, Duration::from_secs(1));
        let now = Instant::now();
        for _ in 0..20 {
            assert!(window.allow_at(now));
        }
        assert!(!window.allow_at(now));
    }

    #[test]
    fn window_slides() {
        let mut window = RateWindow::new(2, Duration::from_secs(1));
        let start = Instant::now();
        assert!(window.allow_at(start));
        assert!(window.allow_at(start));
        assert!(!window.allow_at(start + Duration::from_millis(500)));
        // Both stamps age out after the window passes.
        assert!(window.allow_at(start + Duration::from_millis(1500)));
    }
}
