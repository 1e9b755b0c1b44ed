use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Frame arrivals in the trailing window; the count is the frame rate.
#[derive(Debug)]
pub struct FrameRateWindow {
    arrivals: VecDeque<Instant>,
    window: Duration,
}

impl Default for FrameRateWindow {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}

impl FrameRateWindow {
    pub fn new(window: Duration) -> Self {
        Self {
            arrivals: VecDeque::new(),
            window,
        }
    }

    pub fn record(&mut self, at: Instant) {
        self.arrivals.push_back(at);
        self.expire(at);
    }

    /// Frames per second as of `now`.
    pub fn rate(&mut self, now: Instant) -> f64 {
        self.expire(now);
        self.arrivals.len() as f64 / self.window.as_secs_f64()
    }

    fn expire(&mut self, now: Instant) {
        while let Some(first) = self.arrivals.front() {
            if now.saturating_duration_since(*first) > self.window {
                self.arrivals.pop_front();
            } else {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_frames_in_trailing_second() {
        let start = Instant::now();
        let mut w = FrameRateWindow::default();
        for i in 0..30 {
            w.record(start + Duration::from_millis(i * 33));
        }
        let now = start + Duration::from_millis(990);
        assert_eq!(w.rate(now), 30.0);

        // Half a second later only the second half remains.
        let later = start + Duration::from_millis(1500);
        let remaining = w.rate(later);
        assert!(remaining < 30.0 && remaining > 10.0, "rate {}", remaining);

        assert_eq!(w.rate(start + Duration::from_secs(5)), 0.0);
    }
}
