//! Consecutive ping-failure tracking for one connection.

/// Default number of consecutive failures before session state is reset.
pub const DEFAULT_PING_THRESHOLD: u32 = 3;

/// Counts consecutive keepalive failures for a single connection.
///
/// Knows nothing about transports or reconnection; the aggregator decides
/// what a threshold crossing means. A success at any point zeroes the
/// count.
#[derive(Debug)]
pub struct PingFailureTracker {
    consecutive: u32,
    threshold: u32,
}

impl Default for PingFailureTracker {
    fn default() -> Self {
        Self::new(DEFAULT_PING_THRESHOLD)
    }
}

impl PingFailureTracker {
    pub fn new(threshold: u32) -> Self {
        Self {
            consecutive: 0,
            threshold: threshold.max(1),
        }
    }

    /// Record one failed ping. Returns the count that was reached and
    /// whether it hit the threshold. Hitting the threshold zeroes the
    /// count, so the next crossing needs a full run of failures again.
    pub fn record_failure(&mut self) -> (u32, bool) {
        self.consecutive = self.consecutive.saturating_add(1);
        let reached = self.consecutive;
        let hit_threshold = reached >= self.threshold;
        if hit_threshold {
            self.consecutive = 0;
        }
        (reached, hit_threshold)
    }

    /// Record a successful ping (or any successful call), zeroing the count.
    pub fn record_success(&mut self) {
        self.consecutive = 0;
    }

    pub fn reset(&mut self) {
        self.consecutive = 0;
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_threshold_reached_after_exact_count() {
        let mut tracker = PingFailureTracker::new(3);
        assert_eq!(tracker.record_failure(), (1, false));
        assert_eq!(tracker.record_failure(), (2, false));
        assert_eq!(tracker.record_failure(), (3, true));
    }

    #[test]
    fn test_threshold_resets_the_count() {
        let mut tracker = PingFailureTracker::new(3);
        tracker.record_failure();
        tracker.record_failure();
        assert_eq!(tracker.record_failure(), (3, true));
        assert_eq!(tracker.consecutive_failures(), 0);
        // The next crossing needs three fresh failures, not one.
        assert_eq!(tracker.record_failure(), (1, false));
        assert_eq!(tracker.record_failure(), (2, false));
        assert_eq!(tracker.record_failure(), (3, true));
    }

    #[test]
    fn test_success_resets_count() {
        let mut tracker = PingFailureTracker::new(3);
        tracker.record_failure();
        tracker.record_failure();
        tracker.record_success();
        assert_eq!(tracker.consecutive_failures(), 0);
        assert_eq!(tracker.record_failure(), (1, false));
    }

    #[test]
    fn test_default_threshold() {
        let tracker = PingFailureTracker::default();
        assert_eq!(tracker.threshold(), DEFAULT_PING_THRESHOLD);
    }

    #[test]
    fn test_zero_threshold_clamped() {
        let mut tracker = PingFailureTracker::new(0);
        // A zero threshold would fire before any failure; clamp to one.
        assert_eq!(tracker.record_failure(), (1, true));
    }
}
