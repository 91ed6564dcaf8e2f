//! Bounded exponential backoff with optional jitter.
//!
//! Used by the discovery watch loop (reset on every successful event) and by
//! the slot-allocation retry in the registry publisher.

use rand::Rng;
use std::time::Duration;

/// Exponential backoff controller.
///
/// Starts at `initial`, doubles up to `cap`, and optionally spreads each
/// delay uniformly over `[delay/2, delay]` to avoid thundering herds.
#[derive(Debug)]
pub struct Backoff {
    initial: Duration,
    cap: Duration,
    current: Duration,
    jitter: bool,
}

impl Backoff {
    pub fn new(initial: Duration, cap: Duration) -> Self {
        Self {
            initial,
            cap,
            current: initial,
            jitter: false,
        }
    }

    pub fn with_jitter(mut self) -> Self {
        self.jitter = true;
        self
    }

    /// Next delay to sleep for, advancing the controller.
    pub fn next_delay(&mut self) -> Duration {
        let base = self.current;
        self.current = (self.current * 2).min(self.cap);
        if self.jitter {
            let half = base / 2;
            half + rand::thread_rng().gen_range(Duration::ZERO..=half)
        } else {
            base
        }
    }

    /// Sleep for the next delay.
    pub async fn wait(&mut self) {
        tokio::time::sleep(self.next_delay()).await;
    }

    /// Reset to the initial delay after a success.
    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_up_to_cap() {
        let mut b = Backoff::new(Duration::from_millis(10), Duration::from_millis(50));
        assert_eq!(b.next_delay(), Duration::from_millis(10));
        assert_eq!(b.next_delay(), Duration::from_millis(20));
        assert_eq!(b.next_delay(), Duration::from_millis(40));
        assert_eq!(b.next_delay(), Duration::from_millis(50));
        assert_eq!(b.next_delay(), Duration::from_millis(50));
    }

    #[test]
    fn reset_restores_initial() {
        let mut b = Backoff::new(Duration::from_millis(10), Duration::from_secs(5));
        b.next_delay();
        b.next_delay();
        b.reset();
        assert_eq!(b.next_delay(), Duration::from_millis(10));
    }

    #[test]
    fn jitter_stays_within_half_window() {
        let mut b =
            Backoff::new(Duration::from_millis(100), Duration::from_secs(5)).with_jitter();
        for _ in 0..32 {
            let d = b.next_delay();
            assert!(d >= Duration::from_millis(50));
            assert!(d <= Duration::from_millis(2_500));
        }
    }
}
