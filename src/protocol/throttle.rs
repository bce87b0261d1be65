//! Log line coalescing
//!
//! Under sustained hardware failure the same message would otherwise be
//! logged on every poll. `LogThrottle::record` is pure with respect to time:
//! the caller passes `now`, which keeps it testable without a clock.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::constants::firmware::LOG_THROTTLE_WINDOW;

/// Distinct messages tracked before expired entries are purged
const MAX_TRACKED: usize = 64;

#[derive(Debug, Clone, Copy)]
struct Entry {
    window_start: Instant,
    suppressed: u32,
}

#[derive(Debug)]
pub struct LogThrottle {
    window: Duration,
    entries: HashMap<String, Entry>,
}

impl Default for LogThrottle {
    fn default() -> Self {
        Self::new(LOG_THROTTLE_WINDOW)
    }
}

impl LogThrottle {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            entries: HashMap::new(),
        }
    }

    /// Returns the line to log, or `None` while the message is suppressed
    ///
    /// The first occurrence is returned as-is. Repeats inside the window are
    /// counted; the first occurrence after the window closes carries the
    /// repeat count.
    pub fn record(&mut self, message: &str, now: Instant) -> Option<String> {
        if let Some(entry) = self.entries.get_mut(message) {
            if now.saturating_duration_since(entry.window_start) < self.window {
                entry.suppressed += 1;
                return None;
            }
            let suppressed = entry.suppressed;
            *entry = Entry {
                window_start: now,
                suppressed: 0,
            };
            return Some(if suppressed > 0 {
                format!(
                    "{} (repeated {} times in the last {}s)",
                    message,
                    suppressed,
                    self.window.as_secs()
                )
            } else {
                message.to_string()
            });
        }

        if self.entries.len() >= MAX_TRACKED {
            let window = self.window;
            self.entries
                .retain(|_, e| now.saturating_duration_since(e.window_start) < window);
        }
        self.entries.insert(
            message.to_string(),
            Entry {
                window_start: now,
                suppressed: 0,
            },
        );
        Some(message.to_string())
    }

    /// Number of occurrences suppressed so far in the current window
    pub fn suppressed(&self, message: &str) -> u32 {
        self.entries.get(message).map_or(0, |e| e.suppressed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_occurrence_passes() {
        let mut throttle = LogThrottle::default();
        let now = Instant::now();
        assert_eq!(throttle.record("WMI failed", now).as_deref(), Some("WMI failed"));
    }

    #[test]
    fn test_repeats_within_window_are_coalesced() {
        let mut throttle = LogThrottle::new(Duration::from_secs(30));
        let start = Instant::now();
        assert!(throttle.record("WMI failed", start).is_some());
        for i in 1..=5 {
            assert!(throttle.record("WMI failed", start + Duration::from_secs(i)).is_none());
        }
        assert_eq!(throttle.suppressed("WMI failed"), 5);

        let line = throttle
            .record("WMI failed", start + Duration::from_secs(31))
            .unwrap();
        assert_eq!(line, "WMI failed (repeated 5 times in the last 30s)");
        assert_eq!(throttle.suppressed("WMI failed"), 0);
    }

    #[test]
    fn test_distinct_messages_are_independent() {
        let mut throttle = LogThrottle::default();
        let now = Instant::now();
        assert!(throttle.record("a", now).is_some());
        assert!(throttle.record("b", now).is_some());
        assert!(throttle.record("a", now).is_none());
    }

    #[test]
    fn test_same_input_same_output() {
        let start = Instant::now();
        let mut a = LogThrottle::default();
        let mut b = LogThrottle::default();
        for i in 0..4 {
            let t = start + Duration::from_secs(i * 20);
            assert_eq!(a.record("x", t), b.record("x", t));
        }
    }
}
