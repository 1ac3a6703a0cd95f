//! Time-bounded suppression of repeated remote events
//!
//! Fingerprints are derived from the event payload, never from the sending
//! peer, so the same request relayed by two responders is delivered once.
//! Stale entries are pruned on every insertion attempt.

use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

/// Default suppression window (3 minutes)
pub const DEFAULT_DEDUPE_TTL: Duration = Duration::from_secs(180);

#[derive(Debug, Clone)]
pub struct DedupeWindow {
    ttl: Duration,
    seen: HashMap<String, Instant>,
}

impl DedupeWindow {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            seen: HashMap::new(),
        }
    }

    /// Record `fingerprint` at `now`.
    ///
    /// Returns `true` when the event should propagate, `false` when a
    /// matching fingerprint was seen less than one TTL ago.
    pub fn admit(&mut self, fingerprint: &str, now: Instant) -> bool {
        self.prune(now);

        if self.seen.contains_key(fingerprint) {
            return false;
        }
        self.seen.insert(fingerprint.to_string(), now);
        true
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    fn prune(&mut self, now: Instant) {
        let ttl = self.ttl;
        self.seen
            .retain(|_, seen_at| now.saturating_duration_since(*seen_at) < ttl);
    }
}

impl Default for DedupeWindow {
    fn default() -> Self {
        Self::new(DEFAULT_DEDUPE_TTL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_first_event_propagates() {
        let mut window = DedupeWindow::default();
        assert!(window.admit("need water", Instant::now()));
        assert_eq!(window.len(), 1);
    }

    #[test]
    fn test_repeat_within_ttl_suppressed() {
        let mut window = DedupeWindow::default();
        let t0 = Instant::now();

        assert!(window.admit("need water", t0));
        assert!(!window.admit("need water", t0 + Duration::from_secs(60)));
        assert!(!window.admit("need water", t0 + Duration::from_secs(179)));
    }

    #[test]
    fn test_repeat_after_ttl_propagates() {
        let mut window = DedupeWindow::default();
        let t0 = Instant::now();

        assert!(window.admit("need water", t0));
        assert!(window.admit("need water", t0 + DEFAULT_DEDUPE_TTL));
    }

    #[test]
    fn test_suppression_does_not_refresh_timestamp() {
        let mut window = DedupeWindow::new(Duration::from_secs(10));
        let t0 = Instant::now();

        assert!(window.admit("x", t0));
        assert!(!window.admit("x", t0 + Duration::from_secs(9)));
        // Window measured from first sighting, not from the suppressed repeat
        assert!(window.admit("x", t0 + Duration::from_secs(10)));
    }

    #[test]
    fn test_distinct_fingerprints_independent() {
        let mut window = DedupeWindow::default();
        let t0 = Instant::now();

        assert!(window.admit("a", t0));
        assert!(window.admit("b", t0));
        assert_eq!(window.len(), 2);
    }

    #[test]
    fn test_insertion_prunes_stale_entries() {
        let mut window = DedupeWindow::new(Duration::from_secs(5));
        let t0 = Instant::now();

        window.admit("old-1", t0);
        window.admit("old-2", t0);
        window.admit("fresh", t0 + Duration::from_secs(6));

        assert_eq!(window.len(), 1);
        assert!(window.admit("old-1", t0 + Duration::from_secs(6)));
    }

    proptest! {
        #[test]
        fn prop_dedupe_respects_ttl(
            fingerprint in "[a-z ]{1,24}",
            ttl_secs in 1u64..600,
            gap_ms in 0u64..1_200_000,
        ) {
            let ttl = Duration::from_secs(ttl_secs);
            let gap = Duration::from_millis(gap_ms);
            let mut window = DedupeWindow::new(ttl);
            let t1 = Instant::now();

            prop_assert!(window.admit(&fingerprint, t1));
            let second = window.admit(&fingerprint, t1 + gap);
            prop_assert_eq!(second, gap >= ttl);
        }
    }
}
