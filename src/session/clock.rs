use std::cmp::Ordering;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::core::time::{millis, wall_elapsed, Moment};
use crate::schemas::wire::AnchorMessage;

/// Server-issued `(timestamp, remaining)` pair pinned to the local monotonic
/// clock at the moment it was received.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ClockAnchor {
    pub(crate) server_timestamp: OffsetDateTime,
    pub(crate) remaining_seconds: u64,
    pub(crate) received_at: Instant,
    pub(crate) received_wall: OffsetDateTime,
    /// False for anchors extrapolated from the local cache after a reload.
    pub(crate) authoritative: bool,
}

impl ClockAnchor {
    pub(crate) fn from_message(message: &AnchorMessage, now: Moment) -> Self {
        Self {
            server_timestamp: message.server_timestamp,
            remaining_seconds: u64::try_from(message.remaining_seconds).unwrap_or(0),
            received_at: now.mono,
            received_wall: now.wall,
            authoritative: true,
        }
    }

    /// Rebuilds a provisional anchor from a persisted one, charging the wall
    /// time spent away against the remaining budget.
    pub(crate) fn extrapolated(stored: &StoredAnchor, now: Moment) -> Self {
        let away = wall_elapsed(stored.received_wall, now.wall).as_secs();
        Self {
            server_timestamp: stored.server_timestamp,
            remaining_seconds: stored.remaining_seconds.saturating_sub(away),
            received_at: now.mono,
            received_wall: now.wall,
            authoritative: false,
        }
    }

    /// Persistable form, re-based to `now` so the cached figure is current.
    pub(crate) fn to_stored(&self, now: Moment) -> StoredAnchor {
        let elapsed = now.mono.saturating_duration_since(self.received_at).as_secs();
        StoredAnchor {
            server_timestamp: self.server_timestamp,
            remaining_seconds: self.remaining_seconds.saturating_sub(elapsed),
            received_wall: now.wall,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct StoredAnchor {
    #[serde(with = "time::serde::rfc3339")]
    pub(crate) server_timestamp: OffsetDateTime,
    pub(crate) remaining_seconds: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub(crate) received_wall: OffsetDateTime,
}

/// Remaining time as a pure function of the latest anchor and local elapsed
/// monotonic time. Never touches session state.
#[derive(Debug, Clone, Default)]
pub(crate) struct SessionClock {
    anchor: Option<ClockAnchor>,
    zero_reported: bool,
}

impl SessionClock {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn anchor(&self) -> Option<&ClockAnchor> {
        self.anchor.as_ref()
    }

    /// Applies `anchor` if it supersedes the current one and reports whether it did.
    ///
    /// Anchors are snapshots: the newest server timestamp wins regardless of
    /// arrival order, ties keep the smaller remaining budget, and a provisional
    /// anchor never displaces an authoritative one.
    pub(crate) fn apply(&mut self, anchor: ClockAnchor) -> bool {
        if let Some(current) = &self.anchor {
            match (current.authoritative, anchor.authoritative) {
                (true, false) => return false,
                (false, true) => {}
                _ => match anchor.server_timestamp.cmp(&current.server_timestamp) {
                    Ordering::Less => return false,
                    Ordering::Equal if anchor.remaining_seconds >= current.remaining_seconds => {
                        return false
                    }
                    _ => {}
                },
            }
        }

        if anchor.remaining_seconds > 0 {
            self.zero_reported = false;
        }
        self.anchor = Some(anchor);
        true
    }

    pub(crate) fn remaining_millis(&self, now: Instant) -> Option<u64> {
        let anchor = self.anchor.as_ref()?;
        let elapsed = millis(now.saturating_duration_since(anchor.received_at));
        Some(anchor.remaining_seconds.saturating_mul(1000).saturating_sub(elapsed))
    }

    /// Whole seconds left, rounded up so the display reaches zero only when
    /// the budget is actually spent.
    pub(crate) fn remaining_seconds(&self, now: Instant) -> Option<u64> {
        self.remaining_millis(now).map(|remaining| remaining.div_ceil(1000))
    }

    /// Fires once, the first time the countdown reaches zero after an anchor
    /// that still had time on it.
    pub(crate) fn poll_zero_crossing(&mut self, now: Instant) -> bool {
        if self.zero_reported || self.remaining_millis(now) != Some(0) {
            return false;
        }
        self.zero_reported = true;
        true
    }

    /// The local countdown is only trusted to end the session when the latest
    /// anchor is authoritative and recent enough to rule out a suspended tab.
    pub(crate) fn corroborates_expiry(&self, now: Instant, max_age: Duration) -> bool {
        let Some(anchor) = self.anchor.as_ref() else {
            return false;
        };
        anchor.authoritative
            && now.saturating_duration_since(anchor.received_at) <= max_age
            && self.remaining_millis(now) == Some(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn anchor(at: Instant, server_secs: i64, remaining: u64) -> ClockAnchor {
        ClockAnchor {
            server_timestamp: datetime!(2025-03-01 09:00 UTC) + time::Duration::seconds(server_secs),
            remaining_seconds: remaining,
            received_at: at,
            received_wall: datetime!(2025-03-01 09:00 UTC),
            authoritative: true,
        }
    }

    #[test]
    fn remaining_counts_down_and_never_goes_negative() {
        let t0 = Instant::now();
        let mut clock = SessionClock::new();
        assert_eq!(clock.remaining_seconds(t0), None);

        clock.apply(anchor(t0, 0, 10));
        assert_eq!(clock.remaining_seconds(t0), Some(10));
        assert_eq!(clock.remaining_seconds(t0 + Duration::from_millis(1500)), Some(9));
        assert_eq!(clock.remaining_seconds(t0 + Duration::from_secs(10)), Some(0));
        assert_eq!(clock.remaining_seconds(t0 + Duration::from_secs(3600)), Some(0));
    }

    #[test]
    fn remaining_is_non_increasing_between_anchors() {
        let t0 = Instant::now();
        let mut clock = SessionClock::new();
        clock.apply(anchor(t0, 0, 30));

        let mut previous = u64::MAX;
        for step in 0..200 {
            let now = t0 + Duration::from_millis(step * 173);
            let current = clock.remaining_seconds(now).expect("anchored");
            assert!(current <= previous);
            previous = current;
        }
    }

    #[test]
    fn older_anchor_is_ignored_in_any_order() {
        let t0 = Instant::now();
        let newer = anchor(t0, 20, 100);
        let older = anchor(t0, 10, 500);

        let mut forward = SessionClock::new();
        forward.apply(older);
        forward.apply(newer);

        let mut backward = SessionClock::new();
        backward.apply(newer);
        assert!(!backward.apply(older));

        assert_eq!(forward.anchor(), backward.anchor());
        assert!(!backward.apply(newer), "re-applying is a no-op");
    }

    #[test]
    fn provisional_anchor_never_replaces_authoritative() {
        let t0 = Instant::now();
        let mut clock = SessionClock::new();
        clock.apply(anchor(t0, 0, 100));

        let mut provisional = anchor(t0, 50, 10);
        provisional.authoritative = false;
        assert!(!clock.apply(provisional));
        assert_eq!(clock.remaining_seconds(t0), Some(100));
    }

    #[test]
    fn zero_crossing_fires_once_per_anchor() {
        let t0 = Instant::now();
        let mut clock = SessionClock::new();
        clock.apply(anchor(t0, 0, 1));

        assert!(!clock.poll_zero_crossing(t0));
        assert!(clock.poll_zero_crossing(t0 + Duration::from_secs(1)));
        assert!(!clock.poll_zero_crossing(t0 + Duration::from_secs(2)));

        clock.apply(anchor(t0 + Duration::from_secs(2), 5, 3));
        assert!(clock.poll_zero_crossing(t0 + Duration::from_secs(5)));
    }

    #[test]
    fn stale_anchor_does_not_corroborate_expiry() {
        let t0 = Instant::now();
        let max_age = Duration::from_secs(45);
        let mut clock = SessionClock::new();
        clock.apply(anchor(t0, 0, 30));

        assert!(clock.corroborates_expiry(t0 + Duration::from_secs(40), max_age));
        assert!(!clock.corroborates_expiry(t0 + Duration::from_secs(600), max_age));

        let mut provisional = SessionClock::new();
        let mut cached = anchor(t0, 0, 0);
        cached.authoritative = false;
        provisional.apply(cached);
        assert!(!provisional.corroborates_expiry(t0, max_age));
    }

    #[test]
    fn extrapolated_anchor_charges_time_away() {
        let stored = StoredAnchor {
            server_timestamp: datetime!(2025-03-01 09:00 UTC),
            remaining_seconds: 400,
            received_wall: datetime!(2025-03-01 09:10 UTC),
        };
        let now = Moment::at(Instant::now(), datetime!(2025-03-01 09:10:20 UTC));
        let anchor = ClockAnchor::extrapolated(&stored, now);
        assert_eq!(anchor.remaining_seconds, 380);
        assert!(!anchor.authoritative);

        let rebased = anchor.to_stored(now.advanced(Duration::from_secs(30)));
        assert_eq!(rebased.remaining_seconds, 350);
        assert_eq!(rebased.server_timestamp, stored.server_timestamp);
    }
}
