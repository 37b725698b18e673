use std::time::{Duration, Instant};

use time::OffsetDateTime;

/// A paired reading of the monotonic and wall clocks.
///
/// Remaining time is always derived from the monotonic half; the wall half is
/// only persisted so a reloaded process can estimate how long it was away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Moment {
    pub(crate) mono: Instant,
    pub(crate) wall: OffsetDateTime,
}

impl Moment {
    /// The monotonic half follows tokio's clock, so paused-time tests see it move.
    pub(crate) fn now() -> Self {
        Self { mono: tokio::time::Instant::now().into_std(), wall: OffsetDateTime::now_utc() }
    }

    #[cfg(test)]
    pub(crate) fn at(mono: Instant, wall: OffsetDateTime) -> Self {
        Self { mono, wall }
    }

    #[cfg(test)]
    pub(crate) fn advanced(self, by: Duration) -> Self {
        Self { mono: self.mono + by, wall: self.wall + by }
    }

    pub(crate) fn after(self, by: Duration) -> Instant {
        self.mono + by
    }
}

/// Wall-clock time elapsed since `earlier`, clamped at zero when the system
/// clock moved backwards.
pub(crate) fn wall_elapsed(earlier: OffsetDateTime, now: OffsetDateTime) -> Duration {
    let delta = now - earlier;
    if delta.is_negative() {
        return Duration::ZERO;
    }
    Duration::try_from(delta).unwrap_or(Duration::ZERO)
}

pub(crate) fn millis(value: Duration) -> u64 {
    u64::try_from(value.as_millis()).unwrap_or(u64::MAX)
}
