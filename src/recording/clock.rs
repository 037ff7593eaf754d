//! Monotonic clock for a single interaction.
//!
//! Every interaction owns exactly one [`Clock`]. Its epoch is the moment the
//! inbound request starts forwarding, so a [`Timestamp`] is the elapsed
//! monotonic time since that instant. Timestamps from different clocks are
//! never compared.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::ops::Sub;
use std::time::Duration;
use tokio::time::Instant;

/// A monotonic instant on an interaction clock, measured from its epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Timestamp(Duration);

impl Timestamp {
    /// The clock epoch (request start).
    pub const ZERO: Timestamp = Timestamp(Duration::ZERO);

    /// Build a timestamp from an offset relative to the epoch.
    pub fn from_offset(offset: Duration) -> Self {
        Self(offset)
    }

    /// Offset from the epoch.
    pub fn offset(&self) -> Duration {
        self.0
    }

    /// Time elapsed between `earlier` and `self`, saturating at zero.
    pub fn since(&self, earlier: Timestamp) -> Duration {
        self.0.saturating_sub(earlier.0)
    }
}

impl Sub for Timestamp {
    type Output = Duration;

    fn sub(self, rhs: Timestamp) -> Duration {
        self.since(rhs)
    }
}

// Persisted as microseconds since request start.
impl Serialize for Timestamp {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let micros = u64::try_from(self.0.as_micros()).unwrap_or(u64::MAX);
        serializer.serialize_u64(micros)
    }
}

impl<'de> Deserialize<'de> for Timestamp {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let micros = u64::deserialize(deserializer)?;
        Ok(Self(Duration::from_micros(micros)))
    }
}

/// Monotonic clock anchored at the start of one interaction.
///
/// Uses `tokio::time::Instant` so paused test runtimes control it.
#[derive(Debug, Clone, Copy)]
pub struct Clock {
    epoch: Instant,
}

impl Clock {
    /// Start a new clock; its epoch is now.
    pub fn start() -> Self {
        Self { epoch: Instant::now() }
    }

    /// Current position of the clock, truncated to whole microseconds so
    /// it survives persistence unchanged.
    pub fn now(&self) -> Timestamp {
        let micros = u64::try_from(self.epoch.elapsed().as_micros()).unwrap_or(u64::MAX);
        Timestamp(Duration::from_micros(micros))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn clock_follows_monotonic_time() {
        let clock = Clock::start();
        assert_eq!(clock.now(), Timestamp::ZERO);

        tokio::time::advance(Duration::from_millis(50)).await;
        let t1 = clock.now();
        assert_eq!(t1.offset(), Duration::from_millis(50));

        tokio::time::advance(Duration::from_millis(70)).await;
        assert_eq!(clock.now() - t1, Duration::from_millis(70));
    }

    #[tokio::test(start_paused = true)]
    async fn readings_match_their_persisted_form() {
        let clock = Clock::start();
        tokio::time::advance(Duration::from_nanos(1_065)).await;
        let t = clock.now();
        assert_eq!(t.offset(), Duration::from_micros(1));

        let json = serde_json::to_string(&t).unwrap();
        let back: Timestamp = serde_json::from_str(&json).unwrap();
        assert_eq!(back, t);
    }

    #[test]
    fn since_saturates() {
        let a = Timestamp::from_offset(Duration::from_millis(10));
        let b = Timestamp::from_offset(Duration::from_millis(30));
        assert_eq!(a.since(b), Duration::ZERO);
        assert_eq!(b.since(a), Duration::from_millis(20));
    }

    #[test]
    fn serializes_as_micros() {
        let ts = Timestamp::from_offset(Duration::from_micros(62_500));
        assert_eq!(serde_json::to_string(&ts).unwrap(), "62500");
        let back: Timestamp = serde_json::from_str("62500").unwrap();
        assert_eq!(back, ts);
    }
}
