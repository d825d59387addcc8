use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use convi::ExpectInto as _;

/// A point in time expressed as milliseconds since the Unix epoch.
///
/// All tracker arithmetic goes through this type rather than raw `u64` so
/// that "now plus an interval" and "elapsed since" can't be accidentally
/// mixed up with a millisecond count in the wrong unit.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
pub struct Timestamp(u64);

impl Timestamp {
    pub const ZERO: Timestamp = Timestamp(0);

    pub fn from_millis(millis: u64) -> Self {
        Timestamp(millis)
    }

    /// The current wall-clock time.
    ///
    /// Falls back to [`Timestamp::ZERO`] if the system clock reports a time
    /// before the epoch, which should not happen outside of misconfigured
    /// containers.
    pub fn now() -> Self {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis().expect_into())
            .unwrap_or(0);
        Timestamp(millis)
    }

    pub fn as_millis(self) -> u64 {
        self.0
    }

    /// `self + ms`, saturating at `u64::MAX` rather than wrapping.
    pub fn plus_ms(self, ms: u64) -> Self {
        Timestamp(self.0.saturating_add(ms))
    }

    /// `self - ms`, saturating at zero rather than wrapping.
    pub fn minus_ms(self, ms: u64) -> Self {
        Timestamp(self.0.saturating_sub(ms))
    }

    /// Milliseconds elapsed between `earlier` and `self`, or `0` if
    /// `earlier` is in the future relative to `self`.
    pub fn since(self, earlier: Timestamp) -> u64 {
        self.0.saturating_sub(earlier.0)
    }

    pub fn is_before(self, other: Timestamp) -> bool {
        self.0 < other.0
    }

    pub fn is_at_or_before(self, other: Timestamp) -> bool {
        self.0 <= other.0
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for Timestamp {
    fn from(millis: u64) -> Self {
        Timestamp(millis)
    }
}
