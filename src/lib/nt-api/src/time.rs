//! NT time values: 100ns ticks, absolute values counted from 1601-01-01 UTC.

use core::time::Duration;

/// Seconds between 1601-01-01 and 1970-01-01.
const SECS_1601_TO_1970: u64 = 11_644_473_600;
const TICKS_PER_SEC: u64 = 10_000_000;
const NANOS_PER_TICK: u64 = 100;

/// An absolute `FILETIME`/`LARGE_INTEGER` timestamp.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[repr(transparent)]
pub struct FileTime(pub i64);

impl FileTime {
    pub const ZERO: Self = Self(0);

    /// Converts a duration since the unix epoch.
    pub fn from_unix(since_epoch: Duration) -> Self {
        let ticks = (since_epoch.as_secs() + SECS_1601_TO_1970) * TICKS_PER_SEC
            + u64::from(since_epoch.subsec_nanos()) / NANOS_PER_TICK;
        Self(i64::try_from(ticks).unwrap_or(i64::MAX))
    }

    /// Duration since the unix epoch, or `None` for times before it.
    pub fn to_unix(self) -> Option<Duration> {
        let ticks = u64::try_from(self.0).ok()?;
        let ticks = ticks.checked_sub(SECS_1601_TO_1970 * TICKS_PER_SEC)?;
        Some(ticks_to_duration(ticks))
    }
}

/// A relative tick count, as used for thread CPU times.
pub fn duration_to_ticks(d: Duration) -> i64 {
    let ticks = d.as_secs() * TICKS_PER_SEC + u64::from(d.subsec_nanos()) / NANOS_PER_TICK;
    i64::try_from(ticks).unwrap_or(i64::MAX)
}

pub fn ticks_to_duration(ticks: u64) -> Duration {
    Duration::new(
        ticks / TICKS_PER_SEC,
        ((ticks % TICKS_PER_SEC) * NANOS_PER_TICK) as u32,
    )
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_unix_epoch() {
        let epoch = FileTime::from_unix(Duration::ZERO);
        assert_eq!(epoch.0, 116_444_736_000_000_000);
        assert_eq!(epoch.to_unix(), Some(Duration::ZERO));
    }

    #[test]
    fn test_truncates_to_ticks() {
        let t = FileTime::from_unix(Duration::new(1, 250));
        assert_eq!(t.to_unix(), Some(Duration::new(1, 200)));
    }

    #[test]
    fn test_before_epoch() {
        assert_eq!(FileTime(5).to_unix(), None);
        assert_eq!(FileTime(-5).to_unix(), None);
    }

    #[test]
    fn test_relative() {
        assert_eq!(duration_to_ticks(Duration::from_millis(1)), 10_000);
        assert_eq!(ticks_to_duration(15_000_000), Duration::from_millis(1500));
    }
}
