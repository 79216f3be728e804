use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::ValidationError;

const MICROS_PER_MINUTE: i64 = 60_000_000;
/// 1970-01-05 (the first Monday after the epoch).
const WEEK_ALIGNMENT_US: i64 = 4 * 24 * 60 * MICROS_PER_MINUTE;

/// Bucket width of a bar series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Timeframe {
    #[serde(rename = "1m", alias = "1min")]
    OneMinute,
    #[serde(rename = "5m", alias = "5min")]
    FiveMinutes,
    #[serde(rename = "15m", alias = "15min")]
    FifteenMinutes,
    #[serde(rename = "30m", alias = "30min")]
    ThirtyMinutes,
    #[serde(rename = "1h")]
    OneHour,
    #[serde(rename = "4h")]
    FourHours,
    #[serde(rename = "1d")]
    OneDay,
    #[serde(rename = "1w")]
    OneWeek,
}

impl Timeframe {
    pub const ALL: [Self; 8] = [
        Self::OneMinute,
        Self::FiveMinutes,
        Self::FifteenMinutes,
        Self::ThirtyMinutes,
        Self::OneHour,
        Self::FourHours,
        Self::OneDay,
        Self::OneWeek,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::OneMinute => "1m",
            Self::FiveMinutes => "5m",
            Self::FifteenMinutes => "15m",
            Self::ThirtyMinutes => "30m",
            Self::OneHour => "1h",
            Self::FourHours => "4h",
            Self::OneDay => "1d",
            Self::OneWeek => "1w",
        }
    }

    /// Width of one bar in microseconds.
    pub const fn duration_us(self) -> i64 {
        let minutes = match self {
            Self::OneMinute => 1,
            Self::FiveMinutes => 5,
            Self::FifteenMinutes => 15,
            Self::ThirtyMinutes => 30,
            Self::OneHour => 60,
            Self::FourHours => 240,
            Self::OneDay => 1_440,
            Self::OneWeek => 10_080,
        };
        minutes * MICROS_PER_MINUTE
    }

    pub fn duration(self) -> time::Duration {
        time::Duration::microseconds(self.duration_us())
    }

    const fn alignment_us(self) -> i64 {
        match self {
            Self::OneWeek => WEEK_ALIGNMENT_US,
            _ => 0,
        }
    }

    /// Start of the bucket containing `ts_us`.
    pub const fn bucket_start_us(self, ts_us: i64) -> i64 {
        let width = self.duration_us();
        let shifted = ts_us - self.alignment_us();
        ts_us - shifted.rem_euclid(width)
    }

    /// True when every bucket of `self` is an exact union of `finer` buckets.
    pub const fn is_multiple_of(self, finer: Self) -> bool {
        let coarse = self.duration_us();
        let fine = finer.duration_us();
        coarse > fine
            && coarse % fine == 0
            && (self.alignment_us() - finer.alignment_us()) % fine == 0
    }
}

impl Display for Timeframe {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Timeframe {
    type Err = ValidationError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "1m" | "1min" => Ok(Self::OneMinute),
            "5m" | "5min" => Ok(Self::FiveMinutes),
            "15m" | "15min" => Ok(Self::FifteenMinutes),
            "30m" | "30min" => Ok(Self::ThirtyMinutes),
            "1h" => Ok(Self::OneHour),
            "4h" => Ok(Self::FourHours),
            "1d" => Ok(Self::OneDay),
            "1w" => Ok(Self::OneWeek),
            other => Err(ValidationError::InvalidTimeframe {
                value: other.to_owned(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_canonical_labels_and_aliases() {
        assert_eq!(Timeframe::from_str("1d").expect("1d"), Timeframe::OneDay);
        assert_eq!(
            Timeframe::from_str("15min").expect("alias"),
            Timeframe::FifteenMinutes
        );
    }

    #[test]
    fn rejects_unsupported_timeframe() {
        let err = Timeframe::from_str("1mo").expect_err("monthly has no fixed width");
        assert!(matches!(err, ValidationError::InvalidTimeframe { .. }));
    }

    #[test]
    fn buckets_align_to_epoch_and_weeks_to_monday() {
        let hour = Timeframe::OneHour.duration_us();
        assert_eq!(Timeframe::OneHour.bucket_start_us(hour + 5), hour);

        // 2024-01-03 (Wednesday) 12:00 UTC falls in the week of Monday 2024-01-01.
        let wednesday_noon = 1_704_283_200_000_000;
        assert_eq!(
            Timeframe::OneWeek.bucket_start_us(wednesday_noon),
            1_704_067_200_000_000
        );
    }

    #[test]
    fn multiples_follow_width_and_alignment() {
        assert!(Timeframe::OneDay.is_multiple_of(Timeframe::OneMinute));
        assert!(Timeframe::OneWeek.is_multiple_of(Timeframe::OneDay));
        assert!(Timeframe::FourHours.is_multiple_of(Timeframe::OneHour));
        assert!(!Timeframe::OneMinute.is_multiple_of(Timeframe::OneHour));
        assert!(!Timeframe::OneDay.is_multiple_of(Timeframe::OneDay));
    }
}
