//! Calendar time, time zones and UTC to local conversion
//!
//! Wall-clock values are only used for human-readable logging; scheduling
//! always runs off the monotonic counter in [`crate::clock`].

use core::fmt::{self, Write};

use serde::{Deserialize, Serialize};

/// Earliest and latest years accepted as a plausible clock reading.
pub const MIN_VALID_YEAR: u16 = 2020;
pub const MAX_VALID_YEAR: u16 = 2030;

const SECONDS_PER_DAY: i64 = 86_400;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct DateTime {
    pub year: u16,
    pub month: u8,
    pub day: u8,
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
}

impl DateTime {
    pub const fn new(year: u16, month: u8, day: u8, hour: u8, minute: u8, second: u8) -> Self {
        Self {
            year,
            month,
            day,
            hour,
            minute,
            second,
        }
    }

    /// Fields describe a real calendar instant.
    pub fn is_valid(&self) -> bool {
        (1..=12).contains(&self.month)
            && self.day >= 1
            && self.day <= days_in_month(self.year, self.month)
            && self.hour < 24
            && self.minute < 60
            && self.second < 60
    }

    /// Valid, inside the supported year window, and not the all-zero reset value.
    pub fn is_plausible(&self) -> bool {
        self.is_valid()
            && (MIN_VALID_YEAR..=MAX_VALID_YEAR).contains(&self.year)
            && *self != DateTime::new(2000, 1, 1, 0, 0, 0)
    }

    /// Seconds since 1970-01-01 00:00:00 in the same zone as `self`.
    pub fn to_epoch_seconds(&self) -> i64 {
        let days = days_from_civil(
            i64::from(self.year),
            u32::from(self.month),
            u32::from(self.day),
        );
        days * SECONDS_PER_DAY
            + i64::from(self.hour) * 3600
            + i64::from(self.minute) * 60
            + i64::from(self.second)
    }

    pub fn from_epoch_seconds(secs: i64) -> Self {
        let days = secs.div_euclid(SECONDS_PER_DAY);
        let rem = secs.rem_euclid(SECONDS_PER_DAY);
        let (year, month, day) = civil_from_days(days);
        Self {
            year: year.clamp(0, i64::from(u16::MAX)) as u16,
            month: month as u8,
            day: day as u8,
            hour: (rem / 3600) as u8,
            minute: ((rem % 3600) / 60) as u8,
            second: (rem % 60) as u8,
        }
    }

    /// Shift by `delta` seconds, rolling minutes, hours, days, months and years.
    pub fn add_seconds(&self, delta: i64) -> Self {
        Self::from_epoch_seconds(self.to_epoch_seconds() + delta)
    }

    /// `YYYY-MM-DD`
    pub fn date_string(&self) -> heapless::String<10> {
        let mut s = heapless::String::new();
        // 10 bytes always fit a four-digit year
        let _ = write!(s, "{:04}-{:02}-{:02}", self.year, self.month, self.day);
        s
    }

    /// `HH:MM:SS`, 24-hour
    pub fn time_string(&self) -> heapless::String<8> {
        let mut s = heapless::String::new();
        let _ = write!(s, "{:02}:{:02}:{:02}", self.hour, self.minute, self.second);
        s
    }
}

/// `YYYY-MM-DD HH:MM:SS`
impl fmt::Display for DateTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04}-{:02}-{:02} {:02}:{:02}:{:02}",
            self.year, self.month, self.day, self.hour, self.minute, self.second
        )
    }
}

/// Offset from UTC. The RV-8803 stores zones natively in quarter hours.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum TimeZone {
    Utc,
    /// Central Standard Time, UTC-6
    Cst,
    /// Central Daylight Time, UTC-5
    #[default]
    Cdt,
    /// Any other offset, in quarter hours
    QuarterHours(i8),
}

impl TimeZone {
    /// UTC-12:00
    pub const MIN_QUARTER_HOURS: i8 = -48;
    /// UTC+14:00
    pub const MAX_QUARTER_HOURS: i8 = 56;

    pub const fn quarter_hours(self) -> i8 {
        match self {
            TimeZone::Utc => 0,
            TimeZone::Cst => -24,
            TimeZone::Cdt => -20,
            TimeZone::QuarterHours(q) => q,
        }
    }

    pub const fn from_quarter_hours(q: i8) -> Self {
        match q {
            0 => TimeZone::Utc,
            -24 => TimeZone::Cst,
            -20 => TimeZone::Cdt,
            other => TimeZone::QuarterHours(other),
        }
    }

    pub const fn from_hours(hours: i8) -> Self {
        Self::from_quarter_hours(hours * 4)
    }

    pub fn is_valid(self) -> bool {
        (Self::MIN_QUARTER_HOURS..=Self::MAX_QUARTER_HOURS).contains(&self.quarter_hours())
    }

    pub fn offset_seconds(self) -> i64 {
        i64::from(self.quarter_hours()) * 15 * 60
    }

    /// CST and CDT swap; anything else moves to CST.
    pub const fn toggled(self) -> Self {
        match self {
            TimeZone::Cst => TimeZone::Cdt,
            _ => TimeZone::Cst,
        }
    }
}

impl fmt::Display for TimeZone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeZone::Utc => f.write_str("UTC"),
            TimeZone::Cst => f.write_str("CST"),
            TimeZone::Cdt => f.write_str("CDT"),
            TimeZone::QuarterHours(q) => {
                let sign = if *q < 0 { '-' } else { '+' };
                let minutes = i32::from(*q).abs() * 15;
                write!(f, "UTC{}{:02}:{:02}", sign, minutes / 60, minutes % 60)
            }
        }
    }
}

/// Convert a UTC instant to local time in `tz`, with full calendar rollover.
pub fn utc_to_local(utc: DateTime, tz: TimeZone) -> DateTime {
    utc.add_seconds(tz.offset_seconds())
}

pub fn local_to_utc(local: DateTime, tz: TimeZone) -> DateTime {
    local.add_seconds(-tz.offset_seconds())
}

/// Divisible by 4, and not by 100 unless also by 400.
pub const fn is_leap_year(year: u16) -> bool {
    (year % 4 == 0 && year % 100 != 0) || year % 400 == 0
}

pub const fn days_in_month(year: u16, month: u8) -> u8 {
    match month {
        1 | 3 | 5 | 7 | 8 | 10 | 12 => 31,
        4 | 6 | 9 | 11 => 30,
        2 if is_leap_year(year) => 29,
        2 => 28,
        _ => 0,
    }
}

/// Days since 1970-01-01 for a proleptic Gregorian date.
fn days_from_civil(year: i64, month: u32, day: u32) -> i64 {
    let y = if month <= 2 { year - 1 } else { year };
    let era = (if y >= 0 { y } else { y - 399 }) / 400;
    let yoe = y - era * 400;
    let mp = i64::from((month + 9) % 12);
    let doy = (153 * mp + 2) / 5 + i64::from(day) - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    era * 146_097 + doe - 719_468
}

fn civil_from_days(days: i64) -> (i64, u32, u32) {
    let z = days + 719_468;
    let era = (if z >= 0 { z } else { z - 146_096 }) / 146_097;
    let doe = z - era * 146_097;
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let month = (if mp < 10 { mp + 3 } else { mp - 9 }) as u32;
    let year = yoe + era * 400 + i64::from(month <= 2);
    (year, month, day)
}

/// Build time baked in by the build script, as UTC.
pub fn build_time_utc() -> Option<DateTime> {
    let epoch: i64 = option_env!("CROC_BUILD_EPOCH")?.parse().ok()?;
    Some(DateTime::from_epoch_seconds(epoch))
}

/// Formats a monotonic millisecond count as `+HH:MM:SS.mmm` since boot, for
/// rows logged before any wall clock is available.
pub fn uptime_string(monotonic_ms: u32) -> heapless::String<16> {
    let total_s = monotonic_ms / 1000;
    let mut s = heapless::String::new();
    let _ = write!(
        s,
        "+{:02}:{:02}:{:02}.{:03}",
        total_s / 3600,
        (total_s / 60) % 60,
        total_s % 60,
        monotonic_ms % 1000
    );
    s
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_leap_years() {
        assert!(is_leap_year(2024));
        assert!(!is_leap_year(2025));
        assert!(!is_leap_year(2100));
        assert!(is_leap_year(2000));
        assert_eq!(days_in_month(2024, 2), 29);
        assert_eq!(days_in_month(2025, 2), 28);
        assert_eq!(days_in_month(2025, 13), 0);
    }

    #[test]
    fn test_epoch_round_trip() {
        let dt = DateTime::new(2025, 3, 1, 2, 30, 0);
        assert_eq!(dt.to_epoch_seconds(), 1_740_796_200);
        assert_eq!(DateTime::from_epoch_seconds(1_740_796_200), dt);
        assert_eq!(DateTime::from_epoch_seconds(0), DateTime::new(1970, 1, 1, 0, 0, 0));
    }

    #[test]
    fn test_utc_to_local_day_rollover() {
        let utc = DateTime::new(2025, 3, 1, 2, 30, 0);
        assert_eq!(
            utc_to_local(utc, TimeZone::Cst),
            DateTime::new(2025, 2, 28, 20, 30, 0)
        );

        let leap = DateTime::new(2024, 3, 1, 2, 30, 0);
        assert_eq!(
            utc_to_local(leap, TimeZone::Cst),
            DateTime::new(2024, 2, 29, 20, 30, 0)
        );
    }

    #[test]
    fn test_utc_to_local_year_rollover() {
        let utc = DateTime::new(2025, 12, 31, 20, 0, 0);
        assert_eq!(
            utc_to_local(utc, TimeZone::from_hours(14)),
            DateTime::new(2026, 1, 1, 10, 0, 0)
        );
        let utc = DateTime::new(2026, 1, 1, 3, 15, 0);
        assert_eq!(
            utc_to_local(utc, TimeZone::Cdt),
            DateTime::new(2025, 12, 31, 22, 15, 0)
        );
    }

    #[test]
    fn test_local_to_utc_inverse() {
        let local = DateTime::new(2024, 2, 29, 20, 30, 0);
        assert_eq!(
            local_to_utc(local, TimeZone::Cst),
            DateTime::new(2024, 3, 1, 2, 30, 0)
        );
    }

    #[test]
    fn test_plausibility() {
        assert!(DateTime::new(2025, 6, 1, 12, 0, 0).is_plausible());
        assert!(!DateTime::new(2019, 12, 31, 23, 59, 59).is_plausible());
        assert!(!DateTime::new(2031, 1, 1, 0, 0, 0).is_plausible());
        assert!(!DateTime::new(2025, 2, 29, 0, 0, 0).is_plausible());
        assert!(!DateTime::new(2000, 1, 1, 0, 0, 0).is_plausible());
    }

    #[test]
    fn test_formatting() {
        let dt = DateTime::new(2025, 3, 7, 4, 5, 6);
        assert_eq!(dt.date_string().as_str(), "2025-03-07");
        assert_eq!(dt.time_string().as_str(), "04:05:06");
        assert_eq!(format!("{dt}"), "2025-03-07 04:05:06");
        assert_eq!(uptime_string(3_723_004).as_str(), "+01:02:03.004");
    }

    #[test]
    fn test_timezone_codes() {
        assert_eq!(TimeZone::Cst.quarter_hours(), -24);
        assert_eq!(TimeZone::Cdt.quarter_hours(), -20);
        assert_eq!(TimeZone::from_quarter_hours(-20), TimeZone::Cdt);
        assert_eq!(TimeZone::Cdt.toggled(), TimeZone::Cst);
        assert_eq!(TimeZone::Cst.toggled(), TimeZone::Cdt);
        assert_eq!(TimeZone::default(), TimeZone::Cdt);
        assert!(!TimeZone::QuarterHours(57).is_valid());
        assert_eq!(format!("{}", TimeZone::QuarterHours(22)), "UTC+05:30");
        assert_eq!(format!("{}", TimeZone::from_hours(-3)), "UTC-03:00");
    }
}
