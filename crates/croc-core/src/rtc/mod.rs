pub mod rv8803;

pub use rv8803::Rv8803;

use log::info;
use thiserror_no_std::Error;

use crate::error::TrackerError;
use crate::time::{DateTime, TimeZone};

/// Largest manual add/subtract step, in seconds.
pub const MAX_ADJUSTMENT_SECONDS: u32 = 3600;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RtcError {
    #[error("RTC not responding")]
    NotAvailable,
    #[error("RTC time is not plausible")]
    InvalidTime,
    #[error("writing the RTC failed")]
    SetFailed,
    #[error("adjustment exceeds one hour")]
    AdjustmentOutOfRange,
    #[error("time zone offset out of range")]
    InvalidTimeZone,
}

impl From<RtcError> for TrackerError {
    fn from(e: RtcError) -> Self {
        match e {
            RtcError::NotAvailable => TrackerError::RtcNotAvailable,
            RtcError::InvalidTime => TrackerError::RtcInvalidTime,
            RtcError::SetFailed => TrackerError::RtcSetFailed,
            RtcError::AdjustmentOutOfRange | RtcError::InvalidTimeZone => {
                TrackerError::InvalidConfiguration
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RtcState {
    Uninitialized,
    Ready,
    /// A hardware error after init; cleared by the next successful transaction.
    Fault,
}

/// Start-up options for the RTC driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtcConfig {
    pub timezone: TimeZone,
    /// Write the build time when the stored time is not plausible.
    pub auto_compiler_time: bool,
}

impl Default for RtcConfig {
    fn default() -> Self {
        Self {
            timezone: TimeZone::default(),
            auto_compiler_time: true,
        }
    }
}

/// A clock reading paired with the monotonic tick at which it was taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtcTimestamp {
    pub monotonic_ms: u32,
    /// Local time; `None` when the RTC could not be read.
    pub local: Option<DateTime>,
    pub hundredths: u8,
    pub timezone: TimeZone,
}

impl RtcTimestamp {
    pub fn is_valid(&self) -> bool {
        self.local.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeAdjustment {
    AddSeconds(u32),
    SubtractSeconds(u32),
    ToggleTimeZone,
    SetCustom(DateTime),
}

/// What the time manager needs from a hardware clock.
pub trait RtcClock {
    fn is_ready(&self) -> bool;

    fn timezone(&self) -> TimeZone;

    /// Read the clock. `now_ms` is captured by the caller before the bus read.
    fn get_timestamp(&mut self, now_ms: u32) -> RtcTimestamp;

    /// Write a local time directly.
    fn set_time(&mut self, local: DateTime) -> Result<(), RtcError>;

    fn set_timezone(&mut self, tz: TimeZone) -> Result<(), RtcError>;

    /// Write a UTC instant, converting to local time first when `apply_tz` is
    /// set. Returns the time actually written.
    fn set_from_gnss(&mut self, utc: DateTime, apply_tz: bool) -> Result<DateTime, RtcError> {
        let local = if apply_tz {
            crate::time::utc_to_local(utc, self.timezone())
        } else {
            utc
        };
        self.set_time(local)?;
        Ok(local)
    }

    /// Add or subtract up to an hour, toggle CST/CDT, or set a custom time.
    /// Returns the local time in effect afterwards.
    fn apply_time_adjustment(&mut self, adjustment: TimeAdjustment) -> Result<DateTime, RtcError> {
        let delta = match adjustment {
            TimeAdjustment::AddSeconds(s) | TimeAdjustment::SubtractSeconds(s)
                if s > MAX_ADJUSTMENT_SECONDS =>
            {
                return Err(RtcError::AdjustmentOutOfRange);
            }
            TimeAdjustment::AddSeconds(s) => i64::from(s),
            TimeAdjustment::SubtractSeconds(s) => -i64::from(s),
            TimeAdjustment::ToggleTimeZone => {
                let tz = self.timezone().toggled();
                self.set_timezone(tz)?;
                info!("RTC time zone now {}", tz);
                return self.get_timestamp(0).local.ok_or(RtcError::NotAvailable);
            }
            TimeAdjustment::SetCustom(local) => {
                if !local.is_plausible() {
                    return Err(RtcError::InvalidTime);
                }
                self.set_time(local)?;
                return Ok(local);
            }
        };

        let now = self.get_timestamp(0).local.ok_or(RtcError::NotAvailable)?;
        let adjusted = now.add_seconds(delta);
        self.set_time(adjusted)?;
        info!("RTC adjusted by {} s to {}", delta, adjusted);
        Ok(adjusted)
    }
}
