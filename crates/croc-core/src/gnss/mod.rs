//! Satellite navigation: UBX protocol, fix model and validation

pub mod ublox;
pub mod ubx;

pub use ublox::{GnssConfig, UbloxGnss};

use serde::{Deserialize, Serialize};
use thiserror_no_std::Error;

use crate::clock::elapsed_ms;
use crate::error::TrackerError;
use crate::time::DateTime;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum GnssError {
    #[error("GNSS receiver not initialized")]
    NotReady,
    #[error("GNSS receiver not responding")]
    CommunicationFailed,
    #[error("GNSS receiver rejected configuration message {0:?}")]
    ConfigurationRejected(u8),
    #[error("no navigation solution received yet")]
    NoFix,
    #[error("GNSS time not valid")]
    InvalidTime,
}

impl From<GnssError> for TrackerError {
    fn from(e: GnssError) -> Self {
        match e {
            GnssError::NotReady | GnssError::CommunicationFailed => TrackerError::GnssNotReady,
            GnssError::ConfigurationRejected(_) => TrackerError::InvalidConfiguration,
            GnssError::NoFix => TrackerError::GnssNoFix,
            GnssError::InvalidTime => TrackerError::GnssInvalidTime,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GnssState {
    Uninitialized,
    Ready,
    AcquiredFirstFix,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FixType {
    #[default]
    NoFix,
    DeadReckoning,
    Fix2D,
    Fix3D,
    GnssDeadReckoning,
    TimeOnly,
}

impl FixType {
    pub fn from_ubx(raw: u8) -> Self {
        match raw {
            1 => FixType::DeadReckoning,
            2 => FixType::Fix2D,
            3 => FixType::Fix3D,
            4 => FixType::GnssDeadReckoning,
            5 => FixType::TimeOnly,
            _ => FixType::NoFix,
        }
    }

    /// Numeric code as logged in the CSV `Fix_Type` column.
    pub fn code(self) -> u8 {
        match self {
            FixType::NoFix => 0,
            FixType::DeadReckoning => 1,
            FixType::Fix2D => 2,
            FixType::Fix3D => 3,
            FixType::GnssDeadReckoning => 4,
            FixType::TimeOnly => 5,
        }
    }

    /// Fix types that carry a usable position.
    pub fn has_position(self) -> bool {
        matches!(
            self,
            FixType::Fix2D | FixType::Fix3D | FixType::GnssDeadReckoning
        )
    }
}

/// UTC time as reported by the receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GnssTime {
    pub utc: DateTime,
    pub nanos: i32,
    pub date_valid: bool,
    pub time_valid: bool,
    pub fully_resolved: bool,
    pub confirmed_date: bool,
    pub confirmed_time: bool,
}

impl GnssTime {
    pub fn is_valid(&self) -> bool {
        self.date_valid && self.time_valid && self.utc.is_valid()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Position {
    pub latitude_deg: f64,
    pub longitude_deg: f64,
    /// Height above mean sea level.
    pub altitude_m: f32,
    pub horizontal_accuracy_m: f32,
    pub vertical_accuracy_m: f32,
}

/// One navigation solution as cached from the receiver.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct GnssData {
    /// Monotonic tick at which the solution arrived.
    pub monotonic_ms: u32,
    pub fix_type: FixType,
    pub satellites_used: u8,
    pub hdop: f32,
    pub pdop: f32,
    /// Receiver's own `gnssFixOK` flag.
    pub fix_ok: bool,
    /// Present only when the fix carries a position.
    pub position: Option<Position>,
    /// Present only when the receiver flags date and time as valid.
    pub time: Option<GnssTime>,
    /// Result of [`validate_fix`] when the data was read.
    pub validation_passed: bool,
}

/// Thresholds a solution must meet before it is logged as valid or used
/// for time sync.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FixCriteria {
    pub min_satellites: u8,
    pub max_hdop: f32,
    pub max_fix_age_ms: u32,
    pub require_time_valid: bool,
}

impl Default for FixCriteria {
    fn default() -> Self {
        Self {
            min_satellites: 4,
            max_hdop: 5.0,
            max_fix_age_ms: 10_000,
            require_time_valid: false,
        }
    }
}

pub fn validate_fix(data: &GnssData, criteria: &FixCriteria, now_ms: u32) -> bool {
    let Some(pos) = data.position else {
        return false;
    };

    if data.satellites_used < criteria.min_satellites
        || !(data.hdop <= criteria.max_hdop)
        || elapsed_ms(now_ms, data.monotonic_ms) > criteria.max_fix_age_ms
    {
        return false;
    }

    if criteria.require_time_valid && !data.time.is_some_and(|t| t.is_valid()) {
        return false;
    }

    (-90.0..=90.0).contains(&pos.latitude_deg)
        && (-180.0..=180.0).contains(&pos.longitude_deg)
        && (-1000.0..=50_000.0).contains(&pos.altitude_m)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GnssStats {
    pub readings: u32,
    pub valid_fixes: u32,
    pub rejected_fixes: u32,
    pub checksum_errors: u32,
    /// Milliseconds from init to the first validated fix.
    pub time_to_first_fix_ms: Option<u32>,
}

/// What the scheduler and time manager need from a receiver.
pub trait GnssReceiver {
    fn is_ready(&self) -> bool;

    /// Pull whatever the receiver has buffered and return the newest solution.
    fn read_position(&mut self, now_ms: u32) -> Result<GnssData, GnssError>;

    /// Newest UTC time, failing unless the receiver marks it valid.
    fn get_time(&mut self, now_ms: u32) -> Result<GnssTime, GnssError>;

    fn validate_fix(&self, data: &GnssData, now_ms: u32) -> bool;

    fn set_criteria(&mut self, criteria: FixCriteria);

    /// Whether the newest cached solution passes validation right now.
    fn has_valid_fix(&mut self, now_ms: u32) -> bool {
        self.read_position(now_ms)
            .is_ok_and(|data| self.validate_fix(&data, now_ms))
    }
}
