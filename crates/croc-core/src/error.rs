//! Tracker-wide error kinds
//!
//! Each subsystem keeps its own error enum close to the code that raises it
//! (`SensorError`, `RtcError`, `GnssError`, `StorageError`, `ModemError`,
//! `ConfigError`). They all fold into [`TrackerError`], which is what the
//! operator console and the top-level loop see.

use thiserror_no_std::Error;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerError {
    #[error("I2C bus transaction failed")]
    BusIo,
    #[error("unexpected device id {0}")]
    DeviceIdMismatch(u16),
    #[error("sensor used before calibration")]
    SensorNotCalibrated,
    #[error("RTC not available")]
    RtcNotAvailable,
    #[error("RTC holds an invalid time")]
    RtcInvalidTime,
    #[error("failed to set RTC time")]
    RtcSetFailed,
    #[error("GNSS receiver not ready")]
    GnssNotReady,
    #[error("GNSS has no valid fix")]
    GnssNoFix,
    #[error("GNSS time not valid")]
    GnssInvalidTime,
    #[error("failed to open file on storage")]
    StorageOpenFailed,
    #[error("failed to write to storage")]
    StorageWriteFailed,
    #[error("failed to read from storage")]
    StorageReadFailed,
    #[error("failed to shift file prefix")]
    StorageShiftFailed,
    #[error("record buffer full")]
    BufferFull,
    #[error("modem signal too weak")]
    ModemNoSignal,
    #[error("modem timed out")]
    ModemTimeout,
    #[error("modem protocol error")]
    ModemProtocolError,
    #[error("modem reported a fatal error")]
    ModemFatal,
    #[error("invalid configuration")]
    InvalidConfiguration,
    #[error("log file is empty")]
    LogEmpty,
    #[error("payload failed integrity check")]
    InvalidPayload,
}
