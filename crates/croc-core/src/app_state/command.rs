//! Operator commands and their replies
//!
//! The console front end (menu text, wireless transport) lives outside the
//! core. It turns whatever the operator typed into a [`Command`] and prints
//! the [`CommandStatus`] it gets back.

use crate::config::LoggingMode;
use crate::error::TrackerError;
use crate::rtc::TimeAdjustment;
use crate::storage::{FileName, DATA_LOG_FILE, FIX_LOG_FILE};
use crate::time::{DateTime, TimeZone};
use crate::time_manager::SyncStatus;
use crate::transmit::TransmitReport;

/// Which file a transmission takes its bytes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransmitSource {
    /// The compact fix log; the usual choice.
    FixLog,
    DataLog,
    File(FileName),
}

impl TransmitSource {
    pub fn file_name(&self) -> &str {
        match self {
            TransmitSource::FixLog => FIX_LOG_FILE,
            TransmitSource::DataLog => DATA_LOG_FILE,
            TransmitSource::File(name) => name.as_str(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Start,
    Stop,
    SetLoggingMode(LoggingMode),
    SetSessionDuration { minutes: u16 },
    SetPowerInterval { ms: u32 },
    SetGnssInterval { ms: u32 },
    SetStatusInterval { ms: u32 },
    SetSyncInterval { ms: u32 },
    SetTimeZone(TimeZone),
    AdjustTime(TimeAdjustment),
    SyncTime,
    Transmit(TransmitSource),
    DeleteFile(FileName),
    FileSize(FileName),
}

#[derive(Debug, Clone, PartialEq)]
pub enum CommandStatus {
    Done,
    /// Start while already logging, or stop while idle.
    NoChange,
    TimeSet(DateTime),
    TimeZoneSet(TimeZone),
    Synced(SyncStatus),
    FileSize { name: FileName, bytes: u32 },
    Transmitted(TransmitReport),
    Failed(TrackerError),
}

impl CommandStatus {
    pub fn is_ok(&self) -> bool {
        match self {
            CommandStatus::Failed(_) => false,
            CommandStatus::Synced(status) => status.is_success(),
            _ => true,
        }
    }

    pub fn failed(e: impl Into<TrackerError>) -> Self {
        CommandStatus::Failed(e.into())
    }
}
