//! Tracker configuration
//!
//! All tunables live in one [`TrackerConfig`]. Every setter validates the
//! whole configuration before committing, so a rejected change leaves the
//! previous values in effect. The configuration is stored on the card as
//! `CONFIG.BIN` (postcard) and read back at boot.

use alloc::vec::Vec;

use log::{info, warn};
use serde::{Deserialize, Serialize};
use thiserror_no_std::Error;

use crate::error::TrackerError;
use crate::gnss::FixCriteria;
use crate::storage::{FileStore, StorageError, CONFIG_FILE};
use crate::time::TimeZone;
use crate::time_manager::{
    TimeManagerConfig, MAX_SYNC_INTERVAL_MS, MAX_SYNC_RETRIES, MAX_SYNC_TIMEOUT_MS,
    MIN_SYNC_INTERVAL_MS, MIN_SYNC_TIMEOUT_MS,
};
use crate::transmit::{TransmitSettings, MAX_SBD_PAYLOAD};

/// Bumped whenever the stored layout changes; older files fall back to defaults.
pub const CONFIG_VERSION: u8 = 1;
const CONFIG_STAGING_FILE: &str = "CONFIG.TMP";
const MAX_CONFIG_BYTES: usize = 256;

pub const MIN_POWER_INTERVAL_MS: u32 = 100;
pub const MIN_GNSS_INTERVAL_MS: u32 = 1000;
pub const MIN_STATUS_INTERVAL_MS: u32 = 1000;
pub const MIN_DRAIN_INTERVAL_MS: u32 = 1000;
pub const MAX_SESSION_MINUTES: u16 = 1440;
pub const MAX_TRANSMIT_RETRIES: u8 = 10;
pub const MAX_SIGNAL_BARS: u8 = 5;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    #[error("power sample interval must be at least 100 ms")]
    PowerInterval,
    #[error("GNSS sample interval must be at least 1000 ms")]
    GnssInterval,
    #[error("status interval must be at least 1000 ms")]
    StatusInterval,
    #[error("session duration must be 1..=1440 minutes")]
    SessionDuration,
    #[error("sync interval must be 5 min..=24 h")]
    SyncInterval,
    #[error("sync timeout must be 1 s..=5 min")]
    SyncTimeout,
    #[error("at most 10 sync retries")]
    SyncRetries,
    #[error("time zone offset out of range")]
    TimeZone,
    #[error("minimum satellites must be 1..=32")]
    MinSatellites,
    #[error("maximum HDOP must be positive")]
    MaxHdop,
    #[error("minimum signal must be 0..=5")]
    MinSignal,
    #[error("transmit payload must be 1..=95 bytes")]
    Payload,
    #[error("transmit retries must be 1..=10")]
    TransmitRetries,
    #[error("batch drain interval must be at least 1000 ms")]
    DrainInterval,
    #[error("rotation threshold must be at least one payload")]
    RotationThreshold,
    #[error("failed to encode configuration")]
    Encode,
    #[error("stored configuration is unreadable")]
    Decode,
    #[error("storage error: {0}")]
    Storage(StorageError),
}

impl From<StorageError> for ConfigError {
    fn from(e: StorageError) -> Self {
        ConfigError::Storage(e)
    }
}

impl From<ConfigError> for TrackerError {
    fn from(e: ConfigError) -> Self {
        match e {
            ConfigError::Storage(e) => e.into(),
            _ => TrackerError::InvalidConfiguration,
        }
    }
}

/// Where each sample goes when it is composed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum LoggingMode {
    /// Append and flush every row as it is produced.
    #[default]
    Direct,
    /// Hold rows in RAM and write them in batches.
    Batch,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrackerConfig {
    pub version: u8,
    pub power_sample_interval_ms: u32,
    pub gnss_sample_interval_ms: u32,
    pub status_report_interval_ms: u32,
    pub session_duration_min: u16,
    pub logging_mode: LoggingMode,
    pub batch_drain_interval_ms: u32,
    pub time: TimeManagerConfig,
    pub fix_criteria: FixCriteria,
    pub min_signal_quality: u8,
    pub max_transmit_payload: u8,
    pub transmit_retries: u8,
    pub transmit_backoff_ms: u32,
    /// Append validated fixes to the compact fix log.
    pub fix_log_enabled: bool,
    /// Rotate the fix log once it grows past this many bytes.
    pub rotation_threshold_bytes: Option<u32>,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            power_sample_interval_ms: 1000,
            gnss_sample_interval_ms: 5000,
            status_report_interval_ms: 30_000,
            session_duration_min: 5,
            logging_mode: LoggingMode::Direct,
            batch_drain_interval_ms: 30_000,
            time: TimeManagerConfig::default(),
            fix_criteria: FixCriteria::default(),
            min_signal_quality: 2,
            max_transmit_payload: MAX_SBD_PAYLOAD as u8,
            transmit_retries: 3,
            transmit_backoff_ms: 5000,
            fix_log_enabled: true,
            rotation_threshold_bytes: None,
        }
    }
}

impl TrackerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.power_sample_interval_ms < MIN_POWER_INTERVAL_MS {
            return Err(ConfigError::PowerInterval);
        }
        if self.gnss_sample_interval_ms < MIN_GNSS_INTERVAL_MS {
            return Err(ConfigError::GnssInterval);
        }
        if self.status_report_interval_ms < MIN_STATUS_INTERVAL_MS {
            return Err(ConfigError::StatusInterval);
        }
        if !(1..=MAX_SESSION_MINUTES).contains(&self.session_duration_min) {
            return Err(ConfigError::SessionDuration);
        }
        if self.batch_drain_interval_ms < MIN_DRAIN_INTERVAL_MS {
            return Err(ConfigError::DrainInterval);
        }

        let time = &self.time;
        if !(MIN_SYNC_INTERVAL_MS..=MAX_SYNC_INTERVAL_MS).contains(&time.sync_interval_ms) {
            return Err(ConfigError::SyncInterval);
        }
        if !(MIN_SYNC_TIMEOUT_MS..=MAX_SYNC_TIMEOUT_MS).contains(&time.sync_timeout_ms) {
            return Err(ConfigError::SyncTimeout);
        }
        if time.max_sync_retries > MAX_SYNC_RETRIES {
            return Err(ConfigError::SyncRetries);
        }
        if !time.default_timezone.is_valid() {
            return Err(ConfigError::TimeZone);
        }

        if !(1..=32).contains(&self.fix_criteria.min_satellites) {
            return Err(ConfigError::MinSatellites);
        }
        // Also rejects NaN.
        if !(self.fix_criteria.max_hdop > 0.0) {
            return Err(ConfigError::MaxHdop);
        }

        if self.min_signal_quality > MAX_SIGNAL_BARS {
            return Err(ConfigError::MinSignal);
        }
        if !(1..=MAX_SBD_PAYLOAD).contains(&usize::from(self.max_transmit_payload)) {
            return Err(ConfigError::Payload);
        }
        if !(1..=MAX_TRANSMIT_RETRIES).contains(&self.transmit_retries) {
            return Err(ConfigError::TransmitRetries);
        }
        if self
            .rotation_threshold_bytes
            .is_some_and(|t| t < u32::from(self.max_transmit_payload))
        {
            return Err(ConfigError::RotationThreshold);
        }
        Ok(())
    }

    /// Apply `change` to a copy and commit only if the result validates.
    pub fn update(&mut self, change: impl FnOnce(&mut Self)) -> Result<(), ConfigError> {
        let mut candidate = *self;
        change(&mut candidate);
        candidate.validate()?;
        *self = candidate;
        Ok(())
    }

    pub fn timezone(&self) -> TimeZone {
        self.time.default_timezone
    }

    pub fn session_duration_ms(&self) -> u32 {
        u32::from(self.session_duration_min) * 60_000
    }

    /// Default rotation size: two transmit units.
    pub fn default_rotation_threshold(&self) -> u32 {
        2 * u32::from(self.max_transmit_payload)
    }

    pub fn transmit_settings(&self) -> TransmitSettings {
        TransmitSettings {
            max_payload: usize::from(self.max_transmit_payload),
            max_retries: self.transmit_retries,
            min_signal: self.min_signal_quality,
            backoff_ms: self.transmit_backoff_ms,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, ConfigError> {
        postcard::to_allocvec(self).map_err(|_| ConfigError::Encode)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ConfigError> {
        let config: Self = postcard::from_bytes(bytes).map_err(|_| ConfigError::Decode)?;
        if config.version != CONFIG_VERSION {
            return Err(ConfigError::Decode);
        }
        config.validate()?;
        Ok(config)
    }

    /// Read `CONFIG.BIN`, falling back to defaults when it is missing or bad.
    pub fn load(store: &mut impl FileStore) -> Self {
        match Self::read_from(store) {
            Ok(Some(config)) => {
                info!("loaded {}", CONFIG_FILE);
                config
            }
            Ok(None) => {
                info!("no {}, using defaults", CONFIG_FILE);
                Self::default()
            }
            Err(e) => {
                warn!("ignoring {}: {}", CONFIG_FILE, e);
                Self::default()
            }
        }
    }

    fn read_from(store: &mut impl FileStore) -> Result<Option<Self>, ConfigError> {
        let Some(size) = store.size(CONFIG_FILE)? else {
            return Ok(None);
        };
        let size = size as usize;
        if size == 0 || size > MAX_CONFIG_BYTES {
            return Err(ConfigError::Decode);
        }
        let mut buf = [0u8; MAX_CONFIG_BYTES];
        let n = store.read_at(CONFIG_FILE, 0, &mut buf[..size])?;
        Self::from_bytes(&buf[..n]).map(Some)
    }

    /// Write via a staging file so a reset mid-write keeps the old file.
    pub fn save(&self, store: &mut impl FileStore) -> Result<(), ConfigError> {
        self.validate()?;
        let bytes = self.to_bytes()?;

        let _ = store.remove(CONFIG_STAGING_FILE);
        let staged = store
            .create_truncated(CONFIG_STAGING_FILE)
            .and_then(|()| store.append(CONFIG_STAGING_FILE, &bytes))
            .and_then(|()| store.flush())
            .and_then(|()| store.replace(CONFIG_STAGING_FILE, CONFIG_FILE));
        if let Err(e) = staged {
            let _ = store.remove(CONFIG_STAGING_FILE);
            return Err(e.into());
        }
        info!("saved {} ({} bytes)", CONFIG_FILE, bytes.len());
        Ok(())
    }
}
