//! RTC/GNSS time coordination
//!
//! The RTC keeps local wall-clock time between fixes. Whenever the receiver
//! has a validated fix with a valid UTC time, the time manager writes that
//! time (converted to the configured zone) into the RTC. It never blocks the
//! acquisition loop: a sync attempt that cannot complete right now fails
//! immediately and is retried on the next call.

use embedded_hal::delay::DelayNs;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::clock::{deadline_reached, elapsed_ms, remaining_ms, Monotonic};
use crate::gnss::{GnssData, GnssReceiver};
use crate::record::{Timestamp, TimestampSource};
use crate::rtc::{RtcClock, RtcError};
use crate::time::{utc_to_local, DateTime, TimeZone};

pub const MIN_SYNC_INTERVAL_MS: u32 = 5 * 60 * 1000;
pub const MAX_SYNC_INTERVAL_MS: u32 = 24 * 60 * 60 * 1000;
pub const MIN_SYNC_TIMEOUT_MS: u32 = 1000;
pub const MAX_SYNC_TIMEOUT_MS: u32 = 5 * 60 * 1000;
pub const MAX_SYNC_RETRIES: u8 = 10;

/// Outcome of a time-manager operation, as shown to the operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncStatus {
    Success,
    RtcNotAvailable,
    GnssNotAvailable,
    GnssNoFix,
    GnssInvalidTime,
    RtcSetFailed,
    InvalidConfiguration,
    SyncInProgress,
    SyncNotNeeded,
    InitializationFailed,
}

impl SyncStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            SyncStatus::Success => "Success",
            SyncStatus::RtcNotAvailable => "RTC Not Available",
            SyncStatus::GnssNotAvailable => "GNSS Not Available",
            SyncStatus::GnssNoFix => "GNSS No Fix",
            SyncStatus::GnssInvalidTime => "GNSS Invalid Time",
            SyncStatus::RtcSetFailed => "RTC Set Failed",
            SyncStatus::InvalidConfiguration => "Invalid Configuration",
            SyncStatus::SyncInProgress => "Sync In Progress",
            SyncStatus::SyncNotNeeded => "Sync Not Needed",
            SyncStatus::InitializationFailed => "Initialization Failed",
        }
    }

    pub fn is_success(self) -> bool {
        self == SyncStatus::Success
    }
}

impl core::fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Steps of one sync attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Idle,
    CheckRtc,
    CheckGnss,
    GnssNoFix,
    GnssInvalidTime,
    ComputeLocal,
    RtcSet,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeManagerConfig {
    pub sync_interval_ms: u32,
    pub enable_automatic_sync: bool,
    /// Only sync from a fix that passes the receiver's validation.
    pub require_gnss_validation: bool,
    /// Keep running on the RTC alone when no receiver is present.
    pub fallback_to_rtc: bool,
    pub default_timezone: TimeZone,
    /// Upper bound on a forced sync, including retries.
    pub sync_timeout_ms: u32,
    pub max_sync_retries: u8,
}

impl Default for TimeManagerConfig {
    fn default() -> Self {
        Self {
            sync_interval_ms: 2 * 60 * 60 * 1000,
            enable_automatic_sync: true,
            require_gnss_validation: true,
            fallback_to_rtc: true,
            default_timezone: TimeZone::Cdt,
            sync_timeout_ms: 30_000,
            max_sync_retries: 3,
        }
    }
}

impl TimeManagerConfig {
    pub fn is_valid(&self) -> bool {
        (MIN_SYNC_INTERVAL_MS..=MAX_SYNC_INTERVAL_MS).contains(&self.sync_interval_ms)
            && (MIN_SYNC_TIMEOUT_MS..=MAX_SYNC_TIMEOUT_MS).contains(&self.sync_timeout_ms)
            && self.max_sync_retries <= MAX_SYNC_RETRIES
            && self.default_timezone.is_valid()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimeSyncStats {
    pub total_sync_attempts: u32,
    pub successful_syncs: u32,
    pub failed_syncs: u32,
    pub last_sync_ms: Option<u32>,
    pub last_status: Option<SyncStatus>,
    pub rtc_available: bool,
    pub gnss_available: bool,
}

impl TimeSyncStats {
    /// Percentage of attempts that succeeded, if any were made.
    pub fn success_rate_pct(&self) -> Option<f32> {
        (self.total_sync_attempts > 0)
            .then(|| 100.0 * self.successful_syncs as f32 / self.total_sync_attempts as f32)
    }
}

pub struct TimeManager {
    config: TimeManagerConfig,
    state: SyncState,
    stats: TimeSyncStats,
    initialized: bool,
    init_ms: u32,
    next_sync_ms: u32,
}

impl TimeManager {
    pub fn new(config: TimeManagerConfig) -> Self {
        Self {
            config,
            state: SyncState::Idle,
            stats: TimeSyncStats::default(),
            initialized: false,
            init_ms: 0,
            next_sync_ms: 0,
        }
    }

    /// Check the configuration and the drivers, and align the RTC's zone with
    /// ours. The first periodic sync is due immediately.
    pub fn initialize(
        &mut self,
        rtc: &mut impl RtcClock,
        gnss: &impl GnssReceiver,
        now_ms: u32,
    ) -> SyncStatus {
        if !self.config.is_valid() {
            warn!("time manager: invalid configuration");
            return SyncStatus::InvalidConfiguration;
        }

        let rtc_ready = rtc.is_ready();
        let gnss_ready = gnss.is_ready();
        if !gnss_ready {
            warn!("time manager: GNSS not ready, running on RTC");
        }
        if !rtc_ready {
            warn!("time manager: RTC not ready");
            if !self.config.fallback_to_rtc {
                self.initialized = false;
                return SyncStatus::InitializationFailed;
            }
        }

        if rtc_ready
            && rtc.timezone() != self.config.default_timezone
            && rtc.set_timezone(self.config.default_timezone).is_err()
        {
            warn!("time manager: could not store time zone in RTC");
        }

        self.stats = TimeSyncStats {
            rtc_available: rtc_ready,
            gnss_available: gnss_ready,
            ..Default::default()
        };
        self.init_ms = now_ms;
        self.next_sync_ms = now_ms;
        self.initialized = true;
        info!(
            "time manager ready, sync every {} min, zone {}",
            self.config.sync_interval_ms / 60_000,
            self.config.default_timezone
        );
        SyncStatus::Success
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn config(&self) -> &TimeManagerConfig {
        &self.config
    }

    pub fn state(&self) -> SyncState {
        self.state
    }

    pub fn stats(&self) -> &TimeSyncStats {
        &self.stats
    }

    pub fn timezone(&self) -> TimeZone {
        self.config.default_timezone
    }

    pub fn next_sync_ms(&self) -> u32 {
        self.next_sync_ms
    }

    /// Replace the configuration; an invalid one is rejected and the current
    /// one stays in effect.
    pub fn update_config(&mut self, config: TimeManagerConfig, now_ms: u32) -> SyncStatus {
        if !config.is_valid() {
            warn!("time manager: rejected invalid configuration");
            return SyncStatus::InvalidConfiguration;
        }
        self.config = config;
        self.next_sync_ms = now_ms.wrapping_add(config.sync_interval_ms);
        SyncStatus::Success
    }

    pub fn set_sync_interval(&mut self, interval_ms: u32, now_ms: u32) -> SyncStatus {
        self.update_config(
            TimeManagerConfig {
                sync_interval_ms: interval_ms,
                ..self.config
            },
            now_ms,
        )
    }

    pub fn set_automatic_sync(&mut self, enable: bool, now_ms: u32) {
        self.config.enable_automatic_sync = enable;
        if enable {
            self.next_sync_ms = now_ms.wrapping_add(self.config.sync_interval_ms);
        }
    }

    pub fn set_timezone(&mut self, rtc: &mut impl RtcClock, tz: TimeZone) -> Result<(), RtcError> {
        if !tz.is_valid() {
            return Err(RtcError::InvalidTimeZone);
        }
        rtc.set_timezone(tz)?;
        self.config.default_timezone = tz;
        info!("time zone set to {}", tz);
        Ok(())
    }

    /// Switch between standard and daylight time.
    pub fn toggle_timezone(&mut self, rtc: &mut impl RtcClock) -> Result<TimeZone, RtcError> {
        let tz = self.config.default_timezone.toggled();
        self.set_timezone(rtc, tz)?;
        Ok(tz)
    }

    pub fn is_sync_needed(&self, now_ms: u32) -> bool {
        self.initialized
            && self.config.enable_automatic_sync
            && deadline_reached(now_ms, self.next_sync_ms)
    }

    pub fn time_until_next_sync(&self, now_ms: u32) -> u32 {
        remaining_ms(now_ms, self.next_sync_ms)
    }

    pub fn time_since_last_sync(&self, now_ms: u32) -> Option<u32> {
        self.stats.last_sync_ms.map(|at| elapsed_ms(now_ms, at))
    }

    pub fn uptime_ms(&self, now_ms: u32) -> u32 {
        if self.initialized {
            elapsed_ms(now_ms, self.init_ms)
        } else {
            0
        }
    }

    pub fn reset_stats(&mut self, now_ms: u32) {
        self.stats = TimeSyncStats {
            rtc_available: self.stats.rtc_available,
            gnss_available: self.stats.gnss_available,
            ..Default::default()
        };
        self.next_sync_ms = now_ms.wrapping_add(self.config.sync_interval_ms);
    }

    /// Sync if automatic sync is on and the next sync is due. A failed attempt
    /// leaves the due time where it was; a successful one makes the next sync
    /// due one interval after it.
    pub fn periodic_sync(
        &mut self,
        rtc: &mut impl RtcClock,
        gnss: &mut impl GnssReceiver,
        now_ms: u32,
    ) -> SyncStatus {
        if !self.initialized {
            return SyncStatus::InitializationFailed;
        }
        if !self.is_sync_needed(now_ms) {
            return SyncStatus::SyncNotNeeded;
        }

        let status = self.sync_with_gnss(rtc, gnss, now_ms);
        if status.is_success() {
            self.next_sync_ms = now_ms.wrapping_add(self.config.sync_interval_ms);
        }
        status
    }

    /// One immediate sync attempt.
    pub fn sync_with_gnss(
        &mut self,
        rtc: &mut impl RtcClock,
        gnss: &mut impl GnssReceiver,
        now_ms: u32,
    ) -> SyncStatus {
        if !self.initialized {
            return SyncStatus::InitializationFailed;
        }
        if self.state != SyncState::Idle {
            return SyncStatus::SyncInProgress;
        }

        self.stats.total_sync_attempts += 1;
        let status = self.perform_sync(rtc, gnss, now_ms);
        self.state = SyncState::Idle;

        self.stats.last_status = Some(status);
        self.stats.rtc_available = rtc.is_ready();
        self.stats.gnss_available = gnss.is_ready();
        if status.is_success() {
            self.stats.successful_syncs += 1;
            self.stats.last_sync_ms = Some(now_ms);
        } else {
            self.stats.failed_syncs += 1;
            match status {
                SyncStatus::GnssNoFix | SyncStatus::GnssInvalidTime => {
                    debug!("time sync skipped: {}", status)
                }
                _ => warn!("time sync failed: {}", status),
            }
        }
        status
    }

    /// Operator-requested sync: keep trying while the receiver has no usable
    /// time, up to `max_sync_retries` extra attempts within `sync_timeout_ms`.
    /// Blocks the caller.
    pub fn force_sync(
        &mut self,
        rtc: &mut impl RtcClock,
        gnss: &mut impl GnssReceiver,
        delay: &mut impl DelayNs,
        clock: &impl Monotonic,
    ) -> SyncStatus {
        let start = clock.now_ms();
        let attempts = u32::from(self.config.max_sync_retries) + 1;
        let spacing = self.config.sync_timeout_ms / attempts;

        let mut status = SyncStatus::InitializationFailed;
        for attempt in 1..=attempts {
            status = self.sync_with_gnss(rtc, gnss, clock.now_ms());
            let retryable = matches!(status, SyncStatus::GnssNoFix | SyncStatus::GnssInvalidTime);
            if !retryable
                || attempt == attempts
                || elapsed_ms(clock.now_ms(), start) + spacing > self.config.sync_timeout_ms
            {
                break;
            }
            delay.delay_ms(spacing);
        }

        if status.is_success() {
            let now = clock.now_ms();
            self.next_sync_ms = now.wrapping_add(self.config.sync_interval_ms);
            info!("forced time sync done in {} ms", elapsed_ms(now, start));
        }
        status
    }

    fn perform_sync(
        &mut self,
        rtc: &mut impl RtcClock,
        gnss: &mut impl GnssReceiver,
        now_ms: u32,
    ) -> SyncStatus {
        self.state = SyncState::CheckRtc;
        if !rtc.is_ready() {
            return SyncStatus::RtcNotAvailable;
        }

        self.state = SyncState::CheckGnss;
        if !gnss.is_ready() {
            return SyncStatus::GnssNotAvailable;
        }
        if self.config.require_gnss_validation && !gnss.has_valid_fix(now_ms) {
            self.state = SyncState::GnssNoFix;
            return SyncStatus::GnssNoFix;
        }
        let utc = match gnss.get_time(now_ms) {
            Ok(time) if time.is_valid() => time.utc,
            _ => {
                self.state = SyncState::GnssInvalidTime;
                return SyncStatus::GnssInvalidTime;
            }
        };

        self.state = SyncState::ComputeLocal;
        if rtc.timezone() != self.config.default_timezone
            && rtc.set_timezone(self.config.default_timezone).is_err()
        {
            return SyncStatus::RtcSetFailed;
        }

        self.state = SyncState::RtcSet;
        match rtc.set_from_gnss(utc, true) {
            Ok(local) => {
                info!(
                    "RTC synced to {} {} (UTC {})",
                    local, self.config.default_timezone, utc
                );
                SyncStatus::Success
            }
            Err(e) => {
                warn!("RTC write during sync failed: {}", e);
                SyncStatus::RtcSetFailed
            }
        }
    }

    /// Write an operator-supplied local time and restart the sync interval.
    pub fn set_manual_time(
        &mut self,
        rtc: &mut impl RtcClock,
        local: DateTime,
        now_ms: u32,
    ) -> SyncStatus {
        if !self.initialized {
            return SyncStatus::RtcNotAvailable;
        }
        if !local.is_plausible() {
            warn!("manual time {} rejected", local);
            return SyncStatus::InvalidConfiguration;
        }
        match rtc.set_time(local) {
            Ok(()) => {
                info!("manual time set to {}", local);
                self.next_sync_ms = now_ms.wrapping_add(self.config.sync_interval_ms);
                SyncStatus::Success
            }
            Err(RtcError::NotAvailable) => SyncStatus::RtcNotAvailable,
            Err(_) => SyncStatus::RtcSetFailed,
        }
    }

    /// Timestamp for a record captured at `now_ms`.
    ///
    /// A valid receiver time read on this tick wins (advanced by its age);
    /// otherwise the RTC; otherwise only the monotonic tick is known.
    pub fn timestamp(
        &self,
        rtc: &mut impl RtcClock,
        gnss: Option<&GnssData>,
        now_ms: u32,
    ) -> Timestamp {
        let tz = self.config.default_timezone;

        let from_gnss = gnss
            .and_then(|data| data.time.filter(|t| t.is_valid()).map(|t| (t, data)))
            .map(|(time, data)| {
                let age_s = elapsed_ms(now_ms, data.monotonic_ms) / 1000;
                utc_to_local(time.utc.add_seconds(i64::from(age_s)), tz)
            });
        if let Some(local) = from_gnss {
            return Timestamp {
                local: Some(local),
                timezone: tz,
                source: TimestampSource::Gnss,
                monotonic_ms: now_ms,
            };
        }

        if rtc.is_ready() {
            let reading = rtc.get_timestamp(now_ms);
            if let Some(local) = reading.local {
                return Timestamp {
                    local: Some(local),
                    timezone: reading.timezone,
                    source: TimestampSource::Rtc,
                    monotonic_ms: now_ms,
                };
            }
        }

        Timestamp::unavailable(now_ms, tz)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gnss::{FixType, GnssError, GnssTime, Position};
    use crate::rtc::RtcTimestamp;
    use crate::sim::{SimClock, SimDelay};

    struct FakeRtc {
        ready: bool,
        tz: TimeZone,
        local: Option<DateTime>,
        fail_set: bool,
        writes: u32,
    }

    impl FakeRtc {
        fn new() -> Self {
            Self {
                ready: true,
                tz: TimeZone::Cdt,
                local: Some(DateTime::new(2025, 1, 1, 0, 0, 0)),
                fail_set: false,
                writes: 0,
            }
        }
    }

    impl RtcClock for FakeRtc {
        fn is_ready(&self) -> bool {
            self.ready
        }

        fn timezone(&self) -> TimeZone {
            self.tz
        }

        fn get_timestamp(&mut self, now_ms: u32) -> RtcTimestamp {
            RtcTimestamp {
                monotonic_ms: now_ms,
                local: self.local,
                hundredths: 0,
                timezone: self.tz,
            }
        }

        fn set_time(&mut self, local: DateTime) -> Result<(), RtcError> {
            if self.fail_set {
                return Err(RtcError::SetFailed);
            }
            self.writes += 1;
            self.local = Some(local);
            Ok(())
        }

        fn set_timezone(&mut self, tz: TimeZone) -> Result<(), RtcError> {
            self.tz = tz;
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeGnss {
        ready: bool,
        fix: Option<GnssData>,
        /// Fixes become available after this many reads.
        fix_after_reads: u32,
        reads: u32,
    }

    impl FakeGnss {
        fn with_fix(utc: DateTime, time_valid: bool) -> Self {
            Self {
                ready: true,
                fix: Some(GnssData {
                    fix_type: FixType::Fix3D,
                    satellites_used: 8,
                    hdop: 1.0,
                    fix_ok: true,
                    position: Some(Position {
                        latitude_deg: 29.76,
                        longitude_deg: -95.37,
                        ..Default::default()
                    }),
                    time: Some(GnssTime {
                        utc,
                        date_valid: time_valid,
                        time_valid,
                        ..Default::default()
                    }),
                    validation_passed: true,
                    ..Default::default()
                }),
                ..Default::default()
            }
        }

        fn current(&mut self, now_ms: u32) -> Option<GnssData> {
            self.reads += 1;
            if self.reads <= self.fix_after_reads {
                return None;
            }
            self.fix.map(|mut f| {
                f.monotonic_ms = now_ms;
                f
            })
        }
    }

    impl GnssReceiver for FakeGnss {
        fn is_ready(&self) -> bool {
            self.ready
        }

        fn read_position(&mut self, now_ms: u32) -> Result<GnssData, GnssError> {
            self.current(now_ms).ok_or(GnssError::NoFix)
        }

        fn get_time(&mut self, now_ms: u32) -> Result<GnssTime, GnssError> {
            self.current(now_ms)
                .and_then(|f| f.time)
                .filter(|t| t.is_valid())
                .ok_or(GnssError::InvalidTime)
        }

        fn validate_fix(&self, data: &GnssData, _now_ms: u32) -> bool {
            data.validation_passed
        }

        fn set_criteria(&mut self, _criteria: crate::gnss::FixCriteria) {}
    }

    fn utc() -> DateTime {
        DateTime::new(2025, 3, 1, 2, 30, 0)
    }

    fn manager(rtc: &mut FakeRtc, gnss: &FakeGnss, now: u32) -> TimeManager {
        let mut tm = TimeManager::new(TimeManagerConfig::default());
        assert_eq!(tm.initialize(rtc, gnss, now), SyncStatus::Success);
        tm
    }

    #[test]
    fn test_config_bounds() {
        assert!(TimeManagerConfig::default().is_valid());
        let base = TimeManagerConfig::default();
        assert!(!TimeManagerConfig { sync_interval_ms: MIN_SYNC_INTERVAL_MS - 1, ..base }.is_valid());
        assert!(!TimeManagerConfig { sync_interval_ms: MAX_SYNC_INTERVAL_MS + 1, ..base }.is_valid());
        assert!(!TimeManagerConfig { sync_timeout_ms: 999, ..base }.is_valid());
        assert!(!TimeManagerConfig { max_sync_retries: 11, ..base }.is_valid());
    }

    #[test]
    fn test_periodic_sync_failure_keeps_deadline() {
        let mut rtc = FakeRtc::new();
        let mut gnss = FakeGnss {
            ready: true,
            ..Default::default()
        };
        let mut tm = manager(&mut rtc, &gnss, 1000);
        let due = tm.next_sync_ms();

        assert_eq!(tm.periodic_sync(&mut rtc, &mut gnss, 1000), SyncStatus::GnssNoFix);
        assert_eq!(tm.next_sync_ms(), due);
        assert_eq!(tm.periodic_sync(&mut rtc, &mut gnss, 2000), SyncStatus::GnssNoFix);
        assert_eq!(tm.next_sync_ms(), due);
        assert_eq!(tm.stats().failed_syncs, 2);
        assert_eq!(rtc.writes, 0);
    }

    #[test]
    fn test_periodic_sync_success_advances_by_interval() {
        let mut rtc = FakeRtc::new();
        let mut gnss = FakeGnss::with_fix(utc(), true);
        let mut tm = manager(&mut rtc, &gnss, 1000);
        let due = tm.next_sync_ms();

        assert_eq!(tm.periodic_sync(&mut rtc, &mut gnss, 1000), SyncStatus::Success);
        assert_eq!(tm.next_sync_ms(), due + tm.config().sync_interval_ms);
        assert_eq!(tm.next_sync_ms(), tm.stats().last_sync_ms.unwrap() + 7_200_000);
        // CDT is UTC-5
        assert_eq!(rtc.local, Some(DateTime::new(2025, 2, 28, 21, 30, 0)));

        assert_eq!(tm.periodic_sync(&mut rtc, &mut gnss, 5000), SyncStatus::SyncNotNeeded);
        assert_eq!(tm.stats().successful_syncs, 1);
        assert_eq!(tm.time_since_last_sync(5000), Some(4000));
        assert_eq!(tm.time_until_next_sync(5000), due + 7_200_000 - 5000);
        assert_eq!(tm.state(), SyncState::Idle);
    }

    #[test]
    fn test_late_sync_rearms_from_sync_time() {
        let mut rtc = FakeRtc::new();
        let mut gnss = FakeGnss {
            ready: true,
            ..Default::default()
        };
        let mut tm = manager(&mut rtc, &gnss, 0);

        // No fix for the first half hour past the deadline.
        assert_eq!(tm.periodic_sync(&mut rtc, &mut gnss, 0), SyncStatus::GnssNoFix);
        gnss = FakeGnss::with_fix(utc(), true);
        assert_eq!(tm.periodic_sync(&mut rtc, &mut gnss, 1_800_000), SyncStatus::Success);
        assert_eq!(tm.stats().last_sync_ms, Some(1_800_000));
        assert_eq!(tm.next_sync_ms(), 1_800_000 + 7_200_000);
        assert_eq!(
            tm.periodic_sync(&mut rtc, &mut gnss, 7_200_000),
            SyncStatus::SyncNotNeeded
        );
    }

    #[test]
    fn test_periodic_sync_disabled() {
        let mut rtc = FakeRtc::new();
        let mut gnss = FakeGnss::with_fix(utc(), true);
        let mut tm = manager(&mut rtc, &gnss, 0);
        tm.set_automatic_sync(false, 0);
        assert_eq!(tm.periodic_sync(&mut rtc, &mut gnss, 10), SyncStatus::SyncNotNeeded);
        assert_eq!(rtc.writes, 0);
    }

    #[test]
    fn test_invalid_time_declines_sync() {
        let mut rtc = FakeRtc::new();
        let mut gnss = FakeGnss::with_fix(utc(), false);
        let mut tm = manager(&mut rtc, &gnss, 0);
        assert_eq!(tm.sync_with_gnss(&mut rtc, &mut gnss, 0), SyncStatus::GnssInvalidTime);
        assert_eq!(rtc.writes, 0);
    }

    #[test]
    fn test_rtc_write_failure_reported() {
        let mut rtc = FakeRtc::new();
        rtc.fail_set = true;
        let mut gnss = FakeGnss::with_fix(utc(), true);
        let mut tm = manager(&mut rtc, &gnss, 0);
        let due = tm.next_sync_ms();
        assert_eq!(tm.periodic_sync(&mut rtc, &mut gnss, 0), SyncStatus::RtcSetFailed);
        assert_eq!(tm.next_sync_ms(), due);
        assert_eq!(tm.stats().last_status, Some(SyncStatus::RtcSetFailed));
    }

    #[test]
    fn test_missing_drivers() {
        let mut rtc = FakeRtc::new();
        let mut gnss = FakeGnss::default();
        let mut tm = manager(&mut rtc, &gnss, 0);
        assert_eq!(tm.sync_with_gnss(&mut rtc, &mut gnss, 0), SyncStatus::GnssNotAvailable);

        rtc.ready = false;
        assert_eq!(tm.sync_with_gnss(&mut rtc, &mut gnss, 0), SyncStatus::RtcNotAvailable);

        let mut strict = TimeManager::new(TimeManagerConfig {
            fallback_to_rtc: false,
            ..Default::default()
        });
        assert_eq!(strict.initialize(&mut rtc, &gnss, 0), SyncStatus::InitializationFailed);
        assert_eq!(strict.periodic_sync(&mut rtc, &mut gnss, 0), SyncStatus::InitializationFailed);
    }

    #[test]
    fn test_initialize_aligns_rtc_zone() {
        let mut rtc = FakeRtc::new();
        rtc.tz = TimeZone::Utc;
        let gnss = FakeGnss::default();
        let mut tm = TimeManager::new(TimeManagerConfig {
            default_timezone: TimeZone::Cst,
            ..Default::default()
        });
        tm.initialize(&mut rtc, &gnss, 0);
        assert_eq!(rtc.tz, TimeZone::Cst);
    }

    #[test]
    fn test_force_sync_retries_until_fix() {
        let clock = SimClock::new();
        let mut delay = SimDelay::new(clock.clone());
        let mut rtc = FakeRtc::new();
        let mut gnss = FakeGnss::with_fix(utc(), true);
        gnss.fix_after_reads = 2;
        let mut tm = manager(&mut rtc, &gnss, 0);

        let status = tm.force_sync(&mut rtc, &mut gnss, &mut delay, &clock);
        assert_eq!(status, SyncStatus::Success);
        assert_eq!(tm.stats().total_sync_attempts, 3);
        // 30 s split over four attempts
        assert_eq!(clock.now(), 2 * 7500);
        assert_eq!(tm.next_sync_ms(), clock.now() + tm.config().sync_interval_ms);
    }

    #[test]
    fn test_force_sync_gives_up() {
        let clock = SimClock::new();
        let mut delay = SimDelay::new(clock.clone());
        let mut rtc = FakeRtc::new();
        let mut gnss = FakeGnss {
            ready: true,
            ..Default::default()
        };
        let mut tm = manager(&mut rtc, &gnss, 0);
        assert_eq!(
            tm.force_sync(&mut rtc, &mut gnss, &mut delay, &clock),
            SyncStatus::GnssNoFix
        );
        assert_eq!(tm.stats().total_sync_attempts, 4);
        assert!(clock.now() <= tm.config().sync_timeout_ms);
    }

    #[test]
    fn test_update_config_rejects_invalid() {
        let mut rtc = FakeRtc::new();
        let gnss = FakeGnss::default();
        let mut tm = manager(&mut rtc, &gnss, 0);
        assert_eq!(tm.set_sync_interval(1000, 0), SyncStatus::InvalidConfiguration);
        assert_eq!(tm.config().sync_interval_ms, 7_200_000);
        assert_eq!(tm.set_sync_interval(600_000, 50), SyncStatus::Success);
        assert_eq!(tm.next_sync_ms(), 600_050);
    }

    #[test]
    fn test_timezone_toggle_and_manual_time() {
        let mut rtc = FakeRtc::new();
        let gnss = FakeGnss::default();
        let mut tm = manager(&mut rtc, &gnss, 0);

        assert_eq!(tm.toggle_timezone(&mut rtc), Ok(TimeZone::Cst));
        assert_eq!(rtc.tz, TimeZone::Cst);

        let local = DateTime::new(2025, 6, 1, 12, 0, 0);
        assert_eq!(tm.set_manual_time(&mut rtc, local, 100), SyncStatus::Success);
        assert_eq!(rtc.local, Some(local));
        assert_eq!(
            tm.set_manual_time(&mut rtc, DateTime::new(2025, 2, 30, 0, 0, 0), 100),
            SyncStatus::InvalidConfiguration
        );
        assert_eq!(
            tm.set_manual_time(&mut rtc, DateTime::new(2045, 6, 1, 12, 0, 0), 100),
            SyncStatus::InvalidConfiguration
        );
        assert_eq!(
            tm.set_manual_time(&mut rtc, DateTime::new(2000, 1, 1, 0, 0, 0), 100),
            SyncStatus::InvalidConfiguration
        );
        assert_eq!(rtc.local, Some(local));
    }

    #[test]
    fn test_timestamp_sources() {
        let mut rtc = FakeRtc::new();
        let mut gnss = FakeGnss::with_fix(utc(), true);
        let tm = manager(&mut rtc, &gnss, 0);

        let fix = gnss.read_position(1000).unwrap();
        let ts = tm.timestamp(&mut rtc, Some(&fix), 3500);
        assert_eq!(ts.source, TimestampSource::Gnss);
        // two whole seconds old, CDT
        assert_eq!(ts.local, Some(DateTime::new(2025, 2, 28, 21, 30, 2)));
        assert_eq!(ts.monotonic_ms, 3500);

        let ts = tm.timestamp(&mut rtc, None, 4000);
        assert_eq!(ts.source, TimestampSource::Rtc);
        assert_eq!(ts.local, rtc.local);

        rtc.ready = false;
        let ts = tm.timestamp(&mut rtc, None, 4500);
        assert_eq!(ts.source, TimestampSource::Unavailable);
        assert_eq!(ts.local, None);
        assert_eq!(ts.monotonic_ms, 4500);
    }
}
