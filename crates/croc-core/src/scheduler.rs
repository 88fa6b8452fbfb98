//! Acquisition scheduler
//!
//! Drives the power, GNSS, status and batch-drain timers off the monotonic
//! tick. A power tick reads the three rails, optionally the receiver, stamps
//! the record after the reads and routes it to the data log either directly
//! or through the [`RecordBuffer`]. Every timer that fires is re-armed at
//! `now + interval`.
//!
//! Nothing here blocks for long: the only waits are the bus transactions
//! inside the drivers and the card writes.

use log::{debug, info, warn};

use crate::clock::{deadline_reached, elapsed_ms, remaining_ms, Monotonic};
use crate::config::{ConfigError, LoggingMode, TrackerConfig};
use crate::gnss::{GnssData, GnssReceiver};
use crate::record::{
    efficiency_pct, fix_log_line, gnss_power_estimate_mw, GnssSample, SampleRecord, CSV_HEADER,
};
use crate::rtc::RtcClock;
use crate::sensors::{PowerReading, PowerSensors, Sensor};
use crate::storage::buffer::DEFAULT_CAPACITY;
use crate::storage::{
    FileName, FileStore, LogWriter, RecordBuffer, StorageError, DATA_LOG_FILE, FIX_LOG_FILE,
};
use crate::time_manager::{SyncStatus, TimeManager};

/// The peripherals a tick touches.
pub struct Devices<S, R, G> {
    pub sensors: PowerSensors<S>,
    pub rtc: R,
    pub gnss: G,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquisitionState {
    /// Not logging; waiting for a start command.
    Idle,
    Logging {
        started_ms: u32,
        deadline_ms: u32,
    },
    /// The session ran to its deadline. Only a new start leaves this state.
    SessionComplete,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    pub sessions: u32,
    pub samples: u32,
    /// Individual rail reads that failed and were logged as zero.
    pub sensor_failures: u32,
    pub write_failures: u32,
    pub gnss_reads: u32,
    pub gnss_valid: u32,
    pub gnss_failures: u32,
    pub fix_lines: u32,
    pub rotations: u32,
    pub drains: u32,
}

/// What one call to [`Scheduler::tick`] did.
#[derive(Debug, Clone, PartialEq)]
pub struct TickOutcome {
    pub record: Option<SampleRecord>,
    pub sync: SyncStatus,
    pub rotated: Option<FileName>,
    pub session_complete: bool,
}

impl Default for TickOutcome {
    fn default() -> Self {
        Self {
            record: None,
            sync: SyncStatus::SyncNotNeeded,
            rotated: None,
            session_complete: false,
        }
    }
}

pub struct Scheduler<const N: usize = DEFAULT_CAPACITY> {
    config: TrackerConfig,
    state: AcquisitionState,
    next_power_ms: u32,
    next_gnss_ms: u32,
    next_status_ms: u32,
    next_drain_ms: u32,
    baseline_load_mw: Option<f32>,
    buffer: RecordBuffer<N>,
    data_log: LogWriter,
    fix_log: LogWriter,
    stats: SchedulerStats,
}

impl<const N: usize> Scheduler<N> {
    pub fn new(config: TrackerConfig) -> Result<Self, StorageError> {
        Ok(Self {
            config,
            state: AcquisitionState::Idle,
            next_power_ms: 0,
            next_gnss_ms: 0,
            next_status_ms: 0,
            next_drain_ms: 0,
            baseline_load_mw: None,
            buffer: RecordBuffer::new(),
            data_log: LogWriter::new(DATA_LOG_FILE, Some(CSV_HEADER))?,
            fix_log: LogWriter::new(FIX_LOG_FILE, None)?,
            stats: SchedulerStats::default(),
        })
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    pub fn state(&self) -> AcquisitionState {
        self.state
    }

    pub fn is_logging(&self) -> bool {
        matches!(self.state, AcquisitionState::Logging { .. })
    }

    pub fn stats(&self) -> &SchedulerStats {
        &self.stats
    }

    pub fn buffer(&self) -> &RecordBuffer<N> {
        &self.buffer
    }

    pub fn data_log(&self) -> &LogWriter {
        &self.data_log
    }

    pub fn fix_log(&self) -> &LogWriter {
        &self.fix_log
    }

    /// Load power captured on the first record composed without a valid fix.
    pub fn baseline_load_mw(&self) -> Option<f32> {
        self.baseline_load_mw
    }

    pub fn session_remaining_ms(&self, now_ms: u32) -> Option<u32> {
        match self.state {
            AcquisitionState::Logging { deadline_ms, .. } => Some(remaining_ms(now_ms, deadline_ms)),
            _ => None,
        }
    }

    /// Open the data log and arm every timer one interval out.
    pub fn start(&mut self, store: &mut impl FileStore, now_ms: u32) -> Result<(), StorageError> {
        if self.is_logging() {
            return Ok(());
        }
        self.data_log.open(store)?;

        self.state = AcquisitionState::Logging {
            started_ms: now_ms,
            deadline_ms: now_ms.wrapping_add(self.config.session_duration_ms()),
        };
        self.arm_timers(now_ms);
        self.stats.sessions += 1;
        info!(
            "logging started: {} min session, {:?} mode, power every {} ms, GNSS every {} ms",
            self.config.session_duration_min,
            self.config.logging_mode,
            self.config.power_sample_interval_ms,
            self.config.gnss_sample_interval_ms
        );
        Ok(())
    }

    /// Drain, close and go idle.
    pub fn stop(&mut self, store: &mut impl FileStore) -> Result<(), StorageError> {
        if !self.is_logging() {
            return Ok(());
        }
        let result = self.wind_down(store);
        self.state = AcquisitionState::Idle;
        info!("logging stopped after {} samples", self.stats.samples);
        result
    }

    /// Apply a configuration change between ticks. A rejected change keeps the
    /// previous configuration. Leaving batch mode drains the buffer.
    pub fn update_config(
        &mut self,
        store: &mut impl FileStore,
        now_ms: u32,
        change: impl FnOnce(&mut TrackerConfig),
    ) -> Result<(), ConfigError> {
        let previous = self.config;
        self.config.update(change)?;
        let config = self.config;

        if previous.logging_mode == LoggingMode::Batch && config.logging_mode == LoggingMode::Direct {
            self.drain(store)?;
        }

        if let AcquisitionState::Logging { started_ms, .. } = self.state {
            if previous.session_duration_min != config.session_duration_min {
                self.state = AcquisitionState::Logging {
                    started_ms,
                    deadline_ms: started_ms.wrapping_add(config.session_duration_ms()),
                };
            }
            if previous.power_sample_interval_ms != config.power_sample_interval_ms {
                self.next_power_ms = now_ms.wrapping_add(config.power_sample_interval_ms);
            }
            if previous.gnss_sample_interval_ms != config.gnss_sample_interval_ms {
                self.next_gnss_ms = now_ms.wrapping_add(config.gnss_sample_interval_ms);
            }
            if previous.status_report_interval_ms != config.status_report_interval_ms {
                self.next_status_ms = now_ms.wrapping_add(config.status_report_interval_ms);
            }
            if previous.batch_drain_interval_ms != config.batch_drain_interval_ms
                || previous.logging_mode != config.logging_mode
            {
                self.next_drain_ms = now_ms.wrapping_add(config.batch_drain_interval_ms);
            }
        }
        Ok(())
    }

    /// Close whichever log is called `name` so another user can rewrite it.
    /// The writer reopens on its next append.
    pub fn release_log(&mut self, store: &mut impl FileStore, name: &str) -> Result<(), StorageError> {
        if self.data_log.name() == name {
            if self.config.logging_mode == LoggingMode::Batch {
                self.drain(store)?;
            }
            self.data_log.close(store)?;
        }
        if self.fix_log.name() == name {
            self.fix_log.close(store)?;
        }
        Ok(())
    }

    /// Write every buffered record to the data log. On failure the records stay buffered.
    pub fn drain(&mut self, store: &mut impl FileStore) -> Result<usize, StorageError> {
        match self.buffer.drain(&mut self.data_log, store) {
            Ok(0) => Ok(0),
            Ok(n) => {
                self.stats.drains += 1;
                Ok(n)
            }
            Err(e) => {
                self.stats.write_failures += 1;
                warn!("batch drain of {} records failed: {}", self.buffer.len(), e);
                Err(e)
            }
        }
    }

    /// Run whatever is due. Call once per loop iteration.
    pub fn tick<S, R, G>(
        &mut self,
        devices: &mut Devices<S, R, G>,
        time: &mut TimeManager,
        store: &mut impl FileStore,
        clock: &impl Monotonic,
    ) -> TickOutcome
    where
        S: Sensor<Readings = PowerReading>,
        R: RtcClock,
        G: GnssReceiver,
    {
        let now = clock.now_ms();
        let mut outcome = TickOutcome::default();

        if let AcquisitionState::Logging { deadline_ms, .. } = self.state {
            if deadline_reached(now, deadline_ms) {
                self.finish_session(store);
                outcome.session_complete = true;
            } else {
                if deadline_reached(now, self.next_power_ms) {
                    self.next_power_ms = now.wrapping_add(self.config.power_sample_interval_ms);
                    let (record, rotated) = self.sample(devices, time, store, clock, now);
                    outcome.record = Some(record);
                    outcome.rotated = rotated;
                }

                if self.config.logging_mode == LoggingMode::Batch {
                    let timer_due = deadline_reached(now, self.next_drain_ms);
                    if timer_due {
                        self.next_drain_ms = now.wrapping_add(self.config.batch_drain_interval_ms);
                    }
                    if timer_due || self.buffer.is_almost_full() {
                        let _ = self.drain(store);
                    }
                }

                if deadline_reached(now, self.next_status_ms) {
                    self.next_status_ms = now.wrapping_add(self.config.status_report_interval_ms);
                    self.report_status(time, now);
                }
            }
        }

        outcome.sync = time.periodic_sync(&mut devices.rtc, &mut devices.gnss, now);
        outcome
    }

    fn sample<S, R, G>(
        &mut self,
        devices: &mut Devices<S, R, G>,
        time: &mut TimeManager,
        store: &mut impl FileStore,
        clock: &impl Monotonic,
        now: u32,
    ) -> (SampleRecord, Option<FileName>)
    where
        S: Sensor<Readings = PowerReading>,
        R: RtcClock,
        G: GnssReceiver,
    {
        let ([solar, battery, load], failures) = devices.sensors.read_all();
        self.stats.sensor_failures += u32::from(failures);

        let gnss_data = if deadline_reached(now, self.next_gnss_ms) {
            self.next_gnss_ms = now.wrapping_add(self.config.gnss_sample_interval_ms);
            self.read_gnss(&mut devices.gnss, clock.now_ms())
        } else {
            None
        };

        // Stamped after the reads so the time reflects when the values were taken.
        let timestamp = time.timestamp(&mut devices.rtc, gnss_data.as_ref(), clock.now_ms());

        let mut record = SampleRecord {
            timestamp,
            gnss: gnss_data.as_ref().map(GnssSample::from_data),
            solar,
            battery,
            load,
            gnss_power_mw: 0.0,
            efficiency_pct: efficiency_pct(load.power_mw, solar.power_mw),
        };
        if !record.gnss_valid() && self.baseline_load_mw.is_none() {
            debug!("load baseline {:.2} mW", load.power_mw);
            self.baseline_load_mw = Some(load.power_mw);
        }
        record.gnss_power_mw = gnss_power_estimate_mw(load.power_mw, self.baseline_load_mw);

        self.route(store, &record);
        self.stats.samples += 1;

        let rotated = match gnss_data {
            Some(data) if self.config.fix_log_enabled => self.log_fix(store, &data, now),
            _ => None,
        };
        (record, rotated)
    }

    fn read_gnss(&mut self, gnss: &mut impl GnssReceiver, now: u32) -> Option<GnssData> {
        if !gnss.is_ready() {
            return None;
        }
        self.stats.gnss_reads += 1;
        match gnss.read_position(now) {
            Ok(mut data) => {
                data.validation_passed = gnss.validate_fix(&data, now);
                if data.validation_passed {
                    self.stats.gnss_valid += 1;
                }
                Some(data)
            }
            Err(e) => {
                self.stats.gnss_failures += 1;
                debug!("GNSS read: {}", e);
                None
            }
        }
    }

    fn route(&mut self, store: &mut impl FileStore, record: &SampleRecord) {
        match self.config.logging_mode {
            LoggingMode::Direct => {
                let written = record
                    .to_csv_row()
                    .map_err(|_| StorageError::WriteFailed)
                    .and_then(|row| self.data_log.append(store, row.as_bytes()))
                    .and_then(|()| self.data_log.flush(store));
                if let Err(e) = written {
                    self.stats.write_failures += 1;
                    warn!("sample at {} ms not written: {}", record.timestamp.monotonic_ms, e);
                }
            }
            LoggingMode::Batch => {
                self.buffer.push(*record);
            }
        }
    }

    fn log_fix(&mut self, store: &mut impl FileStore, data: &GnssData, now: u32) -> Option<FileName> {
        let line = fix_log_line(data)?;
        let written = self
            .fix_log
            .append(store, line.as_bytes())
            .and_then(|()| self.fix_log.flush(store));
        if let Err(e) = written {
            self.stats.write_failures += 1;
            warn!("fix log write failed: {}", e);
            return None;
        }
        self.stats.fix_lines += 1;

        let threshold = self.config.rotation_threshold_bytes?;
        match self.fix_log.rotate_if_larger(store, threshold, now / 1000) {
            Ok(Some(name)) => {
                self.stats.rotations += 1;
                Some(name)
            }
            Ok(None) => None,
            Err(e) => {
                warn!("fix log rotation failed: {}", e);
                None
            }
        }
    }

    fn report_status(&self, time: &TimeManager, now: u32) {
        let sync = time.stats();
        info!(
            "status: {} samples, {} sensor failures, {} write failures, {} dropped, {} buffered, \
             GNSS {}/{} valid, sync {} ok {} failed, next sync in {} s, session {} s left",
            self.stats.samples,
            self.stats.sensor_failures,
            self.stats.write_failures,
            self.buffer.dropped(),
            self.buffer.len(),
            self.stats.gnss_valid,
            self.stats.gnss_reads,
            sync.successful_syncs,
            sync.failed_syncs,
            time.time_until_next_sync(now) / 1000,
            self.session_remaining_ms(now).unwrap_or(0) / 1000
        );
    }

    fn finish_session(&mut self, store: &mut impl FileStore) {
        if let AcquisitionState::Logging { started_ms, deadline_ms } = self.state {
            info!(
                "session complete after {} s, {} samples",
                elapsed_ms(deadline_ms, started_ms) / 1000,
                self.stats.samples
            );
        }
        if let Err(e) = self.wind_down(store) {
            warn!("closing session: {}", e);
        }
        self.state = AcquisitionState::SessionComplete;
    }

    fn wind_down(&mut self, store: &mut impl FileStore) -> Result<(), StorageError> {
        let drained = self.drain(store).map(|_| ());
        let data = self.data_log.close(store);
        let fix = self.fix_log.close(store);
        drained.and(data).and(fix)
    }

    fn arm_timers(&mut self, now: u32) {
        self.next_power_ms = now.wrapping_add(self.config.power_sample_interval_ms);
        self.next_gnss_ms = now.wrapping_add(self.config.gnss_sample_interval_ms);
        self.next_status_ms = now.wrapping_add(self.config.status_report_interval_ms);
        self.next_drain_ms = now.wrapping_add(self.config.batch_drain_interval_ms);
    }
}
