//! Root application state for the tracker
//!
//! [`System`] owns every peripheral driver, the time manager, the scheduler,
//! the card and the modem. The main loop calls [`System::poll`]; operator
//! commands go through [`System::handle_command`] between polls, so they
//! never interleave with a sample tick.

mod command;

pub use command::*;

use embedded_hal::delay::DelayNs;
use log::{info, warn};

use crate::clock::Monotonic;
use crate::config::TrackerConfig;
use crate::error::TrackerError;
use crate::gnss::GnssReceiver;
use crate::rtc::{RtcClock, TimeAdjustment};
use crate::scheduler::{AcquisitionState, Devices, Scheduler, TickOutcome};
use crate::sensors::{PowerReading, Sensor};
use crate::storage::{recover_after_reset, FileStore, StorageError};
use crate::time_manager::{SyncStatus, TimeManager};
use crate::transmit::{ModemError, SbdModem, TransmitPipeline};

pub struct System<S, R, G, F, M, D, C>
where
    S: Sensor<Readings = PowerReading>,
    R: RtcClock,
    G: GnssReceiver,
    F: FileStore,
    M: SbdModem,
    D: DelayNs,
    C: Monotonic,
{
    pub devices: Devices<S, R, G>,
    pub store: F,
    /// `None` when no modem answered at boot.
    pub modem: Option<M>,
    time: TimeManager,
    scheduler: Scheduler,
    pipeline: TransmitPipeline,
    delay: D,
    clock: C,
}

impl<S, R, G, F, M, D, C> System<S, R, G, F, M, D, C>
where
    S: Sensor<Readings = PowerReading>,
    R: RtcClock,
    G: GnssReceiver,
    F: FileStore,
    M: SbdModem,
    D: DelayNs,
    C: Monotonic,
{
    /// Clean up after an interrupted shift, load `CONFIG.BIN` and bring up
    /// the time manager. Drivers are expected to be initialized already.
    pub fn new(
        mut devices: Devices<S, R, G>,
        mut store: F,
        modem: Option<M>,
        delay: D,
        clock: C,
    ) -> Result<Self, TrackerError> {
        recover_after_reset(&mut store)?;
        let config = TrackerConfig::load(&mut store);
        devices.gnss.set_criteria(config.fix_criteria);

        let mut time = TimeManager::new(config.time);
        let status = time.initialize(&mut devices.rtc, &devices.gnss, clock.now_ms());
        if !status.is_success() {
            warn!("time manager: {}", status);
        }
        if modem.is_none() {
            warn!("no satellite modem, transmission disabled");
        }

        Ok(Self {
            devices,
            store,
            modem,
            time,
            scheduler: Scheduler::new(config)?,
            pipeline: TransmitPipeline::new(config.transmit_settings()),
            delay,
            clock,
        })
    }

    pub fn config(&self) -> &TrackerConfig {
        self.scheduler.config()
    }

    pub fn state(&self) -> AcquisitionState {
        self.scheduler.state()
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn time_manager(&self) -> &TimeManager {
        &self.time
    }

    pub fn pipeline(&self) -> &TransmitPipeline {
        &self.pipeline
    }

    pub fn now_ms(&self) -> u32 {
        self.clock.now_ms()
    }

    /// One pass of the main loop.
    pub fn poll(&mut self) -> TickOutcome {
        self.scheduler
            .tick(&mut self.devices, &mut self.time, &mut self.store, &self.clock)
    }

    pub fn handle_command(&mut self, command: Command) -> CommandStatus {
        let now = self.clock.now_ms();
        info!("command: {:?}", command);

        match command {
            Command::Start => {
                if self.scheduler.is_logging() {
                    return CommandStatus::NoChange;
                }
                match self.scheduler.start(&mut self.store, now) {
                    Ok(()) => CommandStatus::Done,
                    Err(e) => CommandStatus::failed(e),
                }
            }
            Command::Stop => {
                if !self.scheduler.is_logging() {
                    return CommandStatus::NoChange;
                }
                match self.scheduler.stop(&mut self.store) {
                    Ok(()) => CommandStatus::Done,
                    Err(e) => CommandStatus::failed(e),
                }
            }
            Command::SetLoggingMode(mode) => self.configure(|c| c.logging_mode = mode),
            Command::SetSessionDuration { minutes } => {
                self.configure(|c| c.session_duration_min = minutes)
            }
            Command::SetPowerInterval { ms } => self.configure(|c| c.power_sample_interval_ms = ms),
            Command::SetGnssInterval { ms } => self.configure(|c| c.gnss_sample_interval_ms = ms),
            Command::SetStatusInterval { ms } => {
                self.configure(|c| c.status_report_interval_ms = ms)
            }
            Command::SetSyncInterval { ms } => {
                let status = self.configure(|c| c.time.sync_interval_ms = ms);
                if status.is_ok() {
                    self.time.set_sync_interval(ms, now);
                }
                status
            }
            Command::SetTimeZone(tz) => {
                // The RTC keeps the zone too; only persist once it has it.
                if let Err(e) = self.time.set_timezone(&mut self.devices.rtc, tz) {
                    return CommandStatus::failed(e);
                }
                let status = self.configure(|c| c.time.default_timezone = tz);
                if status.is_ok() {
                    CommandStatus::TimeZoneSet(tz)
                } else {
                    status
                }
            }
            Command::AdjustTime(adjustment) => self.adjust_time(adjustment, now),
            Command::SyncTime => CommandStatus::Synced(self.time.force_sync(
                &mut self.devices.rtc,
                &mut self.devices.gnss,
                &mut self.delay,
                &self.clock,
            )),
            Command::Transmit(source) => self.transmit(&source),
            Command::DeleteFile(name) => {
                let result = self
                    .scheduler
                    .release_log(&mut self.store, &name)
                    .and_then(|()| {
                        if self.store.exists(&name)? {
                            self.store.remove(&name)
                        } else {
                            Err(StorageError::NotFound)
                        }
                    });
                match result {
                    Ok(()) => {
                        info!("deleted {}", name);
                        CommandStatus::Done
                    }
                    Err(e) => CommandStatus::failed(e),
                }
            }
            Command::FileSize(name) => match self.store.size(&name) {
                Ok(Some(bytes)) => CommandStatus::FileSize { name, bytes },
                Ok(None) => CommandStatus::failed(StorageError::NotFound),
                Err(e) => CommandStatus::failed(e),
            },
        }
    }

    /// Validate and apply a configuration change, then persist it.
    fn configure(&mut self, change: impl FnOnce(&mut TrackerConfig)) -> CommandStatus {
        let now = self.clock.now_ms();
        if let Err(e) = self.scheduler.update_config(&mut self.store, now, change) {
            warn!("configuration change rejected: {}", e);
            return CommandStatus::failed(e);
        }

        let config = *self.scheduler.config();
        self.pipeline.set_settings(config.transmit_settings());
        self.devices.gnss.set_criteria(config.fix_criteria);
        if let Err(e) = config.save(&mut self.store) {
            warn!("configuration applied but not saved: {}", e);
        }
        CommandStatus::Done
    }

    fn adjust_time(&mut self, adjustment: TimeAdjustment, now: u32) -> CommandStatus {
        match adjustment {
            TimeAdjustment::ToggleTimeZone => {
                match self.time.toggle_timezone(&mut self.devices.rtc) {
                    Ok(tz) => {
                        let status = self.configure(|c| c.time.default_timezone = tz);
                        if status.is_ok() {
                            CommandStatus::TimeZoneSet(tz)
                        } else {
                            status
                        }
                    }
                    Err(e) => CommandStatus::failed(e),
                }
            }
            TimeAdjustment::SetCustom(local) => {
                match self.time.set_manual_time(&mut self.devices.rtc, local, now) {
                    SyncStatus::Success => CommandStatus::TimeSet(local),
                    status => CommandStatus::Synced(status),
                }
            }
            _ => match self.devices.rtc.apply_time_adjustment(adjustment) {
                Ok(local) => CommandStatus::TimeSet(local),
                Err(e) => CommandStatus::failed(e),
            },
        }
    }

    /// Blocking: acquisition pauses until the modem session ends.
    fn transmit(&mut self, source: &TransmitSource) -> CommandStatus {
        let Some(modem) = self.modem.as_mut() else {
            return CommandStatus::failed(ModemError::NoModemDetected);
        };
        let name = source.file_name();

        if let Err(e) = self.scheduler.release_log(&mut self.store, name) {
            return CommandStatus::failed(e);
        }
        match self
            .pipeline
            .transmit_file(&mut self.store, name, modem, &mut self.delay, &self.clock)
        {
            Ok(report) => CommandStatus::Transmitted(report),
            Err(e) => {
                warn!("transmit {} failed: {}", name, e);
                CommandStatus::failed(e)
            }
        }
    }
}
