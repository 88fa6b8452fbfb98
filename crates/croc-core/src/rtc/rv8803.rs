//! Micro Crystal RV-8803 real-time clock
//!
//! Time is kept in local time. The configured zone lives in the user RAM
//! register as signed quarter hours so it survives a controller reset.

use embedded_hal::i2c::I2c;
use log::{error, info, warn};

use super::{RtcClock, RtcConfig, RtcError, RtcState, RtcTimestamp};
use crate::bus::RegisterBus;
use crate::time::{self, DateTime, TimeZone};

pub const RV8803_ADDRESS: u8 = 0x32;

const REG_RAM: u8 = 0x07;
const REG_HUNDREDTHS: u8 = 0x10;
const REG_SECONDS: u8 = 0x11;
const REG_FLAG: u8 = 0x1E;

/// Voltage dropped below the oscillator limit; stored time is lost.
const FLAG_V2F: u8 = 1 << 1;

pub(crate) fn bcd_to_bin(v: u8) -> u8 {
    (v >> 4) * 10 + (v & 0x0F)
}

pub(crate) fn bin_to_bcd(v: u8) -> u8 {
    ((v / 10) << 4) | (v % 10)
}

/// Day of week, Sunday = 0.
pub(crate) fn weekday(dt: &DateTime) -> u8 {
    // 1970-01-01 was a Thursday.
    (dt.to_epoch_seconds().div_euclid(86_400) + 4).rem_euclid(7) as u8
}

pub struct Rv8803<I> {
    bus: RegisterBus<I>,
    address: u8,
    state: RtcState,
    timezone: TimeZone,
}

impl<I: I2c> Rv8803<I> {
    pub fn new(i2c: I) -> Self {
        Self {
            bus: RegisterBus::new(i2c),
            address: RV8803_ADDRESS,
            state: RtcState::Uninitialized,
            timezone: TimeZone::default(),
        }
    }

    pub fn state(&self) -> RtcState {
        self.state
    }

    pub fn initialize(&mut self, config: &RtcConfig) -> Result<(), RtcError> {
        if !self.bus.is_present(self.address) {
            error!("RV8803 not found at 0x{:02x}", self.address);
            self.state = RtcState::Uninitialized;
            return Err(RtcError::NotAvailable);
        }

        self.write_timezone(config.timezone)?;
        self.state = RtcState::Ready;

        match self.read_time() {
            Some((stored, _)) if stored.is_plausible() && !self.power_was_lost() => {
                info!("RV8803 ready, time {} {}", stored, self.timezone);
                Ok(())
            }
            stored => {
                warn!("RV8803 stored time not valid: {:?}", stored.map(|(t, _)| t));
                if !config.auto_compiler_time {
                    self.state = RtcState::Uninitialized;
                    return Err(RtcError::InvalidTime);
                }
                let Some(build_utc) = time::build_time_utc().filter(|t| t.is_plausible()) else {
                    self.state = RtcState::Uninitialized;
                    return Err(RtcError::InvalidTime);
                };
                let local = time::utc_to_local(build_utc, self.timezone);
                self.write_time(&local).inspect_err(|_| {
                    self.state = RtcState::Uninitialized;
                })?;
                info!("RV8803 set to build time {}", local);
                Ok(())
            }
        }
    }

    /// Read local time and hundredths. `None` on bus failure or garbage registers.
    pub fn read_time(&mut self) -> Option<(DateTime, u8)> {
        let mut regs = [0u8; 8];
        if !self.bus.read_register(self.address, REG_HUNDREDTHS, &mut regs) {
            self.state = match self.state {
                RtcState::Uninitialized => RtcState::Uninitialized,
                _ => RtcState::Fault,
            };
            return None;
        }
        if self.state == RtcState::Fault {
            self.state = RtcState::Ready;
        }

        let dt = DateTime::new(
            2000 + u16::from(bcd_to_bin(regs[7])),
            bcd_to_bin(regs[6] & 0x1F),
            bcd_to_bin(regs[5] & 0x3F),
            bcd_to_bin(regs[3] & 0x3F),
            bcd_to_bin(regs[2] & 0x7F),
            bcd_to_bin(regs[1] & 0x7F),
        );
        dt.is_valid().then_some((dt, bcd_to_bin(regs[0])))
    }

    pub fn is_time_valid(&mut self) -> bool {
        matches!(self.read_time(), Some((t, _)) if t.is_plausible())
    }

    fn power_was_lost(&mut self) -> bool {
        self.bus.read8(self.address, REG_FLAG) & FLAG_V2F != 0
    }

    fn write_time(&mut self, local: &DateTime) -> Result<(), RtcError> {
        if !local.is_valid() || local.year < 2000 || local.year > 2099 {
            return Err(RtcError::InvalidTime);
        }

        let regs = [
            bin_to_bcd(local.second),
            bin_to_bcd(local.minute),
            bin_to_bcd(local.hour),
            1 << weekday(local),
            bin_to_bcd(local.day),
            bin_to_bcd(local.month),
            bin_to_bcd((local.year - 2000) as u8),
        ];
        if !self.bus.write_register(self.address, REG_SECONDS, &regs) {
            error!("RV8803 time write failed");
            return Err(RtcError::SetFailed);
        }
        // Clear the voltage-low flags now that the time is good again.
        if !self.bus.write8(self.address, REG_FLAG, 0) {
            return Err(RtcError::SetFailed);
        }
        Ok(())
    }

    fn write_timezone(&mut self, tz: TimeZone) -> Result<(), RtcError> {
        if !tz.is_valid() {
            return Err(RtcError::InvalidTimeZone);
        }
        if !self
            .bus
            .write8(self.address, REG_RAM, tz.quarter_hours() as u8)
        {
            return Err(RtcError::NotAvailable);
        }
        self.timezone = tz;
        Ok(())
    }

    /// Zone stored in the RTC's RAM register, as written by a previous boot.
    pub fn stored_timezone(&mut self) -> TimeZone {
        TimeZone::from_quarter_hours(self.bus.read8(self.address, REG_RAM) as i8)
    }
}

impl<I: I2c> RtcClock for Rv8803<I> {
    /// A faulted clock still counts: every access retries the bus and a
    /// good transaction clears the fault.
    fn is_ready(&self) -> bool {
        self.state != RtcState::Uninitialized
    }

    fn timezone(&self) -> TimeZone {
        self.timezone
    }

    fn get_timestamp(&mut self, now_ms: u32) -> RtcTimestamp {
        let reading = if self.state == RtcState::Uninitialized {
            None
        } else {
            self.read_time()
        };
        RtcTimestamp {
            monotonic_ms: now_ms,
            local: reading.map(|(t, _)| t),
            hundredths: reading.map(|(_, h)| h).unwrap_or(0),
            timezone: self.timezone,
        }
    }

    fn set_time(&mut self, local: DateTime) -> Result<(), RtcError> {
        if self.state == RtcState::Uninitialized && !self.bus.is_present(self.address) {
            return Err(RtcError::NotAvailable);
        }
        self.write_time(&local)?;
        self.state = RtcState::Ready;
        Ok(())
    }

    fn set_timezone(&mut self, tz: TimeZone) -> Result<(), RtcError> {
        self.write_timezone(tz)
    }
}
