pub mod ina228;

pub use ina228::{Calibration, Ina228};

use thiserror_no_std::Error;

use crate::error::TrackerError;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorError {
    #[error("{sensor}: {operation} failed on the bus")]
    Bus {
        sensor: &'static str,
        operation: &'static str,
    },
    #[error("{sensor}: unexpected device id {found}")]
    DeviceIdMismatch { sensor: &'static str, found: u16 },
    #[error("{sensor}: read before calibration")]
    NotCalibrated { sensor: &'static str },
    #[error("calibration does not fit the 16-bit SHUNT_CAL register")]
    InvalidCalibration,
}

impl From<SensorError> for TrackerError {
    fn from(e: SensorError) -> Self {
        match e {
            SensorError::Bus { .. } => TrackerError::BusIo,
            SensorError::DeviceIdMismatch { found, .. } => TrackerError::DeviceIdMismatch(found),
            SensorError::NotCalibrated { .. } => TrackerError::SensorNotCalibrated,
            SensorError::InvalidCalibration => TrackerError::InvalidConfiguration,
        }
    }
}

/// Trait for sensors that produce typed readings.
pub trait Sensor {
    /// The type of readings this sensor produces.
    type Readings;

    /// Read the sensor and return typed readings.
    fn read(&mut self) -> Result<Self::Readings, SensorError>;
}

/// One calibrated measurement from a high-side power monitor.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PowerReading {
    pub bus_voltage_v: f32,
    pub current_ma: f32,
    /// Taken from the device's POWER register, not `bus_voltage_v * current_ma`.
    pub power_mw: f32,
}

impl PowerReading {
    /// `bus_voltage_v * current_ma`, for cross-checking against `power_mw`.
    pub fn computed_power_mw(&self) -> f32 {
        self.bus_voltage_v * self.current_ma
    }
}

/// The three monitored rails, in the order they are sampled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerChannel {
    Solar,
    Battery,
    Load,
}

impl PowerChannel {
    pub const ALL: [PowerChannel; 3] = [PowerChannel::Solar, PowerChannel::Battery, PowerChannel::Load];

    pub const fn label(self) -> &'static str {
        match self {
            PowerChannel::Solar => "solar",
            PowerChannel::Battery => "battery",
            PowerChannel::Load => "load",
        }
    }

    /// Board wiring: I2C address, shunt resistance (ohms) and full-scale current (A).
    pub const fn board_defaults(self) -> (u8, f32, f32) {
        match self {
            PowerChannel::Solar => (0x40, 0.015, 5.0),
            PowerChannel::Battery => (0x44, 0.017_718_6, 5.0),
            PowerChannel::Load => (0x41, 0.015, 5.0),
        }
    }
}

/// Solar, battery and load monitors, always read in that order.
pub struct PowerSensors<S> {
    pub solar: S,
    pub battery: S,
    pub load: S,
}

impl<S> PowerSensors<S>
where
    S: Sensor<Readings = PowerReading>,
{
    pub fn new(solar: S, battery: S, load: S) -> Self {
        Self {
            solar,
            battery,
            load,
        }
    }

    /// Read all three rails. A failed rail reads as zero and is reported in
    /// the returned failure count.
    pub fn read_all(&mut self) -> ([PowerReading; 3], u8) {
        let mut failures = 0u8;
        let mut take = |result: Result<PowerReading, SensorError>| match result {
            Ok(reading) => reading,
            Err(e) => {
                log::warn!("{}", e);
                failures += 1;
                PowerReading::default()
            }
        };

        let solar = take(self.solar.read());
        let battery = take(self.battery.read());
        let load = take(self.load.read());

        ([solar, battery, load], failures)
    }
}
