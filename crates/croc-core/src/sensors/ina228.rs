//! TI INA228 85 V, 20-bit high-side power monitor
//!
//! Calibration is computed once from the shunt value and the expected
//! full-scale current, written at init, and then used unchanged for every
//! conversion so the driver and the device agree on `current_lsb`.

use embedded_hal::delay::DelayNs;
use embedded_hal::i2c::I2c;
use log::{error, info};

use super::{PowerReading, Sensor, SensorError};
use crate::bus::RegisterBus;

pub const REG_CONFIG: u8 = 0x00;
pub const REG_ADC_CONFIG: u8 = 0x01;
pub const REG_SHUNT_CAL: u8 = 0x02;
pub const REG_VSHUNT: u8 = 0x04;
pub const REG_VBUS: u8 = 0x05;
pub const REG_DIETEMP: u8 = 0x06;
pub const REG_CURRENT: u8 = 0x07;
pub const REG_POWER: u8 = 0x08;
pub const REG_ENERGY: u8 = 0x09;
pub const REG_CHARGE: u8 = 0x0A;
pub const REG_DIAG_ALRT: u8 = 0x0B;
pub const REG_DEVICE_ID: u8 = 0x3F;

pub const ACCEPTED_DEVICE_IDS: [u16; 2] = [0x2280, 0x2281];

/// Continuous shunt and bus conversions, 1052 us each, no averaging. RSTACC
/// is set so every init starts the energy and charge accumulators at zero.
pub const CONFIG_BASELINE: u16 = 0x4000 | (0x4 << 6) | (0x4 << 3) | 0x03;
/// CONFIG.RSTACC: clears the energy and charge accumulators.
const CONFIG_RESET_ACCUMULATORS: u16 = 1 << 14;

const VBUS_LSB_V: f64 = 195.3125e-6;
const VSHUNT_LSB_V: f64 = 312.5e-9;
const DIETEMP_LSB_C: f64 = 7.8125e-3;
const SHUNT_CAL_SCALE: f64 = 13107.2e6;
/// 2^19: the current path is 20 bits signed.
const CURRENT_LSB_DIVISOR: f64 = 524_288.0;
/// First conversion completes ~2.1 ms after config; 10 ms leaves margin.
const FIRST_CONVERSION_DELAY_MS: u32 = 10;

/// Shunt calibration derived from the board's shunt and current range.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Calibration {
    pub shunt_ohms: f32,
    pub max_current_a: f32,
    /// Amps per bit of the CURRENT register.
    pub current_lsb: f64,
    /// Value written to SHUNT_CAL.
    pub shunt_cal: u16,
}

impl Calibration {
    pub fn new(shunt_ohms: f32, max_current_a: f32) -> Result<Self, SensorError> {
        if !(shunt_ohms > 0.0) || !(max_current_a > 0.0) {
            return Err(SensorError::InvalidCalibration);
        }

        let current_lsb = f64::from(max_current_a) / CURRENT_LSB_DIVISOR;
        let cal = SHUNT_CAL_SCALE * current_lsb * f64::from(shunt_ohms);
        // Round half up; cal is positive here.
        let rounded = (cal + 0.5) as u64;
        if rounded == 0 || rounded > u64::from(u16::MAX) {
            return Err(SensorError::InvalidCalibration);
        }

        Ok(Self {
            shunt_ohms,
            max_current_a,
            current_lsb,
            shunt_cal: rounded as u16,
        })
    }

    /// One current LSB expressed in milliamps.
    pub fn current_lsb_ma(&self) -> f64 {
        self.current_lsb * 1000.0
    }
}

/// Sign-extend a 24-bit two's complement register value.
#[inline]
pub fn sign_extend_24(raw: u32) -> i32 {
    ((raw << 8) as i32) >> 8
}

pub fn decode_bus_voltage_v(raw: u32) -> f32 {
    (f64::from(raw >> 4) * VBUS_LSB_V) as f32
}

pub fn decode_current_ma(raw: u32, current_lsb: f64) -> f32 {
    let counts = sign_extend_24(raw & 0x00FF_FFFF) >> 4;
    (f64::from(counts) * current_lsb * 1000.0) as f32
}

/// POWER is unsigned and has no reserved low bits.
pub fn decode_power_mw(raw: u32, current_lsb: f64) -> f32 {
    (f64::from(raw & 0x00FF_FFFF) * 3.2 * current_lsb * 1000.0) as f32
}

pub struct Ina228<I> {
    bus: RegisterBus<I>,
    address: u8,
    name: &'static str,
    calibration: Calibration,
    calibrated: bool,
}

impl<I: I2c> Ina228<I> {
    pub fn new(
        i2c: I,
        address: u8,
        name: &'static str,
        shunt_ohms: f32,
        max_current_a: f32,
    ) -> Result<Self, SensorError> {
        Ok(Self {
            bus: RegisterBus::new(i2c),
            address,
            name,
            calibration: Calibration::new(shunt_ohms, max_current_a)?,
            calibrated: false,
        })
    }

    pub fn address(&self) -> u8 {
        self.address
    }

    pub fn calibration(&self) -> &Calibration {
        &self.calibration
    }

    pub fn is_calibrated(&self) -> bool {
        self.calibrated
    }

    /// Verify the device id, program CONFIG and SHUNT_CAL, and wait for the
    /// first conversion. Calibration is only written once per driver.
    pub fn init(&mut self, delay: &mut impl DelayNs) -> Result<(), SensorError> {
        let id = self.bus.read16(self.address, REG_DEVICE_ID);
        if self.bus.take_error() {
            error!("{}: no response at 0x{:02x}", self.name, self.address);
            return Err(self.bus_error("read device id"));
        }
        if !ACCEPTED_DEVICE_IDS.contains(&id) {
            error!("{}: device id 0x{:04x} not an INA228", self.name, id);
            return Err(SensorError::DeviceIdMismatch {
                sensor: self.name,
                found: id,
            });
        }

        if self.calibrated {
            return Ok(());
        }

        if !self.bus.write16(self.address, REG_CONFIG, CONFIG_BASELINE) {
            return Err(self.bus_error("write CONFIG"));
        }
        if !self
            .bus
            .write16(self.address, REG_SHUNT_CAL, self.calibration.shunt_cal)
        {
            return Err(self.bus_error("write SHUNT_CAL"));
        }

        delay.delay_ms(FIRST_CONVERSION_DELAY_MS);
        self.calibrated = true;

        info!(
            "{}: INA228 ready at 0x{:02x}, SHUNT_CAL={} current_lsb={:e} A",
            self.name, self.address, self.calibration.shunt_cal, self.calibration.current_lsb
        );
        Ok(())
    }

    /// Bus voltage in volts. Zero if the device did not answer.
    pub fn read_bus_voltage_v(&mut self) -> f32 {
        decode_bus_voltage_v(self.bus.read24(self.address, REG_VBUS))
    }

    /// Signed current in milliamps. Zero if the device did not answer.
    pub fn read_current_ma(&mut self) -> f32 {
        decode_current_ma(
            self.bus.read24(self.address, REG_CURRENT),
            self.calibration.current_lsb,
        )
    }

    /// Power in milliwatts from the POWER register. Zero if the device did not answer.
    pub fn read_power_mw(&mut self) -> f32 {
        decode_power_mw(
            self.bus.read24(self.address, REG_POWER),
            self.calibration.current_lsb,
        )
    }

    /// Shunt voltage in millivolts (ADCRANGE = 0, 312.5 nV/bit).
    pub fn read_shunt_voltage_mv(&mut self) -> f32 {
        let raw = self.bus.read24(self.address, REG_VSHUNT);
        let counts = sign_extend_24(raw) >> 4;
        (f64::from(counts) * VSHUNT_LSB_V * 1000.0) as f32
    }

    pub fn read_die_temperature_c(&mut self) -> f32 {
        let raw = self.bus.read16(self.address, REG_DIETEMP) as i16;
        (f64::from(raw) * DIETEMP_LSB_C) as f32
    }

    /// Accumulated energy in joules since the last accumulator reset.
    pub fn read_energy_j(&mut self) -> f64 {
        let raw = self.bus.read40(self.address, REG_ENERGY);
        raw as f64 * 16.0 * 3.2 * self.calibration.current_lsb
    }

    /// Accumulated charge in coulombs since the last accumulator reset.
    pub fn read_charge_c(&mut self) -> f64 {
        let raw = self.bus.read40(self.address, REG_CHARGE);
        // 40-bit two's complement
        let signed = ((raw << 24) as i64) >> 24;
        signed as f64 * self.calibration.current_lsb
    }

    /// Raw DIAG_ALRT flags (overflow, math overflow, conversion ready, ...).
    pub fn read_diagnostics(&mut self) -> u16 {
        self.bus.read16(self.address, REG_DIAG_ALRT)
    }

    pub fn reset_accumulators(&mut self) -> Result<(), SensorError> {
        if self.bus.write16(
            self.address,
            REG_CONFIG,
            CONFIG_BASELINE | CONFIG_RESET_ACCUMULATORS,
        ) {
            Ok(())
        } else {
            Err(self.bus_error("reset accumulators"))
        }
    }

    fn bus_error(&self, operation: &'static str) -> SensorError {
        SensorError::Bus {
            sensor: self.name,
            operation,
        }
    }
}

impl<I: I2c> Sensor for Ina228<I> {
    type Readings = PowerReading;

    fn read(&mut self) -> Result<PowerReading, SensorError> {
        if !self.calibrated {
            return Err(SensorError::NotCalibrated { sensor: self.name });
        }

        self.bus.take_error();
        let reading = PowerReading {
            bus_voltage_v: self.read_bus_voltage_v(),
            current_ma: self.read_current_ma(),
            power_mw: self.read_power_mw(),
        };

        if self.bus.take_error() {
            return Err(self.bus_error("read measurements"));
        }
        Ok(reading)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimDelay, SimClock, SimI2cBus, SimIna228, SimRegisterFile};

    const ADDR: u8 = 0x40;

    fn approx(a: f32, b: f32, tol: f32) -> bool {
        (a - b).abs() <= tol
    }

    fn sensor_on(bus: SimI2cBus, shunt: f32, imax: f32) -> Ina228<SimI2cBus> {
        Ina228::new(bus, ADDR, "solar", shunt, imax).unwrap()
    }

    fn sim_bus(shunt: f32) -> SimI2cBus {
        let mut bus = SimI2cBus::new();
        bus.attach(ADDR, SimIna228::new(f64::from(shunt)));
        bus
    }

    #[test]
    fn test_calibration_math() {
        let cal = Calibration::new(0.015, 5.0).unwrap();
        assert!((cal.current_lsb - 9.536_743_164_062_5e-6).abs() < 1e-15);
        assert_eq!(cal.shunt_cal, 1875, "SHUNT_CAL for 15 mOhm / 5 A must be 1875");
    }

    #[test]
    fn test_calibration_rejects_overflow() {
        // 1 ohm at 5 A needs SHUNT_CAL = 125000
        assert_eq!(
            Calibration::new(1.0, 5.0),
            Err(SensorError::InvalidCalibration)
        );
        assert_eq!(
            Calibration::new(0.0, 5.0),
            Err(SensorError::InvalidCalibration)
        );
    }

    #[test]
    fn test_config_value() {
        assert_eq!(CONFIG_BASELINE, 0x4123);
    }

    #[test]
    fn test_bus_voltage_decode() {
        assert!(approx(decode_bus_voltage_v(0x0A_0000), 8.0, 1e-6));
    }

    #[test]
    fn test_negative_current_decode() {
        let lsb = Calibration::new(0.015, 5.0).unwrap().current_lsb;
        let ma = decode_current_ma(0xFF_FFF0, lsb);
        assert!(approx(ma, -0.009_536_743, 1e-8), "got {ma}");
    }

    #[test]
    fn test_sign_extension_symmetry() {
        let lsb = Calibration::new(0.015, 5.0).unwrap().current_lsb;
        let lsb_ma = (lsb * 1000.0) as f32;
        let pos = decode_current_ma(0x7F_FFF0, lsb);
        let neg = decode_current_ma(0x80_0000, lsb);
        assert!(approx(pos, 524_287.0 * lsb_ma, 0.01));
        assert!(approx(neg, -524_288.0 * lsb_ma, 0.01));
        assert!(approx(pos + neg, -lsb_ma, 0.005));
    }

    #[test]
    fn test_power_not_shifted() {
        let lsb = Calibration::new(0.015, 5.0).unwrap().current_lsb;
        for raw in [0u32, 1, 16, 0x1234, 0x7F_FFFF, 0xFF_FFFF] {
            let expected = (f64::from(raw) * 3.2 * lsb * 1000.0) as f32;
            assert_eq!(decode_power_mw(raw, lsb), expected);
        }
    }

    #[test]
    fn test_init_writes_config_and_calibration() {
        let mut bus = sim_bus(0.015);
        bus.device_mut::<SimIna228>(ADDR)
            .unwrap()
            .set_accumulators(123_456, -789);
        let mut sensor = sensor_on(bus, 0.015, 5.0);
        let clock = SimClock::new();
        let mut delay = SimDelay::new(clock.clone());
        sensor.init(&mut delay).unwrap();

        assert!(sensor.is_calibrated());
        assert!(clock.now() >= 10, "init must wait for the first conversion");

        // Init starts the accumulators from zero; RSTACC reads back clear.
        assert_eq!(sensor.read_energy_j(), 0.0);
        assert_eq!(sensor.read_charge_c(), 0.0);
        let mut bus = sensor.bus;
        assert_eq!(
            bus.read16(ADDR, REG_CONFIG),
            CONFIG_BASELINE & !CONFIG_RESET_ACCUMULATORS
        );
        assert_eq!(bus.read16(ADDR, REG_SHUNT_CAL), 1875);
    }

    #[test]
    fn test_init_rejects_wrong_device_id() {
        let mut bus = SimI2cBus::new();
        let mut regs = SimRegisterFile::new();
        regs.set(REG_DEVICE_ID, &[0x12, 0x34]);
        bus.attach(ADDR, regs);

        let mut sensor = sensor_on(bus, 0.015, 5.0);
        let mut delay = SimDelay::new(SimClock::new());
        assert_eq!(
            sensor.init(&mut delay),
            Err(SensorError::DeviceIdMismatch {
                sensor: "solar",
                found: 0x1234
            })
        );
        assert!(!sensor.is_calibrated());
    }

    #[test]
    fn test_init_missing_device() {
        let mut sensor = sensor_on(SimI2cBus::new(), 0.015, 5.0);
        let mut delay = SimDelay::new(SimClock::new());
        assert!(matches!(
            sensor.init(&mut delay),
            Err(SensorError::Bus { .. })
        ));
    }

    #[test]
    fn test_read_before_init() {
        let mut sensor = sensor_on(sim_bus(0.015), 0.015, 5.0);
        assert_eq!(
            sensor.read(),
            Err(SensorError::NotCalibrated { sensor: "solar" })
        );
    }

    #[test]
    fn test_calibration_round_trip() {
        // Shunt/range pairs whose SHUNT_CAL is an exact integer.
        for (shunt, imax) in [(0.015f32, 5.0f32), (0.01, 5.0), (0.1, 1.0), (0.002, 40.0)] {
            let mut sensor = sensor_on(sim_bus(shunt), shunt, imax);
            sensor.init(&mut SimDelay::new(SimClock::new())).unwrap();
            let lsb_ma = sensor.calibration().current_lsb_ma() as f32;

            for true_ma in [0.0f32, 1.5, 123.456, -250.0, 0.8 * imax * 1000.0] {
                sensor
                    .bus
                    .i2c_mut()
                    .device_mut::<SimIna228>(ADDR)
                    .unwrap()
                    .set_load(12.0, f64::from(true_ma) / 1000.0);
                let ma = sensor.read_current_ma();
                assert!(
                    (ma - true_ma).abs() <= lsb_ma,
                    "shunt={shunt} imax={imax}: read {ma} mA for {true_ma} mA"
                );
            }
        }
    }

    #[test]
    fn test_read_reports_power_register() {
        let mut sensor = sensor_on(sim_bus(0.015), 0.015, 5.0);
        sensor.init(&mut SimDelay::new(SimClock::new())).unwrap();
        sensor
            .bus
            .i2c_mut()
            .device_mut::<SimIna228>(ADDR)
            .unwrap()
            .set_load(8.0, 0.25);

        let reading = sensor.read().unwrap();
        assert!(approx(reading.bus_voltage_v, 8.0, 0.001));
        assert!(approx(reading.current_ma, 250.0, 0.05));
        assert!(approx(reading.power_mw, 2000.0, 1.0));
        assert!(approx(reading.power_mw, reading.computed_power_mw(), 1.0));
    }

    #[test]
    fn test_read_after_device_drops_off() {
        let mut sensor = sensor_on(sim_bus(0.015), 0.015, 5.0);
        sensor.init(&mut SimDelay::new(SimClock::new())).unwrap();
        sensor.bus.i2c_mut().set_offline(ADDR, true);

        assert!(matches!(sensor.read(), Err(SensorError::Bus { .. })));
        assert_eq!(sensor.read_bus_voltage_v(), 0.0);
    }

    #[test]
    fn test_accumulators_and_temperature() {
        let mut sensor = sensor_on(sim_bus(0.015), 0.015, 5.0);
        sensor.init(&mut SimDelay::new(SimClock::new())).unwrap();
        {
            let dev = sensor.bus.i2c_mut().device_mut::<SimIna228>(ADDR).unwrap();
            dev.set_die_temperature(25.0);
            dev.set_accumulators(1000, -2000);
        }

        assert!(approx(sensor.read_die_temperature_c(), 25.0, 0.01));
        let lsb = sensor.calibration().current_lsb;
        assert!((sensor.read_energy_j() - 1000.0 * 16.0 * 3.2 * lsb).abs() < 1e-9);
        assert!((sensor.read_charge_c() + 2000.0 * lsb).abs() < 1e-9);

        sensor.reset_accumulators().unwrap();
        assert_eq!(sensor.read_energy_j(), 0.0);
    }
}
