use super::bus::SimDevice;
use super::{put_be, round_f64};
use crate::sensors::ina228::{
    REG_ADC_CONFIG, REG_CHARGE, REG_CONFIG, REG_DEVICE_ID, REG_DIAG_ALRT, REG_DIETEMP, REG_ENERGY,
    REG_POWER, REG_SHUNT_CAL, REG_VBUS, REG_VSHUNT, REG_CURRENT,
};

const RSTACC: u16 = 1 << 14;
const MASK_24: u64 = 0x00FF_FFFF;
const MASK_40: u64 = 0x00FF_FFFF_FFFF;

/// INA228 model: registers are computed from a set load at read time,
/// scaled by whatever SHUNT_CAL the driver programmed.
pub struct SimIna228 {
    shunt_ohms: f64,
    device_id: u16,
    pointer: u8,
    config: u16,
    adc_config: u16,
    shunt_cal: u16,
    volts: f64,
    amps: f64,
    die_temp_c: f64,
    energy_raw: u64,
    charge_raw: i64,
    diagnostics: u16,
}

impl SimIna228 {
    pub fn new(shunt_ohms: f64) -> Self {
        Self {
            shunt_ohms,
            device_id: 0x2281,
            pointer: 0,
            config: 0,
            adc_config: 0xFB68,
            shunt_cal: 0x1000,
            volts: 0.0,
            amps: 0.0,
            die_temp_c: 25.0,
            energy_raw: 0,
            charge_raw: 0,
            diagnostics: 0,
        }
    }

    pub fn set_load(&mut self, volts: f64, amps: f64) {
        self.volts = volts;
        self.amps = amps;
    }

    pub fn set_die_temperature(&mut self, celsius: f64) {
        self.die_temp_c = celsius;
    }

    pub fn set_accumulators(&mut self, energy_raw: u64, charge_raw: i64) {
        self.energy_raw = energy_raw;
        self.charge_raw = charge_raw;
    }

    pub fn set_diagnostics(&mut self, flags: u16) {
        self.diagnostics = flags;
    }

    pub fn config(&self) -> u16 {
        self.config
    }

    pub fn shunt_cal(&self) -> u16 {
        self.shunt_cal
    }

    /// Current LSB implied by the programmed SHUNT_CAL and the real shunt.
    fn current_lsb(&self) -> f64 {
        f64::from(self.shunt_cal) / (13107.2e6 * self.shunt_ohms)
    }

    fn register(&self, reg: u8) -> u64 {
        let lsb = self.current_lsb();
        match reg {
            REG_CONFIG => u64::from(self.config),
            REG_ADC_CONFIG => u64::from(self.adc_config),
            REG_SHUNT_CAL => u64::from(self.shunt_cal),
            REG_VSHUNT => {
                let counts = round_f64(self.amps * self.shunt_ohms / 312.5e-9);
                ((counts << 4) as u64) & MASK_24
            }
            REG_VBUS => ((round_f64(self.volts / 195.3125e-6) << 4) as u64) & MASK_24,
            REG_DIETEMP => u64::from(round_f64(self.die_temp_c / 7.8125e-3) as i16 as u16),
            REG_CURRENT if self.shunt_cal > 0 => {
                ((round_f64(self.amps / lsb) << 4) as u64) & MASK_24
            }
            REG_POWER if self.shunt_cal > 0 => {
                let watts = self.volts * self.amps;
                let watts = if watts < 0.0 { -watts } else { watts };
                (round_f64(watts / (3.2 * lsb)) as u64) & MASK_24
            }
            REG_ENERGY => self.energy_raw & MASK_40,
            REG_CHARGE => (self.charge_raw as u64) & MASK_40,
            REG_DIAG_ALRT => u64::from(self.diagnostics),
            REG_DEVICE_ID => u64::from(self.device_id),
            _ => 0,
        }
    }
}

impl SimDevice for SimIna228 {
    fn write(&mut self, data: &[u8]) -> bool {
        let Some((&reg, value)) = data.split_first() else {
            return true;
        };
        self.pointer = reg;
        if value.len() < 2 {
            return true;
        }
        let value = u16::from_be_bytes([value[0], value[1]]);
        match reg {
            REG_CONFIG => {
                if value & RSTACC != 0 {
                    self.energy_raw = 0;
                    self.charge_raw = 0;
                }
                self.config = value & !RSTACC;
            }
            REG_ADC_CONFIG => self.adc_config = value,
            REG_SHUNT_CAL => self.shunt_cal = value,
            _ => {}
        }
        true
    }

    fn read(&mut self, buf: &mut [u8]) -> bool {
        put_be(buf, self.register(self.pointer));
        true
    }
}
