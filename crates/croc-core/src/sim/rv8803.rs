use super::bus::SimDevice;
use super::clock::SimClock;
use crate::clock::elapsed_ms;
use crate::rtc::rv8803::{bcd_to_bin, bin_to_bcd, weekday};
use crate::time::DateTime;

const REG_HUNDREDTHS: usize = 0x10;
const REG_SECONDS: usize = 0x11;
const REG_YEAR: usize = 0x17;
const REGISTER_COUNT: usize = 0x30;

/// RV-8803 model with an auto-incrementing register pointer. The time
/// registers run off the shared [`SimClock`].
pub struct SimRv8803 {
    clock: SimClock,
    base: DateTime,
    base_ms: u32,
    registers: [u8; REGISTER_COUNT],
    pointer: usize,
}

impl SimRv8803 {
    pub fn new(clock: SimClock, local: DateTime) -> Self {
        let base_ms = clock.now();
        Self {
            clock,
            base: local,
            base_ms,
            registers: [0; REGISTER_COUNT],
            pointer: 0,
        }
    }

    /// Current local time as the device would report it.
    pub fn now(&self) -> DateTime {
        let elapsed = elapsed_ms(self.clock.now(), self.base_ms);
        self.base.add_seconds(i64::from(elapsed / 1000))
    }

    pub fn register(&self, reg: u8) -> u8 {
        self.registers[usize::from(reg) % REGISTER_COUNT]
    }

    /// Raise the voltage-low flag, as after a supply brown-out.
    pub fn set_power_lost(&mut self) {
        self.registers[0x1E] |= 0b10;
    }

    fn time_registers(&self) -> [u8; 8] {
        let elapsed = elapsed_ms(self.clock.now(), self.base_ms);
        let now = self.now();
        [
            bin_to_bcd(((elapsed % 1000) / 10) as u8),
            bin_to_bcd(now.second),
            bin_to_bcd(now.minute),
            bin_to_bcd(now.hour),
            1 << weekday(&now),
            bin_to_bcd(now.day),
            bin_to_bcd(now.month),
            bin_to_bcd(now.year.saturating_sub(2000) as u8),
        ]
    }
}

impl SimDevice for SimRv8803 {
    fn write(&mut self, data: &[u8]) -> bool {
        let Some((&reg, values)) = data.split_first() else {
            return true;
        };
        self.pointer = usize::from(reg);

        let mut time = self.time_registers();
        let mut time_written = false;
        for (i, &value) in values.iter().enumerate() {
            let reg = (self.pointer + i) % REGISTER_COUNT;
            if (REG_SECONDS..=REG_YEAR).contains(&reg) {
                time[reg - REG_HUNDREDTHS] = value;
                time_written = true;
            } else {
                self.registers[reg] = value;
            }
        }

        if time_written {
            self.base = DateTime::new(
                2000 + u16::from(bcd_to_bin(time[7])),
                bcd_to_bin(time[6] & 0x1F),
                bcd_to_bin(time[5] & 0x3F),
                bcd_to_bin(time[3] & 0x3F),
                bcd_to_bin(time[2] & 0x7F),
                bcd_to_bin(time[1] & 0x7F),
            );
            self.base_ms = self.clock.now();
        }
        true
    }

    fn read(&mut self, buf: &mut [u8]) -> bool {
        let time = self.time_registers();
        for (i, b) in buf.iter_mut().enumerate() {
            let reg = (self.pointer + i) % REGISTER_COUNT;
            *b = if (REG_HUNDREDTHS..=REG_YEAR).contains(&reg) {
                time[reg - REG_HUNDREDTHS]
            } else {
                self.registers[reg]
            };
        }
        self.pointer = (self.pointer + buf.len()) % REGISTER_COUNT;
        true
    }
}
