//! Register-level transactions on the shared I2C bus
//!
//! All multi-byte values are big-endian on the wire. A read that fails
//! returns zero and latches `last_error`; callers that care check the flag
//! (or validate the value, e.g. a device id) after the read.

use embedded_hal::i2c::I2c;
use log::debug;

/// Largest register payload written in one transaction (RTC time block).
const MAX_WRITE_PAYLOAD: usize = 16;

pub struct RegisterBus<I> {
    i2c: I,
    last_error: bool,
}

impl<I: I2c> RegisterBus<I> {
    pub const fn new(i2c: I) -> Self {
        Self {
            i2c,
            last_error: false,
        }
    }

    pub fn i2c_mut(&mut self) -> &mut I {
        &mut self.i2c
    }

    /// Whether any transaction failed since the flag was last cleared.
    pub fn last_error(&self) -> bool {
        self.last_error
    }

    /// Return the error flag and clear it.
    pub fn take_error(&mut self) -> bool {
        core::mem::replace(&mut self.last_error, false)
    }

    /// Write a 16-bit register. Returns `false` if the device did not acknowledge.
    pub fn write16(&mut self, addr: u8, reg: u8, value: u16) -> bool {
        let [hi, lo] = value.to_be_bytes();
        self.write_register(addr, reg, &[hi, lo])
    }

    pub fn write8(&mut self, addr: u8, reg: u8, value: u8) -> bool {
        self.write_register(addr, reg, &[value])
    }

    pub fn read8(&mut self, addr: u8, reg: u8) -> u8 {
        let mut buf = [0u8; 1];
        if self.read_register(addr, reg, &mut buf) {
            buf[0]
        } else {
            0
        }
    }

    pub fn read16(&mut self, addr: u8, reg: u8) -> u16 {
        let mut buf = [0u8; 2];
        if self.read_register(addr, reg, &mut buf) {
            u16::from_be_bytes(buf)
        } else {
            0
        }
    }

    pub fn read24(&mut self, addr: u8, reg: u8) -> u32 {
        let mut buf = [0u8; 3];
        if self.read_register(addr, reg, &mut buf) {
            u32::from_be_bytes([0, buf[0], buf[1], buf[2]])
        } else {
            0
        }
    }

    /// Read a 40-bit register (INA228 energy and charge accumulators).
    pub fn read40(&mut self, addr: u8, reg: u8) -> u64 {
        let mut buf = [0u8; 5];
        if self.read_register(addr, reg, &mut buf) {
            buf.iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b))
        } else {
            0
        }
    }

    /// Write `data` starting at register `reg` (auto-incrementing devices).
    pub fn write_register(&mut self, addr: u8, reg: u8, data: &[u8]) -> bool {
        if data.len() > MAX_WRITE_PAYLOAD {
            debug!("I2C 0x{:02x}: register write of {} bytes too long", addr, data.len());
            self.last_error = true;
            return false;
        }

        let mut frame = [0u8; MAX_WRITE_PAYLOAD + 1];
        frame[0] = reg;
        frame[1..=data.len()].copy_from_slice(data);

        match self.i2c.write(addr, &frame[..=data.len()]) {
            Ok(()) => true,
            Err(e) => {
                debug!("I2C 0x{:02x} write reg 0x{:02x} failed: {:?}", addr, reg, e);
                self.last_error = true;
                false
            }
        }
    }

    /// Read `buf.len()` bytes starting at register `reg`. On failure the
    /// buffer is zeroed.
    pub fn read_register(&mut self, addr: u8, reg: u8, buf: &mut [u8]) -> bool {
        match self.i2c.write_read(addr, &[reg], buf) {
            Ok(()) => true,
            Err(e) => {
                debug!("I2C 0x{:02x} read reg 0x{:02x} failed: {:?}", addr, reg, e);
                buf.fill(0);
                self.last_error = true;
                false
            }
        }
    }

    /// Raw write with no register pointer (u-blox DDC message input).
    pub fn write_raw(&mut self, addr: u8, data: &[u8]) -> bool {
        match self.i2c.write(addr, data) {
            Ok(()) => true,
            Err(e) => {
                debug!("I2C 0x{:02x} raw write failed: {:?}", addr, e);
                self.last_error = true;
                false
            }
        }
    }

    /// Raw read from the device's current register pointer.
    pub fn read_raw(&mut self, addr: u8, buf: &mut [u8]) -> bool {
        match self.i2c.read(addr, buf) {
            Ok(()) => true,
            Err(e) => {
                debug!("I2C 0x{:02x} raw read failed: {:?}", addr, e);
                buf.fill(0);
                self.last_error = true;
                false
            }
        }
    }

    /// Address-only check: a zero-length write that succeeds if the device acks.
    pub fn is_present(&mut self, addr: u8) -> bool {
        self.i2c.write(addr, &[]).is_ok()
    }
}
