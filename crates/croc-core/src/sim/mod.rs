//! Simulated hardware for tests and the desktop simulator
//!
//! Register-level device models on a fake I2C bus, a fake monotonic clock,
//! an in-memory file store and scripted modems. The models implement the
//! same traits as the real peripherals so every driver runs unmodified.

mod bus;
mod clock;
mod ina228;
mod modem;
mod rv8803;
mod store;
mod ublox;

pub use bus::{SimDevice, SimI2cBus, SimRegisterFile};
pub use clock::{SimClock, SimDelay};
pub use ina228::SimIna228;
pub use modem::{ScriptedModem, SimIridium};
pub use rv8803::SimRv8803;
pub use store::{MemFileStore, StoreFault};
pub use ublox::{SimFix, SimUblox};

/// Round half away from zero without `std`.
pub(crate) fn round_f64(x: f64) -> i64 {
    if x >= 0.0 {
        (x + 0.5) as i64
    } else {
        (x - 0.5) as i64
    }
}

/// Store `value` big-endian into `buf`, keeping the low `buf.len()` bytes.
pub(crate) fn put_be(buf: &mut [u8], value: u64) {
    for (i, b) in buf.iter_mut().rev().enumerate() {
        *b = if i < 8 { (value >> (8 * i)) as u8 } else { 0 };
    }
}
