//! Shared I2C bus for the single-threaded acquisition loop
//!
//! The three INA228 monitors, the RV-8803 and the u-blox receiver all hang off
//! one I2C peripheral. Everything runs on one cooperative loop, so the bus is
//! held in a `RefCell` and each driver gets its own handle.

use core::cell::RefCell;

use embedded_hal::i2c::{ErrorType, I2c, Operation};

/// I2C device handle borrowing a bus shared through a `RefCell`.
///
/// Each driver owns one `SharedI2cDevice`; the borrow is only held for the
/// duration of a single transaction, so handles never contend as long as
/// they are used from the same loop.
///
/// # Example
///
/// ```ignore
/// use core::cell::RefCell;
/// use static_cell::StaticCell;
///
/// static I2C_BUS: StaticCell<RefCell<esp_hal::i2c::master::I2c<'static, esp_hal::Blocking>>> =
///     StaticCell::new();
///
/// let i2c = /* ... create blocking I2C ... */;
/// let i2c_bus = I2C_BUS.init(RefCell::new(i2c));
///
/// let solar = SharedI2cDevice::new(i2c_bus);
/// let rtc = SharedI2cDevice::new(i2c_bus);
/// ```
pub struct SharedI2cDevice<'a, T> {
    bus: &'a RefCell<T>,
}

impl<'a, T> SharedI2cDevice<'a, T> {
    /// Create a new `SharedI2cDevice`.
    #[inline]
    pub const fn new(bus: &'a RefCell<T>) -> Self {
        Self { bus }
    }
}

impl<T> ErrorType for SharedI2cDevice<'_, T>
where
    T: ErrorType,
{
    type Error = T::Error;
}

impl<T> I2c for SharedI2cDevice<'_, T>
where
    T: I2c,
{
    #[inline]
    fn read(&mut self, address: u8, read: &mut [u8]) -> Result<(), Self::Error> {
        self.bus.borrow_mut().read(address, read)
    }

    #[inline]
    fn write(&mut self, address: u8, write: &[u8]) -> Result<(), Self::Error> {
        self.bus.borrow_mut().write(address, write)
    }

    /// Register read: pointer write, repeated start, then `read.len()` bytes.
    #[inline]
    fn write_read(
        &mut self,
        address: u8,
        write: &[u8],
        read: &mut [u8],
    ) -> Result<(), Self::Error> {
        self.bus.borrow_mut().write_read(address, write, read)
    }

    #[inline]
    fn transaction(
        &mut self,
        address: u8,
        operations: &mut [Operation<'_>],
    ) -> Result<(), Self::Error> {
        self.bus.borrow_mut().transaction(address, operations)
    }
}
