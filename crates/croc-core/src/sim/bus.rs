use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use core::any::Any;

use embedded_hal::i2c::{ErrorKind, ErrorType, I2c, NoAcknowledgeSource, Operation};

/// A device model attached to [`SimI2cBus`].
///
/// `write` receives every write operation verbatim (register pointer first);
/// `read` fills the buffer. Returning `false` NACKs the operation.
pub trait SimDevice: Any {
    fn write(&mut self, data: &[u8]) -> bool;
    fn read(&mut self, buf: &mut [u8]) -> bool;
}

struct Slot {
    device: Box<dyn SimDevice>,
    offline: bool,
}

#[derive(Default)]
pub struct SimI2cBus {
    devices: BTreeMap<u8, Slot>,
}

impl SimI2cBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(&mut self, address: u8, device: impl SimDevice) {
        self.devices.insert(
            address,
            Slot {
                device: Box::new(device),
                offline: false,
            },
        );
    }

    /// An offline device NACKs its address, as if it were unplugged.
    pub fn set_offline(&mut self, address: u8, offline: bool) {
        if let Some(slot) = self.devices.get_mut(&address) {
            slot.offline = offline;
        }
    }

    pub fn device_mut<D: SimDevice>(&mut self, address: u8) -> Option<&mut D> {
        let slot = self.devices.get_mut(&address)?;
        let any: &mut dyn Any = slot.device.as_mut();
        any.downcast_mut::<D>()
    }
}

impl ErrorType for SimI2cBus {
    type Error = ErrorKind;
}

impl I2c for SimI2cBus {
    fn transaction(
        &mut self,
        address: u8,
        operations: &mut [Operation<'_>],
    ) -> Result<(), Self::Error> {
        let slot = self
            .devices
            .get_mut(&address)
            .filter(|slot| !slot.offline)
            .ok_or(ErrorKind::NoAcknowledge(NoAcknowledgeSource::Address))?;

        for op in operations {
            let ok = match op {
                Operation::Write(data) => slot.device.write(data),
                Operation::Read(buf) => slot.device.read(buf),
            };
            if !ok {
                return Err(ErrorKind::NoAcknowledge(NoAcknowledgeSource::Data));
            }
        }
        Ok(())
    }
}

/// Plain register file: each register holds whatever was last written to it.
#[derive(Default)]
pub struct SimRegisterFile {
    registers: BTreeMap<u8, Vec<u8>>,
    pointer: u8,
}

impl SimRegisterFile {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, reg: u8, value: &[u8]) {
        self.registers.insert(reg, value.to_vec());
    }

    pub fn get(&self, reg: u8) -> Option<&[u8]> {
        self.registers.get(&reg).map(Vec::as_slice)
    }
}

impl SimDevice for SimRegisterFile {
    fn write(&mut self, data: &[u8]) -> bool {
        if let Some((&reg, value)) = data.split_first() {
            self.pointer = reg;
            if !value.is_empty() {
                self.set(reg, value);
            }
        }
        true
    }

    fn read(&mut self, buf: &mut [u8]) -> bool {
        buf.fill(0);
        if let Some(value) = self.registers.get(&self.pointer) {
            let n = value.len().min(buf.len());
            buf[..n].copy_from_slice(&value[..n]);
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_and_offline_devices_nack() {
        let mut bus = SimI2cBus::new();
        bus.attach(0x10, SimRegisterFile::new());
        assert!(bus.write(0x10, &[]).is_ok());
        assert_eq!(
            bus.write(0x11, &[]),
            Err(ErrorKind::NoAcknowledge(NoAcknowledgeSource::Address))
        );
        bus.set_offline(0x10, true);
        assert!(bus.write(0x10, &[]).is_err());
    }

    #[test]
    fn test_downcast() {
        let mut bus = SimI2cBus::new();
        bus.attach(0x10, SimRegisterFile::new());
        bus.write(0x10, &[0x01, 0xAB]).unwrap();
        let regs = bus.device_mut::<SimRegisterFile>(0x10).unwrap();
        assert_eq!(regs.get(0x01), Some(&[0xAB][..]));
    }
}
