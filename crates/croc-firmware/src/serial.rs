//! Blocking UART adapter for the Iridium 9603
//!
//! The modem driver in `croc_core` talks `embedded_io` and only reads after
//! `read_ready` reports a byte, so a blocking esp-hal UART is enough.

use embedded_io::{ErrorKind, ErrorType, Read, ReadReady, Write};
use esp_hal::Blocking;
use esp_hal::uart::Uart;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SerialError {
    Rx,
    Tx,
}

impl embedded_io::Error for SerialError {
    fn kind(&self) -> ErrorKind {
        ErrorKind::Other
    }
}

pub struct ModemSerial<'d> {
    uart: Uart<'d, Blocking>,
}

impl<'d> ModemSerial<'d> {
    pub fn new(uart: Uart<'d, Blocking>) -> Self {
        Self { uart }
    }
}

impl ErrorType for ModemSerial<'_> {
    type Error = SerialError;
}

impl Read for ModemSerial<'_> {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
        if buf.is_empty() {
            return Ok(0);
        }
        self.uart.read(buf).map_err(|_| SerialError::Rx)
    }
}

impl ReadReady for ModemSerial<'_> {
    fn read_ready(&mut self) -> Result<bool, Self::Error> {
        Ok(self.uart.read_ready())
    }
}

impl Write for ModemSerial<'_> {
    fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
        self.uart.write(buf).map_err(|_| SerialError::Tx)
    }

    fn flush(&mut self) -> Result<(), Self::Error> {
        self.uart.flush().map_err(|_| SerialError::Tx)
    }
}
