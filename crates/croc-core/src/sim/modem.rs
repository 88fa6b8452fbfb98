use alloc::collections::VecDeque;
use alloc::format;
use alloc::vec::Vec;

use embedded_io::{ErrorKind, ErrorType, Read, ReadReady, Write};

use super::SimClock;
use crate::transmit::iridium::sbd_checksum;
use crate::transmit::{ModemError, SbdModem};

/// [`SbdModem`] that plays back scripted signal readings and session results.
///
/// Once a script runs out, signal stays at the default and sessions succeed.
#[derive(Debug, Default)]
pub struct ScriptedModem {
    default_signal: u8,
    signal: VecDeque<u8>,
    results: VecDeque<Result<(), ModemError>>,
    mt: VecDeque<Vec<u8>>,
    sent: Vec<Vec<u8>>,
    session: Option<(SimClock, u32)>,
}

impl ScriptedModem {
    pub fn new(default_signal: u8) -> Self {
        Self {
            default_signal,
            ..Default::default()
        }
    }

    pub fn with_signal(mut self, readings: &[u8]) -> Self {
        self.signal.extend(readings.iter().copied());
        self
    }

    pub fn with_results(mut self, results: &[Result<(), ModemError>]) -> Self {
        self.results.extend(results.iter().copied());
        self
    }

    /// Every session moves `clock` forward by `ms`.
    pub fn set_session_ms(&mut self, clock: SimClock, ms: u32) {
        self.session = Some((clock, ms));
    }

    pub fn queue_mt(&mut self, message: &[u8]) {
        self.mt.push_back(message.to_vec());
    }

    /// Payloads of every session, successful or not.
    pub fn sent(&self) -> &[Vec<u8>] {
        &self.sent
    }
}

impl SbdModem for ScriptedModem {
    fn signal_quality(&mut self) -> Result<u8, ModemError> {
        Ok(self.signal.pop_front().unwrap_or(self.default_signal))
    }

    fn send_receive(&mut self, payload: &[u8], rx: &mut [u8]) -> Result<usize, ModemError> {
        self.sent.push(payload.to_vec());
        if let Some((clock, ms)) = &self.session {
            clock.advance(*ms);
        }
        self.results.pop_front().unwrap_or(Ok(()))?;

        match self.mt.pop_front() {
            Some(message) if message.len() > rx.len() => Err(ModemError::RxOverflow),
            Some(message) => {
                rx[..message.len()].copy_from_slice(&message);
                Ok(message.len())
            }
            None => Ok(0),
        }
    }
}

/// Byte-level model of a 9603 transceiver's serial interface.
///
/// Echo is on until `ATE0`. SBDIX sessions deliver whatever is in the MO
/// buffer unless told to fail with MO status 32 (no network).
#[derive(Debug)]
pub struct SimIridium {
    clock: SimClock,
    powered: bool,
    echo: bool,
    signal: u8,
    command: Vec<u8>,
    binary: Option<(usize, Vec<u8>)>,
    output: VecDeque<u8>,
    mo: Option<Vec<u8>>,
    mt_queue: VecDeque<Vec<u8>>,
    mt_buffer: Option<Vec<u8>>,
    delivered: Vec<Vec<u8>>,
    failing_sessions: u32,
    sessions: u32,
    session_ms: u32,
    momsn: u16,
    mtmsn: u16,
}

impl SimIridium {
    pub fn new(clock: SimClock) -> Self {
        Self {
            clock,
            powered: true,
            echo: true,
            signal: 3,
            command: Vec::new(),
            binary: None,
            output: VecDeque::new(),
            mo: None,
            mt_queue: VecDeque::new(),
            mt_buffer: None,
            delivered: Vec::new(),
            failing_sessions: 0,
            sessions: 0,
            session_ms: 0,
            momsn: 0,
            mtmsn: 0,
        }
    }

    pub fn set_signal(&mut self, bars: u8) {
        self.signal = bars;
    }

    /// An unpowered modem swallows input and never answers.
    pub fn set_powered(&mut self, powered: bool) {
        self.powered = powered;
    }

    /// The next `count` SBDIX sessions report no network.
    pub fn fail_sessions(&mut self, count: u32) {
        self.failing_sessions = count;
    }

    pub fn set_session_ms(&mut self, ms: u32) {
        self.session_ms = ms;
    }

    pub fn queue_mt(&mut self, message: &[u8]) {
        self.mt_queue.push_back(message.to_vec());
    }

    /// MO payloads that reached the ground.
    pub fn delivered(&self) -> &[Vec<u8>] {
        &self.delivered
    }

    pub fn mo_buffer(&self) -> Option<&[u8]> {
        self.mo.as_deref()
    }

    pub fn session_count(&self) -> u32 {
        self.sessions
    }

    fn respond(&mut self, text: &str) {
        self.output.extend(text.as_bytes());
    }

    fn take_binary_byte(&mut self, byte: u8) {
        let Some((expected, data)) = self.binary.as_mut() else {
            return;
        };
        data.push(byte);
        if data.len() < *expected + 2 {
            return;
        }

        let (payload, checksum) = data.split_at(*expected);
        let ok = u16::from_be_bytes([checksum[0], checksum[1]]) == sbd_checksum(payload);
        if ok {
            self.mo = Some(payload.to_vec());
        }
        self.binary = None;
        self.respond(if ok { "\r\n0\r\n\r\nOK\r\n" } else { "\r\n2\r\n\r\nOK\r\n" });
    }

    fn run_command(&mut self) {
        let line = core::mem::take(&mut self.command);
        let Ok(command) = core::str::from_utf8(&line) else {
            self.respond("\r\nERROR\r\n");
            return;
        };
        let command = command.trim();

        match command {
            "AT" | "AT&D0" | "AT&K0" => self.respond("\r\nOK\r\n"),
            "ATE0" => {
                self.echo = false;
                self.respond("\r\nOK\r\n");
            }
            "ATE1" => {
                self.echo = true;
                self.respond("\r\nOK\r\n");
            }
            "AT+CSQ" => {
                let reply = format!("\r\n+CSQ:{}\r\n\r\nOK\r\n", self.signal);
                self.respond(&reply);
            }
            "AT+SBDD0" => {
                self.mo = None;
                self.respond("\r\n0\r\n\r\nOK\r\n");
            }
            "AT+SBDIX" => self.session(),
            "AT+SBDRB" => self.read_mt(),
            _ => match command.strip_prefix("AT+SBDWB=").map(str::parse::<usize>) {
                Some(Ok(len)) if (1..=340).contains(&len) => {
                    self.binary = Some((len, Vec::new()));
                    self.respond("READY\r\n");
                }
                Some(_) => self.respond("\r\n3\r\n\r\nOK\r\n"),
                None => self.respond("\r\nERROR\r\n"),
            },
        }
    }

    fn session(&mut self) {
        self.sessions += 1;
        self.clock.advance(self.session_ms);

        let reply = if self.failing_sessions > 0 {
            self.failing_sessions -= 1;
            format!("\r\n+SBDIX: 32, {}, 2, {}, 0, 0\r\n\r\nOK\r\n", self.momsn, self.mtmsn)
        } else {
            if let Some(mo) = &self.mo {
                self.delivered.push(mo.clone());
                self.momsn = self.momsn.wrapping_add(1);
            }
            let (mt_status, mt_len) = match self.mt_queue.pop_front() {
                Some(message) => {
                    self.mtmsn = self.mtmsn.wrapping_add(1);
                    let len = message.len();
                    self.mt_buffer = Some(message);
                    (1, len)
                }
                None => (0, 0),
            };
            format!(
                "\r\n+SBDIX: 0, {}, {}, {}, {}, {}\r\n\r\nOK\r\n",
                self.momsn,
                mt_status,
                self.mtmsn,
                mt_len,
                self.mt_queue.len()
            )
        };
        self.respond(&reply);
    }

    fn read_mt(&mut self) {
        let message = self.mt_buffer.take().unwrap_or_default();
        let len = message.len() as u16;
        self.output.extend(len.to_be_bytes());
        self.output.extend(message.iter().copied());
        self.output.extend(sbd_checksum(&message).to_be_bytes());
        self.respond("\r\nOK\r\n");
    }
}

impl ErrorType for SimIridium {
    type Error = ErrorKind;
}

impl Read for SimIridium {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
        let mut n = 0;
        while n < buf.len() {
            match self.output.pop_front() {
                Some(byte) => {
                    buf[n] = byte;
                    n += 1;
                }
                None => break,
            }
        }
        Ok(n)
    }
}

impl ReadReady for SimIridium {
    fn read_ready(&mut self) -> Result<bool, Self::Error> {
        Ok(!self.output.is_empty())
    }
}

impl Write for SimIridium {
    fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
        if !self.powered {
            return Ok(buf.len());
        }
        for &byte in buf {
            if self.binary.is_some() {
                self.take_binary_byte(byte);
                continue;
            }
            if self.echo {
                self.output.push_back(byte);
            }
            match byte {
                b'\r' => self.run_command(),
                b'\n' => {}
                other => self.command.push(other),
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(sim: &mut SimIridium) -> alloc::string::String {
        let mut buf = [0u8; 256];
        let n = sim.read(&mut buf).unwrap();
        alloc::string::String::from_utf8_lossy(&buf[..n]).into_owned()
    }

    #[test]
    fn test_echo_until_ate0() {
        let mut sim = SimIridium::new(SimClock::new());
        sim.write_all(b"AT\r").unwrap();
        assert_eq!(drain(&mut sim), "AT\r\r\nOK\r\n");
        sim.write_all(b"ATE0\r").unwrap();
        drain(&mut sim);
        sim.write_all(b"AT+CSQ\r").unwrap();
        assert_eq!(drain(&mut sim), "\r\n+CSQ:3\r\n\r\nOK\r\n");
    }

    #[test]
    fn test_sbdwb_checksum_mismatch() {
        let mut sim = SimIridium::new(SimClock::new());
        sim.write_all(b"ATE0\r").unwrap();
        drain(&mut sim);

        sim.write_all(b"AT+SBDWB=2\r").unwrap();
        assert_eq!(drain(&mut sim), "READY\r\n");
        sim.write_all(&[b'h', b'i', 0x00, 0x00]).unwrap();
        assert_eq!(drain(&mut sim), "\r\n2\r\n\r\nOK\r\n");
        assert!(sim.mo_buffer().is_none());
    }

    #[test]
    fn test_scripted_modem_defaults() {
        let mut modem = ScriptedModem::new(4).with_signal(&[1]);
        assert_eq!(modem.signal_quality(), Ok(1));
        assert_eq!(modem.signal_quality(), Ok(4));
        let mut rx = [0u8; 4];
        assert_eq!(modem.send_receive(b"x", &mut rx), Ok(0));
        assert_eq!(modem.sent().len(), 1);
    }
}
