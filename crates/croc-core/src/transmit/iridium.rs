//! Iridium 9603 SBD transceiver over a serial port
//!
//! Plain AT command set: `AT+CSQ` for signal, `AT+SBDWB` to load the
//! mobile-originated buffer, `AT+SBDIX` to run a session, `AT+SBDRB` to read a
//! mobile-terminated message and `AT+SBDD0` to clear the outgoing buffer.

use core::fmt::Write as _;

use embedded_hal::delay::DelayNs;
use embedded_io::{Read, ReadReady, Write};
use heapless::{String, Vec};
use log::{debug, info, warn};

use super::{ModemError, SbdModem};
use crate::clock::{deadline_reached, Monotonic};

const LINE_LEN: usize = 96;
type Line = String<LINE_LEN>;

const POLL_INTERVAL_MS: u32 = 10;
/// The 9603 accepts up to 340 bytes in the MO buffer.
const MAX_MO_LEN: usize = 340;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IridiumConfig {
    /// Per-command response timeout.
    pub at_timeout_ms: u32,
    /// Total time allowed for SBDIX sessions before giving up.
    pub send_receive_timeout_ms: u32,
    /// Wait between SBDIX sessions that found no network.
    pub sbdix_retry_ms: u32,
    pub startup_timeout_ms: u32,
}

impl Default for IridiumConfig {
    fn default() -> Self {
        Self {
            at_timeout_ms: 20_000,
            send_receive_timeout_ms: 300_000,
            sbdix_retry_ms: 10_000,
            startup_timeout_ms: 240_000,
        }
    }
}

/// Parsed `+SBDIX:` response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SbdixStatus {
    pub mo_status: u8,
    pub momsn: u16,
    pub mt_status: u8,
    pub mtmsn: u16,
    pub mt_length: u16,
    pub mt_queued: u16,
}

impl SbdixStatus {
    /// MO status 0..=4 means the message was delivered.
    pub fn delivered(&self) -> bool {
        self.mo_status <= 4
    }

    pub fn mt_received(&self) -> bool {
        self.mt_status == 1
    }

    pub fn parse(line: &str) -> Option<Self> {
        let rest = line.strip_prefix("+SBDIX:")?;
        let mut fields = rest.split(',').map(|f| f.trim().parse::<u16>());
        let mut next = || fields.next()?.ok();
        Some(Self {
            mo_status: u8::try_from(next()?).ok()?,
            momsn: next()?,
            mt_status: u8::try_from(next()?).ok()?,
            mtmsn: next()?,
            mt_length: next()?,
            mt_queued: next()?,
        })
    }
}

/// 16-bit sum of the payload, sent high byte first after SBDWB data.
pub fn sbd_checksum(data: &[u8]) -> u16 {
    data.iter()
        .fold(0u16, |sum, &b| sum.wrapping_add(u16::from(b)))
}

pub struct Iridium9603<S, D, C> {
    serial: S,
    delay: D,
    clock: C,
    config: IridiumConfig,
    line: Vec<u8, LINE_LEN>,
    ready: bool,
    last_status: Option<SbdixStatus>,
}

impl<S, D, C> Iridium9603<S, D, C>
where
    S: Read + Write + ReadReady,
    D: DelayNs,
    C: Monotonic,
{
    pub fn new(serial: S, delay: D, clock: C, config: IridiumConfig) -> Self {
        Self {
            serial,
            delay,
            clock,
            config,
            line: Vec::new(),
            ready: false,
            last_status: None,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    pub fn last_status(&self) -> Option<SbdixStatus> {
        self.last_status
    }

    /// Wait for the modem to answer `AT`, then turn off echo and flow control.
    pub fn begin(&mut self) -> Result<(), ModemError> {
        let deadline = self
            .clock
            .now_ms()
            .wrapping_add(self.config.startup_timeout_ms);
        loop {
            self.send_command("AT")?;
            match self.await_ok(None, 1000) {
                Ok(_) => break,
                Err(ModemError::SerialFailure) => return Err(ModemError::SerialFailure),
                Err(_) if deadline_reached(self.clock.now_ms(), deadline) => {
                    warn!("no answer from modem");
                    return Err(ModemError::NoModemDetected);
                }
                Err(_) => {}
            }
        }

        for command in ["ATE0", "AT&D0", "AT&K0"] {
            self.send_command(command)?;
            self.await_ok(None, self.config.at_timeout_ms)?;
        }
        self.ready = true;
        info!("Iridium modem ready");
        Ok(())
    }

    /// Clear the outgoing buffer.
    pub fn clear_mo_buffer(&mut self) -> Result<(), ModemError> {
        self.send_command("AT+SBDD0")?;
        self.await_ok(None, self.config.at_timeout_ms).map(|_| ())
    }

    fn ensure_ready(&self) -> Result<(), ModemError> {
        if self.ready {
            Ok(())
        } else {
            Err(ModemError::IsAsleep)
        }
    }

    fn send_command(&mut self, command: &str) -> Result<(), ModemError> {
        debug!(">> {}", command);
        self.write_bytes(command.as_bytes())?;
        self.write_bytes(b"\r")
    }

    fn write_bytes(&mut self, data: &[u8]) -> Result<(), ModemError> {
        self.serial
            .write_all(data)
            .map_err(|_| ModemError::SerialFailure)?;
        self.serial.flush().map_err(|_| ModemError::SerialFailure)
    }

    /// One byte, or `Timeout` at `deadline`.
    fn read_byte(&mut self, deadline: u32) -> Result<u8, ModemError> {
        loop {
            if self
                .serial
                .read_ready()
                .map_err(|_| ModemError::SerialFailure)?
            {
                let mut byte = [0u8; 1];
                let n = self
                    .serial
                    .read(&mut byte)
                    .map_err(|_| ModemError::SerialFailure)?;
                if n == 1 {
                    return Ok(byte[0]);
                }
            }
            if deadline_reached(self.clock.now_ms(), deadline) {
                return Err(ModemError::Timeout);
            }
            self.delay.delay_ms(POLL_INTERVAL_MS);
        }
    }

    /// Next non-empty line with CR/LF stripped.
    fn read_line(&mut self, deadline: u32) -> Result<Line, ModemError> {
        loop {
            let byte = self.read_byte(deadline)?;
            match byte {
                b'\r' => {}
                b'\n' => {
                    if self.line.is_empty() {
                        continue;
                    }
                    let text = core::str::from_utf8(&self.line)
                        .ok()
                        .and_then(|s| Line::try_from(s).ok());
                    self.line.clear();
                    let line = text.ok_or(ModemError::ProtocolError)?;
                    debug!("<< {}", line);
                    return Ok(line);
                }
                other => {
                    if self.line.push(other).is_err() {
                        self.line.clear();
                        return Err(ModemError::RxOverflow);
                    }
                }
            }
        }
    }

    /// Read lines until `OK`. Returns the last line starting with `prefix`.
    fn await_ok(&mut self, prefix: Option<&str>, timeout_ms: u32) -> Result<Option<Line>, ModemError> {
        let deadline = self.clock.now_ms().wrapping_add(timeout_ms);
        let mut found = None;
        loop {
            let line = self.read_line(deadline)?;
            if line.as_str() == "OK" {
                return Ok(found);
            }
            if line.as_str() == "ERROR" {
                return Err(ModemError::ProtocolError);
            }
            if prefix.is_some_and(|p| line.starts_with(p)) {
                found = Some(line);
            }
        }
    }

    fn write_binary(&mut self, payload: &[u8]) -> Result<(), ModemError> {
        let mut command: String<16> = String::new();
        write!(command, "AT+SBDWB={}", payload.len()).map_err(|_| ModemError::MessageTooLong)?;
        self.send_command(&command)?;

        let deadline = self.clock.now_ms().wrapping_add(self.config.at_timeout_ms);
        loop {
            match self.read_line(deadline) {
                Ok(line) if line.as_str() == "READY" => break,
                Ok(line) if line.as_str() == "ERROR" => return Err(ModemError::ProtocolError),
                Ok(_) => {}
                Err(ModemError::Timeout) => return Err(ModemError::ProtocolError),
                Err(e) => return Err(e),
            }
        }

        self.write_bytes(payload)?;
        self.write_bytes(&sbd_checksum(payload).to_be_bytes())?;

        // 0 ok, 1 timeout, 2 checksum mismatch, 3 bad size
        let status = self.await_ok(Some(""), self.config.at_timeout_ms)?;
        match status.as_deref().map(str::trim) {
            Some("0") => Ok(()),
            other => {
                warn!("SBDWB rejected: {:?}", other);
                Err(ModemError::ProtocolError)
            }
        }
    }

    fn session(&mut self) -> Result<SbdixStatus, ModemError> {
        self.send_command("AT+SBDIX")?;
        let line = self
            .await_ok(Some("+SBDIX:"), self.config.at_timeout_ms.max(60_000))?
            .ok_or(ModemError::ProtocolError)?;
        let status = SbdixStatus::parse(&line).ok_or(ModemError::ProtocolError)?;
        self.last_status = Some(status);
        Ok(status)
    }

    fn read_exact(&mut self, buf: &mut [u8], deadline: u32) -> Result<(), ModemError> {
        for slot in buf.iter_mut() {
            *slot = self.read_byte(deadline)?;
        }
        Ok(())
    }

    fn read_binary(&mut self, rx: &mut [u8]) -> Result<usize, ModemError> {
        self.send_command("AT+SBDRB")?;
        let deadline = self.clock.now_ms().wrapping_add(self.config.at_timeout_ms);

        let mut header = [0u8; 2];
        self.read_exact(&mut header, deadline)?;
        let len = usize::from(u16::from_be_bytes(header));

        let mut sum = 0u16;
        let mut overflow = false;
        for i in 0..len {
            let byte = self.read_byte(deadline)?;
            sum = sum.wrapping_add(u16::from(byte));
            match rx.get_mut(i) {
                Some(slot) => *slot = byte,
                None => overflow = true,
            }
        }
        let mut checksum = [0u8; 2];
        self.read_exact(&mut checksum, deadline)?;
        self.await_ok(None, self.config.at_timeout_ms)?;

        if overflow {
            return Err(ModemError::RxOverflow);
        }
        if u16::from_be_bytes(checksum) != sum {
            warn!("MT message checksum mismatch");
            return Err(ModemError::ProtocolError);
        }
        Ok(len)
    }
}

impl<S, D, C> SbdModem for Iridium9603<S, D, C>
where
    S: Read + Write + ReadReady,
    D: DelayNs,
    C: Monotonic,
{
    fn signal_quality(&mut self) -> Result<u8, ModemError> {
        self.ensure_ready()?;
        self.send_command("AT+CSQ")?;
        let line = self
            .await_ok(Some("+CSQ:"), self.config.at_timeout_ms)?
            .ok_or(ModemError::ProtocolError)?;
        line.trim_start_matches("+CSQ:")
            .trim()
            .parse::<u8>()
            .ok()
            .filter(|bars| *bars <= 5)
            .ok_or(ModemError::ProtocolError)
    }

    fn send_receive(&mut self, payload: &[u8], rx: &mut [u8]) -> Result<usize, ModemError> {
        self.ensure_ready()?;
        if payload.is_empty() || payload.len() > MAX_MO_LEN {
            return Err(ModemError::MessageTooLong);
        }
        self.write_binary(payload)?;

        let deadline = self
            .clock
            .now_ms()
            .wrapping_add(self.config.send_receive_timeout_ms);
        let status = loop {
            let status = self.session()?;
            if status.delivered() {
                break status;
            }
            warn!("SBDIX MO status {}, retrying", status.mo_status);
            if deadline_reached(self.clock.now_ms(), deadline) {
                return Err(ModemError::Timeout);
            }
            self.delay.delay_ms(self.config.sbdix_retry_ms);
        };
        info!("SBD delivered, MOMSN {}", status.momsn);

        let received = if status.mt_received() && status.mt_length > 0 {
            self.read_binary(rx)?
        } else {
            0
        };
        self.clear_mo_buffer()?;
        Ok(received)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimClock, SimDelay, SimIridium};

    fn modem(sim: SimIridium, clock: &SimClock) -> Iridium9603<SimIridium, SimDelay, SimClock> {
        Iridium9603::new(
            sim,
            SimDelay::new(clock.clone()),
            clock.clone(),
            IridiumConfig::default(),
        )
    }

    #[test]
    fn test_parse_sbdix() {
        let status = SbdixStatus::parse("+SBDIX: 0, 12, 1, 3, 7, 0").unwrap();
        assert!(status.delivered());
        assert!(status.mt_received());
        assert_eq!(status.momsn, 12);
        assert_eq!(status.mt_length, 7);

        let failed = SbdixStatus::parse("+SBDIX: 32, 13, 0, 0, 0, 0").unwrap();
        assert!(!failed.delivered());
        assert!(SbdixStatus::parse("+CSQ:3").is_none());
        assert!(SbdixStatus::parse("+SBDIX: 0, 1").is_none());
    }

    #[test]
    fn test_checksum() {
        assert_eq!(sbd_checksum(b"hello"), 0x0214);
        // 300 * 0xFF = 76500 wraps to 10964
        assert_eq!(sbd_checksum(&[0xFF; 300]), 10_964);
    }

    #[test]
    fn test_begin_and_signal() {
        let clock = SimClock::new();
        let mut sim = SimIridium::new(clock.clone());
        sim.set_signal(4);
        let mut modem = modem(sim, &clock);

        assert_eq!(modem.signal_quality(), Err(ModemError::IsAsleep));
        modem.begin().unwrap();
        assert_eq!(modem.signal_quality(), Ok(4));
    }

    #[test]
    fn test_no_modem() {
        let clock = SimClock::new();
        let mut sim = SimIridium::new(clock.clone());
        sim.set_powered(false);
        let mut modem = Iridium9603::new(
            sim,
            SimDelay::new(clock.clone()),
            clock.clone(),
            IridiumConfig {
                startup_timeout_ms: 5000,
                ..Default::default()
            },
        );
        assert_eq!(modem.begin(), Err(ModemError::NoModemDetected));
        assert!(clock.now() >= 5000);
    }

    #[test]
    fn test_send_receive_delivers() {
        let clock = SimClock::new();
        let sim = SimIridium::new(clock.clone());
        let mut modem = modem(sim, &clock);
        modem.begin().unwrap();

        let mut rx = [0u8; 64];
        assert_eq!(modem.send_receive(b"297604501,-953698204\n", &mut rx), Ok(0));
        let sim = &modem.serial;
        assert_eq!(sim.delivered().len(), 1);
        assert_eq!(sim.delivered()[0], b"297604501,-953698204\n");
        assert!(sim.mo_buffer().is_none());
        assert!(modem.last_status().unwrap().delivered());
    }

    #[test]
    fn test_send_receive_reads_mt_message() {
        let clock = SimClock::new();
        let mut sim = SimIridium::new(clock.clone());
        sim.queue_mt(b"PING");
        let mut modem = modem(sim, &clock);
        modem.begin().unwrap();

        let mut rx = [0u8; 64];
        assert_eq!(modem.send_receive(b"1,2\n", &mut rx), Ok(4));
        assert_eq!(&rx[..4], b"PING");

        let mut tiny = [0u8; 2];
        modem.serial.queue_mt(b"LONGER");
        assert_eq!(
            modem.send_receive(b"1,2\n", &mut tiny),
            Err(ModemError::RxOverflow)
        );
    }

    #[test]
    fn test_session_retries_until_network() {
        let clock = SimClock::new();
        let mut sim = SimIridium::new(clock.clone());
        sim.fail_sessions(2);
        let mut modem = modem(sim, &clock);
        modem.begin().unwrap();

        let mut rx = [0u8; 8];
        assert_eq!(modem.send_receive(b"1,2\n", &mut rx), Ok(0));
        assert_eq!(modem.serial.session_count(), 3);
        assert!(clock.now() >= 2 * 10_000);
    }

    #[test]
    fn test_session_gives_up_at_timeout() {
        let clock = SimClock::new();
        let mut sim = SimIridium::new(clock.clone());
        sim.fail_sessions(u32::MAX);
        let mut modem = Iridium9603::new(
            sim,
            SimDelay::new(clock.clone()),
            clock.clone(),
            IridiumConfig {
                send_receive_timeout_ms: 30_000,
                ..Default::default()
            },
        );
        modem.begin().unwrap();

        let mut rx = [0u8; 8];
        assert_eq!(modem.send_receive(b"1,2\n", &mut rx), Err(ModemError::Timeout));
        assert!(modem.serial.delivered().is_empty());
    }

    #[test]
    fn test_rejects_oversized_payload() {
        let clock = SimClock::new();
        let mut modem = modem(SimIridium::new(clock.clone()), &clock);
        modem.begin().unwrap();
        let mut rx = [0u8; 8];
        assert_eq!(
            modem.send_receive(&[b','; 341], &mut rx),
            Err(ModemError::MessageTooLong)
        );
    }
}
