//! Short-burst-data transmission of the fix log
//!
//! A transmission takes the head of a log file (at most one SBD unit), hands
//! it to the modem with retry and backoff, and only after the modem confirms
//! delivery removes those bytes from the file with [`shift_prefix`]. A reset
//! between delivery and the shift means the same bytes go out again next time;
//! the receiving side is expected to tolerate duplicates.

pub mod iridium;

pub use iridium::{Iridium9603, IridiumConfig};

use alloc::vec;
use alloc::vec::Vec;

use crc::{Crc, CRC_8_SMBUS};
use embedded_hal::delay::DelayNs;
use log::{debug, error, info, warn};
use thiserror_no_std::Error;

use crate::clock::{elapsed_ms, Monotonic};
use crate::error::TrackerError;
use crate::storage::{shift_prefix, FileStore, StorageError};

/// Largest mobile-originated unit we ever send.
pub const MAX_SBD_PAYLOAD: usize = 95;
/// Largest mobile-terminated message the 9603 can hold.
pub const MAX_MT_MESSAGE: usize = 270;

/// Failure codes of an SBD session, numbered as the modem library reports them.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModemError {
    #[error("modem already awake")]
    AlreadyAwake,
    #[error("serial port failure")]
    SerialFailure,
    #[error("unexpected modem response")]
    ProtocolError,
    #[error("session cancelled")]
    Cancelled,
    #[error("no modem detected")]
    NoModemDetected,
    #[error("SBDIX fatal error")]
    SbdixFatal,
    #[error("send/receive timed out")]
    Timeout,
    #[error("receive buffer overflow")]
    RxOverflow,
    #[error("modem busy")]
    Reentrant,
    #[error("modem is asleep")]
    IsAsleep,
    #[error("no sleep pin configured")]
    NoSleepPin,
    #[error("no network service")]
    NoNetwork,
    #[error("message too long")]
    MessageTooLong,
    /// Signal below the configured minimum. Never reported by the modem itself.
    #[error("signal quality too low")]
    NoSignal,
}

impl ModemError {
    /// Map an ISBD status code (1..=13) to an error. Zero is success.
    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            1 => Self::AlreadyAwake,
            2 => Self::SerialFailure,
            3 => Self::ProtocolError,
            4 => Self::Cancelled,
            5 => Self::NoModemDetected,
            6 => Self::SbdixFatal,
            7 => Self::Timeout,
            8 => Self::RxOverflow,
            9 => Self::Reentrant,
            10 => Self::IsAsleep,
            11 => Self::NoSleepPin,
            12 => Self::NoNetwork,
            13 => Self::MessageTooLong,
            _ => return None,
        })
    }

    pub fn code(self) -> u8 {
        match self {
            Self::AlreadyAwake => 1,
            Self::SerialFailure => 2,
            Self::ProtocolError => 3,
            Self::Cancelled => 4,
            Self::NoModemDetected => 5,
            Self::SbdixFatal => 6,
            Self::Timeout => 7,
            Self::RxOverflow => 8,
            Self::Reentrant => 9,
            Self::IsAsleep => 10,
            Self::NoSleepPin => 11,
            Self::NoNetwork => 12,
            Self::MessageTooLong => 13,
            Self::NoSignal => 12,
        }
    }

    /// Errors worth another attempt after a backoff.
    pub fn is_recoverable(self) -> bool {
        matches!(self, Self::Timeout | Self::ProtocolError | Self::NoSignal)
    }
}

impl From<ModemError> for TrackerError {
    fn from(e: ModemError) -> Self {
        match e {
            ModemError::Timeout => TrackerError::ModemTimeout,
            ModemError::ProtocolError => TrackerError::ModemProtocolError,
            ModemError::NoSignal | ModemError::NoNetwork => TrackerError::ModemNoSignal,
            ModemError::MessageTooLong => TrackerError::InvalidPayload,
            _ => TrackerError::ModemFatal,
        }
    }
}

/// A satellite modem that can run one SBD session at a time.
pub trait SbdModem {
    /// Signal strength in bars, 0..=5.
    fn signal_quality(&mut self) -> Result<u8, ModemError>;

    /// Send `payload` as one binary unit and collect any queued
    /// mobile-terminated message into `rx`. Returns the received length.
    fn send_receive(&mut self, payload: &[u8], rx: &mut [u8]) -> Result<usize, ModemError>;
}

impl<M: SbdModem + ?Sized> SbdModem for &mut M {
    fn signal_quality(&mut self) -> Result<u8, ModemError> {
        (**self).signal_quality()
    }

    fn send_receive(&mut self, payload: &[u8], rx: &mut [u8]) -> Result<usize, ModemError> {
        (**self).send_receive(payload, rx)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransmitSettings {
    /// Bytes per unit, capped at [`MAX_SBD_PAYLOAD`].
    pub max_payload: usize,
    pub max_retries: u8,
    pub min_signal: u8,
    pub backoff_ms: u32,
}

impl Default for TransmitSettings {
    fn default() -> Self {
        Self {
            max_payload: MAX_SBD_PAYLOAD,
            max_retries: 3,
            min_signal: 2,
            backoff_ms: 5000,
        }
    }
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransmitError {
    #[error("log is empty")]
    Empty,
    #[error("payload failed integrity check")]
    InvalidPayload,
    #[error("storage error: {0}")]
    Storage(StorageError),
    #[error("modem error {error} after {attempts} attempts")]
    Modem { error: ModemError, attempts: u8 },
}

impl From<StorageError> for TransmitError {
    fn from(e: StorageError) -> Self {
        Self::Storage(e)
    }
}

impl From<TransmitError> for TrackerError {
    fn from(e: TransmitError) -> Self {
        match e {
            TransmitError::Empty => TrackerError::LogEmpty,
            TransmitError::InvalidPayload => TrackerError::InvalidPayload,
            TransmitError::Storage(e) => e.into(),
            TransmitError::Modem { error, .. } => error.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransmitReport {
    pub bytes_sent: usize,
    pub attempts: u8,
    /// Monotonic time from the start of the first attempt to the end of the last.
    pub elapsed_ms: u32,
    pub crc8: u8,
    /// Size of the log after the shift.
    pub remaining_bytes: u32,
    /// Mobile-terminated message collected during the session, if any.
    pub received: Vec<u8>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransmitStats {
    pub sessions: u32,
    pub successes: u32,
    pub failures: u32,
    pub bytes_sent: u32,
    pub last_error: Option<ModemError>,
}

/// CRC-8/SMBUS: polynomial 0x07, initial value 0, no reflection.
const CRC8: Crc<u8> = Crc::<u8>::new(&CRC_8_SMBUS);

pub fn crc8(data: &[u8]) -> u8 {
    CRC8.checksum(data)
}

/// Text payloads (printable ASCII plus CR, LF and TAB) must contain a comma or
/// LF. Anything with other bytes is taken as binary and passes as is.
pub fn validate_payload(data: &[u8]) -> bool {
    if data.is_empty() {
        return false;
    }
    let is_text = data
        .iter()
        .all(|&b| (32..=126).contains(&b) || matches!(b, b'\r' | b'\n' | b'\t'));
    !is_text || data.iter().any(|&b| b == b',' || b == b'\n')
}

pub struct TransmitPipeline {
    settings: TransmitSettings,
    stats: TransmitStats,
}

impl TransmitPipeline {
    pub fn new(settings: TransmitSettings) -> Self {
        Self {
            settings,
            stats: TransmitStats::default(),
        }
    }

    pub fn settings(&self) -> &TransmitSettings {
        &self.settings
    }

    pub fn set_settings(&mut self, settings: TransmitSettings) {
        self.settings = settings;
    }

    pub fn stats(&self) -> &TransmitStats {
        &self.stats
    }

    /// Send the head of `name` and remove it from the file once delivered.
    ///
    /// Any writer on `name` must be closed first. The file is only modified
    /// after the modem reports success.
    pub fn transmit_file(
        &mut self,
        store: &mut impl FileStore,
        name: &str,
        modem: &mut impl SbdModem,
        delay: &mut impl DelayNs,
        clock: &impl Monotonic,
    ) -> Result<TransmitReport, TransmitError> {
        let size = store.size(name)?.ok_or(StorageError::NotFound)?;
        if size == 0 {
            info!("transmit {}: nothing to send", name);
            return Err(TransmitError::Empty);
        }

        let limit = self.settings.max_payload.min(MAX_SBD_PAYLOAD);
        let n = (size as usize).min(limit);
        let mut payload = vec![0u8; n];
        let read = store.read_at(name, 0, &mut payload)?;
        if read != n {
            error!("transmit {}: short read {} of {} bytes", name, read, n);
            return Err(StorageError::ReadFailed.into());
        }
        if !validate_payload(&payload) {
            warn!("transmit {}: payload failed validation", name);
            return Err(TransmitError::InvalidPayload);
        }

        let mut report = self.send(&payload, modem, delay, clock)?;

        match shift_prefix(store, name, n as u32) {
            Ok(remaining) => report.remaining_bytes = remaining,
            Err(e) => {
                // Delivered but still at the head of the log: goes out again next time.
                error!("transmit {}: sent {} bytes but shift failed: {}", name, n, e);
                return Err(e.into());
            }
        }
        info!(
            "transmit {}: {} bytes in {} ms, {} left",
            name, n, report.elapsed_ms, report.remaining_bytes
        );
        Ok(report)
    }

    /// Send a message that is not backed by a file.
    pub fn send_message(
        &mut self,
        message: &[u8],
        modem: &mut impl SbdModem,
        delay: &mut impl DelayNs,
        clock: &impl Monotonic,
    ) -> Result<TransmitReport, TransmitError> {
        if message.len() > self.settings.max_payload.min(MAX_SBD_PAYLOAD) {
            return Err(TransmitError::Modem {
                error: ModemError::MessageTooLong,
                attempts: 0,
            });
        }
        if !validate_payload(message) {
            return Err(TransmitError::InvalidPayload);
        }
        self.send(message, modem, delay, clock)
    }

    /// Retry loop. Low signal and recoverable errors each use up one attempt.
    fn send(
        &mut self,
        payload: &[u8],
        modem: &mut impl SbdModem,
        delay: &mut impl DelayNs,
        clock: &impl Monotonic,
    ) -> Result<TransmitReport, TransmitError> {
        let start = clock.now_ms();
        let max_attempts = self.settings.max_retries.max(1);
        let mut rx = [0u8; MAX_MT_MESSAGE];
        let mut attempts = 0u8;
        let mut last_error = ModemError::Timeout;

        self.stats.sessions += 1;

        while attempts < max_attempts {
            attempts += 1;

            let outcome = match modem.signal_quality() {
                Ok(bars) if bars < self.settings.min_signal => {
                    warn!(
                        "signal {}/5 below minimum {}, attempt {}/{}",
                        bars, self.settings.min_signal, attempts, max_attempts
                    );
                    Err(ModemError::NoSignal)
                }
                Ok(bars) => {
                    debug!("signal {}/5, sending {} bytes", bars, payload.len());
                    modem.send_receive(payload, &mut rx)
                }
                Err(e) => Err(e),
            };

            match outcome {
                Ok(received) => {
                    let elapsed = elapsed_ms(clock.now_ms(), start);
                    self.stats.successes += 1;
                    self.stats.bytes_sent += payload.len() as u32;
                    self.stats.last_error = None;
                    if received > 0 {
                        info!("received {} byte MT message", received);
                    }
                    return Ok(TransmitReport {
                        bytes_sent: payload.len(),
                        attempts,
                        elapsed_ms: elapsed,
                        crc8: crc8(payload),
                        remaining_bytes: 0,
                        received: rx[..received.min(rx.len())].to_vec(),
                    });
                }
                Err(e) if e.is_recoverable() => {
                    warn!(
                        "SBD attempt {}/{} failed: {} (code {})",
                        attempts,
                        max_attempts,
                        e,
                        e.code()
                    );
                    last_error = e;
                    if attempts < max_attempts {
                        delay.delay_ms(self.settings.backoff_ms);
                    }
                }
                Err(e) => {
                    error!("SBD session aborted: {} (code {})", e, e.code());
                    last_error = e;
                    break;
                }
            }
        }

        self.stats.failures += 1;
        self.stats.last_error = Some(last_error);
        error!(
            "SBD failed after {} attempts in {} ms: {}",
            attempts,
            elapsed_ms(clock.now_ms(), start),
            last_error
        );
        Err(TransmitError::Modem {
            error: last_error,
            attempts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{MemFileStore, ScriptedModem, SimClock, SimDelay, StoreFault};
    use crate::storage::TEMP_FILE;

    const LOG: &str = "IRID_DAT.TXT";

    fn fixture(contents: &[u8]) -> (MemFileStore, SimClock, SimDelay) {
        let mut store = MemFileStore::new();
        store.insert(LOG, contents);
        let clock = SimClock::new();
        let delay = SimDelay::new(clock.clone());
        (store, clock, delay)
    }

    fn long_log() -> Vec<u8> {
        let mut log = Vec::new();
        for i in 0..6 {
            log.extend_from_slice(
                alloc::format!("29760450{},-95369820{},250301,02300{}\n", i, i, i).as_bytes(),
            );
        }
        log
    }

    #[test]
    fn test_crc8() {
        assert_eq!(crc8(b""), 0x00);
        assert_eq!(crc8(b"123456789"), 0xF4);
        // Single byte 0x01 through polynomial 0x07.
        assert_eq!(crc8(&[0x01]), 0x07);
        assert_eq!(crc8(b"29.76045,-95.36982\n"), {
            let mut digest = CRC8.digest();
            digest.update(b"29.76045,");
            digest.update(b"-95.36982\n");
            digest.finalize()
        });
    }

    #[test]
    fn test_validate_payload() {
        assert!(validate_payload(b"1,2\n"));
        assert!(validate_payload(b"line\n"));
        assert!(!validate_payload(b"no delimiter"));
        assert!(!validate_payload(b""));
        // binary passes without a delimiter check
        assert!(validate_payload(&[0x01, 0xFF, 0x7F]));
    }

    #[test]
    fn test_modem_codes() {
        for code in 1..=13 {
            assert_eq!(ModemError::from_code(code).unwrap().code(), code);
        }
        assert_eq!(ModemError::from_code(0), None);
        assert_eq!(ModemError::from_code(14), None);
        assert!(ModemError::Timeout.is_recoverable());
        assert!(!ModemError::SbdixFatal.is_recoverable());
    }

    #[test]
    fn test_retry_then_success_shifts_once() {
        let log = long_log();
        let (mut store, clock, mut delay) = fixture(&log);
        let mut modem = ScriptedModem::new(4).with_results(&[
            Err(ModemError::Timeout),
            Err(ModemError::Timeout),
            Ok(()),
        ]);
        modem.set_session_ms(clock.clone(), 20_000);
        let mut pipeline = TransmitPipeline::new(TransmitSettings {
            max_retries: 3,
            ..Default::default()
        });

        let report = pipeline
            .transmit_file(&mut store, LOG, &mut modem, &mut delay, &clock)
            .unwrap();

        assert_eq!(report.bytes_sent, 95);
        assert_eq!(report.attempts, 3);
        // three sessions plus two backoffs
        assert_eq!(report.elapsed_ms, 3 * 20_000 + 2 * 5000);
        assert_eq!(report.crc8, crc8(&log[..95]));
        assert_eq!(store.contents(LOG).unwrap(), &log[95..]);
        assert_eq!(report.remaining_bytes as usize, log.len() - 95);
        assert_eq!(modem.sent().len(), 3);
        assert!(modem.sent().iter().all(|p| p.as_slice() == &log[..95]));
        assert!(store.contents(TEMP_FILE).is_none());
        assert_eq!(pipeline.stats().successes, 1);
    }

    #[test]
    fn test_failure_leaves_log_untouched() {
        let log = long_log();
        let (mut store, clock, mut delay) = fixture(&log);
        let mut modem = ScriptedModem::new(4).with_results(&[Err(ModemError::Timeout); 3]);
        let mut pipeline = TransmitPipeline::new(TransmitSettings::default());

        let err = pipeline
            .transmit_file(&mut store, LOG, &mut modem, &mut delay, &clock)
            .unwrap_err();

        assert_eq!(
            err,
            TransmitError::Modem {
                error: ModemError::Timeout,
                attempts: 3
            }
        );
        assert_eq!(store.contents(LOG).unwrap(), log.as_slice());
        assert_eq!(pipeline.stats().failures, 1);
        assert_eq!(pipeline.stats().last_error, Some(ModemError::Timeout));
    }

    #[test]
    fn test_fatal_error_aborts_without_retry() {
        let (mut store, clock, mut delay) = fixture(b"1,2,250301,000000\n");
        let mut modem = ScriptedModem::new(5).with_results(&[Err(ModemError::SbdixFatal), Ok(())]);
        let mut pipeline = TransmitPipeline::new(TransmitSettings::default());

        let err = pipeline
            .transmit_file(&mut store, LOG, &mut modem, &mut delay, &clock)
            .unwrap_err();
        assert_eq!(
            err,
            TransmitError::Modem {
                error: ModemError::SbdixFatal,
                attempts: 1
            }
        );
        assert_eq!(modem.sent().len(), 1);
        assert_eq!(clock.now(), 0);
        assert_eq!(store.contents(LOG).unwrap(), b"1,2,250301,000000\n");
    }

    #[test]
    fn test_low_signal_waits_and_counts() {
        let (mut store, clock, mut delay) = fixture(b"1,2,250301,000000\n");
        let mut modem = ScriptedModem::new(3).with_signal(&[0, 1]);
        let mut pipeline = TransmitPipeline::new(TransmitSettings::default());

        let report = pipeline
            .transmit_file(&mut store, LOG, &mut modem, &mut delay, &clock)
            .unwrap();
        assert_eq!(report.attempts, 3);
        assert_eq!(report.elapsed_ms, 10_000);
        assert_eq!(modem.sent().len(), 1);
        assert_eq!(store.contents(LOG).unwrap(), b"");
    }

    #[test]
    fn test_no_signal_exhausts_attempts() {
        let (mut store, clock, mut delay) = fixture(b"1,2\n");
        let mut modem = ScriptedModem::new(0);
        let mut pipeline = TransmitPipeline::new(TransmitSettings::default());

        let err = pipeline
            .transmit_file(&mut store, LOG, &mut modem, &mut delay, &clock)
            .unwrap_err();
        assert_eq!(
            err,
            TransmitError::Modem {
                error: ModemError::NoSignal,
                attempts: 3
            }
        );
        assert!(modem.sent().is_empty());
        assert_eq!(TrackerError::from(err), TrackerError::ModemNoSignal);
    }

    #[test]
    fn test_empty_and_invalid_logs() {
        let (mut store, clock, mut delay) = fixture(b"");
        let mut modem = ScriptedModem::new(5);
        let mut pipeline = TransmitPipeline::new(TransmitSettings::default());
        assert_eq!(
            pipeline.transmit_file(&mut store, LOG, &mut modem, &mut delay, &clock),
            Err(TransmitError::Empty)
        );

        store.insert(LOG, b"no delimiters here");
        assert_eq!(
            pipeline.transmit_file(&mut store, LOG, &mut modem, &mut delay, &clock),
            Err(TransmitError::InvalidPayload)
        );
        assert!(modem.sent().is_empty());

        assert_eq!(
            pipeline.transmit_file(&mut store, "NONE.TXT", &mut modem, &mut delay, &clock),
            Err(TransmitError::Storage(StorageError::NotFound))
        );
    }

    #[test]
    fn test_shift_failure_after_delivery_keeps_log() {
        let (mut store, clock, mut delay) = fixture(b"1,2\n3,4\n");
        let mut modem = ScriptedModem::new(5);
        let mut pipeline = TransmitPipeline::new(TransmitSettings {
            max_payload: 4,
            ..Default::default()
        });

        store.fail_times(StoreFault::Replace, 2);
        assert_eq!(
            pipeline.transmit_file(&mut store, LOG, &mut modem, &mut delay, &clock),
            Err(TransmitError::Storage(StorageError::ShiftFailed))
        );
        assert_eq!(store.contents(LOG).unwrap(), b"1,2\n3,4\n");
        assert_eq!(modem.sent().len(), 1);
    }

    #[test]
    fn test_mt_message_returned() {
        let (mut store, clock, mut delay) = fixture(b"1,2\n");
        let mut modem = ScriptedModem::new(5);
        modem.queue_mt(b"RATE 60");
        let mut pipeline = TransmitPipeline::new(TransmitSettings::default());

        let report = pipeline
            .transmit_file(&mut store, LOG, &mut modem, &mut delay, &clock)
            .unwrap();
        assert_eq!(report.received, b"RATE 60");
    }

    #[test]
    fn test_send_message() {
        let clock = SimClock::new();
        let mut delay = SimDelay::new(clock.clone());
        let mut modem = ScriptedModem::new(5);
        let mut pipeline = TransmitPipeline::new(TransmitSettings::default());

        let report = pipeline
            .send_message(b"hello,croc", &mut modem, &mut delay, &clock)
            .unwrap();
        assert_eq!(report.bytes_sent, 10);
        assert_eq!(modem.sent()[0], b"hello,croc");

        let too_long = [b','; 96];
        assert_eq!(
            pipeline.send_message(&too_long, &mut modem, &mut delay, &clock),
            Err(TransmitError::Modem {
                error: ModemError::MessageTooLong,
                attempts: 0
            })
        );
    }
}
