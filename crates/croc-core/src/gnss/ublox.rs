//! u-blox receiver over the DDC (I2C) port
//!
//! The receiver buffers its output; register 0xFD holds the number of bytes
//! waiting (big-endian) and register 0xFF streams them. Configuration goes in
//! as raw UBX frames and is acknowledged with ACK-ACK / ACK-NAK.

use embedded_hal::delay::DelayNs;
use embedded_hal::i2c::I2c;
use log::{debug, error, info, warn};

use super::ubx::{self, DopSolution, HpPosition, PvtSolution, UbxDecoder, UbxEvent};
use super::{
    validate_fix, FixCriteria, FixType, GnssData, GnssError, GnssReceiver, GnssState, GnssStats,
    GnssTime, Position,
};
use crate::bus::RegisterBus;
use crate::clock::{elapsed_ms, Monotonic};
use crate::time::DateTime;

pub const UBLOX_ADDRESS: u8 = 0x42;

const REG_BYTES_AVAILABLE: u8 = 0xFD;
const REG_DATA_STREAM: u8 = 0xFF;
const READ_CHUNK: usize = 32;
/// Upper bound on bytes drained per poll so one call cannot stall the loop.
const MAX_DRAIN_PER_POLL: usize = 1024;
const ACK_POLL_INTERVAL_MS: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GnssConfig {
    pub measurement_rate_ms: u16,
    pub navigation_rate: u16,
    /// How long to wait for each ACK during init.
    pub ack_timeout_ms: u32,
    pub criteria: FixCriteria,
}

impl Default for GnssConfig {
    fn default() -> Self {
        Self {
            measurement_rate_ms: 1000,
            navigation_rate: 1,
            ack_timeout_ms: 1100,
            criteria: FixCriteria::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct AckEvent {
    class: u8,
    id: u8,
    acked: bool,
}

pub struct UbloxGnss<I> {
    bus: RegisterBus<I>,
    address: u8,
    state: GnssState,
    config: GnssConfig,
    decoder: UbxDecoder,
    last_pvt: Option<(PvtSolution, u32)>,
    last_dop: Option<DopSolution>,
    last_hp: Option<HpPosition>,
    last_ack: Option<AckEvent>,
    rate_response: Option<(u16, u16)>,
    init_ms: u32,
    stats: GnssStats,
}

impl<I: I2c> UbloxGnss<I> {
    pub fn new(i2c: I) -> Self {
        Self {
            bus: RegisterBus::new(i2c),
            address: UBLOX_ADDRESS,
            state: GnssState::Uninitialized,
            config: GnssConfig::default(),
            decoder: UbxDecoder::new(),
            last_pvt: None,
            last_dop: None,
            last_hp: None,
            last_ack: None,
            rate_response: None,
            init_ms: 0,
            stats: GnssStats::default(),
        }
    }

    pub fn state(&self) -> GnssState {
        self.state
    }

    pub fn stats(&self) -> GnssStats {
        self.stats
    }

    pub fn config(&self) -> &GnssConfig {
        &self.config
    }

    /// Bring the receiver up in UBX-only mode with PVT, DOP and HPPOSLLH
    /// output, portable dynamics, and the configured rates.
    pub fn initialize(
        &mut self,
        config: GnssConfig,
        delay: &mut impl DelayNs,
        clock: &impl Monotonic,
    ) -> Result<(), GnssError> {
        self.config = config;
        self.state = GnssState::Uninitialized;
        self.init_ms = clock.now_ms();

        if !self.bus.is_present(self.address) {
            error!("u-blox receiver not found at 0x{:02x}", self.address);
            return Err(GnssError::CommunicationFailed);
        }

        self.send_config(ubx::CFG_PRT, &ubx::cfg_prt_ddc(self.address), delay, clock)?;
        for id in [ubx::NAV_PVT, ubx::NAV_DOP, ubx::NAV_HPPOSLLH] {
            self.send_config(ubx::CFG_MSG, &ubx::cfg_msg_ddc(id), delay, clock)?;
        }
        if config.measurement_rate_ms != 1000 || config.navigation_rate != 1 {
            self.send_config(
                ubx::CFG_RATE,
                &ubx::cfg_rate(config.measurement_rate_ms, config.navigation_rate),
                delay,
                clock,
            )?;
        }
        self.send_config(ubx::CFG_NAV5, &ubx::cfg_nav5_portable(), delay, clock)?;

        // Re-verify by polling the rate back.
        self.rate_response = None;
        self.send_frame(&ubx::cfg_rate_poll())?;
        let start = clock.now_ms();
        while self.rate_response.is_none() {
            if elapsed_ms(clock.now_ms(), start) >= config.ack_timeout_ms {
                error!("u-blox did not answer CFG-RATE poll");
                return Err(GnssError::CommunicationFailed);
            }
            delay.delay_ms(ACK_POLL_INTERVAL_MS);
            self.poll(clock.now_ms())?;
        }
        if let Some((meas, nav)) = self.rate_response {
            if meas != config.measurement_rate_ms || nav != config.navigation_rate {
                warn!("u-blox rate readback {} ms / {} differs from requested", meas, nav);
            }
        }

        self.state = GnssState::Ready;
        info!(
            "u-blox ready: {} ms measurement rate, nav rate {}",
            config.measurement_rate_ms, config.navigation_rate
        );
        Ok(())
    }

    /// Clear the receiver's saved configuration. Requires a fresh
    /// `initialize` afterwards and restarts first-fix timing.
    pub fn factory_reset(
        &mut self,
        delay: &mut impl DelayNs,
        clock: &impl Monotonic,
    ) -> Result<(), GnssError> {
        self.send_config(ubx::CFG_CFG, &ubx::cfg_cfg_factory_reset(), delay, clock)?;
        self.state = GnssState::Uninitialized;
        self.stats = GnssStats::default();
        self.last_pvt = None;
        self.last_dop = None;
        self.last_hp = None;
        info!("u-blox factory reset");
        Ok(())
    }

    /// Drain whatever the receiver has buffered. Returns the number of
    /// complete messages handled.
    pub fn poll(&mut self, now_ms: u32) -> Result<usize, GnssError> {
        let available = usize::from(self.bus.read16(self.address, REG_BYTES_AVAILABLE));
        if self.bus.take_error() {
            return Err(GnssError::CommunicationFailed);
        }

        let mut remaining = available.min(MAX_DRAIN_PER_POLL);
        let mut handled = 0;
        let mut chunk = [0u8; READ_CHUNK];
        while remaining > 0 {
            let n = remaining.min(READ_CHUNK);
            if !self
                .bus
                .read_register(self.address, REG_DATA_STREAM, &mut chunk[..n])
            {
                self.bus.take_error();
                return Err(GnssError::CommunicationFailed);
            }
            self.decoder.feed(&chunk[..n], |event| {
                handled += 1;
                match event {
                    UbxEvent::Pvt(pvt) => self.last_pvt = Some((pvt, now_ms)),
                    UbxEvent::Dop(dop) => self.last_dop = Some(dop),
                    UbxEvent::HpPosition(hp) => self.last_hp = Some(hp),
                    UbxEvent::Ack { class, id, acked } => {
                        self.last_ack = Some(AckEvent { class, id, acked })
                    }
                    UbxEvent::Rate(meas, nav) => self.rate_response = Some((meas, nav)),
                }
            });
            remaining -= n;
        }

        self.stats.checksum_errors = self.decoder.checksum_errors();
        if handled > 0 {
            debug!("u-blox: {} messages", handled);
        }
        Ok(handled)
    }

    fn send_frame(&mut self, frame: &[u8]) -> Result<(), GnssError> {
        if self.bus.write_raw(self.address, frame) {
            Ok(())
        } else {
            self.bus.take_error();
            Err(GnssError::CommunicationFailed)
        }
    }

    /// Send a CFG frame and wait for the ACK naming `id`.
    fn send_config(
        &mut self,
        id: u8,
        frame: &[u8],
        delay: &mut impl DelayNs,
        clock: &impl Monotonic,
    ) -> Result<(), GnssError> {
        self.last_ack = None;
        self.send_frame(frame)?;

        let start = clock.now_ms();
        loop {
            self.poll(clock.now_ms())?;
            if let Some(ack) = self.last_ack.take() {
                if ack.class == ubx::CLASS_CFG && ack.id == id {
                    if ack.acked {
                        return Ok(());
                    }
                    error!("u-blox rejected CFG {:02x}", id);
                    return Err(GnssError::ConfigurationRejected(id));
                }
            }
            if elapsed_ms(clock.now_ms(), start) >= self.config.ack_timeout_ms {
                error!("u-blox: no ACK for CFG {:02x}", id);
                return Err(GnssError::CommunicationFailed);
            }
            delay.delay_ms(ACK_POLL_INTERVAL_MS);
        }
    }

    /// Combine the newest PVT with the DOP and high-precision position of the
    /// same navigation epoch. Without a matching NAV-DOP the DOPs are NaN,
    /// which no HDOP limit accepts.
    fn compose(&self, pvt: &PvtSolution, received_ms: u32) -> GnssData {
        let fix_type = FixType::from_ubx(pvt.fix_type);
        let fix_ok = pvt.fix_ok();
        let (pdop, hdop) = match self.last_dop {
            Some(dop) if dop.itow_ms == pvt.itow_ms => (dop.pdop, dop.hdop),
            _ => (f32::NAN, f32::NAN),
        };

        let position = (fix_type.has_position() && fix_ok).then(|| {
            let (latitude_deg, longitude_deg) = match self.last_hp {
                Some(hp) if hp.itow_ms == pvt.itow_ms => (hp.latitude_deg, hp.longitude_deg),
                _ => (pvt.latitude_deg, pvt.longitude_deg),
            };
            Position {
                latitude_deg,
                longitude_deg,
                altitude_m: pvt.height_msl_m as f32,
                horizontal_accuracy_m: pvt.h_acc_mm as f32 / 1000.0,
                vertical_accuracy_m: pvt.v_acc_mm as f32 / 1000.0,
            }
        });

        let time = (pvt.date_valid() && pvt.time_valid()).then(|| GnssTime {
            utc: DateTime::new(pvt.year, pvt.month, pvt.day, pvt.hour, pvt.minute, pvt.second),
            nanos: pvt.nano,
            date_valid: true,
            time_valid: true,
            fully_resolved: pvt.fully_resolved(),
            confirmed_date: pvt.confirmed_date(),
            confirmed_time: pvt.confirmed_time(),
        });

        GnssData {
            monotonic_ms: received_ms,
            fix_type,
            satellites_used: pvt.num_sv,
            hdop,
            pdop,
            fix_ok,
            position,
            time,
            validation_passed: false,
        }
    }
}

impl<I: I2c> GnssReceiver for UbloxGnss<I> {
    fn is_ready(&self) -> bool {
        self.state != GnssState::Uninitialized
    }

    fn read_position(&mut self, now_ms: u32) -> Result<GnssData, GnssError> {
        if self.state == GnssState::Uninitialized {
            return Err(GnssError::NotReady);
        }
        self.poll(now_ms)?;

        let (pvt, received_ms) = self.last_pvt.ok_or(GnssError::NoFix)?;
        let mut data = self.compose(&pvt, received_ms);
        data.validation_passed = validate_fix(&data, &self.config.criteria, now_ms);

        self.stats.readings += 1;
        if data.validation_passed {
            self.stats.valid_fixes += 1;
            if self.stats.time_to_first_fix_ms.is_none() {
                let ttff = elapsed_ms(received_ms, self.init_ms);
                self.stats.time_to_first_fix_ms = Some(ttff);
                self.state = GnssState::AcquiredFirstFix;
                info!("GNSS first fix after {} ms, {} satellites", ttff, data.satellites_used);
            }
        } else {
            self.stats.rejected_fixes += 1;
        }
        Ok(data)
    }

    fn get_time(&mut self, now_ms: u32) -> Result<GnssTime, GnssError> {
        if self.state == GnssState::Uninitialized {
            return Err(GnssError::NotReady);
        }
        self.poll(now_ms)?;
        let (pvt, received_ms) = self.last_pvt.ok_or(GnssError::NoFix)?;
        self.compose(&pvt, received_ms)
            .time
            .filter(|t| t.is_valid())
            .ok_or(GnssError::InvalidTime)
    }

    fn validate_fix(&self, data: &GnssData, now_ms: u32) -> bool {
        validate_fix(data, &self.config.criteria, now_ms)
    }

    /// Thresholds can change at runtime without reconfiguring the receiver.
    fn set_criteria(&mut self, criteria: FixCriteria) {
        debug!(
            "fix criteria: {} satellites, HDOP {}",
            criteria.min_satellites, criteria.max_hdop
        );
        self.config.criteria = criteria;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimClock, SimDelay, SimFix, SimI2cBus, SimUblox};

    fn receiver() -> (UbloxGnss<SimI2cBus>, SimClock, SimDelay) {
        let clock = SimClock::new();
        let mut bus = SimI2cBus::new();
        bus.attach(UBLOX_ADDRESS, SimUblox::new());
        (UbloxGnss::new(bus), clock.clone(), SimDelay::new(clock))
    }

    fn sim(gnss: &mut UbloxGnss<SimI2cBus>) -> &mut SimUblox {
        gnss.bus.i2c_mut().device_mut::<SimUblox>(UBLOX_ADDRESS).unwrap()
    }

    fn houston() -> SimFix {
        SimFix::at(DateTime::new(2025, 3, 1, 2, 30, 0), 29.760_450_123, -95.369_820_441)
    }

    #[test]
    fn test_initialize_configures_receiver() {
        let (mut gnss, clock, mut delay) = receiver();
        gnss.initialize(GnssConfig::default(), &mut delay, &clock).unwrap();
        assert_eq!(gnss.state(), GnssState::Ready);

        let dev = sim(&mut gnss);
        assert!(dev.ubx_only());
        assert!(dev.message_enabled(ubx::CLASS_NAV, ubx::NAV_PVT));
        assert!(dev.message_enabled(ubx::CLASS_NAV, ubx::NAV_DOP));
        assert!(dev.message_enabled(ubx::CLASS_NAV, ubx::NAV_HPPOSLLH));
        assert_eq!(dev.dynamic_model(), Some(0));
        // default rate is not written
        assert_eq!(dev.config_count(ubx::CFG_RATE), 0);
    }

    #[test]
    fn test_initialize_sets_non_default_rate() {
        let (mut gnss, clock, mut delay) = receiver();
        let config = GnssConfig {
            measurement_rate_ms: 500,
            navigation_rate: 2,
            ..GnssConfig::default()
        };
        gnss.initialize(config, &mut delay, &clock).unwrap();
        assert_eq!(sim(&mut gnss).rate(), (500, 2));
    }

    #[test]
    fn test_initialize_reports_nak() {
        let (mut gnss, clock, mut delay) = receiver();
        sim(&mut gnss).reject(ubx::CFG_NAV5);
        assert_eq!(
            gnss.initialize(GnssConfig::default(), &mut delay, &clock),
            Err(GnssError::ConfigurationRejected(ubx::CFG_NAV5))
        );
        assert!(!gnss.is_ready());
    }

    #[test]
    fn test_initialize_missing_receiver() {
        let clock = SimClock::new();
        let mut gnss = UbloxGnss::new(SimI2cBus::new());
        assert_eq!(
            gnss.initialize(GnssConfig::default(), &mut SimDelay::new(clock.clone()), &clock),
            Err(GnssError::CommunicationFailed)
        );
        assert_eq!(gnss.read_position(0), Err(GnssError::NotReady));
    }

    #[test]
    fn test_read_position_before_any_fix() {
        let (mut gnss, clock, mut delay) = receiver();
        gnss.initialize(GnssConfig::default(), &mut delay, &clock).unwrap();
        assert_eq!(gnss.read_position(clock.now()), Err(GnssError::NoFix));
    }

    #[test]
    fn test_read_position_decodes_fix() {
        let (mut gnss, clock, mut delay) = receiver();
        gnss.initialize(GnssConfig::default(), &mut delay, &clock).unwrap();
        clock.advance(5_000);
        sim(&mut gnss).publish_fix(&houston());

        let data = gnss.read_position(clock.now()).unwrap();
        assert_eq!(data.fix_type, FixType::Fix3D);
        assert_eq!(data.monotonic_ms, clock.now());
        assert_eq!(data.satellites_used, 9);
        assert!((data.hdop - 0.9).abs() < 1e-6);
        let pos = data.position.unwrap();
        assert!((pos.latitude_deg - 29.760_450_123).abs() < 1e-9);
        assert!((pos.longitude_deg + 95.369_820_441).abs() < 1e-9);
        assert!((pos.altitude_m - 12.5).abs() < 1e-3);
        assert!(data.validation_passed);
        assert_eq!(gnss.state(), GnssState::AcquiredFirstFix);
        assert!(gnss.stats().time_to_first_fix_ms.unwrap() >= 5_000);

        let time = gnss.get_time(clock.now()).unwrap();
        assert_eq!(time.utc, DateTime::new(2025, 3, 1, 2, 30, 0));
    }

    #[test]
    fn test_fix_without_time_and_without_position() {
        let (mut gnss, clock, mut delay) = receiver();
        gnss.initialize(GnssConfig::default(), &mut delay, &clock).unwrap();

        let mut fix = houston();
        fix.utc = None;
        fix.fix_type = 0;
        sim(&mut gnss).publish_fix(&fix);

        let data = gnss.read_position(clock.now()).unwrap();
        assert!(data.position.is_none());
        assert!(!data.validation_passed);
        assert_eq!(gnss.get_time(clock.now()), Err(GnssError::InvalidTime));
        assert_eq!(gnss.stats().rejected_fixes, 1);
        assert_eq!(gnss.state(), GnssState::Ready);
    }

    #[test]
    fn test_stale_fix_fails_validation() {
        let (mut gnss, clock, mut delay) = receiver();
        gnss.initialize(GnssConfig::default(), &mut delay, &clock).unwrap();
        sim(&mut gnss).publish_fix(&houston());
        let received = gnss.read_position(clock.now()).unwrap();
        assert!(gnss.validate_fix(&received, clock.now()));

        clock.advance(10_001);
        let data = gnss.read_position(clock.now()).unwrap();
        assert!(!data.validation_passed);
        assert!(!gnss.has_valid_fix(clock.now()));
    }

    #[test]
    fn test_epoch_without_dop_fails_validation() {
        let (mut gnss, clock, mut delay) = receiver();
        gnss.initialize(GnssConfig::default(), &mut delay, &clock).unwrap();
        let pvt = ubx::frame(ubx::CLASS_NAV, ubx::NAV_PVT, &houston().nav_pvt(9_000));
        sim(&mut gnss).inject_raw(&pvt);

        let data = gnss.read_position(clock.now()).unwrap();
        assert!(data.position.is_some());
        assert!(data.hdop.is_nan());
        assert!(!data.validation_passed);
    }

    #[test]
    fn test_corrupt_frame_counted_and_skipped() {
        let (mut gnss, clock, mut delay) = receiver();
        gnss.initialize(GnssConfig::default(), &mut delay, &clock).unwrap();
        let mut bad = ubx::frame(ubx::CLASS_NAV, ubx::NAV_PVT, &houston().nav_pvt(9_000));
        let last = bad.len() - 1;
        bad[last] ^= 0xA5;
        sim(&mut gnss).inject_raw(&bad);
        sim(&mut gnss).publish_fix(&houston());

        let data = gnss.read_position(clock.now()).unwrap();
        assert!(data.validation_passed);
        assert_eq!(gnss.stats().checksum_errors, 1);
    }

    #[test]
    fn test_factory_reset_restarts_first_fix() {
        let (mut gnss, clock, mut delay) = receiver();
        gnss.initialize(GnssConfig::default(), &mut delay, &clock).unwrap();
        sim(&mut gnss).publish_fix(&houston());
        gnss.read_position(clock.now()).unwrap();
        assert!(gnss.stats().time_to_first_fix_ms.is_some());

        gnss.factory_reset(&mut delay, &clock).unwrap();
        assert_eq!(gnss.state(), GnssState::Uninitialized);
        assert_eq!(gnss.stats().time_to_first_fix_ms, None);
    }
}
