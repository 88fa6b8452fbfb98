//! Desktop simulator for the crocodile tracker.
//!
//! Runs the full croc-core `System` against register-level device models:
//! three INA228 monitors, an RV-8803, a u-blox receiver on the shared I2C bus
//! and an Iridium 9603 behind the AT driver. Logs are written to a directory
//! on the host that stands in for the SD card.
//!
//! Simulated time runs as fast as the host allows. A session is logged to
//! completion, then the fix log is sent over the simulated satellite link.
//!
//! # Usage
//!
//! ```text
//! RUST_LOG=info croc-simulator [card-dir] [session-minutes]
//! ```

mod dir_store;

use std::cell::RefCell;
use std::f64::consts::TAU;
use std::time::{SystemTime, UNIX_EPOCH};

use log::{error, info, warn};

use croc_core::app_state::{Command, CommandStatus, TransmitSource};
use croc_core::gnss::ublox::UBLOX_ADDRESS;
use croc_core::gnss::{GnssConfig, UbloxGnss};
use croc_core::rtc::rv8803::RV8803_ADDRESS;
use croc_core::rtc::{RtcConfig, Rv8803};
use croc_core::scheduler::Devices;
use croc_core::sensors::{Ina228, PowerChannel, PowerSensors};
use croc_core::shared_i2c_bus::SharedI2cDevice;
use croc_core::sim::{
    SimClock, SimDelay, SimFix, SimI2cBus, SimIna228, SimIridium, SimRv8803, SimUblox,
};
use croc_core::time::{DateTime, TimeZone, utc_to_local};
use croc_core::transmit::{Iridium9603, IridiumConfig};
use croc_core::System;

use dir_store::DirFileStore;

/// Loop period in simulated milliseconds.
const TICK_MS: u32 = 100;

/// The receiver publishes one epoch per simulated second.
const GNSS_EPOCH_MS: u32 = 1000;

/// Simulated seconds per day/night cycle, shortened so a short session
/// still sees the panel output swing.
const SOLAR_PERIOD_S: f64 = 600.0;

/// How far the RTC is off before the first GNSS sync, in seconds.
const RTC_DRIFT_S: i64 = -437;

/// Upper bound on transmit rounds after the session ends.
const MAX_TRANSMIT_ROUNDS: u32 = 32;

type Dev<'a> = SharedI2cDevice<'a, SimI2cBus>;

// ---------------------------------------------------------------------------
// Environment model
// ---------------------------------------------------------------------------

/// Drives the device models from simulated time: panel output, battery
/// charge current, load draw and the animal's position.
struct Environment {
    start_utc: DateTime,
    next_epoch_ms: u32,
}

impl Environment {
    fn new(start_utc: DateTime) -> Self {
        Self {
            start_utc,
            next_epoch_ms: 0,
        }
    }

    fn update(&mut self, bus: &RefCell<SimI2cBus>, now_ms: u32) {
        let t = f64::from(now_ms) / 1000.0;

        let sun = (TAU * t / SOLAR_PERIOD_S).sin().max(0.0);
        let solar_v = 6.0 + 12.0 * sun;
        let solar_a = 0.35 * sun;

        // Receiver tracking bursts add a little load every half minute.
        let gnss_a = if (t as u64 / 30) % 2 == 0 { 0.025 } else { 0.0 };
        let load_v = 3.3;
        let load_a = 0.08 + gnss_a;

        let battery_v = 3.85 + 0.2 * sun;
        let battery_a = solar_a * solar_v / battery_v - load_a * load_v / battery_v;

        let mut bus = bus.borrow_mut();
        for (channel, volts, amps) in [
            (PowerChannel::Solar, solar_v, solar_a),
            (PowerChannel::Battery, battery_v, battery_a),
            (PowerChannel::Load, load_v, load_a),
        ] {
            let (address, _, _) = channel.board_defaults();
            if let Some(ina) = bus.device_mut::<SimIna228>(address) {
                ina.set_load(volts, amps);
            }
        }

        if now_ms >= self.next_epoch_ms {
            self.next_epoch_ms = now_ms + GNSS_EPOCH_MS;
            let utc = self.start_utc.add_seconds(i64::from(now_ms / 1000));
            // A slow loop around a lagoon.
            let latitude = 29.760_45 + 0.000_8 * (TAU * t / 900.0).sin();
            let longitude = -95.369_82 + 0.001_1 * (TAU * t / 900.0).cos();
            if let Some(receiver) = bus.device_mut::<SimUblox>(UBLOX_ADDRESS) {
                receiver.publish_fix(&SimFix::at(utc, latitude, longitude));
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Board bring-up
// ---------------------------------------------------------------------------

/// Attach every device model at its board address.
fn build_bus(clock: &SimClock, rtc_local: DateTime) -> SimI2cBus {
    let mut bus = SimI2cBus::new();
    for channel in PowerChannel::ALL {
        let (address, shunt, _) = channel.board_defaults();
        bus.attach(address, SimIna228::new(f64::from(shunt)));
    }
    bus.attach(RV8803_ADDRESS, SimRv8803::new(clock.clone(), rtc_local));
    bus.attach(UBLOX_ADDRESS, SimUblox::new());
    bus
}

fn init_power_sensors<'a>(
    bus: &'a RefCell<SimI2cBus>,
    delay: &mut SimDelay,
) -> Option<PowerSensors<Ina228<Dev<'a>>>> {
    let mut sensors = PowerChannel::ALL.map(|channel| {
        let (address, shunt, imax) = channel.board_defaults();
        Ina228::new(SharedI2cDevice::new(bus), address, channel.label(), shunt, imax)
    });
    for sensor in sensors.iter_mut().flatten() {
        if let Err(e) = sensor.init(delay) {
            // Keep going: a failed rail logs as zero.
            warn!("{}", e);
        }
    }
    match sensors {
        [Ok(solar), Ok(battery), Ok(load)] => Some(PowerSensors::new(solar, battery, load)),
        _ => None,
    }
}

fn init_modem(clock: &SimClock) -> Option<Iridium9603<SimIridium, SimDelay, SimClock>> {
    let mut serial = SimIridium::new(clock.clone());
    // Typical SBDIX session with a clear sky.
    serial.set_session_ms(18_000);

    let mut modem = Iridium9603::new(
        serial,
        SimDelay::new(clock.clone()),
        clock.clone(),
        IridiumConfig::default(),
    );
    match modem.begin() {
        Ok(()) => Some(modem),
        Err(e) => {
            warn!("Iridium modem not available: {}", e);
            None
        }
    }
}

fn host_utc() -> DateTime {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default();
    DateTime::from_epoch_seconds(secs as i64)
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

fn main() {
    env_logger::init();

    let mut args = std::env::args().skip(1);
    let card_dir = args.next().unwrap_or_else(|| "sim-card".into());
    let session_minutes: u16 = match args.next().map(|s| s.parse()) {
        None => 5,
        Some(Ok(minutes)) => minutes,
        Some(Err(e)) => {
            error!("session minutes: {}", e);
            std::process::exit(2);
        }
    };

    info!("Starting crocodile tracker simulator, card at {}", card_dir);

    let store = match DirFileStore::open(&card_dir) {
        Ok(store) => store,
        Err(e) => {
            error!("cannot use {} as card: {}", card_dir, e);
            std::process::exit(1);
        }
    };

    let clock = SimClock::new();
    let start_utc = host_utc();
    let rtc_local = utc_to_local(start_utc, TimeZone::Cdt).add_seconds(RTC_DRIFT_S);
    let bus = RefCell::new(build_bus(&clock, rtc_local));
    let mut environment = Environment::new(start_utc);
    environment.update(&bus, clock.now());

    let mut delay = SimDelay::new(clock.clone());
    let Some(sensors) = init_power_sensors(&bus, &mut delay) else {
        error!("power monitor calibration rejected");
        std::process::exit(1);
    };

    let mut rtc = Rv8803::new(SharedI2cDevice::new(&bus));
    if let Err(e) = rtc.initialize(&RtcConfig::default()) {
        warn!("RTC: {}", e);
    }
    let mut gnss = UbloxGnss::new(SharedI2cDevice::new(&bus));
    if let Err(e) = gnss.initialize(GnssConfig::default(), &mut delay, &clock) {
        warn!("GNSS: {}", e);
    }

    let modem = init_modem(&clock);
    let mut system = match System::new(
        Devices { sensors, rtc, gnss },
        store,
        modem,
        delay,
        clock.clone(),
    ) {
        Ok(system) => system,
        Err(e) => {
            error!("boot failed: {}", e);
            std::process::exit(1);
        }
    };

    for command in [
        Command::SetSessionDuration {
            minutes: session_minutes,
        },
        Command::Start,
    ] {
        let status = system.handle_command(command);
        if !status.is_ok() {
            error!("{:?}", status);
            std::process::exit(1);
        }
    }

    // -----------------------------------------------------------------------
    // Acquisition
    // -----------------------------------------------------------------------
    while system.scheduler().is_logging() {
        clock.advance(TICK_MS);
        environment.update(&bus, clock.now());
        system.poll();
    }

    let stats = *system.scheduler().stats();
    let sync = *system.time_manager().stats();
    info!(
        "session done: {} samples, {} sensor failures, {} write failures, {} fix lines, \
         {} syncs ok / {} failed",
        stats.samples,
        stats.sensor_failures,
        stats.write_failures,
        stats.fix_lines,
        sync.successful_syncs,
        sync.failed_syncs
    );

    // -----------------------------------------------------------------------
    // Satellite upload
    // -----------------------------------------------------------------------
    for _ in 0..MAX_TRANSMIT_ROUNDS {
        match system.handle_command(Command::Transmit(TransmitSource::FixLog)) {
            CommandStatus::Transmitted(report) => {
                info!(
                    "sent {} bytes (crc {:02x}) in {} attempt(s), {} bytes left",
                    report.bytes_sent, report.crc8, report.attempts, report.remaining_bytes
                );
                if report.remaining_bytes == 0 {
                    break;
                }
            }
            other => {
                info!("transmission stopped: {:?}", other);
                break;
            }
        }
    }

    let tx = system.pipeline().stats();
    info!(
        "uplink: {} sessions, {} bytes delivered, simulated time {} s",
        tx.sessions,
        tx.bytes_sent,
        clock.now() / 1000
    );
    info!("Simulator exiting");
}
