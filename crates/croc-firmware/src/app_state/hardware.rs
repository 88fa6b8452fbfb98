//! Hardware initialization for the tracker board
//!
//! Every sensor on the board shares one blocking I2C bus. The SD card sits on
//! SPI2 and the Iridium 9603 on UART1. Bring-up failures of individual
//! devices are logged and left for the core to report; only peripheral
//! configuration errors are returned.

use core::cell::RefCell;

use embassy_time::Delay;
use embedded_hal_bus::spi::ExclusiveDevice;
use embedded_sdmmc::SdCard;
use esp_hal::Blocking;
use esp_hal::gpio::{Level, Output, OutputConfig};
use esp_hal::i2c::master::{Config as I2cConfig, ConfigError as I2cConfigError, I2c};
use esp_hal::spi::master::{Config as SpiConfig, ConfigError as SpiConfigError, Spi};
use esp_hal::time::Rate;
use esp_hal::uart::{Config as UartConfig, ConfigError as UartConfigError, Uart};
use log::{info, warn};
use static_cell::StaticCell;

use croc_core::clock::Monotonic;
use croc_core::gnss::{GnssConfig, UbloxGnss};
use croc_core::rtc::{RtcConfig, Rv8803};
use croc_core::sensors::{Ina228, PowerChannel, PowerSensors, SensorError};
use croc_core::shared_i2c_bus::SharedI2cDevice;
use croc_core::storage::{BuildTimeSource, SdCardStorage};
use croc_core::transmit::{Iridium9603, IridiumConfig};

use crate::serial::ModemSerial;

pub type BoardI2c = I2c<'static, Blocking>;
pub type TrackerI2c = SharedI2cDevice<'static, BoardI2c>;
pub type SdSpi = ExclusiveDevice<Spi<'static, Blocking>, Output<'static>, Delay>;
pub type SdStore = SdCardStorage<SdCard<SdSpi, Delay>, BuildTimeSource>;
pub type Modem = Iridium9603<ModemSerial<'static>, Delay, EmbassyClock>;

/// SD cards must be initialized at 400 kHz or below.
const SD_INIT_KHZ: u32 = 400;

/// Factory default of the 9603 AT interface.
const MODEM_BAUD: u32 = 19_200;

/// Milliseconds since boot from the embassy time driver.
#[derive(Debug, Clone, Copy, Default)]
pub struct EmbassyClock;

impl Monotonic for EmbassyClock {
    fn now_ms(&self) -> u32 {
        embassy_time::Instant::now().as_millis() as u32
    }
}

/// Create the I2C peripheral at 400 kHz.
pub fn create_i2c_bus(
    i2c0: esp_hal::peripherals::I2C0<'static>,
    sda: esp_hal::peripherals::GPIO8<'static>,
    scl: esp_hal::peripherals::GPIO9<'static>,
) -> Result<BoardI2c, I2cConfigError> {
    Ok(
        I2c::new(i2c0, I2cConfig::default().with_frequency(Rate::from_khz(400)))?
            .with_sda(sda)
            .with_scl(scl),
    )
}

/// Park the bus in a static so every driver can hold a `'static` handle.
pub fn share_i2c_bus(i2c: BoardI2c) -> &'static RefCell<BoardI2c> {
    static I2C0_BUS: StaticCell<RefCell<BoardI2c>> = StaticCell::new();
    I2C0_BUS.init(RefCell::new(i2c))
}

/// Build and calibrate the three power monitors.
///
/// A monitor that does not answer is kept; its readings come back as zero
/// and the scheduler counts the failures.
pub fn init_power_sensors(
    bus: &'static RefCell<BoardI2c>,
    delay: &mut Delay,
) -> Result<PowerSensors<Ina228<TrackerI2c>>, SensorError> {
    let mut build = |channel: PowerChannel| -> Result<Ina228<TrackerI2c>, SensorError> {
        let (address, shunt, imax) = channel.board_defaults();
        let mut sensor = Ina228::new(
            SharedI2cDevice::new(bus),
            address,
            channel.label(),
            shunt,
            imax,
        )?;
        match sensor.init(delay) {
            Ok(()) => info!("{} monitor ready at 0x{:02x}", channel.label(), address),
            Err(e) => warn!("{}", e),
        }
        Ok(sensor)
    };

    let solar = build(PowerChannel::Solar)?;
    let battery = build(PowerChannel::Battery)?;
    let load = build(PowerChannel::Load)?;
    Ok(PowerSensors::new(solar, battery, load))
}

pub fn init_rtc(bus: &'static RefCell<BoardI2c>) -> Rv8803<TrackerI2c> {
    let mut rtc = Rv8803::new(SharedI2cDevice::new(bus));
    if let Err(e) = rtc.initialize(&RtcConfig::default()) {
        warn!("RTC init failed: {}", e);
    }
    rtc
}

pub fn init_gnss(
    bus: &'static RefCell<BoardI2c>,
    delay: &mut Delay,
    clock: &EmbassyClock,
) -> UbloxGnss<TrackerI2c> {
    let mut gnss = UbloxGnss::new(SharedI2cDevice::new(bus));
    if let Err(e) = gnss.initialize(GnssConfig::default(), delay, clock) {
        warn!("GNSS init failed: {}", e);
    }
    gnss
}

/// Bring up SPI2 and wrap the card in the FAT-backed file store.
pub fn init_sd_card(
    spi2: esp_hal::peripherals::SPI2<'static>,
    sck: esp_hal::peripherals::GPIO36<'static>,
    mosi: esp_hal::peripherals::GPIO35<'static>,
    miso: esp_hal::peripherals::GPIO37<'static>,
    cs: esp_hal::peripherals::GPIO10<'static>,
) -> Result<SdStore, SpiConfigError> {
    let spi = Spi::new(
        spi2,
        SpiConfig::default().with_frequency(Rate::from_khz(SD_INIT_KHZ)),
    )?
    .with_sck(sck)
    .with_mosi(mosi)
    .with_miso(miso);
    let cs = Output::new(cs, Level::High, OutputConfig::default());

    let Ok(spi_device) = ExclusiveDevice::new(spi, cs, Delay);
    let card = SdCard::new(spi_device, Delay);
    let mut store = SdCardStorage::new(card, BuildTimeSource);
    match store.mount() {
        Ok(()) => info!("SD card mounted"),
        Err(e) => warn!("SD card not mounted: {}", e),
    }
    Ok(store)
}

/// Open UART1 and run the modem's AT handshake. `None` when the modem does
/// not answer, so transmissions report no modem instead of timing out.
pub fn init_modem(
    uart1: esp_hal::peripherals::UART1<'static>,
    tx: esp_hal::peripherals::GPIO17<'static>,
    rx: esp_hal::peripherals::GPIO18<'static>,
) -> Result<Option<Modem>, UartConfigError> {
    let uart = Uart::new(uart1, UartConfig::default().with_baudrate(MODEM_BAUD))?
        .with_tx(tx)
        .with_rx(rx);

    let mut modem = Iridium9603::new(
        ModemSerial::new(uart),
        Delay,
        EmbassyClock,
        IridiumConfig::default(),
    );
    Ok(match modem.begin() {
        Ok(()) => {
            info!("Iridium modem ready");
            Some(modem)
        }
        Err(e) => {
            warn!("Iridium modem not available: {}", e);
            None
        }
    })
}
