#![no_std]
#![no_main]
#![deny(
    clippy::mem_forget,
    reason = "mem::forget is generally not safe to do with esp_hal types, especially those \
    holding buffers for the duration of a data transfer."
)]
#![deny(clippy::large_stack_frames)]

use embassy_executor::Spawner;
use embassy_time::{Delay, Duration, Timer};
use esp_hal::clock::CpuClock;
use esp_hal::timer::timg::TimerGroup;
use log::{error, info, warn};

use croc_core::System;
use croc_core::scheduler::Devices;
use croc_core::time::TimeZone;
use croc_firmware::app_state::{
    Command, EmbassyClock, create_i2c_bus, init_gnss, init_modem, init_power_sensors, init_rtc,
    init_sd_card, share_i2c_bus,
};

/// Pause between scheduler polls. Sample timers are checked on every poll,
/// so this bounds the jitter of each row.
const POLL_INTERVAL_MS: u64 = 20;

/// Settings baked in from `.env` at build time.
fn deployment_overrides() -> [Option<Command>; 2] {
    let timezone = option_env!("CROC_TIMEZONE_HOURS")
        .and_then(|s| s.parse::<i8>().ok())
        .filter(|hours| (-12..=14).contains(hours))
        .map(|hours| Command::SetTimeZone(TimeZone::from_hours(hours)));
    let session = option_env!("CROC_SESSION_MINUTES")
        .and_then(|s| s.parse::<u16>().ok())
        .map(|minutes| Command::SetSessionDuration { minutes });
    [timezone, session]
}

#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    rtt_target::rprintln!("PANIC: {}", info);
    loop {}
}

extern crate alloc;

// This creates a default app-descriptor required by the esp-idf bootloader.
// For more information see: <https://docs.espressif.com/projects/esp-idf/en/stable/esp32/api-reference/system/app_image_format.html#application-description>
esp_bootloader_esp_idf::esp_app_desc!();

#[allow(
    clippy::large_stack_frames,
    reason = "it's not unusual to allocate larger buffers etc. in main"
)]
#[esp_rtos::main]
async fn main(_spawner: Spawner) -> ! {
    rtt_target::rtt_init_log!();

    let config = esp_hal::Config::default().with_cpu_clock(CpuClock::max());
    let peripherals = esp_hal::init(config);

    esp_alloc::heap_allocator!(#[esp_hal::ram(reclaimed)] size: 73744);

    let timg0 = TimerGroup::new(peripherals.TIMG0);
    esp_rtos::start(timg0.timer0);

    info!("Crocodile tracker starting");

    let clock = EmbassyClock;
    let mut delay = Delay;

    let i2c = create_i2c_bus(peripherals.I2C0, peripherals.GPIO8, peripherals.GPIO9)
        .expect("Failed to configure I2C");
    let i2c_bus = share_i2c_bus(i2c);

    let sensors = init_power_sensors(i2c_bus, &mut delay).expect("Invalid shunt calibration");
    let rtc = init_rtc(i2c_bus);
    let gnss = init_gnss(i2c_bus, &mut delay, &clock);

    let store = init_sd_card(
        peripherals.SPI2,
        peripherals.GPIO36,
        peripherals.GPIO35,
        peripherals.GPIO37,
        peripherals.GPIO10,
    )
    .expect("Failed to configure SPI");

    let modem = init_modem(peripherals.UART1, peripherals.GPIO17, peripherals.GPIO18)
        .expect("Failed to configure UART");

    let mut system = match System::new(Devices { sensors, rtc, gnss }, store, modem, delay, clock) {
        Ok(system) => system,
        Err(e) => loop {
            // Without a card there is nowhere to log; keep reporting so the
            // fault is visible over RTT.
            error!("Boot failed: {}", e);
            Timer::after(Duration::from_secs(10)).await;
        },
    };

    for command in deployment_overrides().into_iter().flatten() {
        let status = system.handle_command(command.clone());
        if !status.is_ok() {
            warn!("Override {:?} rejected: {:?}", command, status);
        }
    }

    if env!("CROC_AUTOSTART") != "0" {
        let status = system.handle_command(Command::Start);
        if !status.is_ok() {
            warn!("Autostart failed: {:?}", status);
        }
    }

    loop {
        let outcome = system.poll();
        if outcome.session_complete {
            info!("Session complete, waiting for operator");
        }
        Timer::after(Duration::from_millis(POLL_INTERVAL_MS)).await;
    }
}
