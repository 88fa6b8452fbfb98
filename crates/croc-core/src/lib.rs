//! Hardware-independent core library for the crocodile tracker
//!
//! This crate contains all platform-agnostic logic for the solar-powered
//! tracker: the INA228 power-monitor, RV-8803 RTC and u-blox GNSS drivers,
//! the time manager, CSV log storage, the acquisition scheduler and the
//! Iridium SBD transmission pipeline.
//!
//! It is `#![no_std]` with `extern crate alloc` so it compiles on both
//! embedded targets (ESP32-S3) and desktop hosts (for the simulator and tests).

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod app_state;
pub mod bus;
pub mod clock;
pub mod config;
pub mod error;
pub mod gnss;
pub mod record;
pub mod rtc;
pub mod scheduler;
pub mod sensors;
pub mod shared_i2c_bus;
pub mod storage;
pub mod time;
pub mod time_manager;
pub mod transmit;

#[cfg(any(test, feature = "sim"))]
pub mod sim;

pub use app_state::System;
pub use error::TrackerError;
