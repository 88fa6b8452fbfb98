//! ESP32-S3 firmware-specific modules for the crocodile tracker
//!
//! This crate contains hardware-specific code that cannot compile on desktop
//! targets: ESP32 peripheral initialization, the UART adapter for the
//! Iridium modem, and the monotonic clock backed by the embassy time driver.

#![no_std]

extern crate alloc;

pub mod app_state;
pub mod serial;
