// src/kernel/driver/mod.rs
//! デバイスドライバ

pub mod serial;

pub use serial::write_debug;
