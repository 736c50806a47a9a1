// src/kernel/logger.rs
//! `log` backend
//!
//! Routes `log` records to the serial debug channel as
//! `[LEVEL] target: message`.

use log::{LevelFilter, Log, Metadata, Record};

use crate::errors::LoggerError;

static LOGGER: SerialLogger = SerialLogger;

struct SerialLogger;

impl Log for SerialLogger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record<'_>) {
        if self.enabled(record.metadata()) {
            crate::debug_println!("[{:5}] {}: {}", record.level(), record.target(), record.args());
        }
    }

    fn flush(&self) {}
}

/// Install the serial logger with `max_level`.
///
/// # Errors
///
/// `AlreadyInstalled` if a global logger is already set.
pub fn init(max_level: LevelFilter) -> Result<(), LoggerError> {
    log::set_logger(&LOGGER).map_err(|_| LoggerError::AlreadyInstalled)?;
    log::set_max_level(max_level);
    crate::debug_println!("[KERNEL] Logger initialized with level: {}", max_level);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_install_fails() {
        // Either this test installs it first or another one already did.
        let _ = init(LevelFilter::Trace);
        assert_eq!(init(LevelFilter::Trace), Err(LoggerError::AlreadyInstalled));
        log::info!("logger reachable without a serial port");
    }
}
