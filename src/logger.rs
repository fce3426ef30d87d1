//! Console Logger
//!
//! Serial-console style logging for the demo binaries and tests,
//! wired into the `log` facade.
//!
//! # Design
//! - A single static console guarded by a spinlock for whole-line
//!   output
//! - Install once with [`init`]; repeated installs are ignored so
//!   tests can call it freely

use std::io::{self, Write};

use log::{LevelFilter, Metadata, Record};
use spin::Mutex;

/// Console writer behind the `log` facade.
///
/// The lock serializes whole records so interleaved lines cannot
/// shear, the way the UART word at a time would.
pub struct Console {
    lock: Mutex<()>,
}

static CONSOLE: Console = Console {
    lock: Mutex::new(()),
};

impl log::Log for Console {
    fn enabled(&self, _metadata: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        let _guard = self.lock.lock();
        let mut err = io::stderr().lock();
        let _ = writeln!(err, "[{:5}] {}", record.level(), record.args());
    }

    fn flush(&self) {
        let _ = io::stderr().flush();
    }
}

/// Install the console logger at the given level.
///
/// Safe to call more than once; only the first install takes effect.
pub fn init(level: LevelFilter) {
    if log::set_logger(&CONSOLE).is_ok() {
        log::set_max_level(level);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        init(LevelFilter::Debug);
        init(LevelFilter::Trace);
        log::debug!("console logger installed");
    }
}
