//! Minimal line logger with a pluggable sink.
//!
//! Subsystems never talk to a device directly; they fetch the logger with
//! [`try_get_logger`] and emit tagged lines (`[MEM]`, `[FRAME]`, `[PF]`).
//! Before a sink is installed every message is dropped, which keeps the
//! very early allocator paths free of ordering hazards.

use spin::Once;

/// A log output device. Implementations must tolerate being called from
/// fault handlers, so no allocation and no blocking beyond a short lock.
pub trait Sink: Send + Sync {
    fn write_line(&self, line: &str);
}

pub struct Logger {
    sink: &'static dyn Sink,
}

impl Logger {
    pub fn log(&self, msg: &str) {
        self.sink.write_line(msg);
    }
}

static LOGGER: Once<Logger> = Once::new();

/// Install the global sink. The first caller wins; later calls are ignored
/// so bring-up code and tests can both attempt installation.
pub fn init(sink: &'static dyn Sink) {
    LOGGER.call_once(|| Logger { sink });
}

pub fn try_get_logger() -> Option<&'static Logger> {
    LOGGER.get()
}
