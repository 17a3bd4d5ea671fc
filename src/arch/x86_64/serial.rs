//! 16550A serial port, used as the boot log sink.

use core::fmt;
use spin::Mutex;
use x86_64::instructions::port::Port;

use crate::log::Sink;

const COM1: u16 = 0x3F8;

pub struct SerialPort {
    data: Port<u8>,
    int_enable: Port<u8>,
    fifo_ctrl: Port<u8>,
    line_ctrl: Port<u8>,
    modem_ctrl: Port<u8>,
    line_status: Port<u8>,
}

impl SerialPort {
    /// Creates a new serial port interface for the given base port.
    pub const unsafe fn new(base: u16) -> Self {
        SerialPort {
            data: Port::new(base),
            int_enable: Port::new(base + 1),
            fifo_ctrl: Port::new(base + 2),
            line_ctrl: Port::new(base + 3),
            modem_ctrl: Port::new(base + 4),
            line_status: Port::new(base + 5),
        }
    }

    /// Initializes the serial port: 38400 baud, 8N1, FIFO on.
    pub fn init(&mut self) {
        unsafe {
            self.int_enable.write(0x00);
            self.line_ctrl.write(0x80);
            self.data.write(0x03);
            self.int_enable.write(0x00);
            self.line_ctrl.write(0x03);
            self.fifo_ctrl.write(0xC7);
            self.modem_ctrl.write(0x0B);
        }
    }

    fn is_transmit_empty(&mut self) -> bool {
        unsafe { self.line_status.read() & 0x20 != 0 }
    }

    pub fn send(&mut self, byte: u8) {
        while !self.is_transmit_empty() {}
        unsafe { self.data.write(byte) }
    }
}

impl fmt::Write for SerialPort {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for byte in s.bytes() {
            self.send(byte);
        }
        Ok(())
    }
}

struct SerialSink(Mutex<SerialPort>);

impl Sink for SerialSink {
    fn write_line(&self, line: &str) {
        let mut port = self.0.lock();
        for byte in line.bytes() {
            port.send(byte);
        }
        port.send(b'\r');
        port.send(b'\n');
    }
}

static COM1_SINK: SerialSink = SerialSink(Mutex::new(unsafe { SerialPort::new(COM1) }));

/// Bring up COM1 and register it as the log sink.
pub fn install_log_sink() {
    COM1_SINK.0.lock().init();
    crate::log::init_logger(&COM1_SINK);
}
