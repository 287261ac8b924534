//! Serial console (COM1).
//!
//! The kernel's log sink. On hosted builds the port writes go to the
//! process's stderr so test logs stay visible.

use core::fmt;

use spin::Mutex;

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
mod port {
    use uart_16550::SerialPort;

    pub struct Com1 {
        inner: SerialPort,
    }

    impl Com1 {
        pub const fn new() -> Self {
            // SAFETY contract of SerialPort::new: 0x3F8 is the standard
            // COM1 I/O port block.
            Self {
                inner: unsafe { SerialPort::new(0x3F8) },
            }
        }

        pub fn init(&mut self) {
            self.inner.init();
        }

        pub fn write_byte(&mut self, byte: u8) {
            self.inner.send(byte);
        }
    }
}

#[cfg(not(target_os = "none"))]
mod port {
    pub struct Com1;

    impl Com1 {
        pub const fn new() -> Self {
            Self
        }

        pub fn init(&mut self) {}

        pub fn write_byte(&mut self, byte: u8) {
            extern crate std;
            use std::io::Write;
            let _ = std::io::stderr().write_all(&[byte]);
        }
    }
}

static COM1: Mutex<port::Com1> = Mutex::new(port::Com1::new());

/// Bring up the UART. Called once, before the first log line.
pub fn init() {
    COM1.lock().init();
}

/// Raw byte output (log syscall, /dev/serial).
pub fn write_bytes(bytes: &[u8]) {
    let mut com = COM1.lock();
    for &b in bytes {
        com.write_byte(b);
    }
}

struct SerialWriter;

impl fmt::Write for SerialWriter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        write_bytes(s.as_bytes());
        Ok(())
    }
}

#[doc(hidden)]
pub fn _print(args: fmt::Arguments) {
    use fmt::Write;
    let _ = SerialWriter.write_fmt(args);
}
