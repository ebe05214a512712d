//! Serial console (16550 UART on COM1)
//!
//! All kernel logging ends up here. The port is lazily initialized on first
//! use and guarded by a spin mutex so panic paths can still print.

use core::fmt;

use lazy_static::lazy_static;
use spin::Mutex;

/// COM1 base port
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
const COM1: u16 = 0x3F8;

pub struct SerialConsole {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    inner: uart_16550::SerialPort,
}

impl SerialConsole {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    fn new() -> Self {
        // SAFETY: COM1 is the standard ISA serial port; probing it is harmless
        // even when no device is attached.
        let mut inner = unsafe { uart_16550::SerialPort::new(COM1) };
        inner.init();
        Self { inner }
    }

    // Host builds log through the test harness; the console is a sink.
    #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
    fn new() -> Self {
        Self {}
    }
}

impl fmt::Write for SerialConsole {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        #[cfg(all(target_arch = "x86_64", target_os = "none"))]
        {
            self.inner.write_str(s)
        }
        #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
        {
            let _ = s;
            Ok(())
        }
    }
}

lazy_static! {
    pub static ref SERIAL: Mutex<SerialConsole> = Mutex::new(SerialConsole::new());
}

#[doc(hidden)]
pub fn _print(args: fmt::Arguments) {
    use fmt::Write;
    let _ = SERIAL.lock().write_fmt(args);
}
