//! Serial logging
//!
//! On bare metal the macros write to COM1. Hosted builds (unit tests, tooling)
//! have no UART, so output goes to whatever sink was installed with
//! [`set_log_sink`] and is discarded otherwise.

use core::fmt;

#[cfg(all(target_os = "none", target_arch = "x86_64"))]
mod port {
    use core::fmt;
    use lazy_static::lazy_static;
    use spin::Mutex;
    use uart_16550::SerialPort;

    lazy_static! {
        pub static ref SERIAL1: Mutex<SerialPort> = {
            let mut serial_port = unsafe { SerialPort::new(0x3F8) };
            serial_port.init();
            Mutex::new(serial_port)
        };
    }

    pub fn write(args: fmt::Arguments) {
        use core::fmt::Write;
        use x86_64::instructions::interrupts;

        interrupts::without_interrupts(|| {
            // Log lines are dropped rather than deadlocking a nested writer.
            if let Some(mut port) = SERIAL1.try_lock() {
                let _ = port.write_fmt(args);
            }
        });
    }
}

/// Signature of a hosted log sink
pub type LogSink = fn(fmt::Arguments);

#[cfg(not(all(target_os = "none", target_arch = "x86_64")))]
mod port {
    use core::fmt;
    use lazy_static::lazy_static;
    use spin::Mutex;

    use super::LogSink;

    lazy_static! {
        pub static ref SINK: Mutex<Option<LogSink>> = Mutex::new(None);
    }

    pub fn write(args: fmt::Arguments) {
        let sink = *SINK.lock();
        if let Some(sink) = sink {
            sink(args);
        }
    }
}

/// Route log output to `sink` (hosted builds only)
///
/// Has no effect on bare metal, where output always goes to COM1.
pub fn set_log_sink(sink: LogSink) {
    #[cfg(not(all(target_os = "none", target_arch = "x86_64")))]
    {
        *port::SINK.lock() = Some(sink);
    }
    #[cfg(all(target_os = "none", target_arch = "x86_64"))]
    {
        let _ = sink;
    }
}

#[doc(hidden)]
pub fn _print(args: fmt::Arguments) {
    port::write(args);
}

/// Print to the serial log
#[macro_export]
macro_rules! serial_print {
    ($($arg:tt)*) => {
        $crate::serial::_print(format_args!($($arg)*))
    };
}

/// Print to the serial log, with a newline
#[macro_export]
macro_rules! serial_println {
    () => ($crate::serial_print!("\n"));
    ($fmt:expr) => ($crate::serial_print!(concat!($fmt, "\n")));
    ($fmt:expr, $($arg:tt)*) => ($crate::serial_print!(
        concat!($fmt, "\n"), $($arg)*));
}
